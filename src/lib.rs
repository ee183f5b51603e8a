//! # witgen -- verified witness training-example generator
//!
//! witgen produces fine-tuning records that teach the `witness` attestation
//! CLI. Every record comes from a configuration that was actually run:
//! keys generated, `witness run` executed, a policy built, signed and
//! accepted by `witness verify`. Anything that fails along the way is
//! discarded.
//!
//! Each configuration is drawn at most once per run. The sampler records a
//! specification as seen the moment it is drawn, so a rejected
//! specification is burned rather than retried, and running out of unseen
//! specifications is reported as exhaustion with the shortfall.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`catalog`] | Dimensions of the configuration space and its size |
//! | [`spec`] | Canonical specification tuple and fingerprint |
//! | [`sampler`] | Collision-free random draws over a shared seen set |
//! | [`builder`] | Runs the tool chain and assembles a verified record |
//! | [`driver`] | Parallel loop until target or exhaustion |
//! | [`record`] | Training record format and the JSONL sink |
//! | [`dataset`] | Validation and train/valid splitting |

#![forbid(unsafe_code)]

pub mod builder;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod driver;

/// Symlink-safe, size-bounded file reads for everything read back from disk.
pub mod fs_guard;

/// Witness policy documents and the Rego modules attached to them.
pub mod policy;
pub mod record;

/// Command execution boundary: the [`runner::CommandRunner`] trait, the
/// process-spawning implementation and tool output sanitizing.
pub mod runner;
pub mod sampler;
pub mod spec;
pub mod toolcheck;

/// Per-attempt temporary directory and attestor preconditions.
pub mod workspace;
