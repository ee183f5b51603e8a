use crate::catalog::Catalog;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum config file size (1 MB).
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert in the Witness supply chain attestation framework. You help users instrument CI/CD pipelines with witness, create policy documents, and write Rego policies to validate attestations. You understand all attestors in go-witness and how to use them effectively.";

/// Executable names or paths for every external tool witgen drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub witness: PathBuf,
    pub openssl: PathBuf,
    pub git: PathBuf,
    pub opa: PathBuf,
    pub bash: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            witness: PathBuf::from("witness"),
            openssl: PathBuf::from("openssl"),
            git: PathBuf::from("git"),
            opa: PathBuf::from("opa"),
            bash: PathBuf::from("bash"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub catalog: Catalog,
    /// Largest attestor subset drawn per specification.
    pub max_attestors: usize,
    /// Consecutive duplicate draws tolerated before declaring exhaustion.
    pub max_consecutive_duplicates: u64,
    pub seed: u64,
    pub tool_timeout_secs: u64,
    /// Parent directory for per-attempt working contexts.
    pub work_root: Option<PathBuf>,
    pub tools: ToolPaths,
    /// Regexes that mark tool output as failed even on exit code 0.
    pub error_markers: Vec<String>,
    /// Text `witness verify` must print for a run to count as verified.
    pub verify_success_marker: String,
    /// Progress is logged every this many attempts per run.
    pub report_every: u64,
    pub policy_validity_days: i64,
    pub system_prompt: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            catalog: Catalog::default(),
            max_attestors: 7,
            max_consecutive_duplicates: 10_000,
            seed: 42,
            tool_timeout_secs: 120,
            work_root: None,
            tools: ToolPaths::default(),
            error_markers: vec![
                r"level=error".to_string(),
                r"(?m)^Error:".to_string(),
                r"\bpanic:".to_string(),
            ],
            verify_success_marker: "Verification succeeded".to_string(),
            report_every: 100,
            policy_validity_days: 365,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl GeneratorConfig {
    /// Loads the config file if given, otherwise returns defaults. The
    /// catalog is validated either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = match path {
            Some(p) => crate::fs_guard::read_json(p, MAX_CONFIG_BYTES)
                .with_context(|| format!("loading config {}", p.display()))?,
            None => Self::default(),
        };
        config.catalog.validate().context("invalid catalog")?;
        Ok(config)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs.max(1))
    }
}
