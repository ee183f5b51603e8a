use crate::catalog::PolicyType;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Maximum policy file size (1 MB).
const MAX_POLICY_BYTES: u64 = 1024 * 1024;

/// Attestation recorded for every `witness run`, whatever was requested.
pub const COMMAND_RUN_ATTESTOR: &str = "command-run";

pub fn attestation_type(attestor: &str) -> String {
    format!("https://witness.dev/attestations/{attestor}/v0.1")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessPolicy {
    pub expires: String,
    pub steps: BTreeMap<String, PolicyStep>,
    pub publickeys: BTreeMap<String, PublicKeyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStep {
    pub name: String,
    pub attestations: Vec<AttestationRequirement>,
    pub functionaries: Vec<Functionary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRequirement {
    #[serde(rename = "type")]
    pub attestation_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regopolicies: Vec<RegoPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegoPolicy {
    pub name: String,
    /// Base64 of the Rego source.
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Functionary {
    #[serde(rename = "type")]
    pub kind: String,
    pub publickeyid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyEntry {
    pub keyid: String,
    /// Base64 of the PEM public key.
    pub key: String,
}

/// A Rego module attached to one attestation type of a policy step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegoModule {
    /// Attestor whose attestation the module evaluates.
    pub attestor: &'static str,
    pub file_name: &'static str,
    pub source: &'static str,
}

const GIT_COMMIT_REGO: &str = r#"package git

import rego.v1

deny contains msg if {
    input.commithash == ""
    msg := "attestation must record the commit hash"
}
"#;

const ENVIRONMENT_CI_REGO: &str = r#"package environment

import rego.v1

deny contains msg if {
    input.variables.CI != "true"
    msg := sprintf("CI must be true, got: %v", [input.variables.CI])
}
"#;

const PRODUCT_OUTPUT_REGO: &str = r#"package product

import rego.v1

deny contains msg if {
    not input["output.txt"]
    msg := "output.txt must be recorded as a product"
}
"#;

const COMMAND_EXIT_REGO: &str = r#"package commandrun

import rego.v1

deny contains msg if {
    input.exitcode != 0
    msg := sprintf("command failed with exit code %d", [input.exitcode])
}
"#;

/// Rego modules attached for a policy type; empty for `none`.
pub fn rego_modules(policy_type: PolicyType) -> Vec<RegoModule> {
    let git = RegoModule {
        attestor: "git",
        file_name: "git-commit.rego",
        source: GIT_COMMIT_REGO,
    };
    let environment = RegoModule {
        attestor: "environment",
        file_name: "environment-ci.rego",
        source: ENVIRONMENT_CI_REGO,
    };
    match policy_type {
        PolicyType::None => Vec::new(),
        PolicyType::Git => vec![git],
        PolicyType::Environment => vec![environment],
        PolicyType::Product => vec![RegoModule {
            attestor: "product",
            file_name: "product-output.rego",
            source: PRODUCT_OUTPUT_REGO,
        }],
        PolicyType::Command => vec![RegoModule {
            attestor: COMMAND_RUN_ATTESTOR,
            file_name: "command-exit.rego",
            source: COMMAND_EXIT_REGO,
        }],
        PolicyType::Combined => vec![git, environment],
    }
}

/// Writes a module into `dir` so `opa check` can validate it.
pub fn write_rego(dir: &Path, module: &RegoModule) -> Result<PathBuf> {
    let path = dir.join(module.file_name);
    std::fs::write(&path, module.source)
        .with_context(|| format!("writing {}", module.file_name))?;
    Ok(path)
}

/// Everything needed to assemble a policy for one verified run.
pub struct PolicyInputs<'a> {
    pub step: &'a str,
    pub attestors: &'a [String],
    pub key_id: &'a str,
    pub public_key_pem: &'a [u8],
    /// Modules that already passed `opa check`.
    pub rego: &'a [RegoModule],
    pub validity_days: i64,
}

impl WitnessPolicy {
    pub fn build(inputs: &PolicyInputs<'_>) -> Result<Self> {
        let expires = (OffsetDateTime::now_utc() + time::Duration::days(inputs.validity_days))
            .replace_nanosecond(0)?
            .format(&Rfc3339)?;

        let mut attestors: Vec<&str> = inputs.attestors.iter().map(String::as_str).collect();
        if !attestors.contains(&COMMAND_RUN_ATTESTOR) {
            attestors.push(COMMAND_RUN_ATTESTOR);
        }

        let attestations = attestors
            .iter()
            .map(|att| AttestationRequirement {
                attestation_type: attestation_type(att),
                regopolicies: inputs
                    .rego
                    .iter()
                    .filter(|m| m.attestor == *att)
                    .map(|m| RegoPolicy {
                        name: m.file_name.to_string(),
                        module: STANDARD.encode(m.source),
                    })
                    .collect(),
            })
            .collect();

        let step = PolicyStep {
            name: inputs.step.to_string(),
            attestations,
            functionaries: vec![Functionary {
                kind: "publickey".to_string(),
                publickeyid: inputs.key_id.to_string(),
            }],
        };

        Ok(Self {
            expires,
            steps: BTreeMap::from([(inputs.step.to_string(), step)]),
            publickeys: BTreeMap::from([(
                inputs.key_id.to_string(),
                PublicKeyEntry {
                    keyid: inputs.key_id.to_string(),
                    key: STANDARD.encode(inputs.public_key_pem),
                },
            )]),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        crate::fs_guard::read_json(path, MAX_POLICY_BYTES)
    }

    /// Every Rego module attached anywhere in the policy, decoded.
    pub fn decoded_rego(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for step in self.steps.values() {
            for att in &step.attestations {
                for rp in &att.regopolicies {
                    let bytes = STANDARD
                        .decode(&rp.module)
                        .with_context(|| format!("decoding rego module {}", rp.name))?;
                    out.push(String::from_utf8_lossy(&bytes).into_owned());
                }
            }
        }
        Ok(out)
    }
}
