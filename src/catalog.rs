//! The discrete configuration space examples are drawn from.
//!
//! Every dimension is a fixed list. Two constraints tie dimensions together:
//!
//! - a command template may require attestors (`cat input.txt` needs the
//!   `material` attestor, an SBOM command needs `sbom`), and
//! - a policy type may require the attestors its Rego modules inspect.
//!
//! Selections that violate either constraint are never part of the space;
//! [`Catalog::reachable_space_size`] counts exactly the valid points.

use crate::spec::ExampleSpecification;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Attestor sets are enumerated by bitmask when counting the reachable space.
pub const MAX_CATALOG_ATTESTORS: usize = 20;

/// Placeholder in command templates replaced with the language manifest name.
pub const MANIFEST_SLOT: &str = "{manifest}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog dimension '{0}' is empty")]
    EmptyDimension(&'static str),
    #[error("duplicate {dimension} label '{label}'")]
    DuplicateLabel { dimension: &'static str, label: String },
    #[error("catalog has {0} attestors (max 20)")]
    TooManyAttestors(usize),
    #[error("command template '{command}' requires unknown attestor '{attestor}'")]
    UnknownAttestor { command: String, attestor: String },
    #[error("command template '{0}' uses {{manifest}} but requires no language-dependent attestor")]
    ManifestWithoutLanguage(String),
    #[error("question template '{0}' has no {{step}} or {{attestors}} slot")]
    QuestionWithoutSlot(String),
    #[error("policy type '{policy}' needs attestor '{attestor}', which is not in the catalog")]
    UnsatisfiablePolicy { policy: PolicyType, attestor: String },
    #[error("language-dependent attestor '{0}' present but no languages configured")]
    NoLanguages(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestorDef {
    pub name: String,
    /// Requires a language ecosystem (manifest on disk) to produce evidence.
    #[serde(default)]
    pub language_dependent: bool,
}

impl AttestorDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            language_dependent: false,
        }
    }

    pub fn language_dependent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            language_dependent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub id: String,
    /// Shell line run under `bash -c`; may contain `{manifest}`.
    pub shell: String,
    #[serde(default)]
    pub requires: Vec<String>,
}

impl CommandTemplate {
    pub fn new(id: &str, shell: &str, requires: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            shell: shell.to_string(),
            requires: requires.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn render(&self, language: Option<&Language>) -> String {
        match language {
            Some(lang) => self.shell.replace(MANIFEST_SLOT, &lang.manifest_file),
            None => self.shell.clone(),
        }
    }

    fn compatible_with(&self, attestors: &[&str]) -> bool {
        self.requires.iter().all(|r| attestors.contains(&r.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionTemplate {
    pub id: String,
    pub text: String,
}

impl QuestionTemplate {
    pub fn new(id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            text: text.to_string(),
        }
    }

    /// Fills `{step}` and `{attestors}`; attestors are joined with ", ".
    pub fn render(&self, step: &str, attestors: &[String]) -> String {
        self.text
            .replace("{step}", step)
            .replace("{attestors}", &attestors.join(", "))
    }

    fn has_slot(&self) -> bool {
        self.text.contains("{step}") || self.text.contains("{attestors}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    None,
    Git,
    Environment,
    Product,
    Command,
    Combined,
}

impl PolicyType {
    pub const ALL: [PolicyType; 6] = [
        PolicyType::None,
        PolicyType::Git,
        PolicyType::Environment,
        PolicyType::Product,
        PolicyType::Command,
        PolicyType::Combined,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyType::None => "none",
            PolicyType::Git => "git",
            PolicyType::Environment => "environment",
            PolicyType::Product => "product",
            PolicyType::Command => "command",
            PolicyType::Combined => "combined",
        }
    }

    /// Attestors whose evidence the Rego modules of this type inspect.
    /// `command` reads the `command-run` attestation, which every run has.
    pub fn required_attestors(self) -> &'static [&'static str] {
        match self {
            PolicyType::None | PolicyType::Command => &[],
            PolicyType::Git => &["git"],
            PolicyType::Environment => &["environment"],
            PolicyType::Product => &["product"],
            PolicyType::Combined => &["git", "environment"],
        }
    }

    fn compatible_with(self, attestors: &[&str]) -> bool {
        self.required_attestors()
            .iter()
            .all(|r| attestors.contains(r))
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    pub manifest_file: String,
    pub manifest_contents: String,
}

impl Language {
    pub fn new(name: &str, manifest_file: &str, manifest_contents: &str) -> Self {
        Self {
            name: name.to_string(),
            manifest_file: manifest_file.to_string(),
            manifest_contents: manifest_contents.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub attestors: Vec<AttestorDef>,
    pub steps: Vec<String>,
    pub commands: Vec<CommandTemplate>,
    pub questions: Vec<QuestionTemplate>,
    pub policies: Vec<PolicyType>,
    pub languages: Vec<Language>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            attestors: vec![
                AttestorDef::new("environment"),
                AttestorDef::new("git"),
                AttestorDef::new("k8smanifest"),
                AttestorDef::new("link"),
                AttestorDef::language_dependent("lockfiles"),
                AttestorDef::new("material"),
                AttestorDef::new("product"),
                AttestorDef::new("sarif"),
                AttestorDef::language_dependent("sbom"),
                AttestorDef::new("secretscan"),
                AttestorDef::new("slsa"),
                AttestorDef::new("system-packages"),
            ],
            steps: [
                "build",
                "test",
                "package",
                "deploy",
                "scan",
                "compile",
                "lint",
                "security-check",
                "analyze",
                "verify",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            commands: vec![
                CommandTemplate::new("echo-build", r#"echo "Building..." > output.txt"#, &[]),
                CommandTemplate::new("echo-test", r#"echo "Test output" > output.txt"#, &[]),
                CommandTemplate::new(
                    "echo-package",
                    r#"echo "Package created" > output.txt"#,
                    &[],
                ),
                CommandTemplate::new("cat-material", "cat input.txt > output.txt", &["material"]),
                CommandTemplate::new(
                    "copy-material",
                    r#"cp input.txt output.txt && echo "Done" >> output.txt"#,
                    &["material"],
                ),
                CommandTemplate::new(
                    "sbom-manifest",
                    "syft scan file:{manifest} -o spdx-json > output.txt",
                    &["sbom"],
                ),
                CommandTemplate::new("lockfile-manifest", "cp {manifest} output.txt", &["lockfiles"]),
            ],
            questions: vec![
                QuestionTemplate::new(
                    "complete-config",
                    "How do I create a complete witness configuration for a {step} step with {attestors} attestors that passes verification?",
                ),
                QuestionTemplate::new(
                    "complete-setup",
                    "What's the complete setup for using witness with {attestors} attestors in my {step} step?",
                ),
                QuestionTemplate::new(
                    "show-example",
                    "Show me a working witness example for {attestors} attestors in a {step} step.",
                ),
                QuestionTemplate::new(
                    "need-verified",
                    "I need a verified witness configuration for {step} with {attestors}. How do I set it up?",
                ),
                QuestionTemplate::new(
                    "run-and-verify",
                    "Can you provide a complete witness run and verify example using {attestors} for {step}?",
                ),
                QuestionTemplate::new(
                    "walk-through",
                    "Walk me through creating witness attestations with {attestors} in my {step} step.",
                ),
                QuestionTemplate::new(
                    "instrument",
                    "How do I instrument my {step} step with witness using {attestors} attestors?",
                ),
            ],
            policies: PolicyType::ALL.to_vec(),
            languages: vec![
                Language::new("go", "go.mod", "module example.com/app\n\ngo 1.22\n"),
                Language::new("python", "requirements.txt", "requests==2.32.3\n"),
                Language::new(
                    "node",
                    "package.json",
                    "{\n  \"name\": \"app\",\n  \"version\": \"1.0.0\",\n  \"dependencies\": {\n    \"left-pad\": \"1.3.0\"\n  }\n}\n",
                ),
                Language::new(
                    "rust",
                    "Cargo.toml",
                    "[package]\nname = \"app\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
                ),
                Language::new(
                    "java",
                    "pom.xml",
                    "<project>\n  <modelVersion>4.0.0</modelVersion>\n  <groupId>com.example</groupId>\n  <artifactId>app</artifactId>\n  <version>1.0.0</version>\n</project>\n",
                ),
            ],
        }
    }
}

impl Catalog {
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.attestors.is_empty() {
            return Err(CatalogError::EmptyDimension("attestors"));
        }
        if self.steps.is_empty() {
            return Err(CatalogError::EmptyDimension("steps"));
        }
        if self.commands.is_empty() {
            return Err(CatalogError::EmptyDimension("commands"));
        }
        if self.questions.is_empty() {
            return Err(CatalogError::EmptyDimension("questions"));
        }
        if self.policies.is_empty() {
            return Err(CatalogError::EmptyDimension("policies"));
        }
        if self.attestors.len() > MAX_CATALOG_ATTESTORS {
            return Err(CatalogError::TooManyAttestors(self.attestors.len()));
        }

        unique_labels("attestor", self.attestors.iter().map(|a| a.name.as_str()))?;
        unique_labels("step", self.steps.iter().map(String::as_str))?;
        unique_labels("command", self.commands.iter().map(|c| c.id.as_str()))?;
        unique_labels("question", self.questions.iter().map(|q| q.id.as_str()))?;
        unique_labels("policy", self.policies.iter().map(|p| p.as_str()))?;
        unique_labels("language", self.languages.iter().map(|l| l.name.as_str()))?;

        for cmd in &self.commands {
            for req in &cmd.requires {
                if self.attestor(req).is_none() {
                    return Err(CatalogError::UnknownAttestor {
                        command: cmd.id.clone(),
                        attestor: req.clone(),
                    });
                }
            }
            let has_language_req = cmd
                .requires
                .iter()
                .any(|r| self.attestor(r).is_some_and(|a| a.language_dependent));
            if cmd.shell.contains(MANIFEST_SLOT) && !has_language_req {
                return Err(CatalogError::ManifestWithoutLanguage(cmd.id.clone()));
            }
        }

        if let Some(q) = self.questions.iter().find(|q| !q.has_slot()) {
            return Err(CatalogError::QuestionWithoutSlot(q.id.clone()));
        }

        for policy in &self.policies {
            for req in policy.required_attestors() {
                if self.attestor(req).is_none() {
                    return Err(CatalogError::UnsatisfiablePolicy {
                        policy: *policy,
                        attestor: (*req).to_string(),
                    });
                }
            }
        }

        if self.languages.is_empty() {
            if let Some(a) = self.attestors.iter().find(|a| a.language_dependent) {
                return Err(CatalogError::NoLanguages(a.name.clone()));
            }
        }
        Ok(())
    }

    pub fn attestor(&self, name: &str) -> Option<&AttestorDef> {
        self.attestors.iter().find(|a| a.name == name)
    }

    pub fn command(&self, id: &str) -> Option<&CommandTemplate> {
        self.commands.iter().find(|c| c.id == id)
    }

    pub fn question(&self, id: &str) -> Option<&QuestionTemplate> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn language(&self, name: &str) -> Option<&Language> {
        self.languages.iter().find(|l| l.name == name)
    }

    /// True when any selected attestor needs a language ecosystem.
    pub fn needs_language(&self, attestors: &[&str]) -> bool {
        attestors
            .iter()
            .any(|name| self.attestor(name).is_some_and(|a| a.language_dependent))
    }

    pub fn compatible_commands<'a>(&'a self, attestors: &[&str]) -> Vec<&'a CommandTemplate> {
        self.commands
            .iter()
            .filter(|c| c.compatible_with(attestors))
            .collect()
    }

    pub fn compatible_policies(&self, attestors: &[&str]) -> Vec<PolicyType> {
        self.policies
            .iter()
            .copied()
            .filter(|p| p.compatible_with(attestors))
            .collect()
    }

    /// True when the sampler could have drawn `spec` from this catalog.
    pub fn admits(&self, spec: &ExampleSpecification, max_attestors: usize) -> bool {
        let attestors = spec.attestor_refs();
        let language_ok = match spec.language() {
            Some(name) => self.needs_language(&attestors) && self.language(name).is_some(),
            None => !self.needs_language(&attestors),
        };
        !attestors.is_empty()
            && attestors.len() <= self.effective_max_attestors(max_attestors)
            && attestors.iter().all(|a| self.attestor(a).is_some())
            && self.steps.iter().any(|s| s == spec.step_name())
            && self
                .command(spec.command_template())
                .is_some_and(|c| c.compatible_with(&attestors))
            && self.question(spec.question_template()).is_some()
            && self.policies.contains(&spec.policy_type())
            && spec.policy_type().compatible_with(&attestors)
            && language_ok
    }

    /// Largest attestor subset size the sampler may draw.
    pub fn effective_max_attestors(&self, max_attestors: usize) -> usize {
        max_attestors.clamp(1, self.attestors.len().max(1))
    }

    /// Unconstrained product of the dimension sizes:
    /// subsets x steps x commands x questions x policies x max(languages, 1).
    pub fn theoretical_space_size(&self, max_attestors: usize) -> u128 {
        let n = self.attestors.len() as u128;
        let k_max = self.effective_max_attestors(max_attestors) as u128;
        let subsets = (1..=k_max).fold(0u128, |acc, k| acc.saturating_add(binomial(n, k)));
        [
            self.steps.len(),
            self.commands.len(),
            self.questions.len(),
            self.policies.len(),
            self.languages.len().max(1),
        ]
        .iter()
        .fold(subsets, |acc, &d| acc.saturating_mul(d as u128))
    }

    /// Exact number of valid specifications, with command, policy and
    /// language constraints applied.
    pub fn reachable_space_size(&self, max_attestors: usize) -> u128 {
        let n = self.attestors.len().min(MAX_CATALOG_ATTESTORS);
        let k_max = self.effective_max_attestors(max_attestors) as u32;
        let mut per_subset_total: u128 = 0;

        for mask in 1u32..(1u32 << n) {
            if mask.count_ones() > k_max {
                continue;
            }
            let selected: Vec<&str> = (0..n)
                .filter(|i| mask & (1 << i) != 0)
                .map(|i| self.attestors[i].name.as_str())
                .collect();
            let commands = self.compatible_commands(&selected).len() as u128;
            let policies = self.compatible_policies(&selected).len() as u128;
            let languages = if self.needs_language(&selected) {
                self.languages.len() as u128
            } else {
                1
            };
            per_subset_total = per_subset_total
                .saturating_add(commands.saturating_mul(policies).saturating_mul(languages));
        }

        per_subset_total
            .saturating_mul(self.steps.len() as u128)
            .saturating_mul(self.questions.len() as u128)
    }
}

fn unique_labels<'a>(
    dimension: &'static str,
    labels: impl Iterator<Item = &'a str>,
) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    for label in labels {
        if !seen.insert(label) {
            return Err(CatalogError::DuplicateLabel {
                dimension,
                label: label.to_string(),
            });
        }
    }
    Ok(())
}

fn binomial(n: u128, k: u128) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    (0..k).fold(1u128, |acc, i| acc * (n - i) / (i + 1))
}
