use crate::catalog::PolicyType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One point in the configuration space.
///
/// The attestor set is canonicalized on construction (sorted, deduplicated),
/// so two specifications that differ only in attestor order are equal and
/// hash identically. Fields are private; the value is immutable once built.
/// Deserialization goes through the same canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "SpecRepr")]
pub struct ExampleSpecification {
    attestors: Vec<String>,
    step_name: String,
    command_template: String,
    question_template: String,
    policy_type: PolicyType,
    language: Option<String>,
}

/// The canonical tuple tracked by the uniqueness set.
pub type SpecKey = ExampleSpecification;

#[derive(Deserialize)]
struct SpecRepr {
    attestors: Vec<String>,
    step_name: String,
    command_template: String,
    question_template: String,
    policy_type: PolicyType,
    language: Option<String>,
}

impl From<SpecRepr> for ExampleSpecification {
    fn from(r: SpecRepr) -> Self {
        Self::new(
            r.attestors,
            &r.step_name,
            &r.command_template,
            &r.question_template,
            r.policy_type,
            r.language.as_deref(),
        )
    }
}

impl ExampleSpecification {
    pub fn new<I, S>(
        attestors: I,
        step_name: &str,
        command_template: &str,
        question_template: &str,
        policy_type: PolicyType,
        language: Option<&str>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attestors: canonicalize_attestors(attestors),
            step_name: step_name.to_string(),
            command_template: command_template.to_string(),
            question_template: question_template.to_string(),
            policy_type,
            language: language.map(ToString::to_string),
        }
    }

    pub fn attestors(&self) -> &[String] {
        &self.attestors
    }

    pub fn attestor_refs(&self) -> Vec<&str> {
        self.attestors.iter().map(String::as_str).collect()
    }

    pub fn has_attestor(&self, name: &str) -> bool {
        self.attestors.iter().any(|a| a == name)
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn command_template(&self) -> &str {
        &self.command_template
    }

    pub fn question_template(&self) -> &str {
        &self.question_template
    }

    pub fn policy_type(&self) -> PolicyType {
        self.policy_type
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Comma-joined attestor list as passed to `witness run --attestations`.
    pub fn attestor_arg(&self) -> String {
        self.attestors.join(",")
    }

    /// Hex SHA-256 over the canonical tuple. Stable across runs and
    /// platforms; fields are length-prefixed so no two tuples collide on
    /// concatenation.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        let mut field = |s: &str| {
            h.update((s.len() as u64).to_be_bytes());
            h.update(s.as_bytes());
        };
        field(&self.attestors.len().to_string());
        for a in &self.attestors {
            field(a);
        }
        field(&self.step_name);
        field(&self.command_template);
        field(&self.question_template);
        field(self.policy_type.as_str());
        field(self.language.as_deref().unwrap_or(""));
        hex::encode(h.finalize())
    }
}

impl fmt::Display for ExampleSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step={} attestors={} command={} question={} policy={}",
            self.step_name,
            self.attestor_arg(),
            self.command_template,
            self.question_template,
            self.policy_type,
        )?;
        if let Some(lang) = &self.language {
            write!(f, " language={lang}")?;
        }
        Ok(())
    }
}

/// Sorts and deduplicates an attestor selection.
pub fn canonicalize_attestors<I, S>(attestors: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = attestors.into_iter().map(Into::into).collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn spec(attestors: &[&str]) -> ExampleSpecification {
        ExampleSpecification::new(
            attestors.iter().copied(),
            "build",
            "echo-build",
            "complete-config",
            PolicyType::None,
            None,
        )
    }

    #[test]
    fn test_attestor_order_does_not_affect_identity() {
        let a = spec(&["git", "product"]);
        let b = spec(&["product", "git"]);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_duplicate_attestors_collapse() {
        let s = spec(&["git", "git", "environment"]);
        assert_eq!(s.attestors(), &["environment".to_string(), "git".to_string()]);
    }

    #[test]
    fn test_fingerprint_distinguishes_language() {
        let plain = spec(&["sbom"]);
        let go = ExampleSpecification::new(
            ["sbom"],
            "build",
            "echo-build",
            "complete-config",
            PolicyType::None,
            Some("go"),
        );
        assert_ne!(plain.fingerprint(), go.fingerprint());
        assert_eq!(go.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_has_no_concatenation_collisions() {
        let a = ExampleSpecification::new(["ab"], "c", "x", "q", PolicyType::None, None);
        let b = ExampleSpecification::new(["a"], "bc", "x", "q", PolicyType::None, None);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_display_lists_every_dimension() {
        let s = ExampleSpecification::new(
            ["product", "git"],
            "deploy",
            "echo-build",
            "instrument",
            PolicyType::Git,
            Some("rust"),
        );
        assert_eq!(
            s.to_string(),
            "step=deploy attestors=git,product command=echo-build question=instrument policy=git language=rust"
        );
    }

    #[test]
    fn test_deserialize_canonicalizes() {
        let json = r#"{
            "attestors": ["product", "git", "product"],
            "step_name": "build",
            "command_template": "echo-build",
            "question_template": "complete-config",
            "policy_type": "none",
            "language": null
        }"#;
        let parsed: ExampleSpecification = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, spec(&["git", "product"]));
        let back: ExampleSpecification =
            serde_json::from_value(serde_json::to_value(&parsed).unwrap()).unwrap();
        assert_eq!(back, parsed);
    }

    proptest! {
        #[test]
        fn prop_canonicalization_is_order_independent(
            mut names in proptest::collection::vec("[a-z]{1,8}", 1..8),
            seed in any::<u64>(),
        ) {
            let forward = canonicalize_attestors(names.clone());
            // Deterministic permutation driven by the seed.
            let len = names.len();
            for i in 0..len {
                let j = ((seed as usize).wrapping_add(i * 7)) % len;
                names.swap(i, j);
            }
            prop_assert_eq!(forward.clone(), canonicalize_attestors(names));
            prop_assert_eq!(forward.clone(), canonicalize_attestors(forward));
        }
    }
}
