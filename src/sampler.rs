//! Collision-free specification sampler.
//!
//! A [`Sampler`] draws random points of the catalog's configuration space
//! and hands out only those not yet in the shared [`SeenSet`]. Membership
//! is decided when a specification is drawn, not when it is built, so a
//! specification whose build is later rejected is never drawn again.

use crate::catalog::Catalog;
use crate::record::scan_records;
use crate::spec::{ExampleSpecification, SpecKey};
use anyhow::Result;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("configuration space exhausted: {seen} of {reachable} reachable specifications already drawn")]
    Exhausted { seen: usize, reachable: u128 },
}

/// Specifications already handed out, shared by every sampler of a run.
///
/// Cloning shares the underlying set. The check and the insert happen under
/// one lock acquisition.
#[derive(Debug, Clone, Default)]
pub struct SeenSet {
    inner: Arc<Mutex<HashSet<SpecKey>>>,
}

/// Outcome of [`SeenSet::seed_from_dataset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeStats {
    pub marked: usize,
    /// Records whose specification is outside the current catalog.
    pub foreign: usize,
    /// Line number of a cut-off final line that was skipped.
    pub truncated_line: Option<usize>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `spec` and returns true if it was not present.
    pub fn insert_if_absent(&self, spec: &SpecKey) -> bool {
        let mut set = self.lock();
        if set.contains(spec) {
            return false;
        }
        set.insert(spec.clone())
    }

    /// Marks a specification as drawn without sampling it.
    pub fn mark(&self, spec: SpecKey) -> bool {
        self.lock().insert(spec)
    }

    pub fn contains(&self, spec: &SpecKey) -> bool {
        self.lock().contains(spec)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Marks every specification recorded in an existing JSONL dataset so
    /// an appending run never repeats one. A missing file marks nothing, and
    /// a cut-off final line is skipped and reported.
    ///
    /// Records the catalog could not have produced are counted in
    /// [`ResumeStats::foreign`] and left out of the set; they would otherwise
    /// inflate the exhaustion check.
    pub fn seed_from_dataset(
        &self,
        path: &Path,
        catalog: &Catalog,
        max_attestors: usize,
    ) -> Result<ResumeStats> {
        let mut stats = ResumeStats::default();
        if !path.exists() {
            return Ok(stats);
        }
        let scan = scan_records(path)?;
        stats.truncated_line = scan.truncated_line;
        for record in scan.records {
            let spec = record.metadata.spec;
            if !catalog.admits(&spec, max_attestors) {
                stats.foreign += 1;
                continue;
            }
            if self.mark(spec) {
                stats.marked += 1;
            }
        }
        Ok(stats)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SpecKey>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSettings {
    pub max_attestors: usize,
    /// Consecutive draws that yield nothing new before giving up.
    pub max_consecutive_duplicates: u64,
    pub seed: u64,
}

pub struct Sampler<'a> {
    catalog: &'a Catalog,
    seen: SeenSet,
    max_attestors: usize,
    max_misses: u64,
    reachable: u128,
    rng: StdRng,
}

impl<'a> Sampler<'a> {
    pub fn new(catalog: &'a Catalog, seen: SeenSet, settings: SamplerSettings) -> Self {
        let max_attestors = catalog.effective_max_attestors(settings.max_attestors);
        Self {
            catalog,
            seen,
            max_attestors,
            max_misses: settings.max_consecutive_duplicates.max(1),
            reachable: catalog.reachable_space_size(max_attestors),
            rng: StdRng::seed_from_u64(settings.seed),
        }
    }

    /// Number of valid specifications in the catalog.
    pub fn reachable(&self) -> u128 {
        self.reachable
    }

    /// Draws until an unseen specification turns up, recording it as seen.
    pub fn next_specification(&mut self) -> Result<ExampleSpecification, SampleError> {
        let mut misses = 0u64;
        loop {
            let seen = self.seen.len();
            if seen as u128 >= self.reachable {
                return Err(SampleError::Exhausted {
                    seen,
                    reachable: self.reachable,
                });
            }

            if let Some(spec) = self.draw() {
                if self.seen.insert_if_absent(&spec) {
                    return Ok(spec);
                }
            }

            misses += 1;
            if misses >= self.max_misses {
                return Err(SampleError::Exhausted {
                    seen: self.seen.len(),
                    reachable: self.reachable,
                });
            }
        }
    }

    /// One random point; `None` when the drawn attestor subset admits no
    /// command or no policy.
    fn draw(&mut self) -> Option<ExampleSpecification> {
        let catalog = self.catalog;
        let size = self.rng.gen_range(1..=self.max_attestors);
        let attestors: Vec<&str> = catalog
            .attestors
            .choose_multiple(&mut self.rng, size)
            .map(|a| a.name.as_str())
            .collect();

        let step = catalog.steps.choose(&mut self.rng)?;
        let question = catalog.questions.choose(&mut self.rng)?;
        let command = catalog
            .compatible_commands(&attestors)
            .choose(&mut self.rng)
            .copied()?;
        let policy = *catalog
            .compatible_policies(&attestors)
            .choose(&mut self.rng)?;
        let language = if catalog.needs_language(&attestors) {
            Some(catalog.languages.choose(&mut self.rng)?.name.as_str())
        } else {
            None
        };

        Some(ExampleSpecification::new(
            attestors,
            step,
            &command.id,
            &question.id,
            policy,
            language,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::tests::tiny_catalog;
    use crate::catalog::{AttestorDef, CommandTemplate, Language, PolicyType};
    use crate::record::{tests::sample_record, RecordSink};

    fn settings(seed: u64) -> SamplerSettings {
        SamplerSettings {
            max_attestors: 7,
            max_consecutive_duplicates: 1_000,
            seed,
        }
    }

    #[test]
    fn test_tiny_catalog_yields_three_then_exhausts() {
        let catalog = tiny_catalog();
        let seen = SeenSet::new();
        let mut sampler = Sampler::new(&catalog, seen.clone(), settings(1));
        assert_eq!(sampler.reachable(), 3);

        let mut drawn = HashSet::new();
        for _ in 0..3 {
            assert!(drawn.insert(sampler.next_specification().unwrap()));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(
            sampler.next_specification(),
            Err(SampleError::Exhausted {
                seen: 3,
                reachable: 3
            })
        );
    }

    #[test]
    fn test_single_miss_allowance_stops_early() {
        let catalog = tiny_catalog();
        let seen = SeenSet::new();
        let mut sampler = Sampler::new(
            &catalog,
            seen.clone(),
            SamplerSettings {
                max_attestors: 7,
                max_consecutive_duplicates: 1,
                seed: 5,
            },
        );
        let mut results = Vec::new();
        for _ in 0..10 {
            results.push(sampler.next_specification());
        }
        assert!(results.iter().any(Result::is_err));
        assert!(seen.len() <= 3);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let catalog = Catalog::default();
        let draw = |seed| {
            let mut s = Sampler::new(&catalog, SeenSet::new(), settings(seed));
            (0..20)
                .map(|_| s.next_specification().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
        assert_ne!(draw(9), draw(10));
    }

    #[test]
    fn test_samples_are_unique_and_admissible() {
        let catalog = Catalog::default();
        let mut sampler = Sampler::new(&catalog, SeenSet::new(), settings(42));
        let mut drawn = HashSet::new();
        for _ in 0..2_000 {
            let spec = sampler.next_specification().unwrap();
            assert!(catalog.admits(&spec, 7), "{spec}");
            assert!(spec.attestors().len() <= 7);
            assert!(drawn.insert(spec));
        }
    }

    #[test]
    fn test_language_command_requires_its_attestor() {
        let catalog = Catalog::default();
        let mut sampler = Sampler::new(&catalog, SeenSet::new(), settings(3));
        for _ in 0..2_000 {
            let spec = sampler.next_specification().unwrap();
            match spec.command_template() {
                "sbom-manifest" => assert!(spec.has_attestor("sbom"), "{spec}"),
                "lockfile-manifest" => assert!(spec.has_attestor("lockfiles"), "{spec}"),
                "cat-material" | "copy-material" => assert!(spec.has_attestor("material"), "{spec}"),
                _ => {}
            }
            let needs = spec.has_attestor("sbom") || spec.has_attestor("lockfiles");
            assert_eq!(spec.language().is_some(), needs, "{spec}");
        }
    }

    #[test]
    fn test_marked_specification_never_drawn() {
        let catalog = tiny_catalog();
        let seen = SeenSet::new();
        let both = ExampleSpecification::new(
            ["git", "environment"],
            "build",
            "c1",
            "q1",
            PolicyType::None,
            None,
        );
        assert!(seen.mark(both.clone()));

        let mut sampler = Sampler::new(&catalog, seen.clone(), settings(7));
        let a = sampler.next_specification().unwrap();
        let b = sampler.next_specification().unwrap();
        assert_ne!(a, both);
        assert_ne!(b, both);
        assert!(sampler.next_specification().is_err());
    }

    #[test]
    fn test_samplers_sharing_a_set_never_collide() {
        let catalog = Catalog::default();
        let seen = SeenSet::new();
        let all: Vec<ExampleSpecification> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let seen = seen.clone();
                    let catalog = &catalog;
                    scope.spawn(move || {
                        let mut s = Sampler::new(catalog, seen, settings(100 + i));
                        (0..250)
                            .map(|_| s.next_specification().unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 1_000);
        assert_eq!(seen.len(), 1_000);
    }

    #[test]
    fn test_subset_without_command_is_skipped() {
        let mut catalog = tiny_catalog();
        catalog.attestors.push(AttestorDef::new("material"));
        catalog.commands = vec![CommandTemplate::new("cat", "cat input.txt > output.txt", &["material"])];
        assert_eq!(catalog.reachable_space_size(7), 4);

        let mut sampler = Sampler::new(&catalog, SeenSet::new(), settings(11));
        for _ in 0..4 {
            let spec = sampler.next_specification().unwrap();
            assert!(spec.has_attestor("material"), "{spec}");
        }
        assert!(sampler.next_specification().is_err());
    }

    #[test]
    fn test_seed_from_dataset_marks_previous_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let catalog = tiny_catalog();
        let known = ExampleSpecification::new(["git"], "build", "c1", "q1", PolicyType::None, None);
        let foreign = ExampleSpecification::new(
            ["sbom"],
            "build",
            "c1",
            "q1",
            PolicyType::None,
            Some("go"),
        );
        let sink = RecordSink::open(&path).unwrap();
        sink.append_within(&sample_record(&known), 10).unwrap();
        sink.append_within(&sample_record(&foreign), 10).unwrap();

        let seen = SeenSet::new();
        let stats = seen.seed_from_dataset(&path, &catalog, 7).unwrap();
        assert_eq!(
            stats,
            ResumeStats {
                marked: 1,
                foreign: 1,
                truncated_line: None,
            }
        );
        assert!(seen.contains(&known));

        let missing = seen
            .seed_from_dataset(&dir.path().join("absent.jsonl"), &catalog, 7)
            .unwrap();
        assert_eq!(missing, ResumeStats::default());
    }

    #[test]
    fn test_seed_from_dataset_skips_cut_off_final_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let spec = ExampleSpecification::new(["git"], "build", "c1", "q1", PolicyType::None, None);
        let line = serde_json::to_string(&sample_record(&spec)).unwrap();
        std::fs::write(&path, format!("{line}\n{}", &line[..20])).unwrap();

        let seen = SeenSet::new();
        let stats = seen.seed_from_dataset(&path, &tiny_catalog(), 7).unwrap();
        assert_eq!(stats.marked, 1);
        assert_eq!(stats.truncated_line, Some(2));
        assert!(seen.contains(&spec));
    }

    #[test]
    fn test_language_choice_covers_catalog_languages() {
        let mut catalog = tiny_catalog();
        catalog.attestors = vec![AttestorDef::language_dependent("sbom")];
        catalog.languages = vec![
            Language::new("go", "go.mod", "module x\n"),
            Language::new("rust", "Cargo.toml", "[package]\n"),
        ];
        let mut sampler = Sampler::new(&catalog, SeenSet::new(), settings(2));
        let mut langs: Vec<String> = (0..2)
            .map(|_| sampler.next_specification().unwrap().language().unwrap().to_string())
            .collect();
        langs.sort();
        assert_eq!(langs, vec!["go".to_string(), "rust".to_string()]);
        assert!(sampler.next_specification().is_err());
    }
}
