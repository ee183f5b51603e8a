//! Parallel generation loop.
//!
//! Workers run on scoped threads. Each owns a [`Sampler`] (seeded
//! `seed + worker_index`) and an [`ExampleBuilder`]; all of them share one
//! [`SeenSet`] and one [`RecordSink`]. Workers stop when the sink holds
//! `target` records, when cancellation is requested, or as soon as any
//! sampler reports exhaustion.

use crate::builder::{BuilderSettings, ExampleBuilder, Rejection};
use crate::catalog::Catalog;
use crate::record::RecordSink;
use crate::runner::CommandRunner;
use crate::sampler::{SampleError, Sampler, SamplerSettings, SeenSet};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex, PoisonError,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub target: usize,
    pub parallelism: usize,
    /// Progress is logged every this many attempts.
    pub report_every: u64,
    pub sampler: SamplerSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub target: usize,
    /// Records written by this run.
    pub produced: usize,
    /// Rejected attempts, timeouts included.
    pub failed: u64,
    pub timed_out: u64,
    pub attempts: u64,
    /// Verified records dropped because the target was already met.
    pub discarded: u64,
}

impl RunSummary {
    /// Share of attempts that produced a verified record, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        let verified = self.attempts.saturating_sub(self.failed);
        verified as f64 * 100.0 / self.attempts as f64
    }

    pub fn shortfall(&self) -> usize {
        self.target.saturating_sub(self.produced)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "configuration space exhausted: produced {} of {} records ({shortfall} short)",
        .summary.produced,
        .summary.target
    )]
    Exhausted { summary: RunSummary, shortfall: usize },
    #[error("cancelled after {} of {} records", .summary.produced, .summary.target)]
    Cancelled { summary: RunSummary },
    #[error("writing output: {0:#}")]
    Sink(anyhow::Error),
}

impl RunError {
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            Self::Exhausted { summary, .. } | Self::Cancelled { summary } => Some(summary),
            Self::Sink(_) => None,
        }
    }
}

pub struct Driver<'a> {
    catalog: &'a Catalog,
    builder_settings: &'a BuilderSettings,
    runner: &'a dyn CommandRunner,
    sink: &'a RecordSink,
    seen: SeenSet,
    settings: DriverSettings,
}

/// Counters shared by all workers of one run.
#[derive(Default)]
struct Tally {
    attempts: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    discarded: AtomicU64,
    stop: AtomicBool,
    sink_error: Mutex<Option<anyhow::Error>>,
}

impl Tally {
    fn snapshot(&self, target: usize, produced: usize) -> RunSummary {
        RunSummary {
            target,
            produced,
            failed: self.failed.load(Ordering::SeqCst),
            timed_out: self.timed_out.load(Ordering::SeqCst),
            attempts: self.attempts.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
        }
    }
}

impl<'a> Driver<'a> {
    pub fn new(
        catalog: &'a Catalog,
        builder_settings: &'a BuilderSettings,
        runner: &'a dyn CommandRunner,
        sink: &'a RecordSink,
        seen: SeenSet,
        settings: DriverSettings,
    ) -> Self {
        Self {
            catalog,
            builder_settings,
            runner,
            sink,
            seen,
            settings,
        }
    }

    pub fn run(&self, cancel: &AtomicBool) -> Result<RunSummary, RunError> {
        let workers = self.settings.parallelism.max(1);
        let tally = Tally::default();

        tracing::info!(
            target_records = self.settings.target,
            workers,
            already_seen = self.seen.len(),
            "starting generation"
        );

        std::thread::scope(|scope| {
            for index in 0..workers {
                let tally = &tally;
                scope.spawn(move || {
                    let span = tracing::info_span!("worker", index);
                    let _entered = span.enter();
                    self.worker(index, cancel, tally);
                });
            }
        });

        let summary = tally.snapshot(self.settings.target, self.sink.written());

        let sink_error = tally
            .sink_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = sink_error {
            return Err(RunError::Sink(e));
        }
        if summary.produced >= summary.target {
            return Ok(summary);
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(RunError::Cancelled { summary });
        }
        Err(RunError::Exhausted {
            shortfall: summary.shortfall(),
            summary,
        })
    }

    fn worker(&self, index: usize, cancel: &AtomicBool, tally: &Tally) {
        let target = self.settings.target;
        let mut sampler = Sampler::new(
            self.catalog,
            self.seen.clone(),
            SamplerSettings {
                seed: self.settings.sampler.seed.wrapping_add(index as u64),
                ..self.settings.sampler
            },
        );
        let builder = ExampleBuilder::new(self.catalog, self.builder_settings, self.runner);

        loop {
            if cancel.load(Ordering::SeqCst)
                || tally.stop.load(Ordering::SeqCst)
                || self.sink.written() >= target
            {
                break;
            }

            let spec = match sampler.next_specification() {
                Ok(spec) => spec,
                Err(e @ SampleError::Exhausted { .. }) => {
                    tracing::warn!(error = %e, "sampler exhausted, stopping all workers");
                    tally.stop.store(true, Ordering::SeqCst);
                    break;
                }
            };

            let attempt = tally.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match builder.build(&spec, attempt) {
                Ok(record) => match self.sink.append_within(&record, target) {
                    Ok(true) => {
                        tracing::info!(attempt, spec = %spec, "verified example written");
                    }
                    Ok(false) => {
                        tally.discarded.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(attempt, spec = %spec, "target already met, record discarded");
                    }
                    Err(e) => {
                        tracing::error!(error = %format!("{e:#}"), "output write failed");
                        *tally.sink_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                        tally.stop.store(true, Ordering::SeqCst);
                        break;
                    }
                },
                Err(rejection) => self.note_rejection(attempt, &spec, &rejection, tally),
            }

            if self.settings.report_every > 0 && attempt % self.settings.report_every == 0 {
                let progress = tally.snapshot(target, self.sink.written());
                tracing::info!(
                    attempts = progress.attempts,
                    written = progress.produced,
                    target_records = target,
                    failed = progress.failed,
                    success_rate = %format!("{:.1}%", progress.success_rate()),
                    "progress"
                );
            }
        }
    }

    fn note_rejection(
        &self,
        attempt: u64,
        spec: &crate::spec::ExampleSpecification,
        rejection: &Rejection,
        tally: &Tally,
    ) {
        tally.failed.fetch_add(1, Ordering::SeqCst);
        if rejection.is_timeout() {
            tally.timed_out.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(attempt, spec = %spec, reason = %rejection, "attempt timed out");
        } else {
            tracing::warn!(attempt, spec = %spec, reason = %rejection, "attempt rejected");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::builder::tests::{test_settings, FakeToolchain, Fault};
    use crate::catalog::tests::tiny_catalog;
    use crate::record::read_records;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn settings(target: usize, parallelism: usize) -> DriverSettings {
        DriverSettings {
            target,
            parallelism,
            report_every: 2,
            sampler: SamplerSettings {
                max_attestors: 7,
                max_consecutive_duplicates: 1_000,
                seed: 42,
            },
        }
    }

    struct Fixture {
        dir: TempDir,
        sink: RecordSink,
        builder: BuilderSettings,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let sink = RecordSink::open(&dir.path().join("out.jsonl")).unwrap();
        let builder = test_settings(Some(dir.path().join("work")));
        Fixture { dir, sink, builder }
    }

    #[test]
    fn test_run_reaches_target_with_unique_records() {
        let fx = fixture();
        let catalog = Catalog::default();
        let runner = FakeToolchain::default();
        let driver = Driver::new(
            &catalog,
            &fx.builder,
            &runner,
            &fx.sink,
            SeenSet::new(),
            settings(12, 3),
        );
        let summary = driver.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(summary.produced, 12);
        assert_eq!(summary.failed, 0);

        let records = read_records(fx.sink.path()).unwrap();
        assert_eq!(records.len(), 12);
        let specs: HashSet<_> = records.iter().map(|r| r.metadata.spec.clone()).collect();
        assert_eq!(specs.len(), 12);
        assert!(records.iter().all(|r| r.was_built_from(&r.metadata.spec)));
        let work = fx.dir.path().join("work");
        assert_eq!(std::fs::read_dir(work).unwrap().count(), 0);
    }

    #[test]
    fn test_racing_workers_never_exceed_target() {
        let fx = fixture();
        let catalog = Catalog::default();
        let runner = FakeToolchain::default();
        let summary = Driver::new(&catalog, &fx.builder, &runner, &fx.sink, SeenSet::new(), settings(1, 4))
            .run(&AtomicBool::new(false))
            .unwrap();
        assert_eq!(summary.produced, 1);
        assert_eq!(read_records(fx.sink.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_exhaustion_reports_shortfall() {
        let fx = fixture();
        let catalog = tiny_catalog();
        let runner = FakeToolchain::default();
        let err = Driver::new(&catalog, &fx.builder, &runner, &fx.sink, SeenSet::new(), settings(5, 2))
            .run(&AtomicBool::new(false))
            .unwrap_err();
        match err {
            RunError::Exhausted { summary, shortfall } => {
                assert_eq!(summary.produced, 3);
                assert_eq!(shortfall, 2);
                assert_eq!(summary.attempts, 3);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_rejected_specifications_are_burned() {
        let fx = fixture();
        let catalog = tiny_catalog();
        let runner = FakeToolchain::faulty("witness run", Fault::Fail);
        let seen = SeenSet::new();
        let err = Driver::new(&catalog, &fx.builder, &runner, &fx.sink, seen.clone(), settings(2, 2))
            .run(&AtomicBool::new(false))
            .unwrap_err();
        let summary = *err.summary().unwrap();
        assert_eq!(summary.produced, 0);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.attempts, 3);
        assert_eq!(seen.len(), 3);
        assert!(matches!(err, RunError::Exhausted { shortfall: 2, .. }));
    }

    #[test]
    fn test_timeouts_are_counted_separately() {
        let fx = fixture();
        let catalog = tiny_catalog();
        let runner = FakeToolchain::faulty("witness verify", Fault::Timeout);
        let err = Driver::new(&catalog, &fx.builder, &runner, &fx.sink, SeenSet::new(), settings(3, 1))
            .run(&AtomicBool::new(false))
            .unwrap_err();
        let summary = err.summary().unwrap();
        assert_eq!(summary.timed_out, 3);
        assert_eq!(summary.failed, 3);
        assert!(summary.success_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_cancelled_before_start() {
        let fx = fixture();
        let catalog = Catalog::default();
        let runner = FakeToolchain::default();
        let err = Driver::new(&catalog, &fx.builder, &runner, &fx.sink, SeenSet::new(), settings(10, 2))
            .run(&AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled { summary } if summary.attempts == 0));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_success_rate() {
        let summary = RunSummary {
            target: 10,
            produced: 3,
            failed: 1,
            attempts: 4,
            ..RunSummary::default()
        };
        assert!((summary.success_rate() - 75.0).abs() < 1e-9);
        assert_eq!(summary.shortfall(), 7);
        assert!(RunSummary::default().success_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_snapshot_matches_summary_rate() {
        let tally = Tally::default();
        tally.attempts.store(8, Ordering::SeqCst);
        tally.failed.store(2, Ordering::SeqCst);
        tally.timed_out.store(1, Ordering::SeqCst);

        let progress = tally.snapshot(10, 6);
        assert_eq!(progress.attempts, 8);
        assert_eq!(progress.produced, 6);
        assert_eq!(progress.timed_out, 1);
        assert!((progress.success_rate() - 75.0).abs() < 1e-9);
    }
}
