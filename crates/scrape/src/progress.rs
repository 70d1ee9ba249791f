//! Shared counters and the single-line progress display. Workers bump the
//! counters; a sink renders them at least once per record completion.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Counters {
    saved: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    discovered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub saved: u64,
    pub skipped: u64,
    pub failed: u64,
    pub discovered: u64,
}

impl Counters {
    pub fn incr_saved(&self) {
        self.saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            saved: self.saved.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discovered: self.discovered.load(Ordering::Relaxed),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn update(&self, snapshot: CounterSnapshot);
    fn finish(&self, _snapshot: CounterSnapshot) {}
}

/// Sink for tests and non-interactive runs.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update(&self, _snapshot: CounterSnapshot) {}
}

const PROGRESS_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {msg}";

pub struct ConsoleProgress {
    bar: ProgressBar,
    label: String,
    started: Instant,
}

impl ConsoleProgress {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template(PROGRESS_TEMPLATE).expect("static template"));
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            label: label.to_string(),
            started: Instant::now(),
        }
    }

    fn message(&self, snapshot: CounterSnapshot) -> String {
        let done = snapshot.saved + snapshot.skipped + snapshot.failed;
        let rate = done as f64 / self.started.elapsed().as_secs_f64().max(0.001);
        format!(
            "{}: saved {} skipped {} failed {} ({:.1} docs/s)",
            self.label, snapshot.saved, snapshot.skipped, snapshot.failed, rate
        )
    }
}

impl ProgressSink for ConsoleProgress {
    fn update(&self, snapshot: CounterSnapshot) {
        self.bar.set_message(self.message(snapshot));
    }

    fn finish(&self, snapshot: CounterSnapshot) {
        self.bar.finish_with_message(self.message(snapshot));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_snapshot_reflects_increments() {
        let counters = Counters::default();
        counters.incr_discovered();
        counters.incr_discovered();
        counters.incr_saved();
        counters.incr_skipped();
        counters.incr_failed();

        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                saved: 1,
                skipped: 1,
                failed: 1,
                discovered: 2,
            }
        );
        assert_eq!(counters.saved(), 1);
    }
}
