//! Hierarchical work phases with ETA estimation
//!
//! A publish run is modelled as a tree of phases: the run root, one
//! container per partition, and leaves for removals and page publishing.
//! Leaves track target/done unit counts with atomics; containers derive
//! everything from their children.
//!
//! ETA blends the historical per-unit rate (from [`PhaseHistory`]) with
//! the rate observed so far, weighted by completion: an untouched phase
//! trusts history entirely, a nearly-finished one trusts the current run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::progress::history::PhaseHistory;

/// Per-unit estimate used when a phase has no history at all.
const FALLBACK_RATE: Duration = Duration::from_millis(1);

/// Expected relative ETA deviation for a phase tracking its history.
const BASELINE_DEVIATION: f64 = 0.1;

/// One node in the phase tree.
pub struct WorkPhase {
    name: String,
    weight: u64,
    target: AtomicU64,
    done: AtomicU64,
    started: OnceLock<Instant>,
    ended: OnceLock<Instant>,
    history: Option<PhaseHistory>,
    parent: Weak<WorkPhase>,
    children: Mutex<Vec<Arc<WorkPhase>>>,
}

/// Measured outcome of a finished phase, ready for the history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStats {
    pub elapsed: Duration,
    pub units: u64,
}

impl PhaseStats {
    pub fn to_history(self) -> PhaseHistory {
        PhaseHistory {
            elapsed_ms: self.elapsed.as_millis() as u64,
            units: self.units,
        }
    }
}

/// Serializable snapshot of a phase subtree, for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub name: String,
    pub target: u64,
    pub done: u64,
    pub finished: bool,
    pub progress: f64,
    pub eta_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PhaseSnapshot>,
}

impl WorkPhase {
    /// Create the root of a phase tree.
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            weight: 1,
            target: AtomicU64::new(0),
            done: AtomicU64::new(0),
            started: OnceLock::new(),
            ended: OnceLock::new(),
            history: None,
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Attach a child phase with the default sibling weight of 1. Leaves
    /// carry a unit target and optionally a historical timing.
    pub fn add_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        target: u64,
        history: Option<PhaseHistory>,
    ) -> Arc<Self> {
        self.add_weighted_child(name, 1, target, history)
    }

    /// Attach a child phase carrying an explicit share of the parent's
    /// progress range relative to its siblings.
    pub fn add_weighted_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        weight: u64,
        target: u64,
        history: Option<PhaseHistory>,
    ) -> Arc<Self> {
        let child = Arc::new(Self {
            name: name.into(),
            weight: weight.max(1),
            target: AtomicU64::new(target),
            done: AtomicU64::new(0),
            started: OnceLock::new(),
            ended: OnceLock::new(),
            history,
            parent: Arc::downgrade(self),
            children: Mutex::new(Vec::new()),
        });
        self.children.lock().unwrap().push(child.clone());
        child
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn target(&self) -> u64 {
        let children = self.children.lock().unwrap();
        if children.is_empty() {
            self.target.load(Ordering::Relaxed)
        } else {
            children.iter().map(|c| c.target()).sum()
        }
    }

    pub fn done(&self) -> u64 {
        let children = self.children.lock().unwrap();
        if children.is_empty() {
            self.done.load(Ordering::Relaxed)
        } else {
            children.iter().map(|c| c.done()).sum()
        }
    }

    pub fn set_target(&self, target: u64) {
        self.target.store(target, Ordering::Relaxed);
    }

    /// Start the clock. Starting a phase starts its ancestors too.
    pub fn start(&self) {
        let _ = self.started.set(Instant::now());
        if let Some(parent) = self.parent.upgrade() {
            parent.start();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.get().is_some()
    }

    /// Record completed work units.
    pub fn done_work(&self, units: u64) {
        self.done.fetch_add(units, Ordering::Relaxed);
    }

    /// Stop the clock and return the measurement for the history store.
    pub fn finish(&self) -> PhaseStats {
        let _ = self.ended.set(Instant::now());
        PhaseStats {
            elapsed: self.elapsed(),
            units: self.done(),
        }
    }

    pub fn is_finished(&self) -> bool {
        if self.ended.get().is_some() {
            return true;
        }
        let children = self.children.lock().unwrap();
        !children.is_empty() && children.iter().all(|c| c.is_finished())
    }

    /// Wall time spent in this phase so far.
    pub fn elapsed(&self) -> Duration {
        match self.started.get() {
            None => Duration::ZERO,
            Some(started) => match self.ended.get() {
                Some(ended) => ended.duration_since(*started),
                None => started.elapsed(),
            },
        }
    }

    fn historical_rate(&self) -> Duration {
        self.history
            .map(|h| h.rate())
            .filter(|r| !r.is_zero())
            .unwrap_or(FALLBACK_RATE)
    }

    /// Estimated time to completion.
    pub fn eta(&self) -> Duration {
        {
            let children = self.children.lock().unwrap();
            if !children.is_empty() {
                return children.iter().map(|c| c.eta()).sum();
            }
        }

        if self.is_finished() {
            return Duration::ZERO;
        }
        let target = self.target.load(Ordering::Relaxed);
        let done = self.done.load(Ordering::Relaxed).min(target);
        let remaining = target - done;
        if remaining == 0 {
            return Duration::ZERO;
        }

        let historical = self.historical_rate();
        let rate = if !self.is_started() || done == 0 {
            historical
        } else {
            // trust the current run's rate in proportion to completion
            let p = done as f64 / target as f64;
            let current = self.elapsed().as_secs_f64() / done as f64;
            Duration::from_secs_f64(historical.as_secs_f64() * (1.0 - p) + current * p)
        };
        rate.mul_f64(remaining as f64)
    }

    /// Overall completion in `[0, 1]`.
    pub fn absolute_progress(&self) -> f64 {
        self.progress_in(0.0, 1.0)
    }

    /// Map this phase's progress into the `[start, end]` sub-range of its
    /// parent's range. Siblings split the range in proportion to their
    /// weights; a finished child contributes its full slice, and the first
    /// unfinished child owns the active slice recursively. Returns `start`
    /// for a phase that has not started and `end` for a finished one.
    pub fn progress_in(&self, start: f64, end: f64) -> f64 {
        if self.is_finished() {
            return end;
        }
        if !self.is_started() {
            return start;
        }
        let children = self.children.lock().unwrap();
        if children.is_empty() {
            let target = self.target.load(Ordering::Relaxed);
            if target == 0 {
                return start;
            }
            let done = self.done.load(Ordering::Relaxed).min(target);
            return start + (end - start) * done as f64 / target as f64;
        }

        let total: u64 = children.iter().map(|c| c.weight).sum::<u64>().max(1);
        let mut cursor = start;
        for child in children.iter() {
            let slice = (end - start) * child.weight as f64 / total as f64;
            if child.is_finished() {
                cursor += slice;
            } else {
                return child.progress_in(cursor, cursor + slice);
            }
        }
        end
    }

    /// Relative deviation of the current rate from the historical one.
    /// `0.5` means the run is 50% slower than last time. A phase that has
    /// not started or has no completed units yet reports the baseline
    /// deviation tripled, signalling low confidence in its ETA.
    pub fn deviation(&self) -> f64 {
        let done = self.done();
        if !self.is_started() || done == 0 {
            return BASELINE_DEVIATION * 3.0;
        }
        let historical = match self.history.map(|h| h.rate().as_secs_f64()) {
            Some(rate) if rate > 0.0 => rate,
            _ => return BASELINE_DEVIATION,
        };
        let current = self.elapsed().as_secs_f64() / done as f64;
        (current - historical) / historical
    }

    /// Snapshot the subtree for status reporting.
    pub fn snapshot(&self) -> PhaseSnapshot {
        let children: Vec<PhaseSnapshot> = self
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.snapshot())
            .collect();
        PhaseSnapshot {
            name: self.name.clone(),
            target: self.target(),
            done: self.done(),
            finished: self.is_finished(),
            progress: self.absolute_progress(),
            eta_ms: self.eta().as_millis() as u64,
            children,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unstarted_phase_uses_history() {
        let root = WorkPhase::root("run");
        let pages = root.add_child(
            "pages",
            100,
            Some(PhaseHistory {
                elapsed_ms: 1000,
                units: 100,
            }),
        );
        // 10ms per unit, 100 units
        assert_eq!(pages.eta(), Duration::from_secs(1));
    }

    #[test]
    fn test_unstarted_phase_without_history_falls_back() {
        let root = WorkPhase::root("run");
        let pages = root.add_child("pages", 200, None);
        assert_eq!(pages.eta(), Duration::from_millis(200));
    }

    #[test]
    fn test_finished_phase_has_zero_eta_and_full_progress() {
        let root = WorkPhase::root("run");
        let pages = root.add_child("pages", 10, None);
        pages.start();
        pages.done_work(10);
        pages.finish();
        assert_eq!(pages.eta(), Duration::ZERO);
        assert_eq!(pages.absolute_progress(), 1.0);
        assert!(root.is_finished());
    }

    #[test]
    fn test_container_sums_children() {
        let root = WorkPhase::root("run");
        root.add_child(
            "a",
            10,
            Some(PhaseHistory {
                elapsed_ms: 100,
                units: 10,
            }),
        );
        root.add_child(
            "b",
            10,
            Some(PhaseHistory {
                elapsed_ms: 200,
                units: 10,
            }),
        );
        assert_eq!(root.eta(), Duration::from_millis(300));
        assert_eq!(root.target(), 20);
    }

    #[test]
    fn test_child_start_propagates_to_root() {
        let root = WorkPhase::root("run");
        let partition = root.add_child("partition-1", 0, None);
        let pages = partition.add_child("pages", 5, None);
        pages.start();
        assert!(root.is_started());
        assert!(partition.is_started());
    }

    #[test]
    fn test_progress_splits_by_weight() {
        let root = WorkPhase::root("run");
        let big = root.add_weighted_child("big", 90, 90, None);
        let small = root.add_weighted_child("small", 10, 10, None);

        big.start();
        big.done_work(90);
        big.finish();
        assert!((root.absolute_progress() - 0.9).abs() < 1e-9);

        small.start();
        small.done_work(5);
        assert!((root.absolute_progress() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_progress_maps_children_into_weighted_sub_ranges() {
        // weights 1 and 3 over [0, 100]: the first child owns [0, 25],
        // the second [25, 100]
        let root = WorkPhase::root("run");
        let first = root.add_weighted_child("first", 1, 10, None);
        let second = root.add_weighted_child("second", 3, 10, None);

        assert_eq!(root.progress_in(0.0, 100.0), 0.0);

        first.start();
        first.done_work(5);
        assert!((root.progress_in(0.0, 100.0) - 12.5).abs() < 1e-9);

        first.done_work(5);
        first.finish();
        assert!((root.progress_in(0.0, 100.0) - 25.0).abs() < 1e-9);

        second.start();
        second.done_work(5);
        assert!((root.progress_in(0.0, 100.0) - 62.5).abs() < 1e-9);

        second.done_work(5);
        second.finish();
        assert_eq!(root.progress_in(0.0, 100.0), 100.0);
    }

    #[test]
    fn test_eta_trends_to_zero_as_done_approaches_target() {
        let root = WorkPhase::root("run");
        let pages = root.add_child(
            "pages",
            100,
            Some(PhaseHistory {
                elapsed_ms: 100_000,
                units: 100,
            }),
        );
        pages.start();
        let mut last = pages.eta();
        for _ in 0..10 {
            pages.done_work(10);
            let now = pages.eta();
            assert!(now <= last, "{now:?} should not exceed {last:?}");
            last = now;
        }
        // all units done, nothing left to estimate
        assert_eq!(pages.eta(), Duration::ZERO);
        pages.finish();
        assert_eq!(pages.eta(), Duration::ZERO);
    }

    #[test]
    fn test_blend_moves_toward_current_rate() {
        let root = WorkPhase::root("run");
        let pages = root.add_child(
            "pages",
            1000,
            Some(PhaseHistory {
                elapsed_ms: 1_000_000,
                units: 1000,
            }),
        );
        pages.start();
        let before = pages.eta();
        // the test finishes work far faster than the 1s/unit history, so
        // blending in the observed rate must shrink the estimate
        pages.done_work(500);
        let after = pages.eta();
        assert!(after < before, "{after:?} should be below {before:?}");
    }

    #[test]
    fn test_deviation_reports_slowdown_direction() {
        let root = WorkPhase::root("run");
        let pages = root.add_child(
            "pages",
            10,
            Some(PhaseHistory {
                elapsed_ms: 1_000_000,
                units: 10,
            }),
        );
        pages.start();
        pages.done_work(5);
        // current rate is near zero against a 100s/unit history
        assert!(pages.deviation() < 0.0);
    }

    #[test]
    fn test_deviation_triples_while_unstarted_or_idle() {
        let root = WorkPhase::root("run");
        let pages = root.add_child(
            "pages",
            10,
            Some(PhaseHistory {
                elapsed_ms: 1000,
                units: 10,
            }),
        );
        assert_eq!(pages.deviation(), BASELINE_DEVIATION * 3.0);
        pages.start();
        assert_eq!(pages.deviation(), BASELINE_DEVIATION * 3.0);
        pages.done_work(1);
        assert!(pages.deviation() < BASELINE_DEVIATION * 3.0);
    }

    #[test]
    fn test_snapshot_shape() {
        let root = WorkPhase::root("run");
        let partition = root.add_child("partition-1", 0, None);
        partition.add_child("pages", 5, None);

        let snap = root.snapshot();
        assert_eq!(snap.name, "run");
        assert_eq!(snap.children.len(), 1);
        assert_eq!(snap.children[0].children[0].target, 5);
        assert!(!snap.finished);
    }

    proptest! {
        #[test]
        fn progress_is_monotone_under_work(increments in prop::collection::vec(1u64..50, 1..20)) {
            let root = WorkPhase::root("run");
            let total: u64 = increments.iter().sum();
            let leaf = root.add_child("leaf", total, None);
            leaf.start();

            let mut last = root.absolute_progress();
            for inc in increments {
                leaf.done_work(inc);
                let now = root.absolute_progress();
                prop_assert!(now >= last);
                prop_assert!(now <= 1.0);
                last = now;
            }
            prop_assert!((last - 1.0).abs() < 1e-9);
        }
    }
}
