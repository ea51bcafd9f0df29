//! Optional run-time profiling, gated behind the `profile` feature.
//!
//! A value owned by the [`Graph`] rather than a process-wide singleton: a graph the host
//! creates for a test or a short-lived worker shouldn't contend on global profiler state with
//! every other graph in the process.

use std::collections::HashMap;
use std::time::Duration;

use crate::behavior::BehaviorId;

/// Accumulated timing data for behavior runs, keyed by behavior.
#[derive(Default)]
pub(crate) struct Profiler {
    enabled: bool,
    samples: HashMap<BehaviorId, BehaviorStats>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BehaviorStats {
    pub runs: u64,
    pub total: Duration,
    pub max: Duration,
}

impl Profiler {
    pub fn should_time(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, id: BehaviorId, elapsed: Duration) {
        let stats = self.samples.entry(id).or_default();
        stats.runs += 1;
        stats.total += elapsed;
        if elapsed > stats.max {
            stats.max = elapsed;
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn stats_for(&self, id: BehaviorId) -> Option<BehaviorStats> {
        self.samples.get(&id).copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
