use tracing::info;

use crate::common::Cost;

/// Per-solve counters, logged after a successful solve.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub costs: Cost,
    pub time_us: u128,
    pub low_level_expanded: usize,
    pub high_level_expanded: usize,
    pub merges: usize,
}

impl Stats {
    pub fn log(&self, solver: &str) {
        info!(
            "{solver}: cost {:?} time(us) {:?} high level expansions {:?} low level expansions {:?} merges {:?}",
            self.costs, self.time_us, self.high_level_expanded, self.low_level_expanded, self.merges
        );
    }
}
