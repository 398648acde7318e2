//! Reporting utilities: run statistics and formatted terminal output.

pub mod format;

pub use format::*;

use crate::domain::{ChannelReport, ConvergenceStatus};

/// Channel counts for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    pub channels: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successful channels with at least one parameter left on a bound.
    pub with_pinned: usize,
}

pub fn run_stats(reports: &[ChannelReport]) -> RunStats {
    let mut stats = RunStats {
        channels: reports.len(),
        ..RunStats::default()
    };
    for r in reports {
        match r.status {
            ConvergenceStatus::Success => {
                stats.succeeded += 1;
                if r.stages.iter().any(|s| !s.pinned.is_empty()) {
                    stats.with_pinned += 1;
                }
            }
            ConvergenceStatus::Failed => stats.failed += 1,
        }
    }
    stats
}
