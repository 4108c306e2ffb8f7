//! Per-spawn state threaded from prepare through perform.

use std::time::{Duration, Instant, SystemTime};

use stagehand_shared::journey::Journey;

use crate::config::Config;
use crate::workdir::WorkDir;

/// Everything one spawn attempt accumulates between preparation and the
/// readiness verdict.
#[derive(Debug)]
pub(crate) struct HandshakeSession {
    pub config: Config,
    pub journey: Journey,
    pub work_dir: WorkDir,

    /// Identity the application process will run as (resolved by prepare,
    /// verified against the actual process on the smart path).
    pub uid: u32,
    pub gid: u32,

    /// Port the parent expects the application to bind, when readiness is
    /// detected by pinging.
    pub expected_start_port: Option<u16>,

    /// Remaining time budget in microseconds. Every blocking operation on
    /// the spawn path subtracts its observed elapsed time; zero means the
    /// spawn has timed out. The budget never increases.
    pub timeout_usec: u64,

    /// Globally unique process id assigned to this spawn.
    pub gupid: String,
    pub spawn_start_time: SystemTime,
    pub spawn_start_time_monotonic: Instant,

    /// Code revision inferred from the app root (or configured), reported
    /// in the result when the application does not claim one itself.
    pub code_revision: Option<String>,
}

impl HandshakeSession {
    /// Remaining budget as a `Duration`.
    pub fn remaining_timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_usec)
    }

    /// Subtracts the time elapsed since `began` from the budget.
    pub fn consume_budget(&mut self, began: Instant) {
        let elapsed = began.elapsed().as_micros() as u64;
        self.timeout_usec = self.timeout_usec.saturating_sub(elapsed);
    }

    /// Whether the budget is exhausted.
    pub fn timed_out(&self) -> bool {
        self.timeout_usec == 0
    }
}
