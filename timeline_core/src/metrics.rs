use serde::Serialize;

/// Counters for one viewer session. Never reset by a run reset so the
/// totals cover the whole connection history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub frames_received: u64,
    pub steps_applied: u64,
    pub redeliveries: u64,
    pub divergent_redeliveries: u64,
    pub buffered_steps: u64,
    pub stale_dropped: u64,
    pub decode_errors: u64,
    pub unknown_kinds: u64,
    pub schema_drift: u64,
    pub step_timeouts: u64,
    pub step_retries: u64,
    pub commands_sent: u64,
    pub resets: u64,
}

impl SessionMetrics {
    pub fn frames_dropped(&self) -> u64 {
        self.stale_dropped + self.decode_errors + self.unknown_kinds
    }
}
