//! Engine configuration

use std::time::Duration;

use crate::clock::Ticks;

/// Credit accounting window length (100 ms)
pub const DEFAULT_SLICE: Ticks = 100;

/// Max bios dispatched from one group per round
pub const DEFAULT_GRP_QUANTUM: usize = 8;

/// Max bios dispatched from all groups in one service-queue round
pub const DEFAULT_TOTAL_QUANTUM: usize = 32;

/// Default attempts before a bypassing device turns a config write into Busy
pub const DEFAULT_CONF_RETRY_ATTEMPTS: u32 = 20;

/// Default sleep between config-write retries
pub const DEFAULT_CONF_RETRY_BACKOFF_MS: u64 = 10;

/// Default cap on live throttle-group records
pub const DEFAULT_MAX_GROUP_RECORDS: usize = 65_536;

/// Configuration for the throttling engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Accounting slice width in ticks
    pub slice: Ticks,

    /// Per-group dispatch quantum; reads get 3/4 of it, writes the rest
    pub grp_quantum: usize,

    /// Per-round dispatch cap across all groups of one service queue
    pub total_quantum: usize,

    /// Parent groups limit their whole subtree.  When off, every group is
    /// treated as a direct child of the device root.
    pub hierarchical: bool,

    /// Config-write retries while a device is bypassing
    pub conf_retry_attempts: u32,

    /// Sleep between config-write retries
    pub conf_retry_backoff: Duration,

    /// Cap on live throttle-group records before creation reports NoMemory
    pub max_group_records: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slice: DEFAULT_SLICE,
            grp_quantum: DEFAULT_GRP_QUANTUM,
            total_quantum: DEFAULT_TOTAL_QUANTUM,
            hierarchical: true,
            conf_retry_attempts: DEFAULT_CONF_RETRY_ATTEMPTS,
            conf_retry_backoff: Duration::from_millis(DEFAULT_CONF_RETRY_BACKOFF_MS),
            max_group_records: DEFAULT_MAX_GROUP_RECORDS,
        }
    }
}

impl EngineConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accounting slice width
    pub fn with_slice(mut self, slice: Ticks) -> Self {
        self.slice = slice.max(1);
        self
    }

    /// Set the per-group dispatch quantum
    pub fn with_grp_quantum(mut self, quantum: usize) -> Self {
        self.grp_quantum = quantum.max(1);
        self
    }

    /// Set the per-round total dispatch cap
    pub fn with_total_quantum(mut self, quantum: usize) -> Self {
        self.total_quantum = quantum.max(1);
        self
    }

    /// Enable or disable hierarchical limiting
    pub fn with_hierarchical(mut self, on: bool) -> Self {
        self.hierarchical = on;
        self
    }

    /// Set the config-write retry budget
    pub fn with_conf_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.conf_retry_attempts = attempts;
        self.conf_retry_backoff = backoff;
        self
    }

    /// Set the cap on live throttle-group records
    pub fn with_max_group_records(mut self, max: usize) -> Self {
        self.max_group_records = max;
        self
    }

    /// Read share of the per-group quantum
    pub fn max_reads_per_round(&self) -> usize {
        (self.grp_quantum * 3 / 4).max(1)
    }

    /// Write share of the per-group quantum
    pub fn max_writes_per_round(&self) -> usize {
        (self.grp_quantum - self.max_reads_per_round()).max(1)
    }
}
