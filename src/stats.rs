//! Dispatch statistics
//!
//! Per-group byte and IO counters behind atomics.  The bio path must never
//! allocate, so counter blocks are handed out by a background task fed
//! through a request queue; a group whose block has not arrived yet simply
//! skips accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::IoDir;

/// Cumulative service counters for one throttle group
#[derive(Debug)]
pub struct TgStats {
    /// Bytes transferred, per direction
    service_bytes: [AtomicU64; IoDir::COUNT],
    /// Bios serviced, per direction
    serviced: [AtomicU64; IoDir::COUNT],
}

impl Default for TgStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TgStats {
    pub const fn new() -> Self {
        Self {
            service_bytes: [AtomicU64::new(0), AtomicU64::new(0)],
            serviced: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Record one serviced bio
    pub fn record(&self, dir: IoDir, bytes: u64) {
        self.service_bytes[dir as usize].fetch_add(bytes, Ordering::Relaxed);
        self.serviced[dir as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes transferred in `dir`
    pub fn bytes(&self, dir: IoDir) -> u64 {
        self.service_bytes[dir as usize].load(Ordering::Relaxed)
    }

    /// Bios serviced in `dir`
    pub fn ios(&self, dir: IoDir) -> u64 {
        self.serviced[dir as usize].load(Ordering::Relaxed)
    }

    /// Bytes across both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes(IoDir::Read) + self.bytes(IoDir::Write)
    }

    /// Bios across both directions
    pub fn total_ios(&self) -> u64 {
        self.ios(IoDir::Read) + self.ios(IoDir::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_totals() {
        let stats = TgStats::new();
        stats.record(IoDir::Read, 4096);
        stats.record(IoDir::Read, 4096);
        stats.record(IoDir::Write, 512);

        assert_eq!(stats.bytes(IoDir::Read), 8192);
        assert_eq!(stats.ios(IoDir::Read), 2);
        assert_eq!(stats.bytes(IoDir::Write), 512);
        assert_eq!(stats.total_bytes(), 8704);
        assert_eq!(stats.total_ios(), 3);
    }
}
