//! Per-lane credit slices
//!
//! Each throttle group tracks one [`LaneSlice`] per limit lane.  A slice is
//! a fixed-width accounting window: consumption counters accumulate while
//! the window is live and whole unused widths are reclaimed by
//! [`LaneSlice::trim`] so slack periods cannot bank unbounded credit.

use crate::clock::{Ticks, TICKS_PER_SEC};
use crate::engine::Limit;

/// Round `v` up to a multiple of `step`
fn round_up(v: Ticks, step: Ticks) -> Ticks {
    v.div_ceil(step) * step
}

/// `a * b / c` without intermediate overflow
fn mul_div(a: u64, b: u64, c: u64) -> u64 {
    ((a as u128) * (b as u128) / (c as u128)).min(u64::MAX as u128) as u64
}

/// Credit window for one limit lane
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneSlice {
    /// Window start tick
    pub start: Ticks,
    /// Window end tick
    pub end: Ticks,
    /// Bytes dispatched since `start`
    pub bytes_disp: u64,
    /// Bios dispatched since `start`
    pub io_disp: u64,
}

impl LaneSlice {
    /// Whether the window no longer covers `now`
    pub fn used(&self, now: Ticks) -> bool {
        !(self.start <= now && now <= self.end)
    }

    /// Start a fresh window at `now`
    pub fn restart(&mut self, now: Ticks, slice: Ticks) {
        self.bytes_disp = 0;
        self.io_disp = 0;
        self.start = now;
        self.end = now + slice;
    }

    /// Start a fresh window, keeping credit back to `start_hint` when the
    /// previous window already covered it
    pub fn restart_with_credit(&mut self, start_hint: Ticks, now: Ticks, slice: Ticks) {
        self.bytes_disp = 0;
        self.io_disp = 0;
        if start_hint >= self.start {
            self.start = start_hint;
        }
        self.end = now + slice;
    }

    /// Push the window end out to cover `until`, rounded up to a whole slice
    pub fn extend(&mut self, until: Ticks, slice: Ticks) {
        self.end = round_up(until, slice);
    }

    /// Renew an expired window, or make sure a live one reaches `now + slice`
    pub fn renew(&mut self, now: Ticks, slice: Ticks) {
        if self.used(now) {
            self.restart(now, slice);
        } else if self.end < now + slice {
            self.extend(now + slice, slice);
        }
    }

    /// Elapsed window time, rounded up to whole slices with a one-slice floor
    fn elapsed_rounded(&self, now: Ticks, slice: Ticks) -> (Ticks, Ticks) {
        let elapsed = now.saturating_sub(self.start);
        let rounded = round_up(if elapsed == 0 { slice } else { elapsed }, slice);
        (elapsed, rounded)
    }

    /// Ticks to wait before `size` more bytes fit under `bps`; 0 fits now
    pub fn bps_wait(&self, bps: u64, size: u64, now: Ticks, slice: Ticks) -> Ticks {
        let (elapsed, rounded) = self.elapsed_rounded(now, slice);
        let allowed = mul_div(bps, rounded, TICKS_PER_SEC);

        if self.bytes_disp + size <= allowed {
            return 0;
        }

        let extra = self.bytes_disp + size - allowed;
        let wait = mul_div(extra, TICKS_PER_SEC, bps).max(1);
        // The allowance was computed against the rounded-up window; give the
        // rounding back as extra wait.
        wait + (rounded - elapsed)
    }

    /// Ticks to wait before one more bio fits under `iops`; 0 fits now
    pub fn iops_wait(&self, iops: u64, now: Ticks, slice: Ticks) -> Ticks {
        let (elapsed, rounded) = self.elapsed_rounded(now, slice);
        let allowed = mul_div(iops, rounded, TICKS_PER_SEC);

        if self.io_disp + 1 <= allowed {
            return 0;
        }

        let wait = mul_div(self.io_disp + 1, TICKS_PER_SEC, iops) + 1;
        if wait > elapsed {
            wait - elapsed
        } else {
            1
        }
    }

    /// Reclaim whole unused slice widths
    ///
    /// Subtracts the credit the limit would have granted over `n` completed
    /// slices and advances the window start past them.  An unlimited
    /// component clears its counter outright.
    pub fn trim(&mut self, limit: &Limit, now: Ticks, slice: Ticks) {
        debug_assert!(self.end >= self.start);

        // Expired windows renew on the next check instead.
        if self.used(now) {
            return;
        }

        // A limit bump may have left a far-future end behind; pull it back
        // so new windows can start.
        self.end = round_up(now + slice, slice);

        let elapsed = now - self.start;
        let nr_slices = elapsed / slice;
        if nr_slices == 0 {
            return;
        }

        let bytes_trim = match limit.bps {
            Some(bps) => mul_div(bps, slice * nr_slices, TICKS_PER_SEC),
            None => u64::MAX,
        };
        let io_trim = match limit.iops {
            Some(iops) => mul_div(iops, slice * nr_slices, TICKS_PER_SEC),
            None => u64::MAX,
        };
        if bytes_trim == 0 && io_trim == 0 {
            return;
        }

        self.bytes_disp = self.bytes_disp.saturating_sub(bytes_trim);
        self.io_disp = self.io_disp.saturating_sub(io_trim);
        self.start += nr_slices * slice;
    }
}
