//! Throttle groups
//!
//! A throttle group is the throttled unit: the record for one
//! (group, device) pair, or for one fake-device header or member.  It owns
//! a credit slice per limit lane, the qnodes it queues bios through, and a
//! sub-queue feeding its parent stage.

use std::sync::Arc;

use crate::block::{Bio, DeviceId, GroupId, IoDir};
use crate::clock::Ticks;
use crate::engine::fake_device::FdRef;
use crate::engine::qnode::Qnode;
use crate::engine::service_queue::{PendingKey, ServiceQueue, SqRef};
use crate::engine::slice::LaneSlice;
use crate::engine::{Lane, Limit, Verdict};
use crate::stats::TgStats;

/// Opaque handle to a throttle group record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TgId(pub(crate) u64);

/// One throttled unit
#[derive(Debug)]
pub(crate) struct ThrottleGroup {
    pub id: TgId,
    pub group: GroupId,
    /// Physical device, none for fake-device headers
    pub device: Option<DeviceId>,
    /// Per-lane limits; `None` components are unlimited
    pub limits: [Limit; Lane::COUNT],
    /// Per-lane credit windows
    pub slices: [LaneSlice; Lane::COUNT],
    /// True when this group or an ancestor carries a finite limit
    pub has_rules: [bool; Lane::COUNT],
    /// Sub-queue this group dispatches out of
    pub sq: ServiceQueue,
    /// FIFO for bios queued at this group directly
    pub qnode_on_self: [Qnode; IoDir::COUNT],
    /// FIFO for bios this group pushes to its parent stage
    pub qnode_on_parent: [Qnode; IoDir::COUNT],
    /// Next eligible dispatch tick
    pub disptime: Ticks,
    /// Present while linked into the parent's pending set
    pub pending_key: Option<PendingKey>,
    /// Queue went from empty to non-empty; forces a disptime recompute
    pub was_empty: bool,
    /// Set on fake-device headers and members
    pub fake: Option<FdRef>,
    /// Lazily allocated counters; accounting is skipped until they arrive
    pub stats: Option<Arc<TgStats>>,
}

impl ThrottleGroup {
    pub fn new(id: TgId, group: GroupId, device: Option<DeviceId>, parent_sq: Option<SqRef>) -> Self {
        Self {
            id,
            group,
            device,
            limits: [Limit::default(); Lane::COUNT],
            slices: [LaneSlice::default(); Lane::COUNT],
            has_rules: [false; Lane::COUNT],
            sq: ServiceQueue::new(parent_sq),
            qnode_on_self: [Qnode::new(), Qnode::new()],
            qnode_on_parent: [Qnode::new(), Qnode::new()],
            disptime: 0,
            pending_key: None,
            was_empty: false,
            fake: None,
            stats: None,
        }
    }

    /// Whether this group sits in its parent's pending set
    pub fn is_pending(&self) -> bool {
        self.pending_key.is_some()
    }

    /// Whether the group itself carries a finite limit on `lane`
    pub fn own_rules(&self, lane: Lane) -> bool {
        !self.limits[lane as usize].is_unlimited()
    }

    /// Recompute `has_rules` from the parent's flags and own limits
    pub fn update_has_rules(&mut self, parent_rules: Option<&[bool; Lane::COUNT]>) {
        for lane in Lane::all() {
            let inherited = parent_rules.map(|r| r[lane as usize]).unwrap_or(false);
            self.has_rules[lane as usize] = inherited || self.own_rules(lane);
        }
    }

    /// Token-bucket check for one bio of `size` bytes in direction `dir`
    ///
    /// Checks the direction's own lane and the combined lane; the bio must
    /// fit both, and component waits compose as the maximum.  On rejection
    /// both lanes' windows are stretched to cover the wait.
    pub fn may_dispatch(&mut self, dir: IoDir, size: u64, now: Ticks, slice: Ticks) -> Verdict {
        let lane = Lane::of(dir) as usize;
        let comb = Lane::Combined as usize;
        let own = self.limits[lane];
        let combined = self.limits[comb];

        if own.is_unlimited() && combined.is_unlimited() {
            return Verdict::Dispatch;
        }

        self.slices[lane].renew(now, slice);
        self.slices[comb].renew(now, slice);

        let mut bps_wait: Ticks = 0;
        let mut iops_wait: Ticks = 0;

        if let Some(bps) = own.bps {
            bps_wait = self.slices[lane].bps_wait(bps, size, now, slice);
        }
        if let Some(bps) = combined.bps {
            bps_wait = bps_wait.max(self.slices[comb].bps_wait(bps, size, now, slice));
        }
        if let Some(iops) = own.iops {
            iops_wait = self.slices[lane].iops_wait(iops, now, slice);
        }
        if let Some(iops) = combined.iops {
            iops_wait = iops_wait.max(self.slices[comb].iops_wait(iops, now, slice));
        }

        if bps_wait == 0 && iops_wait == 0 {
            return Verdict::Dispatch;
        }

        let max_wait = bps_wait.max(iops_wait);
        for l in [lane, comb] {
            if self.slices[l].end < now + max_wait {
                self.slices[l].extend(now + max_wait, slice);
            }
        }
        Verdict::Delay(max_wait)
    }

    /// Charge a dispatched bio to this group's counters
    ///
    /// Both the direction lane and the combined lane are charged.  The bio
    /// is marked on its first charge so a later pass through the engine
    /// sees it only once, and stats record it exactly once.
    pub fn charge_bio(&mut self, bio: &mut Bio) {
        let lane = Lane::of(bio.dir()) as usize;
        let comb = Lane::Combined as usize;
        let size = bio.size();

        self.slices[lane].bytes_disp += size;
        self.slices[lane].io_disp += 1;
        self.slices[comb].bytes_disp += size;
        self.slices[comb].io_disp += 1;

        if !bio.throttled {
            bio.throttled = true;
            self.record_stats(bio.dir(), size);
        }
    }

    /// Record a serviced bio, skipping silently while stats are unallocated
    pub fn record_stats(&self, dir: IoDir, bytes: u64) {
        if let Some(stats) = &self.stats {
            stats.record(dir, bytes);
        }
    }

    /// Trim the lanes this group has rules for after a dispatch
    pub fn trim_after_dispatch(&mut self, dir: IoDir, now: Ticks, slice: Ticks) {
        let lane = Lane::of(dir) as usize;
        let comb = Lane::Combined as usize;
        if self.has_rules[lane] {
            let limit = self.limits[lane];
            self.slices[lane].trim(&limit, now, slice);
        }
        if self.has_rules[comb] {
            let limit = self.limits[comb];
            self.slices[comb].trim(&limit, now, slice);
        }
    }

    /// Restart every lane's window, dropping accumulated consumption
    pub fn start_new_slices(&mut self, now: Ticks, slice: Ticks) {
        for lane in Lane::all() {
            self.slices[lane as usize].restart(now, slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;
    const SLICE: Ticks = 100;

    fn tg() -> ThrottleGroup {
        let mut tg = ThrottleGroup::new(TgId(1), GroupId(1), Some(DeviceId(1)), None);
        tg.start_new_slices(0, SLICE);
        tg
    }

    #[test]
    fn test_unlimited_fast_path() {
        let mut tg = tg();
        assert_eq!(tg.may_dispatch(IoDir::Read, u64::MAX, 0, SLICE), Verdict::Dispatch);
    }

    #[test]
    fn test_bps_delays_when_over() {
        let mut tg = tg();
        tg.limits[Lane::Read as usize].bps = Some(MIB);

        assert_eq!(tg.may_dispatch(IoDir::Read, 65_536, 0, SLICE), Verdict::Dispatch);
        // Writes are untouched by a read-lane limit.
        assert_eq!(tg.may_dispatch(IoDir::Write, MIB, 0, SLICE), Verdict::Dispatch);

        let mut bio = Bio::new(DeviceId(1), IoDir::Read, 65_536);
        tg.charge_bio(&mut bio);
        match tg.may_dispatch(IoDir::Read, 65_536, 0, SLICE) {
            Verdict::Delay(w) => assert!(w > 0),
            Verdict::Dispatch => panic!("expected delay"),
        }
    }

    #[test]
    fn test_combined_lane_counts_both_directions() {
        let mut tg = tg();
        tg.limits[Lane::Combined as usize].bps = Some(MIB);

        let mut read = Bio::new(DeviceId(1), IoDir::Read, 60_000);
        tg.charge_bio(&mut read);
        let mut write = Bio::new(DeviceId(1), IoDir::Write, 60_000);
        tg.charge_bio(&mut write);

        assert_eq!(tg.slices[Lane::Combined as usize].bytes_disp, 120_000);
        // Over the first-window allowance of ~104857 bytes in either direction.
        assert!(matches!(
            tg.may_dispatch(IoDir::Read, 1, 0, SLICE),
            Verdict::Delay(_)
        ));
        assert!(matches!(
            tg.may_dispatch(IoDir::Write, 1, 0, SLICE),
            Verdict::Delay(_)
        ));
    }

    #[test]
    fn test_waits_compose_as_max() {
        let mut tg = tg();
        tg.limits[Lane::Write as usize].bps = Some(MIB);
        tg.limits[Lane::Write as usize].iops = Some(4);

        let mut bio = Bio::new(DeviceId(1), IoDir::Write, 512 * 1024);
        tg.charge_bio(&mut bio);

        // Recompute both component waits by hand and check the max wins.
        let bps_wait = tg.slices[Lane::Write as usize].bps_wait(MIB, 512 * 1024, 0, SLICE);
        let iops_wait = tg.slices[Lane::Write as usize].iops_wait(4, 0, SLICE);
        match tg.may_dispatch(IoDir::Write, 512 * 1024, 0, SLICE) {
            Verdict::Delay(w) => assert_eq!(w, bps_wait.max(iops_wait)),
            Verdict::Dispatch => panic!("expected delay"),
        }
    }

    #[test]
    fn test_charge_marks_once() {
        let mut tg = tg();
        let mut bio = Bio::new(DeviceId(1), IoDir::Read, 100);
        assert!(!bio.is_throttled());
        tg.charge_bio(&mut bio);
        assert!(bio.is_throttled());
        tg.charge_bio(&mut bio);
        assert_eq!(tg.slices[Lane::Read as usize].io_disp, 2);
    }

    #[test]
    fn test_has_rules_inherits() {
        let mut tg = tg();
        tg.update_has_rules(None);
        assert_eq!(tg.has_rules, [false; 3]);

        tg.limits[Lane::Read as usize].iops = Some(10);
        tg.update_has_rules(None);
        assert_eq!(tg.has_rules, [true, false, false]);

        let parent_rules = [false, true, false];
        tg.update_has_rules(Some(&parent_rules));
        assert_eq!(tg.has_rules, [true, true, false]);
    }
}
