//! Locked engine state and the dispatch algorithms
//!
//! Everything reachable from a bio (devices, groups, throttle-group
//! records, fake devices) lives in [`Core`] behind the engine mutex.
//! Records reference each other by id, never by pointer, so parent links
//! and teardown stay simple.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

use crate::block::{Bio, DeviceId, DeviceNumber, GroupId, IoDir};
use crate::clock::Ticks;
use crate::engine::config::EngineConfig;
use crate::engine::fake_device::{FakeDevice, FdMember, FdRef};
use crate::engine::group::{TgId, ThrottleGroup};
use crate::engine::qnode::{Qnode, QnodeKind, QnodeRef};
use crate::engine::service_queue::{ServiceQueue, SqRef};
use crate::engine::timer::TimerQueue;
use crate::engine::{Lane, LimitKind, Verdict};
use crate::error::{Result, ThrottleError};

/// Per-device root state
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub number: DeviceNumber,
    pub root_sq: ServiceQueue,
    /// Bios held anywhere under this device, per direction
    pub nr_queued: [u64; IoDir::COUNT],
    /// Config writes back off and retry while set
    pub bypass: bool,
    /// Device is being torn down; config writes fail
    pub dying: bool,
    pub tg_by_group: HashMap<GroupId, TgId>,
}

/// Per-control-group state
#[derive(Debug)]
pub(crate) struct GroupState {
    pub parent: Option<GroupId>,
    pub children: Vec<GroupId>,
    pub tg_by_device: HashMap<DeviceId, TgId>,
    pub fds: Vec<FakeDevice>,
}

/// How a device number resolves
#[derive(Debug, Clone, Copy)]
pub(crate) enum Registered {
    Disk(DeviceId),
    Partition(DeviceId),
}

/// Outcome of one locked round of the timer handler
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerRound {
    pub dispatched: bool,
    pub done: bool,
}

/// What the timer handler should do after its dispatch loop
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerFollowup {
    /// Nothing further
    Done,
    /// The parent stage's window is open; keep dispatching there
    Continue(SqRef),
    /// Bios reached a device root; wake the issue worker
    Issue(DeviceId),
}

/// All mutable engine state, guarded by the engine mutex
pub(crate) struct Core {
    pub cfg: EngineConfig,
    pub devices: HashMap<DeviceId, DeviceState>,
    pub groups: HashMap<GroupId, GroupState>,
    pub tgs: HashMap<TgId, ThrottleGroup>,
    pub by_number: HashMap<DeviceNumber, Registered>,
    next_device: u64,
    next_group: u64,
    next_tg: u64,
    pub timers: Arc<TimerQueue>,
    pub stats_tx: UnboundedSender<TgId>,
}

impl Core {
    pub fn new(cfg: EngineConfig, timers: Arc<TimerQueue>, stats_tx: UnboundedSender<TgId>) -> Self {
        Self {
            cfg,
            devices: HashMap::new(),
            groups: HashMap::new(),
            tgs: HashMap::new(),
            by_number: HashMap::new(),
            next_device: 1,
            next_group: 1,
            next_tg: 1,
            timers,
            stats_tx,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register_device(&mut self, number: DeviceNumber) -> Result<DeviceId> {
        if self.by_number.contains_key(&number) {
            return Err(ThrottleError::InvalidArgument(format!(
                "device {} already registered",
                number
            )));
        }
        let id = DeviceId(self.next_device);
        self.next_device += 1;
        self.devices.insert(
            id,
            DeviceState {
                number,
                root_sq: ServiceQueue::new(None),
                nr_queued: [0; IoDir::COUNT],
                bypass: false,
                dying: false,
                tg_by_group: HashMap::new(),
            },
        );
        self.by_number.insert(number, Registered::Disk(id));
        info!(%number, "device registered");
        Ok(id)
    }

    pub fn register_partition(&mut self, number: DeviceNumber, of: DeviceId) -> Result<()> {
        if !self.devices.contains_key(&of) {
            return Err(ThrottleError::InvalidArgument("no such device".into()));
        }
        if self.by_number.contains_key(&number) {
            return Err(ThrottleError::InvalidArgument(format!(
                "device {} already registered",
                number
            )));
        }
        self.by_number.insert(number, Registered::Partition(of));
        Ok(())
    }

    pub fn register_group(&mut self, parent: Option<GroupId>) -> Result<GroupId> {
        if let Some(p) = parent {
            if !self.groups.contains_key(&p) {
                return Err(ThrottleError::InvalidArgument("no such parent group".into()));
            }
        }
        let id = GroupId(self.next_group);
        self.next_group += 1;
        self.groups.insert(
            id,
            GroupState {
                parent,
                children: Vec::new(),
                tg_by_device: HashMap::new(),
                fds: Vec::new(),
            },
        );
        if let Some(p) = parent {
            self.groups.get_mut(&p).unwrap().children.push(id);
        }
        Ok(id)
    }

    /// Resolve a device number to a whole-device id for configuration
    pub fn resolve_conf_device(&self, number: DeviceNumber) -> Result<DeviceId> {
        match self.by_number.get(&number) {
            Some(Registered::Disk(id)) => Ok(*id),
            Some(Registered::Partition(_)) => Err(ThrottleError::InvalidArgument(format!(
                "{} is a partition",
                number
            ))),
            None => Err(ThrottleError::InvalidArgument(format!(
                "no device {}",
                number
            ))),
        }
    }

    // ========================================================================
    // Record access
    // ========================================================================

    pub fn tg(&self, id: TgId) -> &ThrottleGroup {
        self.tgs.get(&id).expect("live throttle group")
    }

    pub fn tg_mut(&mut self, id: TgId) -> &mut ThrottleGroup {
        self.tgs.get_mut(&id).expect("live throttle group")
    }

    pub fn sq_exists(&self, sq: SqRef) -> bool {
        match sq {
            SqRef::Root(dev) => self.devices.contains_key(&dev),
            SqRef::Tg(tg) => self.tgs.contains_key(&tg),
        }
    }

    pub fn sq(&self, sq: SqRef) -> &ServiceQueue {
        match sq {
            SqRef::Root(dev) => &self.devices.get(&dev).expect("live device").root_sq,
            SqRef::Tg(tg) => &self.tg(tg).sq,
        }
    }

    pub fn sq_mut(&mut self, sq: SqRef) -> &mut ServiceQueue {
        match sq {
            SqRef::Root(dev) => &mut self.devices.get_mut(&dev).expect("live device").root_sq,
            SqRef::Tg(tg) => &mut self.tg_mut(tg).sq,
        }
    }

    fn alloc_tg_id(&mut self) -> Result<TgId> {
        if self.tgs.len() >= self.cfg.max_group_records {
            return Err(ThrottleError::NoMemory("throttle group records"));
        }
        let id = TgId(self.next_tg);
        self.next_tg += 1;
        Ok(id)
    }

    pub fn lookup_tg(&self, group: GroupId, dev: DeviceId) -> Option<TgId> {
        self.groups.get(&group)?.tg_by_device.get(&dev).copied()
    }

    /// Find or create the (group, device) record, creating ancestors first
    pub fn lookup_create_tg(&mut self, group: GroupId, dev: DeviceId) -> Result<TgId> {
        if let Some(id) = self.lookup_tg(group, dev) {
            return Ok(id);
        }
        let parent_group = self
            .groups
            .get(&group)
            .ok_or_else(|| ThrottleError::InvalidArgument("no such group".into()))?
            .parent;
        let parent_sq = if self.cfg.hierarchical {
            match parent_group {
                Some(pg) => SqRef::Tg(self.lookup_create_tg(pg, dev)?),
                None => SqRef::Root(dev),
            }
        } else {
            SqRef::Root(dev)
        };
        let id = self.alloc_tg_id()?;
        let mut tg = ThrottleGroup::new(id, group, Some(dev), Some(parent_sq));
        let parent_rules = match parent_sq {
            SqRef::Tg(p) => Some(self.tg(p).has_rules),
            SqRef::Root(_) => None,
        };
        tg.update_has_rules(parent_rules.as_ref());
        self.tgs.insert(id, tg);
        self.groups.get_mut(&group).unwrap().tg_by_device.insert(dev, id);
        self.devices.get_mut(&dev).unwrap().tg_by_group.insert(group, id);
        let _ = self.stats_tx.send(id);
        Ok(id)
    }

    // ========================================================================
    // Queued lists: round-robin over source qnodes
    // ========================================================================

    fn qnode_mut(&mut self, q: QnodeRef, dir: IoDir) -> &mut Qnode {
        let tg = self.tg_mut(q.tg);
        match q.kind {
            QnodeKind::OnSelf => &mut tg.qnode_on_self[dir as usize],
            QnodeKind::OnParent => &mut tg.qnode_on_parent[dir as usize],
        }
    }

    fn qnode_ref(&self, q: QnodeRef, dir: IoDir) -> &Qnode {
        let tg = self.tg(q.tg);
        match q.kind {
            QnodeKind::OnSelf => &tg.qnode_on_self[dir as usize],
            QnodeKind::OnParent => &tg.qnode_on_parent[dir as usize],
        }
    }

    /// Size of the head bio on the stage's queued list, if any
    pub fn peek_queued(&self, sq: SqRef, dir: IoDir) -> Option<u64> {
        let head = *self.sq(sq).queued[dir as usize].front()?;
        self.qnode_ref(head, dir).bios.front().map(|b| b.size())
    }

    /// Pop the head bio; empty qnodes unlink, non-empty ones rotate to the
    /// tail so sources take turns
    pub fn pop_queued(&mut self, sq: SqRef, dir: IoDir) -> Option<Bio> {
        let head = *self.sq(sq).queued[dir as usize].front()?;
        let qn = self.qnode_mut(head, dir);
        let bio = qn.bios.pop_front()?;
        let emptied = qn.bios.is_empty();
        if emptied {
            qn.linked = false;
        }
        let list = &mut self.sq_mut(sq).queued[dir as usize];
        let popped = list.pop_front().expect("head qnode ref");
        if !emptied {
            list.push_back(popped);
        }
        Some(bio)
    }

    /// Append a bio through `qref`, linking the qnode if it was idle
    fn add_bio_queued(&mut self, sq: SqRef, dir: IoDir, qref: QnodeRef, bio: Bio) {
        let qn = self.qnode_mut(qref, dir);
        qn.bios.push_back(bio);
        if !qn.linked {
            qn.linked = true;
            self.sq_mut(sq).queued[dir as usize].push_back(qref);
        }
    }

    // ========================================================================
    // Pending set management
    // ========================================================================

    pub fn enqueue_tg(&mut self, tg_id: TgId) {
        let (pending, disptime, parent) = {
            let tg = self.tg(tg_id);
            (tg.is_pending(), tg.disptime, tg.sq.parent_sq)
        };
        if pending {
            return;
        }
        let Some(parent) = parent else { return };
        let key = self.sq_mut(parent).insert_pending(disptime, tg_id);
        self.tg_mut(tg_id).pending_key = Some(key);
    }

    pub fn dequeue_tg(&mut self, tg_id: TgId) {
        let (key, parent) = {
            let tg = self.tg(tg_id);
            (tg.pending_key, tg.sq.parent_sq)
        };
        let (Some(key), Some(parent)) = (key, parent) else {
            return;
        };
        self.sq_mut(parent).remove_pending(key);
        self.tg_mut(tg_id).pending_key = None;
    }

    /// Queue a bio at `tg_id`, through `qn` when the bio arrives from a
    /// child stage and through the group's own qnode otherwise
    pub fn add_bio_tg(&mut self, bio: Bio, qn: Option<QnodeRef>, tg_id: TgId) {
        let dir = bio.dir();
        let qref = qn.unwrap_or(QnodeRef {
            tg: tg_id,
            kind: QnodeKind::OnSelf,
        });
        {
            let tg = self.tg_mut(tg_id);
            if tg.sq.nr_queued[dir as usize] == 0 {
                tg.was_empty = true;
            }
        }
        self.add_bio_queued(SqRef::Tg(tg_id), dir, qref, bio);
        self.tg_mut(tg_id).sq.nr_queued[dir as usize] += 1;
        self.enqueue_tg(tg_id);
    }

    /// Arm the stage timer for the first pending child, or report done
    ///
    /// Returns true when the caller should stop dispatching: no pending
    /// children, forced scheduling, or a first dispatch time in the future.
    /// False means the window is open and the caller may keep going.
    pub fn schedule_next_dispatch(&mut self, sq: SqRef, force: bool, now: Ticks) -> bool {
        let Some(first) = self.sq(sq).first_pending_disptime() else {
            return true;
        };
        if force || first > now {
            self.arm_pending_timer(sq, first);
            return true;
        }
        false
    }

    fn arm_pending_timer(&mut self, sq: SqRef, deadline: Ticks) {
        let timers = Arc::clone(&self.timers);
        let stage = self.sq_mut(sq);
        stage.timer_gen += 1;
        stage.timer_deadline = Some(deadline);
        let gen = stage.timer_gen;
        timers.arm(deadline, sq, gen);
        trace!(?sq, deadline, "pending timer armed");
    }

    /// Validate a timer shot against the stage's current arm generation
    pub fn timer_fire_valid(&mut self, sq: SqRef, gen: u64) -> bool {
        if !self.sq_exists(sq) {
            return false;
        }
        let stage = self.sq_mut(sq);
        if stage.timer_gen != gen {
            return false;
        }
        stage.timer_deadline = None;
        true
    }

    /// Recompute a group's dispatch tick from its head bios and re-key it
    pub fn tg_update_disptime(&mut self, tg_id: TgId, now: Ticks) {
        let slice = self.cfg.slice;
        let read = self.peek_queued(SqRef::Tg(tg_id), IoDir::Read);
        let write = self.peek_queued(SqRef::Tg(tg_id), IoDir::Write);

        let mut min_wait = Ticks::MAX;
        {
            let tg = self.tg_mut(tg_id);
            if let Some(size) = read {
                min_wait = min_wait.min(tg.may_dispatch(IoDir::Read, size, now, slice).wait());
            }
            if let Some(size) = write {
                min_wait = min_wait.min(tg.may_dispatch(IoDir::Write, size, now, slice).wait());
            }
        }
        let disptime = now + if min_wait == Ticks::MAX { 0 } else { min_wait };

        self.dequeue_tg(tg_id);
        self.tg_mut(tg_id).disptime = disptime;
        self.enqueue_tg(tg_id);
        self.tg_mut(tg_id).was_empty = false;
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn start_parent_slice_with_credit(
        &mut self,
        child: TgId,
        parent: TgId,
        lane: Lane,
        now: Ticks,
    ) {
        let slice = self.cfg.slice;
        let child_start = self.tg(child).slices[lane as usize].start;
        let p = self.tg_mut(parent);
        if p.slices[lane as usize].used(now) {
            p.slices[lane as usize].restart_with_credit(child_start, now, slice);
        }
    }

    /// Move one bio out of `tg_id` toward the device root
    pub fn tg_dispatch_one_bio(&mut self, tg_id: TgId, dir: IoDir, now: Ticks) {
        let slice = self.cfg.slice;
        let mut bio = self
            .pop_queued(SqRef::Tg(tg_id), dir)
            .expect("dispatching from a non-empty queue");
        self.tg_mut(tg_id).sq.nr_queued[dir as usize] -= 1;

        let fake = self.tg(tg_id).fake;
        match fake {
            Some(fd) => self.charge_fd_recursively(fd, &mut bio),
            None => self.tg_mut(tg_id).charge_bio(&mut bio),
        }

        let parent_sq = self
            .tg(tg_id)
            .sq
            .parent_sq
            .expect("dispatching group feeds a parent stage");
        match parent_sq {
            SqRef::Tg(parent) => {
                self.add_bio_tg(
                    bio,
                    Some(QnodeRef {
                        tg: tg_id,
                        kind: QnodeKind::OnParent,
                    }),
                    parent,
                );
                self.start_parent_slice_with_credit(tg_id, parent, Lane::of(dir), now);
                self.start_parent_slice_with_credit(tg_id, parent, Lane::Combined, now);
            }
            SqRef::Root(dev) => {
                let device = bio.device();
                self.add_bio_queued(
                    SqRef::Root(dev),
                    dir,
                    QnodeRef {
                        tg: tg_id,
                        kind: QnodeKind::OnParent,
                    },
                    bio,
                );
                self.sq_mut(SqRef::Root(dev)).nr_queued[dir as usize] += 1;
                let d = self.devices.get_mut(&device).expect("live device");
                d.nr_queued[dir as usize] = d.nr_queued[dir as usize].saturating_sub(1);
            }
        }

        let lane = Lane::of(dir);
        let has_rules = self.tg(tg_id).has_rules;
        match fake {
            Some(fd) => {
                if has_rules[lane as usize] {
                    self.trim_fd_lane(fd, lane, now);
                }
                if has_rules[Lane::Combined as usize] {
                    self.trim_fd_lane(fd, Lane::Combined, now);
                }
            }
            None => self.tg_mut(tg_id).trim_after_dispatch(dir, now, slice),
        }
    }

    /// One dispatch round for a group: up to the group quantum, reads
    /// before writes at a 3:1 budget, each direction stopping at the first
    /// bio that no longer fits
    pub fn dispatch_tg(&mut self, tg_id: TgId, now: Ticks) -> usize {
        let slice = self.cfg.slice;
        let max_reads = self.cfg.max_reads_per_round();
        let max_writes = self.cfg.max_writes_per_round();
        let mut nr_reads = 0;
        let mut nr_writes = 0;

        while let Some(size) = self.peek_queued(SqRef::Tg(tg_id), IoDir::Read) {
            if self.tg_mut(tg_id).may_dispatch(IoDir::Read, size, now, slice) != Verdict::Dispatch {
                break;
            }
            self.tg_dispatch_one_bio(tg_id, IoDir::Read, now);
            nr_reads += 1;
            if nr_reads >= max_reads {
                break;
            }
        }

        while let Some(size) = self.peek_queued(SqRef::Tg(tg_id), IoDir::Write) {
            if self.tg_mut(tg_id).may_dispatch(IoDir::Write, size, now, slice) != Verdict::Dispatch {
                break;
            }
            self.tg_dispatch_one_bio(tg_id, IoDir::Write, now);
            nr_writes += 1;
            if nr_writes >= max_writes {
                break;
            }
        }

        nr_reads + nr_writes
    }

    /// Pop due groups off a stage's pending set in disptime order and
    /// dispatch them, re-keying any that still hold bios
    pub fn select_dispatch(&mut self, sq: SqRef, now: Ticks) -> usize {
        let mut nr_disp = 0;
        loop {
            let Some(((disptime, _), tg_id)) = self.sq(sq).first_pending() else {
                break;
            };
            if disptime > now {
                break;
            }
            self.dequeue_tg(tg_id);
            nr_disp += self.dispatch_tg(tg_id, now);
            if self.tg(tg_id).sq.has_queued() {
                self.tg_update_disptime(tg_id, now);
            }
            if nr_disp >= self.cfg.total_quantum {
                break;
            }
        }
        if nr_disp > 0 {
            trace!(?sq, nr_disp, "dispatch round");
        }
        nr_disp
    }

    /// One locked round of the timer handler
    pub fn timer_round(&mut self, sq: SqRef, now: Ticks) -> TimerRound {
        if !self.sq_exists(sq) {
            return TimerRound {
                dispatched: false,
                done: true,
            };
        }
        let nr = self.select_dispatch(sq, now);
        let done = self.schedule_next_dispatch(sq, false, now);
        TimerRound {
            dispatched: nr > 0,
            done,
        }
    }

    /// Upward propagation once a stage's dispatch loop has finished
    pub fn timer_followup(&mut self, sq: SqRef, now: Ticks) -> TimerFollowup {
        match sq {
            SqRef::Root(dev) => TimerFollowup::Issue(dev),
            SqRef::Tg(tg_id) => {
                if !self.tgs.contains_key(&tg_id) {
                    return TimerFollowup::Done;
                }
                if self.tg(tg_id).was_empty {
                    self.tg_update_disptime(tg_id, now);
                    let parent = self
                        .tg(tg_id)
                        .sq
                        .parent_sq
                        .expect("group stage feeds a parent");
                    if !self.schedule_next_dispatch(parent, false, now) {
                        return TimerFollowup::Continue(parent);
                    }
                }
                TimerFollowup::Done
            }
        }
    }

    /// Pop every ready bio off a device root for issuing
    pub fn take_ready(&mut self, dev: DeviceId) -> Vec<Bio> {
        let mut out = Vec::new();
        if !self.devices.contains_key(&dev) {
            return out;
        }
        for dir in IoDir::both() {
            while let Some(bio) = self.pop_queued(SqRef::Root(dev), dir) {
                let stage = self.sq_mut(SqRef::Root(dev));
                stage.nr_queued[dir as usize] = stage.nr_queued[dir as usize].saturating_sub(1);
                out.push(bio);
            }
        }
        out
    }

    // ========================================================================
    // Bio entry
    // ========================================================================

    /// Route one bio through the physical group chain and any fake devices
    ///
    /// Returns the bio when the caller should submit it; `None` when the
    /// engine kept it.
    pub fn throttle_bio(&mut self, group: GroupId, mut bio: Bio, now: Ticks) -> Result<Option<Bio>> {
        // Charged on a previous pass; let it through untouched.
        if bio.throttled {
            bio.throttled = false;
            return Ok(Some(bio));
        }

        let dev = bio.device();
        let dir = bio.dir();
        let lane = Lane::of(dir) as usize;
        let comb = Lane::Combined as usize;

        if !self.groups.contains_key(&group) {
            return Err(ThrottleError::InvalidArgument("no such group".into()));
        }
        if !self.devices.contains_key(&dev) {
            return Err(ThrottleError::InvalidArgument("no such device".into()));
        }

        // Fast path: no rules anywhere on this bio's path.
        if let Some(tg_id) = self.lookup_tg(group, dev) {
            let rules = self.tg(tg_id).has_rules;
            if !rules[lane] && !rules[comb] {
                let fd_limited = self.groups[&group].fds.iter().any(|fd| {
                    fd.contains(dev) && {
                        let h = self.tg(fd.header);
                        h.has_rules[lane] || h.has_rules[comb]
                    }
                });
                if !fd_limited {
                    self.tg(tg_id).record_stats(dir, bio.size());
                    return Ok(Some(bio));
                }
            }
        }

        let slice = self.cfg.slice;
        // Bio submission must not fail: if the record arena is full the
        // bio passes through unthrottled instead of surfacing an error.
        // NoMemory is reserved for configuration writes.
        let mut tg_id = match self.lookup_create_tg(group, dev) {
            Ok(id) => id,
            Err(ThrottleError::NoMemory(_)) => {
                warn!("record arena exhausted, bio passes unthrottled");
                return Ok(Some(bio));
            }
            Err(e) => return Err(e),
        };
        let mut qn: Option<QnodeRef> = None;
        let mut queue_at: Option<TgId> = None;

        loop {
            // FIFO: anything already waiting at this level goes first.
            if self.tg(tg_id).sq.nr_queued[dir as usize] > 0 {
                queue_at = Some(tg_id);
                break;
            }
            match self.tg_mut(tg_id).may_dispatch(dir, bio.size(), now, slice) {
                Verdict::Delay(_) => {
                    queue_at = Some(tg_id);
                    break;
                }
                Verdict::Dispatch => {
                    self.tg_mut(tg_id).charge_bio(&mut bio);
                    // Trim even though nothing queued, or a slack period
                    // would bank credit against a later, lower limit.
                    self.tg_mut(tg_id).trim_after_dispatch(dir, now, slice);
                    qn = Some(QnodeRef {
                        tg: tg_id,
                        kind: QnodeKind::OnParent,
                    });
                    match self.tg(tg_id).sq.parent_sq {
                        Some(SqRef::Tg(p)) => tg_id = p,
                        _ => break,
                    }
                }
            }
        }

        if let Some(queue_tg) = queue_at {
            debug!(
                dir = %dir,
                size = bio.size(),
                queued_r = self.tg(queue_tg).sq.nr_queued[0],
                queued_w = self.tg(queue_tg).sq.nr_queued[1],
                "bio held"
            );
            self.devices.get_mut(&dev).unwrap().nr_queued[dir as usize] += 1;
            self.add_bio_tg(bio, qn, queue_tg);
            if self.tg(queue_tg).was_empty {
                self.tg_update_disptime(queue_tg, now);
                let parent = self
                    .tg(queue_tg)
                    .sq
                    .parent_sq
                    .expect("queued group feeds a parent");
                self.schedule_next_dispatch(parent, true, now);
            }
            // Held behind the physical gate: fake devices only see this
            // bio if it clears the physical axis and reaches them.
            return Ok(None);
        }

        // Physical axis passed; evaluate each fake device spanning this queue.
        let fd_count = self.groups[&group].fds.len();
        for index in 0..fd_count {
            let fdref = FdRef { group, index };
            self.update_fd_queuenr(fdref);
            let (member, limited) = {
                let fd = &self.groups[&group].fds[index];
                let h = self.tg(fd.header);
                (
                    fd.member_for(dev),
                    h.has_rules[lane] || h.has_rules[comb],
                )
            };
            let Some(member) = member else { continue };
            if !limited {
                continue;
            }

            let over = self.tg(member).sq.nr_queued[dir as usize] > 0
                || matches!(
                    self.tg_mut(member).may_dispatch(dir, bio.size(), now, slice),
                    Verdict::Delay(_)
                );
            if !over {
                self.charge_fd_recursively(fdref, &mut bio);
                let rules = self.tg(member).has_rules;
                if rules[lane] {
                    self.trim_fd_lane(fdref, Lane::of(dir), now);
                }
                if rules[comb] {
                    self.trim_fd_lane(fdref, Lane::Combined, now);
                }
                continue;
            }

            debug!(dir = %dir, size = bio.size(), "bio held by fake device");
            self.devices.get_mut(&dev).unwrap().nr_queued[dir as usize] += 1;
            self.add_bio_fd_member(fdref, member, bio, dir);
            self.fd_update_disptime_recursively(fdref, now);
            self.schedule_next_dispatch(SqRef::Root(dev), true, now);
            return Ok(None);
        }

        bio.throttled = false;
        Ok(Some(bio))
    }

    // ========================================================================
    // Fake devices
    // ========================================================================

    fn fd(&self, fd: FdRef) -> &FakeDevice {
        &self.groups[&fd.group].fds[fd.index]
    }

    /// Header first, then every member
    fn fd_tg_ids(&self, fd: FdRef) -> Vec<TgId> {
        let fd = self.fd(fd);
        let mut ids = Vec::with_capacity(fd.members.len() + 1);
        ids.push(fd.header);
        ids.extend(fd.members.iter().map(|m| m.tg));
        ids
    }

    /// Charge a bio to the header and every member.  Any member's traffic
    /// drains the shared budget, not only the queue that carried the bio.
    pub fn charge_fd_recursively(&mut self, fd: FdRef, bio: &mut Bio) {
        for id in self.fd_tg_ids(fd) {
            self.tg_mut(id).charge_bio(bio);
        }
    }

    fn trim_fd_lane(&mut self, fd: FdRef, lane: Lane, now: Ticks) {
        let slice = self.cfg.slice;
        for id in self.fd_tg_ids(fd) {
            let tg = self.tg_mut(id);
            let limit = tg.limits[lane as usize];
            tg.slices[lane as usize].trim(&limit, now, slice);
        }
    }

    /// Queue a bio at a member group, keeping the header aggregate in step
    fn add_bio_fd_member(&mut self, fd: FdRef, member: TgId, bio: Bio, dir: IoDir) {
        let header = self.fd(fd).header;
        if self.tg(header).sq.nr_queued[dir as usize] == 0 {
            self.tg_mut(header).was_empty = true;
        }
        self.add_bio_queued(
            SqRef::Tg(member),
            dir,
            QnodeRef {
                tg: member,
                kind: QnodeKind::OnSelf,
            },
            bio,
        );
        self.tg_mut(member).sq.nr_queued[dir as usize] += 1;
        self.tg_mut(header).sq.nr_queued[dir as usize] += 1;
        self.enqueue_tg(member);
    }

    /// Recompute the header's queued aggregate from the members
    ///
    /// A dispatcher may have drained members since the header was last
    /// updated, so the count only ever clamps downward.
    pub fn update_fd_queuenr(&mut self, fd: FdRef) {
        let header = self.fd(fd).header;
        for dir in IoDir::both() {
            let total: u64 = self
                .fd(fd)
                .members
                .iter()
                .map(|m| self.tg(m.tg).sq.nr_queued[dir as usize])
                .sum();
            let h = self.tg_mut(header);
            if total <= h.sq.nr_queued[dir as usize] {
                h.sq.nr_queued[dir as usize] = total;
            } else {
                warn!(
                    total,
                    recorded = h.sq.nr_queued[dir as usize],
                    "member queue total exceeds header aggregate"
                );
            }
        }
    }

    /// Give the header and every queued member one shared dispatch tick
    pub fn fd_update_disptime_recursively(&mut self, fd: FdRef, now: Ticks) {
        let slice = self.cfg.slice;
        let members: Vec<TgId> = self.fd(fd).members.iter().map(|m| m.tg).collect();
        let header = self.fd(fd).header;

        let mut min_wait = Ticks::MAX;
        for &m in &members {
            for dir in IoDir::both() {
                if let Some(size) = self.peek_queued(SqRef::Tg(m), dir) {
                    let wait = self.tg_mut(m).may_dispatch(dir, size, now, slice).wait();
                    min_wait = min_wait.min(wait);
                }
            }
        }
        let disptime = now + if min_wait == Ticks::MAX { 0 } else { min_wait };

        {
            let h = self.tg_mut(header);
            h.disptime = disptime;
            h.was_empty = false;
        }
        for m in members {
            if self.tg(m).sq.has_queued() || self.tg(m).is_pending() {
                self.dequeue_tg(m);
                self.tg_mut(m).disptime = disptime;
                self.enqueue_tg(m);
            } else {
                self.tg_mut(m).disptime = disptime;
            }
            self.tg_mut(m).was_empty = false;
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Apply one per-device limit and refresh everything it influences
    pub fn set_device_limit(
        &mut self,
        group: GroupId,
        dev: DeviceId,
        lane: Lane,
        kind: LimitKind,
        value: Option<u64>,
        now: Ticks,
    ) -> Result<()> {
        let slice = self.cfg.slice;
        let tg_id = self.lookup_create_tg(group, dev)?;
        {
            let tg = self.tg_mut(tg_id);
            match kind {
                LimitKind::Bps => tg.limits[lane as usize].bps = value,
                LimitKind::Iops => tg.limits[lane as usize].iops = value,
            }
        }
        self.update_has_rules_subtree(group, dev);

        // Restart all lanes so consumption under the old limit cannot be
        // held against the new one.
        self.tg_mut(tg_id).start_new_slices(now, slice);

        if self.tg(tg_id).is_pending() {
            self.tg_update_disptime(tg_id, now);
            let parent = self
                .tg(tg_id)
                .sq
                .parent_sq
                .expect("pending group feeds a parent");
            self.schedule_next_dispatch(parent, true, now);
        }
        info!(?lane, ?kind, ?value, "device limit updated");
        Ok(())
    }

    /// Recompute `has_rules` across the subtree below `group` on `dev`,
    /// parents before children
    pub fn update_has_rules_subtree(&mut self, group: GroupId, dev: DeviceId) {
        let mut stack = vec![group];
        while let Some(g) = stack.pop() {
            if let Some(&tg_id) = self.groups[&g].tg_by_device.get(&dev) {
                let parent_rules = match self.tg(tg_id).sq.parent_sq {
                    Some(SqRef::Tg(p)) => Some(self.tg(p).has_rules),
                    _ => None,
                };
                self.tg_mut(tg_id).update_has_rules(parent_rules.as_ref());
            }
            stack.extend(self.groups[&g].children.iter().copied());
        }
    }

    /// Apply one fake-device limit, adding the device as a member if new
    pub fn set_fd_limit(
        &mut self,
        group: GroupId,
        dev: DeviceId,
        fd_id: u64,
        lane: Lane,
        kind: LimitKind,
        value: Option<u64>,
        now: Ticks,
    ) -> Result<()> {
        let slice = self.cfg.slice;
        if !self.groups.contains_key(&group) {
            return Err(ThrottleError::InvalidArgument("no such group".into()));
        }

        let index = match self.groups[&group].fds.iter().position(|f| f.id == fd_id) {
            Some(i) => i,
            None => {
                let header = self.alloc_tg_id()?;
                let index = self.groups[&group].fds.len();
                let mut tg = ThrottleGroup::new(header, group, None, None);
                tg.fake = Some(FdRef { group, index });
                self.tgs.insert(header, tg);
                self.groups
                    .get_mut(&group)
                    .unwrap()
                    .fds
                    .push(FakeDevice::new(fd_id, header));
                let _ = self.stats_tx.send(header);
                index
            }
        };
        let fdref = FdRef { group, index };

        if self.fd(fdref).member_for(dev).is_none() {
            let member = self.alloc_tg_id()?;
            let mut tg = ThrottleGroup::new(member, group, Some(dev), Some(SqRef::Root(dev)));
            tg.fake = Some(fdref);
            self.tgs.insert(member, tg);
            self.groups.get_mut(&group).unwrap().fds[index]
                .members
                .push(FdMember {
                    device: dev,
                    tg: member,
                });
            let _ = self.stats_tx.send(member);
        }

        let header = self.fd(fdref).header;
        {
            let h = self.tg_mut(header);
            match kind {
                LimitKind::Bps => h.limits[lane as usize].bps = value,
                LimitKind::Iops => h.limits[lane as usize].iops = value,
            }
        }
        self.fd_update_rules_recursively(fdref);

        for id in self.fd_tg_ids(fdref) {
            self.tg_mut(id).start_new_slices(now, slice);
        }

        let any_pending = self
            .fd(fdref)
            .members
            .iter()
            .any(|m| self.tg(m.tg).is_pending());
        if any_pending {
            self.fd_update_disptime_recursively(fdref, now);
            let pending_devs: Vec<DeviceId> = self
                .fd(fdref)
                .members
                .iter()
                .filter(|m| self.tg(m.tg).is_pending())
                .map(|m| m.device)
                .collect();
            for d in pending_devs {
                self.schedule_next_dispatch(SqRef::Root(d), true, now);
            }
        }
        info!(fd_id, ?lane, ?kind, ?value, "fake device limit updated");
        Ok(())
    }

    /// Copy header limits onto every member and refresh all rule flags
    fn fd_update_rules_recursively(&mut self, fd: FdRef) {
        let header = self.fd(fd).header;
        let limits = self.tg(header).limits;
        self.tg_mut(header).update_has_rules(None);
        let members: Vec<TgId> = self.fd(fd).members.iter().map(|m| m.tg).collect();
        for m in members {
            let tg = self.tg_mut(m);
            tg.limits = limits;
            tg.update_has_rules(None);
        }
    }

    /// Configured value for one (lane, kind), formatted per device
    pub fn format_limits(&self, group: GroupId, lane: Lane, kind: LimitKind) -> Result<String> {
        let gstate = self
            .groups
            .get(&group)
            .ok_or_else(|| ThrottleError::InvalidArgument("no such group".into()))?;
        let mut lines: Vec<(DeviceNumber, u64)> = Vec::new();
        for (&dev, &tg_id) in &gstate.tg_by_device {
            let limit = self.tg(tg_id).limits[lane as usize];
            let value = match kind {
                LimitKind::Bps => limit.bps,
                LimitKind::Iops => limit.iops,
            };
            if let Some(v) = value {
                lines.push((self.devices[&dev].number, v));
            }
        }
        lines.sort_by_key(|(n, _)| (n.major, n.minor));
        Ok(lines
            .into_iter()
            .map(|(n, v)| format!("{} {}\n", n, v))
            .collect())
    }

    /// Cumulative stats for every device the group touches
    pub fn format_stats(&self, group: GroupId, bytes: bool) -> Result<String> {
        let gstate = self
            .groups
            .get(&group)
            .ok_or_else(|| ThrottleError::InvalidArgument("no such group".into()))?;
        let mut rows: Vec<(DeviceNumber, u64, u64)> = Vec::new();
        for (&dev, &tg_id) in &gstate.tg_by_device {
            if let Some(stats) = &self.tg(tg_id).stats {
                let (r, w) = if bytes {
                    (stats.bytes(IoDir::Read), stats.bytes(IoDir::Write))
                } else {
                    (stats.ios(IoDir::Read), stats.ios(IoDir::Write))
                };
                rows.push((self.devices[&dev].number, r, w));
            }
        }
        rows.sort_by_key(|(n, _, _)| (n.major, n.minor));
        let mut out = String::new();
        for (n, r, w) in rows {
            out.push_str(&format!(
                "{} Read {}\n{} Write {}\n{} Total {}\n",
                n,
                r,
                n,
                w,
                n,
                r + w
            ));
        }
        Ok(out)
    }

    // ========================================================================
    // Drain and teardown
    // ========================================================================

    /// Force every queued bio under `dev` up to the root and take them
    pub fn drain_device(&mut self, dev: DeviceId, now: Ticks) -> Vec<Bio> {
        // Children before parents so bios climb one level per pass.
        for tg_id in self.device_tgs_postorder(dev) {
            self.sq_drain(SqRef::Tg(tg_id), now);
        }
        self.sq_drain(SqRef::Root(dev), now);

        let ready = self.take_ready(dev);
        info!(count = ready.len(), "device drained");
        ready
    }

    /// Dispatch every bio of every pending child of `sq`
    fn sq_drain(&mut self, sq: SqRef, now: Ticks) {
        while let Some((_, tg_id)) = self.sq(sq).first_pending() {
            self.dequeue_tg(tg_id);
            for dir in IoDir::both() {
                while self.peek_queued(SqRef::Tg(tg_id), dir).is_some() {
                    self.tg_dispatch_one_bio(tg_id, dir, now);
                }
            }
        }
    }

    /// Regular (non fake-device) groups on `dev`, children before parents
    fn device_tgs_postorder(&self, dev: DeviceId) -> Vec<TgId> {
        let roots: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, g)| g.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::new();
        // Two-phase stack walk for post-order without recursion.
        let mut stack: Vec<(GroupId, bool)> = roots.into_iter().map(|g| (g, false)).collect();
        while let Some((g, visited)) = stack.pop() {
            if visited {
                if let Some(&tg) = self.groups[&g].tg_by_device.get(&dev) {
                    out.push(tg);
                }
            } else {
                stack.push((g, true));
                for &c in &self.groups[&g].children {
                    stack.push((c, false));
                }
            }
        }
        out
    }

    /// Remove all state for `dev`.  The device must already be drained.
    pub fn teardown_device(&mut self, dev: DeviceId) {
        let Some(dstate) = self.devices.remove(&dev) else {
            return;
        };
        self.by_number.retain(|_, reg| {
            let id = match reg {
                Registered::Disk(id) | Registered::Partition(id) => *id,
            };
            id != dev
        });
        for (group, tg_id) in dstate.tg_by_group {
            if let Some(g) = self.groups.get_mut(&group) {
                g.tg_by_device.remove(&dev);
            }
            self.tgs.remove(&tg_id);
        }
        // Fake-device members on this queue go with it.
        for gstate in self.groups.values_mut() {
            for fd in &mut gstate.fds {
                if let Some(pos) = fd.members.iter().position(|m| m.device == dev) {
                    let member = fd.members.remove(pos);
                    self.tgs.remove(&member.tg);
                }
            }
        }
        info!(?dev, "device removed");
    }

    pub fn set_bypass(&mut self, dev: DeviceId, on: bool) {
        if let Some(d) = self.devices.get_mut(&dev) {
            d.bypass = on;
        }
    }

    pub fn set_dying(&mut self, dev: DeviceId, on: bool) {
        if let Some(d) = self.devices.get_mut(&dev) {
            d.dying = on;
        }
    }

    /// Detach and destroy a leaf group, pushing any held bios upward.
    /// Returns ready bios that detached from dying records and must be
    /// issued by the caller, plus the devices whose roots still hold work.
    pub fn remove_group(&mut self, group: GroupId, now: Ticks) -> Result<(Vec<Bio>, Vec<DeviceId>)> {
        let gstate = self
            .groups
            .get(&group)
            .ok_or_else(|| ThrottleError::InvalidArgument("no such group".into()))?;
        if !gstate.children.is_empty() {
            return Err(ThrottleError::InvalidArgument(
                "group still has children".into(),
            ));
        }

        let mut issue: Vec<DeviceId> = Vec::new();
        let mut ready: Vec<Bio> = Vec::new();
        let tg_list: Vec<(DeviceId, TgId)> = gstate
            .tg_by_device
            .iter()
            .map(|(&d, &t)| (d, t))
            .collect();
        let fd_list: Vec<FdRef> = (0..gstate.fds.len())
            .map(|index| FdRef { group, index })
            .collect();

        for &(dev, tg_id) in &tg_list {
            self.evict_tg(tg_id, now, &mut issue, &mut ready);
            self.devices.get_mut(&dev).unwrap().tg_by_group.remove(&group);
            self.tgs.remove(&tg_id);
        }
        for fdref in fd_list {
            let members: Vec<TgId> = self.fd(fdref).members.iter().map(|m| m.tg).collect();
            let header = self.fd(fdref).header;
            for m in members {
                self.evict_tg(m, now, &mut issue, &mut ready);
                self.tgs.remove(&m);
            }
            self.tgs.remove(&header);
        }

        let parent = self.groups[&group].parent;
        if let Some(p) = parent {
            if let Some(pg) = self.groups.get_mut(&p) {
                pg.children.retain(|&c| c != group);
            }
        }
        self.groups.remove(&group);

        issue.sort_by_key(|d| d.0);
        issue.dedup();
        Ok((ready, issue))
    }

    /// Push a group's bios to its parent and unhook its qnodes everywhere
    fn evict_tg(
        &mut self,
        tg_id: TgId,
        now: Ticks,
        issue: &mut Vec<DeviceId>,
        ready: &mut Vec<Bio>,
    ) {
        self.dequeue_tg(tg_id);
        for dir in IoDir::both() {
            while self.peek_queued(SqRef::Tg(tg_id), dir).is_some() {
                self.tg_dispatch_one_bio(tg_id, dir, now);
            }
        }
        let parent_sq = self.tg(tg_id).sq.parent_sq;
        match parent_sq {
            Some(SqRef::Tg(parent)) => {
                // Bios this group pushed upstream move into the parent's
                // own qnode so nothing references the dying record.
                for dir in IoDir::both() {
                    self.migrate_qnode(tg_id, parent, dir);
                }
                if self.tg(parent).was_empty {
                    self.tg_update_disptime(parent, now);
                    let up = self
                        .tg(parent)
                        .sq
                        .parent_sq
                        .expect("group stage feeds a parent");
                    self.schedule_next_dispatch(up, true, now);
                }
            }
            Some(SqRef::Root(dev)) => {
                // Ready bios on the root detach from the dying qnode and
                // go straight to the caller for issuing.
                let qref = QnodeRef {
                    tg: tg_id,
                    kind: QnodeKind::OnParent,
                };
                for dir in IoDir::both() {
                    let bios: Vec<Bio> = {
                        let qn = self.qnode_mut(qref, dir);
                        if !qn.linked {
                            continue;
                        }
                        qn.linked = false;
                        qn.bios.drain(..).collect()
                    };
                    let stage = self.sq_mut(SqRef::Root(dev));
                    stage.queued[dir as usize].retain(|q| *q != qref);
                    stage.nr_queued[dir as usize] =
                        stage.nr_queued[dir as usize].saturating_sub(bios.len() as u64);
                    ready.extend(bios);
                }
                if self.sq(SqRef::Root(dev)).has_queued() {
                    issue.push(dev);
                }
            }
            None => {}
        }
    }

    /// Move the bios `child` queued at `parent` into the parent's own qnode
    fn migrate_qnode(&mut self, child: TgId, parent: TgId, dir: IoDir) {
        let qref = QnodeRef {
            tg: child,
            kind: QnodeKind::OnParent,
        };
        let bios: Vec<Bio> = {
            let qn = self.qnode_mut(qref, dir);
            if !qn.linked && qn.bios.is_empty() {
                return;
            }
            qn.linked = false;
            qn.bios.drain(..).collect()
        };
        self.sq_mut(SqRef::Tg(parent)).queued[dir as usize].retain(|q| *q != qref);
        for bio in bios {
            let own = QnodeRef {
                tg: parent,
                kind: QnodeKind::OnSelf,
            };
            self.add_bio_queued(SqRef::Tg(parent), dir, own, bio);
        }
    }
}
