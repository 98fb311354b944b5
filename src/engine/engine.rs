//! Public engine surface and its background drivers
//!
//! [`ThrottleEngine`] wraps the locked core with the three driver tasks:
//! the timer task that runs deferred dispatch rounds, the issue worker
//! that hands root-ready bios to the block layer outside the lock, and
//! the stats task that allocates counter blocks off the hot path.
//!
//! Drivers are optional: embedders without a runtime can pump the engine
//! by hand with [`ThrottleEngine::run_due_timers`],
//! [`ThrottleEngine::issue_ready`] and [`ThrottleEngine::pump_stats`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::block::{Bio, BioSubmitter, DeviceId, DeviceNumber, GroupId};
use crate::clock::Clock;
use crate::conf::{self, ConfFile, StatFile};
use crate::engine::config::EngineConfig;
use crate::engine::core::{Core, TimerFollowup};
use crate::engine::group::TgId;
use crate::engine::service_queue::SqRef;
use crate::engine::timer::TimerQueue;
use crate::error::{Result, ThrottleError};
use crate::stats::TgStats;

/// Hierarchical token-bucket throttler for block I/O
pub struct ThrottleEngine {
    core: Mutex<Core>,
    clock: Arc<dyn Clock>,
    timers: Arc<TimerQueue>,
    submitter: Arc<dyn BioSubmitter>,
    issue_tx: mpsc::UnboundedSender<DeviceId>,
    issue_rx: Mutex<Option<UnboundedReceiver<DeviceId>>>,
    stats_rx: Mutex<Option<UnboundedReceiver<TgId>>>,
    conf_retry_attempts: u32,
    conf_retry_backoff: Duration,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl ThrottleEngine {
    /// Create an engine.  Call [`Self::spawn_drivers`] from a runtime to
    /// start the background tasks, or pump it manually.
    pub fn new(
        cfg: EngineConfig,
        clock: Arc<dyn Clock>,
        submitter: Arc<dyn BioSubmitter>,
    ) -> Arc<Self> {
        let timers = Arc::new(TimerQueue::new());
        let (issue_tx, issue_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let conf_retry_attempts = cfg.conf_retry_attempts;
        let conf_retry_backoff = cfg.conf_retry_backoff;
        let core = Core::new(cfg, Arc::clone(&timers), stats_tx);
        Arc::new(Self {
            core: Mutex::new(core),
            clock,
            timers,
            submitter,
            issue_tx,
            issue_rx: Mutex::new(Some(issue_rx)),
            stats_rx: Mutex::new(Some(stats_rx)),
            conf_retry_attempts,
            conf_retry_backoff,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// Spawn the timer, issue and stats tasks on the current runtime
    pub fn spawn_drivers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(async move { engine.timer_worker().await }));

        if let Some(rx) = self.issue_rx.lock().take() {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move { engine.issue_worker(rx).await }));
        }
        if let Some(rx) = self.stats_rx.lock().take() {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move { engine.stats_worker(rx).await }));
        }
        handles
    }

    /// Stop the background tasks
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    // ========================================================================
    // Registration and lifecycle
    // ========================================================================

    /// Attach throttling to a device queue
    pub fn register_device(&self, number: DeviceNumber) -> Result<DeviceId> {
        self.core.lock().register_device(number)
    }

    /// Record a partition number so configuration can reject it
    pub fn register_partition(&self, number: DeviceNumber, of: DeviceId) -> Result<()> {
        self.core.lock().register_partition(number, of)
    }

    /// Register a control group, optionally under a parent
    pub fn register_group(&self, parent: Option<GroupId>) -> Result<GroupId> {
        self.core.lock().register_group(parent)
    }

    /// Toggle bypass mode; config writes back off while it is set
    pub fn set_device_bypass(&self, dev: DeviceId, on: bool) {
        self.core.lock().set_bypass(dev, on);
    }

    /// Force every bio held under `dev` out to the submitter, unthrottled
    pub async fn drain_device(&self, dev: DeviceId) -> Result<()> {
        let bios = {
            let mut core = self.core.lock();
            if !core.devices.contains_key(&dev) {
                return Err(ThrottleError::InvalidArgument("no such device".into()));
            }
            let now = self.clock.now();
            core.drain_device(dev, now)
        };
        for bio in bios {
            self.submitter.submit(bio).await;
        }
        Ok(())
    }

    /// Drain `dev` and tear down every record attached to it
    pub async fn exit_device(&self, dev: DeviceId) -> Result<()> {
        {
            let mut core = self.core.lock();
            if !core.devices.contains_key(&dev) {
                return Err(ThrottleError::InvalidArgument("no such device".into()));
            }
            core.set_dying(dev, true);
        }
        self.drain_device(dev).await?;
        self.core.lock().teardown_device(dev);
        Ok(())
    }

    /// Destroy a leaf group, releasing any bios it still held
    pub async fn remove_group(&self, group: GroupId) -> Result<()> {
        let (ready, issue) = {
            let mut core = self.core.lock();
            let now = self.clock.now();
            core.remove_group(group, now)?
        };
        for bio in ready {
            self.submitter.submit(bio).await;
        }
        for dev in issue {
            self.issue_ready(dev).await;
        }
        Ok(())
    }

    // ========================================================================
    // Bio entry
    // ========================================================================

    /// Route one bio.  `Ok(Some(bio))` hands it back for direct submission;
    /// `Ok(None)` means the engine kept it and will submit it later.
    pub fn throttle_bio(&self, group: GroupId, bio: Bio) -> Result<Option<Bio>> {
        let mut core = self.core.lock();
        let now = self.clock.now();
        core.throttle_bio(group, bio, now)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Apply one line written to a configuration file
    pub fn write_conf(&self, group: GroupId, file: ConfFile, line: &str) -> Result<()> {
        let mut attempts = self.conf_retry_attempts;
        loop {
            let res = self.try_write_conf(group, file, line);
            match res {
                Err(ThrottleError::Busy) if attempts > 0 => {
                    attempts -= 1;
                    std::thread::sleep(self.conf_retry_backoff);
                }
                other => return other,
            }
        }
    }

    fn try_write_conf(&self, group: GroupId, file: ConfFile, line: &str) -> Result<()> {
        let mut core = self.core.lock();
        let now = self.clock.now();
        if file.is_hybrid() {
            let parsed = conf::parse_hybrid_line(line)?;
            let dev = core.resolve_conf_device(parsed.number)?;
            Self::check_device_writable(&core, dev)?;
            core.set_fd_limit(
                group,
                dev,
                parsed.fd_id,
                file.lane(),
                file.kind(),
                parsed.value,
                now,
            )
        } else {
            let parsed = conf::parse_device_line(line)?;
            let dev = core.resolve_conf_device(parsed.number)?;
            Self::check_device_writable(&core, dev)?;
            core.set_device_limit(group, dev, file.lane(), file.kind(), parsed.value, now)
        }
    }

    fn check_device_writable(core: &Core, dev: DeviceId) -> Result<()> {
        let d = &core.devices[&dev];
        if d.dying {
            return Err(ThrottleError::DeviceDying);
        }
        if d.bypass {
            return Err(ThrottleError::Busy);
        }
        Ok(())
    }

    /// Read back a configuration file; non-configured fields yield nothing
    pub fn read_conf(&self, group: GroupId, file: ConfFile) -> Result<String> {
        let core = self.core.lock();
        if !core.groups.contains_key(&group) {
            return Err(ThrottleError::InvalidArgument("no such group".into()));
        }
        if file.is_hybrid() {
            // Hybrid files are write-only.
            return Ok(String::new());
        }
        core.format_limits(group, file.lane(), file.kind())
    }

    /// Read one of the cumulative statistics files
    pub fn read_stats(&self, group: GroupId, file: StatFile) -> Result<String> {
        let core = self.core.lock();
        core.format_stats(group, matches!(file, StatFile::IoServiceBytes))
    }

    // ========================================================================
    // Drivers
    // ========================================================================

    async fn timer_worker(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let now = self.clock.now();
            if let Some(entry) = self.timers.pop_due(now) {
                self.pending_timer_fired(entry.sq, entry.gen).await;
                continue;
            }
            let sleep_ms = self
                .timers
                .next_deadline()
                .map(|d| d.saturating_sub(now).max(1))
                .unwrap_or(60_000);
            tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                _ = self.timers.armed() => {}
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
        }
    }

    async fn issue_worker(self: Arc<Self>, mut rx: UnboundedReceiver<DeviceId>) {
        loop {
            tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                dev = rx.recv() => match dev {
                    None => break,
                    Some(dev) => self.issue_ready(dev).await,
                }
            }
        }
    }

    async fn stats_worker(self: Arc<Self>, mut rx: UnboundedReceiver<TgId>) {
        loop {
            tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                id = rx.recv() => match id {
                    None => break,
                    Some(id) => self.install_stats(id),
                }
            }
        }
    }

    fn install_stats(&self, id: TgId) {
        let block = Arc::new(TgStats::new());
        let mut core = self.core.lock();
        if let Some(tg) = core.tgs.get_mut(&id) {
            if tg.stats.is_none() {
                tg.stats = Some(block);
            }
        }
    }

    /// One timer shot: run dispatch rounds for the stage, then propagate
    /// upward or wake the issue worker
    async fn pending_timer_fired(&self, sq: SqRef, gen: u64) {
        {
            let mut core = self.core.lock();
            if !core.timer_fire_valid(sq, gen) {
                return;
            }
        }
        debug!(?sq, "pending timer fired");
        let mut sq = sq;
        loop {
            let mut dispatched = false;
            loop {
                let round = {
                    let mut core = self.core.lock();
                    let now = self.clock.now();
                    core.timer_round(sq, now)
                };
                if round.dispatched {
                    dispatched = true;
                }
                if round.done {
                    break;
                }
                // The dispatch window is still open; let others at the
                // lock and repeat.
                tokio::task::yield_now().await;
            }
            if !dispatched {
                return;
            }
            let followup = {
                let mut core = self.core.lock();
                let now = self.clock.now();
                core.timer_followup(sq, now)
            };
            match followup {
                TimerFollowup::Done => return,
                TimerFollowup::Continue(parent) => sq = parent,
                TimerFollowup::Issue(dev) => {
                    let _ = self.issue_tx.send(dev);
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Manual pumping (embedders without spawned drivers, and tests)
    // ========================================================================

    /// Fire every timer whose deadline has passed
    pub async fn run_due_timers(&self) {
        loop {
            let now = self.clock.now();
            let Some(entry) = self.timers.pop_due(now) else {
                break;
            };
            self.pending_timer_fired(entry.sq, entry.gen).await;
        }
    }

    /// Submit everything sitting ready on a device root
    pub async fn issue_ready(&self, dev: DeviceId) {
        let bios = {
            let mut core = self.core.lock();
            core.take_ready(dev)
        };
        for bio in bios {
            self.submitter.submit(bio).await;
        }
    }

    /// Allocate counter blocks for any groups still waiting on them
    pub fn pump_stats(&self) {
        let ids: Vec<TgId> = {
            let mut guard = self.stats_rx.lock();
            let Some(rx) = guard.as_mut() else { return };
            let mut ids = Vec::new();
            while let Ok(id) = rx.try_recv() {
                ids.push(id);
            }
            ids
        };
        for id in ids {
            self.install_stats(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Bio, IoDir};
    use crate::clock::ManualClock;
    use async_trait::async_trait;

    struct Collecting {
        bios: Mutex<Vec<Bio>>,
    }

    impl Collecting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                bios: Mutex::new(Vec::new()),
            })
        }

        fn ids(&self) -> Vec<u64> {
            self.bios.lock().iter().map(|b| b.id()).collect()
        }
    }

    #[async_trait]
    impl BioSubmitter for Collecting {
        async fn submit(&self, bio: Bio) {
            self.bios.lock().push(bio);
        }
    }

    fn setup() -> (Arc<ThrottleEngine>, Arc<ManualClock>, Arc<Collecting>) {
        let clock = Arc::new(ManualClock::default());
        let sink = Collecting::new();
        let engine = ThrottleEngine::new(
            EngineConfig::default(),
            clock.clone(),
            sink.clone(),
        );
        (engine, clock, sink)
    }

    #[tokio::test]
    async fn test_unlimited_bios_pass_through() {
        let (engine, _clock, _sink) = setup();
        let dev = engine.register_device(DeviceNumber::new(8, 0)).unwrap();
        let group = engine.register_group(None).unwrap();

        let bio = Bio::new(dev, IoDir::Read, 1 << 20);
        let back = engine.throttle_bio(group, bio).unwrap();
        assert!(back.is_some());
    }

    #[tokio::test]
    async fn test_limited_bio_is_held_and_released() {
        let (engine, clock, sink) = setup();
        let dev = engine.register_device(DeviceNumber::new(8, 0)).unwrap();
        let group = engine.register_group(None).unwrap();
        engine
            .write_conf(group, ConfFile::ReadBps, "8:0 1048576")
            .unwrap();

        // First slice allows ~104857 bytes: one 64 KiB bio passes, the
        // second is held.
        let a = engine
            .throttle_bio(group, Bio::new(dev, IoDir::Read, 65_536))
            .unwrap();
        assert!(a.is_some());
        let b = engine
            .throttle_bio(group, Bio::new(dev, IoDir::Read, 65_536))
            .unwrap();
        assert!(b.is_none());

        // Enough time for the next window to cover the second bio.
        clock.advance(300);
        engine.run_due_timers().await;
        let held_dev = dev;
        engine.issue_ready(held_dev).await;
        assert_eq!(sink.ids().len(), 1);
    }

    #[tokio::test]
    async fn test_conf_rejects_partition_and_unknown() {
        let (engine, _clock, _sink) = setup();
        let dev = engine.register_device(DeviceNumber::new(8, 0)).unwrap();
        engine
            .register_partition(DeviceNumber::new(8, 1), dev)
            .unwrap();
        let group = engine.register_group(None).unwrap();

        let err = engine
            .write_conf(group, ConfFile::ReadBps, "8:1 1000")
            .unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidArgument(_)));

        let err = engine
            .write_conf(group, ConfFile::ReadBps, "9:9 1000")
            .unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_busy_when_bypassing() {
        let clock = Arc::new(ManualClock::default());
        let sink = Collecting::new();
        let cfg = EngineConfig::default().with_conf_retry(2, Duration::from_millis(1));
        let engine = ThrottleEngine::new(cfg, clock.clone(), sink);
        let dev = engine.register_device(DeviceNumber::new(8, 0)).unwrap();
        let group = engine.register_group(None).unwrap();

        engine.set_device_bypass(dev, true);
        let err = engine
            .write_conf(group, ConfFile::ReadBps, "8:0 1000")
            .unwrap_err();
        assert!(matches!(err, ThrottleError::Busy));

        engine.set_device_bypass(dev, false);
        engine
            .write_conf(group, ConfFile::ReadBps, "8:0 1000")
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_conf_round_trip() {
        let (engine, _clock, _sink) = setup();
        let _dev = engine.register_device(DeviceNumber::new(8, 16)).unwrap();
        let group = engine.register_group(None).unwrap();

        assert_eq!(engine.read_conf(group, ConfFile::ReadBps).unwrap(), "");
        engine
            .write_conf(group, ConfFile::ReadBps, "8:16 1048576")
            .unwrap();
        assert_eq!(
            engine.read_conf(group, ConfFile::ReadBps).unwrap(),
            "8:16 1048576\n"
        );

        // Zero clears the field again.
        engine
            .write_conf(group, ConfFile::ReadBps, "8:16 0")
            .unwrap();
        assert_eq!(engine.read_conf(group, ConfFile::ReadBps).unwrap(), "");
    }

    #[tokio::test]
    async fn test_stats_accumulate_after_allocation() {
        let (engine, _clock, _sink) = setup();
        let dev = engine.register_device(DeviceNumber::new(8, 0)).unwrap();
        let group = engine.register_group(None).unwrap();
        engine
            .write_conf(group, ConfFile::ReadBps, "8:0 1048576")
            .unwrap();
        engine.pump_stats();

        let back = engine
            .throttle_bio(group, Bio::new(dev, IoDir::Read, 4096))
            .unwrap();
        assert!(back.is_some());

        let text = engine.read_stats(group, StatFile::IoServiceBytes).unwrap();
        assert!(text.contains("8:0 Read 4096"), "stats text: {:?}", text);
        let text = engine.read_stats(group, StatFile::IoServiced).unwrap();
        assert!(text.contains("8:0 Read 1"), "stats text: {:?}", text);
    }
}
