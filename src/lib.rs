//! blkthrottle - hierarchical token-bucket throttling for block I/O
//!
//! Features:
//! - Per-(group, device) bandwidth and IOPS limits over 100 ms credit slices
//! - A combined read+write lane composing with the per-direction limits
//! - Hierarchical dispatch: held bios climb the group tree stage by stage
//! - Fake devices: one shared budget spanning a chosen set of queues

pub mod block;
pub mod clock;
pub mod conf;
pub mod engine;
pub mod error;
pub mod stats;

pub use block::{Bio, BioSubmitter, DeviceId, DeviceNumber, GroupId, IoDir};
pub use clock::{Clock, ManualClock, MonotonicClock, Ticks, TICKS_PER_SEC};
pub use conf::{ConfFile, StatFile};
pub use engine::{EngineConfig, Lane, Limit, LimitKind, ThrottleEngine, Verdict};
pub use error::{Result, ThrottleError};
pub use stats::TgStats;
