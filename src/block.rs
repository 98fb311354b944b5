//! Block-layer boundary types
//!
//! The engine consumes I/O requests ("bios") and hands the ones it held back
//! to a [`BioSubmitter`] once they become dispatchable.  Everything the
//! engine needs to know about the block layer crosses through this module.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::ThrottleError;

/// Device number in `major:minor` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl DeviceNumber {
    /// Create a device number
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for DeviceNumber {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| ThrottleError::InvalidArgument(format!("bad device number {:?}", s)))?;
        let parse = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| ThrottleError::InvalidArgument(format!("bad device number {:?}", s)))
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

/// Direction of a bio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum IoDir {
    /// Read from the device
    Read = 0,
    /// Write to the device
    Write = 1,
}

impl IoDir {
    /// Number of directions
    pub const COUNT: usize = 2;

    /// Both directions, reads first
    pub const fn both() -> [IoDir; 2] {
        [IoDir::Read, IoDir::Write]
    }
}

impl fmt::Display for IoDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDir::Read => write!(f, "R"),
            IoDir::Write => write!(f, "W"),
        }
    }
}

/// Opaque handle to a registered device queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u64);

/// Opaque handle to a registered control group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) u64);

/// Atomic counter for generating unique bio IDs
static BIO_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One I/O request unit
///
/// A bio is owned by the caller until [`crate::ThrottleEngine::throttle_bio`]
/// keeps it; held bios come back through the [`BioSubmitter`].
#[derive(Debug)]
pub struct Bio {
    id: u64,
    device: DeviceId,
    dir: IoDir,
    size: u64,
    /// Set when the bio is first charged so a second pass through the
    /// engine sees it exactly once.
    pub(crate) throttled: bool,
}

impl Bio {
    /// Create a bio headed for `device`
    pub fn new(device: DeviceId, dir: IoDir, size: u64) -> Self {
        Self {
            id: BIO_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            device,
            dir,
            size,
            throttled: false,
        }
    }

    /// Unique id, monotonic in creation order
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target device queue
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// I/O direction
    pub fn dir(&self) -> IoDir {
        self.dir
    }

    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this bio has already been charged by the engine
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }
}

/// Downstream submission point for bios the engine held back
///
/// Implementations hand the bio to the block layer (or whatever stands in
/// for it).  Called outside the engine lock.
#[async_trait]
pub trait BioSubmitter: Send + Sync {
    /// Issue a ready bio
    async fn submit(&self, bio: Bio);
}
