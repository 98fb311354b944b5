//! Fake devices
//!
//! A fake device is a group-owned logical device that puts one shared
//! budget over a chosen set of physical queues.  The header group carries
//! the user-configured limits; each member pairs a physical queue with its
//! own throttle group whose limits are copies of the header's.

use crate::block::{DeviceId, GroupId};
use crate::engine::group::TgId;

/// Back-reference from a throttle group to the fake device that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdRef {
    /// Owning control group
    pub group: GroupId,
    /// Index into the group's fake-device list
    pub index: usize,
}

/// One member queue of a fake device
#[derive(Debug, Clone, Copy)]
pub struct FdMember {
    pub device: DeviceId,
    pub tg: TgId,
}

/// Group-owned logical device spanning several physical queues
#[derive(Debug)]
pub struct FakeDevice {
    /// Group-scoped numeric id chosen by the user
    pub id: u64,
    /// Header group holding the configured limits; accounting only, never
    /// part of any dispatch stage
    pub header: TgId,
    /// Member queues, each with its own throttle group
    pub members: Vec<FdMember>,
}

impl FakeDevice {
    pub fn new(id: u64, header: TgId) -> Self {
        Self {
            id,
            header,
            members: Vec::new(),
        }
    }

    /// Whether `device` is one of the members
    pub fn contains(&self, device: DeviceId) -> bool {
        self.members.iter().any(|m| m.device == device)
    }

    /// Member group for `device`, if it is a member
    pub fn member_for(&self, device: DeviceId) -> Option<TgId> {
        self.members
            .iter()
            .find(|m| m.device == device)
            .map(|m| m.tg)
    }
}
