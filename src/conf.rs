//! Configuration file surface
//!
//! Each control group exposes a small set of text files.  Writes carry one
//! line per device: `MAJOR:MINOR VALUE` for per-device limits and
//! `MAJOR:MINOR FD_ID VALUE` for fake-device limits.  A value of zero
//! clears the limit.

use crate::block::DeviceNumber;
use crate::engine::{Lane, LimitKind};
use crate::error::{Result, ThrottleError};

/// Writable configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfFile {
    ReadBps,
    WriteBps,
    RwBps,
    ReadIops,
    WriteIops,
    RwIops,
    HybridReadBps,
    HybridWriteBps,
}

impl ConfFile {
    /// The file name as exposed to users
    pub fn name(&self) -> &'static str {
        match self {
            ConfFile::ReadBps => "throttle.read_bps_device",
            ConfFile::WriteBps => "throttle.write_bps_device",
            ConfFile::RwBps => "throttle.rw_bps_device",
            ConfFile::ReadIops => "throttle.read_iops_device",
            ConfFile::WriteIops => "throttle.write_iops_device",
            ConfFile::RwIops => "throttle.rw_iops_device",
            ConfFile::HybridReadBps => "throttle.hybrid_read_bps_device",
            ConfFile::HybridWriteBps => "throttle.hybrid_write_bps_device",
        }
    }

    /// Limit lane this file configures
    pub fn lane(&self) -> Lane {
        match self {
            ConfFile::ReadBps | ConfFile::ReadIops | ConfFile::HybridReadBps => Lane::Read,
            ConfFile::WriteBps | ConfFile::WriteIops | ConfFile::HybridWriteBps => Lane::Write,
            ConfFile::RwBps | ConfFile::RwIops => Lane::Combined,
        }
    }

    /// Limit component this file configures
    pub fn kind(&self) -> LimitKind {
        match self {
            ConfFile::ReadBps
            | ConfFile::WriteBps
            | ConfFile::RwBps
            | ConfFile::HybridReadBps
            | ConfFile::HybridWriteBps => LimitKind::Bps,
            ConfFile::ReadIops | ConfFile::WriteIops | ConfFile::RwIops => LimitKind::Iops,
        }
    }

    /// Whether the file targets a fake device
    pub fn is_hybrid(&self) -> bool {
        matches!(self, ConfFile::HybridReadBps | ConfFile::HybridWriteBps)
    }
}

/// Read-only statistics files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatFile {
    IoServiceBytes,
    IoServiced,
}

impl StatFile {
    pub fn name(&self) -> &'static str {
        match self {
            StatFile::IoServiceBytes => "throttle.io_service_bytes",
            StatFile::IoServiced => "throttle.io_serviced",
        }
    }
}

/// Parsed `MAJOR:MINOR VALUE` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLine {
    pub number: DeviceNumber,
    /// `None` clears the limit
    pub value: Option<u64>,
}

/// Parsed `MAJOR:MINOR FD_ID VALUE` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridLine {
    pub number: DeviceNumber,
    pub fd_id: u64,
    /// `None` clears the limit
    pub value: Option<u64>,
}

fn parse_value(s: &str) -> Result<Option<u64>> {
    let v = s
        .parse::<u64>()
        .map_err(|_| ThrottleError::InvalidArgument(format!("bad value {:?}", s)))?;
    Ok(if v == 0 { None } else { Some(v) })
}

/// Parse one per-device limit line
pub fn parse_device_line(line: &str) -> Result<DeviceLine> {
    let mut fields = line.split_whitespace();
    let number = fields
        .next()
        .ok_or_else(|| ThrottleError::InvalidArgument("empty line".into()))?
        .parse::<DeviceNumber>()?;
    let value = parse_value(
        fields
            .next()
            .ok_or_else(|| ThrottleError::InvalidArgument("missing value".into()))?,
    )?;
    if fields.next().is_some() {
        return Err(ThrottleError::InvalidArgument(format!(
            "trailing input in {:?}",
            line
        )));
    }
    Ok(DeviceLine { number, value })
}

/// Parse one fake-device limit line
pub fn parse_hybrid_line(line: &str) -> Result<HybridLine> {
    let mut fields = line.split_whitespace();
    let number = fields
        .next()
        .ok_or_else(|| ThrottleError::InvalidArgument("empty line".into()))?
        .parse::<DeviceNumber>()?;
    let fd_id = fields
        .next()
        .ok_or_else(|| ThrottleError::InvalidArgument("missing fake device id".into()))?
        .parse::<u64>()
        .map_err(|_| ThrottleError::InvalidArgument("bad fake device id".into()))?;
    let value = parse_value(
        fields
            .next()
            .ok_or_else(|| ThrottleError::InvalidArgument("missing value".into()))?,
    )?;
    if fields.next().is_some() {
        return Err(ThrottleError::InvalidArgument(format!(
            "trailing input in {:?}",
            line
        )));
    }
    Ok(HybridLine {
        number,
        fd_id,
        value,
    })
}
