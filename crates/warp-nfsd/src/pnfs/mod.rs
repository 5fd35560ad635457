//! Parallel NFS (pNFS) layout state
//!
//! pNFS allows clients to access storage devices directly, bypassing
//! the NFS server for data operations while maintaining metadata
//! through the server. This module tracks which byte ranges of which files
//! each client holds layouts for, merges and trims those ranges as layouts
//! are granted and returned, and recalls them through the callback path.

pub mod layout;
pub mod segment;

use bytes::Bytes;

use crate::error::NfsStatus;

pub use layout::{
    DeviceChange, DeviceNotification, LayoutCommitArgs, LayoutCommitResult, LayoutGetArgs,
    LayoutGetResult, LayoutRecallRequest, LayoutReturnArgs, LayoutReturnResult, LayoutReturnScope,
    RecallScope,
};
pub use segment::LayoutRange;

/// Layout type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LayoutType {
    /// NFSv4.1 file layout (RFC 5661)
    NfsV41Files = 1,
    /// Object-based storage (RFC 5664)
    Osd2Objects = 2,
    /// Block/volume layout (RFC 5663)
    BlockVolume = 3,
    /// Flex files (RFC 8435)
    FlexFiles = 4,
}

impl TryFrom<u32> for LayoutType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::NfsV41Files),
            2 => Ok(Self::Osd2Objects),
            3 => Ok(Self::BlockVolume),
            4 => Ok(Self::FlexFiles),
            _ => Err(NfsStatus::UnknownLayoutType),
        }
    }
}

/// Layout I/O mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LayoutIoMode {
    /// Read-only access
    Read = 1,
    /// Read-write access
    ReadWrite = 2,
    /// Any mode (only valid in returns and recalls)
    Any = 3,
}

impl TryFrom<u32> for LayoutIoMode {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::ReadWrite),
            3 => Ok(Self::Any),
            _ => Err(NfsStatus::Inval),
        }
    }
}

impl LayoutIoMode {
    /// Whether a return or recall with this mode covers a layout held in `held`
    pub fn covers(&self, held: LayoutIoMode) -> bool {
        *self == LayoutIoMode::Any || *self == held
    }
}

/// Device ID (16 bytes)
pub type DeviceId = [u8; 16];

/// Filesystem id of an exported filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fsid {
    /// Major
    pub major: u64,
    /// Minor
    pub minor: u64,
}

impl Fsid {
    /// Create an fsid
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

/// What the server asks the storage layer to describe on LAYOUTGET
#[derive(Debug, Clone)]
pub struct LayoutRequest {
    /// Layout type
    pub layout_type: LayoutType,
    /// I/O mode
    pub iomode: LayoutIoMode,
    /// Requested range
    pub range: LayoutRange,
    /// Shortest acceptable range
    pub minlength: u64,
    /// Reply size budget for the layout body
    pub maxcount: u32,
}

/// A layout segment as described by the storage layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSegment {
    /// Layout type
    pub layout_type: LayoutType,
    /// I/O mode granted
    pub iomode: LayoutIoMode,
    /// Range granted
    pub range: LayoutRange,
    /// Return the layout when the last open of the file is closed
    pub return_on_close: bool,
    /// Layout content (type-specific, already encoded by the storage layer)
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_type() {
        assert_eq!(LayoutType::try_from(1).unwrap(), LayoutType::NfsV41Files);
        assert_eq!(LayoutType::try_from(4).unwrap(), LayoutType::FlexFiles);
        assert_eq!(LayoutType::try_from(99), Err(NfsStatus::UnknownLayoutType));
    }

    #[test]
    fn test_layout_io_mode() {
        assert_eq!(LayoutIoMode::try_from(1).unwrap(), LayoutIoMode::Read);
        assert_eq!(LayoutIoMode::try_from(2).unwrap(), LayoutIoMode::ReadWrite);
        assert!(LayoutIoMode::try_from(99).is_err());
        assert!(LayoutIoMode::Any.covers(LayoutIoMode::Read));
        assert!(!LayoutIoMode::Read.covers(LayoutIoMode::ReadWrite));
    }
}
