//! Storage collaborator
//!
//! The state core never touches file data. It asks the storage layer to
//! resolve file handles, open and close backing file objects, truncate on
//! OPEN, and describe pNFS layouts. [`MemoryStorage`] is an in-process
//! backend used by tests and embedders without a real filesystem.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{NfsStatus, StatusResult};
use crate::nfs4::delegation::AdvisoryLock;
use crate::nfs4::Nfs4FileHandle;
use crate::pnfs::{
    DeviceId, Fsid, LayoutCommitArgs, LayoutIoMode, LayoutRange, LayoutRequest, LayoutSegment,
    LayoutType,
};

/// Access mode a backing file object is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    ReadWrite,
}

impl AccessMode {
    /// Slot of this mode in per-file descriptor tables
    pub fn index(&self) -> usize {
        match self {
            AccessMode::Read => 0,
            AccessMode::Write => 1,
            AccessMode::ReadWrite => 2,
        }
    }

    /// Whether the mode permits reading
    pub fn can_read(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// Whether the mode permits writing
    pub fn can_write(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// Stable identity of a filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Filesystem the object lives on
    pub fsid: Fsid,
    /// Object id within the filesystem
    pub fileid: u64,
}

/// An open backing file object
pub trait FileObject: Send + Sync + fmt::Debug {
    /// File handle the object was opened from
    fn handle(&self) -> &Nfs4FileHandle;

    /// Access mode it was opened with
    fn access(&self) -> AccessMode;
}

/// Filesystem operations consumed by the state core
///
/// [`find_file`](StorageBackend::find_file), [`open`](StorageBackend::open),
/// [`truncate`](StorageBackend::truncate), [`layout_get`](StorageBackend::layout_get)
/// and [`merge_layouts_supported`](StorageBackend::merge_layouts_supported)
/// run under the global state lock and must not call back into the state
/// manager. Everything else is called with the lock released.
pub trait StorageBackend: Send + Sync {
    /// Resolve a file handle to the object's stable identity
    fn find_file(&self, fh: &Nfs4FileHandle) -> StatusResult<FileIdentity>;

    /// Open a backing file object
    fn open(&self, fh: &Nfs4FileHandle, mode: AccessMode) -> StatusResult<Arc<dyn FileObject>>;

    /// Close a backing file object
    fn close(&self, file: Arc<dyn FileObject>);

    /// Truncate a file
    fn truncate(&self, fh: &Nfs4FileHandle, size: u64) -> StatusResult<()>;

    /// Whether adjacent or overlapping segments of this type may be merged
    fn merge_layouts_supported(&self, _layout_type: LayoutType) -> bool {
        false
    }

    /// Describe a layout segment for the requested range
    fn layout_get(
        &self,
        _fh: &Nfs4FileHandle,
        _request: &LayoutRequest,
    ) -> StatusResult<LayoutSegment> {
        Err(NfsStatus::LayoutUnavailable)
    }

    /// Notification that a client no longer holds a layout range
    fn layout_return(
        &self,
        _fh: &Nfs4FileHandle,
        _layout_type: LayoutType,
        _iomode: LayoutIoMode,
        _range: LayoutRange,
    ) {
    }

    /// Commit metadata written through a layout; returns the new size if it changed
    fn layout_commit(
        &self,
        _fh: &Nfs4FileHandle,
        _args: &LayoutCommitArgs,
    ) -> StatusResult<Option<u64>> {
        Err(NfsStatus::NotSupp)
    }

    /// Encoded device address for a device id
    fn get_device_info(&self, _layout_type: LayoutType, _device: &DeviceId) -> StatusResult<Bytes> {
        Err(NfsStatus::NotSupp)
    }

    /// Hand the storage layer the delegation lease capability
    ///
    /// Storage calls `break_notify` on it when a local access conflicts with a
    /// delegation.
    fn attach_lease_breaker(&self, _breaker: Arc<dyn AdvisoryLock>) {}
}

/// File object handed out by [`MemoryStorage`]
#[derive(Debug)]
pub struct MemoryFileObject {
    id: u64,
    fh: Nfs4FileHandle,
    access: AccessMode,
}

impl MemoryFileObject {
    /// Object id, unique per storage instance
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl FileObject for MemoryFileObject {
    fn handle(&self) -> &Nfs4FileHandle {
        &self.fh
    }

    fn access(&self) -> AccessMode {
        self.access
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    identity: FileIdentity,
    size: u64,
    layout_types: Vec<LayoutType>,
    device: DeviceId,
}

/// Counters recorded by [`MemoryStorage`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Backing opens
    pub opens: usize,
    /// Backing closes
    pub closes: usize,
    /// Truncations
    pub truncates: usize,
    /// Layout ranges returned
    pub layout_returns: usize,
    /// Layout commits
    pub layout_commits: usize,
}

/// In-memory storage backend
pub struct MemoryStorage {
    files: DashMap<Nfs4FileHandle, MemoryFile>,
    merging: RwLock<HashSet<LayoutType>>,
    stats: Mutex<StorageStats>,
    breaker: RwLock<Option<Arc<dyn AdvisoryLock>>>,
    open_error: RwLock<Option<NfsStatus>>,
    next_object: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            merging: RwLock::new(HashSet::new()),
            stats: Mutex::new(StorageStats::default()),
            breaker: RwLock::new(None),
            open_error: RwLock::new(None),
            next_object: AtomicU64::new(1),
        }
    }

    /// Register a file; it supports file layouts with a device id derived from `fileid`
    pub fn add_file(&self, fh: Nfs4FileHandle, fsid: Fsid, fileid: u64) {
        let mut device = [0u8; 16];
        device[..8].copy_from_slice(&fsid.major.to_be_bytes());
        device[8..].copy_from_slice(&fileid.to_be_bytes());
        self.files.insert(
            fh,
            MemoryFile {
                identity: FileIdentity { fsid, fileid },
                size: 0,
                layout_types: vec![LayoutType::NfsV41Files],
                device,
            },
        );
    }

    /// Remove a file; later lookups return `Stale`
    pub fn remove_file(&self, fh: &Nfs4FileHandle) {
        self.files.remove(fh);
    }

    /// Allow or forbid merging of segments of a layout type
    pub fn set_merge_layouts(&self, layout_type: LayoutType, enabled: bool) {
        let mut merging = self.merging.write();
        if enabled {
            merging.insert(layout_type);
        } else {
            merging.remove(&layout_type);
        }
    }

    /// Current size of a file
    pub fn size(&self, fh: &Nfs4FileHandle) -> Option<u64> {
        self.files.get(fh).map(|f| f.size)
    }

    /// Set the size of a file
    pub fn set_size(&self, fh: &Nfs4FileHandle, size: u64) {
        if let Some(mut file) = self.files.get_mut(fh) {
            file.size = size;
        }
    }

    /// Make every later open fail with `status`, or succeed again with `None`
    pub fn fail_opens(&self, status: Option<NfsStatus>) {
        *self.open_error.write() = status;
    }

    /// Snapshot of the recorded counters
    pub fn stats(&self) -> StorageStats {
        self.stats.lock().clone()
    }

    /// Simulate a local (non-NFS) access to a file
    ///
    /// Breaks any delegation the access conflicts with.
    pub fn local_access(&self, fh: &Nfs4FileHandle, mode: AccessMode) {
        let breaker = self.breaker.read().clone();
        if let Some(breaker) = breaker {
            breaker.break_notify(fh, mode);
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn find_file(&self, fh: &Nfs4FileHandle) -> StatusResult<FileIdentity> {
        self.files
            .get(fh)
            .map(|f| f.identity)
            .ok_or(NfsStatus::Stale)
    }

    fn open(&self, fh: &Nfs4FileHandle, mode: AccessMode) -> StatusResult<Arc<dyn FileObject>> {
        if !self.files.contains_key(fh) {
            return Err(NfsStatus::Stale);
        }
        if let Some(status) = *self.open_error.read() {
            return Err(status);
        }
        self.stats.lock().opens += 1;
        Ok(Arc::new(MemoryFileObject {
            id: self.next_object.fetch_add(1, Ordering::Relaxed),
            fh: fh.clone(),
            access: mode,
        }))
    }

    fn close(&self, _file: Arc<dyn FileObject>) {
        self.stats.lock().closes += 1;
    }

    fn truncate(&self, fh: &Nfs4FileHandle, size: u64) -> StatusResult<()> {
        let mut file = self.files.get_mut(fh).ok_or(NfsStatus::Stale)?;
        file.size = size;
        self.stats.lock().truncates += 1;
        Ok(())
    }

    fn merge_layouts_supported(&self, layout_type: LayoutType) -> bool {
        self.merging.read().contains(&layout_type)
    }

    fn layout_get(&self, fh: &Nfs4FileHandle, request: &LayoutRequest) -> StatusResult<LayoutSegment> {
        let file = self.files.get(fh).ok_or(NfsStatus::Stale)?;
        if !file.layout_types.contains(&request.layout_type) {
            return Err(NfsStatus::UnknownLayoutType);
        }
        Ok(LayoutSegment {
            layout_type: request.layout_type,
            iomode: request.iomode,
            range: request.range,
            return_on_close: false,
            body: Bytes::copy_from_slice(&file.device),
        })
    }

    fn layout_return(
        &self,
        _fh: &Nfs4FileHandle,
        _layout_type: LayoutType,
        _iomode: LayoutIoMode,
        _range: LayoutRange,
    ) {
        self.stats.lock().layout_returns += 1;
    }

    fn layout_commit(&self, fh: &Nfs4FileHandle, args: &LayoutCommitArgs) -> StatusResult<Option<u64>> {
        let mut file = self.files.get_mut(fh).ok_or(NfsStatus::Stale)?;
        self.stats.lock().layout_commits += 1;
        match args.last_write_offset {
            Some(offset) if offset.saturating_add(1) > file.size => {
                file.size = offset.saturating_add(1);
                Ok(Some(file.size))
            }
            _ => Ok(None),
        }
    }

    fn get_device_info(&self, layout_type: LayoutType, device: &DeviceId) -> StatusResult<Bytes> {
        if layout_type != LayoutType::NfsV41Files {
            return Err(NfsStatus::UnknownLayoutType);
        }
        let known = self.files.iter().any(|f| &f.device == device);
        if !known {
            return Err(NfsStatus::Noent);
        }
        Ok(Bytes::copy_from_slice(device))
    }

    fn attach_lease_breaker(&self, breaker: Arc<dyn AdvisoryLock>) {
        *self.breaker.write() = Some(breaker);
    }
}
