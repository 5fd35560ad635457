//! Layout operations
//!
//! LAYOUTGET, LAYOUTRETURN, LAYOUTCOMMIT and GETDEVICEINFO, plus the
//! server-initiated side: CB_LAYOUTRECALL and CB_NOTIFY_DEVICEID.
//!
//! A client holds one layout state per file, with its own stateid and
//! generation. The first LAYOUTGET on a file must present an open, lock or
//! delegation stateid; later ones present the layout stateid.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::segment::{self, Layout, LayoutRange, Released};
use super::{DeviceId, Fsid, LayoutIoMode, LayoutRequest, LayoutSegment, LayoutType};
use crate::error::{NfsStatus, StatusResult};
use crate::manager::StateManager;
use crate::nfs4::callback::{CallbackError, CallbackRequest, CallbackRoute, CallbackState};
use crate::nfs4::compound::CompoundContext;
use crate::nfs4::state::check_generation;
use crate::nfs4::tables::{
    DeferredWork, FileId, LayoutState, LayoutStateId, RecallId, StateKind, StateTables,
};
use crate::nfs4::{ClientKey, Nfs4FileHandle, StateId};

/// Which layouts a recall targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecallScope {
    /// One file
    File(Nfs4FileHandle),
    /// Every file of a filesystem
    Fsid(Fsid),
    /// Everything
    All,
}

/// Recall target as sent in CB_LAYOUTRECALL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutRecallRequest {
    /// Layouts of one file
    File {
        /// File
        fh: Nfs4FileHandle,
        /// Range recalled
        range: LayoutRange,
        /// Layout stateid after the recall
        stateid: StateId,
    },
    /// Layouts of one filesystem
    Fsid(Fsid),
    /// All layouts
    All,
}

/// Kind of device change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    /// Device address changed
    Change,
    /// Device went away
    Delete,
}

/// One CB_NOTIFY_DEVICEID entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNotification {
    /// Layout type of the device
    pub layout_type: LayoutType,
    /// Device id
    pub device: DeviceId,
    /// What happened
    pub change: DeviceChange,
    /// Client should stop using the device at once
    pub immediate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecallTarget {
    File(FileId),
    Fsid(Fsid),
    All,
}

/// An outstanding CB_LAYOUTRECALL
#[derive(Debug, Clone)]
pub(crate) struct LayoutRecall {
    pub id: RecallId,
    pub client: ClientKey,
    pub layout_type: LayoutType,
    pub iomode: LayoutIoMode,
    pub target: RecallTarget,
    pub range: LayoutRange,
    /// Last time a return made progress on this recall
    pub timestamp: Instant,
}

pub(crate) struct LayoutRecallDispatch {
    pub route: CallbackRoute,
    pub recall: RecallId,
    pub request: CallbackRequest,
}

pub(crate) struct DeviceNotifyDispatch {
    pub route: CallbackRoute,
    pub changes: Vec<DeviceNotification>,
}

/// LAYOUTGET arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutGetArgs {
    /// File
    pub fh: Nfs4FileHandle,
    /// Layout type
    pub layout_type: LayoutType,
    /// Requested iomode
    pub iomode: LayoutIoMode,
    /// Requested range
    pub range: LayoutRange,
    /// Shortest acceptable range
    pub minlength: u64,
    /// Open, lock or delegation stateid on the first call, layout stateid afterwards
    pub stateid: StateId,
    /// Reply size budget
    pub maxcount: u32,
}

impl LayoutGetArgs {
    /// Request `range` of a file with `stateid`
    pub fn new(fh: Nfs4FileHandle, iomode: LayoutIoMode, range: LayoutRange, stateid: StateId) -> Self {
        Self {
            fh,
            layout_type: LayoutType::NfsV41Files,
            iomode,
            range,
            minlength: 0,
            stateid,
            maxcount: 4096,
        }
    }
}

/// LAYOUTGET result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutGetResult {
    /// Layout stateid
    pub stateid: StateId,
    /// Segment granted by the storage layer
    pub segment: LayoutSegment,
}

/// What LAYOUTRETURN gives back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutReturnScope {
    /// Part of one file's layout
    File {
        /// File
        fh: Nfs4FileHandle,
        /// Range returned
        range: LayoutRange,
        /// Layout stateid
        stateid: StateId,
    },
    /// Every layout on a filesystem
    Fsid(Fsid),
    /// Every layout
    All,
}

/// LAYOUTRETURN arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutReturnArgs {
    /// Layout type
    pub layout_type: LayoutType,
    /// Iomode returned; `Any` covers both
    pub iomode: LayoutIoMode,
    /// Scope
    pub scope: LayoutReturnScope,
}

/// LAYOUTRETURN result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutReturnResult {
    /// New layout stateid when the file still has layouts (file scope only)
    pub stateid: Option<StateId>,
    /// Number of ranges released
    pub returned: usize,
}

/// LAYOUTCOMMIT arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutCommitArgs {
    /// Range written
    pub range: LayoutRange,
    /// Highest offset written, if the client reports one
    pub last_write_offset: Option<u64>,
    /// Committing layouts reclaimed after a restart
    pub reclaim: bool,
}

/// LAYOUTCOMMIT result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutCommitResult {
    /// File size after the commit, if it changed
    pub new_size: Option<u64>,
}

impl StateTables {
    fn in_target(&self, state: &LayoutState, target: RecallTarget) -> bool {
        match target {
            RecallTarget::File(file) => state.file == file,
            RecallTarget::Fsid(fsid) => self
                .files
                .get(&state.file)
                .map(|f| f.identity.fsid == fsid)
                .unwrap_or(false),
            RecallTarget::All => true,
        }
    }

    fn client_layouts(&self, client: ClientKey) -> Vec<LayoutStateId> {
        self.confirmed
            .get(&client)
            .map(|c| c.layout_states.iter().copied().collect())
            .unwrap_or_default()
    }

    fn recall_satisfied(&self, recall: &LayoutRecall) -> bool {
        !self.client_layouts(recall.client).iter().any(|id| {
            self.layout_states
                .get(id)
                .filter(|state| self.in_target(state, recall.target))
                .map(|state| {
                    segment::any_matching(&state.segments, recall.layout_type, recall.iomode, &recall.range)
                })
                .unwrap_or(false)
        })
    }

    fn drop_recall(&mut self, id: RecallId) -> Option<LayoutRecall> {
        let recall = self.layout_recalls.remove(&id)?;
        if let Some(client) = self.confirmed.get_mut(&recall.client) {
            client.layout_recalls.remove(&id);
        }
        Some(recall)
    }

    /// Settle the client's recalls after a return made progress
    fn resolve_recalls(&mut self, client: ClientKey, layout_type: LayoutType, now: Instant) {
        let ids: Vec<RecallId> = self
            .confirmed
            .get(&client)
            .map(|c| c.layout_recalls.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let Some(recall) = self.layout_recalls.get(&id) else {
                continue;
            };
            if recall.layout_type != layout_type {
                continue;
            }
            if self.recall_satisfied(recall) {
                debug!("layout recall {} satisfied", id);
                self.drop_recall(id);
            } else if let Some(recall) = self.layout_recalls.get_mut(&id) {
                recall.timestamp = now;
            }
        }
    }

    /// Release matching segments of one layout state, dropping the state once empty
    fn release_segments(
        &mut self,
        id: LayoutStateId,
        layout_type: LayoutType,
        iomode: LayoutIoMode,
        range: &LayoutRange,
        work: &mut DeferredWork,
    ) -> usize {
        let Some(state) = self.layout_states.get_mut(&id) else {
            return 0;
        };
        let released = segment::release(&mut state.segments, layout_type, iomode, range);
        let count = released.len();
        let empty = state.segments.is_empty();
        if count > 0 {
            state.generation = state.generation.wrapping_add(1);
        }
        let file = state.file;
        if let Some(fh) = self.files.get(&file).map(|f| f.fh.clone()) {
            for r in released {
                work.layout_returns.push((fh.clone(), r));
            }
        }
        if empty {
            self.unhash_layout_state(id, work);
        }
        count
    }

    /// Forget what a recall asked for, as if the client had returned it
    pub(crate) fn forget_recalled(&mut self, id: RecallId, work: &mut DeferredWork) {
        let Some(recall) = self.drop_recall(id) else {
            return;
        };
        for state in self.client_layouts(recall.client) {
            let in_target = self
                .layout_states
                .get(&state)
                .map(|s| self.in_target(s, recall.target))
                .unwrap_or(false);
            if in_target {
                self.release_segments(state, recall.layout_type, recall.iomode, &recall.range, work);
            }
        }
        info!("layout recall {} of client {} resolved without a return", id, recall.client);
    }

    /// Drop return-on-close segments once the client has no open left on the file
    pub(crate) fn return_on_close(&mut self, client: ClientKey, file: FileId, work: &mut DeferredWork) {
        let still_open = self.files.get(&file).map(|f| {
            f.stateids.iter().any(|o| {
                self.stateids
                    .get(o)
                    .map(|e| e.client == client && matches!(e.kind, StateKind::Open(_)))
                    .unwrap_or(false)
            })
        });
        if still_open.unwrap_or(true) {
            return;
        }
        let Some(id) = self.layout_index.get(&(client, file)).copied() else {
            return;
        };
        let Some(state) = self.layout_states.get_mut(&id) else {
            return;
        };
        let mut released = Vec::new();
        state.segments.retain(|s| {
            if s.return_on_close {
                released.push(Released {
                    layout_type: s.layout_type,
                    iomode: s.iomode,
                    range: s.range,
                });
            }
            !s.return_on_close
        });
        if released.is_empty() {
            return;
        }
        state.generation = state.generation.wrapping_add(1);
        let empty = state.segments.is_empty();
        if let Some(fh) = self.files.get(&file).map(|f| f.fh.clone()) {
            for r in released {
                work.layout_returns.push((fh.clone(), r));
            }
        }
        if empty {
            self.unhash_layout_state(id, work);
        }
    }

    fn recall_conflict(&self, client: ClientKey, file: FileId, layout_type: LayoutType, range: &LayoutRange) -> bool {
        let fsid = self.files.get(&file).map(|f| f.identity.fsid);
        self.confirmed
            .get(&client)
            .map(|c| {
                c.layout_recalls.iter().filter_map(|id| self.layout_recalls.get(id)).any(|r| {
                    r.layout_type == layout_type
                        && match r.target {
                            RecallTarget::File(f) => f == file && r.range.overlaps(range),
                            RecallTarget::Fsid(fs) => Some(fs) == fsid,
                            RecallTarget::All => true,
                        }
                })
            })
            .unwrap_or(false)
    }

    /// Resolve the stateid that authorises a LAYOUTGET
    fn layout_state_for_get(
        &mut self,
        client: ClientKey,
        file: FileId,
        stateid: &StateId,
    ) -> StatusResult<(LayoutStateId, bool)> {
        if stateid.is_special() {
            return Err(NfsStatus::BadStateId);
        }
        let other = stateid.identity();
        if other.boot != self.boot {
            return Err(NfsStatus::StaleStateId);
        }
        if let Some(id) = self.layout_index.get(&(client, file)).copied() {
            let state = self.layout_states.get(&id).ok_or(NfsStatus::ServerFault)?;
            if other.is_layout() {
                if other.file != id {
                    return Err(NfsStatus::BadStateId);
                }
                check_generation(true, state.generation, stateid.seqid)?;
                return Ok((id, false));
            }
        } else if other.is_layout() {
            return Err(NfsStatus::BadStateId);
        }

        // open, lock or delegation stateid as proof of access
        let (owner_client, owner_file, generation) = if other.is_delegation() {
            let deleg = self.delegations.get(&other.file).ok_or(NfsStatus::BadStateId)?;
            (deleg.client, deleg.file, deleg.stateid.seqid)
        } else {
            let entry = self.stateids.get(&other).ok_or(NfsStatus::BadStateId)?;
            (entry.client, entry.file, entry.generation)
        };
        if owner_client != client || owner_file != file {
            return Err(NfsStatus::BadStateId);
        }
        check_generation(true, generation, stateid.seqid)?;

        if let Some(id) = self.layout_index.get(&(client, file)).copied() {
            return Ok((id, false));
        }
        let id = self.alloc_layout_id()?;
        self.layout_states.insert(
            id,
            LayoutState {
                id,
                generation: 0,
                client,
                file,
                segments: Vec::new(),
            },
        );
        self.layout_index.insert((client, file), id);
        if let Some(record) = self.confirmed.get_mut(&client) {
            record.layout_states.insert(id);
        }
        if let Some(record) = self.files.get_mut(&file) {
            record.layout_states.insert(id);
        }
        Ok((id, true))
    }

    fn check_layout_stateid(&self, client: ClientKey, file: FileId, stateid: &StateId) -> StatusResult<LayoutStateId> {
        let other = stateid.identity();
        if other.boot != self.boot {
            return Err(NfsStatus::StaleStateId);
        }
        let id = self.layout_index.get(&(client, file)).copied().ok_or(NfsStatus::BadStateId)?;
        if !other.is_layout() || other.file != id {
            return Err(NfsStatus::BadStateId);
        }
        let state = self.layout_states.get(&id).ok_or(NfsStatus::BadStateId)?;
        check_generation(true, state.generation, stateid.seqid)?;
        Ok(id)
    }
}

fn layout_get_locked(
    tables: &mut StateTables,
    storage: &dyn crate::storage::StorageBackend,
    client: ClientKey,
    args: &LayoutGetArgs,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<LayoutGetResult> {
    tables.confirmed_client(client)?;
    if !tables.pnfs_enabled {
        return Err(NfsStatus::LayoutUnavailable);
    }
    if args.iomode == LayoutIoMode::Any || args.range.is_empty() || args.minlength > args.range.length {
        return Err(NfsStatus::Inval);
    }
    if tables.grace {
        return Err(NfsStatus::Grace);
    }
    let identity = storage.find_file(&args.fh)?;
    let file = tables.find_or_create_file(&args.fh, identity);
    if tables.recall_conflict(client, file, args.layout_type, &args.range) {
        tables.maybe_release_file(file);
        return Err(NfsStatus::RecallConflict);
    }
    let (id, created) = match tables.layout_state_for_get(client, file, &args.stateid) {
        Ok(found) => found,
        Err(status) => {
            tables.maybe_release_file(file);
            return Err(status);
        }
    };

    let request = LayoutRequest {
        layout_type: args.layout_type,
        iomode: args.iomode,
        range: args.range,
        minlength: args.minlength,
        maxcount: args.maxcount,
    };
    let granted = match storage.layout_get(&args.fh, &request) {
        Ok(granted) => granted,
        Err(status) => {
            if created {
                tables.unhash_layout_state(id, work);
            }
            return Err(status);
        }
    };
    let merge = storage.merge_layouts_supported(granted.layout_type);
    let boot = tables.boot;
    let state = tables.layout_states.get_mut(&id).ok_or(NfsStatus::ServerFault)?;
    segment::insert(
        &mut state.segments,
        Layout {
            layout_type: granted.layout_type,
            iomode: granted.iomode,
            range: granted.range,
            return_on_close: granted.return_on_close,
        },
        merge,
    );
    state.generation = state.generation.wrapping_add(1);
    let stateid = state.stateid(boot);
    tables.renew_client(client, true, now);
    debug!(
        "LAYOUTGET: client {} file {} {:?} [{}, {})",
        client,
        file,
        granted.iomode,
        granted.range.offset,
        granted.range.end()
    );
    Ok(LayoutGetResult {
        stateid,
        segment: granted,
    })
}

fn layout_return_locked(
    tables: &mut StateTables,
    storage: &dyn crate::storage::StorageBackend,
    client: ClientKey,
    args: &LayoutReturnArgs,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<LayoutReturnResult> {
    tables.confirmed_client(client)?;
    let result = match &args.scope {
        LayoutReturnScope::File { fh, range, stateid } => {
            let identity = storage.find_file(fh)?;
            let file = tables.file_index.get(&identity).copied().ok_or(NfsStatus::BadStateId)?;
            let id = tables.check_layout_stateid(client, file, stateid)?;
            let returned = tables.release_segments(id, args.layout_type, args.iomode, range, work);
            let boot = tables.boot;
            let stateid = tables.layout_states.get(&id).map(|s| s.stateid(boot));
            LayoutReturnResult { stateid, returned }
        }
        LayoutReturnScope::Fsid(fsid) => {
            let target = RecallTarget::Fsid(*fsid);
            return_matching(tables, client, target, args, work)
        }
        LayoutReturnScope::All => return_matching(tables, client, RecallTarget::All, args, work),
    };
    tables.resolve_recalls(client, args.layout_type, now);
    tables.renew_client(client, true, now);
    debug!("LAYOUTRETURN: client {} released {} ranges", client, result.returned);
    Ok(result)
}

fn return_matching(
    tables: &mut StateTables,
    client: ClientKey,
    target: RecallTarget,
    args: &LayoutReturnArgs,
    work: &mut DeferredWork,
) -> LayoutReturnResult {
    let mut returned = 0;
    for id in tables.client_layouts(client) {
        let matches = tables
            .layout_states
            .get(&id)
            .map(|s| tables.in_target(s, target))
            .unwrap_or(false);
        if matches {
            returned += tables.release_segments(id, args.layout_type, args.iomode, &LayoutRange::whole(), work);
        }
    }
    LayoutReturnResult {
        stateid: None,
        returned,
    }
}

#[allow(clippy::too_many_arguments)]
fn recall_locked(
    tables: &mut StateTables,
    layout_type: LayoutType,
    iomode: LayoutIoMode,
    target: RecallTarget,
    range: LayoutRange,
    changed: bool,
    now: Instant,
    work: &mut DeferredWork,
) -> usize {
    // clients holding a matching segment, with the file for single-file recalls
    let mut holders: Vec<(ClientKey, Option<LayoutStateId>)> = Vec::new();
    for state in tables.layout_states.values() {
        if !tables.in_target(state, target)
            || !segment::any_matching(&state.segments, layout_type, iomode, &range)
        {
            continue;
        }
        let entry = match target {
            RecallTarget::File(_) => (state.client, Some(state.id)),
            _ => (state.client, None),
        };
        if !holders.contains(&entry) {
            holders.push(entry);
        }
    }

    let mut started = 0;
    for (client, state) in holders {
        let id = tables.alloc_recall_id();
        tables.layout_recalls.insert(
            id,
            LayoutRecall {
                id,
                client,
                layout_type,
                iomode,
                target,
                range,
                timestamp: now,
            },
        );
        if let Some(record) = tables.confirmed.get_mut(&client) {
            record.layout_recalls.insert(id);
        }
        started += 1;

        let boot = tables.boot;
        let bumped = state.and_then(|id| tables.layout_states.get_mut(&id)).map(|state| {
            state.generation = state.generation.wrapping_add(1);
            (state.stateid(boot), state.file)
        });
        let recall = match bumped {
            Some((stateid, file)) => match tables.files.get(&file) {
                Some(f) => LayoutRecallRequest::File {
                    fh: f.fh.clone(),
                    range,
                    stateid,
                },
                None => LayoutRecallRequest::All,
            },
            None => match target {
                RecallTarget::Fsid(fsid) => LayoutRecallRequest::Fsid(fsid),
                _ => LayoutRecallRequest::All,
            },
        };

        let healthy = tables
            .confirmed
            .get(&client)
            .map(|c| c.cb_state == CallbackState::Healthy)
            .unwrap_or(false);
        let route = if healthy { tables.callback_route(client) } else { None };
        match route {
            Some(route) => work.layout_recalls.push(LayoutRecallDispatch {
                route,
                recall: id,
                request: CallbackRequest::LayoutRecall {
                    layout_type,
                    iomode,
                    changed,
                    recall,
                },
            }),
            None => {
                warn!("client {} unreachable, layout recall {} resolved", client, id);
                tables.forget_recalled(id, work);
            }
        }
    }
    started
}

impl StateManager {
    /// LAYOUTGET
    pub async fn layout_get(&self, ctx: &CompoundContext, args: LayoutGetArgs) -> StatusResult<LayoutGetResult> {
        let client = ctx.session_client().ok_or(NfsStatus::NotSupp)?;
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            layout_get_locked(
                &mut tables,
                self.inner.storage.as_ref(),
                client,
                &args,
                Instant::now(),
                &mut work,
            )
        };
        self.finish(work).await;
        result
    }

    /// LAYOUTRETURN
    pub async fn layout_return(&self, ctx: &CompoundContext, args: LayoutReturnArgs) -> StatusResult<LayoutReturnResult> {
        let client = ctx.session_client().ok_or(NfsStatus::NotSupp)?;
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            layout_return_locked(
                &mut tables,
                self.inner.storage.as_ref(),
                client,
                &args,
                Instant::now(),
                &mut work,
            )
        };
        self.finish(work).await;
        result
    }

    /// LAYOUTCOMMIT
    ///
    /// The committed range must lie within a read-write segment the client holds.
    pub async fn layout_commit(
        &self,
        ctx: &CompoundContext,
        fh: &Nfs4FileHandle,
        stateid: StateId,
        layout_type: LayoutType,
        args: LayoutCommitArgs,
    ) -> StatusResult<LayoutCommitResult> {
        let client = ctx.session_client().ok_or(NfsStatus::NotSupp)?;
        let identity = self.inner.storage.find_file(fh)?;
        {
            let mut tables = self.inner.tables.lock();
            tables.confirmed_client(client)?;
            if args.reclaim && !tables.grace {
                return Err(NfsStatus::NoGrace);
            }
            let file = tables.file_index.get(&identity).copied().ok_or(NfsStatus::BadStateId)?;
            let id = tables.check_layout_stateid(client, file, &stateid)?;
            let covered = tables
                .layout_states
                .get(&id)
                .map(|s| {
                    s.segments.iter().any(|seg| {
                        seg.layout_type == layout_type
                            && seg.iomode == LayoutIoMode::ReadWrite
                            && seg.range.contains(&args.range)
                    })
                })
                .unwrap_or(false);
            if !covered {
                return Err(NfsStatus::Inval);
            }
            tables.renew_client(client, true, Instant::now());
        }
        let new_size = self.inner.storage.layout_commit(fh, &args)?;
        Ok(LayoutCommitResult { new_size })
    }

    /// GETDEVICEINFO
    pub fn get_device_info(&self, ctx: &CompoundContext, layout_type: LayoutType, device: &DeviceId) -> StatusResult<Bytes> {
        ctx.session_client().ok_or(NfsStatus::NotSupp)?;
        if !self.inner.tables.lock().pnfs_enabled {
            return Err(NfsStatus::NotSupp);
        }
        self.inner.storage.get_device_info(layout_type, device)
    }

    /// Recall layouts; returns the number of recalls started
    ///
    /// Clients without a usable callback path have the recalled layouts
    /// dropped on the spot.
    pub async fn recall_layout(
        &self,
        layout_type: LayoutType,
        iomode: LayoutIoMode,
        scope: RecallScope,
        range: LayoutRange,
        changed: bool,
    ) -> usize {
        let target = match &scope {
            RecallScope::File(fh) => match self.inner.storage.find_file(fh) {
                Ok(identity) => match self.inner.tables.lock().file_index.get(&identity) {
                    Some(file) => RecallTarget::File(*file),
                    None => return 0,
                },
                Err(_) => return 0,
            },
            RecallScope::Fsid(fsid) => RecallTarget::Fsid(*fsid),
            RecallScope::All => RecallTarget::All,
        };
        let range = match target {
            RecallTarget::File(_) => range,
            _ => LayoutRange::whole(),
        };
        let mut work = DeferredWork::default();
        let started = {
            let mut tables = self.inner.tables.lock();
            recall_locked(&mut tables, layout_type, iomode, target, range, changed, Instant::now(), &mut work)
        };
        info!("layout recall {:?} started for {} clients", scope, started);
        self.finish(work).await;
        started
    }

    /// Tell every client holding layouts of a type about device changes
    pub fn notify_device(&self, layout_type: LayoutType, changes: Vec<DeviceNotification>) -> usize {
        let mut work = DeferredWork::default();
        {
            let mut tables = self.inner.tables.lock();
            let mut clients: Vec<ClientKey> = tables
                .layout_states
                .values()
                .filter(|s| s.segments.iter().any(|seg| seg.layout_type == layout_type))
                .map(|s| s.client)
                .collect();
            clients.sort();
            clients.dedup();
            for client in clients {
                let healthy = tables
                    .confirmed
                    .get(&client)
                    .map(|c| c.cb_state == CallbackState::Healthy)
                    .unwrap_or(false);
                if !healthy {
                    continue;
                }
                if let Some(route) = tables.callback_route(client) {
                    work.device_notifies.push(DeviceNotifyDispatch {
                        route,
                        changes: changes.clone(),
                    });
                }
            }
        }
        let sent = work.device_notifies.len();
        self.dispatch(work);
        sent
    }

    /// Send a CB_LAYOUTRECALL in the background
    ///
    /// A client that answers NOMATCHING_LAYOUT, or cannot be reached, has the
    /// recalled layouts forgotten for it.
    pub(crate) fn spawn_layout_recall(&self, job: LayoutRecallDispatch) {
        let manager = self.clone();
        self.inner.callbacks.spawn(async move {
            let client = job.route.client();
            let result = manager.inner.callbacks.call(&job.route, job.request).await;
            drop(job.route);
            let err = match result {
                Ok(()) => return,
                Err(err) => err,
            };
            match &err {
                CallbackError::Status(NfsStatus::NoMatchingLayout) => {
                    debug!("client {} holds nothing for layout recall {}", client, job.recall)
                }
                err if err.is_network() => {
                    warn!("CB_LAYOUTRECALL {} to client {} failed: {}", job.recall, client, err);
                    manager.mark_callback_broken(client);
                }
                err => warn!("CB_LAYOUTRECALL {} to client {} rejected: {}", job.recall, client, err),
            }
            let mut work = DeferredWork::default();
            manager.inner.tables.lock().forget_recalled(job.recall, &mut work);
            manager.finish(work).await;
        });
    }

    /// Send a CB_NOTIFY_DEVICEID in the background
    pub(crate) fn spawn_device_notify(&self, job: DeviceNotifyDispatch) {
        let manager = self.clone();
        self.inner.callbacks.spawn(async move {
            let client = job.route.client();
            let request = CallbackRequest::NotifyDeviceId { changes: job.changes };
            let result = manager.inner.callbacks.call(&job.route, request).await;
            drop(job.route);
            if let Err(err) = result {
                warn!("CB_NOTIFY_DEVICEID to client {} failed: {}", client, err);
                if err.is_network() {
                    manager.mark_callback_broken(client);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::state::{OpenArgs, ShareAccess, ShareDeny};
    use crate::testing::{ctx_v1, file, manager, v41_client};

    async fn opened(mgr: &StateManager, ctx: &CompoundContext, fh: &Nfs4FileHandle) -> StateId {
        let client = ctx.session_client().unwrap();
        let args = OpenArgs::new(client, b"owner", 0, fh.clone())
            .with_share(ShareAccess::BOTH, ShareDeny::NONE)
            .with_claim(crate::nfs4::state::OpenClaim::Fh);
        mgr.process_open(ctx, args).await.unwrap().stateid
    }

    #[tokio::test]
    async fn test_first_layoutget_needs_open_stateid() {
        let (mgr, storage, _) = manager();
        let mut ctx = ctx_v1();
        v41_client(&mgr, &mut ctx, b"c1").await;
        let fh = file(&storage, 1);

        let bogus = StateId::from_parts(1, crate::nfs4::StateIdOther::new(mgr.boot(), 99, 99));
        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 100), bogus);
        assert_eq!(mgr.layout_get(&ctx, args).await, Err(NfsStatus::BadStateId));

        let open = opened(&mgr, &ctx, &fh).await;
        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 100), open);
        let got = mgr.layout_get(&ctx, args).await.unwrap();
        assert!(got.stateid.identity().is_layout());
        assert_eq!(got.stateid.seqid, 1);
        assert_eq!(mgr.counters().layout_segments, 1);

        let args = LayoutGetArgs::new(fh, LayoutIoMode::Read, LayoutRange::new(50, 100), got.stateid);
        let again = mgr.layout_get(&ctx, args).await.unwrap();
        assert_eq!(again.stateid.seqid, 2);
        // overlapping segments always coalesce
        assert_eq!(mgr.counters().layout_segments, 1);
    }

    #[tokio::test]
    async fn test_layoutcommit_needs_read_write_segment() {
        let (mgr, storage, _) = manager();
        let mut ctx = ctx_v1();
        v41_client(&mgr, &mut ctx, b"c1").await;
        let fh = file(&storage, 1);
        let open = opened(&mgr, &ctx, &fh).await;

        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 100), open);
        let got = mgr.layout_get(&ctx, args).await.unwrap();
        let commit = LayoutCommitArgs {
            range: LayoutRange::new(0, 10),
            last_write_offset: Some(9),
            reclaim: false,
        };
        assert_eq!(
            mgr.layout_commit(&ctx, &fh, got.stateid, LayoutType::NfsV41Files, commit)
                .await,
            Err(NfsStatus::Inval)
        );

        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::ReadWrite, LayoutRange::new(0, 100), got.stateid);
        let got = mgr.layout_get(&ctx, args).await.unwrap();
        let result = mgr
            .layout_commit(&ctx, &fh, got.stateid, LayoutType::NfsV41Files, commit)
            .await
            .unwrap();
        assert_eq!(result.new_size, Some(10));
        assert_eq!(storage.size(&fh), Some(10));
    }

    #[tokio::test]
    async fn test_recall_conflict_and_return_resolves() {
        let (mgr, storage, transport) = manager();
        let mut ctx = ctx_v1();
        v41_client(&mgr, &mut ctx, b"c1").await;
        let fh = file(&storage, 1);
        let open = opened(&mgr, &ctx, &fh).await;
        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 100), open);
        let got = mgr.layout_get(&ctx, args).await.unwrap();

        let started = mgr
            .recall_layout(
                LayoutType::NfsV41Files,
                LayoutIoMode::Any,
                RecallScope::File(fh.clone()),
                LayoutRange::whole(),
                false,
            )
            .await;
        assert_eq!(started, 1);
        mgr.callbacks().drain().await;
        assert_eq!(transport.count("CB_LAYOUTRECALL"), 1);
        assert_eq!(mgr.counters().layout_recalls, 1);

        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 10), got.stateid);
        assert_eq!(mgr.layout_get(&ctx, args).await, Err(NfsStatus::RecallConflict));

        // the recall bumped the layout stateid
        let stateid = StateId::from_parts(got.stateid.seqid + 1, got.stateid.identity());
        let ret = LayoutReturnArgs {
            layout_type: LayoutType::NfsV41Files,
            iomode: LayoutIoMode::Any,
            scope: LayoutReturnScope::File {
                fh: fh.clone(),
                range: LayoutRange::whole(),
                stateid,
            },
        };
        let result = mgr.layout_return(&ctx, ret).await.unwrap();
        assert_eq!(result.returned, 1);
        assert_eq!(result.stateid, None);
        assert_eq!(mgr.counters().layout_recalls, 0);
        assert_eq!(mgr.counters().layout_states, 0);
        assert_eq!(storage.stats().layout_returns, 1);
    }

    #[tokio::test]
    async fn test_unreachable_client_recall_resolves_at_once() {
        let (mgr, storage, transport) = manager();
        let mut ctx = ctx_v1();
        let (client, _) = v41_client(&mgr, &mut ctx, b"c1").await;
        let fh = file(&storage, 1);
        let open = opened(&mgr, &ctx, &fh).await;
        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 100), open);
        mgr.layout_get(&ctx, args).await.unwrap();

        mgr.mark_callback_broken(client);
        let started = mgr
            .recall_layout(
                LayoutType::NfsV41Files,
                LayoutIoMode::Any,
                RecallScope::All,
                LayoutRange::whole(),
                true,
            )
            .await;
        assert_eq!(started, 1);
        assert_eq!(transport.count("CB_LAYOUTRECALL"), 0);
        assert_eq!(mgr.counters().layout_recalls, 0);
        assert_eq!(mgr.counters().layout_segments, 0);
    }

    #[tokio::test]
    async fn test_layout_return_by_fsid() {
        let (mgr, storage, _) = manager();
        let mut ctx = ctx_v1();
        v41_client(&mgr, &mut ctx, b"c1").await;
        for n in 1..=2 {
            let fh = file(&storage, n);
            let open = opened(&mgr, &ctx, &fh).await;
            let args = LayoutGetArgs::new(fh, LayoutIoMode::Read, LayoutRange::new(0, 100), open);
            mgr.layout_get(&ctx, args).await.unwrap();
        }
        assert_eq!(mgr.counters().layout_states, 2);

        let ret = LayoutReturnArgs {
            layout_type: LayoutType::NfsV41Files,
            iomode: LayoutIoMode::Any,
            scope: LayoutReturnScope::Fsid(crate::testing::FSID),
        };
        let result = mgr.layout_return(&ctx, ret).await.unwrap();
        assert_eq!(result.returned, 2);
        assert_eq!(mgr.counters().layout_states, 0);
    }
}
