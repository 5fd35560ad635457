//! Delegation engine
//!
//! Grants read and write delegations with OPEN, recalls them when a
//! conflicting access shows up, and takes them back on DELEGRETURN or when a
//! recall goes unanswered for a whole lease.
//!
//! Every delegation sits on an advisory lease. The storage layer reports
//! local accesses through [`AdvisoryLock::break_notify`], which is what
//! starts a recall for accesses that never pass through the NFS server.

use std::sync::{Arc, Weak};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::callback::{CallbackRequest, CallbackRoute, CallbackState};
use super::compound::CompoundContext;
use super::state::{check_generation, OpenClaim, ShareAccess};
use super::tables::{DeferredWork, DelegId, Delegation, FileId, OwnerId, StateEntry, StateTables};
use super::{ClientKey, Nfs4FileHandle, StateId, StateIdOther, DELEGATION_OWNER};
use crate::error::{NfsStatus, StatusResult};
use crate::manager::{Inner, StateManager};
use crate::storage::{AccessMode, StorageBackend};

/// Delegation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DelegationType {
    /// No delegation
    None = 0,
    /// Read delegation
    Read = 1,
    /// Write delegation
    Write = 2,
}

impl TryFrom<u32> for DelegationType {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            _ => Err(NfsStatus::Inval),
        }
    }
}

/// Handle to an advisory lease on a backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub(crate) u64);

/// An advisory lease and the delegation riding on it, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lease {
    pub file: FileId,
    pub dtype: DelegationType,
    pub delegation: Option<DelegId>,
}

/// Delegation handed out with an OPEN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationGrant {
    /// Delegation stateid
    pub stateid: StateId,
    /// Read or write
    pub dtype: DelegationType,
    /// Client should return it at once (reclaimed without a callback path)
    pub recall: bool,
}

/// A CB_RECALL waiting to be sent
pub(crate) struct DelegationRecall {
    pub route: CallbackRoute,
    pub id: DelegId,
    pub stateid: StateId,
    pub fh: Nfs4FileHandle,
}

/// Advisory lease capability used by the storage layer
///
/// `break_notify` is the hook for local accesses: the storage layer calls it
/// before letting a local open proceed, and any delegation incompatible with
/// that access is recalled.
pub trait AdvisoryLock: Send + Sync {
    /// Take a lease of the given type on a file
    fn acquire(&self, fh: &Nfs4FileHandle, dtype: DelegationType) -> Option<LeaseToken>;

    /// A local access in `mode` is about to happen
    fn break_notify(&self, fh: &Nfs4FileHandle, mode: AccessMode);

    /// The lease was revoked underneath us
    fn release_notify(&self, token: LeaseToken);

    /// Whether an access in `mode` can proceed without breaking the lease
    fn compatible_with(&self, token: LeaseToken, mode: AccessMode) -> bool;
}

fn lease_conflicts(tables: &StateTables, file: FileId, client: ClientKey, dtype: DelegationType) -> bool {
    let other_leases = tables.leases.values().filter(|l| l.file == file);
    for lease in other_leases {
        if lease.dtype == DelegationType::Write || dtype == DelegationType::Write {
            return true;
        }
    }
    let Some(record) = tables.files.get(&file) else {
        return true;
    };
    record.stateids.iter().any(|other| {
        tables
            .stateids
            .get(other)
            .filter(|e| e.client != client)
            .and_then(StateEntry::open)
            .map(|open| dtype == DelegationType::Write || open.access.contains(ShareAccess::WRITE))
            .unwrap_or(false)
    })
}

/// Take an advisory lease; `None` when a conflicting lease or open exists
pub(crate) fn acquire_lease(
    tables: &mut StateTables,
    file: FileId,
    client: ClientKey,
    dtype: DelegationType,
) -> Option<LeaseToken> {
    if dtype == DelegationType::None || lease_conflicts(tables, file, client, dtype) {
        return None;
    }
    let token = tables.alloc_lease_token();
    tables.leases.insert(
        token,
        Lease {
            file,
            dtype,
            delegation: None,
        },
    );
    Some(token)
}

/// Delegations held by other clients that conflict with an access
pub(crate) fn conflicting_delegations(
    tables: &StateTables,
    file: FileId,
    client: ClientKey,
    write: bool,
) -> Vec<DelegId> {
    let Some(record) = tables.files.get(&file) else {
        return Vec::new();
    };
    record
        .delegations
        .iter()
        .filter_map(|id| tables.delegations.get(id))
        .filter(|d| d.client != client && (write || d.dtype == DelegationType::Write))
        .map(|d| d.id)
        .collect()
}

/// Validate the delegation stateid presented with CLAIM_DELEGATE_CUR
pub(crate) fn check_delegation_stateid(
    tables: &StateTables,
    stateid: &StateId,
    client: ClientKey,
    file: FileId,
    session: bool,
) -> StatusResult<()> {
    let other = stateid.identity();
    if other.boot != tables.boot {
        return Err(NfsStatus::StaleStateId);
    }
    if !other.is_delegation() {
        return Err(NfsStatus::BadStateId);
    }
    let deleg = tables.delegations.get(&other.file).ok_or(NfsStatus::BadStateId)?;
    if deleg.client != client || deleg.file != file {
        return Err(NfsStatus::BadStateId);
    }
    check_generation(session, deleg.stateid.seqid, stateid.seqid)
}

/// Hand out a delegation with an open, if policy and the lease layer allow it
#[allow(clippy::too_many_arguments)]
pub(crate) fn try_grant(
    tables: &mut StateTables,
    storage: &dyn StorageBackend,
    ctx: &CompoundContext,
    owner: OwnerId,
    open: StateIdOther,
    claim: OpenClaim,
    access: ShareAccess,
    now: Instant,
) -> Option<DelegationGrant> {
    if !tables.delegations_enabled || tables.delegations.len() >= tables.max_delegations {
        return None;
    }
    if access.contains(ShareAccess::WANT_NO_DELEG) {
        return None;
    }
    let entry = tables.stateids.get(&open)?;
    let (client, file) = (entry.client, entry.file);
    let open_access = entry.open()?.access;
    let client_record = tables.confirmed.get(&client)?;
    let healthy = client_record.cb_state == CallbackState::Healthy;
    let owner_confirmed = ctx.is_session() || tables.owners.get(&owner).map(|o| o.confirmed).unwrap_or(false);
    let file_record = tables.files.get(&file)?;
    let already_held = file_record
        .delegations
        .iter()
        .any(|id| tables.delegations.get(id).map(|d| d.client) == Some(client));
    if already_held {
        return None;
    }

    let (dtype, recall) = match claim {
        OpenClaim::Previous(DelegationType::None) => return None,
        OpenClaim::Previous(dtype) => (dtype, !healthy),
        OpenClaim::Null | OpenClaim::Fh => {
            if tables.grace || file_record.had_conflict || !healthy || !owner_confirmed {
                return None;
            }
            let dtype = if open_access.contains(ShareAccess::WRITE) {
                DelegationType::Write
            } else {
                DelegationType::Read
            };
            (dtype, false)
        }
        OpenClaim::DelegateCur(_) => return None,
    };

    let token = acquire_lease(tables, file, client, dtype)?;
    let fd_mode = match dtype {
        DelegationType::Write => AccessMode::ReadWrite,
        _ => AccessMode::Read,
    };
    let id = match tables.alloc_deleg_id() {
        Ok(id) => id,
        Err(_) => {
            tables.leases.remove(&token);
            return None;
        }
    };
    if tables.get_file_access(file, fd_mode, storage).is_err() {
        tables.leases.remove(&token);
        return None;
    }
    let stateid = StateId::from_parts(1, StateIdOther::new(tables.boot, DELEGATION_OWNER, id));
    tables.delegations.insert(
        id,
        Delegation {
            id,
            stateid,
            client,
            file,
            dtype,
            fd_mode,
            token,
            recall_time: None,
        },
    );
    if let Some(lease) = tables.leases.get_mut(&token) {
        lease.delegation = Some(id);
    }
    if let Some(record) = tables.confirmed.get_mut(&client) {
        record.delegations.insert(id);
    }
    if let Some(record) = tables.files.get_mut(&file) {
        record.delegations.insert(id);
    }
    tables.renew_client(client, true, now);
    info!("granted {:?} delegation {} on file {} to client {}", dtype, id, file, client);
    Some(DelegationGrant {
        stateid,
        dtype,
        recall,
    })
}

/// Start recalling a delegation
///
/// Flags the file so no new delegations are handed out on it and queues the
/// delegation for forced expiry. The CB_RECALL itself is only sent over a
/// healthy callback path; otherwise the laundromat reclaims the delegation
/// after a lease.
pub(crate) fn begin_recall(tables: &mut StateTables, id: DelegId, now: Instant, work: &mut DeferredWork) {
    let Some(deleg) = tables.delegations.get_mut(&id) else {
        return;
    };
    if deleg.recall_time.is_some() {
        return;
    }
    deleg.recall_time = Some(now);
    let (client, file, stateid) = (deleg.client, deleg.file, deleg.stateid);
    tables.recall_queue.push_back((now, id));
    let Some(record) = tables.files.get_mut(&file) else {
        return;
    };
    record.had_conflict = true;
    let fh = record.fh.clone();

    let healthy = tables
        .confirmed
        .get(&client)
        .map(|c| c.cb_state == CallbackState::Healthy)
        .unwrap_or(false);
    if !healthy {
        debug!("delegation {} recalled, client {} has no callback path", id, client);
        return;
    }
    match tables.callback_route(client) {
        Some(route) => work.recalls.push(DelegationRecall {
            route,
            id,
            stateid,
            fh,
        }),
        None => debug!("delegation {} recalled, no route to client {}", id, client),
    }
}

impl StateTables {
    fn file_by_handle(&self, fh: &Nfs4FileHandle) -> Option<FileId> {
        self.files.values().find(|f| f.fh == *fh).map(|f| f.id)
    }
}

/// The manager's [`AdvisoryLock`] implementation, handed to the storage layer
pub struct LeaseBreaker {
    inner: Weak<Inner>,
}

impl LeaseBreaker {
    pub(crate) fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }

    fn manager(&self) -> Option<StateManager> {
        self.inner.upgrade().map(|inner| StateManager { inner })
    }
}

impl AdvisoryLock for LeaseBreaker {
    fn acquire(&self, fh: &Nfs4FileHandle, dtype: DelegationType) -> Option<LeaseToken> {
        let manager = self.manager()?;
        let mut tables = manager.inner.tables.lock();
        let file = tables.file_by_handle(fh)?;
        acquire_lease(&mut tables, file, ClientKey::new(0, 0), dtype)
    }

    fn break_notify(&self, fh: &Nfs4FileHandle, mode: AccessMode) {
        let Some(manager) = self.manager() else {
            return;
        };
        let mut work = DeferredWork::default();
        {
            let mut tables = manager.inner.tables.lock();
            let Some(file) = tables.file_by_handle(fh) else {
                return;
            };
            let conflicts = conflicting_delegations(&tables, file, ClientKey::new(0, 0), mode.can_write());
            let now = Instant::now();
            for id in conflicts {
                begin_recall(&mut tables, id, now, &mut work);
            }
        }
        manager.dispatch(work);
    }

    fn release_notify(&self, token: LeaseToken) {
        let Some(manager) = self.manager() else {
            return;
        };
        let mut work = DeferredWork::default();
        {
            let mut tables = manager.inner.tables.lock();
            let Some(lease) = tables.leases.remove(&token) else {
                return;
            };
            if let Some(id) = lease.delegation {
                warn!("lease under delegation {} revoked", id);
                tables.unhash_delegation(id, &mut work);
            }
        }
        manager.dispatch(work);
    }

    fn compatible_with(&self, token: LeaseToken, mode: AccessMode) -> bool {
        let Some(manager) = self.manager() else {
            return true;
        };
        let tables = manager.inner.tables.lock();
        match tables.leases.get(&token) {
            Some(lease) => lease.dtype == DelegationType::Read && !mode.can_write(),
            None => true,
        }
    }
}

impl StateManager {
    /// The advisory-lock hook to hand to a storage backend
    pub fn lease_breaker(&self) -> Arc<dyn AdvisoryLock> {
        Arc::new(LeaseBreaker::new(Arc::downgrade(&self.inner)))
    }

    /// DELEGRETURN
    pub async fn return_delegation(&self, ctx: &CompoundContext, stateid: StateId) -> StatusResult<()> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            (|| {
                if stateid.is_special() {
                    return Err(NfsStatus::BadStateId);
                }
                let other = stateid.identity();
                if other.boot != tables.boot {
                    return Err(NfsStatus::StaleStateId);
                }
                if !other.is_delegation() {
                    return Err(NfsStatus::BadStateId);
                }
                let deleg = tables.delegations.get(&other.file).ok_or(NfsStatus::BadStateId)?;
                if let Some(bound) = ctx.session_client() {
                    if bound != deleg.client {
                        return Err(NfsStatus::BadStateId);
                    }
                }
                if let Some(fh) = &ctx.current_fh {
                    let on_file = tables.files.get(&deleg.file).map(|f| f.fh == *fh).unwrap_or(false);
                    if !on_file {
                        return Err(NfsStatus::BadStateId);
                    }
                }
                check_generation(ctx.is_session(), deleg.stateid.seqid, stateid.seqid)?;
                let client = deleg.client;
                tables.unhash_delegation(other.file, &mut work);
                tables.renew_client(client, true, Instant::now());
                info!("delegation {} returned by client {}", other.file, client);
                Ok(())
            })()
        };
        self.finish(work).await;
        result
    }

    /// Recall every delegation on a file; returns how many recalls started
    pub async fn recall_delegations(&self, fh: &Nfs4FileHandle) -> usize {
        let mut work = DeferredWork::default();
        let started = {
            let mut tables = self.inner.tables.lock();
            let ids: Vec<DelegId> = match tables.file_by_handle(fh) {
                Some(file) => tables
                    .files
                    .get(&file)
                    .map(|f| f.delegations.iter().copied().collect())
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            let now = Instant::now();
            let mut started = 0;
            for id in ids {
                let fresh = tables
                    .delegations
                    .get(&id)
                    .map(|d| d.recall_time.is_none())
                    .unwrap_or(false);
                if fresh {
                    begin_recall(&mut tables, id, now, &mut work);
                    started += 1;
                }
            }
            started
        };
        self.finish(work).await;
        started
    }

    /// Send a CB_RECALL in the background
    pub(crate) fn spawn_delegation_recall(&self, job: DelegationRecall) {
        let manager = self.clone();
        self.inner.callbacks.spawn(async move {
            let client = job.route.client();
            let request = CallbackRequest::Recall {
                stateid: job.stateid,
                truncate: false,
                fh: job.fh.clone(),
            };
            let result = manager.inner.callbacks.call(&job.route, request).await;
            drop(job.route);
            match result {
                Ok(()) => debug!("CB_RECALL of delegation {} delivered", job.id),
                Err(err) if err.is_network() => {
                    warn!("CB_RECALL of delegation {} failed: {}", job.id, err);
                    manager.mark_callback_broken(client);
                }
                Err(err) => debug!("CB_RECALL of delegation {} rejected: {}", job.id, err),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::state::{OpenArgs, ShareDeny};
    use crate::testing::{confirmed_v0, ctx_v0, file, healthy_v0, manager};

    #[test]
    fn test_delegation_type() {
        assert_eq!(DelegationType::try_from(2), Ok(DelegationType::Write));
        assert!(DelegationType::try_from(3).is_err());
    }

    #[tokio::test]
    async fn test_no_delegation_without_callback_path() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        // owner not yet confirmed, and no probe has succeeded
        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"o", 1, fh))
            .await
            .unwrap();
        assert!(open.delegation.is_none());
    }

    #[tokio::test]
    async fn test_read_delegation_granted_and_returned() {
        let (mgr, storage, transport) = manager();
        let ctx = ctx_v0();
        let client = healthy_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"o", 1, fh.clone()))
            .await
            .unwrap();
        mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();
        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"o", 3, fh.clone()))
            .await
            .unwrap();
        let grant = open.delegation.unwrap();
        assert_eq!(grant.dtype, DelegationType::Read);
        assert!(grant.stateid.identity().is_delegation());
        assert_eq!(mgr.counters().delegations, 1);

        // a local writer breaks the lease
        storage.local_access(&fh, AccessMode::Write);
        mgr.callbacks().drain().await;
        assert_eq!(transport.count("CB_RECALL"), 1);

        let ctx = ctx_v0().with_fh(fh);
        mgr.return_delegation(&ctx, grant.stateid).await.unwrap();
        assert_eq!(mgr.counters().delegations, 0);
        assert_eq!(
            mgr.return_delegation(&ctx, grant.stateid).await,
            Err(NfsStatus::BadStateId)
        );
    }

    #[tokio::test]
    async fn test_conflicting_open_recalls_and_delays() {
        let (mgr, storage, transport) = manager();
        let ctx = ctx_v0();
        let c1 = healthy_v0(&mgr, &ctx, b"c1").await;
        let c2 = confirmed_v0(&mgr, &ctx, b"c2").await;
        let fh = file(&storage, 1);

        let open = mgr
            .process_open(&ctx, OpenArgs::new(c1, b"o", 1, fh.clone()))
            .await
            .unwrap();
        mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();
        let open = mgr
            .process_open(&ctx, OpenArgs::new(c1, b"o", 3, fh.clone()))
            .await
            .unwrap();
        assert!(open.delegation.is_some());

        let writer = OpenArgs::new(c2, b"w", 1, fh.clone()).with_share(ShareAccess::WRITE, ShareDeny::NONE);
        assert_eq!(mgr.process_open(&ctx, writer.clone()).await, Err(NfsStatus::Delay));
        mgr.callbacks().drain().await;
        assert_eq!(transport.count("CB_RECALL"), 1);

        // once returned the writer gets in, without a delegation of its own
        mgr.return_delegation(&ctx, open.delegation.unwrap().stateid)
            .await
            .unwrap();
        let writer = OpenArgs { seqid: 2, ..writer };
        let opened = mgr.process_open(&ctx, writer).await.unwrap();
        assert!(opened.delegation.is_none());
    }
}
