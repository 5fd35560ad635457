//! Object tables
//!
//! Every piece of server state lives in one [`StateTables`] value guarded by
//! the manager's single mutex. Entities are stored in maps keyed by their
//! natural identity and refer to each other by key, so tearing an entity
//! down is a matter of removing it from every index it appears in.
//!
//! Anything that must not run under the lock (closing backing files,
//! callbacks, stable-storage writes, session drains) is collected into a
//! [`DeferredWork`] and executed by the manager after the guard is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::callback::{CallbackInfo, CallbackState, ProbeJob};
use super::client::Credentials;
use super::compound::Nfs4Op;
use super::delegation::{DelegationRecall, DelegationType, Lease, LeaseToken};
use super::lock::LockTable;
use super::session::{CreateSessionReply, Session, SessionDrain, SessionId};
use super::state::{OwnerReply, ShareAccess, ShareDeny};
use super::{ClientKey, Nfs4FileHandle, StateId, StateIdOther, Verifier};
use crate::error::{NfsStatus, StatusResult};
use crate::pnfs::layout::{DeviceNotifyDispatch, LayoutRecall, LayoutRecallDispatch};
use crate::pnfs::segment::{Layout, Released};
use crate::storage::{AccessMode, FileIdentity, FileObject, StorageBackend};

pub(crate) type OwnerId = u32;
pub(crate) type FileId = u32;
pub(crate) type DelegId = u32;
pub(crate) type LayoutStateId = u32;
pub(crate) type RecallId = u64;

/// A client record, confirmed or not
#[derive(Debug)]
pub(crate) struct Client {
    pub key: ClientKey,
    pub name: Vec<u8>,
    pub verifier: Verifier,
    pub confirm: Verifier,
    pub creds: Credentials,
    pub peer: SocketAddr,
    pub minor_version: u32,
    pub callback: CallbackInfo,
    pub cb_state: CallbackState,
    pub exchange_flags: u32,
    pub last_renewed: Instant,
    pub lru_seq: u64,
    /// Next CREATE_SESSION sequence id expected (minor version 1)
    pub cs_seqid: u32,
    pub cs_reply: Option<StatusResult<CreateSessionReply>>,
    pub reclaim_complete: bool,
    pub open_owners: BTreeSet<OwnerId>,
    pub lock_owners: BTreeSet<OwnerId>,
    pub delegations: BTreeSet<DelegId>,
    pub layout_states: BTreeSet<LayoutStateId>,
    pub layout_recalls: BTreeSet<RecallId>,
    pub sessions: BTreeSet<SessionId>,
}

impl Client {
    pub fn holds_state(&self) -> bool {
        !self.open_owners.is_empty()
            || !self.lock_owners.is_empty()
            || !self.delegations.is_empty()
            || !self.layout_states.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OwnerKind {
    Open,
    Lock,
}

/// Last reply sent to an owner, replayed on a retransmitted seqid
#[derive(Debug, Clone)]
pub(crate) struct ReplayEntry {
    pub seqid: u32,
    pub op: Nfs4Op,
    pub reply: StatusResult<OwnerReply>,
}

#[derive(Debug)]
pub(crate) struct StateOwner {
    pub id: OwnerId,
    pub kind: OwnerKind,
    pub owner: Vec<u8>,
    pub client: ClientKey,
    pub last_seqid: u32,
    pub confirmed: bool,
    pub replay: Option<ReplayEntry>,
    pub stateids: BTreeSet<StateIdOther>,
    pub closed_at: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct OpenState {
    pub access: ShareAccess,
    pub deny: ShareDeny,
    pub fd_mode: AccessMode,
    pub locks: BTreeSet<StateIdOther>,
}

#[derive(Debug)]
pub(crate) enum StateKind {
    Open(OpenState),
    Lock { open: StateIdOther },
}

/// Open or lock stateid
#[derive(Debug)]
pub(crate) struct StateEntry {
    pub other: StateIdOther,
    pub generation: u32,
    pub owner: OwnerId,
    pub file: FileId,
    pub client: ClientKey,
    pub kind: StateKind,
}

impl StateEntry {
    pub fn stateid(&self) -> StateId {
        StateId::from_parts(self.generation, self.other)
    }

    pub fn open(&self) -> Option<&OpenState> {
        match &self.kind {
            StateKind::Open(open) => Some(open),
            StateKind::Lock { .. } => None,
        }
    }

    pub fn open_mut(&mut self) -> Option<&mut OpenState> {
        match &mut self.kind {
            StateKind::Open(open) => Some(open),
            StateKind::Lock { .. } => None,
        }
    }
}

/// A managed filesystem object
#[derive(Debug)]
pub(crate) struct File {
    pub id: FileId,
    pub fh: Nfs4FileHandle,
    pub identity: FileIdentity,
    pub stateids: BTreeSet<StateIdOther>,
    pub delegations: BTreeSet<DelegId>,
    pub layout_states: BTreeSet<LayoutStateId>,
    pub locks: LockTable,
    pub had_conflict: bool,
    fds: [Option<Arc<dyn FileObject>>; 3],
    access_refs: [u32; 3],
}

impl File {
    fn new(id: FileId, fh: Nfs4FileHandle, identity: FileIdentity) -> Self {
        Self {
            id,
            fh,
            identity,
            stateids: BTreeSet::new(),
            delegations: BTreeSet::new(),
            layout_states: BTreeSet::new(),
            locks: LockTable::new(),
            had_conflict: false,
            fds: [None, None, None],
            access_refs: [0; 3],
        }
    }

    fn unused(&self) -> bool {
        self.stateids.is_empty()
            && self.delegations.is_empty()
            && self.layout_states.is_empty()
            && self.locks.is_empty()
            && self.access_refs.iter().all(|r| *r == 0)
    }
}

#[derive(Debug)]
pub(crate) struct Delegation {
    pub id: DelegId,
    pub stateid: StateId,
    pub client: ClientKey,
    pub file: FileId,
    pub dtype: DelegationType,
    pub fd_mode: AccessMode,
    pub token: LeaseToken,
    pub recall_time: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct LayoutState {
    pub id: LayoutStateId,
    pub generation: u32,
    pub client: ClientKey,
    pub file: FileId,
    pub segments: Vec<Layout>,
}

impl LayoutState {
    pub fn stateid(&self, boot: u32) -> StateId {
        StateId::from_parts(
            self.generation,
            StateIdOther::new(boot, super::LAYOUT_OWNER, self.id),
        )
    }
}

/// Side effects collected under the lock and run after it is released
#[derive(Default)]
pub(crate) struct DeferredWork {
    pub closes: Vec<Arc<dyn FileObject>>,
    pub layout_returns: Vec<(Nfs4FileHandle, Released)>,
    pub recalls: Vec<DelegationRecall>,
    pub layout_recalls: Vec<LayoutRecallDispatch>,
    pub device_notifies: Vec<DeviceNotifyDispatch>,
    pub probes: Vec<ProbeJob>,
    pub records_created: Vec<Vec<u8>>,
    pub records_removed: Vec<Vec<u8>>,
    pub session_drains: Vec<SessionDrain>,
    pub channels_dropped: Vec<ClientKey>,
}

impl DeferredWork {
    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
            && self.layout_returns.is_empty()
            && self.recalls.is_empty()
            && self.layout_recalls.is_empty()
            && self.device_notifies.is_empty()
            && self.probes.is_empty()
            && self.records_created.is_empty()
            && self.records_removed.is_empty()
            && self.session_drains.is_empty()
            && self.channels_dropped.is_empty()
    }
}

/// All server state
pub(crate) struct StateTables {
    pub boot: u32,
    pub lease: Duration,
    pub grace: bool,
    pub delegations_enabled: bool,
    pub max_delegations: usize,
    pub pnfs_enabled: bool,
    pub max_session_slots: u32,

    next_client: u32,
    next_owner: u32,
    next_file: u32,
    next_deleg: u32,
    next_layout: u32,
    next_recall: u64,
    next_lease: u64,
    pub(crate) next_session: u32,
    lru_counter: u64,
    confirm_counter: u64,

    pub confirmed: HashMap<ClientKey, Client>,
    pub unconfirmed: HashMap<ClientKey, Client>,
    pub confirmed_names: HashMap<Vec<u8>, ClientKey>,
    pub unconfirmed_names: HashMap<Vec<u8>, ClientKey>,
    /// Eviction order: oldest renewal first; value is (key, confirmed)
    pub client_lru: BTreeMap<u64, (ClientKey, bool)>,

    pub owners: HashMap<OwnerId, StateOwner>,
    pub owner_index: HashMap<(ClientKey, OwnerKind, Vec<u8>), OwnerId>,
    pub files: HashMap<FileId, File>,
    pub file_index: HashMap<FileIdentity, FileId>,
    pub stateids: HashMap<StateIdOther, StateEntry>,
    pub delegations: HashMap<DelegId, Delegation>,
    pub leases: HashMap<LeaseToken, Lease>,
    /// Recalled delegations by recall time; entries for returned delegations are skipped lazily
    pub recall_queue: VecDeque<(Instant, DelegId)>,
    /// Open owners kept after their last CLOSE to answer replays
    pub close_lru: VecDeque<(Instant, OwnerId)>,
    pub sessions: HashMap<SessionId, Session>,
    pub layout_states: HashMap<LayoutStateId, LayoutState>,
    pub layout_index: HashMap<(ClientKey, FileId), LayoutStateId>,
    pub layout_recalls: HashMap<RecallId, LayoutRecall>,
    /// Administrative identities allowed to reclaim during grace
    pub reclaimable: HashSet<Vec<u8>>,
}

impl StateTables {
    pub fn new(boot: u32, lease: Duration, grace: bool) -> Self {
        Self {
            boot,
            lease,
            grace,
            delegations_enabled: true,
            max_delegations: usize::MAX,
            pnfs_enabled: true,
            max_session_slots: 64,
            next_client: 1,
            next_owner: 1,
            next_file: 1,
            next_deleg: 1,
            next_layout: 1,
            next_recall: 1,
            next_lease: 1,
            next_session: 1,
            lru_counter: 0,
            confirm_counter: 0,
            confirmed: HashMap::new(),
            unconfirmed: HashMap::new(),
            confirmed_names: HashMap::new(),
            unconfirmed_names: HashMap::new(),
            client_lru: BTreeMap::new(),
            owners: HashMap::new(),
            owner_index: HashMap::new(),
            files: HashMap::new(),
            file_index: HashMap::new(),
            stateids: HashMap::new(),
            delegations: HashMap::new(),
            leases: HashMap::new(),
            recall_queue: VecDeque::new(),
            close_lru: VecDeque::new(),
            sessions: HashMap::new(),
            layout_states: HashMap::new(),
            layout_index: HashMap::new(),
            layout_recalls: HashMap::new(),
            reclaimable: HashSet::new(),
        }
    }

    // =========================================================================
    // Id allocation
    // =========================================================================

    pub fn alloc_client_key(&mut self) -> StatusResult<ClientKey> {
        let id = self.next_client;
        self.next_client = id.checked_add(1).ok_or(NfsStatus::ResourceExhausted)?;
        Ok(ClientKey::new(self.boot, id))
    }

    pub fn alloc_confirm(&mut self) -> Verifier {
        self.confirm_counter += 1;
        Verifier::from_u64((u64::from(self.boot) << 32) | self.confirm_counter)
    }

    fn alloc_owner_id(&mut self) -> StatusResult<OwnerId> {
        let id = self.next_owner;
        // 0 and u32::MAX are reserved for delegation and layout stateids
        if id == super::LAYOUT_OWNER {
            return Err(NfsStatus::ResourceExhausted);
        }
        self.next_owner += 1;
        Ok(id)
    }

    pub fn alloc_deleg_id(&mut self) -> StatusResult<DelegId> {
        let id = self.next_deleg;
        self.next_deleg = id.checked_add(1).ok_or(NfsStatus::ResourceExhausted)?;
        Ok(id)
    }

    pub fn alloc_layout_id(&mut self) -> StatusResult<LayoutStateId> {
        let id = self.next_layout;
        self.next_layout = id.checked_add(1).ok_or(NfsStatus::ResourceExhausted)?;
        Ok(id)
    }

    pub fn alloc_recall_id(&mut self) -> RecallId {
        let id = self.next_recall;
        self.next_recall += 1;
        id
    }

    pub fn alloc_lease_token(&mut self) -> LeaseToken {
        let token = LeaseToken(self.next_lease);
        self.next_lease += 1;
        token
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// Insert a client record and put it at the young end of the eviction queue
    pub fn hash_client(&mut self, mut client: Client, confirmed: bool, now: Instant) {
        self.lru_counter += 1;
        client.lru_seq = self.lru_counter;
        client.last_renewed = now;
        self.client_lru
            .insert(client.lru_seq, (client.key, confirmed));
        if confirmed {
            self.confirmed_names.insert(client.name.clone(), client.key);
            self.confirmed.insert(client.key, client);
        } else {
            self.unconfirmed_names.insert(client.name.clone(), client.key);
            self.unconfirmed.insert(client.key, client);
        }
    }

    /// Move a client to the young end of the eviction queue and stamp its lease
    pub fn renew_client(&mut self, key: ClientKey, confirmed: bool, now: Instant) {
        self.lru_counter += 1;
        let seq = self.lru_counter;
        let map = if confirmed {
            &mut self.confirmed
        } else {
            &mut self.unconfirmed
        };
        if let Some(client) = map.get_mut(&key) {
            self.client_lru.remove(&client.lru_seq);
            // last_renewed never moves backwards
            if now > client.last_renewed {
                client.last_renewed = now;
            }
            client.lru_seq = seq;
            self.client_lru.insert(seq, (key, confirmed));
        }
    }

    /// Look up a confirmed client, distinguishing stale from expired ids
    pub fn confirmed_client(&self, key: ClientKey) -> StatusResult<&Client> {
        if key.boot != self.boot {
            return Err(NfsStatus::StaleClientId);
        }
        self.confirmed.get(&key).ok_or(NfsStatus::Expired)
    }

    pub fn confirmed_client_mut(&mut self, key: ClientKey) -> StatusResult<&mut Client> {
        if key.boot != self.boot {
            return Err(NfsStatus::StaleClientId);
        }
        self.confirmed.get_mut(&key).ok_or(NfsStatus::Expired)
    }

    /// Remove a client and everything it owns
    ///
    /// Returns `None` when the client was already gone, which makes repeated
    /// expiry a no-op.
    pub fn unhash_client(
        &mut self,
        key: ClientKey,
        confirmed: bool,
        work: &mut DeferredWork,
    ) -> Option<Client> {
        let client = if confirmed {
            self.confirmed.remove(&key)?
        } else {
            self.unconfirmed.remove(&key)?
        };
        self.client_lru.remove(&client.lru_seq);
        let names = if confirmed {
            &mut self.confirmed_names
        } else {
            &mut self.unconfirmed_names
        };
        if names.get(&client.name) == Some(&key) {
            names.remove(&client.name);
        }

        for id in &client.delegations {
            self.unhash_delegation(*id, work);
        }
        for id in &client.layout_states {
            self.unhash_layout_state(*id, work);
        }
        for id in &client.layout_recalls {
            self.layout_recalls.remove(id);
        }
        for id in client.open_owners.iter().chain(client.lock_owners.iter()) {
            self.release_owner(*id, work);
        }
        for id in &client.sessions {
            if let Some(session) = self.sessions.remove(id) {
                work.session_drains.push(session.into_drain());
            }
        }
        if confirmed {
            work.records_removed.push(client.name.clone());
            work.channels_dropped.push(key);
        }
        debug!(
            "unhashed {} client {}",
            if confirmed { "confirmed" } else { "unconfirmed" },
            key
        );
        Some(client)
    }

    // =========================================================================
    // Owners
    // =========================================================================

    pub fn find_owner(&self, client: ClientKey, kind: OwnerKind, owner: &[u8]) -> Option<OwnerId> {
        self.owner_index
            .get(&(client, kind, owner.to_vec()))
            .copied()
    }

    pub fn create_owner(
        &mut self,
        client: ClientKey,
        kind: OwnerKind,
        owner: &[u8],
        seqid: u32,
    ) -> StatusResult<OwnerId> {
        let id = self.alloc_owner_id()?;
        let client_record = self.confirmed.get_mut(&client).ok_or(NfsStatus::Expired)?;
        match kind {
            OwnerKind::Open => client_record.open_owners.insert(id),
            OwnerKind::Lock => client_record.lock_owners.insert(id),
        };
        self.owner_index.insert((client, kind, owner.to_vec()), id);
        self.owners.insert(
            id,
            StateOwner {
                id,
                kind,
                owner: owner.to_vec(),
                client,
                last_seqid: seqid.wrapping_sub(1),
                confirmed: false,
                replay: None,
                stateids: BTreeSet::new(),
                closed_at: None,
            },
        );
        Ok(id)
    }

    /// Remove an owner and all of its stateids
    pub fn release_owner(&mut self, id: OwnerId, work: &mut DeferredWork) {
        let stateids: Vec<StateIdOther> = match self.owners.get(&id) {
            Some(owner) => owner.stateids.iter().copied().collect(),
            None => return,
        };
        for other in stateids {
            self.release_stateid(other, work);
        }
        let Some(owner) = self.owners.remove(&id) else {
            return;
        };
        self.owner_index
            .remove(&(owner.client, owner.kind, owner.owner.clone()));
        if let Some(client) = self.confirmed.get_mut(&owner.client) {
            match owner.kind {
                OwnerKind::Open => client.open_owners.remove(&owner.id),
                OwnerKind::Lock => client.lock_owners.remove(&owner.id),
            };
        }
        debug!("released {:?} owner {} of client {}", owner.kind, owner.id, owner.client);
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub fn find_or_create_file(&mut self, fh: &Nfs4FileHandle, identity: FileIdentity) -> FileId {
        if let Some(id) = self.file_index.get(&identity) {
            return *id;
        }
        let id = self.next_file;
        self.next_file = self.next_file.wrapping_add(1).max(1);
        self.files.insert(id, File::new(id, fh.clone(), identity));
        self.file_index.insert(identity, id);
        id
    }

    /// Take a reference on the backing file object for `mode`, opening it if needed
    pub fn get_file_access(
        &mut self,
        file: FileId,
        mode: AccessMode,
        storage: &dyn StorageBackend,
    ) -> StatusResult<()> {
        let file = self.files.get_mut(&file).ok_or(NfsStatus::ServerFault)?;
        let slot = mode.index();
        if file.fds[slot].is_none() {
            file.fds[slot] = Some(storage.open(&file.fh, mode)?);
        }
        file.access_refs[slot] += 1;
        Ok(())
    }

    pub fn put_file_access(&mut self, file: FileId, mode: AccessMode, work: &mut DeferredWork) {
        let Some(file) = self.files.get_mut(&file) else {
            return;
        };
        let slot = mode.index();
        file.access_refs[slot] = file.access_refs[slot].saturating_sub(1);
        if file.access_refs[slot] == 0 {
            if let Some(fd) = file.fds[slot].take() {
                work.closes.push(fd);
            }
        }
    }

    pub fn maybe_release_file(&mut self, id: FileId) {
        let unused = self.files.get(&id).map(File::unused).unwrap_or(false);
        if unused {
            if let Some(file) = self.files.remove(&id) {
                self.file_index.remove(&file.identity);
            }
        }
    }

    // =========================================================================
    // Stateids
    // =========================================================================

    /// Remove an open or lock stateid; open stateids take their lock stateids with them
    pub fn release_stateid(&mut self, other: StateIdOther, work: &mut DeferredWork) {
        let Some(entry) = self.stateids.remove(&other) else {
            return;
        };
        if let Some(owner) = self.owners.get_mut(&entry.owner) {
            owner.stateids.remove(&other);
        }
        if let Some(file) = self.files.get_mut(&entry.file) {
            file.stateids.remove(&other);
        }
        match entry.kind {
            StateKind::Open(open) => {
                for lock in open.locks {
                    self.release_lock_stateid(lock, work);
                }
                self.put_file_access(entry.file, open.fd_mode, work);
            }
            StateKind::Lock { open } => {
                if let Some(file) = self.files.get_mut(&entry.file) {
                    file.locks.release_owner(entry.owner);
                }
                if let Some(parent) = self.stateids.get_mut(&open).and_then(StateEntry::open_mut) {
                    parent.locks.remove(&other);
                }
            }
        }
        self.maybe_release_file(entry.file);
    }

    /// Release a lock stateid and, once it owns nothing, its lock owner
    pub fn release_lock_stateid(&mut self, other: StateIdOther, work: &mut DeferredWork) {
        let owner = match self.stateids.get(&other) {
            Some(entry) => entry.owner,
            None => return,
        };
        self.release_stateid(other, work);
        let idle = self
            .owners
            .get(&owner)
            .map(|o| o.stateids.is_empty())
            .unwrap_or(false);
        if idle {
            self.release_owner(owner, work);
        }
    }

    // =========================================================================
    // Delegations and layouts
    // =========================================================================

    pub fn unhash_delegation(&mut self, id: DelegId, work: &mut DeferredWork) -> Option<Delegation> {
        let deleg = self.delegations.remove(&id)?;
        self.leases.remove(&deleg.token);
        if let Some(client) = self.confirmed.get_mut(&deleg.client) {
            client.delegations.remove(&id);
        }
        if let Some(file) = self.files.get_mut(&deleg.file) {
            file.delegations.remove(&id);
        }
        self.put_file_access(deleg.file, deleg.fd_mode, work);
        self.maybe_release_file(deleg.file);
        Some(deleg)
    }

    pub fn unhash_layout_state(&mut self, id: LayoutStateId, work: &mut DeferredWork) {
        let Some(state) = self.layout_states.remove(&id) else {
            return;
        };
        self.layout_index.remove(&(state.client, state.file));
        if let Some(client) = self.confirmed.get_mut(&state.client) {
            client.layout_states.remove(&id);
        }
        if let Some(file) = self.files.get_mut(&state.file) {
            file.layout_states.remove(&id);
            for segment in &state.segments {
                work.layout_returns.push((
                    file.fh.clone(),
                    Released {
                        layout_type: segment.layout_type,
                        iomode: segment.iomode,
                        range: segment.range,
                    },
                ));
            }
        }
        self.maybe_release_file(state.file);
    }

    pub fn counters(&self) -> crate::manager::StateCounters {
        let (mut opens, mut locks) = (0, 0);
        for entry in self.stateids.values() {
            match entry.kind {
                StateKind::Open(_) => opens += 1,
                StateKind::Lock { .. } => locks += 1,
            }
        }
        crate::manager::StateCounters {
            confirmed_clients: self.confirmed.len(),
            unconfirmed_clients: self.unconfirmed.len(),
            open_stateids: opens,
            lock_stateids: locks,
            delegations: self.delegations.len(),
            layout_states: self.layout_states.len(),
            layout_segments: self.layout_states.values().map(|s| s.segments.len()).sum(),
            layout_recalls: self.layout_recalls.len(),
            sessions: self.sessions.len(),
            files: self.files.len(),
        }
    }
}
