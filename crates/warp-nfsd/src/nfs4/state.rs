//! Open/lock state machine
//!
//! OPEN, OPEN_CONFIRM, OPEN_DOWNGRADE, CLOSE, LOCK, LOCKT, LOCKU and the
//! stateid checks shared by them and by READ/WRITE/SETATTR.
//!
//! Minor version 0 orders requests per owner with a sequence id and keeps
//! the last reply of every owner for retransmissions. Minor version 1 gets
//! ordering from the session slot, so owner sequence ids are ignored there.

use tokio::time::Instant;
use tracing::debug;

use super::compound::{CompoundContext, Nfs4Op};
use super::delegation::{self, DelegationGrant, DelegationType};
use super::lock::{LockSpan, LockType};
use super::tables::{
    DeferredWork, FileId, OpenState, OwnerId, OwnerKind, ReplayEntry, StateEntry, StateKind,
    StateTables,
};
use super::{ClientKey, Nfs4FileHandle, StateId, StateIdOther};
use crate::error::{NfsStatus, StatusResult};
use crate::manager::StateManager;
use crate::storage::{AccessMode, StorageBackend};

/// Share access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareAccess(u32);

impl ShareAccess {
    /// Read access
    pub const READ: Self = Self(0x00000001);
    /// Write access
    pub const WRITE: Self = Self(0x00000002);
    /// Both read and write
    pub const BOTH: Self = Self(0x00000003);
    /// Want read delegation
    pub const WANT_READ_DELEG: Self = Self(0x00000100);
    /// Want write delegation
    pub const WANT_WRITE_DELEG: Self = Self(0x00000200);
    /// Want no delegation
    pub const WANT_NO_DELEG: Self = Self(0x00000400);

    const ACCESS_MASK: u32 = 0x3;
    const WANT_MASK: u32 = 0xFF00;

    /// Check if contains a flag
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Create from raw value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Read/write bits only, without delegation wants
    pub fn access(&self) -> Self {
        Self(self.0 & Self::ACCESS_MASK)
    }

    /// Delegation want bits
    pub fn want(&self) -> u32 {
        self.0 & Self::WANT_MASK
    }

    fn union(&self, other: Self) -> Self {
        Self(self.access().0 | other.access().0)
    }

    fn is_subset_of(&self, other: Self) -> bool {
        self.access().0 & !other.access().0 == 0
    }

    /// Backing file mode needed to honour this access
    pub fn mode(&self) -> AccessMode {
        match self.access().0 {
            1 => AccessMode::Read,
            2 => AccessMode::Write,
            _ => AccessMode::ReadWrite,
        }
    }
}

/// Share deny mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareDeny(u32);

impl ShareDeny {
    /// No deny
    pub const NONE: Self = Self(0x00000000);
    /// Deny read
    pub const READ: Self = Self(0x00000001);
    /// Deny write
    pub const WRITE: Self = Self(0x00000002);
    /// Deny both
    pub const BOTH: Self = Self(0x00000003);

    /// Check if contains a flag
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Create from raw value
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    fn union(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }
}

/// Whether two share reservations may coexist on a file
pub fn shares_compatible(
    access: ShareAccess,
    deny: ShareDeny,
    other_access: ShareAccess,
    other_deny: ShareDeny,
) -> bool {
    access.access().0 & other_deny.0 == 0 && other_access.access().0 & deny.0 == 0
}

/// How OPEN names the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenClaim {
    /// By name, resolved to a file handle by the caller
    Null,
    /// Reclaim after server restart; carries the delegation type held before
    Previous(DelegationType),
    /// Open under a delegation the client holds
    DelegateCur(StateId),
    /// By current file handle (minor version 1)
    Fh,
}

impl OpenClaim {
    fn is_reclaim(&self) -> bool {
        matches!(self, OpenClaim::Previous(_))
    }
}

/// OPEN arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenArgs {
    /// Client id (minor version 0; sessions use the bound client)
    pub client: ClientKey,
    /// Open owner
    pub owner: Vec<u8>,
    /// Owner sequence id
    pub seqid: u32,
    /// Share access and delegation wants
    pub access: ShareAccess,
    /// Share deny
    pub deny: ShareDeny,
    /// Claim
    pub claim: OpenClaim,
    /// Target file
    pub fh: Nfs4FileHandle,
    /// Truncate to zero length
    pub truncate: bool,
}

impl OpenArgs {
    /// Plain CLAIM_NULL open
    pub fn new(client: ClientKey, owner: &[u8], seqid: u32, fh: Nfs4FileHandle) -> Self {
        Self {
            client,
            owner: owner.to_vec(),
            seqid,
            access: ShareAccess::READ,
            deny: ShareDeny::NONE,
            claim: OpenClaim::Null,
            fh,
            truncate: false,
        }
    }

    /// Set share access and deny
    pub fn with_share(mut self, access: ShareAccess, deny: ShareDeny) -> Self {
        self.access = access;
        self.deny = deny;
        self
    }

    /// Set claim
    pub fn with_claim(mut self, claim: OpenClaim) -> Self {
        self.claim = claim;
        self
    }

    /// Truncate the file to zero on success
    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }
}

/// OPEN result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenResult {
    /// Open stateid
    pub stateid: StateId,
    /// OPEN_CONFIRM required before the stateid may be used
    pub confirm_required: bool,
    /// Delegation granted with the open
    pub delegation: Option<DelegationGrant>,
}

/// Lock owner as reported in a LOCK4denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwnerRef {
    /// Client id
    pub client: ClientKey,
    /// Owner bytes
    pub owner: Vec<u8>,
}

/// Description of the lock blocking a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenied {
    /// Offset of the conflicting lock
    pub offset: u64,
    /// Length of the conflicting lock
    pub length: u64,
    /// Type of the conflicting lock
    pub lock_type: LockType,
    /// Holder of the conflicting lock
    pub owner: LockOwnerRef,
}

/// LOCK result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockReply {
    /// Lock stateid
    Granted(StateId),
    /// Conflicting lock
    Denied(LockDenied),
}

/// Who is locking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locker {
    /// First lock of a lock owner, introduced through an open stateid
    NewOwner {
        /// Open owner sequence id
        open_seqid: u32,
        /// Open stateid
        open_stateid: StateId,
        /// Initial lock owner sequence id
        lock_seqid: u32,
        /// Lock owner bytes
        owner: Vec<u8>,
    },
    /// Lock owner with an existing lock stateid
    ExistingOwner {
        /// Lock stateid
        lock_stateid: StateId,
        /// Lock owner sequence id
        lock_seqid: u32,
    },
}

/// LOCK arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Reclaim after server restart
    pub reclaim: bool,
    /// Offset
    pub offset: u64,
    /// Length; `u64::MAX` to end of file
    pub length: u64,
    /// Locker
    pub locker: Locker,
}

/// LOCKT arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTestArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u64,
    /// Client id of the owner
    pub client: ClientKey,
    /// Lock owner bytes
    pub owner: Vec<u8>,
    /// File
    pub fh: Nfs4FileHandle,
}

/// LOCKU arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockUArgs {
    /// Lock type
    pub lock_type: LockType,
    /// Lock owner sequence id
    pub seqid: u32,
    /// Lock stateid
    pub stateid: StateId,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u64,
}

/// Reply kept in an owner's replay cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerReply {
    /// OPEN
    Open(OpenResult),
    /// OPEN_CONFIRM, OPEN_DOWNGRADE, CLOSE, LOCKU
    StateId(StateId),
    /// LOCK
    Lock(LockReply),
}

impl OwnerReply {
    fn into_open(self) -> StatusResult<OpenResult> {
        match self {
            OwnerReply::Open(result) => Ok(result),
            _ => Err(NfsStatus::BadSeqId),
        }
    }

    fn into_stateid(self) -> StatusResult<StateId> {
        match self {
            OwnerReply::StateId(stateid) => Ok(stateid),
            _ => Err(NfsStatus::BadSeqId),
        }
    }

    fn into_lock(self) -> StatusResult<LockReply> {
        match self {
            OwnerReply::Lock(reply) => Ok(reply),
            _ => Err(NfsStatus::BadSeqId),
        }
    }
}

/// Comparison of a presented stateid generation with the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Generation {
    Current,
    Previous,
    Old,
    Future,
}

pub(crate) fn compare_generation(current: u32, presented: u32) -> Generation {
    if presented == current {
        Generation::Current
    } else if presented > current {
        Generation::Future
    } else if presented == current.wrapping_sub(1) {
        Generation::Previous
    } else {
        Generation::Old
    }
}

/// Generation rule shared by every stateid kind
///
/// Sessions may send generation zero to mean "the current one".
pub(crate) fn check_generation(session: bool, current: u32, presented: u32) -> StatusResult<()> {
    if session && presented == 0 {
        return Ok(());
    }
    match compare_generation(current, presented) {
        Generation::Current => Ok(()),
        Generation::Future => Err(NfsStatus::BadStateId),
        Generation::Previous | Generation::Old => Err(NfsStatus::OldStateId),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Open,
    Lock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirm {
    Required,
    Unconfirmed,
}

enum Seqid {
    Proceed,
    Replay(StatusResult<OwnerReply>),
}

fn check_owner_seqid(tables: &StateTables, owner: OwnerId, seqid: u32, op: Nfs4Op) -> StatusResult<Seqid> {
    let owner = tables.owners.get(&owner).ok_or(NfsStatus::BadStateId)?;
    if seqid == owner.last_seqid.wrapping_add(1) {
        return Ok(Seqid::Proceed);
    }
    match &owner.replay {
        Some(entry) if seqid == owner.last_seqid && entry.seqid == seqid && entry.op == op => {
            Ok(Seqid::Replay(entry.reply.clone()))
        }
        _ => Err(NfsStatus::BadSeqId),
    }
}

/// Store a reply against an owner; errors that leave the seqid alone are not stored
fn record_reply(
    tables: &mut StateTables,
    owner: OwnerId,
    seqid: u32,
    op: Nfs4Op,
    reply: &StatusResult<OwnerReply>,
) {
    if let Err(status) = reply {
        if !status.is_seqid_mutating() {
            return;
        }
    }
    if let Some(owner) = tables.owners.get_mut(&owner) {
        owner.last_seqid = seqid;
        owner.replay = Some(ReplayEntry {
            seqid,
            op,
            reply: reply.clone(),
        });
    }
}

/// Validate a seqid-mutating operation on an existing stateid and run `body` on it
///
/// Covers the special/stale/missing stateid checks, the owner sequence id,
/// the generation rule, and recording the reply for retransmissions.
#[allow(clippy::too_many_arguments)]
fn seqid_op<F>(
    tables: &mut StateTables,
    ctx: &CompoundContext,
    stateid: &StateId,
    seqid: u32,
    op: Nfs4Op,
    want: Want,
    confirm: Confirm,
    body: F,
) -> StatusResult<OwnerReply>
where
    F: FnOnce(&mut StateTables, StateIdOther) -> StatusResult<OwnerReply>,
{
    if stateid.is_special() {
        return Err(NfsStatus::BadStateId);
    }
    let other = stateid.identity();
    if other.boot != tables.boot {
        return Err(NfsStatus::StaleStateId);
    }
    if other.is_delegation() || other.is_layout() {
        return Err(NfsStatus::BadStateId);
    }
    let session = ctx.is_session();

    let Some(entry) = tables.stateids.get(&other) else {
        // A retransmitted CLOSE/LOCKU may arrive after the stateid is gone
        if !session {
            if let Ok(Seqid::Replay(reply)) = check_owner_seqid(tables, other.owner, seqid, op) {
                return reply;
            }
        }
        return Err(NfsStatus::BadStateId);
    };
    let owner = entry.owner;
    let client = entry.client;
    let generation = entry.generation;
    let kind_ok = match want {
        Want::Open => matches!(entry.kind, StateKind::Open(_)),
        Want::Lock => matches!(entry.kind, StateKind::Lock { .. }),
    };
    if let Some(bound) = ctx.session_client() {
        if bound != client {
            return Err(NfsStatus::BadStateId);
        }
    }

    if !session {
        if let Seqid::Replay(reply) = check_owner_seqid(tables, owner, seqid, op)? {
            return reply;
        }
    }

    let confirmed = tables.owners.get(&owner).map(|o| o.confirmed).unwrap_or(false);
    let result = (|| {
        if !kind_ok {
            return Err(NfsStatus::BadStateId);
        }
        match confirm {
            Confirm::Required if !confirmed && !session => return Err(NfsStatus::BadStateId),
            Confirm::Unconfirmed if confirmed => return Err(NfsStatus::BadStateId),
            _ => {}
        }
        if !session && compare_generation(generation, stateid.seqid) == Generation::Previous {
            let cached = tables
                .owners
                .get(&owner)
                .and_then(|o| o.replay.as_ref())
                .filter(|r| r.op == op)
                .map(|r| r.reply.clone());
            return match cached {
                Some(reply) => reply,
                None => Err(NfsStatus::OldStateId),
            };
        }
        check_generation(session, generation, stateid.seqid)?;
        body(tables, other)
    })();

    if !session {
        record_reply(tables, owner, seqid, op, &result);
    }
    if result.is_ok() {
        tables.renew_client(client, true, Instant::now());
    }
    result
}

fn bump(tables: &mut StateTables, other: StateIdOther) -> StatusResult<StateId> {
    let entry = tables.stateids.get_mut(&other).ok_or(NfsStatus::BadStateId)?;
    entry.generation = entry.generation.wrapping_add(1);
    Ok(entry.stateid())
}

/// Open owners and lock owners left without stateids wait on the retention
/// list (minor version 0) or go away at once (minor version 1)
fn retire_owner_if_idle(
    tables: &mut StateTables,
    owner: OwnerId,
    session: bool,
    now: Instant,
    work: &mut DeferredWork,
) {
    let idle = match tables.owners.get(&owner) {
        Some(o) => o.stateids.is_empty(),
        None => return,
    };
    if !idle {
        return;
    }
    if session {
        tables.release_owner(owner, work);
    } else if let Some(o) = tables.owners.get_mut(&owner) {
        if o.closed_at.is_none() {
            o.closed_at = Some(now);
            tables.close_lru.push_back((now, owner));
        }
    }
}

fn check_reclaim(tables: &StateTables, client: ClientKey, reclaim: bool) -> StatusResult<()> {
    let record = tables.confirmed_client(client)?;
    if reclaim {
        if !tables.grace || record.reclaim_complete {
            return Err(NfsStatus::NoGrace);
        }
        if !tables.reclaimable.contains(&record.name) {
            return Err(NfsStatus::ReclaimBad);
        }
    } else if tables.grace {
        return Err(NfsStatus::Grace);
    }
    Ok(())
}

fn open_on_file(tables: &StateTables, owner: OwnerId, file: FileId) -> Option<StateIdOther> {
    let owner = tables.owners.get(&owner)?;
    owner.stateids.iter().copied().find(|other| {
        tables
            .stateids
            .get(other)
            .map(|e| e.file == file && e.open().is_some())
            .unwrap_or(false)
    })
}

// ============================================================================
// OPEN
// ============================================================================

/// Truncate for OPEN once the backing object is held
///
/// On failure the reference taken for `acquired` is dropped again.
fn truncate_opened(
    tables: &mut StateTables,
    storage: &dyn StorageBackend,
    args: &OpenArgs,
    file: FileId,
    acquired: Option<AccessMode>,
    work: &mut DeferredWork,
) -> StatusResult<()> {
    if !args.truncate {
        return Ok(());
    }
    storage.truncate(&args.fh, 0).map_err(|status| {
        if let Some(mode) = acquired {
            tables.put_file_access(file, mode, work);
        }
        status
    })
}

#[allow(clippy::too_many_arguments)]
fn do_open(
    tables: &mut StateTables,
    storage: &dyn StorageBackend,
    ctx: &CompoundContext,
    client: ClientKey,
    owner: OwnerId,
    file: FileId,
    args: &OpenArgs,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<OpenResult> {
    let session = ctx.is_session();
    let access = args.access.access();
    if access.bits() == 0 || args.deny.bits() & !ShareDeny::BOTH.bits() != 0 {
        return Err(NfsStatus::Inval);
    }
    if args.truncate && !access.contains(ShareAccess::WRITE) {
        return Err(NfsStatus::Inval);
    }

    if let OpenClaim::DelegateCur(deleg_stateid) = args.claim {
        delegation::check_delegation_stateid(tables, &deleg_stateid, client, file, session)?;
    } else {
        let conflicts = delegation::conflicting_delegations(
            tables,
            file,
            client,
            access.contains(ShareAccess::WRITE),
        );
        if !conflicts.is_empty() {
            for id in conflicts {
                delegation::begin_recall(tables, id, now, work);
            }
            return Err(NfsStatus::Delay);
        }
    }

    let existing = open_on_file(tables, owner, file);
    let (want_access, want_deny) = match existing.and_then(|o| tables.stateids.get(&o)).and_then(StateEntry::open) {
        Some(open) => (open.access.union(access), open.deny.union(args.deny)),
        None => (access, args.deny),
    };

    let file_record = tables.files.get(&file).ok_or(NfsStatus::ServerFault)?;
    for other in &file_record.stateids {
        if Some(*other) == existing {
            continue;
        }
        if let Some(open) = tables.stateids.get(other).and_then(StateEntry::open) {
            if !shares_compatible(want_access, want_deny, open.access, open.deny) {
                return Err(NfsStatus::ShareDenied);
            }
        }
    }

    let other = match existing {
        Some(other) => {
            let old_mode = tables
                .stateids
                .get(&other)
                .and_then(StateEntry::open)
                .map(|o| o.fd_mode)
                .ok_or(NfsStatus::ServerFault)?;
            let new_mode = want_access.mode();
            let acquired = (new_mode != old_mode).then_some(new_mode);
            if let Some(mode) = acquired {
                tables.get_file_access(file, mode, storage)?;
            }
            truncate_opened(tables, storage, args, file, acquired, work)?;
            if acquired.is_some() {
                tables.put_file_access(file, old_mode, work);
            }
            if let Some(open) = tables.stateids.get_mut(&other).and_then(StateEntry::open_mut) {
                open.access = want_access;
                open.deny = want_deny;
                open.fd_mode = new_mode;
            }
            other
        }
        None => {
            let mode = access.mode();
            tables.get_file_access(file, mode, storage)?;
            truncate_opened(tables, storage, args, file, Some(mode), work)?;
            let other = StateIdOther::new(tables.boot, owner, file);
            tables.stateids.insert(
                other,
                StateEntry {
                    other,
                    generation: 0,
                    owner,
                    file,
                    client,
                    kind: StateKind::Open(OpenState {
                        access,
                        deny: args.deny,
                        fd_mode: mode,
                        locks: Default::default(),
                    }),
                },
            );
            if let Some(o) = tables.owners.get_mut(&owner) {
                o.stateids.insert(other);
                o.closed_at = None;
            }
            if let Some(f) = tables.files.get_mut(&file) {
                f.stateids.insert(other);
            }
            other
        }
    };
    let stateid = bump(tables, other)?;

    let delegation = match args.claim {
        OpenClaim::DelegateCur(_) => None,
        claim => delegation::try_grant(tables, storage, ctx, owner, other, claim, args.access, now),
    };

    let confirmed = if session {
        if let Some(o) = tables.owners.get_mut(&owner) {
            o.confirmed = true;
        }
        true
    } else {
        tables.owners.get(&owner).map(|o| o.confirmed).unwrap_or(false)
    };
    tables.renew_client(client, true, now);
    debug!(
        "OPEN: client {} owner {} file {} access {:#x} deny {:#x}",
        client,
        owner,
        file,
        want_access.bits(),
        want_deny.bits()
    );
    Ok(OpenResult {
        stateid,
        confirm_required: !confirmed,
        delegation,
    })
}

fn open_locked(
    tables: &mut StateTables,
    storage: &dyn StorageBackend,
    ctx: &CompoundContext,
    args: &OpenArgs,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<OpenResult> {
    let session = ctx.is_session();
    let client = ctx.session_client().unwrap_or(args.client);
    tables.confirmed_client(client)?;
    if matches!(args.claim, OpenClaim::Fh) && !session {
        return Err(NfsStatus::NotSupp);
    }

    let owner = match tables.find_owner(client, OwnerKind::Open, &args.owner) {
        Some(id) if session => id,
        Some(id) => {
            let confirmed = tables.owners.get(&id).map(|o| o.confirmed).unwrap_or(false);
            match check_owner_seqid(tables, id, args.seqid, Nfs4Op::Open) {
                Ok(Seqid::Replay(reply)) => return reply.and_then(OwnerReply::into_open),
                Ok(Seqid::Proceed) => id,
                // An owner that never confirmed is replaced by the new open
                Err(_) if !confirmed => {
                    tables.release_owner(id, work);
                    tables.create_owner(client, OwnerKind::Open, &args.owner, args.seqid)?
                }
                Err(status) => return Err(status),
            }
        }
        None => tables.create_owner(client, OwnerKind::Open, &args.owner, args.seqid)?,
    };

    let result = (|| {
        if !matches!(args.claim, OpenClaim::DelegateCur(_)) {
            check_reclaim(tables, client, args.claim.is_reclaim())?;
        }
        let identity = storage.find_file(&args.fh)?;
        let file = tables.find_or_create_file(&args.fh, identity);
        let result = do_open(tables, storage, ctx, client, owner, file, args, now, work);
        if result.is_err() {
            tables.maybe_release_file(file);
        }
        result
    })();

    let reply = result.map(OwnerReply::Open);
    if !session {
        record_reply(tables, owner, args.seqid, Nfs4Op::Open, &reply);
    }
    let idle = tables
        .owners
        .get(&owner)
        .map(|o| o.stateids.is_empty() && o.closed_at.is_none())
        .unwrap_or(false);
    if reply.is_err() && idle && session {
        tables.release_owner(owner, work);
    } else if reply.is_err() && idle {
        retire_owner_if_idle(tables, owner, false, now, work);
    }
    reply.and_then(OwnerReply::into_open)
}

// ============================================================================
// LOCK
// ============================================================================

fn lock_denied(tables: &StateTables, conflict: &super::lock::ByteRangeLock) -> LockDenied {
    let owner = tables.owners.get(&conflict.owner);
    LockDenied {
        offset: conflict.span.start,
        length: conflict.span.length(),
        lock_type: if conflict.write {
            LockType::WriteLt
        } else {
            LockType::ReadLt
        },
        owner: LockOwnerRef {
            client: owner.map(|o| o.client).unwrap_or(ClientKey::new(0, 0)),
            owner: owner.map(|o| o.owner.clone()).unwrap_or_default(),
        },
    }
}

/// Take the lock for a resolved lock stateid
fn apply_lock(
    tables: &mut StateTables,
    lock_other: StateIdOther,
    args: &LockArgs,
) -> StatusResult<LockReply> {
    let entry = tables.stateids.get(&lock_other).ok_or(NfsStatus::BadStateId)?;
    let (lock_owner, file) = (entry.owner, entry.file);
    let StateKind::Lock { open } = entry.kind else {
        return Err(NfsStatus::BadStateId);
    };
    let open_access = tables
        .stateids
        .get(&open)
        .and_then(StateEntry::open)
        .map(|o| o.access)
        .ok_or(NfsStatus::BadStateId)?;
    let write = args.lock_type.is_write();
    let needed = if write { ShareAccess::WRITE } else { ShareAccess::READ };
    if !open_access.contains(needed) {
        return Err(NfsStatus::OpenMode);
    }
    let span = LockSpan::from_wire(args.offset, args.length)?;

    let file_record = tables.files.get_mut(&file).ok_or(NfsStatus::ServerFault)?;
    match file_record.locks.lock(lock_owner, span, write) {
        Ok(()) => Ok(LockReply::Granted(bump(tables, lock_other)?)),
        Err(conflict) => Ok(LockReply::Denied(lock_denied(tables, &conflict))),
    }
}

fn lock_new_owner(
    tables: &mut StateTables,
    open_other: StateIdOther,
    owner_bytes: &[u8],
    lock_seqid: u32,
    args: &LockArgs,
    session: bool,
    work: &mut DeferredWork,
) -> StatusResult<OwnerReply> {
    let open_entry = tables.stateids.get(&open_other).ok_or(NfsStatus::BadStateId)?;
    let (client, file) = (open_entry.client, open_entry.file);
    check_reclaim(tables, client, args.reclaim)?;

    let (lock_owner, created) = match tables.find_owner(client, OwnerKind::Lock, owner_bytes) {
        Some(id) => {
            let holds_here = tables
                .owners
                .get(&id)
                .map(|o| o.stateids.iter().any(|s| s.file == file))
                .unwrap_or(false);
            if holds_here {
                return Err(NfsStatus::BadSeqId);
            }
            (id, false)
        }
        None => (
            tables.create_owner(client, OwnerKind::Lock, owner_bytes, lock_seqid)?,
            true,
        ),
    };
    let lock_other = StateIdOther::new(tables.boot, lock_owner, file);
    tables.stateids.insert(
        lock_other,
        StateEntry {
            other: lock_other,
            generation: 0,
            owner: lock_owner,
            file,
            client,
            kind: StateKind::Lock { open: open_other },
        },
    );
    if let Some(o) = tables.owners.get_mut(&lock_owner) {
        o.stateids.insert(lock_other);
        o.closed_at = None;
        o.confirmed = true;
    }
    if let Some(f) = tables.files.get_mut(&file) {
        f.stateids.insert(lock_other);
    }
    if let Some(open) = tables.stateids.get_mut(&open_other).and_then(StateEntry::open_mut) {
        open.locks.insert(lock_other);
    }

    let result = apply_lock(tables, lock_other, args);
    match &result {
        Ok(LockReply::Granted(_)) => {}
        _ => {
            tables.release_stateid(lock_other, work);
            if created {
                tables.release_owner(lock_owner, work);
            }
        }
    }
    let reply = result.map(OwnerReply::Lock);
    if !session && tables.owners.contains_key(&lock_owner) {
        record_reply(tables, lock_owner, lock_seqid, Nfs4Op::Lock, &reply);
    }
    reply
}

fn lock_locked(
    tables: &mut StateTables,
    ctx: &CompoundContext,
    args: &LockArgs,
    work: &mut DeferredWork,
) -> StatusResult<LockReply> {
    let session = ctx.is_session();
    match &args.locker {
        Locker::NewOwner {
            open_seqid,
            open_stateid,
            lock_seqid,
            owner,
        } => seqid_op(
            tables,
            ctx,
            open_stateid,
            *open_seqid,
            Nfs4Op::Lock,
            Want::Open,
            Confirm::Required,
            |tables, open_other| {
                lock_new_owner(tables, open_other, owner, *lock_seqid, args, session, work)
            },
        ),
        Locker::ExistingOwner {
            lock_stateid,
            lock_seqid,
        } => seqid_op(
            tables,
            ctx,
            lock_stateid,
            *lock_seqid,
            Nfs4Op::Lock,
            Want::Lock,
            Confirm::Required,
            |tables, lock_other| {
                let client = tables
                    .stateids
                    .get(&lock_other)
                    .map(|e| e.client)
                    .ok_or(NfsStatus::BadStateId)?;
                check_reclaim(tables, client, args.reclaim)?;
                apply_lock(tables, lock_other, args).map(OwnerReply::Lock)
            },
        ),
    }
    .and_then(OwnerReply::into_lock)
}

impl StateManager {
    /// OPEN
    pub async fn process_open(&self, ctx: &CompoundContext, args: OpenArgs) -> StatusResult<OpenResult> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            open_locked(
                &mut tables,
                self.inner.storage.as_ref(),
                ctx,
                &args,
                Instant::now(),
                &mut work,
            )
        };
        self.finish(work).await;
        result
    }

    /// OPEN_CONFIRM (minor version 0)
    pub async fn open_confirm(&self, ctx: &CompoundContext, stateid: StateId, seqid: u32) -> StatusResult<StateId> {
        if ctx.is_session() {
            return Err(NfsStatus::NotSupp);
        }
        let mut tables = self.inner.tables.lock();
        seqid_op(
            &mut tables,
            ctx,
            &stateid,
            seqid,
            Nfs4Op::OpenConfirm,
            Want::Open,
            Confirm::Unconfirmed,
            |tables, other| {
                let owner = tables.stateids.get(&other).map(|e| e.owner).ok_or(NfsStatus::BadStateId)?;
                if let Some(o) = tables.owners.get_mut(&owner) {
                    o.confirmed = true;
                }
                bump(tables, other).map(OwnerReply::StateId)
            },
        )
        .and_then(OwnerReply::into_stateid)
    }

    /// OPEN_DOWNGRADE
    pub async fn open_downgrade(
        &self,
        ctx: &CompoundContext,
        stateid: StateId,
        seqid: u32,
        access: ShareAccess,
        deny: ShareDeny,
    ) -> StatusResult<StateId> {
        let mut work = DeferredWork::default();
        let storage = self.inner.storage.clone();
        let result = {
            let mut tables = self.inner.tables.lock();
            seqid_op(
                &mut tables,
                ctx,
                &stateid,
                seqid,
                Nfs4Op::OpenDowngrade,
                Want::Open,
                Confirm::Required,
                |tables, other| {
                    let entry = tables.stateids.get(&other).ok_or(NfsStatus::BadStateId)?;
                    let file = entry.file;
                    let open = entry.open().ok_or(NfsStatus::BadStateId)?;
                    let access = access.access();
                    if access.bits() == 0
                        || !access.is_subset_of(open.access)
                        || !deny.is_subset_of(open.deny)
                    {
                        return Err(NfsStatus::Inval);
                    }
                    let old_mode = open.fd_mode;
                    let new_mode = access.mode();
                    if new_mode != old_mode {
                        tables.get_file_access(file, new_mode, storage.as_ref())?;
                        tables.put_file_access(file, old_mode, &mut work);
                    }
                    if let Some(open) = tables.stateids.get_mut(&other).and_then(StateEntry::open_mut) {
                        open.access = access;
                        open.deny = deny;
                        open.fd_mode = new_mode;
                    }
                    bump(tables, other).map(OwnerReply::StateId)
                },
            )
            .and_then(OwnerReply::into_stateid)
        };
        self.finish(work).await;
        result
    }

    /// CLOSE
    pub async fn close(&self, ctx: &CompoundContext, stateid: StateId, seqid: u32) -> StatusResult<StateId> {
        let mut work = DeferredWork::default();
        let session = ctx.is_session();
        let now = Instant::now();
        let result = {
            let mut tables = self.inner.tables.lock();
            seqid_op(
                &mut tables,
                ctx,
                &stateid,
                seqid,
                Nfs4Op::Close,
                Want::Open,
                Confirm::Required,
                |tables, other| {
                    let closed = bump(tables, other)?;
                    let (owner, client, file) = tables
                        .stateids
                        .get(&other)
                        .map(|e| (e.owner, e.client, e.file))
                        .ok_or(NfsStatus::BadStateId)?;
                    tables.release_stateid(other, &mut work);
                    tables.return_on_close(client, file, &mut work);
                    retire_owner_if_idle(tables, owner, session, now, &mut work);
                    Ok(OwnerReply::StateId(closed))
                },
            )
            .and_then(OwnerReply::into_stateid)
        };
        self.finish(work).await;
        result
    }

    /// LOCK
    pub async fn lock(&self, ctx: &CompoundContext, args: LockArgs) -> StatusResult<LockReply> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            lock_locked(&mut tables, ctx, &args, &mut work)
        };
        self.finish(work).await;
        result
    }

    /// LOCKT; `Ok(None)` means the lock could be granted
    pub fn lockt(&self, ctx: &CompoundContext, args: LockTestArgs) -> StatusResult<Option<LockDenied>> {
        let client = ctx.session_client().unwrap_or(args.client);
        let span = LockSpan::from_wire(args.offset, args.length)?;
        let identity = self.inner.storage.find_file(&args.fh)?;

        let mut tables = self.inner.tables.lock();
        check_reclaim(&tables, client, false)?;
        tables.renew_client(client, true, Instant::now());
        let Some(file) = tables.file_index.get(&identity).copied() else {
            return Ok(None);
        };
        // owner id 0 is never a lock owner, so an unknown owner conflicts with everyone
        let owner = tables
            .find_owner(client, OwnerKind::Lock, &args.owner)
            .unwrap_or(super::DELEGATION_OWNER);
        let conflict = tables
            .files
            .get(&file)
            .and_then(|f| f.locks.find_conflict(owner, &span, args.lock_type.is_write()));
        Ok(conflict.map(|c| lock_denied(&tables, &c)))
    }

    /// LOCKU
    ///
    /// Unlocking the last range an owner holds on a file also releases the
    /// lock stateid.
    pub async fn locku(&self, ctx: &CompoundContext, args: LockUArgs) -> StatusResult<StateId> {
        let mut work = DeferredWork::default();
        let session = ctx.is_session();
        let now = Instant::now();
        let result = {
            let mut tables = self.inner.tables.lock();
            seqid_op(
                &mut tables,
                ctx,
                &args.stateid,
                args.seqid,
                Nfs4Op::LockU,
                Want::Lock,
                Confirm::Required,
                |tables, other| {
                    let span = LockSpan::from_wire(args.offset, args.length)?;
                    let (owner, file) = tables
                        .stateids
                        .get(&other)
                        .map(|e| (e.owner, e.file))
                        .ok_or(NfsStatus::BadStateId)?;
                    let file_record = tables.files.get_mut(&file).ok_or(NfsStatus::ServerFault)?;
                    file_record.locks.unlock(owner, span);
                    let still_locked = file_record.locks.owner_holds(owner);
                    let stateid = bump(tables, other)?;
                    if !still_locked {
                        tables.release_stateid(other, &mut work);
                        retire_owner_if_idle(tables, owner, session, now, &mut work);
                    }
                    Ok(OwnerReply::StateId(stateid))
                },
            )
            .and_then(OwnerReply::into_stateid)
        };
        self.finish(work).await;
        result
    }

    /// RELEASE_LOCKOWNER (minor version 0)
    pub async fn release_lockowner(&self, client: ClientKey, owner: &[u8]) -> StatusResult<()> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            (|| {
                tables.confirmed_client(client)?;
                tables.renew_client(client, true, Instant::now());
                let Some(id) = tables.find_owner(client, OwnerKind::Lock, owner) else {
                    return Ok(());
                };
                let locked = tables.files.values().any(|f| f.locks.owner_holds(id));
                if locked {
                    return Err(NfsStatus::LocksHeld);
                }
                tables.release_owner(id, &mut work);
                Ok(())
            })()
        };
        self.finish(work).await;
        result
    }

    /// TEST_STATEID: one status per stateid
    pub fn test_stateids(&self, ctx: &CompoundContext, stateids: &[StateId]) -> StatusResult<Vec<NfsStatus>> {
        let client = ctx.session_client().ok_or(NfsStatus::OpIllegal)?;
        let tables = self.inner.tables.lock();
        Ok(stateids
            .iter()
            .map(|stateid| match tables.stateid_status(stateid, client) {
                Ok(()) => NfsStatus::Ok,
                Err(status) => status,
            })
            .collect())
    }

    /// FREE_STATEID
    pub async fn free_stateid(&self, ctx: &CompoundContext, stateid: StateId) -> StatusResult<()> {
        let client = ctx.session_client().ok_or(NfsStatus::OpIllegal)?;
        let mut work = DeferredWork::default();
        let now = Instant::now();
        let result = {
            let mut tables = self.inner.tables.lock();
            (|| {
                tables.stateid_status(&stateid, client)?;
                let other = stateid.identity();
                let entry = tables.stateids.get(&other).ok_or(NfsStatus::LocksHeld)?;
                let (owner, file) = (entry.owner, entry.file);
                if entry.open().is_some() {
                    return Err(NfsStatus::LocksHeld);
                }
                let locked = tables
                    .files
                    .get(&file)
                    .map(|f| f.locks.owner_holds(owner))
                    .unwrap_or(false);
                if locked {
                    return Err(NfsStatus::LocksHeld);
                }
                tables.release_stateid(other, &mut work);
                retire_owner_if_idle(&mut tables, owner, true, now, &mut work);
                Ok(())
            })()
        };
        self.finish(work).await;
        result
    }

    /// Validate the stateid of READ, WRITE or SETATTR against the current file
    ///
    /// The anonymous and read-bypass stateids are checked against grace,
    /// share reservations and delegations held by other clients.
    pub async fn check_io_stateid(
        &self,
        ctx: &CompoundContext,
        fh: &Nfs4FileHandle,
        stateid: StateId,
        write: bool,
    ) -> StatusResult<()> {
        let identity = self.inner.storage.find_file(fh)?;
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            let file = tables.file_index.get(&identity).copied();
            if stateid.is_special() {
                special_io(&mut tables, file, stateid, write, Instant::now(), &mut work)
            } else {
                regular_io(&mut tables, ctx, file, stateid, write)
            }
        };
        self.finish(work).await;
        result
    }
}

fn special_io(
    tables: &mut StateTables,
    file: Option<FileId>,
    stateid: StateId,
    write: bool,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<()> {
    if stateid.is_read_bypass() && !write {
        return Ok(());
    }
    if !stateid.is_anonymous() && !stateid.is_read_bypass() {
        return Err(NfsStatus::BadStateId);
    }
    if tables.grace && write {
        return Err(NfsStatus::Grace);
    }
    let Some(file) = file else {
        return Ok(());
    };
    let conflicts = delegation::conflicting_delegations(tables, file, ClientKey::new(0, 0), write);
    if !conflicts.is_empty() {
        for id in conflicts {
            delegation::begin_recall(tables, id, now, work);
        }
        return Err(NfsStatus::Delay);
    }
    let denied = if write { ShareDeny::WRITE } else { ShareDeny::READ };
    let blocked = tables.files.get(&file).map(|f| {
        f.stateids.iter().any(|o| {
            tables
                .stateids
                .get(o)
                .and_then(StateEntry::open)
                .map(|open| open.deny.contains(denied))
                .unwrap_or(false)
        })
    });
    if blocked.unwrap_or(false) {
        return Err(NfsStatus::Locked);
    }
    Ok(())
}

fn regular_io(
    tables: &mut StateTables,
    ctx: &CompoundContext,
    file: Option<FileId>,
    stateid: StateId,
    write: bool,
) -> StatusResult<()> {
    let session = ctx.is_session();
    let other = stateid.identity();
    if other.boot != tables.boot {
        return Err(NfsStatus::StaleStateId);
    }
    let file = file.ok_or(NfsStatus::BadStateId)?;

    if other.is_delegation() {
        let deleg = tables.delegations.get(&other.file).ok_or(NfsStatus::BadStateId)?;
        if deleg.file != file {
            return Err(NfsStatus::BadStateId);
        }
        check_generation(session, deleg.stateid.seqid, stateid.seqid)?;
        if write && deleg.dtype != DelegationType::Write {
            return Err(NfsStatus::OpenMode);
        }
        let client = deleg.client;
        tables.renew_client(client, true, Instant::now());
        return Ok(());
    }
    if other.is_layout() {
        return Err(NfsStatus::BadStateId);
    }

    let entry = tables.stateids.get(&other).ok_or(NfsStatus::BadStateId)?;
    if entry.file != file {
        return Err(NfsStatus::BadStateId);
    }
    if let Some(bound) = ctx.session_client() {
        if bound != entry.client {
            return Err(NfsStatus::BadStateId);
        }
    }
    check_generation(session, entry.generation, stateid.seqid)?;
    let confirmed = tables.owners.get(&entry.owner).map(|o| o.confirmed).unwrap_or(false);
    if !confirmed && !session {
        return Err(NfsStatus::BadStateId);
    }
    let access = match &entry.kind {
        StateKind::Open(open) => open.access,
        StateKind::Lock { open } => tables
            .stateids
            .get(open)
            .and_then(StateEntry::open)
            .map(|o| o.access)
            .ok_or(NfsStatus::BadStateId)?,
    };
    // a write-only open may still read
    if write && !access.contains(ShareAccess::WRITE) {
        return Err(NfsStatus::OpenMode);
    }
    let client = entry.client;
    tables.renew_client(client, true, Instant::now());
    Ok(())
}

impl StateTables {
    /// TEST_STATEID rules for one stateid of `client`
    pub(crate) fn stateid_status(&self, stateid: &StateId, client: ClientKey) -> StatusResult<()> {
        if stateid.is_special() {
            return Err(NfsStatus::BadStateId);
        }
        let other = stateid.identity();
        if other.boot != self.boot {
            return Err(NfsStatus::BadStateId);
        }
        let (owner_client, current) = if other.is_delegation() {
            let deleg = self.delegations.get(&other.file).ok_or(NfsStatus::BadStateId)?;
            (deleg.client, deleg.stateid.seqid)
        } else if other.is_layout() {
            let layout = self.layout_states.get(&other.file).ok_or(NfsStatus::BadStateId)?;
            (layout.client, layout.generation)
        } else {
            let entry = self.stateids.get(&other).ok_or(NfsStatus::BadStateId)?;
            (entry.client, entry.generation)
        };
        if owner_client != client {
            return Err(NfsStatus::BadStateId);
        }
        check_generation(true, current, stateid.seqid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{confirmed_v0, ctx_v0, file, manager};

    #[test]
    fn test_share_access() {
        let access = ShareAccess::BOTH;
        assert!(access.contains(ShareAccess::READ));
        assert!(access.contains(ShareAccess::WRITE));
        assert_eq!(ShareAccess::from_bits(0x102).access(), ShareAccess::WRITE);
        assert_eq!(ShareAccess::from_bits(0x102).want(), 0x100);
        assert_eq!(ShareAccess::READ.mode(), AccessMode::Read);
        assert_eq!(ShareAccess::BOTH.mode(), AccessMode::ReadWrite);
    }

    #[test]
    fn test_share_compatibility() {
        assert!(shares_compatible(
            ShareAccess::READ,
            ShareDeny::NONE,
            ShareAccess::WRITE,
            ShareDeny::NONE
        ));
        assert!(!shares_compatible(
            ShareAccess::READ,
            ShareDeny::WRITE,
            ShareAccess::WRITE,
            ShareDeny::NONE
        ));
        assert!(!shares_compatible(
            ShareAccess::WRITE,
            ShareDeny::NONE,
            ShareAccess::READ,
            ShareDeny::WRITE
        ));
    }

    #[test]
    fn test_generation_rule() {
        assert_eq!(check_generation(false, 5, 5), Ok(()));
        assert_eq!(check_generation(false, 5, 6), Err(NfsStatus::BadStateId));
        assert_eq!(check_generation(false, 5, 4), Err(NfsStatus::OldStateId));
        assert_eq!(check_generation(false, 5, 1), Err(NfsStatus::OldStateId));
        assert_eq!(check_generation(true, 5, 0), Ok(()));
        assert_eq!(check_generation(false, 5, 0), Err(NfsStatus::OldStateId));
        assert_eq!(compare_generation(5, 4), Generation::Previous);
    }

    #[tokio::test]
    async fn test_open_confirm_close() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"owner", 10, fh.clone()))
            .await
            .unwrap();
        assert!(open.confirm_required);
        assert_eq!(open.stateid.seqid, 1);

        // unconfirmed stateids cannot be used for CLOSE
        assert_eq!(
            mgr.close(&ctx, open.stateid, 11).await,
            Err(NfsStatus::BadStateId)
        );

        let confirmed = mgr.open_confirm(&ctx, open.stateid, 11).await.unwrap();
        assert_eq!(confirmed.seqid, 2);

        let closed = mgr.close(&ctx, confirmed, 12).await.unwrap();
        assert_eq!(closed.seqid, 3);
        assert_eq!(mgr.counters().open_stateids, 0);
        assert_eq!(storage.stats().closes, 1);

        // retransmitted CLOSE after the stateid is gone
        assert_eq!(mgr.close(&ctx, confirmed, 12).await, Ok(closed));
        // new seqid on the vanished stateid
        assert_eq!(mgr.close(&ctx, confirmed, 13).await, Err(NfsStatus::BadStateId));
    }

    #[tokio::test]
    async fn test_open_truncate() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);
        storage.set_size(&fh, 4096);

        // truncate needs write access
        let read_only = OpenArgs::new(client, b"reader", 1, fh.clone()).with_truncate();
        assert_eq!(mgr.process_open(&ctx, read_only).await, Err(NfsStatus::Inval));
        assert_eq!(storage.size(&fh), Some(4096));

        let args = OpenArgs::new(client, b"writer", 1, fh.clone())
            .with_share(ShareAccess::WRITE, ShareDeny::NONE)
            .with_truncate();
        mgr.process_open(&ctx, args).await.unwrap();
        assert_eq!(storage.size(&fh), Some(0));
        assert_eq!(storage.stats().truncates, 1);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_file_untouched() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);
        storage.set_size(&fh, 4096);
        storage.fail_opens(Some(NfsStatus::Access));

        let args = OpenArgs::new(client, b"writer", 1, fh.clone())
            .with_share(ShareAccess::WRITE, ShareDeny::NONE)
            .with_truncate();
        assert_eq!(mgr.process_open(&ctx, args).await, Err(NfsStatus::Access));
        assert_eq!(storage.size(&fh), Some(4096));
        assert_eq!(storage.stats().truncates, 0);
        assert_eq!(mgr.counters().open_stateids, 0);
        assert_eq!(mgr.counters().files, 0);

        // upgrading an existing read open to write also opens before truncating
        storage.fail_opens(None);
        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"owner", 1, fh.clone()))
            .await
            .unwrap();
        let stateid = mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();
        storage.fail_opens(Some(NfsStatus::Access));
        let upgrade = OpenArgs::new(client, b"owner", 3, fh.clone())
            .with_share(ShareAccess::BOTH, ShareDeny::NONE)
            .with_truncate();
        assert_eq!(mgr.process_open(&ctx, upgrade).await, Err(NfsStatus::Access));
        assert_eq!(storage.size(&fh), Some(4096));
        assert_eq!(mgr.counters().open_stateids, 1);

        storage.fail_opens(None);
        assert!(mgr.close(&ctx, stateid, 4).await.is_ok());
    }

    #[tokio::test]
    async fn test_owner_seqid_replay_and_bad_seqid() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let args = OpenArgs::new(client, b"owner", 1, fh.clone());
        let first = mgr.process_open(&ctx, args.clone()).await.unwrap();
        let replay = mgr.process_open(&ctx, args.clone()).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(mgr.counters().open_stateids, 1);

        let stateid = mgr.open_confirm(&ctx, first.stateid, 2).await.unwrap();
        assert_eq!(
            mgr.open_downgrade(&ctx, stateid, 9, ShareAccess::READ, ShareDeny::NONE)
                .await,
            Err(NfsStatus::BadSeqId)
        );
    }

    #[tokio::test]
    async fn test_open_upgrade_and_downgrade() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"owner", 1, fh.clone()))
            .await
            .unwrap();
        let stateid = mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();

        let upgraded = mgr
            .process_open(
                &ctx,
                OpenArgs::new(client, b"owner", 3, fh.clone())
                    .with_share(ShareAccess::WRITE, ShareDeny::NONE),
            )
            .await
            .unwrap();
        assert_eq!(upgraded.stateid.other, stateid.other);
        assert_eq!(upgraded.stateid.seqid, stateid.seqid + 1);
        assert_eq!(mgr.counters().open_stateids, 1);

        // deny bits not held cannot be downgraded to
        assert_eq!(
            mgr.open_downgrade(&ctx, upgraded.stateid, 4, ShareAccess::READ, ShareDeny::WRITE)
                .await,
            Err(NfsStatus::Inval)
        );
        let down = mgr
            .open_downgrade(&ctx, upgraded.stateid, 5, ShareAccess::READ, ShareDeny::NONE)
            .await
            .unwrap();
        assert_eq!(down.seqid, upgraded.stateid.seqid + 1);

        // generation older than current-1 with a new seqid
        assert_eq!(
            mgr.close(&ctx, stateid, 6).await,
            Err(NfsStatus::OldStateId)
        );
    }

    #[tokio::test]
    async fn test_grace_blocks_new_opens() {
        let (mgr, storage, _) = crate::testing::manager_in_grace();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let err = mgr
            .process_open(&ctx, OpenArgs::new(client, b"owner", 1, fh.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, NfsStatus::Grace);

        // no record of this client from before the restart
        let err = mgr
            .process_open(
                &ctx,
                OpenArgs::new(client, b"owner", 2, fh.clone())
                    .with_claim(OpenClaim::Previous(DelegationType::None)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, NfsStatus::ReclaimBad);

        mgr.end_grace();
        let err = mgr
            .process_open(
                &ctx,
                OpenArgs::new(client, b"owner", 3, fh)
                    .with_claim(OpenClaim::Previous(DelegationType::None)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, NfsStatus::NoGrace);
    }

    #[tokio::test]
    async fn test_lock_open_mode_and_lockt() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"owner", 1, fh.clone()))
            .await
            .unwrap();
        let stateid = mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();

        let write_lock = LockArgs {
            lock_type: LockType::WriteLt,
            reclaim: false,
            offset: 0,
            length: 100,
            locker: Locker::NewOwner {
                open_seqid: 3,
                open_stateid: stateid,
                lock_seqid: 1,
                owner: b"locker".to_vec(),
            },
        };
        assert_eq!(mgr.lock(&ctx, write_lock).await, Err(NfsStatus::OpenMode));

        let read_lock = LockArgs {
            lock_type: LockType::ReadLt,
            reclaim: false,
            offset: 0,
            length: 100,
            locker: Locker::NewOwner {
                open_seqid: 4,
                open_stateid: stateid,
                lock_seqid: 1,
                owner: b"locker".to_vec(),
            },
        };
        let LockReply::Granted(lock_stateid) = mgr.lock(&ctx, read_lock).await.unwrap() else {
            panic!("read lock denied");
        };
        assert_eq!(lock_stateid.seqid, 1);

        let test = LockTestArgs {
            lock_type: LockType::WriteLt,
            offset: 50,
            length: 10,
            client,
            owner: b"someone-else".to_vec(),
            fh: fh.clone(),
        };
        let denied = mgr.lockt(&ctx, test).unwrap().unwrap();
        assert_eq!(denied.offset, 0);
        assert_eq!(denied.length, 100);
        assert_eq!(denied.owner.owner, b"locker".to_vec());

        let unlocked = mgr
            .locku(
                &ctx,
                LockUArgs {
                    lock_type: LockType::ReadLt,
                    seqid: 2,
                    stateid: lock_stateid,
                    offset: 0,
                    length: u64::MAX,
                },
            )
            .await
            .unwrap();
        assert_eq!(unlocked.seqid, 2);
        assert_eq!(mgr.counters().lock_stateids, 0);

        mgr.release_lockowner(client, b"locker").await.unwrap();
    }

    #[tokio::test]
    async fn test_check_io_stateid() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let open = mgr
            .process_open(
                &ctx,
                OpenArgs::new(client, b"owner", 1, fh.clone())
                    .with_share(ShareAccess::READ, ShareDeny::WRITE),
            )
            .await
            .unwrap();
        assert_eq!(
            mgr.check_io_stateid(&ctx, &fh, open.stateid, false).await,
            Err(NfsStatus::BadStateId)
        );
        let stateid = mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();

        mgr.check_io_stateid(&ctx, &fh, stateid, false).await.unwrap();
        assert_eq!(
            mgr.check_io_stateid(&ctx, &fh, stateid, true).await,
            Err(NfsStatus::OpenMode)
        );
        assert_eq!(
            mgr.check_io_stateid(&ctx, &fh, open.stateid, false).await,
            Err(NfsStatus::OldStateId)
        );
        // anonymous writers are blocked by the deny-write reservation
        assert_eq!(
            mgr.check_io_stateid(&ctx, &fh, StateId::ANONYMOUS, true).await,
            Err(NfsStatus::Locked)
        );
        mgr.check_io_stateid(&ctx, &fh, StateId::READ_BYPASS, false)
            .await
            .unwrap();

        let other_file = file(&storage, 2);
        assert_eq!(
            mgr.check_io_stateid(&ctx, &other_file, stateid, false).await,
            Err(NfsStatus::BadStateId)
        );
    }
}
