//! Client registry
//!
//! Client identity lifecycle: SETCLIENTID / SETCLIENTID_CONFIRM for minor
//! version 0, EXCHANGE_ID (confirmed later by CREATE_SESSION) for minor
//! version 1, lease renewal and expiry.

use std::collections::BTreeSet;

use tokio::time::Instant;
use tracing::{debug, info};

use super::callback::{CallbackInfo, CallbackRoute, CallbackState, CallbackTarget, ProbeJob};
use super::compound::CompoundContext;
use super::tables::{Client, DeferredWork, StateTables};
use super::{ClientKey, Verifier};
use crate::error::{NfsStatus, StatusResult};
use crate::manager::StateManager;

/// EXCHANGE_ID flag: client supports non-pNFS operation
pub const EXCHGID4_FLAG_USE_NON_PNFS: u32 = 0x0001_0000;
/// EXCHANGE_ID flag: server acts as a pNFS metadata server
pub const EXCHGID4_FLAG_USE_PNFS_MDS: u32 = 0x0002_0000;
/// EXCHANGE_ID flag: client id is already confirmed
pub const EXCHGID4_FLAG_CONFIRMED_R: u32 = 0x8000_0000;

/// Caller credentials as authenticated by the RPC layer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    /// User id
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
    /// Supplementary groups
    pub groups: Vec<u32>,
    /// Kerberos principal, if the flavor carries one
    pub principal: Option<String>,
}

impl Credentials {
    /// AUTH_SYS credentials
    pub fn unix(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
            principal: None,
        }
    }

    /// Whether two credentials name the same principal
    pub fn same_principal(&self, other: &Credentials) -> bool {
        self.uid == other.uid && self.gid == other.gid && self.principal == other.principal
    }
}

/// EXCHANGE_ID result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeIdReply {
    /// Client id
    pub client: ClientKey,
    /// Sequence id the first CREATE_SESSION must carry
    pub sequence_id: u32,
    /// `EXCHGID4_FLAG_*` bits
    pub flags: u32,
}

fn new_client(
    tables: &mut StateTables,
    key: ClientKey,
    ctx: &CompoundContext,
    name: &[u8],
    verifier: Verifier,
    callback: CallbackInfo,
    now: Instant,
) -> Client {
    Client {
        key,
        name: name.to_vec(),
        verifier,
        confirm: tables.alloc_confirm(),
        creds: ctx.creds.clone(),
        peer: ctx.peer,
        minor_version: ctx.minor_version,
        callback,
        cb_state: CallbackState::Unprobed,
        exchange_flags: 0,
        last_renewed: now,
        lru_seq: 0,
        cs_seqid: 1,
        cs_reply: None,
        reclaim_complete: false,
        open_owners: BTreeSet::new(),
        lock_owners: BTreeSet::new(),
        delegations: BTreeSet::new(),
        layout_states: BTreeSet::new(),
        layout_recalls: BTreeSet::new(),
        sessions: BTreeSet::new(),
    }
}

fn expire_unconfirmed_by_name(tables: &mut StateTables, name: &[u8], work: &mut DeferredWork) {
    if let Some(key) = tables.unconfirmed_names.get(name).copied() {
        tables.unhash_client(key, false, work);
    }
}

/// Schedule a CB_NULL over the client's registered callback address
pub(crate) fn schedule_probe(tables: &mut StateTables, key: ClientKey, work: &mut DeferredWork) {
    let Ok(client) = tables.confirmed_client_mut(key) else {
        return;
    };
    let Some(addr) = client.callback.addr else {
        client.cb_state = CallbackState::Broken;
        return;
    };
    client.cb_state = CallbackState::Probing;
    work.probes.push(ProbeJob {
        route: CallbackRoute::Channel {
            client: key,
            target: CallbackTarget {
                addr,
                program: client.callback.program,
                minor_version: 0,
            },
            ident: client.callback.ident,
        },
    });
}

fn establish_locked(
    tables: &mut StateTables,
    ctx: &CompoundContext,
    name: &[u8],
    verifier: Verifier,
    callback: CallbackInfo,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<(ClientKey, Verifier)> {
    let conf = tables
        .confirmed_names
        .get(name)
        .and_then(|key| tables.confirmed.get(key));

    let key = match conf {
        Some(conf) if !conf.creds.same_principal(&ctx.creds) => {
            return Err(NfsStatus::ClientIdInUse);
        }
        // Same verifier: callback update of the confirmed client
        Some(conf) if conf.verifier == verifier => {
            let key = conf.key;
            expire_unconfirmed_by_name(tables, name, work);
            key
        }
        // New verifier: the client rebooted; any stale unconfirmed record goes
        Some(_) => {
            expire_unconfirmed_by_name(tables, name, work);
            tables.alloc_client_key()?
        }
        None => {
            expire_unconfirmed_by_name(tables, name, work);
            tables.alloc_client_key()?
        }
    };

    let client = new_client(tables, key, ctx, name, verifier, callback, now);
    let confirm = client.confirm;
    tables.hash_client(client, false, now);
    debug!("SETCLIENTID: unconfirmed client {}", key);
    Ok((key, confirm))
}

fn confirm_locked(
    tables: &mut StateTables,
    ctx: &CompoundContext,
    key: ClientKey,
    confirm: Verifier,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<()> {
    if key.boot != tables.boot {
        return Err(NfsStatus::StaleClientId);
    }
    let conf = tables.confirmed.get(&key);
    let unconf = tables.unconfirmed.get(&key);
    // only the record the token confirms has to come from this peer
    let confirming = match (conf, unconf) {
        (_, Some(unconf)) if unconf.confirm == confirm => unconf,
        (Some(conf), _) if conf.confirm == confirm => conf,
        _ => return Err(NfsStatus::StaleClientId),
    };
    if confirming.peer.ip() != ctx.peer.ip() {
        return Err(NfsStatus::ClientIdInUse);
    }

    match (conf, unconf) {
        (Some(_), Some(unconf)) if unconf.confirm == confirm => {
            if !unconf.creds.same_principal(&ctx.creds) {
                return Err(NfsStatus::ClientIdInUse);
            }
            let callback = unconf.callback;
            tables.unhash_client(key, false, work);
            if let Ok(client) = tables.confirmed_client_mut(key) {
                client.callback = callback;
            }
            work.channels_dropped.push(key);
            tables.renew_client(key, true, now);
            schedule_probe(tables, key, work);
            info!("client {} updated its callback path", key);
            Ok(())
        }
        (Some(conf), _) if conf.confirm == confirm => {
            tables.renew_client(key, true, now);
            Ok(())
        }
        (None, Some(unconf)) if unconf.confirm == confirm => {
            if !unconf.creds.same_principal(&ctx.creds) {
                return Err(NfsStatus::ClientIdInUse);
            }
            promote(tables, key, now, work);
            schedule_probe(tables, key, work);
            Ok(())
        }
        _ => Err(NfsStatus::StaleClientId),
    }
}

/// Move an unconfirmed client to the confirmed table
///
/// A confirmed client with the same name is a previous incarnation and is
/// expired first.
pub(crate) fn promote(tables: &mut StateTables, key: ClientKey, now: Instant, work: &mut DeferredWork) {
    let Some(mut client) = tables.unhash_client(key, false, work) else {
        return;
    };
    if let Some(old) = tables.confirmed_names.get(&client.name).copied() {
        info!("client {} replaces previous incarnation {}", key, old);
        tables.unhash_client(old, true, work);
    }
    client.cb_state = CallbackState::Unprobed;
    work.records_created.push(client.name.clone());
    tables.hash_client(client, true, now);
    info!("confirmed client {}", key);
}

fn exchange_id_locked(
    tables: &mut StateTables,
    ctx: &CompoundContext,
    name: &[u8],
    verifier: Verifier,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<ExchangeIdReply> {
    let mut flags = EXCHGID4_FLAG_USE_NON_PNFS;
    if tables.pnfs_enabled {
        flags |= EXCHGID4_FLAG_USE_PNFS_MDS;
    }

    let conf_key = tables.confirmed_names.get(name).copied();
    if let Some(conf) = conf_key.and_then(|key| tables.confirmed.get(&key)) {
        if !conf.creds.same_principal(&ctx.creds) {
            return Err(NfsStatus::ClientIdInUse);
        }
        if conf.verifier == verifier {
            let reply = ExchangeIdReply {
                client: conf.key,
                sequence_id: conf.cs_seqid,
                flags: flags | EXCHGID4_FLAG_CONFIRMED_R,
            };
            tables.renew_client(reply.client, true, now);
            return Ok(reply);
        }
    }

    expire_unconfirmed_by_name(tables, name, work);
    let key = tables.alloc_client_key()?;
    let mut client = new_client(tables, key, ctx, name, verifier, CallbackInfo::default(), now);
    client.exchange_flags = flags;
    let sequence_id = client.cs_seqid;
    tables.hash_client(client, false, now);
    debug!("EXCHANGE_ID: unconfirmed client {}", key);
    Ok(ExchangeIdReply {
        client: key,
        sequence_id,
        flags,
    })
}

impl StateManager {
    /// SETCLIENTID: establish or update a minor version 0 client identity
    ///
    /// Returns the client id and the token SETCLIENTID_CONFIRM must present.
    pub async fn establish_client(
        &self,
        ctx: &CompoundContext,
        name: &[u8],
        verifier: Verifier,
        callback: CallbackInfo,
    ) -> StatusResult<(ClientKey, Verifier)> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            establish_locked(&mut tables, ctx, name, verifier, callback, Instant::now(), &mut work)
        };
        self.finish(work).await;
        result
    }

    /// SETCLIENTID_CONFIRM
    pub async fn confirm_client(
        &self,
        ctx: &CompoundContext,
        client: ClientKey,
        confirm: Verifier,
    ) -> StatusResult<()> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            confirm_locked(&mut tables, ctx, client, confirm, Instant::now(), &mut work)
        };
        self.finish(work).await;
        result
    }

    /// EXCHANGE_ID: establish a minor version 1 client identity
    pub async fn exchange_id(
        &self,
        ctx: &CompoundContext,
        name: &[u8],
        verifier: Verifier,
    ) -> StatusResult<ExchangeIdReply> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            exchange_id_locked(&mut tables, ctx, name, verifier, Instant::now(), &mut work)
        };
        self.finish(work).await;
        result
    }

    /// RENEW
    ///
    /// Reports `CbPathDown` while the client holds delegations it can no
    /// longer be called back about; the lease is renewed either way.
    pub fn renew(&self, client: ClientKey) -> StatusResult<()> {
        let mut tables = self.inner.tables.lock();
        let record = tables.confirmed_client(client)?;
        let path_down =
            !record.delegations.is_empty() && record.cb_state == CallbackState::Broken;
        tables.renew_client(client, true, Instant::now());
        if path_down {
            return Err(NfsStatus::CbPathDown);
        }
        Ok(())
    }

    /// Expire a client and everything it owns
    ///
    /// Returns `false` when there was nothing left to expire.
    pub async fn expire_client(&self, client: ClientKey) -> bool {
        let mut work = DeferredWork::default();
        let expired = {
            let mut tables = self.inner.tables.lock();
            let confirmed = tables.unhash_client(client, true, &mut work).is_some();
            let unconfirmed = tables.unhash_client(client, false, &mut work).is_some();
            confirmed || unconfirmed
        };
        if expired {
            info!("expired client {}", client);
        }
        self.finish(work).await;
        expired
    }

    /// DESTROY_CLIENTID
    pub async fn destroy_clientid(&self, client: ClientKey) -> StatusResult<()> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            if client.boot != tables.boot {
                Err(NfsStatus::StaleClientId)
            } else if let Some(record) = tables.confirmed.get(&client) {
                if !record.sessions.is_empty() || record.holds_state() {
                    Err(NfsStatus::ClientIdBusy)
                } else {
                    tables.unhash_client(client, true, &mut work);
                    Ok(())
                }
            } else if tables.unhash_client(client, false, &mut work).is_some() {
                Ok(())
            } else {
                Err(NfsStatus::StaleClientId)
            }
        };
        if result.is_ok() {
            info!("destroyed client {}", client);
        }
        self.finish(work).await;
        result
    }

    /// RECLAIM_COMPLETE for the session's client
    pub fn reclaim_complete(&self, ctx: &CompoundContext) -> StatusResult<()> {
        let client = ctx.session_client().ok_or(NfsStatus::OpIllegal)?;
        let mut tables = self.inner.tables.lock();
        let record = tables.confirmed_client_mut(client)?;
        if record.reclaim_complete {
            return Err(NfsStatus::CompleteAlready);
        }
        record.reclaim_complete = true;
        debug!("client {} finished reclaiming", client);
        Ok(())
    }
}
