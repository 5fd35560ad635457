//! NFSv4.1 session management
//!
//! Sessions provide exactly-once semantics for NFSv4.1 operations. Each
//! session owns a fixed slot table; every COMPOUND starts with SEQUENCE on
//! one slot and the slot's sequence id decides whether the request is new,
//! a retransmission to answer from the reply cache, or out of order.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use super::callback::{CallbackClient, CallbackRoute, CallbackState, ProbeJob};
use super::client::promote;
use super::compound::{CompoundContext, SessionBinding};
use super::tables::{DeferredWork, StateTables};
use super::ClientKey;
use crate::error::{NfsStatus, StatusResult};
use crate::manager::StateManager;

/// Session ID (16 bytes, opaque)
pub type SessionId = [u8; 16];

/// CREATE_SESSION flag: the creating connection also carries the backchannel
pub const CREATE_SESSION4_FLAG_CONN_BACK_CHAN: u32 = 0x0000_0002;

/// SEQUENCE status flag: no usable callback path
pub const SEQ4_STATUS_CB_PATH_DOWN: u32 = 0x0000_0001;

/// Channel attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAttrs {
    /// Header padding (for RDMA)
    pub header_pad_size: u32,
    /// Maximum request size
    pub max_request_size: u32,
    /// Maximum response size
    pub max_response_size: u32,
    /// Maximum response size with cached data
    pub max_response_size_cached: u32,
    /// Maximum operations per COMPOUND
    pub max_ops: u32,
    /// Maximum concurrent requests (slot count)
    pub max_requests: u32,
}

impl Default for ChannelAttrs {
    fn default() -> Self {
        Self {
            header_pad_size: 0,
            max_request_size: 1024 * 1024,       // 1 MB
            max_response_size: 1024 * 1024,      // 1 MB
            max_response_size_cached: 64 * 1024, // 64 KB
            max_ops: 16,
            max_requests: 16,
        }
    }
}

/// Outcome of checking a SEQUENCE seqid against a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCheck {
    /// Next request on the slot
    New,
    /// Retransmission of the last completed request
    Replay,
    /// Same request re-entering while still in progress
    Continuation,
    /// Next request while the previous one is still in progress
    InUse,
    /// Anything else
    Misordered,
}

/// Session slot (for exactly-once semantics)
#[derive(Debug, Default)]
pub struct SessionSlot {
    /// Last sequence id accepted
    pub sequence_id: u32,
    /// Request in progress
    pub in_use: bool,
    /// Whether the reply of the current request is to be cached
    pub cache_this: bool,
    /// Cached reply of the last completed request
    pub cached_reply: Option<Bytes>,
}

impl SessionSlot {
    /// Create a new slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate sequence ID
    pub fn check(&self, seqid: u32) -> SlotCheck {
        if self.in_use {
            if seqid == self.sequence_id {
                return SlotCheck::Continuation;
            }
            if seqid == self.sequence_id.wrapping_add(1) {
                return SlotCheck::InUse;
            }
            return SlotCheck::Misordered;
        }
        if seqid == self.sequence_id.wrapping_add(1) {
            SlotCheck::New
        } else if seqid == self.sequence_id {
            SlotCheck::Replay
        } else {
            SlotCheck::Misordered
        }
    }
}

pub(crate) struct Session {
    pub id: SessionId,
    pub client: ClientKey,
    pub slots: Vec<SessionSlot>,
    pub backchannel: Option<Arc<dyn CallbackClient>>,
    /// Backchannel slot 0: last seqid sent, locked while a call is in flight
    pub cb_slot: Arc<Mutex<u32>>,
    /// Callbacks in flight on the backchannel hold read guards
    pub drain: Arc<RwLock<()>>,
}

impl Session {
    pub fn into_drain(self) -> SessionDrain {
        SessionDrain {
            id: self.id,
            drain: self.drain,
            backchannel: self.backchannel,
        }
    }
}

/// A destroyed session waiting for its backchannel calls to finish
pub(crate) struct SessionDrain {
    pub id: SessionId,
    drain: Arc<RwLock<()>>,
    backchannel: Option<Arc<dyn CallbackClient>>,
}

impl SessionDrain {
    pub async fn wait(self) {
        let _quiet = self.drain.write().await;
        if let Some(backchannel) = self.backchannel {
            backchannel.shutdown().await;
        }
        debug!("session {} drained", hex::encode(self.id));
    }
}

/// CREATE_SESSION arguments
#[derive(Clone)]
pub struct CreateSessionArgs {
    /// Client id from EXCHANGE_ID
    pub client: ClientKey,
    /// CREATE_SESSION sequence id
    pub sequence_id: u32,
    /// Requested fore channel attributes
    pub fore_channel: ChannelAttrs,
    /// Requested back channel attributes
    pub back_channel: Option<ChannelAttrs>,
    /// Callback program
    pub cb_program: u32,
    /// Backchannel bound to the creating connection
    pub backchannel: Option<Arc<dyn CallbackClient>>,
}

impl CreateSessionArgs {
    /// Arguments without a backchannel
    pub fn new(client: ClientKey, sequence_id: u32) -> Self {
        Self {
            client,
            sequence_id,
            fore_channel: ChannelAttrs::default(),
            back_channel: None,
            cb_program: 0,
            backchannel: None,
        }
    }

    /// Bind a backchannel
    pub fn with_backchannel(mut self, cb_program: u32, backchannel: Arc<dyn CallbackClient>) -> Self {
        self.cb_program = cb_program;
        self.back_channel = Some(ChannelAttrs {
            max_requests: 1,
            ..ChannelAttrs::default()
        });
        self.backchannel = Some(backchannel);
        self
    }
}

/// CREATE_SESSION result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionReply {
    /// New session
    pub session_id: SessionId,
    /// Echoed sequence id
    pub sequence_id: u32,
    /// `CREATE_SESSION4_FLAG_*` bits
    pub flags: u32,
    /// Granted fore channel attributes
    pub fore_channel: ChannelAttrs,
    /// Granted back channel attributes
    pub back_channel: Option<ChannelAttrs>,
}

/// SEQUENCE arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceArgs {
    /// Session
    pub session_id: SessionId,
    /// Slot sequence id
    pub sequence_id: u32,
    /// Slot
    pub slot_id: u32,
    /// Highest slot the client has in use
    pub highest_slot_id: u32,
    /// Cache the reply of this request
    pub cache_this: bool,
}

/// SEQUENCE result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceReply {
    /// Session
    pub session_id: SessionId,
    /// Slot sequence id
    pub sequence_id: u32,
    /// Slot
    pub slot_id: u32,
    /// Highest slot id the server will accept
    pub highest_slot_id: u32,
    /// Slot count the server would like the client to use
    pub target_highest_slot_id: u32,
    /// `SEQ4_STATUS_*` bits
    pub status_flags: u32,
    /// Cached reply to resend instead of executing the request
    pub replay: Option<Bytes>,
}

impl StateTables {
    fn alloc_session_id(&mut self, client: ClientKey) -> SessionId {
        let counter = self.next_session;
        self.next_session = self.next_session.wrapping_add(1);
        let mut id = [0u8; 16];
        id[..4].copy_from_slice(&self.boot.to_be_bytes());
        id[4..8].copy_from_slice(&client.id.to_be_bytes());
        id[8..12].copy_from_slice(&counter.to_be_bytes());
        id
    }

    /// Route for a callback over one of the client's session backchannels
    pub(crate) fn backchannel_route(&self, client: ClientKey) -> Option<CallbackRoute> {
        let ids: Vec<SessionId> = self.confirmed.get(&client)?.sessions.iter().copied().collect();
        for id in ids {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };
            let Some(handle) = session.backchannel.clone() else {
                continue;
            };
            // a writer means the session is being destroyed
            let Ok(guard) = session.drain.clone().try_read_owned() else {
                continue;
            };
            return Some(CallbackRoute::Backchannel {
                client,
                handle,
                session_id: id,
                slot: session.cb_slot.clone(),
                _drain: guard,
            });
        }
        None
    }
}

fn create_session_locked(
    tables: &mut StateTables,
    ctx: &CompoundContext,
    args: CreateSessionArgs,
    now: Instant,
    work: &mut DeferredWork,
) -> StatusResult<CreateSessionReply> {
    let key = args.client;
    if key.boot != tables.boot {
        return Err(NfsStatus::StaleClientId);
    }

    if let Some(conf) = tables.confirmed.get(&key) {
        if args.sequence_id == conf.cs_seqid.wrapping_sub(1) {
            return match &conf.cs_reply {
                Some(reply) => reply.clone(),
                None => Err(NfsStatus::SeqMisordered),
            };
        }
        if args.sequence_id != conf.cs_seqid {
            return Err(NfsStatus::SeqMisordered);
        }
    } else if let Some(unconf) = tables.unconfirmed.get(&key) {
        if args.sequence_id != unconf.cs_seqid {
            return Err(NfsStatus::SeqMisordered);
        }
        if !unconf.creds.same_principal(&ctx.creds) {
            return Err(NfsStatus::ClientIdInUse);
        }
        promote(tables, key, now, work);
    } else {
        return Err(NfsStatus::StaleClientId);
    }

    let slots = args
        .fore_channel
        .max_requests
        .clamp(1, tables.max_session_slots);
    let fore_channel = ChannelAttrs {
        max_requests: slots,
        ..args.fore_channel
    };
    let id = tables.alloc_session_id(key);
    let has_backchannel = args.backchannel.is_some();
    let session = Session {
        id,
        client: key,
        slots: (0..slots).map(|_| SessionSlot::new()).collect(),
        backchannel: args.backchannel,
        cb_slot: Arc::new(Mutex::new(0)),
        drain: Arc::new(RwLock::new(())),
    };
    tables.sessions.insert(id, session);

    let reply = CreateSessionReply {
        session_id: id,
        sequence_id: args.sequence_id,
        flags: if has_backchannel {
            CREATE_SESSION4_FLAG_CONN_BACK_CHAN
        } else {
            0
        },
        fore_channel,
        back_channel: args.back_channel,
    };

    let client = tables.confirmed_client_mut(key)?;
    client.sessions.insert(id);
    client.cs_seqid = args.sequence_id.wrapping_add(1);
    client.cs_reply = Some(Ok(reply.clone()));
    if has_backchannel {
        client.cb_state = CallbackState::Probing;
    }
    tables.renew_client(key, true, now);
    if has_backchannel {
        if let Some(route) = tables.backchannel_route(key) {
            work.probes.push(ProbeJob { route });
        }
    }
    info!(
        "created session {} for client {} ({} slots)",
        hex::encode(id),
        key,
        slots
    );
    Ok(reply)
}

fn sequence_locked(
    tables: &mut StateTables,
    args: &SequenceArgs,
    now: Instant,
) -> StatusResult<(SequenceReply, ClientKey)> {
    let session = tables
        .sessions
        .get_mut(&args.session_id)
        .ok_or(NfsStatus::BadSession)?;
    let highest_slot_id = session.slots.len() as u32 - 1;
    let client = session.client;
    let slot = session
        .slots
        .get_mut(args.slot_id as usize)
        .ok_or(NfsStatus::BadSlot)?;

    let replay = match slot.check(args.sequence_id) {
        SlotCheck::New => {
            slot.sequence_id = args.sequence_id;
            slot.in_use = true;
            slot.cache_this = args.cache_this;
            slot.cached_reply = None;
            None
        }
        SlotCheck::Continuation => None,
        SlotCheck::Replay => match &slot.cached_reply {
            Some(cached) => Some(cached.clone()),
            None => return Err(NfsStatus::RetryUncachedRep),
        },
        SlotCheck::InUse => return Err(NfsStatus::Delay),
        SlotCheck::Misordered => return Err(NfsStatus::SeqMisordered),
    };

    let record = tables.confirmed_client(client)?;
    let status_flags = if record.cb_state == CallbackState::Broken {
        SEQ4_STATUS_CB_PATH_DOWN
    } else {
        0
    };
    tables.renew_client(client, true, now);
    Ok((
        SequenceReply {
            session_id: args.session_id,
            sequence_id: args.sequence_id,
            slot_id: args.slot_id,
            highest_slot_id,
            target_highest_slot_id: highest_slot_id,
            status_flags,
            replay,
        },
        client,
    ))
}

impl StateManager {
    /// CREATE_SESSION
    ///
    /// Confirms an unconfirmed EXCHANGE_ID client on first use.
    pub async fn create_session(
        &self,
        ctx: &CompoundContext,
        args: CreateSessionArgs,
    ) -> StatusResult<CreateSessionReply> {
        let mut work = DeferredWork::default();
        let result = {
            let mut tables = self.inner.tables.lock();
            create_session_locked(&mut tables, ctx, args, Instant::now(), &mut work)
        };
        self.finish(work).await;
        result
    }

    /// SEQUENCE
    ///
    /// On success the session and slot are bound to `ctx` for the rest of
    /// the COMPOUND. A reply carrying `replay` must be sent as is.
    pub fn sequence(&self, ctx: &mut CompoundContext, args: SequenceArgs) -> StatusResult<SequenceReply> {
        let (reply, client) = {
            let mut tables = self.inner.tables.lock();
            sequence_locked(&mut tables, &args, Instant::now())?
        };
        ctx.session = Some(SessionBinding {
            session_id: args.session_id,
            slot_id: args.slot_id,
            client,
        });
        Ok(reply)
    }

    /// End the request on the bound slot, caching `reply` if SEQUENCE asked for it
    pub fn complete_sequence(&self, ctx: &CompoundContext, reply: Bytes) -> StatusResult<()> {
        let binding = ctx.session.ok_or(NfsStatus::BadSession)?;
        let mut tables = self.inner.tables.lock();
        let session = tables
            .sessions
            .get_mut(&binding.session_id)
            .ok_or(NfsStatus::BadSession)?;
        let slot = session
            .slots
            .get_mut(binding.slot_id as usize)
            .ok_or(NfsStatus::BadSlot)?;
        if slot.cache_this {
            slot.cached_reply = Some(reply);
        }
        slot.in_use = false;
        Ok(())
    }

    /// DESTROY_SESSION
    ///
    /// Waits for callbacks in flight on the session's backchannel before
    /// returning.
    pub async fn destroy_session(&self, id: SessionId) -> StatusResult<()> {
        let drain = {
            let mut tables = self.inner.tables.lock();
            let session = tables.sessions.remove(&id).ok_or(NfsStatus::BadSession)?;
            let client = session.client;
            if let Ok(record) = tables.confirmed_client_mut(client) {
                record.sessions.remove(&id);
            }
            let backchannel_left = tables
                .confirmed
                .get(&client)
                .map(|c| {
                    c.sessions.iter().any(|s| {
                        tables
                            .sessions
                            .get(s)
                            .map(|s| s.backchannel.is_some())
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if session.backchannel.is_some() && !backchannel_left {
                if let Ok(record) = tables.confirmed_client_mut(client) {
                    record.cb_state = CallbackState::Broken;
                }
            }
            info!("destroying session {} of client {}", hex::encode(id), client);
            session.into_drain()
        };
        drain.wait().await;
        Ok(())
    }
}
