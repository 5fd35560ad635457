//! Callback subsystem
//!
//! Outbound RPCs from the server to clients: CB_NULL probes, CB_RECALL for
//! delegations, CB_LAYOUTRECALL and CB_NOTIFY_DEVICEID for pNFS. Minor
//! version 0 clients are reached through a connection the server opens to
//! the address they registered; minor version 1 clients through the
//! backchannel of one of their sessions, sequenced with CB_SEQUENCE.
//!
//! Every call runs on its own task, bounded by a semaphore, with a
//! per-attempt timeout and a small retry budget. The transport is a trait so
//! the RPC layer stays outside this crate.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedRwLockReadGuard, Semaphore};
use tracing::{debug, info, warn};

use super::session::SessionId;
use super::tables::StateTables;
use super::{ClientKey, Nfs4FileHandle, StateId};
use crate::config::NfsStateConfig;
use crate::error::NfsStatus;
use crate::manager::StateManager;
use crate::pnfs::{DeviceNotification, LayoutIoMode, LayoutRecallRequest, LayoutType};

/// Callback program registered by a v4.0 client (SETCLIENTID `cb_program`, `callback_ident`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallbackInfo {
    /// Address the client listens on; `None` when it gave no usable address
    pub addr: Option<SocketAddr>,
    /// RPC program number
    pub program: u32,
    /// Identifier echoed in every callback compound
    pub ident: u32,
}

impl CallbackInfo {
    /// Create callback info
    pub fn new(addr: SocketAddr, program: u32, ident: u32) -> Self {
        Self {
            addr: Some(addr),
            program,
            ident,
        }
    }
}

/// Health of a client's callback path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    /// Never probed
    Unprobed,
    /// Probe in flight
    Probing,
    /// Last probe or call succeeded
    Healthy,
    /// Last probe or call failed at the network level
    Broken,
}

/// Where the transport should connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackTarget {
    /// Client callback address
    pub addr: SocketAddr,
    /// RPC program number
    pub program: u32,
    /// Minor version of the callback compound
    pub minor_version: u32,
}

/// CB_SEQUENCE arguments for backchannel calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbSequence {
    /// Session the backchannel belongs to
    pub session_id: SessionId,
    /// Slot sequence id
    pub seqid: u32,
    /// Slot used
    pub slot_id: u32,
    /// Highest slot in use
    pub highest_slot_id: u32,
}

/// Callback operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRequest {
    /// CB_NULL
    Null,
    /// CB_RECALL
    Recall {
        /// Delegation stateid
        stateid: StateId,
        /// Whether the file is being truncated
        truncate: bool,
        /// File
        fh: Nfs4FileHandle,
    },
    /// CB_LAYOUTRECALL
    LayoutRecall {
        /// Layout type
        layout_type: LayoutType,
        /// I/O mode
        iomode: LayoutIoMode,
        /// Whether the layout changed (client must not write dirty data through it)
        changed: bool,
        /// What is recalled
        recall: LayoutRecallRequest,
    },
    /// CB_NOTIFY_DEVICEID
    NotifyDeviceId {
        /// Device changes
        changes: Vec<DeviceNotification>,
    },
}

impl CallbackRequest {
    /// Procedure name for logs
    pub fn name(&self) -> &'static str {
        match self {
            CallbackRequest::Null => "CB_NULL",
            CallbackRequest::Recall { .. } => "CB_RECALL",
            CallbackRequest::LayoutRecall { .. } => "CB_LAYOUTRECALL",
            CallbackRequest::NotifyDeviceId { .. } => "CB_NOTIFY_DEVICEID",
        }
    }
}

/// One callback compound handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackCall {
    /// `callback_ident` (minor version 0)
    pub ident: u32,
    /// Minor version
    pub minor_version: u32,
    /// CB_SEQUENCE (minor version 1)
    pub sequence: Option<CbSequence>,
    /// Operation
    pub request: CallbackRequest,
}

/// Callback failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    /// Connection could not be made or broke
    #[error("callback transport error: {0}")]
    Transport(String),
    /// No reply within the timeout
    #[error("callback timed out")]
    Timeout,
    /// Client answered with an error status
    #[error("client replied {0}")]
    Status(NfsStatus),
}

impl CallbackError {
    /// Failure of the path itself rather than of the operation
    pub fn is_network(&self) -> bool {
        matches!(self, CallbackError::Transport(_) | CallbackError::Timeout)
    }

    /// Worth another attempt
    ///
    /// A client may answer BAD_STATEID to a recall that overtook the OPEN
    /// reply carrying the delegation.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallbackError::Transport(_) | CallbackError::Timeout => true,
            CallbackError::Status(status) => matches!(
                status,
                NfsStatus::BadStateId | NfsStatus::BadHandle | NfsStatus::Delay
            ),
        }
    }
}

/// Connected callback client
#[async_trait]
pub trait CallbackClient: Send + Sync {
    /// Send one callback compound and wait for its status
    async fn call(&self, call: CallbackCall) -> Result<(), CallbackError>;

    /// Tear the connection down
    async fn shutdown(&self);
}

/// Factory for callback connections
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    /// Open a connection to a client's callback service
    async fn connect(&self, target: &CallbackTarget) -> Result<Arc<dyn CallbackClient>, CallbackError>;
}

/// How one callback reaches its client
pub(crate) enum CallbackRoute {
    /// Server-initiated connection (minor version 0)
    Channel {
        client: ClientKey,
        target: CallbackTarget,
        ident: u32,
    },
    /// Session backchannel (minor version 1); the guard keeps DESTROY_SESSION waiting
    Backchannel {
        client: ClientKey,
        handle: Arc<dyn CallbackClient>,
        session_id: SessionId,
        slot: Arc<tokio::sync::Mutex<u32>>,
        _drain: OwnedRwLockReadGuard<()>,
    },
}

impl CallbackRoute {
    pub fn client(&self) -> ClientKey {
        match self {
            CallbackRoute::Channel { client, .. } => *client,
            CallbackRoute::Backchannel { client, .. } => *client,
        }
    }
}

/// A pending CB_NULL probe
pub(crate) struct ProbeJob {
    pub route: CallbackRoute,
}

struct InflightGuard {
    inflight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Runs callback tasks and caches minor version 0 connections
pub struct CallbackManager {
    transport: Arc<dyn CallbackTransport>,
    channels: DashMap<ClientKey, Arc<dyn CallbackClient>>,
    permits: Arc<Semaphore>,
    inflight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    retries: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl CallbackManager {
    /// Create a callback manager
    pub fn new(transport: Arc<dyn CallbackTransport>, config: &NfsStateConfig) -> Self {
        Self {
            transport,
            channels: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_callback_tasks)),
            inflight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            retries: config.callback_retries,
            retry_delay: config.callback_retry_delay,
            timeout: config.callback_timeout,
        }
    }

    /// Callback tasks spawned and not yet finished
    pub fn in_flight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Wait until no callback task is running
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Run a callback task in the background
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime, callback task dropped");
            return;
        };
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            inflight: self.inflight.clone(),
            idle: self.idle.clone(),
        };
        let permits = self.permits.clone();
        runtime.spawn(async move {
            let _guard = guard;
            let _permit = permits.acquire_owned().await.ok();
            task.await;
        });
    }

    /// Send one callback, retrying transient failures
    ///
    /// Backchannel calls of one session go out one at a time on slot 0. The
    /// seqid is taken once the slot is held; a retry after a lost reply
    /// reuses it, a retry after an answered one takes the next.
    pub(crate) async fn call(
        &self,
        route: &CallbackRoute,
        request: CallbackRequest,
    ) -> Result<(), CallbackError> {
        let mut slot = match route {
            CallbackRoute::Backchannel { slot, .. } => Some(slot.lock().await),
            CallbackRoute::Channel { .. } => None,
        };
        let mut attempt = 0;
        let mut advance = true;
        loop {
            if advance {
                if let Some(seqid) = slot.as_mut() {
                    **seqid = seqid.wrapping_add(1);
                }
            }
            let result = match route {
                CallbackRoute::Channel {
                    client,
                    target,
                    ident,
                } => match self.connection(*client, target).await {
                    Ok(handle) => {
                        let call = CallbackCall {
                            ident: *ident,
                            minor_version: target.minor_version,
                            sequence: None,
                            request: request.clone(),
                        };
                        self.attempt(handle.as_ref(), call).await
                    }
                    Err(err) => Err(err),
                },
                CallbackRoute::Backchannel {
                    handle, session_id, ..
                } => {
                    let call = CallbackCall {
                        ident: 0,
                        minor_version: 1,
                        sequence: slot.as_deref().map(|seqid| CbSequence {
                            session_id: *session_id,
                            seqid: *seqid,
                            slot_id: 0,
                            highest_slot_id: 0,
                        }),
                        request: request.clone(),
                    };
                    self.attempt(handle.as_ref(), call).await
                }
            };

            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries && err.is_retryable() => {
                    if err.is_network() {
                        if let CallbackRoute::Channel { client, .. } = route {
                            self.channels.remove(client);
                        }
                    }
                    advance = !err.is_network();
                    attempt += 1;
                    debug!(
                        "{} to client {} failed ({}), retry {}/{}",
                        request.name(),
                        route.client(),
                        err,
                        attempt,
                        self.retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drop the cached connection of an expired client
    pub(crate) fn forget(&self, client: ClientKey) {
        if let Some((_, handle)) = self.channels.remove(&client) {
            self.spawn(async move { handle.shutdown().await });
        }
    }

    async fn attempt(&self, handle: &dyn CallbackClient, call: CallbackCall) -> Result<(), CallbackError> {
        match tokio::time::timeout(self.timeout, handle.call(call)).await {
            Ok(result) => result,
            Err(_) => Err(CallbackError::Timeout),
        }
    }

    async fn connection(
        &self,
        client: ClientKey,
        target: &CallbackTarget,
    ) -> Result<Arc<dyn CallbackClient>, CallbackError> {
        if let Some(handle) = self.channels.get(&client) {
            return Ok(handle.clone());
        }
        let handle = match tokio::time::timeout(self.timeout, self.transport.connect(target)).await {
            Ok(result) => result?,
            Err(_) => return Err(CallbackError::Timeout),
        };
        self.channels.insert(client, handle.clone());
        Ok(handle)
    }
}

impl StateTables {
    /// Route for the next callback to `client`, if it has a callback path at all
    pub(crate) fn callback_route(&mut self, key: ClientKey) -> Option<CallbackRoute> {
        let client = self.confirmed.get(&key)?;
        if client.minor_version >= 1 {
            return self.backchannel_route(key);
        }
        let addr = client.callback.addr?;
        Some(CallbackRoute::Channel {
            client: key,
            target: CallbackTarget {
                addr,
                program: client.callback.program,
                minor_version: client.minor_version,
            },
            ident: client.callback.ident,
        })
    }
}

impl StateManager {
    /// Probe a client's callback path in the background
    pub(crate) fn spawn_probe(&self, job: ProbeJob) {
        let manager = self.clone();
        self.inner.callbacks.spawn(async move {
            let client = job.route.client();
            let result = manager
                .inner
                .callbacks
                .call(&job.route, CallbackRequest::Null)
                .await;
            drop(job);

            let mut tables = manager.inner.tables.lock();
            if let Ok(record) = tables.confirmed_client_mut(client) {
                if record.cb_state == CallbackState::Probing {
                    record.cb_state = match &result {
                        Ok(()) => CallbackState::Healthy,
                        Err(_) => CallbackState::Broken,
                    };
                }
            }
            match result {
                Ok(()) => info!("callback path to client {} is up", client),
                Err(err) => warn!("callback probe of client {} failed: {}", client, err),
            }
        });
    }

    /// Record a network-level callback failure against a client
    pub(crate) fn mark_callback_broken(&self, client: ClientKey) {
        let mut tables = self.inner.tables.lock();
        if let Ok(record) = tables.confirmed_client_mut(client) {
            if record.cb_state != CallbackState::Broken {
                warn!("callback path to client {} is down", client);
            }
            record.cb_state = CallbackState::Broken;
        }
    }
}

#[derive(Debug)]
struct TransportState {
    reachable: bool,
    replies: VecDeque<Result<(), CallbackError>>,
    calls: Vec<CallbackCall>,
    connects: usize,
    shutdowns: usize,
    latency: Option<Duration>,
}

/// In-process callback transport
///
/// Records every call; replies come from a scripted queue, defaulting to
/// success. Used by tests and by embedders that do not issue callbacks.
#[derive(Debug, Clone)]
pub struct InMemoryCallbackTransport {
    state: Arc<Mutex<TransportState>>,
}

impl InMemoryCallbackTransport {
    /// Create a reachable transport
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                reachable: true,
                replies: VecDeque::new(),
                calls: Vec::new(),
                connects: 0,
                shutdowns: 0,
                latency: None,
            })),
        }
    }

    /// Make every connect and call fail at the network level
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Queue the outcome of a future call
    pub fn push_reply(&self, reply: Result<(), CallbackError>) {
        self.state.lock().replies.push_back(reply);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<CallbackCall> {
        self.state.lock().calls.clone()
    }

    /// Calls of one procedure made so far
    pub fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.request.name() == name)
            .count()
    }

    /// Connections opened
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Connections shut down
    pub fn shutdowns(&self) -> usize {
        self.state.lock().shutdowns
    }

    /// A client handle usable as a session backchannel
    pub fn backchannel(&self) -> Arc<dyn CallbackClient> {
        Arc::new(InMemoryCallbackClient {
            state: self.state.clone(),
        })
    }
}

impl Default for InMemoryCallbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallbackTransport for InMemoryCallbackTransport {
    async fn connect(&self, _target: &CallbackTarget) -> Result<Arc<dyn CallbackClient>, CallbackError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(CallbackError::Transport("connection refused".to_string()));
        }
        state.connects += 1;
        Ok(Arc::new(InMemoryCallbackClient {
            state: self.state.clone(),
        }))
    }
}

struct InMemoryCallbackClient {
    state: Arc<Mutex<TransportState>>,
}

#[async_trait]
impl CallbackClient for InMemoryCallbackClient {
    async fn call(&self, call: CallbackCall) -> Result<(), CallbackError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.calls.push(call);
        if !state.reachable {
            return Err(CallbackError::Transport("connection reset".to_string()));
        }
        state.replies.pop_front().unwrap_or(Ok(()))
    }

    async fn shutdown(&self) {
        self.state.lock().shutdowns += 1;
    }
}
