//! Fixtures shared by unit tests

use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use crate::config::NfsStateConfig;
use crate::manager::StateManager;
use crate::nfs4::callback::{CallbackInfo, InMemoryCallbackTransport};
use crate::nfs4::client::Credentials;
use crate::nfs4::compound::CompoundContext;
use crate::nfs4::session::{CreateSessionArgs, SequenceArgs, SessionId};
use crate::nfs4::{ClientKey, Nfs4FileHandle, Verifier};
use crate::pnfs::Fsid;
use crate::storage::MemoryStorage;

pub(crate) const FSID: Fsid = Fsid { major: 1, minor: 1 };

const CB_PROGRAM: u32 = 0x4000_0000;

thread_local! {
    // transport of the last manager built on this thread, used for backchannels
    static TRANSPORT: RefCell<Option<InMemoryCallbackTransport>> = const { RefCell::new(None) };
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(grace: Duration) -> (StateManager, Arc<MemoryStorage>, InMemoryCallbackTransport) {
    init_tracing();
    let config = NfsStateConfig::new()
        .with_grace_period(grace)
        .with_callback_retries(1, Duration::from_millis(1))
        .with_callback_timeout(Duration::from_secs(1));
    let storage = Arc::new(MemoryStorage::new());
    let transport = InMemoryCallbackTransport::new();
    let mgr = StateManager::new(config, storage.clone(), Arc::new(transport.clone())).unwrap();
    TRANSPORT.with(|t| *t.borrow_mut() = Some(transport.clone()));
    (mgr, storage, transport)
}

/// Manager with no grace period
pub(crate) fn manager() -> (StateManager, Arc<MemoryStorage>, InMemoryCallbackTransport) {
    build(Duration::ZERO)
}

/// Manager still in its grace period
pub(crate) fn manager_in_grace() -> (StateManager, Arc<MemoryStorage>, InMemoryCallbackTransport) {
    build(Duration::from_secs(90))
}

fn peer() -> SocketAddr {
    "10.0.0.1:700".parse().unwrap()
}

pub(crate) fn ctx_v0() -> CompoundContext {
    CompoundContext::new(0, Credentials::unix(1000, 1000), peer())
}

pub(crate) fn ctx_v1() -> CompoundContext {
    CompoundContext::new(1, Credentials::unix(1000, 1000), peer())
}

/// Register a file with the storage backend
pub(crate) fn file(storage: &MemoryStorage, n: u8) -> Nfs4FileHandle {
    let fh = Nfs4FileHandle::new(vec![n; 16]);
    storage.add_file(fh.clone(), FSID, u64::from(n));
    fh
}

/// Confirmed v4.0 client without a callback address
pub(crate) async fn confirmed_v0(mgr: &StateManager, ctx: &CompoundContext, name: &[u8]) -> ClientKey {
    let (key, confirm) = mgr
        .establish_client(ctx, name, Verifier([1; 8]), CallbackInfo::default())
        .await
        .unwrap();
    mgr.confirm_client(ctx, key, confirm).await.unwrap();
    key
}

/// Confirmed v4.0 client whose callback probe has succeeded
pub(crate) async fn healthy_v0(mgr: &StateManager, ctx: &CompoundContext, name: &[u8]) -> ClientKey {
    let callback = CallbackInfo::new("10.0.0.1:40000".parse().unwrap(), CB_PROGRAM, 1);
    let (key, confirm) = mgr
        .establish_client(ctx, name, Verifier([1; 8]), callback)
        .await
        .unwrap();
    mgr.confirm_client(ctx, key, confirm).await.unwrap();
    mgr.callbacks().drain().await;
    key
}

/// v4.1 client with a session and a healthy backchannel, bound to `ctx`
pub(crate) async fn v41_client(
    mgr: &StateManager,
    ctx: &mut CompoundContext,
    name: &[u8],
) -> (ClientKey, SessionId) {
    let transport = TRANSPORT
        .with(|t| t.borrow().clone())
        .unwrap_or_default();
    let reply = mgr.exchange_id(ctx, name, Verifier([7; 8])).await.unwrap();
    let args = CreateSessionArgs::new(reply.client, reply.sequence_id)
        .with_backchannel(CB_PROGRAM, transport.backchannel());
    let session = mgr.create_session(ctx, args).await.unwrap();
    mgr.callbacks().drain().await;

    let seq = SequenceArgs {
        session_id: session.session_id,
        sequence_id: 1,
        slot_id: 0,
        highest_slot_id: 0,
        cache_this: false,
    };
    mgr.sequence(ctx, seq).unwrap();
    mgr.complete_sequence(ctx, Bytes::new()).unwrap();
    (reply.client, session.session_id)
}
