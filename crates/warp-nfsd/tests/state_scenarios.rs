//! State core integration tests
//!
//! End-to-end runs of client, open, lock, delegation and layout flows
//! against the in-memory storage backend and callback transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::time::Instant;
use warp_nfsd::nfs4::callback::CallbackInfo;
use warp_nfsd::nfs4::client::Credentials;
use warp_nfsd::nfs4::lock::LockType;
use warp_nfsd::nfs4::session::{CreateSessionArgs, SequenceArgs};
use warp_nfsd::nfs4::state::{
    LockArgs, LockReply, Locker, OpenArgs, OpenClaim, ShareAccess, ShareDeny,
};
use warp_nfsd::pnfs::{
    Fsid, LayoutGetArgs, LayoutIoMode, LayoutRange, LayoutReturnArgs, LayoutReturnScope,
    LayoutType,
};
use warp_nfsd::{
    ClientKey, CompoundContext, InMemoryCallbackTransport, MemoryStorage, Nfs4FileHandle,
    NfsStateConfig, NfsStatus, StateManager, Verifier,
};

const LEASE: Duration = Duration::from_secs(90);

struct Harness {
    mgr: StateManager,
    storage: Arc<MemoryStorage>,
    transport: InMemoryCallbackTransport,
}

fn harness() -> Harness {
    let config = NfsStateConfig::new()
        .with_grace_period(Duration::ZERO)
        .with_callback_retries(1, Duration::from_millis(1))
        .with_callback_timeout(Duration::from_secs(1));
    let storage = Arc::new(MemoryStorage::new());
    let transport = InMemoryCallbackTransport::new();
    let mgr = StateManager::new(config, storage.clone(), Arc::new(transport.clone()))
        .expect("valid config");
    Harness {
        mgr,
        storage,
        transport,
    }
}

fn peer() -> SocketAddr {
    "192.168.1.20:800".parse().unwrap()
}

fn ctx(minor_version: u32) -> CompoundContext {
    CompoundContext::new(minor_version, Credentials::unix(500, 500), peer())
}

impl Harness {
    fn file(&self, n: u8) -> Nfs4FileHandle {
        let fh = Nfs4FileHandle::new(vec![n; 32]);
        self.storage.add_file(fh.clone(), Fsid::new(7, 0), u64::from(n));
        fh
    }

    async fn client_v0(&self, ctx: &CompoundContext, name: &[u8], callback: CallbackInfo) -> ClientKey {
        let (key, confirm) = self
            .mgr
            .establish_client(ctx, name, Verifier([1; 8]), callback)
            .await
            .unwrap();
        self.mgr.confirm_client(ctx, key, confirm).await.unwrap();
        self.mgr.callbacks().drain().await;
        key
    }

    async fn client_v1(&self, ctx: &mut CompoundContext, name: &[u8]) -> ClientKey {
        let reply = self.mgr.exchange_id(ctx, name, Verifier([2; 8])).await.unwrap();
        let args = CreateSessionArgs::new(reply.client, reply.sequence_id)
            .with_backchannel(0x4000_0000, self.transport.backchannel());
        let session = self.mgr.create_session(ctx, args).await.unwrap();
        self.mgr.callbacks().drain().await;
        let seq = SequenceArgs {
            session_id: session.session_id,
            sequence_id: 1,
            slot_id: 0,
            highest_slot_id: 0,
            cache_this: false,
        };
        self.mgr.sequence(ctx, seq).unwrap();
        self.mgr.complete_sequence(ctx, Bytes::new()).unwrap();
        reply.client
    }
}

#[tokio::test]
async fn test_same_verifier_keeps_client_id() {
    let h = harness();
    let ctx = ctx(0);
    let first = h.client_v0(&ctx, b"host-a", CallbackInfo::default()).await;

    let callback = CallbackInfo::new("192.168.1.20:45000".parse().unwrap(), 0x4000_0000, 3);
    let (again, confirm) = h
        .mgr
        .establish_client(&ctx, b"host-a", Verifier([1; 8]), callback)
        .await
        .unwrap();
    assert_eq!(again, first);
    h.mgr.confirm_client(&ctx, again, confirm).await.unwrap();
    h.mgr.callbacks().drain().await;

    let counters = h.mgr.counters();
    assert_eq!(counters.confirmed_clients, 1);
    assert_eq!(counters.unconfirmed_clients, 0);
    assert_eq!(h.transport.count("CB_NULL"), 1);
}

#[tokio::test]
async fn test_deny_write_refused_while_writer_open() {
    let h = harness();
    let ctx = ctx(0);
    let client = h.client_v0(&ctx, b"host-a", CallbackInfo::default()).await;
    let fh = h.file(1);

    let reader = OpenArgs::new(client, b"reader", 1, fh.clone())
        .with_share(ShareAccess::READ, ShareDeny::NONE);
    h.mgr.process_open(&ctx, reader).await.unwrap();

    let writer = OpenArgs::new(client, b"writer", 1, fh.clone())
        .with_share(ShareAccess::WRITE, ShareDeny::NONE);
    h.mgr.process_open(&ctx, writer).await.unwrap();

    let excluder = OpenArgs::new(client, b"excluder", 1, fh)
        .with_share(ShareAccess::READ, ShareDeny::WRITE);
    assert_eq!(
        h.mgr.process_open(&ctx, excluder).await,
        Err(NfsStatus::ShareDenied)
    );
    assert_eq!(h.mgr.counters().open_stateids, 2);
}

#[tokio::test]
async fn test_replayed_lock_returns_cached_grant() {
    let h = harness();
    let ctx = ctx(0);
    let client = h.client_v0(&ctx, b"host-a", CallbackInfo::default()).await;
    let fh = h.file(1);

    let open = h
        .mgr
        .process_open(
            &ctx,
            OpenArgs::new(client, b"owner", 1, fh).with_share(ShareAccess::BOTH, ShareDeny::NONE),
        )
        .await
        .unwrap();
    let stateid = h.mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();

    let lock = LockArgs {
        lock_type: LockType::WriteLt,
        reclaim: false,
        offset: 0,
        length: 4096,
        locker: Locker::NewOwner {
            open_seqid: 3,
            open_stateid: stateid,
            lock_seqid: 1,
            owner: b"pid-42".to_vec(),
        },
    };
    let granted = h.mgr.lock(&ctx, lock.clone()).await.unwrap();
    assert!(matches!(granted, LockReply::Granted(_)));

    let replayed = h.mgr.lock(&ctx, lock).await.unwrap();
    assert_eq!(replayed, granted);
    assert_eq!(h.mgr.counters().lock_stateids, 1);
}

#[tokio::test]
async fn test_layout_merge_then_return_in_pieces() {
    let h = harness();
    h.storage.set_merge_layouts(LayoutType::NfsV41Files, true);
    let mut ctx = ctx(1);
    let client = h.client_v1(&mut ctx, b"pnfs-host").await;
    let fh = h.file(1);

    let open = h
        .mgr
        .process_open(
            &ctx,
            OpenArgs::new(client, b"owner", 0, fh.clone())
                .with_share(ShareAccess::BOTH, ShareDeny::NONE)
                .with_claim(OpenClaim::Fh),
        )
        .await
        .unwrap();

    let first = h
        .mgr
        .layout_get(
            &ctx,
            LayoutGetArgs::new(fh.clone(), LayoutIoMode::ReadWrite, LayoutRange::new(0, 1000), open.stateid),
        )
        .await
        .unwrap();
    let second = h
        .mgr
        .layout_get(
            &ctx,
            LayoutGetArgs::new(fh.clone(), LayoutIoMode::ReadWrite, LayoutRange::new(1000, 1000), first.stateid),
        )
        .await
        .unwrap();
    assert_eq!(h.mgr.counters().layout_segments, 1);

    let partial = h
        .mgr
        .layout_return(
            &ctx,
            LayoutReturnArgs {
                layout_type: LayoutType::NfsV41Files,
                iomode: LayoutIoMode::ReadWrite,
                scope: LayoutReturnScope::File {
                    fh: fh.clone(),
                    range: LayoutRange::new(500, 1000),
                    stateid: second.stateid,
                },
            },
        )
        .await
        .unwrap();
    // a return strictly inside the segment does not split it
    assert_eq!(partial.returned, 0);
    assert_eq!(h.mgr.counters().layout_segments, 1);
    let stateid = partial.stateid.expect("layout still held");

    let rest = h
        .mgr
        .layout_return(
            &ctx,
            LayoutReturnArgs {
                layout_type: LayoutType::NfsV41Files,
                iomode: LayoutIoMode::Any,
                scope: LayoutReturnScope::File {
                    fh,
                    range: LayoutRange::whole(),
                    stateid,
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(rest.stateid, None);
    assert_eq!(rest.returned, 1);
    let counters = h.mgr.counters();
    assert_eq!(counters.layout_segments, 0);
    assert_eq!(counters.layout_states, 0);
}

#[tokio::test]
async fn test_layout_get_then_identical_return_leaves_nothing() {
    let h = harness();
    let mut ctx = ctx(1);
    let client = h.client_v1(&mut ctx, b"pnfs-host").await;
    let fh = h.file(3);
    let open = h
        .mgr
        .process_open(
            &ctx,
            OpenArgs::new(client, b"owner", 0, fh.clone()).with_claim(OpenClaim::Fh),
        )
        .await
        .unwrap();

    let range = LayoutRange::new(4096, 8192);
    let got = h
        .mgr
        .layout_get(&ctx, LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, range, open.stateid))
        .await
        .unwrap();
    h.mgr
        .layout_return(
            &ctx,
            LayoutReturnArgs {
                layout_type: LayoutType::NfsV41Files,
                iomode: LayoutIoMode::Read,
                scope: LayoutReturnScope::File {
                    fh,
                    range,
                    stateid: got.stateid,
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(h.mgr.counters().layout_segments, 0);
    assert_eq!(h.storage.stats().layout_returns, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_holder_loses_delegation_after_one_lease() {
    let h = harness();
    let ctx = ctx(0);
    let callback = CallbackInfo::new("192.168.1.20:45000".parse().unwrap(), 0x4000_0000, 1);
    let holder = h.client_v0(&ctx, b"holder", callback).await;
    let writer = h.client_v0(&ctx, b"writer", CallbackInfo::default()).await;
    let fh = h.file(1);

    let open = h
        .mgr
        .process_open(&ctx, OpenArgs::new(holder, b"o", 1, fh.clone()))
        .await
        .unwrap();
    h.mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();
    let open = h
        .mgr
        .process_open(&ctx, OpenArgs::new(holder, b"o", 3, fh.clone()))
        .await
        .unwrap();
    assert!(open.delegation.is_some());

    h.transport.set_reachable(false);
    let recalled_at = Instant::now();
    let conflicting =
        OpenArgs::new(writer, b"w", 1, fh).with_share(ShareAccess::WRITE, ShareDeny::NONE);
    assert_eq!(h.mgr.process_open(&ctx, conflicting).await, Err(NfsStatus::Delay));
    h.mgr.callbacks().drain().await;
    assert!(h.transport.count("CB_RECALL") >= 1);
    assert_eq!(h.mgr.renew(holder), Err(NfsStatus::CbPathDown));

    tokio::time::advance(LEASE / 2).await;
    let _ = h.mgr.renew(holder);
    h.mgr.renew(writer).unwrap();

    h.mgr
        .laundromat_pass(recalled_at + LEASE - Duration::from_millis(1))
        .await;
    assert_eq!(h.mgr.counters().delegations, 1);

    h.mgr.laundromat_pass(recalled_at + LEASE).await;
    assert_eq!(h.mgr.counters().delegations, 0);
    assert_eq!(h.mgr.counters().confirmed_clients, 2);
}

#[tokio::test(start_paused = true)]
async fn test_laundromat_spares_clients_within_lease() {
    let h = harness();
    let ctx = ctx(0);
    let client = h.client_v0(&ctx, b"host-a", CallbackInfo::default()).await;

    for _ in 0..5 {
        tokio::time::advance(LEASE - Duration::from_secs(1)).await;
        h.mgr.laundromat_pass(Instant::now()).await;
        h.mgr.renew(client).unwrap();
    }
    assert_eq!(h.mgr.counters().confirmed_clients, 1);

    tokio::time::advance(LEASE).await;
    h.mgr.laundromat_pass(Instant::now()).await;
    assert_eq!(h.mgr.renew(client), Err(NfsStatus::Expired));
}

#[tokio::test]
async fn test_expiring_twice_is_noop() {
    let h = harness();
    let ctx = ctx(0);
    let client = h.client_v0(&ctx, b"host-a", CallbackInfo::default()).await;
    let fh = h.file(1);
    h.mgr
        .process_open(&ctx, OpenArgs::new(client, b"owner", 1, fh))
        .await
        .unwrap();

    assert!(h.mgr.expire_client(client).await);
    let after_first = h.mgr.counters();
    assert_eq!(after_first.open_stateids, 0);
    assert_eq!(after_first.files, 0);

    assert!(!h.mgr.expire_client(client).await);
    assert_eq!(h.mgr.counters(), after_first);
    assert_eq!(h.storage.stats().closes, 1);
}

fn share_pair() -> impl Strategy<Value = (u32, u32)> {
    (1u32..=3, 0u32..=3)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_granted_shares_never_conflict(requests in prop::collection::vec(share_pair(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let granted = runtime.block_on(async {
            let h = harness();
            let ctx = ctx(0);
            let client = h.client_v0(&ctx, b"host-a", CallbackInfo::default()).await;
            let fh = h.file(1);
            let mut granted = Vec::new();
            for (i, (access, deny)) in requests.iter().enumerate() {
                let owner = format!("owner-{}", i);
                let args = OpenArgs::new(client, owner.as_bytes(), 1, fh.clone())
                    .with_share(ShareAccess::from_bits(*access), ShareDeny::from_bits(*deny));
                if h.mgr.process_open(&ctx, args).await.is_ok() {
                    granted.push((*access, *deny));
                }
            }
            granted
        });

        for (i, (access_a, deny_a)) in granted.iter().enumerate() {
            for (access_b, deny_b) in granted.iter().skip(i + 1) {
                prop_assert_eq!(access_a & deny_b, 0);
                prop_assert_eq!(access_b & deny_a, 0);
            }
        }
    }
}
