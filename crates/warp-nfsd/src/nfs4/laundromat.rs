//! Laundromat
//!
//! Periodic sweep that ends the grace period, expires clients whose lease
//! ran out, revokes delegations recalled more than a lease ago, forgets
//! layout recalls that made no progress for a lease and releases open owners
//! kept only to answer replayed CLOSEs. The client, recall and close queues
//! are kept in time order, so those walks stop at their first live entry.
//! Layout recalls are refreshed in place by partial returns and are scanned
//! in full.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::tables::{DeferredWork, StateTables};
use crate::manager::StateManager;

#[derive(Debug, Default)]
struct PassSummary {
    clients: usize,
    delegations: usize,
    layout_recalls: usize,
    owners: usize,
}

/// Time left until `deadline`, or `None` once it has passed
fn remaining(deadline: Instant, now: Instant) -> Option<Duration> {
    if deadline <= now {
        None
    } else {
        Some(deadline - now)
    }
}

fn expire_clients(
    tables: &mut StateTables,
    now: Instant,
    work: &mut DeferredWork,
    summary: &mut PassSummary,
) -> Option<Duration> {
    let lease = tables.lease;
    loop {
        let (key, confirmed) = *tables.client_lru.values().next()?;
        let map = if confirmed {
            &tables.confirmed
        } else {
            &tables.unconfirmed
        };
        let Some(client) = map.get(&key) else {
            // index entry without a record
            if let Some(seq) = tables.client_lru.keys().next().copied() {
                tables.client_lru.remove(&seq);
            }
            continue;
        };
        if let Some(left) = remaining(client.last_renewed + lease, now) {
            return Some(left);
        }
        info!("lease of client {} expired", key);
        tables.unhash_client(key, confirmed, work);
        summary.clients += 1;
    }
}

fn revoke_recalled(
    tables: &mut StateTables,
    now: Instant,
    work: &mut DeferredWork,
    summary: &mut PassSummary,
) -> Option<Duration> {
    let lease = tables.lease;
    while let Some((recalled, id)) = tables.recall_queue.front().copied() {
        let current = tables
            .delegations
            .get(&id)
            .map(|d| d.recall_time == Some(recalled))
            .unwrap_or(false);
        if current {
            if let Some(left) = remaining(recalled + lease, now) {
                return Some(left);
            }
            if let Some(deleg) = tables.unhash_delegation(id, work) {
                warn!(
                    "revoking delegation {} of client {}: not returned within a lease",
                    id, deleg.client
                );
                summary.delegations += 1;
            }
        }
        tables.recall_queue.pop_front();
    }
    None
}

fn expire_layout_recalls(
    tables: &mut StateTables,
    now: Instant,
    work: &mut DeferredWork,
    summary: &mut PassSummary,
) -> Option<Duration> {
    let lease = tables.lease;
    let mut next: Option<Duration> = None;
    let mut stale = Vec::new();
    for recall in tables.layout_recalls.values() {
        match remaining(recall.timestamp + lease, now) {
            Some(left) => next = Some(next.map_or(left, |n| n.min(left))),
            None => stale.push((recall.id, recall.client)),
        }
    }
    for (id, client) in stale {
        warn!(
            "layout recall {} of client {}: no return within a lease",
            id, client
        );
        tables.forget_recalled(id, work);
        summary.layout_recalls += 1;
    }
    next
}

fn reap_closed_owners(
    tables: &mut StateTables,
    now: Instant,
    work: &mut DeferredWork,
    summary: &mut PassSummary,
) -> Option<Duration> {
    let lease = tables.lease;
    while let Some((closed, id)) = tables.close_lru.front().copied() {
        let idle = tables
            .owners
            .get(&id)
            .map(|o| o.closed_at == Some(closed) && o.stateids.is_empty())
            .unwrap_or(false);
        if idle {
            if let Some(left) = remaining(closed + lease, now) {
                return Some(left);
            }
            tables.release_owner(id, work);
            summary.owners += 1;
        }
        tables.close_lru.pop_front();
    }
    None
}

impl StateManager {
    /// Run one laundromat pass at `now`
    ///
    /// Returns how long to sleep before the next pass: the time until the
    /// earliest pending expiry, never less than the configured floor and
    /// never more than a lease.
    pub async fn laundromat_pass(&self, now: Instant) -> Duration {
        let floor = self.inner.config.read().laundromat_min_interval;
        let mut work = DeferredWork::default();
        let mut summary = PassSummary::default();
        let next = {
            let mut tables = self.inner.tables.lock();
            if tables.grace {
                tables.grace = false;
                tables.reclaimable.clear();
                info!("grace period ended");
            }
            let mut next = tables.lease;
            let waits = [
                expire_clients(&mut tables, now, &mut work, &mut summary),
                revoke_recalled(&mut tables, now, &mut work, &mut summary),
                expire_layout_recalls(&mut tables, now, &mut work, &mut summary),
                reap_closed_owners(&mut tables, now, &mut work, &mut summary),
            ];
            for wait in waits.into_iter().flatten() {
                next = next.min(wait);
            }
            next
        };
        self.finish(work).await;

        let next = next.max(floor);
        debug!(
            "laundromat: expired {} clients, revoked {} delegations, dropped {} layout recalls, released {} owners; next pass in {:?}",
            summary.clients, summary.delegations, summary.layout_recalls, summary.owners, next
        );
        next
    }

    /// Start the laundromat task
    ///
    /// The first pass runs once the grace period has elapsed. The task stops
    /// on [`shutdown`](Self::shutdown) or when the last manager handle is
    /// dropped. Returns `None` if it is already running or there is no
    /// runtime.
    pub fn spawn_laundromat(&self) -> Option<JoinHandle<()>> {
        if self
            .inner
            .laundromat_running
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return None;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime, laundromat not started");
            self.inner
                .laundromat_running
                .store(false, std::sync::atomic::Ordering::SeqCst);
            return None;
        };

        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut delay = self.inner.config.read().grace_period;
        Some(runtime.spawn(async move {
            info!("laundromat started, first pass in {:?}", delay);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        info!("laundromat shutting down");
                        break;
                    }
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = StateManager { inner };
                delay = manager.laundromat_pass(Instant::now()).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NfsStatus;
    use crate::nfs4::state::{OpenArgs, OpenClaim, ShareAccess, ShareDeny};
    use crate::pnfs::{LayoutGetArgs, LayoutIoMode, LayoutRange, LayoutType, RecallScope};
    use crate::testing::{
        confirmed_v0, ctx_v0, ctx_v1, file, healthy_v0, manager, manager_in_grace, v41_client,
    };

    const LEASE: Duration = Duration::from_secs(90);

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_ends_grace() {
        let (mgr, _, _) = manager_in_grace();
        assert!(mgr.in_grace());
        let next = mgr.laundromat_pass(Instant::now()).await;
        assert!(!mgr.in_grace());
        assert_eq!(next, LEASE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_expires_after_one_lease() {
        let (mgr, _, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let start = Instant::now();

        tokio::time::advance(Duration::from_secs(60)).await;
        let next = mgr.laundromat_pass(Instant::now()).await;
        assert_eq!(next, Duration::from_secs(30));
        assert!(mgr.renew(client).is_ok());

        // renewal at +60s pushes expiry to +150s
        let next = mgr.laundromat_pass(start + Duration::from_secs(149)).await;
        assert_eq!(next, Duration::from_secs(10));
        assert_eq!(mgr.counters().confirmed_clients, 1);

        mgr.laundromat_pass(start + Duration::from_secs(150)).await;
        assert_eq!(mgr.counters().confirmed_clients, 0);
        assert_eq!(mgr.renew(client), Err(NfsStatus::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_client_expires() {
        let (mgr, _, _) = manager();
        let ctx = ctx_v0();
        mgr.establish_client(
            &ctx,
            b"c1",
            crate::nfs4::Verifier([1; 8]),
            crate::nfs4::callback::CallbackInfo::default(),
        )
        .await
        .unwrap();
        assert_eq!(mgr.counters().unconfirmed_clients, 1);

        mgr.laundromat_pass(Instant::now() + LEASE).await;
        assert_eq!(mgr.counters().unconfirmed_clients, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_owner_reaped_after_lease() {
        let (mgr, storage, _) = manager();
        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"c1").await;
        let fh = file(&storage, 1);

        let open = mgr
            .process_open(&ctx, OpenArgs::new(client, b"owner", 1, fh))
            .await
            .unwrap();
        let stateid = mgr.open_confirm(&ctx, open.stateid, 2).await.unwrap();
        let closed = mgr.close(&ctx, stateid, 3).await.unwrap();

        let half = Instant::now() + LEASE / 2;
        assert!(mgr.renew(client).is_ok());
        mgr.laundromat_pass(half).await;
        // the owner still answers a replayed CLOSE
        assert_eq!(mgr.close(&ctx, stateid, 3).await, Ok(closed));

        tokio::time::advance(LEASE).await;
        assert!(mgr.renew(client).is_ok());
        mgr.laundromat_pass(Instant::now()).await;
        assert_eq!(
            mgr.close(&ctx, stateid, 3).await,
            Err(NfsStatus::BadStateId)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreturned_delegation_revoked_after_exactly_one_lease() {
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

        mgr.mark_callback_broken(c1);
        let recalled_at = Instant::now();
        let writer = OpenArgs::new(c2, b"w", 1, fh).with_share(ShareAccess::WRITE, ShareDeny::NONE);
        assert_eq!(mgr.process_open(&ctx, writer).await, Err(NfsStatus::Delay));
        mgr.callbacks().drain().await;
        assert_eq!(transport.count("CB_RECALL"), 0);

        let just_before = recalled_at + LEASE - Duration::from_millis(1);
        tokio::time::advance(LEASE - Duration::from_millis(1)).await;
        // path down is reported, the lease is still renewed
        assert_eq!(mgr.renew(c1), Err(NfsStatus::CbPathDown));
        assert!(mgr.renew(c2).is_ok());
        mgr.laundromat_pass(just_before).await;
        assert_eq!(mgr.counters().delegations, 1);

        mgr.laundromat_pass(recalled_at + LEASE).await;
        assert_eq!(mgr.counters().delegations, 0);
        assert_eq!(mgr.counters().confirmed_clients, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_layout_recall_dropped_after_one_lease() {
        let (mgr, storage, transport) = manager();
        let mut ctx = ctx_v1();
        let (client, _) = v41_client(&mgr, &mut ctx, b"c1").await;
        let fh = file(&storage, 1);
        let open = mgr
            .process_open(
                &ctx,
                OpenArgs::new(client, b"owner", 0, fh.clone())
                    .with_share(ShareAccess::BOTH, ShareDeny::NONE)
                    .with_claim(OpenClaim::Fh),
            )
            .await
            .unwrap();
        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 100), open.stateid);
        let got = mgr.layout_get(&ctx, args).await.unwrap();

        let recalled_at = Instant::now();
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
        // the client answered the recall but never returns the layout
        assert_eq!(transport.count("CB_LAYOUTRECALL"), 1);
        assert_eq!(mgr.counters().layout_recalls, 1);

        tokio::time::advance(LEASE / 2).await;
        assert!(mgr.renew(client).is_ok());
        let next = mgr.laundromat_pass(recalled_at + LEASE / 2).await;
        assert_eq!(next, LEASE / 2);
        let args = LayoutGetArgs::new(fh.clone(), LayoutIoMode::Read, LayoutRange::new(0, 10), got.stateid);
        assert_eq!(mgr.layout_get(&ctx, args).await, Err(NfsStatus::RecallConflict));

        mgr.laundromat_pass(recalled_at + LEASE - Duration::from_millis(1)).await;
        assert_eq!(mgr.counters().layout_recalls, 1);

        mgr.laundromat_pass(recalled_at + LEASE).await;
        let counters = mgr.counters();
        assert_eq!(counters.layout_recalls, 0);
        assert_eq!(counters.layout_states, 0);
        assert_eq!(counters.confirmed_clients, 1);

        let args = LayoutGetArgs::new(fh, LayoutIoMode::Read, LayoutRange::new(0, 10), open.stateid);
        assert!(mgr.layout_get(&ctx, args).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_pass_clamped_to_floor() {
        let (mgr, _, _) = manager();
        let ctx = ctx_v0();
        confirmed_v0(&mgr, &ctx, b"c1").await;
        let next = mgr
            .laundromat_pass(Instant::now() + LEASE - Duration::from_secs(1))
            .await;
        assert_eq!(next, mgr.config().laundromat_min_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_and_stops() {
        let (mgr, _, _) = manager();
        let ctx = ctx_v0();
        confirmed_v0(&mgr, &ctx, b"c1").await;

        let handle = mgr.spawn_laundromat().unwrap();
        assert!(mgr.spawn_laundromat().is_none());

        tokio::time::sleep(LEASE * 2).await;
        assert_eq!(mgr.counters().confirmed_clients, 0);

        mgr.shutdown().await;
        handle.await.unwrap();
    }
}
