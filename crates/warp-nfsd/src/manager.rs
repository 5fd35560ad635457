//! State manager
//!
//! [`StateManager`] is the handle the COMPOUND dispatcher holds. It owns the
//! single lock over every state table, the storage and callback
//! collaborators, the stable-storage client records, and the background
//! laundromat. Cloning it is cheap; every clone refers to the same state.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::NfsStateConfig;
use crate::error::NfsResult;
use crate::nfs4::callback::{CallbackManager, CallbackTransport};
use crate::nfs4::recovery::{ClientRecovery, DirRecovery};
use crate::nfs4::tables::{DeferredWork, StateTables};
use crate::storage::StorageBackend;

/// Snapshot of state table sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounters {
    /// Confirmed clients
    pub confirmed_clients: usize,
    /// Clients awaiting confirmation
    pub unconfirmed_clients: usize,
    /// Open stateids
    pub open_stateids: usize,
    /// Lock stateids
    pub lock_stateids: usize,
    /// Outstanding delegations
    pub delegations: usize,
    /// Layout stateids
    pub layout_states: usize,
    /// Layout segments across all layout stateids
    pub layout_segments: usize,
    /// Layout recalls not yet satisfied
    pub layout_recalls: usize,
    /// Sessions
    pub sessions: usize,
    /// Files with server state
    pub files: usize,
}

pub(crate) struct Inner {
    pub config: RwLock<NfsStateConfig>,
    pub tables: Mutex<StateTables>,
    pub storage: Arc<dyn StorageBackend>,
    pub callbacks: CallbackManager,
    pub recovery: RwLock<Option<Arc<dyn ClientRecovery>>>,
    pub shutdown: broadcast::Sender<()>,
    pub laundromat_running: AtomicBool,
}

/// NFSv4 server state
#[derive(Clone)]
pub struct StateManager {
    pub(crate) inner: Arc<Inner>,
}

fn boot_epoch() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
        .max(1)
}

impl StateManager {
    /// Create the state core
    ///
    /// The grace period starts immediately when one is configured. No client
    /// may reclaim until records are loaded with
    /// [`attach_recovery`](Self::attach_recovery).
    pub fn new(
        config: NfsStateConfig,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn CallbackTransport>,
    ) -> NfsResult<Self> {
        config.validate()?;
        let boot = boot_epoch();
        let mut tables = StateTables::new(boot, config.lease_time, !config.grace_period.is_zero());
        tables.delegations_enabled = config.delegations_enabled;
        tables.max_delegations = config.max_delegations;
        tables.pnfs_enabled = config.pnfs_enabled;
        tables.max_session_slots = config.max_session_slots;

        let (shutdown, _) = broadcast::channel(1);
        let manager = Self {
            inner: Arc::new(Inner {
                callbacks: CallbackManager::new(transport, &config),
                config: RwLock::new(config),
                tables: Mutex::new(tables),
                storage,
                recovery: RwLock::new(None),
                shutdown,
                laundromat_running: AtomicBool::new(false),
            }),
        };
        manager.inner.storage.attach_lease_breaker(manager.lease_breaker());
        info!("NFSv4 state core started, boot epoch {:08x}", boot);
        Ok(manager)
    }

    /// Create the state core, load client records from the configured
    /// recovery directory and start the laundromat
    pub async fn start(
        config: NfsStateConfig,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn CallbackTransport>,
    ) -> NfsResult<Self> {
        let recovery_dir = config.recovery_dir.clone();
        let manager = Self::new(config, storage, transport)?;
        if let Some(dir) = recovery_dir {
            let records = DirRecovery::new(dir).await?;
            manager.attach_recovery(Arc::new(records)).await?;
        }
        manager.spawn_laundromat();
        Ok(manager)
    }

    /// Use `recovery` for client records and, during grace, load the names
    /// allowed to reclaim
    ///
    /// Returns how many clients may reclaim.
    pub async fn attach_recovery(&self, recovery: Arc<dyn ClientRecovery>) -> NfsResult<usize> {
        let names = recovery.load().await?;
        let count = {
            let mut tables = self.inner.tables.lock();
            if tables.grace {
                tables.reclaimable = names;
            }
            tables.reclaimable.len()
        };
        *self.inner.recovery.write() = Some(recovery);
        info!("{} clients may reclaim state", count);
        Ok(count)
    }

    // =========================================================================
    // Administrative surface
    // =========================================================================

    /// Current configuration
    pub fn config(&self) -> NfsStateConfig {
        self.inner.config.read().clone()
    }

    /// Callback subsystem
    pub fn callbacks(&self) -> &CallbackManager {
        &self.inner.callbacks
    }

    /// Boot epoch stamped into every client id and stateid
    pub fn boot(&self) -> u32 {
        self.inner.tables.lock().boot
    }

    /// Lease time
    pub fn lease_time(&self) -> Duration {
        self.inner.tables.lock().lease
    }

    /// Change the lease time; applies to every later renewal check
    pub fn set_lease_time(&self, lease: Duration) {
        if lease.is_zero() {
            warn!("ignoring zero lease time");
            return;
        }
        self.inner.tables.lock().lease = lease;
        self.inner.config.write().lease_time = lease;
        info!("lease time set to {:?}", lease);
    }

    /// Recovery directory
    pub fn recovery_dir(&self) -> Option<PathBuf> {
        self.inner.config.read().recovery_dir.clone()
    }

    /// Switch to client records in `dir`
    pub async fn set_recovery_dir(&self, dir: PathBuf) -> NfsResult<()> {
        let records = DirRecovery::new(dir.clone()).await?;
        self.attach_recovery(Arc::new(records)).await?;
        self.inner.config.write().recovery_dir = Some(dir);
        Ok(())
    }

    /// Whether the server is in its grace period
    pub fn in_grace(&self) -> bool {
        self.inner.tables.lock().grace
    }

    /// End the grace period now
    pub fn end_grace(&self) {
        let mut tables = self.inner.tables.lock();
        if tables.grace {
            tables.grace = false;
            tables.reclaimable.clear();
            info!("grace period ended");
        }
    }

    /// State table sizes
    pub fn counters(&self) -> StateCounters {
        self.inner.tables.lock().counters()
    }

    /// Stop the laundromat and wait for callbacks in flight
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        self.inner.callbacks.drain().await;
        info!("NFSv4 state core stopped");
    }

    // =========================================================================
    // Deferred work
    // =========================================================================

    /// Start work collected under the lock that needs no waiting
    pub(crate) fn dispatch(&self, work: DeferredWork) {
        let storage = &self.inner.storage;
        for fd in work.closes {
            storage.close(fd);
        }
        for (fh, released) in work.layout_returns {
            storage.layout_return(&fh, released.layout_type, released.iomode, released.range);
        }
        for client in work.channels_dropped {
            self.inner.callbacks.forget(client);
        }
        for job in work.probes {
            self.spawn_probe(job);
        }
        for job in work.recalls {
            self.spawn_delegation_recall(job);
        }
        for job in work.layout_recalls {
            self.spawn_layout_recall(job);
        }
        for job in work.device_notifies {
            self.spawn_device_notify(job);
        }
    }

    /// Run work collected under the lock, including stable-storage writes and
    /// session drains
    pub(crate) async fn finish(&self, mut work: DeferredWork) {
        if work.is_empty() {
            return;
        }
        let removed = std::mem::take(&mut work.records_removed);
        let created = std::mem::take(&mut work.records_created);
        let drains = std::mem::take(&mut work.session_drains);

        let recovery = self.inner.recovery.read().clone();
        if let Some(recovery) = recovery {
            for name in &removed {
                if let Err(e) = recovery.remove(name).await {
                    warn!("failed to remove client record: {}", e);
                }
            }
            for name in &created {
                if let Err(e) = recovery.create(name).await {
                    warn!("failed to write client record: {}", e);
                }
            }
        }

        self.dispatch(work);
        for drain in drains {
            debug!("waiting for session {} to drain", hex::encode(drain.id));
            drain.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs4::callback::InMemoryCallbackTransport;
    use crate::storage::MemoryStorage;
    use crate::testing::{confirmed_v0, ctx_v0, manager};

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = NfsStateConfig::new().with_lease_time(Duration::ZERO);
        let result = StateManager::new(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(InMemoryCallbackTransport::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_admin_surface() {
        let (mgr, _, _) = manager();
        assert!(!mgr.in_grace());
        assert_eq!(mgr.lease_time(), Duration::from_secs(90));

        mgr.set_lease_time(Duration::from_secs(30));
        assert_eq!(mgr.lease_time(), Duration::from_secs(30));
        assert_eq!(mgr.config().lease_time, Duration::from_secs(30));

        mgr.set_lease_time(Duration::ZERO);
        assert_eq!(mgr.lease_time(), Duration::from_secs(30));
        assert_eq!(mgr.counters(), StateCounters::default());
    }

    #[tokio::test]
    async fn test_confirmation_and_expiry_maintain_records() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (mgr, _, _) = manager();
        mgr.set_recovery_dir(temp_dir.path().to_path_buf()).await.unwrap();
        assert_eq!(mgr.recovery_dir().as_deref(), Some(temp_dir.path()));

        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"client-a").await;
        let records = DirRecovery::new(temp_dir.path()).await.unwrap();
        assert!(records.load().await.unwrap().contains(&b"client-a".to_vec()));

        mgr.expire_client(client).await;
        assert!(records.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_allowed_for_recorded_client() {
        let temp_dir = tempfile::tempdir().unwrap();
        let records = DirRecovery::new(temp_dir.path()).await.unwrap();
        records.create(b"client-a").await.unwrap();

        let config = NfsStateConfig::new()
            .with_grace_period(Duration::from_secs(90))
            .with_recovery_dir(temp_dir.path().to_path_buf());
        let storage = Arc::new(MemoryStorage::new());
        let mgr = StateManager::start(
            config,
            storage.clone(),
            Arc::new(InMemoryCallbackTransport::new()),
        )
        .await
        .unwrap();
        assert!(mgr.in_grace());

        let ctx = ctx_v0();
        let client = confirmed_v0(&mgr, &ctx, b"client-a").await;
        let fh = crate::testing::file(&storage, 1);
        let args = crate::nfs4::state::OpenArgs::new(client, b"owner", 1, fh).with_claim(
            crate::nfs4::state::OpenClaim::Previous(crate::nfs4::delegation::DelegationType::None),
        );
        assert!(mgr.process_open(&ctx, args).await.is_ok());

        mgr.end_grace();
        assert!(!mgr.in_grace());
        mgr.shutdown().await;
    }
}
