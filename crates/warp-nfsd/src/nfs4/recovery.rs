//! Stable-storage client records
//!
//! A record is kept for every confirmed client so that after a restart the
//! server knows which clients may reclaim during the grace period. One file
//! per client, named by the BLAKE3 digest of the client name and holding the
//! name itself.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, trace};

use crate::error::{NfsError, NfsResult};

/// Where client records live
#[async_trait]
pub trait ClientRecovery: Send + Sync {
    /// Names of every client recorded before the restart
    async fn load(&self) -> NfsResult<HashSet<Vec<u8>>>;

    /// Record a confirmed client
    async fn create(&self, name: &[u8]) -> NfsResult<()>;

    /// Forget a client
    async fn remove(&self, name: &[u8]) -> NfsResult<()>;
}

/// Client records stored as files in a directory
#[derive(Debug, Clone)]
pub struct DirRecovery {
    dir: PathBuf,
}

impl DirRecovery {
    /// Use `dir`, creating it if needed
    pub async fn new(dir: impl Into<PathBuf>) -> NfsResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &[u8]) -> PathBuf {
        self.dir.join(hex::encode(blake3::hash(name).as_bytes()))
    }
}

#[async_trait]
impl ClientRecovery for DirRecovery {
    async fn load(&self) -> NfsResult<HashSet<Vec<u8>>> {
        let mut names = HashSet::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = fs::read(&path).await?;
            // files not written by us are skipped
            if path.file_name().map(|f| f.to_string_lossy().into_owned())
                != Some(hex::encode(blake3::hash(&name).as_bytes()))
            {
                trace!("skipping stray record {}", path.display());
                continue;
            }
            names.insert(name);
        }
        debug!("loaded {} client records from {}", names.len(), self.dir.display());
        Ok(names)
    }

    async fn create(&self, name: &[u8]) -> NfsResult<()> {
        let path = self.record_path(name);
        fs::write(&path, name)
            .await
            .map_err(|e| NfsError::Recovery(format!("{}: {}", path.display(), e)))
    }

    async fn remove(&self, name: &[u8]) -> NfsResult<()> {
        let path = self.record_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NfsError::Recovery(format!("{}: {}", path.display(), e))),
        }
    }
}
