//! NFS state configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NfsError, NfsResult};

/// Configuration for the NFSv4 state core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsStateConfig {
    /// Lease time (how long a client may go unheard before its state is reclaimed)
    pub lease_time: Duration,
    /// Grace period after startup during which only reclaims are accepted
    pub grace_period: Duration,
    /// Upper bound on the slot table of a session
    pub max_session_slots: u32,
    /// Enable delegations
    pub delegations_enabled: bool,
    /// Soft cap on outstanding delegations
    pub max_delegations: usize,
    /// Enable pNFS layouts
    pub pnfs_enabled: bool,
    /// Extra attempts made by a callback after a transient failure
    pub callback_retries: u32,
    /// Pause between callback attempts
    pub callback_retry_delay: Duration,
    /// Budget for a single callback RPC
    pub callback_timeout: Duration,
    /// Maximum callback tasks in flight at once
    pub max_callback_tasks: usize,
    /// Shortest interval the laundromat sleeps between passes
    pub laundromat_min_interval: Duration,
    /// Directory holding client records used for reclaim after restart
    pub recovery_dir: Option<PathBuf>,
}

impl Default for NfsStateConfig {
    fn default() -> Self {
        Self {
            lease_time: Duration::from_secs(90),
            grace_period: Duration::from_secs(90),
            max_session_slots: 64,
            delegations_enabled: true,
            max_delegations: 4096,
            pnfs_enabled: true,
            callback_retries: 2,
            callback_retry_delay: Duration::from_secs(2),
            callback_timeout: Duration::from_secs(10),
            max_callback_tasks: 64,
            laundromat_min_interval: Duration::from_secs(10),
            recovery_dir: None,
        }
    }
}

impl NfsStateConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document, filling absent keys with defaults
    pub fn from_toml_str(content: &str) -> NfsResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the state core cannot run with
    pub fn validate(&self) -> NfsResult<()> {
        if self.lease_time.is_zero() {
            return Err(NfsError::Config("lease_time must be non-zero".to_string()));
        }
        if self.max_session_slots == 0 {
            return Err(NfsError::Config(
                "max_session_slots must be at least 1".to_string(),
            ));
        }
        if self.max_callback_tasks == 0 {
            return Err(NfsError::Config(
                "max_callback_tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set lease time
    pub fn with_lease_time(mut self, lease: Duration) -> Self {
        self.lease_time = lease;
        self
    }

    /// Set grace period
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the slot clamp for new sessions
    pub fn with_max_session_slots(mut self, slots: u32) -> Self {
        self.max_session_slots = slots;
        self
    }

    /// Set the delegation soft cap
    pub fn with_max_delegations(mut self, max: usize) -> Self {
        self.max_delegations = max;
        self
    }

    /// Set callback retry budget
    pub fn with_callback_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.callback_retries = retries;
        self.callback_retry_delay = delay;
        self
    }

    /// Set the per-call callback timeout
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Set recovery directory
    pub fn with_recovery_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recovery_dir = Some(dir.into());
        self
    }

    /// Disable pNFS
    pub fn disable_pnfs(mut self) -> Self {
        self.pnfs_enabled = false;
        self
    }

    /// Disable delegations
    pub fn disable_delegations(mut self) -> Self {
        self.delegations_enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NfsStateConfig::new()
            .with_lease_time(Duration::from_secs(30))
            .with_max_session_slots(8)
            .disable_pnfs();

        assert_eq!(config.lease_time, Duration::from_secs(30));
        assert_eq!(config.max_session_slots, 8);
        assert!(!config.pnfs_enabled);
        assert!(config.delegations_enabled);
    }

    #[test]
    fn test_config_from_toml() {
        let config = NfsStateConfig::from_toml_str(
            r#"
            max_delegations = 16
            pnfs_enabled = false
            recovery_dir = "/var/lib/nfs/v4recovery"

            [lease_time]
            secs = 45
            nanos = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.max_delegations, 16);
        assert_eq!(config.lease_time, Duration::from_secs(45));
        assert!(!config.pnfs_enabled);
        assert_eq!(
            config.recovery_dir.as_deref(),
            Some(std::path::Path::new("/var/lib/nfs/v4recovery"))
        );
        assert_eq!(config.grace_period, Duration::from_secs(90));
    }

    #[test]
    fn test_config_rejects_zero_slots() {
        let err = NfsStateConfig::from_toml_str("max_session_slots = 0").unwrap_err();
        assert!(matches!(err, NfsError::Config(_)));
    }
}
