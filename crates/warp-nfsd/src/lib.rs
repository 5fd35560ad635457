//! NFSv4.0/4.1 server state core for WARP
//!
//! This crate holds the stateful half of an NFSv4 server: the registry of
//! clients, sessions, opens, byte-range locks, delegations and pNFS layouts,
//! and the callback path used to recall delegations and layouts from
//! clients. XDR decoding, the RPC transport and file data live elsewhere;
//! the COMPOUND dispatcher calls into a [`StateManager`] with decoded
//! arguments and encodes whatever comes back.
//!
//! # Features
//!
//! - SETCLIENTID / EXCHANGE_ID client identity with lease renewal and expiry
//! - NFSv4.1 sessions with slot-based exactly-once semantics
//! - OPEN / LOCK state with per-owner sequence-id replay
//! - Read and write delegations recalled over CB_RECALL
//! - pNFS layouts with merge, trim, recall and device notification
//! - Grace-period reclaim backed by stable-storage client records
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  COMPOUND dispatcher │
//! └──────────┬───────────┘
//!            │ decoded args
//! ┌──────────▼───────────┐      CB_* calls      ┌────────────┐
//! │     StateManager     ├─────────────────────►│ NFS client │
//! │  - client registry   │                      └────────────┘
//! │  - sessions          │
//! │  - open/lock state   │
//! │  - delegations       │
//! │  - pNFS layouts      │
//! │  - laundromat        │
//! └──────────┬───────────┘
//!            │ StorageBackend
//! ┌──────────▼───────────┐
//! │   storage backend    │
//! └──────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod manager;
pub mod nfs4;
pub mod pnfs;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use config::NfsStateConfig;
pub use error::{NfsError, NfsResult, NfsStatus, StatusResult};
pub use manager::{StateCounters, StateManager};
pub use nfs4::callback::{CallbackTransport, InMemoryCallbackTransport};
pub use nfs4::compound::CompoundContext;
pub use nfs4::recovery::{ClientRecovery, DirRecovery};
pub use nfs4::{ClientKey, Nfs4FileHandle, StateId, Verifier};
pub use storage::{MemoryStorage, StorageBackend};
