//! Per-COMPOUND request context
//!
//! The decode layer builds one [`CompoundContext`] per inbound COMPOUND and
//! threads it through every state operation of that request. SEQUENCE binds
//! the session and slot; later operations read the bound client from it.

use std::net::SocketAddr;

use super::client::Credentials;
use super::session::SessionId;
use super::{ClientKey, Nfs4FileHandle};
use crate::error::NfsStatus;

/// NFSv4 operation codes whose replies the owner replay cache may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Nfs4Op {
    /// CLOSE
    Close = 4,
    /// LOCK
    Lock = 12,
    /// LOCKU
    LockU = 14,
    /// OPEN
    Open = 18,
    /// OPEN_CONFIRM
    OpenConfirm = 20,
    /// OPEN_DOWNGRADE
    OpenDowngrade = 21,
}

impl TryFrom<u32> for Nfs4Op {
    type Error = NfsStatus;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(Self::Close),
            12 => Ok(Self::Lock),
            14 => Ok(Self::LockU),
            18 => Ok(Self::Open),
            20 => Ok(Self::OpenConfirm),
            21 => Ok(Self::OpenDowngrade),
            _ => Err(NfsStatus::OpIllegal),
        }
    }
}

/// Session and slot bound by SEQUENCE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBinding {
    /// Session
    pub session_id: SessionId,
    /// Slot in use by this request
    pub slot_id: u32,
    /// Client owning the session
    pub client: ClientKey,
}

/// COMPOUND execution context
#[derive(Debug, Clone)]
pub struct CompoundContext {
    /// Minor version of the COMPOUND
    pub minor_version: u32,
    /// Caller credentials from the RPC layer
    pub creds: Credentials,
    /// Peer address of the connection
    pub peer: SocketAddr,
    /// Current filehandle
    pub current_fh: Option<Nfs4FileHandle>,
    /// Saved filehandle
    pub saved_fh: Option<Nfs4FileHandle>,
    /// Session bound by SEQUENCE (minor version 1)
    pub session: Option<SessionBinding>,
}

impl CompoundContext {
    /// Create a new context
    pub fn new(minor_version: u32, creds: Credentials, peer: SocketAddr) -> Self {
        Self {
            minor_version,
            creds,
            peer,
            current_fh: None,
            saved_fh: None,
            session: None,
        }
    }

    /// Set the current filehandle
    pub fn with_fh(mut self, fh: Nfs4FileHandle) -> Self {
        self.current_fh = Some(fh);
        self
    }

    /// Whether the request runs under a session
    pub fn is_session(&self) -> bool {
        self.minor_version >= 1
    }

    /// Get current filehandle or return error
    pub fn require_current_fh(&self) -> Result<&Nfs4FileHandle, NfsStatus> {
        self.current_fh.as_ref().ok_or(NfsStatus::NoFileHandle)
    }

    /// Client bound by SEQUENCE
    pub fn session_client(&self) -> Option<ClientKey> {
        self.session.map(|binding| binding.client)
    }
}
