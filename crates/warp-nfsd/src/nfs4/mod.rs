//! NFSv4.0/4.1 server state
//!
//! Identifiers shared by every state component, plus the component modules
//! themselves. All mutable state lives in one table set behind the
//! single lock owned by [`crate::StateManager`].

pub mod callback;
pub mod client;
pub mod compound;
pub mod delegation;
pub mod laundromat;
pub mod lock;
pub mod recovery;
pub mod session;
pub mod state;
pub(crate) mod tables;

use bytes::Bytes;

/// Highest NFSv4 minor version with state semantics implemented here
pub const NFS4_MAX_MINOR_VERSION: u32 = 1;

/// Owner field of delegation stateids
pub const DELEGATION_OWNER: u32 = 0;

/// Owner field of layout stateids
pub const LAYOUT_OWNER: u32 = u32::MAX;

/// NFSv4 file handle (opaque, max 128 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nfs4FileHandle(pub Bytes);

impl Nfs4FileHandle {
    /// Create a new filehandle from bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Server-assigned client identity: (boot epoch, monotonic id)
///
/// On the wire this is the 64-bit `clientid4`, boot epoch in the high word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    /// Server boot epoch the id was issued in
    pub boot: u32,
    /// Id unique within the boot epoch
    pub id: u32,
}

impl ClientKey {
    /// Create a client key
    pub fn new(boot: u32, id: u32) -> Self {
        Self { boot, id }
    }

    /// Wire form
    pub fn to_u64(&self) -> u64 {
        (u64::from(self.boot) << 32) | u64::from(self.id)
    }

    /// Parse the wire form
    pub fn from_u64(value: u64) -> Self {
        Self {
            boot: (value >> 32) as u32,
            id: value as u32,
        }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}/{:08x}", self.boot, self.id)
    }
}

/// 8-byte verifier (client boot verifier or confirm token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Verifier(pub [u8; 8]);

impl Verifier {
    /// Build from a counter value
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

/// Decoded `other` field of a server-issued stateid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateIdOther {
    /// Boot epoch
    pub boot: u32,
    /// Owner id; [`DELEGATION_OWNER`] or [`LAYOUT_OWNER`] for those kinds
    pub owner: u32,
    /// File id for open/lock stateids, object id for the other kinds
    pub file: u32,
}

impl StateIdOther {
    /// Create from parts
    pub fn new(boot: u32, owner: u32, file: u32) -> Self {
        Self { boot, owner, file }
    }

    /// Encode into the 12 opaque bytes of a stateid
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut other = [0u8; 12];
        other[..4].copy_from_slice(&self.boot.to_be_bytes());
        other[4..8].copy_from_slice(&self.owner.to_be_bytes());
        other[8..].copy_from_slice(&self.file.to_be_bytes());
        other
    }

    /// Decode the 12 opaque bytes of a stateid
    pub fn from_bytes(other: &[u8; 12]) -> Self {
        let word = |i: usize| u32::from_be_bytes([other[i], other[i + 1], other[i + 2], other[i + 3]]);
        Self {
            boot: word(0),
            owner: word(4),
            file: word(8),
        }
    }

    /// Whether this identifies a delegation
    pub fn is_delegation(&self) -> bool {
        self.owner == DELEGATION_OWNER
    }

    /// Whether this identifies a layout state
    pub fn is_layout(&self) -> bool {
        self.owner == LAYOUT_OWNER
    }
}

/// NFSv4 stateid (identifies state at server)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// Generation; bumped on every mutation of the state it names
    pub seqid: u32,
    /// Other (12 bytes, opaque to the client)
    pub other: [u8; 12],
}

impl StateId {
    /// Anonymous stateid (all zeros)
    pub const ANONYMOUS: Self = Self {
        seqid: 0,
        other: [0; 12],
    };

    /// Read bypass stateid (all ones)
    pub const READ_BYPASS: Self = Self {
        seqid: 0xFFFFFFFF,
        other: [0xFF; 12],
    };

    /// Create a new stateid
    pub fn new(seqid: u32, other: [u8; 12]) -> Self {
        Self { seqid, other }
    }

    /// Build from a generation and decoded identity
    pub fn from_parts(seqid: u32, other: StateIdOther) -> Self {
        Self {
            seqid,
            other: other.to_bytes(),
        }
    }

    /// Decoded identity
    pub fn identity(&self) -> StateIdOther {
        StateIdOther::from_bytes(&self.other)
    }

    /// Check if this is the anonymous stateid
    pub fn is_anonymous(&self) -> bool {
        self.seqid == 0 && self.other == [0; 12]
    }

    /// Check if this is the read bypass stateid
    pub fn is_read_bypass(&self) -> bool {
        self.seqid == 0xFFFFFFFF && self.other == [0xFF; 12]
    }

    /// All-zero or all-one `other` field
    pub fn is_special(&self) -> bool {
        self.other == [0; 12] || self.other == [0xFF; 12]
    }
}
