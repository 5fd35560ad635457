//! NFS state error types

use thiserror::Error;

/// Infrastructure errors raised outside the protocol status path
#[derive(Debug, Error)]
pub enum NfsError {
    /// NFS protocol error
    #[error("NFS error: {0}")]
    Protocol(NfsStatus),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Stable-storage client records
    #[error("recovery store error: {0}")]
    Recovery(String),

    /// Callback transport failure
    #[error("callback error: {0}")]
    Callback(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NfsStatus> for NfsError {
    fn from(status: NfsStatus) -> Self {
        Self::Protocol(status)
    }
}

/// NFSv4 status codes (RFC 7530, RFC 8881)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NfsStatus {
    /// Success
    Ok = 0,
    /// Permission denied
    Perm = 1,
    /// No such file or directory
    Noent = 2,
    /// I/O error
    Io = 5,
    /// Access denied
    Access = 13,
    /// Invalid argument
    Inval = 22,
    /// Stale file handle
    Stale = 70,
    /// Bad file handle
    BadHandle = 10001,
    /// Not supported
    NotSupp = 10004,
    /// Server fault
    ServerFault = 10006,
    /// Retry later
    Delay = 10008,
    /// Lock range conflict
    Denied = 10010,
    /// Lease expired
    Expired = 10011,
    /// I/O blocked by a lock
    Locked = 10012,
    /// Grace period in effect
    Grace = 10013,
    /// Share reservation conflict
    ShareDenied = 10015,
    /// Client id in use by a different principal
    ClientIdInUse = 10017,
    /// Server resources exhausted
    ResourceExhausted = 10018,
    /// No filehandle
    NoFileHandle = 10020,
    /// Client id from a previous server instance
    StaleClientId = 10022,
    /// Stateid from a previous server instance
    StaleStateId = 10023,
    /// Stateid generation superseded
    OldStateId = 10024,
    /// Bad stateid
    BadStateId = 10025,
    /// Bad sequence id
    BadSeqId = 10026,
    /// Lock range not supported
    LockRange = 10028,
    /// Reclaim outside the grace period
    NoGrace = 10033,
    /// Reclaim does not match recorded state
    ReclaimBad = 10034,
    /// Owner still holds locks
    LocksHeld = 10037,
    /// Access mode of the open does not permit the operation
    OpenMode = 10038,
    /// Illegal operation
    OpIllegal = 10044,
    /// Deadlock detected
    Deadlock = 10045,
    /// Callback path is down
    CbPathDown = 10048,
    /// Bad session
    BadSession = 10052,
    /// Slot id out of range
    BadSlot = 10053,
    /// RECLAIM_COMPLETE already done
    CompleteAlready = 10054,
    /// Layout unavailable
    LayoutUnavailable = 10059,
    /// No matching layout
    NoMatchingLayout = 10060,
    /// Recall conflict
    RecallConflict = 10061,
    /// Unknown layout type
    UnknownLayoutType = 10062,
    /// Slot sequence id misordered
    SeqMisordered = 10063,
    /// Replay of a reply that was not cached
    RetryUncachedRep = 10068,
    /// Client id still has sessions
    ClientIdBusy = 10074,
}

impl NfsStatus {
    /// Whether an error still advances an owner's sequence id
    ///
    /// RFC 7530 section 9.1.7 lists the errors that leave the seqid alone.
    pub fn is_seqid_mutating(&self) -> bool {
        !matches!(
            self,
            NfsStatus::StaleClientId
                | NfsStatus::StaleStateId
                | NfsStatus::BadStateId
                | NfsStatus::BadSeqId
                | NfsStatus::ResourceExhausted
                | NfsStatus::NoFileHandle
        )
    }

    /// Numeric wire value
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl std::fmt::Display for NfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NfsStatus::Ok => "NFS4_OK",
            NfsStatus::Perm => "NFS4ERR_PERM",
            NfsStatus::Noent => "NFS4ERR_NOENT",
            NfsStatus::Io => "NFS4ERR_IO",
            NfsStatus::Access => "NFS4ERR_ACCESS",
            NfsStatus::Inval => "NFS4ERR_INVAL",
            NfsStatus::Stale => "NFS4ERR_STALE",
            NfsStatus::BadHandle => "NFS4ERR_BADHANDLE",
            NfsStatus::NotSupp => "NFS4ERR_NOTSUPP",
            NfsStatus::ServerFault => "NFS4ERR_SERVERFAULT",
            NfsStatus::Delay => "NFS4ERR_DELAY",
            NfsStatus::Denied => "NFS4ERR_DENIED",
            NfsStatus::Expired => "NFS4ERR_EXPIRED",
            NfsStatus::Locked => "NFS4ERR_LOCKED",
            NfsStatus::Grace => "NFS4ERR_GRACE",
            NfsStatus::ShareDenied => "NFS4ERR_SHARE_DENIED",
            NfsStatus::ClientIdInUse => "NFS4ERR_CLID_INUSE",
            NfsStatus::ResourceExhausted => "NFS4ERR_RESOURCE",
            NfsStatus::NoFileHandle => "NFS4ERR_NOFILEHANDLE",
            NfsStatus::StaleClientId => "NFS4ERR_STALE_CLIENTID",
            NfsStatus::StaleStateId => "NFS4ERR_STALE_STATEID",
            NfsStatus::OldStateId => "NFS4ERR_OLD_STATEID",
            NfsStatus::BadStateId => "NFS4ERR_BAD_STATEID",
            NfsStatus::BadSeqId => "NFS4ERR_BAD_SEQID",
            NfsStatus::LockRange => "NFS4ERR_LOCK_RANGE",
            NfsStatus::NoGrace => "NFS4ERR_NO_GRACE",
            NfsStatus::ReclaimBad => "NFS4ERR_RECLAIM_BAD",
            NfsStatus::LocksHeld => "NFS4ERR_LOCKS_HELD",
            NfsStatus::OpenMode => "NFS4ERR_OPENMODE",
            NfsStatus::OpIllegal => "NFS4ERR_OP_ILLEGAL",
            NfsStatus::Deadlock => "NFS4ERR_DEADLOCK",
            NfsStatus::CbPathDown => "NFS4ERR_CB_PATH_DOWN",
            NfsStatus::BadSession => "NFS4ERR_BADSESSION",
            NfsStatus::BadSlot => "NFS4ERR_BADSLOT",
            NfsStatus::CompleteAlready => "NFS4ERR_COMPLETE_ALREADY",
            NfsStatus::LayoutUnavailable => "NFS4ERR_LAYOUTUNAVAILABLE",
            NfsStatus::NoMatchingLayout => "NFS4ERR_NOMATCHING_LAYOUT",
            NfsStatus::RecallConflict => "NFS4ERR_RECALLCONFLICT",
            NfsStatus::UnknownLayoutType => "NFS4ERR_UNKNOWN_LAYOUTTYPE",
            NfsStatus::SeqMisordered => "NFS4ERR_SEQ_MISORDERED",
            NfsStatus::RetryUncachedRep => "NFS4ERR_RETRY_UNCACHED_REP",
            NfsStatus::ClientIdBusy => "NFS4ERR_CLIENTID_BUSY",
        };
        write!(f, "{}", name)
    }
}

/// Result type for infrastructure operations
pub type NfsResult<T> = Result<T, NfsError>;

/// Result type for protocol operations; the error is the wire status
pub type StatusResult<T> = Result<T, NfsStatus>;
