use thiserror::Error;

/// Errors surfaced to foreground callers.
///
/// Every variant carries a stable negative integer via [`Error::code`] —
/// the error-code vocabulary a host application can rely on not changing
/// between releases.
#[derive(Debug, Error)]
pub enum Error {
    #[error("null argument")]
    NullArgument,
    #[error("no device registered for this address")]
    MissingDevice,
    #[error("device is not connected")]
    Disconnected,
    #[error("device already registered")]
    Duplicate,
    #[error("allocation failed")]
    AllocationFailed,
    #[error("failed to initialize synchronization primitives")]
    SyncInitFailed,
    #[error("failed to spawn worker thread")]
    ThreadSpawnFailed,
    #[error("socket operation failed: {0}")]
    SocketFailed(std::io::Error),
    #[error("protocol handshake failed")]
    HandshakeFailed,
    #[error("select timed out")]
    SelectTimeout,
    #[error("short send/receive on a fixed-size packet")]
    ShortIo,
    #[error("channel index out of range or not active")]
    BadChannel,
    #[error("pointer outside the channel's buffer window")]
    BadPointer,
    #[error("requested size outside the channel's buffer window")]
    BadSize,
}

impl Error {
    /// The stable small-negative-integer vocabulary this crate guarantees
    /// not to change between releases.
    pub fn code(&self) -> i32 {
        match self {
            Error::NullArgument => -1,
            Error::MissingDevice => -2,
            Error::Disconnected => -3,
            Error::Duplicate => -4,
            Error::AllocationFailed => -5,
            Error::SyncInitFailed => -6,
            Error::ThreadSpawnFailed => -7,
            Error::SocketFailed(_) => -8,
            Error::HandshakeFailed => -9,
            Error::SelectTimeout => -10,
            Error::ShortIo => -11,
            Error::BadChannel => -12,
            Error::BadPointer => -13,
            Error::BadSize => -14,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::SocketFailed(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
