//! Crate-wide error type and the [`retryable`](Error::is_retryable) classification
//! the retry engine (`crate::retry`) drives off of.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a [`TransportError`], used by the retry engine to
/// decide whether another attempt is worth making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportErrorKind {
    /// A one-off glitch (e.g. a dropped byte on the wire). Worth retrying.
    Transient,
    /// The operation ran out of time. Worth retrying with backoff.
    Timeout,
    /// The transport itself is gone (port unplugged, handle closed). Not worth retrying.
    Permanent,
}

/// An error raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Error)]
#[error("{op} on {port} failed: {cause}")]
pub struct TransportError {
    pub op: &'static str,
    pub port: String,
    pub kind: TransportErrorKind,
    #[source]
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl TransportError {
    pub fn new(
        op: &'static str,
        port: impl Into<String>,
        kind: TransportErrorKind,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            op,
            port: port.into(),
            kind,
            cause: Box::new(cause),
        }
    }

    /// A handful of cause strings are known to indicate a transient comms glitch
    /// even when the transport reports them as an opaque "permanent" failure —
    /// clone hardware in particular likes to surface these as generic I/O errors.
    fn cause_is_sentinel_transient(&self) -> bool {
        const SENTINELS: &[&str] = &[
            "read failed",
            "write failed",
            "no-ack",
            "no ack",
            "frame corrupted",
            "checksum mismatch",
            "communication failure",
        ];
        let msg = self.cause.to_string().to_lowercase();
        SENTINELS.iter().any(|s| msg.contains(s))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Transient | TransportErrorKind::Timeout
        ) || self.cause_is_sentinel_transient()
    }
}

/// The single error type returned by every fallible public function in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no tag detected")]
    NoTagDetected,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("frame corrupted: {0}")]
    FrameCorrupted(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("data too large: {0}")]
    DataTooLarge(String),

    #[error("controller did not ACK within the ACK window")]
    NoAck,

    #[error("controller error 0x{code:02X}")]
    ControllerError { code: u8 },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("sector {sector} not authenticated")]
    NotAuthenticated { sector: i32 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Mirrors [`TransportError::is_retryable`] at the crate-error level, so the
    /// retry engine can be handed a `Result<T, Error>` directly.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(t) => t.is_retryable(),
            Error::Timeout(_) | Error::NoAck | Error::FrameCorrupted(_) | Error::ChecksumMismatch(_) => true,
            _ => false,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>) -> Self {
        Error::Timeout(what.into())
    }
}
