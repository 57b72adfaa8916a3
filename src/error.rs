use crate::types::{ErrorType, StreamId};

/// Failures that never reach the wire.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalError {
    #[error("request cancelled")]
    Cancelled,
    #[error("transport closed before the HTTP/2 preface completed")]
    ClosedBeforePreface,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("an HTTP/1.1 upgrade is still unresolved on this connection")]
    UpgradeInProgress,
    #[error("peer declined the upgrade; this connection speaks HTTP/1.1 only")]
    NeverHttp2,
    #[error("malformed HTTP/1.1 message: {0}")]
    Http1(String),
    #[error("connection is shut down")]
    ConnectionClosed,
}

/// Protocol errors, split the way RFC 7540 splits them: a stream error
/// affects one exchange and is signaled with RST_STREAM, a connection error
/// is fatal to the whole session and is signaled with GOAWAY.
#[derive(thiserror::Error, Debug, Clone)]
pub enum H2Error {
    #[error("stream {id} error {code:?}: {reason}")]
    Stream {
        id: StreamId,
        code: ErrorType,
        reason: String,
    },
    #[error("connection error {code:?}: {reason}")]
    Connection { code: ErrorType, reason: String },
    #[error(transparent)]
    Local(#[from] LocalError),
}

impl H2Error {
    pub fn stream(id: StreamId, code: ErrorType, reason: impl Into<String>) -> Self {
        Self::Stream {
            id,
            code,
            reason: reason.into(),
        }
    }

    pub fn connection(code: ErrorType, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    /// Error code that goes on the wire for this error, if any.
    pub fn code(&self) -> Option<ErrorType> {
        match self {
            Self::Stream { code, .. } | Self::Connection { code, .. } => Some(*code),
            Self::Local(_) => None,
        }
    }

    /// True when the exchange may be replayed on another connection without
    /// risking duplicated side effects (REFUSED_STREAM, RFC 7540 §8.1.4).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stream {
                code: ErrorType::RefusedStream,
                ..
            }
        )
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
