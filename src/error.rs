use std::sync::Arc;
use std::time::Duration;

use crate::command::BrokerError;

/// Failures surfaced by the transport stack. The variants follow the failure classes the stack
///  distinguishes: connectivity failures (retried by failover only), broker-reported errors,
///  resource exhaustion, caller misuse and timeouts.
///
/// The type is `Clone` because a single connection failure completes many pending requests.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("wire format error: {0}")]
    WireFormat(String),
    #[error("transport is closed")]
    Closed,
    #[error("transport was disposed")]
    Disposed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("channel was inactive for {elapsed:?} (remote: {remote})")]
    Inactivity { elapsed: Duration, remote: String },
    #[error("broker error: {}", .0.message)]
    Broker(BrokerError),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("giving up after {attempts} reconnect attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
    #[error("no broker addresses to connect to")]
    NoCandidates,
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Connectivity-class failures are the only ones that justify a reconnect. Everything else
    ///  is reported to the caller as is.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(self,
            TransportError::Io(_)
            | TransportError::WireFormat(_)
            | TransportError::Closed
            | TransportError::Inactivity { .. }
            | TransportError::ConnectionFailed(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    pub fn invalid_operation(msg: impl Into<String>) -> TransportError {
        TransportError::InvalidOperation(msg.into())
    }

    pub fn wire_format(e: anyhow::Error) -> TransportError {
        TransportError::WireFormat(format!("{:#}", e))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        TransportError::Io(Arc::new(value))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
