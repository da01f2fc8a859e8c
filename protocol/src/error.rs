use std::io;
use thiserror::Error;

/// Everything that can go wrong on a connection. All variants except [CourierError::Shutdown]
///  are handled by dropping the connection and reconnecting.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection closed by peer")]
    Eof,
    #[error("shutdown requested")]
    Shutdown,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("event serialization failed: {0}")]
    Serialization(String),
}

pub type CourierResult<T> = Result<T, CourierError>;

impl CourierError {
    pub fn protocol(msg: impl Into<String>) -> CourierError {
        CourierError::Protocol(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CourierError::Shutdown)
    }

    /// Maps errors from `read_exact` and friends: a stream that ends prematurely is reported as
    ///  [CourierError::Eof] rather than as a generic I/O failure
    pub fn from_read_error(e: io::Error) -> CourierError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CourierError::Eof
        }
        else {
            CourierError::Io(e)
        }
    }
}

impl From<rustls::Error> for CourierError {
    fn from(value: rustls::Error) -> Self {
        CourierError::Tls(value.to_string())
    }
}
