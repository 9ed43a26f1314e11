use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::identifier::Identifier;

/// Umbrella error returned by every public operation of the engine.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// A plain timeout: the caller may send the same command again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Protocol(ProtocolError::TimedOut { .. }))
    }

    /// The session is unusable and has to be torn down and reopened.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            DriverError::Transport(_) | DriverError::Protocol(ProtocolError::RetriesExceeded { .. })
        )
    }
}

impl From<io::Error> for DriverError {
    fn from(e: io::Error) -> Self {
        DriverError::Transport(TransportError::Io(e))
    }
}

impl From<serialport::Error> for DriverError {
    fn from(e: serialport::Error) -> Self {
        DriverError::Transport(TransportError::Serial(e))
    }
}

/// Failures of the hardware link. All of them are terminal for the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("hardware rejected frame: {0}")]
    HardwareRejected(String),
    #[error("receive overrun, receiver stopped")]
    Overrun,
    #[error("receive loop is no longer running")]
    ReceiverStopped,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("invalid CAN interface: {0}")]
    InvalidInterface(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no acknowledgement for {identifier} within {timeout:?}")]
    TimedOut {
        identifier: Identifier,
        timeout: Duration,
    },
    #[error("{identifier} failed after {attempts} attempts")]
    RetriesExceeded {
        identifier: Identifier,
        attempts: u32,
    },
    #[error("unknown data set layout code {0}")]
    UnknownDataSetLayout(u8),
    #[error("payload mismatch: expected {expected:02X?}, got {actual:02X?}")]
    PayloadMismatch { expected: Vec<u8>, actual: Vec<u8> },
    #[error("{identifier} has identical sender and receiver and can never be acknowledged")]
    Unroutable { identifier: Identifier },
    #[error("payload of {0} bytes does not fit in a CAN frame")]
    PayloadTooLong(usize),
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("node answered {identifier} with an error acknowledgement {payload:02X?}")]
    Rejected {
        identifier: Identifier,
        payload: Vec<u8>,
    },
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn some_id() -> Identifier {
        Identifier::request(0x04, 0x01, 0, 1)
    }

    #[test]
    fn timeout_is_retryable_but_keeps_session() {
        let err = DriverError::from(ProtocolError::TimedOut {
            identifier: some_id(),
            timeout: Duration::from_millis(20),
        });
        assert!(err.is_retryable());
        assert!(!err.requires_reconnect());
    }

    #[test]
    fn exhausted_retries_require_reconnect() {
        let err = DriverError::from(ProtocolError::RetriesExceeded {
            identifier: some_id(),
            attempts: 3,
        });
        assert!(!err.is_retryable());
        assert!(err.requires_reconnect());
    }

    #[test]
    fn transport_failures_require_reconnect() {
        let err = DriverError::from(TransportError::Overrun);
        assert!(err.requires_reconnect());
        let err = DriverError::from(io::Error::other("gone"));
        assert!(err.requires_reconnect());
    }

    #[test]
    fn configuration_errors_are_neither() {
        let err = DriverError::Config("timeout below floor".into());
        assert!(!err.is_retryable());
        assert!(!err.requires_reconnect());
    }
}
