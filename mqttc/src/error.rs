//! Error types for mqttc.

use std::io;

use crate::protocol::ConnectReturnCode;

/// Result type for mqttc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mqttc operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error without a more specific category.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Broker hostname could not be resolved.
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// Transport connection refused.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Broker closed the stream.
    #[error("broker disconnected")]
    BrokerDisconnected,

    /// Broker rejected the credentials (return code 4 or 5).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Broker does not speak protocol level 4.
    #[error("protocol level not supported by broker")]
    ProtocolNotSupported,

    /// Broker refused the connection for another reason.
    #[error("connection refused by broker: {0}")]
    Refused(ConnectReturnCode),

    /// Transport reset by peer.
    #[error("connection reset")]
    ConnectionReset,

    /// Packet does not fit in the decode buffer.
    #[error("buffer overflow: packet of {size} bytes exceeds limit of {limit}")]
    BufferOverflow { size: usize, limit: usize },

    /// Unexpected packet or unmatched acknowledgement.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Bytes that can never decode.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Not enough bytes buffered yet.
    #[error("incomplete packet: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Invalid argument or configuration.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Broker rejected a subscription (SUBACK 0x80).
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// Operation requires an open connection.
    #[error("not connected")]
    NotConnected,

    /// Handle was already released.
    #[error("already disconnected")]
    AlreadyDisconnected,

    /// Awaited acknowledgement was discarded by reconnect or teardown.
    #[error("session reset before acknowledgement")]
    SessionReset,
}

impl Error {
    /// Returns true for the "keep buffering" signal of the decoder.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete { .. })
    }

    /// Maps a transport error onto the error taxonomy.
    pub(crate) fn transport(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(err.to_string()),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            io::ErrorKind::UnexpectedEof => Error::BrokerDisconnected,
            _ => Error::Io(err),
        }
    }
}

impl From<ConnectReturnCode> for Error {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::UnacceptableProtocolVersion => Error::ProtocolNotSupported,
            ConnectReturnCode::BadUsernamePassword | ConnectReturnCode::NotAuthorized => {
                Error::AuthenticationFailed
            }
            code => Error::Refused(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mapping() {
        let err = Error::transport(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(err, Error::ConnectionRefused(_)));

        let err = Error::transport(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, Error::ConnectionReset));

        let err = Error::transport(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, Error::BrokerDisconnected));

        let err = Error::transport(io::Error::other("boom"));
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_return_code_mapping() {
        assert!(matches!(
            Error::from(ConnectReturnCode::UnacceptableProtocolVersion),
            Error::ProtocolNotSupported
        ));
        assert!(matches!(
            Error::from(ConnectReturnCode::NotAuthorized),
            Error::AuthenticationFailed
        ));
        assert!(matches!(
            Error::from(ConnectReturnCode::ServerUnavailable),
            Error::Refused(ConnectReturnCode::ServerUnavailable)
        ));
    }

    #[test]
    fn test_is_incomplete() {
        assert!(Error::Incomplete { needed: 2 }.is_incomplete());
        assert!(!Error::OutOfMemory.is_incomplete());
    }
}
