//! Client error types.

use satellite_protocol::message::SatErrorCode;
use satellite_protocol::ProtocolError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Stable error codes for [`SatelliteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SatelliteErrorCode {
    AuthError,
    Timeout,
    ReplicationAlreadyStarted,
    ReplicationNotStarted,
    UnexpectedState,
    UnexpectedMessageType,
    ProtocolViolation,
    UnknownDataType,
    InvalidColumnValue,
    InvalidOplog,
    ServerError,
    NotConnected,
    ConnectionClosed,
    IoError,
    TlsError,
}

impl fmt::Display for SatelliteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            SatelliteErrorCode::AuthError => "AUTH_ERROR",
            SatelliteErrorCode::Timeout => "TIMEOUT",
            SatelliteErrorCode::ReplicationAlreadyStarted => "REPLICATION_ALREADY_STARTED",
            SatelliteErrorCode::ReplicationNotStarted => "REPLICATION_NOT_STARTED",
            SatelliteErrorCode::UnexpectedState => "UNEXPECTED_STATE",
            SatelliteErrorCode::UnexpectedMessageType => "UNEXPECTED_MESSAGE_TYPE",
            SatelliteErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            SatelliteErrorCode::UnknownDataType => "UNKNOWN_DATA_TYPE",
            SatelliteErrorCode::InvalidColumnValue => "INVALID_COLUMN_VALUE",
            SatelliteErrorCode::InvalidOplog => "INVALID_OPLOG",
            SatelliteErrorCode::ServerError => "SERVER_ERROR",
            SatelliteErrorCode::NotConnected => "NOT_CONNECTED",
            SatelliteErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            SatelliteErrorCode::IoError => "IO_ERROR",
            SatelliteErrorCode::TlsError => "TLS_ERROR",
        };
        f.write_str(code)
    }
}

/// Satellite client errors.
#[derive(Debug, Clone, Error)]
pub enum SatelliteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("timed out waiting for response to {0}")]
    Timeout(&'static str),

    #[error("replication already started")]
    ReplicationAlreadyStarted,

    #[error("replication not started: {0}")]
    ReplicationNotStarted(String),

    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    #[error("unexpected message type: {0}")]
    UnexpectedMessageType(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown data type: {0}")]
    UnknownDataType(String),

    #[error("invalid value for column '{column}': {reason}")]
    InvalidColumnValue { column: String, reason: String },

    #[error("invalid oplog entry {rowid}: {reason}")]
    InvalidOplog { rowid: i64, reason: String },

    #[error("server replied with error code: {0}")]
    Server(SatErrorCode),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl SatelliteError {
    /// Returns the stable error code.
    pub fn code(&self) -> SatelliteErrorCode {
        match self {
            SatelliteError::Auth(_) => SatelliteErrorCode::AuthError,
            SatelliteError::Timeout(_) => SatelliteErrorCode::Timeout,
            SatelliteError::ReplicationAlreadyStarted => {
                SatelliteErrorCode::ReplicationAlreadyStarted
            }
            SatelliteError::ReplicationNotStarted(_) => SatelliteErrorCode::ReplicationNotStarted,
            SatelliteError::UnexpectedState(_) => SatelliteErrorCode::UnexpectedState,
            SatelliteError::UnexpectedMessageType(_) => SatelliteErrorCode::UnexpectedMessageType,
            SatelliteError::ProtocolViolation(_) => SatelliteErrorCode::ProtocolViolation,
            SatelliteError::UnknownDataType(_) => SatelliteErrorCode::UnknownDataType,
            SatelliteError::InvalidColumnValue { .. } => SatelliteErrorCode::InvalidColumnValue,
            SatelliteError::InvalidOplog { .. } => SatelliteErrorCode::InvalidOplog,
            SatelliteError::Server(_) => SatelliteErrorCode::ServerError,
            SatelliteError::NotConnected => SatelliteErrorCode::NotConnected,
            SatelliteError::ConnectionClosed => SatelliteErrorCode::ConnectionClosed,
            SatelliteError::Io(_) => SatelliteErrorCode::IoError,
            SatelliteError::Tls(_) => SatelliteErrorCode::TlsError,
        }
    }

    /// Returns whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SatelliteError::Io(_)
                | SatelliteError::Timeout(_)
                | SatelliteError::ConnectionClosed
                | SatelliteError::NotConnected
        )
    }
}

impl From<std::io::Error> for SatelliteError {
    fn from(err: std::io::Error) -> Self {
        SatelliteError::Io(Arc::new(err))
    }
}

impl From<ProtocolError> for SatelliteError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownMessageType(code) => {
                SatelliteError::UnexpectedMessageType(format!("unknown type code {}", code))
            }
            other => SatelliteError::ProtocolViolation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SatelliteError::ReplicationAlreadyStarted.code(),
            SatelliteErrorCode::ReplicationAlreadyStarted
        );
        assert_eq!(
            SatelliteError::Timeout("SatAuthReq").code(),
            SatelliteErrorCode::Timeout
        );
        assert_eq!(
            SatelliteError::Server(SatErrorCode::AuthFailed).code(),
            SatelliteErrorCode::ServerError
        );
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(SatelliteErrorCode::AuthError.to_string(), "AUTH_ERROR");
        assert_eq!(SatelliteErrorCode::Timeout.to_string(), "TIMEOUT");
        assert_eq!(
            SatelliteErrorCode::ReplicationAlreadyStarted.to_string(),
            "REPLICATION_ALREADY_STARTED"
        );
        assert_eq!(
            SatelliteErrorCode::ReplicationNotStarted.to_string(),
            "REPLICATION_NOT_STARTED"
        );
        assert_eq!(
            SatelliteErrorCode::UnexpectedState.to_string(),
            "UNEXPECTED_STATE"
        );
        assert_eq!(
            SatelliteErrorCode::UnexpectedMessageType.to_string(),
            "UNEXPECTED_MESSAGE_TYPE"
        );
        assert_eq!(
            SatelliteErrorCode::ProtocolViolation.to_string(),
            "PROTOCOL_VIOLATION"
        );
        assert_eq!(
            SatelliteErrorCode::UnknownDataType.to_string(),
            "UNKNOWN_DATA_TYPE"
        );
    }

    #[test]
    fn test_unknown_type_code_maps_to_unexpected_message() {
        let err: SatelliteError = ProtocolError::UnknownMessageType(99).into();
        assert_eq!(err.code(), SatelliteErrorCode::UnexpectedMessageType);
        assert!(err.to_string().contains("99"));

        let err: SatelliteError = ProtocolError::EmptyMessage.into();
        assert_eq!(err.code(), SatelliteErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_retryable() {
        assert!(SatelliteError::Timeout("SatAuthReq").is_retryable());
        assert!(SatelliteError::ConnectionClosed.is_retryable());
        assert!(SatelliteError::from(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused
        ))
        .is_retryable());
        assert!(!SatelliteError::ReplicationAlreadyStarted.is_retryable());
        assert!(!SatelliteError::ProtocolViolation("x".into()).is_retryable());
    }
}
