use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::{Response, StatusCode};

use crate::websocket::frame::FrameKind;
use crate::websocket::handshake;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Connection error: {0}")]
    ConnectionError(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

/// Failures scoped to a single connection. None of these outlive the
/// connection task that produced them.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Malformed handshake request: {0}")]
    MalformedHandshakeRequest(String),

    #[error("Unsupported handshake version: {0}")]
    UnsupportedHandshakeVersion(String),

    #[error("Unsupported frame type: {0}")]
    UnsupportedFrameType(FrameKind),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport fault: {0}")]
    TransportFault(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::TransportFault(err.to_string())
    }
}

impl From<tungstenite::Error> for ConnectionError {
    fn from(err: tungstenite::Error) -> Self {
        ConnectionError::TransportFault(err.to_string())
    }
}

impl ConnectionError {
    /// HTTP status sent back for failures that happen before the upgrade.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ConnectionError::MalformedHandshakeRequest(_) => Some(StatusCode::BAD_REQUEST),
            ConnectionError::UnsupportedHandshakeVersion(_) => Some(StatusCode::UPGRADE_REQUIRED),
            _ => None,
        }
    }

    /// Full response for pre-upgrade failures; frame-level failures close
    /// without writing anything.
    pub fn http_response(&self) -> Option<Response<String>> {
        match self {
            ConnectionError::UnsupportedHandshakeVersion(_) => {
                Some(handshake::unsupported_version_response())
            }
            _ => self.status_code().map(handshake::error_response),
        }
    }

    /// Rejections the peer caused, as opposed to faults on our side of the wire.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, ConnectionError::TransportFault(_))
    }
}
