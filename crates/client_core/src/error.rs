use shared::error::ErrorCode;
use thiserror::Error;

use crate::{auth::AuthError, call::CallError, transport::TransportError};
use capture::CaptureError;

/// Client-facing failure classes for the session layer. Component errors
/// fold into these at the `SessionClient` surface.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("connection lost with requests outstanding")]
    ConnectionLost,
    #[error("authorization failed: {0}")]
    AuthFailure(String),
    #[error("system audio capture unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("system audio capture permission denied: {0}")]
    CapturePermissionDenied(String),
    #[error("media room connection failed: {0}")]
    RoomConnectionFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { attempts } => ClientError::Timeout { attempts },
            TransportError::ConnectionLost => ClientError::ConnectionLost,
            TransportError::Api(api) => match api.code {
                ErrorCode::Unauthorized | ErrorCode::Forbidden => {
                    ClientError::AuthFailure(api.message)
                }
                _ => ClientError::Protocol(api.to_string()),
            },
            TransportError::Codec(err) => ClientError::Protocol(err.to_string()),
        }
    }
}

impl From<AuthError> for ClientError {
    fn from(err: AuthError) -> Self {
        ClientError::AuthFailure(err.to_string())
    }
}

impl From<CaptureError> for ClientError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied { .. } => {
                ClientError::CapturePermissionDenied(err.to_string())
            }
            CaptureError::NotAvailable { .. } | CaptureError::Unknown(_) => {
                ClientError::CaptureUnavailable(err.to_string())
            }
        }
    }
}

impl From<CallError> for ClientError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::TokenRequest(auth) => auth.into(),
            CallError::TokenExpired => ClientError::AuthFailure("call token is expired".into()),
            CallError::Connect(message) => ClientError::RoomConnectionFailed(message),
            CallError::ConnectTimeout(timeout) => ClientError::RoomConnectionFailed(format!(
                "media room connect timed out after {timeout:?}"
            )),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}
