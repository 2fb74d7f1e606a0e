use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Crate-wide error kind, covering every failure mode called out for the
/// transfer/session/registry core.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("transfer already active for this key")]
    AlreadyActive,

    #[error("timed out waiting for DCC ACCEPT")]
    ResumeTimeout,

    #[error("peer closed connection before full transfer")]
    ShortRead,

    #[error("content type not in allowed_mimetypes: {0}")]
    DisallowedMimeType(String),

    #[error("advertised size exceeds max_file_size")]
    FileSizeExceeded,

    #[error("md5 mismatch: advertised {advertised} computed {computed}")]
    ChecksumMismatch { advertised: String, computed: String },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Machine-readable kind name, used as the `error` field in HTTP
    /// responses and as a match target for callers.
    pub fn kind(&self) -> &'static str {
        match self {
            BotError::ConfigInvalid(_) => "ConfigInvalid",
            BotError::NetworkUnavailable(_) => "NetworkUnavailable",
            BotError::ProtocolViolation(_) => "ProtocolViolation",
            BotError::AuthFailed(_) => "AuthFailed",
            BotError::AlreadyActive => "AlreadyActive",
            BotError::ResumeTimeout => "ResumeTimeout",
            BotError::ShortRead => "ShortRead",
            BotError::DisallowedMimeType(_) => "DisallowedMimeType",
            BotError::FileSizeExceeded => "FileSizeExceeded",
            BotError::ChecksumMismatch { .. } => "ChecksumMismatch",
            BotError::Cancelled => "Cancelled",
            BotError::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            BotError::ConfigInvalid(_)
            | BotError::ProtocolViolation(_)
            | BotError::DisallowedMimeType(_)
            | BotError::FileSizeExceeded => StatusCode::BAD_REQUEST,
            BotError::AlreadyActive | BotError::Cancelled => StatusCode::CONFLICT,
            BotError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            BotError::NetworkUnavailable(_) => StatusCode::BAD_GATEWAY,
            BotError::ResumeTimeout => StatusCode::GATEWAY_TIMEOUT,
            BotError::ShortRead | BotError::ChecksumMismatch { .. } | BotError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl IntoResponse for BotError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(BotError::AlreadyActive.kind(), "AlreadyActive");
        assert_eq!(
            BotError::ChecksumMismatch {
                advertised: "a".into(),
                computed: "b".into()
            }
            .kind(),
            "ChecksumMismatch"
        );
    }

    #[test]
    fn status_codes_match_design() {
        assert_eq!(BotError::AlreadyActive.status(), StatusCode::CONFLICT);
        assert_eq!(
            BotError::ConfigInvalid("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BotError::ResumeTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
