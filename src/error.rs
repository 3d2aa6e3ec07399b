// src/error.rs

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;
use crate::transport::canonical::CanonicalError;
use crate::transport::signatures::SignatureError;
use crate::transport::timestamps::TimestampError;

/// 服务对外暴露的全部错误类别。
/// 每个变体对应响应体里的一个稳定 `error` 字符串，出价方依赖它定位配置问题
/// （密钥不对、时钟漂移、不在目标池里等）。
#[derive(Debug, Error)]
pub enum AuctionError {
    #[error("{0}")]
    SchemaInvalid(String),
    #[error("signature rejected: {0}")]
    SignatureInvalid(String),
    #[error("{0}")]
    TimestampOutOfRange(String),
    #[error("nonce rejected: {0}")]
    NonceDuplicate(String),
    #[error("unknown auction {0}")]
    UnknownAuction(String),
    #[error("auction window closed")]
    WindowClosed,
    #[error("bidder is not invited to this auction")]
    NotInvited,
    #[error("bidder already submitted a bid for this auction")]
    DuplicateBid,
    #[error("auction {0} already exists")]
    Conflict(String),
    #[error("ledger record is terminal: {0}")]
    TerminalState(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuctionError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuctionError::SchemaInvalid(_) => "schema_invalid",
            AuctionError::SignatureInvalid(_) => "signature_invalid",
            AuctionError::TimestampOutOfRange(_) => "timestamp_out_of_range",
            AuctionError::NonceDuplicate(_) => "nonce_duplicate",
            AuctionError::UnknownAuction(_) => "unknown_auction",
            AuctionError::WindowClosed => "window_closed",
            AuctionError::NotInvited => "not_invited",
            AuctionError::DuplicateBid => "duplicate_bid",
            AuctionError::Conflict(_) => "conflict",
            AuctionError::TerminalState(_) => "terminal_state",
            AuctionError::StorageUnavailable(_) => "storage_unavailable",
            AuctionError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuctionError::SchemaInvalid(_) => StatusCode::BAD_REQUEST,
            AuctionError::SignatureInvalid(_)
            | AuctionError::TimestampOutOfRange(_)
            | AuctionError::NonceDuplicate(_)
            | AuctionError::WindowClosed
            | AuctionError::NotInvited
            | AuctionError::DuplicateBid => StatusCode::UNAUTHORIZED,
            AuctionError::UnknownAuction(_) => StatusCode::NOT_FOUND,
            AuctionError::Conflict(_) | AuctionError::TerminalState(_) => StatusCode::CONFLICT,
            AuctionError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuctionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// 平台侧永远拿到结构化 JSON，而不是裸的传输层失败。
impl IntoResponse for AuctionError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind(),
            "detail": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StorageError> for AuctionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AuctionError::UnknownAuction(key),
            StorageError::AlreadyExists(key) => AuctionError::Conflict(key),
            other => AuctionError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<SignatureError> for AuctionError {
    fn from(err: SignatureError) -> Self {
        AuctionError::SignatureInvalid(err.to_string())
    }
}

impl From<TimestampError> for AuctionError {
    fn from(err: TimestampError) -> Self {
        match err {
            TimestampError::Skew { .. } => AuctionError::TimestampOutOfRange(err.to_string()),
            other => AuctionError::SchemaInvalid(other.to_string()),
        }
    }
}

impl From<CanonicalError> for AuctionError {
    fn from(err: CanonicalError) -> Self {
        AuctionError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_wire_strings() {
        assert_eq!(AuctionError::WindowClosed.kind(), "window_closed");
        assert_eq!(
            AuctionError::TimestampOutOfRange("skew".into()).kind(),
            "timestamp_out_of_range"
        );
        assert_eq!(AuctionError::Conflict("ctx_1".into()).kind(), "conflict");
    }

    #[test]
    fn transport_failures_map_to_unauthorized() {
        assert_eq!(AuctionError::WindowClosed.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuctionError::SignatureInvalid("bad".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuctionError::SchemaInvalid("missing".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AuctionError::UnknownAuction("ctx_9".into()).status(),
            StatusCode::NOT_FOUND
        );
    }
}
