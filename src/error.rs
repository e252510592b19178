//! # Error Types
//!
//! `AppError` is the one error type that crosses from the store, hub,
//! reconciler and flow engine up into the HTTP layer. Each variant maps to
//! the `{code,msg}` envelope from the spec's §7: business errors always
//! answer with HTTP 200 and `code=1`; only protocol-level failures
//! (missing/invalid auth, malformed bodies hitting the agent endpoints)
//! use a real 4xx/5xx status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("agent unreachable")]
    AgentUnreachable,

    #[error("agent timeout")]
    AgentTimeout,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Localised, user-visible message placed in the `msg` field.
    fn message(&self) -> String {
        match self {
            AppError::NotFound(what) => format!("{what}不存在"),
            AppError::Unauthorized => "未登录".to_string(),
            AppError::Forbidden => "权限不足".to_string(),
            AppError::Invalid(msg) => msg.clone(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::AgentUnreachable => "节点离线".to_string(),
            AppError::AgentTimeout => "节点响应超时".to_string(),
            AppError::Store(err) => {
                tracing::error!(error = %err, "store error");
                "服务内部错误".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                "服务内部错误".to_string()
            }
        }
    }

    /// True when this error is a protocol-level failure (bad/missing
    /// auth credentials on an agent endpoint) rather than a business
    /// error surfaced through the `{code,msg}` envelope.
    fn is_protocol_level(&self) -> bool {
        matches!(self, AppError::Unauthorized | AppError::Forbidden)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.is_protocol_level() {
            match self {
                AppError::Unauthorized => StatusCode::UNAUTHORIZED,
                AppError::Forbidden => StatusCode::FORBIDDEN,
                _ => unreachable!(),
            }
        } else {
            StatusCode::OK
        };

        let body = json!({ "code": 1, "msg": self.message() });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Maps a store lookup failure to [`AppError::NotFound`] when the row was
/// simply missing, or [`AppError::Store`] for any other database error.
pub fn lookup_error(err: sqlx::Error, what: &str) -> AppError {
    match err {
        sqlx::Error::RowNotFound => AppError::NotFound(what.to_string()),
        other => AppError::Store(other),
    }
}
