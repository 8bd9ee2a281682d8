//! 错误类型
//!
//! 核心库统一使用 [`ShareError`]。HTTP 端点通过 `IntoResponse` 把错误映射为状态码，
//! 下载客户端把传输错误转换为任务状态迁移，而不是直接终止进程。

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;

/// 核心库错误
#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    /// 未知的共享 ID（用户可修正）
    #[error("Share entry not found: {0}")]
    NotFound(String),

    /// 缺少或错误的访问令牌
    #[error("Access token required")]
    Unauthorized,

    /// 路径越界
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// 超出速率限制（暂时性，客户端应退避）
    #[error("Too many requests from {0}")]
    TooManyRequests(String),

    #[error("Requested range not satisfiable (file size {size})")]
    RangeNotSatisfiable { size: u64 },

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 添加共享时超出大小限制
    #[error("Share limit exceeded: {0}")]
    ShareLimit(String),

    /// 本地磁盘错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 连接重置、超时、非 2xx 响应
    #[error("Transport error: {0}")]
    Transport(String),

    /// 任务被取消（与传输错误走同一条中断路径）
    #[error("Transfer cancelled")]
    Cancelled,

    /// 校验和不匹配，不可续传
    #[error("Integrity check failed for {path:?}: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// 监听端口绑定失败
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ShareError>;

impl ShareError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShareError::NotFound(_) => StatusCode::NOT_FOUND,
            ShareError::Unauthorized => StatusCode::UNAUTHORIZED,
            ShareError::Forbidden(_) => StatusCode::FORBIDDEN,
            ShareError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ShareError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ShareError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ShareError::ShareLimit(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ShareError::Io(_)
            | ShareError::Transport(_)
            | ShareError::Cancelled
            | ShareError::Integrity { .. }
            | ShareError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 是否属于可续传的中断（传输失败或取消）
    pub fn is_resumable(&self) -> bool {
        matches!(self, ShareError::Transport(_) | ShareError::Cancelled)
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        ShareError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ShareError {
    fn from(err: reqwest::Error) -> Self {
        ShareError::Transport(err.to_string())
    }
}

impl IntoResponse for ShareError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            ShareError::RangeNotSatisfiable { size } => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                "Requested Range Not Satisfiable",
            )
                .into_response(),
            ShareError::Unauthorized => (
                status,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                "Access token required",
            )
                .into_response(),
            // 内部错误不向远端暴露细节
            err if status == StatusCode::INTERNAL_SERVER_ERROR => {
                log::error!("Request failed: {}", err);
                (status, "Internal server error").into_response()
            }
            err => (status, err.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ShareError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ShareError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ShareError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ShareError::TooManyRequests("10.0.0.2".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_resumable_kinds() {
        assert!(ShareError::Transport("reset".into()).is_resumable());
        assert!(ShareError::Cancelled.is_resumable());
        let integrity = ShareError::Integrity {
            path: PathBuf::from("a"),
            expected: "00".into(),
            actual: "11".into(),
        };
        assert!(!integrity.is_resumable());
    }

    #[test]
    fn test_unauthorized_challenges_bearer() {
        let response = ShareError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );

        let response = ShareError::Forbidden("outside share".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}
