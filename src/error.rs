//! 统一错误处理
//!
//! - `CoreError`：核心操作（环境、任务、镜像源）的错误类型
//! - `ApiError`：HTTP 层错误，实现 `IntoResponse`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 存储不可用
///
/// 持久化层唯一的错误形式，原样向上传播
#[derive(Debug, Clone, Error)]
#[error("storage unavailable: {message}")]
pub struct StorageError {
    pub message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// 核心错误
///
/// 任务执行失败（进程启动失败、非零退出、超时）不走这里，
/// 而是记录在任务状态和日志中
#[derive(Debug, Error)]
pub enum CoreError {
    /// 输入无效（重名、未知版本、依赖格式错误）
    #[error("validation failed: {0}")]
    Validation(String),

    /// 冲突（环境已有活跃任务、删除激活中的镜像源）
    #[error("conflict: {0}")]
    Conflict(String),

    /// 资源不存在
    #[error("{0} not found")]
    NotFound(String),

    /// 删除环境目录失败（记录已回滚）
    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }
}

/// 核心操作结果
pub type CoreResult<T> = Result<T, CoreError>;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// 统一 API 错误类型
#[derive(Debug, Error)]
pub enum ApiError {
    /// 404 - 资源未找到
    #[error("{0} not found")]
    NotFound(String),
    /// 400 - 请求无效
    #[error("{0}")]
    BadRequest(String),
    /// 409 - 冲突（如：环境已有安装任务在运行）
    #[error("{0}")]
    Conflict(String),
    /// 500 - 内部错误
    #[error("{0}")]
    Internal(String),
    /// 503 - 服务不可用（存储层故障）
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "validation",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_) => "filesystem",
            ApiError::ServiceUnavailable(_) => "storage_unavailable",
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(m) => ApiError::BadRequest(m),
            CoreError::Conflict(m) => ApiError::Conflict(m),
            CoreError::NotFound(r) => ApiError::NotFound(r),
            CoreError::Filesystem(m) => ApiError::Internal(m),
            CoreError::Storage(e) => ApiError::ServiceUnavailable(e.message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
