use crate::backend::BackendError;
use crate::tools::ToolError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

/// The frontend only reads `detail`; `code` is there for logs and curl users.
#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.message,
            code: self.code,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures of a single chat turn, before they are mapped onto HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("upstream stream error: {0}")]
    UpstreamStream(String),
    #[error(transparent)]
    ToolInvocation(#[from] ToolError),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation_error",
            ChatError::BackendUnavailable(_) => "backend_unavailable",
            ChatError::UpstreamStream(_) => "upstream_stream_error",
            ChatError::ToolInvocation(_) => "tool_invocation_error",
        }
    }
}

impl From<BackendError> for ChatError {
    fn from(err: BackendError) -> Self {
        ChatError::BackendUnavailable(err.to_string())
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let status = match err {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.code(), err.to_string())
    }
}
