//! Shared error taxonomy (§7 — Error Handling Design).
//!
//! `AppError` is the one enum callers at the HTTP boundary match on to pick
//! a status code and an envelope. Everything below that boundary propagates
//! `anyhow::Result`; stores and the executor wrap their failures into this
//! enum only at the edges (mostly in `http::routes`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Provider command missing from PATH — surfaced as 502.
    #[error("{0}")]
    ProviderUnavailable(String),

    /// Provider config on disk is unparseable or violates its schema — 500.
    #[error("{0}")]
    InvalidProviderConfig(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::InvalidProviderConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code for the error envelope. Only `AUTH_REQUIRED` is
    /// currently contractual (the client prompts for sign-in on seeing it);
    /// other codes are a convenience for log correlation.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            AppError::Authorization(msg) if msg == "AUTH_REQUIRED" => Some("AUTH_REQUIRED"),
            _ => None,
        }
    }
}

/// Errors specific to invoking a provider (C6 — ProviderAdapter).
///
/// Classified from the subprocess/gateway failure so the executor's retry
/// policy (§4.7) can dispatch on the concrete kind rather than pattern-match
/// strings at every call site.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("provider command not found on PATH: {0}")]
    CommandNotFound(String),

    /// Stale child `cwd` — stderr matched `uv_cwd` / `process.cwd failed.*EPERM`.
    #[error("provider working directory is stale: {0}")]
    UvCwdFailure(String),

    /// `stderr` matched `session file locked`, with an owning pid if found.
    #[error("session file locked by pid {owner_pid:?}: {message}")]
    SessionLockContention {
        owner_pid: Option<u32>,
        message: String,
        /// Parsed back-off hint, capped at 10s by the caller.
        retry_after: std::time::Duration,
    },

    #[error("invalid provider config: {0}")]
    InvalidConfig(String),

    /// The invocation's cancellation token was flipped — an HTTP client
    /// disconnected, or a caller otherwise gave up — and the subprocess was
    /// terminated rather than left to run to completion (§5). Terminal by
    /// design: never retried.
    #[error("cancelled")]
    Cancelled,

    #[error("provider invocation failed: {0}")]
    Other(String),
}

/// Errors specific to task mutation (C4 / C10).
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),
    #[error("Agents can only assign tasks to themselves or their reportees (direct or indirect).")]
    Unauthorized,
    #[error("task not found: {0}")]
    NotFound(String),
}

impl From<TaskError> for AppError {
    fn from(e: TaskError) -> Self {
        let message = e.to_string();
        match e {
            TaskError::Validation(m) => AppError::Validation(m),
            TaskError::Unauthorized => AppError::Authorization(message),
            TaskError::NotFound(id) => AppError::NotFound(format!("task not found: {id}")),
        }
    }
}
