use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;

/// Startup configuration problems. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable missing: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("working directory does not exist: {}", .0.display())]
    WorkdirMissing(PathBuf),
}

/// Failure to run the deploy action at all (as opposed to it exiting nonzero).
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for deploy process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Everything that turns a webhook delivery into a non-2xx response.
///
/// Only the status and a short text body reach the sender; details go to
/// the operational log.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("deploy already in progress")]
    Busy,

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("request body not received in time")]
    ReadTimeout,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl HookError {
    pub fn status(&self) -> StatusCode {
        match self {
            HookError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HookError::Busy => StatusCode::CONFLICT,
            HookError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            HookError::ReadTimeout => StatusCode::REQUEST_TIMEOUT,
            HookError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for HookError {
    fn into_response(self) -> Response {
        let body = match &self {
            // Never tell the sender which part of the signature check failed.
            HookError::Unauthorized(_) => "invalid signature".to_string(),
            other => other.to_string(),
        };
        (self.status(), body).into_response()
    }
}
