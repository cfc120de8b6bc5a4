//! Typed error taxonomy for the engine.
//!
//! `EngineError` distinguishes every outcome that needs a distinct
//! user-visible message (see [`get_error_message_ui`]) from outcomes that
//! are purely internal (`Io`, `Json`). Sandbox- and patch-specific failures
//! nest their own error types so each subsystem can be tested in isolation.

use std::time::Duration;

use thiserror::Error;

use codex_apply_patch::PatchError;

/// Failure modes specific to the sandboxed/unsandboxed executor.
#[derive(Debug, Error)]
pub enum SandboxErr {
    #[error("command exited with status {exit_code} under sandbox")]
    Denied {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("command timed out")]
    Timeout,

    #[error("command terminated by signal {0}")]
    Signal(i32),

    #[error("failed to install Landlock/seccomp restrictions: {0}")]
    LandlockInstall(String),

    #[error("no Linux sandbox is available on this platform")]
    LandlockUnavailable,
}

/// Top-level error type returned by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited {
        retry_after: Option<Duration>,
        status: u16,
        code: Option<String>,
        kind: Option<String>,
        message: Option<String>,
    },

    #[error("context window exceeded")]
    ContextWindowExceeded { model_context_window: Option<u64> },

    #[error("request rejected (status {status}): {message}")]
    ClientRejected {
        status: u16,
        request_id: Option<String>,
        message: String,
    },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("stream closed prematurely")]
    StreamClosed,

    #[error(transparent)]
    Sandbox(#[from] SandboxErr),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Renders the exact user-visible system message for an [`EngineError`], per
/// the dedicated-message table in the error-handling design.
pub fn get_error_message_ui(err: &EngineError) -> String {
    match err {
        EngineError::Transient(detail) => {
            format!("Connection error after multiple attempts; giving up. Details: {detail}")
        }
        EngineError::RateLimited {
            status,
            code,
            kind,
            message,
            ..
        } => {
            let detail = message
                .as_deref()
                .or(kind.as_deref())
                .or(code.as_deref())
                .unwrap_or("retries exhausted");
            format!("Rate limit reached. Error details: status={status}, code={code:?}, type={kind:?}, message={detail}")
        }
        EngineError::ContextWindowExceeded {
            model_context_window,
        } => match model_context_window {
            Some(tokens) => format!(
                "This conversation is too long for the current model's context window \
                 ({tokens} tokens). Try `/clear` or switch to a model with a larger \
                 context window."
            ),
            None => "This conversation is too long for the current model's context \
                     window. Try `/clear` or switch to a model with a larger context \
                     window."
                .to_string(),
        },
        EngineError::ClientRejected {
            status,
            request_id,
            message,
        } => {
            let rid = request_id
                .as_deref()
                .map(|r| format!(" (request id: {r})"))
                .unwrap_or_default();
            format!("Request rejected by the model provider (status {status}){rid}: {message}")
        }
        EngineError::ModelNotFound(model) => {
            format!("Model '{model}' was not found.")
        }
        EngineError::StreamClosed => {
            "The response stream closed unexpectedly before completion.".to_string()
        }
        EngineError::Sandbox(inner) => format!("sandbox error: {inner}"),
        EngineError::Patch(inner) => format!("patch error: {inner}"),
        EngineError::Io(inner) => format!("I/O error: {inner}"),
        EngineError::Json(inner) => format!("malformed JSON: {inner}"),
    }
}
