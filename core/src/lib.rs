//! The agent turn engine: a bidirectional loop that drives a streaming
//! request/response exchange with a tool-enabled language model, classifies
//! proposed shell commands and file patches under a three-level approval
//! policy, executes approved work under a sandbox abstraction with strict
//! cancellation, and preserves the model's function-call contract across
//! user interruptions.
//!
//! This crate is deliberately not a CLI or a UI: callers drive it through
//! [`turn::TurnEngine`] and the [`observer::TurnObserver`] port.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod bash;
pub mod client;
pub mod client_common;
pub mod config;
pub mod error;
pub mod exec;
pub mod exec_handler;
pub mod flags;
pub mod is_safe_command;
#[cfg(target_os = "linux")]
pub mod landlock;
pub(crate) mod openai_model_info;
pub mod observer;
pub mod protocol;
pub mod safety;
pub mod turn;
pub mod util;

pub use config::Config;
pub use config::ConfigOverrides;
pub use config::ConfigToml;
pub use error::EngineError;
pub use observer::TurnObserver;
pub use protocol::ApprovalPolicy;
pub use protocol::ConversationItem;
pub use turn::TurnEngine;
