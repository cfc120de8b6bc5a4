//! Shared data-model types exchanged between the turn engine, the exec
//! handler, and the safety classifier. Analogous to the teacher's
//! `protocol.rs`, trimmed to the shapes this engine actually needs.

use std::time::Duration;

use codex_apply_patch::Patch;
use serde::Deserialize;
use serde::Serialize;

/// Role of a message-shaped conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    System,
    Assistant,
}

/// One part of a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    ImageReference { reference: String },
    FileReference { reference: String },
    Refusal { reason: String },
}

/// One `{optional headline, text}` pair within a reasoning summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub headline: Option<String>,
    pub text: String,
}

/// A single conversation item, per § Data Model.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationItem {
    Message {
        role: Role,
        content: Vec<ContentItem>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
        exit_code: Option<i32>,
        duration: Option<Duration>,
    },
    ReasoningSummary {
        parts: Vec<ReasoningPart>,
        duration: Option<Duration>,
    },
}

impl ConversationItem {
    /// The call-id this item answers or introduces, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ConversationItem::FunctionCall { call_id, .. }
            | ConversationItem::FunctionCallOutput { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// The three-level approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Only read-only commands auto-approve.
    #[default]
    Suggest,
    /// Read-only commands and patches confined to writable roots auto-approve.
    AutoEdit,
    /// Everything auto-approves, but commands and writes must run sandboxed.
    FullAuto,
}

/// Outcome of the safety classifier.
#[derive(Debug, Clone)]
pub enum SafetyAssessment {
    AutoApprove {
        reason: String,
        group: String,
        run_in_sandbox: bool,
        patch: Option<Patch>,
    },
    AskUser {
        patch: Option<Patch>,
    },
    Reject {
        reason: String,
    },
}

/// The caller's answer to `get_command_confirmation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Approve this one invocation.
    Approved,
    /// Approve this and all future occurrences of the same command group
    /// for the remainder of the session.
    ApprovedForSession,
    /// Ask the engine to explain the command, then ask again.
    Explain,
    /// Deny, optionally with a message surfaced to the model as the
    /// function-call output.
    Denied { message: Option<String> },
    /// Deny and terminate the run entirely (no further tool calls attempted).
    Abort,
}
