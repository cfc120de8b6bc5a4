//! Request/response shapes shared between the turn engine and the model
//! client: the outgoing `Prompt`, the streamed `ResponseEvent`s the client
//! decodes off the wire, and the `shell` tool definition registered with
//! the model. Modeled on the teacher's `client_common.rs`, trimmed to the
//! single streamed-turns protocol this engine speaks.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::protocol::ConversationItem;

/// Internal preamble prepended to every prompt: names the shell tool, the
/// patch envelope syntax, and the three approval-policy levels in prose.
/// Caller-supplied instructions are appended after this, never replacing it.
const BASE_INSTRUCTIONS: &str = "\
You are a terminal-based coding assistant. You can run shell commands with \
the `shell` tool and edit files by returning a patch in the following \
envelope, which the host applies atomically:

*** Begin Patch
*** Add File: path/to/new
+line1
*** Update File: path/to/existing
@@ optional context anchor
 unchanged
-removed
+inserted
*** Delete File: path/to/gone
*** End Patch

Every command you request is checked against an approval policy before it \
runs: `suggest` only runs read-only commands without asking; `auto-edit` \
additionally applies file patches confined to the session's writable \
roots; `full-auto` runs everything but always inside a sandbox. Commands \
outside these rules are confirmed with the user before they run.";

pub const SHELL_TOOL_NAME: &str = "shell";
/// Accepted on input for compatibility with callers using the older name.
pub const SHELL_TOOL_ALIAS: &str = "container.exec";

/// Builds the `shell` tool definition registered with the model, per the
/// wire shape in the external-interfaces section.
pub fn shell_tool_definition() -> Value {
    serde_json::json!({
        "type": "function",
        "name": SHELL_TOOL_NAME,
        "description": "Runs a shell command, and returns its output.",
        "strict": false,
        "parameters": {
            "type": "object",
            "properties": {
                "command": {
                    "type": "array",
                    "items": { "type": "string" }
                },
                "workdir": { "type": ["string", "null"] },
                "timeout": { "type": ["number", "null"] }
            },
            "required": ["command"],
            "additionalProperties": false
        }
    })
}

/// One outstanding turn's request payload.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub input: Vec<ConversationItem>,
    /// Caller-supplied instructions, appended to the fixed preamble.
    pub instructions: Option<String>,
    pub previous_response_id: Option<String>,
}

impl Prompt {
    /// The fixed preamble concatenated with the caller-supplied
    /// instructions, mirroring the teacher's `get_full_instructions`.
    pub fn get_full_instructions(&self) -> String {
        match &self.instructions {
            Some(extra) if !extra.is_empty() => format!("{BASE_INSTRUCTIONS}\n\n{extra}"),
            _ => BASE_INSTRUCTIONS.to_string(),
        }
    }
}

/// Events decoded off the streamed-turns SSE transport.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    OutputItemDone { item: ConversationItem },
    Completed {
        response_id: String,
        output: Vec<ConversationItem>,
    },
}

/// Request body POSTed to the streamed-turns endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct ResponsesApiRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) instructions: &'a str,
    pub(crate) input: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) previous_response_id: Option<&'a str>,
    pub(crate) stream: bool,
    pub(crate) parallel_tool_calls: bool,
    pub(crate) tools: Vec<Value>,
}

pub struct ResponseStream {
    pub(crate) rx_event: mpsc::Receiver<Result<ResponseEvent, EngineError>>,
}

impl Stream for ResponseStream {
    type Item = Result<ResponseEvent, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_instructions_appends_caller_text() {
        let prompt = Prompt {
            instructions: Some("Project uses tabs, not spaces.".to_string()),
            ..Default::default()
        };
        let full = prompt.get_full_instructions();
        assert!(full.starts_with(BASE_INSTRUCTIONS));
        assert!(full.contains("Project uses tabs"));
    }

    #[test]
    fn full_instructions_without_caller_text_is_just_preamble() {
        let prompt = Prompt::default();
        assert_eq!(prompt.get_full_instructions(), BASE_INSTRUCTIONS);
    }

    #[test]
    fn shell_tool_definition_has_required_shape() {
        let def = shell_tool_definition();
        assert_eq!(def["name"], SHELL_TOOL_NAME);
        assert_eq!(def["strict"], false);
        assert_eq!(def["parameters"]["required"][0], "command");
    }
}
