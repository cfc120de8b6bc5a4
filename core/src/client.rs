//! Thin streamed-turns HTTP client: POSTs a [`Prompt`] to the configured
//! endpoint and decodes the SSE response into [`ResponseEvent`]s. Grounded
//! on the teacher's `client.rs`, stripped of Azure/ChatGPT-auth workarounds
//! and the multi-provider `ModelProviderInfo` indirection this engine has
//! no use for — a single API-key-authenticated endpoint is all §6 names.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::ResponseStream;
use crate::client_common::ResponsesApiRequest;
use crate::client_common::shell_tool_definition;
use crate::config::Config;
use crate::error::EngineError;
use crate::protocol::ConversationItem;
use crate::util::backoff;

const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_RETRIES: u64 = 5;

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

/// Matches the server's "try again in 1.3s" phrasing wherever it appears in
/// an error message, so the retry delay can honor an explicit hint.
fn parse_retry_after_hint(message: &str) -> Option<Duration> {
    let marker = "try again in ";
    let start = message.to_lowercase().find(marker)? + marker.len();
    let rest = &message[start..];
    let end = rest.find(['s', 'S'])?;
    rest[..end].trim().parse::<f64>().ok().map(Duration::from_secs_f64)
}

fn is_context_overflow(detail: &ErrorDetail) -> bool {
    detail.kind.as_deref() == Some("invalid_request_error")
        && detail
            .message
            .as_deref()
            .is_some_and(|m| m.to_lowercase().contains("max_tokens is too large"))
}

fn is_model_not_found(detail: &ErrorDetail) -> bool {
    detail.kind.as_deref() == Some("invalid_request_error")
        && detail.code.as_deref() == Some("model_not_found")
}

fn is_rate_limited(status: StatusCode, detail: Option<&ErrorDetail>) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || detail.is_some_and(|d| d.code.as_deref() == Some("rate_limit_exceeded"))
}

#[derive(Debug, Clone)]
pub struct ModelClient {
    config: Arc<Config>,
    client: reqwest::Client,
}

impl ModelClient {
    pub fn new(config: Arc<Config>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    /// Opens a streamed request for `prompt`, retrying transient and
    /// rate-limit failures per §4.5/§7; returns immediately once the
    /// stream is open, with event decoding continuing in a background task.
    /// `cancel` is the turn's stream-controller abort signal: cancelling it
    /// stops the retry loop and tears down the background decode task's
    /// connection, per §4.5's "`cancel()`: abort the current stream
    /// controller" clause.
    pub async fn stream(
        &self,
        prompt: &Prompt,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::StreamClosed);
        }
        let instructions = prompt.get_full_instructions();
        let input_json: Vec<serde_json::Value> = prompt
            .input
            .iter()
            .map(conversation_item_to_json)
            .collect::<Result<_, _>>()?;

        let payload = ResponsesApiRequest {
            model: &self.config.model,
            instructions: &instructions,
            input: &input_json,
            previous_response_id: prompt.previous_response_id.as_deref(),
            stream: true,
            parallel_tool_calls: false,
            tools: vec![shell_tool_definition()],
        };
        let payload_body = serde_json::to_string(&payload)?;

        let endpoint = format!("{}/responses", self.config.base_url.trim_end_matches('/'));

        let mut attempt: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::StreamClosed);
            }
            attempt += 1;
            if crate::flags::debug_logging_enabled() {
                trace!(endpoint, "POST {}", payload_body);
            } else {
                trace!(endpoint, "POST (set DEBUG=1 to log request body)");
            }

            let mut req = self
                .client
                .post(&endpoint)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&payload);
            if let Some(key) = &self.config.api_key {
                req = req.bearer_auth(key);
            }

            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::StreamClosed),
                res = req.send() => res,
            };
            match res {
                Ok(resp) if resp.status().is_success() => {
                    let (tx_event, rx_event) = mpsc::channel(256);
                    let stream = resp.bytes_stream().map_err(|e| EngineError::Transient(e.to_string()));
                    tokio::spawn(process_sse(stream, tx_event, cancel.clone()));
                    return Ok(ResponseStream { rx_event });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after_header = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let body_text = resp.text().await.unwrap_or_default();
                    let detail = serde_json::from_str::<ErrorResponse>(&body_text)
                        .ok()
                        .map(|e| e.error);

                    if let Some(detail) = &detail {
                        if is_context_overflow(detail) {
                            return Err(EngineError::ContextWindowExceeded {
                                model_context_window: self.config.context_window_tokens(),
                            });
                        }
                        if is_model_not_found(detail) {
                            return Err(EngineError::ModelNotFound(
                                detail.message.clone().unwrap_or_default(),
                            ));
                        }
                    }

                    let rate_limited = is_rate_limited(status, detail.as_ref());
                    let retryable = rate_limited || status.is_server_error();

                    if !retryable {
                        let request_id = resp_request_id(&body_text);
                        return Err(EngineError::ClientRejected {
                            status: status.as_u16(),
                            request_id,
                            message: detail
                                .and_then(|d| d.message)
                                .unwrap_or(body_text),
                        });
                    }

                    if attempt > MAX_RETRIES {
                        if rate_limited {
                            return Err(EngineError::RateLimited {
                                retry_after: None,
                                status: status.as_u16(),
                                code: detail.as_ref().and_then(|d| d.code.clone()),
                                kind: detail.as_ref().and_then(|d| d.kind.clone()),
                                message: detail.and_then(|d| d.message),
                            });
                        }
                        return Err(EngineError::Transient(format!(
                            "server error {status} after {MAX_RETRIES} attempts"
                        )));
                    }

                    let delay = retry_after_header
                        .or_else(|| detail.as_ref().and_then(|d| {
                            d.message.as_deref().and_then(parse_retry_after_hint)
                        }))
                        .unwrap_or_else(|| backoff(attempt, self.config.rate_limit_retry_base));
                    warn!(attempt, ?delay, %status, "retrying streamed-turns request");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(EngineError::StreamClosed),
                    }
                }
                Err(e) => {
                    if attempt > MAX_RETRIES {
                        return Err(EngineError::Transient(e.to_string()));
                    }
                    let delay = backoff(attempt, self.config.rate_limit_retry_base);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(EngineError::StreamClosed),
                    }
                }
            }
        }
    }
}

fn resp_request_id(body_text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body_text)
        .ok()
        .and_then(|v| v.get("request_id")?.as_str().map(str::to_string))
}

fn conversation_item_to_json(item: &ConversationItem) -> Result<serde_json::Value, EngineError> {
    let value = match item {
        ConversationItem::Message { role, content } => serde_json::json!({
            "type": "message",
            "role": role,
            "content": content,
        }),
        ConversationItem::FunctionCall {
            call_id,
            name,
            arguments,
        } => serde_json::json!({
            "type": "function_call",
            "call_id": call_id,
            "name": name,
            "arguments": arguments,
        }),
        ConversationItem::FunctionCallOutput {
            call_id,
            output,
            exit_code,
            duration,
        } => serde_json::json!({
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
            "exit_code": exit_code,
            "duration_seconds": duration.map(|d| d.as_secs_f64()),
        }),
        ConversationItem::ReasoningSummary { parts, duration } => serde_json::json!({
            "type": "reasoning",
            "summary": parts,
            "duration_seconds": duration.map(|d| d.as_secs_f64()),
        }),
    };
    Ok(value)
}

fn json_to_conversation_item(value: &serde_json::Value) -> Option<ConversationItem> {
    match value.get("type")?.as_str()? {
        "function_call" => Some(ConversationItem::FunctionCall {
            call_id: value.get("call_id")?.as_str()?.to_string(),
            name: value.get("name")?.as_str()?.to_string(),
            arguments: value.get("arguments")?.as_str().unwrap_or_default().to_string(),
        }),
        "message" => {
            let role = serde_json::from_value(value.get("role")?.clone()).ok()?;
            let content = serde_json::from_value(value.get("content")?.clone()).ok()?;
            Some(ConversationItem::Message { role, content })
        }
        "reasoning" => {
            let parts = value
                .get("summary")
                .and_then(|s| serde_json::from_value(s.clone()).ok())
                .unwrap_or_default();
            Some(ConversationItem::ReasoningSummary {
                parts,
                duration: None,
            })
        }
        _ => None,
    }
}

/// Decodes `stream` into [`ResponseEvent`]s until the stream ends, a
/// terminal SSE payload arrives, the idle timeout fires, or `cancel` fires
/// first. Cancellation drops `stream` (and so the underlying connection)
/// instead of letting the background task read it to natural completion —
/// this is what makes `TurnEngine::cancel()` actually abort the in-flight
/// request rather than merely stop listening to it.
async fn process_sse<S>(
    stream: S,
    tx_event: mpsc::Sender<Result<ResponseEvent, EngineError>>,
    cancel: CancellationToken,
)
where
    S: Stream<Item = Result<Bytes, EngineError>> + Unpin,
{
    let mut stream = stream.eventsource();

    loop {
        let sse = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return;
            }
            result = timeout(STREAM_IDLE_TIMEOUT, stream.next()) => match result {
                Ok(Some(Ok(sse))) => sse,
                Ok(Some(Err(e))) => {
                    debug!("SSE error: {e}");
                    let _ = tx_event.send(Err(EngineError::StreamClosed)).await;
                    return;
                }
                Ok(None) => {
                    return;
                }
                Err(_) => {
                    let _ = tx_event.send(Err(EngineError::StreamClosed)).await;
                    return;
                }
            },
        };

        let payload: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(e) => {
                debug!("failed to parse SSE payload: {e}");
                continue;
            }
        };

        match payload.get("type").and_then(|v| v.as_str()) {
            Some("response.output_item.done") => {
                if let Some(item) = payload
                    .get("item")
                    .and_then(json_to_conversation_item)
                {
                    let _ = tx_event.send(Ok(ResponseEvent::OutputItemDone { item })).await;
                }
            }
            Some("response.completed") => {
                let response = payload.get("response");
                let response_id = response
                    .and_then(|r| r.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let output = response
                    .and_then(|r| r.get("output"))
                    .and_then(|v| v.as_array())
                    .map(|items| items.iter().filter_map(json_to_conversation_item).collect())
                    .unwrap_or_default();
                let _ = tx_event
                    .send(Ok(ResponseEvent::Completed { response_id, output }))
                    .await;
                return;
            }
            Some("response.failed") | Some("error") => {
                let _ = tx_event.send(Err(EngineError::StreamClosed)).await;
                return;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_after_hint_from_message() {
        let d = parse_retry_after_hint("Please try again in 1.3s.");
        assert_eq!(d, Some(Duration::from_secs_f64(1.3)));
    }

    #[test]
    fn context_overflow_is_recognized() {
        let detail = ErrorDetail {
            kind: Some("invalid_request_error".to_string()),
            code: None,
            message: Some("max_tokens is too large for this model".to_string()),
        };
        assert!(is_context_overflow(&detail));
    }

    #[test]
    fn model_not_found_is_recognized() {
        let detail = ErrorDetail {
            kind: Some("invalid_request_error".to_string()),
            code: Some("model_not_found".to_string()),
            message: Some("no such model".to_string()),
        };
        assert!(is_model_not_found(&detail));
    }
}
