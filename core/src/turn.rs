//! The turn engine: drives one streamed model request/response exchange,
//! dispatches tool calls through the exec handler, and stages delivered
//! items behind a short delay so a cancellation can still drop them before
//! they reach the observer. See § Turn Engine / § Concurrency & Resource
//! Model for the state machine this implements.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::client::ModelClient;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::config::Config;
use crate::error::EngineError;
use crate::error::get_error_message_ui;
use crate::exec_handler;
use crate::observer::TurnObserver;
use crate::protocol::ConversationItem;
use crate::protocol::Role;

/// Delay before a staged item is delivered to the observer, giving a
/// near-simultaneous `cancel()` time to land first.
const STAGE_DELAY: Duration = Duration::from_millis(10);
/// Delay before flushing any items still staged when a run completes.
const FLUSH_DELAY: Duration = Duration::from_millis(30);

/// Synthetic output used to answer a call-id the model is still waiting on
/// when a new turn begins without a prior answer for it.
const ABORTED_OUTPUT: &str = r#"{"output":"aborted","metadata":{"exit_code":1,"duration_seconds":0}}"#;

/// Per-instance state that outlives any single `run()` call: approval
/// policy, writable roots, pending tool-call obligations, and the
/// continuation cursor for the remote model.
struct SessionState {
    config: Arc<Config>,
    observer: Arc<dyn TurnObserver>,
    client: ModelClient,
    cwd: PathBuf,
    instructions: Option<String>,
    generation: AtomicU64,
    canceled: AtomicBool,
    terminated: AtomicBool,
    pending_aborts: Mutex<HashSet<String>>,
    last_response_id: Mutex<Option<String>>,
    exec_abort: Mutex<Arc<Notify>>,
    /// Aborts the in-flight streamed-turns request/SSE decode task. Separate
    /// from `exec_abort`, which only reaches spawned subprocesses.
    stream_cancel: Mutex<CancellationToken>,
}

/// The agent turn engine. Owns session-scoped state; `run()` drives one
/// turn to completion (or cancellation) against the shared model client.
pub struct TurnEngine {
    session: Arc<SessionState>,
}

impl TurnEngine {
    pub fn new(config: Arc<Config>, observer: Arc<dyn TurnObserver>, cwd: PathBuf, instructions: Option<String>) -> Self {
        let client = ModelClient::new(config.clone());
        let session = Arc::new(SessionState {
            config,
            observer,
            client,
            cwd,
            instructions,
            generation: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            pending_aborts: Mutex::new(HashSet::new()),
            last_response_id: Mutex::new(None),
            exec_abort: Mutex::new(Arc::new(Notify::new())),
            stream_cancel: Mutex::new(CancellationToken::new()),
        });
        Self { session }
    }

    /// Drives one turn: stream the model's reply, execute any requested
    /// tools, and loop until the model stops asking for more. Returns once
    /// the turn reaches *Done* or *Cancelled*.
    pub async fn run(&self, input: Vec<ConversationItem>) -> Result<(), EngineError> {
        if self.session.terminated.load(Ordering::SeqCst) {
            return Err(EngineError::StreamClosed);
        }

        let generation = self.session.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.session.canceled.store(false, Ordering::SeqCst);
        *self.session.exec_abort.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(Notify::new());
        let stream_cancel = CancellationToken::new();
        *self.session.stream_cancel.lock().unwrap_or_else(|e| e.into_inner()) = stream_cancel.clone();

        let staged: Arc<Mutex<Vec<Option<ConversationItem>>>> = Arc::new(Mutex::new(Vec::new()));
        let turn_start = Instant::now();

        let mut turn_input = self.drain_pending_aborts(input);
        self.session.observer.on_loading(true).await;

        while !turn_input.is_empty() {
            if self.session.canceled.load(Ordering::SeqCst) {
                break;
            }

            for item in turn_input.drain(..) {
                self.stage(generation, &staged, item);
            }

            let prompt = Prompt {
                input: staged_snapshot_non_function_calls(&staged),
                instructions: self.session.instructions.clone(),
                previous_response_id: self.session.last_response_id.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            };

            let mut stream = match self.session.client.stream(&prompt, stream_cancel.clone()).await {
                Ok(s) => s,
                Err(err) => {
                    if let Some(message) = terminal_system_message(&err) {
                        self.stage(generation, &staged, system_message(message));
                    }
                    break;
                }
            };

            let mut next_turn_input = Vec::new();
            let mut stream_failed = false;

            loop {
                if self.session.canceled.load(Ordering::SeqCst) {
                    break;
                }
                use futures::StreamExt;
                match stream.next().await {
                    Some(Ok(ResponseEvent::OutputItemDone { item })) => {
                        if let ConversationItem::FunctionCall { call_id, .. } = &item {
                            self.session
                                .pending_aborts
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(call_id.clone());
                        }
                        self.stage(generation, &staged, annotate_reasoning_duration(item, turn_start));
                    }
                    Some(Ok(ResponseEvent::Completed { response_id, output })) => {
                        self.session
                            .observer
                            .on_last_response_id(response_id.clone())
                            .await;
                        *self.session.last_response_id.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(response_id);

                        for item in output {
                            if let ConversationItem::FunctionCall {
                                call_id,
                                name,
                                arguments,
                            } = &item
                            {
                                if !exec_handler::is_shell_tool_call(name) {
                                    self.session
                                        .pending_aborts
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .remove(call_id);
                                    next_turn_input.push(ConversationItem::FunctionCallOutput {
                                        call_id: call_id.clone(),
                                        output: format!("unsupported tool call: {name}"),
                                        exit_code: Some(1),
                                        duration: None,
                                    });
                                    continue;
                                }
                                let exec_abort = self
                                    .session
                                    .exec_abort
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .clone();
                                let fn_output = exec_handler::handle_shell_call(
                                    call_id,
                                    arguments,
                                    &self.session.config,
                                    &self.session.cwd,
                                    exec_abort,
                                    self.session.observer.as_ref(),
                                )
                                .await;
                                self.session
                                    .pending_aborts
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .remove(call_id);
                                next_turn_input.push(fn_output);
                            }
                        }
                        break;
                    }
                    Some(Err(err)) => {
                        if let Some(message) = terminal_system_message(&err) {
                            self.stage(generation, &staged, system_message(message));
                        }
                        stream_failed = true;
                        break;
                    }
                    None => {
                        stream_failed = true;
                        break;
                    }
                }
            }

            if stream_failed || self.session.canceled.load(Ordering::SeqCst) {
                break;
            }
            turn_input = next_turn_input;
        }

        self.flush(generation, staged).await;
        self.session.observer.on_loading(false).await;
        Ok(())
    }

    /// Drains `pendingAborts` into synthetic `function_call_output`s
    /// prepended to `input`. Mandatory before any request referencing a
    /// prior call-id can be sent again.
    fn drain_pending_aborts(&self, input: Vec<ConversationItem>) -> Vec<ConversationItem> {
        let mut pending = self.session.pending_aborts.lock().unwrap_or_else(|e| e.into_inner());
        if pending.is_empty() {
            return input;
        }
        let mut prefix: Vec<ConversationItem> = pending
            .drain()
            .map(|call_id| ConversationItem::FunctionCallOutput {
                call_id,
                output: ABORTED_OUTPUT.to_string(),
                exit_code: None,
                duration: None,
            })
            .collect();
        prefix.extend(input);
        prefix
    }

    /// Appends `item` to the staged array and schedules its deferred
    /// delivery, fenced on `generation`.
    fn stage(&self, generation: u64, staged: &Arc<Mutex<Vec<Option<ConversationItem>>>>, item: ConversationItem) {
        let index = {
            let mut guard = staged.lock().unwrap_or_else(|e| e.into_inner());
            guard.push(Some(item));
            guard.len() - 1
        };
        let session = self.session.clone();
        let staged = staged.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STAGE_DELAY).await;
            if session.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if session.canceled.load(Ordering::SeqCst) {
                return;
            }
            let item = {
                let mut guard = staged.lock().unwrap_or_else(|e| e.into_inner());
                guard.get_mut(index).and_then(Option::take)
            };
            if let Some(item) = item {
                session.observer.on_item(item).await;
            }
        });
    }

    /// Emits any items still staged after the run's main loop ends,
    /// respecting a cancel that landed between staging and this flush.
    async fn flush(&self, generation: u64, staged: Arc<Mutex<Vec<Option<ConversationItem>>>>) {
        tokio::time::sleep(FLUSH_DELAY).await;
        if self.session.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let remaining: Vec<ConversationItem> = {
            let mut guard = staged.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter_mut().filter_map(Option::take).collect()
        };
        if self.session.canceled.load(Ordering::SeqCst) {
            return;
        }
        for item in remaining {
            self.session.observer.on_item(item).await;
        }
    }

    /// Aborts the current turn: stops further item delivery and subprocess
    /// completion for this turn, but never clears `pendingAborts` — those
    /// IDs must still be answered on the next `run()`.
    pub async fn cancel(&self) {
        self.session
            .stream_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.session.exec_abort.lock().unwrap_or_else(|e| e.into_inner()).notify_waiters();
        self.session.canceled.store(true, Ordering::SeqCst);
        if self.session.pending_aborts.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
            *self.session.last_response_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
        self.session.generation.fetch_add(1, Ordering::SeqCst);
        self.session.observer.on_loading(false).await;
    }

    /// Terminates the instance permanently; subsequent `run()` calls fail.
    pub fn terminate(&self) {
        self.session
            .stream_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.session.exec_abort.lock().unwrap_or_else(|e| e.into_inner()).notify_waiters();
        self.session.terminated.store(true, Ordering::SeqCst);
    }
}

/// Maps a terminal client/stream error to the dedicated user-visible
/// system message it should surface, or `None` when the error is silent
/// (cancellation never reaches this path; retries are exhausted inside
/// the client before returning here).
fn terminal_system_message(err: &EngineError) -> Option<String> {
    Some(get_error_message_ui(err))
}

fn system_message(text: String) -> ConversationItem {
    ConversationItem::Message {
        role: Role::System,
        content: vec![crate::protocol::ContentItem::Text { text }],
    }
}

/// Snapshot of currently-staged items suitable for sending as request
/// input: function calls are omitted since they are obligations the *next*
/// request answers, never re-sent as input themselves.
fn staged_snapshot_non_function_calls(
    staged: &Arc<Mutex<Vec<Option<ConversationItem>>>>,
) -> Vec<ConversationItem> {
    staged
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter_map(|slot| slot.clone())
        .filter(|item| !matches!(item, ConversationItem::FunctionCall { .. }))
        .collect()
}

/// Stamps a reasoning summary with wall-clock elapsed time since the turn
/// began; leaves every other item unchanged.
fn annotate_reasoning_duration(item: ConversationItem, turn_start: Instant) -> ConversationItem {
    match item {
        ConversationItem::ReasoningSummary { parts, .. } => ConversationItem::ReasoningSummary {
            parts,
            duration: Some(turn_start.elapsed()),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use crate::config::ConfigToml;
    use crate::protocol::ApprovalDecision;
    use async_trait::async_trait;
    use codex_apply_patch::Patch;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        items: StdMutex<Vec<ConversationItem>>,
        loading: StdMutex<Vec<bool>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                items: StdMutex::new(Vec::new()),
                loading: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TurnObserver for Recorder {
        async fn on_item(&self, item: ConversationItem) {
            self.items.lock().unwrap_or_else(|e| e.into_inner()).push(item);
        }
        async fn on_loading(&self, loading: bool) {
            self.loading.lock().unwrap_or_else(|e| e.into_inner()).push(loading);
        }
        async fn on_last_response_id(&self, _response_id: String) {}
        async fn get_command_confirmation(
            &self,
            _command: &[String],
            _patch: Option<&Patch>,
        ) -> ApprovalDecision {
            ApprovalDecision::Approved
        }
        async fn explain_command(&self, _command: &[String]) -> String {
            String::new()
        }
    }

    fn engine() -> TurnEngine {
        let config = Arc::new(Config::load(ConfigToml::default(), ConfigOverrides::default()));
        let observer = Arc::new(Recorder::new());
        TurnEngine::new(config, observer, PathBuf::from("."), None)
    }

    #[test]
    fn pending_aborts_synthesize_exact_literal_output() {
        let engine = engine();
        engine
            .session
            .pending_aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert("call-1".to_string());
        let drained = engine.drain_pending_aborts(vec![]);
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            ConversationItem::FunctionCallOutput { call_id, output, .. } => {
                assert_eq!(call_id, "call-1");
                assert_eq!(output, ABORTED_OUTPUT);
            }
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(
            engine
                .session
                .pending_aborts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
        );
    }

    #[test]
    fn draining_is_idempotent() {
        let engine = engine();
        engine
            .session
            .pending_aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert("call-1".to_string());
        let first = engine.drain_pending_aborts(vec![]);
        let second = engine.drain_pending_aborts(vec![]);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn cancel_preserves_pending_aborts_and_clears_last_response_id() {
        let engine = engine();
        *engine
            .session
            .last_response_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some("resp-1".to_string());
        engine.cancel().await;
        assert!(
            engine
                .session
                .last_response_id
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_none()
        );

        engine
            .session
            .pending_aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert("call-2".to_string());
        *engine
            .session
            .last_response_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some("resp-2".to_string());
        engine.cancel().await;
        assert_eq!(
            *engine
                .session
                .last_response_id
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            Some("resp-2".to_string())
        );
    }

    #[test]
    fn reasoning_summary_gets_wall_clock_duration() {
        let turn_start = std::time::Instant::now();
        let item = ConversationItem::ReasoningSummary {
            parts: vec![],
            duration: None,
        };
        match annotate_reasoning_duration(item, turn_start) {
            ConversationItem::ReasoningSummary { duration, .. } => {
                assert!(duration.is_some());
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn non_reasoning_items_pass_through_untouched() {
        let turn_start = std::time::Instant::now();
        let item = system_message("hi".to_string());
        let result = annotate_reasoning_duration(item.clone(), turn_start);
        assert_eq!(result, item);
    }

    #[tokio::test]
    async fn cancel_called_twice_is_idempotent() {
        let engine = engine();
        engine.cancel().await;
        let generation_after_first = engine.session.generation.load(Ordering::SeqCst);
        engine.cancel().await;
        assert_eq!(
            engine.session.generation.load(Ordering::SeqCst),
            generation_after_first + 1
        );
        assert!(engine.session.canceled.load(Ordering::SeqCst));
    }
}
