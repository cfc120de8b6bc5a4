//! Glue between a model-issued tool call and actual execution: normalizes
//! arguments, runs the safety classifier, asks the observer when required,
//! and shapes the result as a `function_call_output` conversation item.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use codex_apply_patch::{process_patch, Patch};
use serde::Deserialize;
use tokio::sync::Notify;

use crate::client_common::{SHELL_TOOL_ALIAS, SHELL_TOOL_NAME};
use crate::config::Config;
use crate::exec::{process_exec_tool_call, ExecParams, SandboxType};
use crate::observer::TurnObserver;
use crate::protocol::{ApprovalDecision, ConversationItem};
use crate::safety::{assess_command_safety, effective_patch_cwd, get_platform_sandbox};

/// Recognized names: the shell tool and its compatibility alias.
pub fn is_shell_tool_call(name: &str) -> bool {
    name == SHELL_TOOL_NAME || name == SHELL_TOOL_ALIAS
}

/// The normalized argument shape accepted from either the chat-style or
/// responses-style tool-call payload.
#[derive(Debug, Deserialize)]
struct ShellToolArgs {
    #[serde(alias = "argv")]
    command: Vec<String>,
    workdir: Option<String>,
    #[serde(alias = "timeout")]
    timeout_ms: Option<u64>,
}

/// Handles one shell tool call end to end, returning the
/// `function_call_output` item to append to the next turn's input.
pub async fn handle_shell_call(
    call_id: &str,
    arguments: &str,
    config: &Config,
    cwd: &Path,
    ctrl_c: Arc<Notify>,
    observer: &dyn TurnObserver,
) -> ConversationItem {
    let args: ShellToolArgs = match serde_json::from_str(arguments) {
        Ok(a) => a,
        Err(_) => {
            return output(call_id, format!("invalid arguments: {arguments}"), Some(1), None);
        }
    };

    let resolved_cwd = match &args.workdir {
        Some(dir) => {
            let p = Path::new(dir);
            if p.is_absolute() { p.to_path_buf() } else { cwd.join(p) }
        }
        None => cwd.to_path_buf(),
    };

    let assessment =
        assess_command_safety(&args.command, config.approval_policy, &config.writable_roots, &resolved_cwd);
    let patch_cwd = effective_patch_cwd(&args.command, &resolved_cwd);

    run_assessment(
        call_id,
        args.command,
        resolved_cwd,
        patch_cwd,
        args.timeout_ms,
        assessment,
        config,
        ctrl_c,
        observer,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_assessment(
    call_id: &str,
    command: Vec<String>,
    cwd: PathBuf,
    patch_cwd: PathBuf,
    timeout_ms: Option<u64>,
    assessment: crate::protocol::SafetyAssessment,
    config: &Config,
    ctrl_c: Arc<Notify>,
    observer: &dyn TurnObserver,
) -> ConversationItem {
    use crate::protocol::SafetyAssessment::*;

    match assessment {
        Reject { reason } => output(call_id, reason, Some(1), None),

        AutoApprove {
            run_in_sandbox,
            patch,
            ..
        } => {
            if let Some(patch) = patch {
                apply_patch_output(call_id, &patch, &patch_cwd)
            } else {
                exec_output(call_id, command, cwd, timeout_ms, run_in_sandbox, config, ctrl_c).await
            }
        }

        AskUser { patch } => {
            ask_user_then_run(
                call_id, command, cwd, patch_cwd, timeout_ms, patch, config, ctrl_c, observer,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ask_user_then_run(
    call_id: &str,
    command: Vec<String>,
    cwd: PathBuf,
    patch_cwd: PathBuf,
    timeout_ms: Option<u64>,
    patch: Option<Patch>,
    config: &Config,
    ctrl_c: Arc<Notify>,
    observer: &dyn TurnObserver,
) -> ConversationItem {
    // Bounded: an observer that keeps returning `Explain` forever cannot
    // hang the turn.
    const MAX_EXPLAIN_ROUNDS: usize = 3;

    for _ in 0..=MAX_EXPLAIN_ROUNDS {
        let decision = observer
            .get_command_confirmation(&command, patch.as_ref())
            .await;

        match decision {
            ApprovalDecision::Approved | ApprovalDecision::ApprovedForSession => {
                return if let Some(patch) = &patch {
                    apply_patch_output(call_id, patch, &patch_cwd)
                } else {
                    exec_output(call_id, command, cwd, timeout_ms, false, config, ctrl_c).await
                };
            }
            ApprovalDecision::Explain => {
                let _explanation = observer.explain_command(&command).await;
                continue;
            }
            ApprovalDecision::Denied { message } => {
                let text = message.unwrap_or_else(|| "command rejected by user".to_string());
                return output(call_id, text, Some(1), None);
            }
            ApprovalDecision::Abort => {
                return output(call_id, "aborted".to_string(), Some(1), None);
            }
        }
    }

    output(
        call_id,
        "command rejected by user".to_string(),
        Some(1),
        None,
    )
}

async fn exec_output(
    call_id: &str,
    command: Vec<String>,
    cwd: PathBuf,
    timeout_ms: Option<u64>,
    run_in_sandbox: bool,
    config: &Config,
    ctrl_c: Arc<Notify>,
) -> ConversationItem {
    let sandbox_type = if run_in_sandbox {
        get_platform_sandbox()
    } else {
        SandboxType::None
    };

    let params = ExecParams {
        command,
        cwd,
        timeout_ms,
        env: std::env::vars().collect(),
    };

    let start = Instant::now();
    match process_exec_tool_call(params, sandbox_type, ctrl_c, &config.writable_roots).await {
        Ok(result) => {
            let body = serde_json::json!({
                "stdout": result.stdout,
                "stderr": result.stderr,
            })
            .to_string();
            output(call_id, body, Some(result.exit_code), Some(result.duration))
        }
        Err(err) => output(
            call_id,
            crate::error::get_error_message_ui(&err),
            Some(1),
            Some(start.elapsed()),
        ),
    }
}

fn apply_patch_output(call_id: &str, patch: &Patch, cwd: &Path) -> ConversationItem {
    let result = process_patch(
        patch,
        |p| read_relative(cwd, p),
        |p, content| write_relative(cwd, p, content),
        |p| delete_relative(cwd, p),
    );
    match result {
        Ok(summary) => output(call_id, summary, Some(0), None),
        Err(err) => output(call_id, err.to_string(), Some(1), None),
    }
}

fn resolve(cwd: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { cwd.join(p) }
}

fn read_relative(cwd: &Path, p: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(resolve(cwd, p)) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_relative(cwd: &Path, p: &Path, content: &str) -> std::io::Result<()> {
    let full = resolve(cwd, p);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(full, content)
}

fn delete_relative(cwd: &Path, p: &Path) -> std::io::Result<()> {
    std::fs::remove_file(resolve(cwd, p))
}

fn output(
    call_id: &str,
    output: String,
    exit_code: Option<i32>,
    duration: Option<std::time::Duration>,
) -> ConversationItem {
    ConversationItem::FunctionCallOutput {
        call_id: call_id.to_string(),
        output,
        exit_code,
        duration,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::config::{Config, ConfigOverrides, ConfigToml};
    use crate::protocol::ApprovalPolicy;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct AlwaysApprove;

    #[async_trait]
    impl TurnObserver for AlwaysApprove {
        async fn on_item(&self, _item: ConversationItem) {}
        async fn on_loading(&self, _loading: bool) {}
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

    fn suggest_config(writable_roots: Vec<PathBuf>) -> Config {
        Config::load(
            ConfigToml::default(),
            ConfigOverrides {
                model: None,
                approval_policy: Some(ApprovalPolicy::Suggest),
                writable_roots: Some(writable_roots),
            },
        )
    }

    #[tokio::test]
    async fn malformed_json_reports_invalid_arguments() {
        let dir = tempdir().expect("tempdir");
        let config = suggest_config(vec![dir.path().to_path_buf()]);
        let observer = AlwaysApprove;
        let item = handle_shell_call(
            "call-1",
            "{not json",
            &config,
            dir.path(),
            Arc::new(Notify::new()),
            &observer,
        )
        .await;
        match item {
            ConversationItem::FunctionCallOutput { output, exit_code, .. } => {
                assert!(output.starts_with("invalid arguments:"));
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_command_runs_without_asking() {
        let dir = tempdir().expect("tempdir");
        let config = suggest_config(vec![dir.path().to_path_buf()]);
        let observer = AlwaysApprove;
        let args = serde_json::json!({ "command": ["pwd"] }).to_string();
        let item = handle_shell_call(
            "call-2",
            &args,
            &config,
            dir.path(),
            Arc::new(Notify::new()),
            &observer,
        )
        .await;
        match item {
            ConversationItem::FunctionCallOutput { exit_code, .. } => {
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn heredoc_patch_behind_cd_applies_under_that_directory() {
        let dir = tempdir().expect("tempdir");
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).expect("mkdir");
        let config = suggest_config(vec![dir.path().to_path_buf()]);
        let observer = AlwaysApprove;
        let script = format!(
            "cd {} && apply_patch <<'PATCH'\n*** Begin Patch\n*** Add File: new.txt\n+hi\n*** End Patch\nPATCH",
            sub.display()
        );
        let args = serde_json::json!({ "command": ["bash", "-lc", script] }).to_string();
        let item = handle_shell_call(
            "call-3",
            &args,
            &config,
            dir.path(),
            Arc::new(Notify::new()),
            &observer,
        )
        .await;
        match item {
            ConversationItem::FunctionCallOutput { exit_code, .. } => {
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(sub.join("new.txt").exists());
        assert!(!dir.path().join("new.txt").exists());
    }
}
