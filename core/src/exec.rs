#[cfg(unix)]
use std::os::unix::process::CommandExt;
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::EngineError;
use crate::error::SandboxErr;

/// Each stream (stdout/stderr) is capped independently at 100 KiB; once the
/// cap is hit, further bytes are discarded but the pipe keeps being drained
/// so the child never blocks on a full pipe buffer.
const MAX_STREAM_OUTPUT: usize = 100 * 1024;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const SIGTERM_CODE: i32 = 15;
const SIGKILL_CODE: i32 = 9;
const TIMEOUT_CODE: i32 = 64;

/// Grace period between SIGTERM and SIGKILL when tearing down a process
/// group on cancellation.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

const MACOS_SEATBELT_BASE_POLICY: &str = include_str!("seatbelt_base_policy.sbpl");

/// Only trust `sandbox-exec` at this fixed path, to defend against a
/// tampered PATH entry. If `/usr/bin/sandbox-exec` itself has been
/// tampered with, the attacker already has root.
const MACOS_PATH_TO_SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub timeout_ms: Option<u64>,
    pub env: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxType {
    None,
    /// Only available on macOS.
    MacosSeatbelt,
    /// Only available on Linux; combines Landlock (filesystem) with
    /// seccomp (syscall) restrictions.
    LinuxLandlock,
}

/// Translates argv[0] for a handful of common Unix utilities to a Windows
/// equivalent invocation when the host is Windows; a no-op everywhere else.
/// Only covers the read-only allowlist verbs most likely to appear in a
/// model-issued command (see [`crate::is_safe_command`]) since those are the
/// ones auto-approved without a user glancing at the argv first.
#[cfg(windows)]
fn adapt_argv_for_platform(command: Vec<String>) -> Vec<String> {
    let Some((program, rest)) = command.split_first() else {
        return command;
    };
    let builtin = match program.as_str() {
        "ls" => "dir",
        "cat" => "type",
        "rm" => "del",
        "cp" => "copy",
        "mv" => "move",
        "grep" => "findstr",
        "pwd" => "cd",
        _ => return command,
    };
    let mut argv = vec!["cmd.exe".to_string(), "/C".to_string(), builtin.to_string()];
    argv.extend_from_slice(rest);
    argv
}

#[cfg(not(windows))]
fn adapt_argv_for_platform(command: Vec<String>) -> Vec<String> {
    command
}

/// Runs `params` under `sandbox_type`, shaping the result into an
/// [`ExecToolCallOutput`]. Never returns a bare transport error for a
/// command that ran to completion — any nonzero/sandboxed-denied exit is
/// surfaced through `SandboxErr`, which the exec handler turns into a
/// structured tool-call output rather than tearing down the turn.
pub async fn process_exec_tool_call(
    params: ExecParams,
    sandbox_type: SandboxType,
    ctrl_c: Arc<Notify>,
    writable_roots: &[PathBuf],
) -> Result<ExecToolCallOutput, EngineError> {
    let start = Instant::now();
    let params = ExecParams {
        command: adapt_argv_for_platform(params.command),
        ..params
    };
    tracing::debug!(argv = ?params.command, cwd = ?params.cwd, ?sandbox_type, "spawning exec");

    let raw_output_result: Result<RawExecToolCallOutput, EngineError> = match sandbox_type {
        SandboxType::None => exec(params, ctrl_c).await,
        SandboxType::MacosSeatbelt => {
            let ExecParams {
                command,
                cwd,
                timeout_ms,
                env,
            } = params;
            let child =
                spawn_command_under_seatbelt(command, writable_roots, cwd, env).await?;
            consume_truncated_output(child, ctrl_c, timeout_ms).await
        }
        SandboxType::LinuxLandlock => {
            let ExecParams {
                command,
                cwd,
                timeout_ms,
                env,
            } = params;
            let child = spawn_command_under_landlock(command, writable_roots, cwd, env).await?;
            consume_truncated_output(child, ctrl_c, timeout_ms).await
        }
    };

    let duration = start.elapsed();
    match raw_output_result {
        Ok(raw_output) => {
            let stdout = String::from_utf8_lossy(&raw_output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&raw_output.stderr).to_string();

            #[cfg(unix)]
            match raw_output.exit_status.signal() {
                Some(TIMEOUT_CODE) => {
                    return Err(EngineError::Sandbox(SandboxErr::Timeout));
                }
                Some(signal) => {
                    return Err(EngineError::Sandbox(SandboxErr::Signal(signal)));
                }
                None => {}
            }

            let exit_code = raw_output.exit_status.code().unwrap_or(-1);

            if exit_code != 0 && sandbox_type != SandboxType::None {
                return Err(EngineError::Sandbox(SandboxErr::Denied {
                    exit_code,
                    stdout,
                    stderr,
                }));
            }

            tracing::trace!(exit_code, ?duration, "exec completed");
            Ok(ExecToolCallOutput {
                exit_code,
                stdout,
                stderr,
                duration,
            })
        }
        Err(err) => {
            tracing::error!("exec error: {err}");
            Err(err)
        }
    }
}

async fn spawn_command_under_seatbelt(
    command: Vec<String>,
    writable_roots: &[PathBuf],
    cwd: PathBuf,
    env: HashMap<String, String>,
) -> Result<Child, EngineError> {
    let args = create_seatbelt_command_args(command, writable_roots, &cwd);
    spawn_child_async(
        PathBuf::from(MACOS_PATH_TO_SEATBELT_EXECUTABLE),
        args,
        cwd,
        StdioPolicy::RedirectForShellTool,
        env,
        None,
    )
    .await
    .map_err(EngineError::Io)
}

fn create_seatbelt_command_args(
    command: Vec<String>,
    writable_roots: &[PathBuf],
    _cwd: &Path,
) -> Vec<String> {
    let (writable_folder_policies, extra_cli_args): (Vec<String>, Vec<String>) = writable_roots
        .iter()
        .enumerate()
        .map(|(index, root)| {
            let param_name = format!("WRITABLE_ROOT_{index}");
            let policy = format!("(subpath (param \"{param_name}\"))");
            let cli_arg = format!("-D{param_name}={}", root.to_string_lossy());
            (policy, cli_arg)
        })
        .unzip();

    let file_write_policy = if writable_folder_policies.is_empty() {
        String::new()
    } else {
        format!(
            "(allow file-write*\n{}\n)",
            writable_folder_policies.join(" ")
        )
    };

    // Reads are unrestricted; only writes are confined to the writable
    // roots and network access is always disabled, per § Sandbox Executor.
    let full_policy =
        format!("{MACOS_SEATBELT_BASE_POLICY}\n(allow file-read*)\n{file_write_policy}");

    let mut seatbelt_args: Vec<String> = vec!["-p".to_string(), full_policy];
    seatbelt_args.extend(extra_cli_args);
    seatbelt_args.push("--".to_string());
    seatbelt_args.extend(command);
    seatbelt_args
}

async fn spawn_command_under_landlock(
    command: Vec<String>,
    writable_roots: &[PathBuf],
    cwd: PathBuf,
    env: HashMap<String, String>,
) -> Result<Child, EngineError> {
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (command, writable_roots, cwd, env);
        return Err(EngineError::Sandbox(SandboxErr::LandlockUnavailable));
    }

    #[cfg(target_os = "linux")]
    {
        if !crate::landlock::is_supported() {
            return Err(EngineError::Sandbox(SandboxErr::LandlockUnavailable));
        }
        let (program, args) = command.split_first().ok_or_else(|| {
            EngineError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "command args are empty",
            ))
        })?;
        spawn_child_async(
            PathBuf::from(program),
            args.to_vec(),
            cwd,
            StdioPolicy::RedirectForShellTool,
            env,
            Some(writable_roots.to_vec()),
        )
        .await
        .map_err(EngineError::Io)
    }
}

#[derive(Debug)]
pub struct RawExecToolCallOutput {
    pub exit_status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug)]
pub struct ExecToolCallOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

async fn exec(
    ExecParams {
        command,
        cwd,
        timeout_ms,
        env,
    }: ExecParams,
    ctrl_c: Arc<Notify>,
) -> Result<RawExecToolCallOutput, EngineError> {
    let (program, args) = command.split_first().ok_or_else(|| {
        EngineError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "command args are empty",
        ))
    })?;
    let child = spawn_child_async(
        PathBuf::from(program),
        args.to_vec(),
        cwd,
        StdioPolicy::RedirectForShellTool,
        env,
        None,
    )
    .await
    .map_err(EngineError::Io)?;
    consume_truncated_output(child, ctrl_c, timeout_ms).await
}

#[derive(Debug, Clone, Copy)]
pub enum StdioPolicy {
    RedirectForShellTool,
    Inherit,
}

/// Spawns the child process, always with stdin closed (never inherited as
/// a live pipe) and, on Unix, in its own process group so a single signal
/// reaches every descendant.
async fn spawn_child_async(
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    stdio_policy: StdioPolicy,
    env: HashMap<String, String>,
    #[cfg_attr(not(target_os = "linux"), allow(unused_variables))] landlock_roots: Option<
        Vec<PathBuf>,
    >,
) -> std::io::Result<Child> {
    trace!("spawn_child_async: {program:?} {args:?} {cwd:?} {stdio_policy:?}");

    let mut cmd = Command::new(&program);
    cmd.args(&args);
    cmd.current_dir(&cwd);
    cmd.env_clear();
    cmd.envs(env);

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(move || {
            // Put the child in its own process group so `cancel()` can
            // signal the whole group with one call.
            if libc::setpgid(0, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            // If this process dies (including via SIGKILL), terminate any
            // child spawned for a shell-tool call rather than orphaning it.
            #[cfg(target_os = "linux")]
            {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::getppid() == 1 {
                    libc::raise(libc::SIGTERM);
                }
            }
            #[cfg(target_os = "linux")]
            if let Some(roots) = &landlock_roots {
                crate::landlock::apply_to_current_thread(roots)
                    .map_err(|e| io::Error::other(e.to_string()))?;
            }
            Ok(())
        });
    }

    match stdio_policy {
        StdioPolicy::RedirectForShellTool => {
            // Never give the child a live stdin: some tools (notably
            // recursive-grep utilities) block reading from stdin when it
            // is a pipe or TTY, hanging indefinitely.
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        StdioPolicy::Inherit => {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
    }

    cmd.kill_on_drop(true).spawn()
}

/// Consumes the child's output into bounded buffers and enforces the
/// timeout/cancellation contract described in § Sandbox Executor.
pub(crate) async fn consume_truncated_output(
    mut child: Child,
    ctrl_c: Arc<Notify>,
    timeout_ms: Option<u64>,
) -> Result<RawExecToolCallOutput, EngineError> {
    let stdout_reader = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Io(io::Error::other("stdout pipe unexpectedly unavailable")))?;
    let stderr_reader = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Io(io::Error::other("stderr pipe unexpectedly unavailable")))?;

    let stdout_handle = tokio::spawn(read_capped(BufReader::new(stdout_reader), MAX_STREAM_OUTPUT));
    let stderr_handle = tokio::spawn(read_capped(BufReader::new(stderr_reader), MAX_STREAM_OUTPUT));

    let interrupted = ctrl_c.notified();
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    let exit_status = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait()) => {
            match result {
                Ok(Ok(exit_status)) => exit_status,
                Ok(Err(e)) => return Err(EngineError::Io(e)),
                Err(_) => {
                    terminate_process_group(&mut child).await?;
                    synthetic_exit_status(128 + TIMEOUT_CODE)
                }
            }
        }
        _ = interrupted => {
            terminate_process_group(&mut child).await?;
            synthetic_exit_status(128 + SIGKILL_CODE)
        }
    };

    let stdout = stdout_handle
        .await
        .map_err(|e| EngineError::Io(io::Error::other(e.to_string())))??;
    let stderr = stderr_handle
        .await
        .map_err(|e| EngineError::Io(io::Error::other(e.to_string())))??;

    Ok(RawExecToolCallOutput {
        exit_status,
        stdout,
        stderr,
    })
}

/// SIGTERM the process group, then SIGKILL after a grace period; falls
/// back to signalling just the immediate child if group-signalling is
/// unsupported (e.g. `setpgid` failed at spawn time).
async fn terminate_process_group(child: &mut Child) -> Result<(), EngineError> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pgid = pid as libc::pid_t;
            unsafe {
                if libc::kill(-pgid, SIGTERM_CODE) == -1 {
                    let _ = libc::kill(pid as libc::pid_t, SIGTERM_CODE);
                }
            }
            let graced = tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await;
            if graced.is_err() {
                unsafe {
                    if libc::kill(-pgid, SIGKILL_CODE) == -1 {
                        let _ = libc::kill(pid as libc::pid_t, SIGKILL_CODE);
                    }
                }
            }
        }
    }
    child.start_kill().map_err(EngineError::Io)?;
    Ok(())
}

/// Reads `reader` to EOF, keeping only the first `max_output` bytes; any
/// bytes beyond the cap are discarded but still read off the pipe, so the
/// child never blocks on a full pipe buffer waiting for this side to drain
/// it. Per § Sandbox Executor, the cap is byte-only — no line-count bound.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max_output: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];

    let mut remaining_bytes = max_output;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        if remaining_bytes > 0 {
            let copy_len = remaining_bytes.min(n);
            buf.extend_from_slice(&tmp[..copy_len]);
            remaining_bytes -= copy_len;
        }
    }

    Ok(buf)
}

#[cfg(unix)]
fn synthetic_exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code)
}

#[cfg(windows)]
fn synthetic_exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(code as u32)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[tokio::test]
    async fn echoes_stdout_and_exits_zero() {
        let params = ExecParams {
            command: vec!["echo".to_string(), "hello".to_string()],
            cwd: std::env::temp_dir(),
            timeout_ms: None,
            env: HashMap::new(),
        };
        let out = process_exec_tool_call(params, SandboxType::None, Arc::new(Notify::new()), &[])
            .await
            .expect("exec succeeds");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error_when_unsandboxed() {
        let params = ExecParams {
            command: vec!["false".to_string()],
            cwd: std::env::temp_dir(),
            timeout_ms: None,
            env: HashMap::new(),
        };
        let out = process_exec_tool_call(params, SandboxType::None, Arc::new(Notify::new()), &[])
            .await
            .expect("exec succeeds");
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn timeout_kills_long_running_command() {
        let params = ExecParams {
            command: vec!["sleep".to_string(), "5".to_string()],
            cwd: std::env::temp_dir(),
            timeout_ms: Some(50),
            env: HashMap::new(),
        };
        let err = process_exec_tool_call(params, SandboxType::None, Arc::new(Notify::new()), &[])
            .await
            .expect_err("should time out");
        assert!(matches!(err, EngineError::Sandbox(SandboxErr::Timeout)));
    }

    #[cfg(windows)]
    #[test]
    fn known_unix_utility_is_rewritten_to_cmd_builtin() {
        let argv = adapt_argv_for_platform(vec!["ls".to_string(), "-la".to_string()]);
        assert_eq!(
            argv,
            vec!["cmd.exe", "/C", "dir", "-la"]
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        );
    }

    #[cfg(windows)]
    #[test]
    fn unknown_program_passes_through_unchanged() {
        let argv = adapt_argv_for_platform(vec!["rg".to_string(), "foo".to_string()]);
        assert_eq!(argv, vec!["rg".to_string(), "foo".to_string()]);
    }

    #[tokio::test]
    async fn read_capped_keeps_exactly_the_byte_at_the_boundary() {
        let body = vec![b'x'; 10];
        let out = read_capped(std::io::Cursor::new(body.clone()), 10)
            .await
            .expect("reads");
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn read_capped_discards_bytes_past_the_boundary() {
        let mut body = vec![b'x'; 10];
        body.push(b'y');
        let out = read_capped(std::io::Cursor::new(body.clone()), 10)
            .await
            .expect("reads");
        assert_eq!(out, &body[..10]);
    }

    #[tokio::test]
    async fn read_capped_is_byte_only_not_line_bound() {
        // 2000 one-byte lines: a line-count cap would have truncated this
        // well before the byte cap; the byte-only contract keeps all of it.
        let body = "a\n".repeat(2000).into_bytes();
        let out = read_capped(std::io::Cursor::new(body.clone()), body.len())
            .await
            .expect("reads");
        assert_eq!(out, body);
        assert_eq!(out.iter().filter(|&&b| b == b'\n').count(), 2000);
    }
}
