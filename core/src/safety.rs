//! Safety classifier: decides whether a proposed command or patch
//! auto-approves (sandboxed or not), needs the user's say-so, or is
//! rejected outright. See § Safety Classifier for the full algorithm.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use codex_apply_patch::identify_files_added;
use codex_apply_patch::identify_files_needed;
use codex_apply_patch::parse_patch;
use codex_apply_patch::Patch;

use crate::bash::try_parse_safe_segments;
use crate::exec::SandboxType;
use crate::is_safe_command::group_for;
use crate::is_safe_command::is_known_safe_command;
use crate::protocol::ApprovalPolicy;
use crate::protocol::SafetyAssessment;

/// The literal shell-tool command name used to recognize a patch-delegating
/// call (`["apply_patch", "<patch blob>"]`).
pub const PATCH_TOOL_NAME: &str = "apply_patch";

/// Picks the sandbox backend available on the host platform.
pub fn get_platform_sandbox() -> SandboxType {
    if cfg!(target_os = "macos") {
        SandboxType::MacosSeatbelt
    } else if cfg!(target_os = "linux") {
        SandboxType::LinuxLandlock
    } else {
        SandboxType::None
    }
}

/// Runs the classifier algorithm (§ Safety Classifier) over a proposed argv.
pub fn assess_command_safety(
    command: &[String],
    policy: ApprovalPolicy,
    writable_roots: &[PathBuf],
    cwd: &Path,
) -> SafetyAssessment {
    // Step 1: direct patch-tool invocation.
    if command.len() == 2 && command[0] == PATCH_TOOL_NAME {
        return assess_patch_blob(&command[1], policy, writable_roots, cwd);
    }

    // Step 2: read-only allowlist.
    if is_known_safe_command(command) {
        let group = group_for(command).unwrap_or("Running").to_string();
        return SafetyAssessment::AutoApprove {
            reason: format!("{} is a read-only command", command.join(" ")),
            group,
            run_in_sandbox: false,
            patch: None,
        };
    }

    // Step 3: `<shell> -lc <script>` composition.
    if let [shell, flag, script] = command {
        if flag == "-lc" && matches!(shell.as_str(), "bash" | "sh" | "zsh") {
            if let Some(found) = codex_apply_patch::find_embedded_patch(script) {
                let patch_cwd = resolve_cd_path(found.cd_path.as_deref(), cwd);
                return assess_patch_blob(&found.patch_body, policy, writable_roots, &patch_cwd);
            }
            match try_parse_safe_segments(script) {
                Ok(segments) if segments.iter().all(|seg| is_known_safe_command(seg)) => {
                    return SafetyAssessment::AutoApprove {
                        reason: "safe shell composition".to_string(),
                        group: "Running".to_string(),
                        run_in_sandbox: false,
                        patch: None,
                    };
                }
                _ => return policy_fallback(policy),
            }
        }
    }

    // Step 4/6: unresolved, fall through to policy.
    policy_fallback(policy)
}

/// Step 5: patch safety given a raw patch blob.
fn assess_patch_blob(
    blob: &str,
    policy: ApprovalPolicy,
    writable_roots: &[PathBuf],
    cwd: &Path,
) -> SafetyAssessment {
    let patch = match parse_patch(blob) {
        Ok(p) => p,
        Err(_) => return policy_fallback(policy),
    };

    if policy == ApprovalPolicy::Suggest {
        return SafetyAssessment::AskUser { patch: Some(patch) };
    }

    if policy == ApprovalPolicy::FullAuto {
        return SafetyAssessment::AutoApprove {
            reason: "patch applied under full-auto policy".to_string(),
            group: "Editing".to_string(),
            run_in_sandbox: true,
            patch: Some(patch),
        };
    }

    if is_write_patch_constrained_to_writable_paths(&patch, writable_roots, cwd) {
        SafetyAssessment::AutoApprove {
            reason: "patch confined to writable roots".to_string(),
            group: "Editing".to_string(),
            run_in_sandbox: false,
            patch: Some(patch),
        }
    } else {
        SafetyAssessment::AskUser { patch: Some(patch) }
    }
}

/// Resolves a heredoc's leading `cd <path> &&`, if any, against `cwd`. A
/// patch embedded behind such a prefix is classified and applied relative
/// to that directory, not the shell tool call's own working directory.
fn resolve_cd_path(cd_path: Option<&str>, cwd: &Path) -> PathBuf {
    match cd_path {
        Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
        Some(p) => cwd.join(p),
        None => cwd.to_path_buf(),
    }
}

/// Determines the directory a patch embedded in `command` should be applied
/// against: `cwd` itself, unless `command` is a `bash -lc` script carrying a
/// heredoc-embedded patch behind a leading `cd <path> &&`, in which case that
/// path (resolved against `cwd`) takes precedence. Used by the exec handler
/// to apply a patch at the same location the classifier evaluated it against.
pub fn effective_patch_cwd(command: &[String], cwd: &Path) -> PathBuf {
    if let [shell, flag, script] = command {
        if flag == "-lc" && matches!(shell.as_str(), "bash" | "sh" | "zsh") {
            if let Some(found) = codex_apply_patch::find_embedded_patch(script) {
                return resolve_cd_path(found.cd_path.as_deref(), cwd);
            }
        }
    }
    cwd.to_path_buf()
}

fn policy_fallback(policy: ApprovalPolicy) -> SafetyAssessment {
    match policy {
        ApprovalPolicy::FullAuto => SafetyAssessment::AutoApprove {
            reason: "auto-approved under full-auto policy".to_string(),
            group: "Running".to_string(),
            run_in_sandbox: true,
            patch: None,
        },
        ApprovalPolicy::Suggest | ApprovalPolicy::AutoEdit => {
            SafetyAssessment::AskUser { patch: None }
        }
    }
}

/// § Path containment: every needed/added path resolves to a location
/// under some writable root.
pub fn is_write_patch_constrained_to_writable_paths(
    patch: &Patch,
    writable_roots: &[PathBuf],
    cwd: &Path,
) -> bool {
    let roots: Vec<PathBuf> = writable_roots.iter().map(|r| normalize(r)).collect();

    let mut paths: Vec<&str> = identify_files_needed(patch);
    paths.extend(identify_files_added(patch));

    paths.into_iter().all(|p| {
        let abs = if Path::new(p).is_absolute() {
            normalize(Path::new(p))
        } else {
            normalize(&cwd.join(p))
        };
        roots.iter().any(|root| abs.starts_with(root))
    })
}

/// Resolves `.`/`..` components lexically, without touching the
/// filesystem (the path may not exist yet, e.g. an `Add` target).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn read_only_command_auto_approves_unsandboxed() {
        let assessment = assess_command_safety(
            &[s("ls"), s("-la"), s("/tmp")],
            ApprovalPolicy::Suggest,
            &[],
            Path::new("/work"),
        );
        assert!(matches!(
            assessment,
            SafetyAssessment::AutoApprove {
                run_in_sandbox: false,
                ..
            }
        ));
    }

    #[test]
    fn pipe_composition_auto_approves() {
        let assessment = assess_command_safety(
            &[s("bash"), s("-lc"), s("ls -la | grep foo")],
            ApprovalPolicy::Suggest,
            &[],
            Path::new("/work"),
        );
        assert!(matches!(
            assessment,
            SafetyAssessment::AutoApprove {
                run_in_sandbox: false,
                ..
            }
        ));
    }

    #[test]
    fn redirection_asks_user() {
        let assessment = assess_command_safety(
            &[s("bash"), s("-lc"), s("ls > /tmp/out")],
            ApprovalPolicy::Suggest,
            &[],
            Path::new("/work"),
        );
        assert!(matches!(assessment, SafetyAssessment::AskUser { .. }));
    }

    #[test]
    fn writable_roots_constraint() {
        let patch = parse_patch(
            "*** Begin Patch\n*** Add File: a.txt\n+hi\n*** End Patch",
        )
        .expect("valid");
        assert!(is_write_patch_constrained_to_writable_paths(
            &patch,
            &[PathBuf::from("/work")],
            Path::new("/work"),
        ));

        let escaping = parse_patch(
            "*** Begin Patch\n*** Add File: ../outside.txt\n+hi\n*** End Patch",
        )
        .expect("valid");
        assert!(!is_write_patch_constrained_to_writable_paths(
            &escaping,
            &[PathBuf::from("/work")],
            Path::new("/work"),
        ));
    }

    #[test]
    fn patch_confined_to_cwd_auto_approves_under_auto_edit() {
        let patch = parse_patch(
            "*** Begin Patch\n*** Add File: a.txt\n+hi\n*** End Patch",
        )
        .expect("valid");
        assert!(is_write_patch_constrained_to_writable_paths(
            &patch,
            &[PathBuf::from("/work")],
            Path::new("/work"),
        ));
    }
}
