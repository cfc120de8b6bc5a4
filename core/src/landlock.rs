//! Linux sandbox backend: Landlock restricts filesystem access to the
//! writable-root list (read access is left unrestricted — the commands the
//! classifier sandboxes are typically readers that also need one or two
//! writes); seccomp blocks the syscalls that would establish outbound
//! network connections. Both are applied to the current thread immediately
//! before `execve`, in the child's `pre_exec` hook, so they only affect the
//! spawned command and never leak back into the engine process.

use std::path::Path;
use std::path::PathBuf;

use landlock::Access;
use landlock::AccessFs;
use landlock::PathBeneath;
use landlock::PathFd;
use landlock::Ruleset;
use landlock::RulesetAttr;
use landlock::RulesetCreatedAttr;
use landlock::ABI;
use seccompiler::BpfProgram;
use seccompiler::SeccompAction;
use seccompiler::SeccompFilter;
use seccompiler::TargetArch;

/// Whether the running kernel supports the Landlock ABI version this
/// module targets. Checked before spawning so a denied-by-default kernel
/// surfaces a typed error instead of an opaque `pre_exec` failure.
pub fn is_supported() -> bool {
    Ruleset::default()
        .handle_access(AccessFs::from_all(ABI::V5))
        .and_then(|r| r.create())
        .is_ok()
}

/// Restricts the calling thread: filesystem writes outside `writable_roots`
/// are denied, and the common socket-creation syscalls used to open
/// outbound network connections are killed by seccomp. Must run after
/// `fork()` and before `execve()`.
pub fn apply_to_current_thread(writable_roots: &[PathBuf]) -> anyhow::Result<()> {
    apply_landlock(writable_roots)?;
    apply_seccomp_network_deny()?;
    Ok(())
}

fn apply_landlock(writable_roots: &[PathBuf]) -> anyhow::Result<()> {
    let abi = ABI::V5;
    let ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))?
        .create()?;

    let read_only_access = AccessFs::from_read(abi);
    let read_write_access = AccessFs::from_all(abi);

    let mut ruleset = ruleset.add_rule(PathBeneath::new(PathFd::new("/")?, read_only_access))?;

    for root in writable_roots {
        if let Ok(fd) = PathFd::new(root as &Path) {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, read_write_access))?;
        }
    }

    ruleset.restrict_self()?;
    Ok(())
}

fn apply_seccomp_network_deny() -> anyhow::Result<()> {
    let denied_syscalls = ["socket", "connect", "sendto"];
    let mut rules = std::collections::BTreeMap::new();
    for name in denied_syscalls {
        if let Some(nr) = syscall_number(name) {
            rules.insert(nr, Vec::new());
        }
    }

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        target_arch(),
    )?;
    let program: BpfProgram = filter.try_into()?;
    seccompiler::apply_filter(&program)?;
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn target_arch() -> TargetArch {
    TargetArch::x86_64
}

#[cfg(target_arch = "aarch64")]
fn target_arch() -> TargetArch {
    TargetArch::aarch64
}

fn syscall_number(name: &str) -> Option<i64> {
    match name {
        "socket" => Some(libc::SYS_socket),
        "connect" => Some(libc::SYS_connect),
        "sendto" => Some(libc::SYS_sendto),
        _ => None,
    }
}
