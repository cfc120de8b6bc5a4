//! The read-only allowlist: a closed set of command verbs and parameter
//! shapes the safety classifier accepts without asking the user, per
//! § Safety Classifier step 2.

/// `N,Mp` or `Np` where N and (optional) M are digit runs, per
/// `/^(\d+,)?\d+p$/`.
fn is_valid_sed_n_arg(arg: &str) -> bool {
    let Some(body) = arg.strip_suffix('p') else {
        return false;
    };
    if body.is_empty() {
        return false;
    }
    match body.split_once(',') {
        Some((start, end)) => {
            !start.is_empty()
                && !end.is_empty()
                && start.chars().all(|c| c.is_ascii_digit())
                && end.chars().all(|c| c.is_ascii_digit())
        }
        None => body.chars().all(|c| c.is_ascii_digit()),
    }
}

/// Human-readable classification group used in the auto-approve reason.
pub fn group_for(command: &[String]) -> Option<&'static str> {
    if is_known_safe_command(command) {
        Some(classify_group(command))
    } else {
        None
    }
}

fn classify_group(command: &[String]) -> &'static str {
    match command.first().map(String::as_str) {
        Some("cd") | Some("ls") | Some("pwd") | Some("find") => "Searching",
        Some("cat") | Some("head") | Some("tail") | Some("wc") => "Reading",
        Some("rg") | Some("grep") => "Searching",
        Some("git") => "Inspecting",
        Some("cargo") => "Checking",
        Some("sed") => "Reading",
        _ => "Running",
    }
}

/// Returns true iff `command` matches one of the fixed, read-only shapes
/// the classifier accepts without asking the user.
pub fn is_known_safe_command(command: &[String]) -> bool {
    let argv: Vec<&str> = command.iter().map(String::as_str).collect();
    match argv.as_slice() {
        ["cd", ..] | ["ls", ..] | ["pwd"] | ["true"] | ["echo", ..] | ["cat", ..] | ["rg", ..]
        | ["find", ..] | ["grep", ..] | ["head", ..] | ["tail", ..] | ["wc", ..]
        | ["which", ..] => true,

        ["git", "status", ..]
        | ["git", "branch", ..]
        | ["git", "log", ..]
        | ["git", "diff", ..]
        | ["git", "show", ..] => true,

        ["cargo", "check", ..] => true,

        ["sed", "-n", arg, _file] => is_valid_sed_n_arg(arg),

        _ => false,
    }
}
