//! Recognizes a patch handed to the shell tool as `apply_patch <<EOF ... EOF`
//! (or the `applypatch` spelling) embedded inside a `bash -lc` script, so the
//! safety classifier can route it through the patch-safety path instead of
//! the general shell-composition path.
//!
//! This is a plain textual scan, not a grammar walk: the heredoc forms we
//! need to recognize are a handful of fixed shapes, and scanning for them
//! directly is both simpler and more predictable than coaxing a shell parser
//! into exposing heredoc bodies. Per spec, only a single heredoc is
//! recognized per script; anything more exotic falls through to ask-user.

/// An `apply_patch`/`applypatch` heredoc found inside a shell script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedPatch {
    /// The heredoc body, i.e. the patch envelope text.
    pub patch_body: String,
    /// An optional `cd <path> &&` immediately preceding the command.
    pub cd_path: Option<String>,
    /// Byte range in the original script covered by the whole statement
    /// (including any leading `cd ... &&`), for callers that want to excise
    /// it.
    pub stmt_byte_range: (usize, usize),
}

const CMD_NAMES: [&str; 2] = ["apply_patch", "applypatch"];

/// Scans `script` for the first `apply_patch <<DELIM ... DELIM` (or
/// `applypatch` spelling) statement. Returns `None` on any syntax this
/// lightweight scanner doesn't recognize, rather than failing — callers
/// treat `None` the same as "not a patch heredoc".
pub fn find_embedded_patch(script: &str) -> Option<EmbeddedPatch> {
    let mut i = 0usize;
    while i < script.len() {
        let (start, cmd_len) = find_next_command_token(script, i)?;

        if !token_boundary_ok(script, start, cmd_len) {
            i = start + cmd_len;
            continue;
        }

        let rest = &script[start + cmd_len..];
        let Some((delim, after_delim_idx)) = parse_heredoc_operator(rest) else {
            i = start + cmd_len;
            continue;
        };
        if delim.is_empty() {
            i = start + cmd_len;
            continue;
        }

        let header_rest = &rest[after_delim_idx..];
        let Some(nl_rel) = header_rest.find('\n') else {
            return None;
        };
        let header_end = start + cmd_len + after_delim_idx + nl_rel + 1;

        let Some(body_end) = find_terminator(script, header_end, delim) else {
            i = start + cmd_len;
            continue;
        };

        let (stmt_begin, cd_path) = find_preceding_cd(script, start);
        let patch_body = script[header_end..body_end]
            .trim_end_matches('\n')
            .to_string();
        return Some(EmbeddedPatch {
            patch_body,
            cd_path,
            stmt_byte_range: (stmt_begin, body_end),
        });
    }
    None
}

fn find_next_command_token(script: &str, from: usize) -> Option<(usize, usize)> {
    if from >= script.len() {
        return None;
    }
    let candidates = CMD_NAMES.iter().filter_map(|name| {
        script[from..]
            .find(name)
            .map(|rel| (from + rel, name.len()))
    });
    candidates.min_by_key(|&(pos, _)| pos)
}

fn token_boundary_ok(script: &str, start: usize, cmd_len: usize) -> bool {
    let before_ok = start == 0
        || script[..start]
            .chars()
            .next_back()
            .map(|c| c.is_whitespace() || ";|&".contains(c))
            .unwrap_or(true);
    let after_ok = script[start..]
        .chars()
        .nth(cmd_len)
        .map(|c| c.is_whitespace() || c == '<')
        .unwrap_or(false);
    before_ok && after_ok
}

/// Parses `<<DELIM` (optionally single- or double-quoted, with surrounding
/// whitespace) at the start of `rest`. Returns the delimiter text and the
/// offset just past it.
fn parse_heredoc_operator(rest: &str) -> Option<(&str, usize)> {
    let mut j = 0usize;
    let bytes = rest.as_bytes();
    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
        j += 1;
    }
    if rest[j..].get(..2)? != "<<" {
        return None;
    }
    j += 2;
    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
        j += 1;
    }
    if j >= rest.len() {
        return None;
    }
    match bytes[j] {
        b'\'' => {
            let end = rest[j + 1..].find('\'').map(|p| j + 1 + p)?;
            Some((&rest[j + 1..end], end + 1))
        }
        b'"' => {
            let end = rest[j + 1..].find('"').map(|p| j + 1 + p)?;
            Some((&rest[j + 1..end], end + 1))
        }
        _ => {
            let mut k = j;
            while k < rest.len() && !rest.as_bytes()[k].is_ascii_whitespace() {
                k += 1;
            }
            Some((&rest[j..k], k))
        }
    }
}

fn find_terminator(script: &str, from: usize, delim: &str) -> Option<usize> {
    let mut scan = from;
    while scan < script.len() {
        if let Some(nl) = script[scan..].find('\n') {
            let line = &script[scan..scan + nl];
            if line == delim {
                return Some(scan + nl + 1);
            }
            scan += nl + 1;
        } else {
            let line = &script[scan..];
            return if line == delim { Some(script.len()) } else { None };
        }
    }
    None
}

/// Looks for a `cd <path> &&` immediately preceding `cmd_start` on the same
/// logical line; if present, returns the path and the widened statement
/// start (covering the `cd ... &&`).
fn find_preceding_cd(script: &str, cmd_start: usize) -> (usize, Option<String>) {
    let line_start = script[..cmd_start].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let before = script[line_start..cmd_start].trim_end();

    let Some(and_and_pos) = before.rfind("&&") else {
        return (cmd_start, None);
    };
    if !before[and_and_pos + 2..].trim().is_empty() {
        return (cmd_start, None);
    }
    let left = before[..and_and_pos].trim_end();
    let Some(arg) = left.strip_prefix("cd ") else {
        return (cmd_start, None);
    };
    let arg = arg.trim();
    let path = if (arg.starts_with('\'') && arg.ends_with('\'') && arg.len() >= 2)
        || (arg.starts_with('"') && arg.ends_with('"') && arg.len() >= 2)
    {
        arg[1..arg.len() - 1].to_string()
    } else {
        let end = arg.find(char::is_whitespace).unwrap_or(arg.len());
        arg[..end].to_string()
    };
    let stmt_begin = line_start + left.find("cd ").unwrap_or(0);
    (stmt_begin, Some(path))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn finds_bare_delimiter_heredoc() {
        let script = "apply_patch <<EOF\n*** Begin Patch\n*** End Patch\nEOF\n";
        let found = find_embedded_patch(script).expect("found");
        assert_eq!(found.patch_body, "*** Begin Patch\n*** End Patch");
        assert_eq!(found.cd_path, None);
    }

    #[test]
    fn finds_quoted_delimiter_with_leading_cd() {
        let script = "cd /tmp/work && apply_patch <<'PATCH'\nbody line\nPATCH\n";
        let found = find_embedded_patch(script).expect("found");
        assert_eq!(found.patch_body, "body line");
        assert_eq!(found.cd_path.as_deref(), Some("/tmp/work"));
    }

    #[test]
    fn ignores_script_without_heredoc() {
        assert_eq!(find_embedded_patch("ls -la | grep foo"), None);
    }

    #[test]
    fn ignores_unterminated_heredoc() {
        assert_eq!(find_embedded_patch("apply_patch <<EOF\nno terminator here"), None);
    }
}
