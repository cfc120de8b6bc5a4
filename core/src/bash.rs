//! `tree-sitter-bash` walk recognizing "safe shell composition": a sequence
//! of plain commands joined only by the safe-operator set `{&&, ||, |, ;}`,
//! with no redirection, subshells, substitutions, or control-flow
//! constructs. Unknown node kinds fail closed (treated as unsafe) rather
//! than being allowed through, per § Shell-AST safety.

use tree_sitter::Node;
use tree_sitter::Parser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BashParseError {
    /// The script does not parse as valid bash at all.
    SyntaxError,
    /// The script parses, but contains a construct this walk refuses to
    /// call safe (redirection, subshell, substitution, control flow, ...).
    UnsafeConstruct(String),
}

/// Parses `script` and, if every statement is a plain command and every
/// connector between them is in the safe-operator set, returns the argv of
/// each command segment in left-to-right order.
pub fn try_parse_safe_segments(script: &str) -> Result<Vec<Vec<String>>, BashParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .map_err(|e| BashParseError::UnsafeConstruct(format!("grammar load failed: {e}")))?;

    let tree = parser
        .parse(script, None)
        .ok_or(BashParseError::SyntaxError)?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(BashParseError::SyntaxError);
    }

    let mut segments = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        if child.kind() == "comment" {
            continue;
        }
        collect_segments(child, script, &mut segments)?;
    }
    Ok(segments)
}

/// Recursively validates a statement node, appending each plain-command
/// segment's argv to `segments` in left-to-right order.
fn collect_segments(
    node: Node,
    src: &str,
    segments: &mut Vec<Vec<String>>,
) -> Result<(), BashParseError> {
    match node.kind() {
        "command" => {
            segments.push(command_argv(node, src)?);
            Ok(())
        }
        "pipeline" | "list" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.is_extra() {
                    continue;
                }
                if !child.is_named() {
                    // Anonymous token: must be one of the safe operators.
                    let text = child.utf8_text(src.as_bytes()).unwrap_or_default();
                    if !matches!(text, "&&" | "||" | "|" | ";" | "\n") {
                        return Err(BashParseError::UnsafeConstruct(format!(
                            "disallowed operator token: {text:?}"
                        )));
                    }
                    continue;
                }
                collect_segments(child, src, segments)?;
            }
            Ok(())
        }
        other => Err(BashParseError::UnsafeConstruct(format!(
            "disallowed construct: {other}"
        ))),
    }
}

/// Extracts the argv of a `command` node, rejecting any redirection,
/// substitution, or expansion child.
fn command_argv(node: Node, src: &str) -> Result<Vec<String>, BashParseError> {
    let mut argv = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "command_name" | "word" | "string" | "raw_string" | "number" | "concatenation" => {
                let text = child
                    .utf8_text(src.as_bytes())
                    .map_err(|_| BashParseError::UnsafeConstruct("invalid utf8".to_string()))?;
                argv.push(strip_quotes(text));
            }
            other => {
                return Err(BashParseError::UnsafeConstruct(format!(
                    "disallowed token in command: {other}"
                )));
            }
        }
    }
    if argv.is_empty() {
        return Err(BashParseError::UnsafeConstruct(
            "command with no words".to_string(),
        ));
    }
    Ok(argv)
}

fn strip_quotes(text: &str) -> String {
    if (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
        || (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2)
    {
        text[1..text.len() - 1].to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn parses_single_command() {
        let segs = try_parse_safe_segments("ls -la /tmp").expect("parses");
        assert_eq!(segs, vec![vec!["ls", "-la", "/tmp"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()]);
    }

    #[test]
    fn accepts_pipe_composition() {
        let segs = try_parse_safe_segments("ls -la | grep foo").expect("parses");
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0][0], "ls");
        assert_eq!(segs[1][0], "grep");
    }

    #[test]
    fn accepts_and_and_composition() {
        let segs = try_parse_safe_segments("cd /tmp && ls").expect("parses");
        assert_eq!(segs.len(), 2);
    }

    #[test]
    fn rejects_redirection() {
        let err = try_parse_safe_segments("ls > /tmp/out").unwrap_err();
        assert!(matches!(err, BashParseError::UnsafeConstruct(_)));
    }

    #[test]
    fn rejects_subshell() {
        let err = try_parse_safe_segments("(ls)").unwrap_err();
        assert!(matches!(err, BashParseError::UnsafeConstruct(_)));
    }

    #[test]
    fn rejects_command_substitution() {
        let err = try_parse_safe_segments("echo $(ls)").unwrap_err();
        assert!(matches!(err, BashParseError::UnsafeConstruct(_)));
    }

    #[test]
    fn reparsing_a_safe_script_yields_the_same_classification() {
        let script = "cd /tmp && ls -la | grep foo";
        let first = try_parse_safe_segments(script);
        let second = try_parse_safe_segments(script);
        assert_eq!(first, second);
        assert!(first.is_ok());
    }

    #[test]
    fn reparsing_an_unsafe_script_yields_the_same_classification() {
        let script = "ls > /tmp/out";
        let first = try_parse_safe_segments(script);
        let second = try_parse_safe_segments(script);
        assert_eq!(first, second);
        assert!(first.is_err());
    }
}
