//! Line-oriented parser for the `*** Begin Patch` / `*** End Patch` envelope.
//!
//! The envelope has a fixed, line-anchored grammar, so a hand-rolled state
//! machine is simpler and more precise than pulling in a general parser
//! generator for it. Each state owns exactly the fields it needs to build its
//! operation; transitions either consume the line or re-process it under the
//! new state (used at operation/hunk boundaries).

use crate::error::PatchError;

/// One line inside an update hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    /// Present in the file and kept unchanged.
    Context(String),
    /// Present in the file and removed.
    Remove(String),
    /// Not present in the file; inserted.
    Insert(String),
}

/// A contiguous region of changes inside an `Update` operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hunk {
    /// Text following the `@@` marker, used to anchor the search for this
    /// hunk's context within the file. May be empty.
    pub anchor: String,
    pub lines: Vec<HunkLine>,
}

/// One operation inside a patch, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    Add { path: String, content: Vec<String> },
    Delete { path: String },
    Update {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
    },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } => path,
            PatchOp::Delete { path } => path,
            PatchOp::Update { path, .. } => path,
        }
    }
}

/// A parsed patch: an ordered sequence of operations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

enum State {
    ExpectBegin,
    ExpectOperation,
    Adding {
        path: String,
        content: Vec<String>,
    },
    UpdateHeader {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
    },
    InHunk {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
        anchor: String,
        lines: Vec<HunkLine>,
    },
}

fn is_operation_boundary(line: &str) -> bool {
    line == "*** End Patch"
        || line.starts_with("*** Add File: ")
        || line.starts_with("*** Delete File: ")
        || line.starts_with("*** Update File: ")
}

/// `@@ hint` or `@@ hint @@`; bare `@@` yields an empty hint.
fn parse_hunk_anchor(line: &str) -> Option<&str> {
    let hint = line.strip_prefix("@@")?;
    let hint = hint.strip_prefix(' ').unwrap_or(hint);
    Some(hint.strip_suffix(" @@").unwrap_or(hint))
}

/// Parse a full patch envelope, including the `*** Begin Patch` /
/// `*** End Patch` bracket lines.
pub fn parse_patch(input: &str) -> Result<Patch, PatchError> {
    let lines: Vec<&str> = input.lines().collect();
    let mut state = State::ExpectBegin;
    let mut ops = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        let mut reprocess = false;

        state = match state {
            State::ExpectBegin => {
                if line.trim() == "*** Begin Patch" {
                    State::ExpectOperation
                } else {
                    return Err(PatchError::MissingBeginMarker(line.to_string()));
                }
            }

            State::ExpectOperation => {
                if line == "*** End Patch" {
                    if i + 1 != lines.len() {
                        return Err(PatchError::TrailingContent);
                    }
                    return Ok(Patch { ops });
                }
                if let Some(path) = line.strip_prefix("*** Add File: ") {
                    State::Adding {
                        path: path.to_string(),
                        content: Vec::new(),
                    }
                } else if let Some(path) = line.strip_prefix("*** Delete File: ") {
                    ops.push(PatchOp::Delete {
                        path: path.to_string(),
                    });
                    State::ExpectOperation
                } else if let Some(path) = line.strip_prefix("*** Update File: ") {
                    State::UpdateHeader {
                        path: path.to_string(),
                        move_to: None,
                        hunks: Vec::new(),
                    }
                } else {
                    return Err(PatchError::UnexpectedLine(line.to_string()));
                }
            }

            State::Adding { path, mut content } => {
                if let Some(rest) = line.strip_prefix('+') {
                    content.push(rest.to_string());
                    State::Adding { path, content }
                } else if is_operation_boundary(line) {
                    ops.push(PatchOp::Add { path, content });
                    reprocess = true;
                    State::ExpectOperation
                } else {
                    return Err(PatchError::InvalidAddLine(line.to_string()));
                }
            }

            State::UpdateHeader {
                path,
                mut move_to,
                hunks,
            } => {
                if let Some(dest) = line.strip_prefix("*** Move to: ") {
                    move_to = Some(dest.to_string());
                    State::UpdateHeader {
                        path,
                        move_to,
                        hunks,
                    }
                } else if let Some(anchor) = parse_hunk_anchor(line) {
                    State::InHunk {
                        path,
                        move_to,
                        hunks,
                        anchor: anchor.to_string(),
                        lines: Vec::new(),
                    }
                } else if is_operation_boundary(line) {
                    if hunks.is_empty() {
                        return Err(PatchError::EmptyUpdate { path });
                    }
                    ops.push(PatchOp::Update {
                        path,
                        move_to,
                        hunks,
                    });
                    reprocess = true;
                    State::ExpectOperation
                } else {
                    return Err(PatchError::UnexpectedLine(line.to_string()));
                }
            }

            State::InHunk {
                path,
                move_to,
                mut hunks,
                anchor,
                mut lines,
            } => {
                if let Some(rest) = line.strip_prefix(' ') {
                    lines.push(HunkLine::Context(rest.to_string()));
                    State::InHunk {
                        path,
                        move_to,
                        hunks,
                        anchor,
                        lines,
                    }
                } else if let Some(rest) = line.strip_prefix('-') {
                    lines.push(HunkLine::Remove(rest.to_string()));
                    State::InHunk {
                        path,
                        move_to,
                        hunks,
                        anchor,
                        lines,
                    }
                } else if let Some(rest) = line.strip_prefix('+') {
                    lines.push(HunkLine::Insert(rest.to_string()));
                    State::InHunk {
                        path,
                        move_to,
                        hunks,
                        anchor,
                        lines,
                    }
                } else if line == "*** End of File" {
                    if lines.is_empty() {
                        return Err(PatchError::EmptyHunk {
                            path,
                            hunk_index: hunks.len(),
                        });
                    }
                    hunks.push(Hunk { anchor, lines });
                    State::UpdateHeader {
                        path,
                        move_to,
                        hunks,
                    }
                } else if let Some(next_anchor) = parse_hunk_anchor(line) {
                    if lines.is_empty() {
                        return Err(PatchError::EmptyHunk {
                            path,
                            hunk_index: hunks.len(),
                        });
                    }
                    hunks.push(Hunk { anchor, lines });
                    State::InHunk {
                        path,
                        move_to,
                        hunks,
                        anchor: next_anchor.to_string(),
                        lines: Vec::new(),
                    }
                } else if is_operation_boundary(line) {
                    if lines.is_empty() {
                        return Err(PatchError::EmptyHunk {
                            path,
                            hunk_index: hunks.len(),
                        });
                    }
                    hunks.push(Hunk { anchor, lines });
                    ops.push(PatchOp::Update {
                        path,
                        move_to,
                        hunks,
                    });
                    reprocess = true;
                    State::ExpectOperation
                } else if line.is_empty() {
                    lines.push(HunkLine::Context(String::new()));
                    State::InHunk {
                        path,
                        move_to,
                        hunks,
                        anchor,
                        lines,
                    }
                } else {
                    return Err(PatchError::InvalidHunkLine(line.to_string()));
                }
            }
        };

        if !reprocess {
            i += 1;
        }
    }

    match state {
        State::ExpectBegin => Err(PatchError::MissingBeginMarker(String::new())),
        State::ExpectOperation | State::Adding { .. } | State::InHunk { .. } => {
            Err(PatchError::MissingEndMarker)
        }
        State::UpdateHeader { path, hunks, .. } => {
            if hunks.is_empty() {
                Err(PatchError::EmptyUpdate { path })
            } else {
                Err(PatchError::MissingEndMarker)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_add_update_delete() {
        let input = "\
*** Begin Patch
*** Add File: a.txt
+hello
+world
*** Update File: b.txt
@@ fn main
 unchanged
-old
+new
*** Delete File: c.txt
*** End Patch";
        let patch = parse_patch(input).expect("parses");
        assert_eq!(patch.ops.len(), 3);
        match &patch.ops[0] {
            PatchOp::Add { path, content } => {
                assert_eq!(path, "a.txt");
                assert_eq!(content, &vec!["hello".to_string(), "world".to_string()]);
            }
            other => panic!("unexpected op: {other:?}"),
        }
        match &patch.ops[1] {
            PatchOp::Update { path, hunks, .. } => {
                assert_eq!(path, "b.txt");
                assert_eq!(hunks.len(), 1);
                assert_eq!(hunks[0].anchor, "fn main");
                assert_eq!(hunks[0].lines.len(), 3);
            }
            other => panic!("unexpected op: {other:?}"),
        }
        match &patch.ops[2] {
            PatchOp::Delete { path } => assert_eq!(path, "c.txt"),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_begin() {
        let err = parse_patch("*** Add File: a.txt\n+x\n*** End Patch").unwrap_err();
        assert!(matches!(err, PatchError::MissingBeginMarker(_)));
    }

    #[test]
    fn rejects_missing_end() {
        let err = parse_patch("*** Begin Patch\n*** Add File: a.txt\n+x").unwrap_err();
        assert!(matches!(err, PatchError::MissingEndMarker));
    }

    #[test]
    fn supports_move_to() {
        let input = "\
*** Begin Patch
*** Update File: old.txt
*** Move to: new.txt
@@
 line
-old
+new
*** End Patch";
        let patch = parse_patch(input).expect("parses");
        match &patch.ops[0] {
            PatchOp::Update { move_to, .. } => {
                assert_eq!(move_to.as_deref(), Some("new.txt"));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }
}
