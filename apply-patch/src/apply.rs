//! Applies a parsed [`Patch`] against a filesystem abstraction supplied by
//! the caller (three plain closures, so the engine crate can route reads and
//! writes through its own sandboxing/logging without this crate depending on
//! it).

use std::path::Path;

use similar::{ChangeTag, TextDiff};

use crate::error::PatchError;
use crate::parser::{Hunk, HunkLine, Patch, PatchOp};

/// Paths referenced by `Update`/`Delete` operations; the caller should verify
/// these exist before approving the patch.
pub fn identify_files_needed(patch: &Patch) -> Vec<&str> {
    patch
        .ops
        .iter()
        .filter_map(|op| match op {
            PatchOp::Update { path, .. } => Some(path.as_str()),
            PatchOp::Delete { path } => Some(path.as_str()),
            PatchOp::Add { .. } => None,
        })
        .collect()
}

/// Paths created by `Add` operations; the caller should verify these do not
/// already exist before approving the patch.
pub fn identify_files_added(patch: &Patch) -> Vec<&str> {
    patch
        .ops
        .iter()
        .filter_map(|op| match op {
            PatchOp::Add { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect()
}

/// Applies every operation in `patch`, in order, via the supplied closures.
///
/// `read_fn` returns the current content of a file; `write_fn` creates or
/// overwrites a file; `delete_fn` removes a file. None of the three see a
/// path twice with inconsistent semantics: `Add` only ever calls `write_fn`
/// for a path it has confirmed absent via `read_fn` returning `Ok(None)`.
///
/// Returns a human-readable `+N -M path` style summary of the whole patch.
/// There is no rollback: a failure partway through leaves prior operations
/// applied, by design (§ caller is expected to run inside a VCS checkout).
pub fn process_patch(
    patch: &Patch,
    mut read_fn: impl FnMut(&Path) -> std::io::Result<Option<String>>,
    mut write_fn: impl FnMut(&Path, &str) -> std::io::Result<()>,
    mut delete_fn: impl FnMut(&Path) -> std::io::Result<()>,
) -> Result<String, PatchError> {
    let mut summary_lines = Vec::with_capacity(patch.ops.len());

    for op in &patch.ops {
        match op {
            PatchOp::Add { path, content } => {
                let p = Path::new(path);
                if read_fn(p)?.is_some() {
                    return Err(PatchError::FileAlreadyExists(p.to_path_buf()));
                }
                let mut body = content.join("\n");
                if !body.is_empty() {
                    body.push('\n');
                }
                write_fn(p, &body)?;
                summary_lines.push(format!("A {path}"));
            }

            PatchOp::Delete { path } => {
                let p = Path::new(path);
                if read_fn(p)?.is_none() {
                    return Err(PatchError::FileNotFound(p.to_path_buf()));
                }
                delete_fn(p)?;
                summary_lines.push(format!("D {path}"));
            }

            PatchOp::Update {
                path,
                move_to,
                hunks,
            } => {
                let p = Path::new(path);
                let original = read_fn(p)?.ok_or_else(|| PatchError::FileNotFound(p.to_path_buf()))?;
                let mut lines: Vec<String> = original.lines().map(String::from).collect();

                for (hunk_index, hunk) in hunks.iter().enumerate() {
                    lines = apply_hunk(path, hunk_index, &lines, hunk)?;
                }

                let mut new_content = lines.join("\n");
                if !new_content.is_empty() {
                    new_content.push('\n');
                }

                let dest = move_to.as_deref().unwrap_or(path);
                write_fn(Path::new(dest), &new_content)?;
                if let Some(new_path) = move_to {
                    if new_path != path {
                        delete_fn(p)?;
                    }
                    summary_lines.push(format!(
                        "M {path} -> {new_path} ({})",
                        diff_summary(&original, &new_content)
                    ));
                } else {
                    summary_lines.push(format!("M {path} ({})", diff_summary(&original, &new_content)));
                }
            }
        }
    }

    Ok(summary_lines.join("\n"))
}

/// Renders a `+N -M` summary of the change between two full-file contents.
/// Display only; never consulted to drive the actual mutation.
fn diff_summary(before: &str, after: &str) -> String {
    let diff = TextDiff::from_lines(before, after);
    let mut inserted = 0usize;
    let mut removed = 0usize;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => inserted += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }
    format!("+{inserted} -{removed}")
}

/// Locates and applies a single hunk against `lines`, returning the new
/// line vector. Fails closed: zero or more-than-one candidate offset is an
/// error rather than a best-effort guess.
fn apply_hunk(
    path: &str,
    hunk_index: usize,
    lines: &[String],
    hunk: &Hunk,
) -> Result<Vec<String>, PatchError> {
    let expected: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|hl| match hl {
            HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
            HunkLine::Insert(_) => None,
        })
        .collect();

    let start = if expected.is_empty() {
        // Pure insertion with no anchor: prepend at the top of the file.
        0
    } else {
        let mut candidates = find_all_exact(lines, &expected);
        if !hunk.anchor.is_empty() {
            // Narrow to matches preceded by a line containing the anchor
            // text, when such matches exist; otherwise fall back to the
            // unfiltered set so an anchor that doesn't literally appear in
            // the file (e.g. a descriptive hint) doesn't spuriously fail.
            let anchored: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&pos| lines[..pos].iter().any(|l| l.contains(&hunk.anchor)))
                .collect();
            if !anchored.is_empty() {
                candidates = anchored;
            }
        }
        match candidates.len() {
            0 => {
                return Err(PatchError::ContextNotFound {
                    path: path.to_string(),
                    hunk_index,
                });
            }
            1 => candidates[0],
            n => {
                return Err(PatchError::AmbiguousContext {
                    path: path.to_string(),
                    hunk_index,
                    candidates: n,
                });
            }
        }
    };

    let mut result = Vec::with_capacity(lines.len());
    result.extend_from_slice(&lines[..start]);

    let mut cursor = start;
    for hl in &hunk.lines {
        match hl {
            HunkLine::Context(_) => {
                if cursor < lines.len() {
                    result.push(lines[cursor].clone());
                    cursor += 1;
                }
            }
            HunkLine::Remove(_) => {
                cursor += 1;
            }
            HunkLine::Insert(s) => {
                result.push(s.clone());
            }
        }
    }
    result.extend_from_slice(&lines[cursor..]);
    Ok(result)
}

/// All start offsets at which `expected` matches `lines` exactly.
fn find_all_exact(lines: &[String], expected: &[&str]) -> Vec<usize> {
    if expected.is_empty() || expected.len() > lines.len() {
        return Vec::new();
    }
    (0..=lines.len() - expected.len())
        .filter(|&start| {
            lines[start..start + expected.len()]
                .iter()
                .zip(expected.iter())
                .all(|(have, want)| have == want)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::parser::parse_patch;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn apply_against(
        patch_text: &str,
        initial: HashMap<&str, &str>,
    ) -> Result<(String, HashMap<String, String>), PatchError> {
        let patch = parse_patch(patch_text).expect("valid patch");
        let fs: RefCell<HashMap<String, String>> = RefCell::new(
            initial
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let summary = process_patch(
            &patch,
            |p| Ok(fs.borrow().get(p.to_str().unwrap()).cloned()),
            |p, content| {
                fs.borrow_mut()
                    .insert(p.to_str().unwrap().to_string(), content.to_string());
                Ok(())
            },
            |p| {
                fs.borrow_mut().remove(p.to_str().unwrap());
                Ok(())
            },
        )?;
        Ok((summary, fs.into_inner()))
    }

    #[test]
    fn add_file_rejects_existing() {
        let patch_text = "*** Begin Patch\n*** Add File: a.txt\n+hi\n*** End Patch";
        let err = apply_against(patch_text, HashMap::from([("a.txt", "existing")])).unwrap_err();
        assert!(matches!(err, PatchError::FileAlreadyExists(_)));
    }

    #[test]
    fn update_applies_single_hunk() {
        let patch_text = "*** Begin Patch\n*** Update File: a.txt\n@@\n context\n-old\n+new\n*** End Patch";
        let (_summary, fs) =
            apply_against(patch_text, HashMap::from([("a.txt", "context\nold\ntail")])).unwrap();
        assert_eq!(fs.get("a.txt").unwrap(), "context\nnew\ntail\n");
    }

    #[test]
    fn update_ambiguous_context_fails() {
        let patch_text = "*** Begin Patch\n*** Update File: a.txt\n@@\n dup\n-old\n+new\n*** End Patch";
        let err = apply_against(
            patch_text,
            HashMap::from([("a.txt", "dup\nold\nmid\ndup\nold\ntail")]),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::AmbiguousContext { .. }));
    }

    #[test]
    fn delete_rejects_missing() {
        let patch_text = "*** Begin Patch\n*** Delete File: missing.txt\n*** End Patch";
        let err = apply_against(patch_text, HashMap::new()).unwrap_err();
        assert!(matches!(err, PatchError::FileNotFound(_)));
    }

    #[test]
    fn add_then_delete_round_trips_to_the_original_snapshot() {
        let initial = HashMap::new();
        let add = "*** Begin Patch\n*** Add File: a.txt\n+hi\n*** End Patch";
        let (_summary, after_add) = apply_against(add, initial.clone()).unwrap();
        assert_eq!(after_add.get("a.txt").unwrap(), "hi\n");

        let delete = "*** Begin Patch\n*** Delete File: a.txt\n*** End Patch";
        let fs_after_add: HashMap<&str, &str> =
            after_add.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let (_summary, after_delete) = apply_against(delete, fs_after_add).unwrap();
        assert_eq!(after_delete, initial);
    }

    #[test]
    fn update_then_inverse_update_round_trips_to_the_original_content() {
        let forward = "*** Begin Patch\n*** Update File: a.txt\n@@\n context\n-old\n+new\n*** End Patch";
        let (_summary, after_forward) =
            apply_against(forward, HashMap::from([("a.txt", "context\nold\ntail")])).unwrap();
        assert_eq!(after_forward.get("a.txt").unwrap(), "context\nnew\ntail\n");

        let backward = "*** Begin Patch\n*** Update File: a.txt\n@@\n context\n-new\n+old\n*** End Patch";
        let fs_after_forward: HashMap<&str, &str> = after_forward
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (_summary, after_backward) = apply_against(backward, fs_after_forward).unwrap();
        assert_eq!(after_backward.get("a.txt").unwrap(), "context\nold\ntail\n");
    }
}
