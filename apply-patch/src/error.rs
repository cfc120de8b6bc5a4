use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while parsing or applying a patch envelope.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("expected '*** Begin Patch', got: {0}")]
    MissingBeginMarker(String),

    #[error("patch missing '*** End Patch'")]
    MissingEndMarker,

    #[error("unexpected content after '*** End Patch'")]
    TrailingContent,

    #[error("expected operation or '*** End Patch', got: {0}")]
    UnexpectedLine(String),

    #[error("expected '+' prefixed line in Add File block, got: {0}")]
    InvalidAddLine(String),

    #[error(
        "unexpected line in hunk (expected ' ', '-', '+', or a control line): {0}"
    )]
    InvalidHunkLine(String),

    #[error("update file '{path}' has no hunks")]
    EmptyUpdate { path: String },

    #[error("hunk {hunk_index} in '{path}' has no lines")]
    EmptyHunk { path: String, hunk_index: usize },

    #[error("{path}: hunk {hunk_index} not found in file")]
    ContextNotFound { path: String, hunk_index: usize },

    #[error("{path}: hunk {hunk_index} matches {candidates} locations, refusing to guess")]
    AmbiguousContext {
        path: String,
        hunk_index: usize,
        candidates: usize,
    },

    #[error("cannot add file that already exists: {}", .0.display())]
    FileAlreadyExists(PathBuf),

    #[error("cannot update or delete file that does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
