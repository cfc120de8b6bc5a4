//! Parser and applicator for the patch envelope consumed by the shell tool.
//!
//! A patch is a bracketed text blob (`*** Begin Patch` ... `*** End Patch`)
//! naming a sequence of add/update/delete operations against local files.
//! This crate only ever touches the filesystem through closures supplied by
//! the caller, so the engine crate can route every read/write through its
//! own sandboxing and writable-root checks.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod apply;
mod error;
mod heredoc;
mod parser;

pub use apply::{identify_files_added, identify_files_needed, process_patch};
pub use error::PatchError;
pub use heredoc::{find_embedded_patch, EmbeddedPatch};
pub use parser::{Hunk, HunkLine, Patch, PatchOp};

/// Parses a patch envelope (including its `*** Begin Patch` / `*** End
/// Patch` bracket lines) into a [`Patch`].
pub fn parse_patch(input: &str) -> Result<Patch, PatchError> {
    parser::parse_patch(input)
}
