use deoptmap::{SafepointError, TranslationError};
use thiserror::Error;

/// Errors the runtime reports to its embedder. Failures inside a deoptimisation episode are never
/// reported this way: they are either absorbed (a failed OSR translation) or fatal.
#[derive(Debug, Error)]
pub enum DeoptError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("code generation failed: {0}")]
    CodeGeneration(String),
    /// A lazy deoptimisation site does not leave room for the call that will be patched over it.
    #[error("lazy deoptimisation site at offset {pc_offset} has {available} bytes, needs {needed}")]
    PatchTooLarge {
        pc_offset: u32,
        available: usize,
        needed: usize,
    },
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Safepoint(#[from] SafepointError),
}

/// Abort the process because deoptimisation metadata or runtime state is inconsistent. Nothing can
/// be done to recover from this: the compiler and runtime disagree about the shape of a frame.
macro_rules! fatal {
    ($($arg:tt)*) => {
        panic!("fatal deoptimisation error: {}", format_args!($($arg)*))
    };
}

/// As [fatal], but first record the message in `$log` at `Error` level.
macro_rules! fatal_logged {
    ($log:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $log.log($crate::log::Verbosity::Error, &msg);
        panic!("fatal deoptimisation error: {msg}")
    }};
}

pub(crate) use {fatal, fatal_logged};
