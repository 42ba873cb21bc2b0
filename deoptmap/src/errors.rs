use thiserror::Error;

/// Errors raised while a compiler is writing a translation.
#[derive(Debug, Error, PartialEq)]
pub enum TranslationError {
    /// The buffer would grow past its ceiling. Compilers treat this as an out-of-memory
    /// condition.
    #[error("translation buffer exceeded its limit of {limit} bytes")]
    ResourceExhausted { limit: usize },
    /// An operand cannot be represented by the runtime.
    #[error("invalid operand for {opcode}: {operand}")]
    InvalidOperand { opcode: String, operand: i64 },
}

/// Errors raised when parsing a safepoint table.
#[derive(Debug, Error, PartialEq)]
pub enum SafepointError {
    #[error("safepoint table truncated: needed {needed} bytes, found {found}")]
    Truncated { needed: usize, found: usize },
    #[error("safepoint table entries are not sorted by pc offset at entry {0}")]
    Unsorted(usize),
}
