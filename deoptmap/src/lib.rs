//! The side tables an optimising compiler emits so that its code can later be deoptimised.
//!
//! This crate is shared by the compiler, which writes these tables, and the runtime, which reads
//! them when an optimised activation has to be turned back into unoptimised frames. Nothing in
//! here knows about the runtime's object model: literals are a type parameter of
//! [DeoptInputData].

#![allow(clippy::new_without_default)]

pub mod data;
mod errors;
pub mod opcode;
pub mod safepoint;
pub mod translation;

pub use data::{BailoutId, DeoptEntry, DeoptInputData, DeoptOutputData, FullCodeState, PcAndState};
pub use errors::{SafepointError, TranslationError};
pub use opcode::{Opcode, SELF_LITERAL_ID};
pub use safepoint::{SafepointEntry, SafepointTable, SafepointTableBuilder};
pub use translation::{
    CommandIndex, Translation, TranslationBuffer, TranslationIterator, disassemble,
};
