//! Functions and code objects.

use crate::tagged::{Address, Tagged};
use deoptmap::{DeoptInputData, DeoptOutputData, SafepointTable};
use std::sync::Arc;
use strum::Display;

index_vec::define_index_type! {
    /// A closure.
    pub struct FunctionIdx = u32;
}

index_vec::define_index_type! {
    pub struct SharedIdx = u32;
}

index_vec::define_index_type! {
    pub struct CodeIdx = u32;
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum CodeKind {
    /// Unoptimised code produced by the baseline compiler.
    Function,
    OptimizedFunction,
    Builtin,
}

/// A code object. Its instructions live at `[start, start + size)` in the isolate's code space.
#[derive(Debug)]
pub struct Code {
    pub(crate) name: String,
    pub(crate) kind: CodeKind,
    pub(crate) start: Address,
    pub(crate) instructions: Vec<u8>,
    pub(crate) deopt_input: Option<Arc<DeoptInputData<Tagged>>>,
    pub(crate) deopt_output: Option<DeoptOutputData>,
    pub(crate) safepoints: Option<Box<[u8]>>,
    /// The number of spill slots in frames of this code.
    pub(crate) stack_slots: u32,
    pub(crate) marked_for_deoptimization: bool,
    /// Cleared when the code is patched for deoptimisation: pc-relative metadata is stale from
    /// then on.
    pub(crate) relocation_valid: bool,
    /// Set when a deoptimised code object has been released.
    pub(crate) released: bool,
}

impl Code {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> usize {
        self.instructions.len()
    }

    pub fn end(&self) -> Address {
        self.start + self.instructions.len() as u64
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn instructions(&self) -> &[u8] {
        &self.instructions
    }

    pub fn deopt_input(&self) -> Option<&Arc<DeoptInputData<Tagged>>> {
        self.deopt_input.as_ref()
    }

    pub fn deopt_output(&self) -> Option<&DeoptOutputData> {
        self.deopt_output.as_ref()
    }

    /// The safepoint table of this code, if it has a well-formed one.
    pub fn safepoint_table(&self) -> Option<SafepointTable<'_>> {
        self.safepoints
            .as_deref()
            .and_then(|x| SafepointTable::parse(x).ok())
    }

    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    pub fn is_marked_for_deoptimization(&self) -> bool {
        self.marked_for_deoptimization
    }

    pub fn relocation_valid(&self) -> bool {
        self.relocation_valid
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Per-function data shared by all closures of that function.
#[derive(Debug)]
pub struct SharedFunctionInfo {
    pub(crate) name: String,
    pub(crate) formal_parameter_count: u32,
    /// The unoptimised code.
    pub(crate) code: CodeIdx,
}

impl SharedFunctionInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn formal_parameter_count(&self) -> u32 {
        self.formal_parameter_count
    }

    pub fn code(&self) -> CodeIdx {
        self.code
    }
}

#[derive(Debug)]
pub struct JSFunction {
    pub(crate) shared: SharedIdx,
    /// The code run when this closure is called: either the shared unoptimised code or
    /// optimised code.
    pub(crate) code: CodeIdx,
    pub(crate) context: Tagged,
    /// This closure as a heap value.
    pub(crate) tagged: Tagged,
}

impl JSFunction {
    pub fn shared(&self) -> SharedIdx {
        self.shared
    }

    pub fn code(&self) -> CodeIdx {
        self.code
    }

    pub fn context(&self) -> Tagged {
        self.context
    }

    pub fn tagged(&self) -> Tagged {
        self.tagged
    }
}

/// What a baseline compiler hands the runtime when it has compiled a function.
#[derive(Debug)]
pub struct UnoptimizedCodeDesc {
    pub instructions: Vec<u8>,
    pub deopt_output: DeoptOutputData,
}

/// What an optimising compiler hands the runtime when it has compiled a function.
#[derive(Debug)]
pub struct OptimizedCodeDesc {
    pub instructions: Vec<u8>,
    /// The bytes of a [TranslationBuffer](deoptmap::TranslationBuffer).
    pub translations: Box<[u8]>,
    pub literals: Vec<Tagged>,
    pub entries: Vec<deoptmap::DeoptEntry>,
    /// A serialised [SafepointTable].
    pub safepoints: Vec<u8>,
    pub stack_slots: u32,
    /// The AST id and pc offset of the OSR entry, for code compiled for on-stack replacement.
    pub osr: Option<(deoptmap::BailoutId, u32)>,
    pub inlined_function_count: u32,
}
