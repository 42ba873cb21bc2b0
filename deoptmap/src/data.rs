//! Per-code deoptimisation tables.
//!
//! An optimised code object carries a [DeoptInputData]: the translation bytes for every bailout
//! point, the literal pool those translations refer to, and one [DeoptEntry] row per bailout. An
//! unoptimised code object carries a [DeoptOutputData] which tells the deoptimiser where, and in
//! which state, execution resumes for a given AST node.

use crate::{opcode::Opcode, translation::TranslationIterator};
use std::fmt;
use strum::{Display, FromRepr};

/// Identifies an AST node at which optimised code can bail out.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BailoutId(i64);

impl BailoutId {
    /// The node id written for frames that have no node of their own (e.g. stub frames).
    pub const NONE: BailoutId = BailoutId(-1);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for BailoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One bailout point in an optimised code object.
#[derive(Clone, Debug, PartialEq)]
pub struct DeoptEntry {
    pub ast_id: BailoutId,
    /// Byte index of this bailout's `BEGIN` in [DeoptInputData::translations].
    pub translation_index: usize,
    pub arguments_stack_height: u32,
    /// Offset of the lazy deoptimisation call site within the code's instructions, or `None` if
    /// this bailout can only be taken eagerly.
    pub pc_offset: Option<u32>,
}

/// The deoptimisation side table of an optimised code object. `L` is the runtime's
/// representation of a literal.
#[derive(Debug)]
pub struct DeoptInputData<L> {
    translations: Box<[u8]>,
    literals: Vec<L>,
    entries: Vec<DeoptEntry>,
    inlined_function_count: u32,
    osr_ast_id: BailoutId,
    osr_pc_offset: Option<u32>,
}

impl<L> DeoptInputData<L> {
    pub fn new(translations: Box<[u8]>, literals: Vec<L>, entries: Vec<DeoptEntry>) -> Self {
        Self {
            translations,
            literals,
            entries,
            inlined_function_count: 0,
            osr_ast_id: BailoutId::NONE,
            osr_pc_offset: None,
        }
    }

    /// Record that this code was compiled for on-stack replacement at `ast_id`, with the OSR
    /// entry point at `pc_offset`.
    pub fn with_osr(mut self, ast_id: BailoutId, pc_offset: u32) -> Self {
        self.osr_ast_id = ast_id;
        self.osr_pc_offset = Some(pc_offset);
        self
    }

    pub fn with_inlined_function_count(mut self, count: u32) -> Self {
        self.inlined_function_count = count;
        self
    }

    pub fn translations(&self) -> &[u8] {
        &self.translations
    }

    pub fn literals(&self) -> &[L] {
        &self.literals
    }

    pub fn literal(&self, idx: usize) -> Option<&L> {
        self.literals.get(idx)
    }

    pub fn deopt_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, idx: usize) -> Option<&DeoptEntry> {
        self.entries.get(idx)
    }

    pub fn entries(&self) -> &[DeoptEntry] {
        &self.entries
    }

    pub fn inlined_function_count(&self) -> u32 {
        self.inlined_function_count
    }

    pub fn osr_ast_id(&self) -> BailoutId {
        self.osr_ast_id
    }

    pub fn osr_pc_offset(&self) -> Option<u32> {
        self.osr_pc_offset
    }

    /// Return the index of the first entry for `ast_id`.
    pub fn lookup(&self, ast_id: BailoutId) -> Option<usize> {
        self.entries.iter().position(|e| e.ast_id == ast_id)
    }

    /// Return the index of the first entry for `ast_id` whose translation describes exactly one
    /// frame. Only such entries can be used for on-stack replacement.
    pub fn lookup_osr(&self, ast_id: BailoutId) -> Option<usize> {
        self.entries.iter().position(|e| {
            if e.ast_id != ast_id {
                return false;
            }
            let mut it = TranslationIterator::new(&self.translations, e.translation_index);
            it.next_opcode() == Opcode::Begin && it.next() == 1
        })
    }
}

/// What an unoptimised frame expects in registers when it resumes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FullCodeState {
    /// Nothing is live in registers.
    NoRegisters = 0,
    /// The top of the expression stack is live in the accumulator.
    TosReg = 1,
}

/// A pc offset and a [FullCodeState] packed as `pc << 1 | state`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PcAndState(u32);

impl PcAndState {
    pub fn new(pc_offset: u32, state: FullCodeState) -> Self {
        assert!(pc_offset < 1 << 31);
        Self((pc_offset << 1) | state as u32)
    }

    pub fn pc_offset(&self) -> u32 {
        self.0 >> 1
    }

    pub fn state(&self) -> FullCodeState {
        // A one bit field always decodes.
        FullCodeState::from_repr((self.0 & 1) as u8).unwrap_or(FullCodeState::NoRegisters)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// The deoptimisation side table of an unoptimised code object.
#[derive(Debug, Default)]
pub struct DeoptOutputData {
    entries: Vec<(BailoutId, PcAndState)>,
}

impl DeoptOutputData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ast_id: BailoutId, pc_offset: u32, state: FullCodeState) {
        self.entries
            .push((ast_id, PcAndState::new(pc_offset, state)));
    }

    pub fn pc_and_state(&self, ast_id: BailoutId) -> Option<PcAndState> {
        self.entries
            .iter()
            .find(|(id, _)| *id == ast_id)
            .map(|(_, x)| *x)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
