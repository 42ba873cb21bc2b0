//! Writing and reading translations.
//!
//! A translation is a sequence of signed LEB128 integers. Each command is an [Opcode] followed by
//! its operands. A translation always starts with `BEGIN(frame_count, js_frame_count)` and then
//! describes each output frame in turn, outermost first: a frame command followed by one value
//! command per slot of that frame. Many translations share one [TranslationBuffer]; a
//! translation is identified by the byte index of its `BEGIN`.

use crate::{data::BailoutId, errors::TranslationError, opcode::Opcode};
use std::fmt::Write;

/// The default ceiling on the size of a [TranslationBuffer].
pub const DEFAULT_TRANSLATION_LIMIT: usize = 64 * 1024 * 1024;
/// The number of general purpose registers a translation can name.
pub const NUM_REGISTERS: i64 = 16;
/// The number of floating point registers a translation can name.
pub const NUM_DOUBLE_REGISTERS: i64 = 16;
/// Stack slot offsets must be multiples of this.
pub const SLOT_SIZE: i64 = 8;

/// An append-only buffer of translations.
#[derive(Debug)]
pub struct TranslationBuffer {
    contents: Vec<u8>,
    limit: usize,
}

impl TranslationBuffer {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_TRANSLATION_LIMIT)
    }

    /// Create a buffer which refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            contents: Vec::new(),
            limit,
        }
    }

    /// The index the next translation written will start at.
    pub fn current_index(&self) -> usize {
        self.contents.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.contents
    }

    /// Finish writing and hand the bytes over to the code object they describe.
    pub fn into_bytes(self) -> Box<[u8]> {
        self.contents.into_boxed_slice()
    }

    fn add(&mut self, v: i64) -> Result<(), TranslationError> {
        let start = self.contents.len();
        let limit = self.limit;
        leb128::write::signed(&mut self.contents, v)
            .map_err(|_| TranslationError::ResourceExhausted { limit })?;
        if self.contents.len() > limit {
            self.contents.truncate(start);
            return Err(TranslationError::ResourceExhausted { limit });
        }
        Ok(())
    }
}

impl Default for TranslationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The index of a value command within one translation, counting from 0. [Opcode::Duplicate]
/// refers back to earlier commands by this index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct CommandIndex(pub u32);

/// Writes one translation into a [TranslationBuffer].
pub struct Translation<'a> {
    buffer: &'a mut TranslationBuffer,
    index: usize,
    value_commands: u32,
}

impl<'a> Translation<'a> {
    /// Start a new translation describing `frame_count` frames, `js_frame_count` of which are
    /// JavaScript frames.
    pub fn new(
        buffer: &'a mut TranslationBuffer,
        frame_count: usize,
        js_frame_count: usize,
    ) -> Result<Self, TranslationError> {
        let index = buffer.current_index();
        let mut t = Self {
            buffer,
            index,
            value_commands: 0,
        };
        t.command(Opcode::Begin, &[to_i64(frame_count), to_i64(js_frame_count)])?;
        Ok(t)
    }

    /// The index of this translation's `BEGIN` in the buffer.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn begin_js_frame(
        &mut self,
        node_id: BailoutId,
        literal_id: i64,
        height: u32,
    ) -> Result<(), TranslationError> {
        self.command(
            Opcode::JsFrame,
            &[node_id.as_i64(), literal_id, i64::from(height)],
        )
    }

    pub fn begin_construct_stub_frame(
        &mut self,
        literal_id: i64,
        height: u32,
    ) -> Result<(), TranslationError> {
        self.command(
            Opcode::ConstructStubFrame,
            &[BailoutId::NONE.as_i64(), literal_id, i64::from(height)],
        )
    }

    pub fn begin_arguments_adaptor_frame(
        &mut self,
        literal_id: i64,
        height: u32,
    ) -> Result<(), TranslationError> {
        self.command(
            Opcode::ArgumentsAdaptorFrame,
            &[BailoutId::NONE.as_i64(), literal_id, i64::from(height)],
        )
    }

    /// Accessor stub frames have no height: everything they need is in registers or in the
    /// fixed part of the frame.
    pub fn begin_getter_stub_frame(&mut self, literal_id: i64) -> Result<(), TranslationError> {
        self.command(
            Opcode::GetterStubFrame,
            &[BailoutId::NONE.as_i64(), literal_id, 0],
        )
    }

    pub fn begin_setter_stub_frame(&mut self, literal_id: i64) -> Result<(), TranslationError> {
        self.command(
            Opcode::SetterStubFrame,
            &[BailoutId::NONE.as_i64(), literal_id, 0],
        )
    }

    pub fn store_register(&mut self, reg: u8) -> Result<CommandIndex, TranslationError> {
        self.register_command(Opcode::Register, reg, NUM_REGISTERS)
    }

    pub fn store_int32_register(&mut self, reg: u8) -> Result<CommandIndex, TranslationError> {
        self.register_command(Opcode::Int32Register, reg, NUM_REGISTERS)
    }

    pub fn store_uint32_register(&mut self, reg: u8) -> Result<CommandIndex, TranslationError> {
        self.register_command(Opcode::Uint32Register, reg, NUM_REGISTERS)
    }

    pub fn store_double_register(&mut self, reg: u8) -> Result<CommandIndex, TranslationError> {
        self.register_command(Opcode::DoubleRegister, reg, NUM_DOUBLE_REGISTERS)
    }

    pub fn store_stack_slot(&mut self, offset: u32) -> Result<CommandIndex, TranslationError> {
        self.slot_command(Opcode::StackSlot, offset)
    }

    pub fn store_int32_stack_slot(
        &mut self,
        offset: u32,
    ) -> Result<CommandIndex, TranslationError> {
        self.slot_command(Opcode::Int32StackSlot, offset)
    }

    pub fn store_uint32_stack_slot(
        &mut self,
        offset: u32,
    ) -> Result<CommandIndex, TranslationError> {
        self.slot_command(Opcode::Uint32StackSlot, offset)
    }

    pub fn store_double_stack_slot(
        &mut self,
        offset: u32,
    ) -> Result<CommandIndex, TranslationError> {
        self.slot_command(Opcode::DoubleStackSlot, offset)
    }

    pub fn store_literal(&mut self, literal_id: u32) -> Result<CommandIndex, TranslationError> {
        self.value_command(Opcode::Literal, &[i64::from(literal_id)])
    }

    pub fn store_arguments_object(&mut self) -> Result<CommandIndex, TranslationError> {
        self.value_command(Opcode::ArgumentsObject, &[])
    }

    /// Store a value identical to the one produced by the earlier value command `of`.
    pub fn store_duplicate(&mut self, of: CommandIndex) -> Result<CommandIndex, TranslationError> {
        if of.0 >= self.value_commands {
            return Err(TranslationError::InvalidOperand {
                opcode: Opcode::Duplicate.to_string(),
                operand: i64::from(of.0),
            });
        }
        self.value_command(Opcode::Duplicate, &[i64::from(of.0)])
    }

    fn register_command(
        &mut self,
        opcode: Opcode,
        reg: u8,
        limit: i64,
    ) -> Result<CommandIndex, TranslationError> {
        if i64::from(reg) >= limit {
            return Err(TranslationError::InvalidOperand {
                opcode: opcode.to_string(),
                operand: i64::from(reg),
            });
        }
        self.value_command(opcode, &[i64::from(reg)])
    }

    fn slot_command(&mut self, opcode: Opcode, offset: u32) -> Result<CommandIndex, TranslationError> {
        if i64::from(offset) % SLOT_SIZE != 0 {
            return Err(TranslationError::InvalidOperand {
                opcode: opcode.to_string(),
                operand: i64::from(offset),
            });
        }
        self.value_command(opcode, &[i64::from(offset)])
    }

    fn value_command(
        &mut self,
        opcode: Opcode,
        operands: &[i64],
    ) -> Result<CommandIndex, TranslationError> {
        self.command(opcode, operands)?;
        let idx = CommandIndex(self.value_commands);
        self.value_commands += 1;
        Ok(idx)
    }

    fn command(&mut self, opcode: Opcode, operands: &[i64]) -> Result<(), TranslationError> {
        debug_assert_eq!(opcode.operand_count(), operands.len());
        self.buffer.add(opcode as i64)?;
        for x in operands {
            self.buffer.add(*x)?;
        }
        Ok(())
    }
}

fn to_i64(x: usize) -> i64 {
    i64::try_from(x).unwrap_or(i64::MAX)
}

/// A cursor over the integers of a translation.
///
/// Callers always know how many values they are entitled to read from the frame commands they
/// have already decoded, so running off the end of the buffer, or finding something other than an
/// opcode where one is expected, means the metadata is corrupt and is fatal.
#[derive(Clone, Debug)]
pub struct TranslationIterator<'a> {
    buffer: &'a [u8],
    index: usize,
}

impl<'a> TranslationIterator<'a> {
    pub fn new(buffer: &'a [u8], index: usize) -> Self {
        assert!(
            index < buffer.len(),
            "translation index {index} outside buffer of {} bytes",
            buffer.len()
        );
        Self { buffer, index }
    }

    /// Decode the next integer.
    ///
    /// # Panics
    ///
    /// If the buffer is exhausted or holds a malformed integer.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> i64 {
        let mut rest = &self.buffer[self.index..];
        let before = rest.len();
        match leb128::read::signed(&mut rest) {
            Ok(v) => {
                self.index += before - rest.len();
                v
            }
            Err(e) => panic!(
                "translation stream overrun at byte {} of {}: {e}",
                self.index,
                self.buffer.len()
            ),
        }
    }

    /// Decode the next integer as an [Opcode].
    ///
    /// # Panics
    ///
    /// If the next integer is not an opcode.
    pub fn next_opcode(&mut self) -> Opcode {
        let at = self.index;
        let v = self.next();
        Opcode::from_i64(v).unwrap_or_else(|| panic!("invalid translation opcode {v} at byte {at}"))
    }

    /// Decode the next integer, which must be non-negative.
    pub fn next_usize(&mut self) -> usize {
        let at = self.index;
        let v = self.next();
        usize::try_from(v)
            .unwrap_or_else(|_| panic!("negative translation operand {v} at byte {at}"))
    }

    pub fn has_next(&self) -> bool {
        self.index < self.buffer.len()
    }

    /// Discard the next `n` integers.
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            self.next();
        }
    }

    /// The byte index of the next integer.
    pub fn index(&self) -> usize {
        self.index
    }
}

fn operand_names(opcode: Opcode) -> &'static [&'static str] {
    match opcode {
        Opcode::Begin => &["frame_count", "js_frame_count"],
        Opcode::JsFrame
        | Opcode::ConstructStubFrame
        | Opcode::GetterStubFrame
        | Opcode::SetterStubFrame
        | Opcode::ArgumentsAdaptorFrame => &["node_id", "literal_id", "height"],
        Opcode::Register
        | Opcode::Int32Register
        | Opcode::Uint32Register
        | Opcode::DoubleRegister => &["reg"],
        Opcode::StackSlot
        | Opcode::Int32StackSlot
        | Opcode::Uint32StackSlot
        | Opcode::DoubleStackSlot => &["offset"],
        Opcode::Literal => &["literal"],
        Opcode::ArgumentsObject => &[],
        Opcode::Duplicate => &["command"],
    }
}

/// Render the translation starting at `index` in a human readable form. Frame commands are
/// indented once and value commands twice, prefixed with their [CommandIndex].
pub fn disassemble(buffer: &[u8], index: usize) -> String {
    let mut it = TranslationIterator::new(buffer, index);
    let mut out = String::new();
    let mut value_commands = 0;
    let mut first = true;
    while it.has_next() {
        let opcode = it.next_opcode();
        if opcode == Opcode::Begin && !first {
            break;
        }
        first = false;
        let names = operand_names(opcode);
        let operands = names
            .iter()
            .map(|name| {
                let v = it.next();
                if *name == "literal_id" && v == crate::opcode::SELF_LITERAL_ID {
                    format!("{name}=self")
                } else {
                    format!("{name}={v}")
                }
            })
            .collect::<Vec<_>>();
        let operands = if operands.is_empty() {
            String::new()
        } else {
            format!(" {{{}}}", operands.join(", "))
        };
        if opcode == Opcode::Begin {
            writeln!(out, "{opcode}{operands}").ok();
        } else if opcode.is_frame() {
            writeln!(out, "  {opcode}{operands}").ok();
        } else {
            writeln!(out, "    [{value_commands}] {opcode}{operands}").ok();
            value_commands += 1;
        }
    }
    out
}
