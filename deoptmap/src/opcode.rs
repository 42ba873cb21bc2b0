//! The closed vocabulary of translation commands.

use strum::{Display, EnumCount, EnumIter, FromRepr};

/// The literal id a frame command uses to mean "the function being deoptimised". The bottommost
/// frame of a translation normally refers to itself this way rather than through the literal pool.
pub const SELF_LITERAL_ID: i64 = -239;

/// A translation opcode. Each opcode is followed by exactly [Opcode::operand_count] operands.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// `BEGIN(frame_count, js_frame_count)`.
    Begin,
    /// `JS_FRAME(node_id, literal_id, height)`.
    JsFrame,
    /// `CONSTRUCT_STUB_FRAME(node_id, literal_id, height)`.
    ConstructStubFrame,
    /// `GETTER_STUB_FRAME(node_id, literal_id, height)`.
    GetterStubFrame,
    /// `SETTER_STUB_FRAME(node_id, literal_id, height)`.
    SetterStubFrame,
    /// `ARGUMENTS_ADAPTOR_FRAME(node_id, literal_id, height)`.
    ArgumentsAdaptorFrame,
    Register,
    Int32Register,
    Uint32Register,
    DoubleRegister,
    /// Operands of the stack slot commands are byte offsets into the optimised frame, measured
    /// from its top.
    StackSlot,
    Int32StackSlot,
    Uint32StackSlot,
    DoubleStackSlot,
    Literal,
    ArgumentsObject,
    /// `DUPLICATE(command_index)`: stands in for one value command and resolves to exactly the
    /// value of the earlier value command numbered `command_index` in the same translation.
    Duplicate,
}

impl Opcode {
    /// Decode an opcode from a value read out of a translation.
    pub fn from_i64(v: i64) -> Option<Self> {
        u8::try_from(v).ok().and_then(Self::from_repr)
    }

    /// How many operands follow this opcode?
    pub fn operand_count(self) -> usize {
        match self {
            Opcode::Begin => 2,
            Opcode::JsFrame
            | Opcode::ConstructStubFrame
            | Opcode::GetterStubFrame
            | Opcode::SetterStubFrame
            | Opcode::ArgumentsAdaptorFrame => 3,
            Opcode::Register
            | Opcode::Int32Register
            | Opcode::Uint32Register
            | Opcode::DoubleRegister
            | Opcode::StackSlot
            | Opcode::Int32StackSlot
            | Opcode::Uint32StackSlot
            | Opcode::DoubleStackSlot
            | Opcode::Literal
            | Opcode::Duplicate => 1,
            Opcode::ArgumentsObject => 0,
        }
    }

    /// Does this opcode begin a new logical frame?
    pub fn is_frame(self) -> bool {
        matches!(
            self,
            Opcode::JsFrame
                | Opcode::ConstructStubFrame
                | Opcode::GetterStubFrame
                | Opcode::SetterStubFrame
                | Opcode::ArgumentsAdaptorFrame
        )
    }

    /// Does this opcode describe where one value comes from?
    pub fn is_value(self) -> bool {
        !self.is_frame() && self != Opcode::Begin
    }
}
