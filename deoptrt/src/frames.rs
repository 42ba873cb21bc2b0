//! The layout of the frames the deoptimiser builds.
//!
//! These offsets are a contract with the code that runs in the frames (the baseline compiler's
//! code and the builtin stubs) and must match it exactly. Offsets are relative to the frame
//! pointer unless stated otherwise. Every frame starts, from its highest address downwards, with
//! its incoming parameters (the receiver first) followed by the caller's pc and the caller's frame
//! pointer. The frame pointer points at the saved caller frame pointer.

use crate::tagged::{Tagged, WORD_SIZE};
use strum::{Display, EnumCount, FromRepr};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum FrameType {
    JavaScript = 1,
    ArgumentsAdaptor,
    Construct,
    Internal,
}

impl FrameType {
    /// The Smi stored in a stub frame to identify its type.
    pub fn marker(self) -> Tagged {
        Tagged::smi_unchecked(self as i64)
    }
}

/// Layout shared by all frames.
pub mod standard {
    use super::WORD_SIZE;

    pub const CALLER_PC_OFFSET: isize = WORD_SIZE as isize;
    pub const CALLER_FP_OFFSET: isize = 0;
    pub const CONTEXT_OFFSET: isize = -(WORD_SIZE as isize);
    /// The function in a JavaScript frame, or a [FrameType](super::FrameType) marker in a stub
    /// frame.
    pub const MARKER_OFFSET: isize = -2 * WORD_SIZE as isize;
    /// Caller pc, caller fp, context and function.
    pub const FIXED_FRAME_SIZE: usize = 4 * WORD_SIZE;
}

/// An arguments adaptor frame: caller pc, caller fp, the `ArgumentsAdaptor` marker in place of
/// the context, and the function. The actual arguments (including the receiver) sit above it.
pub mod adaptor {
    use super::WORD_SIZE;

    pub const FUNCTION_OFFSET: isize = -2 * WORD_SIZE as isize;
    pub const FIXED_FRAME_SIZE: usize = 4 * WORD_SIZE;
}

/// A construct stub frame: caller pc, caller fp, context, the `Construct` marker, the stub code
/// object, the argument count, the constructor and the newly allocated receiver.
pub mod construct {
    use super::WORD_SIZE;

    pub const CODE_OFFSET: isize = -3 * WORD_SIZE as isize;
    pub const LENGTH_OFFSET: isize = -4 * WORD_SIZE as isize;
    pub const CONSTRUCTOR_OFFSET: isize = -5 * WORD_SIZE as isize;
    pub const IMPLICIT_RECEIVER_OFFSET: isize = -6 * WORD_SIZE as isize;
    pub const FIXED_FRAME_SIZE: usize = 8 * WORD_SIZE;
}

/// An internal frame for a getter or setter stub: caller pc, caller fp, context, the `Internal`
/// marker and the stub code object. A setter's frame also holds the value being stored, which is
/// the setter call's implicit return value.
pub mod accessor {
    use super::WORD_SIZE;

    pub const CODE_OFFSET: isize = -3 * WORD_SIZE as isize;
    pub const GETTER_FRAME_SIZE: usize = 5 * WORD_SIZE;
    pub const SETTER_FRAME_SIZE: usize = 6 * WORD_SIZE;
}

/// The size of the fixed part of a JavaScript frame for a function taking `parameter_count`
/// parameters (including the receiver).
pub fn compute_fixed_size(parameter_count: usize) -> usize {
    parameter_count * WORD_SIZE + standard::FIXED_FRAME_SIZE
}

/// General purpose registers, in hardware encoding order.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Register {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Register {
    pub const FP: Register = Register::RBP;
    pub const SP: Register = Register::RSP;
    pub const CONTEXT: Register = Register::RSI;

    pub fn idx(self) -> usize {
        usize::from(self as u8)
    }
}

/// Floating point registers.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum XmmRegister {
    XMM0 = 0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

impl XmmRegister {
    pub fn idx(self) -> usize {
        usize::from(self as u8)
    }
}

static_assertions::const_assert_eq!(Register::COUNT as i64, deoptmap::translation::NUM_REGISTERS);
static_assertions::const_assert_eq!(
    XmmRegister::COUNT as i64,
    deoptmap::translation::NUM_DOUBLE_REGISTERS
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_sizes() {
        assert_eq!(compute_fixed_size(1), 40);
        assert_eq!(compute_fixed_size(3), 56);
        assert_eq!(construct::FIXED_FRAME_SIZE, 64);
        assert_eq!(
            construct::IMPLICIT_RECEIVER_OFFSET + construct::FIXED_FRAME_SIZE as isize,
            2 * WORD_SIZE as isize
        );
    }

    #[test]
    fn registers() {
        assert_eq!(Register::FP.idx(), 5);
        assert_eq!(Register::from_repr(6), Some(Register::CONTEXT));
        assert_eq!(Register::R12.to_string(), "r12");
        assert_eq!(XmmRegister::XMM3.idx(), 3);
        assert_eq!(FrameType::Construct.marker(), Tagged::smi(3).unwrap());
    }
}
