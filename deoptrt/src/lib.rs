//! A deoptimiser: the runtime half of a speculative optimising compiler.
//!
//! Optimised code records, for every point at which it may bail out, how to rebuild the
//! unoptimised frames its single frame stands for. When a speculation fails, the code traps into
//! a deoptimisation entry, a [Deoptimizer] rebuilds those frames, and execution carries on in
//! unoptimised code. The same machinery runs backwards for on-stack replacement, and lets the
//! runtime invalidate optimised code that still has activations on the stack.

#![allow(clippy::new_without_default)]
#![allow(clippy::upper_case_acronyms)]

pub mod code_patch;
pub mod config;
pub mod deoptimizer;
pub mod disasm;
mod errors;
pub mod frame_description;
pub mod frames;
pub mod heap;
pub mod invalidate;
pub mod isolate;
pub mod log;
pub mod objects;
pub mod slot_ref;
pub mod tagged;
pub mod trampoline;

pub use self::config::DeoptConfig;
pub use self::deoptimizer::{BailoutType, Deoptimizer, EpisodeState};
pub use self::errors::DeoptError;
pub use self::frame_description::{FrameDescription, FrameMemory, StackMemory};
pub use self::isolate::{Builtin, Isolate};
pub use self::slot_ref::SlotRef;
pub use self::tagged::{Address, Tagged};
