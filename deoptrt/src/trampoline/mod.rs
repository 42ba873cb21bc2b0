//! The deoptimisation entry code.
//!
//! Optimised code bails out by jumping (eager) or calling (lazy, OSR) an entry in one of the
//! isolate's entry tables. Each entry pushes its id and jumps to code common to the table, which:
//!
//! 1. saves every register;
//! 2. works out where the optimised frame ends and creates a [Deoptimizer] for it;
//! 3. pops the optimised frame into the episode's input frame;
//! 4. computes the output frames and pushes them, outermost first;
//! 5. pushes the innermost frame's state and pc, restores its registers and returns into its
//!    continuation.
//!
//! The continuation then runs the runtime half of the episode and returns to the innermost
//! frame's pc.
//!
//! [run_entry] performs this sequence against a [SimulatedStack], so that the order of every
//! step can be checked on any host. On x86_64, [x64] generates the same sequence as machine code.

use crate::{
    deoptimizer::{BailoutType, Deoptimizer},
    errors::{fatal, fatal_logged},
    frame_description::StackMemory,
    frames::{Register, XmmRegister},
    heap::RootVisitor,
    isolate::{Builtin, Isolate},
    log::Verbosity,
    objects::CodeIdx,
    tagged::{Address, Tagged, WORD_SIZE},
};
use strum::EnumCount;

#[cfg(target_arch = "x86_64")]
pub mod x64;

/// The registers of a simulated machine.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineState {
    pub registers: [u64; Register::COUNT],
    pub double_registers: [f64; XmmRegister::COUNT],
    pub pc: Address,
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            registers: [0; Register::COUNT],
            double_registers: [0.0; XmmRegister::COUNT],
            pc: 0,
        }
    }

    pub fn register(&self, reg: Register) -> u64 {
        self.registers[reg.idx()]
    }

    pub fn set_register(&mut self, reg: Register, v: u64) {
        self.registers[reg.idx()] = v;
    }

    pub fn sp(&self) -> Address {
        self.register(Register::SP)
    }

    pub fn fp(&self) -> Address {
        self.register(Register::FP)
    }
}

/// A downward-growing machine stack occupying `[base, base + size)`.
#[derive(Clone, Debug)]
pub struct SimulatedStack {
    base: Address,
    words: Vec<u64>,
}

impl SimulatedStack {
    pub fn new(base: Address, size: usize) -> Self {
        debug_assert_eq!(base % WORD_SIZE as u64, 0);
        Self {
            base,
            words: vec![0; size / WORD_SIZE],
        }
    }

    /// The highest address on the stack plus one: the initial stack pointer.
    pub fn limit(&self) -> Address {
        self.base + (self.words.len() * WORD_SIZE) as u64
    }

    fn index(&self, addr: Address) -> usize {
        let off = addr.wrapping_sub(self.base);
        if addr < self.base || off % WORD_SIZE as u64 != 0 || off >= self.limit() - self.base {
            fatal!("stack access at {addr:#x} outside [{:#x}, {:#x})", self.base, self.limit());
        }
        (off / WORD_SIZE as u64) as usize
    }

    pub fn push(&mut self, state: &mut MachineState, v: u64) {
        let sp = state.sp() - WORD_SIZE as u64;
        self.write_word(sp, v);
        state.set_register(Register::SP, sp);
    }

    pub fn pop(&mut self, state: &mut MachineState) -> u64 {
        let sp = state.sp();
        let v = self.read_word(sp);
        state.set_register(Register::SP, sp + WORD_SIZE as u64);
        v
    }
}

impl StackMemory for SimulatedStack {
    fn read_word(&self, addr: Address) -> u64 {
        self.words[self.index(addr)]
    }

    fn write_word(&mut self, addr: Address, v: u64) {
        let i = self.index(addr);
        self.words[i] = v;
    }

    fn visit_words(&self, v: &mut dyn RootVisitor) {
        for w in &self.words {
            v.visit(Tagged::from_raw(*w));
        }
    }
}

/// Find which entry table `pc` is in, and which entry.
fn decode_entry(isolate: &Isolate, pc: Address) -> (BailoutType, usize) {
    let data = isolate.deoptimizer_data();
    for ty in [BailoutType::Eager, BailoutType::Lazy, BailoutType::Osr] {
        if let Some(id) = data.get_deoptimization_id(pc, ty) {
            return (ty, id);
        }
    }
    fatal_logged!(isolate.log, "{pc:#x} is not a deoptimisation entry")
}

/// Run the entry code at `state.pc` on `stack`. On return, `state` is the machine state the entry
/// code jumps to the continuation with, and the episode is stored in the isolate for the
/// continuation to take.
///
/// # Panics
///
/// If `state.pc` is not an entry, or any step of the sequence finds the stack in a state other
/// than the one the episode describes.
pub fn run_entry(isolate: &Isolate, stack: &mut SimulatedStack, state: &mut MachineState) {
    let (bailout_type, id) = decode_entry(isolate, state.pc);
    stack.push(state, id as u64);
    // Registers are saved in a scratch area rather than on the stack being rewritten.
    let saved = state.clone();
    let sp = state.sp();

    // Above the id sits the return address of the call into the entry, unless the entry was
    // jumped to.
    let (from, frame_start) = match bailout_type {
        BailoutType::Eager => (0, sp + WORD_SIZE as u64),
        _ => (stack.read_word(sp + WORD_SIZE as u64), sp + 2 * WORD_SIZE as u64),
    };
    let fp = state.fp();
    let Some(fp_to_sp_delta) = fp.checked_sub(frame_start) else {
        fatal_logged!(isolate.log, "frame pointer {fp:#x} below stack pointer {frame_start:#x}")
    };
    let function_slot = stack.read_word(fp - 2 * WORD_SIZE as u64);
    let Some(function) = isolate.function_from_tagged(Tagged::from_raw(function_slot)) else {
        fatal_logged!(isolate.log, "no function in the frame at {fp:#x}")
    };

    let deopt = Deoptimizer::new(
        isolate,
        function,
        bailout_type,
        id,
        from,
        fp_to_sp_delta as usize,
    );
    let data = isolate.deoptimizer_data();
    data.set_current(deopt);

    // Pop the optimised frame into the input frame.
    let frame_end = data.with_current(|d| {
        let input = d.input_mut();
        for r in 0..Register::COUNT {
            if let Some(reg) = Register::from_repr(r as u8) {
                input.set_register(reg, saved.register(reg));
            }
        }
        for x in 0..XmmRegister::COUNT {
            if let Some(reg) = XmmRegister::from_repr(x as u8) {
                input.set_double_register(reg, saved.double_registers[x]);
            }
        }
        input.set_top(frame_start);
        input.set_fp(fp);
        input.set_pc(from);
        let size = input.frame_size();
        for off in (0..size).step_by(WORD_SIZE) {
            input.set_frame_slot(off, stack.read_word(frame_start + off as u64));
        }
        frame_start + size as u64
    });
    state.set_register(Register::SP, frame_end);

    data.with_current(|d| d.compute_output_frames(isolate));

    // Push the output frames, outermost first.
    let innermost = data.with_current(|d| {
        for f in d.output_frames() {
            let top = state.sp() - f.frame_size() as u64;
            if top != f.top() {
                fatal_logged!(
                    isolate.log,
                    "output frame at {:#x} pushed at {top:#x}",
                    f.top()
                );
            }
            for off in (0..f.frame_size()).step_by(WORD_SIZE) {
                stack.write_word(top + off as u64, f.frame_slot(off));
            }
            state.set_register(Register::SP, top);
        }
        d.commit();
        match d.output_frames().last() {
            Some(f) => f.clone(),
            None => fatal!("episode built no frames"),
        }
    });

    if bailout_type != BailoutType::Osr {
        stack.push(state, innermost.state().raw());
    }
    stack.push(state, innermost.pc());
    let sp = state.sp();
    state.registers = *innermost.registers();
    state.set_register(Register::SP, sp);
    state.double_registers = *innermost.double_registers();
    state.pc = innermost.continuation();
    if isolate.log.enabled(Verbosity::Translation) {
        isolate.log.log(
            Verbosity::Translation,
            &format!(
                "entry {bailout_type} {id}: resuming in {:#x} with sp={sp:#x}",
                state.pc
            ),
        );
    }
}

/// Run the continuation the entry code returned into: take the episode, finish it, and return
/// to the innermost output frame. `live_code` are the optimised code objects with other
/// activations on the stack.
///
/// # Panics
///
/// If `state.pc` is not one of the notification builtins.
pub fn run_continuation(
    isolate: &mut Isolate,
    stack: &mut SimulatedStack,
    state: &mut MachineState,
    live_code: &[CodeIdx],
) {
    let deopt = isolate.grab_deoptimizer();
    if state.pc == isolate.builtin_address(Builtin::NotifyOsr) {
        // Nothing is deferred by OSR: the frame is resumed as it is.
        drop(deopt);
    } else if state.pc == isolate.builtin_address(Builtin::NotifyDeoptimized)
        || state.pc == isolate.builtin_address(Builtin::NotifyLazyDeoptimized)
    {
        isolate.notify_deoptimized(deopt, stack, live_code);
        let full_code_state = stack.pop(state);
        if Tagged::from_raw(full_code_state).smi_value().is_none() {
            fatal_logged!(
                isolate.log,
                "{full_code_state:#x} on the stack is not a full code state"
            );
        }
    } else {
        fatal_logged!(isolate.log, "{:#x} is not a deoptimisation continuation", state.pc);
    }
    state.pc = stack.pop(state);
}
