//! x64 entry tables.
//!
//! Each table is `count` entries of `push imm32; jmp common` followed by the common code, which
//! saves the registers, calls back into the runtime to create and run the episode, replaces the
//! optimised frame with the output frames, and returns into the continuation with the innermost
//! frame's registers.
//!
//! The callback returns an [EntryResult] describing the episode's output. Its memory must stay
//! valid until the common code has finished copying from it, which [EntryFrames] provides.

use crate::{
    deoptimizer::{BailoutType, Deoptimizer, data::ENTRY_SIZE},
    errors::{DeoptError, fatal},
    frames::{Register, XmmRegister},
    isolate::Isolate,
    tagged::{Tagged, WORD_SIZE},
};
use dynasmrt::{DynasmApi, DynasmLabelApi, VecAssembler, dynasm, x64::X64Relocation};
use libc::{MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, mmap, mprotect, munmap};
use std::{ffi::c_void, mem::offset_of, ptr};
use strum::EnumCount;

/// Saved xmm registers, then saved general purpose registers.
const SAVED_REGISTERS_SIZE: i32 = ((Register::COUNT + XmmRegister::COUNT) * WORD_SIZE) as i32;

/// The runtime half of an entry. Called with the context the table was generated with, the
/// bailout type (as its `u8` value), the entry id, the return address of the trap (0 for eager
/// bailouts), the frame pointer to stack pointer delta, and the saved registers: the general
/// purpose registers in encoding order, then the xmm registers.
pub type EntryCallback = unsafe extern "C" fn(
    ctx: *mut c_void,
    bailout_type: u64,
    id: u64,
    from: u64,
    fp_to_sp_delta: u64,
    saved: *const u64,
) -> *const EntryResult;

/// One output frame as the common code copies it: `words` words, lowest address first.
#[repr(C)]
#[derive(Debug)]
pub struct EntryFrame {
    content: *const u64,
    words: usize,
}

#[repr(C)]
#[derive(Debug)]
pub struct EntryResult {
    /// The size in bytes of the optimised frame to pop.
    input_size: usize,
    /// Outermost first.
    frames: *const EntryFrame,
    frame_count: usize,
    registers: *const u64,
    double_registers: *const f64,
    state: u64,
    pc: u64,
    continuation: u64,
}

/// The output of an episode, laid out for the common code.
#[derive(Debug)]
pub struct EntryFrames {
    contents: Vec<Box<[u64]>>,
    // Only read through the pointers in `result`.
    #[allow(dead_code)]
    frames: Vec<EntryFrame>,
    #[allow(dead_code)]
    registers: Box<[u64; Register::COUNT]>,
    #[allow(dead_code)]
    double_registers: Box<[f64; XmmRegister::COUNT]>,
    result: Box<EntryResult>,
}

impl EntryFrames {
    /// Lay out the output frames of `deopt`, which must have been computed.
    pub fn new(deopt: &Deoptimizer) -> Self {
        let contents = deopt
            .output_frames()
            .map(|f| {
                (0..f.frame_size())
                    .step_by(WORD_SIZE)
                    .map(|off| f.frame_slot(off))
                    .collect::<Box<[u64]>>()
            })
            .collect::<Vec<_>>();
        let frames = contents
            .iter()
            .map(|c| EntryFrame {
                content: c.as_ptr(),
                words: c.len(),
            })
            .collect::<Vec<_>>();
        let innermost = deopt.output_frame(deopt.output_count() - 1);
        let registers = Box::new(*innermost.registers());
        let double_registers = Box::new(*innermost.double_registers());
        let result = Box::new(EntryResult {
            input_size: deopt.input().frame_size(),
            frames: frames.as_ptr(),
            frame_count: frames.len(),
            registers: registers.as_ptr(),
            double_registers: double_registers.as_ptr(),
            state: innermost.state().raw(),
            pc: innermost.pc(),
            continuation: innermost.continuation(),
        });
        Self {
            contents,
            frames,
            registers,
            double_registers,
            result,
        }
    }

    /// The pointer an [EntryCallback] returns.
    pub fn as_ptr(&self) -> *const EntryResult {
        &*self.result
    }

    pub fn frame_words(&self, i: usize) -> &[u64] {
        &self.contents[i]
    }
}

/// The context [runtime_entry] is called with.
pub struct EntryContext<'a> {
    isolate: &'a Isolate,
    /// The output of the latest episode, kept until the next one.
    frames: Option<EntryFrames>,
}

impl<'a> EntryContext<'a> {
    pub fn new(isolate: &'a Isolate) -> Self {
        Self {
            isolate,
            frames: None,
        }
    }
}

/// The [EntryCallback] for real stacks: `ctx` must point to an [EntryContext] and `saved` to the
/// registers the common code saved. The optimised frame is read straight from the stack `saved`
/// describes. The episode is left in the isolate for the continuation to take.
///
/// # Safety
///
/// The frame pointer in `saved` must point into a live optimised frame of at least the size its
/// code describes, and `ctx` must not be in use elsewhere.
pub unsafe extern "C" fn runtime_entry(
    ctx: *mut c_void,
    bailout_type: u64,
    id: u64,
    from: u64,
    fp_to_sp_delta: u64,
    saved: *const u64,
) -> *const EntryResult {
    let ctx = unsafe { &mut *(ctx as *mut EntryContext) };
    let isolate = ctx.isolate;
    let Some(bailout_type) = u8::try_from(bailout_type)
        .ok()
        .and_then(BailoutType::from_repr)
    else {
        fatal!("entry called with bailout type {bailout_type}")
    };
    let saved = unsafe { std::slice::from_raw_parts(saved, Register::COUNT + XmmRegister::COUNT) };
    let fp = saved[Register::FP.idx()];
    let function_slot = unsafe { *((fp - 2 * WORD_SIZE as u64) as *const u64) };
    let Some(function) = isolate.function_from_tagged(Tagged::from_raw(function_slot)) else {
        fatal!("no function in the frame at {fp:#x}")
    };
    let mut d = Deoptimizer::new(
        isolate,
        function,
        bailout_type,
        id as usize,
        from,
        fp_to_sp_delta as usize,
    );
    let input = d.input_mut();
    for reg in (0..Register::COUNT as u8).filter_map(Register::from_repr) {
        input.set_register(reg, saved[reg.idx()]);
    }
    for reg in (0..XmmRegister::COUNT as u8).filter_map(XmmRegister::from_repr) {
        input.set_double_register(reg, f64::from_bits(saved[Register::COUNT + reg.idx()]));
    }
    let top = fp - fp_to_sp_delta;
    input.set_top(top);
    input.set_fp(fp);
    input.set_pc(from);
    for off in (0..input.frame_size()).step_by(WORD_SIZE) {
        input.set_frame_slot(off, unsafe { *((top + off as u64) as *const u64) });
    }
    d.compute_output_frames(isolate);
    d.commit();
    let frames = EntryFrames::new(&d);
    isolate.deoptimizer_data().set_current(d);
    ctx.frames.insert(frames).as_ptr()
}

/// An entry table in executable memory.
#[derive(Debug)]
pub struct EntryTableCode {
    bailout_type: BailoutType,
    buf: *mut u8,
    len: usize,
    count: usize,
    common: usize,
    code_len: usize,
}

impl EntryTableCode {
    /// Generate the `count` entries for `bailout_type` bailouts, calling `callback` with `ctx`.
    pub fn generate(
        bailout_type: BailoutType,
        count: usize,
        callback: EntryCallback,
        ctx: *mut c_void,
    ) -> Result<Self, DeoptError> {
        let (code, common) = assemble(bailout_type, count, callback, ctx)?;
        let len = code.len().next_multiple_of(page_size::get());
        let buf = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(DeoptError::CodeGeneration(format!(
                "cannot map {len} bytes for the {bailout_type} entry table"
            )));
        }
        let buf = buf as *mut u8;
        unsafe {
            buf.copy_from_nonoverlapping(code.as_ptr(), code.len());
        }
        if unsafe { mprotect(buf as *mut c_void, len, PROT_EXEC | PROT_READ) } != 0 {
            unsafe {
                munmap(buf as *mut c_void, len);
            }
            return Err(DeoptError::CodeGeneration(
                "cannot make the entry table executable".into(),
            ));
        }
        Ok(Self {
            bailout_type,
            buf,
            len,
            count,
            common,
            code_len: code.len(),
        })
    }

    pub fn bailout_type(&self) -> BailoutType {
        self.bailout_type
    }

    pub fn start(&self) -> *const u8 {
        self.buf
    }

    /// The address of entry `id`, or `None` if the table has no such entry.
    pub fn entry(&self, id: usize) -> Option<*const u8> {
        (id < self.count).then(|| unsafe { self.buf.add(id * ENTRY_SIZE) as *const u8 })
    }

    /// The generated instructions.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf, self.code_len) }
    }

    /// The instructions shared by every entry.
    pub fn common_code(&self) -> &[u8] {
        &self.code()[self.common..]
    }
}

impl Drop for EntryTableCode {
    fn drop(&mut self) {
        unsafe {
            munmap(self.buf as *mut c_void, self.len);
        }
    }
}

fn assemble(
    bailout_type: BailoutType,
    count: usize,
    callback: EntryCallback,
    ctx: *mut c_void,
) -> Result<(Vec<u8>, usize), DeoptError> {
    let mut asm = VecAssembler::<X64Relocation>::new(0);
    let common = asm.new_dynamic_label();
    for id in 0..count {
        let start = asm.offset().0;
        dynasm!(asm
            ; push DWORD id as i32
            ; jmp =>common
        );
        if asm.offset().0 - start != ENTRY_SIZE {
            return Err(DeoptError::CodeGeneration(format!(
                "entry {id} is {} bytes, expected {ENTRY_SIZE}",
                asm.offset().0 - start
            )));
        }
    }
    let common_offset = asm.offset().0;
    dynasm!(asm
        ; =>common
        ; sub rsp, (XmmRegister::COUNT * WORD_SIZE) as i32
    );
    for i in 0..XmmRegister::COUNT {
        dynasm!(asm; movsd QWORD [rsp + (i * WORD_SIZE) as i32], Rx(i as u8));
    }
    // Push in reverse so that the registers end up in encoding order.
    for i in (0..Register::COUNT).rev() {
        dynasm!(asm; push Rq(i as u8));
    }

    // Above the saved registers is the entry id and, unless the entry was jumped to, the return
    // address of the call into it.
    let (frame_start, id_offset) = match bailout_type {
        BailoutType::Eager => (SAVED_REGISTERS_SIZE + WORD_SIZE as i32, SAVED_REGISTERS_SIZE),
        _ => (SAVED_REGISTERS_SIZE + 2 * WORD_SIZE as i32, SAVED_REGISTERS_SIZE),
    };
    dynasm!(asm
        ; mov rdi, QWORD ctx as i64
        ; mov esi, bailout_type as i32
        ; mov rdx, QWORD [rsp + id_offset]
    );
    match bailout_type {
        BailoutType::Eager => dynasm!(asm; xor ecx, ecx),
        _ => dynasm!(asm; mov rcx, QWORD [rsp + id_offset + WORD_SIZE as i32]),
    }
    dynasm!(asm
        ; lea r8, [rsp + frame_start]
        ; neg r8
        ; add r8, rbp
        ; mov r9, rsp
        // The stack is only word aligned here.
        ; mov rbx, rsp
        ; and rsp, -16
        ; mov rax, QWORD callback as i64
        ; call rax
        ; mov rsp, rbx
        ; mov rbx, rax
        // Drop the saved registers, the id, any return address and the optimised frame.
        ; lea rsp, [rsp + frame_start]
        ; add rsp, QWORD [rbx + offset_of!(EntryResult, input_size) as i32]
        ; mov rcx, QWORD [rbx + offset_of!(EntryResult, frames) as i32]
        ; mov rdx, QWORD [rbx + offset_of!(EntryResult, frame_count) as i32]
        ; ->outer:
        ; test rdx, rdx
        ; jz ->done
        ; mov rsi, QWORD [rcx + offset_of!(EntryFrame, content) as i32]
        ; mov rdi, QWORD [rcx + offset_of!(EntryFrame, words) as i32]
        ; ->inner:
        ; test rdi, rdi
        ; jz ->next
        ; dec rdi
        ; push QWORD [rsi + rdi * 8]
        ; jmp ->inner
        ; ->next:
        ; add rcx, std::mem::size_of::<EntryFrame>() as i32
        ; dec rdx
        ; jmp ->outer
        ; ->done:
    );
    if bailout_type != BailoutType::Osr {
        dynasm!(asm; push QWORD [rbx + offset_of!(EntryResult, state) as i32]);
    }
    dynasm!(asm
        ; push QWORD [rbx + offset_of!(EntryResult, pc) as i32]
        ; push QWORD [rbx + offset_of!(EntryResult, continuation) as i32]
        ; mov rsi, QWORD [rbx + offset_of!(EntryResult, double_registers) as i32]
    );
    for i in 0..XmmRegister::COUNT {
        dynasm!(asm; movsd Rx(i as u8), QWORD [rsi + (i * WORD_SIZE) as i32]);
    }
    dynasm!(asm; mov rsi, QWORD [rbx + offset_of!(EntryResult, registers) as i32]);
    // `rsp` is the stack just built, and `rsi` is the base of the registers: restore it last.
    for r in (0..Register::COUNT as u8).filter_map(Register::from_repr) {
        if r != Register::SP && r != Register::RSI {
            dynasm!(asm; mov Rq(r as u8), QWORD [rsi + (r.idx() * WORD_SIZE) as i32]);
        }
    }
    dynasm!(asm
        ; mov rsi, QWORD [rsi + (Register::RSI.idx() * WORD_SIZE) as i32]
        ; ret
    );
    let code = asm
        .finalize()
        .map_err(|e| DeoptError::CodeGeneration(e.to_string()))?;
    Ok((code, common_offset))
}
