//! The staging record for one frame: either the optimised frame captured at a trap, or one of the
//! unoptimised frames built to replace it.

use crate::{
    frames::{FrameType, Register, XmmRegister, standard},
    heap::RootVisitor,
    objects::FunctionIdx,
    tagged::{Address, Tagged, WORD_SIZE},
};
use byteorder::{ByteOrder, LittleEndian};
use strum::EnumCount;

/// Read access to the words of a frame and the registers live alongside it. Offsets are in bytes
/// from the frame's top (its lowest address).
pub trait FrameMemory {
    fn word(&self, offset: usize) -> u64;

    fn register(&self, reg: Register) -> u64;

    fn double_register(&self, reg: XmmRegister) -> f64;

    /// Read the 32 bit integer stored in the low half of the slot at `offset`.
    fn int32(&self, offset: usize) -> i32 {
        self.word(offset) as u32 as i32
    }

    fn double(&self, offset: usize) -> f64 {
        f64::from_bits(self.word(offset))
    }
}

/// Word-addressed access to a machine stack.
pub trait StackMemory {
    fn read_word(&self, addr: Address) -> u64;

    fn write_word(&mut self, addr: Address, v: u64);

    /// Visit every word on the stack as a possible root.
    fn visit_words(&self, v: &mut dyn RootVisitor);
}

/// One frame. Its contents are `frame_size` bytes which will occupy `[top, top + frame_size)` on
/// the machine stack.
#[derive(Clone, Debug)]
pub struct FrameDescription {
    frame_size: usize,
    function: Option<FunctionIdx>,
    frame_type: FrameType,
    registers: [u64; Register::COUNT],
    double_registers: [f64; XmmRegister::COUNT],
    top: Address,
    pc: Address,
    fp: Address,
    context: Tagged,
    state: Tagged,
    continuation: Address,
    content: Box<[u8]>,
}

impl FrameDescription {
    pub fn new(frame_size: usize, function: Option<FunctionIdx>) -> Self {
        debug_assert_eq!(frame_size % WORD_SIZE, 0);
        Self {
            frame_size,
            function,
            frame_type: FrameType::JavaScript,
            registers: [0; Register::COUNT],
            double_registers: [0.0; XmmRegister::COUNT],
            top: 0,
            pc: 0,
            fp: 0,
            context: Tagged::ZERO,
            state: Tagged::ZERO,
            continuation: 0,
            content: vec![0; frame_size].into_boxed_slice(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn function(&self) -> Option<FunctionIdx> {
        self.function
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn set_frame_type(&mut self, t: FrameType) {
        self.frame_type = t;
    }

    fn check_slot(&self, offset: usize, size: usize) {
        debug_assert!(
            offset + size <= self.frame_size,
            "slot at {offset} outside frame of {} bytes",
            self.frame_size
        );
    }

    pub fn frame_slot(&self, offset: usize) -> u64 {
        self.check_slot(offset, WORD_SIZE);
        LittleEndian::read_u64(&self.content[offset..offset + WORD_SIZE])
    }

    pub fn set_frame_slot(&mut self, offset: usize, v: u64) {
        self.check_slot(offset, WORD_SIZE);
        LittleEndian::write_u64(&mut self.content[offset..offset + WORD_SIZE], v);
    }

    pub fn tagged_frame_slot(&self, offset: usize) -> Tagged {
        Tagged::from_raw(self.frame_slot(offset))
    }

    pub fn set_tagged_frame_slot(&mut self, offset: usize, t: Tagged) {
        self.set_frame_slot(offset, t.raw());
    }

    /// Read a double as two 32 bit halves: a double slot is only guaranteed to be word aligned.
    pub fn double_frame_slot(&self, offset: usize) -> f64 {
        self.check_slot(offset, 8);
        let lo = LittleEndian::read_u32(&self.content[offset..offset + 4]);
        let hi = LittleEndian::read_u32(&self.content[offset + 4..offset + 8]);
        f64::from_bits(u64::from(hi) << 32 | u64::from(lo))
    }

    pub fn set_double_frame_slot(&mut self, offset: usize, v: f64) {
        self.set_frame_slot(offset, v.to_bits());
    }

    /// The raw bytes of this frame, lowest address first.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn register(&self, reg: Register) -> u64 {
        self.registers[reg.idx()]
    }

    pub fn set_register(&mut self, reg: Register, v: u64) {
        self.registers[reg.idx()] = v;
    }

    pub fn registers(&self) -> &[u64; Register::COUNT] {
        &self.registers
    }

    pub fn double_register(&self, reg: XmmRegister) -> f64 {
        self.double_registers[reg.idx()]
    }

    pub fn set_double_register(&mut self, reg: XmmRegister, v: f64) {
        self.double_registers[reg.idx()] = v;
    }

    pub fn double_registers(&self) -> &[f64; XmmRegister::COUNT] {
        &self.double_registers
    }

    pub fn top(&self) -> Address {
        self.top
    }

    pub fn set_top(&mut self, top: Address) {
        self.top = top;
    }

    pub fn pc(&self) -> Address {
        self.pc
    }

    pub fn set_pc(&mut self, pc: Address) {
        self.pc = pc;
    }

    pub fn fp(&self) -> Address {
        self.fp
    }

    pub fn set_fp(&mut self, fp: Address) {
        self.fp = fp;
    }

    pub fn context(&self) -> Tagged {
        self.context
    }

    pub fn set_context(&mut self, context: Tagged) {
        self.context = context;
    }

    pub fn state(&self) -> Tagged {
        self.state
    }

    pub fn set_state(&mut self, state: Tagged) {
        self.state = state;
    }

    pub fn continuation(&self) -> Address {
        self.continuation
    }

    pub fn set_continuation(&mut self, continuation: Address) {
        self.continuation = continuation;
    }

    /// The offset of this frame's frame pointer from its top.
    pub fn fp_offset(&self) -> usize {
        (self.fp - self.top) as usize
    }

    /// The caller's pc, as stored in this frame.
    pub fn caller_pc(&self) -> Address {
        self.frame_slot(self.slot_offset_from_fp(standard::CALLER_PC_OFFSET))
    }

    /// The caller's frame pointer, as stored in this frame.
    pub fn caller_fp(&self) -> Address {
        self.frame_slot(self.slot_offset_from_fp(standard::CALLER_FP_OFFSET))
    }

    /// Convert an fp-relative offset into an offset from this frame's top.
    pub fn slot_offset_from_fp(&self, fp_offset: isize) -> usize {
        let off = self.fp_offset() as isize + fp_offset;
        debug_assert!(off >= 0);
        off as usize
    }

    /// The address of the slot at `offset` once this frame is on the stack.
    pub fn slot_address(&self, offset: usize) -> Address {
        self.top + offset as u64
    }
}

impl FrameMemory for FrameDescription {
    fn word(&self, offset: usize) -> u64 {
        self.frame_slot(offset)
    }

    fn register(&self, reg: Register) -> u64 {
        FrameDescription::register(self, reg)
    }

    fn double_register(&self, reg: XmmRegister) -> f64 {
        FrameDescription::double_register(self, reg)
    }

    fn double(&self, offset: usize) -> f64 {
        self.double_frame_slot(offset)
    }
}
