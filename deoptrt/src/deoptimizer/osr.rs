//! On-stack replacement: turning an unoptimised frame into the optimised frame of code compiled
//! for the loop it is running.
//!
//! This runs the translation backwards compared to a deoptimisation. The input is an unoptimised
//! frame, so every input slot is a tagged value, and each value command says where that slot lives
//! in the optimised frame. If any slot cannot be converted, the whole translation is abandoned and
//! execution carries on in the unoptimised frame as if nothing had happened.

use super::{Deoptimizer, EpisodeState, FrameLayout};
use crate::{
    errors::fatal_logged,
    frame_description::FrameDescription,
    frames::{self, FrameType, Register, XmmRegister},
    heap::Heap,
    isolate::{Builtin, Isolate},
    log::{Verbosity, stats::Counter},
    tagged::{Tagged, WORD_SIZE},
};
use deoptmap::{BailoutId, Opcode, SELF_LITERAL_ID, TranslationIterator};
use thiserror::Error;

/// Why one slot of an OSR translation could not be converted.
#[derive(Debug, Error, PartialEq)]
pub(crate) enum OsrTranslationError {
    #[error("slot at {offset} holds {value}, which is not a number")]
    NotANumber { offset: usize, value: Tagged },
    #[error("slot at {offset} holds {value}, which is not an int32")]
    NotInt32 { offset: usize, value: Tagged },
    #[error("slot at {offset} holds {value}, which is not a uint32")]
    NotUint32 { offset: usize, value: Tagged },
    #[error("literal {0} outside the literal pool")]
    LiteralOutOfRange(usize),
    #[error("register {0} does not exist")]
    BadRegister(i64),
    #[error("output slot {offset} outside frame of {size} bytes")]
    SlotOutOfRange { offset: usize, size: usize },
    #[error("{0} cannot be translated into an optimised frame")]
    Unsupported(Opcode),
}

impl Deoptimizer {
    pub(super) fn do_compute_osr_output_frame(&mut self, isolate: &Isolate, translation_index: usize) {
        let data = self.data.clone();
        let ast_id = data.osr_ast_id();
        let mut it = TranslationIterator::new(data.translations(), translation_index);
        let opcode = it.next_opcode();
        let count = it.next_usize();
        it.next();
        if opcode != Opcode::Begin || count != 1 {
            fatal_logged!(
                isolate.log,
                "OSR translation {translation_index} is not a single frame"
            );
        }
        let opcode = it.next_opcode();
        let node_id = BailoutId::new(it.next());
        let closure_id = it.next();
        let height = it.next_usize();
        if opcode != Opcode::JsFrame || node_id != ast_id || closure_id != SELF_LITERAL_ID {
            fatal_logged!(
                isolate.log,
                "OSR translation {translation_index} does not describe the frame at ast id {ast_id}"
            );
        }

        let code = isolate.code(self.code);
        let parameter_count = isolate.shared_of(self.function).formal_parameter_count() as usize + 1;
        let fixed_size = frames::compute_fixed_size(parameter_count);
        let input_frame_size = self.input.frame_size();
        if fixed_size + height * WORD_SIZE != input_frame_size {
            fatal_logged!(
                isolate.log,
                "unoptimised frame of {input_frame_size} bytes does not match a height of {height}"
            );
        }
        let outgoing = data.entries()[self.entry_index].arguments_stack_height as usize * WORD_SIZE;
        let output_frame_size = fixed_size + code.stack_slots() as usize * WORD_SIZE + outgoing;
        let mut output = FrameDescription::new(output_frame_size, Some(self.function));
        output.set_frame_type(FrameType::JavaScript);

        // The parameter slots start out cleared: translated parameters may land elsewhere.
        let mut output_offset = output_frame_size;
        for _ in 0..parameter_count {
            output_offset -= WORD_SIZE;
            output.set_frame_slot(output_offset, 0);
        }

        let heap = isolate.heap();
        let mut input_offset = input_frame_size as isize - WORD_SIZE as isize;
        let limit = input_offset - (parameter_count * WORD_SIZE) as isize;
        let mut result = Ok(());
        while result.is_ok() && input_offset > limit {
            result = self.osr_translate_command(heap, &mut it, &mut output, &mut input_offset);
        }
        // There are no commands for the caller's pc and fp, the context and the function.
        if result.is_ok() {
            for _ in 0..4 {
                output_offset -= WORD_SIZE;
                output.set_frame_slot(output_offset, self.input.frame_slot(input_offset as usize));
                input_offset -= WORD_SIZE as isize;
            }
        }
        while result.is_ok() && input_offset >= 0 {
            result = self.osr_translate_command(heap, &mut it, &mut output, &mut input_offset);
        }

        let fp = self.input.register(Register::FP);
        match result {
            Ok(()) => {
                output.set_register(Register::FP, fp);
                output.set_register(Register::CONTEXT, self.input.register(Register::CONTEXT));
                output.set_fp(fp);
                output.set_top(
                    fp - (output_frame_size - parameter_count * WORD_SIZE - 2 * WORD_SIZE) as u64,
                );
                let Some(pc_offset) = data.osr_pc_offset() else {
                    fatal_logged!(isolate.log, "{} has no OSR entry point", code.name())
                };
                output.set_pc(code.start() + u64::from(pc_offset));
                self.state = EpisodeState::FramesBuilt;
            }
            Err(e) => {
                isolate.stats.count(Counter::OsrAborts, 1);
                isolate.log.log(
                    Verbosity::DeoptEvent,
                    &format!(
                        "OSR of {} at ast id {ast_id} aborted: {e}",
                        isolate.shared_of(self.function).name()
                    ),
                );
                output = (*self.input).clone();
                output.set_pc(self.from);
                self.state = EpisodeState::Aborted;
            }
        }
        output.set_continuation(isolate.builtin_address(Builtin::NotifyOsr));
        self.layouts = vec![FrameLayout {
            frame_type: FrameType::JavaScript,
            top: output.top(),
            frame_size: output.frame_size(),
            parameter_count,
            function: Some(self.function_tagged),
        }];
        self.jsframe_count = 1;
        self.output = vec![Some(Box::new(output))];
    }

    /// Move the input slot at `input_offset` to where the next value command says it lives in
    /// `output`, moving `input_offset` on to the next slot.
    fn osr_translate_command(
        &self,
        heap: &Heap,
        it: &mut TranslationIterator,
        output: &mut FrameDescription,
        input_offset: &mut isize,
    ) -> Result<(), OsrTranslationError> {
        let offset = *input_offset as usize;
        let value = self.input.tagged_frame_slot(offset);
        let opcode = it.next_opcode();
        match opcode {
            Opcode::Register => output.set_register(register(it)?, value.raw()),
            Opcode::Int32Register => {
                let v = to_int32(heap, value, offset)?;
                output.set_register(register(it)?, i64::from(v) as u64);
            }
            Opcode::Uint32Register => {
                let v = to_uint32(heap, value, offset)?;
                output.set_register(register(it)?, u64::from(v));
            }
            Opcode::DoubleRegister => {
                let v = to_number(heap, value, offset)?;
                output.set_double_register(double_register(it)?, v);
            }
            Opcode::StackSlot => {
                let slot = output_slot(it, output)?;
                output.set_frame_slot(slot, value.raw());
            }
            Opcode::Int32StackSlot => {
                let v = to_int32(heap, value, offset)?;
                let slot = output_slot(it, output)?;
                output.set_frame_slot(slot, i64::from(v) as u64);
            }
            Opcode::Uint32StackSlot => {
                let v = to_uint32(heap, value, offset)?;
                let slot = output_slot(it, output)?;
                output.set_frame_slot(slot, u64::from(v));
            }
            Opcode::DoubleStackSlot => {
                let v = to_number(heap, value, offset)?;
                let slot = output_slot(it, output)?;
                output.set_double_frame_slot(slot, v);
            }
            // The optimised code holds the literal itself: nothing needs writing.
            Opcode::Literal => {
                let idx = it.next_usize();
                if idx >= self.data.literals().len() {
                    return Err(OsrTranslationError::LiteralOutOfRange(idx));
                }
            }
            x => return Err(OsrTranslationError::Unsupported(x)),
        }
        *input_offset -= WORD_SIZE as isize;
        Ok(())
    }
}

fn register(it: &mut TranslationIterator) -> Result<Register, OsrTranslationError> {
    let v = it.next();
    u8::try_from(v)
        .ok()
        .and_then(Register::from_repr)
        .ok_or(OsrTranslationError::BadRegister(v))
}

fn double_register(it: &mut TranslationIterator) -> Result<XmmRegister, OsrTranslationError> {
    let v = it.next();
    u8::try_from(v)
        .ok()
        .and_then(XmmRegister::from_repr)
        .ok_or(OsrTranslationError::BadRegister(v))
}

fn output_slot(
    it: &mut TranslationIterator,
    output: &FrameDescription,
) -> Result<usize, OsrTranslationError> {
    let offset = it.next_usize();
    if offset + WORD_SIZE > output.frame_size() {
        return Err(OsrTranslationError::SlotOutOfRange {
            offset,
            size: output.frame_size(),
        });
    }
    Ok(offset)
}

fn to_number(heap: &Heap, value: Tagged, offset: usize) -> Result<f64, OsrTranslationError> {
    heap.number_value(value)
        .ok_or(OsrTranslationError::NotANumber { offset, value })
}

fn to_int32(heap: &Heap, value: Tagged, offset: usize) -> Result<i32, OsrTranslationError> {
    let n = heap.number_value(value);
    n.map(|x| x as i32)
        .filter(|i| Some(f64::from(*i)) == n)
        .ok_or(OsrTranslationError::NotInt32 { offset, value })
}

fn to_uint32(heap: &Heap, value: Tagged, offset: usize) -> Result<u32, OsrTranslationError> {
    let n = heap.number_value(value);
    n.map(|x| x as u32)
        .filter(|u| Some(f64::from(*u)) == n)
        .ok_or(OsrTranslationError::NotUint32 { offset, value })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        deoptimizer::{
            BailoutType,
            test::{CALLER_FP, CALLER_PC, FP, capture, entry, function},
        },
        isolate::test::isolate,
        objects::{CodeIdx, FunctionIdx, OptimizedCodeDesc},
        tagged::Address,
    };
    use deoptmap::{Translation, TranslationBuffer};

    /// Optimised code for `f`'s loop at ast id 7, entered at offset 0x18 and holding three spill
    /// slots. `build` writes the translation of its two locals.
    fn osr_code(
        i: &mut Isolate,
        build: impl FnOnce(&mut Translation),
    ) -> (FunctionIdx, CodeIdx) {
        let f = function(i, "f", 0, &[7]);
        let mut buf = TranslationBuffer::new();
        let mut t = Translation::new(&mut buf, 1, 1).unwrap();
        t.begin_js_frame(BailoutId::new(7), SELF_LITERAL_ID, 2).unwrap();
        t.store_stack_slot(56).unwrap();
        build(&mut t);
        let c = i
            .install_optimized_code(
                f,
                OptimizedCodeDesc {
                    instructions: vec![0x90; 64],
                    translations: buf.into_bytes(),
                    literals: vec![],
                    entries: vec![entry(7, 0)],
                    safepoints: vec![],
                    stack_slots: 3,
                    osr: Some((BailoutId::new(7), 0x18)),
                    inlined_function_count: 0,
                },
            )
            .unwrap();
        (f, c)
    }

    fn from(i: &Isolate, f: FunctionIdx) -> Address {
        i.code(i.shared_of(f).code()).start() + 0x40
    }

    fn int32_and_double(t: &mut Translation) {
        t.store_double_stack_slot(0).unwrap();
        t.store_int32_register(Register::RBX as u8).unwrap();
    }

    #[test]
    fn enters_optimised_frame() {
        let mut i = isolate();
        let (f, c) = osr_code(&mut i, int32_and_double);
        let from = from(&i, f);
        let mut d = Deoptimizer::new(&i, f, BailoutType::Osr, 7, from, 32);
        assert_eq!(d.input().frame_size(), 56);
        let n = i.heap_mut().allocate_number(1.5);
        let recv = i.heap().undefined();
        capture(
            &i,
            &mut d,
            FP,
            &[(8, n.raw()), (0, Tagged::smi(-4).unwrap().raw())],
            &[recv],
        );
        d.compute_output_frames(&i);
        assert_eq!(d.state(), EpisodeState::FramesBuilt);
        assert_eq!(d.output_count(), 1);

        let o = d.output_frame(0);
        assert_eq!(o.frame_size(), 64);
        assert_eq!(o.fp(), FP);
        assert_eq!(o.top(), FP - 40);
        assert_eq!(o.pc(), i.code(c).start() + 0x18);
        assert_eq!(o.continuation(), i.builtin_address(Builtin::NotifyOsr));
        assert_eq!(o.tagged_frame_slot(56), recv);
        assert_eq!(o.frame_slot(48), CALLER_PC);
        assert_eq!(o.frame_slot(40), CALLER_FP);
        assert_eq!(o.tagged_frame_slot(32), i.function(f).context());
        assert_eq!(o.tagged_frame_slot(24), i.function(f).tagged());
        assert_eq!(o.double_frame_slot(0), 1.5);
        assert_eq!(o.register(Register::RBX), -4i64 as u64);
        assert_eq!(o.register(Register::FP), FP);
        d.commit();
        assert_eq!(d.state(), EpisodeState::Committed);
        assert_eq!(i.stats().get(Counter::OsrAborts), Some(0));
    }

    #[test]
    fn abort_resumes_unoptimised_frame() {
        let mut i = isolate();
        let (f, _) = osr_code(&mut i, int32_and_double);
        let from = from(&i, f);
        let mut d = Deoptimizer::new(&i, f, BailoutType::Osr, 7, from, 32);
        let n = i.heap_mut().allocate_number(1.5);
        let recv = i.heap().undefined();
        // An int32 local holding a fraction cannot be converted.
        let half = i.heap_mut().allocate_number(0.5);
        capture(&i, &mut d, FP, &[(8, n.raw()), (0, half.raw())], &[recv]);
        d.compute_output_frames(&i);
        assert_eq!(d.state(), EpisodeState::Aborted);

        let o = d.output_frame(0);
        assert_eq!(o.content(), d.input().content());
        assert_eq!(o.top(), d.input().top());
        assert_eq!(o.fp(), FP);
        assert_eq!(o.pc(), from);
        assert_eq!(o.continuation(), i.builtin_address(Builtin::NotifyOsr));
        assert_eq!(i.stats().get(Counter::OsrAborts), Some(1));
        d.commit();
        assert_eq!(d.state(), EpisodeState::Aborted);
    }

    #[test]
    fn duplicate_aborts() {
        let mut i = isolate();
        let (f, _) = osr_code(&mut i, |t| {
            let x = t.store_stack_slot(0).unwrap();
            t.store_duplicate(x).unwrap();
        });
        let from = from(&i, f);
        let mut d = Deoptimizer::new(&i, f, BailoutType::Osr, 7, from, 32);
        let recv = i.heap().undefined();
        capture(&i, &mut d, FP, &[], &[recv]);
        d.compute_output_frames(&i);
        assert_eq!(d.state(), EpisodeState::Aborted);
    }

    #[test]
    #[should_panic(expected = "but it was compiled for 7")]
    fn wrong_loop() {
        let mut i = isolate();
        let (f, _) = osr_code(&mut i, int32_and_double);
        let from = from(&i, f);
        Deoptimizer::new(&i, f, BailoutType::Osr, 8, from, 32);
    }

    #[test]
    fn conversions() {
        let mut h = Heap::new(None);
        let half = h.allocate_number(0.5);
        let big = h.allocate_number(4294967295.0);
        let neg = Tagged::smi(-2).unwrap();
        assert_eq!(to_int32(&h, neg, 0), Ok(-2));
        assert_eq!(
            to_uint32(&h, neg, 8),
            Err(OsrTranslationError::NotUint32 {
                offset: 8,
                value: neg
            })
        );
        assert_eq!(to_uint32(&h, big, 0), Ok(u32::MAX));
        assert!(to_int32(&h, big, 0).is_err());
        assert!(to_int32(&h, half, 0).is_err());
        assert_eq!(to_number(&h, half, 0), Ok(0.5));
        let u = h.undefined();
        assert!(matches!(
            to_number(&h, u, 16),
            Err(OsrTranslationError::NotANumber { offset: 16, .. })
        ));
    }
}
