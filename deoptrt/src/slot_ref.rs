//! Resolving a translation's value commands to values.

use crate::{
    errors::fatal,
    frame_description::FrameMemory,
    frames::{Register, XmmRegister},
    heap::{Heap, HeapObject},
    isolate::Isolate,
    objects::CodeIdx,
    tagged::Tagged,
};
use deoptmap::{Opcode, TranslationIterator};

/// Where one value of an unoptimised frame comes from, read out of an optimised frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SlotRef {
    /// A tagged word read from a register or stack slot.
    Tagged(Tagged),
    Int32(i32),
    Uint32(u32),
    Double(f64),
    Literal(Tagged),
    /// The arguments object of the frame being built. It has no value until the frame exists.
    ArgumentsObject,
}

impl SlotRef {
    /// Read the value command `opcode`, whose operands are next in `it`, against the optimised
    /// frame `memory`. `earlier` are the values of the translation's previous value commands, in
    /// order, against which `DUPLICATE` is resolved.
    pub fn read(
        opcode: Opcode,
        it: &mut TranslationIterator,
        memory: &dyn FrameMemory,
        literals: &[Tagged],
        earlier: &[SlotRef],
    ) -> SlotRef {
        match opcode {
            Opcode::Register => SlotRef::Tagged(Tagged::from_raw(memory.register(reg(it)))),
            Opcode::Int32Register => SlotRef::Int32(memory.register(reg(it)) as u32 as i32),
            Opcode::Uint32Register => SlotRef::Uint32(memory.register(reg(it)) as u32),
            Opcode::DoubleRegister => SlotRef::Double(memory.double_register(xmm(it))),
            Opcode::StackSlot => SlotRef::Tagged(Tagged::from_raw(memory.word(it.next_usize()))),
            Opcode::Int32StackSlot => SlotRef::Int32(memory.int32(it.next_usize())),
            Opcode::Uint32StackSlot => SlotRef::Uint32(memory.int32(it.next_usize()) as u32),
            Opcode::DoubleStackSlot => SlotRef::Double(memory.double(it.next_usize())),
            Opcode::Literal => {
                let idx = it.next_usize();
                match literals.get(idx) {
                    Some(t) => SlotRef::Literal(*t),
                    None => fatal!("literal {idx} outside pool of {}", literals.len()),
                }
            }
            Opcode::ArgumentsObject => SlotRef::ArgumentsObject,
            Opcode::Duplicate => {
                let idx = it.next_usize();
                match earlier.get(idx) {
                    Some(s) => *s,
                    None => fatal!("duplicate of command {idx} precedes it"),
                }
            }
            _ => fatal!("{opcode} is not a value command"),
        }
    }

    /// Does this value need a heap allocation to be represented as a tagged word?
    pub fn needs_allocation(&self) -> bool {
        match self {
            SlotRef::Tagged(_) | SlotRef::Literal(_) | SlotRef::ArgumentsObject => false,
            SlotRef::Int32(v) => !Tagged::is_valid_smi(i64::from(*v)),
            SlotRef::Uint32(v) => !Tagged::is_valid_smi(i64::from(*v)),
            SlotRef::Double(_) => true,
        }
    }

    /// The value as a tagged word, if it can be represented without allocating.
    pub fn immediate(&self) -> Option<Tagged> {
        match self {
            SlotRef::Tagged(t) | SlotRef::Literal(t) => Some(*t),
            SlotRef::Int32(v) => Tagged::smi(i64::from(*v)),
            SlotRef::Uint32(v) => Tagged::smi(i64::from(*v)),
            SlotRef::Double(_) | SlotRef::ArgumentsObject => None,
        }
    }

    /// The value as a number, if it is an untagged number.
    pub fn number(&self) -> Option<f64> {
        match self {
            SlotRef::Int32(v) => Some(f64::from(*v)),
            SlotRef::Uint32(v) => Some(f64::from(*v)),
            SlotRef::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a tagged word, boxing it on `heap` if it does not fit in a Smi.
    /// [SlotRef::ArgumentsObject] yields the arguments marker.
    pub fn value(&self, heap: &mut Heap) -> Tagged {
        match self {
            SlotRef::Tagged(t) | SlotRef::Literal(t) => *t,
            SlotRef::Int32(v) => {
                Tagged::smi(i64::from(*v)).unwrap_or_else(|| heap.allocate_number(f64::from(*v)))
            }
            SlotRef::Uint32(v) => {
                Tagged::smi(i64::from(*v)).unwrap_or_else(|| heap.allocate_number(f64::from(*v)))
            }
            SlotRef::Double(v) => heap.allocate_number(*v),
            SlotRef::ArgumentsObject => heap.arguments_marker(),
        }
    }

    /// Return the values of the actual arguments (excluding the receiver) of the
    /// `inlined_jsframe_index`th JavaScript frame described by deoptimisation entry
    /// `deopt_index` of `code`, read straight from the optimised frame `frame`. If an arguments
    /// adaptor frame sits below that frame, its arguments are the actual arguments, otherwise
    /// there are `formal_parameter_count` of them.
    pub fn compute_slot_mapping_for_arguments(
        isolate: &Isolate,
        code: CodeIdx,
        deopt_index: usize,
        frame: &dyn FrameMemory,
        inlined_jsframe_index: usize,
        formal_parameter_count: usize,
    ) -> Vec<SlotRef> {
        let Some(data) = isolate.code(code).deopt_input() else {
            fatal!("{} has no deoptimisation data", isolate.code(code).name())
        };
        let Some(entry) = data.entry(deopt_index) else {
            fatal!("no deoptimisation entry {deopt_index}")
        };
        let mut it = TranslationIterator::new(data.translations(), entry.translation_index);
        if it.next_opcode() != Opcode::Begin {
            fatal!("translation {} does not start with BEGIN", entry.translation_index);
        }
        it.skip(1);
        let jsframe_count = it.next_usize();
        if inlined_jsframe_index >= jsframe_count {
            fatal!("JavaScript frame {inlined_jsframe_index} of {jsframe_count} requested");
        }

        let mut values = Vec::new();
        let mut jsframes_to_skip = inlined_jsframe_index;
        loop {
            let opcode = it.next_opcode();
            match opcode {
                Opcode::Begin => fatal!("translation ended before frame {inlined_jsframe_index}"),
                Opcode::ArgumentsAdaptorFrame | Opcode::JsFrame if jsframes_to_skip == 0 => {
                    it.skip(2);
                    let height = it.next_usize();
                    let argc = if opcode == Opcode::ArgumentsAdaptorFrame {
                        // The adaptor's height counts the receiver.
                        height.saturating_sub(1)
                    } else {
                        formal_parameter_count
                    };
                    // Skip the receiver, which still counts as a command.
                    let opcode = it.next_opcode();
                    let receiver = SlotRef::read(opcode, &mut it, frame, data.literals(), &values);
                    values.push(receiver);
                    let mut args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        let opcode = it.next_opcode();
                        let v = SlotRef::read(opcode, &mut it, frame, data.literals(), &values);
                        values.push(v);
                        args.push(v);
                    }
                    return args;
                }
                Opcode::JsFrame => {
                    jsframes_to_skip -= 1;
                    it.skip(opcode.operand_count());
                }
                x if x.is_frame() => it.skip(x.operand_count()),
                x => {
                    let v = SlotRef::read(x, &mut it, frame, data.literals(), &values);
                    values.push(v);
                }
            }
        }
    }

    /// Allocate an arguments object for `callee` holding `args`.
    pub fn materialize_arguments(heap: &mut Heap, callee: Tagged, args: &[SlotRef]) -> Tagged {
        let elements = args.iter().map(|s| s.value(heap)).collect::<Vec<_>>();
        heap.allocate(HeapObject::Arguments { callee, elements })
    }
}

fn reg(it: &mut TranslationIterator) -> Register {
    let v = it.next();
    u8::try_from(v)
        .ok()
        .and_then(Register::from_repr)
        .unwrap_or_else(|| fatal!("invalid register {v}"))
}

fn xmm(it: &mut TranslationIterator) -> XmmRegister {
    let v = it.next();
    u8::try_from(v)
        .ok()
        .and_then(XmmRegister::from_repr)
        .unwrap_or_else(|| fatal!("invalid double register {v}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        deoptimizer::test::{entry, function, install},
        frame_description::FrameDescription,
        isolate::test::isolate,
        objects::FunctionIdx,
    };
    use deoptmap::{BailoutId, SELF_LITERAL_ID, Translation, TranslationBuffer};

    fn read_all(buf: &[u8], frame: &FrameDescription, literals: &[Tagged]) -> Vec<SlotRef> {
        let mut it = TranslationIterator::new(buf, 0);
        let mut out = Vec::new();
        while it.has_next() {
            let op = it.next_opcode();
            if op.is_value() {
                let v = SlotRef::read(op, &mut it, frame, literals, &out);
                out.push(v);
            } else {
                it.skip(op.operand_count());
            }
        }
        out
    }

    #[test]
    fn reads() {
        let mut f = FrameDescription::new(32, None);
        f.set_tagged_frame_slot(8, Tagged::smi(42).unwrap());
        f.set_double_frame_slot(16, 3.5);
        f.set_frame_slot(24, u64::from(u32::MAX));
        f.set_register(Register::RBX, (-5i32) as u32 as u64);
        f.set_double_register(XmmRegister::XMM2, -0.25);
        let mut buf = TranslationBuffer::new();
        let mut t = Translation::new(&mut buf, 1, 1).unwrap();
        let a = t.store_stack_slot(8).unwrap();
        let b = t.store_double_stack_slot(16).unwrap();
        t.store_uint32_stack_slot(24).unwrap();
        t.store_int32_register(Register::RBX as u8).unwrap();
        t.store_double_register(XmmRegister::XMM2 as u8).unwrap();
        t.store_literal(1).unwrap();
        t.store_duplicate(b).unwrap();
        t.store_duplicate(a).unwrap();
        t.store_arguments_object().unwrap();
        let lit = Tagged::from_raw(0x2000_0000_0001);
        let v = read_all(buf.as_bytes(), &f, &[Tagged::ZERO, lit]);
        assert_eq!(
            v,
            vec![
                SlotRef::Tagged(Tagged::smi(42).unwrap()),
                SlotRef::Double(3.5),
                SlotRef::Uint32(u32::MAX),
                SlotRef::Int32(-5),
                SlotRef::Double(-0.25),
                SlotRef::Literal(lit),
                SlotRef::Double(3.5),
                SlotRef::Tagged(Tagged::smi(42).unwrap()),
                SlotRef::ArgumentsObject,
            ]
        );
    }

    #[test]
    fn values() {
        let mut h = Heap::new(None);
        assert_eq!(SlotRef::Int32(-3).value(&mut h), Tagged::smi(-3).unwrap());
        assert!(!SlotRef::Int32(-3).needs_allocation());
        assert_eq!(SlotRef::Int32(-3).immediate(), Tagged::smi(-3));
        assert_eq!(SlotRef::Double(1.0).immediate(), None);
        let big = SlotRef::Uint32(u32::MAX);
        assert!(big.needs_allocation());
        let t = big.value(&mut h);
        assert_eq!(h.number_value(t), Some(4294967295.0));
        let d = SlotRef::Double(3.5).value(&mut h);
        assert_eq!(h.number_value(d), Some(3.5));
        assert_eq!(SlotRef::ArgumentsObject.value(&mut h), h.arguments_marker());
    }

    #[test]
    #[should_panic(expected = "literal 3 outside pool")]
    fn bad_literal() {
        let f = FrameDescription::new(8, None);
        let mut buf = TranslationBuffer::new();
        let mut t = Translation::new(&mut buf, 1, 1).unwrap();
        t.store_literal(3).unwrap();
        read_all(buf.as_bytes(), &f, &[]);
    }

    fn smi(v: i64) -> Tagged {
        Tagged::smi(v).unwrap()
    }

    /// An optimised frame of `f` with `g` inlined into it. Words 0 and 8 belong to `f`, the rest
    /// to `g` and whatever frames sit between the two.
    fn optimised_frame() -> FrameDescription {
        let mut frame = FrameDescription::new(48, None);
        for (off, v) in [(0, 1), (8, 2), (16, 0), (24, 10), (32, 20), (40, 30)] {
            frame.set_tagged_frame_slot(off, smi(v));
        }
        frame.set_register(Register::RBX, (-7i32) as u32 as u64);
        frame
    }

    /// Install `f`, with `g` inlined, as code whose only bailout is described by `build`.
    fn inlined(i: &mut Isolate, build: impl FnOnce(&mut TranslationBuffer)) -> (CodeIdx, FunctionIdx) {
        let f = function(i, "f", 0, &[5]);
        let g = function(i, "g", 1, &[6]);
        let mut buf = TranslationBuffer::new();
        build(&mut buf);
        let literals = vec![i.function(g).tagged()];
        let c = install(i, f, buf, literals, vec![entry(5, 0)], 2);
        (c, g)
    }

    fn outer_frame(t: &mut Translation) {
        t.begin_js_frame(BailoutId::new(5), SELF_LITERAL_ID, 1).unwrap();
        t.store_stack_slot(0).unwrap();
        t.store_stack_slot(8).unwrap();
    }

    #[test]
    fn arguments_from_adaptor_frame() {
        let mut i = isolate();
        let (c, g) = inlined(&mut i, |buf| {
            let mut t = Translation::new(buf, 3, 2).unwrap();
            outer_frame(&mut t);
            // g takes one parameter but was called with two.
            t.begin_arguments_adaptor_frame(0, 3).unwrap();
            t.store_stack_slot(16).unwrap();
            t.store_stack_slot(24).unwrap();
            t.store_stack_slot(32).unwrap();
            t.begin_js_frame(BailoutId::new(6), 0, 0).unwrap();
            t.store_stack_slot(16).unwrap();
            t.store_stack_slot(24).unwrap();
        });
        let frame = optimised_frame();
        let args = SlotRef::compute_slot_mapping_for_arguments(&i, c, 0, &frame, 1, 1);
        assert_eq!(args, vec![SlotRef::Tagged(smi(10)), SlotRef::Tagged(smi(20))]);

        let callee = i.function(g).tagged();
        let obj = SlotRef::materialize_arguments(i.heap_mut(), callee, &args);
        match i.heap().get(obj) {
            Some(HeapObject::Arguments { callee: c, elements }) => {
                assert_eq!(*c, callee);
                assert_eq!(elements, &vec![smi(10), smi(20)]);
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn arguments_from_formal_parameters() {
        let mut i = isolate();
        let (c, g) = inlined(&mut i, |buf| {
            let mut t = Translation::new(buf, 2, 2).unwrap();
            outer_frame(&mut t);
            t.begin_js_frame(BailoutId::new(6), 0, 1).unwrap();
            t.store_stack_slot(16).unwrap();
            t.store_int32_register(Register::RBX as u8).unwrap();
            t.store_stack_slot(40).unwrap();
        });
        let frame = optimised_frame();
        let formal = i.shared_of(g).formal_parameter_count() as usize;
        let args = SlotRef::compute_slot_mapping_for_arguments(&i, c, 0, &frame, 1, formal);
        assert_eq!(args, vec![SlotRef::Int32(-7)]);
        // The outermost frame has no parameters beyond its receiver.
        assert!(SlotRef::compute_slot_mapping_for_arguments(&i, c, 0, &frame, 0, 0).is_empty());

        let callee = i.function(g).tagged();
        let obj = SlotRef::materialize_arguments(i.heap_mut(), callee, &args);
        match i.heap().get(obj) {
            Some(HeapObject::Arguments { elements, .. }) => assert_eq!(elements, &vec![smi(-7)]),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn arguments_behind_stub_frame() {
        let mut i = isolate();
        let (c, _) = inlined(&mut i, |buf| {
            let mut t = Translation::new(buf, 3, 2).unwrap();
            outer_frame(&mut t);
            t.begin_construct_stub_frame(0, 2).unwrap();
            t.store_stack_slot(16).unwrap();
            let arg = t.store_stack_slot(32).unwrap();
            t.begin_js_frame(BailoutId::new(6), 0, 0).unwrap();
            t.store_stack_slot(16).unwrap();
            // The stub frame's values are still numbered.
            t.store_duplicate(arg).unwrap();
        });
        let frame = optimised_frame();
        let args = SlotRef::compute_slot_mapping_for_arguments(&i, c, 0, &frame, 1, 1);
        assert_eq!(args, vec![SlotRef::Tagged(smi(20))]);
    }

    #[test]
    #[should_panic(expected = "JavaScript frame 2 of 2 requested")]
    fn arguments_of_missing_frame() {
        let mut i = isolate();
        let (c, _) = inlined(&mut i, |buf| {
            let mut t = Translation::new(buf, 2, 2).unwrap();
            outer_frame(&mut t);
            t.begin_js_frame(BailoutId::new(6), 0, 0).unwrap();
            t.store_stack_slot(16).unwrap();
            t.store_stack_slot(24).unwrap();
        });
        SlotRef::compute_slot_mapping_for_arguments(&i, c, 0, &optimised_frame(), 2, 1);
    }
}
