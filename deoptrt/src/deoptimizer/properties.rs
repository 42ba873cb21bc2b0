//! Properties of output frames built from randomly generated translations of an optimised frame
//! with any number of JavaScript functions, some called through an arguments adaptor, inlined
//! into it.

use super::{
    BailoutType, Deoptimizer,
    test::{FP, capture, entry, function, install},
};
use crate::{
    frames::{FrameType, Register, XmmRegister},
    isolate::{Builtin, Isolate, test::isolate},
    objects::FunctionIdx,
    tagged::{Tagged, WORD_SIZE},
};
use deoptmap::{BailoutId, CommandIndex, SELF_LITERAL_ID, Translation, TranslationBuffer};
use proptest::prelude::*;

/// Spill slots of the optimised frame.
const SPILLS: usize = 6;
const REGISTERS: [Register; 3] = [Register::RBX, Register::RCX, Register::RDX];
const XMM_REGISTERS: [XmmRegister; 2] = [XmmRegister::XMM1, XmmRegister::XMM2];
/// Literals other than the inlined closures.
const CONSTANTS: usize = 2;

#[derive(Clone, Copy, Debug)]
enum Source {
    Slot(usize),
    Int32Slot(usize),
    DoubleSlot(usize),
    Register(usize),
    Int32Register(usize),
    DoubleRegister(usize),
    Constant(usize),
    /// A repeat of an earlier command, chosen modulo the number of commands before it.
    Duplicate(usize),
}

/// A function inlined into the optimised one.
#[derive(Clone, Debug)]
struct Inlined {
    /// How many arguments an adaptor frame passes to it, if it was called through one.
    adaptor_argc: Option<usize>,
    formal: u32,
    height: usize,
}

#[derive(Clone, Debug)]
struct Activation {
    height: usize,
    inlined: Vec<Inlined>,
    /// Consumed in order by the frames' value commands.
    sources: Vec<Source>,
    spills: [i64; SPILLS],
    registers: [i64; 3],
    doubles: [f64; 2],
}

fn source() -> impl Strategy<Value = Source> {
    prop_oneof![
        (0..SPILLS).prop_map(Source::Slot),
        (0..SPILLS).prop_map(Source::Int32Slot),
        (0..SPILLS).prop_map(Source::DoubleSlot),
        (0..REGISTERS.len()).prop_map(Source::Register),
        (0..REGISTERS.len()).prop_map(Source::Int32Register),
        (0..XMM_REGISTERS.len()).prop_map(Source::DoubleRegister),
        (0..CONSTANTS).prop_map(Source::Constant),
        any::<usize>().prop_map(Source::Duplicate),
    ]
}

fn smi_value() -> impl Strategy<Value = i64> {
    Tagged::SMI_MIN..=Tagged::SMI_MAX
}

fn activation() -> impl Strategy<Value = Activation> {
    let inlined = (proptest::option::of(0..3usize), 0..3u32, 0..3usize).prop_map(
        |(adaptor_argc, formal, height)| Inlined {
            adaptor_argc,
            formal,
            height,
        },
    );
    (
        0..3usize,
        proptest::collection::vec(inlined, 0..4),
        proptest::collection::vec(source(), 64),
        proptest::array::uniform6(smi_value()),
        proptest::array::uniform3(smi_value()),
        proptest::array::uniform2(any::<f64>()),
    )
        .prop_map(
            |(height, inlined, sources, spills, registers, doubles)| Activation {
                height,
                inlined,
                sources,
                spills,
                registers,
                doubles,
            },
        )
}

/// What a value command should leave in its slot.
#[derive(Clone, Copy, Debug)]
enum Expected {
    Tagged(Tagged),
    Number(f64),
}

fn int32(v: i32) -> Expected {
    match Tagged::smi(i64::from(v)) {
        Some(t) => Expected::Tagged(t),
        None => Expected::Number(f64::from(v)),
    }
}

/// A value command written to a frame: the frame, the slot's offset and the command's index.
struct Placed {
    frame: usize,
    offset: usize,
    command: usize,
}

struct Built {
    f: FunctionIdx,
    inlined: Vec<FunctionIdx>,
    /// Every value command, duplicates resolved to the index of the command they repeat.
    commands: Vec<Source>,
    placed: Vec<Placed>,
    frame_count: usize,
}

/// Install code for an activation of `a`'s shape.
fn build(i: &mut Isolate, a: &Activation) -> Built {
    let f = function(i, "f", 0, &[1]);
    let inlined = a
        .inlined
        .iter()
        .enumerate()
        .map(|(j, g)| function(i, &format!("g{j}"), g.formal, &[j as i64 + 2]))
        .collect::<Vec<_>>();
    let mut literals = inlined
        .iter()
        .map(|g| i.function(*g).tagged())
        .collect::<Vec<_>>();
    literals.push(Tagged::smi(7).unwrap());
    literals.push(i.heap().undefined());

    let frame_count = 1 + a
        .inlined
        .iter()
        .map(|g| 1 + usize::from(g.adaptor_argc.is_some()))
        .sum::<usize>();
    let mut buf = TranslationBuffer::new();
    let mut t = Translation::new(&mut buf, frame_count, 1 + a.inlined.len()).unwrap();
    let mut sources = a.sources.iter().copied();
    let mut commands = Vec::new();
    let mut placed = Vec::new();
    // Store `n` commands into frame `frame` from `offset` down.
    let mut store = |t: &mut Translation, frame: usize, offset: usize, n: usize| {
        for k in 0..n {
            let s = match sources.next().unwrap() {
                Source::Duplicate(_) if commands.is_empty() => Source::Slot(0),
                Source::Duplicate(x) => Source::Duplicate(x % commands.len()),
                s => s,
            };
            let stored = match s {
                Source::Slot(x) => t.store_stack_slot((x * WORD_SIZE) as u32),
                Source::Int32Slot(x) => t.store_int32_stack_slot((x * WORD_SIZE) as u32),
                Source::DoubleSlot(x) => t.store_double_stack_slot((x * WORD_SIZE) as u32),
                Source::Register(x) => t.store_register(REGISTERS[x] as u8),
                Source::Int32Register(x) => t.store_int32_register(REGISTERS[x] as u8),
                Source::DoubleRegister(x) => t.store_double_register(XMM_REGISTERS[x] as u8),
                Source::Constant(x) => t.store_literal((inlined.len() + x) as u32),
                Source::Duplicate(x) => t.store_duplicate(CommandIndex(x as u32)),
            };
            stored.unwrap();
            placed.push(Placed {
                frame,
                offset: offset - (k + 1) * WORD_SIZE,
                command: commands.len(),
            });
            commands.push(s);
        }
    };

    t.begin_js_frame(BailoutId::new(1), SELF_LITERAL_ID, a.height as u32)
        .unwrap();
    // The receiver sits above the fixed part of the frame, the locals below it.
    let size = js_frame_size(0, a.height);
    store(&mut t, 0, size, 1);
    store(&mut t, 0, a.height * WORD_SIZE, a.height);
    let mut frame = 1;
    for (j, g) in a.inlined.iter().enumerate() {
        if let Some(argc) = g.adaptor_argc {
            t.begin_arguments_adaptor_frame(j as i64, argc as u32 + 1)
                .unwrap();
            store(&mut t, frame, adaptor_frame_size(argc), argc + 1);
            frame += 1;
        }
        t.begin_js_frame(BailoutId::new(j as i64 + 2), j as i64, g.height as u32)
            .unwrap();
        let size = js_frame_size(g.formal, g.height);
        store(&mut t, frame, size, g.formal as usize + 1);
        store(&mut t, frame, g.height * WORD_SIZE, g.height);
        frame += 1;
    }
    install(i, f, buf, literals, vec![entry(1, 0)], SPILLS as u32);
    Built {
        f,
        inlined,
        commands,
        placed,
        frame_count,
    }
}

fn js_frame_size(formal: u32, height: usize) -> usize {
    (formal as usize + 1 + 4 + height) * WORD_SIZE
}

fn adaptor_frame_size(argc: usize) -> usize {
    (argc + 1 + 4) * WORD_SIZE
}

/// The value command `c` should produce from the optimised frame `a`.
fn expected(a: &Activation, b: &Built, literals: &[Tagged], c: usize) -> Expected {
    let spill = |x: usize| Tagged::smi_unchecked(a.spills[x]).raw();
    let register = |x: usize| Tagged::smi_unchecked(a.registers[x]).raw();
    match b.commands[c] {
        Source::Slot(x) => Expected::Tagged(Tagged::from_raw(spill(x))),
        Source::Int32Slot(x) => int32(spill(x) as u32 as i32),
        Source::DoubleSlot(x) => Expected::Number(f64::from_bits(spill(x))),
        Source::Register(x) => Expected::Tagged(Tagged::from_raw(register(x))),
        Source::Int32Register(x) => int32(register(x) as u32 as i32),
        Source::DoubleRegister(x) => Expected::Number(a.doubles[x]),
        Source::Constant(x) => Expected::Tagged(literals[b.inlined.len() + x]),
        Source::Duplicate(x) => expected(a, b, literals, x),
    }
}

/// The command a duplicate ultimately repeats.
fn original(b: &Built, mut c: usize) -> usize {
    while let Source::Duplicate(x) = b.commands[c] {
        c = x;
    }
    c
}

fn deoptimize(i: &Isolate, a: &Activation, b: &Built) -> Box<Deoptimizer> {
    let delta = 2 * WORD_SIZE + SPILLS * WORD_SIZE;
    let mut d = Deoptimizer::new(i, b.f, BailoutType::Eager, 0, 0, delta);
    let slots = a
        .spills
        .iter()
        .enumerate()
        .map(|(x, v)| (x * WORD_SIZE, Tagged::smi_unchecked(*v).raw()))
        .collect::<Vec<_>>();
    capture(i, &mut d, FP, &slots, &[i.heap().undefined()]);
    let input = d.input_mut();
    for (r, v) in REGISTERS.iter().zip(a.registers) {
        input.set_register(*r, Tagged::smi_unchecked(v).raw());
    }
    for (r, v) in XMM_REGISTERS.iter().zip(a.doubles) {
        input.set_double_register(*r, v);
    }
    d.compute_output_frames(i);
    d
}

proptest! {
    #[test]
    fn frames_chain(a in activation()) {
        let mut i = isolate();
        let b = build(&mut i, &a);
        let d = deoptimize(&i, &a, &b);
        prop_assert_eq!(d.output_count(), b.frame_count);
        prop_assert_eq!(d.jsframe_count(), 1 + a.inlined.len());

        let o0 = d.output_frame(0);
        prop_assert_eq!(o0.frame_size(), js_frame_size(0, a.height));
        prop_assert_eq!(o0.top(), FP - (2 * WORD_SIZE + a.height * WORD_SIZE) as u64);
        prop_assert_eq!(o0.fp(), FP);

        let mut sizes = Vec::new();
        for g in &a.inlined {
            if let Some(argc) = g.adaptor_argc {
                sizes.push((FrameType::ArgumentsAdaptor, adaptor_frame_size(argc)));
            }
            sizes.push((FrameType::JavaScript, js_frame_size(g.formal, g.height)));
        }
        for (k, (ty, size)) in sizes.into_iter().enumerate() {
            let (prev, o) = (d.output_frame(k), d.output_frame(k + 1));
            prop_assert_eq!(o.frame_type(), ty);
            prop_assert_eq!(o.frame_size(), size);
            prop_assert_eq!(o.top(), prev.top() - o.frame_size() as u64);
            prop_assert_eq!(o.caller_pc(), prev.pc());
            prop_assert_eq!(o.caller_fp(), prev.fp());
        }

        for k in 0..d.output_count() {
            let continuation = if k + 1 == d.output_count() {
                i.builtin_address(Builtin::NotifyDeoptimized)
            } else {
                0
            };
            prop_assert_eq!(d.output_frame(k).continuation(), continuation);
        }
    }

    #[test]
    fn values_round_trip(a in activation()) {
        let mut i = isolate();
        let b = build(&mut i, &a);
        let literals = i.code(i.function(b.f).code()).deopt_input().unwrap().literals().to_vec();
        let mut d = deoptimize(&i, &a, &b);
        let marker = i.heap().arguments_marker();
        for p in &b.placed {
            let slot = d.output_frame(p.frame).tagged_frame_slot(p.offset);
            match expected(&a, &b, &literals, p.command) {
                Expected::Tagged(t) => prop_assert_eq!(slot, t),
                Expected::Number(_) => prop_assert_eq!(slot, marker),
            }
        }

        d.materialize_heap_numbers(&mut i);
        for p in &b.placed {
            let slot = d.output_frame(p.frame).tagged_frame_slot(p.offset);
            match expected(&a, &b, &literals, p.command) {
                Expected::Tagged(t) => prop_assert_eq!(slot, t),
                Expected::Number(n) => prop_assert_eq!(
                    i.heap().number_value(slot).map(f64::to_bits),
                    Some(n.to_bits())
                ),
            }
        }
    }

    #[test]
    fn duplicates_are_identical(a in activation()) {
        let mut i = isolate();
        let b = build(&mut i, &a);
        let mut d = deoptimize(&i, &a, &b);
        d.materialize_heap_numbers(&mut i);
        let slot = |c: usize| {
            let p = &b.placed[c];
            d.output_frame(p.frame).tagged_frame_slot(p.offset)
        };
        for c in 0..b.commands.len() {
            if let Source::Duplicate(_) = b.commands[c] {
                // A repeated number shares its heap object, so the words are identical.
                prop_assert_eq!(slot(c), slot(original(&b, c)));
            }
        }
    }
}
