//! Whole deoptimisation cycles: optimised frames on a simulated stack, trapping into an entry
//! table, being rewritten by the entry code and resumed through the continuation.

use deoptmap::{
    BailoutId, DeoptEntry, DeoptOutputData, FullCodeState, SELF_LITERAL_ID, Translation,
    TranslationBuffer,
};
use deoptrt::{
    BailoutType, Builtin, DeoptConfig, Isolate, StackMemory, Tagged,
    frames::{Register, XmmRegister},
    heap::HeapObject,
    log::{Log, stats::Stats},
    objects::{CodeIdx, FunctionIdx, OptimizedCodeDesc, UnoptimizedCodeDesc},
    trampoline::{MachineState, SimulatedStack, run_continuation, run_entry},
};

const STACK_BASE: u64 = 0x7000_0000;
const STACK_SIZE: usize = 4096;
const CALLER_PC: u64 = 0x5555_0040;
const CALLER_FP: u64 = 0x7fff_2000;

fn isolate() -> Isolate {
    Isolate::with_log(
        DeoptConfig::new().entry_count(16).unwrap(),
        Log::disabled(),
        Stats::with_output("-".into()),
    )
}

/// A closure whose unoptimised code resumes ast id `id` at offset `id * 16`.
fn function(i: &mut Isolate, name: &str, formal: u32, ids: &[i64]) -> FunctionIdx {
    let ctx = i.new_context(vec![]);
    let mut out = DeoptOutputData::new();
    for id in ids {
        out.add(BailoutId::new(*id), *id as u32 * 16, FullCodeState::NoRegisters);
    }
    let s = i.new_shared_function(
        name,
        formal,
        UnoptimizedCodeDesc {
            instructions: vec![0x90; 128],
            deopt_output: out,
        },
    );
    i.new_function(s, ctx)
}

fn unoptimized_pc(i: &Isolate, f: FunctionIdx, id: i64) -> u64 {
    i.code(i.shared_of(f).code()).start() + id as u64 * 16
}

fn optimized(
    i: &mut Isolate,
    f: FunctionIdx,
    buf: TranslationBuffer,
    literals: Vec<Tagged>,
    entry: DeoptEntry,
    stack_slots: u32,
    osr: Option<(BailoutId, u32)>,
) -> CodeIdx {
    i.install_optimized_code(
        f,
        OptimizedCodeDesc {
            instructions: vec![0x90; 64],
            translations: buf.into_bytes(),
            literals,
            entries: vec![entry],
            safepoints: vec![],
            stack_slots,
            osr,
            inlined_function_count: 0,
        },
    )
    .unwrap()
}

fn entry(ast_id: i64, pc_offset: Option<u32>) -> DeoptEntry {
    DeoptEntry {
        ast_id: BailoutId::new(ast_id),
        translation_index: 0,
        arguments_stack_height: 0,
        pc_offset,
    }
}

/// Lay out a frame of `f` on `stack` with its frame pointer at `fp`: the receiver, the caller's
/// pc and fp, the context and the function, then `locals` downwards. Returns the stack pointer.
fn push_frame(
    i: &Isolate,
    stack: &mut SimulatedStack,
    f: FunctionIdx,
    fp: u64,
    receiver: Tagged,
    locals: &[u64],
) -> u64 {
    stack.write_word(fp + 16, receiver.raw());
    stack.write_word(fp + 8, CALLER_PC);
    stack.write_word(fp, CALLER_FP);
    stack.write_word(fp - 8, i.function(f).context().raw());
    stack.write_word(fp - 16, i.function(f).tagged().raw());
    let mut sp = fp - 16;
    for l in locals {
        sp -= 8;
        stack.write_word(sp, *l);
    }
    sp
}

fn machine(i: &Isolate, f: FunctionIdx, sp: u64, fp: u64, pc: u64) -> MachineState {
    let mut m = MachineState::new();
    m.set_register(Register::SP, sp);
    m.set_register(Register::FP, fp);
    m.set_register(Register::CONTEXT, i.function(f).context().raw());
    m.pc = pc;
    m
}

#[test]
fn eager_cycle_with_inlined_frame() {
    let mut i = isolate();
    let f = function(&mut i, "f", 0, &[1]);
    let g = function(&mut i, "g", 0, &[2]);
    let g_tagged = i.function(g).tagged();
    let undefined = i.heap().undefined();
    let mut buf = TranslationBuffer::new();
    let mut t = Translation::new(&mut buf, 2, 2).unwrap();
    t.begin_js_frame(BailoutId::new(1), SELF_LITERAL_ID, 0).unwrap();
    t.store_stack_slot(40).unwrap();
    t.begin_js_frame(BailoutId::new(2), 0, 2).unwrap();
    t.store_literal(1).unwrap();
    t.store_double_stack_slot(0).unwrap();
    t.store_double_register(XmmRegister::XMM3 as u8).unwrap();
    optimized(&mut i, f, buf, vec![g_tagged, undefined], entry(1, None), 1, None);

    let mut stack = SimulatedStack::new(STACK_BASE, STACK_SIZE);
    let fp = stack.limit() - 64;
    let sp = push_frame(&i, &mut stack, f, fp, undefined, &[3.5f64.to_bits()]);
    let pc = i
        .deoptimizer_data()
        .get_deoptimization_entry(0, BailoutType::Eager);
    let mut m = machine(&i, f, sp, fp, pc);
    m.double_registers[XmmRegister::XMM3 as usize] = -1.0;

    run_entry(&i, &mut stack, &mut m);
    assert_eq!(m.pc, i.builtin_address(Builtin::NotifyDeoptimized));
    // f's frame (40 bytes) replaces the optimised frame; g's (56 bytes) sits below it, topped by
    // the full code state and g's pc.
    let f_top = fp - 16;
    let g_top = f_top - 56;
    assert_eq!(m.sp(), g_top - 16);
    assert_eq!(stack.read_word(m.sp()), unoptimized_pc(&i, g, 2));
    assert_eq!(
        stack.read_word(m.sp() + 8),
        Tagged::smi(FullCodeState::NoRegisters as i64).unwrap().raw()
    );
    assert_eq!(m.fp(), g_top + 32);
    assert_eq!(m.register(Register::CONTEXT), i.function(g).context().raw());
    assert_eq!(stack.read_word(f_top + 32), undefined.raw());
    assert_eq!(stack.read_word(f_top + 24), CALLER_PC);
    assert_eq!(stack.read_word(f_top + 16), CALLER_FP);
    assert_eq!(stack.read_word(g_top + 48), undefined.raw());
    assert_eq!(stack.read_word(g_top + 40), unoptimized_pc(&i, f, 1));
    assert_eq!(stack.read_word(g_top + 32), fp);
    assert_eq!(stack.read_word(g_top + 16), g_tagged.raw());
    assert_eq!(stack.read_word(g_top), i.heap().arguments_marker().raw());

    run_continuation(&mut i, &mut stack, &mut m, &[]);
    assert_eq!(m.pc, unoptimized_pc(&i, g, 2));
    assert_eq!(m.sp(), g_top);
    let a = Tagged::from_raw(stack.read_word(g_top + 8));
    let b = Tagged::from_raw(stack.read_word(g_top));
    assert_eq!(i.heap().number_value(a), Some(3.5));
    assert_eq!(i.heap().number_value(b), Some(-1.0));
    // Nothing else runs f's optimised code, so f simply drops it.
    assert!(!i.is_optimized(f));
    assert_eq!(i.deoptimizer_data().deoptimized_code_count(), 0);
    assert!(i.deoptimizer_data().grab().is_none());
}

#[test]
fn eager_with_live_activations_invalidates() {
    let mut i = isolate();
    let f = function(&mut i, "f", 0, &[1]);
    let mut buf = TranslationBuffer::new();
    let mut t = Translation::new(&mut buf, 1, 1).unwrap();
    t.begin_js_frame(BailoutId::new(1), SELF_LITERAL_ID, 0).unwrap();
    t.store_stack_slot(32).unwrap();
    let c = optimized(&mut i, f, buf, vec![], entry(1, Some(8)), 0, None);

    let mut stack = SimulatedStack::new(STACK_BASE, STACK_SIZE);
    let fp = stack.limit() - 64;
    let undefined = i.heap().undefined();
    let sp = push_frame(&i, &mut stack, f, fp, undefined, &[]);
    let pc = i
        .deoptimizer_data()
        .get_deoptimization_entry(0, BailoutType::Eager);
    let mut m = machine(&i, f, sp, fp, pc);
    run_entry(&i, &mut stack, &mut m);
    run_continuation(&mut i, &mut stack, &mut m, &[c]);
    assert_eq!(m.pc, unoptimized_pc(&i, f, 1));
    assert!(!i.is_optimized(f));
    assert!(!i.code(c).relocation_valid());
    assert_eq!(i.deoptimizer_data().deoptimized_code_count(), 1);
}

#[test]
fn lazy_cycle() {
    let mut i = isolate();
    let f = function(&mut i, "f", 0, &[1]);
    let mut buf = TranslationBuffer::new();
    let mut t = Translation::new(&mut buf, 1, 1).unwrap();
    t.begin_js_frame(BailoutId::new(1), SELF_LITERAL_ID, 1).unwrap();
    t.store_stack_slot(32).unwrap();
    t.store_register(Register::RAX as u8).unwrap();
    let c = optimized(&mut i, f, buf, vec![], entry(1, Some(8)), 0, None);
    i.deoptimize_function(f);
    assert!(!i.is_optimized(f));

    // The activation returns into the patched call, which calls the lazy entry.
    let mut stack = SimulatedStack::new(STACK_BASE, STACK_SIZE);
    let fp = stack.limit() - 64;
    let undefined = i.heap().undefined();
    let sp = push_frame(&i, &mut stack, f, fp, undefined, &[]);
    let from = i.code(c).start() + 8 + 13;
    stack.write_word(sp - 8, from);
    let pc = i
        .deoptimizer_data()
        .get_deoptimization_entry(0, BailoutType::Lazy);
    let mut m = machine(&i, f, sp - 8, fp, pc);
    let result = i.heap_mut().allocate(HeapObject::String("result".into()));
    m.set_register(Register::RAX, result.raw());

    run_entry(&i, &mut stack, &mut m);
    assert_eq!(m.pc, i.builtin_address(Builtin::NotifyLazyDeoptimized));
    run_continuation(&mut i, &mut stack, &mut m, &[]);
    assert_eq!(m.pc, unoptimized_pc(&i, f, 1));
    // f's frame is one word taller than the optimised frame was.
    assert_eq!(m.sp(), fp - 24);
    assert_eq!(stack.read_word(fp - 24), result.raw());
    assert_eq!(i.stats().get(deoptrt::log::stats::Counter::DeoptsLazy), Some(1));

    assert_eq!(i.release_zombie_code(&[c]), 0);
    assert_eq!(i.release_zombie_code(&[]), 1);
    assert!(i.code(c).is_released());
    assert_eq!(i.find_code_for_address(from), None);
}

/// An unoptimised frame of `f`, running the loop at ast id 7 with two locals, about to call the
/// OSR entry. Returns the stack, the machine state and the return address of the call.
fn osr_setup(
    i: &mut Isolate,
    locals: impl FnOnce(&mut Isolate) -> [Tagged; 2],
) -> (SimulatedStack, MachineState, u64, FunctionIdx, CodeIdx) {
    let f = function(i, "f", 0, &[7]);
    let mut buf = TranslationBuffer::new();
    let mut t = Translation::new(&mut buf, 1, 1).unwrap();
    t.begin_js_frame(BailoutId::new(7), SELF_LITERAL_ID, 2).unwrap();
    t.store_stack_slot(56).unwrap();
    t.store_double_stack_slot(0).unwrap();
    t.store_int32_register(Register::RBX as u8).unwrap();
    let c = optimized(
        i,
        f,
        buf,
        vec![],
        entry(7, None),
        3,
        Some((BailoutId::new(7), 0x18)),
    );

    let [a, b] = locals(i);
    let mut stack = SimulatedStack::new(STACK_BASE, STACK_SIZE);
    let fp = stack.limit() - 64;
    let undefined = i.heap().undefined();
    let sp = push_frame(i, &mut stack, f, fp, undefined, &[a.raw(), b.raw()]);
    let from = i.code(i.shared_of(f).code()).start() + 0x40;
    stack.write_word(sp - 8, from);
    let pc = i
        .deoptimizer_data()
        .get_deoptimization_entry(7, BailoutType::Osr);
    let m = machine(i, f, sp - 8, fp, pc);
    (stack, m, from, f, c)
}

#[test]
fn osr_enters_optimised_code() {
    let mut i = isolate();
    let (mut stack, mut m, _, _, c) = osr_setup(&mut i, |i| {
        [i.heap_mut().allocate_number(0.5), Tagged::smi(12).unwrap()]
    });
    let fp = m.fp();
    run_entry(&i, &mut stack, &mut m);
    assert_eq!(m.pc, i.builtin_address(Builtin::NotifyOsr));
    assert_eq!(m.register(Register::RBX), 12);
    run_continuation(&mut i, &mut stack, &mut m, &[]);
    assert_eq!(m.pc, i.code(c).start() + 0x18);
    assert_eq!(m.fp(), fp);
    // Three spill slots below the function, the first holding the unboxed double.
    assert_eq!(m.sp(), fp - 40);
    assert_eq!(f64::from_bits(stack.read_word(fp - 40)), 0.5);
    assert_eq!(stack.read_word(fp + 8), CALLER_PC);
}

#[test]
fn osr_abort_leaves_frame_untouched() {
    let mut i = isolate();
    let (mut stack, mut m, from, _, _) = osr_setup(&mut i, |i| {
        let s = i.heap_mut().allocate(HeapObject::String("x".into()));
        [Tagged::smi(1).unwrap(), s]
    });
    let before = stack.clone();
    let original = m.clone();
    run_entry(&i, &mut stack, &mut m);
    assert_eq!(m.pc, i.builtin_address(Builtin::NotifyOsr));
    run_continuation(&mut i, &mut stack, &mut m, &[]);

    // As if the call had simply returned.
    assert_eq!(m.pc, from);
    assert_eq!(m.sp(), original.sp() + 8);
    assert_eq!(m.fp(), original.fp());
    assert_eq!(
        m.register(Register::CONTEXT),
        original.register(Register::CONTEXT)
    );
    let mut addr = original.sp();
    while addr < stack.limit() {
        assert_eq!(stack.read_word(addr), before.read_word(addr), "{addr:#x}");
        addr += 8;
    }
    assert_eq!(i.stats().get(deoptrt::log::stats::Counter::OsrAborts), Some(1));
}

#[test]
#[should_panic(expected = "fatal deoptimisation error: no deoptimisation in progress")]
fn continuation_without_episode() {
    let mut i = isolate();
    let mut stack = SimulatedStack::new(STACK_BASE, STACK_SIZE);
    let mut m = MachineState::new();
    m.set_register(Register::SP, stack.limit() - 8);
    m.pc = i.builtin_address(Builtin::NotifyDeoptimized);
    run_continuation(&mut i, &mut stack, &mut m, &[]);
}

#[test]
fn isolates_are_independent() {
    fn episode(gc_interval: usize) -> f64 {
        let mut i = Isolate::with_log(
            DeoptConfig::new()
                .entry_count(16)
                .unwrap()
                .gc_interval(gc_interval)
                .unwrap(),
            Log::disabled(),
            Stats::disabled(),
        );
        let f = function(&mut i, "f", 0, &[1]);
        let mut buf = TranslationBuffer::new();
        let mut t = Translation::new(&mut buf, 1, 1).unwrap();
        t.begin_js_frame(BailoutId::new(1), SELF_LITERAL_ID, 1).unwrap();
        t.store_stack_slot(40).unwrap();
        t.store_double_stack_slot(0).unwrap();
        optimized(&mut i, f, buf, vec![], entry(1, None), 1, None);

        let mut stack = SimulatedStack::new(STACK_BASE, STACK_SIZE);
        let fp = stack.limit() - 64;
        let undefined = i.heap().undefined();
        let v = gc_interval as f64 + 0.5;
        let sp = push_frame(&i, &mut stack, f, fp, undefined, &[v.to_bits()]);
        let pc = i
            .deoptimizer_data()
            .get_deoptimization_entry(0, BailoutType::Eager);
        let mut m = machine(&i, f, sp, fp, pc);
        run_entry(&i, &mut stack, &mut m);
        run_continuation(&mut i, &mut stack, &mut m, &[]);
        let n = Tagged::from_raw(stack.read_word(m.sp()));
        i.heap().number_value(n).unwrap()
    }

    std::thread::scope(|s| {
        let hs = (1..=4)
            .map(|n| s.spawn(move || episode(n)))
            .collect::<Vec<_>>();
        for (n, h) in (1..=4).zip(hs) {
            assert_eq!(h.join().unwrap(), n as f64 + 0.5);
        }
    });
}
