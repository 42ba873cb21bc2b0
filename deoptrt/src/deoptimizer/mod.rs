//! The deoptimiser: turning one optimised activation into the unoptimised frames it stands for.
//!
//! An episode starts when optimised code traps into an entry table. The entry code captures the
//! optimised frame into an input [FrameDescription] and creates a [Deoptimizer]. Running
//! [Deoptimizer::compute_output_frames] walks the code's translation for the bailout, building
//! one output frame per logical frame. The entry code then writes those frames onto the stack in
//! place of the optimised frame and resumes in the innermost of them.
//!
//! Values which need a heap allocation (boxed numbers and arguments objects) cannot be created
//! while frames are being built, because an allocation may trigger a collection. Their slots are
//! filled with the arguments marker and they are materialised once the frames are on the stack.

use crate::{
    code_patch::{self, PATCH_SIZE},
    errors::{fatal, fatal_logged},
    frame_description::{FrameDescription, StackMemory},
    frames::{self, FrameType},
    heap::{HeapObject, RootVisitor},
    isolate::Isolate,
    log::{
        Verbosity,
        stats::{Counter, TimingState},
    },
    objects::{Code, CodeIdx, CodeKind, FunctionIdx},
    slot_ref::SlotRef,
    tagged::{Address, Tagged, WORD_SIZE},
};
use byteorder::{ByteOrder, LittleEndian};
use deoptmap::{BailoutId, DeoptInputData};
use std::sync::Arc;
use strum::{Display, EnumCount, FromRepr};

pub mod data;
mod osr;
#[cfg(test)]
mod properties;
mod translate;

/// Why an episode was started.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum BailoutType {
    /// A check in the optimised code failed.
    Eager,
    /// An activation returned into optimised code that was invalidated while it was on the stack.
    Lazy,
    /// An unoptimised loop is entering optimised code.
    Osr,
    /// The debugger wants to inspect an optimised activation as unoptimised frames.
    Debugger,
}

impl BailoutType {
    fn counter(self) -> Counter {
        match self {
            BailoutType::Eager => Counter::DeoptsEager,
            BailoutType::Lazy => Counter::DeoptsLazy,
            BailoutType::Osr => Counter::DeoptsOsr,
            BailoutType::Debugger => Counter::DeoptsDebugger,
        }
    }
}

/// The lifecycle of an episode.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum EpisodeState {
    /// The input frame has been (or is being) filled in.
    Captured,
    Translating,
    FramesBuilt,
    /// The output frames have been handed to the entry code.
    Committed,
    /// An OSR translation failed: the single output frame is the input frame.
    Aborted,
}

/// Where an output frame ended up, kept so that arguments objects can be materialised after the
/// frames have been moved onto the stack.
#[derive(Clone, Copy, Debug)]
struct FrameLayout {
    frame_type: FrameType,
    top: Address,
    frame_size: usize,
    /// Incoming parameters, including the receiver.
    parameter_count: usize,
    function: Option<Tagged>,
}

impl FrameLayout {
    /// The address of incoming parameter `k`, where parameter 0 is the receiver.
    fn parameter_address(&self, k: usize) -> Address {
        self.top + (self.frame_size - WORD_SIZE * (k + 1)) as u64
    }
}

/// Where the value of one value command was written.
#[derive(Clone, Copy, Debug)]
struct ValueSlot {
    frame_index: usize,
    /// `None` for a value that was read but not written, such as an accessor's receiver.
    address: Option<Address>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct DeferredNumber {
    address: Address,
    value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct DeferredDuplicate {
    address: Address,
    source: Address,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct DeferredArguments {
    frame_index: usize,
    address: Address,
}

/// One deoptimisation episode.
#[derive(Debug)]
pub struct Deoptimizer {
    function: FunctionIdx,
    function_tagged: Tagged,
    code: CodeIdx,
    data: Arc<DeoptInputData<Tagged>>,
    bailout_type: BailoutType,
    /// The entry id the trap came through: an index into the code's deoptimisation entries, or
    /// for OSR the AST id of the loop being entered.
    bailout_id: usize,
    /// The index of the deoptimisation entry whose translation is used.
    entry_index: usize,
    /// The return address of the trap, or 0 for eager bailouts.
    from: Address,
    fp_to_sp_delta: usize,
    state: EpisodeState,
    arguments_marker: Tagged,
    input: Box<FrameDescription>,
    /// Outermost frame first.
    output: Vec<Option<Box<FrameDescription>>>,
    jsframe_count: usize,
    layouts: Vec<FrameLayout>,
    /// The value of every value command read so far, in order.
    values: Vec<SlotRef>,
    value_slots: Vec<ValueSlot>,
    deferred_numbers: Vec<DeferredNumber>,
    deferred_duplicates: Vec<DeferredDuplicate>,
    deferred_arguments: Vec<DeferredArguments>,
    /// Heap numbers allocated by this episode.
    materialized: Vec<Tagged>,
}

impl Deoptimizer {
    /// Start an episode for `function`, which trapped through entry `bailout_id` of the
    /// `bailout_type` table with return address `from`. Its frame pointer is `fp_to_sp_delta`
    /// bytes above the stack pointer.
    ///
    /// # Panics
    ///
    /// If the code's deoptimisation metadata does not agree with the trap.
    pub fn new(
        isolate: &Isolate,
        function: FunctionIdx,
        bailout_type: BailoutType,
        bailout_id: usize,
        from: Address,
        fp_to_sp_delta: usize,
    ) -> Box<Self> {
        let code = match bailout_type {
            BailoutType::Eager | BailoutType::Osr => isolate.function(function).code(),
            // The function may have been switched to other code since this activation entered.
            // `from` is a return address, so a site patched at the very end of the code returns
            // to one byte past it: look up the last byte of the call instead.
            BailoutType::Lazy => isolate
                .deoptimizer_data()
                .find_deoptimizing_code(from.saturating_sub(1))
                .or_else(|| isolate.find_code_for_address(from.saturating_sub(1)))
                .unwrap_or_else(|| {
                    fatal_logged!(
                        isolate.log,
                        "no code contains lazy deoptimisation return address {from:#x}"
                    )
                }),
            BailoutType::Debugger => {
                fatal!("a debugger deoptimisation must name the code it inspects")
            }
        };
        Self::with_code(
            isolate,
            function,
            code,
            bailout_type,
            bailout_id,
            from,
            fp_to_sp_delta,
        )
    }

    /// Start a debugger episode inspecting the activation of `function` running `code`, stopped
    /// at deoptimisation entry `bailout_id` with pc `from`.
    pub fn new_for_debugger(
        isolate: &Isolate,
        function: FunctionIdx,
        code: CodeIdx,
        bailout_id: usize,
        from: Address,
        fp_to_sp_delta: usize,
    ) -> Box<Self> {
        Self::with_code(
            isolate,
            function,
            code,
            BailoutType::Debugger,
            bailout_id,
            from,
            fp_to_sp_delta,
        )
    }

    fn with_code(
        isolate: &Isolate,
        function: FunctionIdx,
        code: CodeIdx,
        bailout_type: BailoutType,
        bailout_id: usize,
        from: Address,
        fp_to_sp_delta: usize,
    ) -> Box<Self> {
        let c = isolate.code(code);
        if c.kind() != CodeKind::OptimizedFunction {
            fatal_logged!(
                isolate.log,
                "{bailout_type} deoptimisation of {} which is {} code",
                c.name(),
                c.kind()
            );
        }
        let Some(data) = c.deopt_input().cloned() else {
            fatal_logged!(isolate.log, "{} has no deoptimisation data", c.name())
        };

        let entry_index = match bailout_type {
            BailoutType::Osr => {
                let ast_id = BailoutId::new(bailout_id as i64);
                if data.osr_ast_id() != ast_id {
                    fatal_logged!(
                        isolate.log,
                        "OSR into {} at ast id {ast_id}, but it was compiled for {}",
                        c.name(),
                        data.osr_ast_id()
                    );
                }
                if c.contains(from) {
                    fatal_logged!(
                        isolate.log,
                        "OSR return address {from:#x} is inside the optimised code"
                    );
                }
                data.lookup_osr(ast_id).unwrap_or_else(|| {
                    fatal_logged!(isolate.log, "no single frame translation for ast id {ast_id}")
                })
            }
            _ => {
                if bailout_id >= data.deopt_count() {
                    fatal_logged!(
                        isolate.log,
                        "bailout {bailout_id} outside the {} deoptimisation entries of {}",
                        data.deopt_count(),
                        c.name()
                    );
                }
                bailout_id
            }
        };
        match bailout_type {
            BailoutType::Lazy => check_lazy_site(isolate, c, &data, entry_index, from),
            BailoutType::Debugger if !c.contains(from) => fatal_logged!(
                isolate.log,
                "debugger pc {from:#x} is outside {}",
                c.name()
            ),
            _ => (),
        }

        let shared = isolate.shared_of(function);
        let fixed_size = frames::compute_fixed_size(shared.formal_parameter_count() as usize + 1);
        // The input frame runs from the stack pointer up to and including the parameters. Its
        // caller pc and fp sit above the frame pointer.
        let Some(input_frame_size) = (fixed_size + fp_to_sp_delta).checked_sub(2 * WORD_SIZE)
        else {
            fatal_logged!(isolate.log, "fp to sp delta {fp_to_sp_delta} too small")
        };
        if bailout_type != BailoutType::Osr {
            let outgoing = data.entries()[entry_index].arguments_stack_height as usize;
            let expected = 2 * WORD_SIZE + (c.stack_slots() as usize + outgoing) * WORD_SIZE;
            if fp_to_sp_delta != expected {
                fatal_logged!(
                    isolate.log,
                    "optimised frame of {} has fp to sp delta {fp_to_sp_delta}, expected {expected}",
                    c.name()
                );
            }
        }

        let mut input = Box::new(FrameDescription::new(input_frame_size, Some(function)));
        input.set_frame_type(FrameType::JavaScript);
        isolate.stats.count(bailout_type.counter(), 1);
        isolate.log.log(
            Verbosity::DeoptEvent,
            &format!(
                "deoptimising {} ({bailout_type}) at bailout {bailout_id}, from {from:#x}",
                shared.name()
            ),
        );

        Box::new(Self {
            function,
            function_tagged: isolate.function(function).tagged(),
            code,
            data,
            bailout_type,
            bailout_id,
            entry_index,
            from,
            fp_to_sp_delta,
            state: EpisodeState::Captured,
            arguments_marker: isolate.heap().arguments_marker(),
            input,
            output: Vec::new(),
            jsframe_count: 0,
            layouts: Vec::new(),
            values: Vec::new(),
            value_slots: Vec::new(),
            deferred_numbers: Vec::new(),
            deferred_duplicates: Vec::new(),
            deferred_arguments: Vec::new(),
            materialized: Vec::new(),
        })
    }

    pub fn function(&self) -> FunctionIdx {
        self.function
    }

    pub fn code(&self) -> CodeIdx {
        self.code
    }

    pub fn bailout_type(&self) -> BailoutType {
        self.bailout_type
    }

    pub fn bailout_id(&self) -> usize {
        self.bailout_id
    }

    pub fn from(&self) -> Address {
        self.from
    }

    pub fn fp_to_sp_delta(&self) -> usize {
        self.fp_to_sp_delta
    }

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn input(&self) -> &FrameDescription {
        &self.input
    }

    /// The input frame, for the entry code to fill in.
    ///
    /// # Panics
    ///
    /// If translation has started.
    pub fn input_mut(&mut self) -> &mut FrameDescription {
        if self.state != EpisodeState::Captured {
            fatal!("input frame changed while {}", self.state);
        }
        &mut self.input
    }

    pub fn output_count(&self) -> usize {
        self.output.len()
    }

    /// Output frame `i`, where frame 0 is the outermost.
    ///
    /// # Panics
    ///
    /// If frame `i` has not been built.
    pub fn output_frame(&self, i: usize) -> &FrameDescription {
        match self.output.get(i).and_then(|f| f.as_deref()) {
            Some(f) => f,
            None => fatal!("output frame {i} has not been built"),
        }
    }

    fn output_frame_mut(&mut self, i: usize) -> &mut FrameDescription {
        match self.output.get_mut(i).and_then(|f| f.as_deref_mut()) {
            Some(f) => f,
            None => fatal!("output frame {i} has not been built"),
        }
    }

    /// The output frames, outermost first.
    pub fn output_frames(&self) -> impl Iterator<Item = &FrameDescription> {
        self.output.iter().flatten().map(|f| &**f)
    }

    pub fn jsframe_count(&self) -> usize {
        self.jsframe_count
    }

    /// Are heap numbers or arguments objects still waiting to be materialised?
    pub fn has_deferred_objects(&self) -> bool {
        !self.deferred_numbers.is_empty()
            || !self.deferred_duplicates.is_empty()
            || !self.deferred_arguments.is_empty()
    }

    /// Build the output frames from the input frame.
    ///
    /// # Panics
    ///
    /// If the translation is inconsistent with the code, the functions it names, or itself.
    pub fn compute_output_frames(&mut self, isolate: &Isolate) {
        if self.state != EpisodeState::Captured {
            fatal!("output frames computed twice");
        }
        self.state = EpisodeState::Translating;
        let prev = isolate.stats.timing_state(TimingState::Translating);
        let translation_index = self.data.entries()[self.entry_index].translation_index;
        if isolate.log.enabled(Verbosity::Translation) {
            isolate.log.log(
                Verbosity::Translation,
                &format!(
                    "translation {translation_index} of {}:\n{}",
                    isolate.code(self.code).name(),
                    deoptmap::disassemble(self.data.translations(), translation_index)
                ),
            );
        }

        if self.bailout_type == BailoutType::Osr {
            self.do_compute_osr_output_frame(isolate, translation_index);
        } else {
            self.do_compute_output_frames(isolate, translation_index);
            self.state = EpisodeState::FramesBuilt;
        }
        isolate.stats.count(Counter::FramesBuilt, self.output.len() as u64);
        isolate.stats.timing_state(prev);

        if isolate.log.enabled(Verbosity::Translation) {
            for (i, f) in self.output_frames().enumerate() {
                let name = f
                    .function()
                    .map(|x| isolate.shared_of(x).name())
                    .unwrap_or("?");
                isolate.log.log(
                    Verbosity::Translation,
                    &format!(
                        "  frame {i}: {} {name}, top={:#x} size={} fp={:#x} pc={:#x}",
                        f.frame_type(),
                        f.top(),
                        f.frame_size(),
                        f.fp(),
                        f.pc()
                    ),
                );
            }
        }
        isolate.log.log(
            Verbosity::DeoptEvent,
            &format!(
                "deoptimised {} ({}): {} frames, {}",
                isolate.shared_of(self.function).name(),
                self.bailout_type,
                self.output.len(),
                self.state
            ),
        );
    }

    /// Mark the output frames as handed over to the entry code.
    pub fn commit(&mut self) {
        match self.state {
            EpisodeState::FramesBuilt => self.state = EpisodeState::Committed,
            EpisodeState::Aborted => (),
            s => fatal!("cannot commit an episode which is {s}"),
        }
    }

    /// Visit every word this episode holds which may refer to the heap.
    pub fn iterate_roots(&self, v: &mut dyn RootVisitor) {
        v.visit(self.function_tagged);
        for f in self.output.iter().flatten() {
            for w in f.content().chunks_exact(WORD_SIZE) {
                v.visit(Tagged::from_raw(LittleEndian::read_u64(w)));
            }
            v.visit(f.context());
        }
        for t in &self.materialized {
            v.visit(*t);
        }
    }

    /// Collect garbage if the heap wants to, keeping alive everything `mem` and this episode
    /// refer to.
    fn maybe_collect(&self, isolate: &mut Isolate, mem: &dyn StackMemory) {
        if isolate.heap().should_collect() {
            let mut roots = Vec::new();
            mem.visit_words(&mut roots);
            self.iterate_roots(&mut roots);
            isolate.collect_garbage(&roots);
        }
    }

    /// Allocate the deferred heap numbers into the output frames themselves, for episodes whose
    /// frames never reach a machine stack.
    pub fn materialize_heap_numbers(&mut self, isolate: &mut Isolate) {
        let mut output = std::mem::take(&mut self.output);
        self.materialize_heap_numbers_in(isolate, &mut FrameStack(&mut output));
        self.output = output;
    }

    /// Allocate the deferred heap numbers and store them into their slots in `mem`, the stack
    /// the output frames have been written to.
    pub fn materialize_heap_numbers_in(&mut self, isolate: &mut Isolate, mem: &mut dyn StackMemory) {
        let prev = isolate.stats.timing_state(TimingState::Materializing);
        let numbers = std::mem::take(&mut self.deferred_numbers);
        for d in &numbers {
            self.maybe_collect(isolate, &*mem);
            let n = isolate.heap_mut().allocate_number(d.value);
            mem.write_word(d.address, n.raw());
            self.materialized.push(n);
        }
        isolate
            .stats
            .count(Counter::HeapNumbersMaterialized, numbers.len() as u64);
        for d in std::mem::take(&mut self.deferred_duplicates) {
            let v = mem.read_word(d.source);
            mem.write_word(d.address, v);
        }
        isolate.stats.timing_state(prev);
    }

    /// As [Self::materialize_heap_numbers], for arguments objects.
    pub fn materialize_arguments_objects(&mut self, isolate: &mut Isolate) {
        let mut output = std::mem::take(&mut self.output);
        self.materialize_arguments_objects_in(isolate, &mut FrameStack(&mut output));
        self.output = output;
    }

    /// Allocate one arguments object for each frame whose slots are waiting for one, and store
    /// it into each of those slots in `mem`. Heap numbers must have been materialised first.
    pub fn materialize_arguments_objects_in(
        &mut self,
        isolate: &mut Isolate,
        mem: &mut dyn StackMemory,
    ) {
        if !self.deferred_numbers.is_empty() {
            fatal!("arguments objects materialised before heap numbers");
        }
        let prev = isolate.stats.timing_state(TimingState::Materializing);
        let deferred = std::mem::take(&mut self.deferred_arguments);
        let mut frame_indices = deferred.iter().map(|d| d.frame_index).collect::<Vec<_>>();
        frame_indices.sort_unstable();
        frame_indices.dedup();
        for fi in frame_indices {
            let layout = self.layouts[fi];
            if layout.frame_type != FrameType::JavaScript {
                fatal!("arguments object requested for {} frame {fi}", layout.frame_type);
            }
            // Adapted arguments are the actual ones.
            let args = match fi.checked_sub(1).map(|i| self.layouts[i]) {
                Some(l) if l.frame_type == FrameType::ArgumentsAdaptor => l,
                _ => layout,
            };
            self.maybe_collect(isolate, &*mem);
            let elements = (1..args.parameter_count)
                .map(|k| Tagged::from_raw(mem.read_word(args.parameter_address(k))))
                .collect::<Vec<_>>();
            let callee = layout.function.unwrap_or(self.function_tagged);
            let obj = isolate
                .heap_mut()
                .allocate(HeapObject::Arguments { callee, elements });
            for d in deferred.iter().filter(|d| d.frame_index == fi) {
                mem.write_word(d.address, obj.raw());
            }
        }
        isolate.stats.timing_state(prev);
    }
}

/// Check that a lazy deoptimisation returning to `from` came through the patched site of entry
/// `entry_index`.
fn check_lazy_site(
    isolate: &Isolate,
    c: &Code,
    data: &DeoptInputData<Tagged>,
    entry_index: usize,
    from: Address,
) {
    let Some(pc_offset) = data.entries()[entry_index].pc_offset else {
        fatal_logged!(
            isolate.log,
            "lazy deoptimisation through bailout {entry_index} of {}, which has no call site",
            c.name()
        )
    };
    let table = c.safepoint_table();
    if let Some(sp) = table.as_ref().and_then(|t| t.find_entry(pc_offset)) {
        if let Some(d) = sp.deopt_index {
            if d as usize != entry_index {
                fatal_logged!(
                    isolate.log,
                    "safepoint at {pc_offset} of {} belongs to bailout {d}, not {entry_index}",
                    c.name()
                );
            }
        }
    }
    let site = code_patch::lazy_patch_sites(data.entries(), table.as_ref())
        .into_iter()
        .find(|s| s.deopt_index == entry_index);
    let expected = site.map(|s| c.start() + u64::from(s.pc_offset) + PATCH_SIZE as u64);
    if expected != Some(from) {
        fatal_logged!(
            isolate.log,
            "lazy deoptimisation from {from:#x} does not return from the call patched for bailout {entry_index} of {}",
            c.name()
        );
    }
}

/// The output frames of an episode, viewed as the stack they describe.
struct FrameStack<'a>(&'a mut [Option<Box<FrameDescription>>]);

impl FrameStack<'_> {
    fn locate(&self, addr: Address) -> (usize, usize) {
        for (i, f) in self.0.iter().enumerate() {
            if let Some(f) = f {
                if addr >= f.top() && addr < f.top() + f.frame_size() as u64 {
                    return (i, (addr - f.top()) as usize);
                }
            }
        }
        fatal!("address {addr:#x} is outside every output frame")
    }
}

impl StackMemory for FrameStack<'_> {
    fn read_word(&self, addr: Address) -> u64 {
        let (i, off) = self.locate(addr);
        self.0[i].as_ref().map(|f| f.frame_slot(off)).unwrap_or(0)
    }

    fn write_word(&mut self, addr: Address, v: u64) {
        let (i, off) = self.locate(addr);
        if let Some(f) = self.0[i].as_mut() {
            f.set_frame_slot(off, v);
        }
    }

    fn visit_words(&self, v: &mut dyn RootVisitor) {
        for f in self.0.iter().flatten() {
            for w in f.content().chunks_exact(WORD_SIZE) {
                v.visit(Tagged::from_raw(LittleEndian::read_u64(w)));
            }
        }
    }
}
