//! An isolate: one instance of the runtime, owning its heap, functions, code and deoptimiser
//! state.

use crate::{
    code_patch,
    config::DeoptConfig,
    deoptimizer::{
        BailoutType, Deoptimizer,
        data::{DeoptimizerData, ENTRY_SIZE, EntryTable},
    },
    errors::{DeoptError, fatal},
    frame_description::StackMemory,
    heap::{Heap, HeapObject, RootVisitor},
    log::{
        Log, Verbosity,
        stats::{Counter, Stats},
    },
    objects::{
        Code, CodeIdx, CodeKind, FunctionIdx, JSFunction, OptimizedCodeDesc, SharedFunctionInfo,
        SharedIdx, UnoptimizedCodeDesc,
    },
    tagged::{Address, Tagged},
};
use deoptmap::{DeoptInputData, SafepointTable, TranslationError};
use index_vec::IndexVec;
use std::sync::Arc;
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Where code space starts. Nothing is ever mapped here: code addresses only need to be distinct
/// from each other and from heap references.
const CODE_BASE: Address = 0x1000_0000_0000;
const CODE_ALIGNMENT: u64 = 32;
const BUILTIN_SIZE: usize = 64;

/// The stubs the deoptimiser resumes execution in.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, Eq, PartialEq)]
pub enum Builtin {
    /// The continuation of an eager deoptimisation.
    NotifyDeoptimized,
    NotifyLazyDeoptimized,
    #[strum(to_string = "NotifyOSR")]
    NotifyOsr,
    JSConstructStubGeneric,
    ArgumentsAdaptorTrampoline,
    #[strum(to_string = "LoadIC_Getter_ForDeopt")]
    LoadIcGetterForDeopt,
    #[strum(to_string = "StoreIC_Setter_ForDeopt")]
    StoreIcSetterForDeopt,
}

impl Builtin {
    /// The offset within a stub at which a frame built by the deoptimiser resumes: just after the
    /// stub's call into the code that was deoptimised.
    pub fn deopt_pc_offset(self) -> Option<u32> {
        match self {
            Builtin::NotifyDeoptimized | Builtin::NotifyLazyDeoptimized | Builtin::NotifyOsr => {
                None
            }
            Builtin::JSConstructStubGeneric => Some(0x18),
            Builtin::ArgumentsAdaptorTrampoline => Some(0x20),
            Builtin::LoadIcGetterForDeopt => Some(0x10),
            Builtin::StoreIcSetterForDeopt => Some(0x14),
        }
    }
}

#[derive(Debug)]
pub struct Isolate {
    config: DeoptConfig,
    pub(crate) log: Log,
    pub(crate) stats: Stats,
    heap: Heap,
    shareds: IndexVec<SharedIdx, SharedFunctionInfo>,
    functions: IndexVec<FunctionIdx, JSFunction>,
    codes: IndexVec<CodeIdx, Code>,
    next_code_address: Address,
    builtins: [CodeIdx; Builtin::COUNT],
    deoptimizer_data: DeoptimizerData,
}

impl Isolate {
    /// Create an isolate which logs and records statistics as `DEOPTD_LOG` and
    /// `DEOPTD_LOG_STATS` say.
    pub fn new(config: DeoptConfig) -> Result<Self, DeoptError> {
        Ok(Self::with_log(config, Log::from_env()?, Stats::from_env()))
    }

    pub fn with_log(config: DeoptConfig, log: Log, stats: Stats) -> Self {
        let mut next_code_address = CODE_BASE;
        let mut reserve = |size: usize| {
            let start = next_code_address;
            next_code_address = (start + size as u64).next_multiple_of(CODE_ALIGNMENT);
            start
        };
        let count = config.get_entry_count();
        let eager = EntryTable::new(BailoutType::Eager, reserve(count * ENTRY_SIZE), count);
        let lazy = EntryTable::new(BailoutType::Lazy, reserve(count * ENTRY_SIZE), count);
        let osr = EntryTable::new(BailoutType::Osr, reserve(count * ENTRY_SIZE), count);

        let mut isolate = Self {
            heap: Heap::new(config.get_gc_interval()),
            config,
            log,
            stats,
            shareds: IndexVec::new(),
            functions: IndexVec::new(),
            codes: IndexVec::new(),
            next_code_address,
            builtins: [CodeIdx::from_usize(0); Builtin::COUNT],
            deoptimizer_data: DeoptimizerData::new(eager, lazy, osr),
        };
        for b in Builtin::iter() {
            isolate.builtins[b as usize] = isolate.add_code(
                b.to_string(),
                CodeKind::Builtin,
                // `int3`: nothing should ever execute a simulated builtin.
                vec![0xcc; BUILTIN_SIZE],
            );
        }
        isolate
    }

    pub fn config(&self) -> &DeoptConfig {
        &self.config
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn deoptimizer_data(&self) -> &DeoptimizerData {
        &self.deoptimizer_data
    }

    fn allocate_code_space(&mut self, size: usize) -> Address {
        let start = self.next_code_address;
        self.next_code_address = (start + size as u64).next_multiple_of(CODE_ALIGNMENT);
        start
    }

    fn add_code(&mut self, name: String, kind: CodeKind, instructions: Vec<u8>) -> CodeIdx {
        let start = self.allocate_code_space(instructions.len());
        self.codes.push(Code {
            name,
            kind,
            start,
            instructions,
            deopt_input: None,
            deopt_output: None,
            safepoints: None,
            stack_slots: 0,
            marked_for_deoptimization: false,
            relocation_valid: true,
            released: false,
        })
    }

    pub fn builtin(&self, b: Builtin) -> CodeIdx {
        self.builtins[b as usize]
    }

    /// The address execution enters `b` at.
    pub fn builtin_address(&self, b: Builtin) -> Address {
        self.code(self.builtin(b)).start()
    }

    /// Allocate a function context holding `slots`.
    pub fn new_context(&mut self, slots: Vec<Tagged>) -> Tagged {
        self.heap.allocate(HeapObject::Context(slots))
    }

    /// Register a function whose unoptimised code is described by `desc`.
    pub fn new_shared_function(
        &mut self,
        name: &str,
        formal_parameter_count: u32,
        desc: UnoptimizedCodeDesc,
    ) -> SharedIdx {
        let code = self.add_code(name.to_owned(), CodeKind::Function, desc.instructions);
        self.codes[code].deopt_output = Some(desc.deopt_output);
        self.shareds.push(SharedFunctionInfo {
            name: name.to_owned(),
            formal_parameter_count,
            code,
        })
    }

    /// Create a closure of `shared` in `context`, initially running unoptimised code.
    pub fn new_function(&mut self, shared: SharedIdx, context: Tagged) -> FunctionIdx {
        let idx = self.functions.next_idx();
        let tagged = self.heap.allocate(HeapObject::Function(idx));
        self.functions.push(JSFunction {
            shared,
            code: self.shareds[shared].code,
            context,
            tagged,
        })
    }

    /// Install optimised code for `function`, which then runs it.
    ///
    /// This fails if the code's metadata is unusable: a translation larger than the configured
    /// limit, a malformed safepoint table, or a lazy deoptimisation site without room for the call
    /// which will be patched over it.
    pub fn install_optimized_code(
        &mut self,
        function: FunctionIdx,
        desc: OptimizedCodeDesc,
    ) -> Result<CodeIdx, DeoptError> {
        let OptimizedCodeDesc {
            instructions,
            translations,
            literals,
            entries,
            safepoints,
            stack_slots,
            osr,
            inlined_function_count,
        } = desc;
        let limit = self.config.get_translation_limit();
        if translations.len() > limit {
            return Err(TranslationError::ResourceExhausted { limit }.into());
        }
        let table = if safepoints.is_empty() {
            None
        } else {
            Some(SafepointTable::parse(&safepoints)?)
        };
        let sites = code_patch::lazy_patch_sites(&entries, table.as_ref());
        code_patch::check_patch_budget(instructions.len(), &sites)?;
        let mut data = DeoptInputData::new(translations, literals, entries)
            .with_inlined_function_count(inlined_function_count);
        if let Some((ast_id, pc_offset)) = osr {
            data = data.with_osr(ast_id, pc_offset);
        }

        let name = self.shareds[self.functions[function].shared].name.clone();
        let code = self.add_code(name, CodeKind::OptimizedFunction, instructions);
        let c = &mut self.codes[code];
        c.deopt_input = Some(Arc::new(data));
        c.safepoints = (!safepoints.is_empty()).then(|| safepoints.into_boxed_slice());
        c.stack_slots = stack_slots;
        self.functions[function].code = code;
        Ok(code)
    }

    /// Make `function` run `code`.
    pub fn set_code(&mut self, function: FunctionIdx, code: CodeIdx) {
        self.functions[function].code = code;
    }

    pub fn function(&self, f: FunctionIdx) -> &JSFunction {
        &self.functions[f]
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionIdx, &JSFunction)> {
        self.functions.iter_enumerated()
    }

    pub fn shared(&self, s: SharedIdx) -> &SharedFunctionInfo {
        &self.shareds[s]
    }

    /// The shared function info of `f`.
    pub fn shared_of(&self, f: FunctionIdx) -> &SharedFunctionInfo {
        &self.shareds[self.functions[f].shared]
    }

    pub fn code(&self, c: CodeIdx) -> &Code {
        &self.codes[c]
    }

    pub(crate) fn code_mut(&mut self, c: CodeIdx) -> &mut Code {
        &mut self.codes[c]
    }

    /// Mark `c` so that [Isolate::deoptimize_marked_code] deoptimises it.
    pub fn mark_for_deoptimization(&mut self, c: CodeIdx) {
        self.codes[c].marked_for_deoptimization = true;
    }

    /// Return the function whose heap value is `t`.
    pub fn function_from_tagged(&self, t: Tagged) -> Option<FunctionIdx> {
        match self.heap.get(t) {
            Some(HeapObject::Function(f)) => Some(*f),
            _ => None,
        }
    }

    /// Find the code object whose instructions contain `addr`.
    pub fn find_code_for_address(&self, addr: Address) -> Option<CodeIdx> {
        self.codes
            .iter_enumerated()
            .find(|(_, c)| !c.released && c.contains(addr))
            .map(|(i, _)| i)
    }

    pub fn is_optimized(&self, f: FunctionIdx) -> bool {
        self.codes[self.functions[f].code].kind == CodeKind::OptimizedFunction
    }

    /// Visit the roots the isolate itself holds: every closure and its context, and the literals
    /// of every code object not yet released.
    pub fn iterate_roots(&self, v: &mut dyn RootVisitor) {
        for f in self.functions.iter() {
            v.visit(f.tagged);
            v.visit(f.context);
        }
        for c in self.codes.iter().filter(|c| !c.released) {
            if let Some(d) = &c.deopt_input {
                for l in d.literals() {
                    v.visit(*l);
                }
            }
        }
    }

    /// Collect garbage, treating `extra_roots` as roots as well as the isolate's own. Returns the
    /// number of objects freed.
    pub fn collect_garbage(&mut self, extra_roots: &[Tagged]) -> usize {
        let mut roots = extra_roots.to_vec();
        self.iterate_roots(&mut roots);
        let freed = self.heap.collect(&roots);
        self.log.log(
            Verbosity::Translation,
            &format!("collected {freed} objects"),
        );
        freed
    }

    /// Release every deoptimised code object not in `code_on_stack`, the code objects a stack
    /// scan found activations of. Returns the number of code objects released.
    pub fn release_zombie_code(&mut self, code_on_stack: &[CodeIdx]) -> usize {
        let mut released = 0;
        for dc in self.deoptimizer_data.deoptimizing_code() {
            if !code_on_stack.contains(&dc.code) {
                self.notify_code_unreferenced(dc.code);
                released += 1;
            }
        }
        released
    }

    /// Called once nothing on any stack refers to the deoptimised code `code`.
    pub fn notify_code_unreferenced(&mut self, code: CodeIdx) {
        if self.deoptimizer_data.remove_deoptimizing_code(code) {
            self.codes[code].released = true;
            self.stats.count(Counter::ZombieCodeReleased, 1);
            self.log.log(
                Verbosity::DeoptEvent,
                &format!("released deoptimised code {}", self.codes[code].name),
            );
        }
    }

    /// The runtime half of the continuation of an eager or lazy deoptimisation, run once
    /// `deopt`'s output frames are on the stack `mem`: materialise the values the frames are
    /// waiting for. After an eager deoptimisation the function stops running the code that
    /// bailed out: if no other activation (one of `live_code`) uses it the function simply
    /// switches back to its unoptimised code, otherwise the code is invalidated.
    pub fn notify_deoptimized(
        &mut self,
        mut deopt: Box<Deoptimizer>,
        mem: &mut dyn StackMemory,
        live_code: &[CodeIdx],
    ) {
        deopt.materialize_heap_numbers_in(self, mem);
        deopt.materialize_arguments_objects_in(self, mem);
        if deopt.bailout_type() != BailoutType::Eager {
            return;
        }
        let f = deopt.function();
        let code = deopt.code();
        if self.functions[f].code != code {
            return;
        }
        if live_code.contains(&code) {
            self.deoptimize_function(f);
        } else {
            let unopt = self.shared_of(f).code;
            self.set_code(f, unopt);
            self.log.log(
                Verbosity::DeoptEvent,
                &format!("removed optimised code for {}", self.shared_of(f).name),
            );
        }
    }

    /// Take the episode the entry code handed over.
    ///
    /// # Panics
    ///
    /// If there is none.
    pub fn grab_deoptimizer(&self) -> Box<Deoptimizer> {
        match self.deoptimizer_data.grab() {
            Some(d) => d,
            None => fatal!("no deoptimisation in progress"),
        }
    }
}
