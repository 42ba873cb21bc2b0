//! Invalidating optimised code so that it never runs again.
//!
//! Invalidation can happen while activations of the code are on the stack. Those activations are
//! not touched: instead every lazy deoptimisation site of the code is patched to call into the
//! lazy entry table, so each activation deoptimises when it next returns into the code. The code
//! is then kept alive in the deoptimiser's registry until a stack scan shows nothing uses it.

use crate::{
    code_patch,
    deoptimizer::{BailoutType, data::DeoptimizingCode},
    errors::fatal_logged,
    isolate::Isolate,
    log::{
        Verbosity,
        stats::{Counter, TimingState},
    },
    objects::{CodeIdx, FunctionIdx},
};

/// Chooses which optimised functions [Isolate::deoptimize_all_functions_with] invalidates.
pub trait OptimizedFunctionFilter {
    fn take_function(&mut self, isolate: &Isolate, function: FunctionIdx) -> bool;
}

/// Takes every optimised function.
pub struct DeoptimizeAllFilter;

impl OptimizedFunctionFilter for DeoptimizeAllFilter {
    fn take_function(&mut self, _: &Isolate, _: FunctionIdx) -> bool {
        true
    }
}

/// Takes the functions whose code has been marked with [Isolate::mark_for_deoptimization].
pub struct DeoptimizeMarkedCodeFilter;

impl OptimizedFunctionFilter for DeoptimizeMarkedCodeFilter {
    fn take_function(&mut self, isolate: &Isolate, function: FunctionIdx) -> bool {
        isolate
            .code(isolate.function(function).code())
            .is_marked_for_deoptimization()
    }
}

/// Takes the functions running the same code as a given function.
pub struct DeoptimizeFunctionFilter(pub FunctionIdx);

impl OptimizedFunctionFilter for DeoptimizeFunctionFilter {
    fn take_function(&mut self, isolate: &Isolate, function: FunctionIdx) -> bool {
        isolate.function(function).code() == isolate.function(self.0).code()
    }
}

impl Isolate {
    /// Invalidate the optimised code `function` is running, if any. Every closure sharing that
    /// code goes back to its unoptimised code.
    pub fn deoptimize_function(&mut self, function: FunctionIdx) {
        if self.is_optimized(function) {
            self.deoptimize_all_functions_with(&mut DeoptimizeFunctionFilter(function));
        }
    }

    /// Invalidate all optimised code. Returns the number of code objects invalidated.
    pub fn deoptimize_all(&mut self) -> usize {
        self.log.log(Verbosity::DeoptEvent, "deoptimising all code");
        self.deoptimize_all_functions_with(&mut DeoptimizeAllFilter)
    }

    /// Invalidate all optimised code marked for deoptimisation. Returns the number of code
    /// objects invalidated.
    pub fn deoptimize_marked_code(&mut self) -> usize {
        self.log.log(Verbosity::DeoptEvent, "deoptimising marked code");
        self.deoptimize_all_functions_with(&mut DeoptimizeMarkedCodeFilter)
    }

    /// Invalidate the optimised code of every function `filter` takes. Returns the number of code
    /// objects invalidated.
    pub fn deoptimize_all_functions_with(
        &mut self,
        filter: &mut dyn OptimizedFunctionFilter,
    ) -> usize {
        let mut codes = Vec::new();
        let optimized = self
            .functions()
            .map(|(f, _)| f)
            .filter(|f| self.is_optimized(*f))
            .collect::<Vec<_>>();
        for f in optimized {
            let c = self.function(f).code();
            if !codes.contains(&c) && filter.take_function(self, f) {
                codes.push(c);
            }
        }
        let prev = self.stats.timing_state(TimingState::Patching);
        for c in &codes {
            self.deoptimize_code(*c);
        }
        self.stats.timing_state(prev);
        codes.len()
    }

    fn deoptimize_code(&mut self, code: CodeIdx) {
        let c = self.code(code);
        // Already patched: only the closures still pointing at it need resetting.
        if c.relocation_valid() {
            let data = match c.deopt_input() {
                Some(d) => d.clone(),
                None => fatal_logged!(self.log, "{} has no deoptimisation data", c.name()),
            };
            let sites = code_patch::lazy_patch_sites(data.entries(), c.safepoint_table().as_ref());
            let mut patches = Vec::with_capacity(sites.len());
            for s in &sites {
                let target = self
                    .deoptimizer_data()
                    .get_deoptimization_entry(s.deopt_index, BailoutType::Lazy);
                match code_patch::call_sequence(target) {
                    Ok(call) => patches.push((s.pc_offset, call)),
                    Err(e) => fatal_logged!(self.log, "patching {}: {e}", c.name()),
                }
            }
            let c = self.code_mut(code);
            for (pc_offset, call) in &patches {
                code_patch::patch_call(&mut c.instructions, *pc_offset, call);
            }
            c.relocation_valid = false;
            let dc = DeoptimizingCode {
                code,
                start: c.start(),
                end: c.end(),
            };
            self.deoptimizer_data().add_deoptimizing_code(dc);
            self.stats.count(Counter::CodeObjectsInvalidated, 1);

            let c = self.code(code);
            self.log.log(
                Verbosity::DeoptEvent,
                &format!("invalidated {}: {} lazy sites patched", c.name(), sites.len()),
            );
            if self.log.enabled(Verbosity::Translation) {
                for (pc_offset, call) in &patches {
                    let addr = c.start() + u64::from(*pc_offset);
                    self.log.log(
                        Verbosity::Translation,
                        &crate::disasm::disassemble_with_addresses(call, addr),
                    );
                }
            }
        }

        let users = self
            .functions()
            .filter(|(_, f)| f.code() == code)
            .map(|(i, f)| (i, self.shared(f.shared()).code()))
            .collect::<Vec<_>>();
        for (f, unoptimized) in users {
            self.set_code(f, unoptimized);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        deoptimizer::{BailoutType, data::ENTRY_SIZE},
        disasm::disassemble,
        isolate::test::{isolate, unoptimized},
        log::stats::Counter,
        objects::{CodeIdx, FunctionIdx, OptimizedCodeDesc},
        isolate::Isolate,
    };
    use deoptmap::{BailoutId, DeoptEntry, Translation, TranslationBuffer, SELF_LITERAL_ID};

    /// Install optimised code for a new closure of a new function `name`, with a lazy site at
    /// offset 16.
    fn optimized(i: &mut Isolate, name: &str) -> (FunctionIdx, CodeIdx) {
        let ctx = i.new_context(vec![]);
        let s = i.new_shared_function(name, 0, unoptimized(&[(1, 8)]));
        let f = i.new_function(s, ctx);
        let mut buf = TranslationBuffer::new();
        let mut t = Translation::new(&mut buf, 1, 1).unwrap();
        t.begin_js_frame(BailoutId::new(1), SELF_LITERAL_ID, 0).unwrap();
        let c = i
            .install_optimized_code(
                f,
                OptimizedCodeDesc {
                    instructions: vec![0x90; 48],
                    translations: buf.into_bytes(),
                    literals: vec![],
                    entries: vec![DeoptEntry {
                        ast_id: BailoutId::new(1),
                        translation_index: 0,
                        arguments_stack_height: 0,
                        pc_offset: Some(16),
                    }],
                    safepoints: vec![],
                    stack_slots: 0,
                    osr: None,
                    inlined_function_count: 0,
                },
            )
            .unwrap();
        (f, c)
    }

    #[test]
    fn patches_lazy_sites() {
        let mut i = isolate();
        let (f, c) = optimized(&mut i, "f");
        let other = i.new_function(i.function(f).shared(), i.function(f).context());
        i.set_code(other, c);
        i.deoptimize_function(f);
        assert!(!i.is_optimized(f));
        assert!(!i.is_optimized(other));
        let code = i.code(c);
        assert!(!code.relocation_valid());
        let entry = i.deoptimizer_data().get_deoptimization_entry(0, BailoutType::Lazy);
        let dis = disassemble(&code.instructions()[16..29], 0);
        assert_eq!(dis, vec![format!("mov r10, 0x{entry:x}"), "call r10".to_owned()]);
        assert_eq!(code.instructions()[15], 0x90);
        assert_eq!(i.deoptimizer_data().deoptimized_code_count(), 1);
        assert_eq!(
            i.deoptimizer_data().find_deoptimizing_code(code.start() + 29),
            Some(c)
        );
        assert_eq!(i.stats().get(Counter::CodeObjectsInvalidated), Some(1));
        assert_eq!(ENTRY_SIZE, 10);

        // A second invalidation patches nothing.
        i.set_code(f, c);
        i.deoptimize_function(f);
        assert!(!i.is_optimized(f));
        assert_eq!(i.stats().get(Counter::CodeObjectsInvalidated), Some(1));
    }

    #[test]
    fn unrelated_functions_unaffected() {
        let mut i = isolate();
        let (f, _) = optimized(&mut i, "f");
        let (g, gc) = optimized(&mut i, "g");
        i.deoptimize_function(f);
        assert!(!i.is_optimized(f));
        assert!(i.is_optimized(g));
        assert!(i.code(gc).relocation_valid());
        assert_eq!(i.deoptimizer_data().deoptimized_code_count(), 1);
    }

    #[test]
    fn marked_and_all() {
        let mut i = isolate();
        let (f, c) = optimized(&mut i, "f");
        let (g, _) = optimized(&mut i, "g");
        assert_eq!(i.deoptimize_marked_code(), 0);
        i.mark_for_deoptimization(c);
        assert_eq!(i.deoptimize_marked_code(), 1);
        assert!(!i.is_optimized(f));
        assert!(i.is_optimized(g));
        assert_eq!(i.deoptimize_all(), 1);
        assert!(!i.is_optimized(g));
        assert_eq!(i.deoptimizer_data().deoptimized_code_count(), 2);
        assert_eq!(i.release_zombie_code(&[c]), 1);
        assert_eq!(i.deoptimizer_data().deoptimized_code_count(), 1);
        assert!(!i.code(c).is_released());
    }
}
