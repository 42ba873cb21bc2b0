//! Per-isolate deoptimiser state: the entry tables and the registry of deoptimised code which may
//! still have activations on the stack.

use super::{BailoutType, Deoptimizer};
use crate::{
    errors::fatal,
    objects::CodeIdx,
    tagged::Address,
};
use parking_lot::Mutex;

/// The size in bytes of one entry in an entry table: `push imm32; jmp rel32`.
pub const ENTRY_SIZE: usize = 10;

/// A table of deoptimisation entries for one bailout type. Entry `i` pushes `i` and jumps to the
/// code common to all entries of the table.
#[derive(Clone, Debug)]
pub struct EntryTable {
    ty: BailoutType,
    start: Address,
    count: usize,
}

impl EntryTable {
    pub fn new(ty: BailoutType, start: Address, count: usize) -> Self {
        Self { ty, start, count }
    }

    pub fn bailout_type(&self) -> BailoutType {
        self.ty
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn size(&self) -> usize {
        self.count * ENTRY_SIZE
    }

    /// The address of entry `id`.
    ///
    /// # Panics
    ///
    /// If `id` is outside the table.
    pub fn entry(&self, id: usize) -> Address {
        if id >= self.count {
            fatal!(
                "{} deoptimisation entry {id} outside table of {}",
                self.ty,
                self.count
            );
        }
        self.start + (id * ENTRY_SIZE) as u64
    }

    /// The id of the entry starting at `addr`, or `None` if `addr` is not the start of an entry
    /// in this table.
    pub fn id(&self, addr: Address) -> Option<usize> {
        let off = usize::try_from(addr.checked_sub(self.start)?).ok()?;
        (off < self.size() && off % ENTRY_SIZE == 0).then_some(off / ENTRY_SIZE)
    }
}

/// An optimised code object that has been deoptimised but which may still have activations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeoptimizingCode {
    pub code: CodeIdx,
    pub start: Address,
    pub end: Address,
}

#[derive(Debug)]
pub struct DeoptimizerData {
    eager: EntryTable,
    lazy: EntryTable,
    osr: EntryTable,
    deoptimizing_code: Mutex<Vec<DeoptimizingCode>>,
    /// The episode handed from the entry code to the runtime when machine code, rather than a
    /// Rust caller, drives a deoptimisation.
    current: Mutex<Option<Box<Deoptimizer>>>,
}

impl DeoptimizerData {
    pub fn new(eager: EntryTable, lazy: EntryTable, osr: EntryTable) -> Self {
        Self {
            eager,
            lazy,
            osr,
            deoptimizing_code: Mutex::new(Vec::new()),
            current: Mutex::new(None),
        }
    }

    pub fn table(&self, ty: BailoutType) -> Option<&EntryTable> {
        match ty {
            BailoutType::Eager => Some(&self.eager),
            BailoutType::Lazy => Some(&self.lazy),
            BailoutType::Osr => Some(&self.osr),
            BailoutType::Debugger => None,
        }
    }

    /// Return the address of deoptimisation entry `id` for bailouts of type `ty`.
    ///
    /// # Panics
    ///
    /// If `id` is outside the table or `ty` has no entry table.
    pub fn get_deoptimization_entry(&self, id: usize, ty: BailoutType) -> Address {
        match self.table(ty) {
            Some(t) => t.entry(id),
            None => fatal!("{ty} bailouts have no deoptimisation entries"),
        }
    }

    /// Return the id of the deoptimisation entry for bailouts of type `ty` at `addr`.
    pub fn get_deoptimization_id(&self, addr: Address, ty: BailoutType) -> Option<usize> {
        self.table(ty).and_then(|t| t.id(addr))
    }

    /// Record that `code` has been deoptimised. Registering the same code twice has no effect.
    pub fn add_deoptimizing_code(&self, dc: DeoptimizingCode) {
        let mut lk = self.deoptimizing_code.lock();
        if !lk.iter().any(|x| x.code == dc.code) {
            lk.push(dc);
        }
    }

    /// Find the deoptimised code containing `addr`.
    pub fn find_deoptimizing_code(&self, addr: Address) -> Option<CodeIdx> {
        self.deoptimizing_code
            .lock()
            .iter()
            .find(|x| addr >= x.start && addr < x.end)
            .map(|x| x.code)
    }

    /// Forget about `code`, returning `true` if it was registered. Called once nothing on the
    /// stack refers to it.
    pub fn remove_deoptimizing_code(&self, code: CodeIdx) -> bool {
        let mut lk = self.deoptimizing_code.lock();
        match lk.iter().position(|x| x.code == code) {
            Some(i) => {
                lk.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn deoptimized_code_count(&self) -> usize {
        self.deoptimizing_code.lock().len()
    }

    pub fn deoptimizing_code(&self) -> Vec<DeoptimizingCode> {
        self.deoptimizing_code.lock().clone()
    }

    /// Store the episode the entry code is working on.
    ///
    /// # Panics
    ///
    /// If another episode is already stored.
    pub(crate) fn set_current(&self, deopt: Box<Deoptimizer>) {
        let mut lk = self.current.lock();
        if lk.is_some() {
            fatal!("a deoptimisation is already in progress");
        }
        *lk = Some(deopt);
    }

    /// Run `f` on the stored episode.
    pub(crate) fn with_current<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Deoptimizer) -> R,
    {
        let mut lk = self.current.lock();
        match lk.as_deref_mut() {
            Some(d) => f(d),
            None => fatal!("no deoptimisation in progress"),
        }
    }

    /// Take ownership of the stored episode.
    pub fn grab(&self) -> Option<Box<Deoptimizer>> {
        self.current.lock().take()
    }
}
