//! A minimal managed heap.
//!
//! The deoptimiser only needs a handful of things from the heap: boxed numbers, arguments
//! objects, a few distinguished oddballs, and a collector that can run whenever it allocates. The
//! collector is a non-moving mark-sweep collector. Roots are supplied by the caller as plain words:
//! any word which does not refer to a live object is ignored, so callers may pass every word of a
//! frame without knowing which of them are tagged.

use crate::{objects::FunctionIdx, tagged::Tagged};
use index_vec::IndexVec;
use strum::{EnumCount, EnumIter, IntoEnumIterator};

index_vec::define_index_type! {
    pub struct HeapIdx = u32;
}

/// Heap references are encoded as `HEAP_BASE + idx * OBJECT_ALIGNMENT + 1`.
const HEAP_BASE: u64 = 0x2000_0000_0000;
const OBJECT_ALIGNMENT: u64 = 16;

#[derive(Clone, Copy, Debug, EnumCount, EnumIter, Eq, PartialEq)]
pub enum Oddball {
    Undefined,
    Null,
    True,
    False,
    TheHole,
    /// Placeholder for a value which will be materialised once a deoptimisation has finished
    /// writing its frames.
    ArgumentsMarker,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HeapObject {
    Oddball(Oddball),
    /// A boxed number.
    Number(f64),
    Function(FunctionIdx),
    Context(Vec<Tagged>),
    Arguments {
        callee: Tagged,
        elements: Vec<Tagged>,
    },
    String(String),
}

/// Receives the roots of a collection.
pub trait RootVisitor {
    fn visit(&mut self, t: Tagged);
}

impl RootVisitor for Vec<Tagged> {
    fn visit(&mut self, t: Tagged) {
        self.push(t);
    }
}

#[derive(Debug)]
pub struct Heap {
    objects: IndexVec<HeapIdx, Option<HeapObject>>,
    free: Vec<HeapIdx>,
    oddballs: [Tagged; Oddball::COUNT],
    gc_interval: Option<usize>,
    allocations_since_gc: usize,
    collections: usize,
}

impl Heap {
    pub fn new(gc_interval: Option<usize>) -> Self {
        let mut h = Self {
            objects: IndexVec::new(),
            free: Vec::new(),
            oddballs: [Tagged::ZERO; Oddball::COUNT],
            gc_interval,
            allocations_since_gc: 0,
            collections: 0,
        };
        for o in Oddball::iter() {
            h.oddballs[o as usize] = h.allocate(HeapObject::Oddball(o));
        }
        h.allocations_since_gc = 0;
        h
    }

    fn encode(idx: HeapIdx) -> Tagged {
        Tagged::from_raw(HEAP_BASE + idx.raw() as u64 * OBJECT_ALIGNMENT + 1)
    }

    fn decode(&self, t: Tagged) -> Option<HeapIdx> {
        if t.is_smi() || t.raw() < HEAP_BASE {
            return None;
        }
        let off = t.raw() - 1 - HEAP_BASE;
        if off % OBJECT_ALIGNMENT != 0 {
            return None;
        }
        let idx = usize::try_from(off / OBJECT_ALIGNMENT).ok()?;
        (idx < self.objects.len()).then(|| HeapIdx::from_usize(idx))
    }

    pub fn allocate(&mut self, obj: HeapObject) -> Tagged {
        self.allocations_since_gc += 1;
        let idx = match self.free.pop() {
            Some(idx) => {
                self.objects[idx] = Some(obj);
                idx
            }
            None => self.objects.push(Some(obj)),
        };
        Self::encode(idx)
    }

    pub fn allocate_number(&mut self, v: f64) -> Tagged {
        self.allocate(HeapObject::Number(v))
    }

    pub fn get(&self, t: Tagged) -> Option<&HeapObject> {
        self.decode(t).and_then(|idx| self.objects[idx].as_ref())
    }

    pub fn get_mut(&mut self, t: Tagged) -> Option<&mut HeapObject> {
        self.decode(t).and_then(|idx| self.objects[idx].as_mut())
    }

    pub fn is_live(&self, t: Tagged) -> bool {
        self.get(t).is_some()
    }

    /// Return the numeric value of `t` if it is a Smi or a boxed number.
    pub fn number_value(&self, t: Tagged) -> Option<f64> {
        if let Some(v) = t.smi_value() {
            return Some(f64::from(v));
        }
        match self.get(t) {
            Some(HeapObject::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn oddball(&self, o: Oddball) -> Tagged {
        self.oddballs[o as usize]
    }

    pub fn undefined(&self) -> Tagged {
        self.oddball(Oddball::Undefined)
    }

    pub fn the_hole(&self) -> Tagged {
        self.oddball(Oddball::TheHole)
    }

    pub fn arguments_marker(&self) -> Tagged {
        self.oddball(Oddball::ArgumentsMarker)
    }

    /// Has the allocation interval passed since the last collection?
    pub fn should_collect(&self) -> bool {
        self.gc_interval
            .map(|n| self.allocations_since_gc >= n)
            .unwrap_or(false)
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn live_objects(&self) -> usize {
        self.objects.iter().filter(|x| x.is_some()).count()
    }

    /// Free every object not reachable from `roots` or the oddballs, returning the number of
    /// objects freed.
    pub fn collect(&mut self, roots: &[Tagged]) -> usize {
        let mut marked = IndexVec::<HeapIdx, bool>::from_vec(vec![false; self.objects.len()]);
        let mut worklist = roots
            .iter()
            .chain(self.oddballs.iter())
            .filter_map(|t| self.decode(*t))
            .collect::<Vec<_>>();
        while let Some(idx) = worklist.pop() {
            if marked[idx] {
                continue;
            }
            marked[idx] = true;
            match &self.objects[idx] {
                Some(HeapObject::Context(slots)) => {
                    worklist.extend(slots.iter().filter_map(|t| self.decode(*t)))
                }
                Some(HeapObject::Arguments { callee, elements }) => worklist.extend(
                    std::iter::once(callee)
                        .chain(elements.iter())
                        .filter_map(|t| self.decode(*t)),
                ),
                _ => (),
            }
        }

        let mut freed = 0;
        for (idx, obj) in self.objects.iter_mut_enumerated() {
            if obj.is_some() && !marked[idx] {
                *obj = None;
                self.free.push(idx);
                freed += 1;
            }
        }
        self.allocations_since_gc = 0;
        self.collections += 1;
        freed
    }
}
