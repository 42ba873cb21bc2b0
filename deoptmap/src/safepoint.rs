//! Safepoint tables.
//!
//! A safepoint is a pc within optimised code at which the runtime may inspect the code's frame:
//! typically the return address of a call. For each safepoint the table records which stack slots
//! and registers hold tagged values and, if execution can deoptimise there, the index of the
//! corresponding deoptimisation entry.
//!
//! The binary format is little endian:
//!
//! ```text
//! u32 length
//! u32 bitmap_size                  (bytes per entry)
//! length * {
//!   u32 pc_offset
//!   u32 deopt_index                (u32::MAX if none)
//!   u16 gap_code_size
//!   u16 argument_count
//! }
//! length * bitmap_size bytes       (registers first, then stack slots)
//! ```

use crate::{errors::SafepointError, translation::NUM_REGISTERS};
use byteorder::{ByteOrder, LittleEndian};

const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 12;
const NO_DEOPT_INDEX: u32 = u32::MAX;

#[derive(Debug)]
struct PendingSafepoint {
    pc_offset: u32,
    deopt_index: Option<u32>,
    gap_code_size: u16,
    argument_count: u16,
    registers: Vec<u8>,
    stack_slots: Vec<u32>,
}

/// Collects safepoints while code is being generated.
#[derive(Debug, Default)]
pub struct SafepointTableBuilder {
    entries: Vec<PendingSafepoint>,
}

/// A handle for recording the tagged locations of one safepoint.
pub struct Safepoint<'a> {
    entry: &'a mut PendingSafepoint,
}

impl Safepoint<'_> {
    pub fn define_pointer_slot(&mut self, slot: u32) {
        self.entry.stack_slots.push(slot);
    }

    pub fn define_pointer_register(&mut self, reg: u8) {
        assert!(i64::from(reg) < NUM_REGISTERS);
        self.entry.registers.push(reg);
    }
}

impl SafepointTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a safepoint at `pc_offset`. Safepoints must be defined in increasing pc order.
    pub fn define_safepoint(
        &mut self,
        pc_offset: u32,
        argument_count: u16,
        deopt_index: Option<u32>,
    ) -> Safepoint<'_> {
        assert!(
            self.entries
                .last()
                .map(|x| x.pc_offset < pc_offset)
                .unwrap_or(true),
            "safepoint at {pc_offset} defined out of order"
        );
        let idx = self.entries.len();
        self.entries.push(PendingSafepoint {
            pc_offset,
            deopt_index,
            gap_code_size: 0,
            argument_count,
            registers: Vec::new(),
            stack_slots: Vec::new(),
        });
        Safepoint {
            entry: &mut self.entries[idx],
        }
    }

    /// Record that the code generator padded the last safepoint up to `pc_after_gap`.
    pub fn record_gap(&mut self, pc_after_gap: u32) {
        if let Some(e) = self.entries.last_mut() {
            e.gap_code_size = u16::try_from(pc_after_gap - e.pc_offset).unwrap_or(u16::MAX);
        }
    }

    /// Serialise the table for a frame with `stack_slot_count` spill slots.
    pub fn emit(&self, stack_slot_count: u32) -> Vec<u8> {
        let bits = NUM_REGISTERS as usize + stack_slot_count as usize;
        let bitmap_size = bits.div_ceil(8);
        let mut out =
            vec![0; HEADER_SIZE + self.entries.len() * (ENTRY_SIZE + bitmap_size)];
        LittleEndian::write_u32(&mut out[0..4], self.entries.len() as u32);
        LittleEndian::write_u32(&mut out[4..8], bitmap_size as u32);
        let bitmaps_start = HEADER_SIZE + self.entries.len() * ENTRY_SIZE;
        for (i, e) in self.entries.iter().enumerate() {
            let off = HEADER_SIZE + i * ENTRY_SIZE;
            LittleEndian::write_u32(&mut out[off..off + 4], e.pc_offset);
            LittleEndian::write_u32(
                &mut out[off + 4..off + 8],
                e.deopt_index.unwrap_or(NO_DEOPT_INDEX),
            );
            LittleEndian::write_u16(&mut out[off + 8..off + 10], e.gap_code_size);
            LittleEndian::write_u16(&mut out[off + 10..off + 12], e.argument_count);

            let bitmap = &mut out[bitmaps_start + i * bitmap_size..][..bitmap_size];
            for r in &e.registers {
                set_bit(bitmap, usize::from(*r));
            }
            for s in &e.stack_slots {
                assert!(*s < stack_slot_count, "stack slot {s} out of range");
                set_bit(bitmap, NUM_REGISTERS as usize + *s as usize);
            }
        }
        out
    }
}

fn set_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

fn get_bit(bitmap: &[u8], bit: usize) -> bool {
    bitmap
        .get(bit / 8)
        .map(|x| x & (1 << (bit % 8)) != 0)
        .unwrap_or(false)
}

/// A parsed view over a serialised safepoint table.
#[derive(Clone, Copy, Debug)]
pub struct SafepointTable<'a> {
    data: &'a [u8],
    length: usize,
    bitmap_size: usize,
}

/// One safepoint.
#[derive(Clone, Copy, Debug)]
pub struct SafepointEntry<'a> {
    pub pc_offset: u32,
    pub deopt_index: Option<u32>,
    pub gap_code_size: u16,
    pub argument_count: u16,
    bitmap: &'a [u8],
}

impl SafepointEntry<'_> {
    pub fn has_register(&self, reg: u8) -> bool {
        get_bit(self.bitmap, usize::from(reg))
    }

    pub fn has_stack_slot(&self, slot: u32) -> bool {
        get_bit(self.bitmap, NUM_REGISTERS as usize + slot as usize)
    }
}

impl<'a> SafepointTable<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, SafepointError> {
        if data.len() < HEADER_SIZE {
            return Err(SafepointError::Truncated {
                needed: HEADER_SIZE,
                found: data.len(),
            });
        }
        let length = LittleEndian::read_u32(&data[0..4]) as usize;
        let bitmap_size = LittleEndian::read_u32(&data[4..8]) as usize;
        let needed = HEADER_SIZE + length * (ENTRY_SIZE + bitmap_size);
        if data.len() < needed {
            return Err(SafepointError::Truncated {
                needed,
                found: data.len(),
            });
        }
        let table = Self {
            data,
            length,
            bitmap_size,
        };
        for i in 1..length {
            if table.pc_offset(i - 1) >= table.pc_offset(i) {
                return Err(SafepointError::Unsorted(i));
            }
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn pc_offset(&self, i: usize) -> u32 {
        let off = HEADER_SIZE + i * ENTRY_SIZE;
        LittleEndian::read_u32(&self.data[off..off + 4])
    }

    /// # Panics
    ///
    /// If `i >= self.len()`.
    pub fn entry(&self, i: usize) -> SafepointEntry<'a> {
        assert!(i < self.length);
        let off = HEADER_SIZE + i * ENTRY_SIZE;
        let deopt_index = LittleEndian::read_u32(&self.data[off + 4..off + 8]);
        let bitmaps_start = HEADER_SIZE + self.length * ENTRY_SIZE;
        SafepointEntry {
            pc_offset: self.pc_offset(i),
            deopt_index: (deopt_index != NO_DEOPT_INDEX).then_some(deopt_index),
            gap_code_size: LittleEndian::read_u16(&self.data[off + 8..off + 10]),
            argument_count: LittleEndian::read_u16(&self.data[off + 10..off + 12]),
            bitmap: &self.data[bitmaps_start + i * self.bitmap_size..][..self.bitmap_size],
        }
    }

    /// Find the safepoint at exactly `pc_offset`.
    pub fn find_entry(&self, pc_offset: u32) -> Option<SafepointEntry<'a>> {
        let (mut lo, mut hi) = (0, self.length);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.pc_offset(mid).cmp(&pc_offset) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(self.entry(mid)),
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = SafepointEntry<'a>> + 'a {
        let t = *self;
        (0..self.length).map(move |i| t.entry(i))
    }
}
