//! Tagged machine words.
//!
//! A word whose low bit is 0 is a small integer ("Smi") holding a 31 bit signed value in its upper
//! bits. A word whose low bit is 1 is a reference to an object in the [Heap](crate::heap::Heap).

use std::fmt;

/// A machine address.
pub type Address = u64;

/// The size of a machine word and of every stack slot, in bytes.
pub const WORD_SIZE: usize = 8;

#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Tagged(u64);

impl Tagged {
    pub const SMI_MIN: i64 = -(1 << 30);
    pub const SMI_MAX: i64 = (1 << 30) - 1;
    pub const ZERO: Tagged = Tagged(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid_smi(v: i64) -> bool {
        (Self::SMI_MIN..=Self::SMI_MAX).contains(&v)
    }

    /// Return `v` as a Smi, or `None` if it is out of range.
    pub fn smi(v: i64) -> Option<Self> {
        Self::is_valid_smi(v).then(|| Self((v << 1) as u64))
    }

    /// # Panics
    ///
    /// If `v` is out of the Smi range.
    pub fn smi_unchecked(v: i64) -> Self {
        assert!(Self::is_valid_smi(v), "{v} is not a valid Smi");
        Self((v << 1) as u64)
    }

    pub fn is_smi(self) -> bool {
        self.0 & 1 == 0
    }

    pub fn is_heap_object(self) -> bool {
        !self.is_smi()
    }

    pub fn smi_value(self) -> Option<i32> {
        // The arithmetic shift recovers the sign.
        self.is_smi().then(|| ((self.0 as i64) >> 1) as i32)
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.smi_value() {
            Some(v) => write!(f, "Smi({v})"),
            None => write!(f, "Tagged({:#x})", self.0),
        }
    }
}

impl fmt::Display for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
