//! Patching lazy deoptimisation sites in optimised code.
//!
//! Each site which may need to deoptimise lazily is the return address of a call in the optimised
//! code, plus that safepoint's gap code. When the code is invalidated, each site is overwritten
//! with a call to the lazy deoptimisation entry for that site's bailout, so that activations
//! returning into the code deoptimise instead of continuing in it. The compiler must leave room for
//! this call after every site.

use crate::{errors::DeoptError, errors::fatal, tagged::Address};
use deoptmap::{DeoptEntry, SafepointTable};
use dynasmrt::{DynasmApi, VecAssembler, dynasm, x64::X64Relocation};
use smallvec::SmallVec;

/// The size of the patched call: `mov r10, imm64; call r10`.
pub const PATCH_SIZE: usize = 13;

/// A lazy deoptimisation site.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PatchSite {
    /// The deoptimisation entry the site bails out to.
    pub deopt_index: usize,
    /// Where the call is written, as an offset into the code's instructions.
    pub pc_offset: u32,
}

/// Return the lazy deoptimisation sites of code with deoptimisation entries `entries` and
/// safepoint table `safepoints`, sorted by offset.
pub fn lazy_patch_sites(
    entries: &[DeoptEntry],
    safepoints: Option<&SafepointTable>,
) -> SmallVec<[PatchSite; 8]> {
    let mut sites = entries
        .iter()
        .enumerate()
        .filter_map(|(i, e)| {
            let pc = e.pc_offset?;
            let gap = safepoints
                .and_then(|t| t.find_entry(pc))
                .map(|sp| u32::from(sp.gap_code_size))
                .unwrap_or(0);
            Some(PatchSite {
                deopt_index: i,
                pc_offset: pc + gap,
            })
        })
        .collect::<SmallVec<[PatchSite; 8]>>();
    sites.sort_by_key(|s| s.pc_offset);
    sites
}

/// Check that every site in `sites` (sorted by offset) leaves room for a patched call before the
/// next site and before the end of `code_size` bytes of instructions.
pub fn check_patch_budget(code_size: usize, sites: &[PatchSite]) -> Result<(), DeoptError> {
    for (i, s) in sites.iter().enumerate() {
        let limit = sites
            .get(i + 1)
            .map(|next| next.pc_offset as usize)
            .unwrap_or(code_size);
        let available = limit.saturating_sub(s.pc_offset as usize);
        if available < PATCH_SIZE {
            return Err(DeoptError::PatchTooLarge {
                pc_offset: s.pc_offset,
                available,
                needed: PATCH_SIZE,
            });
        }
    }
    Ok(())
}

/// Generate a call to `target`.
pub fn call_sequence(target: Address) -> Result<Vec<u8>, DeoptError> {
    let mut asm = VecAssembler::<X64Relocation>::new(0);
    dynasm!(asm
        ; mov r10, QWORD target as i64
        ; call r10
    );
    let code = asm
        .finalize()
        .map_err(|e| DeoptError::CodeGeneration(e.to_string()))?;
    if code.len() != PATCH_SIZE {
        return Err(DeoptError::CodeGeneration(format!(
            "call sequence is {} bytes, expected {PATCH_SIZE}",
            code.len()
        )));
    }
    Ok(code)
}

/// Overwrite the instructions at `pc_offset` with `call`.
///
/// # Panics
///
/// If the call does not fit in `instructions`.
pub fn patch_call(instructions: &mut [u8], pc_offset: u32, call: &[u8]) {
    let start = pc_offset as usize;
    match instructions.get_mut(start..start + call.len()) {
        Some(dst) => dst.copy_from_slice(call),
        None => fatal!(
            "patch at {pc_offset} runs past the end of {} bytes of code",
            instructions.len()
        ),
    }
}
