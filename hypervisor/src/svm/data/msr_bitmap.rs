use crate::error::{IopmAllocSnafu, MsrpmAllocSnafu, Result};
use crate::utils::memory::AllocatedMemory;
use snafu::OptionExt;
use x86::msr::{IA32_EFER, IA32_FMASK, IA32_LSTAR, IA32_STAR};

/// Size of the msr permission map.
pub const MSRPM_SIZE: usize = 3 * 0x1000;

/// Size of the io permission map.
pub const IOPM_SIZE: usize = 2 * 0x1000;

const BITS_PER_MSR: u32 = 2;

/// The ranges the permission map covers, together with the byte offset of the
/// corresponding 2KB region. See `15.11 MSR Intercepts`.
const MSR_RANGES: [(u32, u32, usize); 3] = [
    (0x0000_0000, 0x0000_1FFF, 0x0000),
    (0xC000_0000, 0xC000_1FFF, 0x0800),
    (0xC001_0000, 0xC001_1FFF, 0x1000),
];

/// The msr permission map.
///
/// Zero-filled, which means no MSR access is intercepted. Individual MSRs are
/// opted in with [`Self::hook_rdmsr`]/[`Self::hook_wrmsr`].
#[repr(C, align(4096))]
pub struct MsrBitmap {
    bitmap: [u8; MSRPM_SIZE],
}

impl MsrBitmap {
    pub fn new() -> Result<AllocatedMemory<Self>> {
        log::trace!("Allocating msr permission map");

        AllocatedMemory::alloc_contiguous(core::mem::size_of::<Self>()).context(MsrpmAllocSnafu)
    }

    /// Requests the intercepts the msr handler relies on: EFER for the
    /// stealth mask and the syscall MSRs for the hook shadow.
    pub fn request_default_intercepts(&mut self) {
        for msr in [IA32_EFER, IA32_LSTAR, IA32_STAR, IA32_FMASK] {
            self.hook_rdmsr(msr);
            self.hook_wrmsr(msr);
        }
    }

    pub fn hook_rdmsr(&mut self, msr: u32) {
        if let Some(bit) = Self::bit_for(msr, false) {
            self.set_bit(bit);
        }
    }

    pub fn hook_wrmsr(&mut self, msr: u32) {
        if let Some(bit) = Self::bit_for(msr, true) {
            self.set_bit(bit);
        }
    }

    /// Bit index inside the map for the msr, or `None` when the msr is
    /// outside of the covered ranges (such accesses always exit).
    fn bit_for(msr: u32, write: bool) -> Option<usize> {
        let (base, _, offset) = MSR_RANGES
            .iter()
            .find(|(base, last, _)| (*base..=*last).contains(&msr))?;

        let bit = offset * 8 + ((msr - base) * BITS_PER_MSR) as usize;
        Some(bit + write as usize)
    }

    fn set_bit(&mut self, bit: usize) {
        self.bitmap[bit / 8] |= 1 << (bit % 8);
    }

    #[cfg(test)]
    fn is_bit_set(&self, bit: usize) -> bool {
        self.bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }
}

/// The io permission map. Zero-filled: no port access is intercepted.
#[repr(C, align(4096))]
pub struct IoPermissionMap {
    bitmap: [u8; IOPM_SIZE],
}

impl IoPermissionMap {
    pub fn new() -> Result<AllocatedMemory<Self>> {
        log::trace!("Allocating io permission map");

        AllocatedMemory::alloc_contiguous(core::mem::size_of::<Self>()).context(IopmAllocSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efer_lands_in_the_second_region() {
        // (0xC0000080 - 0xC0000000) * 2 bits past byte 0x800.
        let read_bit = MsrBitmap::bit_for(IA32_EFER, false).unwrap();
        assert_eq!(read_bit, 0x800 * 8 + 0x80 * 2);

        let write_bit = MsrBitmap::bit_for(IA32_EFER, true).unwrap();
        assert_eq!(write_bit, read_bit + 1);
    }

    #[test]
    fn uncovered_msrs_have_no_slot() {
        assert!(MsrBitmap::bit_for(0x4000_0000, false).is_none());
    }

    #[test]
    fn default_intercepts_set_both_directions() {
        let mut bitmap = MsrBitmap::new().unwrap();
        bitmap.request_default_intercepts();

        for msr in [IA32_EFER, IA32_LSTAR, IA32_STAR, IA32_FMASK] {
            assert!(bitmap.is_bit_set(MsrBitmap::bit_for(msr, false).unwrap()));
            assert!(bitmap.is_bit_set(MsrBitmap::bit_for(msr, true).unwrap()));
        }
    }
}
