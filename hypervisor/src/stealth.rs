//! Process-wide stealth masks.
//!
//! When enabled, the CPUID and MSR handlers route their results through these
//! masks so the guest cannot see the virtualization footprint. The flags are
//! plain atomics: they are read on every exit and only ever mutated through
//! the hypercall interface.

use crate::svm::msr::EFER_SVME;
use core::sync::atomic::{AtomicBool, Ordering};
use x86::msr::IA32_EFER;

/// `CPUID Fn0000_0001_ECX[31]`, the hypervisor-present bit.
pub const CPUID_HV_PRESENT: u32 = 1 << 31;

/// `CPUID Fn8000_0001_ECX[2]`, the SVM feature bit (mirrored into EDX by the
/// mask because that is where scanners look for it).
pub const CPUID_SVM_FEATURE: u32 = 1 << 2;

static STEALTH_ENABLED: AtomicBool = AtomicBool::new(false);
static HIDE_SVM_MSR: AtomicBool = AtomicBool::new(true);

pub fn enable() {
    STEALTH_ENABLED.store(true, Ordering::SeqCst);
}

pub fn disable() {
    STEALTH_ENABLED.store(false, Ordering::SeqCst);
}

pub fn is_enabled() -> bool {
    STEALTH_ENABLED.load(Ordering::SeqCst)
}

/// Strips the virtualization bits from a CPUID result.
pub fn cpuid_mask(leaf: u32, ecx: &mut u32, edx: &mut u32) {
    if !is_enabled() {
        return;
    }

    if leaf == 1 {
        *ecx &= !CPUID_HV_PRESENT;
    }

    if leaf == 0x8000_0001 {
        *edx &= !CPUID_SVM_FEATURE;
    }
}

/// Cleans up MSR values on their way to the guest. Currently hides EFER.SVME.
pub fn msr_mask_read(msr: u32, value: u64) -> u64 {
    if !is_enabled() || !HIDE_SVM_MSR.load(Ordering::SeqCst) {
        return value;
    }

    if msr == IA32_EFER {
        return value & !EFER_SVME;
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::lock_global_state;

    #[test]
    fn toggling_is_idempotent() {
        let _guard = lock_global_state();

        // Disabling without a prior enable is fine.
        disable();
        assert!(!is_enabled());

        enable();
        enable();
        assert!(is_enabled());

        disable();
        disable();
        assert!(!is_enabled());
    }

    #[test]
    fn masks_apply_only_when_enabled() {
        let _guard = lock_global_state();

        let mut ecx = u32::MAX;
        let mut edx = u32::MAX;

        disable();
        cpuid_mask(1, &mut ecx, &mut edx);
        assert_eq!(ecx, u32::MAX);
        assert_eq!(msr_mask_read(IA32_EFER, EFER_SVME), EFER_SVME);

        enable();
        cpuid_mask(1, &mut ecx, &mut edx);
        assert_eq!(ecx, u32::MAX & !CPUID_HV_PRESENT);
        assert_eq!(edx, u32::MAX);

        cpuid_mask(0x8000_0001, &mut ecx, &mut edx);
        assert_eq!(edx, u32::MAX & !CPUID_SVM_FEATURE);

        assert_eq!(msr_mask_read(IA32_EFER, EFER_SVME | 0xD01), 0xD01);
        // Other MSRs pass through untouched.
        assert_eq!(msr_mask_read(0xC000_0081, 0x1234), 0x1234);

        disable();
    }
}
