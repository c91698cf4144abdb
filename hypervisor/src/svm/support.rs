//! Checks whether the current system is able to run the hypervisor.

use crate::error::{HvError, Result};
use crate::platform;
use crate::svm::msr::{EFER_SVME, SVM_MSR_VM_CR, SVM_VM_CR_SVMDIS};
use x86::cpuid::CpuId;
use x86::msr::IA32_EFER;

/// Verifies that the processor exposes SVM and that firmware has not disabled
/// it.
///
/// # Recommended Algorithm
/// This algorithm has been taken from section `15.4 Enabling SVM` of the AMD
/// manual.
/// ```pseudocode
/// if (CPUID Fn8000_0001_ECX[SVM] == 0)
///     return SVM_NOT_AVAIL;
///
/// if (VM_CR.SVMDIS == 0)
///     return SVM_ALLOWED;
///
/// if (CPUID Fn8000_000A_EDX[SVML]==0)
///     return SVM_DISABLED_AT_BIOS_NOT_UNLOCKABLE
/// else
///     return SVM_DISABLED_WITH_KEY;
/// ```
pub fn check_svm_support() -> Result<()> {
    // Check `CPUID Fn8000_0001_ECX[SVM] == 0`
    //
    let feature_id = CpuId::new().get_extended_processor_and_feature_identifiers();
    let Some(feature_id) = feature_id else {
        return Err(HvError::NotSupported);
    };
    if !feature_id.has_svm() {
        log::warn!("Processor does not support SVM");
        return Err(HvError::NotSupported);
    }

    // Check `VM_CR.SVMDIS == 0`
    //
    let vm_cr = platform::rdmsr(SVM_MSR_VM_CR);
    if vm_cr & SVM_VM_CR_SVMDIS == 0 {
        return Ok(());
    }

    if CpuId::new()
        .get_svm_info()
        .map(|svm_info| svm_info.has_svm_lock())
        .unwrap_or_default()
    {
        log::warn!("SVM is locked at BIOS level. You must change a platform firmware setting to enable SVM.");
    } else {
        log::warn!("SVMLock may be unlockable; consult platform firmware or TPM to obtain the key.");
    }

    Err(HvError::NotSupported)
}

/// Sets EFER.SVME if it is still clear.
pub fn enable_svm() {
    let efer = platform::rdmsr(IA32_EFER);
    if efer & EFER_SVME == 0 {
        platform::wrmsr(IA32_EFER, efer | EFER_SVME);
    }
}

/// Clears EFER.SVME. Used by the unload path after the vmrun loops are gone.
pub fn disable_svm() {
    let efer = platform::rdmsr(IA32_EFER);
    platform::wrmsr(IA32_EFER, efer & !EFER_SVME);
}
