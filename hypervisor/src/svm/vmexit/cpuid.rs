use crate::platform;
use crate::stealth;
use crate::svm::data::guest_regs::GuestRegisters;
use crate::svm::data::vcpu_data::VcpuData;
use crate::svm::vmexit::{advance_rip, INSN_LEN_CPUID};

/// Leaves reserved for hypervisor vendor information. Scanners walk the whole
/// range, so all of it reads as zeros.
const HV_LEAF_FIRST: u32 = 0x4000_0000;
const HV_LEAF_LAST: u32 = 0x4000_00FF;

const LEAF_FEATURES: u32 = 0x0000_0001;
const LEAF_EXTENDED_FEATURES: u32 = 0x8000_0001;

pub fn handle(data: &mut VcpuData, regs: &mut GuestRegisters) {
    let leaf = regs.rax as u32;
    let subleaf = regs.rcx as u32;

    let mut eax = 0;
    let mut ebx = 0;
    let mut ecx = 0;
    let mut edx = 0;

    if !(HV_LEAF_FIRST..=HV_LEAF_LAST).contains(&leaf) {
        let result = platform::cpuid(leaf, subleaf);
        eax = result.eax;
        ebx = result.ebx;
        ecx = result.ecx;
        edx = result.edx;

        if leaf == LEAF_FEATURES {
            ecx &= !stealth::CPUID_HV_PRESENT;
        }

        if leaf == LEAF_EXTENDED_FEATURES {
            edx &= !stealth::CPUID_SVM_FEATURE;
        }

        // The configurable masks come last so they always win.
        stealth::cpuid_mask(leaf, &mut ecx, &mut edx);
    }

    regs.rax = eax as u64;
    regs.rbx = ebx as u64;
    regs.rcx = ecx as u64;
    regs.rdx = edx as u64;

    advance_rip(data, INSN_LEN_CPUID);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svm::vmcb::control_area::VMEXIT_CPUID;
    use crate::svm::vmexit::dispatch;
    use crate::utils::testing::{lock_global_state, test_vcpu};

    fn run_leaf(leaf: u64) -> (u64, GuestRegisters) {
        let mut data = test_vcpu();
        data.guest_vmcb.control_area.exit_code = VMEXIT_CPUID;
        data.guest_vmcb.save_area.rax = leaf;
        data.guest_vmcb.save_area.rip = 0x1000;

        let mut regs = GuestRegisters::default();
        dispatch(&mut data, &mut regs);

        (data.guest_vmcb.save_area.rip, regs)
    }

    #[test]
    fn leaf_1_hides_the_hypervisor_bit() {
        let _guard = lock_global_state();
        crate::stealth::disable();

        let (rip, regs) = run_leaf(1);

        // Native passthrough of everything but the hypervisor bit.
        assert_ne!(regs.rax, 0);
        assert_eq!(regs.rcx & (1 << 31), 0);
        assert_ne!(regs.rdx, 0);
        assert_eq!(rip, 0x1002);
    }

    #[test]
    fn extended_leaf_hides_svm() {
        let _guard = lock_global_state();

        let (_, regs) = run_leaf(0x8000_0001);
        assert_eq!(regs.rdx & (1 << 2), 0);
    }

    #[test]
    fn hypervisor_vendor_leaves_read_as_zero() {
        let _guard = lock_global_state();

        for leaf in [0x4000_0000, 0x4000_0001, 0x4000_00FF] {
            let (rip, regs) = run_leaf(leaf);
            assert_eq!(regs.rax, 0);
            assert_eq!(regs.rbx, 0);
            assert_eq!(regs.rcx, 0);
            assert_eq!(regs.rdx, 0);
            assert_eq!(rip, 0x1002);
        }

        // The leaf right after the range goes to the hardware again (which
        // the test backend answers with zeros for unknown leaves).
        let (_, regs) = run_leaf(0x4000_0100);
        assert_eq!(regs.rax, 0);
    }
}
