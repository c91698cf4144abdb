use crate::hooks;
use crate::platform;
use crate::stealth;
use crate::svm::data::guest_regs::GuestRegisters;
use crate::svm::data::vcpu_data::VcpuData;
use crate::svm::events::EventInjection;
use crate::svm::msr::EFER_SVME;
use crate::svm::vmexit::{advance_rip, INSN_LEN_MSR};
use x86::msr::IA32_EFER;

/// Whether the MSR is listed in the `Open-Source Register Reference for AMD
/// CPUs` (56255, `Memory Map - MSR`). Accesses outside of these ranges would
/// raise `#GP` on the host and take the hypervisor down with them.
fn is_published_msr(msr: u32) -> bool {
    // MSRs - MSR0000_xxxx
    (0x0000_0000..=0x0000_0001).contains(&msr)
        || (0x0000_0010..=0x0000_02FF).contains(&msr)
        || (0x0000_0400..=0x0000_0403).contains(&msr)
        || (0x0000_0404..=0x0000_0407).contains(&msr)
        || (0x0000_0408..=0x0000_040B).contains(&msr)
        || (0x0000_040C..=0x0000_040F).contains(&msr)
        || (0x0000_0414..=0x0000_0417).contains(&msr)
        || (0x0000_0418..=0x0000_041B).contains(&msr)
        || (0x0000_041C..=0x0000_043B).contains(&msr)
        || (0x0000_043C..=0x0000_0443).contains(&msr)
        || (0x0000_044C..=0x0000_044F).contains(&msr)
        || (0x0000_0450..=0x0000_0457).contains(&msr)
        || (0x0000_0458..=0x0000_045B).contains(&msr)
        // MSRs - MSRC000_0xxx
        || (0xC000_0080..=0xC000_0410).contains(&msr)
        || (0xC000_2000..=0xC000_2009).contains(&msr)
        || (0xC000_2010..=0xC000_2016).contains(&msr)
        || (0xC000_2020..=0xC000_2029).contains(&msr)
        || (0xC000_2030..=0xC000_2036).contains(&msr)
        || (0xC000_2040..=0xC000_2049).contains(&msr)
        || (0xC000_2050..=0xC000_2056).contains(&msr)
        || (0xC000_2060..=0xC000_2066).contains(&msr)
        || (0xC000_2070..=0xC000_20E9).contains(&msr)
        || (0xC000_20F0..=0xC000_210A).contains(&msr)
        || (0xC000_2130..=0xC000_2136).contains(&msr)
        || (0xC000_2140..=0xC000_2159).contains(&msr)
        || (0xC000_2160..=0xC000_2169).contains(&msr)
        // MSRs - MSRC001_0xxx
        || (0xC001_0000..=0xC001_029B).contains(&msr)
        || (0xC001_0400..=0xC001_0406).contains(&msr)
        || (0xC001_0407..=0xC001_040E).contains(&msr)
        || (0xC001_0413..=0xC001_0416).contains(&msr)
        // MSRs - MSRC001_1xxx
        || (0xC001_1002..=0xC001_103C).contains(&msr)
}

pub fn handle(data: &mut VcpuData, regs: &mut GuestRegisters) {
    // The top bit of the count register selects the direction; the low half
    // is the MSR number.
    let write = regs.rcx >> 63 != 0;
    let msr = regs.rcx as u32;

    if write {
        let value = (regs.rdx << 32) | (regs.rax & 0xFFFF_FFFF);
        handle_write(data, msr, value);
    } else {
        handle_read(data, regs, msr);
    }

    advance_rip(data, INSN_LEN_MSR);
}

fn handle_read(data: &mut VcpuData, regs: &mut GuestRegisters, msr: u32) {
    // The syscall MSRs come out of the shadow block so an active hook stays
    // invisible, everything else is read live and filtered.
    let value = if let Some(value) = hooks::syscall_msr_read(msr) {
        value
    } else if is_published_msr(msr) {
        stealth::msr_mask_read(msr, platform::rdmsr(msr))
    } else {
        EventInjection::gp().inject(data);
        return;
    };

    regs.rax = value & 0xFFFF_FFFF;
    regs.rdx = value >> 32;
}

fn handle_write(data: &mut VcpuData, msr: u32, value: u64) {
    if hooks::syscall_msr_write(msr, value) {
        return;
    }

    if msr == IA32_EFER {
        // SVME stays set no matter what the guest asks for; clearing it would
        // make the next vmrun fail. Reads are masked, so the guest cannot
        // tell.
        data.guest_vmcb.save_area.efer = value | EFER_SVME;
        return;
    }

    if is_published_msr(msr) {
        platform::wrmsr(msr, value);
    } else {
        EventInjection::gp().inject(data);
    }
}
