use crate::platform;
use crate::svm::data::guest_regs::GuestRegisters;
use crate::svm::data::vcpu_data::VcpuData;
use crate::svm::vmexit::{advance_rip, INSN_LEN_RDTSC, INSN_LEN_RDTSCP};

/// Ticks subtracted from every intercepted TSC read to absorb the average
/// world-switch latency. An approximation; the real cost varies by core.
pub const VMEXIT_OVERHEAD_TICKS: u64 = 500;

fn cloaked_tsc(data: &VcpuData, tsc: u64) -> u64 {
    tsc.wrapping_add(data.guest_vmcb.control_area.tsc_offset)
        .wrapping_sub(VMEXIT_OVERHEAD_TICKS)
}

pub fn handle_rdtsc(data: &mut VcpuData, regs: &mut GuestRegisters) {
    let tsc = cloaked_tsc(data, platform::rdtsc());

    regs.rax = tsc & 0xFFFF_FFFF;
    regs.rdx = tsc >> 32;

    advance_rip(data, INSN_LEN_RDTSC);
}

pub fn handle_rdtscp(data: &mut VcpuData, regs: &mut GuestRegisters) {
    let (tsc, aux) = platform::rdtscp();
    let tsc = cloaked_tsc(data, tsc);

    regs.rax = tsc & 0xFFFF_FFFF;
    regs.rdx = tsc >> 32;
    regs.rcx = aux as u64;

    advance_rip(data, INSN_LEN_RDTSCP);
}
