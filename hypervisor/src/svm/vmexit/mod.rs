//! The `#VMEXIT` dispatcher.
//!
//! `handle_vmexit` is the symbol the trampoline calls after it pushed the
//! register snapshot; everything else in here is the state machine behind it.

use crate::platform;
use crate::svm::data::guest_regs::GuestRegisters;
use crate::svm::data::vcpu_data::VcpuData;
use crate::svm::events::EventInjection;
use crate::svm::vmcb::control_area::{
    INT_CONTROL_SMI_PENDING, INT_CONTROL_V_IRQ, TLB_CONTROL_FLUSH_GUEST_ASID, VMEXIT_CPUID,
    VMEXIT_HLT, VMEXIT_IOIO, VMEXIT_MSR, VMEXIT_NPF, VMEXIT_RDTSC, VMEXIT_RDTSCP, VMEXIT_SMI,
    VMEXIT_VINTR, VMEXIT_VMMCALL, VMEXIT_VMRUN, VMEXIT_XSETBV,
};

pub mod cpuid;
pub mod msr;
pub mod npf;
pub mod rdtsc;
pub mod vmmcall;

// Fallback instruction lengths for processors without the next-RIP field.
pub const INSN_LEN_HLT: u64 = 1;
pub const INSN_LEN_CPUID: u64 = 2;
pub const INSN_LEN_MSR: u64 = 2;
pub const INSN_LEN_RDTSC: u64 = 2;
pub const INSN_LEN_IOIO: u64 = 2;
pub const INSN_LEN_VMMCALL: u64 = 3;
pub const INSN_LEN_RDTSCP: u64 = 3;
pub const INSN_LEN_XSETBV: u64 = 3;

/// Completes the intercepted instruction: prefers the hardware-provided next
/// RIP and falls back to the architectural length.
pub fn advance_rip(data: &mut VcpuData, length: u64) {
    let nrip = data.guest_vmcb.control_area.nrip;

    if nrip != 0 {
        data.guest_vmcb.save_area.rip = nrip;
    } else {
        data.guest_vmcb.save_area.rip += length;
    }
}

/// Entry point for the trampoline. A non-zero return tears the loop down.
///
/// # Safety
/// Both pointers come from the trampoline and are only valid in its stack
/// discipline: `data` is the vcpu block, `guest_regs` the snapshot right
/// above the host RSP.
#[no_mangle]
pub unsafe extern "C" fn handle_vmexit(
    data: *mut VcpuData,
    guest_regs: *mut GuestRegisters,
) -> u8 {
    dispatch(&mut *data, &mut *guest_regs) as u8
}

/// Handles one exit and prepares the VMCB for the next `vmrun`.
pub fn dispatch(data: &mut VcpuData, regs: &mut GuestRegisters) -> bool {
    let exit_code = data.guest_vmcb.control_area.exit_code;
    data.telemetry.record_exit(exit_code);

    // Reload the segment bases and syscall MSRs the guest execution trashed.
    platform::vmload(data.host_stack_layout.host_vmcb_pa);
    assert_eq!(data.host_stack_layout.reserved_1, u64::MAX);

    // The guest RAX lives in the VMCB, not on the snapshot; reflect it so the
    // handlers see a complete register image.
    regs.rax = data.guest_vmcb.save_area.rax;

    data.npt.update_shadow_cr3(data.guest_vmcb.save_area.cr3);

    match exit_code {
        VMEXIT_CPUID => cpuid::handle(data, regs),
        VMEXIT_MSR => msr::handle(data, regs),
        VMEXIT_VMMCALL => vmmcall::handle(data, regs),
        VMEXIT_NPF => npf::handle(data, regs),
        VMEXIT_RDTSC => rdtsc::handle_rdtsc(data, regs),
        VMEXIT_RDTSCP => rdtsc::handle_rdtscp(data, regs),
        VMEXIT_HLT => handle_hlt(data),
        VMEXIT_IOIO => handle_io(data),
        VMEXIT_VINTR => handle_vintr(data),
        VMEXIT_SMI => handle_smi(data),
        VMEXIT_XSETBV => handle_xsetbv(data, regs),
        VMEXIT_VMRUN => handle_vmrun(data),
        _ => handle_unknown(data, exit_code),
    }

    // Reflect a possibly updated RAX back; `vmrun` loads it from the VMCB.
    data.guest_vmcb.save_area.rax = regs.rax;

    if data.npt.tlb_flush_pending {
        data.guest_vmcb.control_area.tlb_control = TLB_CONTROL_FLUSH_GUEST_ASID;
        data.npt.tlb_flush_pending = false;
    }

    false
}

/// The guest halted; just move past the instruction instead of stopping the
/// world.
fn handle_hlt(data: &mut VcpuData) {
    advance_rip(data, INSN_LEN_HLT);
}

/// Port I/O passthrough stub.
fn handle_io(data: &mut VcpuData) {
    advance_rip(data, INSN_LEN_IOIO);
}

/// Acknowledge the virtual interrupt request; the architecture redelivers it
/// on the next `vmrun`.
fn handle_vintr(data: &mut VcpuData) {
    data.guest_vmcb.control_area.int_control &= !INT_CONTROL_V_IRQ;
}

/// SMIs have no instruction to complete; only the pending state is cleared.
fn handle_smi(data: &mut VcpuData) {
    data.guest_vmcb.control_area.int_control &= !INT_CONTROL_SMI_PENDING;
}

/// Runs `xsetbv` on the guest's behalf. Required for AVX-enabled guests.
fn handle_xsetbv(data: &mut VcpuData, regs: &mut GuestRegisters) {
    let xcr = regs.rcx as u32;
    let value = (regs.rdx << 32) | (regs.rax & 0xFFFF_FFFF);
    platform::xsetbv(xcr, value);

    advance_rip(data, INSN_LEN_XSETBV);
}

/// A guest is not allowed to run its own guests.
fn handle_vmrun(data: &mut VcpuData) {
    EventInjection::gp().inject(data);
}

/// Unknown exit: record it and raise `#UD` in the guest. Safer than guessing
/// an instruction length and corrupting the instruction stream.
fn handle_unknown(data: &mut VcpuData, exit_code: u64) {
    log::warn!(
        "Unhandled vmexit {:#x} at rip {:#x}",
        exit_code,
        data.guest_vmcb.save_area.rip
    );

    data.telemetry.record_unhandled(exit_code);
    EventInjection::ud().inject(data);
}
