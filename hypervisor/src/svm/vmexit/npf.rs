use crate::hooks;
use crate::npt::{LATE_MMIO_END, PCI_MMIO_START};
use crate::svm::data::guest_regs::GuestRegisters;
use crate::svm::data::vcpu_data::VcpuData;
use crate::svm::events::EventInjection;
use crate::svm::paging::page_align_2mb;

/// Nested page fault. No RIP adjustment anywhere in here: the faulting
/// instruction is retried once the mapping is fixed up, or it takes the
/// injected fault.
pub fn handle(data: &mut VcpuData, _regs: &mut GuestRegisters) {
    let fault_gpa = data.guest_vmcb.control_area.exit_info2;
    let error_code = data.guest_vmcb.control_area.exit_info1;

    data.telemetry.record_npf(fault_gpa, error_code);

    // The armed trigger slots have the first claim on the fault.
    if let Some(message) = data.npt.handle_hardware_triggers(fault_gpa) {
        data.npt.mailbox.last_message = message;
        return;
    }

    if hooks::handle_npt_fault(&mut data.npt, fault_gpa) {
        return;
    }

    // MMIO that firmware reported late gets its mapping on first touch.
    let page = page_align_2mb(fault_gpa);
    if (PCI_MMIO_START..LATE_MMIO_END).contains(&page)
        && data.npt.terminal(fault_gpa).is_none()
        && data.npt.map_2mb(page, true).is_ok()
    {
        log::info!("Created late mmio mapping for {:#x}", page);
        return;
    }

    // Nobody claimed it; reflect a page fault into the guest.
    log::warn!(
        "Unhandled npf at {:#x}, error code {:#x}, rip {:#x}",
        fault_gpa,
        error_code,
        data.guest_vmcb.save_area.rip
    );

    EventInjection::pf(error_code as u32).inject(data);
    data.guest_vmcb.save_area.cr2 = fault_gpa;
}
