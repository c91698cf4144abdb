use crate::guest_mem;
use crate::hooks;
use crate::hypercall::{self, *};
use crate::npt::TRIGGER_SLOT_COUNT;
use crate::process;
use crate::stealth;
use crate::svm::data::guest_regs::GuestRegisters;
use crate::svm::data::vcpu_data::VcpuData;
use crate::svm::events::EventInjection;
use crate::svm::vmexit::{advance_rip, INSN_LEN_VMMCALL};

pub fn handle(data: &mut VcpuData, regs: &mut GuestRegisters) {
    let code = hypercall::decode(regs.rax);
    let (a1, a2, a3) = (regs.rbx, regs.rcx, regs.rdx);

    if !hypercall::has_signature(a3) {
        // Not one of ours. Raise the fault an unvirtualized machine would.
        EventInjection::ud().inject(data);
        regs.rax = 0;
        advance_rip(data, INSN_LEN_VMMCALL);
        return;
    }

    regs.rax = dispatch_hypercall(data, code, a1, a2, a3);
    advance_rip(data, INSN_LEN_VMMCALL);
}

fn dispatch_hypercall(data: &mut VcpuData, code: u64, a1: u64, a2: u64, _a3: u64) -> u64 {
    match code {
        HC_READ_GVA => {
            let mut buffer = [0u8; 8];
            if guest_mem::read_gva(data, a1, &mut buffer) {
                u64::from_le_bytes(buffer)
            } else {
                0
            }
        }

        HC_WRITE_GVA => guest_mem::write_gva(data, a1, &a2.to_le_bytes()) as u64,

        HC_CR3_CLOAK_ENABLE => {
            hooks::enable_cr3_cloak();
            1
        }

        HC_CR3_CLOAK_DISABLE => {
            hooks::disable_cr3_cloak();
            1
        }

        HC_INSTALL_SHADOW_HOOK => match guest_mem::translate_gva_to_gpa(data, a1) {
            Some(gpa) => data.npt.install_shadow_hook(gpa, a2) as u64,
            None => 0,
        },

        HC_CLEAR_SHADOW_HOOK => {
            data.npt.clear_shadow_hook();
            1
        }

        HC_ARM_TRIGGERS => match trigger_pages_from_gva(data, a1) {
            Some(pages) => data.npt.setup_hardware_triggers(pages) as u64,
            None => 0,
        },

        HC_REARM_TRIGGERS => {
            data.npt.rearm_hardware_triggers();
            1
        }

        HC_STEALTH_ENABLE => {
            stealth::enable();
            1
        }

        HC_STEALTH_DISABLE => {
            stealth::disable();
            1
        }

        HC_MAILBOX_POP => {
            let value = data.npt.mailbox.last_message;
            data.npt.mailbox.last_message = 0;

            // The consumer drained the event; put the traps back in place.
            data.npt.rearm_hardware_triggers();
            value
        }

        HC_MAILBOX_PUSH => {
            data.npt.mailbox.last_message = a1;
            1
        }

        HC_TRANSLATE_GVA_TO_GPA => guest_mem::translate_gva_to_gpa(data, a1).unwrap_or(0),
        HC_TRANSLATE_GVA_TO_HPA => guest_mem::translate_gva_to_hpa(data, a1).unwrap_or(0),
        HC_TRANSLATE_GPA_TO_HPA => guest_mem::translate_gpa_to_hpa(data, a1),

        HC_SYSCALL_HOOK_ENABLE => hooks::install_syscall_hook() as u64,

        HC_SYSCALL_HOOK_DISABLE => {
            hooks::remove_syscall_hook();
            1
        }

        HC_SYSCALL_HOOK_SET_HANDLER => {
            hooks::set_syscall_handler(a1);
            1
        }

        HC_QUERY_CURRENT_PROCESS_BASE => process::query_current()
            .map(|details| details.image_base)
            .unwrap_or(0),

        HC_QUERY_PROCESS_BASE => process::query_by_pid(a1)
            .map(|details| details.image_base)
            .unwrap_or(0),

        HC_QUERY_PROCESS_DIRBASE => process::query_by_pid(a1)
            .map(|details| details.directory_table_base)
            .unwrap_or(0),

        HC_TELEMETRY_NPF_COUNT => data.telemetry.npf_index,

        HC_TELEMETRY_NPF_ENTRY => data
            .telemetry
            .npf_record(a1)
            .map(|record| record.gpa)
            .unwrap_or(0),

        HC_TELEMETRY_EXIT_COUNT => data.telemetry.exit_count_for(a1),

        HC_TELEMETRY_LAST_UNHANDLED => data.telemetry.last_unhandled_exit,

        HC_TELEMETRY_CLEAR => {
            data.telemetry.clear();
            1
        }

        _ => UNKNOWN_OPCODE_RESULT,
    }
}

/// Reads the trigger page list (one GPA page per slot) from guest memory.
fn trigger_pages_from_gva(data: &VcpuData, gva: u64) -> Option<[u64; TRIGGER_SLOT_COUNT]> {
    let mut pages = [0u64; TRIGGER_SLOT_COUNT];

    for (index, page) in pages.iter_mut().enumerate() {
        let mut buffer = [0u8; 8];
        if !guest_mem::read_gva(data, gva + index as u64 * 8, &mut buffer) {
            return None;
        }
        *page = u64::from_le_bytes(buffer);
    }

    Some(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessDetails;
    use crate::svm::vmcb::control_area::VMEXIT_VMMCALL;
    use crate::svm::vmexit::dispatch;
    use crate::utils::memory::AllocatedMemory;
    use crate::utils::testing::{lock_global_state, test_vcpu};

    const GUEST_CR3: u64 = 0x10_0000;
    const GUEST_PDPT: u64 = 0x11_0000;
    const GUEST_PD: u64 = 0x12_0000;
    const GUEST_PT: u64 = 0x13_0000;
    const BACKING_PAGE: u64 = 0x14_0000;
    const MAPPED_GVA: u64 = 0x5000;

    /// Identity-style stub page tables: one 4KB page at `MAPPED_GVA` backed
    /// by `BACKING_PAGE`.
    fn build_guest_tables(data: &mut AllocatedMemory<VcpuData>) {
        let entry = |target: u64| (target | 0x3).to_le_bytes();

        assert!(guest_mem::write_physical(GUEST_CR3, &entry(GUEST_PDPT)));
        assert!(guest_mem::write_physical(GUEST_PDPT, &entry(GUEST_PD)));
        assert!(guest_mem::write_physical(GUEST_PD, &entry(GUEST_PT)));
        assert!(guest_mem::write_physical(
            GUEST_PT + (MAPPED_GVA >> 12) * 8,
            &entry(BACKING_PAGE)
        ));

        data.guest_vmcb.save_area.cr3 = GUEST_CR3;
    }

    fn run_hypercall(
        data: &mut AllocatedMemory<VcpuData>,
        code: u64,
        a1: u64,
        a2: u64,
    ) -> (u64, GuestRegisters) {
        data.guest_vmcb.control_area.exit_code = VMEXIT_VMMCALL;
        data.guest_vmcb.save_area.rax = hypercall::encode(code);
        data.guest_vmcb.save_area.rip = 0x2000;
        data.guest_vmcb.control_area.nrip = 0;

        let mut regs = GuestRegisters::default();
        regs.rbx = a1;
        regs.rcx = a2;
        regs.rdx = hypercall::sign(0);
        dispatch(data, &mut regs);

        (data.guest_vmcb.save_area.rax, regs)
    }

    #[test]
    fn read_gva_returns_guest_memory() {
        let _guard = lock_global_state();
        crate::platform::reset();
        hooks::disable_cr3_cloak();

        let mut data = test_vcpu();
        build_guest_tables(&mut data);

        assert!(guest_mem::write_physical(
            BACKING_PAGE,
            &0xDEAD_BEEF_CAFE_BABEu64.to_le_bytes()
        ));

        let (result, _) = run_hypercall(&mut data, HC_READ_GVA, MAPPED_GVA, 0);
        assert_eq!(result, 0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(data.guest_vmcb.save_area.rip, 0x2003);
    }

    #[test]
    fn write_gva_stores_into_guest_memory() {
        let _guard = lock_global_state();
        crate::platform::reset();
        hooks::disable_cr3_cloak();

        let mut data = test_vcpu();
        build_guest_tables(&mut data);

        let (result, _) = run_hypercall(&mut data, HC_WRITE_GVA, MAPPED_GVA + 8, 0x1122_3344);
        assert_eq!(result, 1);

        let mut buffer = [0u8; 8];
        assert!(guest_mem::read_physical(BACKING_PAGE + 8, &mut buffer));
        assert_eq!(u64::from_le_bytes(buffer), 0x1122_3344);
    }

    #[test]
    fn bad_signature_injects_ud_and_returns_zero() {
        let _guard = lock_global_state();
        crate::platform::reset();

        let mut data = test_vcpu();
        data.guest_vmcb.control_area.exit_code = VMEXIT_VMMCALL;
        data.guest_vmcb.save_area.rax = hypercall::encode(HC_READ_GVA);
        data.guest_vmcb.save_area.rip = 0x2000;

        let mut regs = GuestRegisters::default();
        regs.rdx = 0x1234; // wrong signature
        dispatch(&mut data, &mut regs);

        assert_eq!(data.guest_vmcb.save_area.rax, 0);
        assert_eq!(
            data.guest_vmcb.control_area.event_inj,
            EventInjection::ud().bits()
        );
    }

    #[test]
    fn unknown_opcodes_return_the_poison_value() {
        let _guard = lock_global_state();
        crate::platform::reset();

        let mut data = test_vcpu();
        let (result, _) = run_hypercall(&mut data, 0x999, 0, 0);
        assert_eq!(result, UNKNOWN_OPCODE_RESULT);
    }

    #[test]
    fn translation_hypercalls() {
        let _guard = lock_global_state();
        crate::platform::reset();
        hooks::disable_cr3_cloak();

        let mut data = test_vcpu();
        build_guest_tables(&mut data);

        let (gpa, _) = run_hypercall(&mut data, HC_TRANSLATE_GVA_TO_GPA, MAPPED_GVA + 0x123, 0);
        assert_eq!(gpa, BACKING_PAGE + 0x123);

        let (hpa, _) = run_hypercall(&mut data, HC_TRANSLATE_GVA_TO_HPA, MAPPED_GVA + 0x123, 0);
        assert_eq!(hpa, BACKING_PAGE + 0x123);

        let (hpa, _) = run_hypercall(&mut data, HC_TRANSLATE_GPA_TO_HPA, 0x20_0000, 0);
        assert_eq!(hpa, 0x20_0000);

        // Unmapped addresses translate to the null sentinel.
        let (missing, _) = run_hypercall(&mut data, HC_TRANSLATE_GVA_TO_GPA, 0x7000, 0);
        assert_eq!(missing, 0);
    }

    #[test]
    fn shadow_hook_install_translates_the_target() {
        let _guard = lock_global_state();
        crate::platform::reset();
        hooks::disable_cr3_cloak();

        let mut data = test_vcpu();
        build_guest_tables(&mut data);

        let (result, _) =
            run_hypercall(&mut data, HC_INSTALL_SHADOW_HOOK, MAPPED_GVA + 0x40, 0x99_9000);
        assert_eq!(result, 1);
        assert!(data.npt.shadow_hook.active);
        assert_eq!(data.npt.shadow_hook.target_gpa_page, BACKING_PAGE);
        assert_eq!(data.npt.shadow_hook.new_hpa_page, 0x99_9000);

        let (result, _) = run_hypercall(&mut data, HC_CLEAR_SHADOW_HOOK, 0, 0);
        assert_eq!(result, 1);
        assert!(!data.npt.shadow_hook.active);
    }

    #[test]
    fn mailbox_push_and_pop() {
        let _guard = lock_global_state();
        crate::platform::reset();

        let mut data = test_vcpu();

        let (result, _) = run_hypercall(&mut data, HC_MAILBOX_PUSH, 0x77, 0);
        assert_eq!(result, 1);

        let (value, _) = run_hypercall(&mut data, HC_MAILBOX_POP, 0, 0);
        assert_eq!(value, 0x77);

        // The slot is cleared by the pop.
        let (value, _) = run_hypercall(&mut data, HC_MAILBOX_POP, 0, 0);
        assert_eq!(value, 0);
    }

    #[test]
    fn process_queries_report_bases() {
        let _guard = lock_global_state();
        crate::platform::reset();

        crate::platform::with_state(|state| {
            state.current_process = Some(ProcessDetails {
                image_base: 0x7FF6_0000_0000,
                directory_table_base: 0x1AD000,
            });
            state.processes.insert(
                4,
                ProcessDetails {
                    image_base: 0xFFFF_F800_0000_0000,
                    directory_table_base: 0x1000,
                },
            );
        });

        let mut data = test_vcpu();

        let (base, _) = run_hypercall(&mut data, HC_QUERY_CURRENT_PROCESS_BASE, 0, 0);
        assert_eq!(base, 0x7FF6_0000_0000);

        let (base, _) = run_hypercall(&mut data, HC_QUERY_PROCESS_BASE, 4, 0);
        assert_eq!(base, 0xFFFF_F800_0000_0000);

        let (dirbase, _) = run_hypercall(&mut data, HC_QUERY_PROCESS_DIRBASE, 4, 0);
        assert_eq!(dirbase, 0x1000);

        // Unknown pid reports the null sentinel.
        let (missing, _) = run_hypercall(&mut data, HC_QUERY_PROCESS_BASE, 5, 0);
        assert_eq!(missing, 0);
    }

    #[test]
    fn telemetry_hypercalls_expose_the_counters() {
        let _guard = lock_global_state();
        crate::platform::reset();

        let mut data = test_vcpu();
        data.telemetry.record_npf(0xE000_0000, 4);
        data.telemetry.record_exit(0x7C);
        data.telemetry.record_unhandled(0x7FFF);

        let (count, _) = run_hypercall(&mut data, HC_TELEMETRY_NPF_COUNT, 0, 0);
        assert_eq!(count, 1);

        let (gpa, _) = run_hypercall(&mut data, HC_TELEMETRY_NPF_ENTRY, 0, 0);
        assert_eq!(gpa, 0xE000_0000);

        let (exits, _) = run_hypercall(&mut data, HC_TELEMETRY_EXIT_COUNT, 0x7C, 0);
        assert_eq!(exits, 1);

        let (last, _) = run_hypercall(&mut data, HC_TELEMETRY_LAST_UNHANDLED, 0, 0);
        assert_eq!(last, 0x7FFF);

        let (cleared, _) = run_hypercall(&mut data, HC_TELEMETRY_CLEAR, 0, 0);
        assert_eq!(cleared, 1);
        assert_eq!(data.telemetry.npf_index, 0);
    }

    #[test]
    fn stealth_and_cr3_cloak_toggle() {
        let _guard = lock_global_state();
        crate::platform::reset();

        let mut data = test_vcpu();

        let (result, _) = run_hypercall(&mut data, HC_STEALTH_ENABLE, 0, 0);
        assert_eq!(result, 1);
        assert!(stealth::is_enabled());

        let (result, _) = run_hypercall(&mut data, HC_STEALTH_DISABLE, 0, 0);
        assert_eq!(result, 1);
        assert!(!stealth::is_enabled());

        run_hypercall(&mut data, HC_CR3_CLOAK_ENABLE, 0, 0);
        assert!(hooks::is_cr3_cloak_enabled());
        run_hypercall(&mut data, HC_CR3_CLOAK_DISABLE, 0, 0);
        assert!(!hooks::is_cr3_cloak_enabled());
    }

    #[test]
    fn trigger_arming_reads_the_page_list_from_the_guest() {
        let _guard = lock_global_state();
        crate::platform::reset();
        hooks::disable_cr3_cloak();

        let mut data = test_vcpu();
        build_guest_tables(&mut data);

        // The page list lives in guest memory at the mapped address.
        let pages: [u64; 4] = [0x1000, 0x20_1000, 0x40_1000, 0x60_1000];
        for (i, page) in pages.iter().enumerate() {
            assert!(guest_mem::write_physical(
                BACKING_PAGE + i as u64 * 8,
                &page.to_le_bytes()
            ));
        }

        let (result, _) = run_hypercall(&mut data, HC_ARM_TRIGGERS, MAPPED_GVA, 0);
        assert_eq!(result, 1);
        assert!(data.npt.triggers.iter().all(|slot| slot.armed));
        assert!(data.npt.mailbox.active);

        let (result, _) = run_hypercall(&mut data, HC_REARM_TRIGGERS, 0, 0);
        assert_eq!(result, 1);
    }
}
