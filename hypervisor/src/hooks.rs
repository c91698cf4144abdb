//! Runtime hooks requested through the hypercall interface: the syscall MSR
//! shadow, CR3 cloaking, and the nested-paging shadow hook assist.

use crate::npt::NptState;
use crate::platform;
use crate::svm::paging::page_align_4kb;
use core::sync::atomic::{AtomicBool, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;
use x86::msr::{IA32_FMASK, IA32_LSTAR, IA32_STAR};

/// XOR key for CR3 cloaking. Not a secret; it only has to defeat naive CR3
/// scraping.
pub const CR3_XOR_KEY: u64 = 0xCAFE_BABE_1337;

static CR3_CLOAK_ENABLED: AtomicBool = AtomicBool::new(false);

/// Shadow copies of the fast-syscall MSRs.
///
/// While the hook is active the real LSTAR points at the trampoline and the
/// guest only ever reads and writes these copies, so it keeps observing a
/// consistent, unhooked machine.
#[derive(Debug, Default)]
struct SyscallHookState {
    seeded: bool,
    enabled: bool,
    handler: u64,
    original_lstar: u64,
    original_star: u64,
    original_sfmask: u64,
}

lazy_static! {
    static ref SYSCALL_HOOK: Mutex<SyscallHookState> = Mutex::new(SyscallHookState::default());
}

/// Captures the live syscall MSRs once, so guest reads return real values
/// before any hook is installed.
pub fn seed_syscall_shadow() {
    let mut state = SYSCALL_HOOK.lock();
    if state.seeded {
        return;
    }

    state.original_lstar = platform::rdmsr(IA32_LSTAR);
    state.original_star = platform::rdmsr(IA32_STAR);
    state.original_sfmask = platform::rdmsr(IA32_FMASK);
    state.seeded = true;
}

/// Registers the trampoline the hook will point LSTAR at.
pub fn set_syscall_handler(address: u64) {
    SYSCALL_HOOK.lock().handler = address;
}

/// Swings LSTAR onto the registered trampoline. Returns whether the hook is
/// active afterwards.
pub fn install_syscall_hook() -> bool {
    let mut state = SYSCALL_HOOK.lock();

    if state.enabled {
        return true;
    }

    state.original_lstar = platform::rdmsr(IA32_LSTAR);
    state.original_star = platform::rdmsr(IA32_STAR);
    state.original_sfmask = platform::rdmsr(IA32_FMASK);
    state.seeded = true;

    if state.handler != 0 {
        platform::wrmsr(IA32_LSTAR, state.handler);
        state.enabled = true;
    }

    state.enabled
}

pub fn remove_syscall_hook() {
    let mut state = SYSCALL_HOOK.lock();

    if !state.enabled {
        return;
    }

    platform::wrmsr(IA32_LSTAR, state.original_lstar);
    platform::wrmsr(IA32_STAR, state.original_star);
    platform::wrmsr(IA32_FMASK, state.original_sfmask);

    state.enabled = false;
}

/// Shadowed read of a syscall MSR, or `None` when `msr` is not one of them.
///
/// LSTAR returns the trampoline while the hook is active; the guest-visible
/// "original" values come from the shadow block.
pub fn syscall_msr_read(msr: u32) -> Option<u64> {
    let state = SYSCALL_HOOK.lock();

    match msr {
        IA32_LSTAR if state.enabled => Some(state.handler),
        IA32_LSTAR => Some(state.original_lstar),
        IA32_STAR => Some(state.original_star),
        IA32_FMASK => Some(state.original_sfmask),
        _ => None,
    }
}

/// Shadowed write of a syscall MSR. Returns `false` when `msr` is not one of
/// them and the caller has to handle the write itself.
pub fn syscall_msr_write(msr: u32, value: u64) -> bool {
    let mut state = SYSCALL_HOOK.lock();

    match msr {
        IA32_LSTAR => state.original_lstar = value,
        IA32_STAR => state.original_star = value,
        IA32_FMASK => state.original_sfmask = value,
        _ => return false,
    }

    true
}

pub fn enable_cr3_cloak() {
    CR3_CLOAK_ENABLED.store(true, Ordering::SeqCst);
}

pub fn disable_cr3_cloak() {
    CR3_CLOAK_ENABLED.store(false, Ordering::SeqCst);
}

pub fn is_cr3_cloak_enabled() -> bool {
    CR3_CLOAK_ENABLED.load(Ordering::SeqCst)
}

pub fn encrypt_cr3(cr3: u64) -> u64 {
    if !is_cr3_cloak_enabled() {
        return cr3;
    }

    cr3 ^ CR3_XOR_KEY
}

/// Undoes the cloak on an observed CR3 value. The guest walker verifies the
/// result by the presence checks of its own walk.
pub fn decrypt_cr3(cr3: u64) -> u64 {
    if !is_cr3_cloak_enabled() {
        return cr3;
    }

    cr3 ^ CR3_XOR_KEY
}

/// Completes a registered shadow hook when the guest faults on its page.
pub fn handle_npt_fault(npt: &mut NptState, fault_gpa: u64) -> bool {
    let page = page_align_4kb(fault_gpa);

    if npt.shadow_hook.active && page == npt.shadow_hook.target_gpa_page {
        let new_hpa_page = npt.shadow_hook.new_hpa_page;
        return npt.hook_page(page, new_hpa_page);
    }

    false
}

#[cfg(test)]
pub fn reset_syscall_state_for_tests() {
    *SYSCALL_HOOK.lock() = SyscallHookState::default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::lock_global_state;

    #[test]
    fn cr3_cloak_round_trips() {
        let _guard = lock_global_state();

        disable_cr3_cloak();
        assert_eq!(decrypt_cr3(0x1AD000), 0x1AD000);
        assert_eq!(encrypt_cr3(0x1AD000), 0x1AD000);

        enable_cr3_cloak();
        for cr3 in [0u64, 0x1AD000, u64::MAX, 0x0123_4567_89AB_CDEF] {
            assert_ne!(encrypt_cr3(cr3), cr3);
            assert_eq!(decrypt_cr3(encrypt_cr3(cr3)), cr3);
        }

        disable_cr3_cloak();
    }

    #[test]
    fn syscall_hook_shadows_the_msrs() {
        let _guard = lock_global_state();
        crate::platform::reset();
        reset_syscall_state_for_tests();

        crate::platform::wrmsr(IA32_LSTAR, 0xFFFF_F780_0000_1000);
        crate::platform::wrmsr(IA32_STAR, 0x0023_0010_0000_0000);
        crate::platform::wrmsr(IA32_FMASK, 0x4700);

        seed_syscall_shadow();
        assert_eq!(syscall_msr_read(IA32_LSTAR), Some(0xFFFF_F780_0000_1000));
        assert_eq!(syscall_msr_read(IA32_STAR), Some(0x0023_0010_0000_0000));
        assert_eq!(syscall_msr_read(IA32_FMASK), Some(0x4700));
        assert_eq!(syscall_msr_read(0xC000_0080), None);

        // Without a registered trampoline the install is a no-op.
        assert!(!install_syscall_hook());

        set_syscall_handler(0xFFFF_A000_DEAD_0000);
        assert!(install_syscall_hook());
        assert!(install_syscall_hook());

        // The hardware register points at the trampoline, and reads now
        // return it as well.
        assert_eq!(crate::platform::rdmsr(IA32_LSTAR), 0xFFFF_A000_DEAD_0000);
        assert_eq!(syscall_msr_read(IA32_LSTAR), Some(0xFFFF_A000_DEAD_0000));

        // Guest writes only touch the shadow.
        assert!(syscall_msr_write(IA32_LSTAR, 0x1111));
        assert_eq!(crate::platform::rdmsr(IA32_LSTAR), 0xFFFF_A000_DEAD_0000);

        remove_syscall_hook();
        // The (guest-updated) originals are restored on removal.
        assert_eq!(crate::platform::rdmsr(IA32_LSTAR), 0x1111);
        assert_eq!(crate::platform::rdmsr(IA32_FMASK), 0x4700);
        assert_eq!(syscall_msr_read(IA32_LSTAR), Some(0x1111));

        assert!(!syscall_msr_write(0x1B, 0));
        reset_syscall_state_for_tests();
    }
}
