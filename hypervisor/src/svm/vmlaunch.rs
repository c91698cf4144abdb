//! Contract of the `launch_vm` trampoline.
//!
//! The trampoline itself is assembly shipped with the host driver. Its
//! behavior, relied upon here:
//!
//! 1. It receives a pointer to the `guest_vmcb_pa` slot of
//!    [`HostStackLayout`] and switches RSP to it.
//! 2. It enters the infinite loop: `vmload` guest state, `vmrun`, and on
//!    `#VMEXIT` it pushes the general-purpose register snapshot (see
//!    [`GuestRegisters`] for the order), loads the vcpu pointer from the
//!    known stack offset and calls `handle_vmexit(vcpu, &snapshot)`.
//! 3. When the handler returns zero it restores the snapshot and executes
//!    `vmrun` again. A non-zero return tears the loop down.
//! 4. It never returns to its caller; a failing `vmrun` is fatal for the
//!    launch path.
//!
//! [`HostStackLayout`]: crate::svm::data::vcpu_data::HostStackLayout
//! [`GuestRegisters`]: crate::svm::data::guest_regs::GuestRegisters

/// Marker for the relaunched control flow: the guest re-executes the capture
/// point with this value in RAX and knows it is virtualized.
pub const LAUNCH_SENTINEL: u64 = u64::MAX;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "windows", not(test)))] {
        extern "C" {
            /// Enters the vmrun loop. Never returns under correct operation.
            pub fn launch_vm(host_rsp: *mut u64);
        }
    } else {
        /// Placeholder so non-kernel builds link; the real trampoline only
        /// exists in the driver image.
        ///
        /// # Safety
        /// Must never be called.
        pub unsafe fn launch_vm(_host_rsp: *mut u64) {
            unreachable!("launch_vm is provided by the host driver");
        }
    }
}
