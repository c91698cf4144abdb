use crate::error::{Result, VcpuAllocSnafu};
use crate::hooks;
use crate::npt::NptState;
use crate::platform::{self, Context};
use crate::svm::data::msr_bitmap::{IoPermissionMap, MsrBitmap};
use crate::svm::msr::SVM_MSR_VM_HSAVE_PA;
use crate::svm::vmcb::{Vmcb, VmcbConfig};
use crate::svm::vmlaunch::LAUNCH_SENTINEL;
use crate::telemetry::Telemetry;
use crate::utils::memory::{physical_address, AllocatedMemory};
use snafu::OptionExt;

pub const KERNEL_STACK_SIZE: usize = 0x6000;
pub const STACK_CONTENTS_SIZE: usize = KERNEL_STACK_SIZE - core::mem::size_of::<u64>() * 5;

/// The host stack the trampoline switches to, with the pinned record at its
/// top.
///
/// The trampoline's contract is purely offset-based: on entry to the vmexit
/// handler the stack pointer sits on `guest_vmcb_pa` and the general-purpose
/// register snapshot lives immediately above, inside `stack_contents`.
#[repr(C, align(4096))]
pub struct HostStackLayout {
    pub stack_contents: [u8; STACK_CONTENTS_SIZE],

    /// Host RSP.
    pub guest_vmcb_pa: u64,
    pub host_vmcb_pa: u64,
    pub self_data: *mut VcpuData,
    pub processor_index: u64,

    /// Sentinel slot, preset to `u64::MAX` and checked on every exit.
    pub reserved_1: u64,
}
const_assert_eq!(core::mem::size_of::<HostStackLayout>(), KERNEL_STACK_SIZE);

/// The per-processor block: host stack, both VMCBs, the host state-save page,
/// the permission maps, nested paging and telemetry.
///
/// Lives in one contiguous, page-aligned allocation. The physical addresses
/// of the VMCBs and the host save area are cached in the stack layout at
/// launch time and never change afterwards.
#[repr(C, align(4096))]
pub struct VcpuData {
    pub host_stack_layout: HostStackLayout,
    pub guest_vmcb: Vmcb,
    pub host_vmcb: Vmcb,
    pub host_state_area: [u8; 0x1000],

    pub iopm: Option<AllocatedMemory<IoPermissionMap>>,
    pub msrpm: Option<AllocatedMemory<MsrBitmap>>,
    pub msrpm_pa: u64,
    pub iopm_pa: u64,

    pub npt: NptState,
    pub telemetry: Telemetry,

    /// Added to the VMCB TSC offset to absorb the exit latency.
    pub tsc_offset: u64,

    /// Set once the guest observes itself virtualized.
    pub active: bool,
}
const_assert_eq!(core::mem::offset_of!(VcpuData, guest_vmcb), KERNEL_STACK_SIZE);
const_assert_eq!(
    core::mem::offset_of!(VcpuData, host_vmcb),
    KERNEL_STACK_SIZE + 0x1000
);
const_assert_eq!(
    core::mem::offset_of!(VcpuData, host_state_area),
    KERNEL_STACK_SIZE + 0x2000
);

impl VcpuData {
    /// Allocates the block and every per-vcpu resource. The VMCB stays empty
    /// until launch.
    pub fn new(index: u32) -> Result<AllocatedMemory<Self>> {
        log::trace!("Creating vcpu data for processor {}", index);

        let mut data: AllocatedMemory<Self> =
            AllocatedMemory::alloc_contiguous(core::mem::size_of::<Self>())
                .context(VcpuAllocSnafu)?;

        data.host_stack_layout.processor_index = index as u64;
        data.host_stack_layout.reserved_1 = u64::MAX;

        let mut msrpm = MsrBitmap::new()?;
        msrpm.request_default_intercepts();
        data.msrpm_pa = msrpm.pa();
        data.msrpm = Some(msrpm);

        let iopm = IoPermissionMap::new()?;
        data.iopm_pa = iopm.pa();
        data.iopm = Some(iopm);

        data.npt.initialize()?;

        // Make sure guest reads of the syscall MSRs see real values even
        // before a hook is installed.
        hooks::seed_syscall_shadow();

        Ok(data)
    }

    /// Materializes the guest VMCB from the captured context and wires up the
    /// stack layout, then snapshots the remaining state with `vmsave`.
    ///
    /// Last step of the preparation is planting the sentinel: the relaunch
    /// check reads the snapshot from memory, while `vmrun` loads RAX from the
    /// VMCB, so both copies have to carry it.
    pub fn prepare_for_virtualization(&mut self, context: &mut Context) {
        let guest_vmcb_pa = physical_address(&self.guest_vmcb as *const _ as _);
        let host_vmcb_pa = physical_address(&self.host_vmcb as *const _ as _);
        let host_state_area_pa = physical_address(self.host_state_area.as_ptr() as _);

        log::trace!("guest_vmcb_pa: {:#x}", guest_vmcb_pa);
        log::trace!("host_vmcb_pa: {:#x}", host_vmcb_pa);
        log::trace!("host_state_area_pa: {:#x}", host_state_area_pa);
        log::trace!("nested pml4 pa: {:#x}", self.npt.pml4_pa);

        let config = VmcbConfig {
            msrpm_pa: self.msrpm_pa,
            iopm_pa: self.iopm_pa,
            nested_pml4_pa: self.npt.pml4_pa,
            tsc_offset: self.tsc_offset,
        };
        self.guest_vmcb.build(context, &config);
        self.npt.update_shadow_cr3(self.guest_vmcb.save_area.cr3);

        self.host_stack_layout.guest_vmcb_pa = guest_vmcb_pa;
        self.host_stack_layout.host_vmcb_pa = host_vmcb_pa;
        self.host_stack_layout.self_data = self as *mut _;

        // Capture the segment descriptors and the other state `vmrun` does
        // not load by itself.
        platform::vmsave(guest_vmcb_pa);

        // `vmrun` spills the host state into this page.
        platform::wrmsr(SVM_MSR_VM_HSAVE_PA, host_state_area_pa);
        platform::vmsave(host_vmcb_pa);

        context.rax = LAUNCH_SENTINEL;
        self.guest_vmcb.save_area.rax = LAUNCH_SENTINEL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svm::vmcb::control_area::{InterceptMisc1, InterceptMisc2, NESTED_CTL_NP_ENABLE};
    use crate::utils::testing::{lock_global_state, test_vcpu};

    #[test]
    fn layout_is_pinned() {
        // The trampoline indexes these fields from the stack pointer.
        let base = core::mem::offset_of!(HostStackLayout, guest_vmcb_pa);
        assert_eq!(base, STACK_CONTENTS_SIZE);
        assert_eq!(core::mem::offset_of!(HostStackLayout, host_vmcb_pa), base + 8);
        assert_eq!(core::mem::offset_of!(HostStackLayout, self_data), base + 16);
        assert_eq!(
            core::mem::offset_of!(HostStackLayout, processor_index),
            base + 24
        );
        assert_eq!(core::mem::offset_of!(HostStackLayout, reserved_1), base + 32);
    }

    #[test]
    fn new_initializes_the_block() {
        let _guard = lock_global_state();
        let data = test_vcpu();

        assert_eq!(data.host_stack_layout.reserved_1, u64::MAX);
        assert_eq!(data.host_stack_layout.processor_index, 0);
        assert_ne!(data.msrpm_pa, 0);
        assert_ne!(data.iopm_pa, 0);
        assert_ne!(data.npt.pml4_pa, 0);
        assert!(!data.active);
    }

    #[test]
    fn prepare_builds_the_vmcb_and_plants_the_sentinel() {
        let _guard = lock_global_state();
        let mut data = test_vcpu();
        data.tsc_offset = 0x1000;

        let mut context = Context::zeroed();
        platform::capture_context(&mut context);
        context.rip = 0xFFFF_F800_1234_5678;
        context.rsp = 0xFFFF_E000_0000_8000;

        data.prepare_for_virtualization(&mut context);

        let control = &data.guest_vmcb.control_area;
        assert_eq!(control.guest_asid, 1);
        assert!(control
            .intercept_misc1
            .contains(InterceptMisc1::INTERCEPT_CPUID | InterceptMisc1::INTERCEPT_MSR_PROT));
        assert!(control
            .intercept_misc2
            .contains(InterceptMisc2::INTERCEPT_VMRUN | InterceptMisc2::INTERCEPT_VMMCALL));
        assert_eq!(control.np_enable, NESTED_CTL_NP_ENABLE);
        assert_eq!(control.ncr3, data.npt.pml4_pa);
        assert_eq!(control.msrpm_base_pa, data.msrpm_pa);
        assert_eq!(control.tsc_offset, 0x1000);

        let save = &data.guest_vmcb.save_area;
        assert_eq!(save.rip, 0xFFFF_F800_1234_5678);
        assert_eq!(save.rsp, 0xFFFF_E000_0000_8000);

        // Both sentinel copies are in place.
        assert_eq!(context.rax, LAUNCH_SENTINEL);
        assert_eq!(save.rax, LAUNCH_SENTINEL);

        // Guest and host state were spilled with vmsave, in that order, and
        // the host save area was registered through the MSR.
        let (stack_guest_pa, stack_host_pa) = (
            data.host_stack_layout.guest_vmcb_pa,
            data.host_stack_layout.host_vmcb_pa,
        );
        let hsave_pa = physical_address(data.host_state_area.as_ptr() as _);
        platform::with_state(|state| {
            assert_eq!(state.vmsave_log, vec![stack_guest_pa, stack_host_pa]);
            assert_eq!(
                state.msrs.get(&SVM_MSR_VM_HSAVE_PA).copied().unwrap_or(0),
                hsave_pa
            );
        });
    }
}
