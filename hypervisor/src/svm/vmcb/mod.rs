//! See `Appendix B - Layout of VMCB` in the AMD64 Architecture Programmer's
//! Manual Volume 2: System Programming.

use crate::platform::Context;
use crate::svm::vmcb::control_area::{
    ControlArea, InterceptMisc1, InterceptMisc2, NESTED_CTL_NP_ENABLE,
};
use crate::svm::vmcb::save_area::SaveArea;

pub mod control_area;
pub mod save_area;

const VMCB_RESERVED_SIZE: usize =
    0x1000 - core::mem::size_of::<ControlArea>() - core::mem::size_of::<SaveArea>();

/// The control structure `vmrun` consumes and `#VMEXIT` fills.
///
/// The first area holds the intercept configuration and exit information, the
/// second one the saved guest state.
#[repr(C, align(4096))]
pub struct Vmcb {
    pub control_area: ControlArea,
    pub save_area: SaveArea,
    pub reserved: [u8; VMCB_RESERVED_SIZE],
}
const_assert_eq!(core::mem::size_of::<Vmcb>(), 0x1000);

pub struct VmcbConfig {
    pub msrpm_pa: u64,
    pub iopm_pa: u64,
    pub nested_pml4_pa: u64,
    pub tsc_offset: u64,
}

impl Vmcb {
    /// Materializes a guest VMCB from the captured host context.
    pub fn build(&mut self, context: &Context, config: &VmcbConfig) {
        // Use the same ASID on every processor; they all run the same single
        // guest. Zero is reserved, 1 is the lowest one every implementation
        // supports (`CPUID Fn8000_000A_EBX`).
        self.control_area.guest_asid = 1;
        self.control_area.vmcb_clean = 0;

        // The mandatory intercepts. VMRUN interception is an architectural
        // requirement; CPUID and VMMCALL carry the stealth masking and the
        // hypercall interface. MSR_PROT activates the msr permission map.
        //
        self.control_area.intercept_misc1 =
            InterceptMisc1::INTERCEPT_CPUID | InterceptMisc1::INTERCEPT_MSR_PROT;
        self.control_area.intercept_misc2 =
            InterceptMisc2::INTERCEPT_VMRUN | InterceptMisc2::INTERCEPT_VMMCALL;

        // Catches every guest timing read, at the price of kilohertz exit
        // rates. See the feature description in Cargo.toml.
        #[cfg(feature = "rdtsc-intercept")]
        {
            self.control_area
                .intercept_misc1
                .insert(InterceptMisc1::INTERCEPT_RDTSC);
            self.control_area
                .intercept_misc2
                .insert(InterceptMisc2::INTERCEPT_RDTSCP);
        }

        self.control_area.msrpm_base_pa = config.msrpm_pa;
        self.control_area.iopm_base_pa = config.iopm_pa;

        // Nested paging is not optional here: without it the guest cannot be
        // handed the identity mapping and `vmrun` fails.
        self.control_area.np_enable = NESTED_CTL_NP_ENABLE;
        self.control_area.ncr3 = config.nested_pml4_pa;

        self.control_area.tsc_offset = config.tsc_offset;

        self.save_area.build(context);
    }
}
