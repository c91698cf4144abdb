use bitflags::bitflags;

/// See `Appendix B.1 - Layout of VMCB` for the offsets.
#[repr(C)]
pub struct ControlArea {
    pub intercept_cr_read: u16,   // +0x000
    pub intercept_cr_write: u16,  // +0x002
    pub intercept_dr_read: u16,   // +0x004
    pub intercept_dr_write: u16,  // +0x006
    pub intercept_exception: u32, // +0x008

    pub intercept_misc1: InterceptMisc1,     // +0x00c
    pub intercept_misc2: InterceptMisc2,     // +0x010
    pub reserved1: [u8; 0x03C - 0x014],      // +0x014
    pub pause_filter_threshold: u16,         // +0x03c
    pub pause_filter_count: u16,             // +0x03e
    pub iopm_base_pa: u64,                   // +0x040
    pub msrpm_base_pa: u64,                  // +0x048
    pub tsc_offset: u64,                     // +0x050
    pub guest_asid: u32,                     // +0x058
    pub tlb_control: u32,                    // +0x05c
    pub int_control: u64,                    // +0x060
    pub interrupt_shadow: u64,               // +0x068
    pub exit_code: u64,                      // +0x070
    pub exit_info1: u64,                     // +0x078
    pub exit_info2: u64,                     // +0x080
    pub exit_int_info: u64,                  // +0x088
    pub np_enable: u64,                      // +0x090
    pub avic_apic_bar: u64,                  // +0x098
    pub guest_pa_of_ghcb: u64,               // +0x0a0
    pub event_inj: u64,                      // +0x0a8
    pub ncr3: u64,                           // +0x0b0
    pub lbr_virtualization_enable: u64,      // +0x0b8
    pub vmcb_clean: u64,                     // +0x0c0
    pub nrip: u64,                           // +0x0c8
    pub num_of_bytes_fetched: u8,            // +0x0d0
    pub guest_instruction_bytes: [u8; 15],   // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    pub reserved2: u64,                      // +0x0e8
    pub avic_logical_table_pointer: u64,     // +0x0f0
    pub avic_physical_table_pointer: u64,    // +0x0f8
    pub reserved3: u64,                      // +0x100
    pub vmcb_save_state_pointer: u64,        // +0x108
    pub reserved4: [u8; 0x400 - 0x110],      // +0x110
}
const_assert_eq!(core::mem::size_of::<ControlArea>(), 0x400);

bitflags! {
    /// Intercept vector 3, `Appendix B.1`.
    pub struct InterceptMisc1: u32 {
        const INTERCEPT_INTR = 1 << 0;
        const INTERCEPT_NMI = 1 << 1;
        const INTERCEPT_SMI = 1 << 2;
        const INTERCEPT_INIT = 1 << 3;
        const INTERCEPT_VINTR = 1 << 4;
        const INTERCEPT_RDTSC = 1 << 14;
        const INTERCEPT_RDPMC = 1 << 15;
        const INTERCEPT_CPUID = 1 << 18;
        const INTERCEPT_INVD = 1 << 22;
        const INTERCEPT_PAUSE = 1 << 23;
        const INTERCEPT_HLT = 1 << 24;
        const INTERCEPT_INVLPG = 1 << 25;
        const INTERCEPT_INVLPGA = 1 << 26;
        const INTERCEPT_IOIO_PROT = 1 << 27;
        const INTERCEPT_MSR_PROT = 1 << 28;
        const INTERCEPT_TASK_SWITCHES = 1 << 29;
        const INTERCEPT_FERR_FREEZE = 1 << 30;
        const INTERCEPT_SHUTDOWN = 1 << 31;
    }

    /// Intercept vector 4, `Appendix B.1`.
    pub struct InterceptMisc2: u32 {
        const INTERCEPT_VMRUN = 1 << 0;
        const INTERCEPT_VMMCALL = 1 << 1;
        const INTERCEPT_VMLOAD = 1 << 2;
        const INTERCEPT_VMSAVE = 1 << 3;
        const INTERCEPT_STGI = 1 << 4;
        const INTERCEPT_CLGI = 1 << 5;
        const INTERCEPT_SKINIT = 1 << 6;
        const INTERCEPT_RDTSCP = 1 << 7;
        const INTERCEPT_ICEBP = 1 << 8;
        const INTERCEPT_WBINVD = 1 << 9;
        const INTERCEPT_MONITOR = 1 << 10;
        const INTERCEPT_MWAIT = 1 << 11;
        const INTERCEPT_MWAIT_CONDITIONAL = 1 << 12;
        const INTERCEPT_XSETBV = 1 << 13;
        const INTERCEPT_RDPRU = 1 << 14;
        const INTERCEPT_EFER = 1 << 15;
    }
}

// Exit codes delivered through `exit_code`. Kept as plain constants because
// the field can also hold values this build does not know about.
pub const VMEXIT_SMI: u64 = 0x62;
pub const VMEXIT_VINTR: u64 = 0x64;
pub const VMEXIT_RDTSC: u64 = 0x6E;
pub const VMEXIT_CPUID: u64 = 0x72;
pub const VMEXIT_HLT: u64 = 0x78;
pub const VMEXIT_IOIO: u64 = 0x7B;
pub const VMEXIT_MSR: u64 = 0x7C;
pub const VMEXIT_VMRUN: u64 = 0x80;
pub const VMEXIT_VMMCALL: u64 = 0x81;
pub const VMEXIT_RDTSCP: u64 = 0x87;
pub const VMEXIT_XSETBV: u64 = 0x8D;
pub const VMEXIT_NPF: u64 = 0x400;
pub const VMEXIT_INVALID: u64 = u64::MAX;

/// `np_enable` bit 0.
pub const NESTED_CTL_NP_ENABLE: u64 = 1 << 0;

/// `tlb_control` values, `15.16.2 TLB Flush`.
pub const TLB_CONTROL_DO_NOTHING: u32 = 0;
pub const TLB_CONTROL_FLUSH_ALL: u32 = 1;
pub const TLB_CONTROL_FLUSH_GUEST_ASID: u32 = 3;

/// `int_control` bits, `15.21.4 Virtual Interrupt Control`.
pub const INT_CONTROL_V_IRQ: u64 = 1 << 8;
pub const INT_CONTROL_SMI_PENDING: u64 = 1 << 24;
