//! Host environment access.
//!
//! Everything the hypervisor needs from the outside world goes through this
//! module: kernel memory services, privileged instructions, and process
//! lookups. Three backends exist:
//!
//! - `windows`: the kernel-mode implementation on top of NT imports.
//! - `stub`: inert defaults so the workspace builds on other hosts.
//! - `mock`: a thread-local fake driven by the unit tests.

use tinyvec::ArrayVec;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        pub mod mock;
        pub use mock::*;
    } else if #[cfg(target_os = "windows")] {
        mod windows;
        pub use windows::*;
    } else {
        mod stub;
        pub use stub::*;
    }
}

/// See `MmGetPhysicalMemoryRanges`. The limit is generous; real systems report
/// a handful of runs.
pub const MAX_RANGE_COUNT: usize = 32;

pub type PhysicalMemoryRanges = ArrayVec<[PhysicalMemoryRange; MAX_RANGE_COUNT]>;

/// A single run of physical memory as reported by the host.
///
/// There are multiple runs because hardware mappings leave holes in the
/// physical address space.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysicalMemoryRange {
    pub base_address: u64,
    pub number_of_bytes: u64,
}

impl PhysicalMemoryRange {
    pub fn end_address(&self) -> u64 {
        self.base_address + self.number_of_bytes
    }

    pub fn page_count(&self) -> u64 {
        (self.number_of_bytes + 0xFFF) >> 12
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorTablePointer {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// The register context captured by the platform's capture primitive.
///
/// Layout matches the x64 `CONTEXT` record expected by `RtlCaptureContext`.
/// The capture call stores the caller's registers directly into this block,
/// which is what makes the relaunch check work: after `vmrun` resumes the
/// guest at the captured RIP, the code path that inspects `rax` reads it back
/// out of this very structure.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct Context {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,

    pub context_flags: u32,
    pub mx_csr: u32,

    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub e_flags: u32,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,

    pub flt_save: [u8; 512],
    pub vector_register: [u8; 416],
    pub vector_control: u64,

    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}
const_assert_eq!(core::mem::size_of::<Context>(), 0x4D0);

impl Context {
    pub fn zeroed() -> Self {
        // All-zero is a valid register snapshot.
        unsafe { core::mem::zeroed() }
    }
}
