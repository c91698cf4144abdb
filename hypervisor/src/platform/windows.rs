//! Kernel-mode backend on top of the NT exports the driver links against.

#![allow(bad_style)]

use super::{Context, CpuidResult, DescriptorTablePointer, PhysicalMemoryRange, PhysicalMemoryRanges};
use crate::process::ProcessDetails;
use core::arch::asm;
use core::ptr::NonNull;

type NTSTATUS = i32;
type PVOID = *mut core::ffi::c_void;
type PHYSICAL_ADDRESS = i64;
type PEPROCESS = PVOID;

const MM_CACHED: u32 = 1;
const MM_NON_CACHED: u32 = 0;
const MM_COPY_MEMORY_PHYSICAL: u32 = 0x1;
const ALL_PROCESSOR_GROUPS: u16 = 0xFFFF;

/// Offset of `DirectoryTableBase` in `KPROCESS`. Stable across the x64
/// kernels this driver targets.
const KPROCESS_DIRBASE_OFFSET: usize = 0x28;

#[repr(C)]
struct PHYSICAL_MEMORY_RANGE {
    BaseAddress: PHYSICAL_ADDRESS,
    NumberOfBytes: PHYSICAL_ADDRESS,
}

extern "system" {
    fn MmAllocateContiguousMemorySpecifyCache(
        NumberOfBytes: usize,
        LowestAcceptableAddress: PHYSICAL_ADDRESS,
        HighestAcceptableAddress: PHYSICAL_ADDRESS,
        BoundaryAddressMultiple: PHYSICAL_ADDRESS,
        CacheType: u32,
    ) -> PVOID;

    fn MmFreeContiguousMemory(BaseAddress: PVOID);

    fn MmGetPhysicalAddress(BaseAddress: PVOID) -> PHYSICAL_ADDRESS;

    fn MmGetPhysicalMemoryRanges() -> *mut PHYSICAL_MEMORY_RANGE;

    fn ExFreePool(P: PVOID);

    fn MmCopyMemory(
        TargetAddress: PVOID,
        SourceAddress: u64,
        NumberOfBytes: usize,
        Flags: u32,
        NumberOfBytesTransferred: *mut usize,
    ) -> NTSTATUS;

    fn MmMapIoSpace(PhysicalAddress: PHYSICAL_ADDRESS, NumberOfBytes: usize, CacheType: u32) -> PVOID;

    fn MmUnmapIoSpace(BaseAddress: PVOID, NumberOfBytes: usize);

    fn KeQueryActiveProcessorCountEx(GroupNumber: u16) -> u32;

    fn KeGetCurrentProcessorNumberEx(ProcNumber: PVOID) -> u32;

    fn RtlCaptureContext(ContextRecord: *mut Context);

    fn PsGetCurrentProcess() -> PEPROCESS;

    fn PsLookupProcessByProcessId(ProcessId: usize, Process: *mut PEPROCESS) -> NTSTATUS;

    fn PsGetProcessSectionBaseAddress(Process: PEPROCESS) -> PVOID;

    fn ObfDereferenceObject(Object: PVOID);
}

pub fn alloc_contiguous(bytes: usize) -> Option<NonNull<u8>> {
    let memory =
        unsafe { MmAllocateContiguousMemorySpecifyCache(bytes, 0, -1, 0, MM_CACHED) } as *mut u8;
    if memory.is_null() {
        return None;
    }

    unsafe { core::ptr::write_bytes(memory, 0, bytes) };
    NonNull::new(memory)
}

pub fn free_contiguous(ptr: *mut u8) {
    unsafe { MmFreeContiguousMemory(ptr as _) };
}

pub fn virt_to_phys(va: *const ()) -> u64 {
    unsafe { MmGetPhysicalAddress(va as _) as u64 }
}

pub fn read_physical(pa: u64, buffer: &mut [u8]) -> bool {
    let mut transferred = 0usize;
    let status = unsafe {
        MmCopyMemory(
            buffer.as_mut_ptr() as _,
            pa,
            buffer.len(),
            MM_COPY_MEMORY_PHYSICAL,
            &mut transferred,
        )
    };

    status >= 0 && transferred == buffer.len()
}

pub fn write_physical(pa: u64, buffer: &[u8]) -> bool {
    // Writes go through an uncached mapping so they reach memory even when the
    // target page is MMIO.
    let mapped = unsafe { MmMapIoSpace(pa as _, buffer.len(), MM_NON_CACHED) };
    if mapped.is_null() {
        log::warn!("MmMapIoSpace failed for pa {:x}", pa);
        return false;
    }

    unsafe {
        core::ptr::copy_nonoverlapping(buffer.as_ptr(), mapped as *mut u8, buffer.len());
        MmUnmapIoSpace(mapped, buffer.len());
    }

    true
}

pub fn physical_memory_ranges() -> PhysicalMemoryRanges {
    let mut ranges = PhysicalMemoryRanges::default();

    let memory_range = unsafe { MmGetPhysicalMemoryRanges() };
    if memory_range.is_null() {
        log::error!("MmGetPhysicalMemoryRanges() returned null");
        return ranges;
    }

    let mut index = 0;
    loop {
        let current = unsafe { &*memory_range.add(index) };
        if current.BaseAddress == 0 && current.NumberOfBytes == 0 {
            break;
        }

        ranges.push(PhysicalMemoryRange {
            base_address: current.BaseAddress as u64,
            number_of_bytes: current.NumberOfBytes as u64,
        });
        index += 1;

        if ranges.len() == ranges.capacity() {
            break;
        }
    }

    unsafe { ExFreePool(memory_range as _) };
    ranges
}

pub fn processor_count() -> u32 {
    unsafe { KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS) }
}

pub fn current_processor_index() -> u32 {
    unsafe { KeGetCurrentProcessorNumberEx(core::ptr::null_mut()) }
}

/// Stores the caller's register state into `context`.
///
/// The captured RIP points behind the capture call, so a later `vmrun` that
/// resumes at it re-executes the caller's code with `context` still in place.
pub fn capture_context(context: &mut Context) {
    unsafe { RtlCaptureContext(context as *mut _) };
}

pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };

    CpuidResult {
        eax: result.eax,
        ebx: result.ebx,
        ecx: result.ecx,
        edx: result.edx,
    }
}

pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

pub fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) };
}

pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

pub fn rdtscp() -> (u64, u32) {
    let (low, high, aux): (u32, u32, u32);
    unsafe {
        asm!("rdtscp", out("eax") low, out("edx") high, out("ecx") aux, options(nomem, nostack));
    }

    ((high as u64) << 32 | low as u64, aux)
}

pub fn xsetbv(xcr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    unsafe {
        asm!("xsetbv", in("ecx") xcr, in("eax") low, in("edx") high, options(nomem, nostack));
    }
}

pub fn vmload(vmcb_pa: u64) {
    unsafe { asm!("vmload rax", in("rax") vmcb_pa, options(nostack)) };
}

pub fn vmsave(vmcb_pa: u64) {
    unsafe { asm!("vmsave rax", in("rax") vmcb_pa, options(nostack)) };
}

pub fn sgdt() -> DescriptorTablePointer {
    let gdt = x86_64::instructions::tables::sgdt();

    DescriptorTablePointer {
        base: gdt.base.as_u64(),
        limit: gdt.limit,
    }
}

pub fn sidt() -> DescriptorTablePointer {
    let idt = x86_64::instructions::tables::sidt();

    DescriptorTablePointer {
        base: idt.base.as_u64(),
        limit: idt.limit,
    }
}

// See: https://www.felixcloutier.com/x86/lsl
pub fn segment_limit(selector: u16) -> u32 {
    let limit: u32;
    unsafe {
        asm!("lsl {0:e}, {1:x}", out(reg) limit, in(reg) selector, options(nostack, nomem));
    }
    limit
}

pub fn read_cr0() -> u64 {
    x86_64::registers::control::Cr0::read_raw()
}

pub fn read_cr2() -> u64 {
    unsafe { x86::controlregs::cr2() as u64 }
}

pub fn read_cr3() -> u64 {
    unsafe { x86::controlregs::cr3() }
}

pub fn read_cr4() -> u64 {
    x86_64::registers::control::Cr4::read_raw()
}

pub fn current_process() -> Option<ProcessDetails> {
    let process = unsafe { PsGetCurrentProcess() };
    if process.is_null() {
        return None;
    }

    Some(details_for(process))
}

pub fn process_by_pid(pid: u64) -> Option<ProcessDetails> {
    let mut process: PEPROCESS = core::ptr::null_mut();
    let status = unsafe { PsLookupProcessByProcessId(pid as usize, &mut process) };
    if status < 0 || process.is_null() {
        return None;
    }

    let details = details_for(process);
    unsafe { ObfDereferenceObject(process) };

    Some(details)
}

fn details_for(process: PEPROCESS) -> ProcessDetails {
    let image_base = unsafe { PsGetProcessSectionBaseAddress(process) } as u64;
    let directory_table_base =
        unsafe { *((process as *const u8).add(KPROCESS_DIRBASE_OFFSET) as *const u64) };

    ProcessDetails {
        image_base,
        directory_table_base,
    }
}
