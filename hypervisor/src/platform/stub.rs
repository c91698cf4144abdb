//! Inert backend for builds on hosts without the NT environment.
//!
//! Lets the workspace compile (and the userland client link) anywhere. None of
//! these functions are expected to be reached outside a kernel build.

use super::{Context, CpuidResult, DescriptorTablePointer, PhysicalMemoryRanges};
use crate::process::ProcessDetails;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;
use core::ptr::NonNull;
use lazy_static::lazy_static;

const PAGE_ALIGN: usize = 0x1000;

lazy_static! {
    static ref ALLOCATION_SIZES: spin::Mutex<BTreeMap<usize, usize>> =
        spin::Mutex::new(BTreeMap::new());
}

pub fn alloc_contiguous(bytes: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(bytes.max(1), PAGE_ALIGN).ok()?;
    let memory = unsafe { alloc_zeroed(layout) };

    let ptr = NonNull::new(memory)?;
    ALLOCATION_SIZES.lock().insert(ptr.as_ptr() as usize, bytes.max(1));
    Some(ptr)
}

pub fn free_contiguous(ptr: *mut u8) {
    let Some(bytes) = ALLOCATION_SIZES.lock().remove(&(ptr as usize)) else {
        return;
    };

    // Round-tripped through `alloc_contiguous`, so the layout is valid.
    let layout = unsafe { Layout::from_size_align_unchecked(bytes, PAGE_ALIGN) };
    unsafe { dealloc(ptr, layout) };
}

pub fn virt_to_phys(va: *const ()) -> u64 {
    va as u64
}

pub fn read_physical(_pa: u64, _buffer: &mut [u8]) -> bool {
    false
}

pub fn write_physical(_pa: u64, _buffer: &[u8]) -> bool {
    false
}

pub fn physical_memory_ranges() -> PhysicalMemoryRanges {
    PhysicalMemoryRanges::default()
}

pub fn processor_count() -> u32 {
    1
}

pub fn current_processor_index() -> u32 {
    0
}

pub fn capture_context(_context: &mut Context) {}

pub fn cpuid(_leaf: u32, _subleaf: u32) -> CpuidResult {
    CpuidResult::default()
}

pub fn rdmsr(_msr: u32) -> u64 {
    0
}

pub fn wrmsr(_msr: u32, _value: u64) {}

pub fn rdtsc() -> u64 {
    0
}

pub fn rdtscp() -> (u64, u32) {
    (0, 0)
}

pub fn xsetbv(_xcr: u32, _value: u64) {}

pub fn vmload(_vmcb_pa: u64) {}

pub fn vmsave(_vmcb_pa: u64) {}

pub fn sgdt() -> DescriptorTablePointer {
    DescriptorTablePointer::default()
}

pub fn sidt() -> DescriptorTablePointer {
    DescriptorTablePointer::default()
}

pub fn segment_limit(_selector: u16) -> u32 {
    0
}

pub fn read_cr0() -> u64 {
    0
}

pub fn read_cr2() -> u64 {
    0
}

pub fn read_cr3() -> u64 {
    0
}

pub fn read_cr4() -> u64 {
    0
}

pub fn current_process() -> Option<ProcessDetails> {
    None
}

pub fn process_by_pid(_pid: u64) -> Option<ProcessDetails> {
    None
}
