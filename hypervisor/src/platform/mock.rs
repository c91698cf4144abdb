//! Test backend: a thread-local fake of the host environment.
//!
//! Each test thread owns an independent physical address space, MSR file, and
//! TSC, so the suites can run in parallel. Tests seed the state through
//! [`with_state`] and then drive the regular hypervisor entry points.

use super::{Context, CpuidResult, DescriptorTablePointer, PhysicalMemoryRange, PhysicalMemoryRanges};
use crate::process::ProcessDetails;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ptr::NonNull;

const PAGE_SIZE: usize = 0x1000;
const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

pub struct MockState {
    pub memory: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
    pub msrs: BTreeMap<u32, u64>,
    pub cpuid: BTreeMap<(u32, u32), CpuidResult>,
    pub tsc: u64,
    pub tsc_aux: u32,
    pub ranges: Vec<PhysicalMemoryRange>,
    pub processor_count: u32,
    pub current_processor: u32,
    pub current_process: Option<ProcessDetails>,
    pub processes: BTreeMap<u64, ProcessDetails>,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub vmload_log: Vec<u64>,
    pub vmsave_log: Vec<u64>,
    pub xsetbv_log: Vec<(u32, u64)>,
    allocations: BTreeMap<usize, Layout>,
}

impl Default for MockState {
    fn default() -> Self {
        let mut msrs = BTreeMap::new();
        // EFER with SCE, LME, LMA, NXE and SVME set.
        msrs.insert(x86::msr::IA32_EFER, 0x1D01);
        msrs.insert(x86::msr::IA32_PAT, 0x0007_0406_0007_0406);

        let mut cpuid = BTreeMap::new();
        cpuid.insert(
            (1, 0),
            CpuidResult {
                eax: 0x00A2_0F10,
                ebx: 0x0010_0800,
                // Hypervisor-present bit set so the masking is observable.
                ecx: 0x7EF8_320B | 1 << 31,
                edx: 0x178B_FBFF,
            },
        );
        cpuid.insert(
            (0x8000_0001, 0),
            CpuidResult {
                eax: 0x00A2_0F10,
                ebx: 0,
                ecx: 0x0044_44F8 | 1 << 2,
                edx: 0x2FD3_FBFF | 1 << 2,
            },
        );

        Self {
            memory: BTreeMap::new(),
            msrs,
            cpuid,
            tsc: 0,
            tsc_aux: 0,
            ranges: Vec::new(),
            processor_count: 1,
            current_processor: 0,
            current_process: None,
            processes: BTreeMap::new(),
            cr0: 0x8005_0033,
            cr2: 0,
            cr3: 0x1AD000,
            cr4: 0x350EF8,
            vmload_log: Vec::new(),
            vmsave_log: Vec::new(),
            xsetbv_log: Vec::new(),
            allocations: BTreeMap::new(),
        }
    }
}

thread_local! {
    static STATE: RefCell<MockState> = RefCell::new(MockState::default());
}

pub fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

pub fn reset() {
    with_state(|state| *state = MockState::default());
}

pub fn alloc_contiguous(bytes: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(bytes.max(1), PAGE_SIZE).ok()?;
    let memory = unsafe { alloc_zeroed(layout) };

    let ptr = NonNull::new(memory)?;
    with_state(|state| state.allocations.insert(ptr.as_ptr() as usize, layout));
    Some(ptr)
}

pub fn free_contiguous(ptr: *mut u8) {
    let layout = with_state(|state| state.allocations.remove(&(ptr as usize)));
    if let Some(layout) = layout {
        unsafe { dealloc(ptr, layout) };
    }
}

pub fn virt_to_phys(va: *const ()) -> u64 {
    // The fake physical space is the host address space.
    va as u64
}

pub fn read_physical(pa: u64, buffer: &mut [u8]) -> bool {
    with_state(|state| {
        let mut address = pa;
        for byte in buffer.iter_mut() {
            let page = address & PAGE_MASK;
            let Some(backing) = state.memory.get(&page) else {
                return false;
            };
            *byte = backing[(address & !PAGE_MASK) as usize];
            address += 1;
        }
        true
    })
}

pub fn write_physical(pa: u64, buffer: &[u8]) -> bool {
    with_state(|state| {
        let mut address = pa;
        for byte in buffer.iter() {
            let page = address & PAGE_MASK;
            let backing = state
                .memory
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            backing[(address & !PAGE_MASK) as usize] = *byte;
            address += 1;
        }
        true
    })
}

pub fn physical_memory_ranges() -> PhysicalMemoryRanges {
    with_state(|state| {
        let mut ranges = PhysicalMemoryRanges::default();
        for range in state.ranges.iter().take(super::MAX_RANGE_COUNT) {
            ranges.push(*range);
        }
        ranges
    })
}

pub fn processor_count() -> u32 {
    with_state(|state| state.processor_count)
}

pub fn current_processor_index() -> u32 {
    with_state(|state| state.current_processor)
}

pub fn capture_context(context: &mut Context) {
    context.seg_cs = 0x10;
    context.seg_ss = 0x18;
    context.e_flags = 0x202;
}

pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    with_state(|state| {
        state
            .cpuid
            .get(&(leaf, subleaf))
            .or_else(|| state.cpuid.get(&(leaf, 0)))
            .copied()
            .unwrap_or_default()
    })
}

pub fn rdmsr(msr: u32) -> u64 {
    with_state(|state| state.msrs.get(&msr).copied().unwrap_or(0))
}

pub fn wrmsr(msr: u32, value: u64) {
    with_state(|state| {
        state.msrs.insert(msr, value);
    });
}

pub fn rdtsc() -> u64 {
    with_state(|state| state.tsc)
}

pub fn rdtscp() -> (u64, u32) {
    with_state(|state| (state.tsc, state.tsc_aux))
}

pub fn xsetbv(xcr: u32, value: u64) {
    with_state(|state| state.xsetbv_log.push((xcr, value)));
}

pub fn vmload(vmcb_pa: u64) {
    with_state(|state| state.vmload_log.push(vmcb_pa));
}

pub fn vmsave(vmcb_pa: u64) {
    with_state(|state| state.vmsave_log.push(vmcb_pa));
}

pub fn sgdt() -> DescriptorTablePointer {
    static FAKE_GDT: [u64; 16] = [0; 16];

    DescriptorTablePointer {
        base: FAKE_GDT.as_ptr() as u64,
        limit: (core::mem::size_of_val(&FAKE_GDT) - 1) as u16,
    }
}

pub fn sidt() -> DescriptorTablePointer {
    DescriptorTablePointer {
        base: 0xFFFF_F800_0000_0000,
        limit: 0xFFF,
    }
}

pub fn segment_limit(_selector: u16) -> u32 {
    0xF_FFFF
}

pub fn read_cr0() -> u64 {
    with_state(|state| state.cr0)
}

pub fn read_cr2() -> u64 {
    with_state(|state| state.cr2)
}

pub fn read_cr3() -> u64 {
    with_state(|state| state.cr3)
}

pub fn read_cr4() -> u64 {
    with_state(|state| state.cr4)
}

pub fn current_process() -> Option<ProcessDetails> {
    with_state(|state| state.current_process)
}

pub fn process_by_pid(pid: u64) -> Option<ProcessDetails> {
    with_state(|state| state.processes.get(&pid).copied())
}
