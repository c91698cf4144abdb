//! Nested page tables.
//!
//! The tables provide an identity GPA→HPA mapping built from 2MB large pages,
//! so the guest (the host itself) keeps seeing the physical memory it always
//! had. On top of the identity map sit the runtime primitives: per-page
//! remapping for shadow hooks, the armed/decoy hardware-trigger slots, and the
//! mailbox used to hand trigger events to the userland client.

use crate::error::{
    DecoyAllocSnafu, MemoryRangesSnafu, NptPdAllocSnafu, NptPdptAllocSnafu, NptPml4AllocSnafu,
    Result,
};
use crate::platform;
use crate::svm::paging::{
    page_align_2mb, page_align_4kb, pd_index, pdpt_index, pml4_index, pt_index, ENTRY_COUNT,
    PAGE_SHIFT, _2MB,
};
use bitfield::bitfield;
use snafu::{ensure, OptionExt};

pub mod registry;

/// 2MB page containing the local APIC MMIO window. Mapped uncached.
pub const APIC_MMIO_BASE: u64 = 0xFEC0_0000;

/// PCI MMIO window mapped uncached at build time.
pub const PCI_MMIO_START: u64 = 0xE000_0000;
pub const PCI_MMIO_END: u64 = 0xF000_0000;

/// Upper bound for MMIO mappings created lazily from the nested-page-fault
/// path when firmware reports devices late.
pub const LATE_MMIO_END: u64 = 0x1_0000_0000;

pub const TRIGGER_APIC: usize = 0;
pub const TRIGGER_ACPI: usize = 1;
pub const TRIGGER_SMM: usize = 2;
pub const TRIGGER_MMIO: usize = 3;
pub const TRIGGER_SLOT_COUNT: usize = 4;

const DECOY_PAGE_COUNT: usize = 2;

bitfield! {
    /// A nested paging entry, any level. See `Figure 5-25` for the layout.
    ///
    /// The user bit is required on every entry: nested table walks are treated
    /// as user-mode accesses by the hardware.
    #[derive(Clone, Copy)]
    pub struct NptEntry(u64);
    pub get_present, set_present: 0, 0;
    pub get_write, set_write: 1, 1;
    pub get_user, set_user: 2, 2;
    pub get_write_through, set_write_through: 3, 3;
    pub get_cache_disable, set_cache_disable: 4, 4;
    pub get_accessed, set_accessed: 5, 5;
    pub get_dirty, set_dirty: 6, 6;
    pub get_large_page, set_large_page: 7, 7;
    pub get_global, set_global: 8, 8;
    pub get_avl, set_avl: 11, 9;
    pub get_page_frame, set_page_frame: 51, 12;
    pub get_no_execute, set_no_execute: 63, 63;
}

#[repr(C, align(4096))]
pub struct NptTable {
    pub entries: [NptEntry; ENTRY_COUNT],
}
const_assert_eq!(core::mem::size_of::<NptTable>(), 0x1000);

/// Level of a terminal translation returned by the software walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLevel {
    /// 1GB page.
    Pdpt = 1,
    /// 2MB page.
    Pd = 2,
    /// 4KB page.
    Pt = 3,
}

/// A hardware-trigger slot.
///
/// `armed` means the entry was stripped of its present bit so the next touch
/// of the page faults. A matching fault promotes the slot to `using_fake`,
/// which points the entry at one of the decoy pages instead.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TriggerSlot {
    pub gpa_page: u64,
    pub original_frame: u64,
    pub armed: bool,
    pub using_fake: bool,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowHookSlot {
    pub target_gpa_page: u64,
    pub new_hpa_page: u64,
    pub active: bool,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MailboxSlot {
    pub gpa_page: u64,
    pub active: bool,
    pub last_message: u64,
}

/// Per-vcpu nested paging state.
///
/// All-zero is the valid initial state; [`Self::initialize`] builds the
/// identity map in place. Table ownership is tracked through the paging
/// hierarchy itself: dropping the state walks it and returns every registered
/// table.
#[repr(C)]
pub struct NptState {
    pml4: *mut NptTable,
    pub pml4_pa: u64,

    decoy_va: [*mut u8; DECOY_PAGE_COUNT],
    decoy_pa: [u64; DECOY_PAGE_COUNT],
    decoy_index: u32,

    /// Last observed guest CR3.
    pub shadow_cr3: u64,

    pub triggers: [TriggerSlot; TRIGGER_SLOT_COUNT],
    pub shadow_hook: ShadowHookSlot,
    pub mailbox: MailboxSlot,

    pub tlb_flush_pending: bool,
}

impl Default for NptState {
    fn default() -> Self {
        // All-zero is the documented initial state.
        unsafe { core::mem::zeroed() }
    }
}

impl NptState {
    /// Builds the identity map: every RAM range the host reports (rounded
    /// outward to 2MB), the legacy first 2MB, the APIC page and the PCI
    /// window (both uncached).
    pub fn initialize(&mut self) -> Result<()> {
        log::info!("Building nested page tables");

        for slot in 0..DECOY_PAGE_COUNT {
            let page = platform::alloc_contiguous(0x1000).context(DecoyAllocSnafu)?;
            self.decoy_va[slot] = page.as_ptr();
            self.decoy_pa[slot] = platform::virt_to_phys(page.as_ptr() as _);
        }

        let (pml4, pml4_pa) = alloc_table().context(NptPml4AllocSnafu)?;
        self.pml4 = pml4;
        self.pml4_pa = pml4_pa;

        let ranges = platform::physical_memory_ranges();
        ensure!(!ranges.is_empty(), MemoryRangesSnafu);

        for range in ranges.iter() {
            // Round outward so partially covered 2MB frames stay reachable.
            let start = page_align_2mb(range.base_address);
            let end = page_align_2mb(range.end_address() + _2MB - 1);

            log::info!(
                "Mapping range {:#x}..{:#x} as {:#x}..{:#x}",
                range.base_address,
                range.end_address(),
                start,
                end
            );

            for pa in (start..end).step_by(_2MB as usize) {
                self.map_2mb(pa, false)?;
            }
        }

        // Legacy region: real-mode IVT, BDA and friends live below 2MB and
        // are not always part of the reported ranges.
        self.map_2mb(0, false)?;

        self.map_2mb(APIC_MMIO_BASE, true)?;

        for pa in (PCI_MMIO_START..PCI_MMIO_END).step_by(_2MB as usize) {
            self.map_2mb(pa, true)?;
        }

        log::info!("Nested page tables initialized, pml4 at {:#x}", self.pml4_pa);
        Ok(())
    }

    /// Maps the 2MB page containing `pa` onto itself. Already-present entries
    /// are left alone.
    pub fn map_2mb(&mut self, pa: u64, uncached: bool) -> Result<()> {
        let pa = page_align_2mb(pa);

        let pdpt = ensure_subtable(self.pml4, pml4_index(pa)).context(NptPdptAllocSnafu)?;
        let pd = ensure_subtable(pdpt, pdpt_index(pa)).context(NptPdAllocSnafu)?;

        let pde = unsafe { &mut (*pd).entries[pd_index(pa)] };
        if pde.get_present() == 0 {
            pde.set_page_frame(pa >> PAGE_SHIFT);
            pde.set_write(1);
            pde.set_user(1);
            pde.set_large_page(1);
            if uncached {
                pde.set_cache_disable(1);
            }
            pde.set_present(1);
        }

        Ok(())
    }

    /// Software walk to the terminal entry for `gpa`.
    ///
    /// A large-page entry is terminal no matter what its present bit says;
    /// descending a level requires the entry to be present and small. Child
    /// pointers are resolved through the registry, and a registry miss is a
    /// hard miss.
    fn walk_terminal(&self, gpa: u64) -> Option<(*mut NptEntry, TableLevel)> {
        if self.pml4.is_null() {
            return None;
        }

        let pml4e = unsafe { &(*self.pml4).entries[pml4_index(gpa)] };
        if pml4e.get_present() == 0 {
            return None;
        }

        let pdpt = registry::lookup(pml4e.get_page_frame() << PAGE_SHIFT)?;
        let pdpte = unsafe { &mut (*pdpt).entries[pdpt_index(gpa)] };
        if pdpte.get_large_page() != 0 {
            return Some((pdpte as *mut _, TableLevel::Pdpt));
        }
        if pdpte.get_present() == 0 {
            return None;
        }

        let pd = registry::lookup(pdpte.get_page_frame() << PAGE_SHIFT)?;
        let pde = unsafe { &mut (*pd).entries[pd_index(gpa)] };
        if pde.get_large_page() != 0 {
            return Some((pde as *mut _, TableLevel::Pd));
        }
        if pde.get_present() == 0 {
            return None;
        }

        let pt = registry::lookup(pde.get_page_frame() << PAGE_SHIFT)?;
        let pte = unsafe { &mut (*pt).entries[pt_index(gpa)] };
        Some((pte as *mut _, TableLevel::Pt))
    }

    /// Copy of the terminal entry for `gpa`, for callers that only inspect.
    pub fn terminal(&self, gpa: u64) -> Option<(NptEntry, TableLevel)> {
        self.walk_terminal(gpa)
            .map(|(entry, level)| (unsafe { *entry }, level))
    }

    /// The map is identity by construction; the tables exist for the hardware
    /// walker, not for software translation.
    pub fn translate_gpa_to_hpa(&self, gpa: u64) -> u64 {
        gpa
    }

    /// Repoints the terminal entry for `target_gpa_page` at another host
    /// frame.
    pub fn hook_page(&mut self, target_gpa_page: u64, new_hpa_page: u64) -> bool {
        let Some((entry, _)) = self.walk_terminal(target_gpa_page) else {
            return false;
        };

        unsafe {
            (*entry).set_page_frame(new_hpa_page >> PAGE_SHIFT);
            (*entry).set_accessed(1);
            (*entry).set_dirty(1);
        }

        self.tlb_flush_pending = true;
        true
    }

    /// Registers the shadow hook. The actual remap happens from the fault
    /// path once the guest touches the page.
    pub fn install_shadow_hook(&mut self, target_gpa: u64, new_hpa: u64) -> bool {
        self.shadow_hook.target_gpa_page = page_align_4kb(target_gpa);
        self.shadow_hook.new_hpa_page = page_align_4kb(new_hpa);
        self.shadow_hook.active = true;

        // Only this vcpu's ASID gets flushed, on its own next exit. Other
        // cores pick the change up after their next exit.
        self.tlb_flush_pending = true;
        true
    }

    pub fn clear_shadow_hook(&mut self) {
        self.shadow_hook.active = false;
        self.shadow_hook.target_gpa_page = 0;
        self.shadow_hook.new_hpa_page = 0;

        self.tlb_flush_pending = true;
    }

    /// Arms all four trigger slots and activates the mailbox.
    pub fn setup_hardware_triggers(&mut self, pages: [u64; TRIGGER_SLOT_COUNT]) -> bool {
        let mut armed_all = true;
        for (index, gpa) in pages.iter().enumerate() {
            armed_all &= self.arm_trigger(index, *gpa);
        }

        self.mailbox.gpa_page = page_align_4kb(pages[TRIGGER_APIC]);
        self.mailbox.active = true;
        self.mailbox.last_message = 0;

        armed_all
    }

    fn arm_trigger(&mut self, index: usize, gpa: u64) -> bool {
        let page = page_align_4kb(gpa);
        self.triggers[index].gpa_page = page;
        self.triggers[index].using_fake = false;

        let Some((entry, _)) = self.walk_terminal(page) else {
            log::warn!("No npt entry to arm for {:#x}", gpa);
            return false;
        };

        unsafe {
            self.triggers[index].original_frame = (*entry).get_page_frame();
            (*entry).set_present(0);
        }
        self.triggers[index].armed = true;
        self.tlb_flush_pending = true;

        true
    }

    /// Promotes the first armed slot the fault can belong to and reports the
    /// faulting GPA as the mailbox value.
    ///
    /// A slot whose entry is still present only matches faults on its own
    /// page; an armed (non-present) entry matches any fault, which races in
    /// the harmless direction when some other access hit an unrelated page.
    pub fn handle_hardware_triggers(&mut self, fault_gpa: u64) -> Option<u64> {
        let fault_page = page_align_4kb(fault_gpa);

        for index in 0..TRIGGER_SLOT_COUNT {
            if !self.triggers[index].armed || self.triggers[index].using_fake {
                continue;
            }

            let Some((entry, _)) = self.walk_terminal(self.triggers[index].gpa_page) else {
                continue;
            };

            let present = unsafe { (*entry).get_present() != 0 };
            if fault_page != self.triggers[index].gpa_page && present {
                continue;
            }

            if !self.promote_to_decoy(entry) {
                continue;
            }

            self.triggers[index].armed = false;
            self.triggers[index].using_fake = true;
            self.tlb_flush_pending = true;

            return Some(fault_gpa);
        }

        None
    }

    fn promote_to_decoy(&mut self, entry: *mut NptEntry) -> bool {
        let slot = (self.decoy_index & 1) as usize;
        let decoy_pa = self.decoy_pa[slot];
        if decoy_pa == 0 {
            return false;
        }

        unsafe {
            (*entry).set_page_frame(decoy_pa >> PAGE_SHIFT);
            (*entry).set_write(1);
            (*entry).set_accessed(1);
            (*entry).set_dirty(1);
            (*entry).set_present(1);
        }

        // Rotate so the next promotion serves the alternate decoy.
        self.decoy_index ^= 1;
        true
    }

    /// Restores the original frame of every fired slot and arms it again.
    pub fn rearm_hardware_triggers(&mut self) {
        for index in 0..TRIGGER_SLOT_COUNT {
            if !self.triggers[index].using_fake {
                continue;
            }

            if let Some((entry, _)) = self.walk_terminal(self.triggers[index].gpa_page) {
                unsafe {
                    (*entry).set_page_frame(self.triggers[index].original_frame);
                    (*entry).set_present(0);
                }
            }

            self.triggers[index].using_fake = false;
            self.triggers[index].armed = true;
            self.tlb_flush_pending = true;
        }
    }

    pub fn update_shadow_cr3(&mut self, guest_cr3: u64) {
        self.shadow_cr3 = guest_cr3;
    }
}

impl Drop for NptState {
    fn drop(&mut self) {
        for slot in 0..DECOY_PAGE_COUNT {
            if !self.decoy_va[slot].is_null() {
                platform::free_contiguous(self.decoy_va[slot]);
            }
        }

        if self.pml4.is_null() {
            return;
        }

        // Free the hierarchy bottom-up; large-page entries carry no table.
        unsafe {
            for pml4e in (*self.pml4).entries.iter() {
                if pml4e.get_present() == 0 {
                    continue;
                }
                let pdpt_pa = pml4e.get_page_frame() << PAGE_SHIFT;
                let Some(pdpt) = registry::lookup(pdpt_pa) else {
                    continue;
                };

                for pdpte in (*pdpt).entries.iter() {
                    if pdpte.get_present() == 0 || pdpte.get_large_page() != 0 {
                        continue;
                    }
                    let pd_pa = pdpte.get_page_frame() << PAGE_SHIFT;
                    let Some(pd) = registry::lookup(pd_pa) else {
                        continue;
                    };

                    for pde in (*pd).entries.iter() {
                        if pde.get_present() == 0 || pde.get_large_page() != 0 {
                            continue;
                        }
                        let pt_pa = pde.get_page_frame() << PAGE_SHIFT;
                        if let Some(pt) = registry::lookup(pt_pa) {
                            free_table(pt_pa, pt);
                        }
                    }

                    free_table(pd_pa, pd);
                }

                free_table(pdpt_pa, pdpt);
            }

            free_table(self.pml4_pa, self.pml4);
        }
    }
}

/// Allocates and registers one zero-filled table. The registration happens
/// before any entry can reference the table.
fn alloc_table() -> Option<(*mut NptTable, u64)> {
    let memory = platform::alloc_contiguous(core::mem::size_of::<NptTable>())?;
    let table = memory.as_ptr() as *mut NptTable;
    let pa = platform::virt_to_phys(table as _);

    if !registry::register(pa, table) {
        platform::free_contiguous(table as _);
        return None;
    }

    log::trace!("Npt table allocated, va {:p} pa {:#x}", table, pa);
    Some((table, pa))
}

/// Returns the child table below `parent[index]`, allocating and linking it
/// first if the entry is empty.
fn ensure_subtable(parent: *mut NptTable, index: usize) -> Option<*mut NptTable> {
    let entry = unsafe { &mut (*parent).entries[index] };

    if entry.get_present() == 0 {
        let (table, pa) = alloc_table()?;
        entry.set_page_frame(pa >> PAGE_SHIFT);
        entry.set_write(1);
        entry.set_user(1);
        entry.set_present(1);
        return Some(table);
    }

    registry::lookup(entry.get_page_frame() << PAGE_SHIFT)
}

fn free_table(pa: u64, table: *mut NptTable) {
    registry::unregister(pa);
    platform::free_contiguous(table as _);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{self, PhysicalMemoryRange};

    fn ram(base_address: u64, number_of_bytes: u64) -> PhysicalMemoryRange {
        PhysicalMemoryRange {
            base_address,
            number_of_bytes,
        }
    }

    fn build_npt() -> NptState {
        platform::with_state(|state| state.ranges = vec![ram(0, 8 * 1024 * 1024)]);

        let mut npt = NptState::default();
        npt.initialize().unwrap();
        npt
    }

    #[test]
    fn identity_map_covers_ram_and_mmio() {
        let npt = build_npt();

        for gpa in [0u64, 0x1000, 0x20_0000, 0x7F_F000] {
            assert_eq!(npt.translate_gpa_to_hpa(gpa), gpa);

            let (entry, level) = npt.terminal(gpa).unwrap();
            assert_eq!(level, TableLevel::Pd);
            assert_eq!(entry.get_page_frame() << 12, page_align_2mb(gpa));
            assert_eq!(entry.get_present(), 1);
            assert_eq!(entry.get_write(), 1);
            assert_eq!(entry.get_user(), 1);
            assert_eq!(entry.get_large_page(), 1);
            assert_eq!(entry.get_cache_disable(), 0);
        }

        // The APIC page and the PCI window are terminal uncached 2MB pages.
        for gpa in [APIC_MMIO_BASE, PCI_MMIO_START, PCI_MMIO_END - 1] {
            let (entry, level) = npt.terminal(gpa).unwrap();
            assert_eq!(level, TableLevel::Pd);
            assert_eq!(entry.get_cache_disable(), 1);
            assert_eq!(entry.get_page_frame() << 12, page_align_2mb(gpa));
        }

        // Nothing above the PCI window was mapped eagerly.
        assert!(npt.terminal(0xF800_0000).is_none());
    }

    #[test]
    fn initialization_fails_without_memory_ranges() {
        platform::with_state(|state| state.ranges.clear());

        let mut npt = NptState::default();
        assert_eq!(
            npt.initialize().unwrap_err(),
            crate::error::HvError::MemoryRanges
        );
    }

    #[test]
    fn hook_page_rewrites_the_terminal_frame() {
        let mut npt = build_npt();
        npt.tlb_flush_pending = false;

        assert!(npt.hook_page(0x20_0000, 0x66_6000));

        let (entry, _) = npt.terminal(0x20_0000).unwrap();
        assert_eq!(entry.get_page_frame(), 0x666);
        assert_eq!(entry.get_accessed(), 1);
        assert_eq!(entry.get_dirty(), 1);
        assert!(npt.tlb_flush_pending);
    }

    #[test]
    fn shadow_hook_is_reversible() {
        let mut npt = build_npt();
        let (original, _) = npt.terminal(0x40_0000).unwrap();

        npt.tlb_flush_pending = false;
        assert!(npt.install_shadow_hook(0x40_0123, 0x99_9000));
        assert!(npt.shadow_hook.active);
        assert_eq!(npt.shadow_hook.target_gpa_page, 0x40_0000);
        assert!(npt.tlb_flush_pending);

        npt.tlb_flush_pending = false;
        npt.clear_shadow_hook();
        assert!(!npt.shadow_hook.active);
        assert!(npt.tlb_flush_pending);

        // The walker still sees the original frame.
        let (entry, _) = npt.terminal(0x40_0123).unwrap();
        assert_eq!(entry.get_page_frame(), original.get_page_frame());
    }

    #[test]
    fn trigger_slots_arm_promote_and_rearm() {
        let mut npt = build_npt();

        let pages = [0x1000, 0x20_1000, 0x40_1000, 0x60_1000];
        assert!(npt.setup_hardware_triggers(pages));
        assert!(npt.mailbox.active);

        for slot in npt.triggers.iter() {
            assert!(slot.armed);
            assert!(!slot.using_fake);
        }

        // Arming strips the present bit but keeps the entry reachable.
        let (entry, _) = npt.terminal(0x1000).unwrap();
        assert_eq!(entry.get_present(), 0);

        // A fault on the armed page promotes the slot to the decoy.
        let message = npt.handle_hardware_triggers(0x1234);
        assert_eq!(message, Some(0x1234));
        assert!(npt.triggers[TRIGGER_APIC].using_fake);
        assert!(!npt.triggers[TRIGGER_APIC].armed);

        let (entry, _) = npt.terminal(0x1000).unwrap();
        assert_eq!(entry.get_present(), 1);
        assert_ne!(entry.get_page_frame(), 0);

        // Re-arming restores the original frame and strips presence again.
        npt.rearm_hardware_triggers();
        assert!(npt.triggers[TRIGGER_APIC].armed);
        assert!(!npt.triggers[TRIGGER_APIC].using_fake);

        let (entry, _) = npt.terminal(0x1000).unwrap();
        assert_eq!(entry.get_present(), 0);
        assert_eq!(
            entry.get_page_frame(),
            npt.triggers[TRIGGER_APIC].original_frame
        );
    }

    #[test]
    fn consecutive_promotions_rotate_the_decoys() {
        let mut npt = build_npt();

        let pages = [0x1000, 0x20_1000, 0x40_1000, 0x60_1000];
        assert!(npt.setup_hardware_triggers(pages));

        assert!(npt.handle_hardware_triggers(0x1000).is_some());
        let (first, _) = npt.terminal(0x1000).unwrap();

        assert!(npt.handle_hardware_triggers(0x20_1000).is_some());
        let (second, _) = npt.terminal(0x20_1000).unwrap();

        assert_ne!(first.get_page_frame(), second.get_page_frame());
    }
}
