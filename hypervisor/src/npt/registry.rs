//! Physical-to-virtual registry for the nested page tables.
//!
//! The tables are walked in software, but the kernel's reverse lookup is not
//! valid for arbitrarily allocated pool memory. Every table is therefore
//! recorded here when it is allocated, before the entry referencing it is
//! marked present. Shared by all vcpus and guarded by a spinlock that is only
//! held for the duration of an insert or a linear scan.

use crate::npt::NptTable;
use lazy_static::lazy_static;
use spin::Mutex;
use tinyvec::ArrayVec;

/// Sized for 16+ core systems (roughly 35 tables per core).
pub const MAX_NPT_TABLES: usize = 2048;

#[derive(Debug, Default, Clone, Copy)]
struct TableMapping {
    pa: u64,
    va: usize,
}

lazy_static! {
    static ref TABLE_MAP: Mutex<ArrayVec<[TableMapping; MAX_NPT_TABLES]>> =
        Mutex::new(ArrayVec::default());
}

/// Records a table. Returns `false` when the registry is full, in which case
/// the table must not be linked into the paging hierarchy.
pub fn register(pa: u64, va: *mut NptTable) -> bool {
    let mut map = TABLE_MAP.lock();

    if map.len() == map.capacity() {
        log::warn!("Npt table registry is full");
        return false;
    }

    map.push(TableMapping { pa, va: va as usize });
    true
}

/// Looks up the kernel-visible pointer for a table's physical address. A miss
/// is a hard miss: the walk that asked has to give up.
pub fn lookup(pa: u64) -> Option<*mut NptTable> {
    TABLE_MAP
        .lock()
        .iter()
        .find(|mapping| mapping.pa == pa)
        .map(|mapping| mapping.va as *mut NptTable)
}

pub fn unregister(pa: u64) {
    let mut map = TABLE_MAP.lock();

    if let Some(position) = map.iter().position(|mapping| mapping.pa == pa) {
        map.swap_remove(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister() {
        let table = 0x1234_5678_usize as *mut NptTable;

        assert!(register(0xABC000, table));
        assert_eq!(lookup(0xABC000), Some(table));

        unregister(0xABC000);
        assert_eq!(lookup(0xABC000), None);
    }
}
