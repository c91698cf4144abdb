//! Process metadata lookups backing the introspection hypercalls.

use crate::platform;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDetails {
    pub image_base: u64,
    pub directory_table_base: u64,
}

/// Details of the process the faulting vcpu is currently running.
pub fn query_current() -> Option<ProcessDetails> {
    platform::current_process()
}

pub fn query_by_pid(pid: u64) -> Option<ProcessDetails> {
    platform::process_by_pid(pid)
}
