use snafu::Snafu;

pub type Result<T, E = HvError> = core::result::Result<T, E>;

/// Failures that can be reported to the host driver.
///
/// Guest-visible faults are never part of this enum. They are handled by
/// injecting an event into the guest or by returning a sentinel value from the
/// hypercall dispatcher.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum HvError {
    #[snafu(display("Processor does not support SVM or it is disabled"))]
    NotSupported,

    #[snafu(display("Failed to allocate the vcpu block"))]
    VcpuAlloc,

    #[snafu(display("Failed to allocate the msr permission map"))]
    MsrpmAlloc,

    #[snafu(display("Failed to allocate the io permission map"))]
    IopmAlloc,

    #[snafu(display("Failed to allocate a decoy page"))]
    DecoyAlloc,

    #[snafu(display("Failed to allocate the nested paging pml4"))]
    NptPml4Alloc,

    #[snafu(display("Failed to allocate a nested paging pdpt"))]
    NptPdptAlloc,

    #[snafu(display("Failed to allocate a nested paging page directory"))]
    NptPdAlloc,

    #[snafu(display("Host reported no physical memory ranges"))]
    MemoryRanges,

    #[snafu(display("No vcpu exists for processor {index}"))]
    UnknownProcessor { index: u32 },

    #[snafu(display("The vmrun loop returned unexpectedly"))]
    LaunchFailed,
}
