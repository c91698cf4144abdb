//! Raw VMMCALL entry point.

use svm_hypervisor::hypercall::HypercallMessage;

/// Issues the call and stores the RAX result back into the message.
///
/// Must run inside the virtualized guest; on a bare machine the instruction
/// raises `#UD`.
#[cfg(target_arch = "x86_64")]
pub fn issue(message: &mut HypercallMessage) {
    let (rax, rbx, rcx, rdx) = message.registers();
    let result: u64;

    // LLVM reserves RBX, so it is swapped in around the instruction.
    unsafe {
        core::arch::asm!(
            "xchg {arg0}, rbx",
            "vmmcall",
            "xchg {arg0}, rbx",
            arg0 = inout(reg) rbx => _,
            inout("rax") rax => result,
            inout("rcx") rcx => _,
            inout("rdx") rdx => _,
        );
    }

    message.result = result;
}

#[cfg(not(target_arch = "x86_64"))]
pub fn issue(_message: &mut HypercallMessage) {
    panic!("hv-control only works on x86_64 guests");
}
