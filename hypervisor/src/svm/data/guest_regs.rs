/// The general-purpose register snapshot the trampoline pushes on the host
/// stack after `#VMEXIT` and restores before the next `vmrun`.
///
/// The field order mirrors the push sequence and must not change. `rax` is a
/// placeholder slot: the hardware keeps the guest RAX in the VMCB state-save
/// area, and the dispatcher copies it into and out of this snapshot. The same
/// applies to `rsp`, which lives in the state-save area as well.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 16 * 8);
