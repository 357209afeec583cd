use crate::factory::ReturnThunkFactory;
use crate::ffi::RetAddr;
use crate::page::{Thunk, CALL_INSN_LEN};
use std::arch::global_asm;

// The one piece of code every thunk forwards to.
//
// On entry the intercepted function has already executed its `ret` into
// a thunk, and the thunk's `call` has pushed `thunk + CALL_INSN_LEN`.
// So `[rsp]` is the only thing on the stack that isn't the caller's, and
// it names the thunk that fired. We reuse that very slot as our own
// return address once the real one is known.
//
// Everything the caller could observe is preserved: flags, all
// caller-saved general purpose registers (rax:rdx carry return values)
// and xmm0-xmm15 (xmm0:xmm1 carry float returns). The TSC is sampled
// right after the two registers it needs are out of the way.
//
// Stack after the pushes below, relative to rbp:
//   [rbp + 88]  thunk + CALL_INSN_LEN, later the real return address
//   [rbp + 80]  rflags
//   [rbp + 72]  rax ... [rbp + 8] r11
//   [rbp + 0]   rbp
global_asm!(
    ".pushsection .text",
    ".globl rethook_thunk_entry",
    ".hidden rethook_thunk_entry",
    ".type rethook_thunk_entry, @function",
    ".p2align 4",
    "rethook_thunk_entry:",
    "pushfq",
    "push rax",
    "push rdx",
    "rdtsc",
    "shl rdx, 32",
    "or rdx, rax",
    "push rcx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push rbp",
    "mov rbp, rsp",
    "and rsp, -16",
    "sub rsp, 256",
    "movdqa xmmword ptr [rsp + 0x00], xmm0",
    "movdqa xmmword ptr [rsp + 0x10], xmm1",
    "movdqa xmmword ptr [rsp + 0x20], xmm2",
    "movdqa xmmword ptr [rsp + 0x30], xmm3",
    "movdqa xmmword ptr [rsp + 0x40], xmm4",
    "movdqa xmmword ptr [rsp + 0x50], xmm5",
    "movdqa xmmword ptr [rsp + 0x60], xmm6",
    "movdqa xmmword ptr [rsp + 0x70], xmm7",
    "movdqa xmmword ptr [rsp + 0x80], xmm8",
    "movdqa xmmword ptr [rsp + 0x90], xmm9",
    "movdqa xmmword ptr [rsp + 0xa0], xmm10",
    "movdqa xmmword ptr [rsp + 0xb0], xmm11",
    "movdqa xmmword ptr [rsp + 0xc0], xmm12",
    "movdqa xmmword ptr [rsp + 0xd0], xmm13",
    "movdqa xmmword ptr [rsp + 0xe0], xmm14",
    "movdqa xmmword ptr [rsp + 0xf0], xmm15",
    // thunk_main(thunk, tsc)
    "mov rsi, rdx",
    "mov rdi, qword ptr [rbp + 88]",
    "sub rdi, {call_len}",
    "call {thunk_main}",
    "mov qword ptr [rbp + 88], rax",
    "movdqa xmm0, xmmword ptr [rsp + 0x00]",
    "movdqa xmm1, xmmword ptr [rsp + 0x10]",
    "movdqa xmm2, xmmword ptr [rsp + 0x20]",
    "movdqa xmm3, xmmword ptr [rsp + 0x30]",
    "movdqa xmm4, xmmword ptr [rsp + 0x40]",
    "movdqa xmm5, xmmword ptr [rsp + 0x50]",
    "movdqa xmm6, xmmword ptr [rsp + 0x60]",
    "movdqa xmm7, xmmword ptr [rsp + 0x70]",
    "movdqa xmm8, xmmword ptr [rsp + 0x80]",
    "movdqa xmm9, xmmword ptr [rsp + 0x90]",
    "movdqa xmm10, xmmword ptr [rsp + 0xa0]",
    "movdqa xmm11, xmmword ptr [rsp + 0xb0]",
    "movdqa xmm12, xmmword ptr [rsp + 0xc0]",
    "movdqa xmm13, xmmword ptr [rsp + 0xd0]",
    "movdqa xmm14, xmmword ptr [rsp + 0xe0]",
    "movdqa xmm15, xmmword ptr [rsp + 0xf0]",
    "mov rsp, rbp",
    "pop rbp",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rcx",
    "pop rdx",
    "pop rax",
    "popfq",
    // Straight back into the real caller.
    "ret",
    ".size rethook_thunk_entry, . - rethook_thunk_entry",
    ".popsection",
    call_len = const CALL_INSN_LEN,
    thunk_main = sym thunk_main_trampoline,
);

extern "C" {
    fn rethook_thunk_entry();
}

/// Address every thunk's `call` goes through.
pub(crate) fn thunk_entry_address() -> RetAddr {
    rethook_thunk_entry as *const () as usize
}

/// C-ABI bridge between the entry stub and the factory. Cannot unwind:
/// a panic here aborts.
unsafe extern "C" fn thunk_main_trampoline(thunk: *const Thunk, raw: u64) -> RetAddr {
    ReturnThunkFactory::thunk_main(thunk, raw)
}
