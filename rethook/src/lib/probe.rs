//! Hand-instrumented native functions. Each one opens with `call
//! rethook_penter`, exactly as a prologue-patching shim would leave it, so
//! calling them while a factory is bound sends their return through a
//! real thunk.

use std::arch::global_asm;

/// Two integers, returned in `rax:rdx`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pair {
    pub first:  u64,
    pub second: u64,
}

/// What [`callback`] invokes from inside its instrumented frame.
pub type Visit = extern "C" fn(u64) -> u64;

global_asm!(
    ".pushsection .text",

    // u64 leaf(u64 x): x + 1
    ".globl rethook_probe_leaf",
    ".hidden rethook_probe_leaf",
    ".type rethook_probe_leaf, @function",
    ".p2align 4",
    "rethook_probe_leaf:",
    "call rethook_penter",
    "lea rax, [rdi + 1]",
    "ret",
    ".size rethook_probe_leaf, . - rethook_probe_leaf",

    // u64 nest(u64 n): recurses n levels deep, returns n
    ".globl rethook_probe_nest",
    ".hidden rethook_probe_nest",
    ".type rethook_probe_nest, @function",
    ".p2align 4",
    "rethook_probe_nest:",
    "call rethook_penter",
    "test rdi, rdi",
    "jz 2f",
    "push rdi",
    "sub rdi, 1",
    "call rethook_probe_nest",
    "pop rdi",
    "add rax, 1",
    "ret",
    "2:",
    "xor eax, eax",
    "ret",
    ".size rethook_probe_nest, . - rethook_probe_nest",

    // Pair swap(u64 a, u64 b): { b, a }
    ".globl rethook_probe_swap",
    ".hidden rethook_probe_swap",
    ".type rethook_probe_swap, @function",
    ".p2align 4",
    "rethook_probe_swap:",
    "call rethook_penter",
    "mov rax, rsi",
    "mov rdx, rdi",
    "ret",
    ".size rethook_probe_swap, . - rethook_probe_swap",

    // double scale(double x, double k): x * k
    ".globl rethook_probe_scale",
    ".hidden rethook_probe_scale",
    ".type rethook_probe_scale, @function",
    ".p2align 4",
    "rethook_probe_scale:",
    "call rethook_penter",
    "mulsd xmm0, xmm1",
    "ret",
    ".size rethook_probe_scale, . - rethook_probe_scale",

    // u64 callback(Visit f, u64 x): f(x)
    ".globl rethook_probe_callback",
    ".hidden rethook_probe_callback",
    ".type rethook_probe_callback, @function",
    ".p2align 4",
    "rethook_probe_callback:",
    "call rethook_penter",
    "sub rsp, 8",
    "mov rax, rdi",
    "mov rdi, rsi",
    "call rax",
    "add rsp, 8",
    "ret",
    ".size rethook_probe_callback, . - rethook_probe_callback",

    ".popsection",
);

extern "C" {
    fn rethook_probe_leaf(x: u64) -> u64;
    fn rethook_probe_nest(n: u64) -> u64;
    fn rethook_probe_swap(a: u64, b: u64) -> Pair;
    fn rethook_probe_scale(x: f64, k: f64) -> f64;
    fn rethook_probe_callback(f: Visit, x: u64) -> u64;
}

/// Returns `x + 1`. One interception.
pub fn leaf(x: u64) -> u64 {
    // SAFETY: plain SysV function; the hook preserves the ABI.
    unsafe { rethook_probe_leaf(x) }
}

/// Recurses `n` levels below itself and returns `n`. `n + 1`
/// interceptions, firing deepest first.
pub fn nest(n: u64) -> u64 {
    unsafe { rethook_probe_nest(n) }
}

/// Returns `{ b, a }` in `rax:rdx`.
pub fn swap(a: u64, b: u64) -> Pair {
    unsafe { rethook_probe_swap(a, b) }
}

/// Returns `x * k` in `xmm0`.
pub fn scale(x: f64, k: f64) -> f64 {
    unsafe { rethook_probe_scale(x, k) }
}

/// Calls `f(x)` from inside an instrumented frame, so arbitrary Rust
/// code can build call trees out of interceptions.
pub fn callback(f: Visit, x: u64) -> u64 {
    unsafe { rethook_probe_callback(f, x) }
}

/// Address of [`leaf`]'s native body, for tests that call it from
/// inline assembly.
pub fn leaf_address() -> usize {
    rethook_probe_leaf as *const () as usize
}
