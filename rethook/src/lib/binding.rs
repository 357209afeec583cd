//! Ties a [`ReturnThunkFactory`] to the thread whose stack it mirrors,
//! and provides the prologue hook that instrumented code calls.
//!
//! Native hooks have no way to receive a factory as an argument, so the
//! factory in charge is looked up in a thread-local. Each thread sees only
//! its own binding, so any number of threads may be profiled at once, each
//! with its own factory.

use crate::error::ThunkError;
use crate::factory::{Pool, ReturnThunkFactory};
use crate::ffi::{graceful_exit, void, RetAddr};
use log::trace;
use std::arch::global_asm;
use std::cell::Cell;
use std::ptr;

thread_local! {
    // Const-initialised and without a destructor: reading it from a hook
    // never allocates.
    static BOUND: Cell<*const void> = const { Cell::new(ptr::null()) };
}

/// Makes `factory` the one serving this thread's hooks.
///
/// # Safety
///
/// `factory` must outlive the binding, and the binding must be undone
/// with [`unbind`] on this same thread before the factory is dropped.
/// Moving the factory in between is fine. Prefer [`with_bound`].
pub unsafe fn bind(factory: &ReturnThunkFactory<'_>) -> Result<(), ThunkError> {
    BOUND.with(|bound| {
        if !bound.get().is_null() {
            return Err(ThunkError::AlreadyBound);
        }
        let pool = factory.pool().as_opaque();
        bound.set(pool);
        trace!("bound return thunk factory, pool at {:p}", pool);

        Ok(())
    })
}

/// Undoes [`bind`]. Hooks on this thread go back to letting calls
/// through untouched.
pub fn unbind() -> Result<(), ThunkError> {
    BOUND.with(|bound| {
        if bound.get().is_null() {
            return Err(ThunkError::NotBound);
        }
        trace!("unbound return thunk factory, pool at {:p}", bound.get());
        bound.set(ptr::null());

        Ok(())
    })
}

pub fn is_bound() -> bool {
    BOUND.with(|bound| !bound.get().is_null())
}

/// Runs `f` with `factory` bound to the current thread, unbinding
/// afterwards even if `f` panics.
///
/// Every interception made inside `f` by code that returns normally has
/// fired by the time `f` is done, so the factory can be dropped safely
/// afterwards.
pub fn with_bound<R>(
    factory: &ReturnThunkFactory<'_>,
    f: impl FnOnce() -> R,
) -> Result<R, ThunkError> {
    struct Unbind;
    impl Drop for Unbind {
        fn drop(&mut self) {
            BOUND.with(|bound| bound.set(ptr::null()));
        }
    }

    // SAFETY: the guard unbinds before `factory`'s borrow ends.
    unsafe { bind(factory)? };
    let _guard = Unbind;

    Ok(f())
}

/// Swaps `real_ret` for a thunk of the factory bound to this thread. With
/// nothing bound the thread isn't being profiled and `real_ret` comes
/// back as is.
///
/// Exported for shims that save registers themselves; in-process code
/// should use [`penter`](penter_address) instead. Running out of memory
/// for thunks is fatal: the process exits rather than run a call
/// without its interception.
#[no_mangle]
pub unsafe extern "C" fn rethook_make_hook(real_ret: RetAddr) -> RetAddr {
    let pool = BOUND.with(|bound| bound.get());
    if pool.is_null() {
        return real_ret;
    }
    let pool = &*(pool as *const Pool<'_>);
    match pool.make_thunk(real_ret) {
        Ok(thunk)   => { thunk.as_ref().address() },
        Err(_)      => { graceful_exit("rethook: cannot allocate return thunks, aborting."); }
    }
}

// The prologue hook. An instrumented function starts with `call
// rethook_penter`, so on entry:
//   [rsp]       return address into the instrumented function
//   [rsp + 8]   the instrumented function's own return address
// That second slot is handed to `rethook_make_hook` and replaced with
// whatever it returns. Argument registers (rdi..r9, xmm0-xmm7), rax (the
// vector count of variadics) and flags all survive.
//
// Stack after the pushes below, relative to rbp:
//   [rbp + 96]  instrumented function's return address
//   [rbp + 88]  return into the instrumented function
//   [rbp + 80]  rflags ... [rbp + 0] rbp
global_asm!(
    ".pushsection .text",
    ".globl rethook_penter",
    ".type rethook_penter, @function",
    ".p2align 4",
    "rethook_penter:",
    "pushfq",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push rbp",
    "mov rbp, rsp",
    "and rsp, -16",
    "sub rsp, 128",
    "movdqa xmmword ptr [rsp + 0x00], xmm0",
    "movdqa xmmword ptr [rsp + 0x10], xmm1",
    "movdqa xmmword ptr [rsp + 0x20], xmm2",
    "movdqa xmmword ptr [rsp + 0x30], xmm3",
    "movdqa xmmword ptr [rsp + 0x40], xmm4",
    "movdqa xmmword ptr [rsp + 0x50], xmm5",
    "movdqa xmmword ptr [rsp + 0x60], xmm6",
    "movdqa xmmword ptr [rsp + 0x70], xmm7",
    "mov rdi, qword ptr [rbp + 96]",
    "call {make_hook}",
    "mov qword ptr [rbp + 96], rax",
    "movdqa xmm0, xmmword ptr [rsp + 0x00]",
    "movdqa xmm1, xmmword ptr [rsp + 0x10]",
    "movdqa xmm2, xmmword ptr [rsp + 0x20]",
    "movdqa xmm3, xmmword ptr [rsp + 0x30]",
    "movdqa xmm4, xmmword ptr [rsp + 0x40]",
    "movdqa xmm5, xmmword ptr [rsp + 0x50]",
    "movdqa xmm6, xmmword ptr [rsp + 0x60]",
    "movdqa xmm7, xmmword ptr [rsp + 0x70]",
    "mov rsp, rbp",
    "pop rbp",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "popfq",
    "ret",
    ".size rethook_penter, . - rethook_penter",
    ".popsection",
    make_hook = sym rethook_make_hook,
);

extern "C" {
    pub(crate) fn rethook_penter();
}

/// Address of the prologue hook, for shims that patch `call`s to it
/// into function entries.
pub fn penter_address() -> RetAddr {
    rethook_penter as *const () as usize
}
