//! Function-exit interception for profiling agents.
//!
//! An instrumentation shim catches a function entry and, instead of the
//! function's real return address, leaves a *return thunk* on the stack.
//! When the function returns it lands in the thunk, which forwards to a
//! single shared entry stub: that stub samples the TSC, tells a
//! [`Delegate`] which thunk fired, and resumes at the real return address
//! with every register the caller can observe left as it was.
//!
//! Thunks come from a [`ReturnThunkFactory`], one per thread, which keeps
//! them in page-sized blocks and recycles them in call-stack order.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("rethook intercepts returns of x86-64 Linux processes only.");

/// Aliases and `libc` glue: page mapping and the fatal exit path.
#[allow(non_camel_case_types)]
mod ffi;

mod error;

/// Layout of pages and of the thunks in them.
mod page;

/// The thunk pool proper.
mod factory;

/// The shared native entry stub every thunk returns into.
mod entry;

mod delegate;

pub mod binding;

pub mod probe;

pub use crate::delegate::{Delegate, ExitEvent, ExitRecorder};
pub use crate::error::ThunkError;
pub use crate::factory::ReturnThunkFactory;
pub use crate::ffi::RetAddr;
pub use crate::page::{Page, Thunk, PAGE_SIZE, THUNKS_PER_PAGE};
