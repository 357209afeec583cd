use crate::ffi::RetAddr;
use crate::page::Thunk;
use std::cell::RefCell;

/// Consumer of function exits.
///
/// Invoked synchronously, on the thread whose call just returned, once
/// per thunk firing and in return order. The raw value is whatever the
/// entry stub sampled at the return (a TSC reading) and is passed
/// through untouched.
///
/// Implementations must not unwind: a panic escaping into the native
/// entry stub aborts the process. Calling back into the same factory's
/// `make_thunk` from here is the implementor's own risk.
pub trait Delegate {
    fn on_function_exit(&self, thunk: &Thunk, raw: u64);
}

/// What an [`ExitRecorder`] keeps for each firing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitEvent {
    /// Address of the thunk that fired.
    pub thunk:                  RetAddr,
    /// Its flat slot index, i.e. the call depth.
    pub slot:                   usize,
    pub real_return_address:    RetAddr,
    pub raw:                    u64,
}

/// A [`Delegate`] that simply appends every exit to a list.
#[derive(Default, Debug)]
pub struct ExitRecorder {
    events: RefCell<Vec<ExitEvent>>,
}

impl ExitRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the list so that recording doesn't allocate until
    /// `capacity` exits have been seen.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: RefCell::new(Vec::with_capacity(capacity)) }
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn events(&self) -> Vec<ExitEvent> {
        self.events.borrow().clone()
    }

    /// Hands back everything recorded so far and starts over.
    pub fn take(&self) -> Vec<ExitEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

impl Delegate for ExitRecorder {
    fn on_function_exit(&self, thunk: &Thunk, raw: u64) {
        self.events.borrow_mut().push(ExitEvent {
            thunk:                  thunk.address(),
            slot:                   thunk.slot_index(),
            real_return_address:    thunk.real_return_address(),
            raw,
        });
    }
}
