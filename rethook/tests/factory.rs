use rethook::*;
use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};

/// Strict mock: any notification beyond the expected count is a failure,
/// and so is any expected one that never came.
#[derive(Default)]
struct MockDelegate {
    expected:   Cell<usize>,
    seen:       RefCell<Vec<(RetAddr, u64)>>,
}

impl MockDelegate {
    fn expect_calls(&self, n: usize) {
        self.expected.set(self.expected.get() + n);
    }
}

impl Delegate for MockDelegate {
    fn on_function_exit(&self, thunk: &Thunk, raw: u64) {
        let mut seen = self.seen.borrow_mut();
        assert!(seen.len() < self.expected.get(), "unexpected on_function_exit({:#x}, {})", thunk.address(), raw);
        seen.push((thunk.address(), raw));
    }
}

impl Drop for MockDelegate {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(self.seen.borrow().len(), self.expected.get(), "missing on_function_exit calls");
        }
    }
}

const N: usize = ReturnThunkFactory::THUNKS_PER_PAGE;

fn page_of(thunk: NonNull<Thunk>) -> *const Page {
    ReturnThunkFactory::page_from_thunk(thunk.as_ptr())
}

fn fire(thunk: NonNull<Thunk>, raw: u64) -> RetAddr {
    unsafe { ReturnThunkFactory::thunk_main(thunk.as_ptr(), raw) }
}

#[test]
fn allocate_several_pages() {
    let delegate = MockDelegate::default();
    let factory = ReturnThunkFactory::new(&delegate).unwrap();
    let mut previous: *const Thunk = ptr::null();
    for _ in 0..3 * N {
        let thunk = factory.make_thunk(0).unwrap();
        assert!(
            page_of(thunk) != ReturnThunkFactory::page_from_thunk(previous)
                || thunk.as_ptr() as *const Thunk > previous
        );
        previous = thunk.as_ptr();
    }
    assert_eq!(factory.page_count(), 3);
    assert_eq!(factory.depth(), 3 * N);
}

#[test]
fn one_more_thunk_than_fits_maps_one_more_page() {
    for k in 0..4 {
        let delegate = MockDelegate::default();
        let factory = ReturnThunkFactory::new(&delegate).unwrap();
        let mut last = None;
        for _ in 0..k * N {
            last = Some(factory.make_thunk(0).unwrap());
        }
        assert_eq!(factory.page_count(), k.max(1));

        let spill = factory.make_thunk(0).unwrap();
        assert_eq!(factory.page_count(), k + 1);
        assert_eq!(factory.capacity(), (k + 1) * N);
        assert_eq!(unsafe { (*page_of(spill)).ordinal() }, k);
        assert_eq!(unsafe { spill.as_ref() }.index_in_page(), 0);
        if let Some(last) = last {
            assert_ne!(page_of(spill), page_of(last));
        }
    }
}

#[test]
fn reuse_thunks() {
    let delegate = MockDelegate::default();
    let factory = ReturnThunkFactory::new(&delegate).unwrap();
    let first = factory.make_thunk(0).unwrap();
    factory.make_thunk(0).unwrap();
    let third = factory.make_thunk(0).unwrap();

    // A return through the first thunk takes the two deeper ones with it.
    delegate.expect_calls(1);
    fire(first, 0);
    assert_eq!(factory.depth(), 0);

    let new_first = factory.make_thunk(0).unwrap();
    factory.make_thunk(0).unwrap();
    let new_third = factory.make_thunk(0).unwrap();
    assert_eq!(new_first, first);
    assert_eq!(new_third, third);
}

#[test]
fn reuse_pages() {
    let delegate = MockDelegate::default();
    let factory = ReturnThunkFactory::new(&delegate).unwrap();
    let first = factory.make_thunk(0).unwrap();
    let mut last = first;
    for _ in 0..N {
        last = factory.make_thunk(0).unwrap();
    }
    // `last` is the first thunk of the second page.
    assert_ne!(page_of(first), page_of(last));

    // After a return via the first thunk it takes N + 1 thunks to get
    // back there, on the page that is already mapped.
    delegate.expect_calls(1);
    fire(first, 0);

    let mut new_last = first;
    for _ in 0..N + 1 {
        new_last = factory.make_thunk(0).unwrap();
    }
    assert_eq!(new_last, last);
    assert_eq!(factory.page_count(), 2);
}

#[test]
fn firing_notifies_once_and_returns_real_address() {
    let delegate = MockDelegate::default();
    let factory = ReturnThunkFactory::new(&delegate).unwrap();
    let outer = factory.make_thunk(0x1000).unwrap();
    let inner = factory.make_thunk(0x2000).unwrap();

    delegate.expect_calls(1);
    assert_eq!(fire(inner, 42), 0x2000);
    assert_eq!(*delegate.seen.borrow(), vec![(inner.as_ptr() as RetAddr, 42)]);
    assert_eq!(factory.depth(), 1);

    delegate.expect_calls(1);
    assert_eq!(fire(outer, 43), 0x1000);
    assert_eq!(delegate.seen.borrow()[1], (outer.as_ptr() as RetAddr, 43));
    assert_eq!(factory.depth(), 0);
}

#[test]
fn firing_leaves_other_thunks_alone() {
    let recorder = ExitRecorder::new();
    let factory = ReturnThunkFactory::new(&recorder).unwrap();
    let thunks: Vec<_> = (0..10usize)
        .map(|i| factory.make_thunk(0x4000 + i).unwrap())
        .collect();

    assert_eq!(fire(thunks[9], 1), 0x4009);
    assert_eq!(fire(thunks[8], 2), 0x4008);
    // Shallower thunks still carry their own addresses...
    for (i, thunk) in thunks.iter().enumerate().take(8) {
        assert_eq!(unsafe { thunk.as_ref() }.real_return_address(), 0x4000 + i);
    }
    // ...and only the two that fired were reported, deepest first.
    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], ExitEvent {
        thunk:                  thunks[9].as_ptr() as RetAddr,
        slot:                   9,
        real_return_address:    0x4009,
        raw:                    1,
    });
    assert_eq!(events[1].slot, 8);
    assert_eq!(events[1].raw, 2);
}

#[test]
fn reused_thunk_takes_new_address() {
    let recorder = ExitRecorder::new();
    let factory = ReturnThunkFactory::new(&recorder).unwrap();
    let a = factory.make_thunk(0xAAAA).unwrap();
    fire(a, 0);
    let b = factory.make_thunk(0xBBBB).unwrap();
    assert_eq!(a, b);
    assert_eq!(fire(b, 0), 0xBBBB);
    assert_eq!(recorder.len(), 2);
}

#[test]
fn thunks_point_at_a_shared_entry() {
    let recorder = ExitRecorder::new();
    let factory = ReturnThunkFactory::new(&recorder).unwrap();
    let entries: Vec<RetAddr> = (0..N + 5)
        .map(|_| unsafe { factory.make_thunk(0).unwrap().as_ref() }.entry())
        .collect();
    assert!(entries.iter().all(|&e| e == entries[0] && e != 0));
}

#[test]
fn factories_do_not_share_pages() {
    let recorder = ExitRecorder::new();
    let one = ReturnThunkFactory::new(&recorder).unwrap();
    let two = ReturnThunkFactory::new(&recorder).unwrap();
    let a = one.make_thunk(1).unwrap();
    let b = two.make_thunk(2).unwrap();
    assert_ne!(page_of(a), page_of(b));

    assert_eq!(fire(b, 0), 2);
    assert_eq!(one.depth(), 1);
    assert_eq!(two.depth(), 0);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "out of call-stack order")]
fn firing_a_retired_thunk_is_caught() {
    let recorder = ExitRecorder::new();
    let factory = ReturnThunkFactory::new(&recorder).unwrap();
    let outer = factory.make_thunk(1).unwrap();
    let inner = factory.make_thunk(2).unwrap();
    fire(outer, 0);
    // `inner` died with `outer`.
    fire(inner, 0);
}
