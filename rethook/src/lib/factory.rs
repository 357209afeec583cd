use crate::delegate::Delegate;
use crate::entry;
use crate::error::ThunkError;
use crate::ffi::{void, RetAddr};
use crate::page::{Page, Thunk, THUNKS_PER_PAGE};
use log::{debug, trace};
use std::cell::Cell;
use std::ptr::{self, NonNull};

/// Hands out return thunks for one thread's call stack, and takes them
/// back as that stack unwinds.
///
/// Thunks are never freed one by one. Live calls always return in LIFO
/// order, so a single cursor splits the slots in two: everything below
/// it belongs to a call that is still running, everything at or above it
/// is free. [`make_thunk`](Self::make_thunk) bumps the cursor and a
/// firing thunk pulls it back down to its own index, retiring every
/// deeper thunk along with itself.
///
/// Each thunk points back at the pool state, which lives in a private
/// heap block of its own. The handle itself may be moved freely. It is
/// neither `Send` nor `Sync`: one instance, one stack.
pub struct ReturnThunkFactory<'d> {
    pool:   Box<Pool<'d>>,
}

/// What thunks point back at. Never moves once boxed.
pub(crate) struct Pool<'d> {
    delegate:       &'d dyn Delegate,
    first_page:     *mut Page,
    // The cursor: next thunk handed out is `current_page[next_slot]`,
    // i.e. flat index `ordinal(current_page) * THUNKS_PER_PAGE + next_slot`.
    current_page:   Cell<*mut Page>,
    next_slot:      Cell<usize>,
    page_count:     Cell<usize>,
}

impl<'d> ReturnThunkFactory<'d> {
    /// Page capacity, in thunks.
    pub const THUNKS_PER_PAGE: usize = THUNKS_PER_PAGE;

    /// Creates a factory reporting to `delegate`, with its first page
    /// already mapped.
    pub fn new(delegate: &'d dyn Delegate) -> Result<Self, ThunkError> {
        let mut pool = Box::new(Pool {
            delegate,
            first_page:     ptr::null_mut(),
            current_page:   Cell::new(ptr::null_mut()),
            next_slot:      Cell::new(0),
            page_count:     Cell::new(0),
        });
        // Thunks carry the pool's address, so pages can only be laid
        // out once the box is in place.
        let first = pool.add_page()?;
        pool.first_page = first;
        pool.current_page.set(first);
        trace!("return thunk factory created, pool at {:p}", &*pool);

        Ok(Self { pool })
    }

    /// Takes the next free thunk, makes it stand for `real_ret` and
    /// returns it. The caller is expected to put the thunk's address
    /// where `real_ret` used to be.
    ///
    /// Steps into the next page when the current one is used up, mapping
    /// it only if no deeper call chain has done so before.
    #[inline]
    pub fn make_thunk(&self, real_ret: RetAddr) -> Result<NonNull<Thunk>, ThunkError> {
        self.pool.make_thunk(real_ret)
    }

    /// Locates the page a thunk lives in. Pure address arithmetic.
    pub fn page_from_thunk(thunk: *const Thunk) -> *const Page {
        Page::from_thunk(thunk)
    }

    /// Runs the exit logic for a thunk that was just returned into:
    /// notifies the delegate with `raw`, retires `thunk` and every thunk
    /// handed out after it, and yields the real return address.
    ///
    /// # Safety
    ///
    /// `thunk` must have come from [`make_thunk`](Self::make_thunk) on a
    /// factory that is still alive, and must still be live, i.e. neither
    /// it nor any shallower thunk has fired since.
    pub unsafe fn thunk_main(thunk: *const Thunk, raw: u64) -> RetAddr {
        let thunk = &*thunk;
        let pool = &*(thunk.factory() as *const Pool<'_>);

        pool.fire(thunk, raw)
    }

    /// Number of live thunks, i.e. the current interception depth.
    pub fn depth(&self) -> usize {
        self.pool.depth()
    }

    pub fn page_count(&self) -> usize {
        self.pool.page_count.get()
    }

    /// Thunks available before another page must be mapped.
    pub fn capacity(&self) -> usize {
        self.page_count() * THUNKS_PER_PAGE
    }

    /// The state hooks and thunks work on. Its address stays put for as
    /// long as the factory lives, wherever the handle goes.
    pub(crate) fn pool(&self) -> &Pool<'d> {
        &self.pool
    }
}

impl Pool<'_> {
    pub(crate) fn make_thunk(&self, real_ret: RetAddr) -> Result<NonNull<Thunk>, ThunkError> {
        let mut page = self.current_page.get();
        let mut slot = self.next_slot.get();
        if slot == THUNKS_PER_PAGE {
            // SAFETY: `current_page` always points to one of our pages.
            let next = unsafe { (*page).next() };
            page = if next.is_null() { self.add_page()? } else { next };
            slot = 0;
            self.current_page.set(page);
        }

        // SAFETY: as above, and `slot < THUNKS_PER_PAGE`.
        let thunk = unsafe { (*page).thunk(slot) };
        thunk.set_real_return_address(real_ret);
        self.next_slot.set(slot + 1);

        Ok(NonNull::from(thunk))
    }

    fn fire(&self, thunk: &Thunk, raw: u64) -> RetAddr {
        let page = Page::from_thunk(thunk) as *mut Page;
        let slot = thunk.index_in_page();
        debug_assert!(
            ptr::eq(thunk.factory(), self.as_opaque()),
            "thunk {:#x} fired into a foreign factory", thunk.address()
        );
        debug_assert!(
            thunk.slot_index() < self.depth(),
            "thunk {:#x} fired out of call-stack order (slot {}, depth {})",
            thunk.address(), thunk.slot_index(), self.depth()
        );

        // Read before notifying, whatever the delegate gets up to.
        let real_ret = thunk.real_return_address();
        self.delegate.on_function_exit(thunk, raw);

        self.current_page.set(page);
        self.next_slot.set(slot);

        real_ret
    }

    fn depth(&self) -> usize {
        // SAFETY: `current_page` always points to one of our pages.
        let ordinal = unsafe { (*self.current_page.get()).ordinal() };
        ordinal * THUNKS_PER_PAGE + self.next_slot.get()
    }

    fn add_page(&self) -> Result<*mut Page, ThunkError> {
        let ordinal = self.page_count.get();
        let page = Page::create(self.as_opaque(), ordinal, entry::thunk_entry_address())?.as_ptr();
        let last = self.current_page.get();
        if !last.is_null() {
            // SAFETY: we only grow from the last page, which is ours.
            unsafe { (*last).set_next(page) };
        }
        self.page_count.set(ordinal + 1);
        debug!("mapped return thunk page #{} at {:p}", ordinal, page);

        Ok(page)
    }

    #[inline(always)]
    pub(crate) fn as_opaque(&self) -> *const void {
        self as *const Self as *const void
    }
}

impl Drop for Pool<'_> {
    fn drop(&mut self) {
        let mut page = self.first_page;
        while let Some(p) = NonNull::new(page) {
            // SAFETY: every page in the list is ours and mapped; the
            // owner of a factory must not drop it under a live thunk.
            unsafe {
                debug_assert!(ptr::eq(p.as_ref().factory(), self.as_opaque()));
                page = p.as_ref().next();
                Page::destroy(p);
            }
        }
        trace!("return thunk factory released {} pages", self.page_count.get());
    }
}
