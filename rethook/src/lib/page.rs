use crate::error::ThunkError;
use crate::ffi::{map_rwx, unmap, void, RetAddr};
use std::cell::Cell;
use std::mem::{offset_of, size_of};
use std::ptr::{self, addr_of_mut, NonNull};

/// Pages are mapped one OS page at a time. Keeping them page-sized and
/// page-aligned is what makes [`Page::from_thunk`] a mask.
pub const PAGE_SIZE: usize = 4096;
const HEADER_SIZE: usize = 32;
const THUNK_SIZE: usize = 32;
/// How many thunks fit in a [`Page`] after its header.
pub const THUNKS_PER_PAGE: usize = (PAGE_SIZE - HEADER_SIZE) / THUNK_SIZE;

/// `call qword ptr [rip + 2]`: an indirect call through
/// [`Thunk::entry`], which sits 2 bytes past the end of the instruction.
/// The call pushes the address right after itself, i.e. `thunk + 6`,
/// which is how the shared entry code finds out who fired.
const CALL_INSN: [u8; 6] = [0xFF, 0x15, 0x02, 0x00, 0x00, 0x00];
pub const CALL_INSN_LEN: usize = CALL_INSN.len();
// Padding up to the `entry` field. Never executed.
const INT3: u8 = 0xCC;

/// One slot of the pool: stands in for the return address of a single
/// live call.
///
/// The first 8 bytes are machine code, so the address of a [`Thunk`] is
/// itself a valid return target. Landing there forwards control to the
/// shared entry stub, never to per-slot generated code.
#[repr(C, align(32))]
pub struct Thunk {
    code:       [u8; 8],
    entry:      RetAddr,
    // Only ever changed by `make_thunk`.
    caller:     Cell<RetAddr>,
    factory:    *const void,
}

impl Thunk {
    fn new(entry: RetAddr, factory: *const void) -> Self {
        let mut code = [INT3; 8];
        code[..CALL_INSN_LEN].copy_from_slice(&CALL_INSN);

        Self { code, entry, caller: Cell::new(0), factory }
    }

    /// The address this thunk was substituted for.
    #[inline(always)]
    pub fn real_return_address(&self) -> RetAddr {
        self.caller.get()
    }

    #[inline(always)]
    pub(crate) fn set_real_return_address(&self, real_ret: RetAddr) {
        self.caller.set(real_ret);
    }

    /// What goes on the stack in place of the real return address.
    #[inline(always)]
    pub fn address(&self) -> RetAddr {
        self as *const Thunk as RetAddr
    }

    /// The entry point this thunk jumps to when returned into.
    pub fn entry(&self) -> RetAddr {
        self.entry
    }

    pub fn code(&self) -> &[u8; 8] {
        &self.code
    }

    #[inline(always)]
    pub(crate) fn factory(&self) -> *const void {
        self.factory
    }

    /// Position of this thunk inside its own [`Page`].
    #[inline(always)]
    pub fn index_in_page(&self) -> usize {
        ((self.address() & (PAGE_SIZE - 1)) - HEADER_SIZE) / THUNK_SIZE
    }

    /// Position of this thunk in the factory's flat index space, which
    /// is also the call depth it was handed out at.
    pub fn slot_index(&self) -> usize {
        // SAFETY: a `Thunk` only ever lives inside a `Page`.
        let ordinal = unsafe { (*Page::from_thunk(self)).ordinal };
        ordinal * THUNKS_PER_PAGE + self.index_in_page()
    }
}

/// A page-sized block of thunks. Pages form a singly linked list in the
/// order they were mapped, and are only released with their factory.
#[repr(C, align(4096))]
pub struct Page {
    factory:    *const void,
    next:       Cell<*mut Page>,
    // How many pages precede this one.
    ordinal:    usize,
    _reserved:  usize,
    thunks:     [Thunk; THUNKS_PER_PAGE],
}

const _: () = assert!(size_of::<Thunk>() == THUNK_SIZE);
const _: () = assert!(offset_of!(Thunk, entry) == CALL_INSN_LEN + 2);
const _: () = assert!(offset_of!(Page, thunks) == HEADER_SIZE);
const _: () = assert!(size_of::<Page>() == PAGE_SIZE);

impl Page {
    /// Maps a fresh page and lays out every thunk in it. The thunks'
    /// code and back-references are fixed from here on.
    pub(crate) fn create(
        factory: *const void,
        ordinal: usize,
        entry: RetAddr,
    ) -> Result<NonNull<Page>, ThunkError> {
        let page = map_rwx(PAGE_SIZE).map_err(ThunkError::PageMap)?.cast::<Page>();
        let raw = page.as_ptr();
        // SAFETY: `raw` is a fresh, exclusively owned, page-aligned mapping
        // of exactly `size_of::<Page>()` bytes.
        unsafe {
            addr_of_mut!((*raw).factory).write(factory);
            addr_of_mut!((*raw).next).write(Cell::new(ptr::null_mut()));
            addr_of_mut!((*raw).ordinal).write(ordinal);
            addr_of_mut!((*raw)._reserved).write(0);
            let first = addr_of_mut!((*raw).thunks) as *mut Thunk;
            for i in 0..THUNKS_PER_PAGE {
                first.add(i).write(Thunk::new(entry, factory));
            }
        }

        Ok(page)
    }

    /// # Safety
    ///
    /// No thunk of `page` may be live on any stack, and `page` must not
    /// be used afterwards.
    pub(crate) unsafe fn destroy(page: NonNull<Page>) {
        unmap(page.cast(), PAGE_SIZE);
    }

    /// Finds the page holding `thunk` by masking its address. A null
    /// thunk yields a null page.
    #[inline(always)]
    pub fn from_thunk(thunk: *const Thunk) -> *const Page {
        ((thunk as usize) & !(PAGE_SIZE - 1)) as *const Page
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    #[inline(always)]
    pub fn thunk(&self, i: usize) -> &Thunk {
        &self.thunks[i]
    }

    pub(crate) fn factory(&self) -> *const void {
        self.factory
    }

    #[inline(always)]
    pub(crate) fn next(&self) -> *mut Page {
        self.next.get()
    }

    pub(crate) fn set_next(&self, next: *mut Page) {
        self.next.set(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAKE_ENTRY: RetAddr = 0x1122_3344_5566_7788;

    #[test]
    fn layout_fills_one_os_page() {
        assert_eq!(THUNKS_PER_PAGE, 127);
        assert_eq!(HEADER_SIZE + THUNKS_PER_PAGE * THUNK_SIZE, PAGE_SIZE);
    }

    #[test]
    fn thunk_code_calls_through_entry_field() {
        let page = Page::create(ptr::null(), 0, FAKE_ENTRY).unwrap();
        let page_ref = unsafe { page.as_ref() };
        let thunk = page_ref.thunk(5);
        assert_eq!(&thunk.code()[..6], &[0xFF, 0x15, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&thunk.code()[6..], &[0xCC, 0xCC]);
        assert_eq!(thunk.entry(), FAKE_ENTRY);

        // rip-relative target: end of the call instruction plus its disp32.
        let disp = i32::from_le_bytes(thunk.code()[2..6].try_into().unwrap()) as usize;
        let target = thunk.address() + CALL_INSN_LEN + disp;
        assert_eq!(target, &thunk.entry as *const RetAddr as usize);
        unsafe { Page::destroy(page) };
    }

    #[test]
    fn thunks_find_their_page_and_index() {
        let page = Page::create(ptr::null(), 3, FAKE_ENTRY).unwrap();
        let page_ref = unsafe { page.as_ref() };
        for i in [0, 1, 64, THUNKS_PER_PAGE - 1] {
            let thunk = page_ref.thunk(i);
            assert_eq!(Page::from_thunk(thunk), page.as_ptr() as *const Page);
            assert_eq!(thunk.index_in_page(), i);
            assert_eq!(thunk.slot_index(), 3 * THUNKS_PER_PAGE + i);
            assert_eq!(thunk.real_return_address(), 0);
        }
        assert!(Page::from_thunk(ptr::null()).is_null());
        unsafe { Page::destroy(page) };
    }
}
