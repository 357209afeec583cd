// C-reminiscent types.
pub type size_t     = libc::size_t;
pub type void       = libc::c_void;

/// A code address that some `ret` instruction will jump to. Both the
/// real return addresses we steal and the thunks we hand out in their
/// place are of this type.
pub type RetAddr    = usize;

// Linux utils.
use libc::{
    mmap,
    munmap,
    fputs,
    fwrite,
    exit,
    MAP_ANONYMOUS,
    MAP_FAILED,
    MAP_PRIVATE,
    PROT_EXEC,
    PROT_READ,
    PROT_WRITE,
};
use std::io;
use std::ptr::{self, NonNull};

pub unsafe fn graceful_exit(err_msg: &str) -> ! {
    //! Prints some error message on stderr, then exits with
    //! non-zero code. Nothing here allocates: we may have been
    //! reached from inside a hooked prologue.
    use libc_stdhandle::stderr;

    let err = stderr();
    fwrite(err_msg.as_ptr() as *const void, 1, err_msg.len(), err);
    fputs(c"\n".as_ptr(), err);
    exit(1);
}

/// Maps `len` bytes of private, zero-filled memory that may be both
/// written and executed. Thunks are code *and* data.
pub fn map_rwx(len: size_t) -> io::Result<NonNull<void>> {
    let raw = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE | PROT_EXEC,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    NonNull::new(raw).ok_or_else(|| io::Error::other("mmap returned a null mapping"))
}

/// # Safety
///
/// `p` must come from [`map_rwx`] with the same `len`, and nothing may
/// still execute or reference the mapping.
pub unsafe fn unmap(p: NonNull<void>, len: size_t) {
    if munmap(p.as_ptr(), len) != 0 {
        log::warn!("munmap({:p}) failed: {}", p, io::Error::last_os_error());
    }
}
