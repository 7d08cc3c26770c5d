//! The one OS-specific seam in this crate (spec §9 "Loader isolation"): an
//! executable-memory allocator with an RW<->RX protection toggle, behind a
//! handful of free functions rather than a `trait` object, since there is
//! exactly one active implementation per target and nothing in `Module`
//! needs to be generic over it.
//!
//! `cfg(unix)` uses `libc::mmap`/`mprotect`/`munmap` directly, mirroring
//! the retrieved `BJIT_USE_MMAP` path of the original `module.cpp`.
//! `cfg(windows)` uses `VirtualAlloc`/`VirtualProtect`/`VirtualFree`. Both
//! paths round the requested size up to a whole number of pages using
//! `region::page::size()` so callers never have to know the host page size.

use thiserror::Error;

/// Errors from the executable-memory allocator (spec §7 "System-error
/// class").
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The OS failed to allocate an executable-memory-capable region.
    #[error("failed to allocate executable memory: {0}")]
    Allocate(#[source] std::io::Error),
    /// The OS refused a read-write<->read-execute protection change.
    #[error("failed to change memory protection: {0}")]
    Protect(#[source] std::io::Error),
    /// `Module::patch` was asked to apply changes that no longer fit the
    /// existing allocation; the caller must `unload` and `load` instead
    /// (spec §4.7 "If the code grew past the allocation, patch fails").
    #[error("patched code ({needed} bytes) no longer fits the loaded allocation ({have} bytes)")]
    CodeGrew {
        /// Bytes the patch would have required.
        needed: usize,
        /// Bytes actually available in the current allocation.
        have: usize,
    },
    /// An operation that requires a loaded module (`patch`, `get_proc_ptr`)
    /// was called before `load` (spec §7 "loader return of 'not loaded'
    /// (first call)").
    #[error("module is not loaded")]
    NotLoaded,
}

/// An allocated, page-rounded block of memory, currently either read-write
/// or read-execute. Always freed through `free`; `Drop` is intentionally
/// not implemented here because `Module` owns the toggle/free lifecycle
/// explicitly (unload is an observable, fallible operation, not an
/// implicit destructor side effect).
pub(crate) struct Allocation {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

// Raw pointers aren't `Send`/`Sync` by default; this allocation is a plain
// OS-backed memory region with no thread-affinity, so both are sound as
// long as callers serialize mutation (spec §5 "exclusive access required
// during patch/unload").
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Round `size` up to a whole number of host pages (never zero).
fn page_round(size: usize) -> usize {
    let page = region::page::size().max(1);
    let size = size.max(1);
    (size + page - 1) / page * page
}

#[cfg(unix)]
mod imp {
    use super::{page_round, Allocation, LoaderError};
    use std::io;

    fn last_os_error() -> io::Error {
        io::Error::from_raw_os_error(errno::errno().0)
    }

    pub(crate) fn alloc_rw(size: usize) -> Result<Allocation, LoaderError> {
        let len = page_round(size);
        // SAFETY: anonymous, not-file-backed mapping; the returned pointer
        // is owned exclusively by the returned `Allocation` until `free`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(LoaderError::Allocate(last_os_error()));
        }
        Ok(Allocation {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub(crate) fn protect_rx(alloc: &Allocation) -> Result<(), LoaderError> {
        // SAFETY: `alloc.ptr`/`alloc.len` describe a live mapping owned by
        // `alloc`; `mprotect` never moves or resizes it.
        let rc =
            unsafe { libc::mprotect(alloc.ptr as *mut libc::c_void, alloc.len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(LoaderError::Protect(last_os_error()));
        }
        Ok(())
    }

    pub(crate) fn protect_rw(alloc: &Allocation) -> Result<(), LoaderError> {
        let rc = unsafe {
            libc::mprotect(
                alloc.ptr as *mut libc::c_void,
                alloc.len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(LoaderError::Protect(last_os_error()));
        }
        Ok(())
    }

    pub(crate) fn free(alloc: Allocation) -> Result<(), LoaderError> {
        // SAFETY: `alloc` is consumed here, so this is the one and only
        // unmap of this mapping.
        let rc = unsafe { libc::munmap(alloc.ptr as *mut libc::c_void, alloc.len) };
        if rc != 0 {
            return Err(LoaderError::Protect(last_os_error()));
        }
        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use super::{page_round, Allocation, LoaderError};
    use std::io;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE};

    fn last_os_error() -> io::Error {
        io::Error::last_os_error()
    }

    pub(crate) fn alloc_rw(size: usize) -> Result<Allocation, LoaderError> {
        let len = page_round(size);
        // SAFETY: requests a fresh anonymous mapping; ownership transfers
        // to the returned `Allocation`.
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(LoaderError::Allocate(last_os_error()));
        }
        Ok(Allocation {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub(crate) fn protect_rx(alloc: &Allocation) -> Result<(), LoaderError> {
        let mut old: winapi::shared::minwindef::DWORD = 0;
        // SAFETY: `alloc.ptr`/`alloc.len` describe a live VirtualAlloc
        // region owned by `alloc`.
        let ok = unsafe {
            VirtualProtect(
                alloc.ptr as *mut _,
                alloc.len,
                PAGE_EXECUTE_READ,
                &mut old,
            )
        };
        if ok == 0 {
            return Err(LoaderError::Protect(last_os_error()));
        }
        Ok(())
    }

    pub(crate) fn protect_rw(alloc: &Allocation) -> Result<(), LoaderError> {
        let mut old: winapi::shared::minwindef::DWORD = 0;
        let ok = unsafe {
            VirtualProtect(alloc.ptr as *mut _, alloc.len, PAGE_READWRITE, &mut old)
        };
        if ok == 0 {
            return Err(LoaderError::Protect(last_os_error()));
        }
        Ok(())
    }

    pub(crate) fn free(alloc: Allocation) -> Result<(), LoaderError> {
        // SAFETY: `alloc` is consumed here; `dwSize` must be 0 with
        // `MEM_RELEASE`, which frees the entire region from its base.
        let ok = unsafe { VirtualFree(alloc.ptr as *mut _, 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(LoaderError::Protect(last_os_error()));
        }
        Ok(())
    }
}

pub(crate) use imp::{alloc_rw, free, protect_rw, protect_rx};
