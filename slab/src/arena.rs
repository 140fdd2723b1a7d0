//! Page-aligned anonymous memory for the slab backing region.
//!
//! The slab takes its backing memory through allocator callbacks, and this
//! module is the default provider: anonymous mmap, page-aligned, lazily
//! faulted by the OS. It also hosts the two region-level services the slab
//! needs from the OS: discarding a retired region (after a resize) so its
//! pages read back as zero, and querying how much of a region is resident.

use std::io;
use std::ptr::NonNull;

use log::debug;

/// OS page size in bytes.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// An anonymous, page-aligned memory region.
///
/// Pages are zero on first touch and stay unfaulted until used, so a large
/// region costs only virtual address space up front.
#[derive(Debug)]
pub struct SlabsAllocation {
    ptr: NonNull<u8>,
    size: usize,
}

impl SlabsAllocation {
    /// Map a new region of at least `size` bytes.
    pub fn allocate(size: usize) -> io::Result<SlabsAllocation> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot allocate zero bytes",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        debug!("mapped {size} byte slab region at {ptr:p}");

        Ok(SlabsAllocation {
            ptr: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
            size,
        })
    }

    /// Pointer to the start of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Region size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Release ownership without unmapping; returns `(ptr, size)`.
    ///
    /// The mapping stays live until [`free`] is called on the returned
    /// pair.
    pub fn into_raw(self) -> (*mut u8, usize) {
        let raw = (self.ptr.as_ptr(), self.size);
        std::mem::forget(self);
        raw
    }
}

impl Drop for SlabsAllocation {
    fn drop(&mut self) {
        unsafe {
            let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            debug_assert_eq!(result, 0, "munmap failed");
        }
    }
}

// Safety: the region is raw memory with a stable address.
unsafe impl Send for SlabsAllocation {}
unsafe impl Sync for SlabsAllocation {}

/// Unmap a region previously released with [`SlabsAllocation::into_raw`].
///
/// # Safety
///
/// `ptr`/`size` must come from `into_raw` and the region must no longer be
/// referenced.
pub unsafe fn free(ptr: *mut u8, size: usize) {
    let result = unsafe { libc::munmap(ptr as *mut libc::c_void, size) };
    debug_assert_eq!(result, 0, "munmap failed");
}

/// Discard a region's pages. The mapping stays valid; subsequent reads
/// return zero. Used on the old region after a resize so stale CAS
/// attempts observe `begin == 0`.
///
/// # Safety
///
/// `ptr` must point to a live mapping of at least `size` bytes, and no
/// thread may rely on the region's contents after the call.
pub unsafe fn discard(ptr: *mut u8, size: usize) {
    #[cfg(target_os = "linux")]
    {
        let result = unsafe { libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED) };
        if result == 0 {
            return;
        }
        debug!(
            "madvise(MADV_DONTNEED) failed: {}, zeroing instead",
            io::Error::last_os_error()
        );
    }
    // Portable fallback with the same observable effect.
    unsafe { std::ptr::write_bytes(ptr, 0, size) };
}

/// Bytes of the region currently backed by physical memory.
pub fn resident_bytes(ptr: *const u8, size: usize) -> io::Result<usize> {
    #[cfg(unix)]
    {
        let page = page_size();
        let pages = size.div_ceil(page);
        let mut vec = vec![0u8; pages];
        let result = unsafe {
            libc::mincore(
                ptr as *mut libc::c_void,
                size,
                vec.as_mut_ptr() as *mut _,
            )
        };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        let resident_pages = vec.iter().filter(|&&page_state| page_state & 1 != 0).count();
        Ok(std::cmp::min(resident_pages * page, size))
    }
    #[cfg(not(unix))]
    {
        let _ = ptr;
        Ok(size)
    }
}
