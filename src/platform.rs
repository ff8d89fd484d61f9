use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The pool only needs to
/// request runs of pages from the kernel and return them when the allocator
/// is torn down; it doesn't care about the APIs offered by the underlying
/// kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely. The returned address is page aligned.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the kernel. `address`
    /// must be the start of a region previously obtained from
    /// [`Self::request_memory`].
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Convenience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-Write, private to our process, not backed by any file.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // The kernel rounds the length up to a page multiple, so this
            // works even if our notion of a page is smaller than the real
            // one. A failure here leaves the mapping alive, which is the
            // lesser evil compared to aborting a teardown path.
            libc::munmap(address.cast().as_ptr(), length);
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Under Miri there is no FFI, so `mmap` is off the table. The global
    //! allocator stands in for the kernel, which has the nice side effect of
    //! letting Miri flag any run we forget to return.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::{pool::PAGE_SIZE, Pointer};

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, PAGE_SIZE).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
