use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific virtual memory handling. The heap
/// provider grows one contiguous range in place, so instead of asking the
/// kernel for independent regions it reserves the whole address range once
/// and commits pages as the break advances. Nothing is ever decommitted,
/// the range is released wholesale when the provider is dropped.
trait PlatformVirtualMemory {
    /// Reserves `length` bytes of contiguous address space without backing
    /// them with memory yet.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Makes `length` bytes starting at `address` readable and writable.
    /// The range must lie within a previous reservation. Returns whether
    /// the kernel obliged.
    unsafe fn commit(address: NonNull<u8>, length: usize) -> bool;

    /// Returns a whole reservation to the kernel. `address` and `length`
    /// must match the original [`PlatformVirtualMemory::reserve`] call.
    unsafe fn release(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformVirtualMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be
/// a constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the value of the page size at runtime by calling into C
/// libraries, so we'll mutate a global variable and reuse it afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Platform::page_size();
        }

        PAGE_SIZE
    }
}

/// Convenience wrapper for [`PlatformVirtualMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::commit`].
#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit(address, length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // No protection bits at all: the reservation only claims the
            // address range. Pages become usable once mprotect flips them
            // in commit.
            let protection = libc::PROT_NONE;

            // Memory should be private to our process and not mapped to
            // any file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            libc::mprotect(address.cast().as_ptr(), length, protection) == 0
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // TODO: What should we do here? Panic? Memory region is
                // still valid here, it wasn't unmapped.
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Unlike mmap, VirtualAlloc distinguishes reserving address
            // space from committing memory to it, which is exactly the
            // split we want. See the docs for each parameter:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(
                None,
                length,
                Memory::MEM_RESERVE,
                Memory::PAGE_NOACCESS,
            );

            NonNull::new(address.cast())
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let address = Memory::VirtualAlloc(
                Some(address.cast().as_ptr()),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            !address.is_null()
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // Committed pages are released together with the reservation
            // by specifying length 0 and MEM_RELEASE. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address, length, flags).as_bool() {
                // TODO: Release failed, don't know what to do here yet.
                // Same problem as munmap on Linux.
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap`
    //! because there's no FFI support, so instead we'll use the global
    //! allocator to mock virtual memory. Reservations are plain
    //! allocations, committing is a no-op, and releasing deallocates. This
    //! is also useful for detecting leaks of the reservation itself.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformVirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
