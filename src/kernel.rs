use std::ptr::NonNull;

use crate::page::PAGE_SIZE;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The allocator's top level view of pages has nothing
/// to do with the concrete APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    ///
    /// The returned memory is zero filled and aligned at least to the OS page size.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: NonNull<u8>, len: usize);
}

/// Zero sized type the platform implementations hang off.
struct Kernel;

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, len: usize) {
            unsafe {
                munmap(addr.as_ptr().cast::<c_void>(), len as size_t);
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::Memory;

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE);
            }
        }
    }
}

/// One page worth of memory mapped straight from the kernel.
///
/// The mapping is owned exclusively by this value and handed back to the
/// kernel when it is dropped, so pages never outlive the allocator that
/// requested them.
pub(crate) struct PageMemory {
    base: NonNull<u8>,
}

// SAFETY: the mapping is private to this value; moving it to another thread
// moves ownership of the whole region with it.
unsafe impl Send for PageMemory {}

impl PageMemory {
    /// Maps a fresh, zero filled page. Returns None when the kernel refuses.
    pub fn map() -> Option<Self> {
        // SAFETY: requesting anonymous memory has no preconditions.
        let base = unsafe { Kernel::request_memory(PAGE_SIZE)? };

        Some(Self { base })
    }

    /// First byte of the page.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Address of the first byte of the page.
    #[inline]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Pointer `offset` bytes into the page.
    ///
    /// `offset` must be at most [`PAGE_SIZE`].
    #[inline]
    pub fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= PAGE_SIZE);
        // SAFETY: offsets stay within (or one past) the mapped page.
        unsafe { self.base.add(offset) }
    }
}

impl Drop for PageMemory {
    fn drop(&mut self) {
        // SAFETY: `base` came from `request_memory(PAGE_SIZE)` and is returned once.
        unsafe { Kernel::return_memory(self.base, PAGE_SIZE) }
    }
}
