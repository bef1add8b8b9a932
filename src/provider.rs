use std::ptr::NonNull;

use crate::{platform, AllocError, Pointer};

/// Contract between the allocator and whoever owns the underlying heap
/// region: a single contiguous byte range `[low, high)` that only ever
/// grows, by arbitrary byte amounts, always in place.
///
/// The allocator calls [`HeapProvider::extend`] at most once per
/// allocation and treats `None` as out-of-memory. It never asks for
/// memory back, so providers don't need a shrink operation.
pub trait HeapProvider {
    /// First byte of the heap region. Stable for the provider's lifetime
    /// and at least 16 byte aligned.
    fn low(&self) -> NonNull<u8>;

    /// One past the last usable byte of the heap region. Equals
    /// [`HeapProvider::low`] while the heap is empty.
    fn high(&self) -> NonNull<u8>;

    /// Grows the region by `length` contiguous bytes. On success returns
    /// the *old* high bound, which is where the new bytes start. On
    /// failure returns `None` and leaves the bounds untouched.
    ///
    /// # Safety
    ///
    /// On success the returned range of `length` bytes is valid for reads
    /// and writes until the provider is dropped.
    unsafe fn extend(&mut self, length: usize) -> Pointer<u8>;
}

/// Default [`HeapProvider`]: a break pointer walking through one range of
/// reserved virtual memory.
///
/// ```text
///   low                  high (break)               reservation end
///    |                       |                             |
///    v                       v                             v
///    +-----------------------+--------------+- - - - - - - +
///    |   heap in use         |  committed   |   reserved   |
///    +-----------------------+--------------+- - - - - - - +
///                            |------ extend moves this ----->
/// ```
///
/// The whole capacity is reserved up front so the region can grow without
/// ever moving; pages are only committed as `extend` reaches them. The
/// capacity is a hard cap: once the break hits it, `extend` fails and the
/// allocator starts reporting out-of-memory. Tests use small capacities to
/// model exhaustion cheaply.
pub struct VirtualHeap {
    base: NonNull<u8>,
    /// Total reserved bytes, page aligned.
    reserved: usize,
    /// Bytes handed out, `high() == base + break_offset`.
    break_offset: usize,
    /// Bytes already committed, page aligned, never less than
    /// `break_offset`.
    committed: usize,
}

impl VirtualHeap {
    /// Default reservation: 1 GiB of address space. Address space is
    /// cheap, committed pages are what counts.
    pub const DEFAULT_CAPACITY: usize = 1 << 30;

    pub fn new() -> Result<Self, AllocError> {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Reserves `capacity` bytes (rounded up to whole pages) of address
    /// space for the heap to grow into.
    pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
        let reserved = round_to_pages(capacity);

        let Some(base) = (unsafe { platform::reserve(reserved) }) else {
            return Err(AllocError);
        };

        Ok(Self {
            base,
            reserved,
            break_offset: 0,
            committed: 0,
        })
    }

    /// Bytes that can still be handed out before the cap.
    pub fn remaining(&self) -> usize {
        self.reserved - self.break_offset
    }
}

impl HeapProvider for VirtualHeap {
    fn low(&self) -> NonNull<u8> {
        self.base
    }

    fn high(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.break_offset)) }
    }

    unsafe fn extend(&mut self, length: usize) -> Pointer<u8> {
        let new_break = self.break_offset.checked_add(length)?;
        if new_break > self.reserved {
            return None;
        }

        // Commit page-wise: the break usually advances in small steps, so
        // most extensions land in already committed pages.
        if new_break > self.committed {
            let target = round_to_pages(new_break);
            let from = NonNull::new_unchecked(self.base.as_ptr().add(self.committed));

            if !platform::commit(from, target - self.committed) {
                return None;
            }

            self.committed = target;
        }

        let old_high = self.high();
        self.break_offset = new_break;

        Some(old_high)
    }
}

impl Drop for VirtualHeap {
    fn drop(&mut self) {
        unsafe { platform::release(self.base, self.reserved) };
    }
}

/// Rounds `length` up to a whole number of pages.
fn round_to_pages(length: usize) -> usize {
    let page = platform::page_size();
    (length + page - 1) / page * page
}
