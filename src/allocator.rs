use std::{ptr, ptr::NonNull};

use crate::{
    bins::{Bins, BIN_COUNT},
    block::{self, HEADER_SIZE, SPLIT_MIN},
    freelist::FreeNode,
    header::BlockHeader,
    provider::HeapProvider,
    AllocError, Pointer,
};

/// Segregated-fit allocator over a single growable heap region.
///
/// The heap provided by `P` is tiled as one prologue word followed by a
/// gapless sequence of blocks, the last of which is tracked by
/// `last_header`:
///
/// ```text
///  low                                                        high
///   |                                                           |
///   v                                                           v
///   +----------+--------+---------+--------+--------+-----------+
///   | prologue | Hdr+payload      | Hdr+payload     | Hdr+payload
///   | (8 bytes)| (allocated)      | (free, footer)  | (allocated)
///   +----------+--------+---------+--------+--------+-----------+
///                                                   ^
///                                                   last_header
/// ```
///
/// The prologue is a zero sized block permanently marked allocated. It
/// exists so the leftmost real block can carry `P = 1` like everybody
/// whose predecessor is allocated, which removes the "do I even have a
/// predecessor" branch from the fast paths. `last_header` plays the
/// mirror role on the right edge: a block is the last one iff its header
/// is `last_header`, so "is there a successor" is a pointer comparison
/// instead of a bounds calculation.
///
/// All state fits in this struct: the provider, the 15 free list heads
/// and the last-header pointer. Free blocks carry the rest of the
/// bookkeeping inside their own payloads.
///
/// The allocator is single threaded: every mutating operation takes
/// `&mut self`, there is no interior locking.
///
/// # Examples
///
/// ```rust
/// use segalloc::{Segalloc, VirtualHeap};
///
/// let mut allocator = Segalloc::new(VirtualHeap::with_capacity(1 << 20).unwrap()).unwrap();
///
/// let first = allocator.allocate(100).unwrap();
/// let second = allocator.allocate(100).unwrap();
///
/// unsafe {
///     first.as_ptr().write_bytes(1, 100);
///     second.as_ptr().write_bytes(2, 100);
///
///     // Releasing and allocating the same size again recycles the
///     // block instead of growing the heap.
///     allocator.deallocate(first.as_ptr());
///     let recycled = allocator.allocate(100).unwrap();
///     assert_eq!(recycled, first);
///
///     allocator.deallocate(recycled.as_ptr());
///     allocator.deallocate(second.as_ptr());
/// }
/// ```
pub struct Segalloc<P: HeapProvider> {
    /// Owner of the heap region.
    pub(crate) provider: P,
    /// Segregated free index.
    pub(crate) bins: Bins,
    /// Header of the highest-address block, or the prologue while the
    /// heap holds no blocks yet.
    pub(crate) last_header: NonNull<BlockHeader>,
}

impl<P: HeapProvider> Segalloc<P> {
    /// Sets up an empty heap: obtains the 8 byte prologue from the
    /// provider and marks it allocated. Fails only if the provider does.
    pub fn new(mut provider: P) -> Result<Self, AllocError> {
        unsafe {
            let Some(prologue) = provider.extend(HEADER_SIZE) else {
                return Err(AllocError);
            };
            let prologue = prologue.cast::<BlockHeader>();
            debug_assert_eq!(prologue.cast::<u8>(), provider.low());

            BlockHeader::initialize(prologue, 0);
            BlockHeader::set_allocated(prologue);

            Ok(Self {
                provider,
                bins: Bins::new(),
                last_header: prologue,
            })
        }
    }

    /// Allocates a block whose payload can hold at least `size` bytes and
    /// returns its payload address, 16 byte aligned. Returns `None` for
    /// zero sized requests and when the provider cannot grow the heap any
    /// further; in the latter case no state has changed.
    pub fn allocate(&mut self, size: usize) -> Pointer<u8> {
        #[cfg(feature = "debug-checks")]
        self.assert_consistent();

        if size == 0 {
            return None;
        }

        let block_size = block::payload_size_for(size)?;

        unsafe {
            match self.find_fit(block_size) {
                Some(found) => Some(self.place(found, block_size)),
                None => self.extend_heap(block_size),
            }
        }
    }

    /// Releases a previously allocated payload, merging it with free
    /// neighbors on the spot. Null pointers and pointers outside the heap
    /// bounds are ignored.
    ///
    /// # Safety
    ///
    /// `address` must be null, outside the heap, or a payload address
    /// obtained from this allocator that has not been released since.
    /// Releasing the same payload twice or releasing an interior pointer
    /// is undefined behavior.
    pub unsafe fn deallocate(&mut self, address: *mut u8) {
        #[cfg(feature = "debug-checks")]
        self.assert_consistent();

        if !self.contains(address) {
            return;
        }

        let header = block::header_of(NonNull::new_unchecked(address));

        let next_free =
            header != self.last_header && BlockHeader::is_free(block::next_header(header));
        // The leftmost block has the prologue word right before its
        // header; its P bit is always set, the extra comparison just
        // mirrors that on the address level.
        let prev_free = block::previous_footer(header) != self.prologue()
            && BlockHeader::is_prev_free(header);

        let survivor = match (prev_free, next_free) {
            (true, true) => self.coalesce_both(header),
            (false, true) => self.coalesce_next(header),
            (true, false) => self.coalesce_previous(header),
            (false, false) => self.mark_free(header),
        };

        // The survivor's size class may differ from any of the merged
        // blocks', so it is always freshly inserted here.
        self.bins.insert(survivor);
    }

    /// Resizes an allocation, moving it if need be. The first
    /// `min(new_size, old size)` payload bytes are preserved.
    ///
    /// A null `address` behaves like [`Segalloc::allocate`], a zero
    /// `new_size` behaves like [`Segalloc::deallocate`] and returns
    /// `None`. If no block for `new_size` can be obtained, `None` is
    /// returned and the old payload stays untouched and valid.
    ///
    /// # Safety
    ///
    /// Same contract as [`Segalloc::deallocate`] for non-null `address`.
    pub unsafe fn reallocate(&mut self, address: *mut u8, new_size: usize) -> Pointer<u8> {
        let Some(old_payload) = NonNull::new(address) else {
            return self.allocate(new_size);
        };

        if new_size == 0 {
            self.deallocate(address);
            return None;
        }

        let new_payload = self.allocate(new_size)?;

        let old_size = BlockHeader::size(block::header_of(old_payload));
        ptr::copy_nonoverlapping(
            old_payload.as_ptr(),
            new_payload.as_ptr(),
            old_size.min(new_size),
        );

        self.deallocate(address);

        Some(new_payload)
    }

    /// Allocates a zero filled payload for `count` elements of `size`
    /// bytes each. Returns `None` when the total overflows or the
    /// allocation fails.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let total = count.checked_mul(size)?;
        let payload = self.allocate(total)?;

        unsafe { payload.as_ptr().write_bytes(0, total) };

        Some(payload)
    }

    /// Header of the prologue word at the base of the heap.
    #[inline]
    pub(crate) fn prologue(&self) -> NonNull<BlockHeader> {
        self.provider.low().cast()
    }

    /// Whether `address` falls inside the heap bounds `[low, high)`.
    /// Null never does.
    fn contains(&self, address: *mut u8) -> bool {
        let low = self.provider.low().as_ptr() as usize;
        let high = self.provider.high().as_ptr() as usize;

        (low..high).contains(&(address as usize))
    }

    /// Searches the free index for the first block that fits `block_size`
    /// bytes, starting at the class the size maps to and promoting to
    /// larger classes as needed.
    unsafe fn find_fit(&self, block_size: usize) -> Pointer<BlockHeader> {
        let mut index = Bins::index_of(block_size);

        while index < BIN_COUNT {
            for node in self.bins.list(index).iter() {
                let found = FreeNode::block_of(node);

                if BlockHeader::size(found) >= block_size {
                    return Some(found);
                }

                // Classes 0-3 hold exactly one size, so if the head is
                // too small the whole list is.
                if index <= 3 {
                    break;
                }
            }

            index += 1;
        }

        None
    }

    /// Claims the free block `found` for an allocation of `block_size`
    /// bytes: unlinks it, splits off the tail end as a new free block if
    /// the leftover can stand on its own, and keeps the status bits of
    /// the neighborhood in sync. Returns the payload address.
    unsafe fn place(&mut self, found: NonNull<BlockHeader>, block_size: usize) -> NonNull<u8> {
        // Unlink while the header still holds the size the block was
        // indexed under.
        self.bins.remove(found);

        let leftover = BlockHeader::size(found) - block_size;

        if leftover >= SPLIT_MIN {
            BlockHeader::set_size(found, block_size);
            BlockHeader::set_allocated(found);

            // The remainder becomes a free block of its own, losing one
            // header worth of bytes to its new header.
            let remainder_size = leftover - HEADER_SIZE;
            let remainder = block::next_header(found);
            BlockHeader::initialize(remainder, remainder_size);
            BlockHeader::set_prev_allocated(remainder);
            BlockHeader::initialize(block::footer_of(remainder), remainder_size);

            self.bins.insert(remainder);

            // The successor of the original block doesn't need a P
            // update: its predecessor was free before the split and the
            // remainder still is.
            if found == self.last_header {
                self.last_header = remainder;
            }
        } else {
            BlockHeader::set_allocated(found);

            if found != self.last_header {
                BlockHeader::set_prev_allocated(block::next_header(found));
            }
        }

        block::payload_of(found)
    }

    /// Allocation fallback when no free block fits: asks the provider for
    /// header plus payload and appends the new block at the top of the
    /// heap. Returns `None` untouched if the provider refuses.
    unsafe fn extend_heap(&mut self, block_size: usize) -> Pointer<u8> {
        let length = HEADER_SIZE.checked_add(block_size)?;
        let header = self.provider.extend(length)?.cast::<BlockHeader>();

        BlockHeader::initialize(header, block_size);
        BlockHeader::set_allocated(header);

        // The old last block is our predecessor. While the heap holds no
        // blocks, `last_header` is the prologue, which reads as allocated
        // just like a real allocated neighbor would.
        if !BlockHeader::is_free(self.last_header) {
            BlockHeader::set_prev_allocated(header);
        }

        self.last_header = header;

        Some(block::payload_of(header))
    }

    /// Release case: both neighbors free. The predecessor absorbs this
    /// block, the successor, and the two header words between them.
    unsafe fn coalesce_both(&mut self, header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let next = block::next_header(header);
        let previous = block::previous_header(header);

        let merged = BlockHeader::size(previous)
            + BlockHeader::size(header)
            + BlockHeader::size(next)
            + 2 * HEADER_SIZE;

        // The successor's footer becomes the footer of the merged block;
        // locate it before any size changes.
        let merged_footer = block::footer_of(next);

        // Unlink both while their headers still hold their indexed sizes.
        self.bins.remove(previous);
        self.bins.remove(next);

        BlockHeader::set_size(previous, merged);
        BlockHeader::initialize(merged_footer, merged);

        if next == self.last_header {
            self.last_header = previous;
        }

        previous
    }

    /// Release case: only the successor is free. This block absorbs it
    /// and its header word.
    unsafe fn coalesce_next(&mut self, header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let next = block::next_header(header);

        let merged = BlockHeader::size(header) + BlockHeader::size(next) + HEADER_SIZE;
        let merged_footer = block::footer_of(next);

        self.bins.remove(next);

        BlockHeader::set_size(header, merged);
        BlockHeader::set_free(header);
        BlockHeader::initialize(merged_footer, merged);

        if next == self.last_header {
            self.last_header = header;
        }

        header
    }

    /// Release case: only the predecessor is free. It absorbs this block
    /// and its header word; this block's own footer position becomes the
    /// merged footer.
    unsafe fn coalesce_previous(&mut self, header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let previous = block::previous_header(header);

        let merged = BlockHeader::size(previous) + BlockHeader::size(header) + HEADER_SIZE;
        let merged_footer = block::footer_of(header);

        self.bins.remove(previous);

        BlockHeader::set_size(previous, merged);
        BlockHeader::initialize(merged_footer, merged);

        if header == self.last_header {
            self.last_header = previous;
        } else {
            BlockHeader::set_prev_free(block::next_header(header));
        }

        previous
    }

    /// Release case: no free neighbors. The block just gains a footer and
    /// clears its allocated bit.
    unsafe fn mark_free(&mut self, header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        BlockHeader::initialize(block::footer_of(header), BlockHeader::size(header));
        BlockHeader::set_free(header);

        if header != self.last_header {
            BlockHeader::set_prev_free(block::next_header(header));
        }

        header
    }

    #[cfg(feature = "debug-checks")]
    fn assert_consistent(&self) {
        if let Err(error) = self.check() {
            panic!("heap invariant violated: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bins::Bins, provider::VirtualHeap};

    fn allocator(capacity: usize) -> Segalloc<VirtualHeap> {
        Segalloc::new(VirtualHeap::with_capacity(capacity).unwrap()).unwrap()
    }

    /// Payload address of the head of one free list, for asserting which
    /// block sits where.
    fn head_of(allocator: &Segalloc<VirtualHeap>, index: usize) -> Option<*mut u8> {
        allocator
            .bins
            .list(index)
            .head()
            .map(|node| node.as_ptr().cast())
    }

    #[test]
    fn empty_request_returns_null() {
        let mut allocator = allocator(1 << 16);

        assert_eq!(allocator.allocate(0), None);
        allocator.check().unwrap();
    }

    #[test]
    fn absurd_requests_fail_cleanly() {
        let mut allocator = allocator(1 << 16);

        // Sizes this close to the address space limit can't even be
        // quantized, let alone extended into.
        assert_eq!(allocator.allocate(usize::MAX), None);
        assert_eq!(allocator.allocate(usize::MAX - 8), None);
        allocator.check().unwrap();
    }

    #[test]
    fn payloads_are_aligned_and_disjoint() {
        let mut allocator = allocator(1 << 20);
        let mut payloads = Vec::new();

        for size in [1, 8, 24, 25, 100, 500, 4096] {
            let payload = allocator.allocate(size).unwrap();
            assert_eq!(payload.as_ptr() as usize % 16, 0);

            unsafe { payload.as_ptr().write_bytes(payloads.len() as u8, size) };
            payloads.push((payload, size));
            allocator.check().unwrap();
        }

        // No allocation clobbered an earlier one.
        for (expected, (payload, size)) in payloads.iter().enumerate() {
            for offset in 0..*size {
                assert_eq!(unsafe { *payload.as_ptr().add(offset) }, expected as u8);
            }
        }

        for (payload, _) in payloads {
            unsafe { allocator.deallocate(payload.as_ptr()) };
            allocator.check().unwrap();
        }
    }

    #[test]
    fn extension_leaves_free_lists_alone() {
        let mut allocator = allocator(1 << 20);

        let first = allocator.allocate(24).unwrap();
        let _second = allocator.allocate(24).unwrap();

        unsafe { allocator.deallocate(first.as_ptr()) };
        assert_eq!(head_of(&allocator, 0), Some(first.as_ptr()));

        // 2048 maps to a much higher class whose lists are empty, so this
        // must extend the heap and leave the small free block alone.
        let big = allocator.allocate(2048).unwrap();
        assert_ne!(big, first);

        assert_eq!(allocator.bins.list(0).len(), 1);
        assert_eq!(head_of(&allocator, 0), Some(first.as_ptr()));
        allocator.check().unwrap();
    }

    #[test]
    fn release_coalesces_both_neighbors() {
        let mut allocator = allocator(1 << 20);

        let a = allocator.allocate(40).unwrap();
        let b = allocator.allocate(40).unwrap();
        let c = allocator.allocate(40).unwrap();
        let d = allocator.allocate(40).unwrap();

        unsafe {
            allocator.deallocate(a.as_ptr());
            allocator.deallocate(c.as_ptr());
        }

        // Two isolated free blocks of 40 bytes so far.
        assert_eq!(allocator.bins.list(1).len(), 2);
        allocator.check().unwrap();

        // Releasing b bridges them: 40 + 40 + 40 plus the two header
        // words of b and c.
        unsafe { allocator.deallocate(b.as_ptr()) };

        assert_eq!(allocator.bins.list(1).len(), 0);
        assert_eq!(allocator.bins.total_free(), 1);
        assert_eq!(Bins::index_of(136), 5);
        assert_eq!(allocator.bins.list(5).len(), 1);
        assert_eq!(head_of(&allocator, 5), Some(a.as_ptr()));

        unsafe {
            let merged = block::header_of(NonNull::new_unchecked(a.as_ptr()));
            assert_eq!(BlockHeader::size(merged), 136);
            assert!(BlockHeader::is_free(merged));
        }

        allocator.check().unwrap();

        // d is still live and untouched by the merging.
        unsafe { allocator.deallocate(d.as_ptr()) };
        allocator.check().unwrap();
    }

    #[test]
    fn reuse_splits_large_blocks() {
        let mut allocator = allocator(1 << 20);

        let big = allocator.allocate(200).unwrap();
        unsafe { allocator.deallocate(big.as_ptr()) };
        assert_eq!(allocator.bins.list(6).len(), 1);

        // 40 bytes out of a 200 byte block: 40 allocated, one header
        // spent, 152 left over as a new free block in class 6.
        let small = allocator.allocate(40).unwrap();
        assert_eq!(small, big);

        assert_eq!(allocator.bins.total_free(), 1);
        assert_eq!(allocator.bins.list(6).len(), 1);

        unsafe {
            let remainder = FreeNode::block_of(allocator.bins.list(6).head().unwrap());
            assert_eq!(BlockHeader::size(remainder), 152);

            // The remainder is now the last block in the heap.
            assert_eq!(remainder, allocator.last_header);
        }

        allocator.check().unwrap();

        unsafe { allocator.deallocate(small.as_ptr()) };
        allocator.check().unwrap();
    }

    #[test]
    fn round_trip_restores_the_free_lists() {
        let mut allocator = allocator(1 << 20);

        let recycled = allocator.allocate(100).unwrap();
        // A guard allocation so the block below never touches the heap
        // edge.
        let guard = allocator.allocate(24).unwrap();
        unsafe { allocator.deallocate(recycled.as_ptr()) };

        let lens_before: Vec<usize> = (0..BIN_COUNT)
            .map(|index| allocator.bins.list(index).len())
            .collect();
        let last_before = allocator.last_header;

        // 100 quantizes to the exact size of the freed block, so the
        // allocation consumes it whole and the release puts it back.
        let payload = allocator.allocate(100).unwrap();
        assert_eq!(payload, recycled);
        unsafe { allocator.deallocate(payload.as_ptr()) };

        let lens_after: Vec<usize> = (0..BIN_COUNT)
            .map(|index| allocator.bins.list(index).len())
            .collect();

        assert_eq!(lens_before, lens_after);
        assert_eq!(allocator.last_header, last_before);
        assert_eq!(head_of(&allocator, Bins::index_of(104)), Some(recycled.as_ptr()));
        allocator.check().unwrap();

        unsafe { allocator.deallocate(guard.as_ptr()) };
        allocator.check().unwrap();
    }

    #[test]
    fn reallocate_grows_preserving_contents() {
        let mut allocator = allocator(1 << 20);

        let old = allocator.allocate(24).unwrap();
        unsafe { old.as_ptr().write_bytes(0xAB, 24) };

        let new = unsafe { allocator.reallocate(old.as_ptr(), 100).unwrap() };

        for offset in 0..24 {
            assert_eq!(unsafe { *new.as_ptr().add(offset) }, 0xAB);
        }

        // The old block was released while the new one is live.
        unsafe {
            let old_header = block::header_of(old);
            assert!(BlockHeader::is_free(old_header));
        }
        allocator.check().unwrap();

        unsafe { allocator.deallocate(new.as_ptr()) };
        allocator.check().unwrap();
    }

    #[test]
    fn reallocate_shrinks_preserving_prefix() {
        let mut allocator = allocator(1 << 20);

        let old = allocator.allocate(100).unwrap();
        for offset in 0..100 {
            unsafe { *old.as_ptr().add(offset) = offset as u8 };
        }

        let new = unsafe { allocator.reallocate(old.as_ptr(), 16).unwrap() };

        for offset in 0..16 {
            assert_eq!(unsafe { *new.as_ptr().add(offset) }, offset as u8);
        }
        allocator.check().unwrap();

        unsafe { allocator.deallocate(new.as_ptr()) };
        allocator.check().unwrap();
    }

    #[test]
    fn reallocate_edge_cases() {
        let mut allocator = allocator(1 << 20);

        unsafe {
            // Null address behaves like a plain allocation.
            let payload = allocator.reallocate(ptr::null_mut(), 48).unwrap();
            allocator.check().unwrap();

            // Zero size behaves like a release.
            assert_eq!(allocator.reallocate(payload.as_ptr(), 0), None);
            assert_eq!(allocator.bins.total_free(), 1);
            allocator.check().unwrap();
        }
    }

    #[test]
    fn allocate_zeroed_zeroes_and_checks_overflow() {
        let mut allocator = allocator(1 << 20);

        let payload = allocator.allocate_zeroed(16, 32).unwrap();
        for offset in 0..16 * 32 {
            assert_eq!(unsafe { *payload.as_ptr().add(offset) }, 0);
        }
        allocator.check().unwrap();

        assert_eq!(allocator.allocate_zeroed(usize::MAX, 2), None);
        allocator.check().unwrap();

        unsafe { allocator.deallocate(payload.as_ptr()) };
    }

    #[test]
    fn foreign_and_null_releases_are_ignored() {
        let mut allocator = allocator(1 << 16);

        let payload = allocator.allocate(40).unwrap();

        unsafe {
            allocator.deallocate(ptr::null_mut());

            // A pointer that was never ours.
            let mut local = 0u8;
            allocator.deallocate(&mut local);
        }

        // The allocation is still intact and the heap consistent.
        assert_eq!(allocator.bins.total_free(), 0);
        allocator.check().unwrap();

        unsafe { allocator.deallocate(payload.as_ptr()) };
        allocator.check().unwrap();
    }

    #[test]
    fn exhaustion_is_clean_and_recoverable() {
        // Tiny heap: a few blocks fit, then the provider refuses.
        let mut allocator = allocator(4096);
        let mut payloads = Vec::new();

        loop {
            match allocator.allocate(128) {
                Some(payload) => payloads.push(payload),
                None => break,
            }
            allocator.check().unwrap();
        }

        assert!(!payloads.is_empty());
        allocator.check().unwrap();

        // Out of memory is sticky for this size but harmless.
        assert_eq!(allocator.allocate(128), None);
        allocator.check().unwrap();

        // Releases still coalesce: freeing bottom-up merges everything
        // into a single block.
        for payload in &payloads {
            unsafe { allocator.deallocate(payload.as_ptr()) };
            allocator.check().unwrap();
        }
        assert_eq!(allocator.bins.total_free(), 1);

        // And that block satisfies new requests without growing the heap.
        let recycled = allocator.allocate(128).unwrap();
        assert_eq!(recycled, payloads[0]);
        allocator.check().unwrap();
    }

    #[test]
    fn tail_block_split_moves_last_header() {
        let mut allocator = allocator(1 << 20);

        // One big block at the heap edge, freed, then partially reused:
        // the remainder inherits the last-block role.
        let big = allocator.allocate(500).unwrap();
        unsafe { allocator.deallocate(big.as_ptr()) };

        let small = allocator.allocate(24).unwrap();
        assert_eq!(small, big);

        unsafe {
            let small_header = block::header_of(NonNull::new_unchecked(small.as_ptr()));
            assert_ne!(small_header, allocator.last_header);
            assert_eq!(block::next_header(small_header), allocator.last_header);
        }

        allocator.check().unwrap();
    }

    #[test]
    fn interleaved_workload_stays_consistent() {
        let mut allocator = allocator(1 << 20);
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        // A deterministic mixed workload: batches of allocations with
        // every other live block freed in between, audits throughout.
        for round in 0..6 {
            for step in 0..8 {
                let size = 16 + (round * 8 + step) * 24 % 600;
                let payload = allocator.allocate(size).unwrap();
                unsafe { payload.as_ptr().write_bytes(step as u8, size) };
                live.push((payload, size));
            }
            allocator.check().unwrap();

            // Free every other live allocation, oldest first.
            let mut index = 0;
            live.retain(|(payload, _)| {
                index += 1;
                if index % 2 == 0 {
                    unsafe { allocator.deallocate(payload.as_ptr()) };
                    false
                } else {
                    true
                }
            });
            allocator.check().unwrap();
        }

        // Whatever survived still holds its fill pattern in byte 0.
        for (payload, _) in &live {
            let _ = unsafe { *payload.as_ptr() };
        }

        for (payload, _) in live {
            unsafe { allocator.deallocate(payload.as_ptr()) };
        }
        allocator.check().unwrap();
        assert_eq!(allocator.bins.total_free(), 1);
    }
}
