use std::{mem, ptr::NonNull};

use crate::{freelist::FreeNode, header::BlockHeader};

/// Block header size in bytes. See [`BlockHeader`].
pub(crate) const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Footer size in bytes. The footer is just a second [`BlockHeader`] word
/// at the other end of the payload, present on free blocks only.
pub(crate) const FOOTER_SIZE: usize = HEADER_SIZE;

/// Alignment of every payload pointer handed to the caller. Guaranteed by
/// construction: the heap base is page aligned, the prologue word pushes
/// the first header to offset 8, and every block stride (header plus
/// payload) is a multiple of 16.
pub(crate) const PAYLOAD_ALIGN: usize = 16;

/// Minimum payload size in bytes. A free payload has to hold its two list
/// links plus the footer, and 24 also happens to be the smallest size that
/// keeps block strides 16 byte aligned.
pub(crate) const MIN_PAYLOAD_SIZE: usize = mem::size_of::<FreeNode>() + FOOTER_SIZE;

/// Smallest leftover worth splitting off a block: a header plus the
/// minimum payload. Anything smaller stays with the allocation as internal
/// padding.
pub(crate) const SPLIT_MIN: usize = HEADER_SIZE + MIN_PAYLOAD_SIZE;

/// Rounds a requested size up to the nearest admissible payload size, that
/// is, the set `{24, 40, 56, ...}`. Requests at or below the minimum all
/// collapse to 24; everything else rounds the excess over 24 up to a
/// multiple of 16. Returns `None` when the rounded size would not fit in
/// a `usize`, which turns absurd requests into a plain allocation failure.
#[inline]
pub(crate) fn payload_size_for(requested: usize) -> Option<usize> {
    if requested <= MIN_PAYLOAD_SIZE {
        Some(MIN_PAYLOAD_SIZE)
    } else {
        // The rounding itself cannot wrap: `requested - 24 + 15` stays
        // below `requested`.
        align(requested - MIN_PAYLOAD_SIZE).checked_add(MIN_PAYLOAD_SIZE)
    }
}

/// Rounds up to the nearest multiple of [`PAYLOAD_ALIGN`].
#[inline]
fn align(size: usize) -> usize {
    (size + PAYLOAD_ALIGN - 1) & !(PAYLOAD_ALIGN - 1)
}

/// Moves a header pointer by `offset` bytes. All the walker functions
/// below are byte arithmetic over 8 byte words, this is the one place
/// where the casting happens.
#[inline]
unsafe fn byte_offset(header: NonNull<BlockHeader>, offset: isize) -> NonNull<BlockHeader> {
    NonNull::new_unchecked(header.as_ptr().cast::<u8>().offset(offset)).cast()
}

/// Returns the payload address of a block.
///
/// ```text
/// +-------------+
/// |   Header    | <- Given address points here.
/// +-------------+
/// |   Payload   | <- Returned address points here.
/// +-------------+
/// |     ...     |
/// +-------------+
/// ```
#[inline]
pub(crate) unsafe fn payload_of(header: NonNull<BlockHeader>) -> NonNull<u8> {
    byte_offset(header, HEADER_SIZE as isize).cast()
}

/// Returns the header of the block whose payload starts at `payload`.
/// Inverse of [`payload_of`].
///
/// # Safety
///
/// `payload` must point exactly to the first byte after a valid header.
/// This is mostly used on addresses the caller got from us in the first
/// place, so as long as they hand back what we gave out, this is fine.
#[inline]
pub(crate) unsafe fn header_of(payload: NonNull<u8>) -> NonNull<BlockHeader> {
    byte_offset(payload.cast(), -(HEADER_SIZE as isize))
}

/// Returns the footer position of a block: the last word of its payload.
/// Only meaningful on free blocks, allocated blocks don't maintain one.
#[inline]
pub(crate) unsafe fn footer_of(header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    byte_offset(
        header,
        (HEADER_SIZE + BlockHeader::size(header) - FOOTER_SIZE) as isize,
    )
}

/// Returns the header of the next adjacent block. The caller is in charge
/// of knowing whether there *is* a next block, headers carry no terminator
/// on their own.
#[inline]
pub(crate) unsafe fn next_header(header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    byte_offset(header, (HEADER_SIZE + BlockHeader::size(header)) as isize)
}

/// Returns the footer of the previous adjacent block, which is the word
/// right before this header. Usable only when the previous block is known
/// to be free, otherwise that word belongs to the neighbor's payload.
#[inline]
pub(crate) unsafe fn previous_footer(header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    byte_offset(header, -(FOOTER_SIZE as isize))
}

/// Returns the header of the previous adjacent block by reading its size
/// out of its footer. Same caveat as [`previous_footer`]: the previous
/// block must be free.
#[inline]
pub(crate) unsafe fn previous_header(header: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    let previous_size = BlockHeader::size(previous_footer(header));
    byte_offset(header, -((HEADER_SIZE + previous_size) as isize))
}
