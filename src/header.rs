use std::ptr::NonNull;

/// The per-block metadata word. Headers and footers are both instances of
/// this type, they only differ in where they sit relative to the payload.
///
/// Block sizes are always multiples of 8, so the low three bits of the
/// size are free to carry status flags:
///
/// ```text
/// 63                                    3   2   1   0
/// +-------------------------------------+---+---+---+
/// |         payload size in bytes       | 0 | P | A |
/// +-------------------------------------+---+---+---+
/// ```
///
/// - `A`: this block is allocated.
/// - `P`: the block immediately before this one is allocated.
/// - Bit 2 is reserved and always zero.
///
/// The `P` bit is what makes backwards coalescing cheap: a release only
/// needs to look at the footer of its predecessor when `P` says the
/// predecessor is actually free, and free blocks are the only ones that
/// have footers.
///
/// All reads and writes go through the accessors below so that a flag
/// update can never clobber the size and vice versa.
///
/// # Notes
///
/// Accessors take `NonNull<Self>` instead of `&self`/`&mut self` because
/// header words live inside the raw heap region, right next to memory the
/// caller owns. Going through raw pointers avoids materializing references
/// into that region and keeps Miri's Stacked Borrows analysis happy.
#[repr(transparent)]
pub(crate) struct BlockHeader(u64);

impl BlockHeader {
    /// `A` bit.
    const ALLOCATED: u64 = 1 << 0;

    /// `P` bit.
    const PREV_ALLOCATED: u64 = 1 << 1;

    /// Everything except the three flag bits.
    const SIZE_MASK: u64 = !0b111;

    /// Writes a brand new word at `header`: the given size, all flags
    /// clear. Used both for headers of new blocks and for footers, which
    /// never carry a meaningful `P` bit.
    #[inline]
    pub unsafe fn initialize(header: NonNull<Self>, size: usize) {
        debug_assert_eq!(size % 8, 0);
        header.as_ptr().write(BlockHeader(size as u64));
    }

    /// Payload size stored in this word.
    #[inline]
    pub unsafe fn size(header: NonNull<Self>) -> usize {
        ((*header.as_ptr()).0 & Self::SIZE_MASK) as usize
    }

    /// Overwrites the size, preserving both flags.
    #[inline]
    pub unsafe fn set_size(header: NonNull<Self>, size: usize) {
        debug_assert_eq!(size % 8, 0);
        let word = header.as_ptr();
        (*word).0 = ((*word).0 & !Self::SIZE_MASK) | size as u64;
    }

    #[inline]
    pub unsafe fn is_free(header: NonNull<Self>) -> bool {
        (*header.as_ptr()).0 & Self::ALLOCATED == 0
    }

    #[inline]
    pub unsafe fn set_allocated(header: NonNull<Self>) {
        (*header.as_ptr()).0 |= Self::ALLOCATED;
    }

    #[inline]
    pub unsafe fn set_free(header: NonNull<Self>) {
        (*header.as_ptr()).0 &= !Self::ALLOCATED;
    }

    #[inline]
    pub unsafe fn is_prev_free(header: NonNull<Self>) -> bool {
        (*header.as_ptr()).0 & Self::PREV_ALLOCATED == 0
    }

    #[inline]
    pub unsafe fn set_prev_allocated(header: NonNull<Self>) {
        (*header.as_ptr()).0 |= Self::PREV_ALLOCATED;
    }

    #[inline]
    pub unsafe fn set_prev_free(header: NonNull<Self>) {
        (*header.as_ptr()).0 &= !Self::PREV_ALLOCATED;
    }
}
