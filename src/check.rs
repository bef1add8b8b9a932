use std::{error::Error, fmt, ptr::NonNull};

use crate::{
    allocator::Segalloc,
    bins::{Bins, BIN_COUNT},
    block::{self, HEADER_SIZE, MIN_PAYLOAD_SIZE, PAYLOAD_ALIGN},
    freelist::FreeNode,
    header::BlockHeader,
    provider::HeapProvider,
};

/// A violated heap invariant, found by [`Segalloc::check`]. Addresses are
/// reported as plain integers: they identify the offending header in a
/// debugger or log, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// A block's size is below the minimum or not of the form `24 + 16k`.
    UnlawfulSize { header: usize, size: usize },
    /// A payload address is not 16 byte aligned.
    MisalignedPayload { header: usize },
    /// A free block's footer disagrees with its header about the size.
    FooterMismatch {
        header: usize,
        header_size: usize,
        footer_size: usize,
    },
    /// Two adjacent blocks are both free, so a coalesce was missed.
    AdjacentFreeBlocks { first: usize, second: usize },
    /// A block's P bit contradicts the allocation state of its
    /// predecessor.
    StalePrevTag { header: usize, next: usize },
    /// Walking the blocks did not end exactly at the high heap bound.
    UntiledHeap { expected_end: usize, actual_end: usize },
    /// A free block is missing from the list its size selects.
    NotInFreeList { header: usize, index: usize },
    /// A listed block is not marked free.
    AllocatedInFreeList { header: usize, index: usize },
    /// A listed block's size selects a different list.
    WrongFreeList { header: usize, index: usize },
    /// The lists hold a different number of blocks than the heap walk
    /// found free.
    FreeCountMismatch { walked: usize, listed: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnlawfulSize { header, size } => {
                write!(f, "block at {header:#x} has unlawful size {size}")
            }
            Self::MisalignedPayload { header } => {
                write!(f, "block at {header:#x} has a misaligned payload")
            }
            Self::FooterMismatch {
                header,
                header_size,
                footer_size,
            } => write!(
                f,
                "free block at {header:#x} has header size {header_size} but footer size {footer_size}"
            ),
            Self::AdjacentFreeBlocks { first, second } => write!(
                f,
                "adjacent free blocks at {first:#x} and {second:#x} escaped coalescing"
            ),
            Self::StalePrevTag { header, next } => write!(
                f,
                "block at {next:#x} disagrees about the allocation state of {header:#x}"
            ),
            Self::UntiledHeap {
                expected_end,
                actual_end,
            } => write!(
                f,
                "heap walk ended at {actual_end:#x} instead of {expected_end:#x}"
            ),
            Self::NotInFreeList { header, index } => {
                write!(f, "free block at {header:#x} is not in list {index}")
            }
            Self::AllocatedInFreeList { header, index } => write!(
                f,
                "list {index} contains the allocated block at {header:#x}"
            ),
            Self::WrongFreeList { header, index } => {
                write!(f, "block at {header:#x} is linked into the wrong list {index}")
            }
            Self::FreeCountMismatch { walked, listed } => write!(
                f,
                "heap walk found {walked} free blocks but the lists hold {listed}"
            ),
        }
    }
}

impl Error for CheckError {}

impl<P: HeapProvider> Segalloc<P> {
    /// Audits the whole heap: walks every block verifying sizes,
    /// alignment, boundary tags and coalescing, then sweeps all free
    /// lists verifying membership in both directions. Runs in time linear
    /// in the number of blocks (quadratic in free blocks, because
    /// membership is checked by scanning). Meant for tests and debugging,
    /// not for production call paths.
    pub fn check(&self) -> Result<(), CheckError> {
        let high = self.provider.high().as_ptr() as usize;

        let mut walked_free = 0;

        unsafe {
            if self.last_header == self.prologue() {
                // Empty heap: just the prologue word, nothing to walk.
                let expected_end = self.prologue().as_ptr() as usize + HEADER_SIZE;
                if high != expected_end {
                    return Err(CheckError::UntiledHeap {
                        expected_end,
                        actual_end: high,
                    });
                }
            } else {
                // The prologue has size zero, so the generic walker steps
                // from it straight onto the first real block.
                let mut header = block::next_header(self.prologue());

                loop {
                    self.check_block(header, &mut walked_free)?;

                    if header == self.last_header {
                        let end = block::next_header(header).as_ptr() as usize;
                        if end != high {
                            return Err(CheckError::UntiledHeap {
                                expected_end: high,
                                actual_end: end,
                            });
                        }
                        break;
                    }

                    let next = block::next_header(header);

                    // The successor's P bit must mirror this block's
                    // allocation state.
                    if BlockHeader::is_prev_free(next) != BlockHeader::is_free(header) {
                        return Err(CheckError::StalePrevTag {
                            header: header.as_ptr() as usize,
                            next: next.as_ptr() as usize,
                        });
                    }

                    if BlockHeader::is_free(header) && BlockHeader::is_free(next) {
                        return Err(CheckError::AdjacentFreeBlocks {
                            first: header.as_ptr() as usize,
                            second: next.as_ptr() as usize,
                        });
                    }

                    header = next;
                }
            }

            self.check_lists(walked_free)
        }
    }

    /// Per-block rules: lawful size, aligned payload, and for free blocks
    /// footer agreement plus membership in the right list.
    unsafe fn check_block(
        &self,
        header: NonNull<BlockHeader>,
        walked_free: &mut usize,
    ) -> Result<(), CheckError> {
        let address = header.as_ptr() as usize;
        let size = BlockHeader::size(header);

        if size < MIN_PAYLOAD_SIZE || (size - HEADER_SIZE) % 16 != 0 {
            return Err(CheckError::UnlawfulSize {
                header: address,
                size,
            });
        }

        if block::payload_of(header).as_ptr() as usize % PAYLOAD_ALIGN != 0 {
            return Err(CheckError::MisalignedPayload { header: address });
        }

        if BlockHeader::is_free(header) {
            *walked_free += 1;

            let footer_size = BlockHeader::size(block::footer_of(header));
            if footer_size != size {
                return Err(CheckError::FooterMismatch {
                    header: address,
                    header_size: size,
                    footer_size,
                });
            }

            let index = Bins::index_of(size);
            let node = FreeNode::of_block(header);
            if !self.bins.list(index).iter().any(|linked| linked == node) {
                return Err(CheckError::NotInFreeList {
                    header: address,
                    index,
                });
            }
        }

        Ok(())
    }

    /// Reverse direction of the membership rule: everything the lists
    /// hold is free, correctly classed, and nothing is listed twice
    /// (guaranteed by comparing counts against the heap walk). Walking
    /// the links also cross-checks the length bookkeeping of each list.
    unsafe fn check_lists(&self, walked_free: usize) -> Result<(), CheckError> {
        let mut listed = 0;

        for index in 0..BIN_COUNT {
            let mut linked = 0;

            for node in self.bins.list(index).iter() {
                linked += 1;

                let header = FreeNode::block_of(node);
                let address = header.as_ptr() as usize;

                if !BlockHeader::is_free(header) {
                    return Err(CheckError::AllocatedInFreeList {
                        header: address,
                        index,
                    });
                }

                if Bins::index_of(BlockHeader::size(header)) != index {
                    return Err(CheckError::WrongFreeList {
                        header: address,
                        index,
                    });
                }
            }

            debug_assert_eq!(linked, self.bins.list(index).len());
            listed += linked;
        }

        if listed != walked_free {
            return Err(CheckError::FreeCountMismatch {
                walked: walked_free,
                listed,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::VirtualHeap;

    fn allocator() -> Segalloc<VirtualHeap> {
        Segalloc::new(VirtualHeap::with_capacity(1 << 16).unwrap()).unwrap()
    }

    #[test]
    fn fresh_heap_is_consistent() {
        let allocator = allocator();
        allocator.check().unwrap();
    }

    #[test]
    fn detects_footer_corruption() {
        let mut allocator = allocator();

        let payload = allocator.allocate(40).unwrap();
        let _guard = allocator.allocate(24).unwrap();
        unsafe { allocator.deallocate(payload.as_ptr()) };
        allocator.check().unwrap();

        unsafe {
            // Smash the free block's footer size.
            let header = block::header_of(payload);
            let footer = block::footer_of(header);
            BlockHeader::set_size(footer, 56);
        }

        assert!(matches!(
            allocator.check(),
            Err(CheckError::FooterMismatch { .. })
        ));
    }

    #[test]
    fn detects_stale_prev_tag() {
        let mut allocator = allocator();

        let first = allocator.allocate(40).unwrap();
        let second = allocator.allocate(40).unwrap();

        unsafe {
            // Claim the first block's successor has a free predecessor
            // even though the first block is allocated.
            let second_header = block::header_of(second);
            BlockHeader::set_prev_free(second_header);
        }

        assert!(matches!(
            allocator.check(),
            Err(CheckError::StalePrevTag { .. })
        ));

        unsafe {
            // Restore and confirm the audit passes again.
            let second_header = block::header_of(second);
            BlockHeader::set_prev_allocated(second_header);
        }
        allocator.check().unwrap();

        let _ = first;
    }

    #[test]
    fn detects_unlisted_free_block() {
        let mut allocator = allocator();

        let payload = allocator.allocate(40).unwrap();
        let _guard = allocator.allocate(24).unwrap();

        unsafe {
            // Mark the block free behind the allocator's back: it gains a
            // valid footer but never enters a list.
            let header = block::header_of(payload);
            BlockHeader::initialize(block::footer_of(header), BlockHeader::size(header));
            BlockHeader::set_free(header);
            BlockHeader::set_prev_free(block::next_header(header));
        }

        let result = allocator.check();
        assert!(
            matches!(result, Err(CheckError::NotInFreeList { .. })),
            "unexpected audit result: {result:?}"
        );
    }
}
