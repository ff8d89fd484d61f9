use std::ptr::NonNull;

use crate::{
    arena::StringAllocator,
    freelist::{FREE_LIST_SIZES, NUM_FREE_LISTS},
    header::{Header, HEADER_SIZE},
    list::CompactDoubleList,
};

impl StringAllocator {
    /// Full sweep over every slab and every free list, cross-checking the
    /// in-band metadata against the maintained totals. Used by tests after
    /// every interesting operation and available to debug builds of the
    /// engine. Any mismatch is fatal.
    pub fn check_consistency(&self) {
        assert_eq!(
            self.pool.num_large_allocations(),
            self.standalone.len(),
            "oversized map and pool bookkeeping disagree"
        );

        let mut num_free = 0;
        let mut free_bytes = 0;
        for i in 0..self.pool.num_small_allocations() {
            let run = self.pool.allocation_at(i);
            let size = run.bytes() - HEADER_SIZE;
            unsafe {
                let start = run.data();
                let end = start.add(size);
                let mut header = NonNull::new_unchecked(start.cast::<Header>());
                let mut previous_free = false;
                while header.as_ptr() != end.cast() {
                    assert!(header.as_ptr().cast::<u8>() >= start);
                    assert!(header.as_ptr().cast::<u8>() < end);
                    assert!(
                        Header::end_of(header) <= end,
                        "block runs past the end of its slab"
                    );
                    assert_eq!(
                        header.as_ref().is_previous_free(),
                        previous_free,
                        "previous-free tag out of sync with the left neighbor"
                    );

                    if header.as_ref().is_free() {
                        assert!(!previous_free, "two adjacent free blocks");
                        assert!(
                            !header.as_ref().is_continued(),
                            "free block marked continued"
                        );
                        if Header::next_of(header).is_some() {
                            let trailer = *Header::end_of(header).cast::<u32>().sub(1);
                            assert_eq!(
                                trailer as usize,
                                header.as_ref().size(),
                                "free size trailer does not match the header"
                            );
                        }
                        num_free += 1;
                        free_bytes += HEADER_SIZE + header.as_ref().size();
                    } else if header.as_ref().is_continued() {
                        let continued = Header::next_continued_of(header);
                        assert!(
                            !continued.as_ref().is_free(),
                            "continuation target is a free block"
                        );
                    }

                    previous_free = header.as_ref().is_free();
                    header = NonNull::new_unchecked(Header::end_of(header).cast());
                }
            }
        }
        assert_eq!(num_free, self.num_free, "free block count drifted");
        assert_eq!(free_bytes, self.free_bytes, "free byte count drifted");

        let mut in_lists = 0;
        let mut bytes_in_lists = 0;
        for index in 0..NUM_FREE_LISTS {
            let sentinel: *const CompactDoubleList = &self.free[index];
            unsafe {
                assert_eq!(
                    self.free_non_empty & (1 << index) != 0,
                    !CompactDoubleList::is_empty(sentinel),
                    "non-empty bitmap out of sync with list {index}"
                );
                let mut entry = CompactDoubleList::next(sentinel);
                while entry.cast_const() != sentinel {
                    let header = CompactDoubleList::header_of(entry);
                    let size = header.as_ref().size();
                    if index > 0 {
                        assert!(
                            size as i32 >= FREE_LIST_SIZES[index - 1],
                            "block of {size} bytes is too small for list {index}"
                        );
                    }
                    assert!(
                        (size as i32) < FREE_LIST_SIZES[index],
                        "block of {size} bytes is too large for list {index}"
                    );
                    in_lists += 1;
                    bytes_in_lists += size + HEADER_SIZE;
                    entry = CompactDoubleList::next(entry);
                }
            }
        }
        assert_eq!(in_lists, self.num_free, "free lists lost or gained blocks");
        assert_eq!(bytes_in_lists, self.free_bytes, "free list bytes drifted");
    }
}
