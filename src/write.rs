use std::{ptr, ptr::NonNull};

use crate::{
    arena::StringAllocator,
    header::{Header, WORD_SIZE},
    stream::{ByteOutputStream, ByteRange},
};

/// A location inside a logical byte sequence: the block holding it and the
/// exact byte within that block's payload. Returned by the write operations
/// so callers can come back later to [`StringAllocator::extend_write`] or
/// [`StringAllocator::seek`] from it.
///
/// Positions have reference semantics. They do not keep the block alive: once
/// the chain is freed, every position into it dangles, and using one is
/// undefined behaviour. That mirrors how the engine uses them: positions are
/// stored next to the rows they describe and die with the same table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub header: NonNull<Header>,
    pub position: NonNull<u8>,
}

impl StringAllocator {
    /// Starts a new logical write. Allocates a best-effort block of around
    /// `preferred_size` bytes and points `stream` at its whole payload.
    /// Returns the position of the first byte, which identifies the chain
    /// from now on.
    ///
    /// Only one write may be in flight; starting a second one before
    /// [`StringAllocator::finish_write`] is fatal.
    pub fn new_write(
        &mut self,
        stream: &mut ByteOutputStream,
        preferred_size: usize,
    ) -> Position {
        assert!(
            self.current_header.is_none(),
            "starting a write while another one is in progress"
        );
        let header = self.allocate(preferred_size, false);
        self.current_header = Some(header);

        unsafe {
            let begin = Header::begin_of(header);
            stream.set_range(ByteRange {
                buffer: begin,
                size: header.as_ref().size(),
                position: 0,
            });
            Position {
                header,
                position: NonNull::new_unchecked(begin),
            }
        }
    }

    /// Resumes writing at `position`, overwriting from there on. If the block
    /// had a continuation chain hanging off it, that chain is freed first; a
    /// new one grows if this write runs long again.
    ///
    /// # Safety
    ///
    /// `position` must point into a live block of this allocator.
    pub unsafe fn extend_write(&mut self, position: Position, stream: &mut ByteOutputStream) {
        let header = position.header;
        let begin = Header::begin_of(header) as usize;
        let end = Header::end_of(header) as usize;
        let at = position.position.as_ptr() as usize;
        assert!(
            begin <= at && at <= end,
            "extending a write outside the block's payload"
        );

        if header.as_ref().is_continued() {
            self.free(Header::next_continued_of(header));
            (*header.as_ptr()).clear_continued();
        }

        stream.set_range(ByteRange {
            buffer: position.position.as_ptr(),
            size: end - at,
            position: 0,
        });
        self.current_header = Some(header);
    }

    /// Commits the write in progress: trims the unused tail of the last
    /// block (keeping `reserve_bytes` of headroom past the write position)
    /// and releases the single-write slot. Returns the final write position.
    pub fn finish_write(
        &mut self,
        stream: &mut ByteOutputStream,
        reserve_bytes: usize,
    ) -> Position {
        let header = self
            .current_header
            .take()
            .expect("finish_write without a write in progress");
        let write_position = stream.write_position();

        unsafe {
            let begin = Header::begin_of(header) as usize;
            let end = Header::end_of(header) as usize;
            let at = write_position as usize;
            assert!(
                begin <= at && at <= end,
                "write position outside the current block"
            );
            let position = Position {
                header,
                position: NonNull::new_unchecked(write_position),
            };

            // A stale chain can still hang off the block if a resumed write
            // never grew past it again.
            if header.as_ref().is_continued() {
                let continued = Header::next_continued_of(header);
                (*header.as_ptr()).clear_continued();
                self.free(continued);
            }

            self.free_rest_of_block(header, at - begin + reserve_bytes);
            position
        }
    }

    /// Called when the current range fills: allocates a best-effort block of
    /// around `bytes`, links it behind the current one and points `range` at
    /// it. The caller keeps writing there as if nothing happened.
    pub fn new_range(&mut self, bytes: usize, range: &mut ByteRange) {
        self.grow_range(bytes, range, false);
    }

    /// Like [`StringAllocator::new_range`] but the new block holds exactly
    /// `bytes` contiguous bytes, for writers that cannot split a record
    /// across blocks.
    pub fn new_contiguous_range(&mut self, bytes: usize, range: &mut ByteRange) {
        self.grow_range(bytes, range, true);
    }

    fn grow_range(&mut self, bytes: usize, range: &mut ByteRange, contiguous: bool) {
        let current = self
            .current_header
            .expect("growing a write that was never started");
        let header = self.allocate(bytes, contiguous);

        unsafe {
            // The last word of the current block becomes the continuation
            // pointer, but the writer may already have put payload there; its
            // old content moves to the first word of the new block, and the
            // new range starts right after it.
            let last_word = Header::end_of(current).sub(WORD_SIZE);
            ptr::copy_nonoverlapping(last_word, Header::begin_of(header), WORD_SIZE);
            last_word.cast::<*mut Header>().write(header.as_ptr());
            (*current.as_ptr()).set_continued();

            *range = ByteRange {
                buffer: Header::begin_of(header),
                size: header.as_ref().size(),
                position: WORD_SIZE,
            };
        }
        self.current_header = Some(header);
    }

    /// Appends `data` to the write in progress, growing the chain as needed.
    pub fn append(&mut self, stream: &mut ByteOutputStream, data: &[u8]) {
        let mut data = data;
        loop {
            let written = stream.copy_in(data);
            if written == data.len() {
                return;
            }
            data = &data[written..];
            let mut range = ByteRange::null();
            self.new_range(data.len(), &mut range);
            stream.add_range(range);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{fragmented_arena, MAX_ALLOC, MIN_ALLOC, SLAB_PAYLOAD};
    use crate::header::HEADER_SIZE;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn single_write_fits_in_one_block() {
        let mut arena = StringAllocator::new();
        let mut stream = ByteOutputStream::new();

        let start = arena.new_write(&mut stream, 64);
        arena.append(&mut stream, &[0xaa; 32]);
        let end = arena.finish_write(&mut stream, 0);

        unsafe {
            // The block was trimmed to the written length and the rest of the
            // slab went back to the free lists.
            assert_eq!(start.header.as_ref().size(), 32);
            assert_eq!(
                end.position.as_ptr() as usize,
                Header::begin_of(start.header) as usize + 32
            );
            assert_eq!(arena.num_free(), 1);

            let mut read = StringAllocator::prepare_read(start.header);
            assert_eq!(read.ranges().len(), 1);
            assert_eq!(read.size(), 32);
            let mut data = [0u8; 32];
            read.read_bytes(&mut data);
            assert!(data.iter().all(|byte| *byte == 0xaa));
        }
        arena.check_consistency();
    }

    #[test]
    fn growing_write_spans_two_blocks() {
        let mut arena = fragmented_arena();
        let mut stream = ByteOutputStream::new();

        // The write lands in one of the 24-byte leftovers, so 30 bytes force
        // exactly one continuation.
        let start = arena.new_write(&mut stream, 16);
        unsafe { assert_eq!(start.header.as_ref().size(), MIN_ALLOC) };
        let data = pattern(30);
        arena.append(&mut stream, &data);
        arena.finish_write(&mut stream, 0);

        unsafe {
            assert!(start.header.as_ref().is_continued());
            let mut read = StringAllocator::prepare_read(start.header);
            assert_eq!(read.ranges().len(), 2);
            let mut bytes = vec![0u8; data.len()];
            read.read_bytes(&mut bytes);
            assert_eq!(bytes, data);
        }
        arena.check_consistency();
    }

    #[test]
    fn long_write_chains_and_reads_back() {
        let mut arena = StringAllocator::new();

        // Leave a small free block and a large one so the write starts small
        // and has to chain.
        let small = arena.allocate(MIN_ALLOC, true);
        let _pinned = arena.allocate(4096, true);
        unsafe { arena.free(small) };

        let mut stream = ByteOutputStream::new();
        let start = arena.new_write(&mut stream, 16);
        unsafe { assert_eq!(start.header.as_ref().size(), MIN_ALLOC) };

        let data = pattern(4000);
        arena.append(&mut stream, &data);
        arena.finish_write(&mut stream, 0);

        unsafe {
            let mut read = StringAllocator::prepare_read(start.header);
            assert!(read.ranges().len() >= 2);
            let mut bytes = vec![0u8; data.len()];
            read.read_bytes(&mut bytes);
            assert_eq!(bytes, data);

            arena.free(start.header);
        }
        arena.check_consistency();
    }

    #[test]
    fn freeing_the_head_releases_the_whole_chain() {
        let mut arena = fragmented_arena();
        let free_bytes_before = arena.free_bytes();
        let mut stream = ByteOutputStream::new();

        // Both leftovers plus a fresh slab block: a three block chain.
        let start = arena.new_write(&mut stream, 16);
        arena.append(&mut stream, &pattern(100));
        arena.finish_write(&mut stream, 0);

        unsafe {
            let read = StringAllocator::prepare_read(start.header);
            assert_eq!(read.ranges().len(), 3);

            arena.free(start.header);
        }
        // Everything the chain held is free again, plus the new slab.
        assert!(arena.free_bytes() > free_bytes_before);
        assert_eq!(arena.pool().num_small_allocations(), 2);
        arena.check_consistency();
    }

    #[test]
    fn extend_write_resumes_at_a_position() {
        let mut arena = StringAllocator::new();
        let mut stream = ByteOutputStream::new();

        let start = arena.new_write(&mut stream, 64);
        arena.append(&mut stream, b"hello");
        let end = arena.finish_write(&mut stream, 0);

        unsafe {
            arena.extend_write(end, &mut stream);
            arena.append(&mut stream, b" world");
            arena.finish_write(&mut stream, 0);

            let mut read = StringAllocator::prepare_read(start.header);
            let mut bytes = [0u8; 11];
            read.read_bytes(&mut bytes);
            assert_eq!(&bytes, b"hello world");
        }
        arena.check_consistency();
    }

    #[test]
    fn extend_write_discards_a_stale_chain() {
        let mut arena = fragmented_arena();
        let mut stream = ByteOutputStream::new();

        let start = arena.new_write(&mut stream, 16);
        arena.append(&mut stream, &pattern(100));
        arena.finish_write(&mut stream, 0);
        unsafe { assert!(start.header.as_ref().is_continued()) };

        // Overwrite from the start of the chain with a short payload.
        let num_free_before = arena.num_free();
        unsafe {
            arena.extend_write(start, &mut stream);
            assert!(!start.header.as_ref().is_continued());
            arena.append(&mut stream, b"short");
            arena.finish_write(&mut stream, 0);

            let mut read = StringAllocator::prepare_read(start.header);
            assert_eq!(read.ranges().len(), 1);
            let mut bytes = [0u8; 5];
            read.read_bytes(&mut bytes);
            assert_eq!(&bytes, b"short");
        }
        // The old continuation blocks went back to the free lists.
        assert!(arena.num_free() >= num_free_before);
        arena.check_consistency();
    }

    #[test]
    fn contiguous_range_allocates_exactly() {
        let mut arena = StringAllocator::new();
        let mut stream = ByteOutputStream::new();

        let start = arena.new_write(&mut stream, 64);
        arena.append(&mut stream, &[1u8; 16]);

        let mut range = ByteRange::null();
        arena.new_contiguous_range(1024, &mut range);
        stream.add_range(range);
        assert_eq!(range.size, 1024);
        assert_eq!(range.position, WORD_SIZE);

        arena.append(&mut stream, &[2u8; 512]);
        arena.finish_write(&mut stream, 0);

        unsafe {
            assert!(start.header.as_ref().is_continued());
            arena.free(start.header);
        }
        arena.check_consistency();
    }

    #[test]
    fn oversized_contiguous_range_lives_inside_a_chain() {
        let mut arena = fragmented_arena();
        let mut stream = ByteOutputStream::new();
        let data = pattern(MAX_ALLOC + 200);

        // Fill the first block to the brim, then drop an oversized
        // contiguous block into the middle of the chain. It is too big for
        // the slab path, so it comes from the pool.
        let start = arena.new_write(&mut stream, 16);
        unsafe { assert_eq!(start.header.as_ref().size(), MIN_ALLOC) };
        arena.append(&mut stream, &data[..MIN_ALLOC]);

        let mut range = ByteRange::null();
        arena.new_contiguous_range(MAX_ALLOC + 8, &mut range);
        stream.add_range(range);
        assert_eq!(range.size, MAX_ALLOC + 8);
        assert_eq!(range.position, WORD_SIZE);
        assert_eq!(arena.pool().num_large_allocations(), 1);

        // Writing on fills the standalone block completely and chains past
        // it, back onto the slab path.
        arena.append(&mut stream, &data[MIN_ALLOC..]);
        arena.finish_write(&mut stream, 0);

        unsafe {
            assert!(start.header.as_ref().is_continued());
            let mut read = StringAllocator::prepare_read(start.header);
            assert!(read.ranges().len() >= 3);
            assert_eq!(read.ranges()[1].size, MAX_ALLOC + 8 - WORD_SIZE);
            let mut bytes = vec![0u8; data.len()];
            read.read_bytes(&mut bytes);
            assert_eq!(bytes, data);

            // One free drains the slab blocks and returns the standalone one
            // to the pool.
            arena.free(start.header);
        }
        assert_eq!(arena.pool().num_large_allocations(), 0);
        arena.check_consistency();
    }

    #[test]
    #[should_panic(expected = "another one is in progress")]
    fn overlapping_writes_are_fatal() {
        let mut arena = StringAllocator::new();
        let mut stream = ByteOutputStream::new();
        arena.new_write(&mut stream, 64);
        arena.new_write(&mut stream, 64);
    }

    #[test]
    #[should_panic(expected = "without a write in progress")]
    fn finishing_without_a_write_is_fatal() {
        let mut arena = StringAllocator::new();
        let mut stream = ByteOutputStream::new();
        arena.finish_write(&mut stream, 0);
    }

    #[test]
    fn reserve_bytes_survive_the_trim() {
        let mut arena = StringAllocator::new();
        let mut stream = ByteOutputStream::new();

        let start = arena.new_write(&mut stream, 64);
        arena.append(&mut stream, &[3u8; 16]);
        arena.finish_write(&mut stream, 100);

        // 16 written + 100 reserved, word rounded.
        unsafe { assert_eq!(start.header.as_ref().size(), 120) };
        arena.check_consistency();
    }

    #[test]
    fn fragmented_arena_has_the_expected_shape() {
        let arena = fragmented_arena();
        assert_eq!(arena.num_free(), 2);
        assert_eq!(arena.free_bytes(), 2 * (MIN_ALLOC + HEADER_SIZE));
        assert_eq!(
            arena.cumulative_bytes(),
            // Everything the slab offered except the two free payloads.
            SLAB_PAYLOAD + HEADER_SIZE - 2 * MIN_ALLOC
        );
    }
}
