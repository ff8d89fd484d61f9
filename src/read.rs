use std::ptr::NonNull;

use crate::{
    arena::StringAllocator,
    header::{Header, WORD_SIZE},
    stream::{ByteInputStream, ByteOutputStream, ByteRange},
    write::Position,
};

/// Reading and navigating chains. All of these walk the continuation links
/// embedded in the blocks themselves; there is no side table. For a continued
/// block the logical payload excludes the trailing pointer word, which is why
/// every walk below computes `length` the same way.
impl StringAllocator {
    /// Builds a read cursor over the chain starting at `begin`, one range per
    /// block. The caller reads bytes back in exactly the order they were
    /// written, never seeing block boundaries.
    ///
    /// # Safety
    ///
    /// `begin` must head a live chain of this allocator, and the chain must
    /// stay alive for as long as the returned stream is read.
    pub unsafe fn prepare_read(begin: NonNull<Header>) -> ByteInputStream {
        let mut ranges = Vec::new();
        let mut header = begin;
        loop {
            let mut range = ByteRange {
                buffer: Header::begin_of(header),
                size: header.as_ref().size(),
                position: 0,
            };
            if !header.as_ref().is_continued() {
                ranges.push(range);
                break;
            }
            range.size -= WORD_SIZE;
            ranges.push(range);
            header = Header::next_continued_of(header);
        }
        ByteInputStream::new(ranges)
    }

    /// Logical byte offset of `position` within the chain starting at
    /// `header`, or `None` if the position is not reachable from it.
    ///
    /// # Safety
    ///
    /// `header` must head a live chain of this allocator.
    pub unsafe fn offset(header: NonNull<Header>, position: Position) -> Option<usize> {
        let target = position.position.as_ptr() as usize;
        let mut header = header;
        let mut walked = 0;
        loop {
            let continued = header.as_ref().is_continued();
            let length = header.as_ref().size() - if continued { WORD_SIZE } else { 0 };
            let begin = Header::begin_of(header) as usize;
            if target >= begin && target <= begin + length {
                return Some(walked + (target - begin));
            }
            if !continued {
                return None;
            }
            walked += length;
            header = Header::next_continued_of(header);
        }
    }

    /// Inverse of [`StringAllocator::offset`]: the position `offset` logical
    /// bytes into the chain starting at `header`, or `None` past its end.
    ///
    /// # Safety
    ///
    /// `header` must head a live chain of this allocator.
    pub unsafe fn seek(header: NonNull<Header>, offset: usize) -> Option<Position> {
        let mut header = header;
        let mut walked = 0;
        loop {
            let continued = header.as_ref().is_continued();
            let length = header.as_ref().size() - if continued { WORD_SIZE } else { 0 };
            if offset <= walked + length {
                let at = Header::begin_of(header).add(offset - walked);
                return Some(Position {
                    header,
                    position: NonNull::new_unchecked(at),
                });
            }
            if !continued {
                return None;
            }
            walked += length;
            header = Header::next_continued_of(header);
        }
    }

    /// Number of logical bytes between `position` and the end of its chain.
    ///
    /// # Safety
    ///
    /// `position` must point into a live chain of this allocator.
    pub unsafe fn available(position: Position) -> usize {
        let start_offset =
            position.position.as_ptr() as usize - Header::begin_of(position.header) as usize;
        let mut header = position.header;
        let mut size = 0;
        loop {
            let continued = header.as_ref().is_continued();
            size += header.as_ref().size() - if continued { WORD_SIZE } else { 0 };
            if !continued {
                return size
                    .checked_sub(start_offset)
                    .expect("position outside the chain's payload");
            }
            header = Header::next_continued_of(header);
        }
    }

    /// Grows the chain so that at least `bytes` bytes are addressable from
    /// `position`, without touching the logical content before it. The bytes
    /// at and past `position` are filled with zeros; `position` is refreshed
    /// to the same logical offset afterwards.
    ///
    /// # Safety
    ///
    /// `position` must point into a live chain of this allocator and no write
    /// may be in progress.
    pub unsafe fn ensure_available(&mut self, bytes: usize, position: &mut Position) {
        if Self::available(*position) >= bytes {
            return;
        }

        let from_header = Self::offset(position.header, *position)
            .expect("position not reachable from its own block");
        let mut stream = ByteOutputStream::new();
        self.extend_write(*position, &mut stream);

        let filler = [0u8; 128];
        let mut remaining = bytes;
        while remaining > 0 {
            let count = remaining.min(filler.len());
            self.append(&mut stream, &filler[..count]);
            remaining -= count;
        }
        self.finish_write(&mut stream, 0);

        *position =
            Self::seek(position.header, from_header).expect("position lost after extension");
    }
}
