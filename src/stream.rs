use std::ptr;

/// One contiguous span of a logical byte sequence: a buffer, its length, and
/// a cursor into it. The allocator hands these out pointing into block
/// payloads; `position` marks where writing resumes or how much has been
/// read.
///
/// Ranges reference memory they do not own. A range is valid exactly as long
/// as the block behind it, which is the caller's side of the bargain for
/// every cursor type below.
#[derive(Clone, Copy, Debug)]
pub struct ByteRange {
    pub buffer: *mut u8,
    pub size: usize,
    pub position: usize,
}

impl ByteRange {
    /// A range pointing nowhere, for out-parameters about to be filled.
    pub fn null() -> Self {
        Self {
            buffer: ptr::null_mut(),
            size: 0,
            position: 0,
        }
    }

    /// Bytes left between the cursor and the end of the range.
    #[inline]
    pub fn available(&self) -> usize {
        self.size - self.position
    }
}

/// Write-side cursor over a growing sequence of ranges.
///
/// The stream itself is dumb on purpose: it copies bytes into its current
/// range and remembers where it stopped. Growing is the allocator's job:
/// when a range fills up, [`crate::StringAllocator::append`] asks the
/// allocator for a new range (which links a continuation block behind the
/// scenes) and pushes it here. Only the last range is ever written to;
/// earlier ranges are full and already chained in-band.
pub struct ByteOutputStream {
    ranges: Vec<ByteRange>,
}

impl ByteOutputStream {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Drops any previous ranges and starts over with `range`. Called when a
    /// write begins.
    pub fn set_range(&mut self, range: ByteRange) {
        self.ranges.clear();
        self.ranges.push(range);
    }

    /// Appends a fresh range; subsequent writes continue there.
    pub fn add_range(&mut self, range: ByteRange) {
        self.ranges.push(range);
    }

    /// Address of the next byte to be written.
    pub fn write_position(&self) -> *mut u8 {
        let range = self.ranges.last().expect("no write in progress");
        unsafe { range.buffer.add(range.position) }
    }

    /// Copies as much of `data` as fits into the current range and returns
    /// how many bytes that was.
    pub(crate) fn copy_in(&mut self, data: &[u8]) -> usize {
        let range = self.ranges.last_mut().expect("no write in progress");
        let count = data.len().min(range.available());
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), range.buffer.add(range.position), count);
        }
        range.position += count;
        count
    }
}

impl Default for ByteOutputStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side cursor over the ranges of one logical sequence, produced by
/// [`crate::StringAllocator::prepare_read`]. Iterates the chain in order
/// without the caller ever seeing block boundaries.
pub struct ByteInputStream {
    ranges: Vec<ByteRange>,
    current: usize,
}

impl ByteInputStream {
    pub(crate) fn new(ranges: Vec<ByteRange>) -> Self {
        Self { ranges, current: 0 }
    }

    /// The underlying ranges, one per block of the chain.
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Total length of the sequence in bytes.
    pub fn size(&self) -> usize {
        self.ranges.iter().map(|range| range.size).sum()
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        let in_current = self.ranges[self.current..]
            .iter()
            .map(|range| range.size)
            .sum::<usize>();
        in_current - self.ranges[self.current].position
    }

    /// Fills `data` from the stream, walking ranges as needed. Reading past
    /// the end of the sequence is fatal.
    pub fn read_bytes(&mut self, data: &mut [u8]) {
        let mut filled = 0;
        while filled < data.len() {
            let range = &mut self.ranges[self.current];
            let count = (data.len() - filled).min(range.available());
            if count == 0 {
                assert!(
                    self.current + 1 < self.ranges.len(),
                    "read past the end of the stream"
                );
                self.current += 1;
                continue;
            }
            unsafe {
                ptr::copy_nonoverlapping(
                    range.buffer.add(range.position),
                    data.as_mut_ptr().add(filled),
                    count,
                );
            }
            range.position += count;
            filled += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_stream_tracks_position() {
        let mut buffer = [0u8; 32];
        let mut stream = ByteOutputStream::new();
        stream.set_range(ByteRange {
            buffer: buffer.as_mut_ptr(),
            size: buffer.len(),
            position: 0,
        });

        assert_eq!(stream.copy_in(b"hello"), 5);
        assert_eq!(stream.write_position() as usize, buffer.as_ptr() as usize + 5);

        // A full range takes what fits and reports it.
        let long = [7u8; 64];
        assert_eq!(stream.copy_in(&long), 27);
        assert_eq!(stream.copy_in(&long), 0);
        assert_eq!(&buffer[..5], b"hello");
        assert!(buffer[5..].iter().all(|byte| *byte == 7));
    }

    #[test]
    fn input_stream_reads_across_ranges() {
        let mut first = *b"abcd";
        let mut second = *b"efgh";
        let mut stream = ByteInputStream::new(vec![
            ByteRange {
                buffer: first.as_mut_ptr(),
                size: first.len(),
                position: 0,
            },
            ByteRange {
                buffer: second.as_mut_ptr(),
                size: second.len(),
                position: 0,
            },
        ]);

        assert_eq!(stream.size(), 8);
        assert_eq!(stream.remaining(), 8);

        let mut out = [0u8; 6];
        stream.read_bytes(&mut out);
        assert_eq!(&out, b"abcdef");
        assert_eq!(stream.remaining(), 2);

        let mut rest = [0u8; 2];
        stream.read_bytes(&mut rest);
        assert_eq!(&rest, b"gh");
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    #[should_panic(expected = "read past the end")]
    fn overreading_is_fatal() {
        let mut data = *b"xy";
        let mut stream = ByteInputStream::new(vec![ByteRange {
            buffer: data.as_mut_ptr(),
            size: data.len(),
            position: 0,
        }]);
        let mut out = [0u8; 3];
        stream.read_bytes(&mut out);
    }
}
