use std::{mem, ptr::NonNull};

use crate::Pointer;

/// Block header size in bytes. The flag+size word is 4 bytes, padded to one
/// machine word so that payloads (and the free-list links and continuation
/// pointers stored in them) are naturally aligned.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Size of the continuation pointer embedded in the last word of a continued
/// block's payload.
pub(crate) const WORD_SIZE: usize = mem::size_of::<*mut u8>();

/// The block is on a free list.
const FREE: u32 = 1 << 31;

/// The last word of the block's payload is not data but a forward pointer to
/// the next block of the logical chain.
const CONTINUED: u32 = 1 << 30;

/// The block immediately to the left in the slab is free. When this is set,
/// the 4 bytes just before this header hold the left neighbor's payload size.
const PREVIOUS_FREE: u32 = 1 << 29;

/// Largest encodable payload size. Plenty for any single-slab block and for
/// any standalone allocation the upstream pool will hand out.
pub(crate) const SIZE_MASK: u32 = (1 << 29) - 1;

/// Canonical value written at the end of each slab. Reads as neither free nor
/// continued, and its size bits decode to hundreds of megabytes, which no
/// block inside a slab can ever reach, so the exact-match test is
/// unambiguous.
const ARENA_END: u32 = 0x1b2a_9ae4;

/// Rounds `size` up to a multiple of the machine word. All block sizes the
/// allocator produces are word multiples; that is what keeps every header,
/// free-list link and continuation pointer naturally aligned.
#[inline]
pub(crate) const fn round_word(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// In-band metadata preceding every block. A slab is a run of blocks laid out
/// left to right and closed by an arena-end sentinel:
///
/// ```text
/// +----------+-------------------+----------+-----------------+-----------+
/// | Header A |    payload A      | Header B |    payload B    | arena end |
/// +----------+-------------------+----------+-----------------+-----------+
///             <--- A.size() --->             <-- B.size() -->
/// ```
///
/// The header packs three flag bits and the payload size into one `u32`:
///
/// ```text
///  31      30          29         28                                    0
/// +------+-----------+-----------+--------------------------------------+
/// | free | continued | prev free |             payload size             |
/// +------+-----------+-----------+--------------------------------------+
/// ```
///
/// Free blocks additionally write their size into the last 4 bytes of their
/// own payload, i.e. just before the right neighbor's header. Together with
/// the `PREVIOUS_FREE` bit of that neighbor this is the classical boundary
/// tag: freeing a block can find and absorb a free left neighbor in O(1)
/// without any side table.
#[repr(C, align(8))]
pub struct Header {
    data: u32,
}

impl Header {
    /// Placement-constructs a header with the given payload size at
    /// `address`. All flags start cleared.
    ///
    /// # Safety
    ///
    /// `address` must be word aligned and have `HEADER_SIZE + size` writable
    /// bytes behind it.
    pub(crate) unsafe fn install(address: *mut u8, size: u32) -> NonNull<Header> {
        debug_assert!(size <= SIZE_MASK);
        debug_assert_eq!(address as usize % WORD_SIZE, 0);
        let header = address.cast::<Header>();
        (*header).data = size;
        NonNull::new_unchecked(header)
    }

    /// Writes the arena-end sentinel at `address`. Only the flag+size word is
    /// written; a linear scan stops as soon as it reads it.
    pub(crate) unsafe fn install_arena_end(address: *mut u8) {
        debug_assert_eq!(address as usize % WORD_SIZE, 0);
        *address.cast::<u32>() = ARENA_END;
    }

    /// Returns the header that precedes `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must point at the first payload byte of a live block, i.e.
    /// an address previously produced by this allocator.
    pub unsafe fn for_payload(payload: *const u8) -> NonNull<Header> {
        NonNull::new_unchecked(payload.sub(HEADER_SIZE) as *mut Header)
    }

    /// Payload size in bytes, excluding the header itself.
    #[inline]
    pub fn size(&self) -> usize {
        (self.data & SIZE_MASK) as usize
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        debug_assert!(size as u32 <= SIZE_MASK);
        self.data = (self.data & !SIZE_MASK) | size as u32;
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.data & FREE != 0
    }

    #[inline]
    pub fn is_continued(&self) -> bool {
        self.data & CONTINUED != 0
    }

    #[inline]
    pub(crate) fn is_previous_free(&self) -> bool {
        self.data & PREVIOUS_FREE != 0
    }

    #[inline]
    pub(crate) fn is_arena_end(&self) -> bool {
        self.data == ARENA_END
    }

    pub(crate) fn set_free(&mut self) {
        self.data |= FREE;
    }

    pub(crate) fn clear_free(&mut self) {
        self.data &= !FREE;
    }

    pub(crate) fn set_continued(&mut self) {
        self.data |= CONTINUED;
    }

    pub(crate) fn clear_continued(&mut self) {
        self.data &= !CONTINUED;
    }

    pub(crate) fn set_previous_free(&mut self) {
        self.data |= PREVIOUS_FREE;
    }

    pub(crate) fn clear_previous_free(&mut self) {
        self.data &= !PREVIOUS_FREE;
    }

    /// First payload byte of `header`.
    ///
    /// # Notes
    ///
    /// We use this as `Header::begin_of(header)` instead of
    /// `header.begin()` because address math on `self` would create
    /// intermediary references that upset Miri. Same for the other
    /// navigation functions below.
    #[inline]
    pub(crate) unsafe fn begin_of(header: NonNull<Header>) -> *mut u8 {
        header.as_ptr().cast::<u8>().add(HEADER_SIZE)
    }

    /// One past the last payload byte of `header`. This is also the address
    /// of the right neighbor's header, or of the arena-end sentinel.
    #[inline]
    pub(crate) unsafe fn end_of(header: NonNull<Header>) -> *mut u8 {
        Self::begin_of(header).add(header.as_ref().size())
    }

    /// The block to the right in the same slab, or `None` if this is the last
    /// block before the arena-end sentinel. Must only be called on slab
    /// blocks; standalone pool blocks have no neighbors.
    pub(crate) unsafe fn next_of(header: NonNull<Header>) -> Pointer<Header> {
        let next = Self::end_of(header).cast::<Header>();
        if (*next).is_arena_end() {
            None
        } else {
            Some(NonNull::new_unchecked(next))
        }
    }

    /// The continuation target stored in the last payload word.
    pub(crate) unsafe fn next_continued_of(header: NonNull<Header>) -> NonNull<Header> {
        debug_assert!(header.as_ref().is_continued());
        let link = Self::end_of(header).sub(WORD_SIZE).cast::<*mut Header>();
        NonNull::new_unchecked(*link)
    }

    /// Slot holding the payload size of a free left neighbor: the 4 bytes
    /// right before this header, which are the last 4 bytes of that
    /// neighbor's payload.
    #[inline]
    pub(crate) unsafe fn previous_free_size_slot(header: NonNull<Header>) -> *mut u32 {
        header.as_ptr().cast::<u32>().sub(1)
    }

    /// Header of the free block to the left, found through its size trailer.
    ///
    /// # Safety
    ///
    /// `header` must have its `PREVIOUS_FREE` bit set and both blocks must
    /// live in the same slab.
    pub(crate) unsafe fn previous_free_of(header: NonNull<Header>) -> NonNull<Header> {
        let size = *Self::previous_free_size_slot(header) as usize;
        let previous = header
            .as_ptr()
            .cast::<u8>()
            .sub(size + HEADER_SIZE)
            .cast::<Header>();
        let previous = NonNull::new_unchecked(previous);
        assert_eq!(previous.as_ref().size(), size, "corrupt free size trailer");
        assert!(previous.as_ref().is_free(), "previous-free tag out of sync");
        assert!(!previous.as_ref().is_previous_free(), "two adjacent free blocks");
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_size_packing() {
        let mut buffer = [0u64; 8];
        unsafe {
            let header = Header::install(buffer.as_mut_ptr().cast(), 48);
            let h = &mut *header.as_ptr();
            assert_eq!(h.size(), 48);
            assert!(!h.is_free() && !h.is_continued() && !h.is_previous_free());

            h.set_free();
            h.set_continued();
            h.set_previous_free();
            assert!(h.is_free() && h.is_continued() && h.is_previous_free());
            // Flag traffic must not disturb the size bits.
            assert_eq!(h.size(), 48);

            h.set_size(SIZE_MASK as usize);
            assert_eq!(h.size(), SIZE_MASK as usize);
            assert!(h.is_free() && h.is_continued() && h.is_previous_free());

            h.clear_free();
            h.clear_continued();
            h.clear_previous_free();
            assert_eq!(h.size(), SIZE_MASK as usize);
        }
    }

    #[test]
    fn arena_end_terminates_scan() {
        // Two blocks followed by the sentinel, all inside one buffer.
        let mut buffer = [0u64; 16];
        unsafe {
            let base = buffer.as_mut_ptr().cast::<u8>();
            let first = Header::install(base, 24);
            let second = Header::install(Header::end_of(first), 48);
            Header::install_arena_end(Header::end_of(second));

            assert_eq!(Header::next_of(first), Some(second));
            assert_eq!(Header::next_of(second), None);
            assert!(!(*Header::end_of(second).cast::<Header>()).is_free());
            assert!(!(*Header::end_of(second).cast::<Header>()).is_continued());
        }
    }

    #[test]
    fn boundary_tag_roundtrip() {
        let mut buffer = [0u64; 16];
        unsafe {
            let base = buffer.as_mut_ptr().cast::<u8>();
            let first = Header::install(base, 24);
            let second = Header::install(Header::end_of(first), 32);
            Header::install_arena_end(Header::end_of(second));

            // Mark the first block free by hand: flag, trailer, neighbor tag.
            (*first.as_ptr()).set_free();
            *Header::previous_free_size_slot(second) = 24;
            (*second.as_ptr()).set_previous_free();

            assert_eq!(Header::previous_free_of(second), first);
        }
    }

    #[test]
    fn word_rounding() {
        assert_eq!(round_word(0), 0);
        assert_eq!(round_word(1), 8);
        assert_eq!(round_word(8), 8);
        assert_eq!(round_word(9), 16);
        assert_eq!(round_word(4000), 4000);
    }
}
