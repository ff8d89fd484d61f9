use std::{collections::HashMap, mem, ptr::NonNull};

use tracing::warn;

use crate::{
    freelist::{free_list_index, free_list_index_masked, low_mask, NUM_FREE_LISTS},
    header::{round_word, Header, HEADER_SIZE, SIZE_MASK},
    list::CompactDoubleList,
    pool::{AllocationPool, PAGE_SIZE},
    Pointer,
};

/// Minimum payload size in bytes. A free block must hold its list links plus
/// the boundary-tag size trailer, rounded to a word so neighbors stay
/// aligned.
pub(crate) const MIN_ALLOC: usize =
    round_word(mem::size_of::<CompactDoubleList>() + mem::size_of::<u32>());

/// Minimum slab size in bytes. Growing in sizable steps keeps the slab count
/// low even when the engine makes millions of tiny allocations.
pub(crate) const UNIT_SIZE: usize = 16 * PAGE_SIZE;

/// Largest allocation served through the free-list path. An exact-size
/// request above this goes straight to the upstream pool as a standalone
/// block; a best-effort request simply grows a bigger slab.
pub(crate) const MAX_ALLOC: usize = UNIT_SIZE / 4 * 3;

/// How many entries of one free list a best-effort allocation inspects
/// before settling for the largest it has seen.
const MAX_CHECKED_FOR_FIT: usize = 5;

/// Payload bytes of the single block a fresh `UNIT_SIZE` slab holds: the run
/// minus the end marker and the block's own header.
#[cfg(test)]
pub(crate) const SLAB_PAYLOAD: usize = UNIT_SIZE - 2 * HEADER_SIZE;

/// Variable-size block allocator for short, append-only byte sequences.
///
/// Memory comes from [`AllocationPool`] in page-aligned slabs. Each slab is a
/// run of header-prefixed blocks ending in an arena-end sentinel; free blocks
/// are threaded onto size-segregated circular lists through links embedded in
/// their own payload, so the only per-block overhead is the header:
///
/// ```text
///              free lists (one sentinel per size class)
///            [0]───────────┐   [1]   ...   [6]──────┐
///                          │                        │
/// +--------+------------+--▼---+-----------+--------▼-------+-----------+
/// |  slab  | used block | free | used      |      free      | arena end |
/// +--------+------------+------+-----------+----------------+-----------+
/// ```
///
/// The allocator is single-owner: nothing in here is synchronized, and the
/// write cursor (see [`crate::write`]) tolerates exactly one write in flight.
/// Misuse aborts; see the crate docs.
pub struct StringAllocator {
    /// Upstream source of slabs and standalone blocks. Owned; runs are
    /// released when the pool drops with the allocator.
    pub(crate) pool: AllocationPool,
    /// Sentinels of the segregated free lists. Boxed so entries can point at
    /// them while the allocator itself stays movable.
    pub(crate) free: Box<[CompactDoubleList; NUM_FREE_LISTS]>,
    /// Bit `i` set iff `free[i]` has entries.
    pub(crate) free_non_empty: u32,
    /// Number of blocks on free lists.
    pub(crate) num_free: usize,
    /// Bytes held by free blocks, headers included.
    pub(crate) free_bytes: usize,
    /// Payload bytes currently allocated, slab and standalone alike.
    pub(crate) cumulative_bytes: usize,
    /// Bytes of live standalone allocations, headers included.
    pub(crate) size_from_pool: usize,
    /// Standalone oversized blocks: header address to total bytes. Everything
    /// in here is returned to the pool on drop.
    pub(crate) standalone: HashMap<usize, usize>,
    /// Block currently receiving a write, if any. See [`crate::write`].
    pub(crate) current_header: Pointer<Header>,
}

impl StringAllocator {
    pub fn new() -> Self {
        let mut free = Box::new([CompactDoubleList::new(); NUM_FREE_LISTS]);
        for list in free.iter_mut() {
            unsafe { CompactDoubleList::close(list) };
        }
        Self {
            pool: AllocationPool::new(),
            free,
            free_non_empty: 0,
            num_free: 0,
            free_bytes: 0,
            cumulative_bytes: 0,
            size_from_pool: 0,
            standalone: HashMap::new(),
            current_header: None,
        }
    }

    /// Allocates a block of at least `MIN_ALLOC` bytes.
    ///
    /// With `exact_size` the returned block holds `size` bytes (word
    /// rounded), splitting off any leftover tail; oversized requests bypass
    /// the slabs entirely. Without it the request is best-effort: the caller
    /// gets whatever block the free lists give up cheaply, possibly smaller
    /// or much larger than asked. That mode exists for the write cursor,
    /// which can chain blocks of any size.
    pub fn allocate(&mut self, size: usize, exact_size: bool) -> NonNull<Header> {
        let size = round_word(size.max(MIN_ALLOC));
        if size > MAX_ALLOC && exact_size {
            assert!(
                size <= SIZE_MASK as usize,
                "allocation of {size} bytes exceeds the largest encodable block"
            );
            let address = self.allocate_from_pool(size + HEADER_SIZE);
            return unsafe { Header::install(address, size as u32) };
        }

        match self.allocate_from_free_lists(size, exact_size, exact_size) {
            Some(header) => header,
            None => {
                self.new_slab(size);
                let header = self
                    .allocate_from_free_lists(size, exact_size, exact_size)
                    .expect("allocation failed right after growing a slab");
                assert!(unsafe { header.as_ref().size() } > 0);
                header
            }
        }
    }

    /// Frees `header` and every block chained behind it. One call releases
    /// the whole logical write; freed neighbors coalesce eagerly in both
    /// directions. Freeing a block twice is fatal.
    ///
    /// # Safety
    ///
    /// `header` must be a live block previously returned by this allocator
    /// and no [`crate::Position`] into its chain may be used afterwards.
    pub unsafe fn free(&mut self, header: NonNull<Header>) {
        let mut current = Some(header);
        while let Some(mut header) = current.take() {
            // A standalone block can sit at the head of a chain or be linked
            // into the middle of one by an oversized contiguous range. Either
            // way the whole block goes back to the pool, and the walk carries
            // on with whatever is chained behind it.
            let address = header.as_ptr() as usize;
            if header.as_ref().size() > MAX_ALLOC
                && !self.pool.is_in_current_allocation(header.as_ptr().cast())
                && self.standalone.contains_key(&address)
            {
                if header.as_ref().is_continued() {
                    current = Some(Header::next_continued_of(header));
                    header.as_mut().clear_continued();
                }
                self.free_to_pool(
                    header.as_ptr().cast(),
                    header.as_ref().size() + HEADER_SIZE,
                );
                continue;
            }

            let continued = if header.as_ref().is_continued() {
                let next = Header::next_continued_of(header);
                header.as_mut().clear_continued();
                Some(next)
            } else {
                None
            };

            assert!(!header.as_ref().is_free(), "double free of an arena block");
            self.free_bytes += header.as_ref().size() + HEADER_SIZE;
            self.cumulative_bytes -= header.as_ref().size();

            if let Some(next) = Header::next_of(header) {
                assert!(
                    !next.as_ref().is_previous_free(),
                    "previous-free tag set while the block was in use"
                );
                if next.as_ref().is_free() {
                    self.num_free -= 1;
                    self.remove_from_free_list(next);
                    let merged = header.as_ref().size() + next.as_ref().size() + HEADER_SIZE;
                    header.as_mut().set_size(merged);
                    let after = Header::end_of(header).cast::<Header>();
                    assert!(
                        (*after).is_arena_end() || !(*after).is_free(),
                        "two adjacent free blocks after forward coalescing"
                    );
                }
            }

            if header.as_ref().is_previous_free() {
                let mut previous = Header::previous_free_of(header);
                self.remove_from_free_list(previous);
                let merged = previous.as_ref().size() + header.as_ref().size() + HEADER_SIZE;
                previous.as_mut().set_size(merged);
                header = previous;
            } else {
                self.num_free += 1;
            }

            let index = free_list_index(header.as_ref().size());
            self.free_non_empty |= 1 << index;
            CompactDoubleList::insert(&mut self.free[index], CompactDoubleList::entry_of(header));
            mark_as_free(header);

            current = continued;
        }
    }

    /// Shrinks `header` to `keep_bytes` (word rounded, at least `MIN_ALLOC`)
    /// and turns the rest of the block into a free block of its own, if the
    /// slack is worth a header.
    pub(crate) fn free_rest_of_block(&mut self, mut header: NonNull<Header>, keep_bytes: usize) {
        let keep = round_word(keep_bytes.max(MIN_ALLOC));
        let size = unsafe { header.as_ref().size() };
        if size <= keep + HEADER_SIZE + MIN_ALLOC {
            return;
        }

        unsafe {
            header.as_mut().set_size(keep);
            let tail = Header::install(Header::end_of(header), (size - keep - HEADER_SIZE) as u32);
            self.free(tail);
        }
    }

    /// Walks the free lists for a block of `preferred` bytes, starting at the
    /// smallest non-empty class that could fit it and moving up. When
    /// `must_have_size` is unset and no class above can deliver, settles for
    /// the largest block a short scan of the smaller classes turns up: a
    /// write extension can live with whatever space remains.
    fn allocate_from_free_lists(
        &mut self,
        preferred: usize,
        must_have_size: bool,
        is_final_size: bool,
    ) -> Pointer<Header> {
        if self.num_free == 0 {
            return None;
        }

        let mut index = free_list_index_masked(preferred, self.free_non_empty);
        while index < NUM_FREE_LISTS {
            if let Some(header) =
                self.allocate_from_free_list(preferred, must_have_size, is_final_size, index)
            {
                return Some(header);
            }
            // Next larger non-empty class.
            index = (self.free_non_empty & !low_mask(index + 1)).trailing_zeros() as usize;
        }
        if must_have_size {
            return None;
        }

        let mut index = free_list_index(preferred) as isize - 1;
        while index >= 0 {
            if let Some(header) =
                self.allocate_from_free_list(preferred, false, is_final_size, index as usize)
            {
                return Some(header);
            }
            index -= 1;
        }
        None
    }

    /// Scans one free list. First fit wins; a best-effort scan gives up after
    /// `MAX_CHECKED_FOR_FIT` entries and falls back to the largest block it
    /// saw, while an exact-size scan walks the whole list before failing.
    fn allocate_from_free_list(
        &mut self,
        preferred: usize,
        must_have_size: bool,
        is_final_size: bool,
        index: usize,
    ) -> Pointer<Header> {
        unsafe {
            let sentinel: *mut CompactDoubleList = &mut self.free[index];
            let mut found: Pointer<Header> = None;
            let mut largest: Pointer<Header> = None;
            let mut checked = 0;

            let mut item = CompactDoubleList::next(sentinel);
            while item != sentinel {
                let header = CompactDoubleList::header_of(item);
                assert!(header.as_ref().is_free(), "non-free block on a free list");
                let size = header.as_ref().size();
                if size >= preferred {
                    found = Some(header);
                    break;
                }
                let is_largest = match largest {
                    None => true,
                    Some(largest) => size > largest.as_ref().size(),
                };
                if is_largest {
                    largest = Some(header);
                }
                if !must_have_size {
                    checked += 1;
                    if checked > MAX_CHECKED_FOR_FIT {
                        break;
                    }
                }
                item = CompactDoubleList::next(item);
            }

            if !must_have_size && found.is_none() {
                found = largest;
            }
            let found = found?;

            self.num_free -= 1;
            self.free_bytes -= found.as_ref().size() + HEADER_SIZE;
            self.remove_from_free_list(found);
            if let Some(mut next) = Header::next_of(found) {
                next.as_mut().clear_previous_free();
            }
            self.cumulative_bytes += found.as_ref().size();
            if is_final_size {
                self.free_rest_of_block(found, preferred);
            }
            Some(found)
        }
    }

    /// Unlinks `header` from its size-class list, clearing the non-empty bit
    /// if it was the last entry.
    pub(crate) fn remove_from_free_list(&mut self, mut header: NonNull<Header>) {
        unsafe {
            assert!(header.as_ref().is_free(), "unlinking a block that is not free");
            header.as_mut().clear_free();
            let index = free_list_index(header.as_ref().size());
            CompactDoubleList::remove(CompactDoubleList::entry_of(header));
            if CompactDoubleList::is_empty(&self.free[index]) {
                self.free_non_empty &= !(1 << index);
            }
        }
    }

    /// Adds a slab big enough for a `size`-byte block to the free lists.
    /// Requests beyond the pool's largest run class take a fixed allocation
    /// instead; that path is worth a warning because allocations that large
    /// defeat the purpose of slab pooling.
    fn new_slab(&mut self, size: usize) {
        let needed = (size + 2 * HEADER_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let needed = needed.max(UNIT_SIZE);
        let (run, available) = if needed / PAGE_SIZE > self.pool.largest_size_class() {
            warn!(bytes = size, "unusually large allocation request");
            (self.pool.allocate_fixed(needed), needed - HEADER_SIZE)
        } else {
            self.pool.new_run(needed);
            (
                self.pool.first_free_in_run(),
                self.pool.available_in_run() - HEADER_SIZE,
            )
        };

        unsafe {
            // Close the slab with the end marker, then hand the rest to the
            // free lists as one big block.
            Header::install_arena_end(run.add(available));
            self.cumulative_bytes += available;
            let header = Header::install(run, (available - HEADER_SIZE) as u32);
            self.free(header);
        }
    }

    /// Standalone allocation bookkept for return on [`free`] or drop.
    fn allocate_from_pool(&mut self, size: usize) -> *mut u8 {
        let address = self.pool.allocate(size);
        self.cumulative_bytes += size;
        self.size_from_pool += size;
        self.standalone.insert(address.as_ptr() as usize, size);
        address.as_ptr()
    }

    fn free_to_pool(&mut self, address: *mut u8, size: usize) {
        let tracked = self
            .standalone
            .remove(&(address as usize))
            .expect("free of a block the allocator never got from the pool");
        assert_eq!(tracked, size, "bad size returning a standalone block");
        self.size_from_pool -= size;
        self.cumulative_bytes -= size;
        self.pool.free(NonNull::new(address).unwrap(), size);
    }

    /// Number of blocks currently on free lists.
    pub fn num_free(&self) -> usize {
        self.num_free
    }

    /// Bytes held by free blocks, headers included.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Payload bytes currently allocated.
    pub fn cumulative_bytes(&self) -> usize {
        self.cumulative_bytes
    }

    /// Bytes of live standalone pool allocations, headers included.
    pub fn size_from_pool(&self) -> usize {
        self.size_from_pool
    }

    pub fn pool(&self) -> &AllocationPool {
        &self.pool
    }
}

impl Default for StringAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StringAllocator {
    fn drop(&mut self) {
        for (address, size) in self.standalone.drain() {
            self.pool
                .free(NonNull::new(address as *mut u8).unwrap(), size);
        }
    }
}

/// Builds an arena whose free lists hold exactly two isolated `MIN_ALLOC`
/// blocks, with the rest of the slab pinned by live allocations. Write tests
/// use this to force short chains: a growing write has to hop through the
/// leftovers before a fresh slab is even considered.
#[cfg(test)]
pub(crate) fn fragmented_arena() -> StringAllocator {
    let mut arena = StringAllocator::new();
    let first = arena.allocate(MIN_ALLOC, true);
    let _second = arena.allocate(MIN_ALLOC, true);
    let third = arena.allocate(MIN_ALLOC, true);
    // Plug the rest of the slab so small blocks are all the lists hold.
    arena.allocate(SLAB_PAYLOAD - 3 * (MIN_ALLOC + HEADER_SIZE) - HEADER_SIZE, false);
    unsafe {
        arena.free(first);
        arena.free(third);
    }
    assert_eq!(arena.num_free(), 2);
    arena
}

/// Sets the free flag and publishes the boundary tag: the block's size goes
/// into its own last 4 bytes and the right neighbor learns its left neighbor
/// is free. The last block of a slab has no neighbor to tell.
unsafe fn mark_as_free(mut header: NonNull<Header>) {
    header.as_mut().set_free();
    if let Some(mut next) = Header::next_of(header) {
        next.as_mut().set_previous_free();
        *Header::previous_free_size_slot(next) = header.as_ref().size() as u32;
    }
}
