use std::{collections::HashMap, ptr::NonNull};

use crate::platform;

/// Page granularity of the upstream pool. Runs are sized and rounded in these
/// units regardless of what the kernel's real page size happens to be; the
/// kernel only ever sees lengths that are multiples of its own pages anyway.
pub(crate) const PAGE_SIZE: usize = 4096;

/// Largest run the pool hands out through the size-classed path, in pages.
/// Requests beyond this are a sign that something upstream is sizing its
/// allocations wrong, so they take the fixed-allocation detour instead.
const LARGEST_SIZE_CLASS: usize = 256;

/// One contiguous page-aligned region owned by the pool.
pub struct Run {
    data: NonNull<u8>,
    bytes: usize,
}

impl Run {
    #[inline]
    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn contains(&self, address: *const u8) -> bool {
        let start = self.data.as_ptr() as usize;
        let address = address as usize;
        address >= start && address < start + self.bytes
    }
}

/// Upstream memory pool: the only source of raw memory for the allocator.
///
/// Two kinds of allocations come out of it. *Runs* are page-aligned regions
/// rounded up to a power-of-two page count; the allocator carves them into
/// slabs and keeps them for its whole lifetime. *Standalone* allocations back
/// oversized blocks that bypass the slab path entirely; they are returned
/// one by one through [`AllocationPool::free`] and tracked here so nothing
/// leaks if the owner drops without returning them all.
///
/// Exhaustion is fatal. The engine sizes its memory budget upstream of this
/// pool; if `mmap` fails down here there is nothing sensible left to do.
pub struct AllocationPool {
    /// Every run ever handed out, slab runs and fixed runs alike. Never
    /// shrinks; runs die with the pool.
    runs: Vec<Run>,
    /// Index into `runs` of the run most recently produced by
    /// [`AllocationPool::new_run`].
    current: Option<usize>,
    /// Live standalone allocations, address to mapped length.
    standalone: HashMap<usize, usize>,
}

impl AllocationPool {
    pub fn new() -> Self {
        Self {
            runs: Vec::new(),
            current: None,
            standalone: HashMap::new(),
        }
    }

    fn map_pages(pages: usize) -> NonNull<u8> {
        let bytes = pages * PAGE_SIZE;
        unsafe { platform::request_memory(bytes) }
            .unwrap_or_else(|| panic!("memory pool exhausted requesting {bytes} bytes"))
    }

    /// Makes a new current run of at least `bytes`, rounded up to a
    /// power-of-two page count. The request must fit the largest size class;
    /// callers route anything bigger through [`AllocationPool::allocate_fixed`].
    pub fn new_run(&mut self, bytes: usize) {
        let pages = bytes.div_ceil(PAGE_SIZE).next_power_of_two();
        assert!(
            pages <= LARGEST_SIZE_CLASS,
            "run of {pages} pages exceeds the largest size class"
        );
        let data = Self::map_pages(pages);
        self.runs.push(Run {
            data,
            bytes: pages * PAGE_SIZE,
        });
        self.current = Some(self.runs.len() - 1);
    }

    /// First usable byte of the current run.
    pub fn first_free_in_run(&self) -> *mut u8 {
        self.runs[self.current.expect("no current run")].data()
    }

    /// Bytes usable in the current run.
    pub fn available_in_run(&self) -> usize {
        self.runs[self.current.expect("no current run")].bytes()
    }

    /// Allocates an exact page-rounded run outside the size-classed path.
    /// The run is still owned and swept like any other, it just doesn't
    /// become the current one.
    pub fn allocate_fixed(&mut self, bytes: usize) -> *mut u8 {
        let pages = bytes.div_ceil(PAGE_SIZE);
        let data = Self::map_pages(pages);
        self.runs.push(Run {
            data,
            bytes: pages * PAGE_SIZE,
        });
        data.as_ptr()
    }

    /// Largest run obtainable via [`AllocationPool::new_run`], in pages.
    pub fn largest_size_class(&self) -> usize {
        LARGEST_SIZE_CLASS
    }

    /// Whether `address` falls inside the current run.
    pub fn is_in_current_allocation(&self, address: *const u8) -> bool {
        self.current
            .map_or(false, |i| self.runs[i].contains(address))
    }

    /// Standalone allocation of at least `bytes`, page rounded.
    pub fn allocate(&mut self, bytes: usize) -> NonNull<u8> {
        let pages = bytes.div_ceil(PAGE_SIZE);
        let data = Self::map_pages(pages);
        self.standalone
            .insert(data.as_ptr() as usize, pages * PAGE_SIZE);
        data
    }

    /// Returns a standalone allocation. `bytes` must match the size it was
    /// allocated with.
    pub fn free(&mut self, address: NonNull<u8>, bytes: usize) {
        let mapped = self
            .standalone
            .remove(&(address.as_ptr() as usize))
            .expect("free of an address the pool never allocated");
        assert_eq!(
            mapped,
            bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE,
            "bad size freeing a standalone pool allocation"
        );
        unsafe { platform::return_memory(address, mapped) };
    }

    /// Number of runs, for consistency sweeps.
    pub fn num_small_allocations(&self) -> usize {
        self.runs.len()
    }

    pub fn allocation_at(&self, index: usize) -> &Run {
        &self.runs[index]
    }

    /// Number of live standalone allocations.
    pub fn num_large_allocations(&self) -> usize {
        self.standalone.len()
    }
}

impl Default for AllocationPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllocationPool {
    fn drop(&mut self) {
        unsafe {
            for run in &self.runs {
                platform::return_memory(run.data, run.bytes);
            }
            // Owners return standalone allocations before dropping the pool;
            // anything still here would otherwise leak the mapping.
            for (&address, &mapped) in &self.standalone {
                platform::return_memory(NonNull::new_unchecked(address as *mut u8), mapped);
            }
        }
    }
}
