//! Arena allocator for short, append-only byte sequences.
//!
//! A query engine accumulates lots of small variable-size payloads during
//! execution (hash table keys and values, aggregation state) and then throws
//! all of them away at once. This crate implements an allocator specialized
//! for exactly that pattern. Storage is carved out of large page-aligned
//! slabs obtained from an upstream pool ([`pool::AllocationPool`]), each slab
//! partitioned into blocks with in-band boundary-tag headers
//! ([`header::Header`]), and freed blocks are recycled through segregated
//! free lists ([`freelist`]).
//!
//! The defining trick is the write cursor: a logical payload may grow past
//! the block it started in, and instead of copying, the allocator links a
//! fresh block into a chain by repurposing the last word of the previous
//! block as a forward pointer. Readers walk the chain transparently through
//! a cursor over byte ranges ([`stream`]). See [`write`] and [`read`].
//!
//! The allocator is single-owner and single-threaded; the surrounding engine
//! is expected to shard one allocator per worker. Any misuse (double free,
//! overlapping writes, out-of-range positions) aborts the process, because
//! inside an engine those are correctness bugs, not recoverable conditions.

use std::ptr::NonNull;

mod arena;
mod check;
mod freelist;
mod header;
mod list;
mod platform;
mod pool;
mod read;
mod stream;
mod view;
mod write;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use arena::StringAllocator;
pub use header::Header;
pub use pool::{AllocationPool, Run};
pub use stream::{ByteInputStream, ByteOutputStream, ByteRange};
pub use view::StringView;
pub use write::Position;
