use std::{ptr, slice};

use crate::{arena::StringAllocator, header::Header};

/// Bytes a view can carry without pointing anywhere: the 4-byte prefix plus
/// one word.
const INLINE_SIZE: usize = 12;

#[repr(C)]
#[derive(Clone, Copy)]
union InlineOrPointer {
    data: *const u8,
    inlined: [u8; 8],
}

/// A 16-byte reference to a byte string, with short strings stored inline.
///
/// ```text
///  0        4            8                            16
/// +--------+------------+-----------------------------+
/// | size   | prefix     | pointer  -or-  inline tail  |
/// +--------+------------+-----------------------------+
/// ```
///
/// Strings up to [`INLINE_SIZE`] bytes live entirely in the view: the first
/// four bytes in `prefix`, the rest in the union. `repr(C)` keeps the two
/// fields adjacent, so the inline bytes are one contiguous run starting at
/// `prefix`. Longer strings keep only their prefix here and point at payload
/// owned elsewhere, typically a block of a [`StringAllocator`].
///
/// Like [`crate::Position`], an out-of-line view has reference semantics and
/// dangles if the memory behind it goes away.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StringView {
    size: u32,
    prefix: [u8; 4],
    value: InlineOrPointer,
}

impl StringView {
    /// Builds a view over `bytes`, copying them in when they fit inline.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut prefix = [0u8; 4];
        let head = bytes.len().min(4);
        prefix[..head].copy_from_slice(&bytes[..head]);

        let value = if bytes.len() <= INLINE_SIZE {
            let mut inlined = [0u8; 8];
            if bytes.len() > 4 {
                inlined[..bytes.len() - 4].copy_from_slice(&bytes[4..]);
            }
            InlineOrPointer { inlined }
        } else {
            InlineOrPointer {
                data: bytes.as_ptr(),
            }
        };

        Self {
            size: bytes.len() as u32,
            prefix,
            value,
        }
    }

    /// Builds a view over `size` bytes at `data` without looking at them.
    ///
    /// # Safety
    ///
    /// `data` must be readable for `size` bytes for as long as the view is
    /// used.
    pub unsafe fn from_raw(data: *const u8, size: usize) -> Self {
        let mut prefix = [0u8; 4];
        let head = size.min(4);
        ptr::copy_nonoverlapping(data, prefix.as_mut_ptr(), head);
        if size <= INLINE_SIZE {
            let mut inlined = [0u8; 8];
            if size > 4 {
                ptr::copy_nonoverlapping(data.add(4), inlined.as_mut_ptr(), size - 4);
            }
            return Self {
                size: size as u32,
                prefix,
                value: InlineOrPointer { inlined },
            };
        }
        Self {
            size: size as u32,
            prefix,
            value: InlineOrPointer { data },
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub fn is_inline(&self) -> bool {
        self.size as usize <= INLINE_SIZE
    }

    /// Address of the first byte: the prefix for inline views, the referenced
    /// payload otherwise.
    pub fn data(&self) -> *const u8 {
        if self.is_inline() {
            self.prefix.as_ptr()
        } else {
            unsafe { self.value.data }
        }
    }

    /// The viewed bytes.
    ///
    /// # Safety
    ///
    /// For an out-of-line view the referenced memory must still be alive.
    pub unsafe fn as_bytes(&self) -> &[u8] {
        slice::from_raw_parts(self.data(), self.size())
    }
}

impl StringAllocator {
    /// Returns `view` as one contiguous byte run. Inline views and views
    /// whose payload fits in a single block already are contiguous and come
    /// back unchanged; a view spanning a chain is materialized into
    /// `storage` and the result points there.
    ///
    /// # Safety
    ///
    /// An out-of-line `view` must point at the start of a live block payload
    /// of this allocator.
    pub unsafe fn contiguous_string(view: StringView, storage: &mut Vec<u8>) -> StringView {
        if view.is_inline() {
            return view;
        }
        let header = Header::for_payload(view.data());
        if view.size() <= header.as_ref().size() {
            return view;
        }

        let mut stream = Self::prepare_read(header);
        storage.resize(view.size(), 0);
        stream.read_bytes(storage);
        StringView::from_bytes(storage)
    }
}
