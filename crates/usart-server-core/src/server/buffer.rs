//! Word-aligned transfer buffers

use std::ops::{Deref, DerefMut};

use super::error::ServerError;

/// Alignment of the usable region, in bytes
pub const BUFFER_ALIGN: usize = 4;

/// Offset from `addr` to the next `align`-aligned address
pub fn align_offset(addr: usize, align: usize) -> usize {
    (align - addr % align) % align
}

/// A zero-filled byte buffer whose first usable byte is [`BUFFER_ALIGN`]-aligned.
///
/// The backing allocation is padded by one alignment unit so the usable region
/// can start at the first aligned address inside it. The allocation itself is
/// owned here and released as a whole.
#[derive(Debug)]
pub struct AlignedBuffer {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Allocate a buffer of `len` usable bytes
    pub fn new(len: usize) -> Result<Self, ServerError> {
        let total = len
            .checked_add(BUFFER_ALIGN)
            .ok_or(ServerError::Allocation { size: len })?;
        let mut raw = Vec::new();
        raw.try_reserve_exact(total)
            .map_err(|_| ServerError::Allocation { size: total })?;
        raw.resize(total, 0);

        let offset = align_offset(raw.as_ptr() as usize, BUFFER_ALIGN);
        Ok(Self { raw, offset, len })
    }

    /// Usable capacity in bytes
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Fill the whole usable region with `pattern`
    pub fn fill(&mut self, pattern: u8) {
        self.as_mut_slice().fill(pattern);
    }

    /// Usable region
    pub fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    /// Usable region, mutably
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}
