//! Aligned buffers for admin command payloads.
//!
//! Payloads handed to the driver must start on an aligned address. The
//! buffer over-allocates by the alignment and exposes the aligned window.
//! Allocation failure is reported instead of aborting the process.

use nvctl_common::{Error, Result};

/// Default payload alignment
pub const DMA_ALIGN: usize = 4096;

/// A zero-initialised, aligned, fixed-size buffer.
pub struct DmaBuf {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl DmaBuf {
    /// Allocate a buffer of `len` bytes aligned to [`DMA_ALIGN`].
    pub fn alloc(len: usize) -> Result<Self> {
        Self::alloc_aligned(len, DMA_ALIGN)
    }

    /// Allocate a buffer of `len` bytes aligned to `align` (a power of two).
    pub fn alloc_aligned(len: usize, align: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_argument("size must be > 0"));
        }
        if !align.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "alignment {align} is not a power of two"
            )));
        }

        let total = len
            .checked_add(align)
            .ok_or_else(|| Error::resource_exhausted("Memory allocation error."))?;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| Error::resource_exhausted("Memory allocation error."))?;
        storage.resize(total, 0);

        let offset = storage.as_ptr().align_offset(align);
        if offset >= align {
            return Err(Error::internal("unable to align DMA buffer"));
        }
        Ok(Self {
            storage,
            offset,
            len,
        })
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-length buffers cannot be allocated.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf").field("len", &self.len).finish()
    }
}

impl AsRef<[u8]> for DmaBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DmaBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}
