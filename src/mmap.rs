use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A read-write file mapping shared between threads.
///
/// Writers touch disjoint byte ranges (each owns one reservation) and all
/// shared words are accessed through atomics, so the mapping is handed out
/// by raw pointer rather than through `&mut`.
pub struct MmapFile {
    file: File,
    map: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping lives as long as the struct; concurrent access goes
// through atomics or through byte ranges owned by a single writer.
unsafe impl Send for MmapFile {}
unsafe impl Sync for MmapFile {}

impl MmapFile {
    /// Creates (or truncates) `path`, sizes it to `len` and maps it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Self::map_sized(file, len)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::Unsupported("mapped file exceeds addressable range"))?;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self { file, map, ptr, len })
    }

    fn map_sized(file: File, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        file.set_len(len as u64)?;
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self { file, map, ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::OutOfRange)?;
        if end > self.len {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        // SAFETY: in bounds; only the requested range is borrowed so writers
        // of other reservations are not aliased.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) })
    }

    /// Mutable view of a byte range owned by the caller.
    ///
    /// # Safety
    ///
    /// No other thread may read or write `offset..offset + len` while the
    /// returned slice is alive, except through atomics the caller does not
    /// overlap.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(self.ptr.add(offset), len))
    }

    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check(offset, 4)?;
        if offset % 4 != 0 {
            return Err(Error::Corrupt("misaligned atomic word"));
        }
        // SAFETY: in bounds, aligned (the mapping itself is page aligned).
        Ok(unsafe { &*(self.ptr.add(offset) as *const AtomicU32) })
    }

    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        self.check(offset, 8)?;
        if offset % 8 != 0 {
            return Err(Error::Corrupt("misaligned atomic word"));
        }
        // SAFETY: as above.
        Ok(unsafe { &*(self.ptr.add(offset) as *const AtomicU64) })
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}
