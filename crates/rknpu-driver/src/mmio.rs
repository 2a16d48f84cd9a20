//! Memory-mapped register windows.
//!
//! A [`MappedRegion`] maps a slice of a device file (usually `/dev/mem` at
//! a core's physical base, or a UIO region) and exposes it as a
//! [`RegisterIo`]. Accesses are volatile and bounds-checked.

// Register offsets are naturally aligned by the hardware.
#![allow(clippy::cast_ptr_alignment)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{NpuError, Result};
use crate::hal::RegisterIo;

/// One mapped register window.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    path: PathBuf,
    offset: u64,
    _file: File,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &format_args!("{:#x}", self.size))
            .field("ptr", &format_args!("{:p}", self.ptr))
            .finish()
    }
}

// SAFETY: Send - the mapping is owned exclusively and is valid process-wide;
// moving it between threads does not invalidate it.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - every access is a bounds-checked volatile 32-bit read or
// write. Register semantics, not Rust aliasing, govern concurrent access.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `size` bytes of `path` starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidArgument`] for a zero or non-page-aligned
    /// request, [`NpuError::Io`] if the file cannot be opened, and
    /// [`NpuError::Unavailable`] if `mmap` fails.
    pub fn map(path: impl AsRef<Path>, offset: u64, size: usize) -> Result<Self> {
        let path = path.as_ref();
        let page = rustix::param::page_size() as u64;
        if size == 0 || offset % page != 0 {
            return Err(NpuError::invalid_argument(format!(
                "{}: cannot map {size:#x} bytes at {offset:#x}",
                path.display()
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: the fd is open for read/write and kept alive in `_file` for
        // the lifetime of the mapping; size is non-zero and offset is page
        // aligned. The mapping is released in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| NpuError::unavailable(format!("mmap {}@{offset:#x}: {e}", path.display())))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| NpuError::unavailable(format!("mmap {} returned null", path.display())))?;

        tracing::debug!("mapped {}@{offset:#x}, {size:#x} bytes at {ptr:p}", path.display());

        Ok(Self {
            ptr,
            size,
            path: path.to_path_buf(),
            offset,
            _file: file,
        })
    }

    /// Window length in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: usize) {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "register offset {offset:#x} outside {:#x}-byte window",
            self.size
        );
    }
}

impl RegisterIo for MappedRegion {
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or outside the window.
    fn read32(&self, offset: usize) -> u32 {
        self.check(offset);
        // SAFETY: ptr is valid for `size` bytes and offset + 4 <= size; the
        // offset is 4-byte aligned on a page-aligned base.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    /// # Panics
    ///
    /// Panics if `offset` is unaligned or outside the window.
    fn write32(&self, offset: usize, value: u32) {
        self.check(offset);
        // SAFETY: as in read32.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size come from the successful mmap in `map` and the
        // mapping has not been released yet.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::warn!("munmap {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn backing(len: u64) -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(len).unwrap();
        f
    }

    #[test]
    fn writes_reach_the_backing_file() {
        let page = rustix::param::page_size();
        let f = backing(page as u64 * 2);
        {
            let region = MappedRegion::map(f.path(), page as u64, page).unwrap();
            region.write32(0x8, 0xdead_beef);
            assert_eq!(region.read32(0x8), 0xdead_beef);
            assert_eq!(region.read32(0x0), 0);
        }
        let mut bytes = Vec::new();
        f.reopen().unwrap().read_to_end(&mut bytes).unwrap();
        let at = page + 8;
        assert_eq!(
            u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap()),
            0xdead_beef
        );
    }

    #[test]
    fn rejects_unaligned_offset() {
        let f = backing(8192);
        let err = MappedRegion::map(f.path(), 3, 4096).unwrap_err();
        assert!(matches!(err, NpuError::InvalidArgument { .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = MappedRegion::map("/nonexistent/rknpu-window", 0, 4096).unwrap_err();
        assert!(matches!(err, NpuError::Io { .. }));
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn out_of_window_access_panics() {
        let page = rustix::param::page_size();
        let f = backing(page as u64);
        let region = MappedRegion::map(f.path(), 0, page).unwrap();
        let _ = region.read32(page);
    }
}
