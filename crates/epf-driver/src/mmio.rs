// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-mapped I/O windows
//!
//! Everything that crosses the link goes through [`Mmio`]: the MCB, the
//! doorbell mailbox and the CPU side of tail copies. Two implementations:
//!
//! - [`MappedRegion`]: a BAR mapped from a file (sysfs `resourceN` of a PCI
//!   function) with rustix `mmap`, accessed with volatile loads and stores
//! - [`crate::memory::MemWindow`]: an in-process shared window used by the
//!   loopback platform
//!
//! Values must never be cached in ordinary memory: every MCB read goes back
//! to the window.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{EpfError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

/// A 32-bit MMIO window
pub trait Mmio: Send + Sync + std::fmt::Debug {
    /// Window size in bytes
    fn size(&self) -> usize;

    /// Read a 32-bit word
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a misaligned or out-of-range offset,
    /// `DeviceGone` once the window is unmapped.
    fn read32(&self, offset: usize) -> Result<u32>;

    /// Write a 32-bit word
    ///
    /// # Errors
    ///
    /// Same as [`Mmio::read32`].
    fn write32(&self, offset: usize, value: u32) -> Result<()>;

    /// Byte-granular read
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the range leaves the window, `DeviceGone` once
    /// the window is unmapped.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Byte-granular write
    ///
    /// # Errors
    ///
    /// Same as [`Mmio::read_bytes`].
    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Write barrier: MCB writes before it are visible before any write after it
///
/// Orders the volatile stores [`MappedRegion`] makes to device memory as well
/// as CPU atomics (the loopback windows).
pub fn wmb() {
    fence(Ordering::Release);
    io_wmb();
}

/// Read barrier: issued after observing a wake, before reading the descriptor
pub fn rmb() {
    io_rmb();
    fence(Ordering::Acquire);
}

#[cfg(target_arch = "x86_64")]
fn io_wmb() {
    // SAFETY: sfence touches no memory or registers; it only drains the
    // write-combining buffers ahead of later stores.
    unsafe { std::arch::asm!("sfence", options(nostack, preserves_flags)) }
}

#[cfg(target_arch = "x86_64")]
fn io_rmb() {
    // SAFETY: lfence only orders loads.
    unsafe { std::arch::asm!("lfence", options(nostack, preserves_flags)) }
}

#[cfg(target_arch = "aarch64")]
fn io_wmb() {
    // SAFETY: barrier instruction, no operands.
    unsafe { std::arch::asm!("dmb oshst", options(nostack, preserves_flags)) }
}

#[cfg(target_arch = "aarch64")]
fn io_rmb() {
    // SAFETY: barrier instruction, no operands.
    unsafe { std::arch::asm!("dmb oshld", options(nostack, preserves_flags)) }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn io_wmb() {
    fence(Ordering::SeqCst);
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn io_rmb() {
    fence(Ordering::SeqCst);
}

pub(crate) fn check_word(size: usize, offset: usize) -> Result<()> {
    if offset % 4 != 0 {
        return Err(EpfError::invalid_argument(format!(
            "MMIO offset {offset:#x} not 32-bit aligned"
        )));
    }
    check_range(size, offset, 4)
}

pub(crate) fn check_range(size: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(EpfError::invalid_argument(format!(
            "MMIO range {offset:#x}+{len:#x} outside {size:#x}-byte window"
        ))),
    }
}

/// sysfs resource file of a BAR
#[must_use]
pub fn resource_path(bdf: &str, bar: usize) -> PathBuf {
    PathBuf::from(format!("/sys/bus/pci/devices/{bdf}/resource{bar}"))
}

/// BAR mapped from a file
pub struct MappedRegion {
    /// Memory-mapped pointer
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// File the mapping came from
    path: PathBuf,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("path", &self.path)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively. Moving between threads
// doesn't invalidate it (mmap'd memory is process-wide). No thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - every access is a bounds-checked volatile load or store of a
// naturally aligned word or a single byte; the device defines the semantics of
// concurrent MMIO, exactly as for two CPUs touching the same BAR.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map the whole file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is empty, or the
    /// mapping fails.
    pub fn map(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        #[allow(clippy::cast_possible_truncation)]
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(EpfError::invalid_argument(format!(
                "{} is empty, nothing to map",
                path.display()
            )));
        }
        Self::map_file(&file, size, path)
    }

    /// Map BAR `bar` of PCI function `bdf` through sysfs
    ///
    /// # Errors
    ///
    /// Same as [`MappedRegion::map`].
    pub fn map_bar(bdf: &str, bar: usize) -> Result<Self> {
        Self::map(resource_path(bdf, bar))
    }

    fn map_file(file: &File, size: usize, path: &Path) -> Result<Self> {
        // SAFETY: mmap necessary for MMIO - maps the BAR resource into the process.
        // Invariants: (1) file open read/write; (2) size is the file length;
        // (3) shared mapping so stores reach the device; (4) ptr valid for size
        // bytes or Err. Caller guarantees: file outlives the call (mapping does
        // not depend on the fd afterwards).
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| {
                EpfError::invalid_argument(format!("Failed to mmap {}: {e}", path.display()))
            })?
        };

        tracing::info!("Mapped {} at {:p}, size={:#x}", path.display(), ptr, size);

        Ok(Self {
            ptr: ptr.cast(),
            size,
            path: path.to_path_buf(),
        })
    }

    /// File backing the mapping
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Mmio for MappedRegion {
    fn size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> Result<u32> {
        check_word(self.size, offset)?;
        // SAFETY: read_volatile necessary for MMIO - the peer can change the value.
        // Invariants: (1) ptr from mmap, valid for self.size; (2) offset+4 <= size;
        // (3) offset 4-aligned on a page-aligned base.
        Ok(unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) })
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        check_word(self.size, offset)?;
        // SAFETY: write_volatile necessary for MMIO - the store must reach the device.
        // Invariants: (1) ptr from mmap; (2) offset+4 <= size; (3) u32 aligned.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value) };
        Ok(())
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        for (i, b) in buf.iter_mut().enumerate() {
            // SAFETY: offset+i < size checked above; byte access has no alignment needs.
            *b = unsafe { std::ptr::read_volatile(self.ptr.add(offset + i)) };
        }
        Ok(())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_range(self.size, offset, data.len())?;
        for (i, b) in data.iter().enumerate() {
            // SAFETY: offset+i < size checked above; byte access has no alignment needs.
            unsafe { std::ptr::write_volatile(self.ptr.add(offset + i), *b) };
        }
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap necessary - ptr/size are exactly the mapping created in
        // map_file(); Drop runs at most once and no references outlive self.
        unsafe {
            // Ignore error in Drop (can't propagate)
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped {}", self.path.display());
    }
}
