// SPDX-License-Identifier: AGPL-3.0-only

//! In-process memory windows and bus address maps
//!
//! [`MemWindow`] stands in for a piece of memory both SoCs can reach: the EP
//! register BAR, the EP memory BAR, the RC reserved range. It is a slice of
//! atomic 32-bit words with little-endian byte lanes, so 32-bit MMIO, byte
//! copies and DMA from different threads never tear a word.
//!
//! [`BusMap`] resolves bus addresses to windows. Each side has one for its DMA
//! engine and one for CPU access (tail copies).

use crate::error::{EpfError, Result};
use crate::mmio::{check_range, check_word, Mmio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Called with the written value after a 32-bit store hits a trapped offset
pub type TrapHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Shared memory window
pub struct MemWindow {
    name: String,
    words: Box<[AtomicU32]>,
    size: usize,
    mapped: AtomicBool,
    traps: RwLock<Vec<(usize, TrapHandler)>>,
}

impl std::fmt::Debug for MemWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemWindow")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mapped", &self.is_mapped())
            .finish_non_exhaustive()
    }
}

impl MemWindow {
    /// Zero-filled window of `size` bytes (rounded up to a whole word)
    pub fn new(name: impl Into<String>, size: usize) -> Arc<Self> {
        let size = size.div_ceil(4) * 4;
        let words = (0..size / 4).map(|_| AtomicU32::new(0)).collect();
        Arc::new(Self {
            name: name.into(),
            words,
            size,
            mapped: AtomicBool::new(true),
            traps: RwLock::new(Vec::new()),
        })
    }

    /// Window name, for logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke `handler` after every 32-bit store to `offset`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `offset` is not a valid word offset.
    pub fn set_trap(&self, offset: usize, handler: TrapHandler) -> Result<()> {
        check_word(self.size, offset)?;
        self.traps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((offset, handler));
        Ok(())
    }

    /// Tear the window down; every later access fails with `DeviceGone`
    pub fn unmap(&self) {
        self.mapped.store(false, Ordering::Release);
        tracing::debug!("Window {} unmapped", self.name);
    }

    /// Whether the window is still mapped
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    fn alive(&self) -> Result<()> {
        if self.is_mapped() {
            Ok(())
        } else {
            Err(EpfError::device_gone(format!("{} unmapped", self.name)))
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn load_byte(&self, idx: usize) -> u8 {
        let shift = (idx % 4) * 8;
        (self.words[idx / 4].load(Ordering::Relaxed) >> shift) as u8
    }

    fn store_byte(&self, idx: usize, value: u8) {
        let shift = (idx % 4) * 8;
        let mask = 0xFFu32 << shift;
        // fetch_update never fails when the closure always returns Some
        let _ = self.words[idx / 4].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
            Some((w & !mask) | (u32::from(value) << shift))
        });
    }

    /// Copy `len` bytes from `self[src_off..]` into `dst[dst_off..]`
    ///
    /// Word-at-a-time when both offsets and the length allow it. Overlapping
    /// ranges within one window are rejected.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for out-of-range or overlapping ranges,
    /// `DeviceGone` if either window is unmapped.
    pub fn copy_to(&self, src_off: usize, dst: &Self, dst_off: usize, len: usize) -> Result<()> {
        self.alive()?;
        dst.alive()?;
        check_range(self.size, src_off, len)?;
        check_range(dst.size, dst_off, len)?;
        if std::ptr::eq(self, dst) && src_off < dst_off + len && dst_off < src_off + len {
            return Err(EpfError::invalid_argument(format!(
                "overlapping copy in {}: {src_off:#x} -> {dst_off:#x} ({len} bytes)",
                self.name
            )));
        }

        let mut done = 0;
        if src_off % 4 == 0 && dst_off % 4 == 0 {
            let words = len / 4;
            let (s, d) = (src_off / 4, dst_off / 4);
            for i in 0..words {
                let v = self.words[s + i].load(Ordering::Relaxed);
                dst.words[d + i].store(v, Ordering::Relaxed);
            }
            done = words * 4;
        }
        for i in done..len {
            dst.store_byte(dst_off + i, self.load_byte(src_off + i));
        }
        Ok(())
    }

    /// Fill `len` bytes at `offset` with `value`
    ///
    /// # Errors
    ///
    /// Same as [`Mmio::write_bytes`].
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.alive()?;
        check_range(self.size, offset, len)?;
        for i in 0..len {
            self.store_byte(offset + i, value);
        }
        Ok(())
    }
}

impl Mmio for MemWindow {
    fn size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> Result<u32> {
        self.alive()?;
        check_word(self.size, offset)?;
        Ok(self.words[offset / 4].load(Ordering::Relaxed))
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.alive()?;
        check_word(self.size, offset)?;
        self.words[offset / 4].store(value, Ordering::Relaxed);

        let traps = self.traps.read().unwrap_or_else(PoisonError::into_inner);
        for (_, handler) in traps.iter().filter(|(off, _)| *off == offset) {
            handler(value);
        }
        Ok(())
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.alive()?;
        check_range(self.size, offset, buf.len())?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.load_byte(offset + i);
        }
        Ok(())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.alive()?;
        check_range(self.size, offset, data.len())?;
        for (i, b) in data.iter().enumerate() {
            self.store_byte(offset + i, *b);
        }
        Ok(())
    }
}

/// One bus range backed by part of a window
#[derive(Debug, Clone)]
pub struct BusRegion {
    /// First bus address
    pub base: u64,
    /// Length in bytes
    pub len: usize,
    /// Backing window
    pub window: Arc<MemWindow>,
    /// Offset of `base` inside the window
    pub offset: usize,
}

impl BusRegion {
    fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && (addr - self.base)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.len as u64)
    }
}

/// Bus address → window resolution
#[derive(Debug, Clone, Default)]
pub struct BusMap {
    regions: Vec<BusRegion>,
}

impl BusMap {
    /// Empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map bus range `[base, base + window.size())` onto the whole window
    #[must_use]
    pub fn with_window(self, base: u64, window: Arc<MemWindow>) -> Self {
        let len = window.size();
        self.with_region(base, window, 0, len)
    }

    /// Map bus range `[base, base + len)` onto `window[offset..]`
    #[must_use]
    pub fn with_region(mut self, base: u64, window: Arc<MemWindow>, offset: usize, len: usize) -> Self {
        self.regions.push(BusRegion {
            base,
            len,
            window,
            offset,
        });
        self
    }

    /// Resolve `[addr, addr + len)` to a window and byte offset
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if no single region covers the range.
    #[allow(clippy::cast_possible_truncation)]
    pub fn resolve(&self, addr: u64, len: usize) -> Result<(&Arc<MemWindow>, usize)> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, len))
            .map(|r| (&r.window, r.offset + (addr - r.base) as usize))
            .ok_or_else(|| {
                EpfError::invalid_argument(format!(
                    "bus range {addr:#x}+{len:#x} is not mapped"
                ))
            })
    }

    /// Copy between two bus addresses
    ///
    /// # Errors
    ///
    /// Propagates resolution and window errors.
    pub fn copy(&self, src: u64, dst: u64, len: usize) -> Result<()> {
        let (sw, so) = self.resolve(src, len)?;
        let (dw, doff) = self.resolve(dst, len)?;
        sw.copy_to(so, dw, doff, len)
    }

    /// Read bytes at a bus address
    ///
    /// # Errors
    ///
    /// Propagates resolution and window errors.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (w, off) = self.resolve(addr, buf.len())?;
        w.read_bytes(off, buf)
    }

    /// Write bytes at a bus address
    ///
    /// # Errors
    ///
    /// Propagates resolution and window errors.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let (w, off) = self.resolve(addr, data.len())?;
        w.write_bytes(off, data)
    }
}
