// SPDX-License-Identifier: AGPL-3.0-only

//! Per-side DMA pools
//!
//! A pool hands out bus-addressable buffers from one contiguous range: the
//! reserved RC memory on the RC, the memory BAR on the EP. First-fit over a
//! sorted allocation list, [`POOL_GRANULE`]-aligned.

use crate::error::{EpfError, Result};
use crate::memory::MemWindow;
use crate::mmio::Mmio;
use epf_proto::limits::POOL_GRANULE;
use std::sync::{Arc, Mutex, PoisonError};

/// Live allocation: `(offset, reserved length, requested length)`
type Span = (usize, usize, usize);

/// DMA-coherent buffer pool
#[derive(Debug)]
pub struct DmaPool {
    name: String,
    bus_base: u64,
    window: Arc<MemWindow>,
    window_offset: usize,
    size: usize,
    spans: Mutex<Vec<Span>>,
}

impl DmaPool {
    /// Pool over `window[window_offset..window_offset + size]`, seen at
    /// `bus_base` on the bus
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the range leaves the window or the bus
    /// base is not granule-aligned.
    pub fn new(
        name: impl Into<String>,
        bus_base: u64,
        window: Arc<MemWindow>,
        window_offset: usize,
        size: usize,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if window_offset.checked_add(size).map_or(true, |end| end > window.size()) {
            return Err(EpfError::invalid_argument(format!(
                "{name}: {window_offset:#x}+{size:#x} outside {}",
                window.name()
            )));
        }
        if bus_base % POOL_GRANULE as u64 != 0 {
            return Err(EpfError::invalid_argument(format!(
                "{name}: bus base {bus_base:#x} not {POOL_GRANULE}-byte aligned"
            )));
        }
        tracing::info!("{name}: pool {bus_base:#x}+{size:#x}");
        Ok(Arc::new(Self {
            name,
            bus_base,
            window,
            window_offset,
            size,
            spans: Mutex::new(Vec::new()),
        }))
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First bus address of the pool
    #[must_use]
    pub const fn bus_base(&self) -> u64 {
        self.bus_base
    }

    /// Pool size in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently reserved
    pub fn in_use(&self) -> usize {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.1)
            .sum()
    }

    /// Allocate `len` bytes
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for `len == 0`, `ResourceExhausted` when no hole is
    /// large enough.
    pub fn alloc(self: &Arc<Self>, len: usize) -> Result<PoolBuffer> {
        if len == 0 {
            return Err(EpfError::invalid_argument("zero-length pool allocation"));
        }
        let reserved = len
            .checked_next_multiple_of(POOL_GRANULE)
            .ok_or_else(|| EpfError::exhausted(format!("{}: {len:#x} bytes", self.name)))?;

        let mut spans = self.spans.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cursor = 0usize;
        let mut slot = spans.len();
        for (i, &(off, res, _)) in spans.iter().enumerate() {
            if off - cursor >= reserved {
                slot = i;
                break;
            }
            cursor = off + res;
        }
        if slot == spans.len() && self.size - cursor < reserved {
            return Err(EpfError::exhausted(format!(
                "{}: no {reserved:#x}-byte hole ({:#x} of {:#x} in use)",
                self.name,
                spans.iter().map(|s| s.1).sum::<usize>(),
                self.size
            )));
        }
        spans.insert(slot, (cursor, reserved, len));
        drop(spans);

        tracing::trace!("{}: alloc {len:#x} at +{cursor:#x}", self.name);
        Ok(PoolBuffer {
            pool: self.clone(),
            offset: cursor,
            len,
        })
    }

    /// Whether `[addr, addr + len)` lies inside the requested bytes of one
    /// live allocation; granule padding does not count
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let Some(rel) = addr.checked_sub(self.bus_base) else {
            return false;
        };
        let Some(end) = rel.checked_add(len as u64) else {
            return false;
        };
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|&(off, _, want)| rel >= off as u64 && end <= (off + want) as u64)
    }

    fn release(&self, offset: usize) {
        let mut spans = self.spans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(i) = spans.binary_search_by_key(&offset, |s| s.0) {
            spans.remove(i);
        }
    }
}

/// A pool allocation, returned to the pool on drop
#[derive(Debug)]
pub struct PoolBuffer {
    pool: Arc<DmaPool>,
    offset: usize,
    len: usize,
}

impl PoolBuffer {
    /// Bus address of the first byte
    #[must_use]
    pub fn bus_addr(&self) -> u64 {
        self.pool.bus_base + self.offset as u64
    }

    /// Requested length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length allocations are refused
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pool the buffer came from
    #[must_use]
    pub fn pool(&self) -> &Arc<DmaPool> {
        &self.pool
    }

    fn check(&self, at: usize, len: usize) -> Result<usize> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.pool.window_offset + self.offset + at),
            _ => Err(EpfError::invalid_argument(format!(
                "buffer access {at:#x}+{len:#x} beyond {:#x}",
                self.len
            ))),
        }
    }

    /// Copy `data` into the buffer at `at`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` past the end; window errors.
    pub fn write(&self, at: usize, data: &[u8]) -> Result<()> {
        let off = self.check(at, data.len())?;
        self.pool.window.write_bytes(off, data)
    }

    /// Copy from the buffer at `at` into `buf`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` past the end; window errors.
    pub fn read(&self, at: usize, buf: &mut [u8]) -> Result<()> {
        let off = self.check(at, buf.len())?;
        self.pool.window.read_bytes(off, buf)
    }

    /// The whole buffer as a vector
    ///
    /// # Errors
    ///
    /// Window errors.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut v = vec![0u8; self.len];
        self.read(0, &mut v)?;
        Ok(v)
    }

    /// Fill the whole buffer with `value`
    ///
    /// # Errors
    ///
    /// Window errors.
    pub fn fill(&self, value: u8) -> Result<()> {
        self.pool
            .window
            .fill(self.pool.window_offset + self.offset, self.len, value)
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        self.pool.release(self.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize) -> Arc<DmaPool> {
        let w = MemWindow::new("mem", size + 0x1000);
        DmaPool::new("test", 0x8000_0000, w, 0x1000, size).unwrap()
    }

    #[test]
    fn first_fit_reuses_holes() {
        let p = pool(0x1000);
        let a = p.alloc(100).unwrap();
        let b = p.alloc(64).unwrap();
        assert_eq!(a.bus_addr(), 0x8000_0000);
        assert_eq!(b.bus_addr(), 0x8000_0080);
        drop(a);
        let c = p.alloc(128).unwrap();
        assert_eq!(c.bus_addr(), 0x8000_0000);
        assert_eq!(p.in_use(), 192);
    }

    #[test]
    fn exhaustion_and_release() {
        let p = pool(0x100);
        let a = p.alloc(0x100).unwrap();
        assert!(matches!(p.alloc(1), Err(EpfError::ResourceExhausted { .. })));
        drop(a);
        assert_eq!(p.in_use(), 0);
        assert!(p.alloc(0x100).is_ok());
        assert!(matches!(p.alloc(0), Err(EpfError::InvalidArgument { .. })));
    }

    #[test]
    fn contains_checks_live_allocations_only() {
        let p = pool(0x1000);
        let a = p.alloc(0x200).unwrap();
        let base = a.bus_addr();
        assert!(p.contains(base, 0x200));
        assert!(p.contains(base + 8, 0x100));
        assert!(!p.contains(base + 0x200, 8));
        assert!(!p.contains(base - 8, 16));
        drop(a);
        assert!(!p.contains(base, 8));

        // 100 bytes reserve 128; the padding is not addressable
        let a = p.alloc(100).unwrap();
        let base = a.bus_addr();
        assert!(p.contains(base, 100));
        assert!(!p.contains(base, 104));
        assert!(!p.contains(base + 96, 8));
        drop(a);
        assert!(!p.contains(base, 8));
    }

    #[test]
    fn buffer_io_stays_in_bounds() {
        let p = pool(0x1000);
        let a = p.alloc(16).unwrap();
        a.write(8, &[1, 2, 3, 4]).unwrap();
        let mut b = [0u8; 4];
        a.read(8, &mut b).unwrap();
        assert_eq!(b, [1, 2, 3, 4]);
        assert!(a.write(14, &[0; 4]).is_err());
        a.fill(0xEE).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![0xEE; 16]);
    }

    #[test]
    fn range_outside_window_rejected() {
        let w = MemWindow::new("mem", 0x1000);
        assert!(DmaPool::new("bad", 0, w, 0x800, 0x1000).is_err());
    }
}
