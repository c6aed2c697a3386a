// SPDX-License-Identifier: AGPL-3.0-only

//! DMA plane: the four transfer primitives
//!
//! ```text
//! Primitive  Runs on  Engine    Direction   Remote side of the copy
//! ───────── ──────── ───────── ─────────── ──────────────────────────────
//! EP-OB      EP       EP DMA    MEM→DEV     subdevice_rmem[i] (RC memory)
//! EP-IB      EP       EP DMA    DEV→MEM     subdevice_rmem[i] (RC memory)
//! RC-OB      RC       RC DMA    MEM→DEV     ep_window[i] in the EP mem BAR
//! RC-IB      RC       RC DMA    DEV→MEM     ep_window[i] in the EP mem BAR
//! ```
//!
//! Every primitive is synchronous. Arguments are validated before any MCB
//! write, addresses against the stricter of [`DMA_ALIGN`] and the engine's
//! own alignment; a rejected call leaves nothing for the peer to observe. A
//! failed DMA bumps no counter.
//!
//! [`DMA_ALIGN`]: epf_proto::limits::DMA_ALIGN

use crate::dma::{completion, DmaDescriptor, DmaDirection};
use crate::endpoint::{Endpoint, Phase, SlotState, WaitOpts};
use crate::error::{EpfError, Result};
use crate::mcb::EpWindow;
use epf_proto::bar::BarRole;
use epf_proto::Side;

/// Arguments of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Subdevice slot
    pub idx: usize,
    /// Local bus address (inside a live pool allocation)
    pub local: u64,
    /// EP primitives: RC bus address inside `subdevice_rmem[idx]`.
    /// RC primitives: offset inside the EP's published window.
    pub remote: u64,
    /// Length in bytes
    pub len: usize,
}

impl Transfer {
    /// Transfer on slot `idx`
    #[must_use]
    pub const fn new(idx: usize, local: u64, remote: u64, len: usize) -> Self {
        Self {
            idx,
            local,
            remote,
            len,
        }
    }
}

impl Endpoint {
    /// EP-OB: write `len` bytes of local memory into RC memory
    ///
    /// Waits for the RC's request on the slot unless it was already consumed
    /// with [`Endpoint::wait_msg2ep`]. On completion publishes `sz_msg2rc`,
    /// bumps `wakeup_rc` and rings the RC.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` before anything is touched; `Timeout`/`Cancelled`
    /// while waiting; `DmaFailed` with no counter bumped; `DeviceGone`.
    pub fn ep_outbound(&self, xfer: &Transfer, opts: WaitOpts<'_>) -> Result<()> {
        self.ep_transfer(xfer, DmaDirection::MemToDev, opts)
    }

    /// EP-IB: read `len` bytes of RC memory into local memory
    ///
    /// # Errors
    ///
    /// Same as [`Endpoint::ep_outbound`].
    pub fn ep_inbound(&self, xfer: &Transfer, opts: WaitOpts<'_>) -> Result<()> {
        self.ep_transfer(xfer, DmaDirection::DevToMem, opts)
    }

    /// RC-OB: write `len` bytes of local memory into the EP's published
    /// window
    ///
    /// Waits for the EP's window publication on the slot. On completion
    /// publishes `sz_msg2ep`, bumps `wakeup_ep` and rings the EP.
    ///
    /// # Errors
    ///
    /// Same as [`Endpoint::ep_outbound`]; `PeerNotReady` while an exchange
    /// on the slot is still pending.
    pub fn rc_outbound(&self, xfer: &Transfer, opts: WaitOpts<'_>) -> Result<()> {
        self.rc_transfer(xfer, DmaDirection::MemToDev, opts)
    }

    /// RC-IB: read `len` bytes of the EP's published window into local memory
    ///
    /// # Errors
    ///
    /// Same as [`Endpoint::rc_outbound`].
    pub fn rc_inbound(&self, xfer: &Transfer, opts: WaitOpts<'_>) -> Result<()> {
        self.rc_transfer(xfer, DmaDirection::DevToMem, opts)
    }

    /// Single-direction EP transfer on subdevice 0 without MCB publication
    ///
    /// # Errors
    ///
    /// Validation and DMA errors as for [`Endpoint::ep_outbound`].
    pub fn raw_transfer(&self, remote: u64, local: u64, len: usize, dir: DmaDirection) -> Result<()> {
        let xfer = Transfer::new(0, local, remote, len);
        self.validate(&xfer, Side::Ep, "raw transfer")?;
        self.check_rmem(&xfer)?;

        let _slot = self.lock_slot(0)?;
        let (src, dst) = endpoints(dir, xfer.local, xfer.remote);
        self.track(self.move_bytes(src, dst, len, dir))
    }

    fn validate(&self, xfer: &Transfer, side: Side, op: &str) -> Result<u32> {
        self.check_side(side, op)?;
        self.check_alive()?;
        let len = Self::check_len(xfer.len)?;
        self.check_index(xfer.idx)?;
        self.check_local(xfer.local, xfer.len)?;
        Self::check_aligned("remote", xfer.remote, self.dma_align())?;
        Ok(len)
    }

    /// RC bounds known before waiting: the subdevice capacity, the EP memory
    /// BAR and, when the EP's publication is already in, its window
    fn check_rc_bounds(&self, xfer: &Transfer, slot: &SlotState) -> Result<()> {
        let mcb = self.control_block();
        let capacity = self.track(mcb.rmem(xfer.idx))?.map_or(0, |r| u64::from(r.size));
        let bar = self.bar(BarRole::Memory).map_or(0, |b| b.size() as u64);
        let end = xfer.remote.checked_add(xfer.len as u64);
        if !end.is_some_and(|end| end <= capacity.min(bar)) {
            return Err(EpfError::invalid_argument(format!(
                "window offset {:#x}+{:#x} exceeds subdevice {} capacity {:#x}",
                xfer.remote,
                xfer.len,
                xfer.idx,
                capacity.min(bar)
            )));
        }
        let pending = slot.armed || self.track(mcb.wakeup(Side::Rc, xfer.idx))? != slot.cursor;
        if pending {
            if let Some(window) = self.track(mcb.window(xfer.idx))? {
                self.window_target(xfer, window)?;
            }
        }
        Ok(())
    }

    /// Bus address of `xfer.remote` inside `window`
    fn window_target(&self, xfer: &Transfer, window: EpWindow) -> Result<u64> {
        let fits = xfer
            .remote
            .checked_add(xfer.len as u64)
            .is_some_and(|end| end <= u64::from(window.size));
        if !fits {
            return Err(EpfError::invalid_argument(format!(
                "window offset {:#x}+{:#x} beyond ep_window[{}] size {:#x}",
                xfer.remote, xfer.len, xfer.idx, window.size
            )));
        }
        let remote = self.mem_base() + u64::from(window.offset) + xfer.remote;
        Self::check_aligned("window", remote, self.dma_align())?;
        Ok(remote)
    }

    fn check_rmem(&self, xfer: &Transfer) -> Result<()> {
        let region = self.track(self.control_block().rmem(xfer.idx))?.ok_or_else(|| {
            EpfError::invalid_argument(format!("subdevice_rmem[{}] not published", xfer.idx))
        })?;
        if region.covers(xfer.remote, xfer.len) {
            Ok(())
        } else {
            Err(EpfError::invalid_argument(format!(
                "remote {:#x}+{:#x} outside subdevice_rmem[{}] = {:#x}+{:#x}",
                xfer.remote, xfer.len, xfer.idx, region.start, region.size
            )))
        }
    }

    fn ep_transfer(&self, xfer: &Transfer, dir: DmaDirection, opts: WaitOpts<'_>) -> Result<()> {
        let len = self.validate(xfer, Side::Ep, "EP transfer")?;
        self.check_rmem(xfer)?;

        let mut slot = self.lock_slot(xfer.idx)?;
        let mut consumed = false;
        let result = (|| -> Result<()> {
            self.take_event(&mut slot, xfer.idx, opts)?;
            consumed = true;
            slot.phase = Phase::DmaRun;
            let (src, dst) = endpoints(dir, xfer.local, xfer.remote);
            self.move_bytes(src, dst, xfer.len, dir)?;
            self.notify_peer(xfer.idx, len)?;
            slot.phase = Phase::Done;
            Ok(())
        })();
        // A retry answers the same request
        slot.armed = consumed && result.is_err();
        slot.phase = Phase::Idle;
        self.track(result)
    }

    /// Use the request already consumed on the slot, or wait for the next one
    fn take_event(
        &self,
        slot: &mut SlotState,
        idx: usize,
        opts: WaitOpts<'_>,
    ) -> Result<()> {
        if slot.armed {
            slot.armed = false;
            Ok(())
        } else {
            self.wait_peer(slot, idx, opts)
        }
    }

    fn rc_transfer(&self, xfer: &Transfer, dir: DmaDirection, opts: WaitOpts<'_>) -> Result<()> {
        let len = self.validate(xfer, Side::Rc, "RC transfer")?;

        let mut slot = self.lock_slot(xfer.idx)?;
        if slot.pending_exchange {
            return Err(EpfError::peer_not_ready(format!(
                "exchange on subdevice {} still pending",
                xfer.idx
            )));
        }
        self.check_rc_bounds(xfer, &slot)?;
        let mut consumed = false;
        let result = (|| -> Result<()> {
            self.take_event(&mut slot, xfer.idx, opts)?;
            consumed = true;
            // The publication may have changed while waiting
            let window = self.control_block().window(xfer.idx)?.ok_or_else(|| {
                EpfError::invalid_argument(format!("ep_window[{}] not published", xfer.idx))
            })?;
            let remote = self.window_target(xfer, window)?;

            slot.phase = Phase::DmaRun;
            let (src, dst) = endpoints(dir, xfer.local, remote);
            self.move_bytes(src, dst, xfer.len, dir)?;
            self.notify_peer(xfer.idx, len)?;
            slot.phase = Phase::Done;
            Ok(())
        })();
        slot.armed = consumed && result.is_err();
        slot.phase = Phase::Idle;
        self.track(result)
    }

    /// Copy `len` bytes: burst-aligned head by DMA, remaining tail by the CPU
    pub(crate) fn move_bytes(&self, src: u64, dst: u64, len: usize, dir: DmaDirection) -> Result<()> {
        let burst = self.dma().min_burst().max(1);
        let head = len - len % burst;

        if head > 0 {
            let channel = self.channels().acquire(self.config().wait_timeout)?;
            let (done, signal) = completion();
            let desc = DmaDescriptor {
                src,
                dst,
                len: head,
                direction: dir,
            };
            tracing::debug!(
                "{} DMA {:?} {src:#x} -> {dst:#x} head {head:#x} of {len:#x}",
                self.side(),
                dir
            );
            self.dma()
                .submit(channel.id(), desc, signal)
                .and_then(|()| done.wait(self.config().dma_watchdog))
                .inspect_err(|e| tracing::warn!("{} DMA failed: {e}", self.side()))?;
        }

        if head < len {
            let tail = len - head;
            let off = head as u64;
            self.bus()
                .copy(src + off, dst + off, tail)
                .map_err(|e| match e {
                    EpfError::DeviceGone { .. } => e,
                    other => EpfError::dma_failed(format!("tail copy: {other}")),
                })?;
        }
        Ok(())
    }

    /// Send `data` to the peer through slot `idx`
    ///
    /// EP: EP-OB into the start of `subdevice_rmem[idx]`. RC: RC-OB into the
    /// start of the EP's published window. A bounce buffer is taken from the
    /// local pool and returned before this returns.
    ///
    /// # Errors
    ///
    /// Pool errors and those of the underlying primitive.
    pub fn send_to_peer(&self, idx: usize, data: &[u8], opts: WaitOpts<'_>) -> Result<()> {
        self.check_index(idx)?;
        let buf = self.alloc(data.len())?;
        buf.write(0, data)?;
        match self.side() {
            Side::Ep => {
                let remote = self.peer_region_start(idx)?;
                self.ep_outbound(&Transfer::new(idx, buf.bus_addr(), remote, data.len()), opts)
            }
            Side::Rc => self.rc_outbound(&Transfer::new(idx, buf.bus_addr(), 0, data.len()), opts),
        }
    }

    /// Receive `len` bytes from the peer through slot `idx`
    ///
    /// # Errors
    ///
    /// Same as [`Endpoint::send_to_peer`].
    pub fn recv_from_peer(&self, idx: usize, len: usize, opts: WaitOpts<'_>) -> Result<Vec<u8>> {
        self.check_index(idx)?;
        let buf = self.alloc(len)?;
        match self.side() {
            Side::Ep => {
                let remote = self.peer_region_start(idx)?;
                self.ep_inbound(&Transfer::new(idx, buf.bus_addr(), remote, len), opts)?;
            }
            Side::Rc => self.rc_inbound(&Transfer::new(idx, buf.bus_addr(), 0, len), opts)?,
        }
        buf.to_vec()
    }

    fn peer_region_start(&self, idx: usize) -> Result<u64> {
        self.track(self.control_block().rmem(idx))?
            .map(|r| r.start)
            .ok_or_else(|| EpfError::invalid_argument(format!("subdevice_rmem[{idx}] not published")))
    }
}

/// `(src, dst)` of a transfer between `local` and `remote`
const fn endpoints(dir: DmaDirection, local: u64, remote: u64) -> (u64, u64) {
    match dir {
        DmaDirection::MemToDev => (local, remote),
        DmaDirection::DevToMem => (remote, local),
    }
}
