// SPDX-License-Identifier: AGPL-3.0-only

//! One side's view of one link
//!
//! An [`Endpoint`] owns everything a side needs to drive the protocol: the
//! MCB handle, the doorbell towards the peer, its wait queues and interrupt
//! statistics, its DMA engine and channels, its pool, and one FIFO lock per
//! subdevice slot. RC and EP endpoints share the type; operations check the
//! side they are invoked on.
//!
//! Side-specific operations live in [`crate::rc`], [`crate::ep`] and
//! [`crate::plane`].

use crate::config::TransportConfig;
use crate::dma::{DmaChannels, DmaEngine};
use crate::doorbell::{Doorbell, Interrupts};
use crate::error::{EpfError, Result};
use crate::lock::{TicketGuard, TicketLock};
use crate::mcb::ControlBlock;
use crate::memory::BusMap;
use crate::mmio::Mmio;
use crate::pool::{DmaPool, PoolBuffer};
use crate::wait::{wait_for_advance, CancelToken, Wait};
use epf_proto::bar::{BarRole, NUM_BARS};
use epf_proto::limits::{DMA_ALIGN, MAX_SUB};
use epf_proto::{Side, TransportKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// BAR views of a link, indexed by BAR number
pub type BarSet = [Option<Arc<dyn Mmio>>; NUM_BARS];

/// Per-slot state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Nothing in flight
    #[default]
    Idle,
    /// Request published to the peer
    Published,
    /// Sleeping on the peer's counter
    Waiting,
    /// DMA submitted
    DmaRun,
    /// Completion published
    Done,
}

/// State guarded by a slot lock
#[derive(Debug, Default)]
pub struct SlotState {
    /// Last consumed value of this side's wake counter
    pub cursor: u32,
    /// Where the slot is in its current operation
    pub phase: Phase,
    /// RC: an exchange was published and its reply not yet consumed
    pub pending_exchange: bool,
    /// A peer event was consumed and not yet answered: by the EP wait
    /// ioctl, or by a transfer that failed after its wait
    pub armed: bool,
}

/// Per-call wait options
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitOpts<'a> {
    /// Deadline; the endpoint's configured timeout when `None`
    pub deadline: Option<Duration>,
    /// Cancellation token (signal delivery)
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> WaitOpts<'a> {
    /// Explicit deadline
    #[must_use]
    pub const fn deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Attach a cancellation token
    #[must_use]
    pub const fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// `SUBDEVICES_INFO` contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdeviceInfo {
    /// Active subdevices
    pub nr: u32,
    /// `(start_addr, size)` of every slot; size 0 when unpublished
    pub regions: [(u64, u32); MAX_SUB],
}

/// Pieces handed to [`Endpoint::assemble`] by the probe routines
pub(crate) struct Parts {
    pub side: Side,
    pub bdf: String,
    pub config: TransportConfig,
    pub bars: BarSet,
    pub mcb: ControlBlock,
    pub nr_subdevices: usize,
    pub doorbell: Doorbell,
    pub irq: Arc<Interrupts>,
    pub dma: Arc<dyn DmaEngine>,
    pub pool: Arc<DmaPool>,
    pub bus: BusMap,
    pub mem_base: u64,
    pub regions: Vec<PoolBuffer>,
    pub cursors: Vec<u32>,
}

/// One side of a link
pub struct Endpoint {
    side: Side,
    bdf: String,
    config: TransportConfig,
    bars: BarSet,
    mcb: ControlBlock,
    nr_subdevices: usize,
    doorbell: Doorbell,
    irq: Arc<Interrupts>,
    dma: Arc<dyn DmaEngine>,
    channels: DmaChannels,
    pool: Arc<DmaPool>,
    bus: BusMap,
    mem_base: u64,
    regions: Vec<PoolBuffer>,
    slots: Vec<TicketLock<SlotState>>,
    dead: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("side", &self.side)
            .field("bdf", &self.bdf)
            .field("transport", &self.transport())
            .field("nr_subdevices", &self.nr_subdevices)
            .field("doorbell", &self.doorbell.method())
            .field("dma", &self.dma.name())
            .field("dead", &self.is_dead())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub(crate) fn assemble(parts: Parts) -> Self {
        let channels = DmaChannels::new(parts.dma.channels().min(parts.config.dma_channels).max(1));
        let slots = parts
            .cursors
            .into_iter()
            .map(|cursor| {
                TicketLock::new(SlotState {
                    cursor,
                    ..SlotState::default()
                })
            })
            .collect();
        Self {
            side: parts.side,
            bdf: parts.bdf,
            config: parts.config,
            bars: parts.bars,
            mcb: parts.mcb,
            nr_subdevices: parts.nr_subdevices,
            doorbell: parts.doorbell,
            irq: parts.irq,
            dma: parts.dma,
            channels,
            pool: parts.pool,
            bus: parts.bus,
            mem_base: parts.mem_base,
            regions: parts.regions,
            slots,
            dead: AtomicBool::new(false),
        }
    }

    // ── Identity ────────────────────────────────────────────────────────────

    /// Side of the link this endpoint drives
    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    /// Bus/device/function of the peer (RC) or of the function itself (EP)
    #[must_use]
    pub fn bdf(&self) -> &str {
        &self.bdf
    }

    /// Transport layout in use
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.mcb.layout().kind()
    }

    /// Configuration the endpoint was probed with
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Active subdevices
    #[must_use]
    pub const fn nr_subdevices(&self) -> usize {
        self.nr_subdevices
    }

    /// MCB handle
    #[must_use]
    pub const fn control_block(&self) -> &ControlBlock {
        &self.mcb
    }

    /// BAR view with the given role, if mapped
    #[must_use]
    pub fn bar(&self, role: BarRole) -> Option<&Arc<dyn Mmio>> {
        self.bars[role.index()].as_ref()
    }

    /// Every BAR view
    #[must_use]
    pub const fn bars(&self) -> &BarSet {
        &self.bars
    }

    /// Incoming interrupt handler and statistics
    #[must_use]
    pub const fn interrupts(&self) -> &Arc<Interrupts> {
        &self.irq
    }

    /// Doorbell towards the peer
    #[must_use]
    pub const fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    /// This side's DMA pool
    #[must_use]
    pub const fn pool(&self) -> &Arc<DmaPool> {
        &self.pool
    }

    /// RC: base bus address of the EP memory BAR. EP: local bus address of
    /// its own memory BAR.
    #[must_use]
    pub const fn mem_base(&self) -> u64 {
        self.mem_base
    }

    pub(crate) const fn bus(&self) -> &BusMap {
        &self.bus
    }

    pub(crate) fn dma(&self) -> &dyn DmaEngine {
        self.dma.as_ref()
    }

    pub(crate) const fn channels(&self) -> &DmaChannels {
        &self.channels
    }

    /// Allocate a DMA buffer from this side's pool
    ///
    /// # Errors
    ///
    /// `DeviceGone` on a dead endpoint; pool errors.
    pub fn alloc(&self, len: usize) -> Result<PoolBuffer> {
        self.check_alive()?;
        self.pool.alloc(len)
    }

    /// RC: the reserved region published as `subdevice_rmem[idx]`
    ///
    /// # Errors
    ///
    /// `NotSupported` on the EP; `InvalidArgument` for an inactive slot.
    pub fn region(&self, idx: usize) -> Result<&PoolBuffer> {
        self.check_side(Side::Rc, "region")?;
        self.regions.get(idx).ok_or_else(|| {
            EpfError::invalid_argument(format!(
                "subdevice {idx} >= nr_subdevices {}",
                self.nr_subdevices
            ))
        })
    }

    /// Subdevice count and the published regions
    ///
    /// # Errors
    ///
    /// `DeviceGone`, MMIO errors.
    pub fn subdevices_info(&self) -> Result<SubdeviceInfo> {
        self.check_alive()?;
        let mut regions = [(0u64, 0u32); MAX_SUB];
        for (idx, entry) in regions.iter_mut().enumerate() {
            if let Some(r) = self.track(self.mcb.rmem(idx))? {
                *entry = (r.start, r.size);
            }
        }
        Ok(SubdeviceInfo {
            nr: self.track(self.mcb.nr_subdevices())?,
            regions,
        })
    }

    // ── Liveness ────────────────────────────────────────────────────────────

    /// Whether the endpoint has been declared dead
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Declare the endpoint dead; every later operation returns `DeviceGone`
    pub fn mark_dead(&self, reason: &str) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            tracing::error!("{} endpoint {} marked dead: {reason}", self.side, self.bdf);
            self.channels.close();
            self.irq.waits().wake_all();
        }
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.is_dead() {
            Err(EpfError::device_gone(format!("{} endpoint {}", self.side, self.bdf)))
        } else {
            Ok(())
        }
    }

    /// Mark the endpoint dead when `result` carries `DeviceGone`
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(EpfError::DeviceGone { reason }) = &result {
            self.mark_dead(reason);
        }
        result
    }

    // ── Validation ──────────────────────────────────────────────────────────

    pub(crate) fn check_side(&self, side: Side, op: &str) -> Result<()> {
        if self.side == side {
            Ok(())
        } else {
            Err(EpfError::not_supported(format!("{op} on the {} side", self.side)))
        }
    }

    pub(crate) fn check_index(&self, idx: usize) -> Result<()> {
        if idx < self.nr_subdevices {
            Ok(())
        } else {
            Err(EpfError::invalid_argument(format!(
                "subdevice {idx} >= nr_subdevices {}",
                self.nr_subdevices
            )))
        }
    }

    pub(crate) fn check_len(len: usize) -> Result<u32> {
        if len == 0 {
            return Err(EpfError::invalid_argument("zero-length transfer"));
        }
        u32::try_from(len)
            .map_err(|_| EpfError::invalid_argument(format!("length {len:#x} exceeds 32 bits")))
    }

    /// Alignment every DMA address must satisfy on this side
    pub(crate) fn dma_align(&self) -> u64 {
        self.dma.alignment().max(DMA_ALIGN)
    }

    pub(crate) fn check_aligned(what: &str, addr: u64, align: u64) -> Result<()> {
        if addr % align == 0 {
            Ok(())
        } else {
            Err(EpfError::invalid_argument(format!(
                "{what} address {addr:#x} not {align}-byte aligned"
            )))
        }
    }

    /// `[addr, addr + len)` must be an aligned range inside one live allocation
    pub(crate) fn check_local(&self, addr: u64, len: usize) -> Result<()> {
        Self::check_aligned("local", addr, self.dma_align())?;
        if self.pool.contains(addr, len) {
            Ok(())
        } else {
            Err(EpfError::invalid_argument(format!(
                "local range {addr:#x}+{len:#x} is not inside a {} allocation",
                self.pool.name()
            )))
        }
    }

    // ── Slots ───────────────────────────────────────────────────────────────

    /// Lock slot `idx` (FIFO among callers of this side)
    pub(crate) fn lock_slot(&self, idx: usize) -> Result<TicketGuard<'_, SlotState>> {
        self.slots
            .get(idx)
            .map(TicketLock::lock)
            .ok_or_else(|| EpfError::invalid_argument(format!("subdevice {idx} >= {MAX_SUB}")))
    }

    /// Sleep until the peer bumps this side's counter past the slot cursor,
    /// then consume one event
    pub(crate) fn wait_peer(
        &self,
        slot: &mut SlotState,
        idx: usize,
        opts: WaitOpts<'_>,
    ) -> Result<()> {
        let field = ControlBlock::wakeup_field(self.side);
        let what = format!("{}[{idx}]", field.name());
        let prev = slot.phase;
        slot.phase = Phase::Waiting;

        self.mcb.set_waiting(idx, true)?;
        let wait = Wait {
            queue: self.irq.waits().slot(idx)?,
            snapshot: slot.cursor,
            deadline: opts.deadline.unwrap_or(self.config.wait_timeout),
            cancel: opts.cancel,
            what: &what,
        };
        let result = wait_for_advance(&wait, || {
            self.check_alive()?;
            self.mcb.wakeup(self.side, idx)
        });
        let cleared = self.mcb.set_waiting(idx, false);

        match result {
            Ok(_) => {
                slot.cursor = slot.cursor.wrapping_add(1);
                cleared
            }
            Err(e) => {
                slot.phase = prev;
                Err(e)
            }
        }
    }

    /// Publish a completion towards the peer: message size, counter bump,
    /// heartbeat, doorbell
    pub(crate) fn notify_peer(&self, idx: usize, msg: u32) -> Result<()> {
        self.mcb.set_msg_size(idx, msg)?;
        self.mcb.bump_wakeup(idx)?;
        self.mcb.beat()?;
        tracing::debug!("{} ringing peer for slot {idx} (msg {msg:#x})", self.side);
        self.doorbell.ring()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_opts_builders() {
        let token = CancelToken::new();
        let o = WaitOpts::deadline(Duration::from_millis(5)).with_cancel(&token);
        assert_eq!(o.deadline, Some(Duration::from_millis(5)));
        assert!(o.cancel.is_some());
        assert!(WaitOpts::default().deadline.is_none());
    }

    #[test]
    fn length_validation() {
        assert!(Endpoint::check_len(0).is_err());
        assert_eq!(Endpoint::check_len(4096).unwrap(), 4096);
        assert!(Endpoint::check_aligned("x", 0x1004, 8).is_err());
        assert!(Endpoint::check_aligned("x", 0x1008, 8).is_ok());
        assert!(Endpoint::check_aligned("x", 0x1008, 64).is_err());
        assert!(Endpoint::check_aligned("x", 0x1040, 64).is_ok());
    }
}
