// SPDX-License-Identifier: AGPL-3.0-only

//! Control block accessor
//!
//! [`ControlBlock`] is one side's handle on the MCB inside the EP register
//! BAR. Every access is a 32-bit MMIO load or store; nothing is cached.
//! Writes to fields owned by the peer are refused before reaching the bus.

use crate::error::{EpfError, Result};
use crate::mmio::{wmb, Mmio};
use epf_proto::mcb::flags;
use epf_proto::transport::{MOEMOEKYUN_MAGIC, MOEMOEKYUN_VERSION};
use epf_proto::{Field, McbLayout, Side, TransportKind};
use std::sync::Arc;

/// `subdevice_rmem[i]` as published by the RC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    /// RC bus address of the region
    pub start: u64,
    /// Region size in bytes
    pub size: u32,
}

impl RemoteRegion {
    /// Whether `[addr, addr + len)` lies inside the region
    #[must_use]
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.start
            && (addr - self.start)
                .checked_add(len as u64)
                .is_some_and(|end| end <= u64::from(self.size))
    }
}

/// `ep_window[i]` as published by the EP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpWindow {
    /// Offset of the buffer inside the EP memory BAR
    pub offset: u32,
    /// Buffer size in bytes
    pub size: u32,
}

/// MSI mailbox descriptor (`db_bar`, `db_offset`, `db_data`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellDescriptor {
    /// BAR holding the mailbox
    pub bar: u32,
    /// Mailbox offset inside the BAR
    pub offset: u32,
    /// Value to write
    pub data: u32,
}

/// One side's handle on the MCB
#[derive(Debug, Clone)]
pub struct ControlBlock {
    mmio: Arc<dyn Mmio>,
    layout: &'static dyn McbLayout,
    side: Side,
}

impl ControlBlock {
    /// Wrap the register BAR
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the window is smaller than the layout.
    pub fn new(mmio: Arc<dyn Mmio>, transport: TransportKind, side: Side) -> Result<Self> {
        let layout = transport.layout();
        if mmio.size() < layout.size() {
            return Err(EpfError::invalid_argument(format!(
                "register window {:#x} bytes, {transport} layout needs {:#x}",
                mmio.size(),
                layout.size()
            )));
        }
        Ok(Self { mmio, layout, side })
    }

    /// Side this handle writes for
    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    /// Transport layout
    #[must_use]
    pub fn layout(&self) -> &'static dyn McbLayout {
        self.layout
    }

    fn offset(&self, field: Field, idx: usize) -> Result<usize> {
        self.layout.offset(field, idx).ok_or_else(|| {
            EpfError::invalid_argument(format!(
                "{}[{idx}] not present in the {} layout",
                field.name(),
                self.layout.kind()
            ))
        })
    }

    /// Read `field[idx]`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a field or index the layout lacks; MMIO errors.
    pub fn read(&self, field: Field, idx: usize) -> Result<u32> {
        self.mmio.read32(self.offset(field, idx)?)
    }

    /// Write `field[idx]`
    ///
    /// # Errors
    ///
    /// `NotOwner` if the peer owns the field; otherwise as [`ControlBlock::read`].
    pub fn write(&self, field: Field, idx: usize, value: u32) -> Result<()> {
        if field.writer() != self.side {
            return Err(EpfError::NotOwner { field: field.name() });
        }
        self.mmio.write32(self.offset(field, idx)?, value)
    }

    // ── Header ──────────────────────────────────────────────────────────────

    /// `nr_subdevices`
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn nr_subdevices(&self) -> Result<u32> {
        self.read(Field::NrSubdevices, 0)
    }

    /// `flags`
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn flags(&self) -> Result<u32> {
        self.read(Field::Flags, 0)
    }

    /// Whether RC initialisation has completed
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn is_ready(&self) -> Result<bool> {
        Ok(self.flags()? & flags::READY != 0)
    }

    /// Write the MSI mailbox descriptor
    ///
    /// # Errors
    ///
    /// `NotOwner` on the EP side; MMIO errors.
    pub fn set_doorbell_descriptor(&self, db: DoorbellDescriptor) -> Result<()> {
        self.write(Field::DbBar, 0, db.bar)?;
        self.write(Field::DbOffset, 0, db.offset)?;
        self.write(Field::DbData, 0, db.data)
    }

    /// Read the MSI mailbox descriptor
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn doorbell_descriptor(&self) -> Result<DoorbellDescriptor> {
        Ok(DoorbellDescriptor {
            bar: self.read(Field::DbBar, 0)?,
            offset: self.read(Field::DbOffset, 0)?,
            data: self.read(Field::DbData, 0)?,
        })
    }

    // ── Regions ─────────────────────────────────────────────────────────────

    /// Publish `subdevice_rmem[idx]`
    ///
    /// The size word is cleared first and written last, so a reader never
    /// sees a non-zero size with a half-written address.
    ///
    /// # Errors
    ///
    /// `NotOwner` on the EP side; MMIO errors.
    #[allow(clippy::cast_possible_truncation)]
    pub fn publish_rmem(&self, idx: usize, region: RemoteRegion) -> Result<()> {
        self.write(Field::RmemSize, idx, 0)?;
        wmb();
        self.write(Field::RmemLo, idx, region.start as u32)?;
        self.write(Field::RmemHi, idx, (region.start >> 32) as u32)?;
        wmb();
        self.write(Field::RmemSize, idx, region.size)?;
        tracing::debug!(
            "{} published rmem[{idx}] = {:#x}+{:#x}",
            self.side,
            region.start,
            region.size
        );
        Ok(())
    }

    /// `subdevice_rmem[idx]`, or `None` while its size is zero
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an index outside the layout; MMIO errors.
    pub fn rmem(&self, idx: usize) -> Result<Option<RemoteRegion>> {
        let size = self.read(Field::RmemSize, idx)?;
        if size == 0 {
            return Ok(None);
        }
        let lo = self.read(Field::RmemLo, idx)?;
        let hi = self.read(Field::RmemHi, idx)?;
        Ok(Some(RemoteRegion {
            start: u64::from(hi) << 32 | u64::from(lo),
            size,
        }))
    }

    /// Publish `ep_window[idx]`, size last
    ///
    /// # Errors
    ///
    /// `NotOwner` on the RC side; MMIO errors.
    pub fn publish_window(&self, idx: usize, window: EpWindow) -> Result<()> {
        self.write(Field::EpWindowSize, idx, 0)?;
        wmb();
        self.write(Field::EpWindowOffset, idx, window.offset)?;
        wmb();
        self.write(Field::EpWindowSize, idx, window.size)
    }

    /// `ep_window[idx]`, or `None` while its size is zero
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an index outside the layout; MMIO errors.
    pub fn window(&self, idx: usize) -> Result<Option<EpWindow>> {
        let size = self.read(Field::EpWindowSize, idx)?;
        if size == 0 {
            return Ok(None);
        }
        Ok(Some(EpWindow {
            offset: self.read(Field::EpWindowOffset, idx)?,
            size,
        }))
    }

    // ── Counters and hints ──────────────────────────────────────────────────

    /// Wake counter that wakes `target` (`wakeup_ep` or `wakeup_rc`)
    #[must_use]
    pub const fn wakeup_field(target: Side) -> Field {
        match target {
            Side::Ep => Field::WakeupEp,
            Side::Rc => Field::WakeupRc,
        }
    }

    /// Message size published towards `target` (`sz_msg2ep` or `sz_msg2rc`)
    #[must_use]
    pub const fn msg_field(target: Side) -> Field {
        match target {
            Side::Ep => Field::SzMsg2Ep,
            Side::Rc => Field::SzMsg2Rc,
        }
    }

    /// Current wake counter of `target` for slot `idx`
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn wakeup(&self, target: Side, idx: usize) -> Result<u32> {
        self.read(Self::wakeup_field(target), idx)
    }

    /// Increment the peer's wake counter for slot `idx`
    ///
    /// Preceded by a write barrier so the peer observing the new value also
    /// observes every earlier MCB and data write.
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn bump_wakeup(&self, idx: usize) -> Result<u32> {
        let field = Self::wakeup_field(self.side.peer());
        let next = self.read(field, idx)?.wrapping_add(1);
        wmb();
        self.write(field, idx, next)?;
        tracing::debug!("{} bumped {}[{idx}] -> {next}", self.side, field.name());
        Ok(next)
    }

    /// Message size last published towards `target`
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn msg_size(&self, target: Side, idx: usize) -> Result<u32> {
        self.read(Self::msg_field(target), idx)
    }

    /// Publish the message size towards the peer
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn set_msg_size(&self, idx: usize, value: u32) -> Result<()> {
        self.write(Self::msg_field(self.side.peer()), idx, value)
    }

    /// Set or clear this side's `waiting` hint
    ///
    /// Advisory only; nothing reads it to decide correctness.
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn set_waiting(&self, idx: usize, waiting: bool) -> Result<()> {
        let field = match self.side {
            Side::Ep => Field::WaitingEp,
            Side::Rc => Field::EpWaitingRc,
        };
        self.write(field, idx, u32::from(waiting))
    }

    /// The waiting hint of `side`
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn waiting(&self, side: Side, idx: usize) -> Result<bool> {
        let field = match side {
            Side::Ep => Field::WaitingEp,
            Side::Rc => Field::EpWaitingRc,
        };
        Ok(self.read(field, idx)? != 0)
    }

    // ── Trailer ─────────────────────────────────────────────────────────────

    /// Write magic and version (RC init, moemoekyun only; no-op elsewhere)
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn write_trailer(&self) -> Result<()> {
        if !self.layout.has_trailer() {
            return Ok(());
        }
        self.write(Field::Magic, 0, MOEMOEKYUN_MAGIC)?;
        self.write(Field::Version, 0, MOEMOEKYUN_VERSION)?;
        self.write(Field::HeartbeatRc, 0, 0)
    }

    /// Verify magic and version written by the RC
    ///
    /// # Errors
    ///
    /// `ConfigMismatch` if either differs.
    pub fn check_trailer(&self) -> Result<()> {
        if !self.layout.has_trailer() {
            return Ok(());
        }
        let magic = self.read(Field::Magic, 0)?;
        let version = self.read(Field::Version, 0)?;
        if magic != MOEMOEKYUN_MAGIC || version != MOEMOEKYUN_VERSION {
            return Err(EpfError::config_mismatch(format!(
                "trailer magic {magic:#010x} version {version}, expected \
                 {MOEMOEKYUN_MAGIC:#010x} version {MOEMOEKYUN_VERSION}"
            )));
        }
        Ok(())
    }

    /// Advance this side's heartbeat (no-op without a trailer)
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn beat(&self) -> Result<()> {
        if !self.layout.has_trailer() {
            return Ok(());
        }
        let field = Self::heartbeat_field(self.side);
        let next = self.read(field, 0)?.wrapping_add(1);
        self.write(field, 0, next)
    }

    /// Heartbeat of `side`, `None` without a trailer
    ///
    /// # Errors
    ///
    /// MMIO errors.
    pub fn heartbeat(&self, side: Side) -> Result<Option<u32>> {
        if !self.layout.has_trailer() {
            return Ok(None);
        }
        self.read(Self::heartbeat_field(side), 0).map(Some)
    }

    const fn heartbeat_field(side: Side) -> Field {
        match side {
            Side::Rc => Field::HeartbeatRc,
            Side::Ep => Field::HeartbeatEp,
        }
    }
}
