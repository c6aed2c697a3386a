// SPDX-License-Identifier: AGPL-3.0-only

//! Endpoint side
//!
//! The EP attaches only after the RC has set `READY`, and only when both
//! sides agree on the doorbell method and, for moemoekyun, on the trailer.

use crate::config::{DoorbellMethod, TransportConfig};
use crate::dma::DmaEngine;
use crate::doorbell::{Doorbell, Interrupts};
use crate::endpoint::{BarSet, Endpoint, Parts, Phase, WaitOpts};
use crate::error::{EpfError, Result};
use crate::mcb::{ControlBlock, EpWindow};
use crate::memory::BusMap;
use crate::pool::DmaPool;
use epf_proto::bar::BarRole;
use epf_proto::limits::MAX_SUB;
use epf_proto::mcb::flags;
use epf_proto::Side;
use std::sync::Arc;

/// What the platform provides to an EP probe
#[derive(Debug)]
pub struct EpResources {
    /// Bus/device/function of this function
    pub bdf: String,
    /// Local views of the function's own BARs
    pub bars: BarSet,
    /// EP DMA engine
    pub dma: Arc<dyn DmaEngine>,
    /// Pool over the memory BAR
    pub pool: Arc<DmaPool>,
    /// EP bus view (own memory and RC memory)
    pub bus: BusMap,
    /// Local bus address of the memory BAR
    pub mem_base: u64,
    /// MSI towards the RC
    pub to_rc: Doorbell,
    /// Handler for doorbells from the RC
    pub irq: Arc<Interrupts>,
}

/// Probe the EP side of a link
///
/// # Errors
///
/// `PeerNotReady` before the RC has set `READY`; `ConfigMismatch` when the
/// doorbell method, trailer or subdevice count disagree; MMIO errors.
pub fn init(config: &TransportConfig, res: EpResources) -> Result<Endpoint> {
    let regs = res.bars[BarRole::Register.index()]
        .clone()
        .ok_or_else(|| EpfError::invalid_argument("register BAR not mapped"))?;
    let mcb = ControlBlock::new(regs, config.transport, Side::Ep)?;

    let flags = mcb.flags()?;
    if flags & flags::READY == 0 {
        return Err(EpfError::peer_not_ready("RC has not finished initialising the MCB"));
    }
    let rc_method = if flags & flags::DOORBELL_GPIO != 0 {
        DoorbellMethod::Gpio
    } else {
        DoorbellMethod::Msi
    };
    if rc_method != config.doorbell {
        return Err(EpfError::config_mismatch(format!(
            "RC rings with {rc_method}, EP configured for {}",
            config.doorbell
        )));
    }
    if rc_method == DoorbellMethod::Msi {
        let db = mcb.doorbell_descriptor()?;
        let mapped = usize::try_from(db.bar)
            .ok()
            .and_then(|bar| res.bars.get(bar))
            .is_some_and(Option::is_some);
        if !mapped {
            return Err(EpfError::config_mismatch(format!(
                "doorbell BAR {} not exposed by this function",
                db.bar
            )));
        }
    }
    mcb.check_trailer()?;

    let nr = mcb.nr_subdevices()? as usize;
    let max = mcb.layout().max_subdevices();
    if nr == 0 || nr > max {
        return Err(EpfError::config_mismatch(format!(
            "RC published nr_subdevices {nr}, {} allows 1..={max}",
            config.transport
        )));
    }
    if nr != config.nr_subdevices {
        tracing::debug!("EP using RC's nr_subdevices {nr} (configured {})", config.nr_subdevices);
    }

    for idx in 0..MAX_SUB {
        mcb.publish_window(idx, EpWindow { offset: 0, size: 0 })?;
        mcb.set_waiting(idx, false)?;
    }
    let cursors = (0..MAX_SUB)
        .map(|idx| mcb.wakeup(Side::Ep, idx))
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        "EP probed {}: {} transport, {} doorbell, {nr} subdevice(s)",
        res.bdf,
        config.transport,
        rc_method
    );

    Ok(Endpoint::assemble(Parts {
        side: Side::Ep,
        bdf: res.bdf,
        config: config.clone(),
        bars: res.bars,
        mcb,
        nr_subdevices: nr,
        doorbell: res.to_rc,
        irq: res.irq,
        dma: res.dma,
        pool: res.pool,
        bus: res.bus,
        mem_base: res.mem_base,
        regions: Vec::new(),
        cursors,
    }))
}

impl Endpoint {
    /// Wait for the RC's next `msg2ep` on slot `idx`
    ///
    /// Consumes the request: the next EP transfer on the slot runs without
    /// waiting again. Calling this again before answering returns the same
    /// message.
    ///
    /// # Errors
    ///
    /// `NotSupported` on the RC; `InvalidArgument`; `Timeout`/`Cancelled`;
    /// `DeviceGone`.
    pub fn wait_msg2ep(&self, idx: usize, opts: WaitOpts<'_>) -> Result<u32> {
        self.check_side(Side::Ep, "wait for msg2ep")?;
        self.check_alive()?;
        self.check_index(idx)?;

        let mut slot = self.lock_slot(idx)?;
        let result = (|| -> Result<u32> {
            if !slot.armed {
                self.wait_peer(&mut slot, idx, opts)?;
                slot.armed = true;
                slot.phase = Phase::Idle;
            }
            self.control_block().msg_size(Side::Ep, idx)
        })();
        self.track(result)
    }

    /// Publish `msg2rc` and ring the RC, answering any consumed request
    ///
    /// # Errors
    ///
    /// `NotSupported` on the RC; `InvalidArgument`; `DeviceGone`.
    pub fn msg2rc(&self, idx: usize, msg2rc: u32) -> Result<()> {
        self.check_side(Side::Ep, "msg2rc")?;
        self.check_alive()?;
        self.check_index(idx)?;

        let mut slot = self.lock_slot(idx)?;
        let result = self.notify_peer(idx, msg2rc);
        if result.is_ok() {
            slot.armed = false;
        }
        self.track(result)
    }

    /// Advertise `[local, local + size)` of the memory BAR to the RC
    ///
    /// Writes `ep_window[idx]` (size last), `sz_msg2rc = msg2rc`, bumps
    /// `wakeup_rc[idx]` and rings the RC. The RC-side primitives on the slot
    /// wait for exactly this.
    ///
    /// # Errors
    ///
    /// `NotSupported` on the RC; `InvalidArgument` for a range that is not a
    /// live pool allocation; `DeviceGone`.
    pub fn publish_window(&self, idx: usize, local: u64, size: usize, msg2rc: u32) -> Result<()> {
        self.check_side(Side::Ep, "publish window")?;
        self.check_alive()?;
        let size32 = Self::check_len(size)?;
        self.check_index(idx)?;
        self.check_local(local, size)?;
        let offset = local
            .checked_sub(self.mem_base())
            .and_then(|off| u32::try_from(off).ok())
            .ok_or_else(|| {
                EpfError::invalid_argument(format!("{local:#x} is outside the memory BAR"))
            })?;

        let mut slot = self.lock_slot(idx)?;
        let result = (|| -> Result<()> {
            self.control_block().publish_window(
                idx,
                EpWindow {
                    offset,
                    size: size32,
                },
            )?;
            self.notify_peer(idx, msg2rc)?;
            tracing::debug!("EP published window[{idx}] = +{offset:#x}/{size:#x}");
            Ok(())
        })();
        if result.is_ok() {
            slot.armed = false;
            slot.phase = Phase::Published;
        }
        self.track(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemWindow;
    use crate::wait::WaitSet;
    use crate::SoftDma;
    use epf_proto::bar::REGISTER_BAR_SIZE;
    use epf_proto::transport::MOEMOEKYUN_MAGIC;
    use epf_proto::{Field, TransportKind};

    fn resources(regs: &Arc<MemWindow>) -> EpResources {
        let mem = MemWindow::new("ep-mem", 0x10000);
        let pool = DmaPool::new("ep", 0x1_0000_0000, mem.clone(), 0, 0x10000).unwrap();
        let bus = BusMap::new().with_window(0x1_0000_0000, mem);
        let mut bars: BarSet = Default::default();
        bars[0] = Some(regs.clone());
        bars[1] = Some(MemWindow::new("bar1", 4096));
        let msi = MemWindow::new("rc-msi", 64);
        EpResources {
            bdf: "0000:00:00.0".into(),
            bars,
            dma: SoftDma::new("ep-dma", bus.clone(), 1, 8, 64).unwrap(),
            pool,
            bus,
            mem_base: 0x1_0000_0000,
            to_rc: Doorbell::MsiMailbox {
                bar: msi,
                offset: 0,
                data: 0,
            },
            irq: Arc::new(Interrupts::new(Arc::new(WaitSet::new()))),
        }
    }

    fn rc_view(regs: &Arc<MemWindow>, kind: TransportKind) -> ControlBlock {
        ControlBlock::new(regs.clone(), kind, Side::Rc).unwrap()
    }

    #[test]
    fn refuses_before_ready() {
        let regs = MemWindow::new("bar0", REGISTER_BAR_SIZE);
        let err = init(&TransportConfig::default(), resources(&regs)).unwrap_err();
        assert!(matches!(err, EpfError::PeerNotReady { .. }));
    }

    #[test]
    fn refuses_doorbell_mismatch() {
        let regs = MemWindow::new("bar0", REGISTER_BAR_SIZE);
        let rc = rc_view(&regs, TransportKind::Excalibur);
        rc.write(Field::NrSubdevices, 0, 1).unwrap();
        rc.write(Field::Flags, 0, flags::READY | flags::DOORBELL_GPIO).unwrap();
        let err = init(&TransportConfig::default(), resources(&regs)).unwrap_err();
        assert!(matches!(err, EpfError::ConfigMismatch { .. }));
    }

    #[test]
    fn refuses_bad_trailer() {
        let regs = MemWindow::new("bar0", REGISTER_BAR_SIZE);
        let rc = rc_view(&regs, TransportKind::Moemoekyun);
        rc.write(Field::NrSubdevices, 0, 1).unwrap();
        rc.write(Field::DbBar, 0, 1).unwrap();
        rc.write(Field::Magic, 0, MOEMOEKYUN_MAGIC ^ 1).unwrap();
        rc.write(Field::Flags, 0, flags::READY).unwrap();
        let config = TransportConfig::default().with_transport(TransportKind::Moemoekyun);
        let err = init(&config, resources(&regs)).unwrap_err();
        assert!(matches!(err, EpfError::ConfigMismatch { .. }));
    }

    #[test]
    fn adopts_rc_subdevice_count() {
        let regs = MemWindow::new("bar0", REGISTER_BAR_SIZE);
        let rc = rc_view(&regs, TransportKind::Excalibur);
        rc.write(Field::NrSubdevices, 0, 4).unwrap();
        rc.write(Field::DbBar, 0, 1).unwrap();
        rc.write(Field::Flags, 0, flags::READY).unwrap();
        let ep = init(&TransportConfig::default(), resources(&regs)).unwrap();
        assert_eq!(ep.nr_subdevices(), 4);
        assert!(ep.check_index(3).is_ok());
        assert!(ep.check_index(4).is_err());
    }

    #[test]
    fn publish_window_is_visible_to_rc() {
        let regs = MemWindow::new("bar0", REGISTER_BAR_SIZE);
        let rc = rc_view(&regs, TransportKind::Excalibur);
        rc.write(Field::NrSubdevices, 0, 2).unwrap();
        rc.write(Field::DbBar, 0, 1).unwrap();
        rc.write(Field::Flags, 0, flags::READY).unwrap();
        let ep = init(&TransportConfig::default(), resources(&regs)).unwrap();

        let buf = ep.alloc(0x400).unwrap();
        buf.fill(0x5A).unwrap();
        ep.publish_window(1, buf.bus_addr() + 0x100, 0x200, 7).unwrap();
        assert_eq!(
            rc.window(1).unwrap(),
            Some(EpWindow {
                offset: 0x100,
                size: 0x200
            })
        );
        assert_eq!(rc.msg_size(Side::Rc, 1).unwrap(), 7);
        assert_eq!(rc.wakeup(Side::Rc, 1).unwrap(), 1);

        // Not a live allocation
        assert!(ep.publish_window(1, buf.bus_addr() + 0x400, 8, 0).is_err());
        assert_eq!(rc.wakeup(Side::Rc, 1).unwrap(), 1);
    }
}
