// SPDX-License-Identifier: AGPL-3.0-only

//! Root complex side
//!
//! Probe carves one reserved region per active subdevice out of the RC pool,
//! publishes it in `subdevice_rmem[i]`, writes the doorbell descriptor and the
//! transport trailer, and finally sets `READY` in `flags`.

use crate::config::{DoorbellMethod, TransportConfig};
use crate::dma::DmaEngine;
use crate::doorbell::{Doorbell, GpioLine, Interrupts};
use crate::endpoint::{BarSet, Endpoint, Parts, Phase, WaitOpts};
use crate::error::{EpfError, Result};
use crate::mcb::{ControlBlock, DoorbellDescriptor, RemoteRegion};
use crate::memory::BusMap;
use crate::pool::DmaPool;
use epf_proto::bar::{BarRole, DOORBELL_DATA, DOORBELL_MAILBOX};
use epf_proto::limits::MAX_SUB;
use epf_proto::mcb::flags;
use epf_proto::{Field, Side};
use std::sync::Arc;

/// What the platform provides to an RC probe
#[derive(Debug)]
pub struct RcResources {
    /// Bus/device/function of the EP
    pub bdf: String,
    /// EP BARs as mapped on the RC
    pub bars: BarSet,
    /// RC DMA engine
    pub dma: Arc<dyn DmaEngine>,
    /// Pool over the reserved RC memory
    pub pool: Arc<DmaPool>,
    /// RC bus view (reserved memory and EP BARs)
    pub bus: BusMap,
    /// Bus address of the EP memory BAR
    pub ep_mem_base: u64,
    /// GPIO line to the EP, required for the GPIO doorbell
    pub gpio: Option<Arc<dyn GpioLine>>,
    /// Handler for MSIs raised by the EP
    pub irq: Arc<Interrupts>,
}

/// Probe the RC side of a link
///
/// # Errors
///
/// `InvalidArgument` for a bad configuration or missing BAR/GPIO,
/// `ResourceExhausted` when the regions do not fit the pool, MMIO errors.
pub fn init(config: &TransportConfig, res: RcResources) -> Result<Endpoint> {
    config.validate()?;
    let regs = res.bars[BarRole::Register.index()]
        .clone()
        .ok_or_else(|| EpfError::invalid_argument("register BAR not mapped"))?;
    let mcb = ControlBlock::new(regs, config.transport, Side::Rc)?;

    // Nothing is valid until READY comes back
    mcb.write(Field::Flags, 0, 0)?;

    let (doorbell, method_flag) = match config.doorbell {
        DoorbellMethod::Msi => {
            let bar = res.bars[BarRole::Doorbell.index()]
                .clone()
                .ok_or_else(|| EpfError::invalid_argument("doorbell BAR not mapped"))?;
            #[allow(clippy::cast_possible_truncation)]
            let descriptor = DoorbellDescriptor {
                bar: BarRole::Doorbell.index() as u32,
                offset: DOORBELL_MAILBOX,
                data: DOORBELL_DATA,
            };
            mcb.set_doorbell_descriptor(descriptor)?;
            (
                Doorbell::MsiMailbox {
                    bar,
                    offset: descriptor.offset,
                    data: descriptor.data,
                },
                0,
            )
        }
        DoorbellMethod::Gpio => {
            let line = res
                .gpio
                .clone()
                .ok_or_else(|| EpfError::invalid_argument("GPIO doorbell without a GPIO line"))?;
            mcb.set_doorbell_descriptor(DoorbellDescriptor {
                bar: 0,
                offset: 0,
                data: 0,
            })?;
            (Doorbell::Gpio { line }, flags::DOORBELL_GPIO)
        }
    };

    // validate() bounds both values to 32 bits
    #[allow(clippy::cast_possible_truncation)]
    let (nr, region_size) = (config.nr_subdevices as u32, config.region_size as u32);
    mcb.write(Field::NrSubdevices, 0, nr)?;
    let mut regions = Vec::with_capacity(config.nr_subdevices);
    for idx in 0..MAX_SUB {
        if idx < config.nr_subdevices {
            let buf = res.pool.alloc(config.region_size)?;
            buf.fill(0)?;
            mcb.publish_rmem(
                idx,
                RemoteRegion {
                    start: buf.bus_addr(),
                    size: region_size,
                },
            )?;
            regions.push(buf);
        } else {
            mcb.write(Field::RmemSize, idx, 0)?;
        }
    }

    mcb.write_trailer()?;

    let cursors = (0..MAX_SUB)
        .map(|idx| mcb.wakeup(Side::Rc, idx))
        .collect::<Result<Vec<_>>>()?;

    crate::mmio::wmb();
    mcb.write(Field::Flags, 0, method_flag | flags::READY)?;

    tracing::info!(
        "RC probed {}: {} transport, {} doorbell, {} subdevice(s) of {:#x} bytes",
        res.bdf,
        config.transport,
        config.doorbell,
        config.nr_subdevices,
        config.region_size
    );

    Ok(Endpoint::assemble(Parts {
        side: Side::Rc,
        bdf: res.bdf,
        config: config.clone(),
        bars: res.bars,
        mcb,
        nr_subdevices: config.nr_subdevices,
        doorbell,
        irq: res.irq,
        dma: res.dma,
        pool: res.pool,
        bus: res.bus,
        mem_base: res.ep_mem_base,
        regions,
        cursors,
    }))
}

impl Endpoint {
    /// RC exchange: publish `msg2ep`, ring the EP and wait for its reply
    ///
    /// Returns the EP's `sz_msg2rc`. If the wait is cancelled or times out the
    /// exchange stays pending on the slot: the next call resumes waiting
    /// without publishing again (its `msg2ep` is ignored).
    ///
    /// # Errors
    ///
    /// `NotSupported` on the EP; `InvalidArgument` for a bad slot;
    /// `Timeout`/`Cancelled` while waiting; `DeviceGone`.
    pub fn exchange(&self, idx: usize, msg2ep: u32, opts: WaitOpts<'_>) -> Result<u32> {
        self.check_side(Side::Rc, "exchange")?;
        self.check_alive()?;
        self.check_index(idx)?;

        let mut slot = self.lock_slot(idx)?;
        let result = (|| -> Result<u32> {
            if slot.pending_exchange {
                tracing::debug!("RC resuming pending exchange on slot {idx}");
            } else {
                self.notify_peer(idx, msg2ep)?;
                slot.pending_exchange = true;
                slot.phase = Phase::Published;
            }
            self.wait_peer(&mut slot, idx, opts)?;
            slot.pending_exchange = false;
            self.control_block().msg_size(Side::Rc, idx)
        })();
        if result.is_ok() {
            slot.phase = Phase::Idle;
        }
        self.track(result)
    }

    /// Whether an exchange on `idx` is waiting for its reply
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a slot outside the layout.
    pub fn exchange_pending(&self, idx: usize) -> Result<bool> {
        Ok(self.lock_slot(idx)?.pending_exchange)
    }
}
