// SPDX-License-Identifier: AGPL-3.0-only

//! In-process loopback platform
//!
//! Builds a connected RC + EP pair without hardware. Both sides share the
//! same windows, seen at different bus addresses:
//!
//! ```text
//! Window              RC bus address      EP bus address
//! ──────────────────  ──────────────────  ──────────────────
//! RC reserved memory  RC_MEM_BASE         RC_MEM_BASE
//! EP memory BAR       EP_MEM_BUS_BASE     EP_MEM_LOCAL_BASE
//! EP register BAR     BAR0 view           BAR0 view
//! EP doorbell BAR     BAR1 view           BAR1 view (mailbox trap)
//! RC MSI target       (trap)              MSI doorbell
//! ```
//!
//! Each side gets a [`SoftDma`] engine over its own bus view. RC → EP rings
//! write the descriptor's mailbox (MSI) or toggle a [`SoftGpio`] line; EP →
//! RC interrupts are MSI writes to the RC target window.

use crate::config::{DoorbellMethod, TransportConfig};
use crate::dma::SoftDma;
use crate::doorbell::{Doorbell, GpioLine, Interrupts, SoftGpio};
use crate::endpoint::{BarSet, Endpoint};
use crate::ep::{self, EpResources};
use crate::error::Result;
use crate::memory::{BusMap, MemWindow};
use crate::pci_test::TestFunction;
use crate::pool::DmaPool;
use crate::rc::{self, RcResources};
use crate::wait::WaitSet;
use epf_proto::bar::{BarRole, DOORBELL_BAR_SIZE, REGISTER_BAR_SIZE};
use std::sync::Arc;

/// Bus address of the RC reserved memory (both sides)
pub const RC_MEM_BASE: u64 = 0x8000_0000;
/// Bus address of the EP memory BAR as the RC sees it
pub const EP_MEM_BUS_BASE: u64 = 0x4000_0000;
/// Local address of the EP memory BAR
pub const EP_MEM_LOCAL_BASE: u64 = 0x1_0000_0000;
/// `data` of the EP → RC MSI
pub const RC_MSI_DATA: u32 = 0x20;

const RC_MSI_WINDOW: usize = 64;

/// A connected RC + EP pair
#[derive(Debug)]
pub struct Loopback {
    config: TransportConfig,
    rc: Arc<Endpoint>,
    ep: Arc<Endpoint>,
    rc_dma: Arc<SoftDma>,
    ep_dma: Arc<SoftDma>,
    gpio: Option<Arc<SoftGpio>>,
    windows: Vec<Arc<MemWindow>>,
}

impl Loopback {
    /// Build both sides and probe them, RC first
    ///
    /// # Errors
    ///
    /// Configuration errors and anything `rc::init` or `ep::init` return.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        config.validate()?;

        let rc_mem = MemWindow::new("rc-reserved", config.rc_pool_size);
        let regs = MemWindow::new("ep-bar0", REGISTER_BAR_SIZE);
        let db = MemWindow::new("ep-bar1", DOORBELL_BAR_SIZE);
        let ep_mem = MemWindow::new("ep-bar2", config.ep_mem_size);
        let rc_msi = MemWindow::new("rc-msi", RC_MSI_WINDOW);

        let rc_bus = BusMap::new()
            .with_window(RC_MEM_BASE, rc_mem.clone())
            .with_window(EP_MEM_BUS_BASE, ep_mem.clone());
        let ep_bus = BusMap::new()
            .with_window(RC_MEM_BASE, rc_mem.clone())
            .with_window(EP_MEM_LOCAL_BASE, ep_mem.clone());

        let rc_pool = DmaPool::new("rc-pool", RC_MEM_BASE, rc_mem.clone(), 0, config.rc_pool_size)?;
        let ep_pool = DmaPool::new("ep-pool", EP_MEM_LOCAL_BASE, ep_mem.clone(), 0, config.ep_mem_size)?;

        let rc_dma = SoftDma::new("rc-dma", rc_bus.clone(), config.dma_channels, config.dma_align, config.dma_burst)?;
        let ep_dma = SoftDma::new("ep-dma", ep_bus.clone(), config.dma_channels, config.dma_align, config.dma_burst)?;

        let rc_irq = Arc::new(Interrupts::new(Arc::new(WaitSet::new())));
        let ep_irq = Arc::new(Interrupts::new(Arc::new(WaitSet::new())));
        {
            let rc_irq = rc_irq.clone();
            rc_msi.set_trap(
                0,
                Arc::new(move |v: u32| rc_irq.handle(v.wrapping_sub(RC_MSI_DATA))),
            )?;
        }

        let gpio = match config.doorbell {
            DoorbellMethod::Gpio => {
                let line = SoftGpio::new("epf-doorbell");
                let ep_irq = ep_irq.clone();
                line.on_edge(Arc::new(move || ep_irq.handle(0)));
                Some(line)
            }
            DoorbellMethod::Msi => None,
        };

        let mut bars: BarSet = Default::default();
        bars[BarRole::Register.index()] = Some(regs.clone());
        bars[BarRole::Doorbell.index()] = Some(db.clone());
        bars[BarRole::Memory.index()] = Some(ep_mem.clone());

        let rc = rc::init(
            config,
            RcResources {
                bdf: "0000:01:00.0".into(),
                bars: bars.clone(),
                dma: rc_dma.clone(),
                pool: rc_pool,
                bus: rc_bus,
                ep_mem_base: EP_MEM_BUS_BASE,
                gpio: gpio.clone().map(|g| g as Arc<dyn GpioLine>),
                irq: rc_irq,
            },
        )?;

        if config.doorbell == DoorbellMethod::Msi {
            let desc = rc.control_block().doorbell_descriptor()?;
            let ep_irq = ep_irq.clone();
            db.set_trap(
                desc.offset as usize,
                Arc::new(move |v: u32| ep_irq.handle(v.wrapping_sub(desc.data))),
            )?;
        }

        let ep = ep::init(
            config,
            EpResources {
                bdf: "0000:00:00.0".into(),
                bars,
                dma: ep_dma.clone(),
                pool: ep_pool,
                bus: ep_bus,
                mem_base: EP_MEM_LOCAL_BASE,
                to_rc: Doorbell::MsiMailbox {
                    bar: rc_msi.clone(),
                    offset: 0,
                    data: RC_MSI_DATA,
                },
                irq: ep_irq,
            },
        )?;

        Ok(Self {
            config: config.clone(),
            rc: Arc::new(rc),
            ep: Arc::new(ep),
            rc_dma,
            ep_dma,
            gpio,
            windows: vec![regs, db, ep_mem, rc_msi],
        })
    }

    /// RC endpoint
    #[must_use]
    pub const fn rc(&self) -> &Arc<Endpoint> {
        &self.rc
    }

    /// EP endpoint
    #[must_use]
    pub const fn ep(&self) -> &Arc<Endpoint> {
        &self.ep
    }

    /// RC DMA engine, for fault injection
    #[must_use]
    pub const fn rc_dma(&self) -> &Arc<SoftDma> {
        &self.rc_dma
    }

    /// EP DMA engine, for fault injection
    #[must_use]
    pub const fn ep_dma(&self) -> &Arc<SoftDma> {
        &self.ep_dma
    }

    /// GPIO doorbell line, when configured
    #[must_use]
    pub const fn gpio(&self) -> Option<&Arc<SoftGpio>> {
        self.gpio.as_ref()
    }

    /// Configuration both sides were probed with
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Start the EP's PCI test function
    ///
    /// # Errors
    ///
    /// As [`TestFunction::start`].
    pub fn start_test_function(&self) -> Result<TestFunction> {
        TestFunction::start(self.ep.clone())
    }

    /// Surprise removal: every EP window and the MSI target disappear
    ///
    /// Sleepers on both sides are woken so they observe the loss.
    pub fn unplug(&self) {
        tracing::info!("Loopback unplug");
        for w in &self.windows {
            w.unmap();
        }
        self.rc.interrupts().waits().wake_all();
        self.ep.interrupts().waits().wake_all();
    }
}
