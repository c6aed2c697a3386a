// SPDX-License-Identifier: AGPL-3.0-only

//! RC/EP coordination core for PCIe endpoint-function transports.
//!
//! Two SoC instances, a **Root Complex** host and an **Endpoint** device,
//! share a small MMIO control block (MCB) in an EP BAR and move bulk data
//! with DMA. This crate is everything between the ioctl surface and the
//! hardware collaborators: MCB accessors, doorbells, the wait/wake
//! scheduler, the four DMA primitives and subdevice multiplexing. Used by
//! the excalibur, moemoekyun and bsb transports.
//!
//! # Layers
//!
//! ```text
//! ioctl ('B' 'N' 'P') ─▶ Registry ─▶ Endpoint (RC or EP)
//!                                      ├─ ControlBlock   MCB over a Mmio window
//!                                      ├─ Doorbell       MSI mailbox or GPIO
//!                                      ├─ WaitSet        per-slot wait queues
//!                                      ├─ DmaEngine      + channels, watchdog
//!                                      └─ DmaPool        bus-addressable buffers
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use epf_driver::{Loopback, TransportConfig, Transfer, WaitOpts};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let link = Loopback::new(&TransportConfig::default())?;
//! let (rc, ep) = (link.rc().clone(), link.ep().clone());
//!
//! // EP-OB: the EP answers the RC's exchange by writing into subdevice_rmem[0]
//! let rmem = rc.region(0)?.bus_addr();
//! let rc_side = std::thread::spawn(move || rc.exchange(0, 4096, WaitOpts::default()));
//! let src = ep.alloc(4096)?;
//! ep.ep_outbound(&Transfer::new(0, src.bus_addr(), rmem, 4096), WaitOpts::default())?;
//! assert_eq!(rc_side.join().unwrap()?, 4096);
//! # Ok(())
//! # }
//! ```
//!
//! # Primitives
//!
//! | Primitive | Runs on | Waits for | Publishes |
//! |-----------|---------|-----------|-----------|
//! | EP-OB / EP-IB | EP | `wakeup_ep[i]` | `sz_msg2rc[i]`, `wakeup_rc[i]` |
//! | RC-OB / RC-IB | RC | `wakeup_rc[i]` (window) | `sz_msg2ep[i]`, `wakeup_ep[i]` |
//! | exchange | RC | `wakeup_rc[i]` | `sz_msg2ep[i]`, `wakeup_ep[i]` |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod dma;
pub mod doorbell;
mod endpoint;
pub mod ep;
mod error;
pub mod ioctl;
mod lock;
pub mod loopback;
pub mod mcb;
pub mod memory;
pub mod mmio;
mod plane;
mod pool;
pub mod rc;
pub mod registry;
pub mod wait;

pub use config::{DoorbellMethod, TransportConfig};
pub use dma::{DmaDirection, DmaEngine, SoftDma};
pub use doorbell::{Doorbell, GpioLine, Interrupts, SoftGpio};
pub use endpoint::{BarSet, Endpoint, Phase, SubdeviceInfo, WaitOpts};
pub use error::{EpfError, Result};
pub use ioctl::{dispatch, Request};
pub use loopback::Loopback;
pub use mcb::ControlBlock;
pub use memory::{BusMap, MemWindow};
pub use mmio::{MappedRegion, Mmio};
pub use pci_test::{TestFunction, TestHost};
pub use plane::Transfer;
pub use pool::{DmaPool, PoolBuffer};
pub use registry::{EndpointId, Registry};
pub use wait::CancelToken;

pub use epf_proto::{Field, Side, TransportKind};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        CancelToken, DmaDirection, DoorbellMethod, Endpoint, EndpointId, EpfError, Loopback,
        Registry, Result, Side, Transfer, TransportConfig, TransportKind, WaitOpts,
    };
}
