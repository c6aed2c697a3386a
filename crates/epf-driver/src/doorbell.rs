// SPDX-License-Identifier: AGPL-3.0-only

//! Doorbells and interrupt dispatch
//!
//! Ringing turns a preceding MCB write into an interrupt on the peer. The RC
//! rings the EP through the MSI mailbox in the EP doorbell BAR or through a
//! GPIO line, chosen at boot; the EP always raises an MSI towards the RC.
//!
//! The receiving side's [`Interrupts`] handler does the minimum: count,
//! remember the vector, wake every wait queue.

use crate::error::Result;
use crate::mmio::{wmb, Mmio};
use crate::wait::WaitSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Edge handler attached to a GPIO line
pub type EdgeHandler = Arc<dyn Fn() + Send + Sync>;

/// A GPIO output wired to the peer's interrupt input
pub trait GpioLine: Send + Sync + std::fmt::Debug {
    /// Line name, for logs
    fn name(&self) -> &str;

    /// Flip the line, producing one edge on the peer
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be driven.
    fn toggle(&self) -> Result<()>;
}

/// In-process GPIO line; every toggle invokes the registered edge handler
pub struct SoftGpio {
    name: String,
    level: AtomicBool,
    handler: RwLock<Option<EdgeHandler>>,
}

impl std::fmt::Debug for SoftGpio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftGpio")
            .field("name", &self.name)
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}

impl SoftGpio {
    /// Low line with no handler
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            level: AtomicBool::new(false),
            handler: RwLock::new(None),
        })
    }

    /// Attach the peer's interrupt handler
    pub fn on_edge(&self, handler: EdgeHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Current level
    pub fn level(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }
}

impl GpioLine for SoftGpio {
    fn name(&self) -> &str {
        &self.name
    }

    fn toggle(&self) -> Result<()> {
        self.level.fetch_xor(true, Ordering::AcqRel);
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(h) = handler {
            h();
        }
        Ok(())
    }
}

/// Outgoing doorbell
#[derive(Debug, Clone)]
pub enum Doorbell {
    /// Write `data` at `offset` of the mailbox window `bar`
    MsiMailbox {
        /// Window holding the mailbox
        bar: Arc<dyn Mmio>,
        /// Mailbox offset
        offset: u32,
        /// Value to write
        data: u32,
    },
    /// Toggle a GPIO line
    Gpio {
        /// The line
        line: Arc<dyn GpioLine>,
    },
}

impl Doorbell {
    /// Ring the peer
    ///
    /// Issues a write barrier first so the peer's handler observes every MCB
    /// write made before the call.
    ///
    /// # Errors
    ///
    /// MMIO or GPIO errors; an unmapped mailbox gives `DeviceGone`.
    pub fn ring(&self) -> Result<()> {
        self.raise(0)
    }

    /// Raise interrupt `vector` (MSI data + vector; GPIO has a single vector)
    ///
    /// # Errors
    ///
    /// Same as [`Doorbell::ring`].
    pub fn raise(&self, vector: u32) -> Result<()> {
        wmb();
        match self {
            Self::MsiMailbox { bar, offset, data } => {
                tracing::trace!("MSI write {:#x} @ {offset:#x}", data.wrapping_add(vector));
                bar.write32(*offset as usize, data.wrapping_add(vector))
            }
            Self::Gpio { line } => {
                tracing::trace!("GPIO toggle {}", line.name());
                line.toggle()
            }
        }
    }

    /// `"msi"` or `"gpio"`
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::MsiMailbox { .. } => "msi",
            Self::Gpio { .. } => "gpio",
        }
    }
}

/// Incoming interrupt handler of one side
#[derive(Debug)]
pub struct Interrupts {
    waits: Arc<WaitSet>,
    count: AtomicU64,
    last_vector: AtomicU32,
}

impl Interrupts {
    /// Handler dispatching to `waits`
    #[must_use]
    pub fn new(waits: Arc<WaitSet>) -> Self {
        Self {
            waits,
            count: AtomicU64::new(0),
            last_vector: AtomicU32::new(0),
        }
    }

    /// Interrupt entry point
    pub fn handle(&self, vector: u32) {
        self.last_vector.store(vector, Ordering::Release);
        self.count.fetch_add(1, Ordering::AcqRel);
        self.waits.wake_all();
    }

    /// Wait queues this handler wakes
    #[must_use]
    pub fn waits(&self) -> &Arc<WaitSet> {
        &self.waits
    }

    /// Interrupts taken so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Vector of the latest interrupt
    pub fn last_vector(&self) -> u32 {
        self.last_vector.load(Ordering::Acquire)
    }
}
