// SPDX-License-Identifier: AGPL-3.0-only

//! EP BAR roles.
//!
//! ```text
//! BAR  Role        Size     Contents
//! ──── ─────────── ──────── ──────────────────────────────────────────────
//!  0   Register    4 KB     MCB at 0x000, PCI test registers at 0x400
//!  1   Doorbell    4 KB     4-byte MSI mailbox at 0x000
//!  2   Memory      config   EP DRAM window; the EP pool lives here
//! ```

/// Number of standard BARs of a PCI function.
pub const NUM_BARS: usize = 6;

/// BAR roles on the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BarRole {
    /// MCB and PCI test register block.
    Register = 0,
    /// Doorbell mailbox.
    Doorbell = 1,
    /// EP memory window.
    Memory = 2,
}

impl BarRole {
    /// BAR index this role is placed at.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Register BAR size in bytes.
pub const REGISTER_BAR_SIZE: usize = 4096;

/// Doorbell BAR size in bytes.
pub const DOORBELL_BAR_SIZE: usize = 4096;

/// Mailbox offset inside the doorbell BAR.
pub const DOORBELL_MAILBOX: u32 = 0x0;

/// Value written to the mailbox when ringing the EP.
pub const DOORBELL_DATA: u32 = 0x1;
