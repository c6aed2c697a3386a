// SPDX-License-Identifier: AGPL-3.0-only

//! Ioctl command numbers.
//!
//! Commands use the Linux `_IOC` encoding, so two commands sharing a type
//! character and number still differ when their payload sizes differ (the EP
//! `'B' #1` xfer and msg2rc commands rely on this).
//!
//! ```text
//!  31 30 29             16 15        8 7         0
//! ┌─────┬─────────────────┬───────────┬───────────┐
//! │ dir │      size       │   type    │    nr     │
//! └─────┴─────────────────┴───────────┴───────────┘
//! ```
//!
//! Payloads are packed little-endian images; sizes below are the packed sizes.

/// No data transfer.
pub const IOC_NONE: u32 = 0;
/// Userspace writes the payload.
pub const IOC_WRITE: u32 = 1;
/// Userspace reads the payload.
pub const IOC_READ: u32 = 2;

const NRSHIFT: u32 = 0;
const TYPESHIFT: u32 = 8;
const SIZESHIFT: u32 = 16;
const DIRSHIFT: u32 = 30;
const SIZEMASK: u32 = (1 << 14) - 1;

/// `_IOC(dir, type, nr, size)`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << DIRSHIFT)
        | (((size as u32) & SIZEMASK) << SIZESHIFT)
        | ((ty as u32) << TYPESHIFT)
        | ((nr as u32) << NRSHIFT)
}

/// `_IO(type, nr)`.
#[must_use]
pub const fn io(ty: u8, nr: u8) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

/// `_IOR(type, nr, size)`.
#[must_use]
pub const fn ior(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

/// `_IOW(type, nr, size)`.
#[must_use]
pub const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

/// `_IOWR(type, nr, size)`.
#[must_use]
pub const fn iowr(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// Type character of a command.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn ioc_type(cmd: u32) -> u8 {
    (cmd >> TYPESHIFT) as u8
}

/// Number of a command.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn ioc_nr(cmd: u32) -> u8 {
    (cmd >> NRSHIFT) as u8
}

/// Payload size of a command.
#[must_use]
pub const fn ioc_size(cmd: u32) -> usize {
    ((cmd >> SIZESHIFT) & SIZEMASK) as usize
}

/// Direction bits of a command.
#[must_use]
pub const fn ioc_dir(cmd: u32) -> u32 {
    cmd >> DIRSHIFT
}

/// Transfer direction in xfer payloads.
pub mod dir {
    /// Local memory → remote memory.
    pub const OUTBOUND: u32 = 0;
    /// Remote memory → local memory.
    pub const INBOUND: u32 = 1;
}

/// `'B'` commands: message exchange, subdevice info and DMA transfers.
pub mod bsb {
    use super::{ior, iow, iowr};

    /// Type character.
    pub const TYPE: u8 = b'B';

    /// RC: `{msg2ep u32, msg2rc u32 (out), subdevice_idx u32}`.
    pub const EXCHANGE_SIZE: usize = 12;
    /// RC: publish msg2ep, ring, wait for msg2rc.
    pub const RC_EXCHANGE: u32 = iowr(TYPE, 1, EXCHANGE_SIZE);

    /// EP: `{subdevice_idx u32, msg2ep u32 (out)}`.
    pub const WAIT_SIZE: usize = 8;
    /// EP: wait for an incoming msg2ep.
    pub const EP_WAIT_MSG2EP: u32 = iowr(TYPE, 2, WAIT_SIZE);

    /// Both: `{nr u32, MAX_SUB × {start_addr u64, size u32}}`.
    pub const INFO_SIZE: usize = 4 + 12 * crate::limits::MAX_SUB;
    /// Both: subdevice info.
    pub const SUBDEVICES_INFO: u32 = ior(TYPE, 3, INFO_SIZE);

    /// EP: `{remote_phy u64, local_phy u64, size u32, dir u32, subdevice_idx u32, pad u32}`.
    pub const XFER_SIZE: usize = 32;
    /// EP: one EP-OB or EP-IB.
    pub const EP_XFER: u32 = iow(TYPE, 1, XFER_SIZE);

    /// EP: `{msg2rc u32, subdevice_idx u32}`.
    pub const MSG2RC_SIZE: usize = 8;
    /// EP: publish msg2rc and ring the RC.
    pub const EP_MSG2RC: u32 = iow(TYPE, 1, MSG2RC_SIZE);

    /// RC: `{remote_offset u64, local_phy u64, size u32, dir u32, subdevice_idx u32, pad u32}`.
    pub const RC_XFER: u32 = iow(TYPE, 4, XFER_SIZE);

    /// EP: `{local_phy u64, size u32, subdevice_idx u32, msg2rc u32, pad u32}`.
    pub const PUBLISH_SIZE: usize = 24;
    /// EP: advertise a buffer in the memory BAR to the RC.
    pub const EP_PUBLISH_WINDOW: u32 = iow(TYPE, 5, PUBLISH_SIZE);
}

/// `'N'` commands: single-direction transfer without MCB publication.
pub mod neko {
    use super::iow;

    /// Type character.
    pub const TYPE: u8 = b'N';
    /// `{remote_phy u64, local_phy u64, size u32, dir u32}`.
    pub const XFER_SIZE: usize = 24;
    /// EP: raw transfer on subdevice 0.
    pub const XFER: u32 = iow(TYPE, 1, XFER_SIZE);
}

/// `'P'` commands: PCI test function.
///
/// Every `'P'` payload is one little-endian `u64` argument; `GET_IRQTYPE`
/// writes its result back into it.
pub mod pcitest {
    use super::{io, iow};

    /// Type character.
    pub const TYPE: u8 = b'P';
    /// Payload size.
    pub const ARG_SIZE: usize = 8;

    /// BAR pattern test, arg = BAR index.
    pub const BAR: u32 = io(TYPE, 0x1);
    /// Raise a legacy interrupt.
    pub const LEGACY_IRQ: u32 = io(TYPE, 0x2);
    /// Raise MSI, arg = vector.
    pub const MSI: u32 = iow(TYPE, 0x3, 4);
    /// EP reads `arg` bytes from RC memory.
    pub const WRITE: u32 = iow(TYPE, 0x4, 8);
    /// EP writes `arg` bytes into RC memory.
    pub const READ: u32 = iow(TYPE, 0x5, 8);
    /// EP copies `arg` bytes between two RC buffers.
    pub const COPY: u32 = iow(TYPE, 0x6, 8);
    /// Raise MSI-X, arg = vector.
    pub const MSIX: u32 = iow(TYPE, 0x7, 4);
    /// Select interrupt type, arg = [`crate::pci_test::irq_type`] value.
    pub const SET_IRQTYPE: u32 = iow(TYPE, 0x8, 4);
    /// Read back the interrupt type.
    pub const GET_IRQTYPE: u32 = io(TYPE, 0x9);
    /// Clear pending test interrupt state.
    pub const CLEAR_IRQ: u32 = io(TYPE, 0x10);
    /// Pattern test of every mapped BAR.
    pub const BARS: u32 = io(TYPE, 0x11);
}
