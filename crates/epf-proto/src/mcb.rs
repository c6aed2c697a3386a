// SPDX-License-Identifier: AGPL-3.0-only

//! MMIO control block (MCB): common block shared by every transport.
//!
//! All offsets are bytes from the start of the EP register BAR. Every field is
//! a 32-bit word accessed with 32-bit MMIO only.
//!
//! ```text
//! Offset  Size   Field                 Writer
//! ─────── ────── ───────────────────── ──────────
//!    0    4      nr_subdevices         RC init
//!    4    4      flags                 RC init
//!    8    4      db_bar                RC init
//!   12    4      db_offset             RC init
//!   16    4      db_data               RC init
//!   20    12×N   subdevice_rmem[i]     RC init    {lo, hi, size}
//!  212    4×N    wakeup_ep[i]          RC
//!  276    4×N    wakeup_rc[i]          EP
//!  340    4×N    waiting_ep[i]         EP (hint)
//!  404    4×N    ep_waiting_rc[i]      RC (hint)
//!  468    4×N    sz_msg2ep[i]          RC
//!  532    4×N    sz_msg2rc[i]          EP
//!  596           end of common block
//! ```

use crate::limits::MAX_SUB;

// ── Header ───────────────────────────────────────────────────────────────────

/// Number of active subdevices.
pub const NR_SUBDEVICES: usize = 0;
/// Flag word, see [`flags`].
pub const FLAGS: usize = 4;
/// BAR holding the doorbell mailbox.
pub const DB_BAR: usize = 8;
/// Mailbox offset inside `db_bar`.
pub const DB_OFFSET: usize = 12;
/// Value to write into the mailbox.
pub const DB_DATA: usize = 16;

// ── Per-subdevice arrays ─────────────────────────────────────────────────────

/// `subdevice_rmem[0]`.
pub const SUBDEVICE_RMEM: usize = 20;
/// Size of one `subdevice_rmem` entry (`lo`, `hi`, `size`).
pub const RMEM_STRIDE: usize = 12;
/// `wakeup_ep[0]`.
pub const WAKEUP_EP: usize = SUBDEVICE_RMEM + RMEM_STRIDE * MAX_SUB;
/// `wakeup_rc[0]`.
pub const WAKEUP_RC: usize = WAKEUP_EP + 4 * MAX_SUB;
/// `waiting_ep[0]`.
pub const WAITING_EP: usize = WAKEUP_RC + 4 * MAX_SUB;
/// `ep_waiting_rc[0]`.
pub const EP_WAITING_RC: usize = WAITING_EP + 4 * MAX_SUB;
/// `sz_msg2ep[0]`.
pub const SZ_MSG2EP: usize = EP_WAITING_RC + 4 * MAX_SUB;
/// `sz_msg2rc[0]`.
pub const SZ_MSG2RC: usize = SZ_MSG2EP + 4 * MAX_SUB;
/// Size of the common block in bytes.
pub const COMMON_SIZE: usize = SZ_MSG2RC + 4 * MAX_SUB;

/// `flags` bit definitions.
pub mod flags {
    /// Doorbell method is GPIO (clear: MSI mailbox).
    pub const DOORBELL_GPIO: u32 = 1 << 0;
    /// RC initialisation complete. Written last.
    pub const READY: u32 = 1 << 1;
}

/// Side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Root complex (PCIe host).
    Rc,
    /// Endpoint (PCIe device).
    Ep,
}

impl Side {
    /// The other side of the link.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Rc => Self::Ep,
            Self::Ep => Self::Rc,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rc => write!(f, "RC"),
            Self::Ep => write!(f, "EP"),
        }
    }
}

/// Every MCB field, common block and transport extensions alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// `nr_subdevices`
    NrSubdevices,
    /// `flags`
    Flags,
    /// `db_bar`
    DbBar,
    /// `db_offset`
    DbOffset,
    /// `db_data`
    DbData,
    /// `subdevice_rmem[i].lo`
    RmemLo,
    /// `subdevice_rmem[i].hi`
    RmemHi,
    /// `subdevice_rmem[i].size`
    RmemSize,
    /// `wakeup_ep[i]`
    WakeupEp,
    /// `wakeup_rc[i]`
    WakeupRc,
    /// `waiting_ep[i]`
    WaitingEp,
    /// `ep_waiting_rc[i]`
    EpWaitingRc,
    /// `sz_msg2ep[i]`
    SzMsg2Ep,
    /// `sz_msg2rc[i]`
    SzMsg2Rc,
    /// `ep_window[i].offset` (extension)
    EpWindowOffset,
    /// `ep_window[i].size` (extension)
    EpWindowSize,
    /// Trailer magic (moemoekyun)
    Magic,
    /// Trailer version (moemoekyun)
    Version,
    /// RC heartbeat (moemoekyun)
    HeartbeatRc,
    /// EP heartbeat (moemoekyun)
    HeartbeatEp,
}

impl Field {
    /// Every field, in layout order.
    pub const ALL: [Self; 20] = [
        Self::NrSubdevices,
        Self::Flags,
        Self::DbBar,
        Self::DbOffset,
        Self::DbData,
        Self::RmemLo,
        Self::RmemHi,
        Self::RmemSize,
        Self::WakeupEp,
        Self::WakeupRc,
        Self::WaitingEp,
        Self::EpWaitingRc,
        Self::SzMsg2Ep,
        Self::SzMsg2Rc,
        Self::EpWindowOffset,
        Self::EpWindowSize,
        Self::Magic,
        Self::Version,
        Self::HeartbeatRc,
        Self::HeartbeatEp,
    ];

    /// The only side allowed to write this field.
    #[must_use]
    pub const fn writer(self) -> Side {
        match self {
            Self::WakeupRc
            | Self::WaitingEp
            | Self::SzMsg2Rc
            | Self::EpWindowOffset
            | Self::EpWindowSize
            | Self::HeartbeatEp => Side::Ep,
            _ => Side::Rc,
        }
    }

    /// Whether the field is an array indexed by subdevice.
    #[must_use]
    pub const fn is_per_subdevice(self) -> bool {
        !matches!(
            self,
            Self::NrSubdevices
                | Self::Flags
                | Self::DbBar
                | Self::DbOffset
                | Self::DbData
                | Self::Magic
                | Self::Version
                | Self::HeartbeatRc
                | Self::HeartbeatEp
        )
    }

    /// Field name as it appears in the layout tables.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NrSubdevices => "nr_subdevices",
            Self::Flags => "flags",
            Self::DbBar => "db_bar",
            Self::DbOffset => "db_offset",
            Self::DbData => "db_data",
            Self::RmemLo => "subdevice_rmem.lo",
            Self::RmemHi => "subdevice_rmem.hi",
            Self::RmemSize => "subdevice_rmem.size",
            Self::WakeupEp => "wakeup_ep",
            Self::WakeupRc => "wakeup_rc",
            Self::WaitingEp => "waiting_ep",
            Self::EpWaitingRc => "ep_waiting_rc",
            Self::SzMsg2Ep => "sz_msg2ep",
            Self::SzMsg2Rc => "sz_msg2rc",
            Self::EpWindowOffset => "ep_window.offset",
            Self::EpWindowSize => "ep_window.size",
            Self::Magic => "magic",
            Self::Version => "version",
            Self::HeartbeatRc => "heartbeat_rc",
            Self::HeartbeatEp => "heartbeat_ep",
        }
    }
}

/// Offset of a common-block field.
///
/// Returns `None` for extension fields, for an out-of-range subdevice index,
/// and for a non-zero index on a scalar field.
#[must_use]
pub const fn common_offset(field: Field, idx: usize) -> Option<usize> {
    if field.is_per_subdevice() {
        if idx >= MAX_SUB {
            return None;
        }
    } else if idx != 0 {
        return None;
    }
    let off = match field {
        Field::NrSubdevices => NR_SUBDEVICES,
        Field::Flags => FLAGS,
        Field::DbBar => DB_BAR,
        Field::DbOffset => DB_OFFSET,
        Field::DbData => DB_DATA,
        Field::RmemLo => SUBDEVICE_RMEM + idx * RMEM_STRIDE,
        Field::RmemHi => SUBDEVICE_RMEM + idx * RMEM_STRIDE + 4,
        Field::RmemSize => SUBDEVICE_RMEM + idx * RMEM_STRIDE + 8,
        Field::WakeupEp => WAKEUP_EP + idx * 4,
        Field::WakeupRc => WAKEUP_RC + idx * 4,
        Field::WaitingEp => WAITING_EP + idx * 4,
        Field::EpWaitingRc => EP_WAITING_RC + idx * 4,
        Field::SzMsg2Ep => SZ_MSG2EP + idx * 4,
        Field::SzMsg2Rc => SZ_MSG2RC + idx * 4,
        _ => return None,
    };
    Some(off)
}
