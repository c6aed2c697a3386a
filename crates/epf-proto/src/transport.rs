// SPDX-License-Identifier: AGPL-3.0-only

//! Transport layouts.
//!
//! The three transports share the common block of [`crate::mcb`] and the DMA
//! and wait/wake machinery; they differ in layout extensions and in how many
//! subdevices they multiplex.
//!
//! ```text
//! Transport    Subdevices  Extensions
//! ──────────── ─────────── ──────────────────────────────────────────────
//! excalibur    16          ep_window[i] @ 596
//! moemoekyun   16          ep_window[i] @ 596, trailer @ 724
//! bsb          1           ep_window[i] @ 596
//! ```
//!
//! `ep_window[i] = {offset, size}` is written by the EP to advertise a buffer
//! inside its memory BAR to the RC-side DMA primitives. The moemoekyun
//! trailer carries a magic/version handshake and one heartbeat per side.

use crate::limits::MAX_SUB;
use crate::mcb::{common_offset, Field, COMMON_SIZE};

/// `ep_window[0]`.
pub const EP_WINDOW: usize = COMMON_SIZE;
/// Size of one `ep_window` entry.
pub const EP_WINDOW_STRIDE: usize = 8;
/// Start of the moemoekyun trailer.
pub const TRAILER: usize = EP_WINDOW + EP_WINDOW_STRIDE * MAX_SUB;
/// Size of the moemoekyun trailer.
pub const TRAILER_SIZE: usize = 16;

/// Magic written by the RC into the moemoekyun trailer (`"MOEK"`).
pub const MOEMOEKYUN_MAGIC: u32 = 0x4D4F_454B;
/// Trailer version understood by this implementation.
pub const MOEMOEKYUN_VERSION: u32 = 1;

/// Transport flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Multi-subdevice transport, base layout.
    #[default]
    Excalibur,
    /// Multi-subdevice transport with handshake/heartbeat trailer.
    Moemoekyun,
    /// Single-subdevice transport.
    Bsb,
}

impl TransportKind {
    /// Every transport.
    pub const ALL: [Self; 3] = [Self::Excalibur, Self::Moemoekyun, Self::Bsb];

    /// Lower-case transport name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Excalibur => "excalibur",
            Self::Moemoekyun => "moemoekyun",
            Self::Bsb => "bsb",
        }
    }

    /// Layout descriptor for this transport.
    #[must_use]
    pub fn layout(self) -> &'static dyn McbLayout {
        match self {
            Self::Excalibur => &Excalibur,
            Self::Moemoekyun => &Moemoekyun,
            Self::Bsb => &Bsb,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "excalibur" => Ok(Self::Excalibur),
            "moemoekyun" => Ok(Self::Moemoekyun),
            "bsb" => Ok(Self::Bsb),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// MCB layout of one transport.
pub trait McbLayout: std::fmt::Debug + Send + Sync {
    /// Transport this layout belongs to.
    fn kind(&self) -> TransportKind;

    /// Subdevices this transport can activate.
    fn max_subdevices(&self) -> usize;

    /// Byte offset of `field[idx]`, or `None` if the layout lacks it.
    fn offset(&self, field: Field, idx: usize) -> Option<usize>;

    /// Bytes covered by the layout.
    fn size(&self) -> usize;

    /// Whether the layout carries the handshake/heartbeat trailer.
    fn has_trailer(&self) -> bool {
        self.offset(Field::Magic, 0).is_some()
    }
}

fn ep_window_offset(field: Field, idx: usize) -> Option<usize> {
    if idx >= MAX_SUB {
        return None;
    }
    match field {
        Field::EpWindowOffset => Some(EP_WINDOW + idx * EP_WINDOW_STRIDE),
        Field::EpWindowSize => Some(EP_WINDOW + idx * EP_WINDOW_STRIDE + 4),
        _ => None,
    }
}

fn trailer_offset(field: Field, idx: usize) -> Option<usize> {
    if idx != 0 {
        return None;
    }
    match field {
        Field::Magic => Some(TRAILER),
        Field::Version => Some(TRAILER + 4),
        Field::HeartbeatRc => Some(TRAILER + 8),
        Field::HeartbeatEp => Some(TRAILER + 12),
        _ => None,
    }
}

/// excalibur layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Excalibur;

impl McbLayout for Excalibur {
    fn kind(&self) -> TransportKind {
        TransportKind::Excalibur
    }

    fn max_subdevices(&self) -> usize {
        MAX_SUB
    }

    fn offset(&self, field: Field, idx: usize) -> Option<usize> {
        common_offset(field, idx).or_else(|| ep_window_offset(field, idx))
    }

    fn size(&self) -> usize {
        TRAILER
    }
}

/// moemoekyun layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Moemoekyun;

impl McbLayout for Moemoekyun {
    fn kind(&self) -> TransportKind {
        TransportKind::Moemoekyun
    }

    fn max_subdevices(&self) -> usize {
        MAX_SUB
    }

    fn offset(&self, field: Field, idx: usize) -> Option<usize> {
        common_offset(field, idx)
            .or_else(|| ep_window_offset(field, idx))
            .or_else(|| trailer_offset(field, idx))
    }

    fn size(&self) -> usize {
        TRAILER + TRAILER_SIZE
    }
}

/// bsb layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bsb;

impl McbLayout for Bsb {
    fn kind(&self) -> TransportKind {
        TransportKind::Bsb
    }

    fn max_subdevices(&self) -> usize {
        1
    }

    fn offset(&self, field: Field, idx: usize) -> Option<usize> {
        common_offset(field, idx).or_else(|| ep_window_offset(field, idx))
    }

    fn size(&self) -> usize {
        TRAILER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::REGISTER_BAR_SIZE;
    use crate::pci_test;

    #[test]
    fn extension_offsets() {
        assert_eq!(EP_WINDOW, 596);
        assert_eq!(TRAILER, 724);
        let l = TransportKind::Moemoekyun.layout();
        assert_eq!(l.offset(Field::EpWindowSize, 15), Some(596 + 15 * 8 + 4));
        assert_eq!(l.offset(Field::HeartbeatEp, 0), Some(736));
    }

    #[test]
    fn only_moemoekyun_has_trailer() {
        assert!(TransportKind::Moemoekyun.layout().has_trailer());
        assert!(!TransportKind::Excalibur.layout().has_trailer());
        assert!(!TransportKind::Bsb.layout().has_trailer());
    }

    #[test]
    fn bsb_is_single_subdevice() {
        assert_eq!(TransportKind::Bsb.layout().max_subdevices(), 1);
        assert_eq!(TransportKind::Excalibur.layout().max_subdevices(), MAX_SUB);
    }

    #[test]
    fn layouts_fit_below_test_registers() {
        for kind in TransportKind::ALL {
            let size = kind.layout().size();
            assert!(size <= pci_test::REG_BASE, "{kind} overlaps test registers");
            assert!(size <= REGISTER_BAR_SIZE);
        }
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in TransportKind::ALL {
            assert_eq!(kind.name().parse::<TransportKind>().unwrap(), kind);
        }
        assert!("pcie".parse::<TransportKind>().is_err());
    }
}
