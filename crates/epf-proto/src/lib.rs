// SPDX-License-Identifier: AGPL-3.0-only

//! Wire model of the PCIe endpoint-function link.
//!
//! This crate has **no dependencies** and **no hardware access**. It is the
//! contract both sides of the link compile against: the MMIO control block
//! (MCB) field map, the per-transport layout extensions, BAR roles, ioctl
//! command numbers and the PCI test register block.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`limits`] | `MAX_EP`, `MAX_SUB`, DMA alignment and burst defaults |
//! | [`bar`] | EP BAR roles (register, doorbell mailbox, memory) |
//! | [`mcb`] | Common control block offsets, field ownership, flag bits |
//! | [`transport`] | excalibur / moemoekyun / bsb layouts behind [`transport::McbLayout`] |
//! | [`ioctl`] | `_IOC` encoding and the `'B'`, `'N'`, `'P'` command numbers |
//! | [`pci_test`] | PCI test function register block and bit definitions |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod ioctl;
pub mod limits;
pub mod mcb;
pub mod transport;

pub use mcb::{Field, Side};
pub use transport::{McbLayout, TransportKind};
