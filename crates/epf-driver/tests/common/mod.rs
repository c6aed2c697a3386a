// SPDX-License-Identifier: AGPL-3.0-only

//! Shared helpers for loopback integration tests

#![allow(dead_code)]

use epf_driver::{ControlBlock, Loopback, TransportConfig};
use epf_proto::bar::BarRole;
use rand::RngCore;
use std::time::Duration;

/// Loopback sized for tests: `nr` subdevices of `region` bytes
pub fn config(nr: usize, region: usize) -> TransportConfig {
    let mut c = TransportConfig::default().with_subdevices(nr);
    c.region_size = region;
    c.rc_pool_size = (nr * region + (8 << 20)).next_power_of_two();
    c.ep_mem_size = 16 << 20;
    c.wait_timeout = Duration::from_secs(5);
    c
}

/// Probe a loopback pair or fail the test
pub fn link(config: &TransportConfig) -> Loopback {
    Loopback::new(config).expect("Failed to build loopback link")
}

/// `len` random bytes
pub fn payload(len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut v);
    v
}

/// Raw image of the MCB and PCI test registers
pub fn mcb_image(link: &Loopback) -> Vec<u8> {
    let regs = link
        .ep()
        .bar(BarRole::Register)
        .expect("register BAR mapped")
        .clone();
    let mut image = vec![0u8; regs.size()];
    regs.read_bytes(0, &mut image).expect("register BAR readable");
    image
}

/// Short deadline for waits expected to time out
pub const SHORT: Duration = Duration::from_millis(50);

/// RC view of the MCB
pub fn rc_mcb(link: &Loopback) -> &ControlBlock {
    link.rc().control_block()
}
