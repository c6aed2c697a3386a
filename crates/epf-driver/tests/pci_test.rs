// SPDX-License-Identifier: AGPL-3.0-only

//! PCI endpoint test function driven through the 'P' ioctls

mod common;

use common::{config, link};
use epf_driver::{EndpointId, Loopback, Registry};
use epf_proto::ioctl::pcitest;
use epf_proto::pci_test::irq_type;

fn p(registry: &Registry, id: EndpointId, cmd: u32, value: u64) -> i32 {
    let mut arg = value.to_le_bytes();
    registry.ioctl(id, cmd, &mut arg, None)
}

fn setup() -> (Loopback, Registry, EndpointId) {
    let link = link(&config(1, 64 << 10));
    let registry = Registry::new();
    let id = registry.probe(link.rc().clone()).expect("probe RC");
    (link, registry, id)
}

/// Every command needs the EP function to be running
#[test]
fn test_commands_need_running_function() {
    let (_link, registry, id) = setup();
    assert_eq!(p(&registry, id, pcitest::LEGACY_IRQ, 0), -libc::EAGAIN);
    assert_eq!(p(&registry, id, pcitest::WRITE, 4096), -libc::EAGAIN);
}

/// BAR tests restore what they overwrite
#[test]
fn test_bar_patterns() {
    let (link, registry, id) = setup();
    let _function = link.start_test_function().expect("start test function");
    let before = common::mcb_image(&link);

    for n in 0..3 {
        assert_eq!(p(&registry, id, pcitest::BAR, n), 0, "BAR{n}");
    }
    assert_eq!(p(&registry, id, pcitest::BARS, 0), 0);
    assert_eq!(p(&registry, id, pcitest::BAR, 5), -libc::EINVAL);
    assert_eq!(common::mcb_image(&link), before);

    // The mailbox word was skipped, so the EP saw no doorbell
    assert_eq!(link.ep().interrupts().count(), 0);
}

/// Legacy, MSI and MSI-X vectors arrive as requested
#[test]
fn test_interrupts() {
    let (link, registry, id) = setup();
    let function = link.start_test_function().expect("start test function");

    assert_eq!(p(&registry, id, pcitest::LEGACY_IRQ, 0), 0);
    for v in [1, 7, 32] {
        assert_eq!(p(&registry, id, pcitest::MSI, v), 0, "MSI {v}");
        assert_eq!(link.rc().interrupts().last_vector(), v as u32);
    }
    for v in [1, 2048] {
        assert_eq!(p(&registry, id, pcitest::MSIX, v), 0, "MSI-X {v}");
    }
    assert_eq!(p(&registry, id, pcitest::MSI, 0), -libc::EINVAL);
    assert_eq!(p(&registry, id, pcitest::MSI, 33), -libc::EINVAL);
    assert_eq!(p(&registry, id, pcitest::MSIX, 2049), -libc::EINVAL);
    assert_eq!(function.handled(), 6);
}

/// Data commands with and without the DMA engine
#[test]
fn test_write_read_copy() {
    let (link, registry, id) = setup();
    let function = link.start_test_function().expect("start test function");
    let host = registry.test_host(id).expect("test host");

    for use_dma in [true, false] {
        host.set_use_dma(use_dma);
        let submitted = link.ep_dma().submitted();
        for size in [1u64, 1024, 1025, 1 << 20] {
            assert_eq!(p(&registry, id, pcitest::WRITE, size), 0, "WRITE {size} dma={use_dma}");
            assert_eq!(p(&registry, id, pcitest::READ, size), 0, "READ {size} dma={use_dma}");
            assert_eq!(p(&registry, id, pcitest::COPY, size), 0, "COPY {size} dma={use_dma}");
        }
        assert_eq!(link.ep_dma().submitted() > submitted, use_dma);
    }
    assert_eq!(function.handled(), 24);
}

/// Interrupt type bookkeeping
#[test]
fn test_irq_type_ioctls() {
    let (link, registry, id) = setup();
    let _function = link.start_test_function().expect("start test function");

    let mut arg = [0u8; 8];
    assert_eq!(registry.ioctl(id, pcitest::GET_IRQTYPE, &mut arg, None), 0);
    assert_eq!(u64::from_le_bytes(arg), u64::from(irq_type::MSI));

    assert_eq!(p(&registry, id, pcitest::SET_IRQTYPE, u64::from(irq_type::LEGACY)), 0);
    assert_eq!(p(&registry, id, pcitest::READ, 4096), 0);
    assert_eq!(link.rc().interrupts().last_vector(), 0);

    assert_eq!(p(&registry, id, pcitest::SET_IRQTYPE, 9), -libc::EINVAL);
    assert_eq!(p(&registry, id, pcitest::CLEAR_IRQ, 0), 0);
    assert_eq!(registry.ioctl(id, pcitest::GET_IRQTYPE, &mut arg, None), -libc::EINVAL);
    assert_eq!(p(&registry, id, pcitest::WRITE, 4096), -libc::EINVAL);
}

/// Stopping the function clears its magic
#[test]
fn test_stop_function() {
    let (link, registry, id) = setup();
    let mut function = link.start_test_function().expect("start test function");
    assert_eq!(p(&registry, id, pcitest::LEGACY_IRQ, 0), 0);
    function.stop();
    assert_eq!(p(&registry, id, pcitest::LEGACY_IRQ, 0), -libc::EAGAIN);
}
