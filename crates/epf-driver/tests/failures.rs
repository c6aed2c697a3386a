// SPDX-License-Identifier: AGPL-3.0-only

//! Fault handling: DMA errors, wedged engines, surprise removal

mod common;

use common::{config, link, payload, SHORT};
use epf_driver::{DoorbellMethod, EpfError, Side, Transfer, WaitOpts};
use std::thread;
use std::time::Duration;

/// A failed DMA publishes nothing; the retry answers the same request
#[test]
fn test_dma_failure_then_retry() {
    let link = link(&config(1, 64 << 10));
    let (rc, ep) = (link.rc(), link.ep());
    let data = payload(8192);
    let src = ep.alloc(8192).unwrap();
    src.write(0, &data).unwrap();
    let rmem = rc.region(0).unwrap().bus_addr();
    let xfer = Transfer::new(0, src.bus_addr(), rmem, 8192);

    let reply = thread::scope(|s| {
        let req = s.spawn(|| rc.exchange(0, 0x55, WaitOpts::default()));

        link.ep_dma().fail_next(1);
        let err = ep.ep_outbound(&xfer, WaitOpts::default()).unwrap_err();
        assert!(matches!(err, EpfError::DmaFailed { .. }), "got {err}");
        assert_eq!(err.errno(), -libc::EIO);
        assert_eq!(rc.control_block().wakeup(Side::Rc, 0).unwrap(), 0);
        assert!(!ep.is_dead());

        // No second exchange: the consumed request is still armed
        ep.ep_outbound(&xfer, WaitOpts::deadline(SHORT)).expect("retry");
        req.join().unwrap().expect("exchange")
    });

    assert_eq!(reply, 8192);
    assert_eq!(rc.region(0).unwrap().to_vec().unwrap()[..8192], data[..]);
    assert_eq!(rc.control_block().wakeup(Side::Ep, 0).unwrap(), 1);
}

/// A rejected RC descriptor leaves the window for the retry
#[test]
fn test_rejected_descriptor_then_retry() {
    let link = link(&config(1, 64 << 10));
    let (rc, ep) = (link.rc(), link.ep());
    let data = payload(4096);
    let window = ep.alloc(4096).unwrap();
    window.write(0, &data).unwrap();
    ep.publish_window(0, window.bus_addr(), 4096, 0).unwrap();

    let dst = rc.alloc(4096).unwrap();
    let xfer = Transfer::new(0, dst.bus_addr(), 0, 4096);
    link.rc_dma().reject_next(1);
    let err = rc.rc_inbound(&xfer, WaitOpts::default()).unwrap_err();
    assert!(matches!(err, EpfError::DmaFailed { .. }));
    assert_eq!(rc.control_block().wakeup(Side::Ep, 0).unwrap(), 0);

    rc.rc_inbound(&xfer, WaitOpts::deadline(SHORT)).expect("retry");
    assert_eq!(dst.to_vec().unwrap(), data);
    assert_eq!(rc.control_block().wakeup(Side::Ep, 0).unwrap(), 1);
}

/// A DMA that never completes trips the watchdog and kills the endpoint
#[test]
fn test_watchdog_declares_endpoint_dead() {
    let mut cfg = config(1, 64 << 10);
    cfg.dma_watchdog = Duration::from_millis(100);
    let link = link(&cfg);
    let (rc, ep) = (link.rc(), link.ep());
    let src = ep.alloc(4096).unwrap();
    let rmem = rc.region(0).unwrap().bus_addr();

    thread::scope(|s| {
        let req = s.spawn(|| rc.exchange(0, 0, WaitOpts::deadline(Duration::from_millis(500))));
        link.ep_dma().stall_next(1);
        let err = ep
            .ep_outbound(&Transfer::new(0, src.bus_addr(), rmem, 4096), WaitOpts::default())
            .unwrap_err();
        assert!(matches!(err, EpfError::DeviceGone { .. }), "got {err}");
        let rc_err = req.join().unwrap().unwrap_err();
        assert!(matches!(rc_err, EpfError::Timeout { .. }));
    });

    assert!(ep.is_dead());
    let err = ep.msg2rc(0, 1).unwrap_err();
    assert_eq!(err.errno(), -libc::ENODEV);
    assert!(matches!(ep.alloc(64), Err(EpfError::DeviceGone { .. })));
    // The RC is unaffected
    assert!(!rc.is_dead());
    assert_eq!(rc.control_block().wakeup(Side::Rc, 0).unwrap(), 0);
}

/// Surprise removal wakes a blocked RC and every later call fails
#[test]
fn test_unplug_during_exchange() {
    let link = link(&config(2, 64 << 10));
    let (rc, ep) = (link.rc(), link.ep());

    let err = thread::scope(|s| {
        let req = s.spawn(|| rc.exchange(1, 3, WaitOpts::default()));
        thread::sleep(Duration::from_millis(50));
        link.unplug();
        req.join().unwrap().unwrap_err()
    });
    assert!(matches!(err, EpfError::DeviceGone { .. }), "got {err}");
    assert!(rc.is_dead());

    assert!(matches!(
        rc.exchange(0, 0, WaitOpts::default()),
        Err(EpfError::DeviceGone { .. })
    ));
    assert!(matches!(rc.subdevices_info(), Err(EpfError::DeviceGone { .. })));
    assert!(matches!(ep.msg2rc(0, 0), Err(EpfError::DeviceGone { .. })));
    assert!(ep.is_dead());
}

/// The GPIO doorbell carries the same protocol
#[test]
fn test_gpio_doorbell_exchange() {
    let link = link(&config(1, 64 << 10).with_doorbell(DoorbellMethod::Gpio));
    let (rc, ep) = (link.rc(), link.ep());
    assert_eq!(rc.doorbell().method(), "gpio");
    let gpio = link.gpio().expect("GPIO line");
    let level = gpio.level();

    let reply = thread::scope(|s| {
        let req = s.spawn(|| rc.exchange(0, 11, WaitOpts::default()));
        assert_eq!(ep.wait_msg2ep(0, WaitOpts::default()).unwrap(), 11);
        ep.msg2rc(0, 12).unwrap();
        req.join().unwrap().unwrap()
    });
    assert_eq!(reply, 12);
    assert_ne!(gpio.level(), level);
    assert_eq!(ep.interrupts().count(), 1);
}
