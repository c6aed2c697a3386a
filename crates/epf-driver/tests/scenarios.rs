// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios over the loopback platform
//!
//! Each test drives a probed RC + EP pair through one of the documented
//! flows and checks both the data and the MCB counters.

mod common;

use common::{config, link, mcb_image, payload, SHORT};
use epf_driver::{CancelToken, EpfError, Side, Transfer, WaitOpts};
use std::thread;
use std::time::Duration;

/// Scenario 1: EP-OB of 1 MiB on subdevice 0
#[test]
fn test_ep_outbound_one_mib_slot_0() {
    let link = link(&config(1, 1 << 20));
    let (rc, ep) = (link.rc(), link.ep());
    let len = 1 << 20;
    let data = payload(len);

    let src = ep.alloc(len).expect("EP buffer");
    src.write(0, &data).expect("fill EP buffer");
    let rmem = rc.region(0).expect("region 0").bus_addr();

    let msg2rc = thread::scope(|s| {
        let req = s.spawn(|| rc.exchange(0, len as u32, WaitOpts::default()));
        ep.ep_outbound(&Transfer::new(0, src.bus_addr(), rmem, len), WaitOpts::default())
            .expect("EP-OB");
        req.join().expect("RC thread").expect("exchange")
    });

    assert_eq!(msg2rc, len as u32);
    assert_eq!(rc.region(0).unwrap().to_vec().unwrap(), data);
    let mcb = rc.control_block();
    assert_eq!(mcb.wakeup(Side::Ep, 0).unwrap(), 1);
    assert_eq!(mcb.wakeup(Side::Rc, 0).unwrap(), 1);
    assert_eq!(mcb.msg_size(Side::Ep, 0).unwrap(), len as u32);
}

/// Scenario 2: RC-IB of 4 MiB - 1, split into a DMA head and a CPU tail
#[test]
fn test_rc_inbound_head_and_tail() {
    let link = link(&config(1, 4 << 20));
    let (rc, ep) = (link.rc(), link.ep());
    let len = (4 << 20) - 1;
    let data = payload(len);

    let window = ep.alloc(len).expect("EP window buffer");
    window.write(0, &data).unwrap();
    ep.publish_window(0, window.bus_addr(), len, len as u32)
        .expect("publish window");

    let dst = rc.alloc(len).expect("RC buffer");
    let before = link.rc_dma().submitted();
    rc.rc_inbound(&Transfer::new(0, dst.bus_addr(), 0, len), WaitOpts::default())
        .expect("RC-IB");

    assert_eq!(dst.to_vec().unwrap(), data);
    // One descriptor for the burst-aligned head, the 63-byte tail by CPU
    assert_eq!(link.rc_dma().submitted() - before, 1);
    assert_eq!(
        ep.wait_msg2ep(0, WaitOpts::deadline(SHORT)).expect("RC completion"),
        len as u32
    );
}

/// Scenario 3: EP-OB on subdevices 0 and 7 at the same time
#[test]
fn test_parallel_slots_do_not_interfere() {
    let link = link(&config(8, 1 << 20));
    let (rc, ep) = (link.rc(), link.ep());
    let len = 512 << 10;
    let a = payload(len);
    let b = payload(len);

    thread::scope(|s| {
        for (idx, data) in [(0usize, &a), (7usize, &b)] {
            s.spawn(move || {
                rc.exchange(idx, 0, WaitOpts::default())
                    .expect("exchange")
            });
            s.spawn(move || {
                let src = ep.alloc(len).expect("EP buffer");
                src.write(0, data).unwrap();
                let rmem = rc.region(idx).unwrap().bus_addr();
                ep.ep_outbound(&Transfer::new(idx, src.bus_addr(), rmem, len), WaitOpts::default())
                    .expect("EP-OB");
            });
        }
    });

    assert_eq!(rc.region(0).unwrap().to_vec().unwrap()[..len], a[..]);
    assert_eq!(rc.region(7).unwrap().to_vec().unwrap()[..len], b[..]);
    for idx in 1..7 {
        assert_eq!(rc.control_block().wakeup(Side::Rc, idx).unwrap(), 0);
    }
}

/// Scenario 4: a cancelled EP wait leaves no trace, the retry succeeds
#[test]
fn test_cancelled_wait_then_retry() {
    let link = link(&config(2, 64 << 10));
    let (rc, ep) = (link.rc(), link.ep());
    let token = CancelToken::new();

    let err = thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        ep.wait_msg2ep(1, WaitOpts::default().with_cancel(&token))
            .unwrap_err()
    });
    assert!(matches!(err, EpfError::Cancelled { .. }), "got {err}");
    assert_eq!(err.errno(), -libc::EINTR);
    assert!(!rc.control_block().waiting(Side::Ep, 1).unwrap());
    assert_eq!(rc.control_block().wakeup(Side::Rc, 1).unwrap(), 0);

    token.reset();
    let reply = thread::scope(|s| {
        let req = s.spawn(|| rc.exchange(1, 0x1234, WaitOpts::default()));
        let msg = ep
            .wait_msg2ep(1, WaitOpts::default().with_cancel(&token))
            .expect("retry");
        assert_eq!(msg, 0x1234);
        ep.msg2rc(1, 0x4321).expect("msg2rc");
        req.join().unwrap().expect("exchange")
    });
    assert_eq!(reply, 0x4321);
}

/// A cancelled RC exchange stays pending and resumes without republishing
#[test]
fn test_cancelled_exchange_resumes() {
    let link = link(&config(1, 64 << 10));
    let (rc, ep) = (link.rc(), link.ep());
    let token = CancelToken::new();

    let err = thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        rc.exchange(0, 7, WaitOpts::default().with_cancel(&token))
            .unwrap_err()
    });
    assert!(matches!(err, EpfError::Cancelled { .. }));
    assert!(rc.exchange_pending(0).unwrap());
    assert_eq!(rc.control_block().wakeup(Side::Ep, 0).unwrap(), 1);

    // RC transfers on the slot must wait for the exchange to finish
    let buf = rc.alloc(64).unwrap();
    let err = rc
        .rc_outbound(&Transfer::new(0, buf.bus_addr(), 0, 64), WaitOpts::deadline(SHORT))
        .unwrap_err();
    assert!(matches!(err, EpfError::PeerNotReady { .. }));

    let reply = thread::scope(|s| {
        let req = s.spawn(|| rc.exchange(0, 99, WaitOpts::default()));
        assert_eq!(ep.wait_msg2ep(0, WaitOpts::default()).unwrap(), 7);
        ep.msg2rc(0, 8).unwrap();
        req.join().unwrap().expect("resumed exchange")
    });
    assert_eq!(reply, 8);
    assert!(!rc.exchange_pending(0).unwrap());
    assert_eq!(rc.control_block().wakeup(Side::Ep, 0).unwrap(), 1);
}

/// Scenario 5: the peer never answers on subdevice 3
#[test]
fn test_peer_timeout_leaves_counters_alone() {
    let link = link(&config(4, 64 << 10));
    let rc = link.rc();
    let buf = rc.alloc(4096).unwrap();

    let err = rc
        .rc_outbound(&Transfer::new(3, buf.bus_addr(), 0, 4096), WaitOpts::deadline(SHORT))
        .unwrap_err();
    assert!(matches!(err, EpfError::Timeout { .. }), "got {err}");
    assert!(err.is_transient());
    assert_eq!(rc.control_block().wakeup(Side::Ep, 3).unwrap(), 0);
    assert!(!link.ep().control_block().waiting(Side::Rc, 3).unwrap());

    let ep = link.ep();
    let src = ep.alloc(4096).unwrap();
    let rmem = rc.region(3).unwrap().bus_addr();
    let err = ep
        .ep_outbound(&Transfer::new(3, src.bus_addr(), rmem, 4096), WaitOpts::deadline(SHORT))
        .unwrap_err();
    assert!(matches!(err, EpfError::Timeout { .. }));
    assert_eq!(rc.control_block().wakeup(Side::Rc, 3).unwrap(), 0);
}

/// Scenario 6: a transfer larger than the region is refused before any MMIO write
#[test]
fn test_oversize_rejected_before_mmio() {
    let link = link(&config(1, 64 << 10));
    let (rc, ep) = (link.rc(), link.ep());
    let len = (64 << 10) + 64;
    let src = ep.alloc(len).unwrap();
    let rmem = rc.region(0).unwrap().bus_addr();

    let before = mcb_image(&link);
    let submitted = link.ep_dma().submitted();
    let err = ep
        .ep_outbound(&Transfer::new(0, src.bus_addr(), rmem, len), WaitOpts::default())
        .unwrap_err();

    assert!(matches!(err, EpfError::InvalidArgument { .. }), "got {err}");
    assert_eq!(err.errno(), -libc::EINVAL);
    assert_eq!(mcb_image(&link), before);
    assert_eq!(link.ep_dma().submitted(), submitted);
}

/// Scenario 6 on the RC: region_size + 1 is refused before the wait
#[test]
fn test_rc_oversize_rejected_before_mmio() {
    let link = link(&config(1, 64 << 10));
    let (rc, ep) = (link.rc(), link.ep());
    let len = (64 << 10) + 1;
    let buf = rc.alloc(len).unwrap();

    // Nothing published yet: refused at once instead of timing out
    let before = mcb_image(&link);
    let err = rc
        .rc_outbound(&Transfer::new(0, buf.bus_addr(), 0, len), WaitOpts::default())
        .unwrap_err();
    assert!(matches!(err, EpfError::InvalidArgument { .. }), "got {err}");
    assert_eq!(err.errno(), -libc::EINVAL);
    assert_eq!(mcb_image(&link), before);

    // Larger than the window already published: the publication survives
    let window = ep.alloc(4096).unwrap();
    ep.publish_window(0, window.bus_addr(), 4096, 0).unwrap();
    let before = mcb_image(&link);
    let err = rc
        .rc_inbound(&Transfer::new(0, buf.bus_addr(), 0, 8192), WaitOpts::default())
        .unwrap_err();
    assert!(matches!(err, EpfError::InvalidArgument { .. }), "got {err}");
    assert_eq!(mcb_image(&link), before);
    assert_eq!(link.rc_dma().submitted(), 0);

    rc.rc_inbound(&Transfer::new(0, buf.bus_addr(), 0, 4096), WaitOpts::deadline(SHORT))
        .expect("RC-IB within the window");
    assert_eq!(rc.control_block().wakeup(Side::Ep, 0).unwrap(), 1);
}
