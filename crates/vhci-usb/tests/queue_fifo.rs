//! FIFO ordering of the per-port transfer queue, including sequence-number
//! wrap (the counter starts near the 32-bit boundary).

use std::time::Instant;

use vhci_protocol::HostEvent;
use vhci_usb::hcd::{HostUrb, VhciController};

mod util;

use util::{bring_up_port, drain_port_events};

#[test]
fn transfers_are_delivered_in_submission_order() {
    let mut ctrl = VhciController::new(2).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    let mut seqs = Vec::new();
    for i in 0..8u32 {
        let urb = HostUrb::bulk_out(2, vec![i as u8; 4]);
        seqs.push(ctrl.urb_enqueue(0, urb).unwrap());
    }

    for &expected in &seqs {
        let frame = ctrl.read_port_event(0).expect("queued transfer");
        match HostEvent::decode(&frame).unwrap() {
            HostEvent::Transfer(t) => assert_eq!(t.seq_num, expected),
            other => panic!("expected transfer, got {other:?}"),
        }
    }
    assert!(ctrl.read_port_event(0).is_none());
}

#[test]
fn sequence_numbers_strictly_increase_across_wrap() {
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    // The counter starts at 0xffff_ff00, so 512 submissions cross zero.
    let mut last: Option<u32> = None;
    for _ in 0..512 {
        let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
        if let Some(prev) = last {
            assert_eq!(seq, prev.wrapping_add(1));
        }
        last = Some(seq);
        // Deliver each event so the cursor keeps pace with submissions.
        ctrl.read_port_event(0).unwrap();
    }
    assert!(last.unwrap() < 0x8000_0000, "counter wrapped through zero");
}

#[test]
fn interleaved_submission_and_delivery_preserves_order() {
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    let a = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    let b = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();

    let read_seq = |ctrl: &mut VhciController| -> u32 {
        match HostEvent::decode(&ctrl.read_port_event(0).unwrap()).unwrap() {
            HostEvent::Transfer(t) => t.seq_num,
            other => panic!("expected transfer, got {other:?}"),
        }
    };

    assert_eq!(read_seq(&mut ctrl), a);
    let c = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    assert_eq!(read_seq(&mut ctrl), b);
    assert_eq!(read_seq(&mut ctrl), c);
    assert!(ctrl.read_port_event(0).is_none());

    let d = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    assert_eq!(read_seq(&mut ctrl), d);
}

#[test]
fn disabled_port_refuses_transfers() {
    let mut ctrl = VhciController::new(1).unwrap();
    ctrl.open_port(0).unwrap();
    ctrl.write_port_event(0, &util::attach_frame()).unwrap();
    // No power/reset: the port is not enabled.
    let err = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8));
    assert!(err.is_err());
}
