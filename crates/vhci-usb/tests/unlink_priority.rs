//! Cancellation semantics: undelivered transfers complete immediately and
//! never reach the emulator; delivered ones produce an unlink event that
//! jumps the queue.

use std::time::Instant;

use vhci_protocol::{CompletionEvent, CompletionStatus, DeviceEvent, HostEvent};
use vhci_usb::hcd::{HostTransferStatus, HostUrb, VhciController};

mod util;

use util::{bring_up_port, drain_port_events};

fn read_event(ctrl: &mut VhciController, port: usize) -> HostEvent {
    HostEvent::decode(&ctrl.read_port_event(port).unwrap()).unwrap()
}

#[test]
fn cancel_of_undelivered_transfer_gives_back_unlinked_without_residue() {
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 64)).unwrap();
    let giveback = ctrl.urb_dequeue(0, seq);

    assert_eq!(giveback.len(), 1);
    assert_eq!(giveback[0].seq_num, seq);
    assert_eq!(giveback[0].status, HostTransferStatus::Unlinked);

    // The emulator never observes the transfer.
    assert!(ctrl.read_port_event(0).is_none());
    assert!(!ctrl.poll_port(0));
}

#[test]
fn cancel_of_delivered_transfer_produces_unlink_event() {
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 64)).unwrap();
    assert!(matches!(read_event(&mut ctrl, 0), HostEvent::Transfer(_)));

    // Delivered: no immediate giveback, an unlink event instead.
    let giveback = ctrl.urb_dequeue(0, seq);
    assert!(giveback.is_empty());
    assert_eq!(read_event(&mut ctrl, 0), HostEvent::Unlink { seq_num: seq });

    // The emulator completes it with `unlinked`; exactly one giveback.
    let completion = DeviceEvent::Completion(CompletionEvent {
        seq_num: seq,
        status: CompletionStatus::Unlinked,
        actual_length: 0,
        iso_packets: Vec::new(),
        data: Vec::new(),
    });
    let giveback = ctrl.write_port_event(0, &completion.encode()).unwrap();
    assert_eq!(giveback.len(), 1);
    assert_eq!(giveback[0].status, HostTransferStatus::Unlinked);
}

#[test]
fn unlink_event_takes_priority_over_queued_transfers() {
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    let first = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    assert!(matches!(read_event(&mut ctrl, 0), HostEvent::Transfer(_)));

    // Queue more transfers behind the delivered one, then cancel it.
    let second = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    assert!(ctrl.urb_dequeue(0, first).is_empty());

    // The unlink overtakes the undelivered transfer.
    assert_eq!(read_event(&mut ctrl, 0), HostEvent::Unlink { seq_num: first });
    match read_event(&mut ctrl, 0) {
        HostEvent::Transfer(t) => assert_eq!(t.seq_num, second),
        other => panic!("expected transfer, got {other:?}"),
    }
}

#[test]
fn double_cancel_is_idempotent() {
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    assert!(matches!(read_event(&mut ctrl, 0), HostEvent::Transfer(_)));

    assert!(ctrl.urb_dequeue(0, seq).is_empty());
    assert!(ctrl.urb_dequeue(0, seq).is_empty());

    // Exactly one unlink event queued.
    assert_eq!(read_event(&mut ctrl, 0), HostEvent::Unlink { seq_num: seq });
    assert!(ctrl.read_port_event(0).is_none());
}

#[test]
fn completion_after_unlink_delivery_still_gives_back_once() {
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, Instant::now());
    drain_port_events(&mut ctrl, 0);

    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_out(2, vec![1, 2, 3])).unwrap();
    assert!(matches!(read_event(&mut ctrl, 0), HostEvent::Transfer(_)));
    assert!(ctrl.urb_dequeue(0, seq).is_empty());
    assert_eq!(read_event(&mut ctrl, 0), HostEvent::Unlink { seq_num: seq });

    // Emulator answers with `unlinked` after it saw the unlink event.
    let completion = DeviceEvent::Completion(CompletionEvent {
        seq_num: seq,
        status: CompletionStatus::Unlinked,
        actual_length: 0,
        iso_packets: Vec::new(),
        data: Vec::new(),
    });
    let giveback = ctrl.write_port_event(0, &completion.encode()).unwrap();
    assert_eq!(giveback.len(), 1);

    // A duplicate completion finds nothing and is ignored.
    let completion = DeviceEvent::Completion(CompletionEvent {
        seq_num: seq,
        status: CompletionStatus::Completed,
        actual_length: 0,
        iso_packets: Vec::new(),
        data: Vec::new(),
    });
    let giveback = ctrl.write_port_event(0, &completion.encode()).unwrap();
    assert!(giveback.is_empty());
}
