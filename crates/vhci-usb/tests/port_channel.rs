//! The per-port event channel: exclusive open, implicit detach on close,
//! poll readiness, and completion handling at the controller edge.

use std::time::Instant;

use vhci_protocol::{CompletionEvent, CompletionStatus, DeviceEvent, HostEvent};
use vhci_usb::hcd::{HostTransferStatus, HostUrb, PortStatus, VhciController};
use vhci_usb::Error;

mod util;

use util::{bring_up_port, drain_port_events};

#[test]
fn second_open_is_busy() {
    let mut ctrl = VhciController::new(2).unwrap();
    ctrl.open_port(0).unwrap();
    assert!(matches!(ctrl.open_port(0), Err(Error::Busy)));
    // Other ports are unaffected.
    ctrl.open_port(1).unwrap();
}

#[test]
fn close_detaches_and_allows_reopen() {
    let start = Instant::now();
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, start);
    drain_port_events(&mut ctrl, 0);

    let _seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    let giveback = ctrl.close_port(0);
    assert_eq!(giveback.len(), 1);
    assert_eq!(giveback[0].status, HostTransferStatus::DeviceLost);

    let (status, _) = ctrl.port_status(0, start).unwrap();
    assert_eq!(status & PortStatus::CONNECTION.bits(), 0);

    ctrl.open_port(0).unwrap();
}

#[test]
fn poll_reflects_event_availability() {
    let start = Instant::now();
    let mut ctrl = VhciController::new(1).unwrap();
    assert!(!ctrl.poll_port(0));

    bring_up_port(&mut ctrl, 0, start);
    assert!(ctrl.poll_port(0));
    drain_port_events(&mut ctrl, 0);
    assert!(!ctrl.poll_port(0));

    ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    assert!(ctrl.poll_port(0));
}

#[test]
fn unprocessed_completion_surfaces_as_transfer_error() {
    let start = Instant::now();
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, start);
    drain_port_events(&mut ctrl, 0);

    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    ctrl.read_port_event(0).unwrap();

    let completion = DeviceEvent::Completion(CompletionEvent::unprocessed(seq));
    let giveback = ctrl.write_port_event(0, &completion.encode()).unwrap();
    assert_eq!(giveback.len(), 1);
    assert_eq!(giveback[0].status, HostTransferStatus::Error);
}

#[test]
fn completion_for_undelivered_transfer_is_ignored() {
    let start = Instant::now();
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, start);
    drain_port_events(&mut ctrl, 0);

    // Not yet read by the emulator: a completion for it cannot apply.
    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    let completion = DeviceEvent::Completion(CompletionEvent {
        seq_num: seq,
        status: CompletionStatus::Completed,
        actual_length: 0,
        iso_packets: Vec::new(),
        data: Vec::new(),
    });
    let giveback = ctrl.write_port_event(0, &completion.encode()).unwrap();
    assert!(giveback.is_empty());

    // The transfer is still queued for delivery.
    assert!(matches!(
        HostEvent::decode(&ctrl.read_port_event(0).unwrap()).unwrap(),
        HostEvent::Transfer(_)
    ));
}

#[test]
fn in_completion_with_mismatched_data_length_is_rejected() {
    let start = Instant::now();
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, start);
    drain_port_events(&mut ctrl, 0);

    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 8)).unwrap();
    ctrl.read_port_event(0).unwrap();

    let completion = DeviceEvent::Completion(CompletionEvent {
        seq_num: seq,
        status: CompletionStatus::Completed,
        actual_length: 4,
        iso_packets: Vec::new(),
        data: vec![1, 2], // claims 4 bytes, carries 2
    });
    assert!(matches!(
        ctrl.write_port_event(0, &completion.encode()),
        Err(Error::Protocol(_))
    ));

    // The record is still pending; a correct completion succeeds.
    let completion = DeviceEvent::Completion(CompletionEvent {
        seq_num: seq,
        status: CompletionStatus::Completed,
        actual_length: 4,
        iso_packets: Vec::new(),
        data: vec![1, 2, 3, 4],
    });
    let giveback = ctrl.write_port_event(0, &completion.encode()).unwrap();
    assert_eq!(giveback.len(), 1);
    assert_eq!(giveback[0].actual_length, 4);
    assert_eq!(giveback[0].data, vec![1, 2, 3, 4]);
}

#[test]
fn in_reply_longer_than_request_is_rejected() {
    let start = Instant::now();
    let mut ctrl = VhciController::new(1).unwrap();
    bring_up_port(&mut ctrl, 0, start);
    drain_port_events(&mut ctrl, 0);

    let seq = ctrl.urb_enqueue(0, HostUrb::bulk_in(1, 4)).unwrap();
    ctrl.read_port_event(0).unwrap();

    let completion = DeviceEvent::Completion(CompletionEvent {
        seq_num: seq,
        status: CompletionStatus::Completed,
        actual_length: 8,
        iso_packets: Vec::new(),
        data: vec![0; 8],
    });
    assert!(ctrl.write_port_event(0, &completion.encode()).is_err());
}
