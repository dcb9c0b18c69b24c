#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use vhci_protocol::{DeviceEvent, DeviceSignal, TransferKind};
use vhci_usb::device::Urb;
use vhci_usb::gadget::{
    Config, ConfigCaps, Endpoint, EndpointCaps, EndpointDir, EndpointHandler, Gadget, GadgetCaps,
    GadgetRequest, Interface, InterfaceCaps,
};
use vhci_usb::hcd::{port_feature, VhciController};
use vhci_usb::strings::{StringTable, UsbString};
use vhci_usb::{SetupPacket, UrbStatus};

/// One half of an in-memory byte stream.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<VecDeque<u8>>>);

impl SharedBuf {
    pub fn push(&self, bytes: &[u8]) {
        self.0.borrow_mut().extend(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Drains complete frames (header + payload) accumulated so far.
    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut buf = self.0.borrow_mut();
        while buf.len() >= vhci_protocol::HEADER_SIZE {
            let header: Vec<u8> = buf.iter().take(8).copied().collect();
            let payload_len = vhci_protocol::header_payload_len(header[..8].try_into().unwrap());
            let total = vhci_protocol::HEADER_SIZE + payload_len;
            if buf.len() < total {
                break;
            }
            frames.push(buf.drain(..total).collect());
        }
        frames
    }
}

impl Read for SharedBuf {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let mut buf = self.0.borrow_mut();
        let n = out.len().min(buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for SharedBuf {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Emulator-side transport: reads controller frames, writes device frames.
pub struct Duplex {
    pub rx: SharedBuf,
    pub tx: SharedBuf,
}

impl Read for Duplex {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.rx.read(out)
    }
}

impl Write for Duplex {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.tx.write(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn attach_frame() -> Vec<u8> {
    DeviceEvent::Signal(DeviceSignal::Attached).encode()
}

pub fn detach_frame() -> Vec<u8> {
    DeviceEvent::Signal(DeviceSignal::Detached).encode()
}

/// Attaches a device, powers and resets the port, and polls status past the
/// reset deadline so the port ends up enabled. Returns the instant the
/// bring-up finished at.
pub fn bring_up_port(ctrl: &mut VhciController, port: usize, start: Instant) -> Instant {
    ctrl.open_port(port).unwrap();
    ctrl.write_port_event(port, &attach_frame()).unwrap();
    ctrl.set_port_feature(port, port_feature::POWER, start).unwrap();
    ctrl.set_port_feature(port, port_feature::RESET, start).unwrap();
    let now = start + Duration::from_millis(60);
    let (status, _) = ctrl.port_status(port, now).unwrap();
    assert_ne!(status & 0x2, 0, "port must be enabled after reset completes");
    now
}

/// Reads and discards every queued port event (bring-up signals etc).
pub fn drain_port_events(ctrl: &mut VhciController, port: usize) -> usize {
    let mut drained = 0;
    while ctrl.read_port_event(port).is_some() {
        drained += 1;
    }
    drained
}

pub fn setup(bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type,
        b_request,
        w_value,
        w_index,
        w_length,
    }
}

/// Control IN URB aimed at endpoint zero.
pub fn control_in_urb(id: u32, setup: SetupPacket) -> Urb {
    Urb {
        id,
        kind: TransferKind::Control,
        flags: 0,
        endpoint_address: 0x80,
        setup: Some(setup),
        transfer_length: u32::from(setup.w_length),
        buffer: vec![0; usize::from(setup.w_length)],
        actual_length: 0,
        interval_us: 0,
        status: None,
        iso_packets: Vec::new(),
    }
}

/// Control OUT URB aimed at endpoint zero.
pub fn control_out_urb(id: u32, setup: SetupPacket, data: Vec<u8>) -> Urb {
    Urb {
        id,
        kind: TransferKind::Control,
        flags: 0,
        endpoint_address: 0x00,
        setup: Some(setup),
        transfer_length: u32::from(setup.w_length),
        buffer: data,
        actual_length: 0,
        interval_us: 0,
        status: None,
        iso_packets: Vec::new(),
    }
}

pub fn interrupt_in_urb(id: u32, endpoint: u8, length: u32) -> Urb {
    Urb {
        id,
        kind: TransferKind::Interrupt,
        flags: 0,
        endpoint_address: endpoint | 0x80,
        setup: None,
        transfer_length: length,
        buffer: vec![0; length as usize],
        actual_length: 0,
        interval_us: 875,
        status: None,
        iso_packets: Vec::new(),
    }
}

/// Endpoint-zero handler that stalls whatever the standard-request filter
/// did not consume.
pub struct StallUnknown;

impl EndpointHandler for StallUnknown {
    fn enqueue(&mut self, request: &mut GadgetRequest) {
        request.complete(UrbStatus::Stall);
    }
}

pub type ReportQueue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Interrupt IN source: answers from a shared report queue, or leaves the
/// request pending when the queue is empty (completed later through
/// `Gadget::complete_pending`).
pub struct ReportSource {
    pub reports: ReportQueue,
}

impl EndpointHandler for ReportSource {
    fn enqueue(&mut self, request: &mut GadgetRequest) {
        if let Some(report) = self.reports.borrow_mut().pop_front() {
            request.urb.complete_in(&report);
        }
    }
}

/// The enumeration-scenario gadget: a high-speed HID boot mouse with one
/// configuration, one interface and one interrupt IN endpoint.
pub fn mouse_gadget() -> (Gadget, ReportQueue) {
    let reports: ReportQueue = Rc::new(RefCell::new(VecDeque::new()));

    let ep0 = Endpoint::new(
        EndpointCaps {
            address: 0,
            dir: EndpointDir::InOut,
            kind: TransferKind::Control,
            max_packet_size: 64,
            ..Default::default()
        },
        Box::new(StallUnknown),
    );
    let ep1 = Endpoint::new(
        EndpointCaps {
            address: 1,
            dir: EndpointDir::In,
            kind: TransferKind::Interrupt,
            max_packet_size: 8,
            interval: 7,
            ..Default::default()
        },
        Box::new(ReportSource {
            reports: reports.clone(),
        }),
    );

    let hid_descriptor = vec![0x09, 0x21, 0x10, 0x01, 0x00, 0x01, 0x22, 0x34, 0x00];
    let interface = Interface::new(
        InterfaceCaps {
            number: 0,
            alt_setting: 0,
            interface_class: 0x03,     // HID
            interface_sub_class: 0x01, // boot
            interface_protocol: 0x02,  // mouse
            description: 0,
            trailers: vec![hid_descriptor],
        },
        vec![ep1],
        Box::new(()),
    );
    let config = Config::new(
        ConfigCaps {
            number: 1,
            attributes: 0xa0,
            max_power: 49,
            description: 0,
        },
        vec![interface],
        Box::new(()),
    );

    let gadget = Gadget::new(
        GadgetCaps {
            bcd_usb: 0x0200,
            bcd_device: 0x3000,
            vendor_id: 0x046d,
            product_id: 0xc051,
            manufacturer: 1,
            product: 2,
            serial_number: 0,
            string_tables: vec![StringTable {
                language_id: 0x0409,
                strings: vec![
                    UsbString::new(1, "Logitech"),
                    UsbString::new(2, "USB-PS/2 Optical Mouse"),
                ],
            }],
            ..Default::default()
        },
        ep0,
        vec![config],
        Box::new(()),
    )
    .unwrap();

    (gadget, reports)
}

/// Brings a fresh gadget to the configured state the way the port would:
/// reset, then SET_CONFIGURATION(1).
pub fn configure_mouse(gadget: &mut Gadget) {
    use vhci_usb::device::Event;
    use vhci_usb::usb::PortSignal;

    gadget.handle_event(Event::Signal(PortSignal::ResetStart));
    gadget.handle_event(Event::Signal(PortSignal::ResetEnd));
    let urb = control_out_urb(1, setup(0x00, 0x09, 1, 0, 0), Vec::new());
    gadget.handle_event(Event::Urb(urb));
    let done = gadget.drain_completions();
    assert_eq!(done.last().unwrap().status, Some(UrbStatus::Completed));
}
