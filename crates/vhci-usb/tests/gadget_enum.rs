//! Enumeration through the gadget model: exact descriptor bytes for the
//! HID mouse fixture.

use vhci_usb::device::Event;
use vhci_usb::usb::{request, PortSignal};
use vhci_usb::UrbStatus;

mod util;

use util::{control_in_urb, mouse_gadget, setup};

fn get_descriptor(gadget: &mut vhci_usb::gadget::Gadget, w_value: u16, w_index: u16, len: u16) -> Vec<u8> {
    let urb = control_in_urb(1, setup(0x80, request::GET_DESCRIPTOR, w_value, w_index, len));
    gadget.handle_event(Event::Urb(urb));
    let mut done = gadget.drain_completions();
    assert_eq!(done.len(), 1);
    let urb = done.pop().unwrap();
    assert_eq!(urb.status, Some(UrbStatus::Completed));
    urb.buffer[..urb.actual_length as usize].to_vec()
}

fn reset(gadget: &mut vhci_usb::gadget::Gadget) {
    gadget.handle_event(Event::Signal(PortSignal::ResetStart));
    gadget.handle_event(Event::Signal(PortSignal::ResetEnd));
    gadget.drain_completions();
}

#[test]
fn device_descriptor_bytes() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    let bytes = get_descriptor(&mut gadget, 0x0100, 0, 18);
    assert_eq!(bytes.len(), 18);
    assert_eq!(
        &bytes[..12],
        &[0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x6d, 0x04, 0x51, 0xc0]
    );
    assert_eq!(bytes[17], 1); // bNumConfigurations
}

#[test]
fn short_device_descriptor_read() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    // The 8-byte first read of enumeration: truncated, not an error.
    let bytes = get_descriptor(&mut gadget, 0x0100, 0, 8);
    assert_eq!(bytes.len(), 8);
    assert_eq!(bytes[0], 0x12);
    assert_eq!(bytes[7], 0x40);
}

#[test]
fn config_descriptor_total_length() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    let bytes = get_descriptor(&mut gadget, 0x0200, 0, 256);
    // config(9) + interface(9) + HID(9) + endpoint(7)
    assert_eq!(bytes.len(), 34);
    assert_eq!(bytes[2], 0x22);
    assert_eq!(bytes[3], 0x00);
    assert_eq!(bytes[4], 1); // bNumInterfaces
    assert_eq!(bytes[5], 1); // bConfigurationValue
    assert_eq!(bytes[7], 0xa0);
    assert_eq!(bytes[8], 49);

    // Interface descriptor follows.
    assert_eq!(&bytes[9..14], &[0x09, 0x04, 0x00, 0x00, 0x01]);
    assert_eq!(&bytes[14..18], &[0x03, 0x01, 0x02, 0x00]);
    // HID class descriptor sits between interface and endpoint.
    assert_eq!(bytes[18], 0x09);
    assert_eq!(bytes[19], 0x21);
    // Endpoint descriptor: interrupt IN 0x81, max packet 8, interval 7.
    assert_eq!(&bytes[27..], &[0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x07]);
}

#[test]
fn truncated_config_descriptor_read() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    // Hosts first ask for just the 9-byte header to learn wTotalLength.
    let bytes = get_descriptor(&mut gadget, 0x0200, 0, 9);
    assert_eq!(bytes.len(), 9);
    assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 34);
}

#[test]
fn string_descriptors() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    let langs = get_descriptor(&mut gadget, 0x0300, 0, 255);
    assert_eq!(langs, vec![0x04, 0x03, 0x09, 0x04]);

    let manufacturer = get_descriptor(&mut gadget, 0x0301, 0x0409, 255);
    assert_eq!(manufacturer.len(), 18);
    assert_eq!(&manufacturer[..8], &[0x12, 0x03, 0x4c, 0x00, 0x6f, 0x00, 0x67, 0x00]);

    let product = get_descriptor(&mut gadget, 0x0302, 0x0409, 255);
    assert_eq!(product.len(), 2 + 2 * "USB-PS/2 Optical Mouse".len());
}

#[test]
fn unknown_string_index_stalls() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    let urb = control_in_urb(1, setup(0x80, request::GET_DESCRIPTOR, 0x0307, 0x0409, 255));
    gadget.handle_event(Event::Urb(urb));
    let done = gadget.drain_completions();
    assert_eq!(done[0].status, Some(UrbStatus::Stall));
}

#[test]
fn qualifier_descriptor_bytes() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    let bytes = get_descriptor(&mut gadget, 0x0600, 0, 10);
    assert_eq!(bytes.len(), 10);
    assert_eq!(bytes[0], 0x0a);
    assert_eq!(bytes[1], 0x06);
    assert_eq!(&bytes[2..4], &[0x00, 0x02]); // bcdUSB 2.00
    assert_eq!(bytes[7], 0x40);
    assert_eq!(bytes[8], 1);
}

#[test]
fn requests_before_reset_complete_with_error() {
    // Endpoint zero is inactive until the port reset activates it.
    let (mut gadget, _) = mouse_gadget();
    let urb = control_in_urb(1, setup(0x80, request::GET_DESCRIPTOR, 0x0100, 0, 18));
    gadget.handle_event(Event::Urb(urb));
    let done = gadget.drain_completions();
    assert_eq!(done[0].status, Some(UrbStatus::Error));
}

#[test]
fn set_descriptor_is_refused() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    // SET_DESCRIPTOR(device): the gadget does not opt in, so the filter
    // stalls it instead of routing it to the endpoint-zero handler.
    let data = vec![0u8; 18];
    let urb = util::control_out_urb(
        3,
        setup(0x00, request::SET_DESCRIPTOR, 0x0100, 0, 18),
        data,
    );
    gadget.handle_event(Event::Urb(urb));
    let done = gadget.drain_completions();
    assert_eq!(done[0].status, Some(UrbStatus::Stall));
}

#[test]
fn class_requests_fall_through_to_the_endpoint_handler() {
    let (mut gadget, _) = mouse_gadget();
    reset(&mut gadget);

    // HID GET_REPORT (class, interface recipient) is not the filter's
    // business; the fixture's endpoint-zero handler stalls it.
    let urb = control_in_urb(2, setup(0xa1, 0x01, 0x0100, 0, 8));
    gadget.handle_event(Event::Urb(urb));
    let done = gadget.drain_completions();
    assert_eq!(done[0].status, Some(UrbStatus::Stall));
}
