//! Chapter 9 standard-request dispatcher.
//!
//! [`handle_standard_request`] recognizes the standard device requests
//! directed at endpoint zero and dispatches them to the declarative
//! callbacks of a [`StandardRequests`] implementation, filling in the URB's
//! reply buffer, actual length and status. It returns `true` when it
//! consumed the URB; everything else (class/vendor traffic, descriptor
//! types it does not know, requests the handler leaves unimplemented) is
//! left for the caller's endpoint-zero handling.
//!
//! A recognized request with an invalid Chapter 9 form, or one whose
//! callback fails, completes with a stall.

use crate::descriptor::{
    write_config_descriptor, write_device_descriptor, write_qualifier_descriptor, ConfigDescriptor,
    DeviceDescriptor, QualifierDescriptor,
};
use crate::device::Urb;
use crate::strings::{write_string_descriptor, StringTable};
use crate::usb::{descriptor_type, request, Recipient, RequestType, UrbStatus};
use vhci_protocol::TransferKind;

/// Callback surface for the standard-request filter.
///
/// The descriptor/address/configuration callbacks form the required core;
/// the rest default to "not handled", which makes the filter pass the
/// request through to ordinary endpoint-zero processing.
pub trait StandardRequests {
    fn device_descriptor(&mut self) -> Option<DeviceDescriptor>;

    fn qualifier_descriptor(&mut self) -> Option<QualifierDescriptor>;

    /// Configuration descriptor by index plus its flat list of trailing
    /// descriptors; `wTotalLength` is computed during serialization.
    fn config_descriptor(&mut self, index: u8) -> Option<(ConfigDescriptor, Vec<Vec<u8>>)>;

    fn string_tables(&self) -> &[StringTable];

    fn set_address(&mut self, address: u16) -> UrbStatus;

    fn set_configuration(&mut self, value: u8) -> UrbStatus;

    fn get_status(&mut self, recipient: Recipient, index: u16) -> Option<u16> {
        let _ = (recipient, index);
        None
    }

    /// CLEAR_FEATURE (`enable` false) and SET_FEATURE (`enable` true).
    fn feature(
        &mut self,
        recipient: Recipient,
        index: u16,
        selector: u16,
        enable: bool,
    ) -> Option<UrbStatus> {
        let _ = (recipient, index, selector, enable);
        None
    }

    fn get_configuration(&mut self) -> Option<u8> {
        None
    }

    fn get_interface(&mut self, interface: u16) -> Option<u8> {
        let _ = interface;
        None
    }

    fn set_interface(&mut self, interface: u16, alt_setting: u16) -> Option<UrbStatus> {
        let _ = (interface, alt_setting);
        None
    }

    /// SET_DESCRIPTOR with the data-stage payload. Optional for devices;
    /// the default refusal makes the filter stall it.
    fn set_descriptor(&mut self, value: u16, index: u16, data: &[u8]) -> Option<UrbStatus> {
        let _ = (value, index, data);
        None
    }
}

fn reply(urb: &mut Urb, data: &[u8]) {
    let n = data.len().min(urb.buffer.len());
    urb.buffer[..n].copy_from_slice(&data[..n]);
    urb.actual_length = n as u32;
    urb.status = Some(UrbStatus::Completed);
}

fn stall(urb: &mut Urb) -> bool {
    urb.status = Some(UrbStatus::Stall);
    true
}

/// Applies the standard-request filter to a control URB. Returns `true`
/// when the URB was consumed (status set); the caller completes it.
pub fn handle_standard_request(urb: &mut Urb, handler: &mut dyn StandardRequests) -> bool {
    if urb.kind != TransferKind::Control || urb.endpoint_number() != 0 {
        return false;
    }
    let Some(setup) = urb.setup else {
        return false;
    };
    if setup.request_type() != RequestType::Standard {
        return false;
    }

    match setup.b_request {
        request::GET_DESCRIPTOR => {
            if !urb.is_in() || !setup.is_in() || setup.recipient() != Recipient::Device {
                return false;
            }
            let dt_type = (setup.w_value >> 8) as u8;
            let dt_index = (setup.w_value & 0xff) as u8;
            match dt_type {
                descriptor_type::DEVICE if dt_index == 0 && setup.w_index == 0 => {
                    match handler.device_descriptor() {
                        Some(desc) => {
                            let n = write_device_descriptor(&desc, &mut urb.buffer);
                            urb.actual_length = n as u32;
                            urb.status = Some(UrbStatus::Completed);
                        }
                        None => return stall(urb),
                    }
                    true
                }
                descriptor_type::CONFIG if setup.w_index == 0 => {
                    match handler.config_descriptor(dt_index) {
                        Some((desc, other)) => {
                            let n = write_config_descriptor(&desc, &other, &mut urb.buffer);
                            urb.actual_length = n as u32;
                            urb.status = Some(UrbStatus::Completed);
                        }
                        None => return stall(urb),
                    }
                    true
                }
                descriptor_type::STRING => {
                    let written = write_string_descriptor(
                        handler.string_tables(),
                        setup.w_index,
                        dt_index,
                        &mut urb.buffer,
                    );
                    match written {
                        Some(n) => {
                            urb.actual_length = n as u32;
                            urb.status = Some(UrbStatus::Completed);
                        }
                        None => return stall(urb),
                    }
                    true
                }
                descriptor_type::QUALIFIER if dt_index == 0 && setup.w_index == 0 => {
                    match handler.qualifier_descriptor() {
                        Some(desc) => {
                            let n = write_qualifier_descriptor(&desc, &mut urb.buffer);
                            urb.actual_length = n as u32;
                            urb.status = Some(UrbStatus::Completed);
                        }
                        None => return stall(urb),
                    }
                    true
                }
                _ => false,
            }
        }
        request::SET_ADDRESS => {
            if urb.is_in()
                || setup.is_in()
                || setup.recipient() != Recipient::Device
                || setup.w_index != 0
                || urb.transfer_length != 0
            {
                return stall(urb);
            }
            urb.status = Some(handler.set_address(setup.w_value));
            true
        }
        request::SET_CONFIGURATION => {
            if urb.is_in()
                || setup.is_in()
                || setup.recipient() != Recipient::Device
                || setup.w_index != 0
                || urb.transfer_length != 0
            {
                return stall(urb);
            }
            urb.status = Some(handler.set_configuration((setup.w_value & 0xff) as u8));
            true
        }
        request::GET_STATUS => {
            if !urb.is_in() || !setup.is_in() || setup.w_value != 0 || setup.w_length != 2 {
                return stall(urb);
            }
            match handler.get_status(setup.recipient(), setup.w_index) {
                Some(value) => {
                    reply(urb, &value.to_le_bytes());
                    true
                }
                None => false,
            }
        }
        request::CLEAR_FEATURE | request::SET_FEATURE => {
            if urb.is_in() || setup.is_in() || setup.w_length != 0 {
                return stall(urb);
            }
            let enable = setup.b_request == request::SET_FEATURE;
            match handler.feature(setup.recipient(), setup.w_index, setup.w_value, enable) {
                Some(status) => {
                    urb.status = Some(status);
                    true
                }
                None => false,
            }
        }
        request::GET_CONFIGURATION => {
            if !urb.is_in()
                || !setup.is_in()
                || setup.recipient() != Recipient::Device
                || setup.w_value != 0
                || setup.w_index != 0
                || setup.w_length != 1
            {
                return stall(urb);
            }
            match handler.get_configuration() {
                Some(value) => {
                    reply(urb, &[value]);
                    true
                }
                None => false,
            }
        }
        request::GET_INTERFACE => {
            if !urb.is_in()
                || !setup.is_in()
                || setup.recipient() != Recipient::Interface
                || setup.w_value != 0
                || setup.w_length != 1
            {
                return stall(urb);
            }
            match handler.get_interface(setup.w_index) {
                Some(alt) => {
                    reply(urb, &[alt]);
                    true
                }
                None => false,
            }
        }
        request::SET_DESCRIPTOR => {
            if urb.is_in() || setup.is_in() || setup.recipient() != Recipient::Device {
                return stall(urb);
            }
            let status = handler.set_descriptor(setup.w_value, setup.w_index, &urb.buffer);
            // Refused unless the handler opts in.
            urb.status = Some(status.unwrap_or(UrbStatus::Stall));
            true
        }
        request::SET_INTERFACE => {
            if urb.is_in()
                || setup.is_in()
                || setup.recipient() != Recipient::Interface
                || setup.w_length != 0
            {
                return stall(urb);
            }
            match handler.set_interface(setup.w_index, setup.w_value) {
                Some(status) => {
                    urb.status = Some(status);
                    true
                }
                None => false,
            }
        }
        _ => false,
    }
}
