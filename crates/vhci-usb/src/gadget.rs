//! Gadget composition: a reusable USB device model.
//!
//! A [`Gadget`] owns endpoint zero and a set of [`Config`]s; each config
//! owns its [`Interface`]s (possibly several per interface number, one per
//! alternate setting), and each interface owns its [`Endpoint`]s. Incoming
//! events route through the standard-request filter first, then by endpoint
//! address into the owning endpoint's handler.
//!
//! Handlers never block. A handler completes a request by setting its
//! status — inline from `enqueue`, or later through
//! [`Gadget::complete_pending`] for backends that submit asynchronous work
//! and finish it on a subsequent event-loop turn. Completed URBs accumulate
//! in the gadget and are drained with [`Gadget::drain_completions`] by the
//! event loop, which writes them back to the controller.

use std::collections::VecDeque;

use tracing::debug;
use vhci_protocol::TransferKind;

use crate::descriptor::{
    write_endpoint_descriptor, write_interface_descriptor, ConfigDescriptor, DeviceDescriptor,
    EndpointDescriptor, InterfaceDescriptor, QualifierDescriptor, CONFIG_DESCRIPTOR_SIZE,
    ENDPOINT_DESCRIPTOR_SIZE, INTERFACE_DESCRIPTOR_SIZE, QUALIFIER_DESCRIPTOR_SIZE,
};
use crate::device::{Event, Urb};
use crate::filter::{handle_standard_request, StandardRequests};
use crate::strings::StringTable;
use crate::usb::{
    config_attributes, endpoint_in_address, endpoint_out_address, feature, PortSignal, Recipient,
    UrbStatus,
};
use crate::{Error, Result};

/// Directions an endpoint can move data in. Control endpoints are the only
/// bidirectional kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDir {
    In,
    Out,
    InOut,
}

impl EndpointDir {
    pub fn has_in(self) -> bool {
        matches!(self, EndpointDir::In | EndpointDir::InOut)
    }

    pub fn has_out(self) -> bool {
        matches!(self, EndpointDir::Out | EndpointDir::InOut)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointCaps {
    /// Endpoint number, 0–15; the direction bit lives in `dir`.
    pub address: u8,
    pub dir: EndpointDir,
    pub kind: TransferKind,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Iso sync type bits of `bmAttributes` (pre-shifted, bits 3:2).
    pub iso_sync: u8,
    /// Iso usage type bits of `bmAttributes` (pre-shifted, bits 5:4).
    pub iso_usage: u8,
    /// Class-specific descriptors emitted right after this endpoint's
    /// descriptors in the configuration blob.
    pub trailers: Vec<Vec<u8>>,
}

impl Default for EndpointCaps {
    fn default() -> Self {
        EndpointCaps {
            address: 0,
            dir: EndpointDir::InOut,
            kind: TransferKind::Control,
            max_packet_size: 64,
            interval: 0,
            iso_sync: 0,
            iso_usage: 0,
            trailers: Vec::new(),
        }
    }
}

/// Endpoint descriptor `bmAttributes` transfer-type bits.
fn transfer_type_bits(kind: TransferKind) -> u8 {
    match kind {
        TransferKind::Control => 0,
        TransferKind::Iso => 1,
        TransferKind::Bulk => 2,
        TransferKind::Interrupt => 3,
    }
}

/// A transfer handed to an endpoint handler. Completing it means setting
/// `urb.status` (plus `actual_length`/buffer contents for IN transfers).
#[derive(Debug)]
pub struct GadgetRequest {
    pub urb: Urb,
}

impl GadgetRequest {
    pub fn complete(&mut self, status: UrbStatus) {
        self.urb.status = Some(status);
    }
}

/// Endpoint callbacks.
///
/// `dequeue` signals host-side cancellation of a request this handler has
/// seen; the default completes it `unlinked` on the spot, which is right
/// for handlers that finish everything inline. Backends holding the request
/// for asynchronous work override it to cancel that work and complete the
/// request on a later turn.
pub trait EndpointHandler {
    fn enabled(&mut self, value: bool) {
        let _ = value;
    }

    fn enqueue(&mut self, request: &mut GadgetRequest);

    fn dequeue(&mut self, request: &mut GadgetRequest) {
        request.complete(UrbStatus::Unlinked);
    }

    fn clear_stall(&mut self) -> UrbStatus {
        UrbStatus::Completed
    }
}

pub struct Endpoint {
    caps: EndpointCaps,
    active: bool,
    stalled: bool,
    requests: VecDeque<GadgetRequest>,
    handler: Box<dyn EndpointHandler>,
}

impl Endpoint {
    pub fn new(caps: EndpointCaps, handler: Box<dyn EndpointHandler>) -> Self {
        Endpoint {
            caps,
            active: false,
            stalled: false,
            requests: VecDeque::new(),
            handler,
        }
    }

    pub fn caps(&self) -> &EndpointCaps {
        &self.caps
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Descriptors this endpoint contributes to a configuration blob: one
    /// per direction (control endpoints contribute a single one), followed
    /// by the endpoint's class-specific trailers.
    fn descriptors(&self) -> Vec<Vec<u8>> {
        let attributes = transfer_type_bits(self.caps.kind) | self.caps.iso_sync | self.caps.iso_usage;
        let base = EndpointDescriptor {
            b_length: ENDPOINT_DESCRIPTOR_SIZE as u8,
            attributes,
            max_packet_size: self.caps.max_packet_size,
            interval: self.caps.interval,
            ..Default::default()
        };
        let mut out = Vec::new();
        let mut push = |address: u8| {
            let desc = EndpointDescriptor { endpoint_address: address, ..base };
            let mut buf = [0u8; ENDPOINT_DESCRIPTOR_SIZE];
            write_endpoint_descriptor(&desc, &mut buf);
            out.push(buf.to_vec());
        };
        if self.caps.kind == TransferKind::Control {
            push(endpoint_out_address(self.caps.address));
        } else {
            if self.caps.dir.has_in() {
                push(endpoint_in_address(self.caps.address));
            }
            if self.caps.dir.has_out() {
                push(endpoint_out_address(self.caps.address));
            }
        }
        out.extend(self.caps.trailers.iter().cloned());
        out
    }

    /// Deactivation runs the handler callback before clearing the flag and
    /// completes everything still queued as `unlinked`; activation sets the
    /// flag first, then runs the callback. The stall latch clears on both
    /// edges.
    fn set_active(&mut self, value: bool, completed: &mut Vec<Urb>) {
        if self.active == value {
            return;
        }
        if value {
            self.active = true;
            self.stalled = false;
            self.handler.enabled(true);
        } else {
            self.handler.enabled(false);
            self.active = false;
            self.stalled = false;
            while let Some(mut request) = self.requests.pop_front() {
                if request.urb.status.is_none() {
                    request.urb.status = Some(UrbStatus::Unlinked);
                }
                completed.push(request.urb);
            }
        }
    }

    fn enqueue(&mut self, mut urb: Urb, completed: &mut Vec<Urb>) {
        let compatible = self.active
            && urb.kind == self.caps.kind
            && match self.caps.kind {
                TransferKind::Control => true,
                _ => {
                    if urb.is_in() {
                        self.caps.dir.has_in()
                    } else {
                        self.caps.dir.has_out()
                    }
                }
            };
        if !compatible {
            urb.status = Some(UrbStatus::Error);
            completed.push(urb);
            return;
        }
        self.requests.push_back(GadgetRequest { urb });
        {
            let Endpoint {
                ref mut handler,
                ref mut requests,
                ..
            } = *self;
            handler.enqueue(requests.back_mut().unwrap());
        }
        self.sweep_completed(completed);
    }

    fn dequeue(&mut self, id: u32, completed: &mut Vec<Urb>) -> bool {
        let Some(index) = self.requests.iter().position(|r| r.urb.id == id) else {
            return false;
        };
        {
            let Endpoint {
                ref mut handler,
                ref mut requests,
                ..
            } = *self;
            handler.dequeue(&mut requests[index]);
        }
        self.sweep_completed(completed);
        true
    }

    fn complete_pending(
        &mut self,
        id: u32,
        f: impl FnOnce(&mut GadgetRequest),
        completed: &mut Vec<Urb>,
    ) -> bool {
        let Some(index) = self.requests.iter().position(|r| r.urb.id == id) else {
            return false;
        };
        f(&mut self.requests[index]);
        self.sweep_completed(completed);
        true
    }

    /// Moves finished requests to the completion list, latching the stall
    /// flag for any that returned a stall while the endpoint is active.
    fn sweep_completed(&mut self, completed: &mut Vec<Urb>) {
        let mut index = 0;
        while index < self.requests.len() {
            if self.requests[index].urb.status.is_some() {
                let request = self.requests.remove(index).unwrap();
                if self.active && stalls(&request.urb) {
                    self.stalled = true;
                }
                completed.push(request.urb);
            } else {
                index += 1;
            }
        }
    }
}

fn stalls(urb: &Urb) -> bool {
    urb.status == Some(UrbStatus::Stall)
        || (urb.kind == TransferKind::Iso
            && urb.iso_packets.iter().any(|p| p.status == Some(UrbStatus::Stall)))
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceCaps {
    pub number: u8,
    pub alt_setting: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    /// String descriptor index.
    pub description: u8,
    /// Class-specific descriptors emitted between the interface descriptor
    /// and its endpoint descriptors (e.g. a HID descriptor).
    pub trailers: Vec<Vec<u8>>,
}

pub trait InterfaceHandler {
    fn enabled(&mut self, value: bool) {
        let _ = value;
    }
}

impl InterfaceHandler for () {}

pub struct Interface {
    caps: InterfaceCaps,
    endpoints: Vec<Endpoint>,
    active: bool,
    handler: Box<dyn InterfaceHandler>,
}

impl Interface {
    pub fn new(caps: InterfaceCaps, endpoints: Vec<Endpoint>, handler: Box<dyn InterfaceHandler>) -> Self {
        Interface {
            caps,
            endpoints,
            active: false,
            handler,
        }
    }

    pub fn caps(&self) -> &InterfaceCaps {
        &self.caps
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, number: u8) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.caps.address == number)
    }

    fn descriptor(&self) -> InterfaceDescriptor {
        InterfaceDescriptor {
            b_length: INTERFACE_DESCRIPTOR_SIZE as u8,
            interface_number: self.caps.number,
            alternate_setting: self.caps.alt_setting,
            num_endpoints: self.endpoints.len() as u8,
            interface_class: self.caps.interface_class,
            interface_sub_class: self.caps.interface_sub_class,
            interface_protocol: self.caps.interface_protocol,
            i_interface: self.caps.description,
        }
    }

    fn set_active(&mut self, value: bool, completed: &mut Vec<Urb>) {
        if self.active == value {
            return;
        }
        if value {
            self.active = true;
            self.handler.enabled(true);
            for ep in &mut self.endpoints {
                ep.set_active(true, completed);
            }
        } else {
            for ep in &mut self.endpoints {
                ep.set_active(false, completed);
            }
            self.handler.enabled(false);
            self.active = false;
        }
    }

    fn enqueue(&mut self, urb: Urb, completed: &mut Vec<Urb>) -> std::result::Result<(), Urb> {
        if !self.active {
            return Err(urb);
        }
        let number = urb.endpoint_number();
        match self.endpoints.iter_mut().find(|ep| ep.caps.address == number) {
            Some(ep) => {
                ep.enqueue(urb, completed);
                Ok(())
            }
            None => Err(urb),
        }
    }

    fn dequeue(&mut self, id: u32, completed: &mut Vec<Urb>) -> bool {
        self.endpoints.iter_mut().any(|ep| ep.dequeue(id, completed))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigCaps {
    /// `bConfigurationValue`.
    pub number: u8,
    pub attributes: u8,
    pub max_power: u8,
    /// String descriptor index.
    pub description: u8,
}

pub trait ConfigHandler {
    fn enabled(&mut self, value: bool) {
        let _ = value;
    }
}

impl ConfigHandler for () {}

pub struct Config {
    caps: ConfigCaps,
    interfaces: Vec<Interface>,
    active: bool,
    handler: Box<dyn ConfigHandler>,
    /// Flat trailing-descriptor blob for GET_DESCRIPTOR(config): per
    /// interface, its descriptor, its class trailers, then its endpoints'
    /// descriptors. Built once at construction.
    other: Vec<Vec<u8>>,
}

impl Config {
    pub fn new(caps: ConfigCaps, interfaces: Vec<Interface>, handler: Box<dyn ConfigHandler>) -> Self {
        let mut other = Vec::new();
        for interface in &interfaces {
            let mut buf = [0u8; INTERFACE_DESCRIPTOR_SIZE];
            write_interface_descriptor(&interface.descriptor(), &mut buf);
            other.push(buf.to_vec());
            other.extend(interface.caps.trailers.iter().cloned());
            for ep in &interface.endpoints {
                other.extend(ep.descriptors());
            }
        }
        Config {
            caps,
            interfaces,
            active: false,
            handler,
            other,
        }
    }

    pub fn caps(&self) -> &ConfigCaps {
        &self.caps
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interface(&self, number: u8, alt_setting: u8) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|i| i.caps.number == number && i.caps.alt_setting == alt_setting)
    }

    fn distinct_interface_numbers(&self) -> u8 {
        let mut numbers: Vec<u8> = self.interfaces.iter().map(|i| i.caps.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers.len() as u8
    }

    fn descriptor(&self) -> ConfigDescriptor {
        ConfigDescriptor {
            b_length: CONFIG_DESCRIPTOR_SIZE as u8,
            w_total_length: 0,
            num_interfaces: self.distinct_interface_numbers(),
            configuration_value: self.caps.number,
            i_configuration: self.caps.description,
            attributes: self.caps.attributes,
            max_power: self.caps.max_power,
        }
    }

    /// Activating a configuration activates alternate setting zero of every
    /// interface number it contains.
    fn set_active(&mut self, value: bool, completed: &mut Vec<Urb>) {
        if self.active == value {
            return;
        }
        if value {
            self.active = true;
            self.handler.enabled(true);
            for interface in &mut self.interfaces {
                if interface.caps.alt_setting == 0 {
                    interface.set_active(true, completed);
                }
            }
        } else {
            for interface in &mut self.interfaces {
                interface.set_active(false, completed);
            }
            self.handler.enabled(false);
            self.active = false;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GadgetCaps {
    pub bcd_usb: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// String descriptor indices.
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub string_tables: Vec<StringTable>,
}

pub trait GadgetHandler {
    fn reset(&mut self, start: bool) {
        let _ = start;
    }

    fn power(&mut self, on: bool) {
        let _ = on;
    }

    fn address_set(&mut self, address: u16) {
        let _ = address;
    }
}

impl GadgetHandler for () {}

pub struct Gadget {
    caps: GadgetCaps,
    address: u16,
    remote_wakeup: bool,
    ep0: Endpoint,
    configs: Vec<Config>,
    handler: Box<dyn GadgetHandler>,
    completed: Vec<Urb>,
}

impl Gadget {
    pub fn new(
        caps: GadgetCaps,
        ep0: Endpoint,
        configs: Vec<Config>,
        handler: Box<dyn GadgetHandler>,
    ) -> Result<Self> {
        if ep0.caps.kind != TransferKind::Control
            || ep0.caps.dir != EndpointDir::InOut
            || ep0.caps.address != 0
        {
            return Err(Error::Misuse("endpoint zero must be a bidirectional control endpoint at address 0"));
        }
        Ok(Gadget {
            caps,
            address: 0,
            remote_wakeup: false,
            ep0,
            configs,
            handler,
            completed: Vec::new(),
        })
    }

    /// Current USB device address; 0 until SET_ADDRESS.
    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn endpoint0(&self) -> &Endpoint {
        &self.ep0
    }

    pub fn configs(&self) -> &[Config] {
        &self.configs
    }

    pub fn config(&self, value: u8) -> Option<&Config> {
        self.configs.iter().find(|c| c.caps.number == value)
    }

    pub fn active_config(&self) -> Option<&Config> {
        self.configs.iter().find(|c| c.active)
    }

    /// Synthesized device descriptor.
    pub fn device_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            bcd_usb: self.caps.bcd_usb,
            device_class: self.caps.device_class,
            device_sub_class: self.caps.device_sub_class,
            device_protocol: self.caps.device_protocol,
            max_packet_size0: self.ep0.caps.max_packet_size as u8,
            id_vendor: self.caps.vendor_id,
            id_product: self.caps.product_id,
            bcd_device: self.caps.bcd_device,
            i_manufacturer: self.caps.manufacturer,
            i_product: self.caps.product,
            i_serial_number: self.caps.serial_number,
            num_configurations: self.configs.len() as u8,
            ..Default::default()
        }
    }

    /// Handles one event from the marshaller. Completions it produces are
    /// collected; drain them with [`drain_completions`](Self::drain_completions)
    /// and write them back through the device handle.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Signal(signal) => self.handle_signal(signal),
            Event::Urb(urb) => self.handle_urb(urb),
            Event::Unlink { id } => self.handle_unlink(id),
        }
    }

    fn handle_signal(&mut self, signal: PortSignal) {
        debug!(?signal, "gadget signal");
        match signal {
            PortSignal::ResetStart => {
                self.handler.reset(true);
                self.deactivate_config();
                let mut completed = std::mem::take(&mut self.completed);
                self.ep0.set_active(false, &mut completed);
                self.completed = completed;
                self.address = 0;
            }
            PortSignal::ResetEnd => {
                self.handler.reset(false);
                let mut completed = std::mem::take(&mut self.completed);
                self.ep0.set_active(true, &mut completed);
                self.completed = completed;
            }
            PortSignal::PowerOn => self.handler.power(true),
            PortSignal::PowerOff => {
                self.handler.power(false);
                self.deactivate_config();
                let mut completed = std::mem::take(&mut self.completed);
                self.ep0.set_active(false, &mut completed);
                self.completed = completed;
                self.address = 0;
            }
        }
    }

    fn handle_urb(&mut self, mut urb: Urb) {
        if !self.ep0.active {
            urb.status = Some(UrbStatus::Error);
            self.completed.push(urb);
            return;
        }
        if handle_standard_request(&mut urb, self) {
            self.completed.push(urb);
            return;
        }
        if urb.endpoint_number() == 0 {
            let mut completed = std::mem::take(&mut self.completed);
            self.ep0.enqueue(urb, &mut completed);
            self.completed = completed;
            return;
        }
        let mut completed = std::mem::take(&mut self.completed);
        let mut pending = Some(urb);
        if let Some(config) = self.configs.iter_mut().find(|c| c.active) {
            for interface in &mut config.interfaces {
                match interface.enqueue(pending.take().unwrap(), &mut completed) {
                    Ok(()) => break,
                    Err(urb) => pending = Some(urb),
                }
            }
        }
        if let Some(mut urb) = pending {
            urb.status = Some(UrbStatus::Error);
            completed.push(urb);
        }
        self.completed = completed;
    }

    fn handle_unlink(&mut self, id: u32) {
        if !self.ep0.active {
            return;
        }
        let mut completed = std::mem::take(&mut self.completed);
        let mut found = self.ep0.dequeue(id, &mut completed);
        if !found {
            'outer: for config in &mut self.configs {
                for interface in &mut config.interfaces {
                    if interface.dequeue(id, &mut completed) {
                        found = true;
                        break 'outer;
                    }
                }
            }
        }
        if !found {
            debug!(id, "unlink for unknown request");
        }
        self.completed = completed;
    }

    /// Completes a request previously left pending by an endpoint handler.
    /// The closure runs against the request; if it sets a status the
    /// request moves to the completion list.
    pub fn complete_pending(&mut self, id: u32, f: impl FnOnce(&mut GadgetRequest)) -> bool {
        let mut completed = std::mem::take(&mut self.completed);
        let mut f = Some(f);
        let mut found = self
            .ep0
            .complete_pending(id, |r| (f.take().unwrap())(r), &mut completed);
        if !found {
            'outer: for config in &mut self.configs {
                for interface in &mut config.interfaces {
                    for ep in &mut interface.endpoints {
                        if ep.complete_pending(id, |r| (f.take().unwrap())(r), &mut completed) {
                            found = true;
                            break 'outer;
                        }
                    }
                }
            }
        }
        self.completed = completed;
        found
    }

    /// Takes the URBs completed since the last drain, in completion order.
    pub fn drain_completions(&mut self) -> Vec<Urb> {
        std::mem::take(&mut self.completed)
    }

    fn deactivate_config(&mut self) {
        let mut completed = std::mem::take(&mut self.completed);
        for config in &mut self.configs {
            config.set_active(false, &mut completed);
        }
        self.completed = completed;
    }

    fn apply_set_configuration(&mut self, value: u8) -> UrbStatus {
        let Some(target) = self.configs.iter().position(|c| c.caps.number == value) else {
            return UrbStatus::Error;
        };
        if self.configs[target].active {
            return UrbStatus::Completed;
        }
        let mut completed = std::mem::take(&mut self.completed);
        for config in &mut self.configs {
            config.set_active(false, &mut completed);
        }
        self.configs[target].set_active(true, &mut completed);
        self.completed = completed;
        debug!(value, "configuration activated");
        UrbStatus::Completed
    }

    fn apply_set_interface(&mut self, number: u8, alt_setting: u8) -> UrbStatus {
        let mut completed = std::mem::take(&mut self.completed);
        let status = 'status: {
            let Some(config) = self.configs.iter_mut().find(|c| c.active) else {
                break 'status UrbStatus::Error;
            };
            if !config
                .interfaces
                .iter()
                .any(|i| i.caps.number == number && i.caps.alt_setting == alt_setting)
            {
                break 'status UrbStatus::Error;
            }
            for interface in &mut config.interfaces {
                if interface.caps.number == number && interface.caps.alt_setting != alt_setting {
                    interface.set_active(false, &mut completed);
                }
            }
            for interface in &mut config.interfaces {
                if interface.caps.number == number && interface.caps.alt_setting == alt_setting {
                    interface.set_active(true, &mut completed);
                }
            }
            debug!(number, alt_setting, "alternate setting activated");
            UrbStatus::Completed
        };
        self.completed = completed;
        status
    }

    /// Host-visible SET_CONFIGURATION, also reachable directly for tests
    /// and local device logic.
    pub fn select_configuration(&mut self, value: u8) -> UrbStatus {
        self.apply_set_configuration(value)
    }

    /// Host-visible SET_INTERFACE.
    pub fn select_interface(&mut self, number: u8, alt_setting: u8) -> UrbStatus {
        self.apply_set_interface(number, alt_setting)
    }

    fn endpoint_mut(&mut self, number: u8, dir_in: bool) -> Option<&mut Endpoint> {
        if number == 0 {
            return Some(&mut self.ep0);
        }
        let config = self.configs.iter_mut().find(|c| c.active)?;
        for interface in &mut config.interfaces {
            if !interface.active {
                continue;
            }
            for ep in &mut interface.endpoints {
                let dir_ok = if dir_in {
                    ep.caps.dir.has_in()
                } else {
                    ep.caps.dir.has_out()
                };
                if ep.caps.address == number && dir_ok {
                    return Some(ep);
                }
            }
        }
        None
    }
}

impl StandardRequests for Gadget {
    fn device_descriptor(&mut self) -> Option<DeviceDescriptor> {
        Some(Gadget::device_descriptor(self))
    }

    fn qualifier_descriptor(&mut self) -> Option<QualifierDescriptor> {
        Some(QualifierDescriptor {
            b_length: QUALIFIER_DESCRIPTOR_SIZE as u8,
            bcd_usb: self.caps.bcd_usb,
            device_class: self.caps.device_class,
            device_sub_class: self.caps.device_sub_class,
            device_protocol: self.caps.device_protocol,
            max_packet_size0: self.ep0.caps.max_packet_size as u8,
            num_configurations: self.configs.len() as u8,
        })
    }

    fn config_descriptor(&mut self, index: u8) -> Option<(ConfigDescriptor, Vec<Vec<u8>>)> {
        let config = self.configs.get(index as usize)?;
        Some((config.descriptor(), config.other.clone()))
    }

    fn string_tables(&self) -> &[StringTable] {
        &self.caps.string_tables
    }

    fn set_address(&mut self, address: u16) -> UrbStatus {
        self.address = address;
        self.handler.address_set(address);
        UrbStatus::Completed
    }

    fn set_configuration(&mut self, value: u8) -> UrbStatus {
        self.apply_set_configuration(value)
    }

    fn get_status(&mut self, recipient: Recipient, index: u16) -> Option<u16> {
        match recipient {
            Recipient::Device => {
                let mut status = 0u16;
                if let Some(config) = self.active_config() {
                    if config.caps.attributes & config_attributes::SELF_POWERED != 0 {
                        status |= 1 << 0;
                    }
                }
                if self.remote_wakeup {
                    status |= 1 << 1;
                }
                Some(status)
            }
            Recipient::Interface => Some(0),
            Recipient::Endpoint => {
                let number = (index & 0x0f) as u8;
                let dir_in = index & 0x80 != 0;
                let ep = self.endpoint_mut(number, dir_in)?;
                Some(u16::from(ep.stalled))
            }
            _ => None,
        }
    }

    fn feature(
        &mut self,
        recipient: Recipient,
        index: u16,
        selector: u16,
        enable: bool,
    ) -> Option<UrbStatus> {
        match (recipient, selector) {
            (Recipient::Endpoint, feature::ENDPOINT_HALT) => {
                let number = (index & 0x0f) as u8;
                let dir_in = index & 0x80 != 0;
                let ep = self.endpoint_mut(number, dir_in)?;
                if enable {
                    ep.stalled = true;
                    Some(UrbStatus::Completed)
                } else {
                    let status = ep.handler.clear_stall();
                    if status == UrbStatus::Completed {
                        ep.stalled = false;
                    }
                    Some(status)
                }
            }
            (Recipient::Device, feature::DEVICE_REMOTE_WAKEUP) => {
                self.remote_wakeup = enable;
                Some(UrbStatus::Completed)
            }
            _ => None,
        }
    }

    fn get_configuration(&mut self) -> Option<u8> {
        Some(self.active_config().map_or(0, |c| c.caps.number))
    }

    fn get_interface(&mut self, interface: u16) -> Option<u8> {
        let config = self.active_config()?;
        config
            .interfaces
            .iter()
            .find(|i| i.active && u16::from(i.caps.number) == interface)
            .map(|i| i.caps.alt_setting)
    }

    fn set_interface(&mut self, interface: u16, alt_setting: u16) -> Option<UrbStatus> {
        if interface > 0xff || alt_setting > 0xff {
            return Some(UrbStatus::Error);
        }
        Some(self.apply_set_interface(interface as u8, alt_setting as u8))
    }
}
