//! The virtual host controller.
//!
//! [`VhciController`] owns one port state machine per virtual hub slot and
//! exposes two surfaces:
//!
//! - the host-stack surface: transfer submission and cancellation, hub
//!   feature control, status polling. Operations that may complete
//!   transfers return a list of [`GivebackUrb`]s; the caller hands those to
//!   the host stack *after* the call returns, which is the deferred-giveback
//!   pattern — completion callbacks never run inside controller state.
//! - the per-port event channel: the character-device contract expressed as
//!   an API. Open is exclusive, close implicitly detaches, reads produce one
//!   encoded host-to-device frame, writes consume one device-to-host frame.
//!
//! Reset and resume are deadlines on a monotonic clock checked lazily on
//! status polls, so operations that observe timers take `now: Instant`.

mod hub;
mod port;
mod urb;

use std::time::Instant;

use tracing::{debug, warn};
use vhci_protocol::{
    peek_completion_seq, CompletionStatus, DecodeError, DeviceEvent, DeviceSignal, HostEvent,
    TransferEvent, TransferKind,
};

pub use hub::{hub_descriptor, port_feature};
pub use port::PortStatus;
pub use urb::{GivebackUrb, HostTransferStatus, HostUrb};

use crate::{Error, Result};
use port::{Port, QueuedEvent};
use urb::TransferResult;

/// Maximum number of ports per controller.
pub const MAX_PORTS: usize = 10;

pub struct VhciController {
    ports: Vec<Port>,
    suspended: bool,
}

impl VhciController {
    pub fn new(num_ports: usize) -> Result<Self> {
        if num_ports == 0 || num_ports > MAX_PORTS {
            return Err(Error::Misuse("port count must be between 1 and MAX_PORTS"));
        }
        Ok(VhciController {
            ports: (0..num_ports).map(|n| Port::new(n as u8)).collect(),
            suspended: false,
        })
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    fn port(&self, index: usize) -> Result<&Port> {
        self.ports.get(index).ok_or(Error::NotFound)
    }

    fn port_mut(&mut self, index: usize) -> Result<&mut Port> {
        self.ports.get_mut(index).ok_or(Error::NotFound)
    }

    /// Transfers may be submitted only while the port is enabled: ENABLE
    /// set, not suspended, hub not suspended.
    pub fn port_enabled(&self, index: usize) -> bool {
        self.ports.get(index).is_some_and(|p| p.is_enabled())
    }

    // ----- host stack surface -----

    /// Submits a transfer to a port. On success returns the assigned
    /// sequence number; on failure the URB is handed back to the caller
    /// untouched.
    pub fn urb_enqueue(&mut self, index: usize, urb: HostUrb) -> std::result::Result<u32, (Error, HostUrb)> {
        let Ok(port) = self.port_mut(index) else {
            return Err((Error::NotFound, urb));
        };
        if !port.is_enabled() {
            warn!(port = index, "transfer submitted to disabled port");
            return Err((Error::NotFound, urb));
        }
        if let Err(reason) = validate_host_urb(&urb) {
            return Err((Error::Misuse(reason), urb));
        }
        let seq_num = port.enqueue_urb(urb);
        debug!(port = index, seq_num, "URB queued");
        Ok(seq_num)
    }

    /// Cancels a previously submitted transfer. The returned givebacks are
    /// non-empty when the emulator had not yet observed the transfer and it
    /// completed `unlinked` on the spot.
    pub fn urb_dequeue(&mut self, index: usize, seq_num: u32) -> Vec<GivebackUrb> {
        let mut giveback = Vec::new();
        if let Ok(port) = self.port_mut(index) {
            debug!(port = index, seq_num, "URB cancel");
            port.dequeue_urb(seq_num, &mut giveback);
        }
        giveback
    }

    pub fn hub_descriptor(&self) -> [u8; 9] {
        hub::hub_descriptor(self.ports.len() as u8)
    }

    /// Hub status is always "no change, no overcurrent".
    pub fn hub_status(&self) -> u32 {
        0
    }

    /// The hub itself has no settable features.
    pub fn set_hub_feature(&mut self, _feature: u16) -> Result<()> {
        Err(Error::Misuse("hub features cannot be set"))
    }

    /// Accepted and ignored; the hub never latches its own change bits.
    pub fn clear_hub_feature(&mut self, _feature: u16) -> Result<()> {
        Ok(())
    }

    /// GetPortStatus: completes due resets and resumes (whoever resets or
    /// resumes must poll status to finish it), then reports the status word.
    pub fn port_status(&mut self, index: usize, now: Instant) -> Result<(u32, Vec<GivebackUrb>)> {
        let mut giveback = Vec::new();
        let port = self.port_mut(index)?;

        if port.is_resuming() && port.re_timeout_elapsed(now) {
            port.set_status_bits(PortStatus::C_SUSPEND);
            port.clear_status_bits(PortStatus::SUSPEND);
        }
        if port.status().contains(PortStatus::RESET) && port.re_timeout_elapsed(now) {
            port.set_status_bits(PortStatus::C_RESET);
            port.clear_status_bits(PortStatus::RESET);
            if port.is_device_attached() {
                debug!(port = index, "port enabled after reset");
                port.set_status_bits(PortStatus::ENABLE);
            }
        }
        port.update(&mut giveback);
        Ok((port.status_word(), giveback))
    }

    pub fn set_port_feature(
        &mut self,
        index: usize,
        feature: u16,
        now: Instant,
    ) -> Result<Vec<GivebackUrb>> {
        let mut giveback = Vec::new();
        let port = self.port_mut(index)?;
        match feature {
            port_feature::SUSPEND => {
                if port.is_enabled() {
                    port.set_status_bits(PortStatus::SUSPEND);
                    port.update(&mut giveback);
                }
            }
            port_feature::POWER => {
                port.set_status_bits(PortStatus::POWER);
                port.update(&mut giveback);
            }
            feature if feature < 32 => {
                if feature == port_feature::RESET {
                    port.clear_status_bits(
                        PortStatus::ENABLE | PortStatus::LOW_SPEED | PortStatus::HIGH_SPEED,
                    );
                    // The 50 ms reset signal; completion is latched on the
                    // next status poll past the deadline.
                    port.set_re_timeout(now, 50);
                }
                if port.status().contains(PortStatus::POWER) {
                    port.set_status_bits(PortStatus::from_bits_retain(1 << feature));
                    port.update(&mut giveback);
                }
            }
            _ => return Err(Error::Misuse("unknown port feature")),
        }
        Ok(giveback)
    }

    pub fn clear_port_feature(
        &mut self,
        index: usize,
        feature: u16,
        now: Instant,
    ) -> Result<Vec<GivebackUrb>> {
        let mut giveback = Vec::new();
        let port = self.port_mut(index)?;
        match feature {
            port_feature::SUSPEND => {
                if port.status().contains(PortStatus::SUSPEND) {
                    // Resume takes 20 ms; completion is latched on a later
                    // status poll.
                    port.set_resuming(true);
                    port.set_re_timeout(now, 20);
                }
            }
            feature if feature < 32 => {
                port.clear_status_bits(PortStatus::from_bits_retain(1 << feature));
                port.update(&mut giveback);
            }
            _ => return Err(Error::Misuse("unknown port feature")),
        }
        Ok(giveback)
    }

    /// Edge-triggered status-change bitmap: bit `n + 1` is set when port `n`
    /// has pending change bits. Also completes due resumes.
    pub fn status_changed(&mut self, now: Instant) -> (u32, Vec<GivebackUrb>) {
        let mut giveback = Vec::new();
        let mut bitmap = 0u32;
        for (index, port) in self.ports.iter_mut().enumerate() {
            if port.is_resuming() && port.re_timeout_elapsed(now) {
                port.set_status_bits(PortStatus::C_SUSPEND);
                port.clear_status_bits(PortStatus::SUSPEND);
                port.update(&mut giveback);
            }
            if port.status().intersects(PortStatus::CHANGE_MASK) {
                bitmap |= 1 << (index + 1);
            }
        }
        (bitmap, giveback)
    }

    pub fn bus_suspend(&mut self) -> Vec<GivebackUrb> {
        let mut giveback = Vec::new();
        for port in &mut self.ports {
            port.set_hcd_suspended(true);
            port.update(&mut giveback);
        }
        self.suspended = true;
        giveback
    }

    pub fn bus_resume(&mut self) -> Vec<GivebackUrb> {
        let mut giveback = Vec::new();
        self.suspended = false;
        for port in &mut self.ports {
            port.set_hcd_suspended(false);
            port.update(&mut giveback);
        }
        giveback
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    // ----- per-port event channel (device side) -----

    /// Exclusive open of a port's event channel.
    pub fn open_port(&mut self, index: usize) -> Result<()> {
        let port = self.port_mut(index)?;
        if port.is_opened() {
            return Err(Error::Busy);
        }
        port.set_opened(true);
        debug!(port = index, "port channel opened");
        Ok(())
    }

    /// Closing a channel implicitly detaches the device.
    pub fn close_port(&mut self, index: usize) -> Vec<GivebackUrb> {
        let mut giveback = Vec::new();
        if let Ok(port) = self.port_mut(index) {
            if port.is_device_attached() {
                port.set_device_attached(false);
                port.update(&mut giveback);
            }
            port.set_opened(false);
            debug!(port = index, "port channel closed");
        }
        giveback
    }

    /// Readability: an event is pending on the port.
    pub fn poll_port(&self, index: usize) -> bool {
        self.port(index)
            .is_ok_and(|p| p.current_event().is_some())
    }

    /// Reads the next pending event as an encoded host-to-device frame, or
    /// `None` when the port has nothing queued.
    pub fn read_port_event(&mut self, index: usize) -> Option<Vec<u8>> {
        let port = self.ports.get_mut(index)?;
        let event = port.current_event()?;
        let frame = match event {
            QueuedEvent::Unlink { seq_num } => HostEvent::Unlink { seq_num }.encode(),
            QueuedEvent::Signal(signal) => HostEvent::Signal(signal).encode(),
            QueuedEvent::Transfer { seq_num } => {
                let high_speed = port.is_high_speed();
                let record = port
                    .record(seq_num)
                    .expect("cursor references a queued transfer");
                let urb = &record.urb;
                let interval_us = match urb.kind {
                    TransferKind::Interrupt | TransferKind::Iso => {
                        urb.interval_frames * if high_speed { 125 } else { 1000 }
                    }
                    _ => 0,
                };
                HostEvent::Transfer(TransferEvent {
                    seq_num,
                    kind: urb.kind,
                    flags: urb.flags,
                    endpoint_address: urb.endpoint_address,
                    transfer_length: urb.transfer_length,
                    interval_us,
                    setup: urb.setup,
                    data: if urb.is_in() { Vec::new() } else { urb.data.clone() },
                    iso_packets: urb.iso_packet_lengths.clone(),
                })
                .encode()
            }
        };
        port.proceed();
        Some(frame)
    }

    /// Consumes one device-to-host frame: an attach/detach signal or a
    /// transfer completion. Completions for unknown or not-yet-delivered
    /// sequence numbers are ignored — the transfer may have been unlinked
    /// concurrently.
    pub fn write_port_event(&mut self, index: usize, frame: &[u8]) -> Result<Vec<GivebackUrb>> {
        let mut giveback = Vec::new();

        match peek_completion_seq(frame)? {
            None => {
                let DeviceEvent::Signal(signal) = DeviceEvent::decode(frame, 0)? else {
                    unreachable!("peek said signal");
                };
                let port = self.port_mut(index)?;
                let attach = signal == DeviceSignal::Attached;
                if attach != port.is_device_attached() {
                    debug!(port = index, attach, "device attach state change");
                    port.set_device_attached(attach);
                    port.update(&mut giveback);
                }
            }
            Some(seq_num) => {
                let port = self.port_mut(index)?;
                let Some(record) = port.find_delivered(seq_num) else {
                    debug!(port = index, seq_num, "completion for unknown URB ignored");
                    return Ok(giveback);
                };
                let kind = record.urb.kind;
                let dir_in = record.urb.is_in();
                let packet_lengths = record.urb.iso_packet_lengths.clone();
                let transfer_length = record.urb.transfer_length;

                let iso_count = if kind == TransferKind::Iso {
                    packet_lengths.len()
                } else {
                    0
                };
                let DeviceEvent::Completion(completion) = DeviceEvent::decode(frame, iso_count)?
                else {
                    unreachable!("peek said completion");
                };
                let result =
                    build_result(&completion, kind, dir_in, transfer_length, &packet_lengths)?;
                let record = port.record_mut(seq_num).expect("record found above");
                record.result = Some(result);
                port.remove_record(seq_num, &mut giveback);
            }
        }
        Ok(giveback)
    }
}

fn validate_host_urb(urb: &HostUrb) -> std::result::Result<(), &'static str> {
    match urb.kind {
        TransferKind::Control => {
            let Some(setup) = urb.setup else {
                return Err("control URB without setup packet");
            };
            let w_length = u16::from_le_bytes([setup[6], setup[7]]) as u32;
            if w_length != urb.transfer_length {
                return Err("control wLength disagrees with transfer length");
            }
            if !urb.is_in() && urb.data.len() as u32 != urb.transfer_length {
                return Err("control OUT payload disagrees with transfer length");
            }
        }
        TransferKind::Bulk | TransferKind::Interrupt => {
            if !urb.is_in() && urb.data.len() as u32 != urb.transfer_length {
                return Err("OUT payload disagrees with transfer length");
            }
        }
        TransferKind::Iso => {
            let sum: u64 = urb.iso_packet_lengths.iter().map(|&l| u64::from(l)).sum();
            if sum != u64::from(urb.transfer_length) {
                return Err("iso packet lengths do not sum to transfer length");
            }
            if !urb.is_in() && urb.data.len() as u32 != urb.transfer_length {
                return Err("iso OUT payload disagrees with transfer length");
            }
        }
    }
    Ok(())
}

fn host_status(status: CompletionStatus) -> HostTransferStatus {
    match status {
        CompletionStatus::Completed => HostTransferStatus::Completed,
        CompletionStatus::Unlinked => HostTransferStatus::Unlinked,
        CompletionStatus::Error => HostTransferStatus::Error,
        CompletionStatus::Stall => HostTransferStatus::Stall,
        CompletionStatus::Overflow => HostTransferStatus::Overflow,
        // The emulator read the event but could not build a transfer from
        // it; surface as a transfer error so the host stack unblocks.
        CompletionStatus::Unprocessed => HostTransferStatus::Error,
    }
}

fn build_result(
    completion: &vhci_protocol::CompletionEvent,
    kind: TransferKind,
    dir_in: bool,
    transfer_length: u32,
    packet_lengths: &[u32],
) -> Result<TransferResult> {
    if completion.actual_length > transfer_length {
        return Err(DecodeError::BadCompletion.into());
    }
    match kind {
        TransferKind::Iso => {
            let mut sum: u64 = 0;
            for (reply, &length) in completion.iso_packets.iter().zip(packet_lengths) {
                if reply.actual_length > length {
                    return Err(DecodeError::BadCompletion.into());
                }
                sum += u64::from(reply.actual_length);
            }
            if sum != u64::from(completion.actual_length) {
                return Err(DecodeError::BadCompletion.into());
            }
            let expect = if dir_in { completion.actual_length as usize } else { 0 };
            if completion.data.len() != expect {
                return Err(DecodeError::BadCompletion.into());
            }
        }
        _ if dir_in => {
            if completion.data.len() as u32 != completion.actual_length {
                return Err(DecodeError::BadCompletion.into());
            }
        }
        _ => {
            if !completion.data.is_empty() {
                return Err(DecodeError::BadCompletion.into());
            }
        }
    }
    Ok(TransferResult {
        status: host_status(completion.status),
        actual_length: completion.actual_length,
        data: completion.data.clone(),
        iso_packets: completion.iso_packets.clone(),
    })
}
