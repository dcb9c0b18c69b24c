//! Device-side transfer marshalling.
//!
//! [`UsbDevice`] wraps the byte transport to the controller (the character
//! device in a real deployment; anything `Read + Write` here), decodes
//! host-to-device events into typed [`Urb`]s, and encodes completions back.
//!
//! A malformed transfer event does not tear down the connection: the
//! marshaller answers it with an `unprocessed` completion so the host stack
//! unblocks, then keeps reading.

use std::io::{Read, Write};

use tracing::{debug, warn};
use vhci_protocol::{
    peek_transfer_seq, CompletionEvent, DeviceEvent as WireDeviceEvent, DeviceSignal, HostEvent,
    IsoPacketReply, PortSignal, TransferEvent, TransferKind, HEADER_SIZE,
};

use crate::usb::{SetupPacket, UrbStatus};
use crate::{Error, Result};

/// One isochronous packet within a [`Urb`]'s buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoPacket {
    /// Offset of this packet's data within `Urb::buffer`.
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    /// Per-packet status; packets left `None` inherit the URB status on
    /// completion.
    pub status: Option<UrbStatus>,
}

/// A typed in-flight transfer on the device side.
///
/// For OUT transfers `buffer` arrives filled with the host payload; for IN
/// transfers it is a zeroed reply buffer of `transfer_length` bytes — fill
/// it, set `actual_length` and `status`, then complete the URB. Only the
/// used part of an IN buffer is sent back on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urb {
    pub id: u32,
    pub kind: TransferKind,
    pub flags: u32,
    pub endpoint_address: u8,
    pub setup: Option<SetupPacket>,
    pub transfer_length: u32,
    pub buffer: Vec<u8>,
    pub actual_length: u32,
    /// Interrupt/iso polling interval in microseconds.
    pub interval_us: u32,
    pub status: Option<UrbStatus>,
    pub iso_packets: Vec<IsoPacket>,
}

impl Urb {
    pub fn is_in(&self) -> bool {
        vhci_protocol::endpoint_is_in(self.endpoint_address)
    }

    pub fn endpoint_number(&self) -> u8 {
        vhci_protocol::endpoint_number(self.endpoint_address)
    }

    pub fn complete(&mut self, status: UrbStatus) {
        self.status = Some(status);
    }

    /// Convenience for IN transfers: copies `data` into the reply buffer
    /// (truncated to the buffer), sets `actual_length` and completes.
    pub fn complete_in(&mut self, data: &[u8]) {
        let n = data.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&data[..n]);
        self.actual_length = n as u32;
        self.status = Some(UrbStatus::Completed);
    }
}

/// An event delivered to the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Signal(PortSignal),
    Urb(Urb),
    /// Cancellation of a previously delivered URB; complete it promptly
    /// with `Unlinked`.
    Unlink { id: u32 },
}

/// The emulator's end of a port channel.
pub struct UsbDevice<T> {
    transport: T,
}

impl<T: Read + Write> UsbDevice<T> {
    pub fn new(transport: T) -> Self {
        UsbDevice { transport }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Announces the device to the controller; the port will report a
    /// connection on its next status poll.
    pub fn attach(&mut self) -> Result<()> {
        self.write_frame(&WireDeviceEvent::Signal(DeviceSignal::Attached).encode())?;
        debug!("device attached");
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        self.write_frame(&WireDeviceEvent::Signal(DeviceSignal::Detached).encode())?;
        debug!("device detached");
        Ok(())
    }

    /// Blocks on the transport for the next event and returns it as a typed
    /// object. Malformed transfers are answered with `unprocessed` and
    /// skipped.
    pub fn next_event(&mut self) -> Result<Event> {
        loop {
            let frame = self.read_frame()?;
            match HostEvent::decode(&frame) {
                Ok(HostEvent::Signal(signal)) => return Ok(Event::Signal(signal)),
                Ok(HostEvent::Unlink { seq_num }) => return Ok(Event::Unlink { id: seq_num }),
                Ok(HostEvent::Transfer(event)) => return Ok(Event::Urb(build_urb(event))),
                Err(err) => match peek_transfer_seq(&frame) {
                    Some(seq_num) => {
                        warn!(seq_num, %err, "unprocessable transfer event");
                        self.write_frame(
                            &WireDeviceEvent::Completion(CompletionEvent::unprocessed(seq_num))
                                .encode(),
                        )?;
                    }
                    None => return Err(err.into()),
                },
            }
        }
    }

    /// Completes a URB back to the controller. `status` must have been set;
    /// `actual_length` (and for iso, the per-packet vector) must fit the
    /// original transfer.
    pub fn complete_urb(&mut self, urb: &Urb) -> Result<()> {
        let completion = encode_completion(urb)?;
        self.write_frame(&WireDeviceEvent::Completion(completion).encode())
    }

    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_SIZE];
        self.transport.read_exact(&mut header)?;
        let payload_len = vhci_protocol::header_payload_len(&header);
        let mut frame = vec![0u8; HEADER_SIZE + payload_len];
        frame[..HEADER_SIZE].copy_from_slice(&header);
        self.transport.read_exact(&mut frame[HEADER_SIZE..])?;
        Ok(frame)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.transport.write_all(frame)?;
        Ok(())
    }
}

fn build_urb(event: TransferEvent) -> Urb {
    let dir_in = vhci_protocol::endpoint_is_in(event.endpoint_address);
    let mut iso_packets = Vec::with_capacity(event.iso_packets.len());
    let mut offset = 0u32;
    for length in &event.iso_packets {
        iso_packets.push(IsoPacket {
            offset,
            length: *length,
            actual_length: 0,
            status: None,
        });
        offset += *length;
    }
    Urb {
        id: event.seq_num,
        kind: event.kind,
        flags: event.flags,
        endpoint_address: event.endpoint_address,
        setup: event.setup.map(SetupPacket::from_bytes),
        transfer_length: event.transfer_length,
        buffer: if dir_in {
            vec![0; event.transfer_length as usize]
        } else {
            event.data
        },
        actual_length: 0,
        interval_us: event.interval_us,
        status: None,
        iso_packets,
    }
}

fn encode_completion(urb: &Urb) -> Result<CompletionEvent> {
    if urb.kind == TransferKind::Iso {
        let mut replies = Vec::with_capacity(urb.iso_packets.len());
        let mut actual_length = 0u32;
        for packet in &urb.iso_packets {
            let status = match packet.status.or(urb.status) {
                Some(status) => status,
                None => return Err(Error::Misuse("iso packet completed without a status")),
            };
            if packet.actual_length > packet.length {
                return Err(Error::Misuse("iso packet actual length exceeds packet length"));
            }
            replies.push(IsoPacketReply {
                status,
                actual_length: packet.actual_length,
            });
            actual_length += packet.actual_length;
        }
        if actual_length > urb.transfer_length {
            return Err(Error::Misuse("actual length exceeds transfer length"));
        }
        let data = if urb.is_in() {
            let mut data = Vec::with_capacity(actual_length as usize);
            for packet in &urb.iso_packets {
                let start = packet.offset as usize;
                data.extend_from_slice(&urb.buffer[start..start + packet.actual_length as usize]);
            }
            data
        } else {
            Vec::new()
        };
        return Ok(CompletionEvent {
            seq_num: urb.id,
            // Packet statuses carry the per-packet outcomes; the transfer
            // itself completed.
            status: UrbStatus::Completed,
            actual_length,
            iso_packets: replies,
            data,
        });
    }

    let status = urb
        .status
        .ok_or(Error::Misuse("URB completed without a status"))?;
    if urb.actual_length > urb.transfer_length {
        return Err(Error::Misuse("actual length exceeds transfer length"));
    }
    let data = if urb.is_in() {
        urb.buffer[..urb.actual_length as usize].to_vec()
    } else {
        Vec::new()
    };
    Ok(CompletionEvent {
        seq_num: urb.id,
        status,
        actual_length: urb.actual_length,
        iso_packets: Vec::new(),
        data,
    })
}
