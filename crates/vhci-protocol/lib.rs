//! Wire protocol between the virtual host controller and a user-space device
//! emulator.
//!
//! Two framed streams flow over one channel: host-to-device events (signals,
//! transfers, unlinks) and device-to-host events (attach/detach signals,
//! transfer completions). Every frame starts with an 8-byte header carrying a
//! 32-bit type tag and the 32-bit payload length. All multi-byte integers are
//! little-endian regardless of host endianness and all layouts are packed.
//!
//! The codec is strict: payload lengths must exactly match the type-specific
//! expected size, a control setup packet's direction must agree with the
//! endpoint address, and isochronous packet lengths must sum to the transfer
//! length. Decoding never panics on malformed input; callers translate
//! [`DecodeError`] into an `unprocessed` completion so the host stack can
//! unblock.

use thiserror::Error;

/// Size of the frame header (type tag + payload length), both directions.
pub const HEADER_SIZE: usize = 8;

/// Fixed prefix of a host-to-device transfer payload.
pub const TRANSFER_PREFIX_SIZE: usize = 25;

/// Fixed prefix of a device-to-host completion payload.
pub const COMPLETION_PREFIX_SIZE: usize = 12;

/// Size of a control setup packet.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Host-to-device isochronous packet descriptor (length only; packet data is
/// stored back to back, so no offsets are needed).
pub const ISO_PACKET_SIZE: usize = 4;

/// Device-to-host isochronous packet reply (status + actual length).
pub const ISO_REPLY_SIZE: usize = 8;

/// Transfer flag: bulk OUT transfers must terminate with a short packet, even
/// if that means an extra zero-length one.
pub const TRANSFER_FLAG_ZERO_PACKET: u32 = 1 << 0;

const HEVENT_SIGNAL: u32 = 0;
const HEVENT_TRANSFER: u32 = 1;
const HEVENT_UNLINK: u32 = 2;

const DEVENT_SIGNAL: u32 = 0;
const DEVENT_COMPLETION: u32 = 1;

/// Endpoint address direction bit (IN when set).
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Endpoint number bits of an endpoint address.
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

pub fn endpoint_is_in(address: u8) -> bool {
    address & ENDPOINT_DIR_IN != 0
}

pub fn endpoint_number(address: u8) -> u8 {
    address & ENDPOINT_NUMBER_MASK
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("header length {header} does not match payload length {payload}")]
    LengthMismatch { header: usize, payload: usize },
    #[error("unknown event type {0}")]
    UnknownEventType(u32),
    #[error("unknown signal value {0}")]
    UnknownSignal(u8),
    #[error("unknown transfer type {0}")]
    UnknownTransferType(u32),
    #[error("unknown completion status {0}")]
    UnknownStatus(u32),
    #[error("transfer payload has wrong size for its type")]
    BadTransferLayout,
    #[error("control setup direction disagrees with endpoint address")]
    SetupDirectionMismatch,
    #[error("control setup wLength does not match transfer length")]
    SetupLengthMismatch,
    #[error("iso packet lengths do not sum to transfer length")]
    BadIsoLengths,
    #[error("iso packet count disagrees with packet table")]
    BadIsoCount,
    #[error("completion payload does not match the pending transfer")]
    BadCompletion,
}

/// Port-level electrical transition reported to the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSignal {
    ResetStart,
    ResetEnd,
    PowerOn,
    PowerOff,
}

impl PortSignal {
    fn to_wire(self) -> u8 {
        match self {
            PortSignal::ResetStart => 0,
            PortSignal::ResetEnd => 1,
            PortSignal::PowerOn => 2,
            PortSignal::PowerOff => 3,
        }
    }

    fn from_wire(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(PortSignal::ResetStart),
            1 => Ok(PortSignal::ResetEnd),
            2 => Ok(PortSignal::PowerOn),
            3 => Ok(PortSignal::PowerOff),
            other => Err(DecodeError::UnknownSignal(other)),
        }
    }
}

/// Attach state transition reported by the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSignal {
    Attached,
    Detached,
}

impl DeviceSignal {
    fn to_wire(self) -> u8 {
        match self {
            DeviceSignal::Attached => 0,
            DeviceSignal::Detached => 1,
        }
    }

    fn from_wire(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(DeviceSignal::Attached),
            1 => Ok(DeviceSignal::Detached),
            other => Err(DecodeError::UnknownSignal(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Iso,
}

impl TransferKind {
    pub fn to_wire(self) -> u32 {
        match self {
            TransferKind::Control => 0,
            TransferKind::Bulk => 1,
            TransferKind::Interrupt => 2,
            TransferKind::Iso => 3,
        }
    }

    pub fn from_wire(v: u32) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(TransferKind::Control),
            1 => Ok(TransferKind::Bulk),
            2 => Ok(TransferKind::Interrupt),
            3 => Ok(TransferKind::Iso),
            other => Err(DecodeError::UnknownTransferType(other)),
        }
    }
}

/// Completion status as carried on the wire.
///
/// `Unprocessed` is reserved for the case where the emulator read an event
/// but could not construct a transfer object from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Unlinked,
    Error,
    Stall,
    Overflow,
    Unprocessed,
}

impl CompletionStatus {
    pub fn to_wire(self) -> u32 {
        match self {
            CompletionStatus::Completed => 0,
            CompletionStatus::Unlinked => 1,
            CompletionStatus::Error => 2,
            CompletionStatus::Stall => 3,
            CompletionStatus::Overflow => 4,
            CompletionStatus::Unprocessed => 5,
        }
    }

    pub fn from_wire(v: u32) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(CompletionStatus::Completed),
            1 => Ok(CompletionStatus::Unlinked),
            2 => Ok(CompletionStatus::Error),
            3 => Ok(CompletionStatus::Stall),
            4 => Ok(CompletionStatus::Overflow),
            5 => Ok(CompletionStatus::Unprocessed),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// A host-to-device transfer event.
///
/// The type-specific trailer is already split apart: `setup` holds the raw
/// control setup packet, `data` holds OUT payload bytes (for control OUT the
/// bytes after the setup packet, for iso OUT the concatenated packet data),
/// and `iso_packets` holds the per-packet lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub seq_num: u32,
    pub kind: TransferKind,
    pub flags: u32,
    pub endpoint_address: u8,
    pub transfer_length: u32,
    pub interval_us: u32,
    pub setup: Option<[u8; SETUP_PACKET_SIZE]>,
    pub data: Vec<u8>,
    pub iso_packets: Vec<u32>,
}

/// Host-to-device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Signal(PortSignal),
    Transfer(TransferEvent),
    Unlink { seq_num: u32 },
}

/// Per-packet reply in an isochronous completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketReply {
    pub status: CompletionStatus,
    pub actual_length: u32,
}

/// A device-to-host transfer completion.
///
/// `data` carries the returned bytes for IN transfers, truncated to the
/// actual length (for iso, the concatenation of the per-packet returns).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub seq_num: u32,
    pub status: CompletionStatus,
    pub actual_length: u32,
    pub iso_packets: Vec<IsoPacketReply>,
    pub data: Vec<u8>,
}

impl CompletionEvent {
    /// Completion sent for a transfer that could not be turned into a typed
    /// object, so the host stack unblocks.
    pub fn unprocessed(seq_num: u32) -> Self {
        CompletionEvent {
            seq_num,
            status: CompletionStatus::Unprocessed,
            actual_length: 0,
            iso_packets: Vec::new(),
            data: Vec::new(),
        }
    }
}

/// Device-to-host event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Signal(DeviceSignal),
    Completion(CompletionEvent),
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn frame(kind: u32, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    put_u32(&mut out, kind);
    put_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(&payload);
    out
}

/// Splits a frame into its type tag and payload, validating the header
/// length against the bytes actually present.
pub fn split_frame(frame: &[u8]) -> Result<(u32, &[u8]), DecodeError> {
    if frame.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            need: HEADER_SIZE,
            have: frame.len(),
        });
    }
    let kind = get_u32(frame, 0);
    let length = get_u32(frame, 4) as usize;
    let payload = &frame[HEADER_SIZE..];
    if payload.len() != length {
        return Err(DecodeError::LengthMismatch {
            header: length,
            payload: payload.len(),
        });
    }
    Ok((kind, payload))
}

/// Reads the payload length out of a frame header.
pub fn header_payload_len(header: &[u8; HEADER_SIZE]) -> usize {
    get_u32(header, 4) as usize
}

impl HostEvent {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HostEvent::Signal(signal) => frame(HEVENT_SIGNAL, vec![signal.to_wire()]),
            HostEvent::Unlink { seq_num } => frame(HEVENT_UNLINK, seq_num.to_le_bytes().to_vec()),
            HostEvent::Transfer(t) => {
                let mut payload = Vec::with_capacity(
                    TRANSFER_PREFIX_SIZE
                        + t.setup.map_or(0, |_| SETUP_PACKET_SIZE)
                        + t.iso_packets.len() * ISO_PACKET_SIZE
                        + t.data.len(),
                );
                put_u32(&mut payload, t.seq_num);
                put_u32(&mut payload, t.kind.to_wire());
                put_u32(&mut payload, t.flags);
                payload.push(t.endpoint_address);
                put_u32(&mut payload, t.transfer_length);
                put_u32(&mut payload, t.iso_packets.len() as u32);
                put_u32(&mut payload, t.interval_us);
                if let Some(setup) = &t.setup {
                    payload.extend_from_slice(setup);
                }
                for len in &t.iso_packets {
                    put_u32(&mut payload, *len);
                }
                payload.extend_from_slice(&t.data);
                frame(HEVENT_TRANSFER, payload)
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (kind, payload) = split_frame(bytes)?;
        match kind {
            HEVENT_SIGNAL => {
                if payload.len() != 1 {
                    return Err(DecodeError::BadTransferLayout);
                }
                Ok(HostEvent::Signal(PortSignal::from_wire(payload[0])?))
            }
            HEVENT_UNLINK => {
                if payload.len() != 4 {
                    return Err(DecodeError::BadTransferLayout);
                }
                Ok(HostEvent::Unlink {
                    seq_num: get_u32(payload, 0),
                })
            }
            HEVENT_TRANSFER => Ok(HostEvent::Transfer(decode_transfer(payload)?)),
            other => Err(DecodeError::UnknownEventType(other)),
        }
    }
}

fn decode_transfer(payload: &[u8]) -> Result<TransferEvent, DecodeError> {
    if payload.len() < TRANSFER_PREFIX_SIZE {
        return Err(DecodeError::Truncated {
            need: TRANSFER_PREFIX_SIZE,
            have: payload.len(),
        });
    }
    let seq_num = get_u32(payload, 0);
    let kind = TransferKind::from_wire(get_u32(payload, 4))?;
    let flags = get_u32(payload, 8);
    let endpoint_address = payload[12];
    let transfer_length = get_u32(payload, 13);
    let number_of_packets = get_u32(payload, 17) as usize;
    let interval_us = get_u32(payload, 21);
    let trailer = &payload[TRANSFER_PREFIX_SIZE..];
    let dir_in = endpoint_is_in(endpoint_address);

    let mut event = TransferEvent {
        seq_num,
        kind,
        flags,
        endpoint_address,
        transfer_length,
        interval_us,
        setup: None,
        data: Vec::new(),
        iso_packets: Vec::new(),
    };

    match kind {
        TransferKind::Control => {
            let expect = if dir_in {
                SETUP_PACKET_SIZE
            } else {
                SETUP_PACKET_SIZE + transfer_length as usize
            };
            if trailer.len() != expect {
                return Err(DecodeError::BadTransferLayout);
            }
            let setup: [u8; SETUP_PACKET_SIZE] = trailer[..SETUP_PACKET_SIZE].try_into().unwrap();
            let w_length = u16::from_le_bytes([setup[6], setup[7]]) as u32;
            if w_length != transfer_length {
                return Err(DecodeError::SetupLengthMismatch);
            }
            let setup_in = setup[0] & 0x80 != 0;
            if setup_in != dir_in {
                return Err(DecodeError::SetupDirectionMismatch);
            }
            event.setup = Some(setup);
            if !dir_in {
                event.data = trailer[SETUP_PACKET_SIZE..].to_vec();
            }
        }
        TransferKind::Bulk | TransferKind::Interrupt => {
            let expect = if dir_in { 0 } else { transfer_length as usize };
            if trailer.len() != expect {
                return Err(DecodeError::BadTransferLayout);
            }
            if !dir_in {
                event.data = trailer.to_vec();
            }
        }
        TransferKind::Iso => {
            let table = number_of_packets
                .checked_mul(ISO_PACKET_SIZE)
                .ok_or(DecodeError::BadIsoCount)?;
            if trailer.len() < table {
                return Err(DecodeError::BadIsoCount);
            }
            let mut sum: u64 = 0;
            for i in 0..number_of_packets {
                let len = get_u32(trailer, i * ISO_PACKET_SIZE);
                sum += u64::from(len);
                event.iso_packets.push(len);
            }
            if sum != u64::from(transfer_length) {
                return Err(DecodeError::BadIsoLengths);
            }
            let data = &trailer[table..];
            let expect = if dir_in { 0 } else { transfer_length as usize };
            if data.len() != expect {
                return Err(DecodeError::BadTransferLayout);
            }
            event.data = data.to_vec();
        }
    }

    Ok(event)
}

impl DeviceEvent {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DeviceEvent::Signal(signal) => frame(DEVENT_SIGNAL, vec![signal.to_wire()]),
            DeviceEvent::Completion(c) => {
                let mut payload = Vec::with_capacity(
                    COMPLETION_PREFIX_SIZE + c.iso_packets.len() * ISO_REPLY_SIZE + c.data.len(),
                );
                put_u32(&mut payload, c.seq_num);
                put_u32(&mut payload, c.status.to_wire());
                put_u32(&mut payload, c.actual_length);
                for pkt in &c.iso_packets {
                    put_u32(&mut payload, pkt.status.to_wire());
                    put_u32(&mut payload, pkt.actual_length);
                }
                payload.extend_from_slice(&c.data);
                frame(DEVENT_COMPLETION, payload)
            }
        }
    }

    /// Decodes a device-to-host frame.
    ///
    /// A completion's trailer cannot be interpreted without knowing which
    /// transfer it answers, so `iso_packet_count` must be supplied by the
    /// caller (from the pending transfer record); pass 0 for non-iso
    /// transfers. Use [`peek_completion_seq`] to find the record first.
    pub fn decode(bytes: &[u8], iso_packet_count: usize) -> Result<Self, DecodeError> {
        let (kind, payload) = split_frame(bytes)?;
        match kind {
            DEVENT_SIGNAL => {
                if payload.len() != 1 {
                    return Err(DecodeError::BadTransferLayout);
                }
                Ok(DeviceEvent::Signal(DeviceSignal::from_wire(payload[0])?))
            }
            DEVENT_COMPLETION => {
                if payload.len() < COMPLETION_PREFIX_SIZE {
                    return Err(DecodeError::Truncated {
                        need: COMPLETION_PREFIX_SIZE,
                        have: payload.len(),
                    });
                }
                let seq_num = get_u32(payload, 0);
                let status = CompletionStatus::from_wire(get_u32(payload, 4))?;
                let actual_length = get_u32(payload, 8);
                let trailer = &payload[COMPLETION_PREFIX_SIZE..];
                let table = iso_packet_count
                    .checked_mul(ISO_REPLY_SIZE)
                    .ok_or(DecodeError::BadIsoCount)?;
                if trailer.len() < table {
                    return Err(DecodeError::BadIsoCount);
                }
                let mut iso_packets = Vec::with_capacity(iso_packet_count);
                for i in 0..iso_packet_count {
                    iso_packets.push(IsoPacketReply {
                        status: CompletionStatus::from_wire(get_u32(trailer, i * ISO_REPLY_SIZE))?,
                        actual_length: get_u32(trailer, i * ISO_REPLY_SIZE + 4),
                    });
                }
                Ok(DeviceEvent::Completion(CompletionEvent {
                    seq_num,
                    status,
                    actual_length,
                    iso_packets,
                    data: trailer[table..].to_vec(),
                }))
            }
            other => Err(DecodeError::UnknownEventType(other)),
        }
    }
}

/// Reads the sequence number out of a transfer frame that may otherwise be
/// malformed, so the reader can answer it with an `unprocessed` completion.
/// Returns `None` for non-transfer frames or ones too short to carry a
/// sequence number.
pub fn peek_transfer_seq(bytes: &[u8]) -> Option<u32> {
    let (kind, payload) = split_frame(bytes).ok()?;
    (kind == HEVENT_TRANSFER && payload.len() >= 4).then(|| get_u32(payload, 0))
}

/// Reads the sequence number out of a completion frame without decoding the
/// trailer. Returns `None` for signal frames.
pub fn peek_completion_seq(bytes: &[u8]) -> Result<Option<u32>, DecodeError> {
    let (kind, payload) = split_frame(bytes)?;
    match kind {
        DEVENT_SIGNAL => Ok(None),
        DEVENT_COMPLETION => {
            if payload.len() < COMPLETION_PREFIX_SIZE {
                return Err(DecodeError::Truncated {
                    need: COMPLETION_PREFIX_SIZE,
                    have: payload.len(),
                });
            }
            Ok(Some(get_u32(payload, 0)))
        }
        other => Err(DecodeError::UnknownEventType(other)),
    }
}
