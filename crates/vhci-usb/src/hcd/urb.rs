//! Host-side transfer records.

use vhci_protocol::{IsoPacketReply, TransferKind};

/// Final status reported to the host stack at giveback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTransferStatus {
    Completed,
    /// The host cancelled the transfer.
    Unlinked,
    /// The device went away while the transfer was pending.
    DeviceLost,
    /// USB transfer error, including completions the emulator reported as
    /// unprocessable.
    Error,
    Stall,
    Overflow,
}

/// A transfer as submitted by the host stack.
///
/// `endpoint_address` carries the direction bit; for control transfers it
/// mirrors the setup packet's direction. For OUT transfers `data` holds the
/// payload and must be `transfer_length` bytes; for IN transfers
/// `transfer_length` is the reply buffer size and `data` is empty.
#[derive(Debug, Clone)]
pub struct HostUrb {
    pub kind: TransferKind,
    pub endpoint_address: u8,
    pub flags: u32,
    pub setup: Option<[u8; 8]>,
    pub data: Vec<u8>,
    pub transfer_length: u32,
    /// Iso only: per-packet lengths, summing to `transfer_length`.
    pub iso_packet_lengths: Vec<u32>,
    /// Interrupt/iso polling interval in frames; converted to microseconds
    /// on the wire according to the port speed.
    pub interval_frames: u32,
}

impl HostUrb {
    pub fn bulk_in(endpoint: u8, length: u32) -> Self {
        HostUrb {
            kind: TransferKind::Bulk,
            endpoint_address: endpoint | 0x80,
            flags: 0,
            setup: None,
            data: Vec::new(),
            transfer_length: length,
            iso_packet_lengths: Vec::new(),
            interval_frames: 0,
        }
    }

    pub fn bulk_out(endpoint: u8, data: Vec<u8>) -> Self {
        HostUrb {
            kind: TransferKind::Bulk,
            endpoint_address: endpoint & 0x0f,
            flags: 0,
            setup: None,
            transfer_length: data.len() as u32,
            data,
            iso_packet_lengths: Vec::new(),
            interval_frames: 0,
        }
    }

    pub fn interrupt_in(endpoint: u8, length: u32, interval_frames: u32) -> Self {
        HostUrb {
            kind: TransferKind::Interrupt,
            endpoint_address: endpoint | 0x80,
            flags: 0,
            setup: None,
            data: Vec::new(),
            transfer_length: length,
            iso_packet_lengths: Vec::new(),
            interval_frames,
        }
    }

    /// Control transfer; direction and length are taken from the setup
    /// packet. For OUT requests `data` carries the data-stage payload.
    pub fn control(setup: [u8; 8], data: Vec<u8>) -> Self {
        let dir_in = setup[0] & 0x80 != 0;
        let w_length = u16::from_le_bytes([setup[6], setup[7]]) as u32;
        HostUrb {
            kind: TransferKind::Control,
            endpoint_address: if dir_in { 0x80 } else { 0x00 },
            flags: 0,
            setup: Some(setup),
            data,
            transfer_length: w_length,
            iso_packet_lengths: Vec::new(),
            interval_frames: 0,
        }
    }

    pub fn is_in(&self) -> bool {
        self.endpoint_address & 0x80 != 0
    }
}

/// Completion data attached to a record before it leaves the queue.
#[derive(Debug, Clone)]
pub(crate) struct TransferResult {
    pub status: HostTransferStatus,
    pub actual_length: u32,
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketReply>,
}

impl TransferResult {
    pub(crate) fn terminal(status: HostTransferStatus) -> Self {
        TransferResult {
            status,
            actual_length: 0,
            data: Vec::new(),
            iso_packets: Vec::new(),
        }
    }
}

/// A transfer given back to the host stack, always exactly once per
/// submitted transfer.
#[derive(Debug)]
pub struct GivebackUrb {
    pub seq_num: u32,
    pub status: HostTransferStatus,
    pub actual_length: u32,
    /// IN transfers: returned bytes, truncated to `actual_length`.
    pub data: Vec<u8>,
    /// Iso transfers: per-packet status and length.
    pub iso_packets: Vec<IsoPacketReply>,
    pub urb: HostUrb,
}

/// In-flight transfer record, owned by the port queue from submission until
/// giveback.
#[derive(Debug)]
pub(crate) struct UrbRecord {
    pub seq_num: u32,
    pub urb: HostUrb,
    /// Set while a cancellation event for this record sits in the unlink
    /// queue; cleared when that event is delivered or freed.
    pub unlink_queued: bool,
    /// Completion outcome, filled in just before removal.
    pub result: Option<TransferResult>,
}

impl UrbRecord {
    pub(crate) fn into_giveback(self) -> GivebackUrb {
        let result = self
            .result
            .unwrap_or_else(|| TransferResult::terminal(HostTransferStatus::Error));
        GivebackUrb {
            seq_num: self.seq_num,
            status: result.status,
            actual_length: result.actual_length,
            data: result.data,
            iso_packets: result.iso_packets,
            urb: self.urb,
        }
    }
}
