//! Core USB 2.0 types and constants shared by both sides of the stack.

pub use vhci_protocol::{
    endpoint_is_in, endpoint_number, CompletionStatus as UrbStatus, IsoPacketReply, PortSignal,
    TransferKind, ENDPOINT_DIR_IN, TRANSFER_FLAG_ZERO_PACKET,
};

/// Standard request codes (USB 2.0 table 9-4).
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0a;
    pub const SET_INTERFACE: u8 = 0x0b;
    pub const SYNCH_FRAME: u8 = 0x0c;
}

/// Descriptor type codes (USB 2.0 table 9-5).
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIG: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const QUALIFIER: u8 = 0x06;
}

/// Standard feature selectors (USB 2.0 table 9-6).
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

/// Configuration descriptor attribute bits.
pub mod config_attributes {
    /// Must always be set.
    pub const ONE: u8 = 1 << 7;
    pub const SELF_POWERED: u8 = 1 << 6;
    pub const REMOTE_WAKEUP: u8 = 1 << 5;
    pub const BATTERY: u8 = 1 << 4;
}

/// IN endpoint address for an endpoint number.
pub fn endpoint_in_address(number: u8) -> u8 {
    (number & 0x0f) | ENDPOINT_DIR_IN
}

/// OUT endpoint address for an endpoint number.
pub fn endpoint_out_address(number: u8) -> u8 {
    number & 0x0f
}

/// The `bmRequestType` transfer type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// The `bmRequestType` recipient field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

/// An 8-byte control setup packet, fields in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        SetupPacket {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.bm_request_type;
        bytes[1] = self.b_request;
        bytes[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        bytes
    }

    /// Device-to-host data phase.
    pub fn is_in(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }

    pub fn request_type(&self) -> RequestType {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.bm_request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            other => Recipient::Reserved(other),
        }
    }
}
