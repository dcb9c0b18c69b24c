//! USB 2.0 descriptor types and their serializers.
//!
//! Serialization is truncating: output never runs past the caller's buffer,
//! and the byte count actually written is returned — the host stack handles
//! short reads. `bLength` is validated against the declared layout size; a
//! descriptor claiming more is refused with a zero-length write. The config
//! serializer recomputes `wTotalLength` from the descriptors it actually
//! emits, regardless of what the caller supplied.

use crate::usb::descriptor_type;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;
/// Audio endpoints append `bRefresh` and `bSynchAddress`.
pub const ENDPOINT_DESCRIPTOR_AUDIO_SIZE: usize = 9;
pub const QUALIFIER_DESCRIPTOR_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        DeviceDescriptor {
            b_length: DEVICE_DESCRIPTOR_SIZE as u8,
            bcd_usb: 0,
            device_class: 0,
            device_sub_class: 0,
            device_protocol: 0,
            max_packet_size0: 0,
            id_vendor: 0,
            id_product: 0,
            bcd_device: 0,
            i_manufacturer: 0,
            i_product: 0,
            i_serial_number: 0,
            num_configurations: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub b_length: u8,
    /// Recomputed during serialization; kept so parsed descriptors report
    /// what was on the wire.
    pub w_total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl Default for ConfigDescriptor {
    fn default() -> Self {
        ConfigDescriptor {
            b_length: CONFIG_DESCRIPTOR_SIZE as u8,
            w_total_length: 0,
            num_interfaces: 0,
            configuration_value: 0,
            i_configuration: 0,
            attributes: 0,
            max_power: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub i_interface: u8,
}

impl Default for InterfaceDescriptor {
    fn default() -> Self {
        InterfaceDescriptor {
            b_length: INTERFACE_DESCRIPTOR_SIZE as u8,
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 0,
            interface_class: 0,
            interface_sub_class: 0,
            interface_protocol: 0,
            i_interface: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// 7, or 9 for audio endpoints carrying the refresh/synch-address pair.
    pub b_length: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub refresh: u8,
    pub synch_address: u8,
}

impl Default for EndpointDescriptor {
    fn default() -> Self {
        EndpointDescriptor {
            b_length: ENDPOINT_DESCRIPTOR_SIZE as u8,
            endpoint_address: 0,
            attributes: 0,
            max_packet_size: 0,
            interval: 0,
            refresh: 0,
            synch_address: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualifierDescriptor {
    pub b_length: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
}

impl Default for QualifierDescriptor {
    fn default() -> Self {
        QualifierDescriptor {
            b_length: QUALIFIER_DESCRIPTOR_SIZE as u8,
            bcd_usb: 0,
            device_class: 0,
            device_sub_class: 0,
            device_protocol: 0,
            max_packet_size0: 0,
            num_configurations: 0,
        }
    }
}

fn write_truncated(image: &[u8], b_length: u8, buf: &mut [u8]) -> usize {
    if usize::from(b_length) > image.len() {
        return 0;
    }
    let n = usize::from(b_length).min(buf.len());
    buf[..n].copy_from_slice(&image[..n]);
    n
}

pub fn write_device_descriptor(desc: &DeviceDescriptor, buf: &mut [u8]) -> usize {
    let mut image = [0u8; DEVICE_DESCRIPTOR_SIZE];
    image[0] = desc.b_length;
    image[1] = descriptor_type::DEVICE;
    image[2..4].copy_from_slice(&desc.bcd_usb.to_le_bytes());
    image[4] = desc.device_class;
    image[5] = desc.device_sub_class;
    image[6] = desc.device_protocol;
    image[7] = desc.max_packet_size0;
    image[8..10].copy_from_slice(&desc.id_vendor.to_le_bytes());
    image[10..12].copy_from_slice(&desc.id_product.to_le_bytes());
    image[12..14].copy_from_slice(&desc.bcd_device.to_le_bytes());
    image[14] = desc.i_manufacturer;
    image[15] = desc.i_product;
    image[16] = desc.i_serial_number;
    image[17] = desc.num_configurations;
    write_truncated(&image, desc.b_length, buf)
}

/// Serializes a configuration descriptor followed by its trailing
/// descriptors (interface descriptors interleaved with endpoint and
/// class-specific descriptors). `wTotalLength` is recomputed as the sum of
/// every emitted descriptor's `bLength`.
pub fn write_config_descriptor(desc: &ConfigDescriptor, other: &[Vec<u8>], buf: &mut [u8]) -> usize {
    if usize::from(desc.b_length) > CONFIG_DESCRIPTOR_SIZE {
        return 0;
    }
    let mut total = u16::from(desc.b_length);
    for trailer in other {
        total = total.wrapping_add(u16::from(trailer.first().copied().unwrap_or(0)));
    }

    let mut image = [0u8; CONFIG_DESCRIPTOR_SIZE];
    image[0] = desc.b_length;
    image[1] = descriptor_type::CONFIG;
    image[2..4].copy_from_slice(&total.to_le_bytes());
    image[4] = desc.num_interfaces;
    image[5] = desc.configuration_value;
    image[6] = desc.i_configuration;
    image[7] = desc.attributes;
    image[8] = desc.max_power;

    let mut written = write_truncated(&image, desc.b_length, buf);
    for trailer in other {
        if written == buf.len() {
            break;
        }
        let b_length = usize::from(trailer.first().copied().unwrap_or(0));
        let n = b_length.min(trailer.len()).min(buf.len() - written);
        buf[written..written + n].copy_from_slice(&trailer[..n]);
        written += n;
    }
    written
}

pub fn write_interface_descriptor(desc: &InterfaceDescriptor, buf: &mut [u8]) -> usize {
    let mut image = [0u8; INTERFACE_DESCRIPTOR_SIZE];
    image[0] = desc.b_length;
    image[1] = descriptor_type::INTERFACE;
    image[2] = desc.interface_number;
    image[3] = desc.alternate_setting;
    image[4] = desc.num_endpoints;
    image[5] = desc.interface_class;
    image[6] = desc.interface_sub_class;
    image[7] = desc.interface_protocol;
    image[8] = desc.i_interface;
    write_truncated(&image, desc.b_length, buf)
}

pub fn write_endpoint_descriptor(desc: &EndpointDescriptor, buf: &mut [u8]) -> usize {
    let mut image = [0u8; ENDPOINT_DESCRIPTOR_AUDIO_SIZE];
    image[0] = desc.b_length;
    image[1] = descriptor_type::ENDPOINT;
    image[2] = desc.endpoint_address;
    image[3] = desc.attributes;
    image[4..6].copy_from_slice(&desc.max_packet_size.to_le_bytes());
    image[6] = desc.interval;
    image[7] = desc.refresh;
    image[8] = desc.synch_address;
    write_truncated(&image, desc.b_length, buf)
}

pub fn write_qualifier_descriptor(desc: &QualifierDescriptor, buf: &mut [u8]) -> usize {
    let mut image = [0u8; QUALIFIER_DESCRIPTOR_SIZE];
    image[0] = desc.b_length;
    image[1] = descriptor_type::QUALIFIER;
    image[2..4].copy_from_slice(&desc.bcd_usb.to_le_bytes());
    image[4] = desc.device_class;
    image[5] = desc.device_sub_class;
    image[6] = desc.device_protocol;
    image[7] = desc.max_packet_size0;
    image[8] = desc.num_configurations;
    image[9] = 0; // bRESERVED
    write_truncated(&image, desc.b_length, buf)
}

pub fn parse_device_descriptor(bytes: &[u8]) -> Option<DeviceDescriptor> {
    if bytes.len() < DEVICE_DESCRIPTOR_SIZE || bytes[1] != descriptor_type::DEVICE {
        return None;
    }
    Some(DeviceDescriptor {
        b_length: bytes[0],
        bcd_usb: u16::from_le_bytes([bytes[2], bytes[3]]),
        device_class: bytes[4],
        device_sub_class: bytes[5],
        device_protocol: bytes[6],
        max_packet_size0: bytes[7],
        id_vendor: u16::from_le_bytes([bytes[8], bytes[9]]),
        id_product: u16::from_le_bytes([bytes[10], bytes[11]]),
        bcd_device: u16::from_le_bytes([bytes[12], bytes[13]]),
        i_manufacturer: bytes[14],
        i_product: bytes[15],
        i_serial_number: bytes[16],
        num_configurations: bytes[17],
    })
}

pub fn parse_config_descriptor(bytes: &[u8]) -> Option<ConfigDescriptor> {
    if bytes.len() < CONFIG_DESCRIPTOR_SIZE || bytes[1] != descriptor_type::CONFIG {
        return None;
    }
    Some(ConfigDescriptor {
        b_length: bytes[0],
        w_total_length: u16::from_le_bytes([bytes[2], bytes[3]]),
        num_interfaces: bytes[4],
        configuration_value: bytes[5],
        i_configuration: bytes[6],
        attributes: bytes[7],
        max_power: bytes[8],
    })
}

pub fn parse_interface_descriptor(bytes: &[u8]) -> Option<InterfaceDescriptor> {
    if bytes.len() < INTERFACE_DESCRIPTOR_SIZE || bytes[1] != descriptor_type::INTERFACE {
        return None;
    }
    Some(InterfaceDescriptor {
        b_length: bytes[0],
        interface_number: bytes[2],
        alternate_setting: bytes[3],
        num_endpoints: bytes[4],
        interface_class: bytes[5],
        interface_sub_class: bytes[6],
        interface_protocol: bytes[7],
        i_interface: bytes[8],
    })
}

pub fn parse_endpoint_descriptor(bytes: &[u8]) -> Option<EndpointDescriptor> {
    if bytes.len() < ENDPOINT_DESCRIPTOR_SIZE || bytes[1] != descriptor_type::ENDPOINT {
        return None;
    }
    let audio = bytes[0] as usize >= ENDPOINT_DESCRIPTOR_AUDIO_SIZE
        && bytes.len() >= ENDPOINT_DESCRIPTOR_AUDIO_SIZE;
    Some(EndpointDescriptor {
        b_length: bytes[0],
        endpoint_address: bytes[2],
        attributes: bytes[3],
        max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]),
        interval: bytes[6],
        refresh: if audio { bytes[7] } else { 0 },
        synch_address: if audio { bytes[8] } else { 0 },
    })
}

pub fn parse_qualifier_descriptor(bytes: &[u8]) -> Option<QualifierDescriptor> {
    if bytes.len() < QUALIFIER_DESCRIPTOR_SIZE || bytes[1] != descriptor_type::QUALIFIER {
        return None;
    }
    Some(QualifierDescriptor {
        b_length: bytes[0],
        bcd_usb: u16::from_le_bytes([bytes[2], bytes[3]]),
        device_class: bytes[4],
        device_sub_class: bytes[5],
        device_protocol: bytes[6],
        max_packet_size0: bytes[7],
        num_configurations: bytes[8],
    })
}
