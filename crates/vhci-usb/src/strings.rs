//! String descriptor tables and UTF-8 ↔ UTF-16LE conversion.
//!
//! String descriptor zero is the language-id table; other indices are
//! looked up per language id and encoded as UTF-16LE with the usual
//! length/type prefix.

use crate::usb::descriptor_type;

/// One indexed string within a language table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbString {
    pub index: u8,
    pub text: String,
}

impl UsbString {
    pub fn new(index: u8, text: &str) -> Self {
        UsbString {
            index,
            text: text.to_owned(),
        }
    }
}

/// Strings for one language id (e.g. 0x0409 for US English).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    pub language_id: u16,
    pub strings: Vec<UsbString>,
}

/// A string descriptor payload is capped by the u8 `bLength`: at most 126
/// UTF-16 code units after the 2-byte prefix.
const MAX_UNITS: usize = 126;

/// Encodes a string as UTF-16LE bytes. Supplementary-plane characters
/// become surrogate pairs.
pub fn utf8_to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decodes UTF-16LE bytes back into a string. Unpaired surrogates and a
/// trailing odd byte are skipped rather than failing the whole string.
pub fn utf16le_to_string(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .filter_map(|r| r.ok())
        .collect()
}

/// Writes the string descriptor for (`language_id`, `index`) into `buf`,
/// truncating to the buffer. Index 0 ignores `language_id` and produces the
/// language-id table descriptor. Returns `None` when the language or index
/// is not present in `tables`.
pub fn write_string_descriptor(
    tables: &[StringTable],
    language_id: u16,
    index: u8,
    buf: &mut [u8],
) -> Option<usize> {
    if index == 0 {
        let mut image = Vec::with_capacity(2 + tables.len() * 2);
        image.push(0); // patched below
        image.push(descriptor_type::STRING);
        for table in tables.iter().take(MAX_UNITS) {
            image.extend_from_slice(&table.language_id.to_le_bytes());
        }
        image[0] = image.len() as u8;
        let n = image.len().min(buf.len());
        buf[..n].copy_from_slice(&image[..n]);
        return Some(n);
    }

    let table = tables.iter().find(|t| t.language_id == language_id)?;
    let string = table.strings.iter().find(|s| s.index == index)?;

    let mut encoded = utf8_to_utf16le(&string.text);
    encoded.truncate(MAX_UNITS * 2);
    let mut image = Vec::with_capacity(2 + encoded.len());
    image.push((2 + encoded.len()) as u8);
    image.push(descriptor_type::STRING);
    image.extend_from_slice(&encoded);
    let n = image.len().min(buf.len());
    buf[..n].copy_from_slice(&image[..n]);
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Vec<StringTable> {
        vec![StringTable {
            language_id: 0x0409,
            strings: vec![
                UsbString::new(1, "Logitech"),
                UsbString::new(2, "USB-PS/2 Optical Mouse"),
            ],
        }]
    }

    #[test]
    fn language_id_descriptor() {
        let mut buf = [0u8; 16];
        let n = write_string_descriptor(&tables(), 0, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x04, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn ascii_string_descriptor() {
        let mut buf = [0u8; 64];
        let n = write_string_descriptor(&tables(), 0x0409, 1, &mut buf).unwrap();
        assert_eq!(n, 18);
        assert_eq!(&buf[..6], &[0x12, 0x03, b'L', 0x00, b'o', 0x00]);
    }

    #[test]
    fn missing_language_or_index() {
        let mut buf = [0u8; 64];
        assert!(write_string_descriptor(&tables(), 0x0407, 1, &mut buf).is_none());
        assert!(write_string_descriptor(&tables(), 0x0409, 9, &mut buf).is_none());
    }

    #[test]
    fn surrogate_pair_round_trip() {
        let s = "emoji \u{1f600} and CJK \u{4e2d}\u{6587}";
        assert_eq!(utf16le_to_string(&utf8_to_utf16le(s)), s);
    }

    #[test]
    fn unpaired_surrogate_is_skipped() {
        // High surrogate 0xd800 with no low half, then 'A'.
        let bytes = [0x00, 0xd8, b'A', 0x00];
        assert_eq!(utf16le_to_string(&bytes), "A");
    }
}
