//! # MQTT Serialization Utilities
//!
//! This module provides helper functions for reading and writing MQTT-specific data types
//! from and to byte buffers, such as variable-byte integers and length-prefixed strings,
//! plus incremental fixed-header parsing for the streaming inbound path.

use crate::error::{MqttError, ProtocolError};
use crate::transport;

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// This is a common encoding scheme in MQTT for packet lengths.
pub fn read_variable_byte_integer(
    cursor: &mut usize,
    buf: &[u8],
) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
    let mut multiplier = 1;
    let mut value = 0;
    let mut i = 0;
    loop {
        let encoded_byte = buf
            .get(*cursor + i)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            break;
        }
        multiplier *= 128;
        i += 1;
        if i >= 4 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
    }
    *cursor += i + 1;
    Ok(value)
}

/// Writes a variable-byte integer to the start of the buffer, returning the byte count.
pub fn write_variable_byte_integer_len(
    buf: &mut [u8],
    mut val: usize,
) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        *buf.get_mut(i).ok_or(MqttError::BufferTooSmall)? = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub fn read_utf8_string<'a>(
    cursor: &mut usize,
    buf: &'a [u8],
) -> Result<&'a str, MqttError<transport::ErrorPlaceHolder>> {
    let len = u16::from_be_bytes(
        buf.get(*cursor..*cursor + 2)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?
            .try_into()
            .unwrap(),
    ) as usize;
    *cursor += 2;
    let s = core::str::from_utf8(
        buf.get(*cursor..*cursor + len)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?,
    )
    .map_err(|_| MqttError::Protocol(ProtocolError::InvalidUtf8String))?;
    *cursor += len;
    Ok(s)
}

/// Writes a UTF-8 encoded string (prefixed with a 2-byte length) to the buffer.
pub fn write_utf8_string(
    buf: &mut [u8],
    s: &str,
) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
    write_binary(buf, s.as_bytes())
}

/// Writes a binary blob (prefixed with a 2-byte length) to the buffer.
///
/// Used for password and last-will message fields of the CONNECT packet.
pub fn write_binary(
    buf: &mut [u8],
    data: &[u8],
) -> Result<usize, MqttError<transport::ErrorPlaceHolder>> {
    let len = data.len();
    if len > u16::MAX as usize {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }
    let len_bytes = (len as u16).to_be_bytes();

    let required_space = 2 + len;
    let slice = buf
        .get_mut(0..required_space)
        .ok_or(MqttError::BufferTooSmall)?;

    slice[0..2].copy_from_slice(&len_bytes);
    slice[2..].copy_from_slice(data);
    Ok(required_space)
}

/// A parsed MQTT fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FixedHeader {
    /// The packet type (upper nibble of the first byte).
    pub packet_type: u8,
    /// The flag bits (lower nibble of the first byte).
    pub flags: u8,
    /// The declared remaining length of the packet body.
    pub remaining_len: usize,
    /// Number of bytes the fixed header itself occupies.
    pub header_len: usize,
}

/// Attempts to parse a fixed header from the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, which lets the inbound
/// path parse a byte stream incrementally across bounded reads.
pub fn parse_fixed_header(
    buf: &[u8],
) -> Result<Option<FixedHeader>, MqttError<transport::ErrorPlaceHolder>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let packet_type = buf[0] >> 4;
    let flags = buf[0] & 0x0F;

    // The remaining-length field is 1 to 4 continuation bytes.
    let mut cursor = 1;
    match read_variable_byte_integer(&mut cursor, buf) {
        Ok(remaining_len) => Ok(Some(FixedHeader {
            packet_type,
            flags,
            remaining_len,
            header_len: cursor,
        })),
        // Fewer than 4 length bytes so far and no terminator seen yet:
        // indistinguishable from a short read, so ask for more.
        Err(_) if buf.len() < 5 => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_byte_integer_round_trip() {
        for val in [0usize, 1, 127, 128, 16383, 16384, 268_435_455] {
            let mut buf = [0u8; 4];
            let len = write_variable_byte_integer_len(&mut buf, val).unwrap();
            let mut cursor = 0;
            let decoded = read_variable_byte_integer(&mut cursor, &buf[..len]).unwrap();
            assert_eq!(decoded, val);
            assert_eq!(cursor, len);
        }
    }

    #[test]
    fn fixed_header_needs_more_bytes() {
        // PUBLISH type byte alone is not enough to know the length.
        assert_eq!(parse_fixed_header(&[0x30]).unwrap(), None);
        // A continuation bit with nothing after it is a short read too.
        assert_eq!(parse_fixed_header(&[0x30, 0x80]).unwrap(), None);
    }

    #[test]
    fn fixed_header_parses_two_byte_length() {
        let header = parse_fixed_header(&[0x32, 0xC1, 0x02]).unwrap().unwrap();
        assert_eq!(header.packet_type, 3);
        assert_eq!(header.flags, 0x02);
        assert_eq!(header.remaining_len, 321);
        assert_eq!(header.header_len, 3);
    }

    #[test]
    fn utf8_string_round_trip() {
        let mut buf = [0u8; 32];
        let written = write_utf8_string(&mut buf, "home/door").unwrap();
        assert_eq!(written, 2 + 9);
        let mut cursor = 0;
        assert_eq!(read_utf8_string(&mut cursor, &buf[..written]).unwrap(), "home/door");
    }
}
