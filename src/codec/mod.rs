//! MQTT v5.0 packet codec
//!
//! Pure framing and parsing; the codec owns no I/O. `Codec` is the streaming
//! deframer used by the engine: bytes in, whole packets out, residual bytes
//! retained per instance.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError, Packet};

/// Maximum remaining length (268,435,455 bytes)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Read a Variable Byte Integer from buffer.
/// Returns (value, bytes_consumed) or error.
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= 4 {
            // Continuation bit set on the fourth byte
            return Err(DecodeError::InvalidRemainingLength);
        }
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a Variable Byte Integer to buffer.
/// Returns bytes written.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Calculate the number of bytes needed to encode a Variable Byte Integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Read a Two Byte Integer (u16 big-endian)
#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a UTF-8 encoded string.
/// Returns (string, bytes_consumed) or error.
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total_len = 2 + len;

    if buf.len() < total_len {
        return Err(DecodeError::InsufficientData);
    }

    let s = std::str::from_utf8(&buf[2..total_len]).map_err(|_| DecodeError::InvalidUtf8)?;

    // Null characters are forbidden in MQTT strings
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket(
            "string contains null character",
        ));
    }

    Ok((s, total_len))
}

/// Read binary data.
/// Returns (data, bytes_consumed) or error.
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total_len = 2 + len;

    if buf.len() < total_len {
        return Err(DecodeError::InsufficientData);
    }

    Ok((&buf[2..total_len], total_len))
}

/// Write a UTF-8 encoded string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    let len = s.len();
    if len > 65535 {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = data.len();
    if len > 65535 {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(data);
    Ok(())
}

/// Streaming deframer over a byte stream.
///
/// Bytes arrive in arbitrary chunks via [`Codec::feed`]; whole packets come
/// out of [`Codec::next_packet`]. The total length of the packet at the head
/// of the buffer is cached once its remaining-length prefix is decodable, so
/// partial reads do not re-parse the prefix.
pub struct Codec {
    buf: BytesMut,
    pending_total: Option<usize>,
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            pending_total: None,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.decoder = self.decoder.with_max_packet_size(size);
        self
    }

    /// Append newly read bytes to the residual buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered but not yet emitted as a packet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes and cached framing state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pending_total = None;
    }

    /// Try to slice one whole packet off the front of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors are fatal to the
    /// connection the bytes came from.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        let total = match self.pending_total {
            Some(total) => total,
            None => {
                if self.buf.len() < 2 {
                    return Ok(None);
                }
                // Remaining length starts after the 1-byte fixed header
                let (remaining, len_bytes) = match read_variable_int(&self.buf[1..]) {
                    Ok(r) => r,
                    Err(DecodeError::InsufficientData) => return Ok(None),
                    Err(e) => return Err(e),
                };
                // Reject oversized packets before buffering their body
                if remaining as usize > self.decoder.max_packet_size() {
                    return Err(DecodeError::PacketTooLarge);
                }
                let total = 1 + len_bytes + remaining as usize;
                self.pending_total = Some(total);
                total
            }
        };

        if self.buf.len() < total {
            return Ok(None);
        }

        self.pending_total = None;
        let frame = &self.buf[..total];
        let packet = match self.decoder.decode(frame)? {
            Some((packet, consumed)) => {
                debug_assert_eq!(consumed, total);
                packet
            }
            None => return Err(DecodeError::InsufficientData),
        };
        self.buf.advance(total);
        Ok(Some(packet))
    }

    /// Serialize a packet to a contiguous byte sequence.
    pub fn encode(&self, packet: &Packet, out: &mut BytesMut) -> Result<(), EncodeError> {
        self.encoder.encode(packet, out)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}
