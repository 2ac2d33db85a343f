//! Command/reply frame codec.
//!
//! Wire layout, all multi-byte integers little-endian:
//!
//! ```text
//! +------+---------+----------+--------+------------+---------+----------+
//! | 0xDB | command | frame id | status | count: u16 | data... | checksum |
//! +------+---------+----------+--------+------------+---------+----------+
//! ```
//!
//! The checksum is additive: `0xFF - sum(all preceding bytes)`, so summing
//! an entire well-formed frame yields 0xFF.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{ACK_BIT, FRAME_CHECKSUM_SIZE, FRAME_DELIMITER, FRAME_HEADER_SIZE};

/// A recoverable framing fault. Every variant maps to one retry of the
/// whole exchange at the layer above.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Bad checksum: expected 0x{expected:02X}, got 0x{actual:02X}")]
    BadChecksum { expected: u8, actual: u8 },

    #[error("Bad delimiter: 0x{actual:02X}")]
    BadDelimiter { actual: u8 },

    #[error("Command mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    CommandMismatch { expected: u8, actual: u8 },

    #[error("Frame id mismatch: expected {expected}, got {actual}")]
    FrameIdMismatch { expected: u8, actual: u8 },

    #[error("Payload of {len} bytes exceeds receive capacity {capacity}")]
    Oversize { len: usize, capacity: usize },
}

/// Additive checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0xFFu8.wrapping_sub(sum)
}

/// One command or reply unit of the Ethernet transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub frame_id: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Build an outgoing command frame. The status byte of a request is
    /// always zero.
    pub fn request(command: u8, frame_id: u8, payload: &[u8]) -> Self {
        Self {
            command,
            frame_id,
            status: 0,
            data: payload.to_vec(),
        }
    }

    /// Total wire size for a given payload length.
    pub fn wire_size(payload_len: usize) -> usize {
        FRAME_HEADER_SIZE + payload_len + FRAME_CHECKSUM_SIZE
    }

    /// Payload length encoded in a peeked fixed header.
    pub fn payload_len(header: &[u8]) -> Result<usize, FrameError> {
        if header.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: header.len(),
            });
        }
        Ok(LittleEndian::read_u16(&header[4..6]) as usize)
    }

    /// Serialize header + payload + checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::wire_size(self.data.len()));
        buf.push(FRAME_DELIMITER);
        buf.push(self.command);
        buf.push(self.frame_id);
        buf.push(self.status);
        let mut count = [0u8; 2];
        LittleEndian::write_u16(&mut count, self.data.len() as u16);
        buf.extend_from_slice(&count);
        buf.extend_from_slice(&self.data);
        buf.push(checksum(&buf));
        buf
    }

    /// Parse and structurally validate a received frame: length, checksum,
    /// delimiter. Correlation against the request happens separately in
    /// [`Frame::expect_reply_to`].
    pub fn from_bytes(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < Self::wire_size(0) {
            return Err(FrameError::Truncated {
                expected: Self::wire_size(0),
                actual: raw.len(),
            });
        }
        let count = Self::payload_len(raw)?;
        let expected_len = Self::wire_size(count);
        if raw.len() < expected_len {
            return Err(FrameError::Truncated {
                expected: expected_len,
                actual: raw.len(),
            });
        }

        let body = &raw[..expected_len - 1];
        let expected_sum = checksum(body);
        let actual_sum = raw[expected_len - 1];
        if expected_sum != actual_sum {
            return Err(FrameError::BadChecksum {
                expected: expected_sum,
                actual: actual_sum,
            });
        }

        if raw[0] != FRAME_DELIMITER {
            return Err(FrameError::BadDelimiter { actual: raw[0] });
        }

        Ok(Self {
            command: raw[1],
            frame_id: raw[2],
            status: raw[3],
            data: raw[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + count].to_vec(),
        })
    }

    /// Correlate this reply against the request it should answer.
    /// Checks, in order: ack-bit command echo, frame id, payload size
    /// against the receiver's capacity.
    pub fn expect_reply_to(
        &self,
        request_command: u8,
        frame_id: u8,
        rx_capacity: usize,
    ) -> Result<(), FrameError> {
        let expected = request_command | ACK_BIT;
        if self.command != expected {
            return Err(FrameError::CommandMismatch {
                expected,
                actual: self.command,
            });
        }
        if self.frame_id != frame_id {
            return Err(FrameError::FrameIdMismatch {
                expected: frame_id,
                actual: self.frame_id,
            });
        }
        if self.data.len() > rx_capacity {
            return Err(FrameError::Oversize {
                len: self.data.len(),
                capacity: rx_capacity,
            });
        }
        Ok(())
    }
}
