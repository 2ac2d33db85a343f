//! Raw sample codec.
//!
//! Front-end of the calibration pipeline: device bytes in, unsigned sample
//! codes out (and the reverse for output scans). Codes are little-endian
//! unsigned integers of 16, 32, 48, or 64 significant bits.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported sample width: {0} bytes")]
    BadWidth(usize),
}

/// Sample byte-widths the engine understands.
pub const SAMPLE_WIDTHS: &[usize] = &[2, 4, 6, 8];

/// Check a width at arm time so the data path never sees a bad one.
pub fn validate_width(width: usize) -> Result<(), CodecError> {
    if SAMPLE_WIDTHS.contains(&width) {
        Ok(())
    } else {
        Err(CodecError::BadWidth(width))
    }
}

/// Decode one sample code from `bytes[..width]`.
#[inline]
pub fn decode_code(bytes: &[u8], width: usize) -> u64 {
    LittleEndian::read_uint(&bytes[..width], width)
}

/// Encode one sample code into `out[..width]`.
#[inline]
pub fn encode_code(out: &mut [u8], code: u64, width: usize) {
    LittleEndian::write_uint(&mut out[..width], code, width);
}

/// Splits an incoming byte stream on sample-size boundaries.
///
/// Transport reads land on arbitrary boundaries; any partial trailing
/// sample is carried over and completed by the next read. Whole codes are
/// appended to the caller's scratch vector so the hot path reuses one
/// allocation.
#[derive(Debug)]
pub struct SampleSplitter {
    width: usize,
    carry: Vec<u8>,
}

impl SampleSplitter {
    pub fn new(width: usize) -> Result<Self, CodecError> {
        validate_width(width)?;
        Ok(Self {
            width,
            carry: Vec::with_capacity(width),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Bytes currently carried from the previous read.
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    /// Split `bytes` into whole codes, appending to `out`.
    pub fn split_into(&mut self, mut bytes: &[u8], out: &mut Vec<u64>) {
        // Complete a carried partial sample first.
        if !self.carry.is_empty() {
            let need = self.width - self.carry.len();
            let take = need.min(bytes.len());
            self.carry.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.carry.len() == self.width {
                out.push(decode_code(&self.carry, self.width));
                self.carry.clear();
            } else {
                return; // still short; wait for the next read
            }
        }

        let whole = bytes.len() / self.width * self.width;
        for chunk in bytes[..whole].chunks_exact(self.width) {
            out.push(decode_code(chunk, self.width));
        }
        self.carry.extend_from_slice(&bytes[whole..]);
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}

/// Encode a block of codes into a byte stage for output transfer.
/// Returns the number of bytes written.
pub fn encode_block(codes: &[u64], width: usize, out: &mut [u8]) -> usize {
    let mut written = 0;
    for &code in codes {
        if written + width > out.len() {
            break;
        }
        encode_code(&mut out[written..], code, width);
        written += width;
    }
    written
}
