//! Transport layer abstraction.
//!
//! Two seams: `ControlTransport` for command/response traffic (one frame
//! exchanged at a time over the command channel) and `StreamPipe` for the
//! high-throughput sample path (a pool of stage buffers kept in flight).
//! Both have production implementations (nusb, TCP) and mocks for testing.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device not found")]
    DeviceNotFound,

    #[error("Failed to open transport: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransportError {
    /// Classify a std::io error from a socket or endpoint read/write.
    ///
    /// Timeouts are an expected operational outcome and must stay
    /// distinguishable from device loss.
    pub fn from_io(err: &std::io::Error, timeout: Duration) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => TransportError::Disconnected,
            _ => TransportError::ReadFailed(err.to_string()),
        }
    }

    /// Whether this error is a timeout (retriable by policy) rather than a
    /// hard fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Command-channel transport: raw byte send/receive with a deadline.
///
/// The framing layer sits on top of this; implementations only move bytes.
/// A command and its response must not interleave with another thread's
/// exchange, so the framing layer holds one lock across send+receive.
pub trait ControlTransport: Send + Sync {
    /// Send raw bytes, all or nothing.
    fn send(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Peek at pending input without consuming it. Used to learn the
    /// payload length from a fixed-size frame header.
    fn peek(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Receive up to `buf.len()` bytes.
    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Discard any pending input. Called before retrying a failed exchange.
    fn flush_input(&self);

    /// Cheap local check of the connection state.
    fn is_connected(&self) -> bool;

    /// Active probe: is the device still reachable? Used to distinguish a
    /// command timeout from device loss.
    fn check_connection(&self) -> Result<(), TransportError>;
}

/// One reusable scratch buffer for a single in-flight transfer.
///
/// Stages are recycled: a completed stage is handed back to the pipe
/// unchanged so the pool never reallocates on the hot path.
#[derive(Debug)]
pub struct Stage {
    buf: Vec<u8>,
    len: usize,
}

impl Stage {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Bytes transferred in the last completion.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whole scratch buffer, for the transport to fill or drain.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record how many bytes the transport moved.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len.min(self.buf.len());
    }

    /// Fill the stage with outgoing bytes.
    pub fn fill(&mut self, data: &[u8]) {
        let n = data.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&data[..n]);
        self.len = n;
    }
}

/// Outcome of one transfer: the recycled stage plus the transfer result.
#[derive(Debug)]
pub struct StageCompletion {
    pub stage: Stage,
    pub result: Result<usize, TransportError>,
}

/// Streaming-endpoint abstraction modelled as a submit/complete pool.
///
/// The stager submits stages to keep the hardware FIFO serviced and
/// collects completions one at a time. Cancellation flushes the queue:
/// cancelled stages still come back as completions carrying
/// `TransportError::Cancelled`, which is what lets the stager drain the
/// pool before releasing it.
pub trait StreamPipe: Send {
    /// Queue a stage for transfer (read into it, or write out of it,
    /// depending on the pipe direction).
    fn submit(&mut self, stage: Stage) -> Result<(), TransportError>;

    /// Block until the next completion or the deadline.
    /// Returns `Err(Timeout)` when nothing completed inside the window.
    fn wait_complete(&mut self, timeout: Duration) -> Result<StageCompletion, TransportError>;

    /// Cancel every outstanding stage. Completions for cancelled stages
    /// are still delivered through `wait_complete`.
    fn cancel_all(&mut self);

    /// Number of stages currently in flight.
    fn pending(&self) -> usize;
}

/// Blocking byte stream for the network data socket.
pub trait DataStream: Send {
    /// Blocking read with the stream's configured deadline.
    /// `Ok(0)` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Blocking write of the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Shut the stream down locally.
    fn shutdown(&mut self);
}
