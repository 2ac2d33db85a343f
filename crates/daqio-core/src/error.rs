//! Crate-wide error taxonomy.
//!
//! Four families with different handling policies:
//! - argument validation: caught on the calling thread before any I/O,
//!   never retried
//! - transport faults: network framing is retried a bounded number of
//!   times at the framing layer, USB faults immediately end the scan
//! - device-reported faults: overrun/underrun/pacer-fault, detected only
//!   by the health monitor's status poll
//! - internal invariant violations: unconditionally fatal
//!
//! Background threads never propagate these across thread boundaries;
//! they land in the session's last-error slot and come back as the return
//! value of the next status or wait call.

use thiserror::Error;

use crate::protocol::FrameError;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    // ------------------------------------------------------------------
    // Argument validation
    // ------------------------------------------------------------------
    #[error("invalid channel {channel}: device has {available} channels")]
    BadChannel { channel: u8, available: u8 },

    #[error("invalid channel list: {0}")]
    BadChannelList(String),

    #[error("range [{min}, {max}] not supported by this device")]
    BadRange { min: f64, max: f64 },

    #[error("unsupported scan option combination: {0}")]
    BadOption(String),

    #[error("unsupported scan flag: {0}")]
    BadFlag(String),

    #[error("rate {requested} Hz outside device limits [{min}, {max}] for {channels} channels")]
    BadRate {
        requested: f64,
        min: f64,
        max: f64,
        channels: usize,
    },

    #[error("sample count {requested} below device minimum {minimum}")]
    BadSampleCount { requested: usize, minimum: usize },

    #[error("destination buffer empty, too small, or not a multiple of the channel count")]
    BadBuffer,

    #[error("unsupported sample width: {0} bytes")]
    BadSampleWidth(usize),

    #[error("invalid trigger configuration: {0}")]
    BadTrigger(String),

    #[error("invalid event parameter: {0}")]
    BadEventParameter(String),

    #[error("event type not supported by this device")]
    UnsupportedEvent,

    #[error("event already enabled")]
    EventAlreadyEnabled,

    #[error("event not enabled")]
    EventNotEnabled,

    #[error("a scan of this function is already running")]
    AlreadyRunning,

    #[error("device is not connected")]
    NotConnected,

    // ------------------------------------------------------------------
    // Expected operational outcomes
    // ------------------------------------------------------------------
    #[error("operation timed out")]
    Timeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("input scan overrun: device FIFO overflowed")]
    Overrun,

    #[error("output scan underrun: device FIFO drained")]
    Underrun,

    #[error("pacer overrun: sample clock outpaced the converter")]
    PacerOverrun,

    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    // ------------------------------------------------------------------
    // Internal invariant violations
    // ------------------------------------------------------------------
    #[error("device not ready for calibrated I/O: no calibration table loaded")]
    CalTableMissing,

    #[error("calibration table holds {actual} coefficients, scan needs {needed}")]
    CalTableShort { needed: usize, actual: usize },

    #[error("scan buffer cursor out of bounds: {cursor} >= {capacity}")]
    CursorOutOfBounds { cursor: usize, capacity: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl DaqError {
    /// Device-reported FIFO/pacer faults, the family only the health
    /// monitor raises.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            DaqError::Overrun | DaqError::Underrun | DaqError::PacerOverrun
        )
    }

    /// Errors that must terminate a running scan.
    pub fn is_fatal_to_scan(&self) -> bool {
        matches!(
            self,
            DaqError::Disconnected
                | DaqError::Overrun
                | DaqError::Underrun
                | DaqError::PacerOverrun
                | DaqError::ProtocolFault(_)
                | DaqError::CalTableMissing
                | DaqError::CalTableShort { .. }
                | DaqError::CursorOutOfBounds { .. }
                | DaqError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_fault_family() {
        assert!(DaqError::Overrun.is_device_fault());
        assert!(DaqError::Underrun.is_device_fault());
        assert!(DaqError::PacerOverrun.is_device_fault());
        assert!(!DaqError::Timeout.is_device_fault());
    }

    #[test]
    fn test_transport_conversion() {
        let err: DaqError = TransportError::Disconnected.into();
        assert!(err.is_fatal_to_scan());
    }
}
