//! Collaborator interfaces the engine consumes, and the per-function
//! capability traits device models implement.
//!
//! A device model that cannot do analog output simply does not implement
//! `AnalogOutputCapable`; there is no runtime "unsupported" default to
//! trip over.

use crate::calibration::Range;
use crate::error::DaqError;
use crate::events::DaqEventType;
use crate::scan::ScanParams;
use crate::session::{ScanDirection, ScanFlags, ScanOptions, ScanState, TransferStatus};
use crate::transport::TransportError;

/// Per-function hardware limits consumed at arm time.
#[derive(Debug, Clone)]
pub struct ScanCaps {
    pub channel_count: u8,
    /// Converter resolution in bits.
    pub resolution: u8,
    /// Raw sample width on the wire, in bytes.
    pub sample_width: usize,
    pub min_rate: f64,
    /// Per-channel rate ceiling with a single channel active.
    pub max_rate: f64,
    /// Aggregate converter throughput in samples per second.
    pub max_throughput: f64,
    pub min_samples: usize,
    /// Pacer clock the rate divisor is derived from.
    pub clock_freq: f64,
    /// Options this function supports.
    pub options: ScanOptions,
    /// Flags this function supports.
    pub flags: ScanFlags,
    pub ranges: Vec<Range>,
    /// Event kinds the device can notify on.
    pub events: Vec<DaqEventType>,
}

impl ScanCaps {
    /// Highest scan rate achievable with `channels` active.
    pub fn max_rate_for(&self, channels: usize) -> f64 {
        if channels == 0 {
            return self.max_rate;
        }
        self.max_rate.min(self.max_throughput / channels as f64)
    }

    pub fn max_code(&self) -> u64 {
        (1u64 << self.resolution) - 1
    }
}

/// Connection state of the transport below the engine.
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Active reachability check.
    fn check_connection(&self) -> Result<(), TransportError>;
}

/// Scan status register snapshot, as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceScanStatus {
    pub running: bool,
    pub overrun: bool,
    pub underrun: bool,
    pub pacer_fault: bool,
}

/// Device status register access for the health monitor. Implementations
/// must not take the session lock; these calls are device I/O.
pub trait StatusPoller: Send + Sync {
    fn scan_status(&self, direction: ScanDirection) -> Result<DeviceScanStatus, DaqError>;

    /// Auxiliary counters unrelated to the data path, refreshed
    /// periodically by the monitor.
    fn aux_counters(&self) -> Result<(), DaqError> {
        Ok(())
    }
}

/// Analog-input streaming capability.
pub trait AnalogInputCapable {
    /// Arm and start an input scan; returns the actual pacer rate.
    fn ai_scan_start(&mut self, params: ScanParams, buffer_capacity: usize)
    -> Result<f64, DaqError>;

    fn ai_scan_stop(&mut self) -> Result<(), DaqError>;

    fn ai_scan_status(&self) -> Result<(ScanState, TransferStatus), DaqError>;

    /// Block until the scan is done; negative timeout waits indefinitely.
    fn ai_scan_wait(&self, timeout_secs: f64) -> Result<(), DaqError>;
}

/// Analog-output streaming capability.
pub trait AnalogOutputCapable {
    /// Arm and start an output scan from a caller-filled waveform buffer;
    /// returns the actual pacer rate.
    fn ao_scan_start(
        &mut self,
        params: ScanParams,
        waveform: &[f64],
    ) -> Result<f64, DaqError>;

    fn ao_scan_stop(&mut self) -> Result<(), DaqError>;

    fn ao_scan_status(&self) -> Result<(ScanState, TransferStatus), DaqError>;

    fn ao_scan_wait(&self, timeout_secs: f64) -> Result<(), DaqError>;
}

/// Digital-port streaming capability, input direction.
pub trait DigitalInputCapable {
    fn di_scan_start(&mut self, params: ScanParams, buffer_capacity: usize)
    -> Result<f64, DaqError>;

    fn di_scan_stop(&mut self) -> Result<(), DaqError>;

    fn di_scan_status(&self) -> Result<(ScanState, TransferStatus), DaqError>;
}

/// Digital-port streaming capability, output direction.
pub trait DigitalOutputCapable {
    fn do_scan_start(&mut self, params: ScanParams, waveform: &[f64]) -> Result<f64, DaqError>;

    fn do_scan_stop(&mut self) -> Result<(), DaqError>;

    fn do_scan_status(&self) -> Result<(ScanState, TransferStatus), DaqError>;
}

/// Counter streaming capability.
pub trait CounterInputCapable {
    fn ci_scan_start(&mut self, params: ScanParams, buffer_capacity: usize)
    -> Result<f64, DaqError>;

    fn ci_scan_stop(&mut self) -> Result<(), DaqError>;

    fn ci_scan_status(&self) -> Result<(ScanState, TransferStatus), DaqError>;
}
