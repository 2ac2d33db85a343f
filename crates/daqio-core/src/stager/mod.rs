//! Transfer staging.
//!
//! A stager owns the raw I/O stages for one scan and runs the thread that
//! moves bytes between the transport and the calibration pipeline. Two
//! variants: the USB pool stager and the network stream stager. Both obey
//! the same stop contract: clear the keep-going flag, cancel or drain
//! in-flight work, and only report drained once no completion can still
//! touch the destination buffer.

pub mod net;
pub mod usb;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::DaqError;

pub use net::{DataSocketCloser, NetInputStager, NetOutputStager, NetStagerConfig};
pub use usb::{UsbInputStager, UsbOutputStager, UsbStagerConfig};

/// Stages kept perpetually in flight on the USB streaming endpoint.
pub const DEFAULT_POOL_SIZE: usize = 32;

/// Floor and ceiling for one stage, in bytes.
pub const MIN_STAGE_SIZE: usize = 512;
pub const MAX_STAGE_SIZE: usize = 64 * 1024;

/// Stage size tuned to throughput: roughly 10 ms of data per stage,
/// rounded to a power of two and clamped to the transport's limits.
pub fn stage_size(rate: f64, chan_count: usize, sample_width: usize) -> usize {
    let bytes_per_sec = rate * chan_count as f64 * sample_width as f64;
    let target = (bytes_per_sec / 100.0) as usize;
    target
        .next_power_of_two()
        .clamp(MIN_STAGE_SIZE, MAX_STAGE_SIZE)
}

/// Shared stop signal between a stager, its worker thread, and the health
/// monitor. Setting it tells the worker to stop resubmitting or reading.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One-shot gate the worker opens when every completion has drained and
/// nothing can touch the destination buffer anymore. Releasing the stage
/// pool before this gate opens is the use-after-free the stop sequence
/// exists to prevent.
#[derive(Debug, Default)]
pub(crate) struct DrainGate {
    drained: Mutex<bool>,
    signal: Condvar,
}

impl DrainGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        let mut drained = self.drained.lock().unwrap();
        *drained = true;
        self.signal.notify_all();
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        let drained = self.drained.lock().unwrap();
        let (drained, _result) = self
            .signal
            .wait_timeout_while(drained, timeout, |d| !*d)
            .unwrap();
        *drained
    }
}

/// Common control surface of both stager variants.
pub trait ScanStager: Send {
    /// Stop signal shared with the worker (and the health monitor).
    fn stop_flag(&self) -> StopFlag;

    /// Phase 1+2 of the stop sequence: stop resubmitting/reading and
    /// cancel in-flight work.
    fn request_stop(&self);

    /// Phase 3: block until every completion has drained and no write to
    /// the destination buffer can still happen. Returns `Err(Timeout)` if
    /// the drain does not finish inside `timeout`.
    fn wait_drained(&self, timeout: Duration) -> Result<(), DaqError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_size_scales_with_rate() {
        // Slow scans ride the floor.
        assert_eq!(stage_size(100.0, 1, 2), MIN_STAGE_SIZE);
        // 100 kS/s * 4 ch * 2 B = 800 kB/s -> ~8 kB per stage.
        assert_eq!(stage_size(100_000.0, 4, 2), 8192);
        // Absurd rates clamp at the ceiling.
        assert_eq!(stage_size(10_000_000.0, 8, 8), MAX_STAGE_SIZE);
    }

    #[test]
    fn test_stop_flag_is_shared() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_requested());
        flag.request();
        assert!(clone.is_requested());
    }
}
