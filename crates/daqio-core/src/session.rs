//! Scan session state.
//!
//! One `ScanSession` is the shared record for an active (or most recently
//! active) scan. The transfer path mutates it, the health monitor and any
//! number of caller threads read it, all under one lock held only for
//! counter/cursor work, never across device I/O. Two condition variables
//! hang off it: "data arrived" (woken by the transfer path, waited on by
//! the monitor) and "scan done" (woken at idle transition, waited on by
//! blocking wait-until-done callers).

use std::ops::BitOr;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::calibration::BoundCoef;
use crate::error::DaqError;
use crate::pipeline;
use crate::ring::SampleRing;

/// Scan function type. One device runs at most one scan per function;
/// different functions are fully independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanFunction {
    AnalogInput,
    AnalogOutput,
    DigitalInput,
    DigitalOutput,
    CounterInput,
}

impl ScanFunction {
    pub fn direction(&self) -> ScanDirection {
        match self {
            ScanFunction::AnalogInput
            | ScanFunction::DigitalInput
            | ScanFunction::CounterInput => ScanDirection::Input,
            ScanFunction::AnalogOutput | ScanFunction::DigitalOutput => ScanDirection::Output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanDirection {
    Input,
    Output,
}

/// Scan option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOptions(u32);

impl ScanOptions {
    pub const NONE: ScanOptions = ScanOptions(0);
    /// Run until stopped; the destination buffer wraps.
    pub const CONTINUOUS: ScanOptions = ScanOptions(1 << 0);
    /// Burst-clocked channel conversions.
    pub const BURST: ScanOptions = ScanOptions(1 << 1);
    /// Pace from the external clock input.
    pub const EXT_CLOCK: ScanOptions = ScanOptions(1 << 2);
    /// Re-arm the trigger after each trigger event.
    pub const RETRIGGER: ScanOptions = ScanOptions(1 << 3);

    pub fn contains(self, other: ScanOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_subset_of(self, mask: ScanOptions) -> bool {
        self.0 & !mask.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ScanOptions {
    type Output = ScanOptions;
    fn bitor(self, rhs: ScanOptions) -> ScanOptions {
        ScanOptions(self.0 | rhs.0)
    }
}

/// Scan data-treatment flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanFlags(u32);

impl ScanFlags {
    pub const NONE: ScanFlags = ScanFlags(0);
    /// Keep samples in the raw code domain.
    pub const NO_SCALE: ScanFlags = ScanFlags(1 << 0);
    /// Skip device calibration coefficients.
    pub const NO_CALIBRATE: ScanFlags = ScanFlags(1 << 1);

    pub fn contains(self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_subset_of(self, mask: ScanFlags) -> bool {
        self.0 & !mask.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ScanFlags {
    type Output = ScanFlags;
    fn bitor(self, rhs: ScanFlags) -> ScanFlags {
        ScanFlags(self.0 | rhs.0)
    }
}

/// Coarse scan state reported by status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running,
}

/// Snapshot returned by a transfer-status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    /// Whole multi-channel scans transferred.
    pub current_scan_count: u64,
    /// Samples transferred across all channels; never resets while this
    /// session is current.
    pub current_total_count: u64,
    /// Buffer index of the start of the last complete scan, or -1 until
    /// one full multi-channel sample has transferred.
    pub current_index: i64,
}

/// Outcome of one block handed through the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    /// Samples accepted into (or drained from) the buffer.
    pub accepted: usize,
    /// Running total after the block.
    pub total: u64,
    /// Finite mode reached its last sample.
    pub finished: bool,
}

/// Parameters fixed for the lifetime of one session.
#[derive(Debug)]
pub struct SessionParams {
    pub function: ScanFunction,
    pub chan_count: usize,
    pub samples_per_channel: usize,
    pub sample_width: usize,
    pub options: ScanOptions,
    pub flags: ScanFlags,
    /// Bound calibration snapshot, one entry per channel-list position.
    pub coefs: Vec<BoundCoef>,
    /// Destination capacity in samples. Equals
    /// `samples_per_channel * chan_count` for finite scans; any multiple
    /// of `chan_count` for continuous.
    pub buffer_capacity: usize,
}

#[derive(Debug)]
struct SessionInner {
    state: ScanState,
    ring: SampleRing,
    /// Rolling calibration index, wraps modulo the channel count
    /// independently of the ring.
    cal_index: usize,
    /// Monotonic total of samples transferred.
    total: u64,
    all_samples_transferred: bool,
    stopping: bool,
    done: bool,
    last_error: Option<DaqError>,
    /// Bumped on every data-arrival signal so waiters can detect wakeups.
    data_seq: u64,
}

/// The central mutable record for one scan.
#[derive(Debug)]
pub struct ScanSession {
    function: ScanFunction,
    chan_count: usize,
    samples_per_channel: usize,
    sample_width: usize,
    options: ScanOptions,
    flags: ScanFlags,
    coefs: Vec<BoundCoef>,
    inner: Mutex<SessionInner>,
    data_arrived: Condvar,
    scan_done: Condvar,
}

impl ScanSession {
    /// Create a session with counters reset. The session starts in the
    /// running state; the caller arms transfer machinery around it.
    pub fn new(params: SessionParams) -> Result<Self, DaqError> {
        if params.chan_count == 0 {
            return Err(DaqError::BadChannelList("empty channel list".into()));
        }
        if params.coefs.len() != params.chan_count {
            return Err(DaqError::CalTableShort {
                needed: params.chan_count,
                actual: params.coefs.len(),
            });
        }
        if params.buffer_capacity == 0 || params.buffer_capacity % params.chan_count != 0 {
            return Err(DaqError::BadBuffer);
        }
        pipeline::validate_width(params.sample_width)
            .map_err(|_| DaqError::BadSampleWidth(params.sample_width))?;

        let ring = SampleRing::new(params.buffer_capacity)
            .map_err(|_| DaqError::BadBuffer)?;

        Ok(Self {
            function: params.function,
            chan_count: params.chan_count,
            samples_per_channel: params.samples_per_channel,
            sample_width: params.sample_width,
            options: params.options,
            flags: params.flags,
            coefs: params.coefs,
            inner: Mutex::new(SessionInner {
                state: ScanState::Running,
                ring,
                cal_index: 0,
                total: 0,
                all_samples_transferred: false,
                stopping: false,
                done: false,
                last_error: None,
                data_seq: 0,
            }),
            data_arrived: Condvar::new(),
            scan_done: Condvar::new(),
        })
    }

    pub fn function(&self) -> ScanFunction {
        self.function
    }

    pub fn direction(&self) -> ScanDirection {
        self.function.direction()
    }

    pub fn chan_count(&self) -> usize {
        self.chan_count
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    pub fn sample_width(&self) -> usize {
        self.sample_width
    }

    pub fn options(&self) -> ScanOptions {
        self.options
    }

    pub fn flags(&self) -> ScanFlags {
        self.flags
    }

    pub fn is_continuous(&self) -> bool {
        self.options.contains(ScanOptions::CONTINUOUS)
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.lock().unwrap().ring.capacity()
    }

    /// Preload the destination buffer, for output scans where the caller
    /// supplies the waveform before arming.
    pub fn load_buffer(&self, data: &[f64]) {
        self.inner.lock().unwrap().ring.load(data);
    }

    /// Calibrate a block of input codes into the destination buffer and
    /// advance the session counters. Returns how many samples were
    /// accepted; zero once the session is stopping or finished, which is
    /// what guarantees no buffer write can land after a stop.
    pub fn process_input(&self, codes: &[u64]) -> Result<ProcessOutcome, DaqError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ScanState::Running || inner.stopping || inner.all_samples_transferred {
            return Ok(ProcessOutcome {
                accepted: 0,
                total: inner.total,
                finished: inner.all_samples_transferred,
            });
        }

        let capacity = inner.ring.capacity() as u64;
        let finite = !self.is_continuous();
        let mut accepted = 0usize;

        for &code in codes {
            if finite && inner.total >= capacity {
                break;
            }
            let coef = self.coefs[inner.cal_index];
            let value = coef.apply(code);
            inner.ring.push(value).map_err(|_| {
                DaqError::CursorOutOfBounds {
                    cursor: inner.ring.cursor(),
                    capacity: inner.ring.capacity(),
                }
            })?;
            inner.cal_index = (inner.cal_index + 1) % self.chan_count;
            inner.total += 1;
            accepted += 1;
            if finite && inner.total == capacity {
                inner.all_samples_transferred = true;
                debug!(total = inner.total, "finite scan exhausted");
                break;
            }
        }

        let outcome = ProcessOutcome {
            accepted,
            total: inner.total,
            finished: inner.all_samples_transferred,
        };
        inner.data_seq += 1;
        self.data_arrived.notify_all();
        Ok(outcome)
    }

    /// Drain up to `max` samples from the buffer into output codes via the
    /// inverse transform, advancing the same counters input uses.
    pub fn fill_output(&self, codes: &mut Vec<u64>, max: usize) -> Result<ProcessOutcome, DaqError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ScanState::Running || inner.stopping || inner.all_samples_transferred {
            return Ok(ProcessOutcome {
                accepted: 0,
                total: inner.total,
                finished: inner.all_samples_transferred,
            });
        }

        let capacity = inner.ring.capacity() as u64;
        let finite = !self.is_continuous();
        let mut accepted = 0usize;

        while accepted < max {
            if finite && inner.total >= capacity {
                inner.all_samples_transferred = true;
                break;
            }
            let index = (inner.total % capacity) as usize;
            let value = inner.ring.get(index).map_err(|_| {
                DaqError::CursorOutOfBounds {
                    cursor: index,
                    capacity: inner.ring.capacity(),
                }
            })?;
            let coef = self.coefs[inner.cal_index];
            codes.push(coef.to_code(value));
            inner.cal_index = (inner.cal_index + 1) % self.chan_count;
            inner.total += 1;
            accepted += 1;
            if finite && inner.total == capacity {
                inner.all_samples_transferred = true;
                break;
            }
        }

        let outcome = ProcessOutcome {
            accepted,
            total: inner.total,
            finished: inner.all_samples_transferred,
        };
        inner.data_seq += 1;
        self.data_arrived.notify_all();
        Ok(outcome)
    }

    /// Transfer-status query. Computed under the session lock so a torn
    /// read of the 64-bit total is impossible on any platform, and never
    /// blocks on device I/O because the lock is never held across it.
    pub fn transfer_status(&self) -> TransferStatus {
        let inner = self.inner.lock().unwrap();
        let chans = self.chan_count as u64;
        let total = inner.total;
        let current_index = if total < chans {
            -1
        } else {
            let capacity = inner.ring.capacity() as u64;
            ((total - (total % chans) - chans) % capacity) as i64
        };
        TransferStatus {
            current_scan_count: total / chans,
            current_total_count: total,
            current_index,
        }
    }

    pub fn scan_state(&self) -> ScanState {
        self.inner.lock().unwrap().state
    }

    /// Best-known status pair for the status call: state plus the error
    /// remembered from a failed scan, if any.
    pub fn status(&self) -> (ScanState, Option<DaqError>) {
        let inner = self.inner.lock().unwrap();
        (inner.state, inner.last_error.clone())
    }

    /// Copy samples out of the destination buffer starting at a logical
    /// index, wrapping at capacity.
    pub fn read_buffer(&self, start: usize, out: &mut [f64]) -> Result<(), DaqError> {
        let inner = self.inner.lock().unwrap();
        inner.ring.copy_from(start, out).map_err(|_| {
            DaqError::CursorOutOfBounds {
                cursor: start,
                capacity: inner.ring.capacity(),
            }
        })
    }

    /// Record a failure from a background thread. First error wins;
    /// later ones are noise from the teardown.
    pub fn record_error(&self, err: DaqError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.last_error.is_none() {
            debug!(error = %err, "scan error recorded");
            inner.last_error = Some(err);
        }
        inner.data_seq += 1;
        self.data_arrived.notify_all();
    }

    pub fn last_error(&self) -> Option<DaqError> {
        self.inner.lock().unwrap().last_error.clone()
    }

    /// Flag the session as stopping. Returns false if it already was.
    pub fn request_stop(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopping {
            return false;
        }
        inner.stopping = true;
        inner.data_seq += 1;
        self.data_arrived.notify_all();
        true
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.lock().unwrap().stopping
    }

    pub fn all_samples_transferred(&self) -> bool {
        self.inner.lock().unwrap().all_samples_transferred
    }

    /// Finite scan ran to completion with no controller-initiated stop.
    /// The monitor uses this to force the logical stop.
    pub fn finished_without_stop(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.all_samples_transferred && !inner.stopping && !inner.done
    }

    /// Transition to idle and release every waiter. Idempotent; the first
    /// caller wins, whether that is the transfer path draining its last
    /// completion or the monitor tearing down on error.
    pub fn mark_idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            return;
        }
        inner.state = ScanState::Idle;
        inner.done = true;
        inner.data_seq += 1;
        debug!(total = inner.total, "session idle");
        self.data_arrived.notify_all();
        self.scan_done.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Timed wait for new data (or any state change). Returns true if the
    /// sequence advanced before the deadline.
    pub fn wait_data_arrived(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        let seq = inner.data_seq;
        let (inner, _result) = self
            .data_arrived
            .wait_timeout_while(inner, timeout, |i| i.data_seq == seq && !i.done)
            .unwrap();
        inner.data_seq != seq || inner.done
    }

    /// Block until the scan goes idle. `None` waits indefinitely; a bounded
    /// wait returns `Err(Timeout)` on expiry.
    pub fn wait_done(&self, timeout: Option<Duration>) -> Result<(), DaqError> {
        let inner = self.inner.lock().unwrap();
        match timeout {
            None => {
                let _inner = self
                    .scan_done
                    .wait_while(inner, |i| !i.done)
                    .unwrap();
                Ok(())
            }
            Some(t) => {
                let (inner, _result) = self
                    .scan_done
                    .wait_timeout_while(inner, t, |i| !i.done)
                    .unwrap();
                if inner.done { Ok(()) } else { Err(DaqError::Timeout) }
            }
        }
    }
}
