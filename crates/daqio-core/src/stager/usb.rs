//! USB transfer stager.
//!
//! Keeps a fixed pool of stages perpetually submitted against the bulk
//! streaming endpoint so the hardware FIFO is never starved (output) or
//! overrun (input). Each completion is processed and its stage resubmitted
//! immediately; that resubmit loop is what sustains throughput. USB
//! transport faults are never retried: the first failed completion ends
//! the scan and the remaining completions only drain the pool.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{DEFAULT_POOL_SIZE, DrainGate, ScanStager, StopFlag};
use crate::error::DaqError;
use crate::events::{DaqEventType, EventRegistry};
use crate::pipeline::{SampleSplitter, encode_block};
use crate::session::ScanSession;
use crate::transport::{Stage, StreamPipe, TransportError};

/// Pool and timing knobs for one USB scan.
#[derive(Debug, Clone)]
pub struct UsbStagerConfig {
    pub pool_size: usize,
    pub stage_size: usize,
    /// Deadline for one completion wait; bounds how fast the worker
    /// notices a stop request.
    pub wait_timeout: Duration,
}

impl Default for UsbStagerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            stage_size: 8192,
            wait_timeout: Duration::from_millis(100),
        }
    }
}

/// Input-direction USB stager.
pub struct UsbInputStager {
    session: Arc<ScanSession>,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    worker: Option<JoinHandle<()>>,
}

impl UsbInputStager {
    /// Prime the pool and start the completion loop.
    pub fn start(
        pipe: Box<dyn StreamPipe>,
        session: Arc<ScanSession>,
        events: Arc<EventRegistry>,
        config: UsbStagerConfig,
    ) -> Self {
        let stop = StopFlag::new();
        let drain = DrainGate::new();
        let worker = {
            let session = session.clone();
            let stop = stop.clone();
            let drain = drain.clone();
            thread::Builder::new()
                .name("daq-usb-input".into())
                .spawn(move || input_worker(pipe, session, events, stop, drain, config))
                .expect("spawn usb input stager")
        };
        Self {
            session,
            stop,
            drain,
            worker: Some(worker),
        }
    }
}

impl ScanStager for UsbInputStager {
    fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    fn request_stop(&self) {
        // Phase 1: no new writes, no new submissions. Phase 2 (cancel)
        // happens on the worker, which owns the pipe.
        self.session.request_stop();
        self.stop.request();
    }

    fn wait_drained(&self, timeout: Duration) -> Result<(), DaqError> {
        if self.drain.wait(timeout) {
            Ok(())
        } else {
            Err(DaqError::Timeout)
        }
    }
}

impl Drop for UsbInputStager {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn input_worker(
    mut pipe: Box<dyn StreamPipe>,
    session: Arc<ScanSession>,
    events: Arc<EventRegistry>,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    config: UsbStagerConfig,
) {
    let width = session.sample_width();
    let mut splitter = match SampleSplitter::new(width) {
        Ok(s) => s,
        Err(_) => {
            session.record_error(DaqError::BadSampleWidth(width));
            session.mark_idle();
            drain.open();
            return;
        }
    };
    let mut codes: Vec<u64> = Vec::with_capacity(config.stage_size / width.max(1));

    for _ in 0..config.pool_size {
        if pipe.submit(Stage::with_capacity(config.stage_size)).is_err() {
            break;
        }
    }
    debug!(pool = pipe.pending(), stage = config.stage_size, "input pool primed");

    // Set once transfer must wind down: finite scan exhausted, stop
    // requested, or a transport fault. From then on completions only
    // drain the pool.
    let mut winding_down = false;
    let mut cancelled = false;

    loop {
        if (winding_down || stop.is_requested()) && !cancelled {
            pipe.cancel_all();
            cancelled = true;
        }
        if pipe.pending() == 0 {
            break;
        }

        let completion = match pipe.wait_complete(config.wait_timeout) {
            Ok(c) => c,
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                warn!(error = %err, "completion wait failed");
                session.record_error(err.into());
                break;
            }
        };

        match completion.result {
            Ok(_) => {
                let mut finished = false;
                if !winding_down && !stop.is_requested() {
                    codes.clear();
                    splitter.split_into(completion.stage.bytes(), &mut codes);
                    match session.process_input(&codes) {
                        Ok(outcome) => {
                            events.on_samples(outcome.total);
                            finished = outcome.finished;
                        }
                        Err(err) => {
                            session.record_error(err);
                            winding_down = true;
                        }
                    }
                }
                if finished {
                    winding_down = true;
                }
                if !winding_down && !stop.is_requested() {
                    // Resubmit the same stage immediately to keep the pool
                    // full.
                    if let Err(err) = pipe.submit(completion.stage) {
                        session.record_error(err.into());
                        winding_down = true;
                    }
                }
                // A stage not resubmitted just leaves the pool.
            }
            Err(TransportError::Cancelled) => {
                // One drained; keep collecting the rest.
            }
            Err(err) => {
                // Transport fault: USB is not retried. Treat the remaining
                // pending completions as the last ones and surface the
                // disconnect for the monitor.
                warn!(error = %err, "usb transfer failed, ending scan");
                session.record_error(match err {
                    TransportError::Disconnected => DaqError::Disconnected,
                    other => other.into(),
                });
                winding_down = true;
            }
        }
    }

    if session.last_error().is_none() {
        events.raise(
            DaqEventType::EndOfInputScan,
            session.transfer_status().current_total_count,
        );
    }
    session.mark_idle();
    drain.open();
    debug!("usb input stager drained");
}

/// Output-direction USB stager: stages are pre-filled from the buffer via
/// the inverse transform and refilled on every completion.
pub struct UsbOutputStager {
    session: Arc<ScanSession>,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    worker: Option<JoinHandle<()>>,
}

impl UsbOutputStager {
    pub fn start(
        pipe: Box<dyn StreamPipe>,
        session: Arc<ScanSession>,
        events: Arc<EventRegistry>,
        config: UsbStagerConfig,
    ) -> Self {
        let stop = StopFlag::new();
        let drain = DrainGate::new();
        let worker = {
            let session = session.clone();
            let stop = stop.clone();
            let drain = drain.clone();
            thread::Builder::new()
                .name("daq-usb-output".into())
                .spawn(move || output_worker(pipe, session, events, stop, drain, config))
                .expect("spawn usb output stager")
        };
        Self {
            session,
            stop,
            drain,
            worker: Some(worker),
        }
    }
}

impl ScanStager for UsbOutputStager {
    fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    fn request_stop(&self) {
        self.session.request_stop();
        self.stop.request();
    }

    fn wait_drained(&self, timeout: Duration) -> Result<(), DaqError> {
        if self.drain.wait(timeout) {
            Ok(())
        } else {
            Err(DaqError::Timeout)
        }
    }
}

impl Drop for UsbOutputStager {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Refill one stage from the session buffer. Returns false once the
/// session has nothing more to send.
fn refill_stage(
    session: &ScanSession,
    codes: &mut Vec<u64>,
    stage: &mut Stage,
    width: usize,
) -> Result<bool, DaqError> {
    codes.clear();
    let max_codes = stage.capacity() / width;
    let outcome = session.fill_output(codes, max_codes)?;
    if outcome.accepted == 0 {
        return Ok(false);
    }
    let n = encode_block(codes, width, stage.buf_mut());
    stage.set_len(n);
    Ok(true)
}

fn output_worker(
    mut pipe: Box<dyn StreamPipe>,
    session: Arc<ScanSession>,
    events: Arc<EventRegistry>,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    config: UsbStagerConfig,
) {
    let width = session.sample_width();
    let mut codes: Vec<u64> = Vec::with_capacity(config.stage_size / width.max(1));

    // Prime: every stage leaves already carrying samples.
    for _ in 0..config.pool_size {
        let mut stage = Stage::with_capacity(config.stage_size);
        match refill_stage(&session, &mut codes, &mut stage, width) {
            Ok(true) => {
                if pipe.submit(stage).is_err() {
                    break;
                }
            }
            Ok(false) => break,
            Err(err) => {
                session.record_error(err);
                break;
            }
        }
    }
    debug!(pool = pipe.pending(), "output pool primed");

    // A cleanly exhausted waveform stops refills but lets the pending
    // stages play out on the wire; only a stop or a fault cancels them.
    let mut refills_done = false;
    let mut abort = false;
    let mut cancelled = false;

    loop {
        if (abort || stop.is_requested()) && !cancelled {
            pipe.cancel_all();
            cancelled = true;
        }
        if pipe.pending() == 0 {
            break;
        }

        let completion = match pipe.wait_complete(config.wait_timeout) {
            Ok(c) => c,
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                session.record_error(err.into());
                break;
            }
        };

        match completion.result {
            Ok(_) => {
                if refills_done || abort || stop.is_requested() {
                    continue;
                }
                let mut stage = completion.stage;
                match refill_stage(&session, &mut codes, &mut stage, width) {
                    Ok(true) => {
                        if let Err(err) = pipe.submit(stage) {
                            session.record_error(err.into());
                            abort = true;
                        }
                    }
                    Ok(false) => {
                        refills_done = true;
                    }
                    Err(err) => {
                        session.record_error(err);
                        abort = true;
                    }
                }
            }
            Err(TransportError::Cancelled) => {}
            Err(err) => {
                warn!(error = %err, "usb transfer failed, ending scan");
                session.record_error(match err {
                    TransportError::Disconnected => DaqError::Disconnected,
                    other => other.into(),
                });
                abort = true;
            }
        }
    }

    if session.last_error().is_none() {
        events.raise(
            DaqEventType::EndOfOutputScan,
            session.transfer_status().current_total_count,
        );
    }
    session.mark_idle();
    drain.open();
    debug!("usb output stager drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{BoundCoef, CalCoef, CustomScale};
    use crate::session::{ScanFlags, ScanFunction, ScanOptions, SessionParams};
    use crate::transport::{MockInputPipe, MockOutputPipe, PipeScript};

    fn raw_session(function: ScanFunction, chans: usize, capacity: usize, continuous: bool) -> Arc<ScanSession> {
        let options = if continuous {
            ScanOptions::CONTINUOUS
        } else {
            ScanOptions::NONE
        };
        Arc::new(
            ScanSession::new(SessionParams {
                function,
                chan_count: chans,
                samples_per_channel: capacity / chans,
                sample_width: 2,
                options,
                flags: ScanFlags::NO_SCALE | ScanFlags::NO_CALIBRATE,
                coefs: vec![
                    BoundCoef {
                        cal: CalCoef::IDENTITY,
                        custom: CustomScale::IDENTITY,
                        max_code: u64::MAX,
                        code_domain: false,
                    };
                    chans
                ],
                buffer_capacity: capacity,
            })
            .unwrap(),
        )
    }

    fn events() -> Arc<EventRegistry> {
        EventRegistry::new(DaqEventType::ALL.to_vec())
    }

    fn le_block(codes: &[u16]) -> Vec<u8> {
        codes.iter().flat_map(|c| c.to_le_bytes()).collect()
    }

    fn small_config() -> UsbStagerConfig {
        UsbStagerConfig {
            pool_size: 4,
            stage_size: 64,
            wait_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_finite_input_scan_runs_to_completion() {
        let session = raw_session(ScanFunction::AnalogInput, 2, 8, false);
        let script = vec![
            PipeScript::Data(le_block(&[1, 2, 3])),
            PipeScript::Data(le_block(&[4, 5])),
            PipeScript::Data(le_block(&[6, 7, 8, 9, 10])), // overshoots
        ];
        let (pipe, _handle) = MockInputPipe::new(script);

        let stager = UsbInputStager::start(
            Box::new(pipe),
            session.clone(),
            events(),
            small_config(),
        );
        session.wait_done(Some(Duration::from_secs(2))).unwrap();
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        assert!(session.all_samples_transferred());
        let status = session.transfer_status();
        assert_eq!(status.current_total_count, 8);
        let mut out = [0.0; 8];
        session.read_buffer(0, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_transport_fault_ends_scan_with_disconnect() {
        let session = raw_session(ScanFunction::AnalogInput, 1, 64, true);
        let script = vec![
            PipeScript::Data(le_block(&[1, 2])),
            PipeScript::Fail(TransportError::Disconnected),
            PipeScript::Data(le_block(&[3, 4])), // must never be consumed
        ];
        let (pipe, _handle) = MockInputPipe::new(script);

        let stager = UsbInputStager::start(
            Box::new(pipe),
            session.clone(),
            events(),
            small_config(),
        );
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        assert_eq!(session.last_error(), Some(DaqError::Disconnected));
        // Only the bytes before the fault landed.
        assert_eq!(session.transfer_status().current_total_count, 2);
    }

    #[test]
    fn test_stop_prevents_further_buffer_writes() {
        let session = raw_session(ScanFunction::AnalogInput, 1, 64, true);
        let (pipe, handle) = MockInputPipe::new(vec![PipeScript::Data(le_block(&[1, 2]))]);

        let stager = UsbInputStager::start(
            Box::new(pipe),
            session.clone(),
            events(),
            small_config(),
        );

        // Let the first completion land.
        for _ in 0..100 {
            if session.transfer_status().current_total_count >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        stager.request_stop();
        stager.wait_drained(Duration::from_secs(2)).unwrap();
        let total_at_stop = session.transfer_status().current_total_count;

        // Data arriving after the stop must not reach the buffer.
        handle.push_script(PipeScript::Data(le_block(&[9, 9, 9])));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            session.transfer_status().current_total_count,
            total_at_stop
        );
        assert!(session.is_done());
    }

    #[test]
    fn test_stop_with_nothing_in_flight_does_not_deadlock() {
        let session = raw_session(ScanFunction::AnalogInput, 1, 8, true);
        let (pipe, _handle) = MockInputPipe::new(vec![]);

        let config = UsbStagerConfig {
            pool_size: 0, // nothing ever submitted
            ..small_config()
        };
        let stager = UsbInputStager::start(Box::new(pipe), session.clone(), events(), config);
        stager.request_stop();
        stager.wait_drained(Duration::from_secs(2)).unwrap();
        assert!(session.is_done());
    }

    #[test]
    fn test_end_of_scan_event_fires_on_clean_finish() {
        use std::sync::Mutex;
        let session = raw_session(ScanFunction::AnalogInput, 1, 4, false);
        let registry = events();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        registry
            .enable(
                DaqEventType::EndOfInputScan,
                0,
                Arc::new(move |kind, data| {
                    seen_clone.lock().unwrap().push((kind, data));
                }),
                Default::default(),
            )
            .unwrap();

        let (pipe, _handle) = MockInputPipe::new(vec![PipeScript::Data(le_block(&[1, 2, 3, 4]))]);
        let stager = UsbInputStager::start(
            Box::new(pipe),
            session.clone(),
            registry.clone(),
            small_config(),
        );
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            seen.lock().unwrap().first(),
            Some(&(DaqEventType::EndOfInputScan, 4))
        );
        registry.disable_all();
    }

    #[test]
    fn test_output_scan_drains_waveform() {
        let session = raw_session(ScanFunction::AnalogOutput, 1, 8, false);
        session.load_buffer(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let (pipe, handle) = MockOutputPipe::new();
        let config = UsbStagerConfig {
            pool_size: 2,
            stage_size: 6, // three codes per stage
            wait_timeout: Duration::from_millis(10),
        };
        let stager =
            UsbOutputStager::start(Box::new(pipe), session.clone(), events(), config);
        session.wait_done(Some(Duration::from_secs(2))).unwrap();
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        assert!(session.all_samples_transferred());
        assert_eq!(handle.drained_bytes(), 16);
        let bytes: Vec<u8> = handle.drained().concat();
        assert_eq!(bytes[..4], [1, 0, 2, 0]);
    }
}
