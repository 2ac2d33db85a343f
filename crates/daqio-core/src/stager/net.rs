//! Network stream stager.
//!
//! A dedicated loop thread does blocking reads (or writes) on the
//! streaming data socket, distinct from the command socket. Incoming bytes
//! are split on sample-size boundaries with any partial trailing sample
//! carried into the next read. A single read timeout is not proof of
//! device loss: the monitor is asked for an explicit status poll, and only
//! a positive error status or a second consecutive timeout ends the scan.
//! On exit the stager tells the firmware to release the data socket before
//! shutting it down locally, so the device side is never left half-open.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{DrainGate, ScanStager, StopFlag};
use crate::error::DaqError;
use crate::events::{DaqEventType, EventRegistry};
use crate::monitor::{MonitorLink, MonitorVerdict};
use crate::pipeline::{SampleSplitter, encode_block};
use crate::session::ScanSession;
use crate::transport::DataStream;

/// Callback that sends the device the "close data socket" command.
pub type DataSocketCloser = Box<dyn FnOnce() + Send>;

/// Knobs for one network scan.
#[derive(Debug, Clone)]
pub struct NetStagerConfig {
    /// Scratch buffer for one blocking read or write.
    pub scratch_size: usize,
}

impl Default for NetStagerConfig {
    fn default() -> Self {
        Self { scratch_size: 8192 }
    }
}

/// Input-direction network stager.
pub struct NetInputStager {
    session: Arc<ScanSession>,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    worker: Option<JoinHandle<()>>,
}

impl NetInputStager {
    pub fn start(
        stream: Box<dyn DataStream>,
        session: Arc<ScanSession>,
        events: Arc<EventRegistry>,
        link: MonitorLink,
        on_close: DataSocketCloser,
        config: NetStagerConfig,
    ) -> Self {
        let stop = StopFlag::new();
        let drain = DrainGate::new();
        let worker = {
            let session = session.clone();
            let stop = stop.clone();
            let drain = drain.clone();
            thread::Builder::new()
                .name("daq-net-input".into())
                .spawn(move || {
                    read_loop(stream, session, events, link, stop, drain, on_close, config)
                })
                .expect("spawn net input stager")
        };
        Self {
            session,
            stop,
            drain,
            worker: Some(worker),
        }
    }
}

impl ScanStager for NetInputStager {
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

impl Drop for NetInputStager {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn read_loop(
    mut stream: Box<dyn DataStream>,
    session: Arc<ScanSession>,
    events: Arc<EventRegistry>,
    link: MonitorLink,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    on_close: DataSocketCloser,
    config: NetStagerConfig,
) {
    let width = session.sample_width();
    let mut splitter = match SampleSplitter::new(width) {
        Ok(s) => s,
        Err(_) => {
            session.record_error(DaqError::BadSampleWidth(width));
            finish_stream(stream.as_mut(), &session, &events, on_close, &drain, true);
            return;
        }
    };
    let mut scratch = vec![0u8; config.scratch_size];
    let mut codes: Vec<u64> = Vec::with_capacity(config.scratch_size / width.max(1));
    let mut consecutive_timeouts = 0u32;

    loop {
        if stop.is_requested() || session.is_stopping() {
            break;
        }

        match stream.read(&mut scratch) {
            Ok(0) => {
                warn!("data socket closed by peer");
                session.record_error(DaqError::Disconnected);
                break;
            }
            Ok(n) => {
                consecutive_timeouts = 0;
                codes.clear();
                splitter.split_into(&scratch[..n], &mut codes);
                match session.process_input(&codes) {
                    Ok(outcome) => {
                        events.on_samples(outcome.total);
                        if outcome.finished {
                            debug!(total = outcome.total, "finite network scan complete");
                            break;
                        }
                    }
                    Err(err) => {
                        session.record_error(err);
                        break;
                    }
                }
            }
            Err(err) if err.is_timeout() => {
                consecutive_timeouts += 1;
                if consecutive_timeouts >= 2 {
                    warn!("second consecutive data timeout, treating device as lost");
                    session.record_error(DaqError::Disconnected);
                    break;
                }
                // A quiet window alone is inconclusive; ask the monitor's
                // status poll to adjudicate.
                match link.poll_device() {
                    MonitorVerdict::Continue => {}
                    MonitorVerdict::Fatal(fault) => {
                        session.record_error(fault);
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "data socket read failed");
                session.record_error(err.into());
                break;
            }
        }
    }

    let had_error = session.last_error().is_some();
    finish_stream(stream.as_mut(), &session, &events, on_close, &drain, had_error);
}

fn finish_stream(
    stream: &mut dyn DataStream,
    session: &ScanSession,
    events: &EventRegistry,
    on_close: DataSocketCloser,
    drain: &DrainGate,
    had_error: bool,
) {
    // Tell the firmware to release its end before closing ours.
    on_close();
    stream.shutdown();

    if !had_error {
        let kind = match session.direction() {
            crate::session::ScanDirection::Input => DaqEventType::EndOfInputScan,
            crate::session::ScanDirection::Output => DaqEventType::EndOfOutputScan,
        };
        events.raise(kind, session.transfer_status().current_total_count);
    }
    session.mark_idle();
    drain.open();
    debug!("network stager drained");
}

/// Output-direction network stager: drains the buffer through the inverse
/// transform and writes encoded samples to the data socket, paced by
/// socket backpressure.
pub struct NetOutputStager {
    session: Arc<ScanSession>,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    worker: Option<JoinHandle<()>>,
}

impl NetOutputStager {
    pub fn start(
        stream: Box<dyn DataStream>,
        session: Arc<ScanSession>,
        events: Arc<EventRegistry>,
        on_close: DataSocketCloser,
        config: NetStagerConfig,
    ) -> Self {
        let stop = StopFlag::new();
        let drain = DrainGate::new();
        let worker = {
            let session = session.clone();
            let stop = stop.clone();
            let drain = drain.clone();
            thread::Builder::new()
                .name("daq-net-output".into())
                .spawn(move || write_loop(stream, session, events, stop, drain, on_close, config))
                .expect("spawn net output stager")
        };
        Self {
            session,
            stop,
            drain,
            worker: Some(worker),
        }
    }
}

impl ScanStager for NetOutputStager {
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

impl Drop for NetOutputStager {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_loop(
    mut stream: Box<dyn DataStream>,
    session: Arc<ScanSession>,
    events: Arc<EventRegistry>,
    stop: StopFlag,
    drain: Arc<DrainGate>,
    on_close: DataSocketCloser,
    config: NetStagerConfig,
) {
    let width = session.sample_width();
    let mut scratch = vec![0u8; config.scratch_size];
    let mut codes: Vec<u64> = Vec::with_capacity(config.scratch_size / width.max(1));
    let max_codes = config.scratch_size / width.max(1);

    loop {
        if stop.is_requested() || session.is_stopping() {
            break;
        }

        codes.clear();
        let outcome = match session.fill_output(&mut codes, max_codes) {
            Ok(o) => o,
            Err(err) => {
                session.record_error(err);
                break;
            }
        };
        if outcome.accepted == 0 {
            if outcome.finished {
                debug!(total = outcome.total, "finite output waveform sent");
            }
            break;
        }

        let n = encode_block(&codes, width, &mut scratch);
        if let Err(err) = stream.write_all(&scratch[..n]) {
            warn!(error = %err, "data socket write failed");
            session.record_error(err.into());
            break;
        }
        if outcome.finished {
            break;
        }
    }

    let had_error = session.last_error().is_some();
    finish_stream(stream.as_mut(), &session, &events, on_close, &drain, had_error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::calibration::{BoundCoef, CalCoef, CustomScale};
    use crate::device::{DeviceScanStatus, StatusPoller};
    use crate::session::{ScanDirection, ScanFlags, ScanFunction, ScanOptions, SessionParams};
    use crate::transport::{MockDataStream, StreamScript};

    struct ScriptedPoller {
        statuses: Mutex<Vec<DeviceScanStatus>>,
    }

    impl StatusPoller for ScriptedPoller {
        fn scan_status(&self, _direction: ScanDirection) -> Result<DeviceScanStatus, DaqError> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.is_empty() {
                Ok(DeviceScanStatus {
                    running: true,
                    ..Default::default()
                })
            } else {
                Ok(statuses.remove(0))
            }
        }
    }

    fn healthy_poller() -> Arc<ScriptedPoller> {
        Arc::new(ScriptedPoller {
            statuses: Mutex::new(vec![]),
        })
    }

    fn raw_session(
        function: ScanFunction,
        capacity: usize,
        continuous: bool,
    ) -> Arc<ScanSession> {
        let options = if continuous {
            ScanOptions::CONTINUOUS
        } else {
            ScanOptions::NONE
        };
        Arc::new(
            ScanSession::new(SessionParams {
                function,
                chan_count: 1,
                samples_per_channel: capacity,
                sample_width: 2,
                options,
                flags: ScanFlags::NO_SCALE | ScanFlags::NO_CALIBRATE,
                coefs: vec![BoundCoef {
                    cal: CalCoef::IDENTITY,
                    custom: CustomScale::IDENTITY,
                    max_code: u64::MAX,
                    code_domain: false,
                }],
                buffer_capacity: capacity,
            })
            .unwrap(),
        )
    }

    fn events() -> Arc<EventRegistry> {
        EventRegistry::new(DaqEventType::ALL.to_vec())
    }

    fn closer() -> (DataSocketCloser, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        (
            Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            }),
            closed,
        )
    }

    fn le_block(codes: &[u16]) -> Vec<u8> {
        codes.iter().flat_map(|c| c.to_le_bytes()).collect()
    }

    #[test]
    fn test_reads_split_across_sample_boundaries() {
        let session = raw_session(ScanFunction::AnalogInput, 4, false);
        // 4 samples delivered with a torn boundary in the middle.
        let mut first = le_block(&[0x0101, 0x0202]);
        let second = first.split_off(3);
        let (stream, _handle) = MockDataStream::new(vec![
            StreamScript::Data(first),
            StreamScript::Data(second),
            StreamScript::Data(le_block(&[0x0303, 0x0404])),
        ]);
        let link = MonitorLink::new(session.clone(), healthy_poller());
        let (on_close, closed) = closer();

        let stager = NetInputStager::start(
            Box::new(stream),
            session.clone(),
            events(),
            link,
            on_close,
            NetStagerConfig::default(),
        );
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        assert!(session.all_samples_transferred());
        let mut out = [0.0; 4];
        session.read_buffer(0, &mut out).unwrap();
        assert_eq!(out, [0x0101 as f64, 0x0202 as f64, 0x0303 as f64, 0x0404 as f64]);
        assert!(closed.load(Ordering::SeqCst), "close command not sent");
    }

    #[test]
    fn test_single_timeout_consults_status_poll() {
        let session = raw_session(ScanFunction::AnalogInput, 8, true);
        let (stream, _handle) = MockDataStream::new(vec![
            StreamScript::Data(le_block(&[1])),
            StreamScript::Timeout,
            StreamScript::Data(le_block(&[2])),
            StreamScript::Closed,
        ]);
        // Status poll says the scan is healthy; one timeout survives.
        let link = MonitorLink::new(session.clone(), healthy_poller());
        let (on_close, _closed) = closer();

        let stager = NetInputStager::start(
            Box::new(stream),
            session.clone(),
            events(),
            link,
            on_close,
            NetStagerConfig::default(),
        );
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        // Both samples made it despite the timeout in between; the
        // eventual peer close is what ended the scan.
        assert_eq!(session.transfer_status().current_total_count, 2);
        assert_eq!(session.last_error(), Some(DaqError::Disconnected));
    }

    #[test]
    fn test_two_consecutive_timeouts_prove_device_loss() {
        let session = raw_session(ScanFunction::AnalogInput, 8, true);
        let (stream, _handle) = MockDataStream::new(vec![
            StreamScript::Timeout,
            StreamScript::Timeout,
            StreamScript::Data(le_block(&[1])), // never reached
        ]);
        let link = MonitorLink::new(session.clone(), healthy_poller());
        let (on_close, closed) = closer();

        let stager = NetInputStager::start(
            Box::new(stream),
            session.clone(),
            events(),
            link,
            on_close,
            NetStagerConfig::default(),
        );
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        assert_eq!(session.last_error(), Some(DaqError::Disconnected));
        assert_eq!(session.transfer_status().current_total_count, 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timeout_with_fault_status_ends_scan() {
        let session = raw_session(ScanFunction::AnalogInput, 8, true);
        let (stream, _handle) =
            MockDataStream::new(vec![StreamScript::Timeout, StreamScript::Data(le_block(&[1]))]);
        let poller = Arc::new(ScriptedPoller {
            statuses: Mutex::new(vec![DeviceScanStatus {
                overrun: true,
                running: true,
                ..Default::default()
            }]),
        });
        let link = MonitorLink::new(session.clone(), poller);
        let (on_close, _closed) = closer();

        let stager = NetInputStager::start(
            Box::new(stream),
            session.clone(),
            events(),
            link,
            on_close,
            NetStagerConfig::default(),
        );
        stager.wait_drained(Duration::from_secs(2)).unwrap();
        assert_eq!(session.last_error(), Some(DaqError::Overrun));
    }

    #[test]
    fn test_stop_closes_socket_and_notifies_device() {
        let session = raw_session(ScanFunction::AnalogInput, 8, true);
        let (stream, handle) = MockDataStream::new(vec![]); // reads time out forever
        let link = MonitorLink::new(session.clone(), healthy_poller());
        let (on_close, closed) = closer();

        let stager = NetInputStager::start(
            Box::new(stream),
            session.clone(),
            events(),
            link,
            on_close,
            NetStagerConfig::default(),
        );
        stager.request_stop();
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert!(handle.was_shutdown());
        assert!(session.is_done());
    }

    #[test]
    fn test_output_writes_waveform_and_finishes() {
        let session = raw_session(ScanFunction::AnalogOutput, 4, false);
        session.load_buffer(&[5.0, 6.0, 7.0, 8.0]);
        let (stream, handle) = MockDataStream::new(vec![]);
        let (on_close, closed) = closer();

        let stager = NetOutputStager::start(
            Box::new(stream),
            session.clone(),
            events(),
            on_close,
            NetStagerConfig {
                scratch_size: 4, // two samples per write
            },
        );
        stager.wait_drained(Duration::from_secs(2)).unwrap();

        assert!(session.all_samples_transferred());
        assert_eq!(handle.written(), le_block(&[5, 6, 7, 8]));
        assert!(closed.load(Ordering::SeqCst));
        assert!(handle.was_shutdown());
    }
}
