//! Scan health monitor.
//!
//! A per-scan thread that rides alongside the transfer path. It wakes on
//! every "data arrived" signal; when the signal goes quiet for longer than
//! the expected delivery interval it polls the device status register,
//! because FIFO faults (overrun, underrun, pacer faults) are visible only
//! there, never in the data itself. On a fault it raises the matching
//! scan-error event, tells the stager to terminate, and idles the session
//! with the error remembered for the next status query.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::{DeviceScanStatus, StatusPoller};
use crate::error::DaqError;
use crate::events::{DaqEventType, EventRegistry};
use crate::session::{ScanDirection, ScanSession};
use crate::stager::StopFlag;

/// Terminal state of a monitor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    ErrorDetected,
    NormalCompletion,
}

/// Verdict after a device status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorVerdict {
    Continue,
    Fatal(DaqError),
}

/// Map a status register snapshot to the fault it reports for a scan
/// direction, if any.
pub fn classify_status(status: DeviceScanStatus, direction: ScanDirection) -> Option<DaqError> {
    if status.pacer_fault {
        return Some(DaqError::PacerOverrun);
    }
    match direction {
        ScanDirection::Input if status.overrun => Some(DaqError::Overrun),
        ScanDirection::Output if status.underrun => Some(DaqError::Underrun),
        _ => None,
    }
}

/// Event kind and data word used to report a scan error.
fn error_event(direction: ScanDirection) -> DaqEventType {
    match direction {
        ScanDirection::Input => DaqEventType::InputScanError,
        ScanDirection::Output => DaqEventType::OutputScanError,
    }
}

fn error_code(err: &DaqError) -> u64 {
    match err {
        DaqError::Overrun => 1,
        DaqError::Underrun => 2,
        DaqError::PacerOverrun => 3,
        DaqError::Disconnected | DaqError::Transport(_) => 4,
        _ => 0,
    }
}

/// Shared view of the monitor the network stager consults after a data
/// socket timeout: one quiet read window is not proof of device loss, a
/// status poll (or a second consecutive timeout) is.
#[derive(Clone)]
pub struct MonitorLink {
    session: Arc<ScanSession>,
    poller: Arc<dyn StatusPoller>,
}

impl MonitorLink {
    pub fn new(session: Arc<ScanSession>, poller: Arc<dyn StatusPoller>) -> Self {
        Self { session, poller }
    }

    /// Poll the device status register and classify the outcome for this
    /// session's direction. A timed-out poll is inconclusive; any other
    /// failure to read the register means the device is gone.
    pub fn poll_device(&self) -> MonitorVerdict {
        match self.poller.scan_status(self.session.direction()) {
            Ok(status) => match classify_status(status, self.session.direction()) {
                Some(fault) => MonitorVerdict::Fatal(fault),
                None => MonitorVerdict::Continue,
            },
            Err(DaqError::Timeout) => MonitorVerdict::Continue,
            Err(err) => {
                warn!(error = %err, "status poll failed");
                MonitorVerdict::Fatal(DaqError::Disconnected)
            }
        }
    }
}

/// Monitor timing knobs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long to wait for a data-arrived signal before polling status.
    pub wait_timeout: Duration,
    /// Bounded wait for the stager to drain after a forced termination.
    pub drain_timeout: Duration,
    /// Refresh auxiliary counters every this many wakeups.
    pub aux_period: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(5),
            aux_period: 10,
        }
    }
}

/// Handle to a running monitor thread.
pub struct ScanMonitor {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<MonitorState>>,
}

impl ScanMonitor {
    /// Spawn the monitor thread for one scan.
    pub fn spawn(
        session: Arc<ScanSession>,
        poller: Arc<dyn StatusPoller>,
        events: Arc<EventRegistry>,
        stop: StopFlag,
        config: MonitorConfig,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name("daq-scan-monitor".into())
            .spawn(move || run_monitor(session, poller, events, stop, config, shutdown_flag))
            .expect("spawn scan monitor");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Ask the thread to exit and join it. Returns the terminal state.
    pub fn shutdown(&mut self) -> MonitorState {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(MonitorState::ErrorDetected),
            None => MonitorState::NormalCompletion,
        }
    }
}

impl Drop for ScanMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_monitor(
    session: Arc<ScanSession>,
    poller: Arc<dyn StatusPoller>,
    events: Arc<EventRegistry>,
    stop: StopFlag,
    config: MonitorConfig,
    shutdown: Arc<AtomicBool>,
) -> MonitorState {
    let direction = session.direction();
    let link = MonitorLink::new(session.clone(), poller.clone());
    let mut wakeups = 0u32;

    let state = loop {
        if shutdown.load(Ordering::SeqCst) || session.is_done() {
            break if session.last_error().is_some() {
                MonitorState::ErrorDetected
            } else {
                MonitorState::NormalCompletion
            };
        }

        let arrived = session.wait_data_arrived(config.wait_timeout);
        wakeups += 1;

        // Finite scan ran out on its own: force the logical stop. No new
        // data is involved; the stager drains its pool and idles the
        // session.
        if session.finished_without_stop() {
            debug!("finite scan exhausted, forcing logical stop");
            stop.request();
            let _ = session.wait_done(Some(config.drain_timeout));
            session.mark_idle();
            break MonitorState::NormalCompletion;
        }

        // The data path records transport faults; it never raises events
        // itself. Surface them from here.
        if let Some(err) = session.last_error() {
            events.raise(error_event(direction), error_code(&err));
            stop.request();
            let _ = session.wait_done(Some(config.drain_timeout));
            session.mark_idle();
            break MonitorState::ErrorDetected;
        }

        if !arrived {
            // No data inside the expected interval: only the status
            // register can say whether the scan is merely slow or faulted.
            match link.poll_device() {
                MonitorVerdict::Continue => {}
                MonitorVerdict::Fatal(fault) => {
                    warn!(error = %fault, "device fault detected by status poll");
                    session.record_error(fault.clone());
                    events.raise(error_event(direction), error_code(&fault));
                    stop.request();
                    let _ = session.wait_done(Some(config.drain_timeout));
                    session.mark_idle();
                    break MonitorState::ErrorDetected;
                }
            }
        }

        if wakeups % config.aux_period == 0 {
            let _ = poller.aux_counters();
        }
    };

    // Whatever path ended the run, wait-until-done callers must unblock.
    session.mark_idle();
    debug!(state = ?state, "monitor finished");
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{BoundCoef, CalCoef, CustomScale};
    use crate::session::{ScanFlags, ScanFunction, ScanOptions, SessionParams};
    use std::sync::Mutex;

    struct ScriptedPoller {
        statuses: Mutex<Vec<Result<DeviceScanStatus, DaqError>>>,
        aux_polls: Mutex<u32>,
    }

    impl ScriptedPoller {
        fn new(statuses: Vec<Result<DeviceScanStatus, DaqError>>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                aux_polls: Mutex::new(0),
            }
        }
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
                statuses.remove(0)
            }
        }

        fn aux_counters(&self) -> Result<(), DaqError> {
            *self.aux_polls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn test_session(continuous: bool) -> Arc<ScanSession> {
        let options = if continuous {
            ScanOptions::CONTINUOUS
        } else {
            ScanOptions::NONE
        };
        Arc::new(
            ScanSession::new(SessionParams {
                function: ScanFunction::AnalogInput,
                chan_count: 1,
                samples_per_channel: 4,
                sample_width: 2,
                options,
                flags: ScanFlags::NO_SCALE | ScanFlags::NO_CALIBRATE,
                coefs: vec![BoundCoef {
                    cal: CalCoef::IDENTITY,
                    custom: CustomScale::IDENTITY,
                    max_code: u64::MAX,
                    code_domain: false,
                }],
                buffer_capacity: 4,
            })
            .unwrap(),
        )
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            wait_timeout: Duration::from_millis(20),
            drain_timeout: Duration::from_millis(50),
            aux_period: 2,
        }
    }

    #[test]
    fn test_classify_status_by_direction() {
        let overrun = DeviceScanStatus {
            overrun: true,
            ..Default::default()
        };
        assert_eq!(
            classify_status(overrun, ScanDirection::Input),
            Some(DaqError::Overrun)
        );
        assert_eq!(classify_status(overrun, ScanDirection::Output), None);

        let pacer = DeviceScanStatus {
            pacer_fault: true,
            ..Default::default()
        };
        assert_eq!(
            classify_status(pacer, ScanDirection::Output),
            Some(DaqError::PacerOverrun)
        );
    }

    #[test]
    fn test_monitor_detects_overrun_on_quiet_timeout() {
        let session = test_session(true);
        let poller = Arc::new(ScriptedPoller::new(vec![Ok(DeviceScanStatus {
            overrun: true,
            running: true,
            ..Default::default()
        })]));
        let events = EventRegistry::new(DaqEventType::ALL.to_vec());
        let stop = StopFlag::new();

        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poller,
            events,
            stop.clone(),
            fast_config(),
        );

        // No data ever arrives; the first quiet window polls and faults.
        session.wait_done(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(session.last_error(), Some(DaqError::Overrun));
        assert!(stop.is_requested());
        assert_eq!(monitor.shutdown(), MonitorState::ErrorDetected);
    }

    #[test]
    fn test_monitor_forces_stop_when_finite_exhausts() {
        let session = test_session(false);
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let events = EventRegistry::new(DaqEventType::ALL.to_vec());
        let stop = StopFlag::new();

        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poller,
            events,
            stop.clone(),
            fast_config(),
        );

        // Deliver exactly the finite scan's samples.
        session.process_input(&[1, 2, 3, 4]).unwrap();
        session.wait_done(Some(Duration::from_secs(2))).unwrap();
        assert!(stop.is_requested());
        assert_eq!(session.last_error(), None);
        assert_eq!(monitor.shutdown(), MonitorState::NormalCompletion);
    }

    #[test]
    fn test_monitor_surfaces_data_path_error_as_event() {
        let session = test_session(true);
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let events = EventRegistry::new(DaqEventType::ALL.to_vec());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        events
            .enable(
                DaqEventType::InputScanError,
                0,
                Arc::new(move |kind, data| {
                    fired_clone.lock().unwrap().push((kind, data));
                }),
                Default::default(),
            )
            .unwrap();

        let stop = StopFlag::new();
        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poller,
            events.clone(),
            stop,
            fast_config(),
        );

        session.record_error(DaqError::Disconnected);
        session.wait_done(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(monitor.shutdown(), MonitorState::ErrorDetected);

        // Event lands on the dispatcher thread shortly after.
        for _ in 0..100 {
            if !fired.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            fired.lock().unwrap().first(),
            Some(&(DaqEventType::InputScanError, 4))
        );
        events.disable_all();
    }

    #[test]
    fn test_monitor_polls_aux_counters_periodically() {
        let session = test_session(true);
        let poller = Arc::new(ScriptedPoller::new(vec![]));
        let events = EventRegistry::new(DaqEventType::ALL.to_vec());
        let stop = StopFlag::new();

        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poller.clone(),
            events,
            stop,
            fast_config(),
        );

        // Keep the session alive through several wakeups.
        for i in 0..6 {
            session.process_input(&[i]).unwrap();
            thread::sleep(Duration::from_millis(25));
        }
        monitor.shutdown();
        assert!(*poller.aux_polls.lock().unwrap() >= 1);
        session.mark_idle();
    }
}
