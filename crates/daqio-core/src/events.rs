//! Event notification subsystem.
//!
//! Callbacks are delivered on a dedicated dispatcher thread so the data
//! path never runs user code. Raising an event takes a short lock to flip
//! the slot's occurred flag and signal the dispatcher; the dispatcher
//! drains every occurred slot under that same short lock, then invokes the
//! callbacks unlocked. No mutual exclusion is promised between a running
//! callback and new events being queued, so callbacks must not assume the
//! table is quiet when they return.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::DaqError;
use crate::session::ScanDirection;

/// Event kinds a device can notify on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaqEventType {
    /// The configured number of new samples is available.
    DataAvailable,
    InputScanError,
    EndOfInputScan,
    OutputScanError,
    EndOfOutputScan,
}

impl DaqEventType {
    pub const ALL: [DaqEventType; 5] = [
        DaqEventType::DataAvailable,
        DaqEventType::InputScanError,
        DaqEventType::EndOfInputScan,
        DaqEventType::OutputScanError,
        DaqEventType::EndOfOutputScan,
    ];

    fn index(self) -> usize {
        match self {
            DaqEventType::DataAvailable => 0,
            DaqEventType::InputScanError => 1,
            DaqEventType::EndOfInputScan => 2,
            DaqEventType::OutputScanError => 3,
            DaqEventType::EndOfOutputScan => 4,
        }
    }

    /// Scan direction this event belongs to. `DataAvailable` rides the
    /// input path.
    pub fn direction(self) -> ScanDirection {
        match self {
            DaqEventType::DataAvailable
            | DaqEventType::InputScanError
            | DaqEventType::EndOfInputScan => ScanDirection::Input,
            DaqEventType::OutputScanError | DaqEventType::EndOfOutputScan => {
                ScanDirection::Output
            }
        }
    }
}

/// Owned callback registered per event kind. Invoked by the dispatcher
/// with the event kind and its data word only; never with access to
/// device internals.
pub type EventCallback = Arc<dyn Fn(DaqEventType, u64) + Send + Sync>;

/// What is currently running, for enable-time validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanActivity {
    pub input_running: bool,
    pub output_running: bool,
}

impl ScanActivity {
    fn running(self, direction: ScanDirection) -> bool {
        match direction {
            ScanDirection::Input => self.input_running,
            ScanDirection::Output => self.output_running,
        }
    }
}

/// Wraparound-safe "count has reached target". Treats differences of less
/// than half the counter range as "at or past", which keeps firing correct
/// across the 2^63 boundary and the full u64 wrap.
fn reached(count: u64, target: u64) -> bool {
    count.wrapping_sub(target) < u64::MAX / 2
}

#[derive(Default)]
struct EventSlot {
    enabled: bool,
    parameter: u64,
    callback: Option<EventCallback>,
    last_data: u64,
    occurred: bool,
    /// Next total-sample count that fires DataAvailable.
    next_target: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DispatcherState {
    Stopped,
    Running,
    StopRequested,
}

struct EventTable {
    slots: [EventSlot; 5],
    any_occurred: bool,
    enabled_count: usize,
    dispatcher: DispatcherState,
}

/// Shared between the registry handle and the dispatcher thread.
struct RegistryShared {
    table: Mutex<EventTable>,
    signal: Condvar,
}

/// Device-wide event table plus its dispatcher thread.
pub struct EventRegistry {
    supported: Vec<DaqEventType>,
    shared: Arc<RegistryShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventRegistry {
    pub fn new(supported: Vec<DaqEventType>) -> Arc<Self> {
        Arc::new(Self {
            supported,
            shared: Arc::new(RegistryShared {
                table: Mutex::new(EventTable {
                    slots: Default::default(),
                    any_occurred: false,
                    enabled_count: 0,
                    dispatcher: DispatcherState::Stopped,
                }),
                signal: Condvar::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Enable one event kind. The dispatcher thread starts lazily on the
    /// first enable.
    pub fn enable(
        &self,
        kind: DaqEventType,
        parameter: u64,
        callback: EventCallback,
        activity: ScanActivity,
    ) -> Result<(), DaqError> {
        if !self.supported.contains(&kind) {
            return Err(DaqError::UnsupportedEvent);
        }
        if kind == DaqEventType::DataAvailable && parameter == 0 {
            return Err(DaqError::BadEventParameter(
                "data-available threshold must be non-zero".into(),
            ));
        }
        if activity.running(kind.direction()) {
            return Err(DaqError::AlreadyRunning);
        }

        let start_worker = {
            let mut table = self.shared.table.lock().unwrap();
            let slot = &mut table.slots[kind.index()];
            if slot.enabled {
                return Err(DaqError::EventAlreadyEnabled);
            }
            slot.enabled = true;
            slot.parameter = parameter;
            slot.callback = Some(callback);
            slot.occurred = false;
            slot.last_data = 0;
            slot.next_target = parameter;
            table.enabled_count += 1;

            let start = table.dispatcher == DispatcherState::Stopped;
            if start {
                table.dispatcher = DispatcherState::Running;
            }
            start
        };

        if start_worker {
            // Reap a previously stopped dispatcher before starting anew.
            if let Some(handle) = self.worker.lock().unwrap().take() {
                let _ = handle.join();
            }
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("daq-event-dispatch".into())
                .spawn(move || dispatch_loop(shared))
                .expect("spawn event dispatcher");
            *self.worker.lock().unwrap() = Some(handle);
            debug!("event dispatcher started");
        }
        Ok(())
    }

    /// Disable one event kind. Stops the dispatcher when nothing remains
    /// enabled.
    pub fn disable(&self, kind: DaqEventType) -> Result<(), DaqError> {
        let stop_worker = {
            let mut table = self.shared.table.lock().unwrap();
            let slot = &mut table.slots[kind.index()];
            if !slot.enabled {
                return Err(DaqError::EventNotEnabled);
            }
            slot.enabled = false;
            slot.callback = None;
            slot.occurred = false;
            table.enabled_count -= 1;

            let stop = table.enabled_count == 0 && table.dispatcher == DispatcherState::Running;
            if stop {
                table.dispatcher = DispatcherState::StopRequested;
                self.shared.signal.notify_all();
            }
            stop
        };

        if stop_worker {
            if let Some(handle) = self.worker.lock().unwrap().take() {
                let _ = handle.join();
            }
            debug!("event dispatcher stopped");
        }
        Ok(())
    }

    /// Disable everything and stop the dispatcher. Safe to call twice.
    pub fn disable_all(&self) {
        for kind in DaqEventType::ALL {
            let _ = self.disable(kind);
        }
    }

    pub fn is_enabled(&self, kind: DaqEventType) -> bool {
        self.shared.table.lock().unwrap().slots[kind.index()].enabled
    }

    /// Reset the data-available target for a fresh scan and clear stale
    /// occurred flags for the scan's direction.
    pub fn begin_scan(&self, direction: ScanDirection) {
        let mut table = self.shared.table.lock().unwrap();
        for kind in DaqEventType::ALL {
            if kind.direction() != direction {
                continue;
            }
            let slot = &mut table.slots[kind.index()];
            slot.occurred = false;
            if kind == DaqEventType::DataAvailable {
                slot.next_target = slot.parameter;
            }
        }
    }

    /// Record an event and wake the dispatcher. Called from the data path
    /// or the monitor thread; holds the table lock only long enough to
    /// flip the flags.
    pub fn raise(&self, kind: DaqEventType, data: u64) {
        let mut table = self.shared.table.lock().unwrap();
        let slot = &mut table.slots[kind.index()];
        if !slot.enabled {
            return;
        }
        slot.occurred = true;
        slot.last_data = data;
        table.any_occurred = true;
        self.shared.signal.notify_all();
    }

    /// Data-available firing check against the running total. Fires when
    /// the total reaches the next target (wraparound-safe), then advances
    /// the target by the threshold. A burst that crosses several targets
    /// coalesces into one delivery carrying the latest total.
    pub fn on_samples(&self, total: u64) {
        let mut table = self.shared.table.lock().unwrap();
        let slot = &mut table.slots[DaqEventType::DataAvailable.index()];
        if !slot.enabled || !reached(total, slot.next_target) {
            return;
        }
        slot.occurred = true;
        slot.last_data = total;
        while reached(total, slot.next_target) {
            slot.next_target = slot.next_target.wrapping_add(slot.parameter);
        }
        table.any_occurred = true;
        self.shared.signal.notify_all();
    }
}

impl Drop for EventRegistry {
    fn drop(&mut self) {
        // Stop a dispatcher the owner forgot to disable so the thread does
        // not outlive the registry.
        {
            let mut table = self.shared.table.lock().unwrap();
            if table.dispatcher == DispatcherState::Running {
                table.dispatcher = DispatcherState::StopRequested;
                self.shared.signal.notify_all();
            }
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

fn dispatch_loop(shared: Arc<RegistryShared>) {
    loop {
        let fired: Vec<(DaqEventType, u64, EventCallback)> = {
            let mut table = shared.table.lock().unwrap();
            table = shared
                .signal
                .wait_while(table, |t| {
                    !t.any_occurred && t.dispatcher == DispatcherState::Running
                })
                .unwrap();
            if table.dispatcher != DispatcherState::Running {
                table.dispatcher = DispatcherState::Stopped;
                return;
            }

            // Drain: copy out and clear each occurred flag atomically with
            // respect to raisers, still under the short lock.
            let mut fired = Vec::new();
            for kind in DaqEventType::ALL {
                let slot = &mut table.slots[kind.index()];
                if slot.enabled && slot.occurred {
                    slot.occurred = false;
                    if let Some(cb) = slot.callback.clone() {
                        fired.push((kind, slot.last_data, cb));
                    }
                }
            }
            table.any_occurred = false;
            fired
        };

        // Callbacks run unlocked, sequentially, in drain order.
        for (kind, data, callback) in fired {
            callback(kind, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn registry() -> Arc<EventRegistry> {
        EventRegistry::new(DaqEventType::ALL.to_vec())
    }

    fn counter_callback(counter: Arc<AtomicU64>) -> EventCallback {
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_for(counter: &AtomicU64, expected: u64) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!(
            "callback count stuck at {} (wanted {expected})",
            counter.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_enable_validation() {
        let reg = registry();
        let cb: EventCallback = Arc::new(|_, _| {});

        assert_eq!(
            reg.enable(DaqEventType::DataAvailable, 0, cb.clone(), ScanActivity::default()),
            Err(DaqError::BadEventParameter(
                "data-available threshold must be non-zero".into()
            ))
        );

        let busy = ScanActivity {
            input_running: true,
            output_running: false,
        };
        assert_eq!(
            reg.enable(DaqEventType::EndOfInputScan, 0, cb.clone(), busy),
            Err(DaqError::AlreadyRunning)
        );

        reg.enable(DaqEventType::EndOfInputScan, 0, cb.clone(), ScanActivity::default())
            .unwrap();
        assert_eq!(
            reg.enable(DaqEventType::EndOfInputScan, 0, cb, ScanActivity::default()),
            Err(DaqError::EventAlreadyEnabled)
        );
        reg.disable_all();
    }

    #[test]
    fn test_unsupported_event() {
        let reg = EventRegistry::new(vec![DaqEventType::EndOfInputScan]);
        let cb: EventCallback = Arc::new(|_, _| {});
        assert_eq!(
            reg.enable(DaqEventType::DataAvailable, 10, cb, ScanActivity::default()),
            Err(DaqError::UnsupportedEvent)
        );
    }

    #[test]
    fn test_raise_delivers_on_dispatcher_thread() {
        let reg = registry();
        let count = Arc::new(AtomicU64::new(0));
        reg.enable(
            DaqEventType::InputScanError,
            0,
            counter_callback(count.clone()),
            ScanActivity::default(),
        )
        .unwrap();

        reg.raise(DaqEventType::InputScanError, 42);
        wait_for(&count, 1);
        reg.disable_all();
    }

    #[test]
    fn test_data_available_fires_once_per_threshold() {
        let reg = registry();
        let count = Arc::new(AtomicU64::new(0));
        reg.enable(
            DaqEventType::DataAvailable,
            1000,
            counter_callback(count.clone()),
            ScanActivity::default(),
        )
        .unwrap();
        reg.begin_scan(ScanDirection::Input);

        reg.on_samples(0);
        reg.on_samples(500);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        reg.on_samples(1000);
        wait_for(&count, 1);

        // Target advanced to 2000; 1500 must not fire again.
        reg.on_samples(1500);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        reg.on_samples(2000);
        wait_for(&count, 2);
        reg.disable_all();
    }

    #[test]
    fn test_data_available_across_counter_wrap() {
        // Pure predicate checks at the wrap boundaries.
        assert!(reached(1000, 1000));
        assert!(reached(1 << 63, (1 << 63) - 1));
        assert!(!reached((1 << 63) - 1, 1 << 63));
        // Count just past a target that wrapped through zero.
        assert!(reached(5, u64::MAX.wrapping_add(6)));
        // Count far behind a small post-wrap target.
        assert!(!reached(u64::MAX - 10, 5));
    }

    #[test]
    fn test_firing_cadence_survives_u64_wrap() {
        let reg = registry();
        let count = Arc::new(AtomicU64::new(0));
        reg.enable(
            DaqEventType::DataAvailable,
            1000,
            counter_callback(count.clone()),
            ScanActivity::default(),
        )
        .unwrap();
        // Park the target just below the wrap point.
        {
            let mut table = reg.shared.table.lock().unwrap();
            table.slots[DaqEventType::DataAvailable.index()].next_target = u64::MAX - 500;
        }

        reg.on_samples(u64::MAX - 600); // behind target: no fire
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        reg.on_samples(u64::MAX - 400); // reached: fires, target wraps to 499
        wait_for(&count, 1);

        reg.on_samples(100); // past the wrap but short of 499
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        reg.on_samples(499);
        wait_for(&count, 2);
        reg.disable_all();
    }

    #[test]
    fn test_burst_coalesces_but_keeps_cadence() {
        let reg = registry();
        let count = Arc::new(AtomicU64::new(0));
        reg.enable(
            DaqEventType::DataAvailable,
            100,
            counter_callback(count.clone()),
            ScanActivity::default(),
        )
        .unwrap();
        reg.begin_scan(ScanDirection::Input);

        // One completion jumps past three targets: one coalesced delivery,
        // target parked beyond the count.
        reg.on_samples(350);
        wait_for(&count, 1);
        reg.on_samples(399);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        reg.on_samples(400);
        wait_for(&count, 2);
        reg.disable_all();
    }

    #[test]
    fn test_dispatcher_stops_with_last_disable() {
        let reg = registry();
        let cb: EventCallback = Arc::new(|_, _| {});
        reg.enable(DaqEventType::EndOfInputScan, 0, cb.clone(), ScanActivity::default())
            .unwrap();
        reg.enable(DaqEventType::EndOfOutputScan, 0, cb, ScanActivity::default())
            .unwrap();

        reg.disable(DaqEventType::EndOfInputScan).unwrap();
        assert!(reg.worker.lock().unwrap().is_some());
        reg.disable(DaqEventType::EndOfOutputScan).unwrap();
        assert!(reg.worker.lock().unwrap().is_none());
    }
}
