//! Scan arming, validation, and control.
//!
//! Everything here runs on the calling thread before any I/O: argument
//! validation fails fast with a structured error, the pacer divisor math
//! yields the actual rate returned to the caller, and only then are the
//! session, stager, and monitor brought up. `ScanController` is the
//! per-function handle the capability traits hand out; stopping it runs
//! the full three-phase teardown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::calibration::{CalTable, CustomScale, Range, bind_scan_coefs};
use crate::device::{Connection, ScanCaps, StatusPoller};
use crate::error::DaqError;
use crate::events::EventRegistry;
use crate::monitor::{MonitorConfig, ScanMonitor};
use crate::session::{
    ScanFlags, ScanFunction, ScanOptions, ScanSession, ScanState, SessionParams, TransferStatus,
};
use crate::stager::net::DataSocketCloser;
use crate::stager::{
    NetInputStager, NetOutputStager, NetStagerConfig, ScanStager, UsbInputStager, UsbOutputStager,
    UsbStagerConfig, stage_size,
};
use crate::transport::{DataStream, StreamPipe};

/// Bounded wait for the stop sequence's drain phase.
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Analog input wiring mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    SingleEnded,
    Differential,
}

/// One entry of the active channel list.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub channel: u8,
    pub range: Range,
    pub mode: InputMode,
}

impl ChannelSpec {
    pub fn new(channel: u8, range: Range) -> Self {
        Self {
            channel,
            range,
            mode: InputMode::SingleEnded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    RisingEdge,
    FallingEdge,
    AboveLevel,
    BelowLevel,
}

/// Trigger setup, fixed before arming and read-only during the scan.
#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    pub trigger_type: TriggerType,
    pub channel: u8,
    pub level: f64,
    /// Hysteresis window around the level.
    pub variance: f64,
    pub retrigger_count: u32,
}

/// Everything a caller specifies when arming a scan.
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub channels: Vec<ChannelSpec>,
    pub samples_per_channel: usize,
    pub rate: f64,
    pub options: ScanOptions,
    pub flags: ScanFlags,
    pub trigger: Option<TriggerConfig>,
}

/// Argument validation, run before any I/O. Order and coverage follow the
/// fail-fast contract: channel list, ranges, option/flag support, rate
/// window, sample count, buffer shape, trigger sanity.
pub fn validate_scan(
    caps: &ScanCaps,
    params: &ScanParams,
    buffer_capacity: usize,
) -> Result<(), DaqError> {
    if params.channels.is_empty() {
        return Err(DaqError::BadChannelList("empty channel list".into()));
    }
    let mut seen = [false; 256];
    for spec in &params.channels {
        if spec.channel >= caps.channel_count {
            return Err(DaqError::BadChannel {
                channel: spec.channel,
                available: caps.channel_count,
            });
        }
        if seen[spec.channel as usize] {
            return Err(DaqError::BadChannelList(format!(
                "channel {} listed twice",
                spec.channel
            )));
        }
        seen[spec.channel as usize] = true;
        if !caps.ranges.contains(&spec.range) {
            return Err(DaqError::BadRange {
                min: spec.range.min,
                max: spec.range.max,
            });
        }
    }

    if !params.options.is_subset_of(caps.options) {
        return Err(DaqError::BadOption(format!(
            "option bits 0x{:X} not supported",
            params.options.bits() & !caps.options.bits()
        )));
    }
    if params.options.contains(ScanOptions::BURST | ScanOptions::EXT_CLOCK) {
        return Err(DaqError::BadOption(
            "burst pacing cannot ride the external clock".into(),
        ));
    }
    if !params.flags.is_subset_of(caps.flags) {
        return Err(DaqError::BadFlag(format!(
            "flag bits 0x{:X} not supported",
            params.flags.bits() & !caps.flags.bits()
        )));
    }

    let chans = params.channels.len();
    if !params.options.contains(ScanOptions::EXT_CLOCK) {
        let max = caps.max_rate_for(chans);
        if params.rate < caps.min_rate || params.rate > max {
            return Err(DaqError::BadRate {
                requested: params.rate,
                min: caps.min_rate,
                max,
                channels: chans,
            });
        }
    }

    if params.samples_per_channel < caps.min_samples {
        return Err(DaqError::BadSampleCount {
            requested: params.samples_per_channel,
            minimum: caps.min_samples,
        });
    }

    if buffer_capacity == 0 || buffer_capacity % chans != 0 {
        return Err(DaqError::BadBuffer);
    }
    if !params.options.contains(ScanOptions::CONTINUOUS)
        && buffer_capacity < params.samples_per_channel * chans
    {
        return Err(DaqError::BadBuffer);
    }

    if let Some(trigger) = &params.trigger {
        if trigger.channel >= caps.channel_count {
            return Err(DaqError::BadTrigger(format!(
                "trigger channel {} out of range",
                trigger.channel
            )));
        }
        if !trigger.level.is_finite() || trigger.variance < 0.0 {
            return Err(DaqError::BadTrigger("level or variance out of range".into()));
        }
        if trigger.retrigger_count > 0 && !params.options.contains(ScanOptions::RETRIGGER) {
            return Err(DaqError::BadTrigger(
                "retrigger count set without the retrigger option".into(),
            ));
        }
    }

    Ok(())
}

/// Achievable pacer rate: the device divides its clock by an integer, so
/// the granted rate is the nearest divisor below the clock ceiling.
pub fn actual_scan_rate(caps: &ScanCaps, params: &ScanParams) -> f64 {
    if params.options.contains(ScanOptions::EXT_CLOCK) {
        // Externally paced; the caller's figure is nominal.
        return params.rate;
    }
    let divisor = (caps.clock_freq / params.rate).round().max(1.0);
    caps.clock_freq / divisor
}

/// Monitor wait window derived from the delivery cadence: several stages'
/// worth of samples, clamped to something humane.
fn monitor_interval(rate: f64, chans: usize, width: usize) -> Duration {
    let bytes_per_sec = (rate * chans as f64 * width as f64).max(1.0);
    let stage = stage_size(rate, chans, width) as f64;
    let secs = (stage / bytes_per_sec * 4.0).clamp(0.1, 2.0);
    Duration::from_secs_f64(secs)
}

/// Refuse to arm while a scan of the same function is still running.
pub fn ensure_can_arm(previous: Option<&ScanController>) -> Result<(), DaqError> {
    match previous {
        Some(prev) if !prev.session.is_done() => Err(DaqError::AlreadyRunning),
        _ => Ok(()),
    }
}

/// Ingredients shared by every arm variant.
pub struct ArmContext<'a> {
    pub caps: &'a ScanCaps,
    pub cal: &'a CalTable,
    pub customs: &'a [CustomScale],
    pub connection: &'a dyn Connection,
    pub poller: Arc<dyn StatusPoller>,
    pub events: Arc<EventRegistry>,
}

/// Handle to one armed scan: the session, its stager, and its monitor.
pub struct ScanController {
    session: Arc<ScanSession>,
    stager: Box<dyn ScanStager>,
    monitor: Option<ScanMonitor>,
    actual_rate: f64,
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("session", &self.session)
            .field("actual_rate", &self.actual_rate)
            .finish_non_exhaustive()
    }
}

impl ScanController {
    /// Arm an input scan over the USB streaming endpoint.
    #[instrument(skip_all, fields(function = ?function, channels = params.channels.len(), rate = params.rate))]
    pub fn arm_usb_input(
        function: ScanFunction,
        pipe: Box<dyn StreamPipe>,
        ctx: ArmContext<'_>,
        params: ScanParams,
        buffer_capacity: usize,
    ) -> Result<Self, DaqError> {
        let (session, actual_rate) = prepare(function, &ctx, &params, buffer_capacity)?;

        let usb_config = UsbStagerConfig {
            stage_size: stage_size(actual_rate, params.channels.len(), ctx.caps.sample_width),
            ..UsbStagerConfig::default()
        };
        ctx.events.begin_scan(function.direction());
        let stager = UsbInputStager::start(
            pipe,
            session.clone(),
            ctx.events.clone(),
            usb_config,
        );
        Ok(Self::with_monitor(session, Box::new(stager), ctx, &params, actual_rate))
    }

    /// Arm an output scan over the USB streaming endpoint. The waveform is
    /// loaded into the buffer before the pool is primed.
    #[instrument(skip_all, fields(function = ?function, channels = params.channels.len(), rate = params.rate))]
    pub fn arm_usb_output(
        function: ScanFunction,
        pipe: Box<dyn StreamPipe>,
        ctx: ArmContext<'_>,
        params: ScanParams,
        waveform: &[f64],
    ) -> Result<Self, DaqError> {
        let (session, actual_rate) = prepare(function, &ctx, &params, waveform.len())?;
        session.load_buffer(waveform);

        let usb_config = UsbStagerConfig {
            stage_size: stage_size(actual_rate, params.channels.len(), ctx.caps.sample_width),
            ..UsbStagerConfig::default()
        };
        ctx.events.begin_scan(function.direction());
        let stager = UsbOutputStager::start(
            pipe,
            session.clone(),
            ctx.events.clone(),
            usb_config,
        );
        Ok(Self::with_monitor(session, Box::new(stager), ctx, &params, actual_rate))
    }

    /// Arm an input scan over the network data socket.
    #[instrument(skip_all, fields(function = ?function, channels = params.channels.len(), rate = params.rate))]
    pub fn arm_net_input(
        function: ScanFunction,
        stream: Box<dyn DataStream>,
        on_close: DataSocketCloser,
        ctx: ArmContext<'_>,
        params: ScanParams,
        buffer_capacity: usize,
    ) -> Result<Self, DaqError> {
        let (session, actual_rate) = prepare(function, &ctx, &params, buffer_capacity)?;

        ctx.events.begin_scan(function.direction());
        let link = crate::monitor::MonitorLink::new(session.clone(), ctx.poller.clone());
        let stager = NetInputStager::start(
            stream,
            session.clone(),
            ctx.events.clone(),
            link,
            on_close,
            NetStagerConfig::default(),
        );
        Ok(Self::with_monitor(session, Box::new(stager), ctx, &params, actual_rate))
    }

    /// Arm an output scan over the network data socket.
    #[instrument(skip_all, fields(function = ?function, channels = params.channels.len(), rate = params.rate))]
    pub fn arm_net_output(
        function: ScanFunction,
        stream: Box<dyn DataStream>,
        on_close: DataSocketCloser,
        ctx: ArmContext<'_>,
        params: ScanParams,
        waveform: &[f64],
    ) -> Result<Self, DaqError> {
        let (session, actual_rate) = prepare(function, &ctx, &params, waveform.len())?;
        session.load_buffer(waveform);

        ctx.events.begin_scan(function.direction());
        let stager = NetOutputStager::start(
            stream,
            session.clone(),
            ctx.events.clone(),
            on_close,
            NetStagerConfig::default(),
        );
        Ok(Self::with_monitor(session, Box::new(stager), ctx, &params, actual_rate))
    }

    fn with_monitor(
        session: Arc<ScanSession>,
        stager: Box<dyn ScanStager>,
        ctx: ArmContext<'_>,
        params: &ScanParams,
        actual_rate: f64,
    ) -> Self {
        let monitor_config = MonitorConfig {
            wait_timeout: monitor_interval(
                actual_rate,
                params.channels.len(),
                ctx.caps.sample_width,
            ),
            ..MonitorConfig::default()
        };
        let monitor = ScanMonitor::spawn(
            session.clone(),
            ctx.poller,
            ctx.events,
            stager.stop_flag(),
            monitor_config,
        );
        info!(actual_rate, "scan armed");
        Self {
            session,
            stager,
            monitor: Some(monitor),
            actual_rate,
        }
    }

    /// Pacer rate actually granted.
    pub fn actual_rate(&self) -> f64 {
        self.actual_rate
    }

    pub fn session(&self) -> &Arc<ScanSession> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        !self.session.is_done()
    }

    /// Status query: never blocks on the data path, always answers even
    /// for a finished or errored scan.
    pub fn status(&self) -> (ScanState, Option<DaqError>, TransferStatus) {
        let (state, error) = self.session.status();
        (state, error, self.session.transfer_status())
    }

    /// Three-phase stop: flag, cancel/drain, then idle. Idempotent; safe
    /// to call on an already-idle scan.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Result<(), DaqError> {
        if !self.session.is_done() {
            self.stager.request_stop();
            self.stager.wait_drained(STOP_DRAIN_TIMEOUT)?;
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.shutdown();
        }
        self.session.mark_idle();
        Ok(())
    }

    /// Block until the scan finishes. Negative timeout waits indefinitely;
    /// zero or positive is a bounded wait that returns `Timeout` on
    /// expiry.
    pub fn wait_until_done(&self, timeout_secs: f64) -> Result<(), DaqError> {
        let timeout = if timeout_secs < 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(timeout_secs))
        };
        self.session.wait_done(timeout)
    }
}

/// Shared arm path: connection check, validation, coefficient binding,
/// session construction. No I/O has happened when this returns.
fn prepare(
    function: ScanFunction,
    ctx: &ArmContext<'_>,
    params: &ScanParams,
    buffer_capacity: usize,
) -> Result<(Arc<ScanSession>, f64), DaqError> {
    if !ctx.connection.is_connected() {
        return Err(DaqError::NotConnected);
    }
    validate_scan(ctx.caps, params, buffer_capacity)?;

    let channel_ranges: Vec<(u8, Range)> = params
        .channels
        .iter()
        .map(|c| (c.channel, c.range))
        .collect();
    let coefs = bind_scan_coefs(
        ctx.cal,
        &channel_ranges,
        ctx.customs,
        ctx.caps.resolution,
        params.flags.contains(ScanFlags::NO_CALIBRATE),
        params.flags.contains(ScanFlags::NO_SCALE),
    )?;

    let chans = params.channels.len();
    let capacity = if params.options.contains(ScanOptions::CONTINUOUS) {
        buffer_capacity
    } else {
        params.samples_per_channel * chans
    };

    let session = Arc::new(ScanSession::new(SessionParams {
        function,
        chan_count: chans,
        samples_per_channel: params.samples_per_channel,
        sample_width: ctx.caps.sample_width,
        options: params.options,
        flags: params.flags,
        coefs,
        buffer_capacity: capacity,
    })?);

    Ok((session, actual_scan_rate(ctx.caps, params)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalCoef;
    use crate::device::DeviceScanStatus;
    use crate::events::DaqEventType;
    use crate::session::ScanDirection;
    use crate::transport::{MockInputPipe, PipeScript, TransportError};

    struct FakeConnection {
        connected: bool,
    }

    impl Connection for FakeConnection {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn check_connection(&self) -> Result<(), TransportError> {
            if self.connected {
                Ok(())
            } else {
                Err(TransportError::DeviceNotFound)
            }
        }
    }

    struct HealthyPoller;

    impl StatusPoller for HealthyPoller {
        fn scan_status(&self, _direction: ScanDirection) -> Result<DeviceScanStatus, DaqError> {
            Ok(DeviceScanStatus {
                running: true,
                ..Default::default()
            })
        }
    }

    fn caps() -> ScanCaps {
        ScanCaps {
            channel_count: 8,
            resolution: 16,
            sample_width: 2,
            min_rate: 1.0,
            max_rate: 100_000.0,
            max_throughput: 400_000.0,
            min_samples: 2,
            clock_freq: 40_000_000.0,
            options: ScanOptions::CONTINUOUS | ScanOptions::BURST | ScanOptions::RETRIGGER,
            flags: ScanFlags::NO_SCALE | ScanFlags::NO_CALIBRATE,
            ranges: vec![Range::BIP10V, Range::BIP5V],
            events: DaqEventType::ALL.to_vec(),
        }
    }

    fn cal_table() -> CalTable {
        CalTable::new(vec![CalCoef::IDENTITY; 8])
    }

    fn base_params(chans: usize) -> ScanParams {
        ScanParams {
            channels: (0..chans as u8)
                .map(|c| ChannelSpec::new(c, Range::BIP10V))
                .collect(),
            samples_per_channel: 16,
            rate: 1000.0,
            options: ScanOptions::NONE,
            flags: ScanFlags::NONE,
            trigger: None,
        }
    }

    #[test]
    fn test_validate_rejects_bad_channel() {
        let caps = caps();
        let mut params = base_params(1);
        params.channels[0].channel = 12;
        assert_eq!(
            validate_scan(&caps, &params, 16),
            Err(DaqError::BadChannel {
                channel: 12,
                available: 8
            })
        );
    }

    #[test]
    fn test_validate_rejects_bad_range() {
        let caps = caps();
        let mut params = base_params(1);
        params.channels[0].range = Range { min: -2.5, max: 2.5 };
        assert!(matches!(
            validate_scan(&caps, &params, 16),
            Err(DaqError::BadRange { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_rate_for_channel_count() {
        let caps = caps();
        let mut params = base_params(8);
        params.rate = 60_000.0; // above 400k/8
        let err = validate_scan(&caps, &params, 8 * 16).unwrap_err();
        assert!(matches!(err, DaqError::BadRate { max, .. } if max == 50_000.0));
    }

    #[test]
    fn test_validate_rejects_unsupported_option() {
        let caps = caps();
        let mut params = base_params(1);
        params.options = ScanOptions::EXT_CLOCK; // not in caps
        assert!(matches!(
            validate_scan(&caps, &params, 16),
            Err(DaqError::BadOption(_))
        ));
    }

    #[test]
    fn test_validate_rejects_small_sample_count_and_buffer() {
        let caps = caps();
        let mut params = base_params(2);
        params.samples_per_channel = 1;
        assert_eq!(
            validate_scan(&caps, &params, 32),
            Err(DaqError::BadSampleCount {
                requested: 1,
                minimum: 2
            })
        );

        let params = base_params(2);
        assert_eq!(validate_scan(&caps, &params, 0), Err(DaqError::BadBuffer));
        assert_eq!(validate_scan(&caps, &params, 31), Err(DaqError::BadBuffer));
        // Finite scan needs room for all samples.
        assert_eq!(validate_scan(&caps, &params, 16), Err(DaqError::BadBuffer));
        assert!(validate_scan(&caps, &params, 32).is_ok());
    }

    #[test]
    fn test_validate_trigger() {
        let caps = caps();
        let mut params = base_params(1);
        params.trigger = Some(TriggerConfig {
            trigger_type: TriggerType::RisingEdge,
            channel: 0,
            level: 1.0,
            variance: 0.0,
            retrigger_count: 4, // without the retrigger option
        });
        assert!(matches!(
            validate_scan(&caps, &params, 16),
            Err(DaqError::BadTrigger(_))
        ));

        params.options = ScanOptions::RETRIGGER;
        assert!(validate_scan(&caps, &params, 16).is_ok());
    }

    #[test]
    fn test_actual_rate_follows_clock_divisor() {
        let caps = caps();
        let mut params = base_params(1);
        params.rate = 3000.0;
        let actual = actual_scan_rate(&caps, &params);
        // 40 MHz / round(40e6/3000) = 40e6 / 13333
        let expected = 40_000_000.0 / 13333.0;
        assert!((actual - expected).abs() < 1e-9);
        // Granted rate is always within a divisor step of the request.
        assert!((actual - 3000.0).abs() / 3000.0 < 1e-3);
    }

    #[test]
    fn test_arm_not_connected_fails_before_io() {
        let caps = caps();
        let table = cal_table();
        let (pipe, handle) = MockInputPipe::new(vec![]);
        let connection = FakeConnection { connected: false };
        let ctx = ArmContext {
            caps: &caps,
            cal: &table,
            customs: &[],
            connection: &connection,
            poller: Arc::new(HealthyPoller),
            events: EventRegistry::new(DaqEventType::ALL.to_vec()),
        };
        let err = ScanController::arm_usb_input(
            ScanFunction::AnalogInput,
            Box::new(pipe),
            ctx,
            base_params(2),
            32,
        )
        .unwrap_err();
        assert_eq!(err, DaqError::NotConnected);
        // Nothing was ever submitted.
        assert_eq!(handle.completions(), 0);
    }

    #[test]
    fn test_armed_finite_scan_completes_and_reports() {
        let caps = caps();
        let table = cal_table();
        let connection = FakeConnection { connected: true };
        let events = EventRegistry::new(DaqEventType::ALL.to_vec());

        let mut params = base_params(2);
        params.samples_per_channel = 4;
        params.flags = ScanFlags::NO_SCALE | ScanFlags::NO_CALIBRATE;

        let bytes: Vec<u8> = (1u16..=8).flat_map(|c| c.to_le_bytes()).collect();
        let (pipe, _handle) = MockInputPipe::new(vec![PipeScript::Data(bytes)]);

        let ctx = ArmContext {
            caps: &caps,
            cal: &table,
            customs: &[],
            connection: &connection,
            poller: Arc::new(HealthyPoller),
            events: events.clone(),
        };
        let mut controller = ScanController::arm_usb_input(
            ScanFunction::AnalogInput,
            Box::new(pipe),
            ctx,
            params,
            8,
        )
        .unwrap();

        controller.wait_until_done(2.0).unwrap();
        let (state, error, transfer) = controller.status();
        assert_eq!(state, ScanState::Idle);
        assert_eq!(error, None);
        assert_eq!(transfer.current_total_count, 8);
        assert_eq!(transfer.current_scan_count, 4);

        // Second arm attempt must be allowed now.
        assert!(ensure_can_arm(Some(&controller)).is_ok());
        controller.stop().unwrap(); // idempotent on idle
    }

    #[test]
    fn test_rearm_while_running_is_rejected() {
        let caps = caps();
        let table = cal_table();
        let connection = FakeConnection { connected: true };
        let events = EventRegistry::new(DaqEventType::ALL.to_vec());

        let mut params = base_params(1);
        params.options = ScanOptions::CONTINUOUS;
        let (pipe, _handle) = MockInputPipe::new(vec![]);
        let ctx = ArmContext {
            caps: &caps,
            cal: &table,
            customs: &[],
            connection: &connection,
            poller: Arc::new(HealthyPoller),
            events,
        };
        let mut controller = ScanController::arm_usb_input(
            ScanFunction::AnalogInput,
            Box::new(pipe),
            ctx,
            params,
            64,
        )
        .unwrap();

        assert_eq!(
            ensure_can_arm(Some(&controller)),
            Err(DaqError::AlreadyRunning)
        );
        controller.stop().unwrap();
        assert!(ensure_can_arm(Some(&controller)).is_ok());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let caps = caps();
        let table = cal_table();
        let connection = FakeConnection { connected: true };
        let mut params = base_params(1);
        params.options = ScanOptions::CONTINUOUS;
        let (pipe, _handle) = MockInputPipe::new(vec![]);
        let ctx = ArmContext {
            caps: &caps,
            cal: &table,
            customs: &[],
            connection: &connection,
            poller: Arc::new(HealthyPoller),
            events: EventRegistry::new(DaqEventType::ALL.to_vec()),
        };
        let mut controller = ScanController::arm_usb_input(
            ScanFunction::AnalogInput,
            Box::new(pipe),
            ctx,
            params,
            64,
        )
        .unwrap();

        controller.stop().unwrap();
        controller.stop().unwrap();
        controller.stop().unwrap();
    }

    #[test]
    fn test_wait_until_done_bounded_timeout() {
        let caps = caps();
        let table = cal_table();
        let connection = FakeConnection { connected: true };
        let mut params = base_params(1);
        params.options = ScanOptions::CONTINUOUS;
        let (pipe, _handle) = MockInputPipe::new(vec![]);
        let ctx = ArmContext {
            caps: &caps,
            cal: &table,
            customs: &[],
            connection: &connection,
            poller: Arc::new(HealthyPoller),
            events: EventRegistry::new(DaqEventType::ALL.to_vec()),
        };
        let mut controller = ScanController::arm_usb_input(
            ScanFunction::AnalogInput,
            Box::new(pipe),
            ctx,
            params,
            64,
        )
        .unwrap();

        assert_eq!(controller.wait_until_done(0.05), Err(DaqError::Timeout));
        controller.stop().unwrap();
        controller.wait_until_done(-1.0).unwrap();
    }
}
