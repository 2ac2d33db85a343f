//! daqio-core: continuous acquisition engine for DAQ hardware.
//!
//! The engine that moves sample data between data-acquisition devices
//! (analog/digital I/O, counters) and user buffers once a scan is armed,
//! over USB or Ethernet.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Calibration**: per-channel slope/offset transforms and scan-time
//!   coefficient binding
//! - **Pipeline / Ring**: raw sample codec and the bounds-checked
//!   destination buffer
//! - **Transport**: command-channel and streaming abstractions (nusb, TCP,
//!   mock)
//! - **Protocol**: Ethernet command/reply framing with checksums and retry
//! - **Session**: shared scan state, counters, and status queries
//! - **Stager**: per-transport transfer loops feeding the pipeline
//! - **Monitor**: health polling and error recovery
//! - **Events**: decoupled callback delivery on a dispatcher thread
//! - **Scan**: arm-time validation, pacing, and the scan controller
//!
//! # Example
//!
//! ```no_run
//! use daqio_core::config::ScanConfig;
//!
//! let config = ScanConfig::load_from_file("scan.toml").expect("config");
//! let params = config.to_params();
//! // Hand `params` to a device's scan-start capability.
//! ```

pub mod calibration;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod manager;
pub mod monitor;
pub mod pipeline;
pub mod protocol;
pub mod ring;
pub mod scan;
pub mod session;
pub mod stager;
pub mod transport;

// Re-exports for convenience
pub use calibration::{BoundCoef, CalCoef, CalTable, CustomScale, Range};
pub use config::ScanConfig;
pub use device::{
    AnalogInputCapable, AnalogOutputCapable, Connection, CounterInputCapable, DeviceScanStatus,
    DigitalInputCapable, DigitalOutputCapable, ScanCaps, StatusPoller,
};
pub use error::DaqError;
pub use events::{DaqEventType, EventCallback, EventRegistry, ScanActivity};
pub use manager::{DeviceDescriptor, DeviceManager, TransportKind};
pub use monitor::{MonitorConfig, MonitorState, ScanMonitor};
pub use protocol::{CommandExchange, Frame, FrameError};
pub use ring::SampleRing;
pub use scan::{
    ChannelSpec, InputMode, ScanController, ScanParams, TriggerConfig, TriggerType,
    actual_scan_rate, ensure_can_arm, validate_scan,
};
pub use session::{
    ScanDirection, ScanFlags, ScanFunction, ScanOptions, ScanSession, ScanState, TransferStatus,
};
pub use stager::{ScanStager, StopFlag};
pub use transport::{ControlTransport, DataStream, StreamPipe, TransportError};
