use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use daqio_core::transport::{MockInputPipe, PipeScript, TransportError};
use daqio_core::{
    CalCoef, CalTable, ChannelSpec, Connection, DaqError, DaqEventType, DeviceDescriptor,
    DeviceManager, DeviceScanStatus, EventRegistry, Range, ScanCaps, ScanController,
    ScanDirection, ScanFlags, ScanFunction, ScanOptions, ScanParams, StatusPoller, TransportKind,
    scan::ArmContext,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "DAQ acquisition engine demo (simulated device)", long_about = None)]
struct Args {
    /// Number of channels to scan
    #[arg(long, default_value_t = 2)]
    channels: u8,

    /// Scan rate in Hz
    #[arg(long, default_value_t = 1000.0)]
    rate: f64,

    /// Samples per channel
    #[arg(long, default_value_t = 1024)]
    samples: usize,

    /// Load scan setup from a TOML file instead of the flags above
    #[arg(long)]
    config: Option<String>,

    /// Fire a data-available event every N samples
    #[arg(long, default_value_t = 256)]
    event_every: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

struct SimConnection;

impl Connection for SimConnection {
    fn is_connected(&self) -> bool {
        true
    }

    fn check_connection(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct SimPoller;

impl StatusPoller for SimPoller {
    fn scan_status(&self, _direction: ScanDirection) -> Result<DeviceScanStatus, DaqError> {
        Ok(DeviceScanStatus {
            running: true,
            ..Default::default()
        })
    }
}

fn sim_caps(channels: u8) -> ScanCaps {
    ScanCaps {
        channel_count: channels.max(1),
        resolution: 16,
        sample_width: 2,
        min_rate: 1.0,
        max_rate: 100_000.0,
        max_throughput: 400_000.0,
        min_samples: 2,
        clock_freq: 40_000_000.0,
        options: ScanOptions::CONTINUOUS | ScanOptions::BURST | ScanOptions::RETRIGGER,
        flags: ScanFlags::NO_SCALE | ScanFlags::NO_CALIBRATE,
        ranges: vec![Range::BIP10V, Range::BIP5V, Range::UNI10V],
        events: DaqEventType::ALL.to_vec(),
    }
}

/// Synthesize the byte stream a simulated device would deliver: a slow
/// sine across scans, 16-bit codes, chunked like bulk completions.
fn sim_stream(channels: usize, total_samples: usize, chunk: usize) -> Vec<PipeScript> {
    let mut bytes = Vec::with_capacity(total_samples * 2);
    for i in 0..total_samples {
        let scan = i / channels;
        let phase = scan as f64 / 128.0 * std::f64::consts::TAU;
        let code = ((phase.sin() * 0.45 + 0.5) * 65535.0) as u16;
        bytes.extend_from_slice(&code.to_le_bytes());
    }
    bytes
        .chunks(chunk)
        .map(|c| PipeScript::Data(c.to_vec()))
        .collect()
}

fn run(args: &Args) -> Result<()> {
    let params: ScanParams = match &args.config {
        Some(path) => {
            info!(path = %path, "loading scan config");
            daqio_core::ScanConfig::load_from_file(path)?.to_params()
        }
        None => ScanParams {
            channels: (0..args.channels)
                .map(|c| ChannelSpec::new(c, Range::BIP10V))
                .collect(),
            samples_per_channel: args.samples,
            rate: args.rate,
            options: ScanOptions::NONE,
            flags: ScanFlags::NONE,
            trigger: None,
        },
    };

    let manager = DeviceManager::new();
    let device_number = manager.register(DeviceDescriptor {
        product: "sim-1616".into(),
        interface: TransportKind::Usb,
        unique_id: "SIM000001".into(),
    });
    info!(device_number, "simulated device ready");

    // Size the simulated device to whatever channel numbers the setup uses.
    let highest = params.channels.iter().map(|c| c.channel).max().unwrap_or(0);
    let caps = sim_caps(highest + 1);
    let cal = CalTable::new(vec![CalCoef::new(1.0002, -1.5); caps.channel_count as usize]);
    let events = EventRegistry::new(caps.events.clone());

    events.enable(
        DaqEventType::DataAvailable,
        args.event_every,
        Arc::new(|_, total| {
            info!(total, "data available");
        }),
        Default::default(),
    )?;
    events.enable(
        DaqEventType::EndOfInputScan,
        0,
        Arc::new(|_, total| {
            info!(total, "end of input scan");
        }),
        Default::default(),
    )?;

    let chans = params.channels.len();
    let total_samples = params.samples_per_channel * chans;
    let (pipe, _handle) = MockInputPipe::new(sim_stream(chans, total_samples, 512));

    let connection = SimConnection;
    let ctx = ArmContext {
        caps: &caps,
        cal: &cal,
        customs: &[],
        connection: &connection,
        poller: Arc::new(SimPoller),
        events: events.clone(),
    };
    let mut controller = ScanController::arm_usb_input(
        ScanFunction::AnalogInput,
        Box::new(pipe),
        ctx,
        params,
        total_samples,
    )?;
    info!(actual_rate = controller.actual_rate(), "scan running");

    // Poll until the scan completes, bounded so a continuous config still
    // exits the demo.
    let mut ticks = 0u32;
    loop {
        let (state, err, transfer) = controller.status();
        info!(
            ?state,
            scans = transfer.current_scan_count,
            total = transfer.current_total_count,
            index = transfer.current_index,
            "transfer status"
        );
        if let Some(err) = err {
            error!(%err, "scan failed");
            break;
        }
        if controller.wait_until_done(0.25).is_ok() {
            break;
        }
        ticks += 1;
        if ticks >= 20 {
            info!("demo window elapsed, stopping scan");
            break;
        }
    }

    controller.stop()?;
    let (_, _, transfer) = controller.status();
    let mut tail = vec![0.0; chans];
    if transfer.current_index >= 0 {
        controller
            .session()
            .read_buffer(transfer.current_index as usize, &mut tail)?;
        info!(?tail, "last complete scan");
    }

    events.disable_all();
    manager.remove(device_number);

    // Give the dispatcher a beat to flush event logs before exit.
    std::thread::sleep(Duration::from_millis(50));
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting daqio demo (simulated acquisition)...");

    if let Err(e) = run(&args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}
