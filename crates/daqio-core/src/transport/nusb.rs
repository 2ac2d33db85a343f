//! nusb-based USB streaming transport.
//!
//! Key nusb 0.2 API patterns (blocking style):
//! - `list_devices().wait()` for enumeration
//! - `device_info.open().wait()` to open
//! - `device.claim_interface(n).wait()` to claim
//! - `interface.endpoint::<Bulk, In>(addr)` then `.reader(buf_size)` /
//!   `.writer(buf_size)` for I/O
//!
//! The endpoint reader/writer keeps its own transfer queue filled, so the
//! stage pool layered on top by the stager stays saturated without this
//! module re-implementing transfer bookkeeping.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{Stage, StageCompletion, StreamPipe, TransportError};

/// Internal buffer handed to the nusb reader/writer.
const ENDPOINT_BUF_SIZE: usize = 64 * 1024;

struct OpenedInterface {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
}

#[instrument(level = "info", fields(vid = format!("{vid:04X}"), pid = format!("{pid:04X}")))]
fn open_interface(vid: u16, pid: u16, interface_number: u8) -> Result<OpenedInterface, TransportError> {
    let device_info = list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?
        .find(|d| d.vendor_id() == vid && d.product_id() == pid)
        .ok_or(TransportError::DeviceNotFound)?;

    let device = device_info
        .open()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

    let interface = device
        .claim_interface(interface_number)
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

    // Find the BULK endpoints on this interface.
    let mut in_endpoint: u8 = 0;
    let mut out_endpoint: u8 = 0;
    for config in device.configurations() {
        for iface in config.interfaces() {
            if iface.interface_number() == interface_number {
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
            }
        }
    }

    info!(
        in_ep = %format!("0x{:02X}", in_endpoint),
        out_ep = %format!("0x{:02X}", out_endpoint),
        "streaming interface claimed"
    );

    Ok(OpenedInterface {
        interface,
        in_endpoint,
        out_endpoint,
    })
}

/// Bulk-IN streaming pipe.
pub struct NusbInputPipe {
    interface: Interface,
    in_endpoint: u8,
    queue: VecDeque<Stage>,
    cancelled: bool,
}

impl NusbInputPipe {
    pub fn open(vid: u16, pid: u16, interface_number: u8) -> Result<Self, TransportError> {
        let opened = open_interface(vid, pid, interface_number)?;
        if opened.in_endpoint == 0 {
            return Err(TransportError::OpenFailed("no bulk IN endpoint".into()));
        }
        Ok(Self {
            interface: opened.interface,
            in_endpoint: opened.in_endpoint,
            queue: VecDeque::new(),
            cancelled: false,
        })
    }
}

impl StreamPipe for NusbInputPipe {
    fn submit(&mut self, stage: Stage) -> Result<(), TransportError> {
        if self.cancelled {
            return Err(TransportError::Cancelled);
        }
        self.queue.push_back(stage);
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Result<StageCompletion, TransportError> {
        let mut stage = match self.queue.pop_front() {
            Some(s) => s,
            None => {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        if self.cancelled {
            return Ok(StageCompletion {
                stage,
                result: Err(TransportError::Cancelled),
            });
        }

        let result = (|| {
            let ep = self
                .interface
                .endpoint::<Bulk, In>(self.in_endpoint)
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
            let mut reader = ep.reader(ENDPOINT_BUF_SIZE);
            reader
                .read(stage.buf_mut())
                .map_err(|e| TransportError::from_io(&e, timeout))
        })();

        match result {
            Ok(n) => {
                stage.set_len(n);
                debug!(bytes = n, "bulk IN completion");
                Ok(StageCompletion {
                    stage,
                    result: Ok(n),
                })
            }
            Err(err) => Ok(StageCompletion {
                stage,
                result: Err(err),
            }),
        }
    }

    fn cancel_all(&mut self) {
        self.cancelled = true;
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Bulk-OUT streaming pipe.
pub struct NusbOutputPipe {
    interface: Interface,
    out_endpoint: u8,
    queue: VecDeque<Stage>,
    cancelled: bool,
}

impl NusbOutputPipe {
    pub fn open(vid: u16, pid: u16, interface_number: u8) -> Result<Self, TransportError> {
        let opened = open_interface(vid, pid, interface_number)?;
        if opened.out_endpoint == 0 {
            return Err(TransportError::OpenFailed("no bulk OUT endpoint".into()));
        }
        Ok(Self {
            interface: opened.interface,
            out_endpoint: opened.out_endpoint,
            queue: VecDeque::new(),
            cancelled: false,
        })
    }
}

impl StreamPipe for NusbOutputPipe {
    fn submit(&mut self, stage: Stage) -> Result<(), TransportError> {
        if self.cancelled {
            return Err(TransportError::Cancelled);
        }
        self.queue.push_back(stage);
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Result<StageCompletion, TransportError> {
        let stage = match self.queue.pop_front() {
            Some(s) => s,
            None => {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        if self.cancelled {
            return Ok(StageCompletion {
                stage,
                result: Err(TransportError::Cancelled),
            });
        }

        let result = (|| {
            let ep = self
                .interface
                .endpoint::<Bulk, Out>(self.out_endpoint)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
            let mut writer = ep.writer(ENDPOINT_BUF_SIZE);
            writer
                .write_all(stage.bytes())
                .map_err(|e| TransportError::from_io(&e, timeout))?;
            writer
                .flush()
                .map_err(|e| TransportError::from_io(&e, timeout))?;
            Ok(stage.len())
        })();

        match result {
            Ok(n) => {
                debug!(bytes = n, "bulk OUT completion");
                Ok(StageCompletion {
                    stage,
                    result: Ok(n),
                })
            }
            Err(err) => Ok(StageCompletion {
                stage,
                result: Err(err),
            }),
        }
    }

    fn cancel_all(&mut self) {
        self.cancelled = true;
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}
