//! Command/response exchange over the command socket.
//!
//! One mutex serializes the whole send+receive pair so a command and its
//! reply can never interleave with another thread's exchange. The frame-id
//! counter lives inside that mutex; it is unreachable without holding the
//! lock, which is what makes id-based correlation sound.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use super::constants::{
    CMD_AUX_COUNTERS, CMD_CLOSE_DATA_SOCKET, CMD_SCAN_STATUS, CMD_SCAN_STOP, FRAME_HEADER_SIZE,
    MAX_FRAME_PAYLOAD, STATUS_BIT_OVERRUN, STATUS_BIT_PACER_FAULT, STATUS_BIT_RUNNING,
    STATUS_BIT_UNDERRUN, STATUS_OK,
};
use super::frame::{Frame, FrameError};
use crate::device::{DeviceScanStatus, StatusPoller};
use crate::error::DaqError;
use crate::session::ScanDirection;
use crate::transport::{ControlTransport, TransportError};

/// Total attempts per exchange: the initial try plus one retry. A second
/// consecutive bad frame is a hard protocol error.
pub const MAX_EXCHANGE_ATTEMPTS: usize = 2;

struct ExchangeState {
    frame_id: u8,
}

/// Framed command channel over any [`ControlTransport`].
pub struct CommandExchange<T: ControlTransport> {
    transport: T,
    state: Mutex<ExchangeState>,
    timeout: Duration,
    rx_capacity: usize,
}

impl<T: ControlTransport> CommandExchange<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            state: Mutex::new(ExchangeState { frame_id: 0 }),
            timeout,
            rx_capacity: MAX_FRAME_PAYLOAD,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a command and receive its validated reply.
    ///
    /// Framing faults (bad checksum, wrong ack command, stale frame id,
    /// oversize payload) flush pending input and retry the whole exchange;
    /// after [`MAX_EXCHANGE_ATTEMPTS`] the fault is surfaced as a hard
    /// protocol error. A receive timeout is resolved against a
    /// reachability probe to pick between `Timeout` and `NotConnected`.
    pub fn roundtrip(&self, command: u8, payload: &[u8]) -> Result<Frame, DaqError> {
        let mut state = self.state.lock().unwrap();
        let mut last_fault: Option<FrameError> = None;

        for attempt in 0..MAX_EXCHANGE_ATTEMPTS {
            let frame_id = state.frame_id;
            state.frame_id = state.frame_id.wrapping_add(1);

            match self.exchange_once(command, frame_id, payload) {
                Ok(reply) => {
                    if attempt > 0 {
                        debug!(command, attempt, "exchange recovered after retry");
                    }
                    return Ok(reply);
                }
                Err(ExchangeFault::Frame(fault)) => {
                    warn!(command, frame_id, %fault, "bad frame, flushing and retrying");
                    self.transport.flush_input();
                    last_fault = Some(fault);
                }
                Err(ExchangeFault::Transport(err)) if err.is_timeout() => {
                    return match self.transport.check_connection() {
                        Ok(()) => Err(DaqError::Timeout),
                        Err(_) => Err(DaqError::NotConnected),
                    };
                }
                Err(ExchangeFault::Transport(err)) => return Err(err.into()),
            }
        }

        Err(DaqError::ProtocolFault(format!(
            "command 0x{command:02X} failed after {MAX_EXCHANGE_ATTEMPTS} attempts: {}",
            last_fault.map(|f| f.to_string()).unwrap_or_default()
        )))
    }

    /// Roundtrip that also insists the device accepted the command.
    fn command_ok(&self, command: u8, payload: &[u8]) -> Result<Frame, DaqError> {
        let reply = self.roundtrip(command, payload)?;
        if reply.status != STATUS_OK {
            return Err(DaqError::ProtocolFault(format!(
                "command 0x{command:02X} rejected with device status {}",
                reply.status
            )));
        }
        Ok(reply)
    }

    /// Read and decode the scan status register.
    pub fn scan_status_register(
        &self,
        direction: ScanDirection,
    ) -> Result<DeviceScanStatus, DaqError> {
        let dir_byte = match direction {
            ScanDirection::Input => 0u8,
            ScanDirection::Output => 1u8,
        };
        let reply = self.command_ok(CMD_SCAN_STATUS, &[dir_byte])?;
        let register = reply.data.first().copied().ok_or_else(|| {
            DaqError::ProtocolFault("empty scan status reply".into())
        })?;
        Ok(DeviceScanStatus {
            running: register & STATUS_BIT_RUNNING != 0,
            overrun: register & STATUS_BIT_OVERRUN != 0,
            underrun: register & STATUS_BIT_UNDERRUN != 0,
            pacer_fault: register & STATUS_BIT_PACER_FAULT != 0,
        })
    }

    /// Stop the device-side pacer.
    pub fn stop_scan(&self) -> Result<(), DaqError> {
        self.command_ok(CMD_SCAN_STOP, &[]).map(|_| ())
    }

    /// Tell the firmware to release the streaming data socket. Sent before
    /// the host closes its end so the device is never left half-open.
    pub fn close_data_socket(&self) -> Result<(), DaqError> {
        self.command_ok(CMD_CLOSE_DATA_SOCKET, &[]).map(|_| ())
    }

    fn exchange_once(
        &self,
        command: u8,
        frame_id: u8,
        payload: &[u8],
    ) -> Result<Frame, ExchangeFault> {
        let request = Frame::request(command, frame_id, payload);
        self.transport.send(&request.to_bytes(), self.timeout)?;

        // Peek the fixed header to learn the payload length, then take
        // header + payload + checksum in one read.
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.transport.peek(&mut header, self.timeout)?;
        let payload_len = Frame::payload_len(&header)?;
        if payload_len > self.rx_capacity {
            return Err(ExchangeFault::Frame(FrameError::Oversize {
                len: payload_len,
                capacity: self.rx_capacity,
            }));
        }

        let mut raw = vec![0u8; Frame::wire_size(payload_len)];
        let n = self.transport.receive(&mut raw, self.timeout)?;
        let reply = Frame::from_bytes(&raw[..n])?;
        reply.expect_reply_to(command, frame_id, self.rx_capacity)?;
        Ok(reply)
    }
}

/// Ethernet devices poll their status register through the framed command
/// channel, so the exchange itself is the monitor's poller.
impl<T: ControlTransport> StatusPoller for CommandExchange<T> {
    fn scan_status(&self, direction: ScanDirection) -> Result<DeviceScanStatus, DaqError> {
        self.scan_status_register(direction)
    }

    fn aux_counters(&self) -> Result<(), DaqError> {
        self.command_ok(CMD_AUX_COUNTERS, &[]).map(|_| ())
    }
}

enum ExchangeFault {
    Frame(FrameError),
    Transport(TransportError),
}

impl From<FrameError> for ExchangeFault {
    fn from(e: FrameError) -> Self {
        ExchangeFault::Frame(e)
    }
}

impl From<TransportError> for ExchangeFault {
    fn from(e: TransportError) -> Self {
        ExchangeFault::Transport(e)
    }
}
