//! TCP/UDP transport for Ethernet devices.
//!
//! The command socket carries framed command/response traffic; a separate
//! data socket streams raw samples. A UDP connection-code probe answers
//! "is the device still there" when the command socket goes quiet.

use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use super::traits::{ControlTransport, DataStream, TransportError};
use crate::protocol::constants::{CONNECTION_CODE, DATA_PORT, PROBE_PORT};

/// How long the reachability probe waits for an answer.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Command-socket transport.
pub struct TcpControl {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    connected: AtomicBool,
}

impl TcpControl {
    /// Connect the command socket.
    #[instrument(level = "info", skip(addr), fields(addr = %addr))]
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        info!("command socket connected");
        Ok(Self {
            stream: Mutex::new(stream),
            peer: addr,
            connected: AtomicBool::new(true),
        })
    }

    /// Open the dedicated streaming data socket on the device's data port.
    pub fn open_data_stream(&self, read_timeout: Duration) -> Result<TcpDataStream, TransportError> {
        let addr = SocketAddr::new(self.peer.ip(), DATA_PORT);
        TcpDataStream::connect(addr, read_timeout)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn fail(&self, err: TransportError) -> TransportError {
        if err == TransportError::Disconnected {
            self.connected.store(false, Ordering::SeqCst);
        }
        err
    }
}

impl ControlTransport for TcpControl {
    fn send(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut stream = self.stream.lock().unwrap();
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        stream
            .write_all(data)
            .map_err(|e| self.fail(TransportError::from_io(&e, timeout)))?;
        Ok(data.len())
    }

    fn peek(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let stream = self.stream.lock().unwrap();
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        stream
            .peek(buf)
            .map_err(|e| self.fail(TransportError::from_io(&e, timeout)))
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut stream = self.stream.lock().unwrap();
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let n = stream
            .read(buf)
            .map_err(|e| self.fail(TransportError::from_io(&e, timeout)))?;
        if n == 0 {
            return Err(self.fail(TransportError::Disconnected));
        }
        Ok(n)
    }

    fn flush_input(&self) {
        let mut stream = self.stream.lock().unwrap();
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let mut scratch = [0u8; 256];
        let mut discarded = 0usize;
        while let Ok(n) = stream.read(&mut scratch) {
            if n == 0 {
                break;
            }
            discarded += n;
        }
        let _ = stream.set_nonblocking(false);
        if discarded > 0 {
            debug!(discarded, "flushed stale command-socket input");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Side-channel probe: broadcast the connection code at the device and
    /// wait briefly for any answer. Used to tell a slow device apart from
    /// a gone one.
    fn check_connection(&self) -> Result<(), TransportError> {
        probe_reachable(self.peer.ip())
    }
}

/// UDP connection-code probe.
fn probe_reachable(ip: IpAddr) -> Result<(), TransportError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
    socket
        .set_read_timeout(Some(PROBE_TIMEOUT))
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

    let mut code = [0u8; 4];
    LittleEndian::write_u32(&mut code, CONNECTION_CODE);
    socket
        .send_to(&code, (ip, PROBE_PORT))
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

    let mut answer = [0u8; 8];
    match socket.recv_from(&mut answer) {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "device unreachable to connection-code probe");
            Err(TransportError::DeviceNotFound)
        }
    }
}

/// Streaming data socket with a fixed read deadline.
pub struct TcpDataStream {
    stream: TcpStream,
    read_timeout: Duration,
}

impl TcpDataStream {
    #[instrument(level = "info", skip(addr), fields(addr = %addr))]
    pub fn connect(addr: SocketAddr, read_timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, read_timeout.max(Duration::from_secs(1)))
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        stream
            .set_read_timeout(Some(read_timeout))
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        info!("data socket connected");
        Ok(Self {
            stream,
            read_timeout,
        })
    }
}

impl DataStream for TcpDataStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.stream
            .read(buf)
            .map_err(|e| TransportError::from_io(&e, self.read_timeout))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream
            .write_all(data)
            .map_err(|e| TransportError::from_io(&e, self.read_timeout))
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
