//! Ethernet wire-protocol constants.

// ============================================================================
// Framing
// ============================================================================

/// Start-of-frame delimiter, first byte of every command and reply.
pub const FRAME_DELIMITER: u8 = 0xDB;

/// Replies echo the request command with this bit set.
pub const ACK_BIT: u8 = 0x80;

/// Fixed header: delimiter, command, frame id, status, payload count (u16).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Trailing additive checksum.
pub const FRAME_CHECKSUM_SIZE: usize = 1;

/// Largest payload a reply may carry into our receive buffer.
pub const MAX_FRAME_PAYLOAD: usize = 1024;

/// Reply status byte for a command the device accepted.
pub const STATUS_OK: u8 = 0;

// ============================================================================
// Command codes (command socket)
// ============================================================================

/// Read the scan status register.
pub const CMD_SCAN_STATUS: u8 = 0x40;

/// Read auxiliary device counters.
pub const CMD_AUX_COUNTERS: u8 = 0x41;

/// Stop the device-side scan pacer.
pub const CMD_SCAN_STOP: u8 = 0x42;

/// Tell the firmware to release the streaming data socket.
pub const CMD_CLOSE_DATA_SOCKET: u8 = 0x43;

// ============================================================================
// Scan status register bits (CMD_SCAN_STATUS reply payload, byte 0)
// ============================================================================

pub const STATUS_BIT_RUNNING: u8 = 1 << 0;
pub const STATUS_BIT_OVERRUN: u8 = 1 << 1;
pub const STATUS_BIT_UNDERRUN: u8 = 1 << 2;
pub const STATUS_BIT_PACER_FAULT: u8 = 1 << 3;

// ============================================================================
// Connection probing (UDP side channel)
// ============================================================================

/// Connection-code broadcast used to check that the device is still
/// reachable when the command socket times out.
pub const CONNECTION_CODE: u32 = 0x4441_5143; // 'DAQC'

/// UDP port the device answers connection-code probes on.
pub const PROBE_PORT: u16 = 54211;

// ============================================================================
// Ports and timeouts
// ============================================================================

/// Default TCP port of the command socket.
pub const COMMAND_PORT: u16 = 54211;

/// Default TCP port of the streaming data socket.
pub const DATA_PORT: u16 = 54212;
