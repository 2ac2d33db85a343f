//! Ethernet wire-protocol definitions.

pub mod constants;
pub mod exchange;
pub mod frame;

pub use constants::*;
pub use exchange::{CommandExchange, MAX_EXCHANGE_ATTEMPTS};
pub use frame::{Frame, FrameError, checksum};
