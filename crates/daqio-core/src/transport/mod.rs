//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod tcp;
pub mod traits;

pub use mock::{
    MockControlTransport, MockDataStream, MockInputPipe, MockOutputHandle, MockOutputPipe,
    MockPipeHandle, MockStreamHandle, PipeScript, StreamScript,
};
pub use nusb::{NusbInputPipe, NusbOutputPipe};
pub use tcp::{TcpControl, TcpDataStream};
pub use traits::{
    ControlTransport, DataStream, Stage, StageCompletion, StreamPipe, TransportError,
};
