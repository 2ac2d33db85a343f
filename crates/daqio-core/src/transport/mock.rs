//! Mock transports for unit testing the engine without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{
    ControlTransport, DataStream, Stage, StageCompletion, StreamPipe, TransportError,
};

// ============================================================================
// Control transport
// ============================================================================

struct ControlState {
    replies: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    flushes: usize,
    connected: bool,
    reachable: bool,
}

/// Mock command-channel transport with queued replies and captured sends.
pub struct MockControlTransport {
    state: Arc<Mutex<ControlState>>,
}

impl MockControlTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState {
                replies: VecDeque::new(),
                sent: Vec::new(),
                flushes: 0,
                connected: true,
                reachable: true,
            })),
        }
    }

    /// Queue raw reply bytes returned by the next receive.
    pub fn queue_reply(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().replies.push_back(bytes);
    }

    /// Simulate device loss on the command path.
    pub fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.reachable = false;
    }

    /// Control whether the reachability probe succeeds.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn sent_frames(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    /// Frame ids of every frame sent, in order.
    pub fn sent_frame_ids(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|f| f.get(2).copied())
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap().flushes
    }
}

impl Default for MockControlTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlTransport for MockControlTransport {
    fn send(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.sent.push(data.to_vec());
        Ok(data.len())
    }

    fn peek(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        match state.replies.front() {
            Some(reply) => {
                let n = buf.len().min(reply.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        match state.replies.pop_front() {
            Some(reply) => {
                let n = buf.len().min(reply.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn flush_input(&self) {
        // Queued replies model the device's future responses, not bytes
        // already on the wire, so a flush only records that it happened.
        self.state.lock().unwrap().flushes += 1;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn check_connection(&self) -> Result<(), TransportError> {
        if self.state.lock().unwrap().reachable {
            Ok(())
        } else {
            Err(TransportError::DeviceNotFound)
        }
    }
}

// ============================================================================
// Stream pipes
// ============================================================================

/// Scripted event for a mock input pipe completion.
#[derive(Debug, Clone)]
pub enum PipeScript {
    /// Complete the next stage with these bytes.
    Data(Vec<u8>),
    /// Complete the next stage with a transport fault.
    Fail(TransportError),
    /// Produce no completion for one wait window.
    Stall,
}

struct InputPipeState {
    script: VecDeque<PipeScript>,
    submitted: VecDeque<Stage>,
    cancelled: bool,
    completions: usize,
}

/// Handle for inspecting a pipe owned by a stager thread.
#[derive(Clone)]
pub struct MockPipeHandle {
    state: Arc<Mutex<InputPipeState>>,
}

impl MockPipeHandle {
    pub fn completions(&self) -> usize {
        self.state.lock().unwrap().completions
    }

    pub fn was_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    pub fn push_script(&self, item: PipeScript) {
        self.state.lock().unwrap().script.push_back(item);
    }
}

/// Mock streaming-input pipe driven by a completion script.
pub struct MockInputPipe {
    state: Arc<Mutex<InputPipeState>>,
}

impl MockInputPipe {
    pub fn new(script: Vec<PipeScript>) -> (Self, MockPipeHandle) {
        let state = Arc::new(Mutex::new(InputPipeState {
            script: script.into(),
            submitted: VecDeque::new(),
            cancelled: false,
            completions: 0,
        }));
        (
            Self {
                state: state.clone(),
            },
            MockPipeHandle { state },
        )
    }
}

impl StreamPipe for MockInputPipe {
    fn submit(&mut self, stage: Stage) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push_back(stage);
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Result<StageCompletion, TransportError> {
        let mut state = self.state.lock().unwrap();
        let timeout_err = TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        };

        if state.cancelled {
            // Drain cancelled stages as completions.
            return match state.submitted.pop_front() {
                Some(stage) => {
                    state.completions += 1;
                    Ok(StageCompletion {
                        stage,
                        result: Err(TransportError::Cancelled),
                    })
                }
                None => Err(timeout_err),
            };
        }

        match state.script.pop_front() {
            Some(PipeScript::Data(bytes)) => {
                let mut stage = state.submitted.pop_front().ok_or_else(|| {
                    TransportError::ReadFailed("completion with no stage submitted".into())
                })?;
                let n = bytes.len().min(stage.capacity());
                stage.buf_mut()[..n].copy_from_slice(&bytes[..n]);
                stage.set_len(n);
                state.completions += 1;
                Ok(StageCompletion {
                    stage,
                    result: Ok(n),
                })
            }
            Some(PipeScript::Fail(err)) => {
                let stage = state.submitted.pop_front().ok_or_else(|| {
                    TransportError::ReadFailed("completion with no stage submitted".into())
                })?;
                state.completions += 1;
                Ok(StageCompletion {
                    stage,
                    result: Err(err),
                })
            }
            Some(PipeScript::Stall) | None => Err(timeout_err),
        }
    }

    fn cancel_all(&mut self) {
        self.state.lock().unwrap().cancelled = true;
    }

    fn pending(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }
}

struct OutputPipeState {
    drained: Vec<Vec<u8>>,
    submitted: VecDeque<Stage>,
    cancelled: bool,
    fail_after: Option<usize>,
}

/// Handle for inspecting bytes an output pipe pushed to the device.
#[derive(Clone)]
pub struct MockOutputHandle {
    state: Arc<Mutex<OutputPipeState>>,
}

impl MockOutputHandle {
    pub fn drained(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().drained.clone()
    }

    pub fn drained_bytes(&self) -> usize {
        self.state.lock().unwrap().drained.iter().map(Vec::len).sum()
    }
}

/// Mock streaming-output pipe: every completion drains one stage.
pub struct MockOutputPipe {
    state: Arc<Mutex<OutputPipeState>>,
}

impl MockOutputPipe {
    pub fn new() -> (Self, MockOutputHandle) {
        let state = Arc::new(Mutex::new(OutputPipeState {
            drained: Vec::new(),
            submitted: VecDeque::new(),
            cancelled: false,
            fail_after: None,
        }));
        (
            Self {
                state: state.clone(),
            },
            MockOutputHandle { state },
        )
    }

    /// Fail the Nth completion with a disconnect.
    pub fn fail_after(&self, n: usize) {
        self.state.lock().unwrap().fail_after = Some(n);
    }
}

impl StreamPipe for MockOutputPipe {
    fn submit(&mut self, stage: Stage) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push_back(stage);
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Result<StageCompletion, TransportError> {
        let mut state = self.state.lock().unwrap();
        let stage = match state.submitted.pop_front() {
            Some(s) => s,
            None => {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        if state.cancelled {
            return Ok(StageCompletion {
                stage,
                result: Err(TransportError::Cancelled),
            });
        }
        if let Some(n) = state.fail_after {
            if state.drained.len() >= n {
                return Ok(StageCompletion {
                    stage,
                    result: Err(TransportError::Disconnected),
                });
            }
        }
        let len = stage.len();
        state.drained.push(stage.bytes().to_vec());
        Ok(StageCompletion {
            stage,
            result: Ok(len),
        })
    }

    fn cancel_all(&mut self) {
        self.state.lock().unwrap().cancelled = true;
    }

    fn pending(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }
}

// ============================================================================
// Data stream
// ============================================================================

/// Scripted event for a mock network data stream read.
#[derive(Debug, Clone)]
pub enum StreamScript {
    Data(Vec<u8>),
    Timeout,
    /// Peer closed the stream (read returns 0).
    Closed,
    Fail(TransportError),
}

struct DataStreamState {
    script: VecDeque<StreamScript>,
    written: Vec<u8>,
    shutdown: bool,
}

#[derive(Clone)]
pub struct MockStreamHandle {
    state: Arc<Mutex<DataStreamState>>,
}

impl MockStreamHandle {
    pub fn was_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }
}

/// Mock network data stream driven by a read script.
pub struct MockDataStream {
    state: Arc<Mutex<DataStreamState>>,
}

impl MockDataStream {
    pub fn new(script: Vec<StreamScript>) -> (Self, MockStreamHandle) {
        let state = Arc::new(Mutex::new(DataStreamState {
            script: script.into(),
            written: Vec::new(),
            shutdown: false,
        }));
        (
            Self {
                state: state.clone(),
            },
            MockStreamHandle { state },
        )
    }
}

impl DataStream for MockDataStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        match state.script.pop_front() {
            Some(StreamScript::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(StreamScript::Closed) => Ok(0),
            Some(StreamScript::Fail(err)) => Err(err),
            Some(StreamScript::Timeout) | None => {
                Err(TransportError::Timeout { timeout_ms: 100 })
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(TransportError::Disconnected);
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.lock().unwrap().shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_control_queue() {
        let mock = MockControlTransport::new();
        mock.queue_reply(vec![1, 2, 3]);

        let mut peeked = [0u8; 2];
        assert_eq!(mock.peek(&mut peeked, Duration::ZERO).unwrap(), 2);
        assert_eq!(peeked, [1, 2]);

        let mut buf = [0u8; 8];
        assert_eq!(mock.receive(&mut buf, Duration::ZERO).unwrap(), 3);

        // Queue is drained now.
        assert!(mock.receive(&mut buf, Duration::ZERO).is_err());
    }

    #[test]
    fn test_mock_input_pipe_recycles_stage() {
        let (mut pipe, handle) =
            MockInputPipe::new(vec![PipeScript::Data(vec![9, 9]), PipeScript::Data(vec![7])]);
        pipe.submit(Stage::with_capacity(4)).unwrap();

        let completion = pipe.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(completion.stage.bytes(), &[9, 9]);
        pipe.submit(completion.stage).unwrap();

        let completion = pipe.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(completion.stage.bytes(), &[7]);
        assert_eq!(handle.completions(), 2);
    }

    #[test]
    fn test_mock_input_pipe_cancel_drains() {
        let (mut pipe, _handle) = MockInputPipe::new(vec![PipeScript::Data(vec![1])]);
        pipe.submit(Stage::with_capacity(4)).unwrap();
        pipe.submit(Stage::with_capacity(4)).unwrap();
        pipe.cancel_all();

        let c1 = pipe.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(c1.result, Err(TransportError::Cancelled));
        let c2 = pipe.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(c2.result, Err(TransportError::Cancelled));
        assert_eq!(pipe.pending(), 0);
        assert!(pipe.wait_complete(Duration::ZERO).is_err());
    }
}
