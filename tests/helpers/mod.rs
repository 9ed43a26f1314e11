//! Simulated sensor node behind the `CanDriver` trait for integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use icolink::{CanDriver, Frame, Identifier, Received, Session, TransportError, SPU1, STH1};
use icolink::identifier::block;
use parking_lot::Mutex;

/// How the node answers one block/command pair.
#[derive(Clone)]
#[allow(dead_code)]
pub enum Reply {
    /// Acknowledge with the request payload.
    Echo,
    /// Acknowledge with a fixed payload.
    Ack(Vec<u8>),
    /// Error acknowledgement with a fixed payload.
    ErrorAck(Vec<u8>),
    /// Acknowledge with a payload computed from the request payload.
    With(fn(&[u8]) -> Vec<u8>),
    /// Never answer.
    Silent,
}

/// A running stream: the node emits `remaining` data frames, one per poll.
struct Stream {
    id: Identifier,
    format: u8,
    counter: u8,
    values: [u16; 3],
    remaining: usize,
}

struct NodeState {
    inbound: VecDeque<Received>,
    writes: Vec<Frame>,
    replies: HashMap<(u8, u8), Reply>,
    stream: Option<Stream>,
    stream_frames: usize,
    stream_values: [u16; 3],
    started: Instant,
}

impl NodeState {
    fn push(&mut self, frame: Frame) {
        self.inbound.push_back(Received {
            frame,
            device_timestamp: self.started.elapsed(),
        });
    }

    fn answer(&mut self, request: &Frame) {
        let id = request.identifier;
        let reply = self
            .replies
            .get(&(id.block, id.command))
            .cloned()
            .unwrap_or(Reply::Echo);
        let (reply_id, payload) = match reply {
            Reply::Echo => (id.ack(), request.payload().to_vec()),
            Reply::Ack(payload) => (id.ack(), payload),
            Reply::ErrorAck(payload) => (id.error_ack(), payload),
            Reply::With(f) => (id.ack(), f(request.payload())),
            Reply::Silent => return,
        };
        let frame = Frame::new(reply_id, &payload).expect("reply fits in a frame");
        self.push(frame);

        if id.block == block::STREAMING {
            let format = request.payload().first().copied().unwrap_or(0);
            self.stream = if format & 0x07 != 0 {
                Some(Stream {
                    id: id.ack(),
                    format,
                    counter: 0,
                    values: self.stream_values,
                    remaining: self.stream_frames,
                })
            } else {
                None
            };
        }
    }

    fn next_data_frame(&mut self) -> Option<Frame> {
        let stream = self.stream.as_mut()?;
        if stream.remaining == 0 {
            return None;
        }
        stream.remaining -= 1;
        let mut payload = vec![stream.format, stream.counter];
        for value in stream.values {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        stream.counter = stream.counter.wrapping_add(1);
        Some(Frame::new(stream.id, &payload).expect("data frame fits"))
    }
}

struct SimulatedDriver {
    state: Arc<Mutex<NodeState>>,
}

impl CanDriver for SimulatedDriver {
    fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.writes.push(frame.clone());
        state.answer(frame);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Received>, TransportError> {
        let mut state = self.state.lock();
        if let Some(rx) = state.inbound.pop_front() {
            return Ok(Some(rx));
        }
        if let Some(frame) = state.next_data_frame() {
            state.push(frame);
            return Ok(state.inbound.pop_front());
        }
        Ok(None)
    }
}

/// Test-side view of the simulated node.
#[derive(Clone)]
#[allow(dead_code)]
pub struct NodeHandle {
    state: Arc<Mutex<NodeState>>,
}

#[allow(dead_code)]
impl NodeHandle {
    pub fn reply(&self, block: u8, command: u8, reply: Reply) {
        self.state.lock().replies.insert((block, command), reply);
    }

    /// Data frames emitted after each stream start, and the samples they carry.
    pub fn stream(&self, frames: usize, values: [u16; 3]) {
        let mut state = self.state.lock();
        state.stream_frames = frames;
        state.stream_values = values;
    }

    pub fn writes(&self) -> Vec<Frame> {
        self.state.lock().writes.clone()
    }

    /// Inject an unsolicited frame.
    pub fn inject(&self, frame: Frame) {
        self.state.lock().push(frame);
    }
}

/// Session as SPU1 talking to a simulated STH1.
#[allow(dead_code)]
pub fn session() -> (Session, NodeHandle) {
    session_with_nodes(SPU1, STH1)
}

#[allow(dead_code)]
pub fn session_with_nodes(sender: u8, receiver: u8) -> (Session, NodeHandle) {
    let state = Arc::new(Mutex::new(NodeState {
        inbound: VecDeque::new(),
        writes: Vec::new(),
        replies: HashMap::new(),
        stream: None,
        stream_frames: 5,
        stream_values: [100, 200, 300],
        started: Instant::now(),
    }));
    let driver = SimulatedDriver {
        state: Arc::clone(&state),
    };
    let session = Session::with_nodes(Box::new(driver), sender, receiver)
        .expect("session starts on simulated driver");
    (session, NodeHandle { state })
}

/// Poll `cond` for up to two seconds.
#[allow(dead_code)]
pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(1));
    }
}
