//! Connection to one CAN bus and the nodes on it.
//!
//! A [`Session`] owns the frame transport (driver, frame log and receive
//! thread) together with the routing state: the host's own node number and
//! the node requests go to by default. Everything else in the crate, typed
//! commands and streaming included, is built on [`Session::send_command`].
//!
//! # Example
//! ```ignore
//! let session = Session::open_socketcan("can0")?;
//! let version = session.firmware_version(STH1)?;
//!
//! let config = StreamingConfig::default();
//! let start = session.start_stream(&config)?;
//! std::thread::sleep(Duration::from_secs(1));
//! let end = session.stop_stream(&config)?;
//! let samples = session.collect_samples(&config, start..end, true)?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use log::{debug, info};
use parking_lot::Mutex;

use crate::errors::Result;
use crate::frame::{Frame, LogEntry};
use crate::identifier::{node_name, Identifier, SPU1, STH1};
use crate::request::{send_with_retries, RetryPolicy};
use crate::slcan::SlcanDriver;
use crate::streaming::{Channel, ChannelStream};
use crate::transport::{CanDriver, FrameTransport};

pub struct Session {
    transport: FrameTransport,
    sender: u8,
    receiver: AtomicU8,
    stop_guard_frames: AtomicUsize,
    pub(crate) streams: Mutex<HashMap<Channel, ChannelStream>>,
}

impl Session {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Start a session on `driver` as the host, talking to the first sensor node.
    pub fn new(driver: Box<dyn CanDriver>) -> Result<Self> {
        Self::with_nodes(driver, SPU1, STH1)
    }

    /// Start a session with explicit own and default target node numbers.
    pub fn with_nodes(driver: Box<dyn CanDriver>, sender: u8, receiver: u8) -> Result<Self> {
        let transport = FrameTransport::start(driver)?;
        info!(
            "session opened as {} targeting {}",
            node_name(sender),
            node_name(receiver)
        );
        Ok(Self {
            transport,
            sender,
            receiver: AtomicU8::new(receiver),
            stop_guard_frames: AtomicUsize::new(0),
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Open a SocketCAN interface such as `can0`.
    #[cfg(target_os = "linux")]
    pub fn open_socketcan(interface: &str) -> Result<Self> {
        let driver = crate::socketcan::SocketCanDriver::open(interface)?;
        Self::new(Box::new(driver))
    }

    /// Open a serial-line CAN adapter at `bitrate` bit/s.
    pub fn open_slcan(port: &str, bitrate: u32) -> Result<Self> {
        let driver = SlcanDriver::open(port, bitrate)?;
        Self::new(Box::new(driver))
    }

    // ------------------------------------------------------------------------
    // Routing and tunables
    // ------------------------------------------------------------------------

    /// Node number of this host.
    pub fn sender(&self) -> u8 {
        self.sender
    }

    /// Node that new streams are started on.
    pub fn receiver(&self) -> u8 {
        self.receiver.load(Ordering::Acquire)
    }

    pub fn set_receiver(&self, receiver: u8) {
        debug!("target node is now {}", node_name(receiver));
        self.receiver.store(receiver, Ordering::Release);
    }

    /// Frames dropped from the end of a streaming run by `stop_stream`.
    pub fn stop_guard_frames(&self) -> usize {
        self.stop_guard_frames.load(Ordering::Relaxed)
    }

    pub fn set_stop_guard_frames(&self, frames: usize) {
        self.stop_guard_frames.store(frames, Ordering::Relaxed);
    }

    pub fn transport(&self) -> &FrameTransport {
        &self.transport
    }

    /// High-water mark of the frame log.
    pub fn index(&self) -> usize {
        self.transport.index()
    }

    /// Clear the frame log and restart the hardware timestamps.
    ///
    /// Indices handed out before the reset are not reused; ranges taken
    /// before it simply come back empty.
    pub fn reset(&self) -> Result<()> {
        self.transport.reset()?;
        info!("session reset at index {}", self.index());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Request identifier from this host to `receiver`.
    pub fn request_id(&self, receiver: u8, block: u8, command: u8) -> Identifier {
        Identifier::request(block, command, self.sender, receiver)
    }

    /// Send one command and wait for its acknowledgement, retrying on timeout.
    ///
    /// Error acknowledgements are returned like regular ones; check
    /// `entry.frame.identifier.error`.
    pub fn send_command(
        &self,
        receiver: u8,
        block: u8,
        command: u8,
        payload: &[u8],
        policy: &RetryPolicy,
    ) -> Result<LogEntry> {
        let frame = Frame::new(self.request_id(receiver, block, command), payload)?;
        send_with_retries(&self.transport, &frame, policy, None)
    }

    /// Stop receiving and release the hardware.
    pub fn close(&mut self) {
        self.transport.shutdown();
        info!("session closed");
    }
}
