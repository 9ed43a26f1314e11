//! Hardware abstraction and the background receive loop.
//!
//! All driver calls, writes as well as reads, go through one mutex. The
//! receive loop takes the lock only for a single short poll and the append
//! of what it returned, so a writer never waits much longer than one driver
//! read timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::errors::{Result, TransportError};
use crate::frame::Frame;
use crate::frame_log::FrameLog;

/// Pause of the receive loop after a poll that returned no frame.
const RECEIVE_IDLE: Duration = Duration::from_micros(200);

// ============================================================================
// Driver boundary
// ============================================================================

/// A frame as delivered by a driver, with the hardware arrival timestamp.
#[derive(Clone, Debug)]
pub struct Received {
    pub frame: Frame,
    pub device_timestamp: Duration,
}

/// Contract every CAN backend implements.
///
/// `read` must not block for long: return `Ok(None)` when no frame is
/// available within a short poll interval.
pub trait CanDriver: Send {
    /// Queue a frame for transmission.
    fn write(&mut self, frame: &Frame) -> std::result::Result<(), TransportError>;

    /// Fetch the next inbound frame, if one is available.
    fn read(&mut self) -> std::result::Result<Option<Received>, TransportError>;

    /// Reset the controller and restart the hardware timestamp counter.
    fn reset(&mut self) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    /// Release the hardware. Called once when the session shuts down.
    fn close(&mut self) {}
}

// ============================================================================
// Frame transport
// ============================================================================

/// Owns the driver, the frame log and the receive thread.
pub struct FrameTransport {
    driver: Arc<Mutex<Box<dyn CanDriver>>>,
    log: Arc<FrameLog>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl FrameTransport {
    /// Take ownership of `driver` and start receiving.
    pub fn start(driver: Box<dyn CanDriver>) -> Result<Self> {
        let driver = Arc::new(Mutex::new(driver));
        let log = Arc::new(FrameLog::new());
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let driver = Arc::clone(&driver);
            let log = Arc::clone(&log);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("can-receive".into())
                .spawn(move || receive_loop(driver, log, running))?
        };
        info!("frame transport started");

        Ok(Self {
            driver,
            log,
            running,
            receiver: Some(handle),
        })
    }

    /// Write one frame to the bus.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_receiving() {
            return Err(TransportError::ReceiverStopped.into());
        }
        debug!("tx {} {:02X?}", frame.identifier, frame.payload());
        self.driver.lock().write(frame)?;
        Ok(())
    }

    pub fn log(&self) -> &FrameLog {
        &self.log
    }

    /// Current high-water mark of the frame log.
    pub fn index(&self) -> usize {
        self.log.index()
    }

    /// False once the receive loop hit a fatal error or was shut down.
    pub fn is_receiving(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the frame log and restart host and device time bases.
    ///
    /// The receive loop reads and appends under the driver lock, so holding
    /// it here means no frame read before the reset lands in the new log.
    pub fn reset(&self) -> Result<()> {
        let mut driver = self.driver.lock();
        driver.reset()?;
        self.log.reset();
        debug!("frame log reset, next index {}", self.log.index());
        Ok(())
    }

    /// Stop the receive loop and release the hardware.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                error!("receive thread panicked");
            }
            self.driver.lock().close();
            info!("frame transport stopped");
        }
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(
    driver: Arc<Mutex<Box<dyn CanDriver>>>,
    log: Arc<FrameLog>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        // The append stays under the driver lock so a reset cannot slip in
        // between reading a frame and logging it.
        let polled = {
            let mut guard = driver.lock();
            match guard.read() {
                Ok(Some(rx)) => {
                    log.append(rx.frame, rx.device_timestamp);
                    Ok(true)
                }
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            }
        };
        match polled {
            Ok(true) => {}
            Ok(false) => thread::sleep(RECEIVE_IDLE),
            Err(e) => {
                error!("receive loop stopped: {e}");
                running.store(false, Ordering::Release);
            }
        }
    }
    debug!("receive loop exited at index {}", log.index());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use std::collections::VecDeque;
    use std::time::Instant;

    struct Scripted {
        inbound: VecDeque<std::result::Result<Received, TransportError>>,
        reject_writes: bool,
    }

    impl CanDriver for Scripted {
        fn write(&mut self, _frame: &Frame) -> std::result::Result<(), TransportError> {
            if self.reject_writes {
                return Err(TransportError::HardwareRejected("bus off".into()));
            }
            Ok(())
        }

        fn read(&mut self) -> std::result::Result<Option<Received>, TransportError> {
            self.inbound.pop_front().transpose()
        }
    }

    fn received(n: u8) -> Received {
        Received {
            frame: Frame::from_raw(Identifier::request(0, 1, 1, 0).ack().encode(), &[n]),
            device_timestamp: Duration::from_millis(n as u64),
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn receive_loop_fills_log() {
        let driver = Scripted {
            inbound: (0..4).map(|n| Ok(received(n))).collect(),
            reject_writes: false,
        };
        let transport = FrameTransport::start(Box::new(driver)).unwrap();
        wait_until(|| transport.index() == 4);
        let entries = transport.log().range(0..4);
        assert_eq!(entries[3].frame.payload(), &[3]);
        assert_eq!(entries[3].device_time, Duration::from_millis(3));
    }

    #[test]
    fn overrun_stops_receiving() {
        let driver = Scripted {
            inbound: VecDeque::from(vec![Ok(received(0)), Err(TransportError::Overrun)]),
            reject_writes: false,
        };
        let transport = FrameTransport::start(Box::new(driver)).unwrap();
        wait_until(|| !transport.is_receiving());
        assert_eq!(transport.index(), 1);

        let frame = Frame::from_raw(0, &[]);
        let err = transport.send(&frame).unwrap_err();
        assert!(err.requires_reconnect());
    }

    /// Emits a frame on every other poll, tagged with the number of resets
    /// seen so far; its clock restarts on reset.
    struct Epochs {
        epoch: u8,
        clock_ms: u64,
        polls: u64,
    }

    impl CanDriver for Epochs {
        fn write(&mut self, _frame: &Frame) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn read(&mut self) -> std::result::Result<Option<Received>, TransportError> {
            self.polls += 1;
            if self.polls % 2 == 0 {
                return Ok(None);
            }
            let rx = Received {
                frame: Frame::from_raw(0, &[self.epoch]),
                device_timestamp: Duration::from_millis(self.clock_ms),
            };
            self.clock_ms += 1;
            Ok(Some(rx))
        }

        fn reset(&mut self) -> std::result::Result<(), TransportError> {
            self.epoch = self.epoch.wrapping_add(1);
            self.clock_ms = 0;
            Ok(())
        }
    }

    #[test]
    fn reset_while_receiving_keeps_only_new_frames() {
        let driver = Epochs {
            epoch: 0,
            clock_ms: 0,
            polls: 0,
        };
        let transport = FrameTransport::start(Box::new(driver)).unwrap();
        for epoch in 1..=200u8 {
            transport.reset().unwrap();
            let first = transport.log().first_index();
            wait_until(|| transport.index() >= first + 3);

            let entries = transport.log().range(first..transport.index());
            for (n, entry) in entries.iter().enumerate() {
                assert_eq!(entry.frame.payload(), &[epoch], "stale frame after reset {epoch}");
                assert_eq!(entry.device_time, Duration::from_millis(n as u64));
            }
        }
    }

    #[test]
    fn rejected_write_surfaces_to_caller() {
        let driver = Scripted {
            inbound: VecDeque::new(),
            reject_writes: true,
        };
        let transport = FrameTransport::start(Box::new(driver)).unwrap();
        let frame = Frame::from_raw(0, &[]);
        assert!(matches!(
            transport.send(&frame),
            Err(crate::DriverError::Transport(TransportError::HardwareRejected(_)))
        ));
    }
}
