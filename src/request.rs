//! Request/acknowledgement engine.
//!
//! A request is written to the bus, then the frame log is scanned from the
//! high-water mark taken just before sending until the acknowledgement (or the
//! error acknowledgement) shows up or the timeout expires. The protocol has no
//! correlation id: two callers must not have the same command identifier in
//! flight at the same time.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, ProtocolError, Result, TransportError};
use crate::frame::{Frame, LogEntry};
use crate::transport::FrameTransport;

/// Nodes cannot answer faster than this.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Retry and timeout settings for one command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    /// Time to wait for the acknowledgement of one attempt.
    pub timeout: Duration,
    /// Sleep between two scans of the frame log.
    pub idle_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            timeout: Duration::from_millis(200),
            idle_backoff: Duration::from_millis(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, timeout: Duration) -> Self {
        Self {
            max_retries,
            timeout,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout < MIN_TIMEOUT {
            return Err(DriverError::Config(format!(
                "timeout {:?} is below the minimum of {:?}",
                self.timeout, MIN_TIMEOUT
            )));
        }
        Ok(())
    }
}

/// Send `frame` once and wait for its acknowledgement.
///
/// A matching error acknowledgement is returned as well (its identifier has
/// the error flag set); `expected_payload` only constrains regular
/// acknowledgements and is compared as a prefix of the reply payload.
pub fn send_and_await(
    transport: &FrameTransport,
    frame: &Frame,
    policy: &RetryPolicy,
    expected_payload: Option<&[u8]>,
) -> Result<LogEntry> {
    policy.validate()?;

    let request = frame.identifier;
    let ack = request.ack();
    let error_ack = request.error_ack();

    let log = transport.log();
    let start_index = log.index();
    let start_time = log.host_elapsed();
    transport.send(frame)?;

    if !request.is_routable() {
        debug!("{request} is self-addressed, not waiting");
        return Err(ProtocolError::Unroutable {
            identifier: request,
        }
        .into());
    }

    let deadline = Instant::now() + policy.timeout;
    let mut cursor = start_index;
    loop {
        let (hit, next) = log.scan(cursor, |entry| {
            if entry.host_time < start_time {
                return false;
            }
            let id = entry.frame.identifier;
            if id == error_ack {
                return true;
            }
            id == ack
                && expected_payload.map_or(true, |expected| {
                    entry.frame.payload().starts_with(expected)
                })
        });
        if let Some(entry) = hit {
            if entry.frame.identifier.error {
                warn!(
                    "error acknowledgement for {request}: {:02X?}",
                    entry.frame.payload()
                );
            }
            return Ok(entry);
        }
        cursor = next;

        if !transport.is_receiving() {
            return Err(TransportError::ReceiverStopped.into());
        }
        if Instant::now() >= deadline {
            return Err(ProtocolError::TimedOut {
                identifier: request,
                timeout: policy.timeout,
            }
            .into());
        }
        thread::sleep(policy.idle_backoff);
    }
}

/// [`send_and_await`] repeated up to `policy.max_retries + 1` times.
///
/// Only timeouts are retried. Running out of attempts is reported as
/// [`ProtocolError::RetriesExceeded`], after which the session should be
/// considered broken.
pub fn send_with_retries(
    transport: &FrameTransport,
    frame: &Frame,
    policy: &RetryPolicy,
    expected_payload: Option<&[u8]>,
) -> Result<LogEntry> {
    let attempts = policy.max_retries.saturating_add(1);
    for attempt in 1..=attempts {
        match send_and_await(transport, frame, policy, expected_payload) {
            Ok(entry) => return Ok(entry),
            Err(e) if e.is_retryable() => {
                debug!(
                    "{} not acknowledged (attempt {attempt}/{attempts})",
                    frame.identifier
                );
            }
            Err(e) => return Err(e),
        }
    }
    warn!(
        "giving up on {} after {attempts} attempts",
        frame.identifier
    );
    Err(ProtocolError::RetriesExceeded {
        identifier: frame.identifier,
        attempts,
    }
    .into())
}
