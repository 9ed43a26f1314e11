//! In-memory CAN frame and the timestamped log record wrapping it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};
use crate::identifier::Identifier;

/// Maximum payload of a classic CAN frame.
pub const MAX_PAYLOAD: usize = 8;

/// One frame as exchanged with the hardware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub identifier: Identifier,
    data: [u8; MAX_PAYLOAD],
    len: usize,
}

impl Frame {
    /// Build a frame, rejecting payloads longer than eight bytes.
    pub fn new(identifier: Identifier, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLong(payload.len()).into());
        }
        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            identifier,
            data,
            len: payload.len(),
        })
    }

    /// Build a frame from a raw numeric identifier, as read from a driver.
    /// Excess payload bytes beyond eight are dropped.
    pub fn from_raw(raw_id: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_PAYLOAD);
        let mut data = [0u8; MAX_PAYLOAD];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            identifier: Identifier::decode(raw_id),
            data,
            len,
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Payload padded with zeros to eight bytes.
    #[inline]
    pub fn data(&self) -> &[u8; MAX_PAYLOAD] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A received frame together with its arrival times.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub frame: Frame,
    /// Elapsed host time since the session (or the last reset) started.
    pub host_time: Duration,
    /// Hardware arrival timestamp relative to the first frame after the
    /// session (or the last reset) started.
    pub device_time: Duration,
}
