//! Bit packing of the extended CAN identifier used by STH/STU nodes.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! | block (6) | command (8) | request (1) | error (1) | sender (6) | receiver (6) |
//! ```
//!
//! The upper sixteen bits form the "command word", the lower twelve bits the
//! routing part. Out-of-range field values are masked to their bit width,
//! never rejected, so the encoding matches what the hardware puts on the bus.

use std::fmt;

use serde::{Deserialize, Serialize};

const NODE_MASK: u8 = 0x3F;
const BLOCK_MASK: u8 = 0x3F;

// ============================================================================
// Node numbers
// ============================================================================

/// Host (the machine running this crate).
pub const SPU1: u8 = 0;
/// First sensor node.
pub const STH1: u8 = 1;
/// Last addressable sensor node.
pub const STH14: u8 = 14;
/// First bridge node.
pub const STU1: u8 = 15;
/// Last addressable bridge node.
pub const STU14: u8 = 28;

/// Human readable name of a node number.
pub fn node_name(node: u8) -> String {
    match node & NODE_MASK {
        SPU1 => "SPU1".to_string(),
        n @ STH1..=STH14 => format!("STH{n}"),
        n @ STU1..=STU14 => format!("STU{}", n - STU1 + 1),
        n => format!("NODE{n}"),
    }
}

// ============================================================================
// Opcode tables
// ============================================================================

/// Command families.
pub mod block {
    pub const SYSTEM: u8 = 0x00;
    pub const STREAMING: u8 = 0x04;
    pub const STATISTICAL_DATA: u8 = 0x08;
    pub const CONFIGURATION: u8 = 0x28;
    pub const EEPROM: u8 = 0x3D;
    pub const PRODUCT_DATA: u8 = 0x3E;
}

pub mod system {
    pub const RESET: u8 = 0x01;
    pub const GET_SET_STATE: u8 = 0x02;
    pub const BLUETOOTH: u8 = 0x09;
}

pub mod streaming {
    pub const ACCELERATION: u8 = 0x01;
    pub const VOLTAGE: u8 = 0x20;
}

pub mod statistical_data {
    pub const POWER_ON_OFF: u8 = 0x00;
    pub const OPERATING_TIME: u8 = 0x01;
}

pub mod configuration {
    pub const ADC: u8 = 0x01;
    pub const CALIBRATION_FACTOR_K: u8 = 0x60;
    pub const CALIBRATION_FACTOR_D: u8 = 0x61;
    pub const CALIBRATE_MEASUREMENT: u8 = 0x62;
}

pub mod eeprom {
    pub const READ: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
}

pub mod product_data {
    pub const GTIN: u8 = 0x00;
    pub const HARDWARE_VERSION: u8 = 0x01;
    pub const FIRMWARE_VERSION: u8 = 0x02;
    pub const RELEASE_NAME: u8 = 0x03;
    pub const SERIAL_NUMBER_1: u8 = 0x04;
    pub const NAME_1: u8 = 0x08;
}

/// Subcommands of `system::BLUETOOTH`, carried in the first payload byte and
/// relayed by an STU to the radio link.
pub mod bluetooth {
    pub const ACTIVATE: u8 = 0x01;
    pub const DEVICE_COUNT: u8 = 0x02;
    pub const DEVICE_NAME_1: u8 = 0x05;
    pub const DEVICE_NAME_2: u8 = 0x06;
    pub const CONNECT_DEVICE: u8 = 0x07;
    pub const CHECK_CONNECTED: u8 = 0x08;
    pub const DISCONNECT: u8 = 0x09;
    pub const RSSI: u8 = 0x0C;
    pub const MAC_ADDRESS: u8 = 0x11;
}

// ============================================================================
// Identifier
// ============================================================================

/// Structured view of a CAN identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub block: u8,
    pub command: u8,
    pub request: bool,
    pub error: bool,
    pub sender: u8,
    pub receiver: u8,
}

impl Identifier {
    /// Request identifier for `block`/`command` from `sender` to `receiver`.
    pub fn request(block: u8, command: u8, sender: u8, receiver: u8) -> Self {
        Self {
            block: block & BLOCK_MASK,
            command,
            request: true,
            error: false,
            sender: sender & NODE_MASK,
            receiver: receiver & NODE_MASK,
        }
    }

    /// Pack into the numeric identifier.
    pub fn encode(&self) -> u32 {
        encode(
            self.block,
            self.command,
            self.request,
            self.error,
            self.sender,
            self.receiver,
        )
    }

    /// Exact inverse of [`Identifier::encode`] for all in-range fields.
    pub fn decode(raw: u32) -> Self {
        let word = (raw >> 12) as u16;
        Self {
            block: ((word >> 10) as u8) & BLOCK_MASK,
            command: (word >> 2) as u8,
            request: word & 0b10 != 0,
            error: word & 0b01 != 0,
            sender: ((raw >> 6) as u8) & NODE_MASK,
            receiver: (raw as u8) & NODE_MASK,
        }
    }

    /// Identifier a node uses to acknowledge this request.
    pub fn ack(&self) -> Self {
        Self {
            request: false,
            error: false,
            sender: self.receiver,
            receiver: self.sender,
            ..*self
        }
    }

    /// Identifier a node uses to reject this request.
    pub fn error_ack(&self) -> Self {
        Self {
            error: true,
            ..self.ack()
        }
    }

    /// Requests with identical sender and receiver are never acknowledged.
    pub fn is_routable(&self) -> bool {
        self.sender != self.receiver
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#04x}:{:#04x} {}{}] {} -> {}",
            self.block,
            self.command,
            if self.request { "req" } else { "ack" },
            if self.error { " err" } else { "" },
            node_name(self.sender),
            node_name(self.receiver)
        )
    }
}

/// Pack the individual fields into the numeric identifier.
pub fn encode(block: u8, command: u8, request: bool, error: bool, sender: u8, receiver: u8) -> u32 {
    let word = ((block & BLOCK_MASK) as u32) << 10
        | (command as u32) << 2
        | (request as u32) << 1
        | error as u32;
    word << 12 | ((sender & NODE_MASK) as u32) << 6 | (receiver & NODE_MASK) as u32
}

/// Numeric acknowledgement identifier for a numeric request identifier.
pub fn ack_of(raw: u32) -> u32 {
    Identifier::decode(raw).ack().encode()
}

/// Numeric error acknowledgement identifier for a numeric request identifier.
pub fn error_ack_of(raw: u32) -> u32 {
    Identifier::decode(raw).error_ack().encode()
}
