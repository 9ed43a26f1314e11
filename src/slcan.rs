//! Serial-line CAN (Lawicel ASCII) backend.
//!
//! Extended data frames travel as
//!
//! ```text
//! T<id:8 hex><dlc:1 hex><data:2 hex * dlc>[<timestamp:4 hex>]\r
//! ```
//!
//! With timestamps enabled (`Z1`) the adapter appends a millisecond counter
//! that wraps at 60 000.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serialport::SerialPort;

use crate::errors::{DriverError, ProtocolError, Result, TransportError};
use crate::frame::{Frame, MAX_PAYLOAD};
use crate::transport::{CanDriver, Received};

/// Serial speed of USB adapters; the CAN bitrate is set separately.
const BAUD_RATE: u32 = 115_200;

/// Read timeout of one poll.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Time the adapter needs to process a configuration command.
const COMMAND_DELAY: Duration = Duration::from_millis(50);

/// Period of the adapter timestamp in milliseconds.
const TIMESTAMP_PERIOD_MS: u64 = 60_000;

const MAX_LINE: usize = 64;
const BELL: u8 = 0x07;

/// Bitrate setup commands.
const BITRATES: [(u32, &str); 9] = [
    (10_000, "S0"),
    (20_000, "S1"),
    (50_000, "S2"),
    (100_000, "S3"),
    (125_000, "S4"),
    (250_000, "S5"),
    (500_000, "S6"),
    (800_000, "S7"),
    (1_000_000, "S8"),
];

pub fn bitrate_command(bitrate: u32) -> Result<&'static str> {
    BITRATES
        .iter()
        .find(|(rate, _)| *rate == bitrate)
        .map(|(_, cmd)| *cmd)
        .ok_or_else(|| {
            let valid: Vec<String> = BITRATES.iter().map(|(r, _)| r.to_string()).collect();
            DriverError::Config(format!(
                "unsupported CAN bitrate {bitrate}, valid: {}",
                valid.join(", ")
            ))
        })
}

// ============================================================================
// Line codec
// ============================================================================

/// ASCII line (with trailing `\r`) that transmits `frame`.
pub fn encode_line(frame: &Frame) -> String {
    let mut line = format!("T{:08X}{:X}", frame.identifier.encode(), frame.len());
    for byte in frame.payload() {
        line.push_str(&format!("{byte:02X}"));
    }
    line.push('\r');
    line
}

fn hex(field: &str) -> std::result::Result<u32, ProtocolError> {
    u32::from_str_radix(field, 16)
        .map_err(|_| ProtocolError::Malformed(format!("invalid hex field {field:?}")))
}

/// Parse one received line (without `\r`).
///
/// `Ok(None)` for lines that are not extended data frames: command
/// acknowledgements, standard frames and remote frames.
pub fn decode_line(line: &str) -> std::result::Result<Option<(Frame, Option<u16>)>, ProtocolError> {
    if !line.starts_with('T') || !line.is_ascii() {
        return Ok(None);
    }
    if line.len() < 10 {
        return Err(ProtocolError::Malformed(format!("short frame line {line:?}")));
    }
    let id = hex(&line[1..9])?;
    let dlc = hex(&line[9..10])? as usize;
    if dlc > MAX_PAYLOAD {
        return Err(ProtocolError::Malformed(format!("DLC {dlc} in {line:?}")));
    }

    let data_end = 10 + 2 * dlc;
    if line.len() < data_end {
        return Err(ProtocolError::Malformed(format!("truncated data in {line:?}")));
    }
    let mut data = Vec::with_capacity(dlc);
    for i in 0..dlc {
        let at = 10 + 2 * i;
        data.push(hex(&line[at..at + 2])? as u8);
    }

    let timestamp = match line.len() - data_end {
        0 => None,
        4 => Some(hex(&line[data_end..])? as u16),
        _ => {
            return Err(ProtocolError::Malformed(format!(
                "trailing characters in {line:?}"
            )))
        }
    };
    Ok(Some((Frame::from_raw(id, &data), timestamp)))
}

/// Turns the wrapping adapter timestamp into a monotonic duration.
#[derive(Debug, Default)]
pub struct TimestampUnwrapper {
    last: Option<u16>,
    wraps: u64,
}

impl TimestampUnwrapper {
    pub fn unwrap(&mut self, raw: u16) -> Duration {
        if let Some(last) = self.last {
            if raw < last {
                self.wraps += 1;
            }
        }
        self.last = Some(raw);
        Duration::from_millis(self.wraps * TIMESTAMP_PERIOD_MS + raw as u64)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct SlcanDriver {
    port: Box<dyn SerialPort>,
    name: String,
    line: String,
    pending: VecDeque<Received>,
    clock: TimestampUnwrapper,
    opened: Instant,
    rejected: usize,
}

impl SlcanDriver {
    /// Open the adapter on `path`, set the CAN bitrate and open the channel.
    pub fn open(path: &str, bitrate: u32) -> Result<Self> {
        let bitrate_cmd = bitrate_command(bitrate)?;
        let port = serialport::new(path, BAUD_RATE)
            .timeout(POLL_TIMEOUT)
            .open()?;

        let mut driver = Self {
            port,
            name: path.to_string(),
            line: String::with_capacity(MAX_LINE),
            pending: VecDeque::new(),
            clock: TimestampUnwrapper::default(),
            opened: Instant::now(),
            rejected: 0,
        };

        // Close a channel left open by a previous user before configuring.
        driver.command("C")?;
        driver.command(bitrate_cmd)?;
        driver.command("Z1")?;
        driver.command("O")?;
        driver.port.clear(serialport::ClearBuffer::Input)?;

        info!("SLCAN adapter {path} opened at {bitrate} bit/s");
        Ok(driver)
    }

    fn command(&mut self, cmd: &str) -> std::result::Result<(), TransportError> {
        debug!("{}: {cmd}", self.name);
        self.port.write_all(format!("{cmd}\r").as_bytes())?;
        self.port.flush()?;
        thread::sleep(COMMAND_DELAY);
        Ok(())
    }

    fn finish_line(&mut self) {
        if self.line.is_empty() {
            return;
        }
        match decode_line(&self.line) {
            Ok(Some((frame, timestamp))) => {
                let device_timestamp = match timestamp {
                    Some(raw) => self.clock.unwrap(raw),
                    None => self.opened.elapsed(),
                };
                self.pending.push_back(Received {
                    frame,
                    device_timestamp,
                });
            }
            Ok(None) => {}
            Err(e) => debug!("{}: {e}", self.name),
        }
        self.line.clear();
    }

    fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                b'\r' | b'\n' => self.finish_line(),
                BELL => {
                    warn!("{}: adapter reported an error", self.name);
                    self.rejected += 1;
                    self.line.clear();
                }
                b if b.is_ascii_graphic() => {
                    self.line.push(b as char);
                    if self.line.len() > MAX_LINE {
                        self.line.clear();
                    }
                }
                _ => {}
            }
        }
    }
}

impl CanDriver for SlcanDriver {
    fn write(&mut self, frame: &Frame) -> std::result::Result<(), TransportError> {
        if self.rejected > 0 {
            self.rejected = 0;
            return Err(TransportError::HardwareRejected(format!(
                "{}: adapter rejected a transmit",
                self.name
            )));
        }
        let line = encode_line(frame);
        match self.port.write_all(line.as_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(TransportError::HardwareRejected(
                format!("{}: transmit buffer full", self.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&mut self) -> std::result::Result<Option<Received>, TransportError> {
        if let Some(rx) = self.pending.pop_front() {
            return Ok(Some(rx));
        }
        let mut buf = [0u8; 256];
        match self.port.read(&mut buf) {
            Ok(n) => self.feed(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.pending.pop_front())
    }

    /// Reopen the channel, which restarts the adapter timestamp.
    fn reset(&mut self) -> std::result::Result<(), TransportError> {
        self.command("C")?;
        self.command("O")?;
        self.pending.clear();
        self.line.clear();
        self.clock.reset();
        self.opened = Instant::now();
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.command("C") {
            warn!("{}: closing channel failed: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;

    #[test]
    fn encodes_extended_frames() {
        let frame = Frame::from_raw(0x0100_6001, &[0xAA, 0x01]);
        assert_eq!(encode_line(&frame), "T010060012AA01\r");
        assert_eq!(encode_line(&Frame::from_raw(0x0100_6001, &[])), "T010060010\r");
    }

    #[test]
    fn decodes_frame_with_timestamp() {
        let (frame, ts) = decode_line("T010040402AA01EA5F").unwrap().unwrap();
        assert_eq!(frame.identifier, Identifier::decode(0x0100_4040));
        assert_eq!(frame.payload(), &[0xAA, 0x01]);
        assert_eq!(ts, Some(0xEA5F));

        let (_, ts) = decode_line("T010040400").unwrap().unwrap();
        assert_eq!(ts, None);
    }

    #[test]
    fn ignores_non_frame_lines() {
        assert!(decode_line("z").unwrap().is_none());
        assert!(decode_line("t1230").unwrap().is_none());
        assert!(decode_line("V1013").unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode_line("T0100").is_err());
        assert!(decode_line("T010040409").is_err());
        assert!(decode_line("T010040402AA").is_err());
        assert!(decode_line("T01004040ZAA").is_err());
    }

    #[test]
    fn timestamp_unwraps_at_sixty_seconds() {
        let mut clock = TimestampUnwrapper::default();
        assert_eq!(clock.unwrap(59_990), Duration::from_millis(59_990));
        assert_eq!(clock.unwrap(5), Duration::from_millis(60_005));
        assert_eq!(clock.unwrap(100), Duration::from_millis(60_100));
        clock.reset();
        assert_eq!(clock.unwrap(3), Duration::from_millis(3));
    }

    #[test]
    fn bitrate_table() {
        assert_eq!(bitrate_command(1_000_000).unwrap(), "S8");
        assert_eq!(bitrate_command(125_000).unwrap(), "S4");
        assert!(matches!(bitrate_command(42), Err(DriverError::Config(_))));
    }
}
