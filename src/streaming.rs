//! Streaming session management.
//!
//! A streaming run is started and stopped with a single request each. In
//! between, the node pushes data frames with the acknowledgement identifier
//! of the start request; they simply pile up in the frame log. A run is
//! described by the pair of log indices returned by [`Session::start_stream`]
//! and [`Session::stop_stream`].
//!
//! # Sample rate
//!
//! The node's ADC runs from a 38.4 MHz clock:
//!
//! ```text
//! rate = 38_400_000 / ((prescaler + 1) * (acquisition_time + 13) * oversampling)
//! ```

use std::ops::Range;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::decoder::{self, SampleSet};
use crate::errors::{DriverError, ProtocolError, Result};
use crate::frame::Frame;
use crate::identifier::{block, node_name, streaming, Identifier};
use crate::request::{send_with_retries, RetryPolicy};
use crate::session::Session;

// ============================================================================
// Constants
// ============================================================================

/// ADC clock of the sensor node in Hz.
const ADC_CLOCK_HZ: f64 = 38_400_000.0;

/// Attempts (after the first) for the start and stop requests.
const STREAM_RETRIES: u32 = 3;

/// Wait after the stop acknowledgement before the node is idle.
const STOP_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Acquisition times (in ADC cycles) indexed by their wire code.
pub const ACQUISITION_TIMES: [u16; 10] = [1, 2, 3, 4, 8, 16, 32, 64, 128, 256];

/// Oversampling rates indexed by their wire code.
pub const OVERSAMPLING_RATES: [u16; 13] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Reference voltages in millivolts. On the wire they are sent in 50 mV units.
pub const REFERENCE_VOLTAGES_MV: [u16; 10] = [1250, 1650, 1800, 2100, 2200, 2500, 2700, 3300, 5000, 6600];

const STREAMING_BIT: u8 = 0x80;
const WIDE_BIT: u8 = 0x40;
const DATA_SET_MASK: u8 = 0x07;

// ============================================================================
// Configuration types
// ============================================================================

/// Measured quantity of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Acceleration,
    Voltage,
}

impl Channel {
    /// Streaming block command code.
    pub fn command(self) -> u8 {
        match self {
            Channel::Acceleration => streaming::ACCELERATION,
            Channel::Voltage => streaming::VOLTAGE,
        }
    }
}

/// How samples are packed into a data frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSetLayout {
    /// Three sample slots for the enabled channels, filled densely.
    Single,
    /// One sample of every physical channel per frame.
    Interleaved3,
}

impl DataSetLayout {
    /// Data-set code in the streaming format byte.
    pub fn code(self) -> u8 {
        match self {
            DataSetLayout::Interleaved3 => 1,
            DataSetLayout::Single => 2,
        }
    }

    /// Decode a data-set code. `Ok(None)` is the "no data" code used to stop.
    pub fn from_code(code: u8) -> std::result::Result<Option<Self>, ProtocolError> {
        match code {
            0 => Ok(None),
            1 => Ok(Some(DataSetLayout::Interleaved3)),
            2 => Ok(Some(DataSetLayout::Single)),
            other => Err(ProtocolError::UnknownDataSetLayout(other)),
        }
    }
}

/// Analog front-end settings of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdcConfig {
    pub prescaler: u8,
    /// Acquisition time in ADC cycles, one of [`ACQUISITION_TIMES`].
    pub acquisition_time: u16,
    /// One of [`OVERSAMPLING_RATES`].
    pub oversampling: u16,
    /// Reference voltage in millivolts, one of [`REFERENCE_VOLTAGES_MV`].
    pub reference_mv: u16,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            prescaler: 2,
            acquisition_time: 8,
            oversampling: 64,
            reference_mv: 3300,
        }
    }
}

impl AdcConfig {
    /// Check every field against the values the node accepts.
    pub fn validate(&self) -> Result<()> {
        if !(2..=127).contains(&self.prescaler) {
            return Err(DriverError::Config(format!(
                "prescaler {} outside 2..=127",
                self.prescaler
            )));
        }
        code_of(&ACQUISITION_TIMES, self.acquisition_time, "acquisition time")?;
        code_of(&OVERSAMPLING_RATES, self.oversampling, "oversampling rate")?;
        code_of(&REFERENCE_VOLTAGES_MV, self.reference_mv, "reference voltage")?;
        Ok(())
    }

    /// Payload of the ADC configuration request. `set` selects write vs read.
    pub fn to_payload(&self, set: bool) -> Result<[u8; 8]> {
        self.validate()?;
        let mut payload = [0u8; 8];
        payload[0] = if set { 0x80 } else { 0x00 };
        payload[2] = self.prescaler;
        payload[3] = code_of(&ACQUISITION_TIMES, self.acquisition_time, "acquisition time")?;
        payload[4] = code_of(&OVERSAMPLING_RATES, self.oversampling, "oversampling rate")?;
        payload[5] = (self.reference_mv / 50) as u8;
        Ok(payload)
    }

    /// Parse the configuration reported by a node.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(ProtocolError::Malformed(format!(
                "ADC configuration needs 6 bytes, got {}",
                payload.len()
            ))
            .into());
        }
        let lookup = |table: &[u16], code: u8, what: &str| {
            table.get(code as usize).copied().ok_or_else(|| {
                DriverError::from(ProtocolError::Malformed(format!("unknown {what} code {code}")))
            })
        };
        Ok(Self {
            prescaler: payload[2],
            acquisition_time: lookup(&ACQUISITION_TIMES, payload[3], "acquisition time")?,
            oversampling: lookup(&OVERSAMPLING_RATES, payload[4], "oversampling")?,
            reference_mv: payload[5] as u16 * 50,
        })
    }
}

fn code_of(table: &[u16], value: u16, what: &str) -> Result<u8> {
    table
        .iter()
        .position(|&v| v == value)
        .map(|code| code as u8)
        .ok_or_else(|| DriverError::Config(format!("unsupported {what} {value}")))
}

/// Samples per second produced by one channel for `adc`.
pub fn expected_sample_rate(adc: &AdcConfig) -> f64 {
    ADC_CLOCK_HZ
        / ((adc.prescaler as f64 + 1.0)
            * (adc.acquisition_time as f64 + 13.0)
            * adc.oversampling as f64)
}

/// Everything needed to start a stream and to decode what it produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub channel: Channel,
    pub axes: [bool; 3],
    pub layout: DataSetLayout,
    pub adc: AdcConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel: Channel::Acceleration,
            axes: [true, false, false],
            layout: DataSetLayout::Single,
            adc: AdcConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn enabled_axes(&self) -> usize {
        self.axes.iter().filter(|&&a| a).count()
    }

    /// Format byte that enables this stream.
    pub fn start_format(&self) -> StreamingFormat {
        StreamingFormat {
            streaming: true,
            wide: false,
            channels: self.axes,
            layout: Some(self.layout),
        }
    }

    /// Format byte that disables the stream: no channels, no data sets.
    pub fn stop_format(&self) -> StreamingFormat {
        StreamingFormat {
            streaming: true,
            wide: false,
            channels: [false; 3],
            layout: None,
        }
    }
}

/// First payload byte of streaming requests, acknowledgements and data frames.
///
/// ```text
/// bit 7 streaming | bit 6 24-bit samples | bits 5..3 channels 1..3 | bits 2..0 data sets
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamingFormat {
    pub streaming: bool,
    pub wide: bool,
    pub channels: [bool; 3],
    pub layout: Option<DataSetLayout>,
}

impl StreamingFormat {
    pub fn to_byte(&self) -> u8 {
        let mut byte = self.layout.map_or(0, DataSetLayout::code);
        if self.streaming {
            byte |= STREAMING_BIT;
        }
        if self.wide {
            byte |= WIDE_BIT;
        }
        for (i, &enabled) in self.channels.iter().enumerate() {
            if enabled {
                byte |= 1 << (5 - i);
            }
        }
        byte
    }

    pub fn from_byte(byte: u8) -> std::result::Result<Self, ProtocolError> {
        Ok(Self {
            streaming: byte & STREAMING_BIT != 0,
            wide: byte & WIDE_BIT != 0,
            channels: [byte & 0x20 != 0, byte & 0x10 != 0, byte & 0x08 != 0],
            layout: DataSetLayout::from_code(byte & DATA_SET_MASK)?,
        })
    }
}

// ============================================================================
// Stream state
// ============================================================================

/// Lifecycle of the stream of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Starting,
    Running { start_index: usize },
    Stopping { start_index: usize },
}

/// A channel's stream together with the node it was last started on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChannelStream {
    node: u8,
    state: StreamState,
}

impl Session {
    fn stream_request(&self, node: u8, channel: Channel) -> Identifier {
        self.request_id(node, block::STREAMING, channel.command())
    }

    /// Node streaming `channel`: the one it was last started on, or the
    /// target node if it never was.
    pub fn stream_node(&self, channel: Channel) -> u8 {
        self.streams
            .lock()
            .get(&channel)
            .map_or_else(|| self.receiver(), |s| s.node)
    }

    /// Identifier of the data frames produced by `channel` on its stream node.
    pub fn stream_reply_id(&self, channel: Channel) -> Identifier {
        self.stream_request(self.stream_node(channel), channel).ack()
    }

    pub fn stream_state(&self, channel: Channel) -> StreamState {
        self.streams
            .lock()
            .get(&channel)
            .map_or(StreamState::Stopped, |s| s.state)
    }

    fn set_stream_state(&self, node: u8, channel: Channel, state: StreamState) {
        debug!("stream {:?} of node {} -> {:?}", channel, node_name(node), state);
        self.streams
            .lock()
            .insert(channel, ChannelStream { node, state });
    }

    /// Enable streaming and return the log index the run starts at.
    ///
    /// Failing to get the start acknowledged is fatal for the run.
    pub fn start_stream(&self, config: &StreamingConfig) -> Result<usize> {
        let node = self.receiver();
        if let StreamState::Running { .. } = self.stream_state(config.channel) {
            warn!(
                "{:?} stream already running on {}, restarting on {}",
                config.channel,
                node_name(self.stream_node(config.channel)),
                node_name(node)
            );
        }
        self.set_stream_state(node, config.channel, StreamState::Starting);

        let format = config.start_format().to_byte();
        let frame = Frame::new(self.stream_request(node, config.channel), &[format])?;
        let policy = RetryPolicy {
            max_retries: STREAM_RETRIES,
            ..RetryPolicy::default()
        };

        let start_index = self.index();
        match send_with_retries(self.transport(), &frame, &policy, Some(&[format])) {
            Ok(_) => {
                self.set_stream_state(node, config.channel, StreamState::Running { start_index });
                info!(
                    "streaming {:?} axes={:?} layout={:?} from index {start_index} (~{:.0} Hz)",
                    config.channel,
                    config.axes,
                    config.layout,
                    expected_sample_rate(&config.adc)
                );
                Ok(start_index)
            }
            Err(e) => {
                self.set_stream_state(node, config.channel, StreamState::Stopped);
                Err(e)
            }
        }
    }

    /// Disable streaming and return the log index the run ends at.
    ///
    /// The returned index lies `stop_guard_frames` before the log end (never
    /// before the run's start). A stop that is never acknowledged is only
    /// logged: the node may have stopped anyway. The stop goes to the node
    /// the stream was started on, even if the target node changed since.
    pub fn stop_stream(&self, config: &StreamingConfig) -> Result<usize> {
        let node = self.stream_node(config.channel);
        let start_index = match self.stream_state(config.channel) {
            StreamState::Running { start_index } | StreamState::Stopping { start_index } => {
                start_index
            }
            _ => self.transport().log().first_index(),
        };
        self.set_stream_state(node, config.channel, StreamState::Stopping { start_index });

        let format = config.stop_format().to_byte();
        let frame = Frame::new(self.stream_request(node, config.channel), &[format])?;
        let policy = RetryPolicy {
            max_retries: STREAM_RETRIES,
            ..RetryPolicy::default()
        };

        match send_with_retries(self.transport(), &frame, &policy, Some(&[format])) {
            Ok(_) => {}
            Err(DriverError::Protocol(ProtocolError::RetriesExceeded { attempts, .. })) => {
                warn!("stop of {:?} stream not acknowledged after {attempts} attempts, continuing", config.channel);
            }
            Err(e) => {
                self.set_stream_state(node, config.channel, StreamState::Stopped);
                return Err(e);
            }
        }

        thread::sleep(STOP_SETTLE_DELAY);
        self.set_stream_state(node, config.channel, StreamState::Stopped);

        let end_index = self
            .index()
            .saturating_sub(self.stop_guard_frames())
            .max(start_index);
        info!(
            "stopped {:?} stream, run spans {start_index}..{end_index}",
            config.channel
        );
        Ok(end_index)
    }

    /// Decode the samples of a streaming run of the channel's stream node.
    pub fn collect_samples(
        &self,
        config: &StreamingConfig,
        range: Range<usize>,
        with_counters: bool,
    ) -> Result<SampleSet> {
        let entries = self.transport().log().range(range);
        let expected = self.stream_reply_id(config.channel);
        let mut samples = decoder::decode(config.layout, config.axes, expected, &entries)?;
        if with_counters {
            samples.counters = Some(decoder::decode_counters(
                config.layout,
                config.axes,
                expected,
                &entries,
            )?);
        }
        let gaps = samples.sequence_gaps();
        if gaps > 0 {
            warn!("{gaps} streaming frames lost");
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_adc_rate() {
        let rate = expected_sample_rate(&AdcConfig::default());
        assert!((rate - 9523.809).abs() < 0.01, "rate = {rate}");
    }

    #[test]
    fn adc_payload_roundtrip_and_codes() {
        let adc = AdcConfig {
            prescaler: 4,
            acquisition_time: 16,
            oversampling: 128,
            reference_mv: 1250,
        };
        let payload = adc.to_payload(true).unwrap();
        assert_eq!(payload, [0x80, 0, 4, 5, 7, 25, 0, 0]);
        assert_eq!(AdcConfig::from_payload(&payload).unwrap(), adc);
    }

    #[test]
    fn invalid_adc_values_are_configuration_errors() {
        let adc = AdcConfig {
            oversampling: 3,
            ..AdcConfig::default()
        };
        assert!(matches!(adc.validate(), Err(DriverError::Config(_))));
        let adc = AdcConfig {
            prescaler: 1,
            ..AdcConfig::default()
        };
        assert!(adc.to_payload(true).is_err());
    }

    #[test]
    fn format_bytes() {
        let config = StreamingConfig {
            axes: [true, false, true],
            layout: DataSetLayout::Single,
            ..StreamingConfig::default()
        };
        assert_eq!(config.start_format().to_byte(), 0b1010_1010);
        assert_eq!(config.stop_format().to_byte(), 0x80);

        let parsed = StreamingFormat::from_byte(0b1011_1001).unwrap();
        assert_eq!(parsed.channels, [true, true, true]);
        assert_eq!(parsed.layout, Some(DataSetLayout::Interleaved3));
    }

    #[test]
    fn unsupported_data_set_codes() {
        for code in 3..=7 {
            assert!(matches!(
                StreamingFormat::from_byte(0x80 | code),
                Err(ProtocolError::UnknownDataSetLayout(c)) if c == code
            ));
        }
        assert_eq!(DataSetLayout::from_code(0).unwrap(), None);
    }
}
