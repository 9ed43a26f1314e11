//! Host-side driver for STH sensor nodes and STU bridge nodes on a CAN bus.
//!
//! The crate covers the whole path from bits on the wire to validated
//! measurement data:
//!
//! - [`identifier`]: packing of the 29-bit extended identifier that carries
//!   the opcode and routing of every frame.
//! - [`transport`] and [`frame_log`]: a background thread drains the CAN
//!   driver into an append-only, indexable frame log.
//! - [`request`]: send a command, scan the log for its acknowledgement,
//!   retry on timeout.
//! - [`streaming`] and [`decoder`]: start and stop streaming runs and turn
//!   the logged data frames into per-axis samples.
//! - [`statistics`] and [`bandwidth`]: judge the quality of a run.
//!
//! # Timing
//!
//! Every logged frame carries two timestamps: the host time since the
//! session (or last reset) started and the hardware arrival time reported
//! by the driver. Requests only ever match frames logged after they were
//! sent, so log indices taken before a request bound the search for its
//! reply.
//!
//! # Example
//! ```ignore
//! use icolink::{Session, StreamingConfig, STH1};
//!
//! let session = Session::open_slcan("/dev/ttyACM0", 1_000_000)?;
//! println!("firmware {}", session.firmware_version(STH1)?);
//!
//! let config = StreamingConfig::default();
//! let start = session.start_stream(&config)?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! let end = session.stop_stream(&config)?;
//! let samples = session.collect_samples(&config, start..end, true)?;
//! let stats = icolink::statistics_raw(samples.axis(0));
//! ```

pub mod bandwidth;
pub mod commands;
pub mod decoder;
mod errors;
pub mod frame;
pub mod frame_log;
pub mod identifier;
pub mod logging;
pub mod request;
pub mod session;
pub mod slcan;
#[cfg(target_os = "linux")]
pub mod socketcan;
pub mod statistics;
pub mod streaming;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use bandwidth::bandwidth;
pub use commands::{
    CalibrationElement, CalibrationFactor, CalibrationMeasurement, CalibrationMethod, NodeState,
    OperatingTime, PowerCycles, Version,
};
pub use decoder::{decode, decode_counters, sequence_gaps, SampleSet};
pub use errors::*;
pub use frame::{Frame, LogEntry};
pub use frame_log::FrameLog;
pub use identifier::{ack_of, encode, error_ack_of, Identifier, SPU1, STH1, STH14, STU1, STU14};
pub use request::{send_and_await, send_with_retries, RetryPolicy};
pub use session::Session;
pub use slcan::SlcanDriver;
#[cfg(target_os = "linux")]
pub use socketcan::SocketCanDriver;
pub use statistics::{quantile, statistics, statistics_raw, to_physical, StatisticsResult};
pub use streaming::{
    expected_sample_rate, AdcConfig, Channel, DataSetLayout, StreamState, StreamingConfig,
};
pub use transport::{CanDriver, FrameTransport, Received};
