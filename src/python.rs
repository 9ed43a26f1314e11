//! Python bindings (feature `python`).

use std::time::Duration;

use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::decoder::SampleSet;
use crate::errors::{DriverError, ProtocolError};
use crate::frame::LogEntry;
use crate::identifier::{SPU1, STH1, STH14, STU1, STU14};
use crate::request::RetryPolicy;
use crate::session::Session;
use crate::statistics::{statistics, statistics_raw, StatisticsResult};
use crate::streaming::{expected_sample_rate, AdcConfig, Channel, DataSetLayout, StreamingConfig};
use crate::{bandwidth, logging};

fn to_py_err(e: DriverError) -> PyErr {
    match &e {
        DriverError::Protocol(ProtocolError::TimedOut { .. }) => {
            PyTimeoutError::new_err(e.to_string())
        }
        DriverError::Config(_) => PyValueError::new_err(e.to_string()),
        _ if e.requires_reconnect() => PyConnectionError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

// ============================================================================
// Value types
// ============================================================================

/// One logged frame.
///
/// Attributes:
///     identifier: Raw 29-bit CAN identifier.
///     payload: Payload bytes.
///     error: True for an error acknowledgement.
///     host_time: Seconds since the session (or last reset) started.
///     device_time: Hardware timestamp in seconds.
#[pyclass(name = "LogEntry", frozen)]
#[derive(Clone)]
struct PyLogEntry {
    #[pyo3(get)]
    identifier: u32,
    #[pyo3(get)]
    payload: Vec<u8>,
    #[pyo3(get)]
    error: bool,
    #[pyo3(get)]
    host_time: f64,
    #[pyo3(get)]
    device_time: f64,
}

#[pymethods]
impl PyLogEntry {
    fn __repr__(&self) -> String {
        format!(
            "LogEntry(identifier={:#010X}, payload={:02X?}, error={})",
            self.identifier, self.payload, self.error
        )
    }
}

impl From<LogEntry> for PyLogEntry {
    fn from(entry: LogEntry) -> Self {
        PyLogEntry {
            identifier: entry.frame.identifier.encode(),
            payload: entry.frame.payload().to_vec(),
            error: entry.frame.identifier.error,
            host_time: entry.host_time.as_secs_f64(),
            device_time: entry.device_time.as_secs_f64(),
        }
    }
}

/// Statistics of one sample sequence.
#[pyclass(name = "Statistics", frozen)]
#[derive(Clone)]
struct PyStatistics {
    inner: StatisticsResult,
}

#[pymethods]
impl PyStatistics {
    #[getter]
    fn count(&self) -> usize {
        self.inner.count
    }
    #[getter]
    fn mean(&self) -> f64 {
        self.inner.mean
    }
    #[getter]
    fn median(&self) -> f64 {
        self.inner.median
    }
    #[getter]
    fn std_dev(&self) -> f64 {
        self.inner.std_dev
    }
    #[getter]
    fn snr_db(&self) -> f64 {
        self.inner.snr_db
    }

    /// All values keyed by name.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let s = &self.inner;
        let dict = PyDict::new(py);
        dict.set_item("count", s.count)?;
        for (key, value) in [
            ("min", s.min),
            ("max", s.max),
            ("q1", s.q1),
            ("q5", s.q5),
            ("q25", s.q25),
            ("median", s.median),
            ("q75", s.q75),
            ("q95", s.q95),
            ("q99", s.q99),
            ("mean", s.mean),
            ("variance", s.variance),
            ("std_dev", s.std_dev),
            ("skewness", s.skewness),
            ("kurtosis", s.kurtosis),
            ("interquartile_range", s.interquartile_range),
            ("range_90", s.range_90),
            ("range_98", s.range_98),
            ("range", s.range),
            ("snr_db", s.snr_db),
        ] {
            dict.set_item(key, value)?;
        }
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!(
            "Statistics(count={}, mean={:.2}, std_dev={:.2}, snr_db={:.1})",
            self.inner.count, self.inner.mean, self.inner.std_dev, self.inner.snr_db
        )
    }
}

/// Samples of one streaming run, one list per axis.
#[pyclass(name = "SampleSet", frozen)]
struct PySampleSet {
    inner: SampleSet,
}

#[pymethods]
impl PySampleSet {
    #[getter]
    fn axes(&self) -> Vec<Vec<u16>> {
        self.inner.axes.to_vec()
    }

    #[getter]
    fn counters(&self) -> Option<Vec<Vec<u8>>> {
        self.inner.counters.as_ref().map(|c| c.to_vec())
    }

    #[getter]
    fn sequence_gaps(&self) -> usize {
        self.inner.sequence_gaps()
    }

    /// Statistics of the raw samples of `axis` (0..3), None if it is empty.
    fn statistics(&self, axis: usize) -> PyResult<Option<PyStatistics>> {
        let samples = self
            .inner
            .axes
            .get(axis)
            .ok_or_else(|| PyValueError::new_err(format!("axis {axis} out of range")))?;
        Ok(statistics_raw(samples).map(|inner| PyStatistics { inner }))
    }

    fn __len__(&self) -> usize {
        self.inner.len()
    }

    fn __repr__(&self) -> String {
        let lens: Vec<usize> = self.inner.axes.iter().map(Vec::len).collect();
        format!("SampleSet(axes={lens:?}, gaps={})", self.inner.sequence_gaps())
    }
}

/// Streaming settings.
///
/// Args:
///     channel: "acceleration" or "voltage".
///     axes: Enabled axes as three booleans.
///     layout: "single" or "interleaved3".
#[pyclass(name = "StreamingConfig", frozen)]
#[derive(Clone)]
struct PyStreamingConfig {
    inner: StreamingConfig,
}

#[pymethods]
impl PyStreamingConfig {
    #[new]
    #[pyo3(signature = (
        channel="acceleration",
        axes=(true, false, false),
        layout="single",
        prescaler=2,
        acquisition_time=8,
        oversampling=64,
        reference_mv=3300,
    ))]
    fn new(
        channel: &str,
        axes: (bool, bool, bool),
        layout: &str,
        prescaler: u8,
        acquisition_time: u16,
        oversampling: u16,
        reference_mv: u16,
    ) -> PyResult<Self> {
        let channel = match channel {
            "acceleration" => Channel::Acceleration,
            "voltage" => Channel::Voltage,
            other => return Err(PyValueError::new_err(format!("unknown channel {other:?}"))),
        };
        let layout = match layout {
            "single" => DataSetLayout::Single,
            "interleaved3" => DataSetLayout::Interleaved3,
            other => return Err(PyValueError::new_err(format!("unknown layout {other:?}"))),
        };
        let adc = AdcConfig {
            prescaler,
            acquisition_time,
            oversampling,
            reference_mv,
        };
        adc.validate().map_err(to_py_err)?;
        Ok(Self {
            inner: StreamingConfig {
                channel,
                axes: [axes.0, axes.1, axes.2],
                layout,
                adc,
            },
        })
    }

    /// Samples per second and axis.
    fn expected_sample_rate(&self) -> f64 {
        expected_sample_rate(&self.inner.adc)
    }

    /// Required (CAN, radio) bit rates.
    fn bandwidth(&self) -> (f64, f64) {
        bandwidth::bandwidth(&self.inner.adc, self.inner.enabled_axes())
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.inner)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Connection to a CAN bus.
///
/// Example:
///     >>> session = Session.socketcan("can0")
///     >>> print(session.firmware_version(1))
///     >>> config = StreamingConfig(axes=(True, False, False))
///     >>> start = session.start_stream(config)
///     >>> end = session.stop_stream(config)
///     >>> samples = session.collect_samples(config, start, end)
#[pyclass(name = "Session")]
struct PySession {
    inner: Session,
}

#[pymethods]
impl PySession {
    /// Open a SocketCAN interface.
    #[cfg(target_os = "linux")]
    #[staticmethod]
    fn socketcan(interface: &str) -> PyResult<Self> {
        Session::open_socketcan(interface)
            .map(|inner| PySession { inner })
            .map_err(to_py_err)
    }

    /// Open a serial-line CAN adapter.
    #[staticmethod]
    #[pyo3(signature = (port, bitrate=1_000_000))]
    fn slcan(port: &str, bitrate: u32) -> PyResult<Self> {
        Session::open_slcan(port, bitrate)
            .map(|inner| PySession { inner })
            .map_err(to_py_err)
    }

    /// Send a command and wait for its acknowledgement.
    #[pyo3(signature = (receiver, block, command, payload, max_retries=10, timeout_ms=200))]
    fn send_command(
        &self,
        py: Python<'_>,
        receiver: u8,
        block: u8,
        command: u8,
        payload: Vec<u8>,
        max_retries: u32,
        timeout_ms: u64,
    ) -> PyResult<PyLogEntry> {
        let policy = RetryPolicy::new(max_retries, Duration::from_millis(timeout_ms));
        py.detach(|| {
            self.inner
                .send_command(receiver, block, command, &payload, &policy)
        })
        .map(PyLogEntry::from)
        .map_err(to_py_err)
    }

    /// Start streaming; returns the log index the run starts at.
    fn start_stream(&self, py: Python<'_>, config: &PyStreamingConfig) -> PyResult<usize> {
        py.detach(|| self.inner.start_stream(&config.inner))
            .map_err(to_py_err)
    }

    /// Stop streaming; returns the log index the run ends at.
    fn stop_stream(&self, py: Python<'_>, config: &PyStreamingConfig) -> PyResult<usize> {
        py.detach(|| self.inner.stop_stream(&config.inner))
            .map_err(to_py_err)
    }

    #[pyo3(signature = (config, start, end, counters=false))]
    fn collect_samples(
        &self,
        config: &PyStreamingConfig,
        start: usize,
        end: usize,
        counters: bool,
    ) -> PyResult<PySampleSet> {
        self.inner
            .collect_samples(&config.inner, start..end, counters)
            .map(|inner| PySampleSet { inner })
            .map_err(to_py_err)
    }

    fn firmware_version(&self, py: Python<'_>, receiver: u8) -> PyResult<String> {
        py.detach(|| self.inner.firmware_version(receiver))
            .map(|v| v.to_string())
            .map_err(to_py_err)
    }

    fn index(&self) -> usize {
        self.inner.index()
    }

    fn reset(&self) -> PyResult<()> {
        self.inner.reset().map_err(to_py_err)
    }

    #[getter]
    fn receiver(&self) -> u8 {
        self.inner.receiver()
    }

    #[setter]
    fn set_receiver(&self, receiver: u8) {
        self.inner.set_receiver(receiver);
    }

    #[getter]
    fn stop_guard_frames(&self) -> usize {
        self.inner.stop_guard_frames()
    }

    #[setter]
    fn set_stop_guard_frames(&self, frames: usize) {
        self.inner.set_stop_guard_frames(frames);
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// Statistics of an arbitrary sequence, SNR relative to `full_scale`.
#[pyfunction]
#[pyo3(name = "statistics", signature = (samples, full_scale=1.0))]
fn py_statistics(samples: Vec<f64>, full_scale: f64) -> Option<PyStatistics> {
    statistics(&samples, full_scale).map(|inner| PyStatistics { inner })
}

/// Forward Rust log records to Python's `logging` at `level` (or the environment level).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::init_python_logging(py)?;
    logging::set_python_log_level_str(py, level)
}

#[pymodule]
fn icolink(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySession>()?;
    m.add_class::<PyStreamingConfig>()?;
    m.add_class::<PySampleSet>()?;
    m.add_class::<PyStatistics>()?;
    m.add_class::<PyLogEntry>()?;
    m.add_function(wrap_pyfunction!(py_statistics, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("SPU1", SPU1)?;
    m.add("STH1", STH1)?;
    m.add("STH14", STH14)?;
    m.add("STU1", STU1)?;
    m.add("STU14", STU14)?;

    let policy = RetryPolicy::default();
    m.add("DEFAULT_MAX_RETRIES", policy.max_retries)?;
    m.add("DEFAULT_TIMEOUT_MS", policy.timeout.as_millis() as u64)?;

    Ok(())
}
