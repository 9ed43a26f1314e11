//! Log setup for the CLI (`env_logger`) and, with the `python` feature, a
//! bridge that hands `log` records to Python's `logging` module.

use std::sync::Once;

use log::LevelFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "ICOLINK_LOG";

static STDERR_LOGGER: Once = Once::new();

/// Level from `ICOLINK_LOG`, then `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .find_map(|var| parse_level(std::env::var(var).ok().as_deref()))
        .unwrap_or(LevelFilter::Info)
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Install the stderr logger of the `icolink` binary. Later calls are no-ops.
pub fn init_rust_logging() {
    let level = env_level();
    STDERR_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .init();
    });
}

#[cfg(feature = "python")]
pub use bridge::{
    init_python_logging, reset_python_logging_cache, set_python_log_level,
    set_python_log_level_str,
};

#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::Once;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use parking_lot::Mutex;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static INSTALL: Once = Once::new();
    static BRIDGE: OnceCell<&'static PythonBridge> = OnceCell::new();

    /// Numeric levels of Python's `logging`, most verbose first.
    const PY_LEVELS: [(Level, u32); 5] = [
        (Level::Trace, 5),
        (Level::Debug, 10),
        (Level::Info, 20),
        (Level::Warn, 30),
        (Level::Error, 40),
    ];

    fn py_level(level: Level) -> u32 {
        PY_LEVELS
            .iter()
            .find(|(l, _)| *l == level)
            .map_or(40, |(_, n)| *n)
    }

    /// Python logger for one Rust module path, with the most verbose level
    /// it had enabled when it was looked up.
    struct Target {
        enabled: LevelFilter,
        logger: Py<PyAny>,
    }

    struct PythonBridge {
        ceiling: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        targets: Mutex<HashMap<String, Target>>,
    }

    impl PythonBridge {
        fn resolve(&self, py: Python<'_>, name: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut targets = self.targets.lock();
            if let Some(t) = targets.get(name) {
                return Ok((t.enabled, t.logger.clone_ref(py)));
            }
            let logger = self.logging.bind(py).call_method1("getLogger", (name,))?;
            let mut enabled = LevelFilter::Off;
            for (level, number) in PY_LEVELS {
                if logger.call_method1("isEnabledFor", (number,))?.is_truthy()? {
                    enabled = level.to_level_filter();
                    break;
                }
            }
            let logger = logger.unbind();
            targets.insert(
                name.to_string(),
                Target {
                    enabled,
                    logger: logger.clone_ref(py),
                },
            );
            Ok((enabled, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let (enabled, logger) = self.resolve(py, &name)?;
            let level = record.level().to_level_filter();
            if level > enabled || level > *self.ceiling.lock() {
                return Ok(());
            }
            let logger = logger.bind(py);
            let none = py.None();
            // makeRecord(name, level, fn, lno, msg, args, exc_info, func, extra)
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &name,
                    py_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PythonBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *self.ceiling.lock()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Idempotent.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut outcome = Ok(());
        INSTALL.call_once(|| {
            let logging = match py.import("logging") {
                Ok(module) => module,
                Err(e) => {
                    outcome = Err(e);
                    return;
                }
            };
            let bridge: &'static PythonBridge = Box::leak(Box::new(PythonBridge {
                ceiling: Mutex::new(level),
                logging: logging.unbind(),
                targets: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(bridge).is_ok() {
                log::set_max_level(level);
                let _ = BRIDGE.set(bridge);
            }
        });
        outcome
    }

    /// Forget the per-module levels after Python's logging config changed.
    pub fn reset_python_logging_cache() {
        if let Some(bridge) = BRIDGE.get() {
            bridge.targets.lock().clear();
        }
    }

    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(bridge) = BRIDGE.get() {
            *bridge.ceiling.lock() = level;
        }
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }

    /// Like [`set_python_log_level`], falling back to the environment level.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        set_python_log_level(py, parse_level(level).unwrap_or_else(env_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some("WARN")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some(" trace ")), Some(LevelFilter::Trace));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn level_names_round_trip() {
        for level in [LevelFilter::Off, LevelFilter::Info, LevelFilter::Trace] {
            assert_eq!(parse_level(Some(level.as_str())), Some(level));
        }
    }
}
