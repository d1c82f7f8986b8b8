//! Log setup for the demo binary and, with the `python` feature, a bridge
//! that forwards `log` records into Python's `logging` module.
//!
//! The level comes from `CMS50EW_LOG`, then `RUST_LOG`, then defaults to `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

const LEVEL_VARS: [&str; 2] = ["CMS50EW_LOG", "RUST_LOG"];

fn level_from(value: Option<&str>) -> Option<LevelFilter> {
    value.and_then(|v| v.trim().parse::<LevelFilter>().ok())
}

fn env_level() -> LevelFilter {
    LEVEL_VARS
        .iter()
        .find_map(|var| level_from(std::env::var(var).ok().as_deref()))
        .unwrap_or(LevelFilter::Info)
}

/// Install an `env_logger` writing to stderr. Later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let level = env_level();
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        let installed = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_target(true)
            .try_init();
        if installed.is_err() {
            log::set_max_level(level);
        }
    });
}

#[cfg(feature = "python")]
pub use self::python::{init_python_logging, set_python_log_level, set_python_log_level_str};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, level_from};

    static PY_LOG_ONCE: Once = Once::new();
    static BRIDGE: OnceCell<&'static PythonLogBridge> = OnceCell::new();

    /// Forwards records to `logging.getLogger(<target with dots>)`.
    struct PythonLogBridge {
        ceiling: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        // target -> (effective level, logger)
        loggers: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    fn py_level(level: Level) -> u8 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PythonLogBridge {
        fn new(py: Python<'_>, ceiling: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                ceiling: Mutex::new(ceiling),
                logging: py.import("logging")?.into(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn ceiling(&self) -> LevelFilter {
            self.ceiling
                .lock()
                .map(|c| *c)
                .unwrap_or(LevelFilter::Off)
        }

        fn forget_loggers(&self) {
            if let Ok(mut loggers) = self.loggers.lock() {
                loggers.clear();
            }
        }

        /// Most verbose level the Python logger accepts.
        fn effective_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (py_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, name: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut loggers = self
                .loggers
                .lock()
                .map_err(|_| pyo3::exceptions::PyRuntimeError::new_err("logger cache poisoned"))?;
            if let Some((level, logger)) = loggers.get(name) {
                return Ok((*level, logger.clone_ref(py)));
            }
            let logger = self.logging.bind(py).call_method1("getLogger", (name,))?;
            let level = Self::effective_level(&logger)?;
            let logger = logger.unbind();
            loggers.insert(name.to_string(), (level, logger.clone_ref(py)));
            Ok((level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let (accepted, logger) = self.logger_for(py, &name)?;
            let level = record.level().to_level_filter();
            if level > accepted || level > self.ceiling() {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
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

    impl Log for PythonLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.ceiling()
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

    fn install(py: Python<'_>, level: LevelFilter) {
        PY_LOG_ONCE.call_once(|| match PythonLogBridge::new(py, level) {
            Ok(bridge) => {
                let bridge: &'static PythonLogBridge = Box::leak(Box::new(bridge));
                if log::set_logger(bridge).is_ok() {
                    log::set_max_level(level);
                    let _ = BRIDGE.set(bridge);
                }
            }
            Err(e) => e.restore(py),
        });
    }

    /// Route Rust log records into Python's `logging`. Only the first call installs.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        install(py, env_level());
        Ok(())
    }

    /// Change the most verbose level forwarded to Python.
    ///
    /// Also drops cached Python loggers, so changes to the Python logging
    /// configuration take effect.
    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        install(py, level);
        if let Some(bridge) = BRIDGE.get() {
            if let Ok(mut ceiling) = bridge.ceiling.lock() {
                *ceiling = level;
            }
            bridge.forget_loggers();
        }
        log::set_max_level(level);
        Ok(())
    }

    /// Like [`set_python_log_level`] but from a level name; `None` or garbage means the env default.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        set_python_log_level(py, level_from(level).unwrap_or_else(env_level))
    }
}
