//! Python bindings (`cms50ew._core`).

use std::ops::ControlFlow;

use pyo3::exceptions::{PyConnectionError, PyIOError, PyKeyError, PyRuntimeError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::cms50ew::Cms50ew;
use crate::commands::{lookup, Command};
use crate::errors::{DriverError, TransportError};
use crate::live::{LiveConfig, LiveReading, DEFAULT_FINGER_OUT_THRESHOLD};
use crate::logging;
use crate::parser::Sample;
use crate::session::{SessionEntry, SessionMetadata, DEVICE_SAMPLE_INTERVAL_SECS};
use crate::transport::{LinkConfig, Target};

fn to_py_err(e: DriverError) -> PyErr {
    match e {
        DriverError::Transport(TransportError::Bluetooth(_)) | DriverError::ConnectionLost { .. } => {
            PyConnectionError::new_err(e.to_string())
        }
        DriverError::Transport(_) => PyIOError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// One reading from the sensor.
///
/// Attributes:
///     finger_present: True when the sensor reports a finger.
///     pulse_bpm: Pulse rate in beats per minute.
///     spo2_pct: Oxygen saturation in percent.
#[pyclass(name = "Sample", frozen, eq)]
#[derive(Clone, PartialEq, Eq)]
struct PySample {
    #[pyo3(get)]
    finger_present: bool,
    #[pyo3(get)]
    pulse_bpm: u8,
    #[pyo3(get)]
    spo2_pct: u8,
}

#[pymethods]
impl PySample {
    fn __repr__(&self) -> String {
        format!(
            "Sample(finger_present={}, pulse_bpm={}, spo2_pct={})",
            self.finger_present, self.pulse_bpm, self.spo2_pct
        )
    }
}

impl From<Sample> for PySample {
    fn from(s: Sample) -> Self {
        PySample {
            finger_present: s.finger_present,
            pulse_bpm: s.pulse_bpm,
            spo2_pct: s.spo2_pct,
        }
    }
}

/// One recorded point of a session.
#[pyclass(name = "SessionEntry", frozen)]
#[derive(Clone)]
struct PySessionEntry {
    #[pyo3(get)]
    elapsed_seconds: f64,
    #[pyo3(get)]
    finger_present: bool,
    #[pyo3(get)]
    pulse_bpm: u8,
    #[pyo3(get)]
    spo2_pct: u8,
}

#[pymethods]
impl PySessionEntry {
    fn __repr__(&self) -> String {
        format!(
            "SessionEntry(t={}, finger={}, pulse={}, spo2={})",
            self.elapsed_seconds,
            self.finger(),
            self.pulse_bpm,
            self.spo2_pct
        )
    }

    /// `"Y"` or `"N"`, as in exported files.
    #[getter]
    fn finger(&self) -> &'static str {
        if self.finger_present {
            "Y"
        } else {
            "N"
        }
    }

    /// Export row as a dictionary keyed like the CSV header.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("Time [s]", self.elapsed_seconds)?;
        dict.set_item("Finger out", self.finger())?;
        dict.set_item("Pulse rate [bpm]", self.pulse_bpm)?;
        dict.set_item("SpO2 [%]", self.spo2_pct)?;
        Ok(dict)
    }
}

impl From<&SessionEntry> for PySessionEntry {
    fn from(e: &SessionEntry) -> Self {
        PySessionEntry {
            elapsed_seconds: e.elapsed_seconds,
            finger_present: e.finger_present,
            pulse_bpm: e.pulse_bpm,
            spo2_pct: e.spo2_pct,
        }
    }
}

/// Stored session summary.
#[pyclass(name = "SessionInfo", frozen)]
#[derive(Clone)]
struct PySessionInfo {
    #[pyo3(get)]
    available: bool,
    #[pyo3(get)]
    duration_seconds: f64,
    #[pyo3(get)]
    expected_point_count: usize,
}

#[pymethods]
impl PySessionInfo {
    fn __repr__(&self) -> String {
        format!(
            "SessionInfo(available={}, duration_seconds={}, expected_point_count={})",
            self.available, self.duration_seconds, self.expected_point_count
        )
    }
}

impl From<SessionMetadata> for PySessionInfo {
    fn from(m: SessionMetadata) -> Self {
        PySessionInfo {
            available: m.available,
            duration_seconds: m.duration.as_secs_f64(),
            expected_point_count: m.expected_point_count,
        }
    }
}

/// Debounced live reading. `pulse_bpm`/`spo2_pct` are None when not applicable.
#[pyclass(name = "LiveReading", frozen)]
#[derive(Clone)]
struct PyLiveReading {
    #[pyo3(get)]
    status: String,
    #[pyo3(get)]
    pulse_bpm: Option<u8>,
    #[pyo3(get)]
    spo2_pct: Option<u8>,
    #[pyo3(get)]
    sample: PySample,
}

#[pymethods]
impl PyLiveReading {
    fn __repr__(&self) -> String {
        format!(
            "LiveReading(status={:?}, pulse_bpm={:?}, spo2_pct={:?})",
            self.status, self.pulse_bpm, self.spo2_pct
        )
    }
}

impl From<&LiveReading> for PyLiveReading {
    fn from(r: &LiveReading) -> Self {
        PyLiveReading {
            status: r.status.as_str().to_string(),
            pulse_bpm: r.pulse_bpm,
            spo2_pct: r.spo2_pct,
            sample: r.sample.into(),
        }
    }
}

/// CMS50EW pulse oximeter.
///
/// Example:
///     >>> oxi = Cms50ew("/dev/ttyUSB0")
///     >>> oxi.initiate()
///     >>> print(oxi.vendor(), oxi.model())
///     >>> entries = oxi.download(lambda done, total: print(done, total))
#[pyclass(name = "Cms50ew", unsendable)]
struct PyCms50ew {
    inner: Cms50ew,
}

#[pymethods]
impl PyCms50ew {
    /// Open a USB serial adapter (e.g. `/dev/ttyUSB0`).
    #[new]
    fn new(path: &str) -> PyResult<Self> {
        Cms50ew::connect_serial(path)
            .map(|inner| PyCms50ew { inner })
            .map_err(to_py_err)
    }

    /// Same as the constructor.
    #[staticmethod]
    fn open_serial(path: &str) -> PyResult<Self> {
        Self::new(path)
    }

    /// Connect over Bluetooth RFCOMM.
    ///
    /// Args:
    ///     mac: Device address (e.g. "00:1C:05:AB:CD:EF")
    ///     pin: PIN offered if the device asks for pairing
    ///
    /// Raises:
    ///     ConnectionError: If the connection fails after retries
    #[staticmethod]
    #[pyo3(signature = (mac, pin=None))]
    fn connect(mac: &str, pin: Option<String>) -> PyResult<Self> {
        let config = LinkConfig {
            pin,
            ..LinkConfig::default()
        };
        Cms50ew::open(Target::Bluetooth(mac.to_string()), &config)
            .map(|inner| PyCms50ew { inner })
            .map_err(to_py_err)
    }

    /// Greet the device. Needed before any other command.
    fn initiate(&mut self) -> PyResult<()> {
        self.inner.initiate().map_err(to_py_err)
    }

    fn vendor(&mut self) -> PyResult<String> {
        self.inner.vendor().map_err(to_py_err)
    }

    fn model(&mut self) -> PyResult<String> {
        self.inner.model().map_err(to_py_err)
    }

    fn user(&mut self) -> PyResult<String> {
        self.inner.user().map_err(to_py_err)
    }

    fn session_info(&mut self) -> PyResult<PySessionInfo> {
        self.inner
            .session_metadata()
            .map(PySessionInfo::from)
            .map_err(to_py_err)
    }

    /// Ask the device to erase its stored session. Not acknowledged by the device.
    fn erase_session(&mut self) -> PyResult<()> {
        self.inner.erase_session().map_err(to_py_err)
    }

    /// Download the stored session.
    ///
    /// Args:
    ///     progress: Optional callable `(downloaded, expected)`. Returning
    ///         False cancels; the points received so far are still returned
    ///         and the link is reopened.
    ///
    /// Returns:
    ///     List of SessionEntry, 3 seconds apart.
    #[pyo3(signature = (progress=None))]
    fn download(&mut self, progress: Option<Bound<'_, PyAny>>) -> PyResult<Vec<PySessionEntry>> {
        let mut callback_err = None;
        let mut cancelled = false;
        let (_, record) = self
            .inner
            .download_session(|p| {
                let Some(cb) = progress.as_ref() else {
                    return ControlFlow::Continue(());
                };
                match cb.call1((p.downloaded, p.expected)) {
                    Ok(ret) if ret.is_none() || ret.is_truthy().unwrap_or(true) => {
                        ControlFlow::Continue(())
                    }
                    Ok(_) => {
                        cancelled = true;
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        callback_err = Some(e);
                        cancelled = true;
                        ControlFlow::Break(())
                    }
                }
            })
            .map_err(to_py_err)?;

        if cancelled {
            self.inner.reopen().map_err(to_py_err)?;
        }
        if let Some(e) = callback_err {
            return Err(e);
        }
        Ok(record.entries().iter().map(PySessionEntry::from).collect())
    }

    /// Read `n` debounced live readings.
    ///
    /// Args:
    ///     n: Number of readings to return.
    ///     threshold: Absent samples tolerated before reporting "Finger out".
    #[pyo3(signature = (n=10, threshold=DEFAULT_FINGER_OUT_THRESHOLD))]
    fn read_live(&mut self, n: usize, threshold: u32) -> PyResult<Vec<PyLiveReading>> {
        let config = LiveConfig {
            finger_out_threshold: threshold,
            ..LiveConfig::default()
        };
        let mut readings = Vec::with_capacity(n);
        if n == 0 {
            return Ok(readings);
        }
        self.inner
            .live(&config, |reading, _| {
                readings.push(PyLiveReading::from(reading));
                if readings.len() >= n {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .map_err(to_py_err)?;
        Ok(readings)
    }

    fn close(&mut self) -> PyResult<()> {
        self.inner.close().map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        match self.inner.target() {
            Some(target) => format!("Cms50ew({target})"),
            None => "Cms50ew()".to_string(),
        }
    }
}

/// Forward Rust log records to Python's `logging` module.
#[pyfunction]
fn init_logging(py: Python<'_>) -> PyResult<()> {
    logging::init_python_logging(py)
}

/// Set the most verbose forwarded level ("trace" .. "error", "off").
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

/// Raw 9-byte frame of a command by its protocol name.
#[pyfunction]
fn command_frame(name: &str) -> PyResult<Vec<u8>> {
    lookup(name)
        .map(|frame| frame.to_vec())
        .map_err(|e| PyKeyError::new_err(e.to_string()))
}

#[pymodule]
#[pyo3(name = "_core")]
fn core_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyCms50ew>()?;
    m.add_class::<PySample>()?;
    m.add_class::<PySessionEntry>()?;
    m.add_class::<PySessionInfo>()?;
    m.add_class::<PyLiveReading>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(command_frame, m)?)?;

    m.add("SAMPLE_INTERVAL_SECS", DEVICE_SAMPLE_INTERVAL_SECS)?;
    m.add(
        "COMMANDS",
        Command::ALL.iter().map(|c| c.name()).collect::<Vec<_>>(),
    )?;
    Ok(())
}
