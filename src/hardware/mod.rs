// src/hardware/mod.rs

//! Capability interfaces for the rig.
//!
//! The engine never talks to devices directly. It only needs to know whether
//! a manager is available, how an extract device is connected, and how to
//! hand a named script to the script runner. Everything device-specific sits
//! behind these traits.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::run::identifier::convert_extract_device;
use crate::run::PhaseResult;

pub mod sim;

/// How an extract device manager is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMode {
    /// In-process device.
    Normal,
    /// Remote device; connectivity must be tested before every run.
    Client {
        host: String,
        port: u16,
        kind: String,
    },
}

pub trait ExtractionLineManager: Send + Sync {
    fn is_ready(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait ExtractDeviceManager: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> DeviceMode {
        DeviceMode::Normal
    }

    async fn test_connection(&self) -> Result<bool>;
}

#[async_trait]
pub trait SpectrometerManager: Send + Sync {
    fn is_ready(&self) -> bool {
        true
    }

    /// Move the magnet on or off the baseline position.
    async fn set_baseline_mode(&self, on_baseline: bool) -> Result<()>;

    /// One integration cycle: intensity per isotope.
    async fn read_intensities(&self) -> Result<BTreeMap<String, f64>>;
}

#[async_trait]
pub trait IonOpticsManager: Send + Sync {
    /// Peak-center the reference detector; returns the centred DAC value.
    async fn peak_center(&self, detector: &str) -> Result<f64>;
}

/// Which phase a script belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    Extraction,
    Measurement,
    PostMeasurement,
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScriptKind::Extraction => "extraction",
            ScriptKind::Measurement => "measurement",
            ScriptKind::PostMeasurement => "post_measurement",
        };
        f.write_str(s)
    }
}

/// A named script plus the run context it executes in.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub kind: ScriptKind,
    pub name: String,
    pub runid: String,
    pub extract_device: String,
    pub extract_value: f64,
    pub extract_units: String,
    pub duration: f64,
    pub cleanup: f64,
    pub position: Option<String>,
}

/// Executes extraction/measurement/post-measurement scripts, locally or on
/// the extraction line computer.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn connect(&self) -> Result<bool>;

    /// Run a script to completion. Implementations must return
    /// [`PhaseResult::Canceled`] promptly once `cancel` fires.
    async fn execute(&self, request: ScriptRequest, cancel: CancellationToken)
    -> Result<PhaseResult>;
}

/// External watchdog consulted before every run.
#[async_trait]
pub trait RunMonitor: Send + Sync {
    async fn check(&self) -> Result<bool>;
}

/// Hardware managers available to the executor.
///
/// Missing managers are `None`; the pre-run manager check decides whether
/// their absence matters for the queue at hand.
#[derive(Clone)]
pub struct ManagerRegistry {
    pub extraction_line: Option<Arc<dyn ExtractionLineManager>>,
    pub spectrometer: Option<Arc<dyn SpectrometerManager>>,
    pub ion_optics: Option<Arc<dyn IonOpticsManager>>,
    pub script_runner: Arc<dyn ScriptRunner>,
    pub monitor: Option<Arc<dyn RunMonitor>>,
    extract_devices: HashMap<String, Arc<dyn ExtractDeviceManager>>,
}

impl ManagerRegistry {
    pub fn new(script_runner: Arc<dyn ScriptRunner>) -> Self {
        Self {
            extraction_line: None,
            spectrometer: None,
            ion_optics: None,
            script_runner,
            monitor: None,
            extract_devices: HashMap::new(),
        }
    }

    pub fn with_extraction_line(mut self, manager: Arc<dyn ExtractionLineManager>) -> Self {
        self.extraction_line = Some(manager);
        self
    }

    pub fn with_spectrometer(mut self, manager: Arc<dyn SpectrometerManager>) -> Self {
        self.spectrometer = Some(manager);
        self
    }

    pub fn with_ion_optics(mut self, manager: Arc<dyn IonOpticsManager>) -> Self {
        self.ion_optics = Some(manager);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn RunMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Register an extract device under its normalised name.
    pub fn with_extract_device(mut self, manager: Arc<dyn ExtractDeviceManager>) -> Self {
        let key = convert_extract_device(manager.name());
        self.extract_devices.insert(key, manager);
        self
    }

    /// Look up an extract device by display or normalised name.
    pub fn extract_device(&self, name: &str) -> Option<Arc<dyn ExtractDeviceManager>> {
        self.extract_devices
            .get(&convert_extract_device(name))
            .cloned()
    }
}

impl fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("extraction_line", &self.extraction_line.is_some())
            .field("spectrometer", &self.spectrometer.is_some())
            .field("ion_optics", &self.ion_optics.is_some())
            .field("monitor", &self.monitor.is_some())
            .field("extract_devices", &self.extract_devices.keys().collect::<Vec<_>>())
            .finish()
    }
}
