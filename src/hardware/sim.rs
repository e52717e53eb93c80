// src/hardware/sim.rs

//! Simulated rig used by the CLI when no devices are attached.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ExtractDeviceManager, ExtractionLineManager, IonOpticsManager, ManagerRegistry, RunMonitor,
    ScriptRequest, ScriptRunner, SpectrometerManager,
};
use crate::run::PhaseResult;

/// Isotope intensities (fA) of a typical unknown.
const SIGNAL_LEVELS: &[(&str, f64)] = &[
    ("Ar40", 1200.0),
    ("Ar39", 85.0),
    ("Ar38", 1.2),
    ("Ar37", 0.4),
    ("Ar36", 0.9),
];

const BASELINE_LEVEL: f64 = 0.02;

#[derive(Debug, Default)]
pub struct SimExtractionLine;

impl ExtractionLineManager for SimExtractionLine {}

#[derive(Debug)]
pub struct SimExtractDevice {
    name: String,
}

impl SimExtractDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ExtractDeviceManager for SimExtractDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Spectrometer returning fixed intensities with a small deterministic
/// ripple, `count_delay` per integration.
#[derive(Debug)]
pub struct SimSpectrometer {
    count_delay: Duration,
    on_baseline: AtomicBool,
    cycle: AtomicU64,
}

impl SimSpectrometer {
    pub fn new(count_delay: Duration) -> Self {
        Self {
            count_delay,
            on_baseline: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SpectrometerManager for SimSpectrometer {
    async fn set_baseline_mode(&self, on_baseline: bool) -> Result<()> {
        self.on_baseline.store(on_baseline, Ordering::SeqCst);
        Ok(())
    }

    async fn read_intensities(&self) -> Result<BTreeMap<String, f64>> {
        if !self.count_delay.is_zero() {
            tokio::time::sleep(self.count_delay).await;
        }
        let n = self.cycle.fetch_add(1, Ordering::Relaxed);
        let ripple = 1.0 + ((n % 7) as f64 - 3.0) * 1e-4;
        let baseline = self.on_baseline.load(Ordering::SeqCst);

        Ok(SIGNAL_LEVELS
            .iter()
            .map(|(iso, level)| {
                let v = if baseline { BASELINE_LEVEL } else { *level };
                (iso.to_string(), v * ripple)
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct SimIonOptics;

#[async_trait]
impl IonOpticsManager for SimIonOptics {
    async fn peak_center(&self, detector: &str) -> Result<f64> {
        debug!(detector, "simulated peak center");
        Ok(7.0)
    }
}

/// Script runner that "executes" every script by waiting `step`.
#[derive(Debug)]
pub struct SimScriptRunner {
    step: Duration,
}

impl SimScriptRunner {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }
}

#[async_trait]
impl ScriptRunner for SimScriptRunner {
    async fn connect(&self) -> Result<bool> {
        Ok(true)
    }

    async fn execute(
        &self,
        request: ScriptRequest,
        cancel: CancellationToken,
    ) -> Result<PhaseResult> {
        debug!(runid = %request.runid, kind = %request.kind, script = %request.name, "simulated script");
        tokio::select! {
            _ = tokio::time::sleep(self.step) => Ok(PhaseResult::Completed),
            _ = cancel.cancelled() => Ok(PhaseResult::Canceled),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimRunMonitor;

#[async_trait]
impl RunMonitor for SimRunMonitor {
    async fn check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// A full simulated rig: every manager present, `extract_device` registered.
pub fn registry(extract_device: &str, count_delay: Duration) -> ManagerRegistry {
    let mut registry = ManagerRegistry::new(Arc::new(SimScriptRunner::new(count_delay * 10)))
        .with_extraction_line(Arc::new(SimExtractionLine))
        .with_spectrometer(Arc::new(SimSpectrometer::new(count_delay)))
        .with_ion_optics(Arc::new(SimIonOptics))
        .with_monitor(Arc::new(SimRunMonitor));
    if crate::run::identifier::is_device_named(extract_device) {
        registry = registry.with_extract_device(Arc::new(SimExtractDevice::new(extract_device)));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn baseline_mode_reads_low_intensities() {
        let spec = SimSpectrometer::new(Duration::ZERO);
        let signal = spec.read_intensities().await.unwrap();
        assert!(signal["Ar40"] > 1000.0);

        spec.set_baseline_mode(true).await.unwrap();
        let baseline = spec.read_intensities().await.unwrap();
        assert!(baseline["Ar40"] < 1.0);
    }

    #[tokio::test]
    async fn script_runner_honours_cancel() {
        let runner = SimScriptRunner::new(Duration::from_secs(3600));
        let token = CancellationToken::new();
        token.cancel();
        let request = ScriptRequest {
            kind: crate::hardware::ScriptKind::Extraction,
            name: "extract".into(),
            runid: "12345-01".into(),
            extract_device: String::new(),
            extract_value: 0.0,
            extract_units: "watts".into(),
            duration: 0.0,
            cleanup: 0.0,
            position: None,
        };
        let res = runner.execute(request, token).await.unwrap();
        assert_eq!(res, PhaseResult::Canceled);
    }
}
