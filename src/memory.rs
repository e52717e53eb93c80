// src/memory.rs

//! Available-memory probe used by the pre-run checks.

use anyhow::Result;
use parking_lot::Mutex;
use sysinfo::System;

pub trait MemoryProbe: Send + Sync {
    /// Available memory in MB.
    fn available_mb(&self) -> Result<u64>;
}

/// Reads available memory from the operating system.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl MemoryProbe for SystemMemory {
    fn available_mb(&self) -> Result<u64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        Ok(system.available_memory() / 1024 / 1024)
    }
}

/// `Some(available)` if less than `threshold_mb` MB is available.
pub fn check_memory(probe: &dyn MemoryProbe, threshold_mb: u64) -> Result<Option<u64>> {
    let available = probe.available_mb()?;
    tracing::debug!(available, threshold_mb, "available memory");
    Ok((available < threshold_mb).then_some(available))
}
