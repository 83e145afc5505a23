//! Device selection policy.
//!
//! The daemon only decides *which* compute device the engine should use;
//! everything below that (driver handles, memory budgets) belongs to the
//! engine. `Auto` prefers the accelerator and falls back to CPU without
//! treating the fallback as an error.

use serde::{Deserialize, Serialize};

use crate::domain::{ErrorCategory, TaskFailure};

/// Operator preference, from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Auto,
    Gpu,
    Cpu,
}

impl DevicePreference {
    /// Parse a config value. Accepts CUDA-style device strings ("cuda",
    /// "cuda:0") as a GPU preference, since existing service configs use
    /// them.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(DevicePreference::Auto),
            "gpu" => Some(DevicePreference::Gpu),
            "cpu" => Some(DevicePreference::Cpu),
            other if other.starts_with("cuda") => Some(DevicePreference::Gpu),
            _ => None,
        }
    }
}

/// The device a task actually ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Gpu,
    Cpu,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Gpu => "gpu",
            Device::Cpu => "cpu",
        }
    }
}

/// Accelerator availability probe.
pub trait DeviceProbe: Send + Sync {
    fn gpu_available(&self) -> bool;
}

/// Best-effort production probe: an NVIDIA device node or an explicit
/// CUDA_VISIBLE_DEVICES assignment means a GPU is worth attempting. The
/// engine still owns the authoritative check.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn gpu_available(&self) -> bool {
        if std::path::Path::new("/dev/nvidia0").exists() {
            return true;
        }
        match std::env::var("CUDA_VISIBLE_DEVICES") {
            Ok(v) => !v.trim().is_empty() && v.trim() != "-1",
            Err(_) => false,
        }
    }
}

/// Test probe with a scripted answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub bool);

impl DeviceProbe for FixedProbe {
    fn gpu_available(&self) -> bool {
        self.0
    }
}

/// Resolve the device for one task.
///
/// `Auto` with no accelerator degrades to CPU silently; an explicit `Gpu`
/// preference with no accelerator is a retriable device failure (the
/// accelerator may come back).
pub fn select_device(
    preference: DevicePreference,
    probe: &dyn DeviceProbe,
) -> Result<Device, TaskFailure> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Auto => {
            if probe.gpu_available() {
                Ok(Device::Gpu)
            } else {
                Ok(Device::Cpu)
            }
        }
        DevicePreference::Gpu => {
            if probe.gpu_available() {
                Ok(Device::Gpu)
            } else {
                Err(TaskFailure::new(
                    ErrorCategory::Device,
                    "gpu requested but no accelerator is available",
                ))
            }
        }
    }
}
