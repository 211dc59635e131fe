//! # Device and Precision Selection
//!
//! Turns the configured device and compute type strings into a candle
//! `Device` and `DType`. A device that was asked for by name must exist:
//! there is no silent fallback to the CPU. Only `auto` probes for the best
//! available accelerator.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device};
use tracing::{debug, info};

/// Requested compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// Pick the best available device (CUDA, then Metal, then CPU)
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, index)) => {
                let index = index
                    .parse::<usize>()
                    .with_context(|| format!("invalid device index in '{}'", s))?;
                (kind, Some(index))
            }
            None => (s.as_str(), None),
        };

        match (kind, ordinal) {
            ("auto", None) => Ok(DevicePreference::Auto),
            ("cpu", None) => Ok(DevicePreference::Cpu),
            ("cuda" | "gpu", index) => Ok(DevicePreference::Cuda(index.unwrap_or(0))),
            ("metal", index) => Ok(DevicePreference::Metal(index.unwrap_or(0))),
            _ => Err(anyhow!("Unknown device: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Create the candle device. Fails if the requested accelerator is not
    /// usable in this build or on this machine.
    pub fn create(self) -> Result<Device> {
        match self {
            DevicePreference::Auto => Ok(detect_best_device()),
            DevicePreference::Cpu => Ok(Device::Cpu),
            DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal)
                .with_context(|| format!("CUDA device {} is not available", ordinal)),
            DevicePreference::Metal(ordinal) => Device::new_metal(ordinal)
                .with_context(|| format!("Metal device {} is not available", ordinal)),
        }
    }
}

fn detect_best_device() -> Device {
    info!("Detecting best available compute device...");

    match Device::new_cuda(0) {
        Ok(device) => {
            info!("Selected CUDA GPU for inference");
            return device;
        }
        Err(e) => debug!("CUDA not available: {}", e),
    }

    match Device::new_metal(0) {
        Ok(device) => {
            info!("Selected Metal GPU for inference");
            return device;
        }
        Err(e) => debug!("Metal not available: {}", e),
    }

    info!("Using CPU for inference (no GPU acceleration available)");
    Device::Cpu
}

/// Human-readable device name for logs.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA GPU",
        Device::Metal(_) => "Metal GPU",
    }
}

/// Map a compute type name to the dtype the weights are loaded in.
///
/// `default`/`auto` pick half precision on accelerators and full precision
/// on the CPU. Integer quantisation types are rejected rather than
/// approximated.
pub fn parse_compute_type(compute_type: &str, device: &Device) -> Result<DType> {
    match compute_type.trim().to_lowercase().as_str() {
        "float32" | "f32" => Ok(DType::F32),
        "float16" | "f16" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "default" | "auto" => Ok(if device.is_cpu() { DType::F32 } else { DType::F16 }),
        other if other.starts_with("int8") || other.starts_with("int16") => Err(anyhow!(
            "Compute type '{}' is not supported; use float32, float16 or bfloat16",
            other
        )),
        other => Err(anyhow!("Unknown compute type: {}", other)),
    }
}
