//! # Device Selection
//!
//! Maps the user-facing [`ComputeDevice`] choice onto a concrete Candle device.
//!
//! ## Mapping:
//! - **portable** → CPU, always available
//! - **accelerated** → CUDA GPU 0, else Metal GPU 0, else an error
//!
//! Unlike automatic detection, an accelerated request never silently falls back
//! to CPU. The worker turns the error into a message suggesting the portable
//! device instead.

use crate::transcription::fingerprint::ComputeDevice;
use anyhow::{anyhow, Result};
use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Cached accelerator probe result, detection is not repeated per load
static ACCELERATOR: OnceLock<Option<AcceleratorKind>> = OnceLock::new();

/// Hardware backend behind the accelerated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    Cuda,
    Metal,
}

/// Device selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Resolve a compute device choice into a Candle device.
    ///
    /// ## Returns:
    /// - **Ok(Device)**: Device ready for model weights
    /// - **Err(anyhow::Error)**: Accelerated execution requested but no GPU backend works
    pub fn resolve(device: ComputeDevice) -> Result<Device> {
        match device {
            ComputeDevice::Portable => Ok(Device::Cpu),
            ComputeDevice::Accelerated => match Self::accelerator() {
                Some(AcceleratorKind::Cuda) => Ok(Device::new_cuda(0)?),
                Some(AcceleratorKind::Metal) => Ok(Device::new_metal(0)?),
                None => Err(anyhow!("no accelerated compute backend (CUDA or Metal) is available on this host")),
            },
        }
    }

    /// Probe for an accelerator once and remember the answer.
    pub fn accelerator() -> Option<AcceleratorKind> {
        *ACCELERATOR.get_or_init(|| {
            info!("Detecting accelerated compute backends...");

            match Device::new_cuda(0) {
                Ok(_) => {
                    info!("CUDA GPU available for accelerated inference");
                    return Some(AcceleratorKind::Cuda);
                }
                Err(e) => debug!("CUDA not available: {}", e),
            }

            match Device::new_metal(0) {
                Ok(_) => {
                    info!("Metal GPU available for accelerated inference");
                    return Some(AcceleratorKind::Metal);
                }
                Err(e) => debug!("Metal not available: {}", e),
            }

            info!("No GPU backend found, only the portable device is usable");
            None
        })
    }

    /// Human-readable name of a Candle device for logging.
    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "CPU",
            Device::Cuda(_) => "CUDA GPU",
            Device::Metal(_) => "Metal GPU",
        }
    }

    pub fn summary() -> DeviceSummary {
        let accelerator = Self::accelerator();
        DeviceSummary {
            portable_available: true,
            accelerated_available: accelerator.is_some(),
            accelerator,
        }
    }
}

/// Device availability summary
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceSummary {
    pub portable_available: bool,
    pub accelerated_available: bool,
    pub accelerator: Option<AcceleratorKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portable_is_cpu() {
        let device = DeviceManager::resolve(ComputeDevice::Portable).unwrap();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(DeviceManager::describe(&device), "CPU");
    }

    #[test]
    fn test_accelerated_matches_probe() {
        let resolved = DeviceManager::resolve(ComputeDevice::Accelerated);
        assert_eq!(resolved.is_ok(), DeviceManager::accelerator().is_some());
        assert_eq!(DeviceManager::summary().accelerated_available, resolved.is_ok());
    }
}
