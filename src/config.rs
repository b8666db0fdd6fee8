//! Compute device and precision selection
//!
//! The device/precision pair is resolved exactly once at process start and
//! passed down explicitly; nothing below this module probes hardware on its
//! own. Tests inject a fixed profile instead of detecting one.

use candle_core::{DType, Device};

use crate::error::{Error, Result};

/// Default pretrained checkpoint to fine-tune and caption with.
pub const DEFAULT_MODEL_ID: &str = "Salesforce/blip-image-captioning-base";

/// Kind of compute device backing a run, ordered by preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// NVIDIA GPU
    Cuda,
    /// Apple GPU
    Metal,
    /// CPU fallback
    Cpu,
}

impl DeviceKind {
    /// Whether this device counts as an accelerator for precision purposes.
    pub fn is_accelerator(self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }
}

/// Device plus the numeric precision used for model weights and activations.
///
/// Half precision is selected whenever an accelerator is present, full
/// precision otherwise. The choice is fixed for the whole run.
#[derive(Debug, Clone)]
pub struct ComputeProfile {
    /// Tensor placement target
    pub device: Device,
    /// Which kind of hardware `device` is
    pub kind: DeviceKind,
    /// Compute dtype for forward passes
    pub dtype: DType,
}

impl ComputeProfile {
    /// Probe available hardware, preferring CUDA, then Metal, then CPU.
    pub fn detect() -> Result<Self> {
        if candle_core::utils::cuda_is_available() {
            return Ok(Self {
                device: Device::new_cuda(0)?,
                kind: DeviceKind::Cuda,
                dtype: DType::F16,
            });
        }
        if candle_core::utils::metal_is_available() {
            return Ok(Self {
                device: Device::new_metal(0)?,
                kind: DeviceKind::Metal,
                dtype: DType::F16,
            });
        }
        Ok(Self::cpu())
    }

    /// Full-precision CPU profile, used as the test fixture.
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            dtype: DType::F32,
        }
    }

    /// Fail unless the profile is backed by an accelerator.
    ///
    /// Training refuses to run on CPU rather than silently degrading.
    pub fn require_accelerator(&self) -> Result<()> {
        if self.kind.is_accelerator() {
            Ok(())
        } else {
            Err(Error::config(
                "training requires a CUDA or Metal device; no accelerator was detected",
            ))
        }
    }
}
