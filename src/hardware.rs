//! Hardware detection and training profiles.
//!
//! Probes the host for an accelerator and derives a complete set of
//! training-relevant settings from it. Detection runs once per pipeline
//! and the resulting [`HardwareProfile`] is passed by value to every
//! component that needs it; nothing re-probes mid-run.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::mapping::ArchFamily;

/// Detected accelerator class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    /// GPU sharing memory with the host (Apple Silicon style).
    UnifiedGpu,
    /// Discrete GPU with its own memory.
    DedicatedGpu { total_memory_bytes: u64 },
    /// No accelerator, CPU only.
    Cpu,
}

impl Accelerator {
    #[must_use]
    pub fn is_gpu(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnifiedGpu => write!(f, "unified GPU"),
            Self::DedicatedGpu { total_memory_bytes } => {
                write!(f, "dedicated GPU ({} GiB)", total_memory_bytes >> 30)
            }
            Self::Cpu => write!(f, "CPU"),
        }
    }
}

/// Numeric precision for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float16,
    Float32,
}

/// Everything the trainer needs to know about the host, derived once
/// from the detected accelerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub accelerator: Accelerator,
    /// Compute precision. Half on any GPU, full on CPU.
    pub precision: Precision,
    /// Use the mixed-precision training loop.
    pub mixed_precision_trainer: bool,
    /// Stream weights during load to keep host RAM flat.
    pub low_cpu_mem: bool,
    /// Parallel data-loader workers. 0 on unified memory, where extra
    /// copies compete with the GPU for the same RAM.
    pub loader_workers: u32,
    /// Gradient checkpointing enabled.
    pub gradient_checkpointing: bool,
    /// 8-bit base-model quantization on memory-constrained dedicated
    /// GPUs.
    pub load_in_8bit: bool,
    /// Scales the configured batch size for roomy dedicated GPUs.
    pub batch_multiplier: u32,
}

impl HardwareProfile {
    /// Disable gradient checkpointing where the accelerator/family
    /// combination is known to silently break gradient flow.
    pub fn adjust_for_family(&mut self, family: ArchFamily) {
        if self.accelerator == Accelerator::UnifiedGpu
            && family.traits().unified_checkpointing_unstable
        {
            self.gradient_checkpointing = false;
        }
    }

    /// Downgrade to the CPU profile. Used when the accelerator fails
    /// its self-test.
    pub fn downgrade_to_cpu(&mut self) {
        *self = Profiler::profile_for(Accelerator::Cpu);
    }
}

/// Probes the host once and builds the profile.
pub struct Profiler {
    accelerator: Accelerator,
}

const DEDICATED_8BIT_THRESHOLD: u64 = 12 << 30;
const DEDICATED_LARGE_THRESHOLD: u64 = 24 << 30;

impl Profiler {
    /// Probe the host for an accelerator.
    pub fn detect() -> Self {
        Self {
            accelerator: detect_accelerator(),
        }
    }

    /// Build a profiler with a known accelerator. Used by tests and by
    /// callers that already probed.
    #[must_use]
    pub fn with_accelerator(accelerator: Accelerator) -> Self {
        Self { accelerator }
    }

    #[must_use]
    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    /// Derive the full profile from the detected accelerator.
    #[must_use]
    pub fn profile(&self) -> HardwareProfile {
        Self::profile_for(self.accelerator)
    }

    fn profile_for(accelerator: Accelerator) -> HardwareProfile {
        match accelerator {
            Accelerator::UnifiedGpu => HardwareProfile {
                accelerator,
                precision: Precision::Float16,
                mixed_precision_trainer: true,
                low_cpu_mem: true,
                loader_workers: 0,
                gradient_checkpointing: true,
                load_in_8bit: false,
                batch_multiplier: 1,
            },
            Accelerator::DedicatedGpu { total_memory_bytes } => HardwareProfile {
                accelerator,
                precision: Precision::Float16,
                mixed_precision_trainer: true,
                low_cpu_mem: false,
                loader_workers: 2,
                gradient_checkpointing: total_memory_bytes < DEDICATED_LARGE_THRESHOLD,
                load_in_8bit: total_memory_bytes < DEDICATED_8BIT_THRESHOLD,
                batch_multiplier: if total_memory_bytes >= DEDICATED_LARGE_THRESHOLD {
                    2
                } else {
                    1
                },
            },
            Accelerator::Cpu => HardwareProfile {
                accelerator,
                precision: Precision::Float32,
                mixed_precision_trainer: false,
                low_cpu_mem: true,
                loader_workers: 0,
                gradient_checkpointing: false,
                load_in_8bit: false,
                batch_multiplier: 1,
            },
        }
    }

    /// Run a minimal allocation self-test on the accelerator through
    /// the given closure. On failure the profile downgrades to CPU
    /// instead of letting the first real allocation crash mid-train.
    pub fn verified_profile<F>(&self, self_test: F) -> HardwareProfile
    where
        F: FnOnce(Accelerator) -> bool,
    {
        let profile = self.profile();
        if profile.accelerator.is_gpu() && !self_test(profile.accelerator) {
            eprintln!(
                "warning: accelerator self-test failed, falling back to CPU"
            );
            return Self::profile_for(Accelerator::Cpu);
        }
        profile
    }
}

/// Built-in accelerator self-test used by the pipeline before
/// committing to a GPU profile.
///
/// Unified memory is host memory, so a touch-every-page allocation
/// catches a host that cannot spare training headroom. Dedicated GPUs
/// are re-queried to confirm the driver still answers.
#[must_use]
pub fn default_self_test(accelerator: Accelerator) -> bool {
    match accelerator {
        Accelerator::UnifiedGpu => {
            let len = 1 << 20;
            let mut probe = vec![0u8; len];
            probe[len - 1] = 1;
            probe[0] == 0
        }
        Accelerator::DedicatedGpu { .. } => query_nvidia_memory().is_some(),
        Accelerator::Cpu => true,
    }
}

/// Probe order: unified memory (Apple Silicon), then nvidia-smi, then
/// CPU.
fn detect_accelerator() -> Accelerator {
    if cfg!(target_os = "macos") && std::env::consts::ARCH == "aarch64" {
        return Accelerator::UnifiedGpu;
    }
    if let Some(bytes) = query_nvidia_memory() {
        return Accelerator::DedicatedGpu {
            total_memory_bytes: bytes,
        };
    }
    Accelerator::Cpu
}

/// Ask nvidia-smi for total memory of GPU 0, in bytes.
fn query_nvidia_memory() -> Option<u64> {
    if !Path::new("/usr/bin/nvidia-smi").exists()
        && !Path::new("/usr/local/bin/nvidia-smi").exists()
    {
        return None;
    }
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mib: u64 = stdout.lines().next()?.trim().parse().ok()?;
    Some(mib << 20)
}
