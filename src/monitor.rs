//! Memory pressure monitoring.
//!
//! Samples system and process memory at pipeline checkpoints and turns
//! the readings into cleanup decisions. The monitor never kills the
//! run; critical pressure requests cleanup from the accelerator cache
//! hook and keeps going.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Resident set size of this process.
    pub process_rss_bytes: u64,
    /// Accelerator memory utilization in [0, 1], when known.
    pub accelerator_utilization: Option<f64>,
}

impl MemorySnapshot {
    /// System memory utilization in [0, 1].
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Evaluated pressure state at a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStatus {
    pub snapshot: MemorySnapshot,
    pub alerts: Vec<String>,
    /// Warning threshold crossed; caller should free what it can.
    pub should_cleanup: bool,
    /// Critical threshold crossed; aggressive cleanup requested.
    pub critical: bool,
}

/// Source of accelerator memory readings and cache cleanup. Backends
/// with no accelerator cache use [`NoAcceleratorCache`].
pub trait AcceleratorCache {
    /// Memory utilization in [0, 1], if the accelerator reports one.
    fn utilization(&self) -> Option<f64>;
    /// Drop cached allocations. Called on warning pressure.
    fn empty_cache(&mut self);
    /// Drop caches and force collection. Called on critical pressure.
    fn aggressive_cleanup(&mut self);
}

/// No-op cache for CPU runs and tests.
#[derive(Default)]
pub struct NoAcceleratorCache;

impl AcceleratorCache for NoAcceleratorCache {
    fn utilization(&self) -> Option<f64> {
        None
    }
    fn empty_cache(&mut self) {}
    fn aggressive_cleanup(&mut self) {}
}

const WARNING_THRESHOLD: f64 = 0.85;
const CRITICAL_THRESHOLD: f64 = 0.95;
const ACCELERATOR_ALERT: f64 = 0.90;
const PROCESS_RSS_ALERT: u64 = 8 << 30;

/// Checkpoint-driven memory monitor.
pub struct MemoryMonitor<C: AcceleratorCache> {
    system: System,
    cache: C,
    verbose: bool,
}

impl MemoryMonitor<NoAcceleratorCache> {
    pub fn new(verbose: bool) -> Self {
        Self::with_cache(NoAcceleratorCache, verbose)
    }
}

impl<C: AcceleratorCache> MemoryMonitor<C> {
    pub fn with_cache(cache: C, verbose: bool) -> Self {
        Self {
            system: System::new(),
            cache,
            verbose,
        }
    }

    /// Take a fresh reading.
    pub fn sample(&mut self) -> MemorySnapshot {
        self.system.refresh_memory();
        let pid = Pid::from_u32(std::process::id());
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process_rss_bytes = self
            .system
            .process(pid)
            .map(|p| p.memory())
            .unwrap_or(0);
        MemorySnapshot {
            total_bytes: self.system.total_memory(),
            used_bytes: self.system.used_memory(),
            process_rss_bytes,
            accelerator_utilization: self.cache.utilization(),
        }
    }

    /// Evaluate a checkpoint: sample, classify, and run the
    /// appropriate cleanup.
    pub fn checkpoint(&mut self, name: &str) -> MemoryStatus {
        let snapshot = self.sample();
        let status = Self::evaluate(snapshot);
        if self.verbose || !status.alerts.is_empty() {
            eprintln!(
                "memory [{name}]: {:.1}% system, {} MiB rss",
                status.snapshot.utilization() * 100.0,
                status.snapshot.process_rss_bytes >> 20,
            );
            for alert in &status.alerts {
                eprintln!("  alert: {alert}");
            }
        }
        if status.critical {
            self.cache.aggressive_cleanup();
        } else if status.should_cleanup {
            self.cache.empty_cache();
        }
        status
    }

    /// Unconditional aggressive cache cleanup. Runs on pipeline
    /// failure regardless of current pressure.
    pub fn force_cleanup(&mut self) {
        self.cache.aggressive_cleanup();
    }

    /// Advice for constrained hosts, derived from a snapshot. Surfaced
    /// in verbose diagnostics before training starts.
    #[must_use]
    pub fn recommendations(snapshot: &MemorySnapshot) -> Vec<String> {
        let mut advice = Vec::new();
        let total_gib = snapshot.total_bytes >> 30;
        if total_gib < 16 {
            advice.push("low system memory: keep batch size at 1 and rank at 8 or lower".to_string());
        }
        if total_gib < 8 {
            advice.push("very low system memory: prefer 8-bit base model loading".to_string());
        }
        if snapshot.utilization() >= WARNING_THRESHOLD {
            advice.push("close other applications before training".to_string());
        }
        advice
    }

    /// Pure classification of a snapshot against the thresholds.
    #[must_use]
    pub fn evaluate(snapshot: MemorySnapshot) -> MemoryStatus {
        let utilization = snapshot.utilization();
        let mut alerts = Vec::new();

        let critical = utilization >= CRITICAL_THRESHOLD;
        let should_cleanup = utilization >= WARNING_THRESHOLD;
        if critical {
            alerts.push(format!(
                "critical system memory pressure ({:.1}%)",
                utilization * 100.0
            ));
        } else if should_cleanup {
            alerts.push(format!(
                "high system memory pressure ({:.1}%)",
                utilization * 100.0
            ));
        }
        if snapshot.process_rss_bytes > PROCESS_RSS_ALERT {
            alerts.push(format!(
                "process rss {} GiB exceeds limit",
                snapshot.process_rss_bytes >> 30
            ));
        }
        if let Some(gpu) = snapshot.accelerator_utilization {
            if gpu >= ACCELERATOR_ALERT {
                alerts.push(format!("accelerator memory at {:.1}%", gpu * 100.0));
            }
        }

        MemoryStatus {
            snapshot,
            alerts,
            should_cleanup,
            critical,
        }
    }
}
