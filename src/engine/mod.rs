//! Training engine.
//!
//! The optimization loop itself lives behind [`TrainerBackend`]: the
//! production backend drives an external trainer process, tests use
//! [`MockBackend`]. [`TrainingEngine`] owns everything around the
//! loop: dependency validation, step-to-phase mapping, progress
//! projection into the pipeline band, and memory checkpoints.

pub mod clamp;
pub mod subprocess;

use std::path::{Path, PathBuf};

use crate::config::TrainingConfig;
use crate::hardware::HardwareProfile;
use crate::monitor::{AcceleratorCache, MemoryMonitor};
use crate::plan::TrainingPlan;
use crate::progress::{Band, ProgressSink};
use crate::{Error, Result};

/// Observation from inside the training loop.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub step: u32,
    pub total_steps: u32,
    pub loss: f64,
}

/// The trainer boundary. Implementations run the actual optimization.
pub trait TrainerBackend {
    /// Check that the trainer's own dependencies are importable,
    /// attempting on-demand installation where supported.
    fn validate_dependencies(&mut self) -> Result<()>;

    /// Download or locate the base model weights.
    fn prepare_base_model(&mut self, library_model: &str) -> Result<()>;

    /// Run the loop, writing adapter weights into `staging_dir` and
    /// calling `on_step` after each optimizer step.
    fn train(
        &mut self,
        config: &TrainingConfig,
        plan: &TrainingPlan,
        profile: &HardwareProfile,
        staging_dir: &Path,
        on_step: &mut dyn FnMut(StepUpdate),
    ) -> Result<()>;

    /// Merge the staged adapter into the base model, writing the full
    /// merged model into `output_dir`.
    fn merge_adapter(
        &mut self,
        library_model: &str,
        adapter_dir: &Path,
        output_dir: &Path,
    ) -> Result<()>;
}

/// Phase tag for a training step: first tenth warmup, last tenth
/// fine-tuning, the rest main.
#[must_use]
pub fn phase_for_step(step: u32, total: u32) -> &'static str {
    if total == 0 {
        return "main";
    }
    let fraction = f64::from(step) / f64::from(total);
    if fraction <= 0.1 {
        "warmup"
    } else if fraction >= 0.9 {
        "fine-tuning"
    } else {
        "main"
    }
}

/// Memory checkpoint cadence within the loop, in steps.
const MEMORY_CHECK_INTERVAL: u32 = 25;

/// Runs a backend with progress projection and memory supervision.
pub struct TrainingEngine<B: TrainerBackend> {
    backend: B,
}

impl<B: TrainerBackend> TrainingEngine<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn validate_dependencies(&mut self) -> Result<()> {
        self.backend.validate_dependencies()
    }

    pub fn prepare_base_model(&mut self, library_model: &str) -> Result<()> {
        self.backend.prepare_base_model(library_model)
    }

    /// Run training, reporting each step into `band` of the overall
    /// pipeline percentage and checkpointing memory periodically.
    /// Returns the staged adapter directory.
    pub fn train<C: AcceleratorCache>(
        &mut self,
        config: &TrainingConfig,
        plan: &TrainingPlan,
        profile: &HardwareProfile,
        examples: &[crate::data::TrainingExample],
        staging_dir: &Path,
        band: Band,
        sink: &mut dyn ProgressSink,
        monitor: &mut MemoryMonitor<C>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(staging_dir)?;
        stage_examples(examples, staging_dir)?;
        let total = config.effective_steps(plan);

        let mut last_loss = f64::NAN;
        {
            let mut on_step = |update: StepUpdate| {
                last_loss = update.loss;
                let fraction = if update.total_steps == 0 {
                    0.0
                } else {
                    f64::from(update.step) / f64::from(update.total_steps)
                };
                let percent = band.project(fraction);
                let phase = phase_for_step(update.step, update.total_steps);
                let event = crate::progress::ProgressEvent {
                    current: u64::from(update.step),
                    total: u64::from(update.total_steps),
                    percentage: percent,
                    message: format!(
                        "training step {}/{} (loss {:.4})",
                        update.step, update.total_steps, update.loss
                    ),
                    phase: Some(phase.to_string()),
                };
                sink.report(&event);
                if update.step % MEMORY_CHECK_INTERVAL == 0 {
                    monitor.checkpoint("training");
                }
            };
            let outcome = self
                .backend
                .train(config, plan, profile, staging_dir, &mut on_step);
            if let Err(err) = outcome {
                // Free accelerator caches before surfacing the error.
                monitor.checkpoint("training failed");
                monitor.force_cleanup();
                return Err(match err {
                    Error::Training(_) => err,
                    other => Error::Training(other.to_string()),
                });
            }
        }

        if !staging_dir.join("adapter_model.safetensors").exists()
            && !staging_dir.join("adapter_model.bin").exists()
        {
            return Err(Error::Training(format!(
                "backend produced no adapter weights in {}",
                staging_dir.display()
            )));
        }
        if last_loss.is_finite() {
            eprintln!("training complete over {total} steps, final loss {last_loss:.4}");
        }
        Ok(staging_dir.to_path_buf())
    }

    pub fn merge_adapter(
        &mut self,
        library_model: &str,
        adapter_dir: &Path,
        output_dir: &Path,
    ) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;
        self.backend
            .merge_adapter(library_model, adapter_dir, output_dir)
    }
}

/// Write the formatted instruction/response corpus next to the adapter
/// output so the backend and any post-mortem see exactly what was
/// trained on.
fn stage_examples(
    examples: &[crate::data::TrainingExample],
    staging_dir: &Path,
) -> Result<()> {
    use std::io::Write;
    let path = staging_dir.join("train_formatted.txt");
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for example in examples {
        writeln!(file, "{}\n", example.to_prompt())?;
    }
    file.flush()?;
    Ok(())
}

/// Scriptable backend for tests and dry runs.
pub struct MockBackend {
    pub steps: u32,
    pub fail_training: bool,
    pub fail_dependencies: bool,
    pub prepared_models: Vec<String>,
    pub merged: bool,
}

impl MockBackend {
    #[must_use]
    pub fn new(steps: u32) -> Self {
        Self {
            steps,
            fail_training: false,
            fail_dependencies: false,
            prepared_models: Vec::new(),
            merged: false,
        }
    }
}

impl TrainerBackend for MockBackend {
    fn validate_dependencies(&mut self) -> Result<()> {
        if self.fail_dependencies {
            return Err(Error::Dependency("trainer runtime missing".to_string()));
        }
        Ok(())
    }

    fn prepare_base_model(&mut self, library_model: &str) -> Result<()> {
        self.prepared_models.push(library_model.to_string());
        Ok(())
    }

    fn train(
        &mut self,
        _config: &TrainingConfig,
        _plan: &TrainingPlan,
        _profile: &HardwareProfile,
        staging_dir: &Path,
        on_step: &mut dyn FnMut(StepUpdate),
    ) -> Result<()> {
        if self.fail_training {
            return Err(Error::Training("loss diverged".to_string()));
        }
        for step in 1..=self.steps {
            on_step(StepUpdate {
                step,
                total_steps: self.steps,
                loss: 2.0 / f64::from(step),
            });
        }
        std::fs::write(staging_dir.join("adapter_model.safetensors"), b"weights")?;
        std::fs::write(staging_dir.join("adapter_config.json"), b"{}")?;
        Ok(())
    }

    fn merge_adapter(
        &mut self,
        _library_model: &str,
        _adapter_dir: &Path,
        output_dir: &Path,
    ) -> Result<()> {
        std::fs::write(output_dir.join("model.safetensors"), b"merged")?;
        std::fs::write(output_dir.join("config.json"), b"{}")?;
        self.merged = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Accelerator, Profiler};
    use crate::monitor::{AcceleratorCache, MemoryMonitor};
    use crate::plan::{Complexity, PlanRequest, Planner};
    use crate::progress::BufferedSink;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct CountingCache {
        samples: Cell<u32>,
        aggressives: u32,
    }

    impl CountingCache {
        fn new() -> Self {
            Self {
                samples: Cell::new(0),
                aggressives: 0,
            }
        }
    }

    impl AcceleratorCache for &mut CountingCache {
        fn utilization(&self) -> Option<f64> {
            self.samples.set(self.samples.get() + 1);
            None
        }
        fn empty_cache(&mut self) {}
        fn aggressive_cleanup(&mut self) {
            self.aggressives += 1;
        }
    }

    fn setup() -> (TrainingConfig, TrainingPlan, HardwareProfile) {
        let config = TrainingConfig::new("gemma3:latest", "helper", "/tmp/data.jsonl");
        let plan = Planner::plan(&PlanRequest {
            example_count: 10,
            lora_rank: 8,
            learning_rate: 2e-5,
            complexity: Complexity::Simple,
            incremental: false,
        });
        let profile = Profiler::with_accelerator(Accelerator::Cpu).profile();
        (config, plan, profile)
    }

    #[test]
    fn test_phase_bands() {
        assert_eq!(phase_for_step(5, 100), "warmup");
        assert_eq!(phase_for_step(10, 100), "warmup");
        assert_eq!(phase_for_step(50, 100), "main");
        assert_eq!(phase_for_step(90, 100), "fine-tuning");
        assert_eq!(phase_for_step(100, 100), "fine-tuning");
    }

    #[test]
    fn test_train_projects_into_band() {
        let (config, plan, profile) = setup();
        let dir = TempDir::new().unwrap();
        let mut engine = TrainingEngine::new(MockBackend::new(10));
        let mut sink = BufferedSink::default();
        let mut monitor = MemoryMonitor::new(false);

        engine
            .train(
                &config,
                &plan,
                &profile,
                &[],
                dir.path(),
                Band::new(20.0, 90.0),
                &mut sink,
                &mut monitor,
            )
            .unwrap();

        assert_eq!(sink.events.len(), 10);
        for event in &sink.events {
            assert!(event.percentage >= 20.0 && event.percentage <= 90.0);
        }
        assert!((sink.events[9].percentage - 90.0).abs() < 1e-9);
        assert_eq!(sink.events[0].phase.as_deref(), Some("warmup"));
        assert_eq!(sink.events[9].phase.as_deref(), Some("fine-tuning"));
    }

    #[test]
    fn test_memory_checkpoints_run_inside_the_loop() {
        let (config, plan, profile) = setup();
        let dir = TempDir::new().unwrap();
        let mut engine = TrainingEngine::new(MockBackend::new(50));
        let mut sink = BufferedSink::default();
        let mut cache = CountingCache::new();
        {
            let mut monitor = MemoryMonitor::with_cache(&mut cache, false);
            engine
                .train(
                    &config,
                    &plan,
                    &profile,
                    &[],
                    dir.path(),
                    Band::new(20.0, 90.0),
                    &mut sink,
                    &mut monitor,
                )
                .unwrap();
        }
        // Steps 25 and 50 hit the checkpoint cadence.
        assert_eq!(cache.samples.get(), 2);
        assert_eq!(cache.aggressives, 0);
    }

    #[test]
    fn test_training_failure_forces_aggressive_cleanup() {
        let (config, plan, profile) = setup();
        let dir = TempDir::new().unwrap();
        let mut backend = MockBackend::new(10);
        backend.fail_training = true;
        let mut engine = TrainingEngine::new(backend);
        let mut sink = BufferedSink::default();
        let mut cache = CountingCache::new();
        {
            let mut monitor = MemoryMonitor::with_cache(&mut cache, false);
            let err = engine
                .train(
                    &config,
                    &plan,
                    &profile,
                    &[],
                    dir.path(),
                    Band::new(20.0, 90.0),
                    &mut sink,
                    &mut monitor,
                )
                .unwrap_err();
            assert!(matches!(err, Error::Training(_)));
        }
        assert_eq!(cache.aggressives, 1);
    }

    #[test]
    fn test_train_failure_is_training_error() {
        let (config, plan, profile) = setup();
        let dir = TempDir::new().unwrap();
        let mut backend = MockBackend::new(10);
        backend.fail_training = true;
        let mut engine = TrainingEngine::new(backend);
        let mut sink = BufferedSink::default();
        let mut monitor = MemoryMonitor::new(false);

        let err = engine
            .train(
                &config,
                &plan,
                &profile,
                &[],
                dir.path(),
                Band::new(20.0, 90.0),
                &mut sink,
                &mut monitor,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Training(_)));
    }

    #[test]
    fn test_missing_weights_detected() {
        struct EmptyBackend;
        impl TrainerBackend for EmptyBackend {
            fn validate_dependencies(&mut self) -> Result<()> {
                Ok(())
            }
            fn prepare_base_model(&mut self, _: &str) -> Result<()> {
                Ok(())
            }
            fn train(
                &mut self,
                _: &TrainingConfig,
                _: &TrainingPlan,
                _: &HardwareProfile,
                _: &Path,
                _: &mut dyn FnMut(StepUpdate),
            ) -> Result<()> {
                Ok(())
            }
            fn merge_adapter(&mut self, _: &str, _: &Path, _: &Path) -> Result<()> {
                Ok(())
            }
        }

        let (config, plan, profile) = setup();
        let dir = TempDir::new().unwrap();
        let mut engine = TrainingEngine::new(EmptyBackend);
        let mut sink = BufferedSink::default();
        let mut monitor = MemoryMonitor::new(false);

        let err = engine
            .train(
                &config,
                &plan,
                &profile,
                &[],
                dir.path(),
                Band::new(20.0, 90.0),
                &mut sink,
                &mut monitor,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Training(_)));
    }
}
