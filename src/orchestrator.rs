//! Pipeline orchestration.
//!
//! Runs the whole train-and-deploy flow as a sequence of phases, each
//! owning a band of the overall progress percentage:
//!
//! ```text
//!   0– 2  validate configuration
//!   2–15  load and validate training data
//!  15–18  resolve model mapping
//!  18–20  prepare base model
//!  20–90  train
//!  90–98  deploy (attach, falling back to merge+convert)
//!  98–100 finalize registry record
//! ```
//!
//! A failed run emits exactly one `ERROR:` line, cleans up its staging
//! artifacts, and returns the error. Panics never cross this boundary
//! on the phases' own logic; everything is a `Result`.

use std::path::PathBuf;

use crate::config::{PipelineSettings, TrainingConfig};
use crate::data::Dataset;
use crate::deploy::{DeploymentResult, Strategist, Strategy};
use crate::engine::{TrainerBackend, TrainingEngine};
use crate::hardware::{HardwareProfile, Profiler};
use crate::mapping::{ArchFamily, ModelMapper};
use crate::monitor::{MemoryMonitor, NoAcceleratorCache};
use crate::plan::ContentPlanner;
use crate::progress::{Band, ProgressSink};
use crate::registry::{AdapterRecord, AdapterRegistry, AdapterStatus};
use crate::runtime::{ExternalTool, GgufConverter, OllamaRuntime};
use crate::{Error, Result};

const VALIDATE_BAND: Band = Band::new(0.0, 2.0);
const DATA_BAND: Band = Band::new(2.0, 15.0);
const MAPPING_BAND: Band = Band::new(15.0, 18.0);
const BASE_MODEL_BAND: Band = Band::new(18.0, 20.0);
const TRAIN_BAND: Band = Band::new(20.0, 90.0);
const DEPLOY_BAND: Band = Band::new(90.0, 98.0);
const REGISTER_BAND: Band = Band::new(98.0, 100.0);

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub record: AdapterRecord,
    pub strategy: Strategy,
    pub steps: u32,
}

/// Drives one training request end to end.
pub struct Orchestrator<B: TrainerBackend, T: ExternalTool, C: ExternalTool> {
    settings: PipelineSettings,
    mapper: ModelMapper,
    engine: TrainingEngine<B>,
    runtime: OllamaRuntime<T>,
    converter: GgufConverter<C>,
}

impl<B: TrainerBackend, T: ExternalTool, C: ExternalTool> Orchestrator<B, T, C> {
    pub fn new(
        settings: PipelineSettings,
        backend: B,
        runtime: OllamaRuntime<T>,
        converter: GgufConverter<C>,
    ) -> Self {
        Self {
            settings,
            mapper: ModelMapper::new(),
            engine: TrainingEngine::new(backend),
            runtime,
            converter,
        }
    }

    /// Run the pipeline. On error, emits the single terminal `ERROR:`
    /// line and cleans up staging before returning.
    pub fn execute(
        &mut self,
        config: &TrainingConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<RunOutcome> {
        match self.run(config, sink) {
            Ok(outcome) => {
                sink.completion(&format!(
                    "adapter {} deployed as {}",
                    outcome.record.adapter_id, outcome.record.adapter_name
                ));
                Ok(outcome)
            }
            Err(err) => {
                sink.error(&err.to_string());
                self.cleanup(config);
                MemoryMonitor::new(self.settings.verbose).force_cleanup();
                Err(err)
            }
        }
    }

    fn report(&self, sink: &mut dyn ProgressSink, band: Band, fraction: f64, message: &str) {
        let event = crate::progress::ProgressEvent {
            current: band.project(fraction).round() as u64,
            total: 100,
            percentage: band.project(fraction),
            message: message.to_string(),
            phase: None,
        };
        sink.report(&event);
    }

    fn run(&mut self, config: &TrainingConfig, sink: &mut dyn ProgressSink) -> Result<RunOutcome> {
        // ── validate ──
        self.report(sink, VALIDATE_BAND, 0.0, "validating configuration");
        config.validate()?;
        self.engine.validate_dependencies()?;
        self.report(sink, VALIDATE_BAND, 1.0, "configuration valid");

        // ── data ──
        self.report(sink, DATA_BAND, 0.0, "loading training data");
        let dataset = Dataset::load(&config.data_path)?;
        self.report(
            sink,
            DATA_BAND,
            1.0,
            &format!("loaded {} training examples", dataset.len()),
        );

        // ── mapping ──
        self.report(sink, MAPPING_BAND, 0.0, "resolving model mapping");
        let library_model = self
            .mapper
            .library_model_id(&config.base_model)
            .ok_or_else(|| {
                Error::Config(format!(
                    "no library mapping for base model {}",
                    config.base_model
                ))
            })?;
        let family = ArchFamily::from_model_id(&config.base_model);
        self.report(
            sink,
            MAPPING_BAND,
            1.0,
            &format!("mapped {} to {library_model}", config.base_model),
        );

        // ── base model ──
        self.report(sink, BASE_MODEL_BAND, 0.0, "checking base model availability");
        let installed = self.runtime.list_models()?;
        if !installed.iter().any(|m| m == &config.base_model) {
            self.report(
                sink,
                BASE_MODEL_BAND,
                0.3,
                &format!("pulling {} into serving runtime", config.base_model),
            );
            self.runtime.pull(&config.base_model)?;
        }
        self.engine.prepare_base_model(&library_model)?;
        self.report(sink, BASE_MODEL_BAND, 1.0, "base model ready");

        // ── plan + hardware ──
        let mut profile = Profiler::detect().verified_profile(crate::hardware::default_self_test);
        profile.adjust_for_family(family);
        let registry = AdapterRegistry::open(&self.settings.registry_dir)?;
        let staging = self.staging_for(config);
        let incremental = self.prepare_incremental(config, &registry, &staging)?;

        let planner = ContentPlanner::new();
        let (plan, analysis) = planner.plan(
            &dataset.examples,
            config.lora_rank,
            config.learning_rate,
            incremental,
            config.target_minutes,
        );
        // Pin the planned step count so every downstream component,
        // backend included, sees the same bound.
        let mut config = config.clone();
        config.apply_plan(&plan);
        let steps = config.effective_steps(&plan);
        if self.settings.verbose {
            eprintln!(
                "plan: {} ({:?} content, score {:.2})",
                plan.rationale, analysis.complexity, analysis.complexity_score
            );
            eprintln!("hardware: {}", profile.accelerator);
        }

        // ── train ──
        let mut monitor = MemoryMonitor::new(self.settings.verbose);
        let before = monitor.checkpoint("before training");
        if self.settings.verbose {
            for advice in MemoryMonitor::<NoAcceleratorCache>::recommendations(&before.snapshot) {
                eprintln!("advice: {advice}");
            }
        }
        self.train_staged(&config, &plan, &profile, &dataset.examples, &staging, sink, &mut monitor)?;
        monitor.checkpoint("after training");

        // ── deploy ──
        self.report(sink, DEPLOY_BAND, 0.0, "registering adapter weights");
        let chosen = Strategist::new(&self.mapper, &self.settings.staging_dir)
            .choose(&config.base_model);
        let method = match chosen {
            Strategy::Attach => "attach",
            Strategy::MergeConvert => "merged",
        };
        let mut record = registry.register(
            &config.adapter_id,
            &config.base_model,
            &library_model,
            &staging,
            method,
        )?;
        if chosen == Strategy::MergeConvert {
            // Restricted bases serve their merged weights under the
            // runtime tag with a -custom suffix.
            record.adapter_name = self.mapper.deployed_model_name(&config.base_model);
            registry.save(&record)?;
        }

        self.report(sink, DEPLOY_BAND, 0.3, "deploying to serving runtime");
        let (result, strategy) = self.deploy(&record, sink)?;
        match result {
            DeploymentResult::Succeeded { .. } => {}
            DeploymentResult::IncompatibleArchitecture { stderr } => {
                registry.remove(&record.adapter_id).ok();
                return Err(Error::Deployment(format!(
                    "architecture rejected by every strategy: {stderr}"
                )));
            }
            DeploymentResult::Failed { reason } => {
                registry.remove(&record.adapter_id).ok();
                return Err(Error::Deployment(reason));
            }
        }
        self.report(sink, DEPLOY_BAND, 1.0, "deployed");

        // ── register ──
        self.report(sink, REGISTER_BAND, 0.0, "finalizing registry record");
        record.training_method = match strategy {
            Strategy::Attach => "attach".to_string(),
            Strategy::MergeConvert => "merged".to_string(),
        };
        record.status = AdapterStatus::Deployed;
        registry.save(&record)?;
        let record = registry.mark_enabled(&record.adapter_id)?;

        monitor.checkpoint("pipeline complete");
        Ok(RunOutcome {
            record,
            strategy,
            steps,
        })
    }

    fn staging_for(&self, config: &TrainingConfig) -> PathBuf {
        self.settings
            .staging_dir
            .join(crate::registry::sanitize(&config.adapter_id))
    }

    /// On the incremental path, seed staging with the previous
    /// adapter's weights so training continues from them instead of
    /// starting fresh.
    fn prepare_incremental(
        &self,
        config: &TrainingConfig,
        registry: &AdapterRegistry,
        staging: &std::path::Path,
    ) -> Result<bool> {
        let Some(previous_id) = &config.continue_from else {
            return Ok(false);
        };
        let previous = registry.load(previous_id)?;
        std::fs::create_dir_all(staging)?;
        for entry in std::fs::read_dir(&previous.adapter_path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), staging.join(entry.file_name()))?;
            }
        }
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn train_staged(
        &mut self,
        config: &TrainingConfig,
        plan: &crate::plan::TrainingPlan,
        profile: &HardwareProfile,
        examples: &[crate::data::TrainingExample],
        staging: &std::path::Path,
        sink: &mut dyn ProgressSink,
        monitor: &mut MemoryMonitor<NoAcceleratorCache>,
    ) -> Result<()> {
        self.engine
            .train(config, plan, profile, examples, staging, TRAIN_BAND, sink, monitor)?;
        Ok(())
    }

    /// Attach first (unless the architecture is restricted), merge on
    /// rejection.
    fn deploy(
        &mut self,
        record: &AdapterRecord,
        sink: &mut dyn ProgressSink,
    ) -> Result<(DeploymentResult, Strategy)> {
        let strategist = Strategist::new(&self.mapper, &self.settings.staging_dir);

        if strategist.choose(&record.base_model) == Strategy::Attach {
            let result = strategist.attach(&self.runtime, record)?;
            match result {
                DeploymentResult::IncompatibleArchitecture { .. } => {
                    self.report(
                        sink,
                        DEPLOY_BAND,
                        0.5,
                        "attach rejected, falling back to merge",
                    );
                }
                other => return Ok((other, Strategy::Attach)),
            }
        }

        Ok((self.merge_deploy(record)?, Strategy::MergeConvert))
    }

    /// Merge the adapter into its base and ship the converted result.
    /// Shared by the training pipeline and re-enable.
    fn merge_deploy(&mut self, record: &AdapterRecord) -> Result<DeploymentResult> {
        let merged_dir = self
            .settings
            .staging_dir
            .join(format!("{}-merged", record.adapter_id));
        self.engine
            .merge_adapter(&record.library_model, &record.adapter_path, &merged_dir)?;
        Strategist::new(&self.mapper, &self.settings.staging_dir).merge_convert(
            &self.runtime,
            &self.converter,
            &merged_dir,
            record,
        )
    }

    /// Remove everything a failed run staged. Keeps going past
    /// individual failures; cleanup must not mask the original error.
    fn cleanup(&self, config: &TrainingConfig) {
        let id = crate::registry::sanitize(&config.adapter_id);
        let staging = self.staging_for(config);
        for dir in [
            staging,
            self.settings.staging_dir.join(format!("{id}-merged")),
        ] {
            if dir.exists() {
                if let Err(err) = std::fs::remove_dir_all(&dir) {
                    eprintln!("warning: cleanup failed for {}: {err}", dir.display());
                }
            }
        }
        Strategist::new(&self.mapper, &self.settings.staging_dir).cleanup(&id);
    }

    // ── adapter lifecycle ──

    /// Re-enable a registered adapter, recreating the served model if
    /// the runtime lost it. Uses the same strategy selection as the
    /// original deployment, so restricted architectures go back
    /// through merge instead of a doomed attach.
    pub fn enable(&mut self, adapter_id: &str) -> Result<AdapterRecord> {
        let registry = AdapterRegistry::open(&self.settings.registry_dir)?;
        let record = registry.load(adapter_id)?;
        if !self.runtime.has_model(&record.adapter_name)? {
            let chosen =
                Strategist::new(&self.mapper, &self.settings.staging_dir).choose(&record.base_model);
            let result = match chosen {
                Strategy::Attach => {
                    let attached = Strategist::new(&self.mapper, &self.settings.staging_dir)
                        .attach(&self.runtime, &record)?;
                    match attached {
                        DeploymentResult::IncompatibleArchitecture { .. } => {
                            self.merge_deploy(&record)?
                        }
                        other => other,
                    }
                }
                Strategy::MergeConvert => self.merge_deploy(&record)?,
            };
            match result {
                DeploymentResult::Succeeded { .. } => {}
                DeploymentResult::IncompatibleArchitecture { stderr } => {
                    return Err(Error::Deployment(format!(
                        "architecture rejected by every strategy: {stderr}"
                    )));
                }
                DeploymentResult::Failed { reason } => {
                    return Err(Error::Deployment(reason));
                }
            }
        }
        registry.mark_enabled(adapter_id)
    }

    /// Disable an adapter: remove the served model, keep the record
    /// and weights.
    pub fn disable(&mut self, adapter_id: &str) -> Result<AdapterRecord> {
        let registry = AdapterRegistry::open(&self.settings.registry_dir)?;
        let record = registry.load(adapter_id)?;
        self.runtime.remove(&record.adapter_name)?;
        registry.mark_disabled(adapter_id)
    }

    /// All registered adapters, newest first.
    pub fn list(&self) -> Result<Vec<AdapterRecord>> {
        let registry = AdapterRegistry::open(&self.settings.registry_dir)?;
        registry.list()
    }

    /// Health check: runtime reachable and, if given, the adapter's
    /// model present.
    pub fn status(&self, adapter_id: Option<&str>) -> Result<bool> {
        if !self.runtime.is_available() {
            return Ok(false);
        }
        match adapter_id {
            None => Ok(true),
            Some(id) => {
                let registry = AdapterRegistry::open(&self.settings.registry_dir)?;
                let record = registry.load(id)?;
                self.runtime.has_model(&record.adapter_name)
            }
        }
    }
}
