//! Pipeline configuration.
//!
//! [`TrainingConfig`] is the caller-facing request: what to train, on
//! what data, with which hyperparameters. [`PipelineSettings`] is the
//! environment: directories and tool search paths, injected so tests
//! and embedders never touch global state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::plan::TrainingPlan;
use crate::{Error, Result};

/// One fine-tuning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Serving-runtime tag of the base model.
    pub base_model: String,
    /// Adapter identifier; sanitized before any filesystem use.
    pub adapter_id: String,
    /// JSONL training data path.
    pub data_path: PathBuf,
    pub learning_rate: f64,
    pub lora_rank: u32,
    pub lora_alpha: u32,
    pub lora_dropout: f64,
    pub batch_size: u32,
    pub gradient_accumulation: u32,
    pub max_seq_length: u32,
    /// Steps override; `None` lets the planner decide.
    pub max_steps: Option<u32>,
    /// Continue from this adapter's existing weights.
    pub continue_from: Option<String>,
    /// Wall-clock budget for content-aware planning, minutes.
    pub target_minutes: Option<u32>,
}

impl TrainingConfig {
    /// Config with tuned defaults for everything but the identifiers.
    pub fn new(
        base_model: impl Into<String>,
        adapter_id: impl Into<String>,
        data_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_model: base_model.into(),
            adapter_id: adapter_id.into(),
            data_path: data_path.into(),
            learning_rate: 2e-5,
            lora_rank: 8,
            lora_alpha: 16,
            lora_dropout: 0.1,
            batch_size: 1,
            gradient_accumulation: 4,
            max_seq_length: 512,
            max_steps: None,
            continue_from: None,
            target_minutes: None,
        }
    }

    /// Validate before anything external runs.
    pub fn validate(&self) -> Result<()> {
        if self.base_model.trim().is_empty() {
            return Err(Error::Config("base model is required".to_string()));
        }
        if self.adapter_id.trim().is_empty() {
            return Err(Error::Config("adapter id is required".to_string()));
        }
        if self.learning_rate <= 0.0 || self.learning_rate > 1.0 {
            return Err(Error::Config(format!(
                "learning rate {} out of range (0, 1]",
                self.learning_rate
            )));
        }
        if self.lora_rank == 0 || self.lora_rank > 256 {
            return Err(Error::Config(format!(
                "lora rank {} out of range [1, 256]",
                self.lora_rank
            )));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(Error::Config(format!(
                "lora dropout {} out of range [0, 1)",
                self.lora_dropout
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        if self.max_seq_length < 32 {
            return Err(Error::Config(format!(
                "max sequence length {} too small",
                self.max_seq_length
            )));
        }
        if let Some(steps) = self.max_steps {
            if steps == 0 {
                return Err(Error::Config("max steps must be positive".to_string()));
            }
        }
        Ok(())
    }

    /// Fold a plan into the config. An explicit `max_steps` override
    /// wins over the planner.
    #[must_use]
    pub fn effective_steps(&self, plan: &TrainingPlan) -> u32 {
        self.max_steps.unwrap_or(plan.max_steps)
    }

    /// Pin the planned step count into the config before the run.
    pub fn apply_plan(&mut self, plan: &TrainingPlan) {
        self.max_steps = Some(self.effective_steps(plan));
    }

    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.continue_from.is_some()
    }
}

/// Environment the pipeline runs in. Everything here is injectable.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Adapter registry root.
    pub registry_dir: PathBuf,
    /// Scratch directory for training output and merged models.
    pub staging_dir: PathBuf,
    /// Executable search paths for external tools.
    pub tool_search_paths: Vec<PathBuf>,
    pub verbose: bool,
}

impl PipelineSettings {
    /// Production defaults under the user's home directory.
    pub fn from_home() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config("HOME is not set".to_string()))?;
        Ok(Self {
            registry_dir: home.join(".afinar").join("adapters"),
            staging_dir: home.join(".afinar").join("staging"),
            tool_search_paths: crate::runtime::SystemTool::default_search_paths(),
            verbose: false,
        })
    }

    /// Settings rooted at a single directory. Used by tests.
    #[must_use]
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            registry_dir: root.join("adapters"),
            staging_dir: root.join("staging"),
            tool_search_paths: vec![root.join("bin")],
            verbose: false,
        }
    }
}
