//! Subprocess trainer backend.
//!
//! Drives an external trainer executable. Short operations go through
//! the [`ExternalTool`] timeout machinery; the training loop itself is
//! streamed line by line so step updates arrive as they happen. The
//! trainer reports steps on stdout as `STEP:<n>:<total>:<loss>` lines;
//! anything else is forwarded to stderr diagnostics.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::TrainingConfig;
use crate::hardware::{HardwareProfile, Precision};
use crate::plan::TrainingPlan;
use crate::runtime::{ExternalTool, SystemTool};
use crate::{Error, Result};

use super::{StepUpdate, TrainerBackend};

const PREPARE_TIMEOUT: Duration = Duration::from_secs(1800);
const MERGE_TIMEOUT: Duration = Duration::from_secs(1800);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Backend over an external trainer executable.
pub struct SubprocessBackend {
    tool: SystemTool,
}

impl SubprocessBackend {
    pub fn new(search_paths: Vec<std::path::PathBuf>) -> Self {
        Self {
            tool: SystemTool::new("afinar-trainer", search_paths),
        }
    }

    fn trainer_args(
        config: &TrainingConfig,
        plan: &TrainingPlan,
        profile: &HardwareProfile,
        staging_dir: &Path,
    ) -> Vec<String> {
        let steps = config.effective_steps(plan);
        let mut args = vec![
            "train".to_string(),
            "--data".to_string(),
            config.data_path.display().to_string(),
            "--output".to_string(),
            staging_dir.display().to_string(),
            "--learning-rate".to_string(),
            config.learning_rate.to_string(),
            "--lora-rank".to_string(),
            config.lora_rank.to_string(),
            "--lora-alpha".to_string(),
            config.lora_alpha.to_string(),
            "--lora-dropout".to_string(),
            config.lora_dropout.to_string(),
            "--batch-size".to_string(),
            (config.batch_size * profile.batch_multiplier).to_string(),
            "--gradient-accumulation".to_string(),
            config.gradient_accumulation.to_string(),
            "--max-seq-length".to_string(),
            config.max_seq_length.to_string(),
            "--max-steps".to_string(),
            steps.to_string(),
            "--warmup-steps".to_string(),
            plan.warmup_steps.to_string(),
            "--save-steps".to_string(),
            plan.save_steps.to_string(),
            "--logging-steps".to_string(),
            plan.logging_steps.to_string(),
        ];
        if profile.precision == Precision::Float16 {
            args.push("--fp16".to_string());
        }
        if profile.gradient_checkpointing {
            args.push("--gradient-checkpointing".to_string());
        }
        if profile.load_in_8bit {
            args.push("--load-in-8bit".to_string());
        }
        if profile.low_cpu_mem {
            args.push("--low-cpu-mem".to_string());
        }
        args.push("--loader-workers".to_string());
        args.push(profile.loader_workers.to_string());
        args
    }
}

/// Parse one `STEP:<n>:<total>:<loss>` line.
fn parse_step_line(line: &str) -> Option<StepUpdate> {
    let rest = line.strip_prefix("STEP:")?;
    let mut parts = rest.splitn(3, ':');
    let step = parts.next()?.parse().ok()?;
    let total_steps = parts.next()?.parse().ok()?;
    let loss = parts.next()?.parse().ok()?;
    Some(StepUpdate {
        step,
        total_steps,
        loss,
    })
}

impl TrainerBackend for SubprocessBackend {
    fn validate_dependencies(&mut self) -> Result<()> {
        self.tool.locate().map_err(|_| {
            Error::Dependency("trainer executable not found on search paths".to_string())
        })?;
        let out = self.tool.invoke(&["check"], VALIDATE_TIMEOUT)?;
        if !out.success() {
            return Err(Error::Dependency(out.stderr));
        }
        Ok(())
    }

    fn prepare_base_model(&mut self, library_model: &str) -> Result<()> {
        let out = self
            .tool
            .invoke(&["prepare", library_model], PREPARE_TIMEOUT)?;
        if !out.success() {
            return Err(Error::Dependency(out.stderr));
        }
        Ok(())
    }

    fn train(
        &mut self,
        config: &TrainingConfig,
        plan: &TrainingPlan,
        profile: &HardwareProfile,
        staging_dir: &Path,
        on_step: &mut dyn FnMut(StepUpdate),
    ) -> Result<()> {
        let executable = self.tool.locate()?;
        let args = Self::trainer_args(config, plan, profile, staging_dir);

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                match parse_step_line(&line) {
                    Some(update) => on_step(update),
                    None if !line.trim().is_empty() => eprintln!("trainer: {line}"),
                    None => {}
                }
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::Training(format!(
                "trainer exited with {:?}",
                status.code()
            )));
        }
        Ok(())
    }

    fn merge_adapter(
        &mut self,
        library_model: &str,
        adapter_dir: &Path,
        output_dir: &Path,
    ) -> Result<()> {
        let adapter = adapter_dir.display().to_string();
        let output = output_dir.display().to_string();
        let out = self.tool.invoke(
            &["merge", library_model, "--adapter", &adapter, "--output", &output],
            MERGE_TIMEOUT,
        )?;
        if !out.success() {
            return Err(Error::Merge(out.stderr));
        }
        Ok(())
    }
}
