//! Command-line interface.
//!
//! One subcommand per pipeline operation. Structured results (list,
//! status) print JSON to stdout; the train subcommand streams the
//! progress wire protocol instead. Diagnostics always go to stderr.

mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{PipelineSettings, TrainingConfig};
use crate::engine::TrainerBackend;
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressReporter;
use crate::runtime::{GgufConverter, OllamaRuntime};
use crate::Result;

pub use logging::LogLevel;

#[derive(Parser)]
#[command(name = "afinar", version, about = "LoRA fine-tuning pipeline with automatic Ollama deployment")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose diagnostics on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress diagnostics
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Adapter registry directory (defaults under $HOME)
    #[arg(long, global = true)]
    pub registry_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Train an adapter and deploy it to the serving runtime
    Train {
        /// Base model tag in the serving runtime
        #[arg(long)]
        base_model: String,

        /// Identifier for the new adapter
        #[arg(long)]
        adapter_id: String,

        /// JSONL training data file
        #[arg(long)]
        data: PathBuf,

        /// Learning rate
        #[arg(long, default_value_t = 2e-5)]
        learning_rate: f64,

        /// LoRA rank
        #[arg(long, default_value_t = 8)]
        lora_rank: u32,

        /// Override the planned step count
        #[arg(long)]
        max_steps: Option<u32>,

        /// Continue training from an existing adapter
        #[arg(long)]
        continue_from: Option<String>,

        /// Target training time in minutes
        #[arg(long)]
        target_minutes: Option<u32>,
    },

    /// Re-enable a disabled adapter
    Enable {
        adapter_id: String,
    },

    /// Disable an adapter, removing its served model
    Disable {
        adapter_id: String,
    },

    /// List registered adapters as JSON
    List,

    /// Check runtime health and, optionally, one adapter's model
    Test {
        adapter_id: Option<String>,
    },
}

/// Dispatch a parsed CLI invocation with the given trainer backend.
pub fn run_command<B: TrainerBackend>(cli: Cli, backend: B) -> Result<()> {
    let level = LogLevel::from_flags(cli.verbose, cli.quiet);
    let mut settings = PipelineSettings::from_home()?;
    settings.verbose = level.is_verbose();
    if let Some(dir) = cli.registry_dir {
        settings.registry_dir = dir;
    }

    let search_paths = settings.tool_search_paths.clone();
    let mut orchestrator = Orchestrator::new(
        settings,
        backend,
        OllamaRuntime::system(),
        GgufConverter::system(search_paths),
    );

    match cli.command {
        Command::Train {
            base_model,
            adapter_id,
            data,
            learning_rate,
            lora_rank,
            max_steps,
            continue_from,
            target_minutes,
        } => {
            let mut config = TrainingConfig::new(base_model, adapter_id, data);
            config.learning_rate = learning_rate;
            config.lora_rank = lora_rank;
            config.max_steps = max_steps;
            config.continue_from = continue_from;
            config.target_minutes = target_minutes;

            let mut sink = ProgressReporter::new(level.is_verbose());
            let outcome = orchestrator.execute(&config, &mut sink)?;
            level.log(
                LogLevel::Normal,
                &format!(
                    "trained {} steps, deployed as {}",
                    outcome.steps, outcome.record.adapter_name
                ),
            );
        }
        Command::Enable { adapter_id } => {
            let record = orchestrator.enable(&adapter_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Disable { adapter_id } => {
            let record = orchestrator.disable(&adapter_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::List => {
            let records = orchestrator.list()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Test { adapter_id } => {
            let healthy = orchestrator.status(adapter_id.as_deref())?;
            println!("{}", serde_json::json!({ "healthy": healthy }));
            if !healthy {
                level.log(LogLevel::Normal, "serving runtime is not available");
            }
        }
    }
    Ok(())
}
