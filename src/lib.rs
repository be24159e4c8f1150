//! Afinar: LoRA fine-tuning pipeline for local model runtimes
//!
//! Afinar coordinates the full lifecycle of a LoRA adapter: hardware
//! profiling, hyperparameter planning, fine-tuning through an external
//! trainer backend, and deployment into an Ollama-compatible serving
//! runtime with automatic strategy fallback.
//!
//! # Architecture
//!
//! ```text
//! TrainingConfig → Orchestrator
//!     ├─ hardware::Profiler        (accelerator detection)
//!     ├─ plan::Planner             (step/warmup/cadence calculation)
//!     ├─ monitor::MemoryMonitor    (pressure checkpoints + cleanup)
//!     ├─ engine::TrainingEngine    (external trainer boundary)
//!     ├─ deploy::Strategist        (attach vs merge+convert)
//!     └─ registry::AdapterRegistry (persistent adapter records)
//! ```
//!
//! The serving runtime and format converter are consumed as external
//! executables behind the [`runtime::ExternalTool`] trait; the tensor
//! math of training itself lives behind [`engine::TrainerBackend`].

pub mod cli;
pub mod config;
pub mod data;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod mapping;
pub mod merge;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod registry;
pub mod runtime;

pub use error::{Error, Result};
