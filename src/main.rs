//! Afinar CLI
//!
//! Fine-tune a LoRA adapter and deploy it to a local serving runtime.
//!
//! # Usage
//!
//! ```bash
//! # Train and deploy an adapter
//! afinar train --base-model gemma3:latest --adapter-id helper --data pairs.jsonl
//!
//! # Toggle adapters
//! afinar enable helper
//! afinar disable helper
//!
//! # Inspect state
//! afinar list
//! afinar test helper
//! ```

use clap::Parser;
use std::process::ExitCode;

use afinar::cli::{run_command, Cli};
use afinar::engine::subprocess::SubprocessBackend;
use afinar::runtime::SystemTool;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let backend = SubprocessBackend::new(SystemTool::default_search_paths());

    match run_command(cli, backend) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
