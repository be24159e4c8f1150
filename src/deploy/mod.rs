//! Deployment strategies.
//!
//! Two ways into the serving runtime: attach the adapter to the stock
//! base model with an ADAPTER directive, or merge the adapter into the
//! base weights and ship a converted GGUF. The strategist picks attach
//! whenever the architecture allows it and falls back to merge when
//! the runtime rejects the adapter at create time.

pub mod modelfile;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::mapping::ModelMapper;
use crate::registry::AdapterRecord;
use crate::runtime::converter::{GgufConverter, Quantization};
use crate::runtime::{is_unsupported_architecture, ExternalTool, OllamaRuntime};
use crate::{Error, Result};

pub use modelfile::{attach_modelfile, merged_modelfile};

/// Deployment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Attach,
    MergeConvert,
}

/// Outcome of a deployment attempt. Incompatibility is a value, not an
/// error, so callers can fall back without string-matching messages.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentResult {
    Succeeded {
        model_name: String,
        strategy: Strategy,
    },
    /// The runtime rejected the adapter's architecture. Only the
    /// attach strategy produces this.
    IncompatibleArchitecture { stderr: String },
    Failed { reason: String },
}

impl DeploymentResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Chooses and executes deployment strategies.
pub struct Strategist<'a> {
    mapper: &'a ModelMapper,
    staging_dir: PathBuf,
}

impl<'a> Strategist<'a> {
    pub fn new(mapper: &'a ModelMapper, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            mapper,
            staging_dir: staging_dir.into(),
        }
    }

    /// Pick the initial strategy for a base model. Restricted
    /// architectures skip straight to merge, everything else starts
    /// with attach.
    #[must_use]
    pub fn choose(&self, base_model: &str) -> Strategy {
        if self.mapper.is_restricted(base_model) {
            Strategy::MergeConvert
        } else {
            Strategy::Attach
        }
    }

    /// Attach the adapter to the stock base model.
    pub fn attach<T: ExternalTool>(
        &self,
        runtime: &OllamaRuntime<T>,
        record: &AdapterRecord,
    ) -> Result<DeploymentResult> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let modelfile = self.staging_dir.join(format!("{}.Modelfile", record.adapter_id));
        std::fs::write(&modelfile, attach_modelfile(record))?;

        match runtime.create(&record.adapter_name, &modelfile) {
            Ok(()) => Ok(DeploymentResult::Succeeded {
                model_name: record.adapter_name.clone(),
                strategy: Strategy::Attach,
            }),
            Err(Error::ToolFailed { stderr, .. }) if is_unsupported_architecture(&stderr) => {
                Ok(DeploymentResult::IncompatibleArchitecture { stderr })
            }
            Err(Error::ToolFailed { stderr, .. }) => {
                Ok(DeploymentResult::Failed { reason: stderr })
            }
            Err(other) => Err(other),
        }
    }

    /// Ship an already-merged model directory: convert to GGUF, write
    /// a FROM-gguf Modelfile, create the model.
    pub fn merge_convert<T: ExternalTool, C: ExternalTool>(
        &self,
        runtime: &OllamaRuntime<T>,
        converter: &GgufConverter<C>,
        merged_model_dir: &Path,
        record: &AdapterRecord,
    ) -> Result<DeploymentResult> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let gguf = self.staging_dir.join(format!("{}.gguf", record.adapter_id));
        if let Err(err) = converter.convert(merged_model_dir, &gguf, Quantization::Q8_0) {
            return Ok(DeploymentResult::Failed {
                reason: err.to_string(),
            });
        }

        let modelfile = self
            .staging_dir
            .join(format!("{}.merged.Modelfile", record.adapter_id));
        std::fs::write(&modelfile, merged_modelfile(&gguf, record))?;

        match runtime.create(&record.adapter_name, &modelfile) {
            Ok(()) => Ok(DeploymentResult::Succeeded {
                model_name: record.adapter_name.clone(),
                strategy: Strategy::MergeConvert,
            }),
            Err(Error::ToolFailed { stderr, .. }) => {
                Ok(DeploymentResult::Failed { reason: stderr })
            }
            Err(other) => Err(other),
        }
    }

    /// Remove staging artifacts for an adapter. Failures are logged,
    /// not propagated; cleanup runs on error paths.
    pub fn cleanup(&self, adapter_id: &str) {
        for name in [
            format!("{adapter_id}.Modelfile"),
            format!("{adapter_id}.merged.Modelfile"),
            format!("{adapter_id}.gguf"),
        ] {
            let path = self.staging_dir.join(name);
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    eprintln!("warning: failed to remove {}: {err}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AdapterStatus;
    use crate::runtime::ToolOutput;
    use std::cell::RefCell;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeTool {
        name: String,
        responses: RefCell<Vec<ToolOutput>>,
        touch: Option<PathBuf>,
    }

    impl FakeTool {
        fn new(name: &str, responses: Vec<ToolOutput>) -> Self {
            Self {
                name: name.to_string(),
                responses: RefCell::new(responses),
                touch: None,
            }
        }
    }

    impl ExternalTool for FakeTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn locate(&self) -> Result<PathBuf> {
            Ok(PathBuf::from("/fake").join(&self.name))
        }
        fn invoke(&self, _args: &[&str], _timeout: Duration) -> Result<ToolOutput> {
            if let Some(path) = &self.touch {
                std::fs::write(path, b"gguf").unwrap();
            }
            Ok(self.responses.borrow_mut().remove(0))
        }
    }

    fn ok() -> ToolOutput {
        ToolOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> ToolOutput {
        ToolOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn record(staging: &Path) -> AdapterRecord {
        let weights = staging.join("weights");
        std::fs::create_dir_all(&weights).unwrap();
        AdapterRecord {
            adapter_id: "helper".to_string(),
            adapter_name: "helper_adapter".to_string(),
            base_model: "mistral:latest".to_string(),
            library_model: "mistralai/Mistral-7B-Instruct-v0.3".to_string(),
            adapter_path: weights,
            registry_path: staging.join("helper_adapter.json"),
            created_at: chrono::Utc::now(),
            enabled: false,
            training_method: "attach".to_string(),
            status: AdapterStatus::Ready,
            persistent: true,
            last_enabled: None,
            last_disabled: None,
        }
    }

    #[test]
    fn test_choose_by_architecture() {
        let mapper = ModelMapper::new();
        let dir = TempDir::new().unwrap();
        let strategist = Strategist::new(&mapper, dir.path());
        assert_eq!(strategist.choose("gemma3:latest"), Strategy::MergeConvert);
        assert_eq!(strategist.choose("mistral:latest"), Strategy::Attach);
    }

    #[test]
    fn test_attach_success() {
        let mapper = ModelMapper::new();
        let dir = TempDir::new().unwrap();
        let strategist = Strategist::new(&mapper, dir.path());
        let runtime = OllamaRuntime::new(FakeTool::new("ollama", vec![ok()]));

        let result = strategist.attach(&runtime, &record(dir.path())).unwrap();
        assert_eq!(
            result,
            DeploymentResult::Succeeded {
                model_name: "helper_adapter".to_string(),
                strategy: Strategy::Attach,
            }
        );
        // Modelfile written into staging.
        assert!(dir.path().join("helper.Modelfile").exists());
    }

    #[test]
    fn test_attach_arch_rejection_is_a_value() {
        let mapper = ModelMapper::new();
        let dir = TempDir::new().unwrap();
        let strategist = Strategist::new(&mapper, dir.path());
        let runtime = OllamaRuntime::new(FakeTool::new(
            "ollama",
            vec![fail("Error: unsupported architecture \"gemma3\"")],
        ));

        let result = strategist.attach(&runtime, &record(dir.path())).unwrap();
        assert!(matches!(
            result,
            DeploymentResult::IncompatibleArchitecture { .. }
        ));
    }

    #[test]
    fn test_merge_convert_path() {
        let mapper = ModelMapper::new();
        let dir = TempDir::new().unwrap();
        let strategist = Strategist::new(&mapper, dir.path());
        let runtime = OllamaRuntime::new(FakeTool::new("ollama", vec![ok()]));

        let mut converter_tool = FakeTool::new("convert_hf_to_gguf.py", vec![ok()]);
        converter_tool.touch = Some(dir.path().join("helper.gguf"));
        let converter = GgufConverter::new(converter_tool);

        let merged_dir = dir.path().join("merged");
        std::fs::create_dir_all(&merged_dir).unwrap();

        let result = strategist
            .merge_convert(&runtime, &converter, &merged_dir, &record(dir.path()))
            .unwrap();
        assert_eq!(
            result,
            DeploymentResult::Succeeded {
                model_name: "helper_adapter".to_string(),
                strategy: Strategy::MergeConvert,
            }
        );
        let modelfile =
            std::fs::read_to_string(dir.path().join("helper.merged.Modelfile")).unwrap();
        assert!(modelfile.contains(".gguf"));
    }

    #[test]
    fn test_converter_failure_is_failed_result() {
        let mapper = ModelMapper::new();
        let dir = TempDir::new().unwrap();
        let strategist = Strategist::new(&mapper, dir.path());
        let runtime = OllamaRuntime::new(FakeTool::new("ollama", vec![]));
        let converter = GgufConverter::new(FakeTool::new(
            "convert_hf_to_gguf.py",
            vec![fail("bad tensor")],
        ));

        let merged_dir = dir.path().join("merged");
        std::fs::create_dir_all(&merged_dir).unwrap();
        let result = strategist
            .merge_convert(&runtime, &converter, &merged_dir, &record(dir.path()))
            .unwrap();
        assert!(matches!(result, DeploymentResult::Failed { .. }));
    }

    #[test]
    fn test_cleanup_removes_staging_artifacts() {
        let mapper = ModelMapper::new();
        let dir = TempDir::new().unwrap();
        let strategist = Strategist::new(&mapper, dir.path());
        std::fs::write(dir.path().join("helper.Modelfile"), b"x").unwrap();
        std::fs::write(dir.path().join("helper.gguf"), b"x").unwrap();
        strategist.cleanup("helper");
        assert!(!dir.path().join("helper.Modelfile").exists());
        assert!(!dir.path().join("helper.gguf").exists());
    }
}
