//! GGUF format conversion.
//!
//! Wraps the llama.cpp conversion script as an [`ExternalTool`]. The
//! converter is only needed on the merge path, so a missing executable
//! is reported lazily at conversion time, not at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

use super::{ExternalTool, SystemTool};

const CONVERT_TIMEOUT: Duration = Duration::from_secs(2400);

/// Supported output quantizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantization {
    F16,
    Q8_0,
    Q4KM,
}

impl Quantization {
    fn flag(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::Q8_0 => "q8_0",
            Self::Q4KM => "q4_k_m",
        }
    }
}

/// Converts a merged model directory into a single GGUF file.
pub struct GgufConverter<T: ExternalTool> {
    tool: T,
}

impl GgufConverter<SystemTool> {
    /// Converter over the real conversion script, with thread caps so
    /// conversion does not starve a concurrent serving runtime.
    pub fn system(search_paths: Vec<PathBuf>) -> Self {
        let tool = SystemTool::new("convert_hf_to_gguf.py", search_paths)
            .env("OMP_NUM_THREADS", "2")
            .env("MKL_NUM_THREADS", "2");
        Self { tool }
    }
}

impl<T: ExternalTool> GgufConverter<T> {
    pub fn new(tool: T) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Whether the conversion script is installed.
    pub fn is_available(&self) -> bool {
        self.tool.locate().is_ok()
    }

    /// Convert `model_dir` to GGUF at `output`, returning the output
    /// path. Fails if the converter exits nonzero or produces no file.
    pub fn convert(
        &self,
        model_dir: &Path,
        output: &Path,
        quantization: Quantization,
    ) -> Result<PathBuf> {
        let model_str = model_dir.to_string_lossy().to_string();
        let output_str = output.to_string_lossy().to_string();
        let out = self.tool.invoke(
            &[
                &model_str,
                "--outfile",
                &output_str,
                "--outtype",
                quantization.flag(),
            ],
            CONVERT_TIMEOUT,
        )?;
        if !out.success() {
            return Err(Error::ToolFailed {
                tool: self.tool.name().to_string(),
                code: out.code,
                stderr: out.stderr,
            });
        }
        if !output.exists() {
            return Err(Error::Deployment(format!(
                "converter reported success but {} was not created",
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ToolOutput;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct ScriptedTool {
        responses: RefCell<Vec<ToolOutput>>,
        touch_output: Option<PathBuf>,
    }

    impl ExternalTool for ScriptedTool {
        fn name(&self) -> &str {
            "convert_hf_to_gguf.py"
        }
        fn locate(&self) -> crate::Result<PathBuf> {
            Ok(PathBuf::from("/fake/convert_hf_to_gguf.py"))
        }
        fn invoke(&self, _args: &[&str], _timeout: Duration) -> crate::Result<ToolOutput> {
            if let Some(path) = &self.touch_output {
                std::fs::write(path, b"gguf").unwrap();
            }
            Ok(self.responses.borrow_mut().remove(0))
        }
    }

    #[test]
    fn test_convert_success() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("model.gguf");
        let converter = GgufConverter::new(ScriptedTool {
            responses: RefCell::new(vec![ToolOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }]),
            touch_output: Some(output.clone()),
        });
        let result = converter
            .convert(dir.path(), &output, Quantization::Q8_0)
            .unwrap();
        assert_eq!(result, output);
    }

    #[test]
    fn test_convert_missing_output_is_error() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("model.gguf");
        let converter = GgufConverter::new(ScriptedTool {
            responses: RefCell::new(vec![ToolOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }]),
            touch_output: None,
        });
        let err = converter
            .convert(dir.path(), &output, Quantization::F16)
            .unwrap_err();
        assert!(matches!(err, Error::Deployment(_)));
    }

    #[test]
    fn test_convert_failure_propagates_stderr() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("model.gguf");
        let converter = GgufConverter::new(ScriptedTool {
            responses: RefCell::new(vec![ToolOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "unsupported tensor layout".to_string(),
            }]),
            touch_output: None,
        });
        let err = converter
            .convert(dir.path(), &output, Quantization::Q4KM)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported tensor layout"));
    }
}
