//! External tool boundary and the serving-runtime client.
//!
//! Everything the pipeline shells out to goes through the
//! [`ExternalTool`] trait: locate the executable on injected search
//! paths, invoke it with a hard timeout, capture output. Tests swap in
//! fakes; production uses [`SystemTool`] over the real filesystem.

pub mod converter;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::{Error, Result};

pub use converter::GgufConverter;

/// Captured output of a completed tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// An external executable the pipeline depends on.
pub trait ExternalTool {
    /// Tool name, used in errors and logs.
    fn name(&self) -> &str;

    /// Locate the executable.
    fn locate(&self) -> Result<PathBuf>;

    /// Run the tool with a hard timeout. On timeout the child is
    /// killed and [`Error::ToolTimeout`] returned; a nonzero exit is
    /// returned as a normal [`ToolOutput`] for the caller to judge.
    fn invoke(&self, args: &[&str], timeout: Duration) -> Result<ToolOutput>;
}

/// Filesystem-backed tool resolved against injected search paths.
pub struct SystemTool {
    name: String,
    search_paths: Vec<PathBuf>,
    envs: Vec<(String, String)>,
}

impl SystemTool {
    pub fn new(name: impl Into<String>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            search_paths,
            envs: Vec::new(),
        }
    }

    /// Default executable search paths.
    #[must_use]
    pub fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/usr/bin"),
            PathBuf::from("/opt/homebrew/bin"),
        ];
        if let Ok(path_var) = std::env::var("PATH") {
            paths.extend(std::env::split_paths(&path_var));
        }
        paths
    }

    /// Add an environment variable to every invocation.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl ExternalTool for SystemTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn locate(&self) -> Result<PathBuf> {
        for dir in &self.search_paths {
            let candidate = dir.join(&self.name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::ToolNotFound(self.name.clone()))
    }

    fn invoke(&self, args: &[&str], timeout: Duration) -> Result<ToolOutput> {
        let executable = self.locate()?;
        let mut command = Command::new(&executable);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        let mut child = command.spawn()?;

        // Drain both pipes on reader threads so a chatty tool never
        // blocks on a full pipe buffer while we wait for it to exit.
        let stdout_reader = child.stdout.take().map(drain_pipe);
        let stderr_reader = child.stderr.take().map(drain_pipe);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    child.kill()?;
                    let _ = child.wait();
                    join_reader(stdout_reader);
                    join_reader(stderr_reader);
                    return Err(Error::ToolTimeout {
                        tool: self.name.clone(),
                        seconds: timeout.as_secs(),
                    });
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        };

        Ok(ToolOutput {
            code: status.code(),
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
        })
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

// ── serving-runtime client ──

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
const CREATE_RETRIES: u32 = 3;
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Client for the Ollama-compatible serving runtime, driven entirely
/// through its CLI.
pub struct OllamaRuntime<T: ExternalTool> {
    tool: T,
}

impl OllamaRuntime<SystemTool> {
    pub fn system() -> Self {
        Self {
            tool: SystemTool::new("ollama", SystemTool::default_search_paths()),
        }
    }
}

impl<T: ExternalTool> OllamaRuntime<T> {
    pub fn new(tool: T) -> Self {
        Self { tool }
    }

    /// Whether the runtime responds at all.
    pub fn is_available(&self) -> bool {
        self.tool
            .invoke(&["list"], LIST_TIMEOUT)
            .map(|out| out.success())
            .unwrap_or(false)
    }

    /// Installed model tags.
    pub fn list_models(&self) -> Result<Vec<String>> {
        let out = self.tool.invoke(&["list"], LIST_TIMEOUT)?;
        if !out.success() {
            return Err(Error::ToolFailed {
                tool: self.tool.name().to_string(),
                code: out.code,
                stderr: out.stderr,
            });
        }
        // First column of every line after the header.
        Ok(out
            .stdout
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    /// Whether a model tag is installed.
    pub fn has_model(&self, tag: &str) -> Result<bool> {
        Ok(self.list_models()?.iter().any(|m| m == tag))
    }

    /// Pull a model from the registry.
    pub fn pull(&self, tag: &str) -> Result<()> {
        let out = self.tool.invoke(&["pull", tag], PULL_TIMEOUT)?;
        if !out.success() {
            return Err(Error::ToolFailed {
                tool: self.tool.name().to_string(),
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Create a model from a Modelfile, retrying transient
    /// file-visibility failures. Non-transient failures (including
    /// unsupported-architecture rejections) surface immediately so the
    /// caller can decide on fallback.
    pub fn create(&self, model_name: &str, modelfile: &Path) -> Result<()> {
        let modelfile_str = modelfile.to_string_lossy();
        let mut last: Option<Error> = None;
        for attempt in 1..=CREATE_RETRIES {
            let out = self
                .tool
                .invoke(&["create", model_name, "-f", &modelfile_str], CREATE_TIMEOUT)?;
            if out.success() {
                return Ok(());
            }
            let err = Error::ToolFailed {
                tool: self.tool.name().to_string(),
                code: out.code,
                stderr: out.stderr.clone(),
            };
            if !is_transient_create_failure(&out.stderr) {
                return Err(err);
            }
            eprintln!(
                "warning: create {model_name} attempt {attempt}/{CREATE_RETRIES} failed, retrying"
            );
            last = Some(err);
            if attempt < CREATE_RETRIES {
                std::thread::sleep(CREATE_RETRY_DELAY);
            }
        }
        Err(last.unwrap_or_else(|| Error::Deployment(format!("create {model_name} failed"))))
    }

    /// Remove a served model. Missing models are not an error.
    pub fn remove(&self, model_name: &str) -> Result<()> {
        let out = self.tool.invoke(&["rm", model_name], REMOVE_TIMEOUT)?;
        if out.success() || out.stderr.contains("not found") {
            return Ok(());
        }
        Err(Error::ToolFailed {
            tool: self.tool.name().to_string(),
            code: out.code,
            stderr: out.stderr,
        })
    }
}

/// Newly written weight files are sometimes not yet visible to the
/// runtime daemon; those failures resolve on retry.
fn is_transient_create_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such file")
        || lower.contains("error reading")
        || lower.contains("file does not exist")
}

/// Whether a create failure means the architecture cannot use the
/// attach strategy.
#[must_use]
pub fn is_unsupported_architecture(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("unsupported architecture")
        || lower.contains("unknown architecture")
        || lower.contains("architecture is not supported")
}
