//! Progress channel.
//!
//! The pipeline reports progress as machine-readable lines on stdout:
//! `PROGRESS:<percentage 1dp>:<message>` for progress,
//! `ERROR:<message>` for the single terminal error of a failed run,
//! `PROGRESS:100.0:<message>` on completion. The consuming frontend
//! parses these lines; everything else goes to stderr.

use std::io::Write;

/// A single progress observation. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Current step within the phase.
    pub current: u64,
    /// Total steps within the phase.
    pub total: u64,
    /// Percentage, clamped to [0, 100].
    pub percentage: f64,
    /// Free-text message.
    pub message: String,
    /// Optional phase tag ("warmup", "main", "fine-tuning", ...).
    pub phase: Option<String>,
}

impl ProgressEvent {
    /// Build an event, deriving and clamping the percentage.
    pub fn new(current: u64, total: u64, message: impl Into<String>, phase: Option<&str>) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };
        Self {
            current,
            total,
            percentage,
            message: message.into(),
            phase: phase.map(str::to_string),
        }
    }

    /// Wire format consumed by the frontend.
    pub fn to_wire(&self) -> String {
        format!("PROGRESS:{:.1}:{}", self.percentage, self.message)
    }
}

/// Maps a sub-task's own 0–100% progress into a reserved band of the
/// overall pipeline percentage (e.g. training owns 20–90%).
#[derive(Debug, Clone, Copy)]
pub struct Band {
    pub start: f64,
    pub end: f64,
}

impl Band {
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Project a fraction in [0, 1] into this band.
    pub fn project(&self, fraction: f64) -> f64 {
        let f = fraction.clamp(0.0, 1.0);
        self.start + (self.end - self.start) * f
    }
}

/// Sink for progress events. The default implementation writes the
/// wire protocol to stdout and flushes, so a frontend reading the
/// pipe sees events as they happen.
pub trait ProgressSink {
    fn report(&mut self, event: &ProgressEvent);
    fn error(&mut self, message: &str);
    fn completion(&mut self, message: &str);
}

/// Stdout-backed reporter.
pub struct ProgressReporter {
    verbose: bool,
}

impl ProgressReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ProgressSink for ProgressReporter {
    fn report(&mut self, event: &ProgressEvent) {
        println!("{}", event.to_wire());
        let _ = std::io::stdout().flush();
        if self.verbose {
            let phase = event.phase.as_deref().unwrap_or("-");
            eprintln!(
                "  [{phase}] {}/{} ({:.1}%): {}",
                event.current, event.total, event.percentage, event.message
            );
        }
    }

    fn error(&mut self, message: &str) {
        println!("ERROR:{message}");
        let _ = std::io::stdout().flush();
        if self.verbose {
            eprintln!("error: {message}");
        }
    }

    fn completion(&mut self, message: &str) {
        println!("PROGRESS:100.0:{message}");
        let _ = std::io::stdout().flush();
    }
}

/// In-memory sink for tests and embedding.
#[derive(Default)]
pub struct BufferedSink {
    pub events: Vec<ProgressEvent>,
    pub errors: Vec<String>,
    pub completed: Option<String>,
}

impl ProgressSink for BufferedSink {
    fn report(&mut self, event: &ProgressEvent) {
        self.events.push(event.clone());
    }

    fn error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    fn completion(&mut self, message: &str) {
        self.completed = Some(message.to_string());
    }
}
