//! Diagnostic output control.
//!
//! Diagnostics go to stderr so they never interleave with the
//! machine-readable progress lines on stdout.

/// Verbosity level for stderr diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Normal,
    Verbose,
}

impl LogLevel {
    /// Resolve from the global CLI flags.
    #[must_use]
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Self::Quiet
        } else if verbose {
            Self::Verbose
        } else {
            Self::Normal
        }
    }

    /// Emit a message at `level` if this level permits it.
    pub fn log(&self, level: LogLevel, message: &str) {
        if *self >= level && *self != Self::Quiet {
            eprintln!("{message}");
        }
    }

    #[must_use]
    pub fn is_verbose(&self) -> bool {
        *self == Self::Verbose
    }
}
