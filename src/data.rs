//! Training data loading and validation.
//!
//! Datasets are JSONL files of `{"input": ..., "output": ...}` pairs.
//! Loading is tolerant: malformed lines are skipped with a warning so
//! one bad record never aborts a run, but a dataset with zero valid
//! examples is an error.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One instruction/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub input: String,
    pub output: String,
}

impl TrainingExample {
    /// Render as the prompt format the trainer consumes.
    #[must_use]
    pub fn to_prompt(&self) -> String {
        format!(
            "### Instruction:\n{}\n\n### Response:\n{}",
            self.input.trim(),
            self.output.trim()
        )
    }

    fn is_valid(&self) -> bool {
        !self.input.trim().is_empty() && !self.output.trim().is_empty()
    }
}

/// Outcome of loading a dataset file.
#[derive(Debug)]
pub struct Dataset {
    pub examples: Vec<TrainingExample>,
    /// Lines that failed to parse or validate, with line numbers.
    pub skipped: Vec<(usize, String)>,
}

impl Dataset {
    /// Load and validate a JSONL dataset.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Data(format!(
                "training data file not found: {}",
                path.display()
            )));
        }
        let reader = BufReader::new(File::open(path)?);
        let mut examples = Vec::new();
        let mut skipped = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TrainingExample>(trimmed) {
                Ok(example) if example.is_valid() => examples.push(example),
                Ok(_) => skipped.push((line_no, "empty input or output".to_string())),
                Err(err) => skipped.push((line_no, err.to_string())),
            }
        }

        for (line_no, reason) in &skipped {
            eprintln!("warning: skipping line {line_no}: {reason}");
        }

        if examples.is_empty() {
            return Err(Error::Data(format!(
                "no valid training examples in {}",
                path.display()
            )));
        }
        Ok(Self { examples, skipped })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}
