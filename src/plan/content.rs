//! Content-aware planning.
//!
//! Scores dataset complexity from the text itself (vocabulary
//! diversity, sentence length, question density) and feeds the result
//! through the arithmetic planner, optionally capped by a wall-clock
//! training budget.

use regex::Regex;
use std::collections::HashSet;

use super::{Complexity, PlanRequest, Planner, TrainingPlan};
use crate::data::TrainingExample;

/// Aggregate text statistics over a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentAnalysis {
    pub total_tokens: usize,
    pub vocabulary_diversity: f64,
    pub avg_sentence_length: f64,
    pub question_ratio: f64,
    pub complexity_score: f64,
    pub complexity: Complexity,
}

/// Planner that inspects the dataset text before sizing the run.
pub struct ContentPlanner {
    token_re: Regex,
    sentence_re: Regex,
}

/// Rough steps-per-minute throughput used for the time cap.
const STEPS_PER_MINUTE: u32 = 50;

impl ContentPlanner {
    pub fn new() -> Self {
        Self {
            // Word-ish tokens; punctuation is not vocabulary.
            token_re: Regex::new(r"[A-Za-z0-9_']+").unwrap_or_else(|_| unreachable!()),
            sentence_re: Regex::new(r"[.!?]+").unwrap_or_else(|_| unreachable!()),
        }
    }

    /// Score the dataset text.
    pub fn analyze(&self, examples: &[TrainingExample]) -> ContentAnalysis {
        let mut tokens = Vec::new();
        let mut sentence_count = 0usize;
        let mut question_count = 0usize;

        for example in examples {
            for text in [&example.input, &example.output] {
                for m in self.token_re.find_iter(text) {
                    tokens.push(m.as_str().to_lowercase());
                }
                sentence_count += self.sentence_re.find_iter(text).count();
                question_count += text.matches('?').count();
            }
        }

        let total_tokens = tokens.len();
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        let vocabulary_diversity = if total_tokens == 0 {
            0.0
        } else {
            unique.len() as f64 / total_tokens as f64
        };
        let avg_sentence_length = if sentence_count == 0 {
            total_tokens as f64
        } else {
            total_tokens as f64 / sentence_count as f64
        };
        let question_ratio = if sentence_count == 0 {
            0.0
        } else {
            question_count as f64 / sentence_count as f64
        };

        // Each signal normalized to [0, 1], then averaged.
        let complexity_score = ((vocabulary_diversity * 2.0).min(1.0)
            + (avg_sentence_length / 15.0).min(1.0)
            + (question_ratio * 10.0).min(1.0))
            / 3.0;

        let complexity = if complexity_score < 0.3 {
            Complexity::Simple
        } else if complexity_score < 0.6 {
            Complexity::Medium
        } else {
            Complexity::Complex
        };

        ContentAnalysis {
            total_tokens,
            vocabulary_diversity,
            avg_sentence_length,
            question_ratio,
            complexity_score,
            complexity,
        }
    }

    /// Plan from the dataset content. `target_minutes` caps the step
    /// count by estimated throughput.
    pub fn plan(
        &self,
        examples: &[TrainingExample],
        lora_rank: u32,
        learning_rate: f64,
        incremental: bool,
        target_minutes: Option<u32>,
    ) -> (TrainingPlan, ContentAnalysis) {
        let analysis = self.analyze(examples);
        let mut plan = Planner::plan(&PlanRequest {
            example_count: examples.len(),
            lora_rank,
            learning_rate,
            complexity: analysis.complexity,
            incremental,
        });
        if let Some(minutes) = target_minutes {
            let cap = (minutes * STEPS_PER_MINUTE).max(1);
            if plan.max_steps > cap {
                plan.max_steps = cap;
                plan.save_steps = cap;
                plan.warmup_steps = plan.warmup_steps.min(cap);
                plan.logging_steps = plan.logging_steps.min(cap).max(1);
                plan.rationale = format!("{} (capped at {cap} steps by time budget)", plan.rationale);
            }
        }
        (plan, analysis)
    }
}

impl Default for ContentPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(input: &str, output: &str) -> TrainingExample {
        TrainingExample {
            input: input.to_string(),
            output: output.to_string(),
        }
    }

    #[test]
    fn test_empty_dataset_scores_zero() {
        let planner = ContentPlanner::new();
        let analysis = planner.analyze(&[]);
        assert_eq!(analysis.total_tokens, 0);
        assert!(analysis.complexity_score < 0.3);
        assert_eq!(analysis.complexity, Complexity::Simple);
    }

    #[test]
    fn test_repetitive_text_is_simple() {
        let planner = ContentPlanner::new();
        let examples: Vec<_> = (0..10)
            .map(|_| example("hi there. hi there. hi there. hi there. hi there.", "ok. ok. ok. ok. ok."))
            .collect();
        let analysis = planner.analyze(&examples);
        assert!(analysis.vocabulary_diversity < 0.1);
        assert_eq!(analysis.complexity, Complexity::Simple);
    }

    #[test]
    fn test_diverse_questions_score_higher() {
        let planner = ContentPlanner::new();
        let simple = planner.analyze(&[example("yes. yes. yes. yes.", "no. no. no. no.")]);
        let rich = planner.analyze(&[example(
            "How does the borrow checker establish aliasing guarantees across asynchronous suspension points?",
            "Every live reference is tracked through the generator transform so borrows spanning await points become fields of the state machine",
        )]);
        assert!(rich.complexity_score > simple.complexity_score);
    }

    #[test]
    fn test_time_budget_caps_steps() {
        let planner = ContentPlanner::new();
        let examples: Vec<_> = (0..200)
            .map(|i| example(&format!("question number {i}?"), &format!("answer number {i}.")))
            .collect();
        let (uncapped, _) = planner.plan(&examples, 16, 2e-5, false, None);
        let (capped, _) = planner.plan(&examples, 16, 2e-5, false, Some(2));
        assert!(uncapped.max_steps > 100);
        assert!(capped.max_steps <= 100);
        assert!(capped.rationale.contains("time budget"));
    }
}
