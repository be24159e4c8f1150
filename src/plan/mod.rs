//! Training-step planning.
//!
//! Derives step counts, warmup, and cadence from dataset size and
//! hyperparameters. Pure arithmetic, no IO: given the same inputs the
//! planner always produces the same plan, and every plan is clamped to
//! dataset-size-dependent bounds so tiny datasets never grind through
//! thousands of steps and large ones never under-train.

pub mod content;

use serde::{Deserialize, Serialize};

pub use content::{ContentAnalysis, ContentPlanner};

/// Qualitative dataset complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    fn multiplier(self) -> f64 {
        match self {
            Self::Simple => 0.7,
            Self::Medium => 1.0,
            Self::Complex => 1.4,
        }
    }
}

/// Coarse label for how heavy a plan is, used in CLI summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EfficiencyTier {
    Quick,
    Standard,
    Thorough,
}

impl EfficiencyTier {
    fn for_steps(steps: u32) -> Self {
        match steps {
            0..=99 => Self::Quick,
            100..=599 => Self::Standard,
            _ => Self::Thorough,
        }
    }
}

/// A complete training plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub max_steps: u32,
    pub warmup_steps: u32,
    /// Checkpoint cadence. Equal to `max_steps` so only the final
    /// adapter is saved.
    pub save_steps: u32,
    pub logging_steps: u32,
    /// Applied modifiers, in application order.
    pub modifiers: Vec<String>,
    /// Approximate passes over the dataset at batch size 1.
    pub estimated_epochs: f64,
    pub tier: EfficiencyTier,
    /// Human-readable derivation summary.
    pub rationale: String,
}

/// Inputs to the planner.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest {
    pub example_count: usize,
    pub lora_rank: u32,
    pub learning_rate: f64,
    pub complexity: Complexity,
    /// Continuing from an existing adapter.
    pub incremental: bool,
}

pub struct Planner;

impl Planner {
    /// Derive a plan from dataset size and hyperparameters.
    #[must_use]
    pub fn plan(request: &PlanRequest) -> TrainingPlan {
        let n = request.example_count;
        let base = base_steps(n);

        let rank_mult = rank_multiplier(request.lora_rank);
        let lr_mult = lr_multiplier(request.learning_rate);
        let complexity_mult = request.complexity.multiplier();
        let incremental_mult = if request.incremental { 0.7 } else { 1.0 };

        let raw =
            (base as f64 * rank_mult * lr_mult * complexity_mult * incremental_mult).round();
        let (min, max) = bounds(n, request.incremental);
        let max_steps = (raw as u32).clamp(min, max);

        let warmup_steps = (max_steps / 20).clamp(1, 5);
        let logging_steps = (max_steps / 20).max(1);

        let mut modifiers = vec![
            format!("rank x{rank_mult:.2}"),
            format!("learning-rate x{lr_mult:.2}"),
            format!("complexity x{complexity_mult:.2}"),
        ];
        if request.incremental {
            modifiers.push("incremental x0.70".to_string());
        }
        let estimated_epochs = if n == 0 {
            0.0
        } else {
            f64::from(max_steps) / n as f64
        };

        let rationale = format!(
            "{} steps for {} examples ({}{:?} complexity, rank {}, lr {:.0e}): \
             base {} x rank {:.2} x lr {:.2} x complexity {:.2}{}, bounded to [{}, {}]",
            max_steps,
            n,
            if n <= 10 { "small dataset, " } else { "" },
            request.complexity,
            request.lora_rank,
            request.learning_rate,
            base,
            rank_mult,
            lr_mult,
            complexity_mult,
            if request.incremental {
                " x 0.70 incremental"
            } else {
                ""
            },
            min,
            max,
        );

        TrainingPlan {
            max_steps,
            warmup_steps,
            save_steps: max_steps,
            logging_steps,
            modifiers,
            estimated_epochs,
            tier: EfficiencyTier::for_steps(max_steps),
            rationale,
        }
    }
}

/// Sub-linear base step curve over dataset size.
fn base_steps(n: usize) -> u32 {
    match n {
        0..=3 => 120,
        4..=5 => 160,
        6..=10 => 220,
        11..=25 => 300,
        26..=50 => 420,
        51..=100 => 600,
        101..=200 => 800,
        _ => ((1000 + (n - 200) * 2) as u32).min(2500),
    }
}

/// Higher ranks have more trainable parameters and want more steps.
fn rank_multiplier(rank: u32) -> f64 {
    match rank {
        0..=8 => 0.85,
        9..=16 => 1.0,
        17..=32 => 1.15,
        _ => 1.3,
    }
}

/// Lower learning rates converge more slowly and want more steps.
fn lr_multiplier(lr: f64) -> f64 {
    if lr >= 5e-4 {
        0.8
    } else if lr >= 3e-4 {
        1.0
    } else if lr >= 1e-4 {
        1.2
    } else {
        1.4
    }
}

/// Dataset-size-dependent step bounds.
fn bounds(n: usize, incremental: bool) -> (u32, u32) {
    let min = if incremental {
        40
    } else {
        match n {
            0..=3 => 30,
            4..=10 => 50,
            11..=50 => 100,
            _ => 150,
        }
    };
    let max = match n {
        0..=3 => 200,
        4..=5 => 300,
        6..=20 => (n as u32) * 40,
        _ => ((n as u32) * 25).min(2500),
    };
    (min, max.max(min))
}
