//! Architecture families and model-identifier mapping.
//!
//! All model-name dispatch in the pipeline goes through [`ArchFamily`]:
//! one normalized enum with a single lookup table, instead of substring
//! checks scattered across components. The table records everything the
//! rest of the pipeline needs to know about a family: LoRA target
//! modules, whether the serving runtime rejects the attach strategy for
//! its adapters, and whether gradient checkpointing is unstable on
//! unified-memory GPUs.

use serde::{Deserialize, Serialize};

/// Normalized model architecture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchFamily {
    Gemma,
    Llama,
    Qwen,
    Mistral,
    Phi,
    Other,
}

/// Per-family capability entry.
#[derive(Debug, Clone)]
pub struct FamilyTraits {
    /// LoRA target module names for this family.
    pub target_modules: &'static [&'static str],
    /// The serving runtime is known to reject attach-style adapters
    /// for this family ("unsupported architecture").
    pub restricted_arch: bool,
    /// Gradient checkpointing breaks gradient flow on unified-memory
    /// GPUs for this family.
    pub unified_checkpointing_unstable: bool,
}

const ATTENTION_AND_MLP: &[&str] = &[
    "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj",
];

/// Wide fallback covering GPT-style module names too.
const GENERIC_MODULES: &[&str] = &[
    "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj", "fc_in",
    "fc_out", "c_attn", "c_proj",
];

impl ArchFamily {
    /// Classify a model identifier (runtime tag or external-library id).
    pub fn from_model_id(model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        if lower.contains("gemma") {
            Self::Gemma
        } else if lower.contains("codellama") || lower.contains("llama") {
            Self::Llama
        } else if lower.contains("qwen") {
            Self::Qwen
        } else if lower.contains("mistral") || lower.contains("nemo") {
            Self::Mistral
        } else if lower.contains("phi") {
            Self::Phi
        } else {
            Self::Other
        }
    }

    /// Capability table lookup.
    pub fn traits(&self) -> FamilyTraits {
        match self {
            Self::Gemma => FamilyTraits {
                target_modules: ATTENTION_AND_MLP,
                restricted_arch: true,
                unified_checkpointing_unstable: true,
            },
            Self::Llama => FamilyTraits {
                target_modules: ATTENTION_AND_MLP,
                restricted_arch: false,
                unified_checkpointing_unstable: false,
            },
            Self::Qwen => FamilyTraits {
                target_modules: ATTENTION_AND_MLP,
                restricted_arch: true,
                unified_checkpointing_unstable: false,
            },
            Self::Mistral => FamilyTraits {
                target_modules: ATTENTION_AND_MLP,
                restricted_arch: false,
                unified_checkpointing_unstable: false,
            },
            Self::Phi => FamilyTraits {
                target_modules: ATTENTION_AND_MLP,
                restricted_arch: false,
                unified_checkpointing_unstable: false,
            },
            Self::Other => FamilyTraits {
                target_modules: GENERIC_MODULES,
                restricted_arch: false,
                unified_checkpointing_unstable: false,
            },
        }
    }
}

/// Maps serving-runtime model tags to external-library identifiers.
///
/// Exact match first, then prefix match on the tag base (so
/// `gemma3:4b` resolves through the `gemma3:latest` entry), then a
/// family-based fallback.
pub struct ModelMapper {
    mappings: Vec<(String, String)>,
}

impl ModelMapper {
    pub fn new() -> Self {
        let mappings = [
            ("gemma3n:latest", "mlx-community/gemma-3n-E4B-it-lm-4bit"),
            ("gemma3:latest", "unsloth/gemma-3-4b-it"),
            ("llama3.1:latest", "meta-llama/Llama-3.1-8B-Instruct"),
            ("qwen2.5:latest", "Qwen/Qwen2.5-7B-Instruct"),
            ("mistral:latest", "mistralai/Mistral-7B-Instruct-v0.3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { mappings }
    }

    /// Register an additional mapping.
    pub fn add_mapping(&mut self, runtime_tag: &str, library_id: &str) {
        self.mappings
            .push((runtime_tag.to_string(), library_id.to_string()));
    }

    /// Resolve the external-library model identifier for a runtime tag.
    pub fn library_model_id(&self, runtime_tag: &str) -> Option<String> {
        if let Some((_, id)) = self.mappings.iter().find(|(tag, _)| tag == runtime_tag) {
            return Some(id.clone());
        }
        // Prefix match on the tag base for versioned models.
        let base = runtime_tag.split(':').next().unwrap_or(runtime_tag);
        if let Some((_, id)) = self
            .mappings
            .iter()
            .find(|(tag, _)| tag.split(':').next() == Some(base))
        {
            return Some(id.clone());
        }
        // Family fallback: pick the first mapping in the same family.
        let family = ArchFamily::from_model_id(runtime_tag);
        if family == ArchFamily::Other {
            return None;
        }
        self.mappings
            .iter()
            .find(|(tag, _)| ArchFamily::from_model_id(tag) == family)
            .map(|(_, id)| id.clone())
    }

    /// Whether this model's adapters are rejected by the attach
    /// strategy and need a pre-deployed merged base.
    pub fn is_restricted(&self, runtime_tag: &str) -> bool {
        let family_restricted = ArchFamily::from_model_id(runtime_tag)
            .traits()
            .restricted_arch;
        // Library ids published under optimized-architecture namespaces
        // are restricted regardless of family.
        let id_restricted = self
            .library_model_id(runtime_tag)
            .map(|id| id.starts_with("unsloth/") || id.starts_with("mlx-community/"))
            .unwrap_or(false);
        family_restricted || id_restricted
    }

    /// Name under which the merged base model is served for restricted
    /// architectures.
    pub fn deployed_model_name(&self, runtime_tag: &str) -> String {
        let base = crate::registry::sanitize(&runtime_tag.replace(':', "-"));
        format!("{base}-custom")
    }

    /// Whether the tag resolves at all.
    pub fn supports(&self, runtime_tag: &str) -> bool {
        self.library_model_id(runtime_tag).is_some()
    }
}

impl Default for ModelMapper {
    fn default() -> Self {
        Self::new()
    }
}
