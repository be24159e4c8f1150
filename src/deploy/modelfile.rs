//! Modelfile generation.
//!
//! Builds the runtime Modelfile for both deployment strategies. The
//! trailing comment block carries adapter metadata so a record can be
//! reconstructed from the runtime alone if the registry is ever lost.

use std::path::Path;

use crate::registry::AdapterRecord;

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

fn parameters() -> String {
    [
        "PARAMETER temperature 0.7",
        "PARAMETER top_p 0.9",
        "PARAMETER top_k 40",
        "PARAMETER repeat_penalty 1.1",
    ]
    .join("\n")
}

fn metadata_block(record: &AdapterRecord) -> String {
    format!(
        "# Adapter Metadata\n\
         # ADAPTER_ID: {}\n\
         # ADAPTER_PATH: {}\n\
         # BASE_MODEL: {}\n\
         # METHOD: {}",
        record.adapter_id,
        record.adapter_path.display(),
        record.base_model,
        record.training_method,
    )
}

/// Modelfile for the attach strategy: base model plus ADAPTER
/// directive pointing at the durable weights.
#[must_use]
pub fn attach_modelfile(record: &AdapterRecord) -> String {
    format!(
        "FROM {}\nADAPTER {}\n\nSYSTEM \"\"\"{}\"\"\"\n\n{}\n\n{}",
        record.base_model,
        record.adapter_path.display(),
        SYSTEM_PROMPT,
        parameters(),
        metadata_block(record),
    )
}

/// Modelfile for the merge strategy: a single GGUF file already
/// containing the adapted weights.
#[must_use]
pub fn merged_modelfile(gguf_path: &Path, record: &AdapterRecord) -> String {
    format!(
        "FROM {}\n\nSYSTEM \"\"\"{}\"\"\"\n\n{}\n\n{}",
        gguf_path.display(),
        SYSTEM_PROMPT,
        parameters(),
        metadata_block(record),
    )
}
