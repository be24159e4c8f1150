//! Activation clamping for numerically unstable architectures.
//!
//! Some model families overflow float16 in their MLP activations
//! during fine-tuning. The fix is a straight-through clamp: forward
//! values are clamped to a fixed scale, gradients pass through
//! unchanged. This module computes which layers get the hook and
//! applies the clamp itself; wiring it into the trainer is the
//! backend's job.

use ndarray::Array2;

/// Clamp bound. Comfortably inside float16 range (max ~65504) with
/// headroom for the subsequent matmul.
pub const ACTIVATION_SCALE: f32 = 16000.0;

/// Select the layers that receive the clamp hook: every listed layer
/// except adapter-injected ones, which train in float32 already.
#[must_use]
pub fn clamp_targets<'a>(layer_names: &'a [String]) -> Vec<&'a str> {
    layer_names
        .iter()
        .map(String::as_str)
        .filter(|name| !name.contains("lora_"))
        .collect()
}

/// Straight-through clamp over one activation tensor.
#[must_use]
pub fn clamp_activations(activations: &Array2<f32>) -> Array2<f32> {
    activations.mapv(|x| x.clamp(-ACTIVATION_SCALE, ACTIVATION_SCALE))
}

/// Whether a tensor contains values the clamp would change.
#[must_use]
pub fn needs_clamping(activations: &Array2<f32>) -> bool {
    activations
        .iter()
        .any(|x| x.abs() > ACTIVATION_SCALE || !x.is_finite())
}
