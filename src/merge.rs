//! Adapter weight consolidation.
//!
//! Merges multiple LoRA adapters (or an adapter and its predecessor on
//! the incremental path) into one set of delta weights. Strategies
//! operate per-parameter on named tensor maps; a parameter missing or
//! shape-mismatched in some adapters is merged from the ones that
//! agree, with a warning, rather than failing the whole merge.

use std::collections::{BTreeSet, HashMap};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Named parameter tensors of one adapter.
pub type TensorMap = HashMap<String, Array2<f32>>;

/// How to combine adapters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "strategy")]
pub enum MergeStrategy {
    /// Unweighted per-parameter mean.
    Arithmetic,
    /// Weighted mean; weights are normalized before use.
    Weighted,
    /// Truncate the merged parameter to its `rank` dominant singular
    /// directions, falling back to the arithmetic mean for degenerate
    /// parameters.
    Svd { rank: usize },
}

/// Merge a set of adapters into one tensor map.
pub fn merge_adapters(
    adapters: &[TensorMap],
    weights: Option<&[f64]>,
    strategy: MergeStrategy,
) -> Result<TensorMap> {
    if adapters.is_empty() {
        return Err(Error::Merge("no adapters to merge".to_string()));
    }
    if adapters.len() == 1 {
        return Ok(adapters[0].clone());
    }
    let weights = normalize_weights(adapters.len(), weights, strategy)?;

    // Union of parameter names so a tensor present in only some
    // adapters still merges.
    let names: BTreeSet<&String> = adapters.iter().flat_map(|a| a.keys()).collect();

    let mut merged = TensorMap::new();
    for name in names {
        let mut tensors: Vec<(&Array2<f32>, f64)> = Vec::new();
        for (adapter, weight) in adapters.iter().zip(&weights) {
            if let Some(tensor) = adapter.get(name) {
                tensors.push((tensor, *weight));
            }
        }
        let shape = tensors[0].0.dim();
        let before = tensors.len();
        tensors.retain(|(t, _)| t.dim() == shape);
        if tensors.len() < before {
            eprintln!("warning: shape mismatch for {name}, merging {} of {before} adapters", tensors.len());
        }
        let result = match strategy {
            MergeStrategy::Arithmetic | MergeStrategy::Weighted => weighted_mean(&tensors),
            MergeStrategy::Svd { rank } => svd_merge(name, &tensors, rank),
        };
        merged.insert(name.clone(), result);
    }
    Ok(merged)
}

fn normalize_weights(
    count: usize,
    weights: Option<&[f64]>,
    strategy: MergeStrategy,
) -> Result<Vec<f64>> {
    match (strategy, weights) {
        (MergeStrategy::Weighted, Some(w)) => {
            if w.len() != count {
                return Err(Error::Merge(format!(
                    "{} weights for {count} adapters",
                    w.len()
                )));
            }
            let sum: f64 = w.iter().sum();
            if sum <= 0.0 || w.iter().any(|x| *x < 0.0) {
                return Err(Error::Merge("weights must be non-negative with positive sum".to_string()));
            }
            Ok(w.iter().map(|x| x / sum).collect())
        }
        (MergeStrategy::Weighted, None) => Err(Error::Merge(
            "weighted merge requires explicit weights".to_string(),
        )),
        // Arithmetic and SVD ignore caller weights.
        _ => Ok(vec![1.0 / count as f64; count]),
    }
}

fn weighted_mean(tensors: &[(&Array2<f32>, f64)]) -> Array2<f32> {
    // Renormalize over the adapters that actually carry this tensor.
    // When every carrier has zero weight, fall back to the plain mean
    // instead of dividing by zero.
    let total: f64 = tensors.iter().map(|(_, w)| w).sum();
    let mut acc = Array2::<f32>::zeros(tensors[0].0.dim());
    if total <= 0.0 {
        let uniform = 1.0 / tensors.len() as f32;
        for (tensor, _) in tensors {
            acc.scaled_add(uniform, tensor);
        }
        return acc;
    }
    for (tensor, weight) in tensors {
        acc.scaled_add((weight / total) as f32, tensor);
    }
    acc
}

/// Rank-`rank` reconstruction of the weighted mean. Degenerate
/// parameters (leading singular value near zero) fall back to the
/// plain mean.
fn svd_merge(name: &str, tensors: &[(&Array2<f32>, f64)], rank: usize) -> Array2<f32> {
    let mean = weighted_mean(tensors);
    match truncated_svd(&mean, rank) {
        Some(reconstruction) => reconstruction,
        None => {
            eprintln!("warning: degenerate singular spectrum for {name}, using arithmetic mean");
            mean
        }
    }
}

const POWER_ITERATIONS: usize = 50;
const SIGMA_EPSILON: f32 = 1e-6;

/// Rank-`rank` approximation of `m` via power iteration with
/// deflation. `None` when even the leading singular value is
/// degenerate; once at least one component is extracted, running out
/// of spectrum just ends the expansion early.
fn truncated_svd(m: &Array2<f32>, rank: usize) -> Option<Array2<f32>> {
    let (rows, cols) = m.dim();
    if rows == 0 || cols == 0 || rank == 0 {
        return None;
    }
    let mut residual = m.clone();
    let mut reconstruction = Array2::<f32>::zeros(m.dim());
    let components = rank.min(rows).min(cols);

    for k in 0..components {
        let Some((sigma, u, v)) = dominant_direction(&residual) else {
            if k == 0 {
                return None;
            }
            break;
        };
        for (i, ui) in u.iter().enumerate() {
            for (j, vj) in v.iter().enumerate() {
                let term = sigma * ui * vj;
                reconstruction[[i, j]] += term;
                residual[[i, j]] -= term;
            }
        }
    }
    Some(reconstruction)
}

/// Leading singular triple (sigma, u, v) of `m` via power iteration on
/// `mᵀm`. Returns `None` when the spectrum is degenerate.
fn dominant_direction(m: &Array2<f32>) -> Option<(f32, Array1<f32>, Array1<f32>)> {
    let cols = m.dim().1;
    // Deterministic non-degenerate start vector.
    let mut v = Array1::from_shape_fn(cols, |i| 1.0 + (i as f32) * 1e-3);
    let norm = |x: &Array1<f32>| x.dot(x).sqrt();
    let n = norm(&v);
    v.mapv_inplace(|x| x / n);

    for _ in 0..POWER_ITERATIONS {
        let w = m.t().dot(&m.dot(&v));
        let n = norm(&w);
        if n < SIGMA_EPSILON {
            return None;
        }
        v = w / n;
    }

    let mv = m.dot(&v);
    let sigma = norm(&mv);
    if sigma < SIGMA_EPSILON {
        return None;
    }
    let u = mv / sigma;
    Some((sigma, u, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn adapter(values: Array2<f32>) -> TensorMap {
        let mut map = TensorMap::new();
        map.insert("layer.lora_A".to_string(), values);
        map
    }

    #[test]
    fn test_single_adapter_passthrough() {
        let a = adapter(array![[1.0, 2.0], [3.0, 4.0]]);
        let merged = merge_adapters(&[a.clone()], None, MergeStrategy::Svd { rank: 1 }).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn test_arithmetic_mean() {
        let a = adapter(array![[2.0, 4.0], [6.0, 8.0]]);
        let b = adapter(array![[0.0, 0.0], [0.0, 0.0]]);
        let merged = merge_adapters(&[a, b], None, MergeStrategy::Arithmetic).unwrap();
        let tensor = &merged["layer.lora_A"];
        assert_abs_diff_eq!(tensor[[0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(tensor[[1, 1]], 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_weighted_mean_normalizes() {
        let a = adapter(array![[1.0]]);
        let b = adapter(array![[3.0]]);
        // 3:1 in favor of b.
        let merged =
            merge_adapters(&[a, b], Some(&[1.0, 3.0]), MergeStrategy::Weighted).unwrap();
        assert_abs_diff_eq!(merged["layer.lora_A"][[0, 0]], 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_weighted_zero_weight_carriers_fall_back_to_mean() {
        // "p" lives only in the two zero-weight adapters; its merge
        // must be their plain mean, not NaN.
        let mut a = TensorMap::new();
        a.insert("p".to_string(), array![[2.0]]);
        let mut b = TensorMap::new();
        b.insert("p".to_string(), array![[4.0]]);
        let mut c = TensorMap::new();
        c.insert("q".to_string(), array![[1.0]]);
        let merged =
            merge_adapters(&[a, b, c], Some(&[0.0, 0.0, 1.0]), MergeStrategy::Weighted).unwrap();
        assert_abs_diff_eq!(merged["p"][[0, 0]], 3.0, epsilon = 1e-6);
        assert!(merged["p"][[0, 0]].is_finite());
    }

    #[test]
    fn test_weighted_requires_weights() {
        let a = adapter(array![[1.0]]);
        let b = adapter(array![[2.0]]);
        assert!(matches!(
            merge_adapters(&[a, b], None, MergeStrategy::Weighted),
            Err(Error::Merge(_))
        ));
    }

    #[test]
    fn test_weight_count_mismatch() {
        let a = adapter(array![[1.0]]);
        let b = adapter(array![[2.0]]);
        assert!(matches!(
            merge_adapters(&[a, b], Some(&[1.0]), MergeStrategy::Weighted),
            Err(Error::Merge(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_skipped_not_fatal() {
        let a = adapter(array![[1.0, 1.0]]);
        let b = adapter(array![[3.0, 3.0]]);
        let c = adapter(array![[5.0], [5.0]]);
        let merged = merge_adapters(&[a, b, c], None, MergeStrategy::Arithmetic).unwrap();
        // Mismatched c is dropped for this parameter.
        assert_abs_diff_eq!(merged["layer.lora_A"][[0, 0]], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_disjoint_parameters_union() {
        let mut a = TensorMap::new();
        a.insert("only_a".to_string(), array![[1.0]]);
        let mut b = TensorMap::new();
        b.insert("only_b".to_string(), array![[2.0]]);
        let merged = merge_adapters(&[a, b], None, MergeStrategy::Arithmetic).unwrap();
        assert_eq!(merged.len(), 2);
        assert_abs_diff_eq!(merged["only_a"][[0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(merged["only_b"][[0, 0]], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_svd_recovers_rank_one() {
        // 2 * outer([1,2], [3,4]) is exactly rank one, so the rank-1
        // reconstruction must reproduce it.
        let m = array![[6.0, 8.0], [12.0, 16.0]];
        let a = adapter(m.clone());
        let b = adapter(m.clone());
        let merged = merge_adapters(&[a, b], None, MergeStrategy::Svd { rank: 1 }).unwrap();
        let tensor = &merged["layer.lora_A"];
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(tensor[[i, j]], m[[i, j]], epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_svd_deflation_recovers_rank_two() {
        // Diagonal matrix has singular values 5 and 3; a rank-2
        // truncation must reconstruct it, rank-1 must not.
        let m = array![[5.0, 0.0], [0.0, 3.0]];
        let a = adapter(m.clone());
        let full = merge_adapters(&[a.clone(), a.clone()], None, MergeStrategy::Svd { rank: 2 })
            .unwrap();
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(full["layer.lora_A"][[i, j]], m[[i, j]], epsilon = 1e-2);
            }
        }
        let truncated =
            merge_adapters(&[a.clone(), a], None, MergeStrategy::Svd { rank: 1 }).unwrap();
        assert_abs_diff_eq!(truncated["layer.lora_A"][[0, 0]], 5.0, epsilon = 1e-2);
        assert_abs_diff_eq!(truncated["layer.lora_A"][[1, 1]], 0.0, epsilon = 1e-2);
    }

    #[test]
    fn test_svd_degenerate_falls_back_to_mean() {
        let a = adapter(Array2::zeros((3, 3)));
        let b = adapter(Array2::zeros((3, 3)));
        let merged = merge_adapters(&[a, b], None, MergeStrategy::Svd { rank: 2 }).unwrap();
        assert_abs_diff_eq!(merged["layer.lora_A"][[1, 1]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(matches!(
            merge_adapters(&[], None, MergeStrategy::Arithmetic),
            Err(Error::Merge(_))
        ));
    }
}
