//! Random tensors.
//!
//! Every sampler draws from the thread-local [`fastrand`] generator, which [`seed`] resets.

use itertools::Itertools;

use crate::loom::{
    layout::IntoLayout,
    sparse::SparseTensor,
    tensor::{Indices, Tensor, TensorError},
};

/// Seeds the random generator of the current thread.
#[inline]
pub fn seed(seed: u64) {
    fastrand::seed(seed);
}

/// A sample of `N(0, 1)`, by the Box-Muller transform.
#[inline]
fn standard_normal() -> f32 {
    let u = 1.0 - fastrand::f32();
    let v = fastrand::f32();
    (-2.0 * u.ln()).sqrt() * (std::f32::consts::TAU * v).cos()
}

/// Uniform samples in `[min, max)`.
pub fn uniform(layout: impl IntoLayout, min: f32, max: f32) -> Tensor {
    let layout = layout.into_layout();
    let data = (0..layout.size())
        .map(|_| min + (max - min) * fastrand::f32())
        .collect_vec();
    Tensor::raw(layout, data.into())
}

/// Normal samples with the given mean and standard deviation.
pub fn normal(layout: impl IntoLayout, mean: f32, std: f32) -> Tensor {
    let layout = layout.into_layout();
    let data = (0..layout.size())
        .map(|_| mean + std * standard_normal())
        .collect_vec();
    Tensor::raw(layout, data.into())
}

/// Normal samples, redrawn until they fall within two standard deviations.
pub fn truncated_normal(layout: impl IntoLayout, mean: f32, std: f32) -> Tensor {
    let layout = layout.into_layout();
    let data = (0..layout.size())
        .map(|_| loop {
            let x = standard_normal();
            if x.abs() <= 2.0 {
                break mean + std * x;
            }
        })
        .collect_vec();
    Tensor::raw(layout, data.into())
}

/// A mask whose elements are 1 with probability `p` and 0 otherwise.
pub fn bernoulli_mask(layout: impl IntoLayout, p: f32) -> Tensor {
    let layout = layout.into_layout();
    let data = (0..layout.size())
        .map(|_| (fastrand::f32() < p) as u8 as f32)
        .collect_vec();
    Tensor::raw(layout, data.into())
}

/// Samples `k` distinct indices from each row of `logits` without replacement,
/// with the Gumbel top-k trick.
///
/// Returns `[rows, k]` indices, each row in order of decreasing perturbed logit.
pub fn gumbel_top(logits: &Tensor, k: usize) -> Result<Indices, TensorError> {
    let layout = logits.layout();
    let n = layout.last();
    if k > n {
        return Err(TensorError::Index(k, n));
    }
    let rows = layout.size() / n.max(1);
    let data = logits
        .rows()
        .flat_map(|row| {
            row.iter()
                .map(|&x| {
                    let u = fastrand::f32().max(f32::MIN_POSITIVE);
                    x - (-u.ln()).ln()
                })
                .enumerate()
                .sorted_by(|(_, a), (_, b)| b.total_cmp(a))
                .take(k)
                .map(|(index, _)| index)
                .collect_vec()
        })
        .collect_vec();
    Indices::create([rows, k], data)
}

/// Sparse salt-and-pepper noise of shape `[rows, n]`.
///
/// Each row gets `round(density * n)` noisy units, rounded down to an even number:
/// half of them are `salt` and the other half `pepper`.
pub fn salt_pepper_noise(
    layout: impl IntoLayout,
    density: f32,
    salt: f32,
    pepper: f32,
) -> Result<SparseTensor, TensorError> {
    let layout = layout.into_layout();
    let [rows, n] = layout.try_to_array()?;
    let count = ((density * n as f32).round() as usize).min(n) / 2 * 2;

    let mut indices = Vec::with_capacity(rows * count * 2);
    let mut values = Vec::with_capacity(rows * count);
    for row in 0..rows {
        let mut units = fastrand::choose_multiple(0..n, count);
        units.sort_unstable();
        let salted = fastrand::choose_multiple(0..count, count / 2);
        for (entry, unit) in units.into_iter().enumerate() {
            indices.extend([row, unit]);
            values.push(match salted.contains(&entry) {
                true => salt,
                false => pepper,
            });
        }
    }
    SparseTensor::new(indices, Tensor::vector(values), layout)
}
