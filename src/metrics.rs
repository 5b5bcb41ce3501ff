//! Distances and scores between tensors.

use itertools::Itertools;

use crate::{
    loom::{
        sparse::SparseTensor,
        tensor::{Tensor, TensorError},
    },
    math::{sparse_dot, sparse_l2_norm},
};

/// Replaces NaN entries with 0, which also stops their gradient.
fn zero_nan(x: &Tensor) -> Tensor {
    let map = x
        .data()
        .iter()
        .enumerate()
        .map(|(offset, x)| (!x.is_nan()).then_some((0, offset)))
        .collect();
    Tensor::gather(&[x], x.layout(), map)
}

/// `1 - cos(a, b)` over `axis`. Zero vectors give a distance of 0.
pub fn cosine_distance(a: &Tensor, b: &Tensor, axis: isize) -> Result<Tensor, TensorError> {
    let dot = a.try_mul(b)?.sum(axis, false)?;
    let norm = a.norm(axis, false)?.try_mul(&b.norm(axis, false)?)?;
    let distance = dot.try_div(&norm)?.complement();
    Ok(zero_nan(&distance))
}

/// Cosine distance between the rows of a sparse and a dense tensor.
pub fn sparse_cosine_distance(sp: &SparseTensor, dense: &Tensor) -> Result<Tensor, TensorError> {
    let dot = sparse_dot(sp, dense)?;
    let norm = sparse_l2_norm(sp, -1)?.try_mul(&dense.norm(-1, false)?)?;
    let distance = dot.try_div(&norm)?.complement();
    Ok(zero_nan(&distance))
}

/// Euclidean distance over `axis`.
pub fn euclidean_distance(a: &Tensor, b: &Tensor, axis: isize) -> Result<Tensor, TensorError> {
    a.try_sub(b)?.norm(axis, false)
}

/// Fraction of rows whose largest logit is at the position of the largest label.
pub fn categorical_accuracy(labels: &Tensor, logits: &Tensor) -> Result<f32, TensorError> {
    if labels.layout() != logits.layout() {
        return Err(TensorError::Mismatch(labels.layout(), logits.layout()));
    }
    let argmax = |row: &[f32]| row.iter().position_max_by(|a, b| a.total_cmp(b));
    let (hits, rows) = labels
        .rows()
        .zip_eq(logits.rows())
        .fold((0, 0), |(hits, rows), (y, x)| {
            (hits + (argmax(y) == argmax(x)) as usize, rows + 1)
        });
    Ok(hits as f32 / rows.max(1) as f32)
}
