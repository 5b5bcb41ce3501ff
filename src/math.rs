//! Arithmetic helpers and sparse-dense products.

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use crate::loom::{
    sparse::SparseTensor,
    tensor::{Tensor, TensorError},
};

/// `numerator / denominator`, with 0 where the denominator is 0 or the quotient is not finite.
pub fn safe_div(numerator: &Tensor, denominator: &Tensor) -> Result<Tensor, TensorError> {
    let zeros = denominator
        .data()
        .iter()
        .map(|&d| (d == 0.0) as u8 as f32)
        .collect_vec();
    let zeros = Tensor::create(denominator.layout(), zeros)?;
    let quotient = numerator.try_div(&denominator.try_add(&zeros)?)?;

    let layout = quotient.layout();
    let zeros = zeros.broadcast_to(layout.clone())?;
    let map = quotient
        .data()
        .iter()
        .zip_eq(zeros.data())
        .enumerate()
        .map(|(offset, (q, &zero))| (q.is_finite() && zero == 0.0).then_some((0, offset)))
        .collect();
    Ok(Tensor::gather(&[&quotient], layout, map))
}

/// Gaussian function `exp(-x² / sigma²)`.
pub fn gaussian(x: &Tensor, sigma: f32) -> Result<Tensor, TensorError> {
    let sigma = Tensor::scalar(sigma * sigma);
    Ok(safe_div(&x.square().neg(), &sigma)?.exp())
}

/// Euclidean norm of a sparse tensor over `axis`, as a dense tensor.
pub fn sparse_l2_norm(sp: &SparseTensor, axis: isize) -> Result<Tensor, TensorError> {
    let square = sp.with_values(sp.values().square())?;
    Ok(square.to_dense().sum(axis, false)?.sqrt())
}

/// Row-wise dot product between a sparse tensor and a dense tensor of the same shape.
pub fn sparse_dot(sp: &SparseTensor, dense: &Tensor) -> Result<Tensor, TensorError> {
    let dense = dense.reshape(sp.layout())?;
    let values = dense.take(&sp.offsets(), sp.nnz());
    let product = sp.with_values(sp.values().try_mul(&values)?)?;
    product.to_dense().sum(-1, false)
}

/// Dot products between every row of `sp` `[r, n]` and every row of `dense` `[m, n]`.
///
/// Returns `[r, m]`, or `[r, m, 1]` if `keep_dims`.
pub fn batch_sparse_dot(
    sp: &SparseTensor,
    dense: &Tensor,
    keep_dims: bool,
) -> Result<Tensor, TensorError> {
    let output = sp.matmul(&dense.transpose()?)?;
    match keep_dims {
        true => output.expand_dims(-1),
        false => Ok(output),
    }
}

/// The other operand of [`sparse_multiply`].
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Dense(&'a Tensor),
    Sparse(&'a SparseTensor),
}

impl<'a> From<&'a Tensor> for Operand<'a> {
    fn from(value: &'a Tensor) -> Self {
        Self::Dense(value)
    }
}

impl<'a> From<&'a SparseTensor> for Operand<'a> {
    fn from(value: &'a SparseTensor) -> Self {
        Self::Sparse(value)
    }
}

/// Element-wise product of a sparse tensor with a dense or a sparse one.
///
/// With a dense operand, only the entries with a positive product are kept.
/// With a sparse operand, only the entries present in both are kept.
pub fn sparse_multiply<'a>(
    sp: &SparseTensor,
    other: impl Into<Operand<'a>>,
) -> Result<SparseTensor, TensorError> {
    match other.into() {
        Operand::Dense(dense) => {
            let dense = dense.reshape(sp.layout())?;
            let values = dense.take(&sp.offsets(), sp.nnz());
            let product = sp.values().try_mul(&values)?;
            let keep = product.data().iter().map(|&x| x > 0.0).collect_vec();
            sp.with_values(product)?.retain(&keep)
        }
        Operand::Sparse(other) => {
            if sp.layout() != other.layout() {
                return Err(TensorError::Mismatch(sp.layout(), other.layout()));
            }
            let lookup: HashMap<usize, usize> = other
                .offsets()
                .into_iter()
                .enumerate()
                .map(|(entry, offset)| (offset, entry))
                .collect();
            let (keep, matched): (Vec<bool>, Vec<usize>) = sp
                .offsets()
                .into_iter()
                .map(|offset| match lookup.get(&offset) {
                    Some(&entry) => (true, entry),
                    None => (false, 0),
                })
                .unzip();
            let values = other.values().take(&matched, matched.len());
            let product = sp.values().try_mul(&values)?;
            sp.with_values(product)?.retain(&keep)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;

    use super::{batch_sparse_dot, gaussian, safe_div, sparse_dot, sparse_l2_norm, sparse_multiply};
    use crate::loom::{sparse::SparseTensor, tensor::Tensor};

    #[test]
    fn test_safe_div() -> Result<(), Box<dyn Error>> {
        let n = Tensor::create([3], vec![1.0, 2.0, 3.0])?;
        let d = Tensor::create([3], vec![2.0, 0.0, 1e-45])?;
        assert_eq!(safe_div(&n, &d)?.data(), &[0.5, 0.0, 0.0]);

        let g = gaussian(&Tensor::create([2], vec![0.0, 1.0])?, 1.0)?;
        assert_abs_diff_eq!(g.data(), &[1.0, (-1.0f32).exp()][..], epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_sparse_math() -> Result<(), Box<dyn Error>> {
        let dense = Tensor::create([2, 3], vec![3.0, 0.0, 4.0, 0.0, -1.0, 0.0])?;
        let sp = SparseTensor::from_dense(&dense);

        assert_eq!(sparse_l2_norm(&sp, -1)?.data(), &[5.0, 1.0]);
        assert_eq!(sparse_dot(&sp, &dense)?.data(), &[25.0, 1.0]);

        let other = Tensor::create([4, 3], vec![1.0; 12])?;
        let dot = batch_sparse_dot(&sp, &other, true)?;
        assert_eq!(dot.shape(), &[2, 4, 1]);
        assert_eq!(dot.data()[..4], [7.0; 4]);

        let product = sparse_multiply(&sp, &Tensor::ones([2, 3]))?;
        assert_eq!(product.nnz(), 2);
        assert_eq!(product.to_dense().data(), &[3.0, 0.0, 4.0, 0.0, 0.0, 0.0]);

        let mask = SparseTensor::sparse_ones(vec![0, 2, 1, 1], [2, 3])?;
        let product = sparse_multiply(&sp, &mask)?;
        assert_eq!(product.to_dense().data(), &[0.0, 0.0, 4.0, 0.0, -1.0, 0.0]);
        Ok(())
    }
}
