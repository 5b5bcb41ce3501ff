use std::sync::Arc;

use itertools::Itertools;

use super::{
    layout::{IntoLayout, Layout},
    tensor::{Indices, Tensor, TensorError},
};

/// A tensor in coordinate format.
///
/// Each entry has a `rank`-long index into `dense_shape` and a value. The values
/// form a rank 1 [`Tensor`], so gradients flow through them.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTensor {
    indices: Arc<[usize]>,
    values: Tensor,
    layout: Layout,
}

impl SparseTensor {
    /// Creates a sparse tensor from flattened entry indices and their values.
    pub fn new(
        indices: impl Into<Arc<[usize]>>,
        values: Tensor,
        dense_shape: impl IntoLayout,
    ) -> Result<Self, TensorError> {
        let indices: Arc<[usize]> = indices.into();
        let layout = dense_shape.into_layout();
        let rank = layout.len();
        let nnz = values.size();

        if values.dim() != 1 || indices.len() != nnz * rank {
            return Err(TensorError::Create(Layout::from_shape([nnz, rank]), indices.len()));
        }
        if let Some(index) = indices
            .chunks_exact(rank.max(1))
            .find(|index| index.iter().zip_eq(layout.iter()).any(|(i, dim)| i >= dim))
        {
            return Err(TensorError::Sparse(index.to_vec(), layout));
        }
        Ok(Self {
            indices,
            values,
            layout,
        })
    }

    /// Keeps the non-zero entries of a dense tensor, in row-major order.
    pub fn from_dense(tensor: &Tensor) -> Self {
        let layout = tensor.layout();
        let offsets = tensor
            .data()
            .iter()
            .positions(|&x| x != 0.0)
            .collect_vec();
        let indices: Arc<[usize]> = offsets.iter().flat_map(|&offset| layout.index(offset)).collect();
        let values = tensor.take(&offsets, offsets.len());
        Self {
            indices,
            values,
            layout,
        }
    }

    /// A sparse tensor with every value equal to 1.
    pub fn sparse_ones(
        indices: impl Into<Arc<[usize]>>,
        dense_shape: impl IntoLayout,
    ) -> Result<Self, TensorError> {
        let indices: Arc<[usize]> = indices.into();
        let layout = dense_shape.into_layout();
        let nnz = indices.len() / layout.len().max(1);
        Self::new(indices, Tensor::ones([nnz]), layout)
    }

    /// One-hot encoding of `[batch, k]` ids as a `[batch, n]` sparse tensor.
    /// Each id becomes one entry of its row.
    pub fn one_hot(ids: &Indices, n: usize) -> Result<Self, TensorError> {
        let [_, k] = ids.layout().try_to_array()?;
        let rows = ids.shape()[0];
        let indices = ids
            .data()
            .iter()
            .enumerate()
            .flat_map(|(entry, &id)| [entry / k.max(1), id])
            .collect_vec();
        Self::sparse_ones(indices, [rows, n])
    }

    /// Swaps the two axes of a rank 2 sparse tensor.
    pub fn transpose(&self) -> Result<Self, TensorError> {
        let [rows, cols] = self.layout.try_to_array()?;
        let indices = self.entries().flat_map(|index| [index[1], index[0]]).collect_vec();
        Ok(Self {
            indices: indices.into(),
            values: self.values.clone(),
            layout: Layout::from_shape([cols, rows]),
        })
    }

    /// A tensor with the same entries and new values.
    pub fn with_values(&self, values: Tensor) -> Result<Self, TensorError> {
        let values = values.check_layout(self.values.layout())?;
        Ok(Self {
            values,
            ..self.clone()
        })
    }

    /// Keeps the entries for which `keep` is `true`.
    pub fn retain(&self, keep: &[bool]) -> Result<Self, TensorError> {
        let rank = self.rank();
        let entries = keep.iter().positions(|&keep| keep).collect_vec();
        let indices: Arc<[usize]> = entries
            .iter()
            .flat_map(|&entry| self.indices[entry * rank..(entry + 1) * rank].iter().copied())
            .collect();
        let values = self.values.take(&entries, entries.len());
        Self::new(indices, values, self.layout())
    }

    /// Shape of the dense equivalent.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout.clone()
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.layout.len()
    }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.size()
    }

    #[inline]
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Flattened entry indices.
    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Index of each entry.
    #[inline]
    pub fn entries(&self) -> impl Iterator<Item = &[usize]> {
        self.indices.chunks_exact(self.rank().max(1))
    }

    /// Offset of each entry in the dense layout.
    #[inline]
    pub fn offsets(&self) -> Vec<usize> {
        self.entries().map(|index| self.layout.offset(index)).collect()
    }

    /// Same entries, detached from the computation graph.
    #[inline]
    pub fn detach(&self) -> Self {
        Self {
            values: self.values.detach(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::SparseTensor;
    use crate::loom::tensor::{Indices, Tensor};

    #[test]
    fn test_sparse_dense() -> Result<(), Box<dyn Error>> {
        let dense = Tensor::create([2, 3], vec![0.0, 2.0, 0.0, 1.0, 0.0, 3.0])?;
        let sp = SparseTensor::from_dense(&dense);
        assert_eq!(sp.nnz(), 3);
        assert_eq!(sp.indices(), &[0, 1, 1, 0, 1, 2]);
        assert_eq!(sp.to_dense(), dense);

        let transposed = sp.transpose()?;
        assert_eq!(transposed.to_dense(), dense.transpose()?);

        assert!(SparseTensor::new(vec![2, 0], Tensor::ones([1]), [2, 3]).is_err());
        assert!(SparseTensor::new(vec![1, 0, 1], Tensor::ones([2]), [2, 3]).is_err());
        Ok(())
    }

    #[test]
    fn test_one_hot() -> Result<(), Box<dyn Error>> {
        let ids = Indices::from_rows(&[[0, 2], [1, 1]])?;
        let sp = SparseTensor::one_hot(&ids, 3)?;
        assert_eq!(sp.shape(), &[2, 3]);
        assert_eq!(sp.to_dense().data(), &[1.0, 0.0, 1.0, 0.0, 2.0, 0.0]);

        let kept = sp.retain(&[true, false, true, false])?;
        assert_eq!(kept.to_dense().data(), &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        Ok(())
    }
}
