use std::sync::Arc;

use derive_more::{Deref, Display};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("layout error: can not infer placeholder dim of {0:?} from size {1}")]
    Infer(Vec<isize>, usize),
    #[error("layout error: axis {0} out of range for layout {1}")]
    Axis(isize, Layout),
    #[error("layout error: expected {0} dims, got layout {1}")]
    Rank(usize, Layout),
}

/// Row-major shape of a tensor.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, Display, Serialize, Deserialize)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Layout(Arc<[usize]>);

pub trait IntoLayout {
    fn into_layout(self) -> Layout;
}

impl IntoLayout for Layout {
    #[inline]
    fn into_layout(self) -> Layout {
        self
    }
}

impl IntoLayout for &Layout {
    #[inline]
    fn into_layout(self) -> Layout {
        self.clone()
    }
}

impl<const N: usize> IntoLayout for [usize; N] {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout(self.into())
    }
}

impl IntoLayout for Vec<usize> {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout(self.into())
    }
}

impl IntoLayout for &[usize] {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout(self.into())
    }
}

impl IntoLayout for usize {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout([self].into())
    }
}

impl Layout {
    #[inline]
    pub fn from_shape(shape: impl IntoLayout) -> Self {
        shape.into_layout()
    }

    /// Layout of a scalar (rank 0, size 1).
    #[inline]
    pub fn scalar() -> Self {
        Self([].into())
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.0
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major stride of an axis.
    #[inline]
    pub fn stride_of(&self, axis: usize) -> usize {
        self.0[axis + 1..].iter().product()
    }

    #[inline]
    pub fn strides(&self) -> Vec<usize> {
        (0..self.len()).map(|axis| self.stride_of(axis)).collect()
    }

    /// The last dim, or 1 for scalars.
    #[inline]
    pub fn last(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    /// Resolves a possibly negative axis against the rank of this layout.
    pub fn axis(&self, axis: isize) -> Result<usize, LayoutError> {
        let len = self.len() as isize;
        let resolved = if axis < 0 { axis + len } else { axis };
        match (0..len).contains(&resolved) {
            true => Ok(resolved as usize),
            false => Err(LayoutError::Axis(axis, self.clone())),
        }
    }

    /// Replaces the dim at `axis`.
    pub fn with_dim(&self, axis: usize, dim: usize) -> Self {
        let mut shape = self.0.to_vec();
        shape[axis] = dim;
        Self(shape.into())
    }

    /// Removes the dim at `axis`, or sets it to 1 if `keep_dims`.
    pub fn reduce(&self, axis: usize, keep_dims: bool) -> Self {
        let mut shape = self.0.to_vec();
        match keep_dims {
            true => shape[axis] = 1,
            false => _ = shape.remove(axis),
        }
        Self(shape.into())
    }

    /// Checks the rank and returns the shape as an array.
    pub fn try_to_array<const N: usize>(&self) -> Result<[usize; N], LayoutError> {
        self.0
            .as_ref()
            .try_into()
            .map_err(|_| LayoutError::Rank(N, self.clone()))
    }

    /// Resolves a shape with at most one `-1` placeholder against a total size.
    pub fn infer(shape: &[isize], size: usize) -> Result<Self, LayoutError> {
        let err = || LayoutError::Infer(shape.to_vec(), size);
        let holes = shape.iter().filter(|&&dim| dim < 0).count();
        let known: usize = shape.iter().filter(|&&dim| dim >= 0).map(|&dim| dim as usize).product();
        match holes {
            0 => Ok(Self(shape.iter().map(|&dim| dim as usize).collect())),
            1 if known > 0 && size % known == 0 => Ok(Self(
                shape
                    .iter()
                    .map(|&dim| if dim < 0 { size / known } else { dim as usize })
                    .collect(),
            )),
            _ => Err(err()),
        }
    }

    /// Converts a multi-dimensional index to a flat offset.
    #[inline]
    pub fn offset(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip_eq(self.0.iter())
            .fold(0, |acc, (&i, &dim)| acc * dim + i)
    }

    /// Converts a flat offset to a multi-dimensional index.
    #[inline]
    pub fn index(&self, mut offset: usize) -> Vec<usize> {
        let mut index = vec![0; self.len()];
        for (axis, &dim) in self.0.iter().enumerate().rev() {
            index[axis] = offset % dim.max(1);
            offset /= dim.max(1);
        }
        index
    }

    /// Splits the layout around `axis` into `(outer, dim, inner)` sizes.
    #[inline]
    pub fn split_at(&self, axis: usize) -> (usize, usize, usize) {
        let outer = self.0[..axis].iter().product();
        let inner = self.stride_of(axis);
        (outer, self.0[axis], inner)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Layout;

    #[test]
    fn test_layout_index() -> Result<(), Box<dyn Error>> {
        let layout = Layout::from_shape([2, 3, 4]);
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.strides(), vec![12, 4, 1]);
        for offset in 0..layout.size() {
            assert_eq!(layout.offset(&layout.index(offset)), offset);
        }
        assert_eq!(layout.axis(-1)?, 2);
        assert!(layout.axis(3).is_err());
        Ok(())
    }

    #[test]
    fn test_layout_infer() -> Result<(), Box<dyn Error>> {
        assert_eq!(Layout::infer(&[-1, 2], 6)?, Layout::from_shape([3, 2]));
        assert_eq!(Layout::infer(&[3, 2], 6)?, Layout::from_shape([3, 2]));
        assert!(Layout::infer(&[-1, 4], 6).is_err());
        assert!(Layout::infer(&[-1, -1], 6).is_err());
        Ok(())
    }
}
