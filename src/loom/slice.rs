use std::sync::Arc;

use casey::snake;
use derive_more::{Deref, DerefMut, Display, From, Into};
use itertools::Itertools;

use super::{
    layout::Layout,
    tensor::{Tensor, TensorError},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Axis {
    #[default]
    #[display("..")]
    Full,
    /// Selects one index and drops the axis.
    #[display("{_0}")]
    One(usize),
    #[display("{_0}..{_1}")]
    Range(usize, usize),
}

impl From<usize> for Axis {
    #[inline]
    fn from(value: usize) -> Self {
        Self::One(value)
    }
}

impl From<std::ops::RangeFull> for Axis {
    #[inline]
    fn from(_: std::ops::RangeFull) -> Self {
        Self::Full
    }
}

impl From<std::ops::Range<usize>> for Axis {
    #[inline]
    fn from(value: std::ops::Range<usize>) -> Self {
        Self::Range(value.start, value.end)
    }
}

impl Axis {
    /// The `(start, len)` selected on an axis of size `dim`, if in bounds.
    #[inline]
    fn bounds(self, dim: usize) -> Option<(usize, usize)> {
        match self {
            Axis::Full => Some((0, dim)),
            Axis::One(index) if index < dim => Some((index, 1)),
            Axis::Range(start, end) if start <= end && end <= dim => Some((start, end - start)),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into, Display)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Slice(Arc<[Axis]>);

impl From<Vec<Axis>> for Slice {
    #[inline]
    fn from(value: Vec<Axis>) -> Self {
        Self(value.into())
    }
}

macro_rules! impl_slice_from {
    ($t:ident) => {
        impl<$t: Into<Axis>> From<$t> for Slice {
            #[inline]
            fn from(snake!($t): $t) -> Self {
                Self([snake!($t).into()].into())
            }
        }
    };
    ($($t:ident),+) => {
        impl<$($t),+> From<($($t),+)> for Slice
        where
            $($t: Into<Axis>),+
        {
            #[inline]
            fn from(($(snake!($t)),+): ($($t),+)) -> Self {
                Self([$(snake!($t).into()),+].into())
            }
        }
    };
}

impl_slice_from!(T0);
impl_slice_from!(T0, T1);
impl_slice_from!(T0, T1, T2);
impl_slice_from!(T0, T1, T2, T3);
impl_slice_from!(T0, T1, T2, T3, T4);

impl Slice {
    /// Creates a full slice of the same mode as a `Layout`.
    #[inline]
    pub fn from_layout(layout: Layout) -> Self {
        Self::from(vec![Axis::Full; layout.len()])
    }

    /// Returns `true` if the slice contains only full axes.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.iter().all(|&axis| matches!(axis, Axis::Full))
    }
}

impl Tensor {
    /// # Slicing (`slice`)
    /// Selects a sub-tensor. Missing trailing axes are taken in full,
    /// and axes indexed by [`Axis::One`] are dropped from the output.
    ///
    /// ## Returns
    /// * `Result<Tensor, TensorError>` - The selected elements,
    ///   or an error if the slice has too many axes or is out of bounds.
    pub fn slice(&self, slice: impl Into<Slice>) -> Result<Tensor, TensorError> {
        let slice: Slice = slice.into();
        let layout = self.layout();
        if slice.len() > layout.len() {
            return Err(TensorError::Slice(layout, slice));
        }

        let mut output = self.clone();
        // narrow from the last axis so that dropped axes do not shift the earlier ones
        for (axis, &item) in slice.iter().enumerate().rev() {
            let dim = layout[axis];
            let (start, len) = item
                .bounds(dim)
                .ok_or_else(|| TensorError::Slice(layout.clone(), slice.clone()))?;
            if (start, len) != (0, dim) {
                output = output.narrow(axis as isize, start, len)?;
            }
            if let Axis::One(_) = item {
                output = output.squeeze(axis as isize)?;
            }
        }
        Ok(output)
    }
}
