use std::{fmt, sync::Arc};

use itertools::Itertools;
use thiserror::Error;

use super::{
    layout::{IntoLayout, Layout, LayoutError},
    ops::{TensorNode, TensorOp},
    slice::Slice,
    variable::VariableId,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor creation error: layout {0}'s size not match data len {1}")]
    Create(Layout, usize),
    #[error("tensor reshape error: layout {0}'s size not match layout {1}'s")]
    Reshape(Layout, Layout),
    #[error("tensor broadcast error: layout {0} is not broadcastable with layout {1}")]
    Broadcast(Layout, Layout),
    #[error("tensor shape error: layout {0} mismatches layout {1}")]
    Mismatch(Layout, Layout),
    #[error("tensor item error: layout {0} does not hold a single element")]
    Item(Layout),
    #[error("tensor index error: index {0} out of bounds for dim {1}")]
    Index(usize, usize),
    #[error("tensor slice error: slice {1} is not compatible with layout {0}")]
    Slice(Layout, Slice),
    #[error("tensor value error: {0} is not a valid index")]
    Value(f32),
    #[error("tensor rank error: expected at least {0} dims, got layout {1}")]
    Rank(usize, Layout),
    #[error("tensor permute error: axes {0:?} is not a permutation of layout {1}")]
    Permute(Vec<usize>, Layout),
    #[error("tensor op error: op {0} expects {1} inputs, got {2}")]
    Arity(&'static str, usize, usize),
    #[error("tensor concat error: no tensors to concatenate")]
    Empty,
    #[error("tensor split error: dim {1} can not be split into {0} equal parts")]
    Split(usize, usize),
    #[error("sparse tensor error: index {0:?} out of bounds for layout {1}")]
    Sparse(Vec<usize>, Layout),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId;

/// A dense `f32` tensor.
///
/// The data is immutable and shared between clones. A tensor computed from trainable
/// variables carries the node that produced it, so that [`Tensor::backward`] can walk
/// the computation back to the variables.
#[derive(Clone)]
pub struct Tensor {
    layout: Layout,
    data: Arc<[f32]>,
    id: uid::Id<TensorId>,
    node: Option<Arc<TensorNode>>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("layout", &self.layout)
            .field("data", &self.data)
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout && self.data == other.data
    }
}

impl Tensor {
    /// Create a new tensor with the given layout and contents.
    pub fn create<L, C>(layout: L, contents: C) -> Result<Self, TensorError>
    where
        L: IntoLayout,
        C: Into<Arc<[f32]>>,
    {
        let layout = layout.into_layout();
        let data: Arc<[f32]> = contents.into();
        if layout.size() != data.len() {
            return Err(TensorError::Create(layout, data.len()));
        }
        Ok(Self::raw(layout, data))
    }

    #[inline]
    pub(crate) fn raw(layout: Layout, data: Arc<[f32]>) -> Self {
        debug_assert_eq!(layout.size(), data.len());
        let id = uid::Id::new();
        let node = None;
        Self {
            layout,
            data,
            id,
            node,
        }
    }

    /// Creates the output of `op`. A node is recorded only if some input is tracked.
    #[inline]
    pub(crate) fn from_op(
        layout: Layout,
        data: impl Into<Arc<[f32]>>,
        op: impl TensorOp + 'static,
        inputs: &[&Tensor],
    ) -> Self {
        let mut output = Self::raw(layout, data.into());
        if inputs.iter().any(|input| input.requires_grad()) {
            let op = Box::new(op);
            let inputs = inputs.iter().map(|&input| input.clone()).collect();
            output.node = Some(Arc::new(TensorNode::Op { op, inputs }));
        }
        output
    }

    /// Marks the tensor as the value of a trainable variable.
    #[inline]
    pub(crate) fn tracked(mut self, variable: VariableId) -> Self {
        self.id = uid::Id::new();
        self.node = Some(Arc::new(TensorNode::Variable(variable)));
        self
    }

    #[inline]
    pub fn zeros(layout: impl IntoLayout) -> Self {
        Self::full(layout, 0.0)
    }

    #[inline]
    pub fn ones(layout: impl IntoLayout) -> Self {
        Self::full(layout, 1.0)
    }

    #[inline]
    pub fn full(layout: impl IntoLayout, value: f32) -> Self {
        let layout = layout.into_layout();
        let data = vec![value; layout.size()];
        Self::raw(layout, data.into())
    }

    #[inline]
    pub fn scalar(value: f32) -> Self {
        Self::raw(Layout::scalar(), [value].into())
    }

    /// Creates a rank-1 tensor.
    #[inline]
    pub fn vector(contents: impl Into<Arc<[f32]>>) -> Self {
        let data: Arc<[f32]> = contents.into();
        Self::raw(Layout::from_shape(data.len()), data)
    }

    /// Create a tensor of zeros with the layout of the current one.
    #[inline]
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.layout())
    }

    #[inline]
    pub fn ones_like(&self) -> Self {
        Self::ones(self.layout())
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout.clone()
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Number of dimensions.
    #[inline]
    pub fn dim(&self) -> usize {
        self.layout.len()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub(crate) fn data_arc(&self) -> Arc<[f32]> {
        self.data.clone()
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_vec()
    }

    #[inline]
    pub fn id(&self) -> uid::Id<TensorId> {
        self.id
    }

    #[inline]
    pub(crate) fn node(&self) -> Option<&Arc<TensorNode>> {
        self.node.as_ref()
    }

    /// Returns `true` if gradients flow through this tensor.
    #[inline]
    pub fn requires_grad(&self) -> bool {
        self.node.is_some()
    }

    /// Returns the single element of the tensor.
    #[inline]
    pub fn item(&self) -> Result<f32, TensorError> {
        match self.data.as_ref() {
            [x] => Ok(*x),
            _ => Err(TensorError::Item(self.layout())),
        }
    }

    /// A copy of the tensor sharing the data but cut from the computation graph.
    #[inline]
    pub fn detach(&self) -> Self {
        Self::raw(self.layout(), self.data.clone())
    }

    /// Checks that the layout equals `layout`.
    #[inline]
    pub fn check_layout(self, layout: impl IntoLayout) -> Result<Self, TensorError> {
        let layout = layout.into_layout();
        match self.layout == layout {
            true => Ok(self),
            false => Err(TensorError::Mismatch(self.layout(), layout)),
        }
    }

    /// Rows of the last axis.
    #[inline]
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.layout.last().max(1))
    }

    /// Converts an integral valued tensor into [`Indices`].
    pub fn to_indices(&self) -> Result<Indices, TensorError> {
        let data: Vec<usize> = self
            .data
            .iter()
            .map(|&x| match x >= 0.0 && x.fract() == 0.0 {
                true => Ok(x as usize),
                false => Err(TensorError::Value(x)),
            })
            .collect::<Result<_, _>>()?;
        Indices::create(self.layout(), data)
    }
}

/// A tensor of integral indices (ids), never differentiated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Indices {
    layout: Layout,
    data: Arc<[usize]>,
}

impl Indices {
    pub fn create<L, C>(layout: L, contents: C) -> Result<Self, TensorError>
    where
        L: IntoLayout,
        C: Into<Arc<[usize]>>,
    {
        let layout = layout.into_layout();
        let data: Arc<[usize]> = contents.into();
        if layout.size() != data.len() {
            return Err(TensorError::Create(layout, data.len()));
        }
        Ok(Self { layout, data })
    }

    /// Creates a rank-2 batch of index rows. Rows must have equal length.
    pub fn from_rows<R: AsRef<[usize]>>(rows: &[R]) -> Result<Self, TensorError> {
        let cols = rows.first().map_or(0, |row| row.as_ref().len());
        let data = rows
            .iter()
            .flat_map(|row| row.as_ref().iter().copied())
            .collect_vec();
        Self::create([rows.len(), cols], data)
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout.clone()
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    #[inline]
    pub fn data(&self) -> &[usize] {
        &self.data
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<usize> {
        self.data.to_vec()
    }

    /// Largest index, if any.
    #[inline]
    pub fn max(&self) -> Option<usize> {
        self.data.iter().copied().max()
    }

    #[inline]
    pub fn reshape(self, layout: impl IntoLayout) -> Result<Self, TensorError> {
        let layout = layout.into_layout();
        if layout.size() != self.layout.size() {
            return Err(TensorError::Reshape(self.layout, layout));
        }
        Ok(Self { layout, ..self })
    }

    /// Converts the ids to a float tensor.
    #[inline]
    pub fn to_tensor(&self) -> Tensor {
        let data: Arc<[f32]> = self.data.iter().map(|&x| x as f32).collect();
        Tensor::raw(self.layout(), data)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Indices, Tensor};

    #[test]
    fn test_create() -> Result<(), Box<dyn Error>> {
        let tensor = Tensor::create([2, 3], vec![1.0; 6])?;
        assert_eq!(tensor.shape(), &[2, 3]);
        assert!(!tensor.requires_grad());
        assert!(Tensor::create([2, 3], vec![1.0; 5]).is_err());
        assert!(tensor.item().is_err());
        assert_eq!(Tensor::scalar(3.0).item()?, 3.0);
        Ok(())
    }

    #[test]
    fn test_indices() -> Result<(), Box<dyn Error>> {
        let ids = Indices::from_rows(&[[2, 0], [1, 2]])?;
        assert_eq!(ids.shape(), &[2, 2]);
        assert_eq!(ids.max(), Some(2));
        assert_eq!(ids.to_tensor().to_indices()?, ids);
        assert!(Tensor::vector(vec![0.5]).to_indices().is_err());
        Ok(())
    }
}
