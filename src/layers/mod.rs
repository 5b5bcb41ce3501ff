//! Layers are the nodes of a computation graph.
//!
//! A [`Layer`] is a cheap, shared handle holding its input layers and a boxed [`LayerOp`]
//! that computes the layer's [`Value`] from the values of its inputs. Ops own their
//! [`Variable`]s; cloning an op clones the handles, so the clone shares the variables.
//! This is how [`Layer::reuse_with`] builds a layer with the same parameters on new inputs.
//!
//! ## Key Components
//! 1. **Values**: dense tensors, sparse tensors and index tensors flow between layers.
//! 2. **Ops**: the `LayerOp` trait, implemented by every layer type in the submodules.
//! 3. **Builders**: each layer type has a builder ending with `build(input(s))`.

use std::{
    any::Any,
    fmt,
    sync::{Arc, LazyLock, Mutex},
};

use derive_more::{Deref, DerefMut, Display, From};
use dyn_clone::DynClone;
use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use thiserror::Error;

use crate::{
    graph::{Graph, GraphError},
    loom::{
        layout::{Layout, LayoutError},
        sparse::SparseTensor,
        tensor::{Indices, Tensor, TensorError},
        variable::Variable,
    },
};

pub mod attention;
pub mod base;
pub mod compose;
pub mod conv;
pub mod linear;
pub mod noise;
pub mod norm;
pub mod rnn;

pub use attention::{MHAttention, MHAttentionBuilder};
pub use base::{
    Activation, Add, Concat, Constant, Flatten, Input, InputBuilder, Lambda, LambdaBuilder, Param,
    Reshape, ToDense, ToSparse, Transpose, Wrap,
};
pub use compose::{
    CoupledGate, CoupledGateBuilder, Gate, GateBuilder, Highway, Module, Residual, compose,
};
pub use conv::{CausalConv, Conv1D, Conv1DBuilder};
pub use linear::{Bias, Lookup, LookupBuilder, Linear, LinearBuilder};
pub use noise::{
    Dropout, DropoutBuilder, GaussianNoise, SaltPepperNoise, ZoneOut, ZoneOutBuilder,
};
pub use norm::{BatchNorm, BatchNormBuilder, LayerNorm};
pub use rnn::{
    CellBuilder, CellKind, GruCell, LstmCell, LstmOutput, RecurrentCell, Rnn, RnnBuilder, RnnCell,
    zero_state,
};

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer input error: {0} expects {1} inputs, got {2}")]
    Arity(&'static str, usize, usize),
    #[error("layer value error: expected a {0} value, got a {1} value")]
    Value(&'static str, &'static str),
    #[error("layer shape error: expected last dim {0}, got layout {1}")]
    Shape(usize, Layout),
    #[error("layer feed error: input has no value")]
    Missing,
    #[error("layer reuse error: layer {0} can not be reused")]
    Reuse(String),
    #[error("layer config error: {0}")]
    Invalid(String),
    #[error("layer downcast error: layer {0} is not a {1}")]
    Downcast(String, &'static str),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Graph(#[from] Box<GraphError>),
}

/// What flows along the edges of a layer graph.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Value {
    Dense(Tensor),
    Sparse(SparseTensor),
    Indices(Indices),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Dense(_) => "dense",
            Value::Sparse(_) => "sparse",
            Value::Indices(_) => "indices",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Dense(x) => x.shape(),
            Value::Sparse(x) => x.shape(),
            Value::Indices(x) => x.shape(),
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            Value::Dense(x) => x.layout(),
            Value::Sparse(x) => x.layout(),
            Value::Indices(x) => x.layout(),
        }
    }

    /// The value as a dense tensor. Sparse values are densified; indices are rejected.
    pub fn dense(&self) -> Result<Tensor, LayerError> {
        match self {
            Value::Dense(x) => Ok(x.clone()),
            Value::Sparse(x) => Ok(x.to_dense()),
            Value::Indices(_) => Err(LayerError::Value("dense", self.kind())),
        }
    }

    #[inline]
    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            Value::Dense(x) => Some(x),
            _ => None,
        }
    }

    #[inline]
    pub fn as_sparse(&self) -> Option<&SparseTensor> {
        match self {
            Value::Sparse(x) => Some(x),
            _ => None,
        }
    }

    #[inline]
    pub fn as_indices(&self) -> Option<&Indices> {
        match self {
            Value::Indices(x) => Some(x),
            _ => None,
        }
    }
}

/// Static shape of a layer's output. Unknown dims (usually the batch) are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, From, Display)]
#[display("[{}]", _0.iter().map(|dim| dim.map_or("?".to_owned(), |dim| dim.to_string())).format(", "))]
pub struct Shape(Arc<[Option<usize>]>);

impl From<Vec<Option<usize>>> for Shape {
    #[inline]
    fn from(value: Vec<Option<usize>>) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[Option<usize>; N]> for Shape {
    #[inline]
    fn from(value: [Option<usize>; N]) -> Self {
        Self(value.into())
    }
}

impl Shape {
    #[inline]
    pub fn scalar() -> Self {
        Self(Arc::new([]))
    }

    /// A shape with every dim known.
    #[inline]
    pub fn of(layout: &Layout) -> Self {
        Self(layout.iter().map(|&dim| Some(dim)).collect())
    }

    /// `[?, n_units]`.
    #[inline]
    pub fn batch(n_units: usize) -> Self {
        Self([None, Some(n_units)].into())
    }

    /// `[?, ?, n_units]`.
    #[inline]
    pub fn sequence(n_units: usize) -> Self {
        Self([None, None, Some(n_units)].into())
    }

    /// Keeps the leading dims of `shape` and sets the last one to `n_units`.
    pub fn with_units(shape: &Shape, n_units: usize) -> Self {
        let mut dims = shape.to_vec();
        match dims.last_mut() {
            Some(last) => *last = Some(n_units),
            None => dims.push(Some(n_units)),
        }
        Self(dims.into())
    }

    /// Whether a concrete layout agrees with every known dim.
    pub fn matches(&self, layout: &Layout) -> bool {
        self.len() == layout.len()
            && self
                .iter()
                .zip_eq(layout.iter())
                .all(|(dim, &actual)| dim.is_none_or(|dim| dim == actual))
    }
}

/// Computes the value of a layer from the values of its inputs.
pub trait LayerOp: fmt::Debug + Send + Sync + DynClone + Any {
    /// Base name of the layers built with this op.
    fn kind(&self) -> &'static str;

    /// Computes the output from the input values, given in the order of the layer's inputs.
    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError>;

    /// Variables owned by this op.
    fn variables(&self) -> Vec<Variable> {
        vec![]
    }

    /// Whether values can be fed to the layer.
    fn is_input(&self) -> bool {
        false
    }

    /// Validates and converts a fed value. Only input ops accept feeds.
    fn feed(&self, value: Value) -> Result<Value, LayerError> {
        Err(LayerError::Value("computed", value.kind()))
    }

    /// The op of a reused layer with new `inputs`. Returns `None` to share a copy of this op.
    fn reuse(&self, _inputs: &[Layer]) -> Result<Option<Box<dyn LayerOp>>, LayerError> {
        Ok(None)
    }
}

dyn_clone::clone_trait_object!(LayerOp);

static NAMES: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(Default::default);

/// Reserves a unique layer name: `base`, or `base_1`, `base_2`, ... if taken.
pub fn unique_name(base: &str) -> String {
    let mut names = NAMES.lock().expect("failed to lock");
    let name = match names.contains(base) {
        false => base.to_owned(),
        true => (1..)
            .map(|n| format!("{base}_{n}"))
            .find(|name| !names.contains(name))
            .unwrap_or_default(),
    };
    names.insert(name.clone());
    name
}

/// Frees a name reserved by [`unique_name`].
fn release_name(name: &str) {
    if let Ok(mut names) = NAMES.lock() {
        names.remove(name);
    }
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct LayerId(uid::Id<LayerId>);

struct LayerNode {
    id: LayerId,
    name: String,
    n_units: usize,
    shape: Shape,
    inputs: Vec<Layer>,
    op: Box<dyn LayerOp>,
}

impl Drop for LayerNode {
    fn drop(&mut self) {
        // variable names derive from the layer name, keep it while they are held elsewhere
        let shared = self.op.variables().iter().any(|var| var.handles() > 2);
        if !shared {
            release_name(&self.name);
        }
    }
}

/// A node of a computation graph. Clones refer to the same node.
/// The name is released when the last clone is dropped.
#[derive(Clone)]
pub struct Layer(Arc<LayerNode>);

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.0.name)
            .field("kind", &self.0.op.kind())
            .field("n_units", &self.0.n_units)
            .field("shape", &self.0.shape)
            .field("inputs", &self.0.inputs.iter().map(Layer::name).collect_vec())
            .finish()
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Layer {}

impl std::hash::Hash for Layer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Layer {
    /// Creates a layer. `name` must come from [`unique_name`].
    pub fn new(
        name: String,
        op: impl LayerOp,
        n_units: usize,
        shape: Shape,
        inputs: &[Layer],
    ) -> Self {
        Self::from_box(name, Box::new(op), n_units, shape, inputs)
    }

    fn from_box(
        name: String,
        op: Box<dyn LayerOp>,
        n_units: usize,
        shape: Shape,
        inputs: &[Layer],
    ) -> Self {
        log::debug!("layer {name}: {} {shape} <- [{}]", op.kind(), inputs.iter().format(", "));
        let node = LayerNode {
            id: LayerId::default(),
            name,
            n_units,
            shape,
            inputs: inputs.to_vec(),
            op,
        };
        Self(Arc::new(node))
    }

    #[inline]
    pub fn id(&self) -> LayerId {
        self.0.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        self.0.op.kind()
    }

    #[inline]
    pub fn n_units(&self) -> usize {
        self.0.n_units
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.0.shape
    }

    #[inline]
    pub fn inputs(&self) -> &[Layer] {
        &self.0.inputs
    }

    #[inline]
    pub fn is_input(&self) -> bool {
        self.0.op.is_input()
    }

    #[inline]
    pub fn op_dyn(&self) -> &dyn LayerOp {
        self.0.op.as_ref()
    }

    /// The op as a concrete type, if it is one.
    #[inline]
    pub fn op<T: LayerOp>(&self) -> Option<&T> {
        let op: &dyn Any = self.0.op.as_ref();
        op.downcast_ref()
    }

    /// Like [`Layer::op`], with an error naming the layer.
    pub fn try_op<T: LayerOp>(&self) -> Result<&T, LayerError> {
        self.op()
            .ok_or_else(|| LayerError::Downcast(self.0.name.clone(), std::any::type_name::<T>()))
    }

    /// Variables of this layer's op.
    #[inline]
    pub fn variables(&self) -> Vec<Variable> {
        self.0.op.variables()
    }

    /// Sets the stored value of an input layer.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<(), LayerError> {
        self.try_op::<Input>()?.set_value(value)
    }

    /// Evaluates the graph ending at this layer with the stored input values.
    pub fn compute(&self) -> Result<Value, GraphError> {
        let graph = Graph::build(&[], &[self.clone()], false)?;
        let mut outputs = graph.compute(&Default::default())?;
        outputs.pop().ok_or(GraphError::Empty)
    }

    /// Whether `other` is this layer or one of its ancestors.
    pub fn depends_on(&self, other: &Layer) -> bool {
        let mut visited = HashSet::default();
        let mut stack = vec![self.clone()];
        while let Some(layer) = stack.pop() {
            if &layer == other {
                return true;
            }
            if visited.insert(layer.id()) {
                stack.extend(layer.inputs().iter().cloned());
            }
        }
        false
    }

    /// A new layer with the same op, sharing its variables, on new `inputs`.
    pub fn reuse_with(&self, inputs: &[Layer]) -> Result<Layer, LayerError> {
        let op = dyn_clone::clone_box(self.0.op.as_ref());
        self.rebuild(op, inputs)
    }

    /// Like [`Layer::reuse_with`], editing the copied op with `f` first.
    pub fn reuse_map<T: LayerOp>(
        &self,
        inputs: &[Layer],
        f: impl FnOnce(&mut T),
    ) -> Result<Layer, LayerError> {
        let mut op = dyn_clone::clone_box(self.0.op.as_ref());
        let any: &mut dyn Any = op.as_mut();
        let concrete = any
            .downcast_mut::<T>()
            .ok_or_else(|| LayerError::Downcast(self.0.name.clone(), std::any::type_name::<T>()))?;
        f(concrete);
        self.rebuild(op, inputs)
    }

    fn rebuild(&self, op: Box<dyn LayerOp>, inputs: &[Layer]) -> Result<Layer, LayerError> {
        if inputs.len() != self.0.inputs.len() {
            return Err(LayerError::Arity(self.kind(), self.0.inputs.len(), inputs.len()));
        }
        let op = op.reuse(inputs)?.unwrap_or(op);
        let name = unique_name(&self.0.name);
        let shape = self.0.shape.clone();
        Ok(Self::from_box(name, op, self.0.n_units, shape, inputs))
    }
}

/// Rebuilds the layers between `mapping`'s keys and `outputs`, replacing every key by its
/// value. Layers that do not depend on any key are kept.
pub(crate) fn reuse_graph(
    outputs: &[Layer],
    mapping: &mut HashMap<Layer, Layer>,
) -> Result<Vec<Layer>, LayerError> {
    outputs
        .iter()
        .map(|output| reuse_layer(output, mapping))
        .collect()
}

fn reuse_layer(layer: &Layer, mapping: &mut HashMap<Layer, Layer>) -> Result<Layer, LayerError> {
    if let Some(layer) = mapping.get(layer) {
        return Ok(layer.clone());
    }
    let inputs: Vec<Layer> = layer
        .inputs()
        .iter()
        .map(|input| reuse_layer(input, mapping))
        .collect::<Result<_, _>>()?;
    let reused = match inputs.as_slice() == layer.inputs() {
        true => layer.clone(),
        false => layer.reuse_with(&inputs)?,
    };
    mapping.insert(layer.clone(), reused.clone());
    Ok(reused)
}

/// Checks the number of inputs of an op.
#[inline]
pub(crate) fn check_arity<'a, const N: usize>(
    kind: &'static str,
    inputs: &'a [Value],
) -> Result<&'a [Value; N], LayerError> {
    inputs
        .try_into()
        .map_err(|_| LayerError::Arity(kind, N, inputs.len()))
}

/// One-hot encoding of `[.., k]` indices over `n` classes, as a `[rows, n]` sparse tensor.
pub(crate) fn one_hot(ids: &Indices, n: usize) -> Result<SparseTensor, LayerError> {
    let layout = ids.layout();
    let k = layout.last();
    let ids = ids.clone().reshape([layout.size() / k.max(1), k])?;
    Ok(SparseTensor::one_hot(&ids, n)?)
}

/// Implements chainable setters on a layer builder with a `name: Option<String>` field.
macro_rules! impl_setters {
    ($builder:ty { $($field:ident: $ty:ty),* $(,)? }) => {
        impl $builder {
            /// Base name of the built layer.
            #[inline]
            pub fn name(mut self, name: &str) -> Self {
                self.name = Some(name.to_owned());
                self
            }

            $(
                #[inline]
                pub fn $field(mut self, $field: $ty) -> Self {
                    self.$field = $field;
                    self
                }
            )*
        }
    };
}

pub(crate) use impl_setters;

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Input, Layer, Linear, Shape, Value, unique_name};
    use crate::loom::{layout::Layout, tensor::Tensor};

    #[test]
    fn test_unique_name() {
        let base = unique_name("test_unique");
        assert_eq!(base, "test_unique");
        assert_eq!(unique_name("test_unique"), "test_unique_1");
        assert_eq!(unique_name("test_unique"), "test_unique_2");
        assert_eq!(unique_name("test_unique_1"), "test_unique_1_1");
    }

    #[test]
    fn test_release_name() -> Result<(), Box<dyn Error>> {
        let x = Input::builder(2).name("test_release").build()?;
        assert_eq!(x.name(), "test_release");
        drop(x);
        let x = Input::builder(2).name("test_release").build()?;
        assert_eq!(x.name(), "test_release");

        let linear = Linear::builder(2).name("test_release_linear").build(&x)?;
        let weights = linear.variables();
        drop(linear);
        // the weights are still named after the dropped layer
        let linear = Linear::builder(2).name("test_release_linear").build(&x)?;
        assert_eq!(linear.name(), "test_release_linear_1");
        drop((linear, weights));
        let linear = Linear::builder(2).name("test_release_linear").build(&x)?;
        assert_eq!(linear.name(), "test_release_linear_1");
        Ok(())
    }

    #[test]
    fn test_shape() {
        let shape = Shape::batch(4);
        assert_eq!(shape.to_string(), "[?, 4]");
        assert!(shape.matches(&Layout::from_shape([8, 4])));
        assert!(!shape.matches(&Layout::from_shape([8, 3])));
        assert!(!shape.matches(&Layout::from_shape([8, 2, 4])));
    }

    #[test]
    fn test_depends_on() -> Result<(), Box<dyn Error>> {
        let x = super::base::Input::builder(2).build()?;
        let y = super::base::Add::build(&[x.clone(), x.clone()])?;
        let z = super::base::Activation::build(&y, crate::activation::Activation::Tanh)?;
        assert!(z.depends_on(&x));
        assert!(!x.depends_on(&z));

        x.set_value(Tensor::ones([1, 2]))?;
        let value: Value = z.compute()?;
        let expected = 2.0f32.tanh();
        assert_eq!(value.dense()?.data(), &[expected, expected]);

        let other: Layer = super::base::Input::builder(2).build()?;
        let w = y.reuse_with(&[other.clone(), other.clone()])?;
        assert!(!w.depends_on(&x));
        assert!(w.name().starts_with(y.name()));
        Ok(())
    }
}
