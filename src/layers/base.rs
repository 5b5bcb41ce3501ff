use std::{
    fmt,
    sync::{Arc, RwLock},
};

use itertools::Itertools;

use super::{
    Layer, LayerError, LayerOp, Shape, Value, check_arity, impl_setters, one_hot, unique_name,
};
use crate::{
    activation::Activation as ActivationFn,
    loom::{
        sparse::SparseTensor,
        tensor::Tensor,
        variable::Variable,
    },
};

/// A feedable layer.
///
/// Dense inputs take `[batch, n_units]` values; sparse values fed to them are densified.
/// Sparse inputs sparsify dense values. With `n_active`, the input takes `[batch, n_active]` indices and
/// yields their sparse one-hot encoding over `n_units`. Without it, indices pass through
/// unchanged, as ids whose last dim is `n_units`.
#[derive(Debug, Clone)]
pub struct Input {
    n_units: usize,
    sparse: bool,
    n_active: Option<usize>,
    value: Arc<RwLock<Option<Value>>>,
}

#[derive(Debug, Default, Clone)]
pub struct InputBuilder {
    pub name: Option<String>,
    pub n_units: usize,
    pub sparse: bool,
    pub n_active: Option<usize>,
    pub value: Option<Value>,
}

impl_setters!(InputBuilder {
    n_units: usize,
    sparse: bool,
    n_active: Option<usize>,
});

impl InputBuilder {
    /// Default value used when nothing is fed.
    #[inline]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn build(self) -> Result<Layer, LayerError> {
        let Self {
            name,
            n_units,
            sparse,
            n_active,
            value,
        } = self;
        let op = Input {
            n_units,
            sparse: sparse || n_active.is_some(),
            n_active,
            value: Default::default(),
        };
        if let Some(value) = value {
            op.set_value(value)?;
        }
        let name = unique_name(name.as_deref().unwrap_or("input"));
        Ok(Layer::new(name, op, n_units, Shape::batch(n_units), &[]))
    }
}

impl Input {
    #[inline]
    pub fn builder(n_units: usize) -> InputBuilder {
        InputBuilder {
            n_units,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// Validates and stores a value that is used whenever the input is not fed.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<(), LayerError> {
        let value = self.feed(value.into())?;
        *self.value.write().expect("failed to lock") = Some(value);
        Ok(())
    }

    /// Removes the stored value.
    pub fn clear(&self) {
        *self.value.write().expect("failed to lock") = None;
    }

    #[inline]
    pub fn has_value(&self) -> bool {
        self.value.read().expect("failed to lock").is_some()
    }
}

impl LayerOp for Input {
    fn kind(&self) -> &'static str {
        "input"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        check_arity::<0>(self.kind(), inputs)?;
        self.value
            .read()
            .expect("failed to lock")
            .clone()
            .ok_or(LayerError::Missing)
    }

    fn is_input(&self) -> bool {
        true
    }

    fn feed(&self, value: Value) -> Result<Value, LayerError> {
        let value = match (value, self.n_active) {
            (Value::Indices(ids), Some(n_active)) => {
                let layout = ids.layout();
                if layout.last() != n_active {
                    return Err(LayerError::Shape(n_active, layout));
                }
                let ids = ids.reshape([layout.size() / n_active.max(1), n_active])?;
                Value::Sparse(SparseTensor::one_hot(&ids, self.n_units)?)
            }
            (value, Some(_)) => return Err(LayerError::Value("indices", value.kind())),
            (Value::Dense(x), None) if self.sparse => Value::Sparse(SparseTensor::from_dense(&x)),
            (Value::Sparse(x), None) if !self.sparse => Value::Dense(x.to_dense()),
            (value, None) => value,
        };
        let layout = value.layout();
        match layout.last() == self.n_units {
            true => Ok(value),
            false => Err(LayerError::Shape(self.n_units, layout)),
        }
    }

    fn reuse(&self, _inputs: &[Layer]) -> Result<Option<Box<dyn LayerOp>>, LayerError> {
        Err(LayerError::Reuse(self.kind().to_owned()))
    }
}

/// A layer holding a fixed value.
#[derive(Debug, Clone)]
pub struct Constant {
    value: Value,
}

impl Constant {
    pub fn build(value: impl Into<Value>) -> Result<Layer, LayerError> {
        let value = value.into();
        let layout = value.layout();
        let name = unique_name("constant");
        let n_units = layout.last();
        Ok(Layer::new(name, Constant { value }, n_units, Shape::of(&layout), &[]))
    }
}

impl LayerOp for Constant {
    fn kind(&self) -> &'static str {
        "constant"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        check_arity::<0>(self.kind(), inputs)?;
        Ok(self.value.clone())
    }

    fn reuse(&self, _inputs: &[Layer]) -> Result<Option<Box<dyn LayerOp>>, LayerError> {
        Err(LayerError::Reuse(self.kind().to_owned()))
    }
}

/// A named scalar that can be changed between steps, such as a learning rate.
/// Clones share the value.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    value: Arc<RwLock<f32>>,
}

impl Param {
    pub fn new(name: &str, value: f32) -> Self {
        Self {
            name: name.to_owned(),
            value: Arc::new(RwLock::new(value)),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn get(&self) -> f32 {
        *self.value.read().expect("failed to lock")
    }

    #[inline]
    pub fn set(&self, value: f32) {
        *self.value.write().expect("failed to lock") = value;
    }

    /// A layer whose value is this param as a scalar tensor.
    pub fn layer(&self) -> Layer {
        let name = unique_name(&self.name);
        Layer::new(name, self.clone(), 1, Shape::scalar(), &[])
    }
}

impl LayerOp for Param {
    fn kind(&self) -> &'static str {
        "param"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        check_arity::<0>(self.kind(), inputs)?;
        Ok(Value::Dense(Tensor::scalar(self.get())))
    }
}

/// Applies an activation function.
#[derive(Debug, Clone)]
pub struct Activation {
    pub function: ActivationFn,
}

impl Activation {
    pub fn build(input: &Layer, function: ActivationFn) -> Result<Layer, LayerError> {
        let name = unique_name("activation");
        let n_units = input.n_units();
        let shape = input.shape().clone();
        Ok(Layer::new(name, Activation { function }, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for Activation {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        Ok(Value::Dense(self.function.apply(&x.dense()?)?))
    }
}

/// Element-wise sum of its inputs, with broadcasting.
#[derive(Debug, Clone)]
pub struct Add;

impl Add {
    pub fn build(inputs: &[Layer]) -> Result<Layer, LayerError> {
        let Some(first) = inputs.first() else {
            return Err(LayerError::Arity("add", 1, 0));
        };
        let n_units = inputs.iter().map(Layer::n_units).max().unwrap_or_default();
        let shape = Shape::with_units(first.shape(), n_units);
        Ok(Layer::new(unique_name("add"), Add, n_units, shape, inputs))
    }
}

impl LayerOp for Add {
    fn kind(&self) -> &'static str {
        "add"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let mut values = inputs.iter().map(Value::dense);
        let first = values.next().ok_or(LayerError::Arity(self.kind(), 1, 0))??;
        let sum = values.try_fold(first, |sum, x| sum.try_add(&x?).map_err(LayerError::from))?;
        Ok(Value::Dense(sum))
    }
}

/// Concatenates its inputs along the last axis.
#[derive(Debug, Clone)]
pub struct Concat;

impl Concat {
    pub fn build(inputs: &[Layer]) -> Result<Layer, LayerError> {
        let Some(first) = inputs.first() else {
            return Err(LayerError::Arity("concat", 1, 0));
        };
        let n_units = inputs.iter().map(Layer::n_units).sum();
        let shape = Shape::with_units(first.shape(), n_units);
        Ok(Layer::new(unique_name("concat"), Concat, n_units, shape, inputs))
    }
}

impl LayerOp for Concat {
    fn kind(&self) -> &'static str {
        "concat"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let values = inputs
            .iter()
            .map(Value::dense)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Dense(Tensor::concat(&values, -1)?))
    }
}

type LambdaFn = Arc<dyn Fn(&[Value]) -> Result<Value, LayerError> + Send + Sync>;

/// Applies a closure to the values of its inputs.
#[derive(Clone)]
pub struct Lambda {
    function: LambdaFn,
    variables: Vec<Variable>,
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda")
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct LambdaBuilder {
    pub name: Option<String>,
    pub n_units: Option<usize>,
    pub shape: Option<Shape>,
    pub variables: Vec<Variable>,
    function: LambdaFn,
}

impl_setters!(LambdaBuilder {
    n_units: Option<usize>,
    shape: Option<Shape>,
    variables: Vec<Variable>,
});

impl LambdaBuilder {
    /// Without an explicit `n_units`, the layer takes the units of its first input.
    pub fn build(self, inputs: &[Layer]) -> Result<Layer, LayerError> {
        let n_units = self
            .n_units
            .or_else(|| inputs.first().map(Layer::n_units))
            .unwrap_or(1);
        let shape = self.shape.unwrap_or_else(|| match inputs.first() {
            Some(input) => Shape::with_units(input.shape(), n_units),
            None => Shape::batch(n_units),
        });
        let name = unique_name(self.name.as_deref().unwrap_or("lambda"));
        let op = Lambda {
            function: self.function,
            variables: self.variables,
        };
        Ok(Layer::new(name, op, n_units, shape, inputs))
    }
}

impl Lambda {
    pub fn builder(
        function: impl Fn(&[Value]) -> Result<Value, LayerError> + Send + Sync + 'static,
    ) -> LambdaBuilder {
        LambdaBuilder {
            name: None,
            n_units: None,
            shape: None,
            variables: vec![],
            function: Arc::new(function),
        }
    }
}

impl LayerOp for Lambda {
    fn kind(&self) -> &'static str {
        "lambda"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        (self.function)(inputs)
    }

    fn variables(&self) -> Vec<Variable> {
        self.variables.clone()
    }
}

type WrapFn = Arc<dyn Fn(Value) -> Result<Value, LayerError> + Send + Sync>;

/// Applies a function to the output of a wrapped layer.
///
/// The wrap takes the inputs of the wrapped layer. Reusing it reuses the wrapped layer
/// first, then wraps the result again.
#[derive(Clone)]
pub struct Wrap {
    wrapped: Layer,
    function: WrapFn,
}

impl fmt::Debug for Wrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrap")
            .field("wrapped", &self.wrapped)
            .finish_non_exhaustive()
    }
}

impl Wrap {
    pub fn build(
        wrapped: &Layer,
        n_units: Option<usize>,
        function: impl Fn(Value) -> Result<Value, LayerError> + Send + Sync + 'static,
    ) -> Result<Layer, LayerError> {
        let n_units = n_units.unwrap_or(wrapped.n_units());
        let shape = Shape::with_units(wrapped.shape(), n_units);
        let name = unique_name(&format!("wrap_{}", wrapped.name()));
        let op = Wrap {
            wrapped: wrapped.clone(),
            function: Arc::new(function),
        };
        Ok(Layer::new(name, op, n_units, shape, wrapped.inputs()))
    }

    #[inline]
    pub fn wrapped(&self) -> &Layer {
        &self.wrapped
    }
}

impl LayerOp for Wrap {
    fn kind(&self) -> &'static str {
        "wrap"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let value = self.wrapped.op_dyn().compute(inputs)?;
        (self.function)(value)
    }

    fn variables(&self) -> Vec<Variable> {
        self.wrapped.variables()
    }

    fn reuse(&self, inputs: &[Layer]) -> Result<Option<Box<dyn LayerOp>>, LayerError> {
        let wrapped = self.wrapped.reuse_with(inputs)?;
        let function = self.function.clone();
        Ok(Some(Box::new(Wrap { wrapped, function })))
    }
}

/// Reshapes its input. One dim may be `-1`, inferred from the size.
#[derive(Debug, Clone)]
pub struct Reshape {
    pub shape: Vec<isize>,
}

impl Reshape {
    pub fn build(input: &Layer, shape: &[isize]) -> Result<Layer, LayerError> {
        let n_units = match shape.last() {
            Some(&dim) if dim > 0 => dim as usize,
            _ => input.n_units(),
        };
        let static_shape = shape
            .iter()
            .map(|&dim| (dim > 0).then_some(dim as usize))
            .collect_vec();
        let op = Reshape {
            shape: shape.to_vec(),
        };
        let name = unique_name("reshape");
        Ok(Layer::new(name, op, n_units, Shape::from(Arc::from(static_shape)), &[input.clone()]))
    }
}

impl LayerOp for Reshape {
    fn kind(&self) -> &'static str {
        "reshape"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        Ok(Value::Dense(x.dense()?.reshape_infer(&self.shape)?))
    }
}

/// Flattens every dim but the batch.
#[derive(Debug, Clone)]
pub struct Flatten;

impl Flatten {
    pub fn build(input: &Layer) -> Result<Layer, LayerError> {
        let known: Option<usize> = input.shape().iter().skip(1).copied().product();
        let n_units = known.unwrap_or(input.n_units());
        let name = unique_name("flatten");
        Ok(Layer::new(name, Flatten, n_units, Shape::batch(n_units), &[input.clone()]))
    }
}

impl LayerOp for Flatten {
    fn kind(&self) -> &'static str {
        "flatten"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        Ok(Value::Dense(x.dense()?.flatten()?))
    }
}

/// Permutes the axes of its input, or swaps the last two if no permutation is given.
/// Sparse rank 2 inputs stay sparse.
#[derive(Debug, Clone)]
pub struct Transpose {
    pub perm: Option<Vec<usize>>,
}

impl Transpose {
    pub fn build(input: &Layer, perm: Option<Vec<usize>>) -> Result<Layer, LayerError> {
        let shape = input.shape().to_vec();
        let rank = shape.len();
        let shape = match &perm {
            Some(perm) if perm.iter().copied().sorted().eq(0..rank) => {
                perm.iter().map(|&axis| shape[axis]).collect_vec()
            }
            Some(perm) => {
                return Err(LayerError::Invalid(format!(
                    "{perm:?} is not a permutation of {} axes",
                    rank
                )));
            }
            None if rank >= 2 => {
                let mut shape = shape;
                shape.swap(rank - 2, rank - 1);
                shape
            }
            None => return Err(LayerError::Invalid("transpose needs at least 2 axes".into())),
        };
        let n_units = shape.last().copied().flatten().unwrap_or(input.n_units());
        let name = unique_name("transpose");
        let op = Transpose { perm };
        Ok(Layer::new(name, op, n_units, Shape::from(Arc::from(shape)), &[input.clone()]))
    }
}

impl LayerOp for Transpose {
    fn kind(&self) -> &'static str {
        "transpose"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        match (x, &self.perm) {
            (Value::Sparse(x), None) => Ok(Value::Sparse(x.transpose()?)),
            (x, Some(perm)) => Ok(Value::Dense(x.dense()?.permute(perm)?)),
            (x, None) => Ok(Value::Dense(x.dense()?.transpose()?)),
        }
    }
}

/// Converts its input to a sparse value. Indices become their one-hot encoding over `n_units`.
#[derive(Debug, Clone)]
pub struct ToSparse {
    n_units: usize,
}

impl ToSparse {
    pub fn build(input: &Layer, n_units: Option<usize>) -> Result<Layer, LayerError> {
        let n_units = n_units.unwrap_or(input.n_units());
        let name = unique_name("to_sparse");
        let shape = Shape::with_units(input.shape(), n_units);
        Ok(Layer::new(name, ToSparse { n_units }, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for ToSparse {
    fn kind(&self) -> &'static str {
        "to_sparse"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let sp = match x {
            Value::Dense(x) => SparseTensor::from_dense(x),
            Value::Sparse(x) => x.clone(),
            Value::Indices(ids) => one_hot(ids, self.n_units)?,
        };
        Ok(Value::Sparse(sp))
    }
}

/// Converts its input to a dense value. Indices become their one-hot encoding over `n_units`.
#[derive(Debug, Clone)]
pub struct ToDense {
    n_units: usize,
}

impl ToDense {
    pub fn build(input: &Layer, n_units: Option<usize>) -> Result<Layer, LayerError> {
        let n_units = n_units.unwrap_or(input.n_units());
        let name = unique_name("to_dense");
        let shape = Shape::with_units(input.shape(), n_units);
        Ok(Layer::new(name, ToDense { n_units }, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for ToDense {
    fn kind(&self) -> &'static str {
        "to_dense"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let dense = match x {
            Value::Indices(ids) => one_hot(ids, self.n_units)?.to_dense(),
            x => x.dense()?,
        };
        Ok(Value::Dense(dense))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{
        Activation, Add, Concat, Constant, Input, Lambda, Param, Reshape, ToDense, ToSparse,
        Transpose, Wrap,
    };
    use crate::{
        activation::Activation as ActivationFn,
        graph::Graph,
        layers::{LayerError, LayerOp, Value},
        loom::{sparse::SparseTensor, tensor::{Indices, Tensor}},
    };

    #[test]
    fn test_input_feed() -> Result<(), Box<dyn Error>> {
        let x = Input::builder(3).build()?;
        let op = x.try_op::<Input>()?;
        assert!(x.compute().is_err());
        assert!(op.set_value(Tensor::ones([2, 4])).is_err());

        let sparse = Input::builder(3).sparse(true).build()?;
        let value = sparse.try_op::<Input>()?.feed(Tensor::ones([1, 3]).into())?;
        assert!(matches!(value, Value::Sparse(_)));

        let ids = Input::builder(5).n_active(Some(2)).build()?;
        let value = ids
            .try_op::<Input>()?
            .feed(Indices::from_rows(&[[0, 4], [1, 2]])?.into())?;
        let dense = value.dense()?;
        assert_eq!(dense.data(), &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

        assert!(x.reuse_with(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_feed_defaults() -> Result<(), Box<dyn Error>> {
        let in1 = Input::builder(2).build()?;
        let in2 = Input::builder(2).build()?;
        let out = Add::build(&[in1.clone(), in2.clone()])?;
        let graph = Graph::build(&[], &[out], false)?;

        in1.set_value(Tensor::create([1, 2], vec![1.0, 2.0])?)?;
        let mut feed = crate::graph::Feed::default();
        feed.insert(in2, Tensor::create([1, 2], vec![2.0, 1.0])?.into());
        let result = graph.compute(&feed)?;
        assert_eq!(result[0].dense()?.data(), &[3.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_shape_layers() -> Result<(), Box<dyn Error>> {
        let x = Constant::build(Tensor::create([2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?)?;
        assert!(x.reuse_with(&[]).is_err());

        let y = Reshape::build(&x, &[-1, 2])?;
        assert_eq!(y.n_units(), 2);
        assert_eq!(y.compute()?.shape(), &[3, 2]);

        let t = Transpose::build(&x, None)?;
        assert_eq!(t.compute()?.dense()?.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let c = Concat::build(&[x.clone(), x.clone()])?;
        assert_eq!(c.n_units(), 6);
        assert_eq!(c.compute()?.shape(), &[2, 6]);

        let sp = ToSparse::build(&x, None)?;
        assert!(matches!(sp.compute()?, Value::Sparse(_)));
        let dense = ToDense::build(&sp, None)?;
        assert_eq!(dense.compute()?.dense()?, x.compute()?.dense()?);

        let ids = Constant::build(Indices::from_rows(&[[1], [0]])?)?;
        let one_hot = ToDense::build(&ids, Some(2))?;
        assert_eq!(one_hot.compute()?.dense()?.data(), &[0.0, 1.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_lambda_wrap() -> Result<(), Box<dyn Error>> {
        let x = Input::builder(2).value(Tensor::ones([1, 2])).build()?;
        let double = Lambda::builder(|inputs: &[Value]| {
            let x = inputs.first().ok_or(LayerError::Missing)?.dense()?;
            Ok(Value::Dense(x.mul_scalar(2.0)))
        })
        .name("double")
        .build(&[x.clone()])?;
        assert!(double.name().starts_with("double"));
        assert_eq!(double.compute()?.dense()?.data(), &[2.0, 2.0]);

        let act = Activation::build(&x, ActivationFn::Relu)?;
        let wrap = Wrap::build(&act, None, |value| Ok(Value::Dense(value.dense()?.neg())))?;
        assert_eq!(wrap.inputs(), act.inputs());
        assert_eq!(wrap.compute()?.dense()?.data(), &[-1.0, -1.0]);

        let other = Input::builder(2).value(Tensor::full([1, 2], 3.0)).build()?;
        let reused = wrap.reuse_with(&[other])?;
        assert_eq!(reused.compute()?.dense()?.data(), &[-3.0, -3.0]);
        Ok(())
    }

    #[test]
    fn test_param() -> Result<(), Box<dyn Error>> {
        let lr = Param::new("lr", 0.5);
        let layer = lr.layer();
        let shared = lr.clone();
        shared.set(0.25);
        assert_eq!(lr.get(), 0.25);
        assert_eq!(layer.compute()?.dense()?.item()?, 0.25);

        let sp = SparseTensor::from_dense(&Tensor::ones([1, 2]));
        let sparse = Input::builder(2).sparse(true).value(sp).build()?;
        let dense = Activation::build(&sparse, ActivationFn::Identity)?;
        assert_eq!(dense.compute()?.dense()?.data(), &[1.0, 1.0]);
        Ok(())
    }
}
