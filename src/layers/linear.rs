use super::{Layer, LayerError, LayerOp, Shape, Value, check_arity, impl_setters, one_hot, unique_name};
use crate::{
    activation::Activation as ActivationFn,
    init::Init,
    loom::{tensor::Tensor, variable::Variable},
};

/// # Linear (`x·W + b`)
/// A fully connected layer over dense, sparse or index inputs.
///
/// Index inputs are treated as the multi-hot encoding of their ids over the input units,
/// so the three kinds give equal outputs for equal contents.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weights: Variable,
    pub bias: Option<Variable>,
    pub transpose_weights: bool,
    pub activation: ActivationFn,
}

#[derive(Debug, Clone)]
pub struct LinearBuilder {
    pub name: Option<String>,
    pub n_units: usize,
    pub bias: bool,
    pub weight_init: Init,
    pub bias_init: Init,
    pub activation: ActivationFn,
    /// Weights of shape `[n_in, n_units]`, or `[n_units, n_in]` with `transpose_weights`.
    pub shared_weights: Option<Variable>,
    pub transpose_weights: bool,
    /// Another linear layer whose variables are reused.
    pub share_vars_with: Option<Layer>,
}

impl_setters!(LinearBuilder {
    bias: bool,
    weight_init: Init,
    bias_init: Init,
    activation: ActivationFn,
    shared_weights: Option<Variable>,
    transpose_weights: bool,
    share_vars_with: Option<Layer>,
});

impl Linear {
    pub fn builder(n_units: usize) -> LinearBuilder {
        LinearBuilder {
            name: None,
            n_units,
            bias: true,
            weight_init: Init::GlorotUniform,
            bias_init: Init::Zeros,
            activation: ActivationFn::Identity,
            shared_weights: None,
            transpose_weights: false,
            share_vars_with: None,
        }
    }

    /// The weights as used in the product, `[n_in, n_units]`.
    pub fn kernel(&self) -> Result<Tensor, LayerError> {
        let weights = self.weights.value();
        match self.transpose_weights {
            true => Ok(weights.transpose()?),
            false => Ok(weights),
        }
    }
}

impl LinearBuilder {
    pub fn build(self, input: &Layer) -> Result<Layer, LayerError> {
        let Self {
            name,
            n_units,
            bias,
            weight_init,
            bias_init,
            activation,
            shared_weights,
            transpose_weights,
            share_vars_with,
        } = self;
        let n_in = input.n_units();
        let name = unique_name(name.as_deref().unwrap_or("linear"));

        let op = match share_vars_with {
            Some(layer) => {
                let op = layer.try_op::<Linear>()?;
                Linear {
                    activation,
                    ..op.clone()
                }
            }
            None => {
                let weights = match shared_weights {
                    Some(weights) => weights,
                    None => {
                        let layout = match transpose_weights {
                            true => [n_units, n_in],
                            false => [n_in, n_units],
                        };
                        Variable::with_init(&format!("{name}/weights"), layout, weight_init, true)?
                    }
                };
                let bias = match bias {
                    true => Some(Variable::with_init(
                        &format!("{name}/bias"),
                        [n_units],
                        bias_init,
                        true,
                    )?),
                    false => None,
                };
                Linear {
                    weights,
                    bias,
                    transpose_weights,
                    activation,
                }
            }
        };

        let [rows, cols] = op.weights.layout().try_to_array()?;
        let expected = match op.transpose_weights {
            true => (cols, rows),
            false => (rows, cols),
        };
        if expected != (n_in, n_units) {
            return Err(LayerError::Invalid(format!(
                "weights {} do not map {n_in} to {n_units} units",
                op.weights.layout()
            )));
        }

        let shape = Shape::with_units(input.shape(), n_units);
        Ok(Layer::new(name, op, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for Linear {
    fn kind(&self) -> &'static str {
        "linear"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let kernel = self.kernel()?;
        let n_in = kernel.shape()[0];
        let y = match x {
            Value::Dense(x) if x.dim() == 1 => x.expand_dims(0)?.matmul(&kernel)?,
            Value::Dense(x) => x.matmul(&kernel)?,
            Value::Sparse(x) => x.matmul(&kernel)?,
            Value::Indices(ids) => one_hot(ids, n_in)?.matmul(&kernel)?,
        };
        let y = match &self.bias {
            Some(bias) => y.try_add(&bias.value())?,
            None => y,
        };
        Ok(Value::Dense(self.activation.apply(&y)?))
    }

    fn variables(&self) -> Vec<Variable> {
        [Some(self.weights.clone()), self.bias.clone()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Adds a learned bias over the last axis.
#[derive(Debug, Clone)]
pub struct Bias {
    pub bias: Variable,
}

impl Bias {
    pub fn build(input: &Layer, init: Init) -> Result<Layer, LayerError> {
        let name = unique_name("bias");
        let n_units = input.n_units();
        let bias = Variable::with_init(&format!("{name}/bias"), [n_units], init, true)?;
        let shape = input.shape().clone();
        Ok(Layer::new(name, Bias { bias }, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for Bias {
    fn kind(&self) -> &'static str {
        "bias"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        Ok(Value::Dense(x.dense()?.try_add(&self.bias.value())?))
    }

    fn variables(&self) -> Vec<Variable> {
        vec![self.bias.clone()]
    }
}

/// # Embedding Lookup (`lookup`)
/// Maps sequences of ids to sequences of embedding vectors.
///
/// ## Inputs
/// * Index (or integral dense) ids `[batch, seq_size]`, or `[seq_size]` for a single sequence.
/// * Sparse rows `[rows, vocab]`: each row is a weighted sum of embeddings. Rows are grouped
///   into sequences of `seq_size`, the last one padded with zero rows.
///
/// ## Output
/// * `[batch, seq_size, dim]`, `[batch, seq_size * dim]` with `as_concat`,
///   or `[seq_size, batch, dim]` with `as_seq`.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub embeddings: Variable,
    pub bias: Option<Variable>,
    pub seq_size: usize,
    pub batch_size: Option<usize>,
    pub batch_padding: bool,
    pub as_concat: bool,
    pub as_seq: bool,
}

#[derive(Debug, Clone)]
pub struct LookupBuilder {
    pub name: Option<String>,
    pub seq_size: usize,
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub weight_init: Init,
    pub shared_embeddings: Option<Variable>,
    pub bias: bool,
    /// Pads the batch with zero sequences up to `batch_size` if `batch_padding` is set.
    pub batch_size: Option<usize>,
    pub batch_padding: bool,
    pub as_concat: bool,
    pub as_seq: bool,
}

impl_setters!(LookupBuilder {
    weight_init: Init,
    shared_embeddings: Option<Variable>,
    bias: bool,
    batch_size: Option<usize>,
    batch_padding: bool,
    as_concat: bool,
    as_seq: bool,
});

impl Lookup {
    pub fn builder(seq_size: usize, vocab_size: usize, embedding_dim: usize) -> LookupBuilder {
        LookupBuilder {
            name: None,
            seq_size,
            vocab_size,
            embedding_dim,
            weight_init: Init::RandomUniform {
                min: -1.0,
                max: 1.0,
            },
            shared_embeddings: None,
            bias: false,
            batch_size: None,
            batch_padding: false,
            as_concat: false,
            as_seq: false,
        }
    }
}

impl LookupBuilder {
    pub fn build(self, input: &Layer) -> Result<Layer, LayerError> {
        let Self {
            name,
            seq_size,
            vocab_size,
            embedding_dim,
            weight_init,
            shared_embeddings,
            bias,
            batch_size,
            batch_padding,
            as_concat,
            as_seq,
        } = self;
        if as_concat && as_seq {
            return Err(LayerError::Invalid(
                "lookup can not be both as_concat and as_seq".into(),
            ));
        }
        let name = unique_name(name.as_deref().unwrap_or("lookup"));

        let embeddings = match shared_embeddings {
            Some(embeddings) => embeddings,
            None => Variable::with_init(
                &format!("{name}/embeddings"),
                [vocab_size, embedding_dim],
                weight_init,
                true,
            )?,
        };
        let [_, dim] = embeddings.layout().try_to_array()?;
        let bias = match bias {
            true => Some(Variable::with_init(&format!("{name}/bias"), [dim], Init::Zeros, true)?),
            false => None,
        };

        let batch = batch_size.filter(|_| batch_padding);
        let (n_units, shape) = match (as_concat, as_seq) {
            (true, _) => (seq_size * dim, Shape::from([batch, Some(seq_size * dim)])),
            (_, true) => (dim, Shape::from([Some(seq_size), batch, Some(dim)])),
            _ => (dim, Shape::from([batch, Some(seq_size), Some(dim)])),
        };
        let op = Lookup {
            embeddings,
            bias,
            seq_size,
            batch_size,
            batch_padding,
            as_concat,
            as_seq,
        };
        Ok(Layer::new(name, op, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for Lookup {
    fn kind(&self) -> &'static str {
        "lookup"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let embeddings = self.embeddings.value();
        let [_, dim] = embeddings.layout().try_to_array()?;
        let seq_size = self.seq_size.max(1);

        let ids = match x {
            Value::Indices(ids) => Some(ids.clone()),
            Value::Dense(x) => Some(x.to_indices()?),
            Value::Sparse(_) => None,
        };
        let output = match (ids, x) {
            (Some(ids), _) => {
                let layout = ids.layout();
                if layout.last() != seq_size {
                    return Err(LayerError::Shape(seq_size, layout));
                }
                let ids = ids.reshape([layout.size() / seq_size, seq_size])?;
                embeddings.index_select(&ids)?
            }
            (None, Value::Sparse(sp)) => {
                let rows = sp.matmul(&embeddings)?;
                let n = rows.shape()[0];
                let padding = (seq_size - n % seq_size) % seq_size;
                let rows = rows.pad(0, 0, padding)?;
                rows.reshape([(n + padding) / seq_size, seq_size, dim])?
            }
            (None, _) => return Err(LayerError::Value("indices", x.kind())),
        };

        let output = match &self.bias {
            Some(bias) => output.try_add(&bias.value())?,
            None => output,
        };
        let batch = output.shape()[0];
        let output = match (self.batch_size, self.batch_padding) {
            (Some(size), true) if batch < size => output.pad(0, 0, size - batch)?,
            _ => output,
        };
        let batch = output.shape()[0];

        let output = match (self.as_concat, self.as_seq) {
            (true, _) => output.reshape([batch, seq_size * dim])?,
            (_, true) => output.permute(&[1, 0, 2])?,
            _ => output,
        };
        Ok(Value::Dense(output))
    }

    fn variables(&self) -> Vec<Variable> {
        [Some(self.embeddings.clone()), self.bias.clone()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;

    use super::{Linear, Lookup};
    use crate::{
        layers::{Constant, Input, Value},
        loom::{
            sparse::SparseTensor,
            tensor::Indices,
        },
        random,
    };

    #[test]
    fn test_linear_inputs() -> Result<(), Box<dyn Error>> {
        let ids = Indices::from_rows(&[[0, 2], [1, 3]])?;
        let sp = SparseTensor::one_hot(&ids, 4)?;
        let dense = sp.to_dense();

        let x_dense = Input::builder(4).value(dense).build()?;
        let x_sparse = Input::builder(4).sparse(true).value(sp).build()?;
        let x_ids = Input::builder(4).n_active(Some(2)).value(ids.clone()).build()?;

        let linear = Linear::builder(3).build(&x_dense)?;
        let y_dense = linear.compute()?.dense()?;
        let y_sparse = linear.reuse_with(&[x_sparse])?.compute()?.dense()?;
        let y_ids = linear.reuse_with(&[x_ids])?.compute()?.dense()?;
        assert_abs_diff_eq!(y_dense.data(), y_sparse.data(), epsilon = 1e-6);
        assert_abs_diff_eq!(y_dense.data(), y_ids.data(), epsilon = 1e-6);

        let raw = Constant::build(ids)?;
        let y_raw = linear.reuse_with(&[raw])?.compute()?.dense()?;
        assert_abs_diff_eq!(y_dense.data(), y_raw.data(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_linear_reuse() -> Result<(), Box<dyn Error>> {
        random::seed(11);
        let data = random::uniform([2, 4], -1.0, 1.0);
        let x = Input::builder(4).value(data.clone()).build()?;
        let neg = Input::builder(4).value(data.neg()).build()?;

        let linear = Linear::builder(3).bias(false).build(&x)?;
        let reused = linear.reuse_with(&[neg])?;
        assert_eq!(linear.variables(), reused.variables());

        let y = linear.compute()?.dense()?;
        let y_neg = reused.compute()?.dense()?;
        assert_abs_diff_eq!(y.neg().data(), y_neg.data(), epsilon = 1e-6);

        let shared = Linear::builder(3)
            .share_vars_with(Some(linear.clone()))
            .build(&x)?;
        assert_eq!(shared.compute()?.dense()?, y);

        let weights = linear.try_op::<Linear>()?.weights.clone();
        let transposed = Linear::builder(4)
            .bias(false)
            .shared_weights(Some(weights))
            .transpose_weights(true)
            .build(&linear)?;
        assert_eq!(transposed.compute()?.shape(), &[2, 4]);

        assert!(Linear::builder(5).share_vars_with(Some(linear.clone())).build(&x).is_err());
        Ok(())
    }

    #[test]
    fn test_lookup_shapes() -> Result<(), Box<dyn Error>> {
        let ids = Indices::from_rows(&[[0, 1, 2], [3, 4, 5]])?;
        let x = Input::builder(3).value(Value::Indices(ids)).build()?;

        let lookup = Lookup::builder(3, 10, 4).build(&x)?;
        assert_eq!(lookup.compute()?.shape(), &[2, 3, 4]);

        let concat = Lookup::builder(3, 10, 4).as_concat(true).build(&x)?;
        assert_eq!(concat.n_units(), 12);
        assert_eq!(concat.compute()?.shape(), &[2, 12]);

        let seq = Lookup::builder(3, 10, 4).as_seq(true).build(&x)?;
        assert_eq!(seq.compute()?.shape(), &[3, 2, 4]);

        let padded = Lookup::builder(3, 10, 4)
            .batch_size(Some(4))
            .batch_padding(true)
            .build(&x)?;
        let value = padded.compute()?.dense()?;
        assert_eq!(value.shape(), &[4, 3, 4]);
        assert!(value.data()[24..].iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn test_lookup_sparse() -> Result<(), Box<dyn Error>> {
        let ids = Indices::from_rows(&[[0, 1, 2], [3, 4, 5]])?;
        let x = Input::builder(3).value(Value::Indices(ids)).build()?;
        let lookup = Lookup::builder(3, 10, 4).build(&x)?;
        let expected = lookup.compute()?.dense()?;

        // one row per id, grouped back into sequences of 3
        let rows = Indices::create([6, 1], vec![0, 1, 2, 3, 4, 5])?;
        let sp = SparseTensor::one_hot(&rows, 10)?;
        let sparse = Input::builder(10).sparse(true).value(sp).build()?;
        let reused = lookup.reuse_with(&[sparse])?;
        assert_abs_diff_eq!(reused.compute()?.dense()?.data(), expected.data(), epsilon = 1e-6);

        // an incomplete sequence is padded
        let rows = Indices::create([4, 1], vec![0, 1, 2, 3])?;
        let sp = SparseTensor::one_hot(&rows, 10)?;
        let partial = Input::builder(10).sparse(true).value(sp).build()?;
        let value = lookup.reuse_with(&[partial])?.compute()?.dense()?;
        assert_eq!(value.shape(), &[2, 3, 4]);
        assert!(value.data()[16..].iter().all(|&x| x == 0.0));
        Ok(())
    }
}
