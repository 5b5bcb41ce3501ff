use super::{Layer, LayerError, LayerOp, Shape, Value, check_arity, impl_setters, unique_name};
use crate::{
    init::Init,
    loom::{tensor::Tensor, variable::Variable},
};

/// Added to the scores of masked positions.
const MASK_VALUE: f32 = -1e9;

/// # Multi-Head Attention (`mh_attention`)
/// Scaled dot-product attention over `n_heads` heads.
///
/// ## Inputs
/// * `query` - `[batch, t_q, n_q]`.
/// * `key` - `[batch, t_k, n_k]`.
/// * `value` - `[batch, t_k, n_v]`.
///
/// ## Output
/// * `[batch, t_q, n_units]`: the heads, each `n_units / n_heads` wide, concatenated.
///
/// With `causal`, step `i` only attends to keys `j <= i`.
#[derive(Debug, Clone)]
pub struct MHAttention {
    pub query_weights: Variable,
    pub key_weights: Variable,
    pub value_weights: Variable,
    pub n_heads: usize,
    pub causal: bool,
    pub sparsemax: bool,
}

#[derive(Debug, Clone)]
pub struct MHAttentionBuilder {
    pub name: Option<String>,
    pub n_units: usize,
    pub n_heads: usize,
    pub causal: bool,
    /// Normalizes the scores with sparsemax instead of softmax.
    pub sparsemax: bool,
    pub weight_init: Init,
    pub share_vars_with: Option<Layer>,
}

impl_setters!(MHAttentionBuilder {
    causal: bool,
    sparsemax: bool,
    weight_init: Init,
    share_vars_with: Option<Layer>,
});

impl MHAttention {
    pub fn builder(n_units: usize, n_heads: usize) -> MHAttentionBuilder {
        MHAttentionBuilder {
            name: None,
            n_units,
            n_heads,
            causal: false,
            sparsemax: false,
            weight_init: Init::GlorotUniform,
            share_vars_with: None,
        }
    }

    /// Projects `[b, t, n_in]` and splits the heads: `[b, n_heads, t, head_dim]`.
    fn heads(&self, x: &Tensor, weights: &Variable) -> Result<Tensor, LayerError> {
        let [batch, time, _] = x.layout().try_to_array()?;
        let projected = x.matmul(&weights.value())?;
        let n_units = projected.layout().last();
        let head_dim = n_units / self.n_heads;
        let heads = projected.reshape([batch, time, self.n_heads, head_dim])?;
        Ok(heads.permute(&[0, 2, 1, 3])?)
    }

    /// `[t_q, t_k]` mask with [`MASK_VALUE`] above the diagonal.
    fn causal_mask(t_q: usize, t_k: usize) -> Result<Tensor, LayerError> {
        let data = itertools::iproduct!(0..t_q, 0..t_k)
            .map(|(i, j)| if j > i { MASK_VALUE } else { 0.0 })
            .collect::<Vec<_>>();
        Ok(Tensor::create([t_q, t_k], data)?)
    }
}

impl MHAttentionBuilder {
    pub fn build(self, query: &Layer, key: &Layer, value: &Layer) -> Result<Layer, LayerError> {
        let Self {
            name,
            n_units,
            n_heads,
            causal,
            sparsemax,
            weight_init,
            share_vars_with,
        } = self;
        if n_heads == 0 || n_units % n_heads != 0 {
            return Err(LayerError::Invalid(format!(
                "{n_units} units can not be split into {n_heads} heads"
            )));
        }
        let name = unique_name(name.as_deref().unwrap_or("mh_attention"));

        let op = match share_vars_with {
            Some(layer) => {
                let shared = layer.try_op::<MHAttention>()?;
                MHAttention {
                    n_heads,
                    causal,
                    sparsemax,
                    ..shared.clone()
                }
            }
            None => {
                let projection = |label: &str, n_in: usize| {
                    Variable::with_init(&format!("{name}/{label}"), [n_in, n_units], weight_init, true)
                };
                MHAttention {
                    query_weights: projection("query", query.n_units())?,
                    key_weights: projection("key", key.n_units())?,
                    value_weights: projection("value", value.n_units())?,
                    n_heads,
                    causal,
                    sparsemax,
                }
            }
        };
        for (layer, weights) in [
            (query, &op.query_weights),
            (key, &op.key_weights),
            (value, &op.value_weights),
        ] {
            if weights.layout().shape() != [layer.n_units(), n_units] {
                return Err(LayerError::Invalid(format!(
                    "weights {} do not project {layer} to {n_units} units",
                    weights.layout()
                )));
            }
        }

        let shape = Shape::with_units(query.shape(), n_units);
        let inputs = [query.clone(), key.clone(), value.clone()];
        Ok(Layer::new(name, op, n_units, shape, &inputs))
    }
}

impl LayerOp for MHAttention {
    fn kind(&self) -> &'static str {
        "mh_attention"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [query, key, value] = check_arity(self.kind(), inputs)?;
        let (query, key, value) = (query.dense()?, key.dense()?, value.dense()?);
        let [batch, t_q, _] = query.layout().try_to_array()?;
        let [_, t_k, _] = key.layout().try_to_array()?;

        let q = self.heads(&query, &self.query_weights)?;
        let k = self.heads(&key, &self.key_weights)?;
        let v = self.heads(&value, &self.value_weights)?;
        let head_dim = q.layout().last();

        let scores = q.matmul(&k.transpose()?)?.mul_scalar(1.0 / (head_dim as f32).sqrt());
        let scores = match self.causal {
            true => scores.try_add(&Self::causal_mask(t_q, t_k)?)?,
            false => scores,
        };
        let weights = match self.sparsemax {
            true => scores.sparsemax(),
            false => scores.softmax(),
        };

        let output = weights.matmul(&v)?.permute(&[0, 2, 1, 3])?;
        let n_units = self.n_heads * head_dim;
        Ok(Value::Dense(output.reshape([batch, t_q, n_units])?))
    }

    fn variables(&self) -> Vec<Variable> {
        vec![
            self.query_weights.clone(),
            self.key_weights.clone(),
            self.value_weights.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;

    use super::MHAttention;
    use crate::{layers::Constant, random};

    #[test]
    fn test_attention_shape() -> Result<(), Box<dyn Error>> {
        random::seed(23);
        let query = Constant::build(random::uniform([2, 3, 4], -1.0, 1.0))?;
        let memory = Constant::build(random::uniform([2, 5, 6], -1.0, 1.0))?;

        let attention = MHAttention::builder(8, 2).build(&query, &memory, &memory)?;
        assert_eq!(attention.n_units(), 8);
        assert_eq!(attention.compute()?.shape(), &[2, 3, 8]);
        assert_eq!(attention.variables().len(), 3);

        let sparse = MHAttention::builder(8, 2)
            .sparsemax(true)
            .share_vars_with(Some(attention.clone()))
            .build(&query, &memory, &memory)?;
        assert_eq!(sparse.variables(), attention.variables());
        assert_eq!(sparse.compute()?.shape(), &[2, 3, 8]);

        assert!(MHAttention::builder(8, 3).build(&query, &memory, &memory).is_err());
        assert!(
            MHAttention::builder(8, 2)
                .share_vars_with(Some(attention))
                .build(&memory, &memory, &memory)
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_causal_attention() -> Result<(), Box<dyn Error>> {
        random::seed(29);
        let data = random::uniform([1, 4, 4], -1.0, 1.0);
        let x = Constant::build(data.clone())?;
        let attention = MHAttention::builder(4, 2).causal(true).build(&x, &x, &x)?;
        let y = attention.compute()?.dense()?;

        // changing the last step leaves the earlier ones untouched
        let mut changed = data.to_vec();
        changed[12..].iter_mut().for_each(|x| *x += 1.0);
        let x2 = Constant::build(crate::loom::tensor::Tensor::create([1, 4, 4], changed)?)?;
        let y2 = attention.reuse_with(&[x2.clone(), x2.clone(), x2])?.compute()?.dense()?;
        assert_abs_diff_eq!(&y.data()[..12], &y2.data()[..12], epsilon = 1e-6);
        assert!(y.data()[12..] != y2.data()[12..]);
        Ok(())
    }
}
