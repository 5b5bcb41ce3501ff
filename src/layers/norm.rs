use super::{Layer, LayerError, LayerOp, Value, check_arity, impl_setters, unique_name};
use crate::{
    init::Init,
    loom::{tensor::Tensor, variable::Variable},
};

/// Mean and (biased) variance of `x` over every axis but the last.
fn moments(x: &Tensor) -> Result<(Tensor, Tensor), LayerError> {
    let n = x.layout().last();
    let rows = x.reshape([x.size() / n.max(1), n])?;
    let mean = rows.mean(0, false)?;
    let variance = rows.try_sub(&mean)?.square().mean(0, false)?;
    Ok((mean, variance))
}

/// # Batch Normalization (`batch_norm`)
/// Normalizes each unit with the moments of the batch while training, and with their moving
/// averages otherwise:
///
/// `y = gamma * (x - mean) / sqrt(variance + epsilon) + beta`
///
/// Every training step updates `moving = decay * moving + (1 - decay) * batch` for the mean
/// and variance. Sparse inputs are densified.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub beta: Option<Variable>,
    pub gamma: Option<Variable>,
    pub moving_mean: Variable,
    pub moving_variance: Variable,
    pub decay: f32,
    pub epsilon: f32,
    pub training: bool,
}

#[derive(Debug, Clone)]
pub struct BatchNormBuilder {
    pub name: Option<String>,
    pub center: bool,
    pub scale: bool,
    pub beta: Option<Variable>,
    pub gamma: Option<Variable>,
    pub beta_init: Init,
    pub gamma_init: Init,
    pub decay: f32,
    pub epsilon: f32,
    pub training: bool,
}

impl_setters!(BatchNormBuilder {
    center: bool,
    scale: bool,
    beta: Option<Variable>,
    gamma: Option<Variable>,
    beta_init: Init,
    gamma_init: Init,
    decay: f32,
    epsilon: f32,
    training: bool,
});

impl BatchNorm {
    pub fn builder() -> BatchNormBuilder {
        BatchNormBuilder {
            name: None,
            center: true,
            scale: true,
            beta: None,
            gamma: None,
            beta_init: Init::Zeros,
            gamma_init: Init::Ones,
            decay: 0.99,
            epsilon: 1e-3,
            training: true,
        }
    }
}

impl BatchNormBuilder {
    pub fn build(self, input: &Layer) -> Result<Layer, LayerError> {
        let Self {
            name,
            center,
            scale,
            beta,
            gamma,
            beta_init,
            gamma_init,
            decay,
            epsilon,
            training,
        } = self;
        let n_units = input.n_units();
        let name = unique_name(name.as_deref().unwrap_or("batch_norm"));

        let param = |given: Option<Variable>,
                     enabled: bool,
                     label: &str,
                     init: Init|
         -> Result<Option<Variable>, LayerError> {
            match (given, enabled) {
                (_, false) => Ok(None),
                (Some(variable), true) if variable.layout().shape() == [n_units] => {
                    Ok(Some(variable))
                }
                (Some(variable), true) => Err(LayerError::Shape(n_units, variable.layout())),
                (None, true) => Ok(Some(Variable::with_init(
                    &format!("{name}/{label}"),
                    [n_units],
                    init,
                    true,
                )?)),
            }
        };
        let beta = param(beta, center, "beta", beta_init)?;
        let gamma = param(gamma, scale, "gamma", gamma_init)?;

        let moving_mean =
            Variable::with_init(&format!("{name}/moving_mean"), [n_units], Init::Zeros, false)?;
        let moving_variance =
            Variable::with_init(&format!("{name}/moving_variance"), [n_units], Init::Ones, false)?;

        let op = BatchNorm {
            beta,
            gamma,
            moving_mean,
            moving_variance,
            decay,
            epsilon,
            training,
        };
        let shape = input.shape().clone();
        Ok(Layer::new(name, op, n_units, shape, &[input.clone()]))
    }
}

impl BatchNorm {
    fn update(&self, moving: &Variable, batch: &Tensor) -> Result<(), LayerError> {
        let updated = moving
            .value()
            .mul_scalar(self.decay)
            .try_add(&batch.detach().mul_scalar(1.0 - self.decay))?;
        moving.assign(updated)?;
        Ok(())
    }
}

impl LayerOp for BatchNorm {
    fn kind(&self) -> &'static str {
        "batch_norm"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let x = x.dense()?;
        let (mean, variance) = match self.training {
            true => {
                let (mean, variance) = moments(&x)?;
                self.update(&self.moving_mean, &mean)?;
                self.update(&self.moving_variance, &variance)?;
                (mean, variance)
            }
            false => (self.moving_mean.value(), self.moving_variance.value()),
        };

        let std = variance.add_scalar(self.epsilon).sqrt();
        let y = x.try_sub(&mean)?.try_div(&std)?;
        let y = match &self.gamma {
            Some(gamma) => y.try_mul(&gamma.value())?,
            None => y,
        };
        let y = match &self.beta {
            Some(beta) => y.try_add(&beta.value())?,
            None => y,
        };
        Ok(Value::Dense(y))
    }

    fn variables(&self) -> Vec<Variable> {
        [
            self.beta.clone(),
            self.gamma.clone(),
            Some(self.moving_mean.clone()),
            Some(self.moving_variance.clone()),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// # Layer Normalization (`layer_norm`)
/// Normalizes the last axis of each sample, then applies a learned gain and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gain: Variable,
    pub bias: Variable,
    pub epsilon: f32,
}

impl LayerNorm {
    pub fn build(input: &Layer, epsilon: f32) -> Result<Layer, LayerError> {
        let name = unique_name("layer_norm");
        let n_units = input.n_units();
        let gain = Variable::with_init(&format!("{name}/gain"), [n_units], Init::Ones, true)?;
        let bias = Variable::with_init(&format!("{name}/bias"), [n_units], Init::Zeros, true)?;
        let op = LayerNorm {
            gain,
            bias,
            epsilon,
        };
        let shape = input.shape().clone();
        Ok(Layer::new(name, op, n_units, shape, &[input.clone()]))
    }
}

impl LayerOp for LayerNorm {
    fn kind(&self) -> &'static str {
        "layer_norm"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let x = x.dense()?;
        let mean = x.mean(-1, true)?;
        let centered = x.try_sub(&mean)?;
        let variance = centered.square().mean(-1, true)?;
        let y = centered.try_div(&variance.add_scalar(self.epsilon).sqrt())?;
        let y = y.try_mul(&self.gain.value())?.try_add(&self.bias.value())?;
        Ok(Value::Dense(y))
    }

    fn variables(&self) -> Vec<Variable> {
        vec![self.gain.clone(), self.bias.clone()]
    }
}
