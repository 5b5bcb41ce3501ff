//! Stochastic layers. Each has a `training` flag: when it is off, the layer is deterministic.
//! Flip it on a copy with [`Layer::reuse_map`](super::Layer::reuse_map).

use itertools::Itertools;
use rustc_hash::FxHashSet as HashSet;

use super::{Layer, LayerError, LayerOp, Value, check_arity, impl_setters, unique_name};
use crate::{
    loom::{layout::Layout, sparse::SparseTensor, tensor::Tensor},
    random,
};

/// # Dropout (`dropout`)
/// Zeroes units with probability `1 - keep_prob` and scales the kept ones by `1 / keep_prob`.
///
/// Sparse inputs have their entries dropped instead, and stay sparse.
/// With `noise_shape`, one mask is drawn for that shape and broadcast over the input.
#[derive(Debug, Clone)]
pub struct Dropout {
    pub keep_prob: f32,
    pub noise_shape: Option<Vec<usize>>,
    pub scale: bool,
    pub training: bool,
}

#[derive(Debug, Clone)]
pub struct DropoutBuilder {
    pub name: Option<String>,
    pub keep_prob: f32,
    pub noise_shape: Option<Vec<usize>>,
    pub scale: bool,
    pub training: bool,
}

impl_setters!(DropoutBuilder {
    keep_prob: f32,
    noise_shape: Option<Vec<usize>>,
    scale: bool,
    training: bool,
});

impl Dropout {
    pub fn builder(keep_prob: f32) -> DropoutBuilder {
        DropoutBuilder {
            name: None,
            keep_prob,
            noise_shape: None,
            scale: true,
            training: true,
        }
    }

    #[inline]
    fn factor(&self) -> f32 {
        match self.scale {
            true => 1.0 / self.keep_prob,
            false => 1.0,
        }
    }
}

impl DropoutBuilder {
    pub fn build(self, input: &Layer) -> Result<Layer, LayerError> {
        let Self {
            name,
            keep_prob,
            noise_shape,
            scale,
            training,
        } = self;
        if !(0.0..=1.0).contains(&keep_prob) || keep_prob == 0.0 {
            return Err(LayerError::Invalid(format!(
                "dropout keep_prob must be in (0, 1], got {keep_prob}"
            )));
        }
        let name = unique_name(name.as_deref().unwrap_or("dropout"));
        let op = Dropout {
            keep_prob,
            noise_shape,
            scale,
            training,
        };
        let shape = input.shape().clone();
        Ok(Layer::new(name, op, input.n_units(), shape, &[input.clone()]))
    }
}

impl LayerOp for Dropout {
    fn kind(&self) -> &'static str {
        "dropout"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        if !self.training || self.keep_prob >= 1.0 {
            return Ok(x.clone());
        }
        match x {
            Value::Sparse(sp) => {
                let keep = (0..sp.nnz())
                    .map(|_| fastrand::f32() < self.keep_prob)
                    .collect_vec();
                let kept = sp.retain(&keep)?;
                let values = kept.values().mul_scalar(self.factor());
                Ok(Value::Sparse(kept.with_values(values)?))
            }
            x => {
                let x = x.dense()?;
                let layout = match &self.noise_shape {
                    Some(shape) => Layout::from_shape(shape.clone()),
                    None => x.layout(),
                };
                let mask = random::bernoulli_mask(layout, self.keep_prob).mul_scalar(self.factor());
                Ok(Value::Dense(x.try_mul(&mask)?))
            }
        }
    }
}

/// # Zone Out (`zoneout`)
/// Keeps each unit of `current` with probability `keep_prob` and takes it from `previous`
/// otherwise. Outside training, the output is the expectation
/// `keep_prob * current + (1 - keep_prob) * previous`.
#[derive(Debug, Clone)]
pub struct ZoneOut {
    pub keep_prob: f32,
    pub training: bool,
}

#[derive(Debug, Clone)]
pub struct ZoneOutBuilder {
    pub name: Option<String>,
    pub keep_prob: f32,
    pub training: bool,
}

impl_setters!(ZoneOutBuilder {
    keep_prob: f32,
    training: bool,
});

impl ZoneOut {
    pub fn builder(keep_prob: f32) -> ZoneOutBuilder {
        ZoneOutBuilder {
            name: None,
            keep_prob,
            training: true,
        }
    }
}

impl ZoneOutBuilder {
    pub fn build(self, current: &Layer, previous: &Layer) -> Result<Layer, LayerError> {
        if current.n_units() != previous.n_units() {
            return Err(LayerError::Invalid(format!(
                "zoneout: {current} has {} units, {previous} has {}",
                current.n_units(),
                previous.n_units()
            )));
        }
        if !(0.0..=1.0).contains(&self.keep_prob) {
            return Err(LayerError::Invalid(format!(
                "zoneout keep_prob must be in [0, 1], got {}",
                self.keep_prob
            )));
        }
        let name = unique_name(self.name.as_deref().unwrap_or("zoneout"));
        let op = ZoneOut {
            keep_prob: self.keep_prob,
            training: self.training,
        };
        let shape = current.shape().clone();
        let inputs = [current.clone(), previous.clone()];
        Ok(Layer::new(name, op, current.n_units(), shape, &inputs))
    }
}

impl LayerOp for ZoneOut {
    fn kind(&self) -> &'static str {
        "zoneout"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [current, previous] = check_arity(self.kind(), inputs)?;
        let (current, previous) = (current.dense()?, previous.dense()?);
        let mask = match self.training {
            true => random::bernoulli_mask(current.layout(), self.keep_prob),
            false => Tensor::full(current.layout(), self.keep_prob),
        };
        let kept = current.try_mul(&mask)?;
        let zoned = previous.try_mul(&mask.complement())?;
        Ok(Value::Dense(kept.try_add(&zoned)?))
    }
}

/// # Gaussian Noise (`gaussian_noise`)
/// Adds `N(mean, std)` noise while training. Sparse inputs are densified.
#[derive(Debug, Clone)]
pub struct GaussianNoise {
    pub mean: f32,
    pub std: f32,
    pub training: bool,
}

impl GaussianNoise {
    pub fn build(input: &Layer, mean: f32, std: f32) -> Result<Layer, LayerError> {
        let name = unique_name("gaussian_noise");
        let op = GaussianNoise {
            mean,
            std,
            training: true,
        };
        let shape = input.shape().clone();
        Ok(Layer::new(name, op, input.n_units(), shape, &[input.clone()]))
    }
}

impl LayerOp for GaussianNoise {
    fn kind(&self) -> &'static str {
        "gaussian_noise"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        let x = x.dense()?;
        match self.training {
            true => {
                let noise = random::normal(x.layout(), self.mean, self.std);
                Ok(Value::Dense(x.try_add(&noise)?))
            }
            false => Ok(Value::Dense(x)),
        }
    }
}

/// # Salt and Pepper Noise (`salt_pepper_noise`)
/// Overwrites `round(amount * n_units)` units of each row (rounded down to an even count),
/// half with `max_value` and half with `min_value`.
///
/// Sparse inputs stay sparse: their entries at noisy positions are replaced.
#[derive(Debug, Clone)]
pub struct SaltPepperNoise {
    pub amount: f32,
    pub max_value: f32,
    pub min_value: f32,
    pub training: bool,
}

impl SaltPepperNoise {
    pub fn build(
        input: &Layer,
        amount: f32,
        max_value: f32,
        min_value: f32,
    ) -> Result<Layer, LayerError> {
        if !(0.0..=1.0).contains(&amount) {
            return Err(LayerError::Invalid(format!(
                "salt and pepper amount must be in [0, 1], got {amount}"
            )));
        }
        let name = unique_name("salt_pepper_noise");
        let op = SaltPepperNoise {
            amount,
            max_value,
            min_value,
            training: true,
        };
        let shape = input.shape().clone();
        Ok(Layer::new(name, op, input.n_units(), shape, &[input.clone()]))
    }

    /// Noise over the rows of `layout`, as a `[rows, n_units]` sparse tensor.
    fn noise(&self, layout: &Layout) -> Result<SparseTensor, LayerError> {
        let n = layout.last();
        let rows = layout.size() / n.max(1);
        let noise = random::salt_pepper_noise([rows, n], self.amount, self.max_value, self.min_value)?;
        Ok(noise)
    }
}

impl LayerOp for SaltPepperNoise {
    fn kind(&self) -> &'static str {
        "salt_pepper_noise"
    }

    fn compute(&self, inputs: &[Value]) -> Result<Value, LayerError> {
        let [x] = check_arity(self.kind(), inputs)?;
        if !self.training {
            return Ok(x.clone());
        }
        match x {
            Value::Sparse(sp) if sp.rank() == 2 => {
                let noise = self.noise(&sp.layout())?;
                let noisy: HashSet<_> = noise.offsets().into_iter().collect();
                let keep = sp
                    .offsets()
                    .iter()
                    .map(|offset| !noisy.contains(offset))
                    .collect_vec();
                let kept = sp.retain(&keep)?;
                let indices = [kept.indices(), noise.indices()].concat();
                let values = Tensor::concat(&[kept.values().clone(), noise.values().clone()], 0)?;
                Ok(Value::Sparse(SparseTensor::new(indices, values, sp.layout())?))
            }
            x => {
                let x = x.dense()?;
                let layout = x.layout();
                let noise = self.noise(&layout)?;
                let positions = noise.with_values(Tensor::ones([noise.nnz()]))?;
                let keep = positions.to_dense().complement().reshape(&layout)?;
                let values = noise.to_dense().reshape(&layout)?;
                Ok(Value::Dense(x.try_mul(&keep)?.try_add(&values)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use itertools::Itertools;

    use super::{Dropout, GaussianNoise, SaltPepperNoise, ZoneOut};
    use crate::{
        layers::{Constant, Input, Value},
        loom::{
            sparse::SparseTensor,
            tensor::{Indices, Tensor},
        },
        random,
    };

    #[test]
    fn test_dropout_dense() -> Result<(), Box<dyn Error>> {
        random::seed(3);
        let (dim, keep_prob, iterations) = (100, 0.5, 50);
        let x = Input::builder(dim).value(Tensor::ones([1, dim])).build()?;
        let dropout = Dropout::builder(keep_prob).build(&x)?;

        let mut count = 0;
        for _ in 0..iterations {
            let y = dropout.compute()?.dense()?;
            let kept = y.data().iter().filter(|&&x| x != 0.0).collect_vec();
            assert!(kept.iter().all(|&&x| x == 1.0 / keep_prob));
            count += kept.len();
        }
        let expected = dim as f32 * keep_prob * iterations as f32;
        assert!((count as f32 - expected).abs() / expected < 0.1);

        let identity = Dropout::builder(1.0).build(&x)?;
        assert_eq!(identity.compute()?.dense()?, Tensor::ones([1, dim]));

        let inference = dropout.reuse_map::<Dropout>(&[x.clone()], |op| op.training = false)?;
        assert_eq!(inference.compute()?.dense()?, Tensor::ones([1, dim]));

        assert!(Dropout::builder(0.0).build(&x).is_err());
        Ok(())
    }

    #[test]
    fn test_dropout_sparse() -> Result<(), Box<dyn Error>> {
        random::seed(5);
        let ids = Indices::from_rows(&[[0, 1]])?;
        let x = Input::builder(100)
            .n_active(Some(2))
            .value(ids.clone())
            .build()?;

        let dropout = Dropout::builder(0.5).build(&x)?;
        let Value::Sparse(y) = dropout.compute()? else {
            return Err("dropout of a sparse input is sparse".into());
        };
        assert!(y.nnz() <= 2);
        assert!(y.values().data().iter().all(|&x| x == 2.0));

        let identity = Dropout::builder(1.0).build(&x)?;
        let sp = SparseTensor::one_hot(&ids, 100)?;
        assert_eq!(identity.compute()?, Value::Sparse(sp));
        Ok(())
    }

    #[test]
    fn test_dropout_noise_shape() -> Result<(), Box<dyn Error>> {
        random::seed(9);
        let x = Constant::build(Tensor::ones([2, 3, 4]))?;
        let dropout = Dropout::builder(0.5)
            .noise_shape(Some(vec![2, 1, 4]))
            .build(&x)?;
        let y = dropout.compute()?.dense()?;
        // the mask is shared along the broadcast axis
        for (b, u) in itertools::iproduct!(0..2, 0..4) {
            let column = (0..3).map(|t| y.data()[(b * 3 + t) * 4 + u]).collect_vec();
            assert!(column.iter().all_equal());
        }
        Ok(())
    }

    #[test]
    fn test_zoneout() -> Result<(), Box<dyn Error>> {
        random::seed(13);
        let (batch, dim) = (1000, 100);
        let current = Constant::build(Tensor::ones([batch, dim]))?;
        let previous = Constant::build(Tensor::full([batch, dim], -1.0))?;
        let mean_sum = |keep_prob: f32| -> Result<f32, Box<dyn Error>> {
            let zoneout = ZoneOut::builder(keep_prob).build(&current, &previous)?;
            let y = zoneout.compute()?.dense()?;
            Ok(y.sum(-1, false)?.mean_all()?.item()?)
        };

        assert_relative_eq!(mean_sum(1.0)?, dim as f32);
        assert_relative_eq!(mean_sum(0.0)?, -(dim as f32));
        assert_abs_diff_eq!(mean_sum(0.5)?, 0.0, epsilon = 1.0);
        assert_abs_diff_eq!(mean_sum(0.8)?, 0.6 * dim as f32, epsilon = 1.0);

        let zoneout = ZoneOut::builder(0.8).training(false).build(&current, &previous)?;
        let y = zoneout.compute()?.dense()?;
        assert!(y.data().iter().all(|&x| (x - 0.6).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_gaussian_noise() -> Result<(), Box<dyn Error>> {
        random::seed(17);
        let dim = 1000;
        let x = Input::builder(dim).value(Tensor::ones([1, dim])).build()?;
        let noise = GaussianNoise::build(&x, 0.0, 0.2)?;
        let mean = noise.compute()?.dense()?.mean_all()?.item()?;
        assert_abs_diff_eq!(mean, 1.0, epsilon = 0.1);

        let ids = Indices::from_rows(&[(0..10).collect_vec()])?;
        let x = Input::builder(dim).n_active(Some(10)).value(ids).build()?;
        let noise = GaussianNoise::build(&x, 0.0, 0.2)?;
        let y = noise.compute()?.dense()?;
        assert_eq!(y.shape(), &[1, dim]);
        assert_abs_diff_eq!(y.mean_all()?.item()?, 0.01, epsilon = 0.1);
        Ok(())
    }

    #[test]
    fn test_salt_pepper() -> Result<(), Box<dyn Error>> {
        random::seed(19);
        let (batch, dim) = (4, 100);
        let x = Input::builder(dim).value(Tensor::zeros([batch, dim])).build()?;
        let noise = SaltPepperNoise::build(&x, 0.5, 1.0, -1.0)?;
        let y = noise.compute()?.dense()?;
        assert_eq!(y.mean_all()?.item()?, 0.0);
        assert_eq!(y.data().iter().filter(|&&x| x != 0.0).count(), batch * 50);

        let ids = Indices::from_rows(&[[0, 1], [2, 3]])?;
        let x = Input::builder(dim).n_active(Some(2)).value(ids).build()?;
        let noise = SaltPepperNoise::build(&x, 0.1, 1.0, -1.0)?;
        let Value::Sparse(y) = noise.compute()? else {
            return Err("salt and pepper noise of a sparse input is sparse".into());
        };
        let dense = y.to_dense();
        for row in dense.rows() {
            let salt = row.iter().filter(|&&x| x == 1.0).count();
            let pepper = row.iter().filter(|&&x| x == -1.0).count();
            assert!(pepper == 5 && (5..=7).contains(&salt));
        }
        Ok(())
    }
}
