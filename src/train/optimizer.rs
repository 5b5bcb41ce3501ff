//! Gradient-based optimizers.
//!
//! Every optimizer reads its learning rate from a [`Param`], so that callbacks can change it
//! between steps, and keeps its slot state per variable id.

use std::fmt;

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use crate::{
    layers::Param,
    loom::{
        tensor::{Tensor, TensorError},
        variable::{Variable, VariableId},
    },
};

/// Applies gradients to variables.
pub trait Optimizer: fmt::Debug + Send + Sync {
    /// Tunable hyper-parameters, exposed as model properties.
    fn params(&self) -> Vec<Param>;

    /// Updates `variable` given its gradient.
    fn apply(&mut self, variable: &Variable, grad: &Tensor) -> Result<(), TensorError>;
}

/// Builds a tensor with the layout of `like` from element-wise results.
#[inline]
fn map_like(like: &Tensor, data: Vec<f32>) -> Result<Tensor, TensorError> {
    Tensor::create(like.layout(), data)
}

/// Slot state of one variable: `N` zeroed tensors, created on first use.
fn slots<'a, const N: usize>(
    slots: &'a mut HashMap<VariableId, [Tensor; N]>,
    variable: &Variable,
    grad: &Tensor,
) -> &'a mut [Tensor; N] {
    slots
        .entry(variable.id())
        .or_insert_with(|| std::array::from_fn(|_| grad.zeros_like()))
}

/// # Stochastic Gradient Descent (`sgd`)
/// With `momentum > 0` keeps a velocity `v = momentum * v - lr * g` per variable.
/// Nesterov momentum updates with `momentum * v - lr * g` instead of `v`.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: Param,
    pub momentum: f32,
    pub nesterov: bool,
    slots: HashMap<VariableId, [Tensor; 1]>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self {
            lr: Param::new("lr", lr),
            momentum: 0.0,
            nesterov: false,
            slots: Default::default(),
        }
    }

    #[inline]
    pub fn with_momentum(self, momentum: f32, nesterov: bool) -> Self {
        Self {
            momentum,
            nesterov,
            ..self
        }
    }
}

impl Optimizer for Sgd {
    fn params(&self) -> Vec<Param> {
        vec![self.lr.clone()]
    }

    fn apply(&mut self, variable: &Variable, grad: &Tensor) -> Result<(), TensorError> {
        let lr = self.lr.get();
        if self.momentum == 0.0 {
            return variable.assign_sub(&grad.mul_scalar(lr));
        }

        let (momentum, nesterov) = (self.momentum, self.nesterov);
        let [velocity] = slots(&mut self.slots, variable, grad);
        let updated = velocity
            .data()
            .iter()
            .zip_eq(grad.data())
            .map(|(v, g)| momentum * v - lr * g)
            .collect_vec();
        let delta = match nesterov {
            true => updated
                .iter()
                .zip_eq(grad.data())
                .map(|(v, g)| -(momentum * v - lr * g))
                .collect_vec(),
            false => updated.iter().map(|v| -v).collect_vec(),
        };
        *velocity = map_like(grad, updated)?;
        variable.assign_sub(&map_like(grad, delta)?)
    }
}

/// # Adam (`adam`)
/// Adaptive moment estimation with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: Param,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    slots: HashMap<VariableId, [Tensor; 2]>,
    steps: HashMap<VariableId, i32>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr: Param::new("lr", lr),
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            slots: Default::default(),
            steps: Default::default(),
        }
    }

    #[inline]
    pub fn with_betas(self, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            ..self
        }
    }
}

impl Optimizer for Adam {
    fn params(&self) -> Vec<Param> {
        vec![self.lr.clone()]
    }

    fn apply(&mut self, variable: &Variable, grad: &Tensor) -> Result<(), TensorError> {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let lr = self.lr.get();

        let step = self.steps.entry(variable.id()).or_default();
        *step += 1;
        let correction1 = 1.0 - beta1.powi(*step);
        let correction2 = 1.0 - beta2.powi(*step);

        let [m, v] = slots(&mut self.slots, variable, grad);
        let (m_data, v_data): (Vec<f32>, Vec<f32>) =
            itertools::multizip((m.data(), v.data(), grad.data()))
                .map(|(m, v, g)| {
                    let m = beta1 * m + (1.0 - beta1) * g;
                    let v = beta2 * v + (1.0 - beta2) * g * g;
                    (m, v)
                })
                .unzip();
        let delta = m_data
            .iter()
            .zip_eq(&v_data)
            .map(|(m, v)| lr * (m / correction1) / ((v / correction2).sqrt() + epsilon))
            .collect_vec();

        *m = map_like(grad, m_data)?;
        *v = map_like(grad, v_data)?;
        variable.assign_sub(&map_like(grad, delta)?)
    }
}

/// # Adadelta (`adadelta`)
/// Scales updates by the ratio of running averages of squared updates and squared gradients.
#[derive(Debug, Clone)]
pub struct Adadelta {
    pub lr: Param,
    pub rho: f32,
    pub epsilon: f32,
    slots: HashMap<VariableId, [Tensor; 2]>,
}

impl Adadelta {
    pub fn new(lr: f32) -> Self {
        Self {
            lr: Param::new("lr", lr),
            rho: 0.95,
            epsilon: 1e-6,
            slots: Default::default(),
        }
    }

    #[inline]
    pub fn with_rho(self, rho: f32, epsilon: f32) -> Self {
        Self {
            rho,
            epsilon,
            ..self
        }
    }
}

impl Optimizer for Adadelta {
    fn params(&self) -> Vec<Param> {
        vec![self.lr.clone()]
    }

    fn apply(&mut self, variable: &Variable, grad: &Tensor) -> Result<(), TensorError> {
        let (rho, epsilon) = (self.rho, self.epsilon);
        let lr = self.lr.get();

        let [accum, accum_update] = slots(&mut self.slots, variable, grad);
        let mut accum_data = Vec::with_capacity(grad.size());
        let mut update_data = Vec::with_capacity(grad.size());
        let mut delta = Vec::with_capacity(grad.size());
        for (a, u, g) in itertools::multizip((accum.data(), accum_update.data(), grad.data())) {
            let a = rho * a + (1.0 - rho) * g * g;
            let update = (u + epsilon).sqrt() / (a + epsilon).sqrt() * g;
            accum_data.push(a);
            update_data.push(rho * u + (1.0 - rho) * update * update);
            delta.push(lr * update);
        }

        *accum = map_like(grad, accum_data)?;
        *accum_update = map_like(grad, update_data)?;
        variable.assign_sub(&map_like(grad, delta)?)
    }
}

/// # RMSProp (`rms_prop`)
/// Divides the gradient by a running root mean square of recent gradients.
#[derive(Debug, Clone)]
pub struct RmsProp {
    pub lr: Param,
    pub rho: f32,
    pub epsilon: f32,
    slots: HashMap<VariableId, [Tensor; 1]>,
}

impl RmsProp {
    pub fn new(lr: f32) -> Self {
        Self {
            lr: Param::new("lr", lr),
            rho: 0.9,
            epsilon: 1e-7,
            slots: Default::default(),
        }
    }

    #[inline]
    pub fn with_rho(self, rho: f32, epsilon: f32) -> Self {
        Self {
            rho,
            epsilon,
            ..self
        }
    }
}

impl Optimizer for RmsProp {
    fn params(&self) -> Vec<Param> {
        vec![self.lr.clone()]
    }

    fn apply(&mut self, variable: &Variable, grad: &Tensor) -> Result<(), TensorError> {
        let (rho, epsilon) = (self.rho, self.epsilon);
        let lr = self.lr.get();

        let [mean_square] = slots(&mut self.slots, variable, grad);
        let (ms_data, delta): (Vec<f32>, Vec<f32>) = mean_square
            .data()
            .iter()
            .zip_eq(grad.data())
            .map(|(ms, g)| {
                let ms = rho * ms + (1.0 - rho) * g * g;
                (ms, lr * g / (ms.sqrt() + epsilon))
            })
            .unzip();

        *mean_square = map_like(grad, ms_data)?;
        variable.assign_sub(&map_like(grad, delta)?)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;

    use super::{Adadelta, Adam, Optimizer, RmsProp, Sgd};
    use crate::loom::{tensor::Tensor, variable::Variable};

    /// Minimizes `sum((w - 3)^2)` and returns the final weights.
    fn minimize(optimizer: &mut dyn Optimizer, steps: usize) -> Result<Vec<f32>, Box<dyn Error>> {
        let w = Variable::new("w", Tensor::zeros([2]));
        for _ in 0..steps {
            let loss = w.value().add_scalar(-3.0).square().sum_all()?;
            let grads = loss.backward()?;
            let grad = grads.get(&w).ok_or("missing gradient")?;
            optimizer.apply(&w, grad)?;
        }
        Ok(w.value().to_vec())
    }

    #[test]
    fn test_sgd() -> Result<(), Box<dyn Error>> {
        // one step from 0 with lr 0.25: w = 0 - 0.25 * 2 * (0 - 3) = 1.5
        let w = minimize(&mut Sgd::new(0.25), 1)?;
        assert_abs_diff_eq!(&w[..], &[1.5, 1.5][..], epsilon = 1e-6);

        let w = minimize(&mut Sgd::new(0.1), 100)?;
        assert_abs_diff_eq!(&w[..], &[3.0, 3.0][..], epsilon = 1e-3);

        for nesterov in [false, true] {
            let mut sgd = Sgd::new(0.05).with_momentum(0.9, nesterov);
            let w = minimize(&mut sgd, 200)?;
            assert_abs_diff_eq!(&w[..], &[3.0, 3.0][..], epsilon = 1e-2);
        }
        Ok(())
    }

    #[test]
    fn test_adaptive() -> Result<(), Box<dyn Error>> {
        let mut adam = Adam::new(0.1);
        let w = minimize(&mut adam, 500)?;
        assert_abs_diff_eq!(&w[..], &[3.0, 3.0][..], epsilon = 5e-2);

        let mut rms = RmsProp::new(0.01);
        let w = minimize(&mut rms, 1000)?;
        assert_abs_diff_eq!(&w[..], &[3.0, 3.0][..], epsilon = 5e-2);

        // adadelta starts slowly but moves towards the minimum
        let mut adadelta = Adadelta::new(1.0);
        let w = minimize(&mut adadelta, 50)?;
        assert!(w.iter().all(|&w| w > 0.0 && w < 3.0));
        Ok(())
    }

    #[test]
    fn test_lr_param() -> Result<(), Box<dyn Error>> {
        let mut sgd = Sgd::new(0.25);
        let params = sgd.params();
        assert_eq!(params[0].name(), "lr");
        params[0].set(0.0);
        let w = minimize(&mut sgd, 5)?;
        assert_eq!(w, vec![0.0, 0.0]);
        Ok(())
    }
}
