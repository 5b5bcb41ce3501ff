//! Loss functions.
//!
//! Every loss returns one value per example: the last axis is reduced and the
//! leading (batch) axes are kept. Reducing over the batch is up to the caller.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::loom::{
    sparse::SparseTensor,
    tensor::{Indices, Tensor, TensorError},
};

/// Selects one of the dense `(labels, logits)` losses by name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    #[default]
    #[display("mse")]
    Mse,
    #[display("binary_cross_entropy")]
    BinaryCrossEntropy,
    #[display("categorical_cross_entropy")]
    CategoricalCrossEntropy,
    #[display("binary_hinge")]
    BinaryHinge,
    #[display("kl_divergence")]
    KlDivergence,
    #[display("sparsemax_loss")]
    Sparsemax,
}

impl Loss {
    pub fn apply(&self, labels: &Tensor, logits: &Tensor) -> Result<Tensor, TensorError> {
        match self {
            Loss::Mse => mse(labels, logits),
            Loss::BinaryCrossEntropy => binary_cross_entropy(labels, logits),
            Loss::CategoricalCrossEntropy => categorical_cross_entropy(labels, logits),
            Loss::BinaryHinge => binary_hinge(labels, logits),
            Loss::KlDivergence => kl_divergence(labels, logits),
            Loss::Sparsemax => sparsemax_loss(logits, labels),
        }
    }
}

/// Mean squared error.
pub fn mse(target: &Tensor, predicted: &Tensor) -> Result<Tensor, TensorError> {
    target.try_sub(predicted)?.square().mean(-1, false)
}

/// Sigmoid cross-entropy with logits: `max(x, 0) - x * z + log(1 + exp(-|x|))`.
pub fn binary_cross_entropy(labels: &Tensor, logits: &Tensor) -> Result<Tensor, TensorError> {
    let loss = logits
        .relu()
        .try_sub(&logits.try_mul(labels)?)?
        .try_add(&logits.abs().neg().softplus())?;
    loss.mean(-1, false)
}

/// Log of the softmax over the last axis.
pub fn log_softmax(logits: &Tensor) -> Result<Tensor, TensorError> {
    let max = logits.detach().max(-1, true)?;
    let shifted = logits.try_sub(&max)?;
    let lse = shifted.exp().sum(-1, true)?.log();
    shifted.try_sub(&lse)
}

/// Softmax cross-entropy with logits.
pub fn categorical_cross_entropy(labels: &Tensor, logits: &Tensor) -> Result<Tensor, TensorError> {
    Ok(labels.try_mul(&log_softmax(logits)?)?.sum(-1, false)?.neg())
}

/// Softmax cross-entropy where the labels are class ids, one per example.
pub fn sparse_categorical_cross_entropy(
    ids: &Indices,
    logits: &Tensor,
) -> Result<Tensor, TensorError> {
    let n = logits.layout().last();
    let ids = ids.clone().reshape([ids.layout().size(), 1])?;
    let labels = SparseTensor::one_hot(&ids, n)?.to_dense();
    let labels = labels.reshape(logits.layout())?;
    categorical_cross_entropy(&labels, logits)
}

/// Hinge loss for labels in `{0, 1}`.
pub fn binary_hinge(labels: &Tensor, logits: &Tensor) -> Result<Tensor, TensorError> {
    let signs = labels.mul_scalar(2.0).add_scalar(-1.0);
    let margin = signs.try_mul(logits)?.complement();
    margin.relu().mean(-1, false)
}

/// Kullback-Leibler divergence of `q` from `p`.
pub fn kl_divergence(p: &Tensor, q: &Tensor) -> Result<Tensor, TensorError> {
    let eps = 1e-7;
    let log_p = p.clamp(eps, 1.0).log();
    let log_q = q.clamp(eps, 1.0).log();
    p.try_mul(&log_p.try_sub(&log_q)?)?.sum(-1, false)
}

/// The loss whose gradient is `sparsemax(logits) - labels`.
///
/// With `p = sparsemax(z)` and labels `q`, it computes
/// `p·z - |p|²/2 + |q|²/2 - q·z`.
pub fn sparsemax_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor, TensorError> {
    let p = logits.sparsemax();
    let pz = p.try_mul(logits)?.sum(-1, false)?;
    let pp = p.square().sum(-1, false)?.mul_scalar(0.5);
    let qq = labels.square().sum(-1, false)?.mul_scalar(0.5);
    let qz = labels.try_mul(logits)?.sum(-1, false)?;
    pz.try_sub(&pp)?.try_add(&qq)?.try_sub(&qz)
}

/// Squared euclidean distances between the rows of `x` `[n, d]` and `y` `[m, d]`.
fn pairwise_cost(x: &Tensor, y: &Tensor) -> Result<Tensor, TensorError> {
    let xx = x.square().sum(-1, true)?;
    let yy = y.square().sum(-1, true)?.transpose()?;
    let xy = x.matmul(&y.transpose()?)?.mul_scalar(2.0);
    Ok(xx.try_add(&yy)?.try_sub(&xy)?.relu())
}

/// Entropy-regularized optimal transport distance between the rows of `target`
/// and `predicted`, with uniform weights and a squared euclidean cost.
///
/// The transport plan is found with `n_iter` Sinkhorn iterations, through which
/// the gradient flows. Returns a scalar.
pub fn sinkhorn_loss(
    target: &Tensor,
    predicted: &Tensor,
    epsilon: f32,
    n_iter: usize,
) -> Result<Tensor, TensorError> {
    let [n, _] = target.layout().try_to_array()?;
    let [m, _] = predicted.layout().try_to_array()?;

    let cost = pairwise_cost(target, predicted)?;
    let kernel = cost.mul_scalar(-1.0 / epsilon).exp();
    let kernel_t = kernel.transpose()?;

    let a = Tensor::full([n, 1], 1.0 / n as f32);
    let b = Tensor::full([m, 1], 1.0 / m as f32);
    let tiny = 1e-30;

    let mut u = Tensor::ones([n, 1]);
    let mut v = Tensor::ones([m, 1]);
    for _ in 0..n_iter {
        v = b.try_div(&kernel_t.matmul(&u)?.add_scalar(tiny))?;
        u = a.try_div(&kernel.matmul(&v)?.add_scalar(tiny))?;
    }

    let plan = u.try_mul(&kernel)?.try_mul(&v.transpose()?)?;
    plan.try_mul(&cost)?.sum_all()
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;

    use super::{
        binary_cross_entropy, binary_hinge, categorical_cross_entropy, kl_divergence, mse,
        sinkhorn_loss, sparse_categorical_cross_entropy, sparsemax_loss,
    };
    use crate::loom::{
        tensor::{Indices, Tensor},
        variable::Variable,
    };

    #[test]
    fn test_dense_losses() -> Result<(), Box<dyn Error>> {
        let labels = Tensor::create([2, 2], vec![1.0, 0.0, 0.0, 1.0])?;
        let logits = Tensor::create([2, 2], vec![2.0, -1.0, 0.5, 0.5])?;

        let loss = mse(&labels, &logits)?;
        assert_eq!(loss.shape(), &[2]);
        assert_abs_diff_eq!(loss.data(), &[1.0, 0.25][..], epsilon = 1e-6);

        let loss = binary_cross_entropy(&labels, &logits)?;
        let r#ref = |z: f32, x: f32| {
            let p = 1.0 / (1.0 + (-x).exp());
            -(z * p.ln() + (1.0 - z) * (1.0 - p).ln())
        };
        let expected = [
            (r#ref(1.0, 2.0) + r#ref(0.0, -1.0)) / 2.0,
            (r#ref(0.0, 0.5) + r#ref(1.0, 0.5)) / 2.0,
        ];
        assert_abs_diff_eq!(loss.data(), &expected[..], epsilon = 1e-5);

        let loss = categorical_cross_entropy(&labels, &logits)?;
        assert_abs_diff_eq!(loss.data()[1], 2.0f32.ln(), epsilon = 1e-6);

        let ids = Indices::create([2], vec![0, 1])?;
        let sparse = sparse_categorical_cross_entropy(&ids, &logits)?;
        assert_abs_diff_eq!(sparse.data(), loss.data(), epsilon = 1e-6);

        let loss = binary_hinge(&labels, &logits)?;
        assert_abs_diff_eq!(loss.data(), &[0.0, 1.0][..], epsilon = 1e-6);

        let p = Tensor::create([1, 2], vec![0.5, 0.5])?;
        assert_abs_diff_eq!(kl_divergence(&p, &p)?.item()?, 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_sparsemax_loss() -> Result<(), Box<dyn Error>> {
        let labels = Tensor::create([1, 3], vec![0.0, 1.0, 0.0])?;
        let z = Variable::new("z", Tensor::create([1, 3], vec![0.1, 2.0, 0.2])?);
        let loss = sparsemax_loss(&z.value(), &labels)?;
        // sparsemax(z) equals the labels
        assert_abs_diff_eq!(loss.item()?, 0.0, epsilon = 1e-6);

        let z = Variable::new("z", Tensor::create([1, 3], vec![1.0, 0.8, 0.0])?);
        let grads = sparsemax_loss(&z.value(), &labels)?.backward()?;
        let grad = grads.get(&z).ok_or("missing gradient")?;
        let p = z.value().sparsemax().try_sub(&labels)?;
        assert_abs_diff_eq!(grad.data(), p.data(), epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_sinkhorn_loss() -> Result<(), Box<dyn Error>> {
        let x = Tensor::create([2, 2], vec![0.0, 0.0, 1.0, 1.0])?;
        let y = Tensor::create([2, 2], vec![1.0, 1.0, 0.0, 0.0])?;
        let same = sinkhorn_loss(&x, &y, 0.1, 50)?.item()?;
        assert_abs_diff_eq!(same, 0.0, epsilon = 1e-3);

        let far = y.add_scalar(1.0);
        let moved = sinkhorn_loss(&x, &far, 0.1, 50)?.item()?;
        assert!(moved > 1.0);

        let var = Variable::new("y", far);
        let grads = sinkhorn_loss(&x, &var.value(), 0.1, 20)?.backward()?;
        assert!(grads.get(&var).is_some());
        Ok(())
    }
}
