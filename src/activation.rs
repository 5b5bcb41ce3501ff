//! Activation functions.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::loom::tensor::{Tensor, TensorError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    #[display("identity")]
    Identity,
    #[display("sigmoid")]
    Sigmoid,
    #[display("tanh")]
    Tanh,
    #[display("relu")]
    Relu,
    #[display("leaky_relu({_0})")]
    LeakyRelu(f32),
    #[display("elu({_0})")]
    Elu(f32),
    #[display("hard_sigmoid")]
    HardSigmoid,
    #[display("softplus")]
    Softplus,
    #[display("softmax")]
    Softmax,
    #[display("sparsemax")]
    Sparsemax,
    #[display("gelu")]
    Gelu,
    #[display("swish")]
    Swish,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor, TensorError> {
        match *self {
            Activation::Identity => Ok(identity(x)),
            Activation::Sigmoid => Ok(x.sigmoid()),
            Activation::Tanh => Ok(x.tanh()),
            Activation::Relu => Ok(x.relu()),
            Activation::LeakyRelu(alpha) => Ok(x.leaky_relu(alpha)),
            Activation::Elu(alpha) => Ok(x.elu(alpha)),
            Activation::HardSigmoid => Ok(x.hard_sigmoid()),
            Activation::Softplus => Ok(x.softplus()),
            Activation::Softmax => Ok(x.softmax()),
            Activation::Sparsemax => Ok(x.sparsemax()),
            Activation::Gelu => gelu(x),
            Activation::Swish => swish(x),
        }
    }
}

#[inline]
pub fn identity(x: &Tensor) -> Tensor {
    x.clone()
}

#[inline]
pub fn sigmoid(x: &Tensor) -> Tensor {
    x.sigmoid()
}

#[inline]
pub fn tanh(x: &Tensor) -> Tensor {
    x.tanh()
}

#[inline]
pub fn relu(x: &Tensor) -> Tensor {
    x.relu()
}

/// `x` if positive, `alpha * x` otherwise.
#[inline]
pub fn leaky_relu(x: &Tensor, alpha: f32) -> Tensor {
    x.leaky_relu(alpha)
}

#[inline]
pub fn elu(x: &Tensor, alpha: f32) -> Tensor {
    x.elu(alpha)
}

/// Piecewise linear approximation of the sigmoid: `clamp(0.2 * x + 0.5, 0, 1)`.
#[inline]
pub fn hard_sigmoid(x: &Tensor) -> Tensor {
    x.hard_sigmoid()
}

#[inline]
pub fn softplus(x: &Tensor) -> Tensor {
    x.softplus()
}

#[inline]
pub fn softmax(x: &Tensor) -> Tensor {
    x.softmax()
}

#[inline]
pub fn sparsemax(x: &Tensor) -> Tensor {
    x.sparsemax()
}

/// Gaussian error linear unit, tanh approximation.
pub fn gelu(x: &Tensor) -> Result<Tensor, TensorError> {
    let c = (2.0 / std::f32::consts::PI).sqrt();
    let inner = x.try_add(&x.pow_scalar(3.0).mul_scalar(0.044715))?.mul_scalar(c);
    x.mul_scalar(0.5).try_mul(&inner.tanh().add_scalar(1.0))
}

/// `x * sigmoid(x)`.
#[inline]
pub fn swish(x: &Tensor) -> Result<Tensor, TensorError> {
    x.try_mul(&x.sigmoid())
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;

    use super::Activation;
    use crate::loom::tensor::Tensor;

    #[test]
    fn test_activation() -> Result<(), Box<dyn Error>> {
        let x = Tensor::create([4], vec![-2.0, -0.5, 0.0, 3.0])?;

        let y = Activation::LeakyRelu(0.0).apply(&x)?;
        assert_eq!(y, Activation::Relu.apply(&x)?);

        let y = Activation::Gelu.apply(&x)?;
        assert_abs_diff_eq!(y.data(), &[-0.04540, -0.15429, 0.0, 2.99636][..], epsilon = 1e-4);

        let y = Activation::HardSigmoid.apply(&x)?;
        assert_abs_diff_eq!(y.data(), &[0.1, 0.4, 0.5, 1.0][..], epsilon = 1e-6);

        let y = Activation::Softmax.apply(&x)?;
        assert_abs_diff_eq!(y.data().iter().sum::<f32>(), 1.0, epsilon = 1e-6);

        assert_eq!(Activation::Elu(1.0).to_string(), "elu(1)");
        let parsed: Activation = serde_json::from_str(r#"{"leaky_relu": 0.2}"#)?;
        assert_eq!(parsed, Activation::LeakyRelu(0.2));
        Ok(())
    }
}
