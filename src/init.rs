//! Variable initializers.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    loom::{
        layout::Layout,
        tensor::{Tensor, TensorError},
    },
    random,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Init {
    #[default]
    #[display("zeros")]
    Zeros,
    #[display("ones")]
    Ones,
    #[display("constant({_0})")]
    Constant(f32),
    #[display("random_uniform({min}, {max})")]
    RandomUniform { min: f32, max: f32 },
    #[display("random_normal({mean}, {std})")]
    RandomNormal { mean: f32, std: f32 },
    #[display("glorot_uniform")]
    GlorotUniform,
    #[display("glorot_normal")]
    GlorotNormal,
    #[display("he_uniform")]
    HeUniform,
    #[display("he_normal")]
    HeNormal,
}

/// Standard deviation of a unit normal truncated at 2, used to rescale truncated samples.
const TRUNCATED_STD: f32 = 0.879_625_66;

/// `(fan_in, fan_out)` of a weight layout. For rank > 2 the leading dims form the receptive field.
pub fn fans(layout: &Layout) -> (usize, usize) {
    match layout.shape() {
        [] => (1, 1),
        &[n] => (n, n),
        &[fan_in, fan_out] => (fan_in, fan_out),
        [field @ .., fan_in, fan_out] => {
            let field: usize = field.iter().product();
            (fan_in * field, fan_out * field)
        }
    }
}

impl Init {
    /// Creates a new tensor of `layout` with this initializer.
    pub fn tensor(&self, layout: Layout) -> Result<Tensor, TensorError> {
        let (fan_in, fan_out) = fans(&layout);
        let (fan_in, fan_out) = (fan_in.max(1) as f32, fan_out.max(1) as f32);
        let tensor = match *self {
            Init::Zeros => Tensor::zeros(layout),
            Init::Ones => Tensor::ones(layout),
            Init::Constant(value) => Tensor::full(layout, value),
            Init::RandomUniform { min, max } => random::uniform(layout, min, max),
            Init::RandomNormal { mean, std } => random::normal(layout, mean, std),
            Init::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                random::uniform(layout, -limit, limit)
            }
            Init::GlorotNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt() / TRUNCATED_STD;
                random::truncated_normal(layout, 0.0, std)
            }
            Init::HeUniform => {
                let limit = (6.0 / fan_in).sqrt();
                random::uniform(layout, -limit, limit)
            }
            Init::HeNormal => {
                let std = (2.0 / fan_in).sqrt() / TRUNCATED_STD;
                random::truncated_normal(layout, 0.0, std)
            }
        };
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Init, fans};
    use crate::loom::layout::Layout;

    #[test]
    fn test_fans() {
        assert_eq!(fans(&Layout::from_shape([3])), (3, 3));
        assert_eq!(fans(&Layout::from_shape([4, 8])), (4, 8));
        assert_eq!(fans(&Layout::from_shape([3, 4, 8])), (12, 24));
    }

    #[test]
    fn test_init() -> Result<(), Box<dyn Error>> {
        crate::random::seed(42);

        let x = Init::GlorotUniform.tensor(Layout::from_shape([100, 50]))?;
        let limit = (6.0f32 / 150.0).sqrt();
        assert!(x.data().iter().all(|x| x.abs() <= limit));

        let x = Init::HeNormal.tensor(Layout::from_shape([100, 50]))?;
        let std = (2.0f32 / 100.0).sqrt() / super::TRUNCATED_STD;
        assert!(x.data().iter().all(|x| x.abs() <= 2.0 * std));

        let x = Init::Constant(0.5).tensor(Layout::from_shape([2]))?;
        assert_eq!(x.data(), &[0.5, 0.5]);

        let init: Init = serde_json::from_str(r#"{"random_uniform": {"min": -1.0, "max": 1.0}}"#)?;
        assert_eq!(init, Init::RandomUniform { min: -1.0, max: 1.0 });
        Ok(())
    }
}
