//! Serializable training configuration.

use std::{fs::File, io::Read, path::Path};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::optimizer::{Adadelta, Adam, Optimizer, RmsProp, Sgd};

/// How the per-example values of a loss layer are reduced to a scalar.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    #[display("mean")]
    Mean,
    #[display("sum")]
    Sum,
}

/// Parameters of the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Steps per epoch. Cycles through the dataset if larger than it; one pass if unset.
    #[serde(default)]
    pub steps_per_epoch: Option<usize>,
    #[serde(default)]
    pub reduction: Reduction,
}

fn default_epochs() -> usize {
    1
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            steps_per_epoch: None,
            reduction: Reduction::default(),
        }
    }
}

impl TrainConfig {
    #[inline]
    pub fn epochs(epochs: usize) -> Self {
        Self {
            epochs,
            ..Default::default()
        }
    }
}

/// Selects an optimizer and its hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        #[serde(default = "default_sgd_lr")]
        lr: f32,
        #[serde(default)]
        momentum: f32,
        #[serde(default)]
        nesterov: bool,
    },
    Adam {
        #[serde(default = "default_adam_lr")]
        lr: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_adam_epsilon")]
        epsilon: f32,
    },
    Adadelta {
        #[serde(default = "default_adadelta_lr")]
        lr: f32,
        #[serde(default = "default_adadelta_rho")]
        rho: f32,
        #[serde(default = "default_adadelta_epsilon")]
        epsilon: f32,
    },
    RmsProp {
        #[serde(default = "default_rms_prop_lr")]
        lr: f32,
        #[serde(default = "default_rms_prop_rho")]
        rho: f32,
        #[serde(default = "default_rms_prop_epsilon")]
        epsilon: f32,
    },
}

fn default_sgd_lr() -> f32 {
    0.01
}
fn default_adam_lr() -> f32 {
    1e-3
}
fn default_beta1() -> f32 {
    0.9
}
fn default_beta2() -> f32 {
    0.999
}
fn default_adam_epsilon() -> f32 {
    1e-8
}
fn default_adadelta_lr() -> f32 {
    1.0
}
fn default_adadelta_rho() -> f32 {
    0.95
}
fn default_adadelta_epsilon() -> f32 {
    1e-6
}
fn default_rms_prop_lr() -> f32 {
    1e-3
}
fn default_rms_prop_rho() -> f32 {
    0.9
}
fn default_rms_prop_epsilon() -> f32 {
    1e-7
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Sgd {
            lr: default_sgd_lr(),
            momentum: 0.0,
            nesterov: false,
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Box<dyn Optimizer> {
        match *self {
            OptimizerConfig::Sgd {
                lr,
                momentum,
                nesterov,
            } => Box::new(Sgd::new(lr).with_momentum(momentum, nesterov)),
            OptimizerConfig::Adam {
                lr,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(lr).with_betas(beta1, beta2, epsilon)),
            OptimizerConfig::Adadelta { lr, rho, epsilon } => {
                Box::new(Adadelta::new(lr).with_rho(rho, epsilon))
            }
            OptimizerConfig::RmsProp { lr, rho, epsilon } => {
                Box::new(RmsProp::new(lr).with_rho(rho, epsilon))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Training loop and optimizer settings, as stored in a JSON file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl Config {
    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::from_reader(File::open(path.as_ref())?)?;
        log::debug!("loaded config from {}", path.as_ref().display());
        Ok(config)
    }
}
