//! Reusable neural network layers on an eager, CPU tensor engine with reverse-mode
//! automatic differentiation.
//!
//! Layers connect into computation graphs ([`graph::Graph`]) that can be evaluated with
//! fed values, reused with shared variables, and trained with [`train::Model`].

pub mod activation;
pub mod graph;
pub mod hal;
pub mod init;
pub mod layers;
pub mod logic;
pub mod loom;
pub mod loss;
pub mod math;
pub mod metrics;
pub mod random;
pub mod train;

pub mod prelude {
    pub use crate::{
        activation::Activation as ActivationFn,
        graph::{Feed, Graph, GraphError},
        hal::ops::Padding,
        init::Init,
        layers::{Layer, LayerError, LayerOp, Value},
        loom::{
            layout::Layout,
            num::DataType,
            sparse::SparseTensor,
            tensor::{Indices, Tensor, TensorError},
            variable::Variable,
        },
        loss::Loss,
        train::{Model, ModelError},
    };
}
