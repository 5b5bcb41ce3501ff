//! Differentiable operators on [`Tensor`](crate::loom::tensor::Tensor).
//!
//! [`ops`] holds the recorded op structs with their backward rules, [`frontend`] the
//! tensor methods that run the forward kernels in [`cpu`] and record the ops.

pub mod cpu;
pub mod frontend;
pub mod ops;
