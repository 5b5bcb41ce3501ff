//! The `loom` module provides the foundational tensor types of the crate.
//! Everything above it (operators, layers, graphs, training) is built on these abstractions.
//!
//! ## Key Components
//! 1. **Layouts**:
//!    - Row-major shapes (`Layout`) with axis resolution, strides and index conversion.
//!    - Slicing descriptions (`Slice`, `Axis`).
//!
//! 2. **Tensors**:
//!    - Immutable dense `f32` tensors (`Tensor`) with shared storage.
//!    - Integer id tensors (`Indices`) and coordinate-format sparse tensors (`SparseTensor`).
//!
//! 3. **Variables**:
//!    - Named, shared, mutable state (`Variable`) that optimizers update in place.
//!
//! 4. **Automatic Differentiation**:
//!    - Every op applied to a tracked tensor records a node (`TensorNode`) holding the op and its inputs.
//!    - `Tensor::backward` walks the nodes in reverse topological order and collects `Gradients`.
//!
//! 5. **Numerical System**:
//!    - Storage types (`DataType`) for checkpoints. Computation always happens in `f32`.
//!
//! This module serves as the computational backbone for higher-level neural network constructs.

pub mod layout;
pub mod num;
pub mod ops;
pub mod slice;
pub mod sparse;
pub mod tensor;
pub mod variable;
