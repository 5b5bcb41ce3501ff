//! Forward kernels on row-major `f32` buffers. Parallel under the `rayon` feature.

pub mod binary;
pub mod matmul;
pub mod reduce;
pub mod softmax;
