//! Comparisons between tensors.

use itertools::Itertools;

use crate::{loom::tensor::Tensor, math::Operand};

/// Layout of a dense or sparse operand.
#[inline]
fn shape_of<'a>(x: &'a Operand<'_>) -> &'a [usize] {
    match x {
        Operand::Dense(x) => x.shape(),
        Operand::Sparse(x) => x.shape(),
    }
}

#[inline]
fn dense_of(x: Operand<'_>) -> Tensor {
    match x {
        Operand::Dense(x) => x.detach(),
        Operand::Sparse(x) => x.detach().to_dense(),
    }
}

/// `true` if both operands have the same shape.
pub fn same_shape<'a, 'b>(a: impl Into<Operand<'a>>, b: impl Into<Operand<'b>>) -> bool {
    shape_of(&a.into()) == shape_of(&b.into())
}

/// `true` if both operands have the same shape and equal elements.
/// Sparse operands are compared by their dense equivalent.
pub fn tensor_equal<'a, 'b>(a: impl Into<Operand<'a>>, b: impl Into<Operand<'b>>) -> bool {
    let (a, b) = (a.into(), b.into());
    if shape_of(&a) != shape_of(&b) {
        return false;
    }
    dense_of(a).data() == dense_of(b).data()
}

/// `true` if both tensors have the same shape and `|a - b| <= atol + rtol * |b|` everywhere.
pub fn tensor_all_close(a: &Tensor, b: &Tensor, rtol: f32, atol: f32) -> bool {
    a.shape() == b.shape()
        && a
            .data()
            .iter()
            .zip_eq(b.data())
            .all(|(x, y)| (x - y).abs() <= atol + rtol * y.abs())
}
