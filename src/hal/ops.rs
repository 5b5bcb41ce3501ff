use std::sync::Arc;

use derive_more::Display;
use itertools::{Itertools, izip};
use serde::{Deserialize, Serialize};

use super::cpu;
use crate::loom::{
    ops::TensorOp,
    tensor::{Tensor, TensorError},
};

/// Checks the number of inputs an op received.
#[inline]
fn check_inputs<'a, const N: usize>(
    name: &'static str,
    inputs: &'a [Tensor],
) -> Result<&'a [Tensor; N], TensorError> {
    inputs
        .try_into()
        .map_err(|_| TensorError::Arity(name, N, inputs.len()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Binary {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
}

impl Binary {
    #[inline]
    pub fn apply(self, x: f32, y: f32) -> f32 {
        match self {
            Binary::Add => x + y,
            Binary::Sub => x - y,
            Binary::Mul => x * y,
            Binary::Div => x / y,
            Binary::Maximum => x.max(y),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BinaryOp {
    pub kind: Binary,
}

impl TensorOp for BinaryOp {
    fn name(&self) -> &'static str {
        match self.kind {
            Binary::Add => "add",
            Binary::Sub => "sub",
            Binary::Mul => "mul",
            Binary::Div => "div",
            Binary::Maximum => "maximum",
        }
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x, y] = check_inputs(self.name(), inputs)?;
        let (gx, gy) = match self.kind {
            Binary::Add => (grad.clone(), grad.clone()),
            Binary::Sub => (grad.clone(), grad.neg()),
            Binary::Mul => (grad.try_mul(y)?, grad.try_mul(x)?),
            Binary::Div => (grad.try_div(y)?, grad.try_mul(output)?.try_div(y)?.neg()),
            Binary::Maximum => {
                let layout = output.layout();
                let mask = cpu::binary::binary(
                    (x.data(), &x.layout()),
                    (y.data(), &y.layout()),
                    &layout,
                    |x, y| (x >= y) as u8 as f32,
                );
                let mask = Tensor::create(layout, mask)?;
                let gx = grad.try_mul(&mask)?;
                let gy = grad.try_sub(&gx)?;
                (gx, gy)
            }
        };
        Ok(vec![
            Some(gx.sum_to(x.layout())?),
            Some(gy.sum_to(y.layout())?),
        ])
    }
}

/// Element-wise maps with known derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Display, Serialize, Deserialize)]
pub enum Unary {
    Neg,
    Exp,
    Log,
    Sqrt,
    Square,
    Abs,
    Sign,
    Tanh,
    Sigmoid,
    Relu,
    #[display("LeakyRelu({_0})")]
    LeakyRelu(f32),
    #[display("Elu({_0})")]
    Elu(f32),
    Softplus,
    HardSigmoid,
    #[display("Clamp({_0}, {_1})")]
    Clamp(f32, f32),
    #[display("AddScalar({_0})")]
    AddScalar(f32),
    #[display("MulScalar({_0})")]
    MulScalar(f32),
    #[display("DivScalar({_0})")]
    DivScalar(f32),
    #[display("PowScalar({_0})")]
    PowScalar(f32),
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    match x >= 0.0 {
        true => 1.0 / (1.0 + (-x).exp()),
        false => {
            let z = x.exp();
            z / (1.0 + z)
        }
    }
}

impl Unary {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Unary::Neg => -x,
            Unary::Exp => x.exp(),
            Unary::Log => x.ln(),
            Unary::Sqrt => x.sqrt(),
            Unary::Square => x * x,
            Unary::Abs => x.abs(),
            Unary::Sign => match x == 0.0 {
                true => 0.0,
                false => x.signum(),
            },
            Unary::Tanh => x.tanh(),
            Unary::Sigmoid => sigmoid(x),
            Unary::Relu => x.max(0.0),
            Unary::LeakyRelu(alpha) => match x > 0.0 {
                true => x,
                false => alpha * x,
            },
            Unary::Elu(alpha) => match x > 0.0 {
                true => x,
                false => alpha * (x.exp() - 1.0),
            },
            Unary::Softplus => x.max(0.0) + (-x.abs()).exp().ln_1p(),
            Unary::HardSigmoid => (0.2 * x + 0.5).clamp(0.0, 1.0),
            Unary::Clamp(min, max) => x.clamp(min, max),
            Unary::AddScalar(c) => x + c,
            Unary::MulScalar(c) => x * c,
            Unary::DivScalar(c) => x / c,
            Unary::PowScalar(p) => x.powf(p),
        }
    }

    /// Derivative at `x`, where `y` is the output at `x`.
    #[inline]
    pub fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            Unary::Neg => -1.0,
            Unary::Exp => y,
            Unary::Log => 1.0 / x,
            Unary::Sqrt => 0.5 / y,
            Unary::Square => 2.0 * x,
            Unary::Abs => Unary::Sign.apply(x),
            Unary::Sign => 0.0,
            Unary::Tanh => 1.0 - y * y,
            Unary::Sigmoid => y * (1.0 - y),
            Unary::Relu => (x > 0.0) as u8 as f32,
            Unary::LeakyRelu(alpha) => match x > 0.0 {
                true => 1.0,
                false => alpha,
            },
            Unary::Elu(alpha) => match x > 0.0 {
                true => 1.0,
                false => y + alpha,
            },
            Unary::Softplus => sigmoid(x),
            Unary::HardSigmoid => match y > 0.0 && y < 1.0 {
                true => 0.2,
                false => 0.0,
            },
            Unary::Clamp(min, max) => (x >= min && x <= max) as u8 as f32,
            Unary::AddScalar(_) => 1.0,
            Unary::MulScalar(c) => c,
            Unary::DivScalar(c) => 1.0 / c,
            Unary::PowScalar(p) => p * x.powf(p - 1.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnaryOp {
    pub kind: Unary,
}

impl TensorOp for UnaryOp {
    fn name(&self) -> &'static str {
        "unary"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        let data = izip!(x.data(), output.data(), grad.data())
            .map(|(&x, &y, &g)| g * self.kind.derivative(x, y))
            .collect_vec();
        Ok(vec![Some(Tensor::create(x.layout(), data)?)])
    }
}

/// Sum of a tensor down to a layout it broadcasts from.
#[derive(Debug, Clone)]
pub struct SumToOp;

impl TensorOp for SumToOp {
    fn name(&self) -> &'static str {
        "sum_to"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        Ok(vec![Some(grad.broadcast_to(x.layout())?)])
    }
}

/// Sum over one axis.
#[derive(Debug, Clone)]
pub struct SumOp {
    pub axis: usize,
}

impl TensorOp for SumOp {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        let layout = x.layout();
        let grad = grad.reshape(layout.reduce(self.axis, true))?;
        Ok(vec![Some(grad.broadcast_to(layout)?)])
    }
}

/// Maximum over one axis. The gradient flows to the first maximum only.
#[derive(Debug, Clone)]
pub struct MaxOp {
    pub argmax: Arc<[usize]>,
}

impl TensorOp for MaxOp {
    fn name(&self) -> &'static str {
        "max"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        let mut data = vec![0.0; x.size()];
        for (&offset, &g) in self.argmax.iter().zip_eq(grad.data()) {
            data[offset] += g;
        }
        Ok(vec![Some(Tensor::create(x.layout(), data)?)])
    }
}

#[derive(Debug, Clone)]
pub struct MatMulOp {
    /// The right operand is a rank 2 matrix shared by every batch of the left one.
    pub shared: bool,
}

impl TensorOp for MatMulOp {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x, y] = check_inputs(self.name(), inputs)?;
        let gx = grad.matmul(&y.transpose()?)?;
        let gy = match self.shared {
            true => {
                let [k, n] = y.layout().try_to_array()?;
                let x = x.reshape_infer(&[-1, k as isize])?;
                let grad = grad.reshape_infer(&[-1, n as isize])?;
                x.transpose()?.matmul(&grad)?
            }
            false => x.transpose()?.matmul(grad)?,
        };
        Ok(vec![Some(gx), Some(gy)])
    }
}

#[derive(Debug, Clone)]
pub struct ReshapeOp;

impl TensorOp for ReshapeOp {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        Ok(vec![Some(grad.reshape(x.layout())?)])
    }
}

/// Copies elements from several inputs into a new layout.
///
/// Each output element either comes from `(input, offset)` or is zero. Transposes,
/// concatenations, padding, slicing and indexing are all expressed this way.
#[derive(Debug, Clone)]
pub struct GatherOp {
    pub map: Arc<[Option<(usize, usize)>]>,
}

impl TensorOp for GatherOp {
    fn name(&self) -> &'static str {
        "gather"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let mut grads = inputs.iter().map(|x| vec![0.0; x.size()]).collect_vec();
        for (source, &g) in self.map.iter().zip_eq(grad.data()) {
            if let &Some((input, offset)) = source {
                grads[input][offset] += g;
            }
        }
        inputs
            .iter()
            .zip_eq(grads)
            .map(|(x, data)| Tensor::create(x.layout(), data).map(Some))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SoftmaxOp;

impl TensorOp for SoftmaxOp {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        let mut data = Vec::with_capacity(x.size());
        for (y, g) in output.rows().zip_eq(grad.rows()) {
            let dot: f32 = y.iter().zip_eq(g).map(|(y, g)| y * g).sum();
            data.extend(y.iter().zip_eq(g).map(|(y, g)| y * (g - dot)));
        }
        Ok(vec![Some(Tensor::create(x.layout(), data)?)])
    }
}

#[derive(Debug, Clone)]
pub struct SparsemaxOp;

impl TensorOp for SparsemaxOp {
    fn name(&self) -> &'static str {
        "sparsemax"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        let mut data = Vec::with_capacity(x.size());
        for (y, g) in output.rows().zip_eq(grad.rows()) {
            let support = y.iter().filter(|&&y| y > 0.0).count().max(1) as f32;
            let mean = y
                .iter()
                .zip_eq(g)
                .filter(|(y, _)| **y > 0.0)
                .map(|(_, g)| g)
                .sum::<f32>()
                / support;
            data.extend(y.iter().zip_eq(g).map(|(&y, &g)| match y > 0.0 {
                true => g - mean,
                false => 0.0,
            }));
        }
        Ok(vec![Some(Tensor::create(x.layout(), data)?)])
    }
}

/// Product of a `[rows, k]` sparse matrix, whose values are the first input,
/// with a dense `[k, n]` matrix.
#[derive(Debug, Clone)]
pub struct SparseMatMulOp {
    pub indices: Arc<[[usize; 2]]>,
}

impl TensorOp for SparseMatMulOp {
    fn name(&self) -> &'static str {
        "sparse_matmul"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [values, dense] = check_inputs(self.name(), inputs)?;
        let n = dense.layout().last();
        let (g, y) = (grad.data(), dense.data());

        let mut gv = Vec::with_capacity(values.size());
        let mut gd = vec![0.0; dense.size()];
        for (&[r, c], &v) in self.indices.iter().zip_eq(values.data()) {
            let g = &g[r * n..(r + 1) * n];
            let y = &y[c * n..(c + 1) * n];
            gv.push(g.iter().zip_eq(y).map(|(g, y)| g * y).sum::<f32>());
            for (z, &g) in gd[c * n..(c + 1) * n].iter_mut().zip_eq(g) {
                *z += v * g;
            }
        }
        Ok(vec![
            Some(Tensor::create(values.layout(), gv)?),
            Some(Tensor::create(dense.layout(), gd)?),
        ])
    }
}

/// Writes (and sums) values into a dense layout at the given offsets.
#[derive(Debug, Clone)]
pub struct ScatterOp {
    pub offsets: Arc<[usize]>,
}

impl TensorOp for ScatterOp {
    fn name(&self) -> &'static str {
        "scatter"
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>, TensorError> {
        let [x] = check_inputs(self.name(), inputs)?;
        let data = self.offsets.iter().map(|&offset| grad.data()[offset]).collect_vec();
        Ok(vec![Some(Tensor::create(x.layout(), data)?)])
    }
}

/// Padding of a convolution over the time axis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Padding {
    /// Output has the length of the input. Padding is split between both ends.
    #[default]
    Same,
    /// No padding.
    Valid,
    /// Output has the length of the input. All padding is on the left.
    Causal,
}

impl Padding {
    /// Padding `(left, right)` for a kernel spanning `span` steps.
    #[inline]
    pub fn split(self, span: usize) -> (usize, usize) {
        let total = span.saturating_sub(1);
        match self {
            Padding::Same => (total / 2, total - total / 2),
            Padding::Valid => (0, 0),
            Padding::Causal => (total, 0),
        }
    }
}
