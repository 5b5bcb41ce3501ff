use itertools::Itertools;

use super::{
    cpu::{self, matmul::MatMulShape},
    ops::{
        Binary, BinaryOp, GatherOp, MatMulOp, MaxOp, Padding, ReshapeOp, ScatterOp, SoftmaxOp,
        SparseMatMulOp, SparsemaxOp, SumOp, SumToOp, Unary, UnaryOp,
    },
};
use crate::loom::{
    layout::{IntoLayout, Layout, LayoutError},
    sparse::SparseTensor,
    tensor::{Indices, Tensor, TensorError},
};

impl Tensor {
    fn binary(&self, rhs: &Tensor, kind: Binary) -> Result<Tensor, TensorError> {
        let (lx, ly) = (self.layout(), rhs.layout());
        let layout = cpu::binary::broadcast(&lx, &ly)?;
        let f = move |x, y| kind.apply(x, y);
        let data = cpu::binary::binary((self.data(), &lx), (rhs.data(), &ly), &layout, f);
        Ok(Tensor::from_op(layout, data, BinaryOp { kind }, &[self, rhs]))
    }

    /// # Element-wise Addition (`try_add`)
    /// Performs element-wise addition between two tensors.
    ///
    /// ## Arguments
    /// * `self` - The first tensor operand
    /// * `rhs` - The second tensor operand, must be broadcastable with `self`
    ///
    /// ## Returns
    /// * `Result<Tensor, TensorError>` - A new tensor containing the element-wise sum,
    ///   or an error if the tensor layouts don't broadcast
    #[inline]
    pub fn try_add(&self, rhs: &Tensor) -> Result<Tensor, TensorError> {
        self.binary(rhs, Binary::Add)
    }

    /// Element-wise difference with broadcasting. See [`Tensor::try_add`].
    #[inline]
    pub fn try_sub(&self, rhs: &Tensor) -> Result<Tensor, TensorError> {
        self.binary(rhs, Binary::Sub)
    }

    /// Element-wise product with broadcasting. See [`Tensor::try_add`].
    #[inline]
    pub fn try_mul(&self, rhs: &Tensor) -> Result<Tensor, TensorError> {
        self.binary(rhs, Binary::Mul)
    }

    /// Element-wise quotient with broadcasting. See [`Tensor::try_add`].
    #[inline]
    pub fn try_div(&self, rhs: &Tensor) -> Result<Tensor, TensorError> {
        self.binary(rhs, Binary::Div)
    }

    /// Element-wise maximum with broadcasting. Ties send the gradient to `self`.
    #[inline]
    pub fn try_maximum(&self, rhs: &Tensor) -> Result<Tensor, TensorError> {
        self.binary(rhs, Binary::Maximum)
    }

    /// Applies an element-wise map.
    pub fn unary(&self, kind: Unary) -> Tensor {
        let data = cpu::binary::unary(self.data(), move |x| kind.apply(x));
        Tensor::from_op(self.layout(), data, UnaryOp { kind }, &[self])
    }

    #[inline]
    pub fn neg(&self) -> Tensor {
        self.unary(Unary::Neg)
    }

    #[inline]
    pub fn exp(&self) -> Tensor {
        self.unary(Unary::Exp)
    }

    #[inline]
    pub fn log(&self) -> Tensor {
        self.unary(Unary::Log)
    }

    #[inline]
    pub fn sqrt(&self) -> Tensor {
        self.unary(Unary::Sqrt)
    }

    #[inline]
    pub fn square(&self) -> Tensor {
        self.unary(Unary::Square)
    }

    #[inline]
    pub fn abs(&self) -> Tensor {
        self.unary(Unary::Abs)
    }

    /// Signs of the elements. Never carries a gradient.
    #[inline]
    pub fn sign(&self) -> Tensor {
        self.detach().unary(Unary::Sign)
    }

    #[inline]
    pub fn tanh(&self) -> Tensor {
        self.unary(Unary::Tanh)
    }

    #[inline]
    pub fn sigmoid(&self) -> Tensor {
        self.unary(Unary::Sigmoid)
    }

    #[inline]
    pub fn relu(&self) -> Tensor {
        self.unary(Unary::Relu)
    }

    #[inline]
    pub fn leaky_relu(&self, alpha: f32) -> Tensor {
        self.unary(Unary::LeakyRelu(alpha))
    }

    #[inline]
    pub fn elu(&self, alpha: f32) -> Tensor {
        self.unary(Unary::Elu(alpha))
    }

    #[inline]
    pub fn softplus(&self) -> Tensor {
        self.unary(Unary::Softplus)
    }

    #[inline]
    pub fn hard_sigmoid(&self) -> Tensor {
        self.unary(Unary::HardSigmoid)
    }

    #[inline]
    pub fn clamp(&self, min: f32, max: f32) -> Tensor {
        self.unary(Unary::Clamp(min, max))
    }

    #[inline]
    pub fn add_scalar(&self, value: f32) -> Tensor {
        self.unary(Unary::AddScalar(value))
    }

    #[inline]
    pub fn mul_scalar(&self, value: f32) -> Tensor {
        self.unary(Unary::MulScalar(value))
    }

    #[inline]
    pub fn div_scalar(&self, value: f32) -> Tensor {
        self.unary(Unary::DivScalar(value))
    }

    #[inline]
    pub fn pow_scalar(&self, value: f32) -> Tensor {
        self.unary(Unary::PowScalar(value))
    }

    /// Computes `1 - x`.
    #[inline]
    pub fn complement(&self) -> Tensor {
        self.neg().add_scalar(1.0)
    }
}

impl Tensor {
    /// # Reshape (`reshape`)
    /// Views the data with a new layout of the same size.
    #[inline]
    pub fn reshape(&self, layout: impl IntoLayout) -> Result<Tensor, TensorError> {
        let layout = layout.into_layout();
        if layout.size() != self.size() {
            return Err(TensorError::Reshape(self.layout(), layout));
        }
        if layout == self.layout() {
            return Ok(self.clone());
        }
        Ok(Tensor::from_op(layout, self.data_arc(), ReshapeOp, &[self]))
    }

    /// Reshape with at most one `-1` placeholder dim inferred from the size.
    #[inline]
    pub fn reshape_infer(&self, shape: &[isize]) -> Result<Tensor, TensorError> {
        let layout = Layout::infer(shape, self.size())?;
        self.reshape(layout)
    }

    /// Inserts a dim of size 1 at `axis`, which may be equal to the rank.
    pub fn expand_dims(&self, axis: isize) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let rank = layout.len() as isize;
        let resolved = if axis < 0 { axis + rank + 1 } else { axis };
        if !(0..=rank).contains(&resolved) {
            return Err(LayoutError::Axis(axis, layout).into());
        }
        let mut shape = layout.to_vec();
        shape.insert(resolved as usize, 1);
        self.reshape(shape)
    }

    /// Removes a dim of size 1 at `axis`.
    pub fn squeeze(&self, axis: isize) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let axis = layout.axis(axis)?;
        let output = layout.reduce(axis, false);
        match layout[axis] {
            1 => self.reshape(output),
            _ => Err(TensorError::Reshape(layout, output)),
        }
    }

    /// Flattens every dim but the first.
    pub fn flatten(&self) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        match layout.first() {
            Some(&batch) => self.reshape([batch, layout.stride_of(0)]),
            None => Err(TensorError::Rank(1, layout)),
        }
    }

    /// Repeats the tensor along dims of size 1 to match `layout`.
    pub fn broadcast_to(&self, layout: impl IntoLayout) -> Result<Tensor, TensorError> {
        let layout = layout.into_layout();
        if layout == self.layout() {
            return Ok(self.clone());
        }
        if cpu::binary::broadcast(&self.layout(), &layout)? != layout {
            return Err(TensorError::Broadcast(self.layout(), layout));
        }
        let map = cpu::binary::broadcast_offsets(&self.layout(), &layout)
            .into_iter()
            .map(|offset| Some((0, offset)))
            .collect_vec();
        Ok(Tensor::gather(&[self], layout, map))
    }

    /// Sums the tensor down to a `layout` that broadcasts to its own.
    pub fn sum_to(&self, layout: impl IntoLayout) -> Result<Tensor, TensorError> {
        let layout = layout.into_layout();
        if layout == self.layout() {
            return Ok(self.clone());
        }
        if cpu::binary::broadcast(&layout, &self.layout())? != self.layout() {
            return Err(TensorError::Broadcast(layout, self.layout()));
        }
        let data = cpu::binary::sum_to(self.data(), &self.layout(), &layout);
        Ok(Tensor::from_op(layout, data, SumToOp, &[self]))
    }

    /// Builds a tensor of `layout` whose elements are copied from `(input, offset)`, or zero.
    pub(crate) fn gather(
        inputs: &[&Tensor],
        layout: Layout,
        map: Vec<Option<(usize, usize)>>,
    ) -> Tensor {
        let data = map
            .iter()
            .map(|source| match *source {
                Some((input, offset)) => inputs[input].data()[offset],
                None => 0.0,
            })
            .collect_vec();
        Tensor::from_op(layout, data, GatherOp { map: map.into() }, inputs)
    }

    /// Picks the elements at flat `offsets`.
    pub(crate) fn take(&self, offsets: &[usize], layout: impl IntoLayout) -> Tensor {
        let map = offsets.iter().map(|&offset| Some((0, offset))).collect();
        Tensor::gather(&[self], layout.into_layout(), map)
    }

    /// Reorders the axes: output axis `i` is input axis `axes[i]`.
    pub fn permute(&self, axes: &[usize]) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        if !axes.iter().copied().sorted().eq(0..layout.len()) {
            return Err(TensorError::Permute(axes.to_vec(), layout));
        }
        let strides = layout.strides();
        let output = Layout::from_shape(axes.iter().map(|&axis| layout[axis]).collect_vec());
        let map = (0..output.size())
            .map(|offset| {
                let index = output.index(offset);
                let source = index
                    .iter()
                    .zip_eq(axes)
                    .map(|(&index, &axis)| index * strides[axis])
                    .sum();
                Some((0, source))
            })
            .collect();
        Ok(Tensor::gather(&[self], output, map))
    }

    /// Swaps the last two axes.
    pub fn transpose(&self) -> Result<Tensor, TensorError> {
        let rank = self.dim();
        if rank < 2 {
            return Err(TensorError::Rank(2, self.layout()));
        }
        let mut axes = (0..rank).collect_vec();
        axes.swap(rank - 2, rank - 1);
        self.permute(&axes)
    }

    /// Concatenates tensors along `axis`. All other dims must match.
    pub fn concat(tensors: &[Tensor], axis: isize) -> Result<Tensor, TensorError> {
        let first = tensors.first().ok_or(TensorError::Empty)?;
        let layout = first.layout();
        let axis = layout.axis(axis)?;
        for tensor in tensors {
            let other = tensor.layout();
            if other.len() != layout.len() || other.with_dim(axis, 0) != layout.with_dim(axis, 0) {
                return Err(TensorError::Mismatch(layout, other));
            }
        }

        let dims = tensors.iter().map(|x| x.layout()[axis]).collect_vec();
        let output = layout.with_dim(axis, dims.iter().sum());
        let (outer, _, inner) = output.split_at(axis);

        let mut map = Vec::with_capacity(output.size());
        for o in 0..outer {
            for (input, &dim) in dims.iter().enumerate() {
                map.extend((0..dim * inner).map(|i| Some((input, o * dim * inner + i))));
            }
        }
        let inputs = tensors.iter().collect_vec();
        Ok(Tensor::gather(&inputs, output, map))
    }

    /// Selects `len` entries of `axis` starting from `start`.
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let axis = layout.axis(axis)?;
        let (outer, dim, inner) = layout.split_at(axis);
        if start + len > dim {
            return Err(TensorError::Index(start + len, dim));
        }
        let output = layout.with_dim(axis, len);
        let map = itertools::iproduct!(0..outer, 0..len * inner)
            .map(|(o, i)| Some((0, (o * dim + start) * inner + i)))
            .collect();
        Ok(Tensor::gather(&[self], output, map))
    }

    /// Splits `axis` into `n` equal parts.
    pub fn split(&self, axis: isize, n: usize) -> Result<Vec<Tensor>, TensorError> {
        let layout = self.layout();
        let resolved = layout.axis(axis)?;
        let dim = layout[resolved];
        if n == 0 || dim % n != 0 {
            return Err(TensorError::Split(n, dim));
        }
        let len = dim / n;
        (0..n).map(|i| self.narrow(axis, i * len, len)).collect()
    }

    /// Pads `axis` with zeros.
    pub fn pad(&self, axis: isize, before: usize, after: usize) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let axis = layout.axis(axis)?;
        let (outer, dim, inner) = layout.split_at(axis);
        let output = layout.with_dim(axis, before + dim + after);
        let map = itertools::iproduct!(0..outer, 0..before + dim + after, 0..inner)
            .map(|(o, j, i)| match (before..before + dim).contains(&j) {
                true => Some((0, (o * dim + j - before) * inner + i)),
                false => None,
            })
            .collect();
        Ok(Tensor::gather(&[self], output, map))
    }

    /// Selects rows of the first axis. The output has layout `indices ++ self[1..]`.
    pub fn index_select(&self, indices: &Indices) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let Some(&dim) = layout.first() else {
            return Err(TensorError::Rank(1, layout));
        };
        if let Some(&index) = indices.data().iter().find(|&&index| index >= dim) {
            return Err(TensorError::Index(index, dim));
        }
        let inner = layout.stride_of(0);
        let output = [indices.shape(), &layout[1..]].concat();
        let map = itertools::iproduct!(indices.data(), 0..inner)
            .map(|(&index, i)| Some((0, index * inner + i)))
            .collect();
        Ok(Tensor::gather(&[self], Layout::from_shape(output), map))
    }
}

impl Tensor {
    /// # Sum (`sum`)
    /// Sums over `axis`, which may be negative.
    ///
    /// ## Arguments
    /// * `axis` - The axis to reduce.
    /// * `keep_dims` - Keeps the reduced axis with size 1.
    #[inline]
    pub fn sum(&self, axis: isize, keep_dims: bool) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let axis = layout.axis(axis)?;
        let data = cpu::reduce::sum(self.data(), layout.split_at(axis));
        let output = layout.reduce(axis, keep_dims);
        Ok(Tensor::from_op(output, data, SumOp { axis }, &[self]))
    }

    /// Mean over `axis`. See [`Tensor::sum`].
    #[inline]
    pub fn mean(&self, axis: isize, keep_dims: bool) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let dim = layout[layout.axis(axis)?];
        Ok(self.sum(axis, keep_dims)?.div_scalar(dim.max(1) as f32))
    }

    /// Sum of all elements, as a scalar tensor.
    #[inline]
    pub fn sum_all(&self) -> Result<Tensor, TensorError> {
        self.reshape([self.size()])?.sum(0, false)
    }

    /// Mean of all elements, as a scalar tensor.
    #[inline]
    pub fn mean_all(&self) -> Result<Tensor, TensorError> {
        Ok(self.sum_all()?.div_scalar(self.size().max(1) as f32))
    }

    /// Maximum over `axis`. The gradient flows to the first maximal element.
    pub fn max(&self, axis: isize, keep_dims: bool) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        let axis = layout.axis(axis)?;
        let (outer, dim, inner) = layout.split_at(axis);
        if dim == 0 {
            return Err(TensorError::Index(0, dim));
        }
        let (data, argmax) = cpu::reduce::max(self.data(), (outer, dim, inner));
        let output = layout.reduce(axis, keep_dims);
        let op = MaxOp {
            argmax: argmax.into(),
        };
        Ok(Tensor::from_op(output, data, op, &[self]))
    }

    /// Euclidean norm over `axis`.
    #[inline]
    pub fn norm(&self, axis: isize, keep_dims: bool) -> Result<Tensor, TensorError> {
        Ok(self.square().sum(axis, keep_dims)?.sqrt())
    }

    /// # Matrix Multiplication (`matmul`)
    /// Performs batched matrix multiplication.
    ///
    /// ## Arguments
    /// * `self` - A tensor of shape `[B*, M, K]`.
    /// * `rhs` - A tensor of shape `[B*, K, N]`, or `[K, N]` shared by every batch.
    ///
    /// ## Returns
    /// * `Result<Tensor, TensorError>` - A new tensor of shape `[B*, M, N]`,
    ///   or an error if the dimensions are incompatible.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor, TensorError> {
        let (lx, ly) = (self.layout(), rhs.layout());
        if lx.len() < 2 {
            return Err(TensorError::Rank(2, lx));
        }
        if ly.len() < 2 {
            return Err(TensorError::Rank(2, ly));
        }

        let (batch, [m, k]) = (&lx[..lx.len() - 2], [lx[lx.len() - 2], lx[lx.len() - 1]]);
        let (other, [ky, n]) = (&ly[..ly.len() - 2], [ly[ly.len() - 2], ly[ly.len() - 1]]);
        let shared = other.is_empty();
        if k != ky || (!shared && batch != other) {
            return Err(TensorError::Mismatch(lx, ly));
        }

        let shape = MatMulShape {
            batch: batch.iter().product(),
            m,
            k,
            n,
            shared,
        };
        let data = cpu::matmul::matmul(self.data(), rhs.data(), shape);
        let output = Layout::from_shape([batch, &[m, n][..]].concat());
        Ok(Tensor::from_op(output, data, MatMulOp { shared }, &[self, rhs]))
    }

    /// # Softmax (`softmax`)
    /// Performs softmax normalization over the last axis.
    #[inline]
    pub fn softmax(&self) -> Tensor {
        let data = cpu::softmax::softmax(self.data(), self.layout().last());
        Tensor::from_op(self.layout(), data, SoftmaxOp, &[self])
    }

    /// # Sparsemax (`sparsemax`)
    /// Projects the last axis onto the probability simplex. Unlike softmax,
    /// the output can contain exact zeros.
    #[inline]
    pub fn sparsemax(&self) -> Tensor {
        let data = cpu::softmax::sparsemax(self.data(), self.layout().last());
        Tensor::from_op(self.layout(), data, SparsemaxOp, &[self])
    }

    /// # 1D Convolution (`conv1d`)
    /// Convolves a sequence with a bank of filters.
    ///
    /// ## Arguments
    /// * `self` - The input of shape `[B, T, C]`.
    /// * `filters` - Filters of shape `[K, C, F]`.
    /// * `dilation` - Spacing between kernel taps.
    /// * `padding` - How the time axis is padded.
    ///
    /// ## Returns
    /// * `Result<Tensor, TensorError>` - The output of shape `[B, T', F]`.
    pub fn conv1d(
        &self,
        filters: &Tensor,
        dilation: usize,
        padding: Padding,
    ) -> Result<Tensor, TensorError> {
        let [b, t, c] = self.layout().try_to_array()?;
        let [k, cf, f] = filters.layout().try_to_array()?;
        if c != cf {
            return Err(TensorError::Mismatch(self.layout(), filters.layout()));
        }

        let dilation = dilation.max(1);
        let span = k.saturating_sub(1) * dilation + 1;
        let (left, right) = padding.split(span);
        let steps = (t + left + right + 1).saturating_sub(span);

        // im2col: [b, steps, k, c]
        let map = itertools::iproduct!(0..b, 0..steps, 0..k, 0..c)
            .map(|(batch, step, tap, channel)| {
                let time = (step + tap * dilation).checked_sub(left)?;
                (time < t).then_some((0, (batch * t + time) * c + channel))
            })
            .collect();
        let columns = Tensor::gather(&[self], Layout::from_shape([b * steps, k * c]), map);
        let filters = filters.reshape([k * c, f])?;
        columns.matmul(&filters)?.reshape([b, steps, f])
    }
}

impl SparseTensor {
    /// Densifies the tensor. Duplicate entries are summed. Differentiable w.r.t. the values.
    pub fn to_dense(&self) -> Tensor {
        let layout = self.layout();
        let offsets = self.offsets();
        let mut data = vec![0.0; layout.size()];
        for (&offset, &value) in offsets.iter().zip_eq(self.values().data()) {
            data[offset] += value;
        }
        let op = ScatterOp {
            offsets: offsets.into(),
        };
        Tensor::from_op(layout, data, op, &[self.values()])
    }

    /// # Sparse-Dense Matrix Multiplication (`matmul`)
    /// Multiplies a `[M, K]` sparse matrix with a `[K, N]` dense one.
    /// Differentiable w.r.t. the values and the dense operand.
    pub fn matmul(&self, dense: &Tensor) -> Result<Tensor, TensorError> {
        let [m, k] = self.layout().try_to_array()?;
        let [kd, n] = dense.layout().try_to_array()?;
        if k != kd {
            return Err(TensorError::Mismatch(self.layout(), dense.layout()));
        }
        let indices = self
            .entries()
            .map(|index| [index[0], index[1]])
            .collect_vec();
        let data = cpu::matmul::sparse_matmul(&indices, self.values().data(), dense.data(), m, n);
        let op = SparseMatMulOp {
            indices: indices.into(),
        };
        Ok(Tensor::from_op([m, n].into_layout(), data, op, &[self.values(), dense]))
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $fn:ident, $try:ident) => {
        impl std::ops::$trait<&Tensor> for &Tensor {
            type Output = Tensor;

            fn $fn(self, rhs: &Tensor) -> Self::Output {
                self.$try(rhs).expect("tensor layouts must match")
            }
        }

        impl std::ops::$trait<Tensor> for Tensor {
            type Output = Tensor;

            fn $fn(self, rhs: Tensor) -> Self::Output {
                self.$try(&rhs).expect("tensor layouts must match")
            }
        }
    };
}

impl_binary_operator!(Add, add, try_add);
impl_binary_operator!(Sub, sub, try_sub);
impl_binary_operator!(Mul, mul, try_mul);
impl_binary_operator!(Div, div, try_div);

impl std::ops::Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Self::Output {
        Tensor::neg(self)
    }
}

impl std::ops::Neg for Tensor {
    type Output = Tensor;

    fn neg(self) -> Self::Output {
        Tensor::neg(&self)
    }
}

impl std::ops::Mul<f32> for &Tensor {
    type Output = Tensor;

    fn mul(self, rhs: f32) -> Self::Output {
        self.mul_scalar(rhs)
    }
}

impl std::ops::Add<f32> for &Tensor {
    type Output = Tensor;

    fn add(self, rhs: f32) -> Self::Output {
        self.add_scalar(rhs)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use approx::assert_abs_diff_eq;
    use itertools::Itertools;

    use crate::{
        hal::ops::Padding,
        loom::{
            sparse::SparseTensor,
            tensor::{Indices, Tensor, TensorError},
            variable::Variable,
        },
    };

    /// Compares the gradient of `f` at `x` with central finite differences.
    fn check_grad<F>(x: Tensor, f: F) -> Result<(), Box<dyn Error>>
    where
        F: Fn(&Tensor) -> Result<Tensor, TensorError>,
    {
        let var = Variable::new("x", x.clone());
        let grads = f(&var.value())?.sum_all()?.backward()?;
        let grad = grads.get(&var).ok_or("missing gradient")?;

        let eps = 1e-2;
        for (offset, &g) in grad.data().iter().enumerate() {
            let shift = |delta: f32| -> Result<f32, Box<dyn Error>> {
                let mut data = x.to_vec();
                data[offset] += delta;
                let y = f(&Tensor::create(x.layout(), data)?)?;
                Ok(y.sum_all()?.item()?)
            };
            let numeric = (shift(eps)? - shift(-eps)?) / (2.0 * eps);
            assert_abs_diff_eq!(g, numeric, epsilon = 1e-2);
        }
        Ok(())
    }

    fn random(shape: &[usize]) -> Result<Tensor, TensorError> {
        fastrand::seed(42);
        let size = shape.iter().product();
        let data = (0..size).map(|_| fastrand::f32() - 0.5).collect_vec();
        Tensor::create(shape.to_vec(), data)
    }

    #[test]
    fn test_broadcast_grad() -> Result<(), Box<dyn Error>> {
        let y = random(&[3])?;
        check_grad(random(&[2, 3])?, |x| x.try_mul(&y)?.try_add(&y))?;
        let x = random(&[2, 3])?;
        check_grad(y.clone(), |y| x.try_div(&y.add_scalar(2.0)))?;
        Ok(())
    }

    #[test]
    fn test_unary_grad() -> Result<(), Box<dyn Error>> {
        let x = random(&[4, 3])?;
        check_grad(x.clone(), |x| Ok(x.tanh()))?;
        check_grad(x.clone(), |x| Ok(x.sigmoid().square()))?;
        check_grad(x.clone(), |x| Ok(x.softplus()))?;
        check_grad(x.clone(), |x| Ok(x.elu(1.0)))?;
        check_grad(x, |x| Ok(x.add_scalar(2.0).log()))?;
        Ok(())
    }

    #[test]
    fn test_matmul() -> Result<(), Box<dyn Error>> {
        let x = Tensor::create([2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        let y = Tensor::create([3, 1], vec![1.0, 0.0, -1.0])?;
        let z = x.matmul(&y)?;
        assert_eq!(z.shape(), &[2, 1]);
        assert_eq!(z.data(), &[-2.0, -2.0]);
        assert!(y.matmul(&y).is_err());

        let w = random(&[3, 4])?;
        check_grad(random(&[2, 2, 3])?, |x| x.matmul(&w))?;
        let x = random(&[2, 2, 3])?;
        check_grad(w, |w| x.matmul(w))?;
        let v = random(&[2, 3, 4])?;
        check_grad(x, |x| x.matmul(&v))?;
        Ok(())
    }

    #[test]
    fn test_reduce() -> Result<(), Box<dyn Error>> {
        let x = Tensor::create([2, 3], vec![1.0, 5.0, 2.0, 4.0, 0.0, 6.0])?;
        assert_eq!(x.sum(0, false)?.data(), &[5.0, 5.0, 8.0]);
        assert_eq!(x.sum(-1, true)?.shape(), &[2, 1]);
        assert_eq!(x.max(1, false)?.data(), &[5.0, 6.0]);
        assert_eq!(x.mean_all()?.item()?, 3.0);
        let rows = Tensor::full([1000, 1], 100.0);
        assert_eq!(rows.mean_all()?.item()?, 100.0);
        assert_eq!(rows.mean(0, false)?.data(), &[100.0]);
        assert_eq!(x.div_scalar(2.0).data(), &[0.5, 2.5, 1.0, 2.0, 0.0, 3.0]);
        check_grad(random(&[2, 3])?, |x| Ok(x.div_scalar(3.0)))?;

        check_grad(random(&[2, 3, 2])?, |x| x.mean(1, false))?;
        check_grad(random(&[2, 3])?, |x| x.max(-1, true))?;
        check_grad(random(&[2, 3])?, |x| x.norm(-1, false))?;
        Ok(())
    }

    #[test]
    fn test_indexing() -> Result<(), Box<dyn Error>> {
        let x = Tensor::create([2, 3], (0..6).map(|x| x as f32).collect_vec())?;
        assert_eq!(x.transpose()?.data(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert_eq!(x.narrow(1, 1, 2)?.data(), &[1.0, 2.0, 4.0, 5.0]);
        assert_eq!(x.pad(1, 1, 0)?.data(), &[0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0, 5.0]);

        let z = Tensor::concat(&[x.clone(), x.clone()], -1)?;
        assert_eq!(z.shape(), &[2, 6]);
        assert_eq!(z.split(-1, 2)?, vec![x.clone(), x.clone()]);
        assert!(Tensor::concat(&[x.clone(), x.transpose()?], 0).is_err());

        let ids = Indices::from_rows(&[[1, 1, 0]])?;
        let z = x.index_select(&ids)?;
        assert_eq!(z.shape(), &[1, 3, 3]);
        assert_eq!(z.data()[..3], [3.0, 4.0, 5.0]);

        let y = random(&[2, 2])?;
        check_grad(random(&[2, 3])?, |x| x.transpose()?.matmul(&y))?;
        check_grad(random(&[3, 2])?, |x| x.index_select(&ids)?.square().sum(1, false))?;
        check_grad(random(&[2, 3])?, |x| Tensor::concat(&[x.clone(), x.square()], 0))?;
        check_grad(random(&[2, 3])?, |x| Ok(x.pad(0, 1, 1)?.softmax().log()))?;
        Ok(())
    }

    #[test]
    fn test_softmax_grad() -> Result<(), Box<dyn Error>> {
        let w = random(&[3])?;
        check_grad(random(&[2, 3])?, |x| x.softmax().try_mul(&w))?;
        check_grad(random(&[2, 3])?.mul_scalar(4.0), |x| x.sparsemax().try_mul(&w))?;
        Ok(())
    }

    #[test]
    fn test_conv1d() -> Result<(), Box<dyn Error>> {
        let x = Tensor::ones([1, 5, 2]);
        let filters = Tensor::ones([3, 2, 1]);

        let same = x.conv1d(&filters, 1, Padding::Same)?;
        assert_eq!(same.shape(), &[1, 5, 1]);
        assert_eq!(same.data(), &[4.0, 6.0, 6.0, 6.0, 4.0]);

        let valid = x.conv1d(&filters, 1, Padding::Valid)?;
        assert_eq!(valid.data(), &[6.0, 6.0, 6.0]);

        let causal = x.conv1d(&filters, 2, Padding::Causal)?;
        let padded = x.pad(1, 4, 0)?.conv1d(&filters, 2, Padding::Valid)?;
        assert_eq!(causal, padded);
        assert_eq!(causal.data(), &[2.0, 2.0, 4.0, 4.0, 6.0]);

        let filters = random(&[2, 2, 3])?;
        check_grad(random(&[2, 4, 2])?, |x| x.conv1d(&filters, 1, Padding::Same))?;
        Ok(())
    }

    #[test]
    fn test_sparse_matmul() -> Result<(), Box<dyn Error>> {
        let dense = random(&[2, 3])?;
        let sp = SparseTensor::from_dense(&dense);
        let w = random(&[3, 2])?;
        assert_abs_diff_eq!(
            sp.matmul(&w)?.data(),
            dense.matmul(&w)?.data(),
            epsilon = 1e-6
        );
        check_grad(random(&[2, 3])?, |x| SparseTensor::from_dense(x).matmul(&w))?;
        check_grad(w.clone(), |w| sp.matmul(w))?;
        Ok(())
    }
}
