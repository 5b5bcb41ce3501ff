/// Shapes of a (batched) matrix product `[batch, m, k] x [batch, k, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulShape {
    pub batch: usize,
    pub m: usize,
    pub k: usize,
    pub n: usize,
    /// The right operand is a single `[k, n]` matrix shared by all batches.
    pub shared: bool,
}

#[inline]
fn row(x: &[f32], y: &[f32], shape: MatMulShape, r: usize, output: &mut [f32]) {
    let MatMulShape { m, k, n, shared, .. } = shape;
    let b = r / m.max(1);
    let x = &x[r * k..(r + 1) * k];
    let y = match shared {
        true => y,
        false => &y[b * k * n..(b + 1) * k * n],
    };
    for (p, &a) in x.iter().enumerate() {
        if a == 0.0 {
            continue;
        }
        let y = &y[p * n..(p + 1) * n];
        for (z, &y) in output.iter_mut().zip(y) {
            *z += a * y;
        }
    }
}

/// Computes `x · y` for row-major operands.
pub fn matmul(x: &[f32], y: &[f32], shape: MatMulShape) -> Vec<f32> {
    let MatMulShape { batch, m, n, .. } = shape;
    let mut output = vec![0.0; batch * m * n];
    if n == 0 {
        return output;
    }

    #[cfg(not(feature = "rayon"))]
    output
        .chunks_exact_mut(n)
        .enumerate()
        .for_each(|(r, z)| row(x, y, shape, r, z));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        output
            .par_chunks_exact_mut(n)
            .enumerate()
            .for_each(|(r, z)| row(x, y, shape, r, z));
    }
    output
}

/// Computes `sp · y` where `sp` is a `[rows, k]` matrix in coordinate format
/// given by `(row, col)` index pairs and `values`.
pub fn sparse_matmul(
    indices: &[[usize; 2]],
    values: &[f32],
    y: &[f32],
    rows: usize,
    n: usize,
) -> Vec<f32> {
    let mut output = vec![0.0; rows * n];
    for (&[r, c], &v) in indices.iter().zip(values) {
        let y = &y[c * n..(c + 1) * n];
        let z = &mut output[r * n..(r + 1) * n];
        for (z, &y) in z.iter_mut().zip(y) {
            *z += v * y;
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{MatMulShape, matmul, sparse_matmul};

    #[test]
    fn test_matmul() {
        let x = (0..12).map(|x| x as f32).collect_vec();
        let y = (0..6).map(|x| x as f32).collect_vec();

        // [2, 2, 3] x [3, 2]
        let shape = MatMulShape {
            batch: 2,
            m: 2,
            k: 3,
            n: 2,
            shared: true,
        };
        let output = matmul(&x, &y, shape);
        let r#ref = itertools::iproduct!(0..4, 0..2)
            .map(|(r, j)| (0..3).map(|p| x[r * 3 + p] * y[p * 2 + j]).sum::<f32>())
            .collect_vec();
        assert_eq!(output, r#ref);
    }

    #[test]
    fn test_sparse_matmul() {
        let y = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let output = sparse_matmul(&[[0, 2], [1, 0], [1, 1]], &[2.0, 1.0, 1.0], &y, 2, 2);
        assert_eq!(output, vec![10.0, 12.0, 4.0, 6.0]);
    }
}
