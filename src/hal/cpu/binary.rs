use itertools::Itertools;

use crate::loom::{layout::Layout, tensor::TensorError};

/// The layout two layouts broadcast to, aligning trailing axes.
pub fn broadcast(x: &Layout, y: &Layout) -> Result<Layout, TensorError> {
    let rank = x.len().max(y.len());
    let dim = |layout: &Layout, axis: usize| match axis + layout.len() >= rank {
        true => layout[axis + layout.len() - rank],
        false => 1,
    };
    (0..rank)
        .map(|axis| match (dim(x, axis), dim(y, axis)) {
            (a, b) if a == b => Ok(a),
            (1, b) => Ok(b),
            (a, 1) => Ok(a),
            _ => Err(TensorError::Broadcast(x.clone(), y.clone())),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Layout::from_shape)
}

/// For each element of `output`, the offset of the element of `input` broadcast to it.
pub fn broadcast_offsets(input: &Layout, output: &Layout) -> Vec<usize> {
    let pad = output.len() - input.len();
    let strides = input.strides();
    let strides = (0..output.len())
        .map(|axis| match axis.checked_sub(pad) {
            Some(axis) if input[axis] != 1 => strides[axis],
            _ => 0,
        })
        .collect_vec();
    (0..output.size())
        .map(|offset| {
            output
                .index(offset)
                .into_iter()
                .zip_eq(strides.iter())
                .map(|(index, stride)| index * stride)
                .sum()
        })
        .collect()
}

/// Applies `f` element-wise to `x` and `y` broadcast to `output`.
pub fn binary<F>(x: (&[f32], &Layout), y: (&[f32], &Layout), output: &Layout, f: F) -> Vec<f32>
where
    F: Fn(f32, f32) -> f32 + Send + Sync,
{
    let ((x, lx), (y, ly)) = (x, y);
    if lx == output && ly == output {
        #[cfg(not(feature = "rayon"))]
        let output = x.iter().zip_eq(y.iter()).map(|(&x, &y)| f(x, y)).collect();
        #[cfg(feature = "rayon")]
        let output = {
            use rayon::prelude::*;
            x.par_iter().zip_eq(y.par_iter()).map(|(&x, &y)| f(x, y)).collect()
        };
        return output;
    }

    let ox = broadcast_offsets(lx, output);
    let oy = broadcast_offsets(ly, output);
    ox.into_iter()
        .zip_eq(oy)
        .map(|(ox, oy)| f(x[ox], y[oy]))
        .collect()
}

/// Applies `f` element-wise.
pub fn unary<F>(x: &[f32], f: F) -> Vec<f32>
where
    F: Fn(f32) -> f32 + Send + Sync,
{
    #[cfg(not(feature = "rayon"))]
    let output = x.iter().map(|&x| f(x)).collect();
    #[cfg(feature = "rayon")]
    let output = {
        use rayon::prelude::*;
        x.par_iter().map(|&x| f(x)).collect()
    };
    output
}

/// Sums `data` of layout `from` down to the layout `to` it was broadcast from.
pub fn sum_to(data: &[f32], from: &Layout, to: &Layout) -> Vec<f32> {
    if from == to {
        return data.to_vec();
    }
    let mut output = vec![0.0; to.size()];
    for (offset, &x) in broadcast_offsets(to, from).into_iter().zip_eq(data) {
        output[offset] += x;
    }
    output
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{binary, broadcast, sum_to};
    use crate::loom::layout::Layout;

    #[test]
    fn test_broadcast() -> Result<(), Box<dyn Error>> {
        let x = Layout::from_shape([2, 1, 3]);
        let y = Layout::from_shape([4, 1]);
        let z = broadcast(&x, &y)?;
        assert_eq!(z, Layout::from_shape([2, 4, 3]));
        assert!(broadcast(&x, &Layout::from_shape([2])).is_err());

        let output = binary(
            (&[1.0, 2.0], &Layout::from_shape([2, 1])),
            (&[10.0, 20.0, 30.0], &Layout::from_shape([3])),
            &Layout::from_shape([2, 3]),
            |x, y| x + y,
        );
        assert_eq!(output, vec![11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);

        let output = sum_to(&output, &Layout::from_shape([2, 3]), &Layout::from_shape([3]));
        assert_eq!(output, vec![23.0, 43.0, 63.0]);
        Ok(())
    }
}
