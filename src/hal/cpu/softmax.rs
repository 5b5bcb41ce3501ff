use itertools::Itertools;

fn softmax_row(x: &[f32], z: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for (z, &x) in z.iter_mut().zip(x) {
        *z = (x - max).exp();
        sum += *z;
    }
    z.iter_mut().for_each(|z| *z /= sum);
}

/// Euclidean projection of the row onto the probability simplex.
fn sparsemax_row(x: &[f32], z: &mut [f32]) {
    let sorted = x
        .iter()
        .copied()
        .sorted_by(|a, b| b.total_cmp(a))
        .collect_vec();
    let mut cumsum = 0.0;
    let mut tau = 0.0;
    for (k, &x) in sorted.iter().enumerate() {
        cumsum += x;
        let k = (k + 1) as f32;
        if 1.0 + k * x > cumsum {
            tau = (cumsum - 1.0) / k;
        }
    }
    for (z, &x) in z.iter_mut().zip(x) {
        *z = (x - tau).max(0.0);
    }
}

fn rows(data: &[f32], cols: usize, f: fn(&[f32], &mut [f32])) -> Vec<f32> {
    let mut output = vec![0.0; data.len()];
    if cols == 0 {
        return output;
    }

    #[cfg(not(feature = "rayon"))]
    output
        .chunks_exact_mut(cols)
        .zip_eq(data.chunks_exact(cols))
        .for_each(|(z, x)| f(x, z));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        output
            .par_chunks_exact_mut(cols)
            .zip_eq(data.par_chunks_exact(cols))
            .for_each(|(z, x)| f(x, z));
    }
    output
}

/// Softmax over rows of length `cols`.
#[inline]
pub fn softmax(data: &[f32], cols: usize) -> Vec<f32> {
    rows(data, cols, softmax_row)
}

/// Sparsemax over rows of length `cols`.
#[inline]
pub fn sparsemax(data: &[f32], cols: usize) -> Vec<f32> {
    rows(data, cols, sparsemax_row)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::{softmax, sparsemax};

    #[test]
    fn test_softmax() {
        let output = softmax(&[1.0, 1.0, 1000.0, 0.0], 2);
        assert_relative_eq!(output[0], 0.5);
        assert_relative_eq!(output[2], 1.0);
        assert_relative_eq!(output[3], 0.0);
    }

    #[test]
    fn test_sparsemax() {
        let output = sparsemax(&[0.1, 2.0, 0.2, 0.5, 0.5, 0.0], 3);
        assert_relative_eq!(output[..3], [0.0, 1.0, 0.0][..]);
        assert_relative_eq!(output[3..], [0.5, 0.5, 0.0][..]);
    }
}
