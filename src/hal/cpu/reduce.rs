/// Sums the middle axis of data viewed as `[outer, dim, inner]`.
pub fn sum(data: &[f32], (outer, dim, inner): (usize, usize, usize)) -> Vec<f32> {
    let mut output = vec![0.0; outer * inner];
    for (o, i) in itertools::iproduct!(0..outer, 0..dim) {
        let x = &data[(o * dim + i) * inner..(o * dim + i + 1) * inner];
        let z = &mut output[o * inner..(o + 1) * inner];
        for (z, &x) in z.iter_mut().zip(x) {
            *z += x;
        }
    }
    output
}

/// Maximum over the middle axis of data viewed as `[outer, dim, inner]`.
/// Also returns the offset of each maximum in `data`. The first maximum wins ties.
pub fn max(data: &[f32], (outer, dim, inner): (usize, usize, usize)) -> (Vec<f32>, Vec<usize>) {
    let mut output = vec![f32::NEG_INFINITY; outer * inner];
    let mut argmax = vec![0; outer * inner];
    for (o, i, j) in itertools::iproduct!(0..outer, 0..dim, 0..inner) {
        let offset = (o * dim + i) * inner + j;
        let index = o * inner + j;
        if i == 0 || data[offset] > output[index] {
            output[index] = data[offset];
            argmax[index] = offset;
        }
    }
    (output, argmax)
}

#[cfg(test)]
mod tests {
    use super::{max, sum};

    #[test]
    fn test_reduce() {
        // [2, 3]
        let data = [1.0, 5.0, 2.0, 4.0, 0.0, 6.0];
        assert_eq!(sum(&data, (1, 2, 3)), vec![5.0, 5.0, 8.0]);
        assert_eq!(sum(&data, (2, 3, 1)), vec![8.0, 10.0]);

        let (output, argmax) = max(&data, (2, 3, 1));
        assert_eq!(output, vec![5.0, 6.0]);
        assert_eq!(argmax, vec![1, 5]);
    }
}
