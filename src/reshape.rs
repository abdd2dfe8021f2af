//! Fold and unfold between the lane axis and the batch axis.
//!
//! Recurrent layers operate on `(batch, time, features)` tensors. Folding
//! moves every lane of every run-slot into its own batch row, so each
//! (slot, lane) pair becomes an independent sequence; unfolding restores
//! the lane axis afterwards. The two are exact inverses.

use candle_core::Tensor;

use crate::error::GnnResult;

/// `(B, T, N, F)` -> `(B * N, T, F)`.
///
/// Row `b * N + n` of the result is the sequence of lane `n` in run-slot
/// `b`. Stateful recurrence relies on this ordering staying fixed across
/// consecutive batches, so `B` and `N` must not change mid-group.
pub fn fold_lanes(x: &Tensor) -> GnnResult<Tensor> {
    let (b, t, n, f) = x.dims4()?;
    Ok(x.transpose(1, 2)?.contiguous()?.reshape((b * n, t, f))?)
}

/// `(B * N, T, F)` -> `(B, T, N, F)`. Inverse of [`fold_lanes`].
pub fn unfold_lanes(x: &Tensor, num_lanes: usize) -> GnnResult<Tensor> {
    let (bn, t, f) = x.dims3()?;
    let b = bn / num_lanes;
    Ok(x.reshape((b, num_lanes, t, f))?
        .transpose(1, 2)?
        .contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_fold_shape() {
        let x = Tensor::zeros((3, 5, 7, 2), DType::F32, &Device::Cpu).unwrap();
        let folded = fold_lanes(&x).unwrap();
        assert_eq!(folded.dims(), &[21, 5, 2]);
    }

    #[test]
    fn test_fold_unfold_identity() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, (2 * 3 * 4 * 5) as f32, &device)
            .unwrap()
            .reshape((2, 3, 4, 5))
            .unwrap();

        let back = unfold_lanes(&fold_lanes(&x).unwrap(), 4).unwrap();

        assert_eq!(back.dims(), x.dims());
        let original = x.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let restored = back.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn test_fold_row_ordering() {
        let device = Device::Cpu;
        // B=2, T=1, N=2, F=1: values identify (slot, lane).
        let x = Tensor::from_slice(&[0f32, 1.0, 2.0, 3.0], (2, 1, 2, 1), &device).unwrap();
        let folded = fold_lanes(&x).unwrap();
        let rows = folded.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // Row order: (slot 0, lane 0), (slot 0, lane 1), (slot 1, lane 0), ...
        assert_eq!(rows, vec![0.0, 1.0, 2.0, 3.0]);
    }
}
