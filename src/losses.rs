//! Masked and unmasked regression losses.
//!
//! Preprocessed target tensors use a sentinel value ([`MASK_VALUE`]) for
//! entries that carry no ground truth, e.g. lanes without a detector for a
//! given quantity or padded timesteps. The masked variants exclude those
//! entries from the reduction while staying on the autodiff graph, so the
//! mask shapes the gradient as well as the reported metric.

use candle_core::{DType, Tensor};

use crate::error::GnnResult;
use serde::{Deserialize, Serialize};

/// Sentinel marking target entries that must not contribute to any loss.
/// All predicted quantities (counts, occupancies, queue lengths) are
/// non-negative, so -1 is unambiguous.
pub const MASK_VALUE: f32 = -1.0;

/// Huber transition point between quadratic and linear regimes.
const HUBER_DELTA: f64 = 1.0;

/// Epsilon guarding the MAPE denominator.
const MAPE_EPS: f64 = 1e-7;

/// Selectable training loss. The masked variant is always used for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Mean absolute error.
    Mae,
    /// Mean squared error.
    Mse,
    /// Huber loss (quadratic below delta, linear above).
    Huber,
    /// Mean absolute percentage error.
    Mape,
}

impl LossKind {
    /// Apply the masked variant of this loss.
    pub fn masked(&self, pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
        match self {
            Self::Mae => masked_mae(pred, target),
            Self::Mse => masked_mse(pred, target),
            Self::Huber => masked_huber(pred, target),
            Self::Mape => masked_mape(pred, target),
        }
    }
}

/// 1.0 where the target is valid, 0.0 where it equals the sentinel.
fn mask_of(target: &Tensor) -> GnnResult<Tensor> {
    Ok(target.ne(MASK_VALUE as f64)?.to_dtype(DType::F32)?)
}

/// Number of unmasked target entries.
pub fn valid_count(target: &Tensor) -> GnnResult<f32> {
    Ok(mask_of(target)?.sum_all()?.to_scalar::<f32>()?)
}

/// Reduce a per-element error tensor over the valid entries only.
///
/// The denominator is clamped to at least one so a fully masked batch
/// yields a defined zero instead of a NaN.
fn masked_mean(per_element: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    let mask = mask_of(target)?;
    let num = (per_element * &mask)?.sum_all()?;
    let den = mask.sum_all()?.maximum(1f64)?;
    Ok(num.broadcast_div(&den)?)
}

fn abs_error(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    Ok(pred.sub(target)?.abs()?)
}

fn squared_error(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    Ok(pred.sub(target)?.sqr()?)
}

fn huber_error(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    let abs = abs_error(pred, target)?;
    let quadratic = abs.sqr()?.affine(0.5, 0.0)?;
    let linear = abs.affine(HUBER_DELTA, -0.5 * HUBER_DELTA * HUBER_DELTA)?;
    let small = abs.le(HUBER_DELTA)?;
    Ok(small.where_cond(&quadratic, &linear)?)
}

fn percentage_error(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    let abs = abs_error(pred, target)?;
    let denom = target.abs()?.maximum(MAPE_EPS)?;
    Ok(abs.div(&denom)?.affine(100.0, 0.0)?)
}

/// Mean absolute error over all entries.
pub fn mae(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    Ok(abs_error(pred, target)?.mean_all()?)
}

/// Mean squared error over all entries.
pub fn mse(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    Ok(squared_error(pred, target)?.mean_all()?)
}

/// Huber loss over all entries.
pub fn huber(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    Ok(huber_error(pred, target)?.mean_all()?)
}

/// Mean absolute percentage error over all entries.
pub fn mape(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    Ok(percentage_error(pred, target)?.mean_all()?)
}

/// Mean absolute error over unmasked entries.
pub fn masked_mae(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    masked_mean(&abs_error(pred, target)?, target)
}

/// Mean squared error over unmasked entries.
pub fn masked_mse(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    masked_mean(&squared_error(pred, target)?, target)
}

/// Huber loss over unmasked entries.
pub fn masked_huber(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    masked_mean(&huber_error(pred, target)?, target)
}

/// Mean absolute percentage error over unmasked entries.
pub fn masked_mape(pred: &Tensor, target: &Tensor) -> GnnResult<Tensor> {
    masked_mean(&percentage_error(pred, target)?, target)
}
