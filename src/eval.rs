//! Evaluation driver: rebuild a trained model from its saved
//! hyperparameter record, load the latest checkpoint, and score it on the
//! held-out runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info};

use crate::checkpoint::find_latest;
use crate::config::ModelConfig;
use crate::data::{Batch, Batcher};
use crate::error::GnnResult;
use crate::losses::{masked_huber, masked_mae, masked_mape, masked_mse, valid_count};
use crate::model::TrafficGnnModel;

/// Filename of the serialized evaluation report.
pub const EVAL_METRICS_FILE: &str = "eval_metrics.json";

/// CLI-level overrides applied on top of the persisted record.
#[derive(Debug, Clone, Default)]
pub struct EvalOverrides {
    pub batch_size: Option<usize>,
    pub val_split: Option<f32>,
    pub seed: Option<u64>,
}

/// Masked metrics for one target, weighted by valid-entry count across
/// all evaluated windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetMetrics {
    pub mae: f64,
    pub mse: f64,
    pub huber: f64,
    pub mape: f64,
    pub valid_entries: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    /// Checkpoint file the weights came from.
    pub checkpoint: String,
    pub num_batches: usize,
    pub targets: BTreeMap<String, TargetMetrics>,
}

/// Predictions of one run's window, aligned by (time, lane).
#[derive(Debug, Clone, Serialize)]
pub struct WindowPrediction {
    pub run: String,
    pub window_start: usize,
    /// Target name -> T x N values.
    pub values: BTreeMap<String, Vec<Vec<f32>>>,
}

#[derive(Default)]
struct MetricSums {
    mae: f64,
    mse: f64,
    huber: f64,
    mape: f64,
    count: f64,
}

pub struct Evaluator {
    model: TrafficGnnModel,
    batches: Vec<Batch>,
    checkpoint: PathBuf,
    model_dir: PathBuf,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("checkpoint", &self.checkpoint)
            .field("model_dir", &self.model_dir)
            .field("num_batches", &self.batches.len())
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Rebuild the trained model.
    ///
    /// `params.json` and a checkpoint must exist in `model_dir`; either
    /// missing is fatal. By default the last 20% of runs (the training
    /// hold-out) are evaluated; `val_split` of zero evaluates everything.
    pub fn new(
        data_dir: &Path,
        model_dir: &Path,
        overrides: &EvalOverrides,
        device: &Device,
    ) -> GnnResult<Self> {
        let mut config = ModelConfig::load(model_dir)?;
        if let Some(batch_size) = overrides.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(seed) = overrides.seed {
            // Evaluation never shuffles, so a seed cannot change the result.
            debug!(seed, "ignoring seed override: evaluation batches are unshuffled");
        }
        config.validate()?;

        let checkpoint = find_latest(model_dir)?;
        info!(checkpoint = %checkpoint.display(), "selected checkpoint");

        let mut model = TrafficGnnModel::new(&config, device)?;
        model.load_weights(&checkpoint)?;

        let val_split = overrides.val_split.unwrap_or(0.2);
        let batcher = Batcher::new(data_dir, &config, device)?;
        let batches = if val_split > 0.0 {
            batcher.split(val_split).1.batches()?
        } else {
            batcher.batches()?
        };

        Ok(Self {
            model,
            batches,
            checkpoint,
            model_dir: model_dir.to_path_buf(),
        })
    }

    /// Deterministic inference over the evaluation batches.
    ///
    /// Writes the report to `eval_metrics.json` in the model directory and
    /// returns it together with the per-window predictions.
    pub fn run(&mut self) -> GnnResult<(EvalReport, Vec<WindowPrediction>)> {
        let target_names: Vec<String> = self.model.target_names().to_vec();
        let mut sums: BTreeMap<String, MetricSums> = target_names
            .iter()
            .map(|n| (n.clone(), MetricSums::default()))
            .collect();
        let mut predictions = Vec::new();

        self.model.reset_states();
        for batch in &self.batches {
            if batch.reset_state {
                self.model.reset_states();
            }
            let preds = self.model.forward(&batch.x, &batch.a, false)?;

            for (k, name) in target_names.iter().enumerate() {
                let p = preds.narrow(3, k, 1)?;
                let y = batch.y.narrow(3, k, 1)?;
                let count = valid_count(&y)? as f64;
                if count == 0.0 {
                    continue;
                }
                let entry = sums
                    .get_mut(name)
                    .ok_or_else(|| crate::error::GnnError::training("unknown target"))?;
                entry.mae += masked_mae(&p, &y)?.to_scalar::<f32>()? as f64 * count;
                entry.mse += masked_mse(&p, &y)?.to_scalar::<f32>()? as f64 * count;
                entry.huber += masked_huber(&p, &y)?.to_scalar::<f32>()? as f64 * count;
                entry.mape += masked_mape(&p, &y)?.to_scalar::<f32>()? as f64 * count;
                entry.count += count;
            }

            for (slot, run) in batch.run_names.iter().enumerate() {
                let mut values = BTreeMap::new();
                for (k, name) in target_names.iter().enumerate() {
                    let series = self
                        .model
                        .target_slice(&preds, k)?
                        .narrow(0, slot, 1)?
                        .squeeze(0)?
                        .to_vec2::<f32>()?;
                    values.insert(name.clone(), series);
                }
                predictions.push(WindowPrediction {
                    run: run.clone(),
                    window_start: batch.window_start,
                    values,
                });
            }
        }

        let targets = sums
            .into_iter()
            .map(|(name, s)| {
                let d = if s.count > 0.0 { s.count } else { 1.0 };
                (
                    name,
                    TargetMetrics {
                        mae: s.mae / d,
                        mse: s.mse / d,
                        huber: s.huber / d,
                        mape: s.mape / d,
                        valid_entries: s.count,
                    },
                )
            })
            .collect();

        let report = EvalReport {
            checkpoint: self
                .checkpoint
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            num_batches: self.batches.len(),
            targets,
        };
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(self.model_dir.join(EVAL_METRICS_FILE), json)?;
        info!(
            batches = report.num_batches,
            "evaluation complete, report written"
        );
        Ok((report, predictions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GnnError;

    #[test]
    fn test_missing_params_is_fatal() {
        let data = tempfile::tempdir().unwrap();
        let model = tempfile::tempdir().unwrap();
        let err = Evaluator::new(
            data.path(),
            model.path(),
            &EvalOverrides::default(),
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, GnnError::Config(_)));
    }

    #[test]
    fn test_missing_checkpoint_is_fatal() {
        let data = tempfile::tempdir().unwrap();
        let model_dir = tempfile::tempdir().unwrap();
        ModelConfig::test().save(model_dir.path()).unwrap();
        let err = Evaluator::new(
            data.path(),
            model_dir.path(),
            &EvalOverrides::default(),
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, GnnError::CheckpointNotFound { .. }));
    }
}
