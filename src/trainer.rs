//! Training loop: epochs over windowed batches with stateful resets,
//! per-epoch validation, epoch-tagged checkpoints, plateau learning-rate
//! reduction and early stopping.

use std::fs;
use std::path::Path;

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::checkpoint_filename;
use crate::config::ModelConfig;
use crate::data::{Batch, Batcher};
use crate::error::{GnnError, GnnResult};
use crate::losses::valid_count;
use crate::model::TrafficGnnModel;
use crate::scheduler::{PlateauConfig, ReduceOnPlateau};

/// Knobs of the loop itself, as opposed to the model hyperparameters.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Maximum number of epochs.
    pub epochs: usize,
    /// Proportion of runs held out for validation.
    pub val_split: f32,
    /// Epochs without val_loss improvement before stopping.
    pub early_stop_patience: usize,
    /// Plateau learning-rate reduction.
    pub plateau: PlateauConfig,
    /// Emit a debug log line every this many steps.
    pub log_every: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 50,
            val_split: 0.2,
            early_stop_patience: 10,
            plateau: PlateauConfig::default(),
            log_every: 10,
        }
    }
}

/// Per-epoch record returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    /// Training loss of every step, in batch order.
    pub batch_losses: Vec<f32>,
}

pub struct Trainer {
    config: ModelConfig,
    options: TrainOptions,
    device: Device,
}

impl Trainer {
    pub fn new(config: ModelConfig, options: TrainOptions, device: Device) -> GnnResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            options,
            device,
        })
    }

    /// Train on the preprocessed runs in `data_dir`, writing `params.json`
    /// and per-epoch checkpoints into `model_dir`.
    pub fn train(&self, data_dir: &Path, model_dir: &Path) -> GnnResult<Vec<EpochMetrics>> {
        fs::create_dir_all(model_dir)?;
        self.config.save(model_dir)?;

        let mut batcher = Batcher::new(data_dir, &self.config, &self.device)?;
        info!(
            runs = batcher.num_runs(),
            lanes = batcher.num_lanes(),
            "loaded preprocessed data"
        );
        if !self.config.stateful_rnn {
            batcher.shuffle(self.config.seed)?;
        }
        let (train_set, val_set) = batcher.split(self.options.val_split);
        let train_batches = train_set.batches()?;
        let val_batches = val_set.batches()?;
        if train_batches.is_empty() {
            return Err(GnnError::training("no training batches after split"));
        }

        let mut model = TrafficGnnModel::new(&self.config, &self.device)?;
        info!(parameters = model.parameter_count(), "built model");
        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            ..ParamsAdamW::default()
        };
        let mut optimizer = AdamW::new(model.var_map().all_vars(), params)?;
        let mut scheduler = ReduceOnPlateau::new(self.options.plateau.clone());

        let mut best_val = f64::INFINITY;
        let mut epochs_without_improvement = 0usize;
        let mut history = Vec::new();

        for epoch in 1..=self.options.epochs {
            model.reset_states();
            let pb = ProgressBar::new(train_batches.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("epoch {prefix} [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb.set_prefix(epoch.to_string());

            let mut batch_losses = Vec::with_capacity(train_batches.len());
            for (step, batch) in train_batches.iter().enumerate() {
                if batch.reset_state {
                    model.reset_states();
                }
                let preds = model.forward(&batch.x, &batch.a, true)?;
                let loss = model.loss(&preds, &batch.y)?;
                let value = loss.to_scalar::<f32>()?;
                if !value.is_finite() {
                    pb.finish_and_clear();
                    return Err(GnnError::NonFiniteLoss { epoch, step });
                }
                optimizer.backward_step(&loss)?;
                batch_losses.push(value);
                pb.set_message(format!("loss {value:.4}"));
                pb.inc(1);
                if step % self.options.log_every == 0 {
                    debug!(epoch, step, loss = value, "train step");
                }
            }
            pb.finish_and_clear();

            let train_loss =
                batch_losses.iter().map(|&v| v as f64).sum::<f64>() / batch_losses.len() as f64;
            let val_loss = if val_batches.is_empty() {
                train_loss
            } else {
                self.validation_loss(&mut model, &val_batches)?
            };
            model.reset_states();
            info!(
                epoch,
                train_loss,
                val_loss,
                lr = optimizer.learning_rate(),
                "epoch complete"
            );

            // Checkpoints are best-effort: a failed write must not kill a
            // long training job.
            let path = model_dir.join(checkpoint_filename(epoch, val_loss as f32));
            if let Err(e) = model.save_weights(&path) {
                warn!(error = %e, path = %path.display(), "checkpoint write failed; continuing");
            }

            if let Some(reduced) = scheduler.step(val_loss, optimizer.learning_rate()) {
                info!(
                    old_lr = optimizer.learning_rate(),
                    new_lr = reduced,
                    "reducing learning rate on plateau"
                );
                optimizer.set_learning_rate(reduced);
            }
            history.push(EpochMetrics {
                epoch,
                train_loss,
                val_loss,
                learning_rate: optimizer.learning_rate(),
                batch_losses,
            });

            if val_loss < best_val - 1e-4 {
                best_val = val_loss;
                epochs_without_improvement = 0;
            } else {
                epochs_without_improvement += 1;
                if epochs_without_improvement >= self.options.early_stop_patience {
                    info!(epoch, best_val, "early stopping");
                    break;
                }
            }
        }
        Ok(history)
    }

    /// Validation loss with no gradient updates.
    ///
    /// Per-batch losses are weighted by their valid-entry count, so a
    /// trailing partial run group (or a heavily masked window) does not
    /// count the same as a full batch.
    fn validation_loss(&self, model: &mut TrafficGnnModel, batches: &[Batch]) -> GnnResult<f64> {
        model.reset_states();
        let mut weighted_sum = 0f64;
        let mut total_weight = 0f64;
        for batch in batches {
            if batch.reset_state {
                model.reset_states();
            }
            let preds = model.forward(&batch.x, &batch.a, false)?;
            let loss = model.loss(&preds, &batch.y)?.to_scalar::<f32>()? as f64;
            let weight = valid_count(&batch.y)? as f64;
            weighted_sum += loss * weight;
            total_weight += weight;
        }
        Ok(weighted_sum / total_weight.max(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::MASK_VALUE;
    use candle_core::{DType, Tensor};

    fn inputs(config: &ModelConfig, b: usize, t: usize, n: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let f = config.x_features.len();
        let r = config.relation_names.len();
        let x = Tensor::randn(0f32, 1.0, (b, t, n, f), &device).unwrap();
        let mut adj = vec![0f32; n * n];
        for i in 0..n {
            adj[i * n + (i + 1) % n] = 1.0;
        }
        let a = Tensor::from_vec(adj, (1, 1, n, n), &device)
            .unwrap()
            .broadcast_as((b, r, n, n))
            .unwrap()
            .contiguous()
            .unwrap();
        (x, a)
    }

    fn batch(x: &Tensor, a: &Tensor, y: Tensor) -> Batch {
        let slots = x.dims4().unwrap().0;
        Batch {
            x: x.clone(),
            a: a.clone(),
            y,
            reset_state: true,
            run_names: (0..slots).map(|i| format!("run{i}")).collect(),
            window_start: 0,
        }
    }

    #[test]
    fn test_validation_loss_ignores_all_masked_batches() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let trainer = Trainer::new(config.clone(), TrainOptions::default(), device.clone()).unwrap();
        let mut model = TrafficGnnModel::new(&config, &device).unwrap();

        let (b, t, n) = (2, 4, 3);
        let (x, a) = inputs(&config, b, t, n);
        let y_valid = Tensor::ones((b, t, n, 1), DType::F32, &device).unwrap();
        let y_masked = Tensor::full(MASK_VALUE, (b, t, n, 1), &device).unwrap();

        let solo = trainer
            .validation_loss(&mut model, &[batch(&x, &a, y_valid.clone())])
            .unwrap();
        let with_masked = trainer
            .validation_loss(
                &mut model,
                &[batch(&x, &a, y_valid), batch(&x, &a, y_masked)],
            )
            .unwrap();

        // A batch with zero valid targets has zero weight, so the average
        // is unchanged.
        assert!((solo - with_masked).abs() < 1e-9);
    }

    #[test]
    fn test_validation_loss_weights_partial_batches() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let trainer = Trainer::new(config.clone(), TrainOptions::default(), device.clone()).unwrap();
        let mut model = TrafficGnnModel::new(&config, &device).unwrap();

        let (t, n) = (4, 3);
        let (x_full, a_full) = inputs(&config, 2, t, n);
        // Trailing partial group: one run slot instead of two.
        let x_part = x_full.narrow(0, 0, 1).unwrap();
        let a_part = a_full.narrow(0, 0, 1).unwrap();
        let y_full = Tensor::ones((2, t, n, 1), DType::F32, &device).unwrap();
        let y_part = (Tensor::ones((1, t, n, 1), DType::F32, &device).unwrap() * 3.0).unwrap();

        let full_loss = trainer
            .validation_loss(&mut model, &[batch(&x_full, &a_full, y_full.clone())])
            .unwrap();
        let part_loss = trainer
            .validation_loss(&mut model, &[batch(&x_part, &a_part, y_part.clone())])
            .unwrap();
        let combined = trainer
            .validation_loss(
                &mut model,
                &[
                    batch(&x_full, &a_full, y_full.clone()),
                    batch(&x_part, &a_part, y_part.clone()),
                ],
            )
            .unwrap();

        let full_weight = valid_count(&y_full).unwrap() as f64;
        let part_weight = valid_count(&y_part).unwrap() as f64;
        let expected =
            (full_loss * full_weight + part_loss * part_weight) / (full_weight + part_weight);
        assert!(
            (combined - expected).abs() < 1e-5,
            "combined {combined} vs expected {expected}"
        );
    }
}
