//! Full prediction model: graph attention over lanes, recurrence over time.
//!
//! The graph runs GAT encoder -> dropout -> dense -> fold -> GRU encoder ->
//! attention decoder -> unfold -> one dense head per target feature. All
//! parameters live in a single [`VarMap`], which also handles safetensors
//! persistence, so a model rebuilt from the same hyperparameter record can
//! load a checkpoint and reproduce its predictions exactly.

use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::error::GnnResult;
use crate::gat::GatEncoder;
use crate::reshape::{fold_lanes, unfold_lanes};
use crate::rnn::{AttnDecoder, GruEncoder};

pub struct TrafficGnnModel {
    config: ModelConfig,
    var_map: VarMap,
    gat: GatEncoder,
    dropout: Dropout,
    dense: Linear,
    encoder: GruEncoder,
    decoder: AttnDecoder,
    heads: Vec<Linear>,
}

impl TrafficGnnModel {
    pub fn new(config: &ModelConfig, device: &Device) -> GnnResult<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let gat = GatEncoder::new(config, vb.pp("gat"))?;
        let dense = linear(config.gat_output_dim(), config.dense_dim, vb.pp("dense"))?;
        let encoder = GruEncoder::new(config, config.dense_dim, vb.pp("encoder"))?;
        let decoder = AttnDecoder::new(config, vb.pp("decoder"))?;
        let mut heads = Vec::with_capacity(config.y_features.len());
        for name in &config.y_features {
            heads.push(linear(config.rnn_dim, 1, vb.pp(format!("head_{name}")))?);
        }

        Ok(Self {
            config: config.clone(),
            var_map,
            gat,
            dropout: Dropout::new(config.dropout),
            dense,
            encoder,
            decoder,
            heads,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Total number of trainable parameters.
    pub fn parameter_count(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Names of the predicted targets, in output-channel order.
    pub fn target_names(&self) -> &[String] {
        &self.config.y_features
    }

    /// Clear all carried recurrent state. Called at run-group boundaries.
    pub fn reset_states(&mut self) {
        self.encoder.reset_state();
        self.decoder.reset_state();
    }

    /// Features `(B, T, N, F)`, adjacency `(B, R, N, N)` ->
    /// predictions `(B, T, N, Fy)`.
    ///
    /// With `train` false both dropout layers are inactive, so inference is
    /// a pure function of the weights and the inputs.
    pub fn forward(&mut self, x: &Tensor, a: &Tensor, train: bool) -> GnnResult<Tensor> {
        let (_, _, n, _) = x.dims4()?;

        let h = self.gat.forward(x, a, train)?;
        let h = self.dropout.forward(&h, train)?;
        let h = self.dense.forward(&h)?.relu()?;

        let folded = fold_lanes(&h)?;
        let enc = self.encoder.forward(&folded)?;
        let dec = self.decoder.forward(&enc)?;
        let unfolded = unfold_lanes(&dec, n)?;

        let mut outputs = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            // Predicted quantities are non-negative counts and lengths.
            outputs.push(head.forward(&unfolded)?.relu()?);
        }
        Ok(Tensor::cat(&outputs, D::Minus1)?)
    }

    /// Prediction channel for target `index`, shape `(B, T, N)`.
    pub fn target_slice(&self, preds: &Tensor, index: usize) -> GnnResult<Tensor> {
        Ok(preds.narrow(3, index, 1)?.squeeze(3)?)
    }

    /// Training loss: the configured masked loss summed over targets.
    pub fn loss(&self, preds: &Tensor, targets: &Tensor) -> GnnResult<Tensor> {
        let mut total: Option<Tensor> = None;
        for k in 0..self.heads.len() {
            let p = preds.narrow(3, k, 1)?;
            let y = targets.narrow(3, k, 1)?;
            let l = self.config.loss_function.masked(&p, &y)?;
            total = Some(match total {
                Some(t) => t.add(&l)?,
                None => l,
            });
        }
        // validate() guarantees at least one target.
        total.ok_or_else(|| crate::error::GnnError::config("no targets configured"))
    }

    /// Write all weights as safetensors.
    pub fn save_weights(&self, path: &Path) -> GnnResult<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Load weights saved by [`Self::save_weights`] into this model.
    pub fn load_weights(&mut self, path: &Path) -> GnnResult<()> {
        self.var_map.load(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(config: &ModelConfig, b: usize, t: usize, n: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let f = config.x_features.len();
        let r = config.relation_names.len();
        let x = Tensor::randn(0f32, 1.0, (b, t, n, f), &device).unwrap();
        // Ring adjacency.
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

    #[test]
    fn test_forward_shape() {
        let config = ModelConfig::test();
        let mut model = TrafficGnnModel::new(&config, &Device::Cpu).unwrap();
        let (x, a) = inputs(&config, 2, 4, 5);
        let preds = model.forward(&x, &a, false).unwrap();
        assert_eq!(preds.dims(), &[2, 4, 5, 1]);
    }

    #[test]
    fn test_parameter_count_nonzero() {
        let config = ModelConfig::test();
        let model = TrafficGnnModel::new(&config, &Device::Cpu).unwrap();
        assert!(model.parameter_count() > 0);
    }

    #[test]
    fn test_loss_is_finite_scalar() {
        let config = ModelConfig::test();
        let mut model = TrafficGnnModel::new(&config, &Device::Cpu).unwrap();
        let (x, a) = inputs(&config, 2, 4, 5);
        let y = Tensor::ones((2, 4, 5, 1), DType::F32, &Device::Cpu).unwrap();
        let preds = model.forward(&x, &a, true).unwrap();
        let loss = model.loss(&preds, &y).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
    }

    #[test]
    fn test_save_load_reproduces_predictions() {
        let config = ModelConfig::test();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let (x, a) = inputs(&config, 2, 4, 5);

        let mut model = TrafficGnnModel::new(&config, &Device::Cpu).unwrap();
        model.save_weights(&path).unwrap();
        model.reset_states();
        let expected = model
            .forward(&x, &a, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let mut restored = TrafficGnnModel::new(&config, &Device::Cpu).unwrap();
        restored.load_weights(&path).unwrap();
        restored.reset_states();
        let actual = restored
            .forward(&x, &a, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_inference_is_deterministic() {
        let config = ModelConfig::test();
        let mut model = TrafficGnnModel::new(&config, &Device::Cpu).unwrap();
        let (x, a) = inputs(&config, 2, 4, 5);

        model.reset_states();
        let first = model
            .forward(&x, &a, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        model.reset_states();
        let second = model
            .forward(&x, &a, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(first, second);
    }
}
