//! Hyperparameter record for the graph-attention recurrent model.
//!
//! A [`ModelConfig`] fully determines the computation graph. Training writes
//! it to `params.json` in the model directory; evaluation reads it back and
//! rebuilds the identical graph before loading weights.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GnnError, GnnResult};
use crate::losses::LossKind;

/// Filename of the persisted hyperparameter record.
pub const PARAMS_FILE: &str = "params.json";

/// How the per-head outputs of a graph-attention layer are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadReduction {
    /// Average head outputs; layer width stays `attn_dim`.
    Average,
    /// Concatenate head outputs; layer width becomes `attn_dim * heads`.
    Concat,
}

/// How the per-relation outputs of a graph-attention layer are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationReduction {
    /// Concatenate relation outputs along the feature axis.
    Concat,
    /// Sum relation outputs elementwise.
    Sum,
}

/// Hyperparameters of the model and its batch pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Names of the adjacency relation types, in tensor order.
    pub relation_names: Vec<String>,
    /// Per-head output width of each graph-attention layer.
    pub attn_dims: Vec<usize>,
    /// Number of attention heads per graph-attention layer.
    pub attn_heads: Vec<usize>,
    /// Head combination rule.
    pub head_reduction: HeadReduction,
    /// Relation combination rule.
    pub relation_reduction: RelationReduction,
    /// Add the layer input back onto the attention output.
    pub attn_residual: bool,
    /// Dropout probability applied between the encoder and the dense layer.
    pub dropout: f32,
    /// Dropout probability applied to attention coefficients.
    pub attn_dropout: f32,
    /// Width of the dense layer feeding the recurrent stack.
    pub dense_dim: usize,
    /// Hidden width of the recurrent encoder and decoder.
    pub rnn_dim: usize,
    /// Carry recurrent state across consecutive windows of a run.
    pub stateful_rnn: bool,
    /// Number of simulation runs advanced per batch.
    pub batch_size: usize,
    /// Timesteps per window (after averaging-interval downsampling).
    pub time_window: usize,
    /// Mean-pool this many raw timesteps into one model timestep.
    pub average_interval: usize,
    /// Training loss; its masked variant is applied per target.
    pub loss_function: LossKind,
    /// Input feature names, selected from the preprocessed data by name.
    pub x_features: Vec<String>,
    /// Target feature names; one output head per entry.
    pub y_features: Vec<String>,
    /// Initial learning rate for AdamW.
    pub learning_rate: f64,
    /// Seed for run-order shuffling.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            relation_names: vec![
                "A_downstream".to_string(),
                "A_upstream".to_string(),
                "A_neighbors".to_string(),
            ],
            attn_dims: vec![64],
            attn_heads: vec![4],
            head_reduction: HeadReduction::Average,
            relation_reduction: RelationReduction::Sum,
            attn_residual: false,
            dropout: 0.3,
            attn_dropout: 0.3,
            dense_dim: 64,
            rnn_dim: 64,
            stateful_rnn: true,
            batch_size: 4,
            time_window: 50,
            average_interval: 1,
            loss_function: LossKind::Huber,
            x_features: vec![
                "e1_0/occupancy".to_string(),
                "e1_0/speed".to_string(),
                "e1_1/occupancy".to_string(),
                "e1_1/speed".to_string(),
                "liu_estimated_veh".to_string(),
                "green".to_string(),
            ],
            y_features: vec![
                "e2_0/nVehSeen".to_string(),
                "e2_0/maxJamLengthInVehicles".to_string(),
            ],
            learning_rate: 1e-3,
            seed: 123,
        }
    }
}

impl ModelConfig {
    /// Small configuration for unit tests.
    pub fn test() -> Self {
        Self {
            relation_names: vec!["A_downstream".to_string()],
            attn_dims: vec![8],
            attn_heads: vec![2],
            head_reduction: HeadReduction::Average,
            relation_reduction: RelationReduction::Sum,
            attn_residual: false,
            dropout: 0.0,
            attn_dropout: 0.0,
            dense_dim: 8,
            rnn_dim: 8,
            stateful_rnn: true,
            batch_size: 2,
            time_window: 4,
            average_interval: 1,
            loss_function: LossKind::Huber,
            x_features: vec!["occupancy".to_string(), "speed".to_string()],
            y_features: vec!["queue".to_string()],
            learning_rate: 1e-2,
            seed: 123,
        }
    }

    /// Output width of graph-attention layer `layer`.
    pub fn gat_layer_dim(&self, layer: usize) -> usize {
        let per_head = self.attn_dims[layer];
        let after_heads = match self.head_reduction {
            HeadReduction::Average => per_head,
            HeadReduction::Concat => per_head * self.attn_heads[layer],
        };
        match self.relation_reduction {
            RelationReduction::Sum => after_heads,
            RelationReduction::Concat => after_heads * self.relation_names.len(),
        }
    }

    /// Output width of the full graph-attention stack.
    pub fn gat_output_dim(&self) -> usize {
        self.gat_layer_dim(self.attn_dims.len() - 1)
    }

    /// Check internal consistency. Called before any model is built.
    pub fn validate(&self) -> GnnResult<()> {
        if self.relation_names.is_empty() {
            return Err(GnnError::config("relation_names is empty"));
        }
        if self.attn_dims.is_empty() {
            return Err(GnnError::config("attn_dims is empty"));
        }
        if self.attn_dims.len() != self.attn_heads.len() {
            return Err(GnnError::config(format!(
                "attn_dims has {} layers but attn_heads has {}",
                self.attn_dims.len(),
                self.attn_heads.len()
            )));
        }
        if self.attn_dims.iter().any(|&d| d == 0) || self.attn_heads.iter().any(|&h| h == 0) {
            return Err(GnnError::config("attention dims and heads must be nonzero"));
        }
        if self.dense_dim == 0 || self.rnn_dim == 0 {
            return Err(GnnError::config("dense_dim and rnn_dim must be nonzero"));
        }
        if self.batch_size == 0 {
            return Err(GnnError::config("batch_size must be nonzero"));
        }
        if self.time_window == 0 {
            return Err(GnnError::config("time_window must be nonzero"));
        }
        if self.average_interval == 0 {
            return Err(GnnError::config("average_interval must be nonzero"));
        }
        if self.x_features.is_empty() || self.y_features.is_empty() {
            return Err(GnnError::config("feature subsets must be non-empty"));
        }
        if !(0.0..1.0).contains(&self.dropout) || !(0.0..1.0).contains(&self.attn_dropout) {
            return Err(GnnError::config("dropout rates must be in [0, 1)"));
        }
        if self.learning_rate <= 0.0 {
            return Err(GnnError::config("learning_rate must be positive"));
        }
        if self.attn_residual {
            // The residual add requires every layer to preserve its width.
            let mut in_dim = self.x_features.len();
            for layer in 0..self.attn_dims.len() {
                let out_dim = self.gat_layer_dim(layer);
                if in_dim != out_dim {
                    return Err(GnnError::config(format!(
                        "attn_residual requires layer {layer} input width {in_dim} \
                         to equal its output width {out_dim}"
                    )));
                }
                in_dim = out_dim;
            }
        }
        Ok(())
    }

    /// Write the record to `<dir>/params.json`.
    pub fn save(&self, dir: &Path) -> GnnResult<()> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(PARAMS_FILE), json)?;
        Ok(())
    }

    /// Read the record back from `<dir>/params.json`.
    ///
    /// A missing or malformed file is fatal: evaluation cannot proceed
    /// without the exact hyperparameters the weights were trained with.
    pub fn load(dir: &Path) -> GnnResult<Self> {
        let path = dir.join(PARAMS_FILE);
        let json = fs::read_to_string(&path).map_err(|e| {
            GnnError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            GnnError::config(format!("malformed {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        ModelConfig::default().validate().unwrap();
        ModelConfig::test().validate().unwrap();
    }

    #[test]
    fn test_serde_round_trip() {
        let config = ModelConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_validate_rejects_layer_mismatch() {
        let mut config = ModelConfig::test();
        config.attn_heads = vec![2, 2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_targets() {
        let mut config = ModelConfig::test();
        config.y_features.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_residual_width() {
        let mut config = ModelConfig::test();
        config.attn_residual = true;
        // 2 input features vs 8-wide attention output.
        assert!(config.validate().is_err());

        config.attn_dims = vec![2];
        config.attn_heads = vec![2];
        config.validate().unwrap();
    }

    #[test]
    fn test_gat_layer_dim() {
        let mut config = ModelConfig::test();
        config.relation_names = vec!["a".into(), "b".into()];
        config.attn_dims = vec![8];
        config.attn_heads = vec![4];

        config.head_reduction = HeadReduction::Average;
        config.relation_reduction = RelationReduction::Sum;
        assert_eq!(config.gat_layer_dim(0), 8);

        config.head_reduction = HeadReduction::Concat;
        assert_eq!(config.gat_layer_dim(0), 32);

        config.relation_reduction = RelationReduction::Concat;
        assert_eq!(config.gat_layer_dim(0), 64);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig::test();
        config.save(dir.path()).unwrap();
        let back = ModelConfig::load(dir.path()).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_load_missing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_load_malformed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PARAMS_FILE), "{not json").unwrap();
        assert!(ModelConfig::load(dir.path()).is_err());
    }
}
