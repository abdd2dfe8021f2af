//! Graph-attention recurrent network for per-lane traffic state prediction.
//!
//! Preprocessed simulation runs provide per-lane detector features, a lane
//! graph with typed adjacency relations, and per-lane targets such as queue
//! lengths and vehicle counts. The model attends over the lane graph with
//! multi-head, multi-relation graph attention, folds lanes into the batch
//! axis, and runs a stateful GRU encoder with an attention decoder over
//! time. Targets may be partially unobserved; masked losses keep sentinel
//! entries out of both gradients and metrics.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use candle_core::Device;
//! use traffic_gnn::config::ModelConfig;
//! use traffic_gnn::trainer::{TrainOptions, Trainer};
//!
//! fn main() -> traffic_gnn::GnnResult<()> {
//!     let trainer = Trainer::new(ModelConfig::default(), TrainOptions::default(), Device::Cpu)?;
//!     let history = trainer.train(
//!         Path::new("data/networks/grid/preprocessed_data"),
//!         Path::new("models/grid"),
//!     )?;
//!     println!("trained {} epochs", history.len());
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod gat;
pub mod losses;
pub mod model;
pub mod reshape;
pub mod rnn;
pub mod scheduler;
pub mod trainer;

pub use config::ModelConfig;
pub use error::{GnnError, GnnResult};
pub use model::TrafficGnnModel;

/// Common imports.
pub mod prelude {
    pub use crate::config::{HeadReduction, ModelConfig, RelationReduction};
    pub use crate::data::{Batch, Batcher};
    pub use crate::error::{GnnError, GnnResult};
    pub use crate::eval::{EvalOverrides, Evaluator};
    pub use crate::losses::{LossKind, MASK_VALUE};
    pub use crate::model::TrafficGnnModel;
    pub use crate::trainer::{TrainOptions, Trainer};
}
