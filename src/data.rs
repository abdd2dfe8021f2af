//! Preprocessed simulation data and the windowed batch generator.
//!
//! A network's preprocessed directory holds one JSON file per simulation
//! run: the lane ordering, the full feature and target name lists, the
//! X/Y time series, and one lane-by-lane adjacency matrix per relation
//! type. The single `lanes` list indexes every tensor, so feature rows,
//! target rows, and adjacency rows always refer to the same lane.
//!
//! Batches advance `batch_size` runs in lock-step: each batch slot is one
//! run and consecutive batches move the time window forward within those
//! runs. `reset_state` is true exactly on the first window of a run group,
//! which is where the trainer clears recurrent state.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use crate::config::ModelConfig;
use crate::error::{GnnError, GnnResult};

/// On-disk layout of one preprocessed run.
#[derive(Debug, Deserialize)]
struct RunFile {
    lanes: Vec<String>,
    x_features: Vec<String>,
    y_features: Vec<String>,
    /// T x N x F.
    x: Vec<Vec<Vec<f32>>>,
    /// T x N x Fy.
    y: Vec<Vec<Vec<f32>>>,
    /// Relation name -> N x N matrix.
    adjacency: BTreeMap<String, Vec<Vec<f32>>>,
}

/// One simulation run with the configured feature subsets selected and the
/// averaging interval applied.
pub struct SimulationRun {
    pub name: String,
    pub lanes: Vec<String>,
    /// (T, N, F) after downsampling.
    x: Tensor,
    /// (T, N, Fy) after downsampling.
    y: Tensor,
    /// (R, N, N), relations in config order.
    a: Tensor,
}

/// Indices of `wanted` names inside `available`, erroring on unknowns.
fn select_indices(
    wanted: &[String],
    available: &[String],
    what: &str,
    file: &Path,
) -> GnnResult<Vec<usize>> {
    wanted
        .iter()
        .map(|name| {
            available.iter().position(|f| f == name).ok_or_else(|| {
                GnnError::data(format!(
                    "unknown {what} '{name}' in {}; available: {available:?}",
                    file.display()
                ))
            })
        })
        .collect()
}

/// Flatten a T x N x full-F series down to the selected columns, checking
/// for ragged rows along the way.
fn flatten_series(
    series: &[Vec<Vec<f32>>],
    num_lanes: usize,
    full_width: usize,
    columns: &[usize],
    file: &Path,
) -> GnnResult<Vec<f32>> {
    let mut out = Vec::with_capacity(series.len() * num_lanes * columns.len());
    for (t, step) in series.iter().enumerate() {
        if step.len() != num_lanes {
            return Err(GnnError::data(format!(
                "{}: step {t} has {} lanes, expected {num_lanes}",
                file.display(),
                step.len()
            )));
        }
        for (n, row) in step.iter().enumerate() {
            if row.len() != full_width {
                return Err(GnnError::data(format!(
                    "{}: step {t} lane {n} has {} features, expected {full_width}",
                    file.display(),
                    row.len()
                )));
            }
            for &c in columns {
                out.push(row[c]);
            }
        }
    }
    Ok(out)
}

/// Mean-pool chunks of `interval` timesteps. Trailing steps that do not
/// fill a chunk are dropped.
fn average_over_time(series: &Tensor, interval: usize) -> GnnResult<Tensor> {
    if interval == 1 {
        return Ok(series.clone());
    }
    let (t, n, f) = series.dims3()?;
    let chunks = t / interval;
    if chunks == 0 {
        return Err(GnnError::data(format!(
            "run has {t} steps, fewer than the averaging interval {interval}"
        )));
    }
    Ok(series
        .narrow(0, 0, chunks * interval)?
        .reshape((chunks, interval, n, f))?
        .mean(1)?)
}

impl SimulationRun {
    /// Parse and validate one run file.
    pub fn load(path: &Path, config: &ModelConfig, device: &Device) -> GnnResult<Self> {
        let json = fs::read_to_string(path)?;
        let file: RunFile = serde_json::from_str(&json)
            .map_err(|e| GnnError::data(format!("malformed {}: {e}", path.display())))?;

        let n = file.lanes.len();
        if n == 0 {
            return Err(GnnError::data(format!("{}: no lanes", path.display())));
        }
        if file.x.len() != file.y.len() {
            return Err(GnnError::data(format!(
                "{}: x has {} steps but y has {}",
                path.display(),
                file.x.len(),
                file.y.len()
            )));
        }

        let x_cols = select_indices(&config.x_features, &file.x_features, "feature", path)?;
        let y_cols = select_indices(&config.y_features, &file.y_features, "target", path)?;

        let t = file.x.len();
        let x_flat = flatten_series(&file.x, n, file.x_features.len(), &x_cols, path)?;
        let y_flat = flatten_series(&file.y, n, file.y_features.len(), &y_cols, path)?;
        let x = Tensor::from_vec(x_flat, (t, n, x_cols.len()), device)?;
        let y = Tensor::from_vec(y_flat, (t, n, y_cols.len()), device)?;
        let x = average_over_time(&x, config.average_interval)?;
        let y = average_over_time(&y, config.average_interval)?;

        let mut relations = Vec::with_capacity(config.relation_names.len());
        for name in &config.relation_names {
            let matrix = file.adjacency.get(name).ok_or_else(|| {
                GnnError::data(format!(
                    "{}: missing adjacency relation '{name}'",
                    path.display()
                ))
            })?;
            if matrix.len() != n || matrix.iter().any(|row| row.len() != n) {
                return Err(GnnError::data(format!(
                    "{}: adjacency '{name}' is not {n}x{n}",
                    path.display()
                )));
            }
            let flat: Vec<f32> = matrix.iter().flatten().copied().collect();
            relations.push(Tensor::from_vec(flat, (n, n), device)?);
        }
        let a = Tensor::stack(&relations, 0)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            lanes: file.lanes,
            x,
            y,
            a,
        })
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Downsampled timesteps available in this run.
    pub fn num_steps(&self) -> GnnResult<usize> {
        Ok(self.x.dim(0)?)
    }

    fn num_windows(&self, window: usize) -> GnnResult<usize> {
        Ok(self.num_steps()? / window)
    }
}

/// One training/evaluation batch.
pub struct Batch {
    /// (B, T, N, F).
    pub x: Tensor,
    /// (B, R, N, N).
    pub a: Tensor,
    /// (B, T, N, Fy).
    pub y: Tensor,
    /// True on the first window of a run group; the consumer must clear
    /// recurrent state before this batch.
    pub reset_state: bool,
    /// Run behind each batch slot, for aligning predictions.
    pub run_names: Vec<String>,
    /// Downsampled-timestep offset of this window within its runs.
    pub window_start: usize,
}

/// Loads a network's runs and produces the ordered batch sequence.
pub struct Batcher {
    runs: Vec<SimulationRun>,
    batch_size: usize,
    time_window: usize,
    stateful: bool,
}

impl Batcher {
    /// Load every `*.json` run in `dir`, in sorted filename order.
    pub fn new(dir: &Path, config: &ModelConfig, device: &Device) -> GnnResult<Self> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(GnnError::data(format!(
                "no run files (*.json) in {}",
                dir.display()
            )));
        }

        let mut runs = Vec::with_capacity(paths.len());
        for path in &paths {
            runs.push(SimulationRun::load(path, config, device)?);
        }
        for run in &runs[1..] {
            if run.lanes != runs[0].lanes {
                return Err(GnnError::data(format!(
                    "run '{}' has a different lane ordering than run '{}'",
                    run.name, runs[0].name
                )));
            }
        }

        Ok(Self {
            runs,
            batch_size: config.batch_size,
            time_window: config.time_window,
            stateful: config.stateful_rnn,
        })
    }

    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn num_lanes(&self) -> usize {
        self.runs[0].num_lanes()
    }

    /// Shuffle the run order. Refused for stateful configurations, where
    /// the batch order is part of the model's semantics.
    pub fn shuffle(&mut self, seed: u64) -> GnnResult<()> {
        if self.stateful {
            return Err(GnnError::data(
                "cannot shuffle runs: stateful recurrence requires a deterministic batch order",
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        self.runs.shuffle(&mut rng);
        Ok(())
    }

    /// Split off the last `val_proportion` of runs for validation.
    /// Runs, not windows, are split, so no window leaks across the split.
    pub fn split(mut self, val_proportion: f32) -> (Batcher, Batcher) {
        let n_train = ((1.0 - val_proportion) * self.runs.len() as f32).round() as usize;
        let n_train = n_train.min(self.runs.len());
        let val_runs = self.runs.split_off(n_train);
        let val = Batcher {
            runs: val_runs,
            batch_size: self.batch_size,
            time_window: self.time_window,
            stateful: self.stateful,
        };
        (self, val)
    }

    /// Materialize the ordered batch sequence.
    ///
    /// Runs are grouped `batch_size` at a time; each group emits as many
    /// whole windows as its shortest run allows.
    pub fn batches(&self) -> GnnResult<Vec<Batch>> {
        let mut batches = Vec::new();
        for group in self.runs.chunks(self.batch_size) {
            let mut windows = usize::MAX;
            for run in group {
                windows = windows.min(run.num_windows(self.time_window)?);
            }
            if windows == usize::MAX || windows == 0 {
                continue;
            }
            let run_names: Vec<String> = group.iter().map(|r| r.name.clone()).collect();
            let a = Tensor::stack(&group.iter().map(|r| r.a.clone()).collect::<Vec<_>>(), 0)?;
            for w in 0..windows {
                let start = w * self.time_window;
                let mut xs = Vec::with_capacity(group.len());
                let mut ys = Vec::with_capacity(group.len());
                for run in group {
                    xs.push(run.x.narrow(0, start, self.time_window)?);
                    ys.push(run.y.narrow(0, start, self.time_window)?);
                }
                batches.push(Batch {
                    x: Tensor::stack(&xs, 0)?,
                    a: a.clone(),
                    y: Tensor::stack(&ys, 0)?,
                    reset_state: w == 0,
                    run_names: run_names.clone(),
                    window_start: start,
                });
            }
        }
        Ok(batches)
    }
}
