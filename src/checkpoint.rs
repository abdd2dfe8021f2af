//! Epoch-tagged weight files.
//!
//! Checkpoints are written once per epoch as
//! `weights_epoch{NN}-val_loss{V.VVVV}.safetensors`. Evaluation picks the
//! file with the numerically greatest epoch tag, so epoch 10 beats epoch 2
//! even though "10" sorts before "2" lexically.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{GnnError, GnnResult};

/// Extension of weight files.
pub const CHECKPOINT_EXTENSION: &str = "safetensors";

/// Filename for the checkpoint written at the end of `epoch` (1-based).
pub fn checkpoint_filename(epoch: usize, val_loss: f32) -> String {
    format!("weights_epoch{epoch:02}-val_loss{val_loss:.4}.{CHECKPOINT_EXTENSION}")
}

/// Find the checkpoint with the highest epoch tag in `dir`.
pub fn find_latest(dir: &Path) -> GnnResult<PathBuf> {
    let pattern = Regex::new(r"epoch(\d+)-")
        .map_err(|e| GnnError::training(format!("bad checkpoint pattern: {e}")))?;

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(caps) = pattern.captures(name) else {
            continue;
        };
        let Ok(epoch) = caps[1].parse::<u64>() else {
            continue;
        };
        if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
            best = Some((epoch, path));
        }
    }
    best.map(|(_, p)| p).ok_or(GnnError::CheckpointNotFound {
        dir: dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_format() {
        assert_eq!(
            checkpoint_filename(2, 0.123_44),
            "weights_epoch02-val_loss0.1234.safetensors"
        );
        assert_eq!(
            checkpoint_filename(100, 1.5),
            "weights_epoch100-val_loss1.5000.safetensors"
        );
    }

    #[test]
    fn test_latest_is_selected_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for (epoch, loss) in [(1, 0.9), (2, 0.5), (10, 0.4)] {
            fs::write(dir.path().join(checkpoint_filename(epoch, loss)), b"").unwrap();
        }
        // Lexically "weights_epoch10-..." < "weights_epoch02-..." is false,
        // but even with zero-padding the comparison must be numeric.
        let latest = find_latest(dir.path()).unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_str().unwrap(),
            checkpoint_filename(10, 0.4)
        );
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("params.json"), b"{}").unwrap();
        fs::write(dir.path().join(checkpoint_filename(3, 0.2)), b"").unwrap();
        let latest = find_latest(dir.path()).unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_str().unwrap(),
            checkpoint_filename(3, 0.2)
        );
    }

    #[test]
    fn test_no_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("params.json"), b"{}").unwrap();
        let err = find_latest(dir.path()).unwrap_err();
        assert!(matches!(err, GnnError::CheckpointNotFound { .. }));
    }
}
