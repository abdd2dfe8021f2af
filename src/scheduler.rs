//! Learning-rate reduction on validation-loss plateaus.

/// Plateau detection parameters.
#[derive(Debug, Clone)]
pub struct PlateauConfig {
    /// Multiply the learning rate by this on a plateau.
    pub factor: f64,
    /// Epochs without improvement before reducing.
    pub patience: usize,
    /// Never reduce below this rate.
    pub min_lr: f64,
    /// Improvements smaller than this do not count.
    pub min_delta: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 5,
            min_lr: 1e-6,
            min_delta: 1e-4,
        }
    }
}

/// Tracks the monitored metric across epochs and proposes a lower learning
/// rate when it stops improving. The trainer applies the proposal to its
/// optimizer, keeping this type free of optimizer plumbing.
pub struct ReduceOnPlateau {
    config: PlateauConfig,
    best: f64,
    wait: usize,
}

impl ReduceOnPlateau {
    pub fn new(config: PlateauConfig) -> Self {
        Self {
            config,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Record one epoch's validation loss. Returns the reduced learning
    /// rate once `patience` epochs pass without improvement, or `None`
    /// while the metric is still moving (or the floor is reached).
    pub fn step(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if val_loss < self.best - self.config.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.config.patience {
            return None;
        }
        self.wait = 0;
        let reduced = (current_lr * self.config.factor).max(self.config.min_lr);
        (reduced < current_lr).then_some(reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(factor: f64, patience: usize, min_lr: f64) -> ReduceOnPlateau {
        ReduceOnPlateau::new(PlateauConfig {
            factor,
            patience,
            min_lr,
            min_delta: 1e-4,
        })
    }

    #[test]
    fn test_reduces_after_patience() {
        let mut s = scheduler(0.5, 2, 1e-6);
        assert_eq!(s.step(1.0, 1e-2), None); // first observation
        assert_eq!(s.step(1.0, 1e-2), None); // wait 1
        assert_eq!(s.step(1.0, 1e-2), Some(5e-3)); // wait 2 -> reduce
    }

    #[test]
    fn test_improvement_resets_wait() {
        let mut s = scheduler(0.5, 2, 1e-6);
        assert_eq!(s.step(1.0, 1e-2), None);
        assert_eq!(s.step(1.0, 1e-2), None);
        assert_eq!(s.step(0.5, 1e-2), None); // improvement
        assert_eq!(s.step(0.5, 1e-2), None);
        assert_eq!(s.step(0.5, 1e-2), Some(5e-3));
    }

    #[test]
    fn test_floor_at_min_lr() {
        let mut s = scheduler(0.1, 1, 1e-3);
        s.step(1.0, 2e-3);
        assert_eq!(s.step(1.0, 2e-3), Some(1e-3));
        // Already at the floor: nothing further to propose.
        assert_eq!(s.step(1.0, 1e-3), None);
    }

    #[test]
    fn test_tiny_improvement_counts_as_plateau() {
        let mut s = scheduler(0.5, 1, 1e-6);
        s.step(1.0, 1e-2);
        // Within min_delta of the best: still a plateau.
        assert_eq!(s.step(1.0 - 1e-5, 1e-2), Some(5e-3));
    }
}
