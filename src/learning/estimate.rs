//! Running estimates with an arithmetic warm-up.
//!
//! For the first `warmup_steps` samples the estimate is the exact arithmetic
//! mean; afterwards it follows the EMA recurrence
//!
//!   m ← α·v + (1 − α)·m
//!
//! A small α reacts slowly and, under noise, shows a smaller spread of the
//! mean at the price of lagging real change. `warmup_steps = 0` gives the pure
//! EMA from a zero start.

use ndarray::Array1;

use crate::config::{EMA_ALPHA, EMA_WARMUP_STEPS};

/// Blend schedule shared by every running estimate in the tracker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmaSchedule {
    /// Weight of the newest sample once warm-up is over, in (0, 1).
    pub alpha: f64,

    /// Samples averaged arithmetically before switching to the EMA.
    pub warmup_steps: u64,
}

impl Default for EmaSchedule {
    fn default() -> Self {
        Self {
            alpha: EMA_ALPHA,
            warmup_steps: EMA_WARMUP_STEPS,
        }
    }
}

impl EmaSchedule {
    pub fn pure(alpha: f64) -> Self {
        Self {
            alpha,
            warmup_steps: 0,
        }
    }

    /// Weight of the `n`-th sample (1-based).
    pub fn weight(&self, n: u64) -> f64 {
        if n <= self.warmup_steps {
            1.0 / n.max(1) as f64
        } else {
            self.alpha
        }
    }
}

/// Running mean and mean-of-squares of a scalar.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScalarMoments {
    pub mean: f64,
    pub square_mean: f64,
    pub steps: u64,
}

impl ScalarMoments {
    pub fn update(&mut self, value: f64, schedule: &EmaSchedule) {
        self.steps += 1;
        let w = schedule.weight(self.steps);
        self.mean = (1.0 - w) * self.mean + w * value;
        self.square_mean = (1.0 - w) * self.square_mean + w * value * value;
    }

    /// `E[x²] − E[x]²`, clamped at zero.
    pub fn variance(&self) -> f64 {
        (self.square_mean - self.mean * self.mean).max(0.0)
    }

    /// A copy carrying `fraction` of the accumulated evidence.
    pub fn scaled(&self, fraction: f64) -> Self {
        Self {
            mean: self.mean * fraction,
            square_mean: self.square_mean * fraction,
            steps: (self.steps as f64 * fraction).floor() as u64,
        }
    }
}

/// Running mean of a gradient vector plus the running mean of its squared norm.
///
/// Together they give the trace of the gradient covariance,
/// `E‖g‖² − ‖E g‖²`: the per-task gradient noise level.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorMoments {
    pub mean: Array1<f32>,
    pub square_norm_mean: f64,
    pub steps: u64,
}

impl VectorMoments {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: Array1::zeros(dim),
            square_norm_mean: 0.0,
            steps: 0,
        }
    }

    pub fn update(&mut self, value: &Array1<f32>, schedule: &EmaSchedule) {
        self.steps += 1;
        let w = schedule.weight(self.steps);
        self.mean *= (1.0 - w) as f32;
        self.mean.scaled_add(w as f32, value);
        let sq = squared_norm(value);
        self.square_norm_mean = (1.0 - w) * self.square_norm_mean + w * sq;
    }

    pub fn variance(&self) -> f64 {
        (self.square_norm_mean - squared_norm(&self.mean)).max(0.0)
    }

    pub fn has_history(&self) -> bool {
        self.steps > 0
    }
}

/// ‖v‖² accumulated in f64.
pub fn squared_norm(v: &Array1<f32>) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum()
}
