//! Health monitoring of the split statistics.
//!
//! Rolling windows over the per-step diagnostics that say whether the
//! divergence statistics can be trusted: how often the z-score denominator is
//! floored, whether non-finite values show up, and how the gradient norm and
//! the strongest split candidate evolve.

use std::collections::VecDeque;

use crate::config::HEALTH_WINDOW;

/// Health status levels.
#[derive(Clone, Debug, PartialEq)]
pub enum HealthStatus {
    Healthy,
    /// Some metrics are degraded but training can go on.
    Degraded(String),
    /// Statistics are unreliable; split decisions should not be trusted.
    Critical(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricSample {
    pub step: u64,
    pub value: f64,
}

/// A rolling metric window.
#[derive(Clone, Debug)]
pub struct MetricTracker {
    pub name: String,
    pub samples: VecDeque<MetricSample>,
    pub max_samples: usize,

    /// Upper bounds on the windowed mean.
    pub warn_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
}

impl MetricTracker {
    pub fn new(name: &str, max_samples: usize) -> Self {
        Self {
            name: name.to_string(),
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
            warn_threshold: None,
            critical_threshold: None,
        }
    }

    pub fn with_thresholds(mut self, warn: f64, critical: f64) -> Self {
        self.warn_threshold = Some(warn);
        self.critical_threshold = Some(critical);
        self
    }

    pub fn record(&mut self, step: u64, value: f64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(MetricSample { step, value });
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().map(|s| s.value)
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.value).sum::<f64>() / self.samples.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .samples
            .iter()
            .map(|s| (s.value - mean).powi(2))
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;
        var.sqrt()
    }

    pub fn max(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.value)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Status of the windowed mean against the thresholds.
    pub fn status(&self) -> HealthStatus {
        if self.samples.is_empty() {
            return HealthStatus::Healthy;
        }
        let val = self.mean();
        if let Some(crit) = self.critical_threshold {
            if val >= crit {
                return HealthStatus::Critical(format!("{}: {:.3} >= critical {}", self.name, val, crit));
            }
        }
        if let Some(warn) = self.warn_threshold {
            if val >= warn {
                return HealthStatus::Degraded(format!("{}: {:.3} >= warn {}", self.name, val, warn));
            }
        }
        HealthStatus::Healthy
    }

    /// Latest sample more than three deviations from the window mean.
    pub fn is_anomalous(&self) -> bool {
        if let Some(val) = self.latest() {
            let std = self.std_dev();
            if std > 1e-12 {
                return ((val - self.mean()) / std).abs() > 3.0;
            }
        }
        false
    }
}

/// What one training step contributes to the monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepHealth {
    pub step: u64,

    /// Divergence statistics updated this step.
    pub stats_observed: usize,

    /// Of those, how many hit the variance floor.
    pub stats_floored: usize,

    pub non_finite: usize,
    pub grad_norm: f64,

    /// Strongest split candidate's z-score, if any group is divisible.
    pub max_candidate_z: Option<f64>,
}

pub struct HealthMonitor {
    /// Fraction of statistics floored per step.
    pub floor_rate: MetricTracker,

    /// Non-finite gradients or divergences per step.
    pub non_finite: MetricTracker,

    pub grad_norm: MetricTracker,
    pub max_z: MetricTracker,

    pub steps: u64,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HEALTH_WINDOW)
    }
}

impl HealthMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            floor_rate: MetricTracker::new("variance_floor_rate", window).with_thresholds(0.5, 0.99),
            non_finite: MetricTracker::new("non_finite_per_step", window).with_thresholds(0.01, 1.0),
            grad_norm: MetricTracker::new("grad_norm", window),
            max_z: MetricTracker::new("max_candidate_z", window),
            steps: 0,
        }
    }

    pub fn record(&mut self, h: &StepHealth) {
        self.steps += 1;
        let rate = if h.stats_observed == 0 {
            0.0
        } else {
            h.stats_floored as f64 / h.stats_observed as f64
        };
        self.floor_rate.record(h.step, rate);
        let mut non_finite = h.non_finite;
        if h.grad_norm.is_finite() {
            self.grad_norm.record(h.step, h.grad_norm);
        } else {
            non_finite += 1;
        }
        self.non_finite.record(h.step, non_finite as f64);
        if let Some(z) = h.max_candidate_z {
            self.max_z.record(h.step, z);
        }
    }

    pub fn overall_status(&self) -> HealthStatus {
        let mut checks = vec![self.non_finite.status(), self.floor_rate.status()];
        if self.grad_norm.is_anomalous() {
            checks.push(HealthStatus::Degraded(format!(
                "grad_norm spike: {:.3e}",
                self.grad_norm.latest().unwrap_or(0.0)
            )));
        }

        if let Some(c) = checks.iter().find(|c| matches!(c, HealthStatus::Critical(_))) {
            return c.clone();
        }
        if let Some(c) = checks.iter().find(|c| matches!(c, HealthStatus::Degraded(_))) {
            return c.clone();
        }
        HealthStatus::Healthy
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            steps: self.steps,
            floor_rate: self.floor_rate.mean(),
            non_finite_rate: self.non_finite.mean(),
            avg_grad_norm: self.grad_norm.mean(),
            peak_candidate_z: self.max_z.latest().map(|_| self.max_z.max()),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.floor_rate.max_samples);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub steps: u64,
    pub floor_rate: f64,
    pub non_finite_rate: f64,
    pub avg_grad_norm: f64,
    pub peak_candidate_z: Option<f64>,
}
