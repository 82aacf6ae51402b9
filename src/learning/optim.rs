//! Per-copy optimizer state and the parameter update.
//!
//! Optimizer state is keyed by (region, copy) exactly like the parameters, so
//! a split forks it: both children continue from the parent's moments and the
//! parent's entry is dropped together with the parent copy.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::LEARNING_RATE;
use crate::core::region::{CopyHandle, RegionCopy, RegionGraph};
use crate::error::SplitError;
use crate::learning::collector::CopyGradient;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptimizerConfig {
    Sgd { lr: f32, momentum: f32 },
    Adam { lr: f32, beta1: f32, beta2: f32, eps: f32 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            lr: LEARNING_RATE,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), SplitError> {
        let ok = match *self {
            OptimizerConfig::Sgd { lr, momentum } => {
                lr.is_finite() && lr > 0.0 && (0.0..1.0).contains(&momentum)
            }
            OptimizerConfig::Adam { lr, beta1, beta2, eps } => {
                lr.is_finite()
                    && lr > 0.0
                    && (0.0..1.0).contains(&beta1)
                    && (0.0..1.0).contains(&beta2)
                    && eps > 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(SplitError::InvalidConfig(format!("optimizer {:?} out of range", self)))
        }
    }
}

/// Moment buffers of one copy.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotState {
    steps: u32,
    m_weight: Array2<f32>,
    m_bias: Array1<f32>,
    v_weight: Array2<f32>,
    v_bias: Array1<f32>,
}

impl SlotState {
    fn zeros(copy: &RegionCopy) -> Self {
        Self {
            steps: 0,
            m_weight: Array2::zeros(copy.weight.raw_dim()),
            m_bias: Array1::zeros(copy.bias.raw_dim()),
            v_weight: Array2::zeros(copy.weight.raw_dim()),
            v_bias: Array1::zeros(copy.bias.raw_dim()),
        }
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }
}

pub struct Optimizer {
    config: OptimizerConfig,
    max_grad_norm: Option<f32>,
    slots: BTreeMap<(usize, CopyHandle), SlotState>,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, max_grad_norm: Option<f32>) -> Self {
        Self {
            config,
            max_grad_norm,
            slots: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> OptimizerConfig {
        self.config
    }

    pub fn slot(&self, region: usize, copy: CopyHandle) -> Option<&SlotState> {
        self.slots.get(&(region, copy))
    }

    /// Update every copy that received a gradient. Returns the global
    /// gradient norm before clipping.
    pub fn apply(
        &mut self,
        graph: &mut RegionGraph,
        totals: &BTreeMap<(usize, CopyHandle), CopyGradient>,
    ) -> Result<f64, SplitError> {
        let norm = totals.values().map(|g| g.squared_norm()).sum::<f64>().sqrt();
        if !norm.is_finite() {
            // Non-finite gradient: leave every parameter untouched.
            return Ok(norm);
        }
        let scale = match self.max_grad_norm {
            Some(max) if norm > max as f64 => (max as f64 / norm) as f32,
            _ => 1.0,
        };

        for (&(region, handle), grad) in totals {
            let copy = graph.copy_mut(region, handle)?;
            let state = self
                .slots
                .entry((region, handle))
                .or_insert_with(|| SlotState::zeros(&*copy));
            state.steps = state.steps.saturating_add(1);

            let gw = &grad.weight * scale;
            let gb = &grad.bias * scale;
            match self.config {
                OptimizerConfig::Sgd { lr, momentum } => {
                    state.m_weight = &state.m_weight * momentum + &gw;
                    state.m_bias = &state.m_bias * momentum + &gb;
                    copy.weight.scaled_add(-lr, &state.m_weight);
                    copy.bias.scaled_add(-lr, &state.m_bias);
                }
                OptimizerConfig::Adam { lr, beta1, beta2, eps } => {
                    state.m_weight = &state.m_weight * beta1 + &gw * (1.0 - beta1);
                    state.m_bias = &state.m_bias * beta1 + &gb * (1.0 - beta1);
                    state.v_weight = &state.v_weight * beta2 + gw.mapv(|x| x * x) * (1.0 - beta2);
                    state.v_bias = &state.v_bias * beta2 + gb.mapv(|x| x * x) * (1.0 - beta2);

                    let t = state.steps as i32;
                    let c1 = (1.0 - beta1.powi(t)).max(1e-12);
                    let c2 = (1.0 - beta2.powi(t)).max(1e-12);
                    let step_w = ndarray::Zip::from(&state.m_weight)
                        .and(&state.v_weight)
                        .map_collect(|&m, &v| (m / c1) / ((v / c2).sqrt() + eps));
                    let step_b = ndarray::Zip::from(&state.m_bias)
                        .and(&state.v_bias)
                        .map_collect(|&m, &v| (m / c1) / ((v / c2).sqrt() + eps));
                    copy.weight.scaled_add(-lr, &step_w);
                    copy.bias.scaled_add(-lr, &step_b);
                }
            }
        }
        Ok(norm)
    }

    /// Give both children the parent's state and drop the parent's.
    pub fn fork(&mut self, region: usize, parent: CopyHandle, a: CopyHandle, b: CopyHandle) {
        if let Some(state) = self.slots.remove(&(region, parent)) {
            self.slots.insert((region, a), state.clone());
            self.slots.insert((region, b), state);
        }
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }
}
