//! Gradient collector — per-task, per-region gradients from a single backward pass.
//!
//! The naive way to get task-specific gradients is one backward pass per task
//! plus one for the total: O(T + 1) passes. Here the backward traversal adds
//! each task's share into the copy's gradient accumulator in a fixed task
//! order. Before task *i* is added the accumulator is snapshotted; afterwards
//! the difference from the snapshot is task *i*'s marginal contribution. The
//! total is simply the accumulator's final state, so the whole step costs one
//! traversal.
//!
//! Task activity is read from the batch, never from whether a gradient is zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2, Axis};

use crate::core::region::{CopyHandle, ForwardCache, RegionGraph};
use crate::core::task::{TaskId, TaskUniverse};
use crate::error::SplitError;

/// One task's gradient contribution at one region for the current step.
#[derive(Clone, Debug)]
pub struct TaskGradientRecord {
    pub region: usize,
    pub task: TaskId,

    /// Copy the task was routed through.
    pub copy: CopyHandle,

    /// Flattened `[∂W, ∂b]` contribution.
    pub gradient: Array1<f32>,

    /// Whether the task contributed samples this step.
    pub active: bool,
}

/// Accumulated gradient of one copy, shaped like its parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct CopyGradient {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl CopyGradient {
    pub fn zeros(out_dim: usize, in_dim: usize) -> Self {
        Self {
            weight: Array2::zeros((out_dim, in_dim)),
            bias: Array1::zeros(out_dim),
        }
    }

    pub fn flatten(&self) -> Array1<f32> {
        self.weight
            .iter()
            .chain(self.bias.iter())
            .copied()
            .collect()
    }

    pub fn squared_norm(&self) -> f64 {
        self.weight
            .iter()
            .chain(self.bias.iter())
            .map(|&v| (v as f64) * (v as f64))
            .sum()
    }
}

/// Collector for one training step.
pub struct GradientCollector {
    universe: Arc<TaskUniverse>,

    /// (out_dim, in_dim) per region.
    shapes: Vec<(usize, usize)>,

    integrity_checks: bool,
    accumulators: BTreeMap<(usize, CopyHandle), CopyGradient>,

    /// `records[region][task position]`
    records: Vec<Vec<Option<TaskGradientRecord>>>,

    passes: u32,
}

impl GradientCollector {
    pub fn new(universe: Arc<TaskUniverse>, graph: &RegionGraph, integrity_checks: bool) -> Self {
        let shapes: Vec<(usize, usize)> = graph
            .regions()
            .iter()
            .map(|r| (r.out_dim, r.in_dim))
            .collect();
        let records = shapes
            .iter()
            .map(|_| vec![None; universe.len()])
            .collect();
        Self {
            universe,
            shapes,
            integrity_checks,
            accumulators: BTreeMap::new(),
            records,
            passes: 0,
        }
    }

    pub(crate) fn begin_pass(&mut self) {
        self.passes += 1;
    }

    /// Add one task's rows into the copy accumulator and record the marginal.
    ///
    /// `delta` is ∂L/∂(pre-activation) for the task's rows at this region,
    /// `input` the region input for the same rows.
    pub(crate) fn accumulate(
        &mut self,
        region: usize,
        copy: CopyHandle,
        task_pos: usize,
        delta: &Array2<f32>,
        input: &Array2<f32>,
    ) -> Result<(), SplitError> {
        let (out_dim, in_dim) = self.shapes[region];
        if self.integrity_checks {
            if delta.ncols() != out_dim || input.ncols() != in_dim || delta.nrows() != input.nrows() {
                return Err(SplitError::Integrity(format!(
                    "task {} at region {}: delta {:?} and input {:?} do not fit a {}x{} region",
                    self.universe.ids()[task_pos],
                    region,
                    delta.dim(),
                    input.dim(),
                    out_dim,
                    in_dim
                )));
            }
        }

        let acc = self
            .accumulators
            .entry((region, copy))
            .or_insert_with(|| CopyGradient::zeros(out_dim, in_dim));
        let snapshot = acc.flatten();
        general_mat_mul(1.0, &delta.t(), input, 1.0, &mut acc.weight);
        acc.bias += &delta.sum_axis(Axis(0));
        let marginal = acc.flatten() - &snapshot;

        self.records[region][task_pos] = Some(TaskGradientRecord {
            region,
            task: self.universe.ids()[task_pos],
            copy,
            gradient: marginal,
            active: false,
        });
        Ok(())
    }

    /// Attach activity flags and fill in tasks that had no rows.
    pub(crate) fn finish_pass(&mut self, cache: &ForwardCache) -> Result<(), SplitError> {
        if self.integrity_checks {
            for (pos, rows) in cache.rows_by_task.iter().enumerate() {
                if cache.active[pos] && rows.is_empty() {
                    return Err(SplitError::Integrity(format!(
                        "task {} is flagged active but has no samples in the batch",
                        self.universe.ids()[pos]
                    )));
                }
            }
            self.check_copy_rows(cache)?;
        }
        for (region, row) in self.records.iter_mut().enumerate() {
            let (out_dim, in_dim) = self.shapes[region];
            for (pos, slot) in row.iter_mut().enumerate() {
                let active = cache.active[pos] && !cache.rows_by_task[pos].is_empty();
                match slot {
                    Some(rec) => rec.active = active,
                    None => {
                        *slot = Some(TaskGradientRecord {
                            region,
                            task: self.universe.ids()[pos],
                            copy: cache.routes[region][pos],
                            gradient: Array1::zeros(out_dim * in_dim + out_dim),
                            active: false,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// Rows served by each copy must be exactly the rows of the tasks routed
    /// to it, so every task sharing a copy is padded the same way.
    fn check_copy_rows(&self, cache: &ForwardCache) -> Result<(), SplitError> {
        for (region, served) in cache.copy_rows.iter().enumerate() {
            for (&copy, rows) in served {
                let mut expected: Vec<usize> = cache.routes[region]
                    .iter()
                    .enumerate()
                    .filter(|(_, handle)| **handle == copy)
                    .flat_map(|(pos, _)| cache.rows_by_task[pos].iter().copied())
                    .collect();
                expected.sort_unstable();
                let mut actual = rows.clone();
                actual.sort_unstable();
                if actual != expected {
                    return Err(SplitError::Integrity(format!(
                        "copy {} at region {} served {} rows but the tasks routed to it have {}",
                        copy,
                        region,
                        actual.len(),
                        expected.len()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn into_step(self) -> StepGradients {
        let records = self
            .records
            .into_iter()
            .map(|row| row.into_iter().flatten().collect())
            .collect();
        StepGradients {
            records,
            totals: self.accumulators,
            backward_passes: self.passes,
        }
    }
}

/// All gradient information produced by one step. Consumed immediately.
#[derive(Clone, Debug)]
pub struct StepGradients {
    /// `records[region][task position]`
    records: Vec<Vec<TaskGradientRecord>>,

    /// Final accumulator per (region, copy): the combined-loss gradient.
    totals: BTreeMap<(usize, CopyHandle), CopyGradient>,

    backward_passes: u32,
}

impl StepGradients {
    pub fn num_regions(&self) -> usize {
        self.records.len()
    }

    pub fn region(&self, region: usize) -> &[TaskGradientRecord] {
        self.records.get(region).map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn record(&self, region: usize, task_pos: usize) -> Option<&TaskGradientRecord> {
        self.records.get(region).and_then(|r| r.get(task_pos))
    }

    /// `task_active[region, task]`
    pub fn task_active(&self, region: usize, task_pos: usize) -> bool {
        self.record(region, task_pos).map_or(false, |r| r.active)
    }

    pub fn totals(&self) -> &BTreeMap<(usize, CopyHandle), CopyGradient> {
        &self.totals
    }

    pub fn total(&self, region: usize, copy: CopyHandle) -> Option<&CopyGradient> {
        self.totals.get(&(region, copy))
    }

    pub fn backward_passes(&self) -> u32 {
        self.backward_passes
    }

    /// Synthetic step: `gradients[region][task position]`, every task active.
    #[cfg(test)]
    pub(crate) fn synthetic(gradients: Vec<Vec<Array1<f32>>>) -> Self {
        let records = gradients
            .into_iter()
            .enumerate()
            .map(|(region, row)| {
                row.into_iter()
                    .enumerate()
                    .map(|(pos, gradient)| TaskGradientRecord {
                        region,
                        task: TaskId(pos as u32),
                        copy: CopyHandle(0),
                        gradient,
                        active: true,
                    })
                    .collect()
            })
            .collect();
        Self {
            records,
            totals: BTreeMap::new(),
            backward_passes: 1,
        }
    }
}
