//! Multi-task policy adapter — the surface the optimisation loop drives.
//!
//! One training step is:
//!
//! 1. `forward(batch)`: every row goes through the copies its task is routed
//!    to; the routing used is frozen in the forward cache.
//! 2. The caller computes per-task losses and their output gradients.
//! 3. `backward_and_update(losses)`: one backward pass over the summed loss,
//!    statistics update, parameter update, then at most one split, which
//!    takes effect from the next forward pass.
//!
//! Callers only ever name tasks; regions, groups and copies stay internal.

use std::sync::Arc;

use ndarray::{concatenate, Array2, Axis};
use tracing::{debug, info, warn};

use crate::config::{HEALTH_WINDOW, HIDDEN_SIZE, NUM_LAYERS, VARIANCE_FLOOR};
use crate::core::region::{ForwardCache, RegionGraph};
use crate::core::registry::{GroupId, TaskGroupRegistry};
use crate::core::task::{TaskBatch, TaskId, TaskUniverse};
use crate::error::SplitError;
use crate::learning::collector::GradientCollector;
use crate::learning::estimate::EmaSchedule;
use crate::learning::mutator::{NetworkMutator, SplitEvent, SplitRequest};
use crate::learning::optim::{Optimizer, OptimizerConfig};
use crate::learning::split::{SplitDecisionEngine, SplitTrigger};
use crate::learning::statistics::{
    ColdStartPolicy, GradientStatisticsTracker, NumericalWarning, StatSubject, WarningKind, ZScoreEntry,
};
use crate::runtime::health::{HealthMonitor, HealthReport, HealthStatus, StepHealth};
use crate::runtime::snapshot::ArchitectureSnapshot;

/// Network shape.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkConfig {
    /// Observation width, before any task-index columns.
    pub obs_dim: usize,
    pub hidden_size: usize,
    pub output_size: usize,

    /// Number of regions.
    pub num_layers: usize,

    /// Append a one-hot task vector to every observation.
    pub include_task_index: bool,

    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            obs_dim: 8,
            hidden_size: HIDDEN_SIZE,
            output_size: 2,
            num_layers: NUM_LAYERS,
            include_task_index: false,
            seed: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Architecture {
    /// Fully shared network. Statistics are still tracked, nothing splits.
    Shared,
    /// Regions split when the trigger fires.
    Splitting { trigger: SplitTrigger },
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::Splitting {
            trigger: SplitTrigger::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplitConfig {
    pub architecture: Architecture,
    pub ema: EmaSchedule,
    pub cold_start: ColdStartPolicy,
    pub variance_floor: f64,

    /// Opt-in structural checks on every step's gradients.
    pub integrity_checks: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::default(),
            ema: EmaSchedule::default(),
            cold_start: ColdStartPolicy::default(),
            variance_floor: VARIANCE_FLOOR,
            integrity_checks: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct AdapterConfig {
    pub network: NetworkConfig,
    pub split: SplitConfig,
    pub optimizer: OptimizerConfig,

    /// Clip the combined gradient to this global norm.
    pub max_grad_norm: Option<f32>,
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), SplitError> {
        let invalid = |msg: &str| Err(SplitError::InvalidConfig(msg.to_string()));
        let n = &self.network;
        if n.obs_dim == 0 || n.hidden_size == 0 || n.output_size == 0 {
            return invalid("network widths must be positive");
        }
        if n.num_layers == 0 {
            return invalid("network needs at least one region");
        }

        let s = &self.split;
        if !(s.ema.alpha > 0.0 && s.ema.alpha < 1.0) {
            return invalid("ema alpha must lie in (0, 1)");
        }
        if !(s.variance_floor > 0.0 && s.variance_floor.is_finite()) {
            return invalid("variance floor must be positive and finite");
        }
        if let ColdStartPolicy::InheritParent { fraction } = s.cold_start {
            if !(0.0..=1.0).contains(&fraction) {
                return invalid("inherited fraction must lie in [0, 1]");
            }
        }
        if let Architecture::Splitting { trigger } = s.architecture {
            if !(trigger.threshold() > 0.0 && trigger.threshold().is_finite()) {
                return invalid("split threshold must be positive and finite");
            }
            if let Some(cap) = trigger.max_copies() {
                if cap < 2 {
                    return invalid("max_copies below 2 forbids every split; use Architecture::Shared");
                }
            }
        }

        if let Some(max) = self.max_grad_norm {
            if !(max > 0.0 && max.is_finite()) {
                return invalid("max_grad_norm must be positive and finite");
            }
        }
        self.optimizer.validate()
    }
}

/// Loss of one task for the pending batch.
#[derive(Clone, Debug)]
pub struct TaskLoss {
    pub task: TaskId,
    pub value: f32,

    /// ∂loss/∂output for the task's rows, in batch order.
    pub output_grad: Array2<f32>,
}

/// Network outputs tagged with the task of each row.
#[derive(Clone, Debug)]
pub struct TaskTaggedOutputs {
    pub tasks: Vec<TaskId>,
    pub outputs: Array2<f32>,
}

impl TaskTaggedOutputs {
    /// Rows belonging to `task`, in batch order.
    pub fn for_task(&self, task: TaskId) -> Array2<f32> {
        let rows: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == task)
            .map(|(i, _)| i)
            .collect();
        self.outputs.select(Axis(0), &rows)
    }
}

/// Diagnostics returned by every training step.
#[derive(Clone, Debug)]
pub struct TrainStepMetrics {
    pub step: u64,
    pub total_loss: f32,
    pub task_losses: Vec<(TaskId, f32)>,

    /// Full backward traversals this step. Always 1.
    pub backward_passes: u32,

    /// Global gradient norm before clipping.
    pub grad_norm: f64,

    pub copies_per_region: Vec<usize>,

    /// Regions with more than one group after this step.
    pub split_regions: Vec<usize>,

    pub z_scores: Vec<ZScoreEntry>,
    pub max_candidate_z: Option<f64>,

    /// At most one event.
    pub split_events: Vec<SplitEvent>,

    pub warnings: Vec<NumericalWarning>,
    pub health: HealthStatus,
}

/// Forward pass awaiting its backward pass.
struct PendingStep {
    cache: ForwardCache,
}

pub struct MultiTaskPolicyAdapter {
    config: AdapterConfig,
    universe: Arc<TaskUniverse>,
    graph: RegionGraph,
    registry: TaskGroupRegistry,
    tracker: GradientStatisticsTracker,
    engine: SplitDecisionEngine,
    mutator: NetworkMutator,
    optimizer: Optimizer,
    health: HealthMonitor,
    pending: Option<PendingStep>,
    step: u64,
}

impl MultiTaskPolicyAdapter {
    pub fn new(config: AdapterConfig, universe: Arc<TaskUniverse>) -> Result<Self, SplitError> {
        config.validate()?;
        if universe.is_empty() {
            return Err(SplitError::InvalidConfig("task universe is empty".into()));
        }

        let n = &config.network;
        let input = n.obs_dim + if n.include_task_index { universe.len() } else { 0 };
        let graph = RegionGraph::mlp(input, n.hidden_size, n.output_size, n.num_layers, n.seed);
        let registry = TaskGroupRegistry::new(universe.clone(), &graph);
        let tracker = Self::fresh_tracker(&config, &universe, &graph);
        let trigger = match config.split.architecture {
            Architecture::Shared => None,
            Architecture::Splitting { trigger } => Some(trigger),
        };

        info!(
            tasks = universe.len(),
            regions = graph.num_regions(),
            params = graph.param_count(),
            architecture = ?config.split.architecture,
            "policy adapter ready"
        );
        Ok(Self {
            optimizer: Optimizer::new(config.optimizer, config.max_grad_norm),
            engine: SplitDecisionEngine::new(trigger),
            mutator: NetworkMutator::new(),
            health: HealthMonitor::new(HEALTH_WINDOW),
            pending: None,
            step: 0,
            config,
            universe,
            graph,
            registry,
            tracker,
        })
    }

    fn fresh_tracker(config: &AdapterConfig, universe: &Arc<TaskUniverse>, graph: &RegionGraph) -> GradientStatisticsTracker {
        GradientStatisticsTracker::new(
            universe.clone(),
            graph,
            config.split.ema,
            config.split.variance_floor,
            config.split.cold_start,
        )
    }

    /// Run the batch through the network. The routing used here is the one
    /// the following `backward_and_update` sees, whatever happens in between.
    ///
    /// A second `forward` without a backward pass replaces the pending one.
    pub fn forward(&mut self, batch: &TaskBatch) -> Result<TaskTaggedOutputs, SplitError> {
        let obs_dim = self.config.network.obs_dim;
        if batch.observations.ncols() != obs_dim {
            return Err(SplitError::Shape(format!(
                "observations have {} columns, expected {}",
                batch.observations.ncols(),
                obs_dim
            )));
        }
        if batch.active.len() != self.universe.len() {
            return Err(SplitError::Shape(format!(
                "activity flags cover {} tasks, universe has {}",
                batch.active.len(),
                self.universe.len()
            )));
        }

        let augmented;
        let input = if self.config.network.include_task_index {
            augmented = TaskBatch {
                tasks: batch.tasks.clone(),
                observations: self.with_task_index(batch)?,
                active: batch.active.clone(),
            };
            &augmented
        } else {
            batch
        };

        let (outputs, cache) = self.graph.forward(&self.universe, &self.registry, input)?;
        self.pending = Some(PendingStep { cache });
        Ok(TaskTaggedOutputs {
            tasks: batch.tasks.clone(),
            outputs,
        })
    }

    fn with_task_index(&self, batch: &TaskBatch) -> Result<Array2<f32>, SplitError> {
        let mut onehot = Array2::<f32>::zeros((batch.len(), self.universe.len()));
        for (row, &task) in batch.tasks.iter().enumerate() {
            let pos = self
                .universe
                .position(task)
                .ok_or(SplitError::UnknownTask { task, region: 0 })?;
            onehot[[row, pos]] = 1.0;
        }
        concatenate(Axis(1), &[batch.observations.view(), onehot.view()])
            .map_err(|e| SplitError::Shape(e.to_string()))
    }

    /// One backward pass for the summed task losses, then statistics,
    /// parameter update and at most one split.
    ///
    /// Tasks in the batch without a loss entry contribute a zero gradient.
    pub fn backward_and_update(&mut self, losses: &[TaskLoss]) -> Result<TrainStepMetrics, SplitError> {
        let pending = self.pending.take().ok_or(SplitError::NoForwardPass)?;
        let output_grad = self.assemble_output_grad(&pending, losses)?;

        let mut collector = GradientCollector::new(
            self.universe.clone(),
            &self.graph,
            self.config.split.integrity_checks,
        );
        self.graph.backward(&pending.cache, &output_grad, &mut collector)?;
        let gradients = collector.into_step();

        let warnings = self.tracker.update(&gradients, &self.registry)?;
        let grad_norm = self.optimizer.apply(&mut self.graph, gradients.totals())?;

        let mut split_events = Vec::new();
        if let Some(candidate) = self.engine.decide(&self.tracker, &self.registry) {
            let event = self.mutator.apply(
                &mut self.graph,
                &mut self.registry,
                &mut self.tracker,
                &mut self.optimizer,
                SplitRequest::from(candidate),
                self.step,
            )?;
            split_events.push(event);
        }

        let z_scores = self.tracker.z_scores();
        let max_candidate_z = z_scores
            .iter()
            .filter(|e| matches!(e.subject, StatSubject::Proposed(_)))
            .map(|e| e.z_score)
            .fold(None, |acc: Option<f64>, z| Some(acc.map_or(z, |m| m.max(z))));

        let stats_observed = z_scores.len();
        let stats_floored = warnings
            .iter()
            .filter(|w| matches!(w.kind, WarningKind::VarianceFloored { .. }))
            .count();
        let non_finite = warnings.len() - stats_floored;
        let before = self.health.overall_status();
        self.health.record(&StepHealth {
            step: self.step,
            stats_observed,
            stats_floored,
            non_finite,
            grad_norm,
            max_candidate_z,
        });
        let health = self.health.overall_status();
        if std::mem::discriminant(&health) != std::mem::discriminant(&before) {
            match &health {
                HealthStatus::Healthy => info!(step = self.step, "statistics healthy again"),
                HealthStatus::Degraded(why) | HealthStatus::Critical(why) => {
                    warn!(step = self.step, status = ?health, reason = %why, "statistics health changed")
                }
            }
        }

        let task_losses: Vec<(TaskId, f32)> = losses.iter().map(|l| (l.task, l.value)).collect();
        let metrics = TrainStepMetrics {
            step: self.step,
            total_loss: task_losses.iter().map(|(_, v)| v).sum(),
            task_losses,
            backward_passes: gradients.backward_passes(),
            grad_norm,
            copies_per_region: self.graph.regions().iter().map(|r| r.num_live_copies()).collect(),
            split_regions: (0..self.registry.num_regions())
                .filter(|&r| self.registry.is_split(r))
                .collect(),
            z_scores,
            max_candidate_z,
            split_events,
            warnings,
            health,
        };
        debug!(
            step = metrics.step,
            loss = metrics.total_loss,
            grad_norm,
            max_z = ?metrics.max_candidate_z,
            "train step"
        );
        self.step += 1;
        Ok(metrics)
    }

    fn assemble_output_grad(&self, pending: &PendingStep, losses: &[TaskLoss]) -> Result<Array2<f32>, SplitError> {
        let out_dim = self.config.network.output_size;
        let mut grad = Array2::<f32>::zeros((pending.cache.batch_size(), out_dim));
        let mut seen = vec![false; self.universe.len()];
        for loss in losses {
            let pos = self
                .universe
                .position(loss.task)
                .ok_or(SplitError::UnknownTask { task: loss.task, region: 0 })?;
            if seen[pos] {
                return Err(SplitError::Shape(format!("task {} has more than one loss", loss.task)));
            }
            seen[pos] = true;

            let rows = &pending.cache.rows_by_task[pos];
            if loss.output_grad.dim() != (rows.len(), out_dim) {
                return Err(SplitError::Shape(format!(
                    "task {} loss gradient is {:?}, its rows need ({}, {})",
                    loss.task,
                    loss.output_grad.dim(),
                    rows.len(),
                    out_dim
                )));
            }
            for (k, &row) in rows.iter().enumerate() {
                grad.row_mut(row).assign(&loss.output_grad.row(k));
            }
        }
        Ok(grad)
    }

    /// Split a group by hand, with the same validation and bookkeeping as an
    /// automatic split. Not allowed between `forward` and `backward_and_update`.
    pub fn force_split(
        &mut self,
        region: usize,
        group: GroupId,
        child_a: Vec<TaskId>,
        child_b: Vec<TaskId>,
    ) -> Result<SplitEvent, SplitError> {
        if self.pending.is_some() {
            return Err(SplitError::StepInProgress);
        }
        self.mutator.apply(
            &mut self.graph,
            &mut self.registry,
            &mut self.tracker,
            &mut self.optimizer,
            SplitRequest {
                region,
                group,
                child_a,
                child_b,
                z_score: None,
            },
            self.step,
        )
    }

    pub fn get_architecture_snapshot(&self) -> ArchitectureSnapshot {
        ArchitectureSnapshot::capture(
            &self.universe,
            &self.graph,
            &self.registry,
            self.mutator.events(),
            self.step,
        )
    }

    /// Replace architecture, weights and split log with the snapshot's.
    /// Statistics, optimizer state and health history restart empty.
    pub fn load_architecture_snapshot(&mut self, snapshot: &ArchitectureSnapshot) -> Result<(), SplitError> {
        let (graph, registry) = snapshot.restore(self.universe.clone())?;

        let n = &self.config.network;
        let expected_in = n.obs_dim + if n.include_task_index { self.universe.len() } else { 0 };
        let first_in = graph.regions().first().map(|r| r.in_dim);
        let last_out = graph.regions().last().map(|r| r.out_dim);
        if first_in != Some(expected_in) || last_out != Some(n.output_size) {
            return Err(SplitError::SnapshotMismatch(format!(
                "snapshot maps {:?} inputs to {:?} outputs, network expects {} to {}",
                first_in, last_out, expected_in, n.output_size
            )));
        }

        self.tracker = Self::fresh_tracker(&self.config, &self.universe, &graph);
        self.graph = graph;
        self.registry = registry;
        self.optimizer.reset();
        self.mutator = NetworkMutator::from_events(snapshot.split_log.clone());
        self.health.reset();
        self.pending = None;
        self.step = snapshot.step;
        info!(
            step = self.step,
            splits = snapshot.split_log.len(),
            params = self.graph.param_count(),
            "architecture snapshot loaded"
        );
        Ok(())
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn universe(&self) -> &Arc<TaskUniverse> {
        &self.universe
    }

    pub fn graph(&self) -> &RegionGraph {
        &self.graph
    }

    pub fn registry(&self) -> &TaskGroupRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &GradientStatisticsTracker {
        &self.tracker
    }

    pub fn split_events(&self) -> &[SplitEvent] {
        self.mutator.events()
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe(n: u32) -> Arc<TaskUniverse> {
        TaskUniverse::sequential(n).unwrap().shared()
    }

    fn small_config() -> AdapterConfig {
        AdapterConfig {
            network: NetworkConfig {
                obs_dim: 3,
                hidden_size: 4,
                output_size: 2,
                num_layers: 2,
                include_task_index: false,
                seed: 1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let mut config = small_config();
        config.split.ema.alpha = 1.5;
        let err = MultiTaskPolicyAdapter::new(config, universe(2)).err().unwrap();
        assert!(matches!(err, SplitError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_cap_below_two() {
        let mut config = small_config();
        config.split.architecture = Architecture::Splitting {
            trigger: SplitTrigger::Capped {
                threshold: 4.0,
                min_steps: 10,
                max_copies: 1,
            },
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backward_without_forward() {
        let mut adapter = MultiTaskPolicyAdapter::new(small_config(), universe(2)).unwrap();
        let err = adapter.backward_and_update(&[]).unwrap_err();
        assert!(matches!(err, SplitError::NoForwardPass));
    }

    #[test]
    fn test_task_index_columns() {
        let mut config = small_config();
        config.network.include_task_index = true;
        let u = universe(3);
        let mut adapter = MultiTaskPolicyAdapter::new(config, u.clone()).unwrap();
        assert_eq!(adapter.graph().regions()[0].in_dim, 6);

        // Same observation, different tasks: outputs differ through the index.
        let batch = TaskBatch::new(&u, vec![TaskId(0), TaskId(2)], Array2::zeros((2, 3))).unwrap();
        let out = adapter.forward(&batch).unwrap();
        assert_eq!(out.outputs.dim(), (2, 2));
        assert_ne!(out.outputs.row(0), out.outputs.row(1));
        assert_eq!(out.for_task(TaskId(2)).nrows(), 1);
    }

    #[test]
    fn test_loss_shape_checked() {
        let u = universe(2);
        let mut adapter = MultiTaskPolicyAdapter::new(small_config(), u.clone()).unwrap();
        let batch = TaskBatch::new(&u, vec![TaskId(0), TaskId(0), TaskId(1)], Array2::ones((3, 3))).unwrap();
        adapter.forward(&batch).unwrap();
        let err = adapter
            .backward_and_update(&[TaskLoss {
                task: TaskId(0),
                value: 1.0,
                output_grad: Array2::ones((1, 2)),
            }])
            .unwrap_err();
        assert!(matches!(err, SplitError::Shape(_)));
    }

    #[test]
    fn test_force_split_rejected_mid_step() {
        let u = universe(2);
        let mut adapter = MultiTaskPolicyAdapter::new(small_config(), u.clone()).unwrap();
        let batch = TaskBatch::new(&u, vec![TaskId(0), TaskId(1)], Array2::ones((2, 3))).unwrap();
        adapter.forward(&batch).unwrap();
        let err = adapter
            .force_split(0, GroupId(0), vec![TaskId(0)], vec![TaskId(1)])
            .unwrap_err();
        assert!(matches!(err, SplitError::StepInProgress));
        assert!(adapter.split_events().is_empty());
    }

    #[test]
    fn test_one_step_metrics() {
        let u = universe(2);
        let mut adapter = MultiTaskPolicyAdapter::new(small_config(), u.clone()).unwrap();
        let batch = TaskBatch::new(&u, vec![TaskId(0), TaskId(1)], Array2::ones((2, 3))).unwrap();
        adapter.forward(&batch).unwrap();
        let metrics = adapter
            .backward_and_update(&[
                TaskLoss { task: TaskId(0), value: 0.5, output_grad: Array2::ones((1, 2)) },
                TaskLoss { task: TaskId(1), value: 0.25, output_grad: Array2::from_elem((1, 2), -0.5) },
            ])
            .unwrap();
        assert_eq!(metrics.step, 0);
        assert_eq!(metrics.backward_passes, 1);
        assert!((metrics.total_loss - 0.75).abs() < 1e-6);
        assert_eq!(metrics.copies_per_region, vec![1, 1]);
        assert!(metrics.split_events.is_empty());
        assert!(metrics.max_candidate_z.is_some());
        assert_eq!(adapter.step(), 1);
    }
}
