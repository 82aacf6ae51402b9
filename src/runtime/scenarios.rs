//! End-to-end behaviour of the adapter: split triggering, cold start,
//! snapshot round trips and the structural invariants that must hold at
//! every step.

use std::sync::Arc;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::core::registry::GroupId;
use crate::core::task::{TaskBatch, TaskId, TaskUniverse};
use crate::error::SplitError;
use crate::learning::estimate::EmaSchedule;
use crate::learning::split::SplitTrigger;
use crate::learning::statistics::ColdStartPolicy;
use crate::runtime::adapter::{
    AdapterConfig, Architecture, MultiTaskPolicyAdapter, NetworkConfig, SplitConfig, TaskLoss, TrainStepMetrics,
};

const OBS: usize = 3;
const OUT: usize = 2;

fn config(layers: usize, schedule: EmaSchedule, cold_start: ColdStartPolicy) -> AdapterConfig {
    AdapterConfig {
        network: NetworkConfig {
            obs_dim: OBS,
            hidden_size: 4,
            output_size: OUT,
            num_layers: layers,
            include_task_index: false,
            seed: 42,
        },
        split: SplitConfig {
            architecture: Architecture::Splitting {
                trigger: SplitTrigger::ZScore {
                    threshold: 4.0,
                    min_steps: 30,
                },
            },
            ema: schedule,
            cold_start,
            integrity_checks: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn universe(n: u32) -> Arc<TaskUniverse> {
    TaskUniverse::sequential(n).unwrap().shared()
}

/// Two rows, one per task, with the same observation.
fn twin_batch(universe: &TaskUniverse) -> TaskBatch {
    let obs = Array2::from_shape_vec((2, OBS), vec![0.5, -1.0, 0.25, 0.5, -1.0, 0.25]).unwrap();
    TaskBatch::new(universe, vec![TaskId(0), TaskId(1)], obs).unwrap()
}

/// One step where task 0 receives `grad_a` and task 1 receives `grad_b` at the output.
fn twin_step(
    adapter: &mut MultiTaskPolicyAdapter,
    grad_a: [f32; OUT],
    grad_b: [f32; OUT],
) -> TrainStepMetrics {
    let batch = twin_batch(adapter.universe());
    adapter.forward(&batch).unwrap();
    adapter
        .backward_and_update(&[
            TaskLoss {
                task: TaskId(0),
                value: 1.0,
                output_grad: Array2::from_shape_vec((1, OUT), grad_a.to_vec()).unwrap(),
            },
            TaskLoss {
                task: TaskId(1),
                value: 1.0,
                output_grad: Array2::from_shape_vec((1, OUT), grad_b.to_vec()).unwrap(),
            },
        ])
        .unwrap()
}

/// Regression where task `t` fits `sign(t) · x · M`; even and odd tasks conflict.
struct ConflictingTasks {
    universe: Arc<TaskUniverse>,
    target: Array2<f32>,
    rng: StdRng,
    normal: Normal<f32>,
}

impl ConflictingTasks {
    fn new(tasks: u32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, 1.0).unwrap();
        let target = Array2::from_shape_fn((OBS, OUT), |_| normal.sample(&mut rng));
        Self {
            universe: universe(tasks),
            target,
            rng,
            normal,
        }
    }

    fn step(&mut self, adapter: &mut MultiTaskPolicyAdapter, rows_per_task: usize) -> Result<TrainStepMetrics, SplitError> {
        let n = self.universe.len() * rows_per_task;
        let tasks: Vec<TaskId> = (0..n).map(|i| self.universe.ids()[i % self.universe.len()]).collect();
        let obs = Array2::from_shape_fn((n, OBS), |_| self.normal.sample(&mut self.rng));
        let batch = TaskBatch::new(&self.universe, tasks.clone(), obs.clone())?;
        let out = adapter.forward(&batch)?;

        let mut losses = Vec::new();
        for (pos, &task) in self.universe.ids().iter().enumerate() {
            let rows: Vec<usize> = (0..n).filter(|i| i % self.universe.len() == pos).collect();
            let sign: f32 = if pos % 2 == 0 { 1.0 } else { -1.0 };
            let x = obs.select(ndarray::Axis(0), &rows);
            let y = x.dot(&self.target) * sign;
            let pred = out.for_task(task);
            let err = &pred - &y;
            let scale = 2.0 / (rows.len() * OUT) as f32;
            losses.push(TaskLoss {
                task,
                value: err.mapv(|e| e * e).mean().unwrap_or(0.0),
                output_grad: err * scale,
            });
        }
        adapter.backward_and_update(&losses)
    }
}

#[test]
fn test_scenario_a_identical_gradients_never_split() {
    let mut adapter = MultiTaskPolicyAdapter::new(
        config(1, EmaSchedule::default(), ColdStartPolicy::Fresh),
        universe(2),
    )
    .unwrap();
    for _ in 0..100 {
        let m = twin_step(&mut adapter, [0.3, -0.2], [0.3, -0.2]);
        assert!(m.split_events.is_empty());
        let z = m.max_candidate_z.unwrap();
        assert!(z < 1e-2, "step {} z = {}", m.step, z);
    }
    assert!(adapter.split_events().is_empty());
    assert!(!adapter.registry().is_split(0));
}

#[test]
fn test_scenario_b_opposite_gradients_split_once() {
    let mut adapter = MultiTaskPolicyAdapter::new(
        config(1, EmaSchedule::pure(0.1), ColdStartPolicy::Fresh),
        universe(2),
    )
    .unwrap();

    let mut peak_z: f64 = 0.0;
    let mut split_step = None;
    for _ in 0..50 {
        let m = twin_step(&mut adapter, [0.3, -0.2], [-0.3, 0.2]);
        if split_step.is_none() {
            peak_z = peak_z.max(m.max_candidate_z.unwrap_or(0.0));
        }
        if !m.split_events.is_empty() {
            assert!(split_step.is_none(), "second split at step {}", m.step);
            split_step = Some(m.step);
        }
    }

    assert!(peak_z > 4.0, "peak z = {}", peak_z);
    // Eligible from the 30th sample on.
    assert_eq!(split_step, Some(29));

    let events = adapter.split_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].child_a.members, vec![TaskId(0)]);
    assert_eq!(events[0].child_b.members, vec![TaskId(1)]);
    assert!(events[0].z_score.unwrap() > 4.0);

    let groups = adapter.registry().groups(0).unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.len() == 1));
    assert_ne!(
        adapter.registry().route(TaskId(0), 0).unwrap(),
        adapter.registry().route(TaskId(1), 0).unwrap()
    );
}

#[test]
fn test_scenario_c_new_pair_starts_cold() {
    let mut adapter = MultiTaskPolicyAdapter::new(
        config(1, EmaSchedule::pure(0.1), ColdStartPolicy::Fresh),
        universe(2),
    )
    .unwrap();
    let mut event = None;
    while event.is_none() {
        let m = twin_step(&mut adapter, [0.3, -0.2], [-0.3, 0.2]);
        event = m.split_events.into_iter().next();
    }
    let event = event.unwrap();
    let parent = event.parent;
    let (a, b) = (event.child_a.group, event.child_b.group);

    let tracker = adapter.tracker();
    assert!(tracker.proposal(0, parent).is_none());
    let pair = tracker.pair(0, a, b).unwrap();
    assert_eq!(pair.steps(), 0);
    assert_eq!(pair.mean_diff_sq(), 0.0);

    twin_step(&mut adapter, [0.3, -0.2], [-0.3, 0.2]);
    assert_eq!(adapter.tracker().pair(0, a, b).unwrap().steps(), 1);
}

#[test]
fn test_scenario_c_inherit_parent_keeps_only_a_fraction() {
    let mut adapter = MultiTaskPolicyAdapter::new(
        config(1, EmaSchedule::pure(0.1), ColdStartPolicy::InheritParent { fraction: 0.5 }),
        universe(2),
    )
    .unwrap();
    let mut event = None;
    while event.is_none() {
        let m = twin_step(&mut adapter, [0.3, -0.2], [-0.3, 0.2]);
        event = m.split_events.into_iter().next();
    }
    let event = event.unwrap();
    let pair = adapter
        .tracker()
        .pair(0, event.child_a.group, event.child_b.group)
        .unwrap();
    assert_eq!(pair.steps(), 15);
    assert!(pair.mean_diff_sq() > 0.0);
}

#[test]
fn test_scenario_d_snapshot_roundtrip_after_three_splits() {
    let u = universe(4);
    let cfg = config(3, EmaSchedule::default(), ColdStartPolicy::Fresh);
    let mut adapter = MultiTaskPolicyAdapter::new(cfg.clone(), u.clone()).unwrap();
    let mut data = ConflictingTasks::new(4, 3);

    for _ in 0..5 {
        data.step(&mut adapter, 2).unwrap();
    }
    adapter
        .force_split(0, GroupId(0), vec![TaskId(0), TaskId(2)], vec![TaskId(1), TaskId(3)])
        .unwrap();
    adapter
        .force_split(2, GroupId(0), vec![TaskId(0)], vec![TaskId(1), TaskId(2), TaskId(3)])
        .unwrap();
    adapter
        .force_split(0, GroupId(2), vec![TaskId(1)], vec![TaskId(3)])
        .unwrap();
    for _ in 0..5 {
        data.step(&mut adapter, 2).unwrap();
    }

    let bytes = adapter.get_architecture_snapshot().to_bytes().unwrap();
    let snapshot = crate::runtime::snapshot::ArchitectureSnapshot::from_bytes(&bytes).unwrap();
    assert_eq!(snapshot.split_log.len(), 3);

    let mut restored = MultiTaskPolicyAdapter::new(cfg, u.clone()).unwrap();
    restored.load_architecture_snapshot(&snapshot).unwrap();

    assert_eq!(restored.registry().routing_table(), adapter.registry().routing_table());
    assert_eq!(restored.graph().regions(), adapter.graph().regions());
    assert_eq!(restored.split_events(), adapter.split_events());
    assert_eq!(restored.step(), adapter.step());

    let obs = Array2::from_shape_fn((8, OBS), |(i, j)| ((i * OBS + j) as f32 * 0.7).sin());
    let tasks = (0..8).map(|i| TaskId(i % 4)).collect::<Vec<_>>();
    let batch = TaskBatch::new(&u, tasks, obs).unwrap();
    let a = adapter.forward(&batch).unwrap();
    let b = restored.forward(&batch).unwrap();
    assert_eq!(a.outputs, b.outputs);
}

#[test]
fn test_snapshot_from_other_universe_rejected() {
    let cfg = config(2, EmaSchedule::default(), ColdStartPolicy::Fresh);
    let adapter = MultiTaskPolicyAdapter::new(cfg.clone(), universe(3)).unwrap();
    let snapshot = adapter.get_architecture_snapshot();

    let mut other = MultiTaskPolicyAdapter::new(cfg, universe(4)).unwrap();
    let before = other.registry().routing_table();
    let err = other.load_architecture_snapshot(&snapshot).unwrap_err();
    assert!(matches!(err, SplitError::UniverseMismatch { .. }));
    assert!(err.is_fatal());
    assert_eq!(other.registry().routing_table(), before);
}

#[test]
fn test_invariants_hold_every_step() {
    let mut cfg = config(3, EmaSchedule::pure(0.2), ColdStartPolicy::Fresh);
    cfg.split.architecture = Architecture::Splitting {
        trigger: SplitTrigger::ZScore {
            threshold: 2.0,
            min_steps: 5,
        },
    };
    let mut data = ConflictingTasks::new(4, 11);
    let mut adapter = MultiTaskPolicyAdapter::new(cfg, data.universe.clone()).unwrap();

    for step in 0..150u64 {
        let m = data.step(&mut adapter, 3).unwrap();
        assert_eq!(m.backward_passes, 1);
        assert!(m.split_events.len() <= 1);
        assert!(adapter.registry().check_partition().is_ok());
        assert_eq!(adapter.graph().backward_passes(), step + 1);
        for (r, region) in adapter.graph().regions().iter().enumerate() {
            assert_eq!(region.num_live_copies(), adapter.registry().groups(r).unwrap().len());
        }
    }
    assert!(!adapter.split_events().is_empty(), "conflicting tasks never split");
}

#[test]
fn test_capped_trigger_never_exceeds_max_copies() {
    let mut cfg = config(1, EmaSchedule::pure(0.2), ColdStartPolicy::Fresh);
    cfg.split.architecture = Architecture::Splitting {
        trigger: SplitTrigger::Capped {
            threshold: 2.0,
            min_steps: 5,
            max_copies: 2,
        },
    };
    let mut data = ConflictingTasks::new(4, 11);
    let mut adapter = MultiTaskPolicyAdapter::new(cfg, data.universe.clone()).unwrap();

    for _ in 0..200 {
        let m = data.step(&mut adapter, 3).unwrap();
        assert!(m.copies_per_region.iter().all(|&c| c <= 2), "{:?}", m.copies_per_region);
    }
    assert_eq!(adapter.split_events().len(), 1);
    assert_eq!(adapter.graph().regions()[0].num_live_copies(), 2);
}

#[test]
fn test_shared_architecture_never_splits() {
    let mut cfg = config(2, EmaSchedule::pure(0.1), ColdStartPolicy::Fresh);
    cfg.split.architecture = Architecture::Shared;
    let mut adapter = MultiTaskPolicyAdapter::new(cfg, universe(2)).unwrap();
    for _ in 0..60 {
        let m = twin_step(&mut adapter, [0.3, -0.2], [-0.3, 0.2]);
        assert!(m.split_events.is_empty());
    }
    // Statistics are still tracked.
    assert!(adapter.tracker().proposal(0, GroupId(0)).unwrap().stat.z_score > 4.0);
}

#[test]
fn test_split_runs_are_reproducible() {
    let run = || {
        let mut cfg = config(3, EmaSchedule::pure(0.2), ColdStartPolicy::Fresh);
        cfg.split.architecture = Architecture::Splitting {
            trigger: SplitTrigger::ZScore {
                threshold: 2.0,
                min_steps: 5,
            },
        };
        let mut data = ConflictingTasks::new(4, 5);
        let mut adapter = MultiTaskPolicyAdapter::new(cfg, data.universe.clone()).unwrap();
        for _ in 0..80 {
            data.step(&mut adapter, 2).unwrap();
        }
        adapter.split_events().to_vec()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_absent_task_keeps_its_statistics_still() {
    let u = universe(3);
    let mut adapter = MultiTaskPolicyAdapter::new(config(1, EmaSchedule::default(), ColdStartPolicy::Fresh), u.clone()).unwrap();
    let batch = TaskBatch::new(&u, vec![TaskId(0), TaskId(1)], Array2::ones((2, OBS))).unwrap();
    adapter.forward(&batch).unwrap();
    let m = adapter
        .backward_and_update(&[TaskLoss {
            task: TaskId(0),
            value: 0.0,
            output_grad: Array2::zeros((1, OUT)),
        }])
        .unwrap();
    assert_eq!(m.backward_passes, 1);
    let tracker = adapter.tracker();
    // Present with a zero gradient: still counted.
    assert_eq!(tracker.task_moments(0, TaskId(0)).unwrap().steps, 1);
    assert_eq!(tracker.task_moments(0, TaskId(1)).unwrap().steps, 1);
    // Absent: untouched.
    assert_eq!(tracker.task_moments(0, TaskId(2)).unwrap().steps, 0);
}

#[test]
fn test_integrity_error_aborts_step() {
    let u = universe(2);
    let mut adapter = MultiTaskPolicyAdapter::new(config(2, EmaSchedule::default(), ColdStartPolicy::Fresh), u.clone()).unwrap();
    let before = adapter.graph().regions().to_vec();
    let mut batch = TaskBatch::new(&u, vec![TaskId(0)], Array2::ones((1, OBS))).unwrap();
    batch.active[1] = true;
    adapter.forward(&batch).unwrap();
    let err = adapter
        .backward_and_update(&[TaskLoss {
            task: TaskId(0),
            value: 1.0,
            output_grad: Array2::ones((1, OUT)),
        }])
        .unwrap_err();
    assert!(matches!(err, SplitError::Integrity(_)));
    assert_eq!(adapter.graph().regions(), before.as_slice());
    assert_eq!(adapter.step(), 0);
}
