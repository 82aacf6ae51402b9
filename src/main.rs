//! SPLITNET — gradient-driven architecture splitting.
//!
//! This is the CLI binary entry point. It trains a small policy-shaped network
//! on a synthetic multi-task regression where tasks come in conflicting
//! clusters, and logs where the network decides to split.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use splitnet::core::task::{TaskBatch, TaskId, TaskUniverse};
use splitnet::learning::estimate::EmaSchedule;
use splitnet::learning::optim::OptimizerConfig;
use splitnet::learning::split::SplitTrigger;
use splitnet::learning::statistics::ColdStartPolicy;
use splitnet::runtime::adapter::{
    AdapterConfig, Architecture, MultiTaskPolicyAdapter, NetworkConfig, SplitConfig, TaskLoss,
};
use splitnet::runtime::snapshot::ArchitectureSnapshot;

/// SPLITNET training demo.
#[derive(Parser, Debug)]
#[command(
    name = "splitnet",
    about = "SPLITNET — split shared layers where task gradients disagree",
    version
)]
struct Cli {
    /// Number of tasks.
    #[arg(short, long, default_value_t = 4)]
    tasks: u32,

    /// Number of conflicting task clusters.
    #[arg(long, default_value_t = 2)]
    clusters: u32,

    /// Training steps.
    #[arg(short = 'n', long, default_value_t = 500)]
    steps: u64,

    /// Samples per task per step.
    #[arg(long, default_value_t = 16)]
    batch: usize,

    #[arg(long, default_value_t = 8)]
    obs_dim: usize,

    #[arg(long, default_value_t = 2)]
    output_size: usize,

    #[arg(long, default_value_t = splitnet::config::HIDDEN_SIZE)]
    hidden: usize,

    #[arg(long, default_value_t = splitnet::config::NUM_LAYERS)]
    layers: usize,

    /// Z-score a split must exceed.
    #[arg(long, default_value_t = splitnet::config::SPLIT_THRESHOLD)]
    threshold: f64,

    /// Samples a statistic needs before it may trigger a split.
    #[arg(long, default_value_t = splitnet::config::MIN_SPLIT_STEPS)]
    min_steps: u64,

    /// Cap on copies per region.
    #[arg(long)]
    max_copies: Option<usize>,

    /// EMA coefficient.
    #[arg(long, default_value_t = splitnet::config::EMA_ALPHA)]
    alpha: f64,

    /// Arithmetic warm-up length before the EMA takes over.
    #[arg(long, default_value_t = splitnet::config::EMA_WARMUP_STEPS)]
    warmup: u64,

    /// Fraction of parent statistics inherited by a new pair (0 = fresh).
    #[arg(long, default_value_t = 0.0)]
    inherit: f64,

    #[arg(long, default_value_t = 1e-3)]
    lr: f32,

    #[arg(long)]
    max_grad_norm: Option<f32>,

    /// Append a one-hot task index to observations.
    #[arg(long, default_value_t = false)]
    task_index: bool,

    /// Keep the network fully shared (baseline).
    #[arg(long, default_value_t = false)]
    shared: bool,

    /// Run structural integrity checks every step.
    #[arg(long, default_value_t = false)]
    safe: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log every N steps.
    #[arg(long, default_value_t = 50)]
    log_every: u64,

    /// Write the final architecture snapshot here.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Resume from this snapshot.
    #[arg(long)]
    resume: Option<PathBuf>,
}

impl Cli {
    fn adapter_config(&self) -> AdapterConfig {
        let trigger = match self.max_copies {
            Some(max_copies) => SplitTrigger::Capped {
                threshold: self.threshold,
                min_steps: self.min_steps,
                max_copies,
            },
            None => SplitTrigger::ZScore {
                threshold: self.threshold,
                min_steps: self.min_steps,
            },
        };
        AdapterConfig {
            network: NetworkConfig {
                obs_dim: self.obs_dim,
                hidden_size: self.hidden,
                output_size: self.output_size,
                num_layers: self.layers,
                include_task_index: self.task_index,
                seed: self.seed,
            },
            split: SplitConfig {
                architecture: if self.shared {
                    Architecture::Shared
                } else {
                    Architecture::Splitting { trigger }
                },
                ema: EmaSchedule {
                    alpha: self.alpha,
                    warmup_steps: self.warmup,
                },
                cold_start: if self.inherit > 0.0 {
                    ColdStartPolicy::InheritParent { fraction: self.inherit }
                } else {
                    ColdStartPolicy::Fresh
                },
                integrity_checks: self.safe,
                ..Default::default()
            },
            optimizer: OptimizerConfig::Adam {
                lr: self.lr,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
            },
            max_grad_norm: self.max_grad_norm,
        }
    }
}

/// Each cluster regresses onto its own random linear map.
struct SyntheticTasks {
    universe: std::sync::Arc<TaskUniverse>,
    maps: Vec<Array2<f32>>,
    clusters: usize,
    rng: StdRng,
    normal: Normal<f32>,
}

impl SyntheticTasks {
    fn new(cli: &Cli) -> anyhow::Result<Self> {
        let universe = TaskUniverse::sequential(cli.tasks)?.shared();
        let mut rng = StdRng::seed_from_u64(cli.seed.wrapping_add(1));
        let normal = Normal::new(0.0f32, 1.0)?;
        let clusters = cli.clusters.max(1) as usize;
        let maps = (0..clusters)
            .map(|_| Array2::from_shape_fn((cli.obs_dim, cli.output_size), |_| normal.sample(&mut rng)))
            .collect();
        Ok(Self {
            universe,
            maps,
            clusters,
            rng,
            normal,
        })
    }

    fn batch(&mut self, per_task: usize, obs_dim: usize) -> anyhow::Result<TaskBatch> {
        let n = self.universe.len() * per_task;
        let tasks: Vec<TaskId> = (0..n).map(|i| self.universe.ids()[i % self.universe.len()]).collect();
        let obs = Array2::from_shape_fn((n, obs_dim), |_| self.normal.sample(&mut self.rng));
        Ok(TaskBatch::new(&self.universe, tasks, obs)?)
    }

    /// Mean squared error per task and its gradient w.r.t. the outputs.
    fn losses(&self, batch: &TaskBatch, outputs: &Array2<f32>) -> Vec<TaskLoss> {
        let mut losses = Vec::with_capacity(self.universe.len());
        for (pos, &task) in self.universe.ids().iter().enumerate() {
            let rows: Vec<usize> = batch
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| **t == task)
                .map(|(i, _)| i)
                .collect();
            if rows.is_empty() {
                continue;
            }
            let x = batch.observations.select(Axis(0), &rows);
            let target = x.dot(&self.maps[pos % self.clusters]);
            let err = outputs.select(Axis(0), &rows) - &target;
            let scale = 2.0 / err.len() as f32;
            losses.push(TaskLoss {
                task,
                value: err.mapv(|e| e * e).mean().unwrap_or(0.0),
                output_grad: err * scale,
            });
        }
        losses
    }
}

fn main() -> anyhow::Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    tracing::info!("SPLITNET v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.adapter_config();
    tracing::info!(
        "Config: {} tasks in {} clusters, {} regions of width {}, {:?}",
        cli.tasks,
        cli.clusters,
        config.network.num_layers,
        config.network.hidden_size,
        config.split.architecture,
    );

    let mut data = SyntheticTasks::new(&cli)?;
    let mut adapter = MultiTaskPolicyAdapter::new(config, data.universe.clone())?;

    if let Some(path) = &cli.resume {
        let bytes = std::fs::read(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        let snapshot = ArchitectureSnapshot::from_bytes(&bytes)?;
        adapter.load_architecture_snapshot(&snapshot)?;
    }

    let start = adapter.step();
    for _ in 0..cli.steps {
        let batch = data.batch(cli.batch, cli.obs_dim)?;
        let outputs = adapter.forward(&batch)?;
        let losses = data.losses(&batch, &outputs.outputs);
        let metrics = adapter.backward_and_update(&losses)?;

        for event in &metrics.split_events {
            tracing::info!(
                "step {}: region {} split {:?} | {:?} (z = {:?})",
                event.step,
                event.region,
                event.child_a.members,
                event.child_b.members,
                event.z_score,
            );
        }
        if (metrics.step - start) % cli.log_every.max(1) == 0 {
            tracing::info!(
                "step {:>5}  loss {:.4}  |g| {:.3}  max z {:>8.2}  copies {:?}",
                metrics.step,
                metrics.total_loss,
                metrics.grad_norm,
                metrics.max_candidate_z.unwrap_or(0.0),
                metrics.copies_per_region,
            );
        }
    }

    let report = adapter.health();
    tracing::info!("Health: {:?}", report.status);
    tracing::info!("  Floor rate: {:.1}%", report.floor_rate * 100.0);
    tracing::info!("  Avg |g|: {:.3}", report.avg_grad_norm);
    tracing::info!(
        "Splits: {}, parameters: {}",
        adapter.split_events().len(),
        adapter.graph().param_count()
    );

    if let Some(path) = &cli.snapshot {
        let bytes = adapter.get_architecture_snapshot().to_bytes()?;
        std::fs::write(path, bytes).with_context(|| format!("writing snapshot {}", path.display()))?;
        tracing::info!("Snapshot written to {}", path.display());
    }

    tracing::info!("Done.");
    Ok(())
}
