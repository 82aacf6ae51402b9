//! # SPLITNET
//!
//! **Gradient-driven architecture splitting** for a single policy network shared
//! across many reinforcement-learning tasks.
//!
//! Every layer ("region") starts fully shared by all tasks. While training, the
//! per-task gradients flowing into each region are tracked online, and when the
//! gradients of two sets of tasks at a region become statistically divergent the
//! region's parameters are duplicated and the tasks are routed to separate
//! copies. Capacity grows exactly where tasks disagree.
//!
//! ## Components
//!
//! 1. **RegionGraph** — ordered regions, each an arena of parameter copies
//! 2. **TaskGroupRegistry** — per-region partition of tasks into groups → copy
//! 3. **GradientCollector** — per-task gradients from one backward pass
//! 4. **GradientStatisticsTracker** — EMA divergence statistics and z-scores
//! 5. **SplitDecisionEngine** — picks at most one split per step
//! 6. **NetworkMutator** — atomic copy duplication and routing update
//! 7. **MultiTaskPolicyAdapter** — the surface used by the optimisation loop
//!
//! ## Step
//!
//! forward (per-task routing) → external per-task losses → one backward pass →
//! per-task, per-region gradients → statistics → ≤1 split → next step.

pub mod core;
pub mod error;
pub mod learning;
pub mod runtime;

pub use error::{ErrorClass, SplitError};

/// Crate-wide defaults.
pub mod config {
    /// EMA coefficient α for running estimates (weight of the newest sample).
    pub const EMA_ALPHA: f64 = 0.01;

    /// Number of samples averaged arithmetically before switching to the EMA.
    pub const EMA_WARMUP_STEPS: u64 = 100;

    /// Z-score a candidate split must exceed.
    pub const SPLIT_THRESHOLD: f64 = 4.0;

    /// Samples a divergence statistic needs before its candidate is eligible.
    pub const MIN_SPLIT_STEPS: u64 = 30;

    /// Lower bound for the z-score denominator.
    pub const VARIANCE_FLOOR: f64 = 1e-8;

    /// Default hidden width of every hidden region.
    pub const HIDDEN_SIZE: usize = 64;

    /// Default number of regions (layers).
    pub const NUM_LAYERS: usize = 3;

    /// Default learning rate.
    pub const LEARNING_RATE: f32 = 3e-4;

    /// Rolling window length used by the health monitor.
    pub const HEALTH_WINDOW: usize = 256;
}
