//! Online gradient statistics and structural learning.
//!
//! - **Collector** extracts per-task gradients from a single backward pass
//! - **Statistics** keeps EMA divergence estimates and z-scores per region
//! - **Split** proposes partitions and picks at most one split per step
//! - **Mutator** duplicates copies and rewires routing atomically
//! - **Optim** applies updates and keeps per-copy optimizer state aligned

pub mod collector;
pub mod estimate;
pub mod mutator;
pub mod optim;
pub mod split;
pub mod statistics;
