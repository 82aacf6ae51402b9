//! Runtime module: the surface consumed by the optimisation loop.
//!
//! This module provides:
//! - The multi-task policy adapter (forward, backward-and-update)
//! - Architecture snapshots for checkpointing
//! - Health monitoring of the split statistics

pub mod adapter;
pub mod health;
pub mod snapshot;

#[cfg(test)]
mod scenarios;
