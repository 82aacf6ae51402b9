//! Core module — tasks, the region graph with its copy arenas, and the
//! per-region task-group routing table.

pub mod region;
pub mod registry;
pub mod task;
