//! Architecture snapshot for checkpointing.
//!
//! A snapshot carries everything needed to rebuild routing and weights
//! exactly: the task universe, every region with its copy arena (retired
//! slots included, so handles stay valid), the routing groups and the split
//! log. Optimizer moments and divergence statistics are not part of it; a
//! restored run starts both fresh.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::region::{Region, RegionGraph};
use crate::core::registry::{RegionRouting, TaskGroupRegistry};
use crate::core::task::{TaskId, TaskUniverse};
use crate::error::SplitError;
use crate::learning::mutator::SplitEvent;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSnapshot {
    /// Task universe in its fixed order.
    pub tasks: Vec<TaskId>,
    pub regions: Vec<Region>,
    pub routing: Vec<RegionRouting>,
    pub split_log: Vec<SplitEvent>,

    /// Training steps completed when the snapshot was taken.
    pub step: u64,
}

impl ArchitectureSnapshot {
    pub fn capture(
        universe: &TaskUniverse,
        graph: &RegionGraph,
        registry: &TaskGroupRegistry,
        split_log: &[SplitEvent],
        step: u64,
    ) -> Self {
        Self {
            tasks: universe.ids().to_vec(),
            regions: graph.regions().to_vec(),
            routing: registry.regions().to_vec(),
            split_log: split_log.to_vec(),
            step,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SplitError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SplitError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Reject a snapshot taken over a different task universe.
    pub fn validate_universe(&self, universe: &TaskUniverse) -> Result<(), SplitError> {
        if self.tasks.as_slice() != universe.ids() {
            return Err(SplitError::UniverseMismatch {
                expected: universe.ids().to_vec(),
                found: self.tasks.clone(),
            });
        }
        Ok(())
    }

    /// Rebuild graph and registry, checking that routing and arenas agree:
    /// every group's copy is live and every live copy serves a group.
    pub fn restore(&self, universe: Arc<TaskUniverse>) -> Result<(RegionGraph, TaskGroupRegistry), SplitError> {
        self.validate_universe(&universe)?;
        if self.routing.len() != self.regions.len() {
            return Err(SplitError::SnapshotMismatch(format!(
                "{} routing entries for {} regions",
                self.routing.len(),
                self.regions.len()
            )));
        }

        let graph = RegionGraph::from_regions(self.regions.clone())?;
        let registry = TaskGroupRegistry::from_parts(universe, self.routing.clone())?;

        for (r, region) in graph.regions().iter().enumerate() {
            let groups = registry.groups(r)?;
            for group in groups {
                if region.copy(group.copy).is_none() {
                    return Err(SplitError::SnapshotMismatch(format!(
                        "group {} at region {} is bound to missing copy {}",
                        group.id, r, group.copy
                    )));
                }
            }
            for (handle, _) in region.live_copies() {
                if !groups.iter().any(|g| g.copy == handle) {
                    return Err(SplitError::SnapshotMismatch(format!(
                        "copy {} at region {} serves no group",
                        handle, r
                    )));
                }
            }
        }
        Ok((graph, registry))
    }
}
