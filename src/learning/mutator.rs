//! Network mutator — the only component that changes architecture.
//!
//! A split is validated completely before anything is touched, then applied
//! in one call: duplicate the parent copy, swap the routing, rebase the
//! statistics and fork the optimizer state. If the routing swap fails the
//! duplicated copies are rolled back, so callers never see a half-applied
//! split.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::region::{CopyHandle, RegionGraph};
use crate::core::registry::{GroupId, TaskGroupRegistry};
use crate::core::task::TaskId;
use crate::error::SplitError;
use crate::learning::optim::Optimizer;
use crate::learning::split::SplitCandidate;
use crate::learning::statistics::GradientStatisticsTracker;

/// A split to perform: `group` at `region` becomes `child_a` and `child_b`.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitRequest {
    pub region: usize,
    pub group: GroupId,
    pub child_a: Vec<TaskId>,
    pub child_b: Vec<TaskId>,

    /// Z-score that triggered the split; `None` for a manual split.
    pub z_score: Option<f64>,
}

impl From<SplitCandidate> for SplitRequest {
    fn from(c: SplitCandidate) -> Self {
        Self {
            region: c.region,
            group: c.group,
            child_a: c.child_a,
            child_b: c.child_b,
            z_score: Some(c.z_score),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitChild {
    pub group: GroupId,
    pub copy: CopyHandle,
    pub members: Vec<TaskId>,
}

/// Record of one applied split.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitEvent {
    /// Training step at whose end the split was applied.
    pub step: u64,
    pub region: usize,
    pub parent: GroupId,
    pub parent_copy: CopyHandle,
    pub child_a: SplitChild,
    pub child_b: SplitChild,
    pub z_score: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct NetworkMutator {
    events: Vec<SplitEvent>,
}

impl NetworkMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<SplitEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[SplitEvent] {
        &self.events
    }

    /// Check `request` against the current routing without changing anything.
    pub fn validate(registry: &TaskGroupRegistry, request: &SplitRequest) -> Result<(), SplitError> {
        let region = request.region;
        let group = registry.group(region, request.group)?;
        if group.len() < 2 {
            return Err(SplitError::SingletonSplit {
                region,
                group: group.id,
            });
        }

        let invalid = |reason: String| SplitError::InvalidPartition {
            region,
            group: group.id,
            reason,
        };
        if request.child_a.is_empty() || request.child_b.is_empty() {
            return Err(invalid("both children need at least one task".into()));
        }
        let mut seen: Vec<TaskId> = Vec::with_capacity(group.len());
        for &task in request.child_a.iter().chain(request.child_b.iter()) {
            if !group.contains(task) {
                return Err(invalid(format!("task {} is not a member", task)));
            }
            if seen.contains(&task) {
                return Err(invalid(format!("task {} appears twice", task)));
            }
            seen.push(task);
        }
        if seen.len() != group.len() {
            return Err(invalid(format!(
                "children cover {} of {} members",
                seen.len(),
                group.len()
            )));
        }
        Ok(())
    }

    /// Apply one split to every piece of dependent state.
    pub fn apply(
        &mut self,
        graph: &mut RegionGraph,
        registry: &mut TaskGroupRegistry,
        tracker: &mut GradientStatisticsTracker,
        optimizer: &mut Optimizer,
        request: SplitRequest,
        step: u64,
    ) -> Result<SplitEvent, SplitError> {
        Self::validate(registry, &request)?;
        let region = request.region;
        let parent_copy = registry.group(region, request.group)?.copy;

        let (copy_a, copy_b) = graph.duplicate(region, parent_copy)?;
        let ids = registry.replace_group(
            region,
            request.group,
            (request.child_a.clone(), copy_a),
            (request.child_b.clone(), copy_b),
        );
        let (group_a, group_b) = match ids {
            Ok(ids) => ids,
            Err(err) => {
                graph.undo_duplicate(region, parent_copy, copy_a, copy_b)?;
                return Err(err);
            }
        };

        tracker.on_split(registry, region, request.group, group_a, group_b)?;
        optimizer.fork(region, parent_copy, copy_a, copy_b);

        let event = SplitEvent {
            step,
            region,
            parent: request.group,
            parent_copy,
            child_a: SplitChild {
                group: group_a,
                copy: copy_a,
                members: registry.group(region, group_a)?.members.clone(),
            },
            child_b: SplitChild {
                group: group_b,
                copy: copy_b,
                members: registry.group(region, group_b)?.members.clone(),
            },
            z_score: request.z_score,
        };
        info!(
            step,
            region,
            parent = %event.parent,
            a = ?event.child_a.members,
            b = ?event.child_b.members,
            z = ?event.z_score,
            "region split"
        );
        self.events.push(event.clone());
        Ok(event)
    }
}
