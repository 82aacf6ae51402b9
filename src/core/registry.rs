//! Task-group registry — per region, the partition of the task universe into
//! disjoint groups, each bound to one copy of that region.
//!
//! The registry holds routing only; parameters belong to the region graph.
//! Groupings are independent per region: two tasks may share a copy at one
//! region and be separated at the next.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::region::{CopyHandle, RegionGraph};
use crate::core::task::{TaskId, TaskUniverse};
use crate::error::SplitError;

/// Identifier of a task group, unique within its region and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A set of tasks sharing one copy at one region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,

    /// Members in universe order.
    pub members: Vec<TaskId>,

    pub copy: CopyHandle,
}

impl TaskGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.members.contains(&task)
    }
}

/// Groups of a single region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionRouting {
    /// Groups ordered by id.
    pub groups: Vec<TaskGroup>,

    /// Next id to hand out at this region.
    pub next_group: u32,
}

/// Routing table: (task, region) → copy.
#[derive(Clone, Debug)]
pub struct TaskGroupRegistry {
    universe: Arc<TaskUniverse>,
    regions: Vec<RegionRouting>,

    /// `routes[region][task position]`, derived from `regions`.
    routes: Vec<Vec<(GroupId, CopyHandle)>>,
}

impl TaskGroupRegistry {
    /// One universal group per region, bound to the region's first live copy.
    pub fn new(universe: Arc<TaskUniverse>, graph: &RegionGraph) -> Self {
        let regions: Vec<RegionRouting> = graph
            .regions()
            .iter()
            .map(|region| {
                let copy = region
                    .live_copies()
                    .next()
                    .map(|(h, _)| h)
                    .unwrap_or(CopyHandle(0));
                RegionRouting {
                    groups: vec![TaskGroup {
                        id: GroupId(0),
                        members: universe.ids().to_vec(),
                        copy,
                    }],
                    next_group: 1,
                }
            })
            .collect();
        let routes = regions
            .iter()
            .map(|r| vec![(GroupId(0), r.groups[0].copy); universe.len()])
            .collect();
        Self {
            universe,
            regions,
            routes,
        }
    }

    /// Rebuild a registry from stored groups, checking the partition invariant.
    pub fn from_parts(universe: Arc<TaskUniverse>, regions: Vec<RegionRouting>) -> Result<Self, SplitError> {
        let mut routes = Vec::with_capacity(regions.len());
        for (r, routing) in regions.iter().enumerate() {
            check_group_ids(r, routing)?;
            routes.push(build_routes(&universe, r, routing)?);
        }
        Ok(Self {
            universe,
            regions,
            routes,
        })
    }

    pub fn universe(&self) -> &Arc<TaskUniverse> {
        &self.universe
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[RegionRouting] {
        &self.regions
    }

    /// Copy serving `task` at `region`. Stable between splits.
    pub fn route(&self, task: TaskId, region: usize) -> Result<CopyHandle, SplitError> {
        self.lookup(task, region).map(|(_, copy)| copy)
    }

    pub fn group_of(&self, task: TaskId, region: usize) -> Result<GroupId, SplitError> {
        self.lookup(task, region).map(|(group, _)| group)
    }

    fn lookup(&self, task: TaskId, region: usize) -> Result<(GroupId, CopyHandle), SplitError> {
        let table = self.routes.get(region).ok_or(SplitError::UnknownRegion {
            region,
            num_regions: self.routes.len(),
        })?;
        self.universe
            .position(task)
            .and_then(|pos| table.get(pos).copied())
            .ok_or(SplitError::UnknownTask { task, region })
    }

    pub fn groups(&self, region: usize) -> Result<&[TaskGroup], SplitError> {
        self.regions
            .get(region)
            .map(|r| r.groups.as_slice())
            .ok_or(SplitError::UnknownRegion {
                region,
                num_regions: self.regions.len(),
            })
    }

    pub fn group(&self, region: usize, id: GroupId) -> Result<&TaskGroup, SplitError> {
        self.groups(region)?
            .iter()
            .find(|g| g.id == id)
            .ok_or(SplitError::UnknownGroup { region, group: id })
    }

    /// Whether the region has been split at least once.
    pub fn is_split(&self, region: usize) -> bool {
        self.regions.get(region).map_or(false, |r| r.groups.len() > 1)
    }

    /// `table[region][task position]` → copy.
    pub fn routing_table(&self) -> Vec<Vec<CopyHandle>> {
        self.routes
            .iter()
            .map(|row| row.iter().map(|(_, c)| *c).collect())
            .collect()
    }

    /// Verify that every region's groups partition the universe exactly.
    pub fn check_partition(&self) -> Result<(), SplitError> {
        for (r, routing) in self.regions.iter().enumerate() {
            build_routes(&self.universe, r, routing)?;
        }
        Ok(())
    }

    /// Replace `parent` with two child groups. Only the network mutator calls
    /// this, after validating the partition.
    pub(crate) fn replace_group(
        &mut self,
        region: usize,
        parent: GroupId,
        child_a: (Vec<TaskId>, CopyHandle),
        child_b: (Vec<TaskId>, CopyHandle),
    ) -> Result<(GroupId, GroupId), SplitError> {
        let num_regions = self.regions.len();
        let routing = self
            .regions
            .get(region)
            .ok_or(SplitError::UnknownRegion { region, num_regions })?;
        let idx = routing
            .groups
            .iter()
            .position(|g| g.id == parent)
            .ok_or(SplitError::UnknownGroup { region, group: parent })?;

        // Build the new routing aside and swap it in only once it checks out.
        let mut next = routing.clone();
        next.groups.remove(idx);
        let id_a = GroupId(next.next_group);
        let id_b = GroupId(next.next_group + 1);
        next.next_group += 2;
        next.groups.push(TaskGroup {
            id: id_a,
            members: self.universe.sorted(&child_a.0),
            copy: child_a.1,
        });
        next.groups.push(TaskGroup {
            id: id_b,
            members: self.universe.sorted(&child_b.0),
            copy: child_b.1,
        });
        next.groups.sort_by_key(|g| g.id);
        let routes = build_routes(&self.universe, region, &next)?;

        self.regions[region] = next;
        self.routes[region] = routes;
        Ok((id_a, id_b))
    }
}

/// Group ids at a region are distinct and all below `next_group`, so later
/// splits can never hand out an id that is already taken.
fn check_group_ids(region: usize, routing: &RegionRouting) -> Result<(), SplitError> {
    let mut ids: Vec<GroupId> = routing.groups.iter().map(|g| g.id).collect();
    ids.sort_unstable();
    if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(SplitError::BrokenPartition {
            region,
            reason: format!("group id {} appears twice", w[0]),
        });
    }
    if let Some(&max) = ids.last() {
        if routing.next_group <= max.0 {
            return Err(SplitError::BrokenPartition {
                region,
                reason: format!("next group id {} is not above existing {}", routing.next_group, max),
            });
        }
    }
    Ok(())
}

fn build_routes(
    universe: &TaskUniverse,
    region: usize,
    routing: &RegionRouting,
) -> Result<Vec<(GroupId, CopyHandle)>, SplitError> {
    let mut table: Vec<Option<(GroupId, CopyHandle)>> = vec![None; universe.len()];
    let mut copies_seen = Vec::with_capacity(routing.groups.len());
    for group in &routing.groups {
        if group.members.is_empty() {
            return Err(SplitError::BrokenPartition {
                region,
                reason: format!("group {} is empty", group.id),
            });
        }
        if copies_seen.contains(&group.copy) {
            return Err(SplitError::BrokenPartition {
                region,
                reason: format!("copy {} is bound to more than one group", group.copy),
            });
        }
        copies_seen.push(group.copy);
        for &task in &group.members {
            let pos = universe
                .position(task)
                .ok_or(SplitError::UnknownTask { task, region })?;
            if let Some((other, _)) = table[pos] {
                return Err(SplitError::BrokenPartition {
                    region,
                    reason: format!("task {} is routed by both {} and {}", task, other, group.id),
                });
            }
            table[pos] = Some((group.id, group.copy));
        }
    }
    table
        .into_iter()
        .enumerate()
        .map(|(pos, entry)| {
            entry.ok_or(SplitError::UnknownTask {
                task: universe.ids()[pos],
                region,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(tasks: u32, regions: usize) -> (TaskGroupRegistry, RegionGraph) {
        let universe = TaskUniverse::sequential(tasks).unwrap().shared();
        let graph = RegionGraph::mlp(4, 4, 2, regions, 0);
        (TaskGroupRegistry::new(universe, &graph), graph)
    }

    #[test]
    fn test_initial_routing_fully_shared() {
        let (reg, _) = setup(4, 3);
        for r in 0..3 {
            assert_eq!(reg.groups(r).unwrap().len(), 1);
            for t in 0..4 {
                assert_eq!(reg.route(TaskId(t), r).unwrap(), CopyHandle(0));
            }
        }
        assert!(reg.check_partition().is_ok());
    }

    #[test]
    fn test_unknown_task_is_configuration_error() {
        let (reg, _) = setup(4, 3);
        let err = reg.route(TaskId(7), 2).unwrap_err();
        assert_eq!(err.to_string(), "task 7 not present in any task group at region 2");
        assert!(matches!(reg.route(TaskId(0), 9), Err(SplitError::UnknownRegion { .. })));
    }

    #[test]
    fn test_replace_group_keeps_partition() {
        let (mut reg, _) = setup(4, 2);
        let (a, b) = reg
            .replace_group(
                1,
                GroupId(0),
                (vec![TaskId(2), TaskId(0)], CopyHandle(1)),
                (vec![TaskId(1), TaskId(3)], CopyHandle(2)),
            )
            .unwrap();
        assert_eq!((a, b), (GroupId(1), GroupId(2)));
        assert_eq!(reg.route(TaskId(2), 1).unwrap(), CopyHandle(1));
        assert_eq!(reg.route(TaskId(3), 1).unwrap(), CopyHandle(2));
        assert_eq!(reg.route(TaskId(3), 0).unwrap(), CopyHandle(0));
        assert_eq!(reg.group(1, a).unwrap().members, vec![TaskId(0), TaskId(2)]);
        assert!(reg.is_split(1));
        assert!(!reg.is_split(0));
        assert!(reg.check_partition().is_ok());
    }

    #[test]
    fn test_replace_group_rejects_gap_without_mutating() {
        let (mut reg, _) = setup(3, 1);
        let before = reg.routing_table();
        let err = reg
            .replace_group(
                0,
                GroupId(0),
                (vec![TaskId(0)], CopyHandle(1)),
                (vec![TaskId(1)], CopyHandle(2)),
            )
            .unwrap_err();
        assert!(matches!(err, SplitError::UnknownTask { .. }));
        assert_eq!(reg.routing_table(), before);
        assert_eq!(reg.groups(0).unwrap().len(), 1);
    }

    #[test]
    fn test_from_parts_rejects_overlap() {
        let universe = TaskUniverse::sequential(2).unwrap().shared();
        let routing = RegionRouting {
            groups: vec![
                TaskGroup { id: GroupId(1), members: vec![TaskId(0), TaskId(1)], copy: CopyHandle(1) },
                TaskGroup { id: GroupId(2), members: vec![TaskId(1)], copy: CopyHandle(2) },
            ],
            next_group: 3,
        };
        let err = TaskGroupRegistry::from_parts(universe, vec![routing]).unwrap_err();
        assert!(matches!(err, SplitError::BrokenPartition { .. }));
    }

    #[test]
    fn test_from_parts_rejects_stale_next_group() {
        let universe = TaskUniverse::sequential(2).unwrap().shared();
        let routing = RegionRouting {
            groups: vec![
                TaskGroup { id: GroupId(1), members: vec![TaskId(0)], copy: CopyHandle(1) },
                TaskGroup { id: GroupId(2), members: vec![TaskId(1)], copy: CopyHandle(2) },
            ],
            next_group: 2,
        };
        let err = TaskGroupRegistry::from_parts(universe.clone(), vec![routing.clone()]).unwrap_err();
        assert!(matches!(err, SplitError::BrokenPartition { .. }));

        let fixed = RegionRouting { next_group: 3, ..routing };
        assert!(TaskGroupRegistry::from_parts(universe, vec![fixed]).is_ok());
    }

    #[test]
    fn test_from_parts_rejects_duplicate_group_id() {
        let universe = TaskUniverse::sequential(2).unwrap().shared();
        let routing = RegionRouting {
            groups: vec![
                TaskGroup { id: GroupId(1), members: vec![TaskId(0)], copy: CopyHandle(1) },
                TaskGroup { id: GroupId(1), members: vec![TaskId(1)], copy: CopyHandle(2) },
            ],
            next_group: 5,
        };
        let err = TaskGroupRegistry::from_parts(universe, vec![routing]).unwrap_err();
        assert!(matches!(err, SplitError::BrokenPartition { .. }));
    }
}
