//! Task identifiers, the fixed task universe, and task-tagged batches.
//!
//! The universe is decided once, when the run starts, and shared by every
//! component. It is never inferred from batch contents.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::SplitError;

/// Identifier of one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable, ordered set of task identifiers.
///
/// The order fixes the task processing order of the gradient collector and
/// every deterministic tie-break.
#[derive(Clone, Debug)]
pub struct TaskUniverse {
    ids: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
}

impl TaskUniverse {
    pub fn new(ids: Vec<TaskId>) -> Result<Self, SplitError> {
        if ids.is_empty() {
            return Err(SplitError::InvalidConfig(
                "task universe must contain at least one task".into(),
            ));
        }
        let mut index = HashMap::with_capacity(ids.len());
        for (pos, &id) in ids.iter().enumerate() {
            if index.insert(id, pos).is_some() {
                return Err(SplitError::InvalidConfig(format!(
                    "task {} appears twice in the task universe",
                    id
                )));
            }
        }
        Ok(Self { ids, index })
    }

    /// Universe `0..n`.
    pub fn sequential(n: u32) -> Result<Self, SplitError> {
        Self::new((0..n).map(TaskId).collect())
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    /// Position of `task` in universe order.
    pub fn position(&self, task: TaskId) -> Option<usize> {
        self.index.get(&task).copied()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.index.contains_key(&task)
    }

    /// Sort a set of tasks into universe order.
    pub fn sorted(&self, tasks: &[TaskId]) -> Vec<TaskId> {
        let mut out = tasks.to_vec();
        out.sort_by_key(|t| self.position(*t).unwrap_or(usize::MAX));
        out
    }
}

impl PartialEq for TaskUniverse {
    fn eq(&self, other: &Self) -> bool {
        self.ids == other.ids
    }
}

/// A batch of observations, one row per sample, each tagged with its task.
///
/// `active[pos]` is the explicit activity signal for the task at universe
/// position `pos`: a task is active when it contributes real samples to this
/// batch. The flag is set here, by whoever builds the batch, and never
/// recovered from gradient values downstream.
#[derive(Clone, Debug)]
pub struct TaskBatch {
    pub tasks: Vec<TaskId>,
    pub observations: Array2<f32>,
    pub active: Vec<bool>,
}

impl TaskBatch {
    /// Build a batch; every task with at least one row is marked active.
    pub fn new(
        universe: &TaskUniverse,
        tasks: Vec<TaskId>,
        observations: Array2<f32>,
    ) -> Result<Self, SplitError> {
        if tasks.len() != observations.nrows() {
            return Err(SplitError::Shape(format!(
                "{} task tags for {} observation rows",
                tasks.len(),
                observations.nrows()
            )));
        }
        let mut active = vec![false; universe.len()];
        for &task in &tasks {
            let pos = universe
                .position(task)
                .ok_or(SplitError::UnknownTask { task, region: 0 })?;
            active[pos] = true;
        }
        Ok(Self {
            tasks,
            observations,
            active,
        })
    }

    /// Mark a task as absent from this step, e.g. when its rows are padding.
    pub fn with_inactive(mut self, universe: &TaskUniverse, task: TaskId) -> Result<Self, SplitError> {
        let pos = universe
            .position(task)
            .ok_or(SplitError::UnknownTask { task, region: 0 })?;
        self.active[pos] = false;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Row indices of each task, indexed by universe position.
    pub fn rows_by_task(&self, universe: &TaskUniverse) -> Result<Vec<Vec<usize>>, SplitError> {
        let mut rows = vec![Vec::new(); universe.len()];
        for (row, &task) in self.tasks.iter().enumerate() {
            let pos = universe
                .position(task)
                .ok_or(SplitError::UnknownTask { task, region: 0 })?;
            rows[pos].push(row);
        }
        Ok(rows)
    }
}
