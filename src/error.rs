//! Error taxonomy.
//!
//! Configuration and integrity errors abort the training step and are returned
//! to the caller. Numerical instability is not an error: it is clamped locally
//! and reported through the step metrics.

use crate::core::region::CopyHandle;
use crate::core::registry::GroupId;
use crate::core::task::TaskId;

/// Broad class of a [`SplitError`], used by callers to decide how to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal: the run is misconfigured.
    Configuration,
    /// Fatal: an opt-in integrity check found inconsistent step data.
    Integrity,
    /// The adapter was driven out of order or with malformed inputs.
    Protocol,
    /// Snapshot encoding or decoding failed.
    Codec,
}

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("task {task} not present in any task group at region {region}")]
    UnknownTask { task: TaskId, region: usize },

    #[error("region {region} does not exist (network has {num_regions} regions)")]
    UnknownRegion { region: usize, num_regions: usize },

    #[error("group {group} does not exist at region {region}")]
    UnknownGroup { region: usize, group: GroupId },

    #[error("copy {copy} is not live at region {region}")]
    UnknownCopy { region: usize, copy: CopyHandle },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("snapshot task universe {found:?} does not match the run's universe {expected:?}")]
    UniverseMismatch {
        expected: Vec<TaskId>,
        found: Vec<TaskId>,
    },

    #[error("snapshot does not fit this network: {0}")]
    SnapshotMismatch(String),

    #[error("cannot split singleton group {group} at region {region}")]
    SingletonSplit { region: usize, group: GroupId },

    #[error("invalid partition of group {group} at region {region}: {reason}")]
    InvalidPartition {
        region: usize,
        group: GroupId,
        reason: String,
    },

    #[error("task groups at region {region} do not partition the task universe: {reason}")]
    BrokenPartition { region: usize, reason: String },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("backward_and_update called without a preceding forward pass")]
    NoForwardPass,

    #[error("architecture cannot change while a forward pass awaits its backward pass")]
    StepInProgress,

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl SplitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SplitError::UnknownTask { .. }
            | SplitError::UnknownRegion { .. }
            | SplitError::UnknownGroup { .. }
            | SplitError::UnknownCopy { .. }
            | SplitError::InvalidConfig(_)
            | SplitError::UniverseMismatch { .. }
            | SplitError::SnapshotMismatch(_)
            | SplitError::SingletonSplit { .. }
            | SplitError::InvalidPartition { .. }
            | SplitError::BrokenPartition { .. } => ErrorClass::Configuration,
            SplitError::Integrity(_) => ErrorClass::Integrity,
            SplitError::NoForwardPass | SplitError::StepInProgress | SplitError::Shape(_) => ErrorClass::Protocol,
            SplitError::Codec(_) => ErrorClass::Codec,
        }
    }

    /// Whether the run should terminate on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Configuration | ErrorClass::Integrity
        )
    }
}
