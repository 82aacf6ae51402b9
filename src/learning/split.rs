//! Split decision engine.
//!
//! After the statistics update of each step the engine scans every group with
//! at least two tasks at every region, keeps the candidates whose divergence
//! z-score is significant, and picks the single best one:
//!
//! - highest z-score first,
//! - ties broken by lowest region index, then lowest group id.
//!
//! At most one split is applied per step. Statistics involving the split group
//! are reset afterwards, so a second split computed in the same step would be
//! judged against stale aggregates.

use ndarray::Array1;

use crate::core::registry::{GroupId, TaskGroupRegistry};
use crate::core::task::TaskId;
use crate::learning::statistics::GradientStatisticsTracker;

/// When a divergence statistic is allowed to trigger a split.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SplitTrigger {
    /// Split when z exceeds `threshold` after at least `min_steps` samples.
    ZScore { threshold: f64, min_steps: u64 },

    /// As `ZScore`, but never grow a region beyond `max_copies` copies.
    Capped {
        threshold: f64,
        min_steps: u64,
        max_copies: usize,
    },
}

impl Default for SplitTrigger {
    fn default() -> Self {
        SplitTrigger::ZScore {
            threshold: crate::config::SPLIT_THRESHOLD,
            min_steps: crate::config::MIN_SPLIT_STEPS,
        }
    }
}

impl SplitTrigger {
    pub fn threshold(&self) -> f64 {
        match *self {
            SplitTrigger::ZScore { threshold, .. } | SplitTrigger::Capped { threshold, .. } => threshold,
        }
    }

    pub fn min_steps(&self) -> u64 {
        match *self {
            SplitTrigger::ZScore { min_steps, .. } | SplitTrigger::Capped { min_steps, .. } => min_steps,
        }
    }

    pub fn max_copies(&self) -> Option<usize> {
        match *self {
            SplitTrigger::ZScore { .. } => None,
            SplitTrigger::Capped { max_copies, .. } => Some(max_copies),
        }
    }
}

/// A proposed split: `group` at `region` becomes `child_a` and `child_b`.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitCandidate {
    pub region: usize,
    pub group: GroupId,
    pub child_a: Vec<TaskId>,
    pub child_b: Vec<TaskId>,
    pub z_score: f64,
    pub steps: u64,
}

pub struct SplitDecisionEngine {
    /// `None` for a fixed, fully shared architecture.
    trigger: Option<SplitTrigger>,
}

impl SplitDecisionEngine {
    pub fn new(trigger: Option<SplitTrigger>) -> Self {
        Self { trigger }
    }

    pub fn trigger(&self) -> Option<SplitTrigger> {
        self.trigger
    }

    /// Every eligible candidate across all regions.
    pub fn candidates(
        &self,
        tracker: &GradientStatisticsTracker,
        registry: &TaskGroupRegistry,
    ) -> Vec<SplitCandidate> {
        let trigger = match self.trigger {
            Some(t) => t,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        for region in 0..registry.num_regions() {
            let groups = match registry.groups(region) {
                Ok(g) => g,
                Err(_) => continue,
            };
            if let Some(cap) = trigger.max_copies() {
                if groups.len() >= cap {
                    continue;
                }
            }
            for proposal in tracker.proposals(region) {
                let live = groups
                    .iter()
                    .any(|g| g.id == proposal.group && g.len() >= 2);
                let stat = &proposal.stat;
                if live
                    && stat.divergence.steps >= trigger.min_steps()
                    && stat.z_score.is_finite()
                    && stat.z_score > trigger.threshold()
                {
                    out.push(SplitCandidate {
                        region,
                        group: proposal.group,
                        child_a: proposal.child_a.clone(),
                        child_b: proposal.child_b.clone(),
                        z_score: stat.z_score,
                        steps: stat.divergence.steps,
                    });
                }
            }
        }
        out
    }

    /// The single best candidate, deterministically.
    pub fn select(mut candidates: Vec<SplitCandidate>) -> Option<SplitCandidate> {
        candidates.sort_by(|a, b| {
            b.z_score
                .total_cmp(&a.z_score)
                .then(a.region.cmp(&b.region))
                .then(a.group.cmp(&b.group))
        });
        candidates.into_iter().next()
    }

    pub fn decide(
        &self,
        tracker: &GradientStatisticsTracker,
        registry: &TaskGroupRegistry,
    ) -> Option<SplitCandidate> {
        Self::select(self.candidates(tracker, registry))
    }
}

/// Bipartition a group from its members' gradient history.
///
/// Each task's history mean is taken relative to the group mean; the deviation
/// of the most divergent task defines a direction, and tasks are split by the
/// sign of their projection onto it. Tasks without history count as sitting
/// on the group mean. When no task deviates, the members are halved in order.
/// `child_a` always holds the first member.
///
/// `members` must be in universe order; `history[i]` belongs to `members[i]`.
pub fn propose_partition(
    members: &[TaskId],
    history: &[Option<&Array1<f32>>],
) -> Option<(Vec<TaskId>, Vec<TaskId>)> {
    if members.len() < 2 || members.len() != history.len() {
        return None;
    }

    let known: Vec<&Array1<f32>> = history.iter().flatten().copied().collect();
    let halves = || {
        let mid = (members.len() + 1) / 2;
        (members[..mid].to_vec(), members[mid..].to_vec())
    };
    if known.is_empty() {
        return Some(halves());
    }

    let dim = known[0].len();
    let mut center = Array1::<f32>::zeros(dim);
    for m in &known {
        center += *m;
    }
    center /= known.len() as f32;

    let deviations: Vec<Option<Array1<f32>>> = history
        .iter()
        .map(|h| h.map(|m| m - &center))
        .collect();

    // Most divergent task; first wins on ties.
    let mut pivot: Option<(usize, f32)> = None;
    for (i, d) in deviations.iter().enumerate() {
        if let Some(d) = d {
            let norm = d.dot(d);
            if norm > pivot.map_or(0.0, |(_, best)| best) {
                pivot = Some((i, norm));
            }
        }
    }
    let (pivot, _) = match pivot {
        Some(p) => p,
        None => return Some(halves()),
    };
    let direction = match &deviations[pivot] {
        Some(d) => d.clone(),
        None => return Some(halves()),
    };

    let mut positive = Vec::new();
    let mut rest = Vec::new();
    for (i, &task) in members.iter().enumerate() {
        let s = deviations[i].as_ref().map_or(0.0, |d| d.dot(&direction));
        if s > 0.0 {
            positive.push(task);
        } else {
            rest.push(task);
        }
    }
    if positive.is_empty() || rest.is_empty() {
        return Some(halves());
    }
    if positive.contains(&members[0]) {
        Some((positive, rest))
    } else {
        Some((rest, positive))
    }
}
