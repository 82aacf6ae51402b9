//! Gradient statistics tracker.
//!
//! Per region the tracker keeps three kinds of running state:
//!
//! - per-task gradient moments (mean vector and mean squared norm), whose
//!   covariance trace is the single-task noise baseline;
//! - one [`DivergenceStat`] per unordered pair of coexisting groups;
//! - one [`DivergenceStat`] per group of two or more tasks, measuring the
//!   divergence between the two halves of the group's proposed bipartition.
//!   This is the signal that triggers splits.
//!
//! The divergence of two sides is `‖mean(g_a) − mean(g_b)‖²` over their active
//! tasks, and the z-score divides its running mean by the noise that two
//! side means with no real difference would show:
//!
//!   z = mean_diff_sq / max(floor, σ² · (1/n_a + 1/n_b))
//!
//! A floored denominator is reported as a [`NumericalWarning`], never an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::Array1;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::VARIANCE_FLOOR;
use crate::core::region::RegionGraph;
use crate::core::registry::{GroupId, TaskGroup, TaskGroupRegistry};
use crate::core::task::{TaskId, TaskUniverse};
use crate::error::SplitError;
use crate::learning::collector::{StepGradients, TaskGradientRecord};
use crate::learning::estimate::{squared_norm, EmaSchedule, ScalarMoments, VectorMoments};
use crate::learning::split::propose_partition;

/// What a group pair created by a split starts from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ColdStartPolicy {
    /// No history: the pair must collect `min_steps` samples of its own.
    Fresh,

    /// Carry `fraction` of the parent's divergence history, steps included.
    InheritParent { fraction: f64 },
}

impl Default for ColdStartPolicy {
    fn default() -> Self {
        ColdStartPolicy::Fresh
    }
}

/// Unordered pair of groups at one region, stored with `low < high`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupPair {
    pub low: GroupId,
    pub high: GroupId,
}

impl GroupPair {
    pub fn new(a: GroupId, b: GroupId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn involves(&self, g: GroupId) -> bool {
        self.low == g || self.high == g
    }
}

/// Running divergence between two sides and its z-score.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DivergenceStat {
    /// Running mean (and mean square) of ‖diff‖².
    pub divergence: ScalarMoments,

    /// Pooled per-task variance used at the last update.
    pub baseline: f64,

    pub z_score: f64,

    /// Whether the last update hit the variance floor.
    pub floored: bool,
}

impl DivergenceStat {
    pub fn mean_diff_sq(&self) -> f64 {
        self.divergence.mean
    }

    pub fn steps(&self) -> u64 {
        self.divergence.steps
    }

    /// Fold in one step. Returns the warning raised, if any.
    fn observe(
        &mut self,
        diff_sq: f64,
        baseline: f64,
        n_a: usize,
        n_b: usize,
        schedule: &EmaSchedule,
        floor: f64,
    ) -> Option<WarningKind> {
        if !diff_sq.is_finite() {
            return Some(WarningKind::NonFiniteDivergence);
        }
        self.divergence.update(diff_sq, schedule);
        self.baseline = baseline;

        let raw = baseline * (1.0 / n_a.max(1) as f64 + 1.0 / n_b.max(1) as f64);
        let mut warning = None;
        let denominator = if raw.is_finite() && raw >= floor {
            self.floored = false;
            raw
        } else {
            self.floored = true;
            warning = Some(WarningKind::VarianceFloored { raw });
            floor
        };

        let z = self.divergence.mean / denominator;
        if z.is_finite() {
            self.z_score = z;
        } else {
            self.z_score = 0.0;
            warning = Some(WarningKind::NonFiniteDivergence);
        }
        warning
    }

    /// Seed for a child pair under [`ColdStartPolicy::InheritParent`].
    fn inherited(&self, fraction: f64) -> Self {
        Self {
            divergence: self.divergence.scaled(fraction),
            baseline: self.baseline,
            z_score: self.z_score * fraction,
            floored: self.floored,
        }
    }
}

/// A group's current bipartition proposal and its divergence statistic.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedSplit {
    pub group: GroupId,
    pub child_a: Vec<TaskId>,
    pub child_b: Vec<TaskId>,
    pub stat: DivergenceStat,
}

/// What a statistic or warning refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatSubject {
    Pair(GroupPair),
    Proposed(GroupId),
    Task(TaskId),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WarningKind {
    /// The z-score denominator fell below the floor (or was NaN) and was clamped.
    VarianceFloored { raw: f64 },
    /// A task gradient held NaN or ±inf and was left out of this step.
    NonFiniteGradient,
    /// The divergence or its z-score was not finite; the sample was dropped.
    NonFiniteDivergence,
}

/// Recoverable numerical event, recorded in the step metrics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NumericalWarning {
    pub region: usize,
    pub subject: StatSubject,
    pub kind: WarningKind,
}

/// Flattened view of one statistic for diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct ZScoreEntry {
    pub region: usize,
    pub subject: StatSubject,
    pub z_score: f64,
    pub steps: u64,
    pub mean_diff_sq: f64,
    pub baseline: f64,
}

#[derive(Clone, Debug)]
struct RegionStats {
    /// Indexed by universe position.
    tasks: Vec<VectorMoments>,
    pairs: BTreeMap<GroupPair, DivergenceStat>,
    proposed: BTreeMap<GroupId, ProposedSplit>,
}

impl RegionStats {
    fn new(num_tasks: usize, dim: usize) -> Self {
        Self {
            tasks: vec![VectorMoments::new(dim); num_tasks],
            pairs: BTreeMap::new(),
            proposed: BTreeMap::new(),
        }
    }

    fn update(
        &mut self,
        region: usize,
        universe: &TaskUniverse,
        records: &[TaskGradientRecord],
        groups: &[TaskGroup],
        schedule: &EmaSchedule,
        floor: f64,
    ) -> Result<Vec<NumericalWarning>, SplitError> {
        let mut warnings = Vec::new();

        // Per-task moments, active tasks only.
        let mut usable = vec![false; self.tasks.len()];
        for (pos, rec) in records.iter().enumerate() {
            if !rec.active || pos >= self.tasks.len() {
                continue;
            }
            if rec.gradient.iter().any(|v| !v.is_finite()) {
                warnings.push(NumericalWarning {
                    region,
                    subject: StatSubject::Task(rec.task),
                    kind: WarningKind::NonFiniteGradient,
                });
                continue;
            }
            self.tasks[pos].update(&rec.gradient, schedule);
            usable[pos] = true;
        }

        let positions = |members: &[TaskId]| -> Result<Vec<usize>, SplitError> {
            members
                .iter()
                .map(|&task| universe.position(task).ok_or(SplitError::UnknownTask { task, region }))
                .collect()
        };

        // Coexisting pairs.
        self.pairs
            .retain(|pair, _| groups.iter().filter(|g| pair.involves(g.id)).count() == 2);
        for (i, a) in groups.iter().enumerate() {
            let side_a = positions(&a.members)?;
            for b in &groups[i + 1..] {
                let side_b = positions(&b.members)?;
                let pair = GroupPair::new(a.id, b.id);
                let stat = self.pairs.entry(pair).or_default();
                if let Some(kind) = observe_sides(stat, &self.tasks, records, &usable, &side_a, &side_b, schedule, floor) {
                    warnings.push(NumericalWarning {
                        region,
                        subject: StatSubject::Pair(pair),
                        kind,
                    });
                }
            }
        }

        // Proposed bipartitions of every divisible group.
        self.proposed
            .retain(|id, _| groups.iter().any(|g| g.id == *id && g.len() >= 2));
        for group in groups.iter().filter(|g| g.len() >= 2) {
            let members = positions(&group.members)?;
            let history: Vec<Option<&Array1<f32>>> = members
                .iter()
                .map(|&pos| {
                    let m = &self.tasks[pos];
                    if m.has_history() {
                        Some(&m.mean)
                    } else {
                        None
                    }
                })
                .collect();
            let (child_a, child_b) = match propose_partition(&group.members, &history) {
                Some(p) => p,
                None => continue,
            };

            let proposal = self.proposed.entry(group.id).or_insert_with(|| ProposedSplit {
                group: group.id,
                child_a: child_a.clone(),
                child_b: child_b.clone(),
                stat: DivergenceStat::default(),
            });
            if proposal.child_a != child_a {
                debug!(region, group = %group.id, "proposed partition changed; statistic reset");
                *proposal = ProposedSplit {
                    group: group.id,
                    child_a,
                    child_b,
                    stat: DivergenceStat::default(),
                };
            }

            let side_a = positions(&proposal.child_a)?;
            let side_b = positions(&proposal.child_b)?;
            if let Some(kind) = observe_sides(
                &mut proposal.stat,
                &self.tasks,
                records,
                &usable,
                &side_a,
                &side_b,
                schedule,
                floor,
            ) {
                warnings.push(NumericalWarning {
                    region,
                    subject: StatSubject::Proposed(group.id),
                    kind,
                });
            }
        }

        Ok(warnings)
    }
}

/// Compare the mean active gradients of two sides and fold the result into `stat`.
#[allow(clippy::too_many_arguments)]
fn observe_sides(
    stat: &mut DivergenceStat,
    tasks: &[VectorMoments],
    records: &[TaskGradientRecord],
    usable: &[bool],
    side_a: &[usize],
    side_b: &[usize],
    schedule: &EmaSchedule,
    floor: f64,
) -> Option<WarningKind> {
    let live_a: Vec<usize> = side_a.iter().copied().filter(|&p| usable[p]).collect();
    let live_b: Vec<usize> = side_b.iter().copied().filter(|&p| usable[p]).collect();
    if live_a.is_empty() || live_b.is_empty() {
        return None;
    }

    let diff = side_mean(records, &live_a) - &side_mean(records, &live_b);
    let diff_sq = squared_norm(&diff);

    let pooled: f64 = live_a
        .iter()
        .chain(live_b.iter())
        .map(|&p| tasks[p].variance())
        .sum::<f64>()
        / (live_a.len() + live_b.len()) as f64;

    stat.observe(diff_sq, pooled, live_a.len(), live_b.len(), schedule, floor)
}

fn side_mean(records: &[TaskGradientRecord], positions: &[usize]) -> Array1<f32> {
    let mut sum = Array1::<f32>::zeros(records[positions[0]].gradient.len());
    for &p in positions {
        sum += &records[p].gradient;
    }
    sum / positions.len() as f32
}

/// Owner of every divergence statistic. Only this type mutates them.
#[derive(Clone, Debug)]
pub struct GradientStatisticsTracker {
    universe: Arc<TaskUniverse>,
    schedule: EmaSchedule,
    floor: f64,
    cold_start: ColdStartPolicy,

    /// Flattened parameter count per region.
    dims: Vec<usize>,
    regions: Vec<RegionStats>,
    steps: u64,
}

impl GradientStatisticsTracker {
    pub fn new(
        universe: Arc<TaskUniverse>,
        graph: &RegionGraph,
        schedule: EmaSchedule,
        floor: f64,
        cold_start: ColdStartPolicy,
    ) -> Self {
        let dims: Vec<usize> = graph.regions().iter().map(|r| r.param_count()).collect();
        let regions = dims
            .iter()
            .map(|&d| RegionStats::new(universe.len(), d))
            .collect();
        Self {
            universe,
            schedule,
            floor: if floor > 0.0 { floor } else { VARIANCE_FLOOR },
            cold_start,
            dims,
            regions,
            steps: 0,
        }
    }

    pub fn schedule(&self) -> EmaSchedule {
        self.schedule
    }

    pub fn cold_start(&self) -> ColdStartPolicy {
        self.cold_start
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Fold one step's gradients into every region's statistics.
    ///
    /// Regions are independent and updated in parallel.
    pub fn update(
        &mut self,
        step: &StepGradients,
        registry: &TaskGroupRegistry,
    ) -> Result<Vec<NumericalWarning>, SplitError> {
        if step.num_regions() != self.regions.len() || registry.num_regions() != self.regions.len() {
            return Err(SplitError::Integrity(format!(
                "tracker has {} regions, gradients {} and registry {}",
                self.regions.len(),
                step.num_regions(),
                registry.num_regions()
            )));
        }

        let universe = &self.universe;
        let schedule = self.schedule;
        let floor = self.floor;
        let per_region: Vec<Result<Vec<NumericalWarning>, SplitError>> = self
            .regions
            .par_iter_mut()
            .enumerate()
            .map(|(r, stats)| {
                let groups = registry.groups(r)?;
                stats.update(r, universe, step.region(r), groups, &schedule, floor)
            })
            .collect();

        let mut warnings = Vec::new();
        for result in per_region {
            warnings.extend(result?);
        }
        self.steps += 1;

        for w in &warnings {
            match w.kind {
                WarningKind::VarianceFloored { raw } => {
                    debug!(region = w.region, subject = ?w.subject, raw, floor, "variance floor applied")
                }
                WarningKind::NonFiniteGradient | WarningKind::NonFiniteDivergence => {
                    warn!(region = w.region, subject = ?w.subject, kind = ?w.kind, "non-finite value skipped")
                }
            }
        }
        Ok(warnings)
    }

    /// Replace statistics of `parent` with entries for its two children.
    ///
    /// Call after the registry already routes through the children.
    pub fn on_split(
        &mut self,
        registry: &TaskGroupRegistry,
        region: usize,
        parent: GroupId,
        child_a: GroupId,
        child_b: GroupId,
    ) -> Result<(), SplitError> {
        let num_regions = self.regions.len();
        let stats = self
            .regions
            .get_mut(region)
            .ok_or(SplitError::UnknownRegion { region, num_regions })?;
        let groups = registry.groups(region)?;
        let members_a = &registry.group(region, child_a)?.members;
        let members_b = &registry.group(region, child_b)?.members;

        let parent_proposal = stats.proposed.remove(&parent);
        let parent_pairs: BTreeMap<GroupId, DivergenceStat> = stats
            .pairs
            .iter()
            .filter(|(pair, _)| pair.involves(parent))
            .map(|(pair, stat)| {
                let other = if pair.low == parent { pair.high } else { pair.low };
                (other, stat.clone())
            })
            .collect();
        stats.pairs.retain(|pair, _| !pair.involves(parent));

        let policy = self.cold_start;
        let seed = |source: Option<&DivergenceStat>| match (policy, source) {
            (ColdStartPolicy::InheritParent { fraction }, Some(stat)) => stat.inherited(fraction),
            _ => DivergenceStat::default(),
        };

        // The children's own pair inherits the parent's proposal only if that
        // proposal is the partition actually applied.
        let matching = parent_proposal.as_ref().filter(|p| {
            (&p.child_a == members_a && &p.child_b == members_b) || (&p.child_a == members_b && &p.child_b == members_a)
        });
        stats
            .pairs
            .insert(GroupPair::new(child_a, child_b), seed(matching.map(|p| &p.stat)));

        for other in groups.iter().map(|g| g.id) {
            if other == child_a || other == child_b {
                continue;
            }
            let inherited = seed(parent_pairs.get(&other));
            stats.pairs.insert(GroupPair::new(child_a, other), inherited.clone());
            stats.pairs.insert(GroupPair::new(child_b, other), inherited);
        }
        debug!(region, %parent, %child_a, %child_b, ?policy, "statistics rebased on split");
        Ok(())
    }

    /// Drop all history, keeping configuration.
    pub fn reset(&mut self) {
        let n = self.universe.len();
        self.regions = self.dims.iter().map(|&d| RegionStats::new(n, d)).collect();
        self.steps = 0;
    }

    pub fn pair(&self, region: usize, a: GroupId, b: GroupId) -> Option<&DivergenceStat> {
        self.regions.get(region)?.pairs.get(&GroupPair::new(a, b))
    }

    pub fn proposal(&self, region: usize, group: GroupId) -> Option<&ProposedSplit> {
        self.regions.get(region)?.proposed.get(&group)
    }

    pub fn proposals(&self, region: usize) -> impl Iterator<Item = &ProposedSplit> + '_ {
        self.regions
            .get(region)
            .into_iter()
            .flat_map(|s| s.proposed.values())
    }

    pub fn task_moments(&self, region: usize, task: TaskId) -> Option<&VectorMoments> {
        let pos = self.universe.position(task)?;
        self.regions.get(region)?.tasks.get(pos)
    }

    /// Every statistic, pairs first, in region order.
    pub fn z_scores(&self) -> Vec<ZScoreEntry> {
        let mut out = Vec::new();
        for (region, stats) in self.regions.iter().enumerate() {
            for (pair, stat) in &stats.pairs {
                out.push(ZScoreEntry {
                    region,
                    subject: StatSubject::Pair(*pair),
                    z_score: stat.z_score,
                    steps: stat.steps(),
                    mean_diff_sq: stat.mean_diff_sq(),
                    baseline: stat.baseline,
                });
            }
            for (group, proposal) in &stats.proposed {
                out.push(ZScoreEntry {
                    region,
                    subject: StatSubject::Proposed(*group),
                    z_score: proposal.stat.z_score,
                    steps: proposal.stat.steps(),
                    mean_diff_sq: proposal.stat.mean_diff_sq(),
                    baseline: proposal.stat.baseline,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::region::CopyHandle;

    /// One region with a 1x1 copy: gradients have two entries.
    fn setup(tasks: u32, schedule: EmaSchedule) -> (GradientStatisticsTracker, TaskGroupRegistry) {
        let universe = TaskUniverse::sequential(tasks).unwrap().shared();
        let graph = RegionGraph::mlp(1, 1, 1, 1, 0);
        let registry = TaskGroupRegistry::new(universe.clone(), &graph);
        let tracker = GradientStatisticsTracker::new(universe, &graph, schedule, VARIANCE_FLOOR, ColdStartPolicy::Fresh);
        (tracker, registry)
    }

    fn g(a: f32, b: f32) -> Array1<f32> {
        Array1::from_vec(vec![a, b])
    }

    #[test]
    fn test_identical_gradients_zero_z() {
        let (mut tracker, registry) = setup(2, EmaSchedule::default());
        for i in 0..50 {
            let v = (i as f32 * 0.3).sin();
            tracker
                .update(&StepGradients::synthetic(vec![vec![g(v, 1.0), g(v, 1.0)]]), &registry)
                .unwrap();
        }
        let p = tracker.proposal(0, GroupId(0)).unwrap();
        assert_eq!(p.stat.steps(), 50);
        assert!(p.stat.z_score.abs() < 1e-9, "z = {}", p.stat.z_score);
    }

    #[test]
    fn test_opposite_gradients_large_z_with_floor_warning() {
        let (mut tracker, registry) = setup(2, EmaSchedule::default());
        let mut floored = 0;
        for _ in 0..10 {
            let w = tracker
                .update(&StepGradients::synthetic(vec![vec![g(1.0, -0.5), g(-1.0, 0.5)]]), &registry)
                .unwrap();
            floored += w
                .iter()
                .filter(|w| matches!(w.kind, WarningKind::VarianceFloored { .. }))
                .count();
        }
        let p = tracker.proposal(0, GroupId(0)).unwrap();
        assert_eq!(p.child_a, vec![TaskId(0)]);
        assert_eq!(p.child_b, vec![TaskId(1)]);
        assert!(p.stat.z_score > 1e6);
        assert!(p.stat.z_score.is_finite());
        assert!(floored > 0);
    }

    #[test]
    fn test_noise_only_z_near_one() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;
        use rand_distr::{Distribution, Normal};

        let (mut tracker, registry) = setup(2, EmaSchedule { alpha: 0.01, warmup_steps: 2000 });
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0f32, 1.0).unwrap();
        for _ in 0..2000 {
            let mut sample = || g(normal.sample(&mut rng), normal.sample(&mut rng));
            let row = vec![sample(), sample()];
            tracker.update(&StepGradients::synthetic(vec![row]), &registry).unwrap();
        }
        let z = tracker.proposal(0, GroupId(0)).unwrap().stat.z_score;
        assert!(z > 0.7 && z < 1.3, "z = {}", z);
    }

    #[test]
    fn test_non_finite_gradient_skipped() {
        let (mut tracker, registry) = setup(2, EmaSchedule::default());
        let w = tracker
            .update(&StepGradients::synthetic(vec![vec![g(f32::NAN, 0.0), g(1.0, 1.0)]]), &registry)
            .unwrap();
        assert!(w.iter().any(|w| w.kind == WarningKind::NonFiniteGradient));
        assert!(!tracker.task_moments(0, TaskId(0)).unwrap().has_history());
        // Only one side had a usable gradient, so nothing was compared.
        assert_eq!(tracker.proposal(0, GroupId(0)).unwrap().stat.steps(), 0);
    }

    #[test]
    fn test_on_split_fresh_discards_parent_history() {
        let (mut tracker, mut registry) = setup(2, EmaSchedule::default());
        for _ in 0..20 {
            tracker
                .update(&StepGradients::synthetic(vec![vec![g(1.0, 0.0), g(-1.0, 0.0)]]), &registry)
                .unwrap();
        }
        let (a, b) = registry
            .replace_group(0, GroupId(0), (vec![TaskId(0)], CopyHandle(1)), (vec![TaskId(1)], CopyHandle(2)))
            .unwrap();
        tracker.on_split(&registry, 0, GroupId(0), a, b).unwrap();

        assert!(tracker.proposal(0, GroupId(0)).is_none());
        let pair = tracker.pair(0, a, b).unwrap();
        assert_eq!(pair.steps(), 0);
        assert_eq!(pair.mean_diff_sq(), 0.0);
        // Task moments are per task, not per group, and survive.
        assert_eq!(tracker.task_moments(0, TaskId(0)).unwrap().steps, 20);
    }

    #[test]
    fn test_on_split_inherit_parent_fraction() {
        let universe = TaskUniverse::sequential(2).unwrap().shared();
        let graph = RegionGraph::mlp(1, 1, 1, 1, 0);
        let mut registry = TaskGroupRegistry::new(universe.clone(), &graph);
        let mut tracker = GradientStatisticsTracker::new(
            universe,
            &graph,
            EmaSchedule::default(),
            VARIANCE_FLOOR,
            ColdStartPolicy::InheritParent { fraction: 0.5 },
        );
        for _ in 0..20 {
            tracker
                .update(&StepGradients::synthetic(vec![vec![g(1.0, 0.0), g(-1.0, 0.0)]]), &registry)
                .unwrap();
        }
        let parent_mean = tracker.proposal(0, GroupId(0)).unwrap().stat.mean_diff_sq();
        let (a, b) = registry
            .replace_group(0, GroupId(0), (vec![TaskId(0)], CopyHandle(1)), (vec![TaskId(1)], CopyHandle(2)))
            .unwrap();
        tracker.on_split(&registry, 0, GroupId(0), a, b).unwrap();

        let pair = tracker.pair(0, a, b).unwrap();
        assert_eq!(pair.steps(), 10);
        assert!((pair.mean_diff_sq() - 0.5 * parent_mean).abs() < 1e-9);
    }

    #[test]
    fn test_pair_statistics_after_split() {
        let (mut tracker, mut registry) = setup(3, EmaSchedule::default());
        let (a, b) = registry
            .replace_group(
                0,
                GroupId(0),
                (vec![TaskId(0), TaskId(1)], CopyHandle(1)),
                (vec![TaskId(2)], CopyHandle(2)),
            )
            .unwrap();
        tracker.on_split(&registry, 0, GroupId(0), a, b).unwrap();
        for _ in 0..5 {
            tracker
                .update(
                    &StepGradients::synthetic(vec![vec![g(1.0, 0.0), g(1.0, 0.0), g(0.0, 1.0)]]),
                    &registry,
                )
                .unwrap();
        }
        let pair = tracker.pair(0, a, b).unwrap();
        assert_eq!(pair.steps(), 5);
        assert!((pair.mean_diff_sq() - 2.0).abs() < 1e-6);
        // Singleton group b has no proposal; group a does.
        assert!(tracker.proposal(0, b).is_none());
        assert!(tracker.proposal(0, a).is_some());
    }

    #[test]
    fn test_reset_clears_history() {
        let (mut tracker, registry) = setup(2, EmaSchedule::default());
        tracker
            .update(&StepGradients::synthetic(vec![vec![g(1.0, 0.0), g(0.0, 1.0)]]), &registry)
            .unwrap();
        assert!(!tracker.z_scores().is_empty());
        tracker.reset();
        assert!(tracker.z_scores().is_empty());
        assert_eq!(tracker.steps(), 0);
    }
}
