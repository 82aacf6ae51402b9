//! Region graph — the ordered layer slots every task's forward pass flows through.
//!
//! Each region is a dense layer `y = act(W·x + b)` whose parameters live in an
//! arena of copies addressed by [`CopyHandle`]. A split never edits a copy in
//! place: it allocates two new arena entries cloned from the parent and retires
//! the parent slot, so handles held elsewhere can never alias a moved copy.
//!
//! Regions themselves are fixed at construction; only their copies multiply.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::core::registry::TaskGroupRegistry;
use crate::core::task::{TaskBatch, TaskId, TaskUniverse};
use crate::error::SplitError;
use crate::learning::collector::GradientCollector;

/// Index of a copy inside its region's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CopyHandle(pub usize);

impl fmt::Display for CopyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Element-wise activation applied at a region's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Tanh,
    Identity,
}

impl Activation {
    pub fn apply(self, pre: Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Tanh => pre.mapv(f32::tanh),
            Activation::Identity => pre,
        }
    }

    /// Derivative expressed through the activation's output `y`.
    pub fn derivative_from_output(self, y: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Tanh => y.mapv(|v| 1.0 - v * v),
            Activation::Identity => Array2::ones(y.raw_dim()),
        }
    }
}

/// One instantiation of a region's parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionCopy {
    /// W ∈ R^{out × in}
    pub weight: Array2<f32>,

    /// b ∈ R^{out}
    pub bias: Array1<f32>,
}

impl RegionCopy {
    pub fn zeros(in_dim: usize, out_dim: usize) -> Self {
        Self {
            weight: Array2::zeros((out_dim, in_dim)),
            bias: Array1::zeros(out_dim),
        }
    }

    /// Glorot-normal weights, zero bias.
    pub fn glorot(in_dim: usize, out_dim: usize, seed: u64) -> Self {
        let std = (2.0 / (in_dim + out_dim) as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = match Normal::new(0.0f32, std) {
            Ok(normal) => Array2::from_shape_fn((out_dim, in_dim), |_| normal.sample(&mut rng)),
            Err(_) => Array2::zeros((out_dim, in_dim)),
        };
        Self {
            weight,
            bias: Array1::zeros(out_dim),
        }
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// Parameters flattened as `[W (row-major), b]`.
    pub fn flatten(&self) -> Array1<f32> {
        self.weight
            .iter()
            .chain(self.bias.iter())
            .copied()
            .collect()
    }
}

/// One structural slot of the network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub index: usize,
    pub in_dim: usize,
    pub out_dim: usize,
    pub activation: Activation,

    /// Copy arena. Retired slots are `None`.
    copies: Vec<Option<RegionCopy>>,
}

impl Region {
    pub fn new(index: usize, in_dim: usize, out_dim: usize, activation: Activation, initial: RegionCopy) -> Self {
        Self {
            index,
            in_dim,
            out_dim,
            activation,
            copies: vec![Some(initial)],
        }
    }

    pub fn param_count(&self) -> usize {
        self.in_dim * self.out_dim + self.out_dim
    }

    pub fn copy(&self, handle: CopyHandle) -> Option<&RegionCopy> {
        self.copies.get(handle.0).and_then(|c| c.as_ref())
    }

    /// Live copies in handle order.
    pub fn live_copies(&self) -> impl Iterator<Item = (CopyHandle, &RegionCopy)> {
        self.copies
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (CopyHandle(i), c)))
    }

    pub fn num_live_copies(&self) -> usize {
        self.copies.iter().filter(|c| c.is_some()).count()
    }

    fn fits(&self, copy: &RegionCopy) -> bool {
        copy.weight.dim() == (self.out_dim, self.in_dim) && copy.bias.len() == self.out_dim
    }
}

/// Everything the backward pass needs from the forward pass.
///
/// The routing used by the forward pass is captured here so the backward pass
/// of the same step reads exactly the same routing.
#[derive(Clone, Debug)]
pub struct ForwardCache {
    pub(crate) tasks: Vec<TaskId>,
    pub(crate) active: Vec<bool>,
    /// Row indices per task, indexed by universe position.
    pub(crate) rows_by_task: Vec<Vec<usize>>,
    /// `routes[region][task position]`
    pub(crate) routes: Vec<Vec<CopyHandle>>,
    /// Rows served by each copy, per region.
    pub(crate) copy_rows: Vec<BTreeMap<CopyHandle, Vec<usize>>>,
    /// Input to each region.
    pub(crate) inputs: Vec<Array2<f32>>,
    /// Post-activation output of each region.
    pub(crate) outputs: Vec<Array2<f32>>,
}

impl ForwardCache {
    pub fn batch_size(&self) -> usize {
        self.tasks.len()
    }

    pub fn output(&self) -> Option<&Array2<f32>> {
        self.outputs.last()
    }
}

/// The ordered list of regions. Sole owner of every copy.
#[derive(Clone, Debug)]
pub struct RegionGraph {
    regions: Vec<Region>,

    /// Full backward traversals performed over the graph's lifetime.
    backward_passes: u64,
}

impl RegionGraph {
    /// MLP graph: tanh on every hidden region, identity on the output region.
    pub fn mlp(input_size: usize, hidden_size: usize, output_size: usize, num_layers: usize, seed: u64) -> Self {
        let regions = (0..num_layers)
            .map(|r| {
                let in_dim = if r == 0 { input_size } else { hidden_size };
                let last = r + 1 == num_layers;
                let out_dim = if last { output_size } else { hidden_size };
                let activation = if last {
                    Activation::Identity
                } else {
                    Activation::Tanh
                };
                let init = RegionCopy::glorot(in_dim, out_dim, seed.wrapping_add(r as u64));
                Region::new(r, in_dim, out_dim, activation, init)
            })
            .collect();
        Self {
            regions,
            backward_passes: 0,
        }
    }

    pub fn from_regions(regions: Vec<Region>) -> Result<Self, SplitError> {
        for (i, region) in regions.iter().enumerate() {
            if region.index != i {
                return Err(SplitError::SnapshotMismatch(format!(
                    "region at position {} carries index {}",
                    i, region.index
                )));
            }
            if i > 0 && regions[i - 1].out_dim != region.in_dim {
                return Err(SplitError::SnapshotMismatch(format!(
                    "region {} expects input {} but region {} produces {}",
                    i,
                    region.in_dim,
                    i - 1,
                    regions[i - 1].out_dim
                )));
            }
            if let Some((handle, _)) = region.live_copies().find(|(_, c)| !region.fits(c)) {
                return Err(SplitError::SnapshotMismatch(format!(
                    "copy {} at region {} violates the region's shape contract",
                    handle, i
                )));
            }
        }
        Ok(Self {
            regions,
            backward_passes: 0,
        })
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, region: usize) -> Result<&Region, SplitError> {
        self.regions.get(region).ok_or(SplitError::UnknownRegion {
            region,
            num_regions: self.regions.len(),
        })
    }

    pub fn copy(&self, region: usize, handle: CopyHandle) -> Result<&RegionCopy, SplitError> {
        self.region(region)?
            .copy(handle)
            .ok_or(SplitError::UnknownCopy { region, copy: handle })
    }

    pub(crate) fn copy_mut(&mut self, region: usize, handle: CopyHandle) -> Result<&mut RegionCopy, SplitError> {
        let num_regions = self.regions.len();
        self.regions
            .get_mut(region)
            .ok_or(SplitError::UnknownRegion { region, num_regions })?
            .copies
            .get_mut(handle.0)
            .and_then(|c| c.as_mut())
            .ok_or(SplitError::UnknownCopy { region, copy: handle })
    }

    /// Allocate two copies cloned bit-for-bit from `parent` and retire `parent`.
    pub(crate) fn duplicate(&mut self, region: usize, parent: CopyHandle) -> Result<(CopyHandle, CopyHandle), SplitError> {
        let source = self.copy(region, parent)?.clone();
        let arena = &mut self.regions[region].copies;
        let a = CopyHandle(arena.len());
        arena.push(Some(source.clone()));
        let b = CopyHandle(arena.len());
        arena.push(Some(source));
        arena[parent.0] = None;
        Ok((a, b))
    }

    /// Reverse the most recent [`duplicate`](Self::duplicate) of `parent`.
    pub(crate) fn undo_duplicate(&mut self, region: usize, parent: CopyHandle, a: CopyHandle, b: CopyHandle) -> Result<(), SplitError> {
        let source = self.copy(region, a)?.clone();
        let arena = &mut self.regions[region].copies;
        if b.0 + 1 != arena.len() || a.0 + 1 != b.0 {
            return Err(SplitError::Integrity(format!(
                "copies {} and {} at region {} are not the latest allocation",
                a, b, region
            )));
        }
        arena.truncate(a.0);
        arena[parent.0] = Some(source);
        Ok(())
    }

    pub fn backward_passes(&self) -> u64 {
        self.backward_passes
    }

    /// Total live parameters across all regions and copies.
    pub fn param_count(&self) -> usize {
        self.regions
            .iter()
            .map(|r| r.param_count() * r.num_live_copies())
            .sum()
    }

    /// Run the batch through every region, each task through its routed copy.
    pub fn forward(
        &self,
        universe: &TaskUniverse,
        registry: &TaskGroupRegistry,
        batch: &TaskBatch,
    ) -> Result<(Array2<f32>, ForwardCache), SplitError> {
        let first = self.region(0)?;
        if batch.observations.ncols() != first.in_dim {
            return Err(SplitError::Shape(format!(
                "observations have {} columns, region 0 expects {}",
                batch.observations.ncols(),
                first.in_dim
            )));
        }

        let rows_by_task = batch.rows_by_task(universe)?;
        let n = batch.len();

        let mut routes = Vec::with_capacity(self.regions.len());
        let mut copy_rows = Vec::with_capacity(self.regions.len());
        let mut inputs = Vec::with_capacity(self.regions.len());
        let mut outputs = Vec::with_capacity(self.regions.len());

        let mut x = batch.observations.clone();
        for region in &self.regions {
            let mut region_routes = Vec::with_capacity(universe.len());
            let mut rows_per_copy: BTreeMap<CopyHandle, Vec<usize>> = BTreeMap::new();
            for (pos, &task) in universe.ids().iter().enumerate() {
                let handle = registry.route(task, region.index)?;
                region_routes.push(handle);
                if !rows_by_task[pos].is_empty() {
                    rows_per_copy
                        .entry(handle)
                        .or_default()
                        .extend_from_slice(&rows_by_task[pos]);
                }
            }

            let mut pre = Array2::zeros((n, region.out_dim));
            for (&handle, rows) in &rows_per_copy {
                let copy = region.copy(handle).ok_or(SplitError::UnknownCopy {
                    region: region.index,
                    copy: handle,
                })?;
                let xs = x.select(Axis(0), rows);
                let ys = xs.dot(&copy.weight.t()) + &copy.bias;
                for (k, &row) in rows.iter().enumerate() {
                    pre.row_mut(row).assign(&ys.row(k));
                }
            }
            let y = region.activation.apply(pre);

            routes.push(region_routes);
            copy_rows.push(rows_per_copy);
            inputs.push(x);
            outputs.push(y.clone());
            x = y;
        }

        let cache = ForwardCache {
            tasks: batch.tasks.clone(),
            active: batch.active.clone(),
            rows_by_task,
            routes,
            copy_rows,
            inputs,
            outputs,
        };
        Ok((x, cache))
    }

    /// One backward traversal of the whole graph for the combined loss.
    ///
    /// `output_grad` is ∂L/∂output for every row, where L is the sum of the
    /// per-task losses. Parameter gradients are accumulated into `collector`
    /// task by task, in universe order, so it can attribute each task's share
    /// without any further pass.
    pub fn backward(
        &mut self,
        cache: &ForwardCache,
        output_grad: &Array2<f32>,
        collector: &mut GradientCollector,
    ) -> Result<(), SplitError> {
        let n = cache.batch_size();
        let out_dim = self.regions.last().map(|r| r.out_dim).unwrap_or(0);
        if output_grad.dim() != (n, out_dim) {
            return Err(SplitError::Shape(format!(
                "output gradient is {:?}, expected ({}, {})",
                output_grad.dim(),
                n,
                out_dim
            )));
        }

        collector.begin_pass();
        self.backward_passes += 1;

        let mut grad = output_grad.clone();
        for region in self.regions.iter().rev() {
            let r = region.index;
            let delta = &grad * &region.activation.derivative_from_output(&cache.outputs[r]);
            let input = &cache.inputs[r];

            for (pos, rows) in cache.rows_by_task.iter().enumerate() {
                if rows.is_empty() {
                    continue;
                }
                let handle = cache.routes[r][pos];
                let d = delta.select(Axis(0), rows);
                let xs = input.select(Axis(0), rows);
                collector.accumulate(r, handle, pos, &d, &xs)?;
            }

            if r == 0 {
                break;
            }
            let mut grad_in = Array2::zeros((n, region.in_dim));
            for (&handle, rows) in &cache.copy_rows[r] {
                let copy = region.copy(handle).ok_or(SplitError::UnknownCopy { region: r, copy: handle })?;
                let back = delta.select(Axis(0), rows).dot(&copy.weight);
                for (k, &row) in rows.iter().enumerate() {
                    grad_in.row_mut(row).assign(&back.row(k));
                }
            }
            grad = grad_in;
        }

        collector.finish_pass(cache)
    }
}
