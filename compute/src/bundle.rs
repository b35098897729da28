//! Stencil bundle contract
//!
//! The stencil compiler collaborator supplies one [`Bundle`] per equation
//! group: scalar and vectorised inner kernels plus static metadata. The
//! engine owns everything around them (tiling, halos, bounding boxes) and
//! hands each kernel an [`EvalCtx`] naming the variables it may touch.

use data::idx::Indices;
use data::var::{Var, VarId, VarStore};
use data::{Idx, Precision};

/// Reference to a solution variable or a per-thread scratch variable
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarRef {
    Var(VarId),
    Scratch(usize),
}

/// Everything a kernel may read while computing points
///
/// `scratch` holds this thread's scratch variables, indexed by scratch
/// slot; their local offsets were positioned for the current mini-block
/// before the kernel runs. `fold_pts`/`cluster_pts` (per domain dim) let
/// generic kernels recover the SIMD geometry of a run.
pub struct EvalCtx<'a> {
    pub store: &'a VarStore,
    pub scratch: &'a [&'a Var],
    pub rank_offsets: &'a Indices,
    pub fold_pts: &'a Indices,
    pub cluster_pts: &'a Indices,
}

impl<'a> EvalCtx<'a> {
    pub fn var(&self, r: VarRef) -> &Var {
        match r {
            VarRef::Var(id) => self.store.get(id),
            VarRef::Scratch(slot) => self.scratch[slot],
        }
    }
}

/// Write mask over one vector fold: bit i covers fold point i
pub type WriteMask = u64;

/// One stencil equation bundle, supplied by the stencil compiler
///
/// Point indices are global solution indices `[t, domain...]`. The loop
/// kernels receive the start point of a run and the exclusive stop in the
/// inner domain dim, with all other dims fixed; runs are aligned to whole
/// clusters/vectors by the engine before they are issued.
pub trait Bundle: Send + Sync {
    fn name(&self) -> &str;

    /// Variables written by this bundle
    fn output_vars(&self) -> Vec<VarRef>;

    /// Scratch bundles that must be evaluated (over an expanded span)
    /// before this bundle, as solution bundle indices
    fn scratch_children(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Does this bundle write scratch variables only?
    fn is_scratch(&self) -> bool {
        false
    }

    /// Sub-domain mask; `pt` is `[t, domain...]` with `t` unspecified
    fn is_in_valid_domain(&self, ctx: &EvalCtx<'_>, pt: &Indices) -> bool {
        let _ = (ctx, pt);
        true
    }

    /// Is the mask non-trivial? Engines skip bounding-box discovery when
    /// the whole domain is valid.
    fn is_sub_domain_expr(&self) -> bool {
        false
    }

    /// Step condition
    fn is_in_valid_step(&self, t: Idx) -> bool {
        let _ = t;
        true
    }

    /// Step written when reading step `t`, or `None` when this bundle
    /// does not write that step
    fn output_step_index(&self, t: Idx) -> Option<Idx> {
        Some(t + 1)
    }

    /// Compute one point
    fn calc_scalar(&self, ctx: &EvalCtx<'_>, thread: usize, pt: &Indices);

    /// Compute whole vector-clusters from `start` until `stop_inner` in
    /// the inner domain dim
    ///
    /// One call covers the full cluster extent in every non-inner domain
    /// dim; the engine steps its outer loops by whole clusters.
    fn calc_loop_of_clusters(
        &self,
        ctx: &EvalCtx<'_>,
        region_thread: usize,
        block_thread: usize,
        start: &Indices,
        stop_inner: Idx,
    ) {
        let _ = block_thread;
        // Reference fallback: scalar sweep over the cluster rows.
        let dd0 = start.len() - ctx.cluster_pts.len();
        let mut spans = start.clone();
        for (j, &c) in ctx.cluster_pts.0.iter().enumerate() {
            spans[dd0 + j] = start[dd0 + j] + c;
        }
        spans[start.len() - 1] = stop_inner;
        sweep_box(self, ctx, region_thread, start, &spans);
    }

    /// Compute whole vectors with a write mask, for peel/remainder runs
    ///
    /// `write_mask` bit `k` covers the fold point with row-major linear
    /// index `k`; masked-out points must not be modified.
    fn calc_loop_of_vectors(
        &self,
        ctx: &EvalCtx<'_>,
        region_thread: usize,
        block_thread: usize,
        start: &Indices,
        stop_inner: Idx,
        write_mask: WriteMask,
    ) {
        let _ = block_thread;
        let nsd = start.len();
        let dd0 = nsd - ctx.fold_pts.len();
        let inner_fold = ctx.fold_pts.0[ctx.fold_pts.len() - 1].max(1);
        let fold_size: Idx = ctx.fold_pts.product();
        let mut vec_base = start.clone();
        while vec_base[nsd - 1] < stop_inner {
            // Walk the fold points of this vector in row-major order.
            let mut k = 0;
            let mut fold_ofs = Indices::new(0, ctx.fold_pts.len());
            for _ in 0..fold_size {
                if write_mask >> k & 1 == 1 {
                    let mut pt = vec_base.clone();
                    for j in 0..ctx.fold_pts.len() {
                        pt[dd0 + j] += fold_ofs[j];
                    }
                    if self.is_in_valid_domain(ctx, &pt) {
                        self.calc_scalar(ctx, region_thread, &pt);
                    }
                }
                k += 1;
                for j in (0..ctx.fold_pts.len()).rev() {
                    fold_ofs[j] += 1;
                    if fold_ofs[j] < ctx.fold_pts[j] {
                        break;
                    }
                    fold_ofs[j] = 0;
                }
            }
            vec_base[nsd - 1] += inner_fold;
        }
    }

    // Static cost metadata, used for stats and tuning weights.

    /// Scalar reads per point
    fn points_read(&self) -> usize {
        0
    }

    /// Scalar writes per point
    fn points_written(&self) -> usize {
        1
    }

    /// Estimated FP ops per point
    fn fp_ops(&self) -> usize {
        0
    }
}

/// Scalar sweep of the half-open box `[start, stop)`, step dim fixed
fn sweep_box<B: Bundle + ?Sized>(
    bundle: &B,
    ctx: &EvalCtx<'_>,
    thread: usize,
    start: &Indices,
    stop: &Indices,
) {
    let n = start.len();
    if (1..n).any(|d| stop[d] <= start[d]) {
        return;
    }
    let mut pt = start.clone();
    loop {
        if bundle.is_in_valid_domain(ctx, &pt) {
            bundle.calc_scalar(ctx, thread, &pt);
        }
        // Row-major increment over the domain dims (dim 0 is the step).
        let mut d = n - 1;
        loop {
            pt[d] += 1;
            if pt[d] < stop[d] {
                break;
            }
            pt[d] = start[d];
            if d == 1 {
                return;
            }
            d -= 1;
        }
    }
}

/// Precision element shorthand re-exported for kernel implementations
pub type Elem = Precision;

/// Ordered list of bundles whose intra-pack order is free
///
/// Packs run sequentially in the step direction; each pack carries its
/// own copy of the tile-size settings so pack tuners can diverge.
pub struct Pack {
    pub name: String,
    /// Indices of non-scratch bundles in the solution's bundle list
    pub bundles: Vec<usize>,
    pub settings: crate::settings::Settings,
    /// Steps this pack has computed
    pub steps_done: Idx,
    /// Seconds spent in this pack's kernels
    pub elapsed_secs: f64,
}

impl Pack {
    pub fn new(name: impl Into<String>, bundles: Vec<usize>, settings: crate::settings::Settings) -> Self {
        Self {
            name: name.into(),
            bundles,
            settings,
            steps_done: 0,
            elapsed_secs: 0.0,
        }
    }
}
