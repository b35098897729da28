//! Solution state and driver surface
//!
//! A [`Solution`] binds the dimension set, the settings, the variable
//! store, the bundles and packs, the rank layout and the halo engine.
//! Construction happens in three phases: declare (vars, bundles, packs),
//! [`prepare_solution`](Solution::prepare_solution), then any number of
//! [`run_solution`](Solution::run_solution) calls.

use crate::bbox::BundleBBs;
use crate::bundle::{Bundle, Pack};
use crate::settings::{Options, Settings};
use crate::stats::{RunTimers, Stats};
use crate::tune::AutoTuner;
use crate::{Error, Result};
use comm::Env;
use data::bounds::BoundingBox;
use data::dims::{DimKind, DimSet};
use data::idx::Indices;
use data::var::{Var, VarDim, VarId, VarStore};
use data::{Idx, Precision};
use exchange::HaloEngine;
use log::info;
use std::sync::{Arc, Mutex};
use topology::RankLayout;

/// Wave-front and temporal-block geometry, derived in `prepare_solution`
#[derive(Clone, Debug, Default)]
pub struct Geometry {
    pub rank_bb: BoundingBox,
    /// Rank box extended by the wave-front extensions
    pub ext_bb: BoundingBox,
    /// Interior box under comm/compute overlap (invalid when off)
    pub mpi_interior: BoundingBox,

    pub max_halos: Indices,

    pub wf_steps: Idx,
    pub num_wf_shifts: Idx,
    pub wf_angles: Indices,
    pub wf_shift_pts: Indices,
    pub left_wf_exts: Indices,
    pub right_wf_exts: Indices,

    pub tb_steps: Idx,
    pub num_tb_shifts: Idx,
    pub tb_angles: Indices,
    pub tb_widths: Indices,
    pub tb_tops: Indices,
    pub mb_angles: Indices,
}

/// One scratch variable, duplicated per region thread
pub struct ScratchSlot {
    pub name: String,
    /// Domain dims used (scratch vars carry no step dim)
    pub dim_names: Vec<String>,
    pub left_halo: Idx,
    pub right_halo: Idx,
    pub(crate) per_thread: Vec<Mutex<Var>>,
}

/// The engine's central object
pub struct Solution {
    pub(crate) env: Env,
    pub(crate) dims: DimSet,
    pub settings: Settings,
    pub(crate) store: VarStore,
    pub(crate) bundles: Vec<Box<dyn Bundle>>,
    pub(crate) packs: Vec<Pack>,
    pub(crate) scratch: Vec<ScratchSlot>,

    pub(crate) layout: Option<RankLayout>,
    pub(crate) halo: Option<HaloEngine>,
    pub(crate) geom: Geometry,
    pub(crate) bundle_bbs: Vec<BundleBBs>,
    pub(crate) pack_bbs: Vec<BoundingBox>,

    pub(crate) region_pool: Option<Arc<rayon::ThreadPool>>,
    pub(crate) block_pool: Option<Arc<rayon::ThreadPool>>,

    pub(crate) prepared: bool,
    pub(crate) timers: RunTimers,
    pub(crate) steps_done: Idx,
    pub(crate) tuner: Option<AutoTuner>,

    pub(crate) before_run_hooks: Vec<Box<dyn Fn(Idx, Idx) + Send + Sync>>,
    pub(crate) after_run_hooks: Vec<Box<dyn Fn(Idx, Idx) + Send + Sync>>,
}

impl Solution {
    pub fn new(env: Env, dims: DimSet) -> Self {
        let settings = Settings::new(&dims);
        Self {
            env,
            dims,
            settings,
            store: VarStore::new(),
            bundles: Vec::new(),
            packs: Vec::new(),
            scratch: Vec::new(),
            layout: None,
            halo: None,
            geom: Geometry::default(),
            bundle_bbs: Vec::new(),
            pack_bbs: Vec::new(),
            region_pool: None,
            block_pool: None,
            prepared: false,
            timers: RunTimers::default(),
            steps_done: 0,
            tuner: None,
            before_run_hooks: Vec::new(),
            after_run_hooks: Vec::new(),
        }
    }

    pub fn dims(&self) -> &DimSet {
        &self.dims
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn store(&self) -> &VarStore {
        &self.store
    }

    pub fn layout(&self) -> Option<&RankLayout> {
        self.layout.as_ref()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    // ----- declaration surface -----

    /// Create a solution variable over the named dims, auto-sized during
    /// `prepare_solution`
    pub fn new_var(&mut self, name: &str, dim_names: &[&str]) -> Result<VarId> {
        let mut dims = Vec::with_capacity(dim_names.len());
        for dn in dim_names {
            let kind = self.dims.kind_of(dn).ok_or_else(|| {
                Error::Config(format!("variable '{name}' uses unknown dim '{dn}'"))
            })?;
            dims.push(match kind {
                DimKind::Step => VarDim::step(*dn),
                DimKind::Domain => VarDim::domain(*dn),
                DimKind::Misc => VarDim::misc(*dn, 1),
            });
        }
        let mut var = Var::new(name, dims);
        if var.step_posn().is_some() {
            var.set_alloc_steps(2);
        }
        var.set_step_wrap(self.settings.step_wrap);
        Ok(self.store.insert(var))
    }

    /// Create a fixed-size variable: never resized, never decomposed
    pub fn new_fixed_size_var(&mut self, name: &str, dims: &[(&str, Idx)]) -> Result<VarId> {
        let dims = dims
            .iter()
            .map(|(n, sz)| ((*n).to_owned(), *sz))
            .collect();
        let mut var = Var::new_fixed_size(name, dims);
        var.alloc_storage();
        Ok(self.store.insert(var))
    }

    /// Declare a per-thread scratch variable over domain dims
    ///
    /// Returns the scratch slot index used in [`crate::VarRef::Scratch`].
    pub fn new_scratch_var(
        &mut self,
        name: &str,
        dim_names: &[&str],
        left_halo: Idx,
        right_halo: Idx,
    ) -> Result<usize> {
        for dn in dim_names {
            if self.dims.kind_of(dn) != Some(DimKind::Domain) {
                return Err(Error::Config(format!(
                    "scratch variable '{name}' may only use domain dims, got '{dn}'"
                )));
            }
        }
        self.scratch.push(ScratchSlot {
            name: name.to_owned(),
            dim_names: dim_names.iter().map(|s| (*s).to_owned()).collect(),
            left_halo,
            right_halo,
            per_thread: Vec::new(),
        });
        Ok(self.scratch.len() - 1)
    }

    /// Set the extent of a misc dim of one variable
    pub fn set_misc_size(&mut self, id: VarId, dim: &str, size: Idx) -> Result<()> {
        let var = self.store.get_mut(id);
        let posn = var
            .posn_of(dim)
            .ok_or_else(|| Error::Config(format!("no dim '{dim}' in variable")))?;
        let vd = var.dim_mut(posn);
        if vd.kind != DimKind::Misc {
            return Err(Error::Config(format!("dim '{dim}' is not a misc dim")));
        }
        vd.domain_size = size;
        Ok(())
    }

    /// Set halo widths of a variable in one domain dim
    pub fn set_halo(&mut self, id: VarId, dim: &str, left: Idx, right: Idx) -> Result<()> {
        let var = self.store.get_mut(id);
        let posn = var
            .posn_of(dim)
            .ok_or_else(|| Error::Config(format!("no dim '{dim}' in variable")))?;
        let vd = var.dim_mut(posn);
        vd.left_halo = left;
        vd.right_halo = right;
        Ok(())
    }

    /// Set the number of live steps a variable holds
    pub fn set_alloc_steps(&mut self, id: VarId, steps: Idx) {
        self.store.get_mut(id).set_alloc_steps(steps);
    }

    /// Share storage between two variables with identical shapes
    pub fn fuse_vars(&mut self, dst: VarId, src: VarId) -> Result<()> {
        if dst == src {
            return Ok(());
        }
        let (dst_var, src_var) = self.store.get_pair_mut(dst, src);
        dst_var.fuse_vars(src_var).map_err(Error::from)
    }

    pub fn add_bundle(&mut self, b: Box<dyn Bundle>) -> usize {
        self.bundles.push(b);
        self.bundles.len() - 1
    }

    /// Group bundles into a pack, evaluated in declaration order
    pub fn add_pack(&mut self, name: &str, bundles: Vec<usize>) -> Result<()> {
        for &bi in &bundles {
            if bi >= self.bundles.len() {
                return Err(Error::Config(format!("pack '{name}' names unknown bundle {bi}")));
            }
            if self.bundles[bi].is_scratch() {
                return Err(Error::Config(format!(
                    "pack '{name}' lists scratch bundle '{}'; scratch bundles run \
                     as prerequisites of their consumers",
                    self.bundles[bi].name()
                )));
            }
        }
        let settings = self.settings.clone();
        self.packs.push(Pack::new(name, bundles, settings));
        Ok(())
    }

    // ----- numeric setters -----

    pub fn set_global_size(&mut self, dim: &str, size: Idx) {
        self.settings.global_sizes.set(dim, size);
    }

    pub fn set_rank_size(&mut self, dim: &str, size: Idx) {
        self.settings.rank_sizes.set(dim, size);
    }

    pub fn set_region_size(&mut self, dim: &str, size: Idx) {
        self.settings.region_sizes.set(dim, size);
    }

    pub fn set_block_size(&mut self, dim: &str, size: Idx) {
        self.settings.block_sizes.set(dim, size);
    }

    pub fn set_mini_block_size(&mut self, dim: &str, size: Idx) {
        self.settings.mini_block_sizes.set(dim, size);
    }

    pub fn set_sub_block_size(&mut self, dim: &str, size: Idx) {
        self.settings.sub_block_sizes.set(dim, size);
    }

    pub fn set_min_pad_size(&mut self, dim: &str, size: Idx) {
        self.settings.min_pad_sizes.set(dim, size);
    }

    pub fn set_num_ranks(&mut self, dim: &str, n: Idx) {
        if let Some(j) = self.dims.domain_dims().iter().position(|d| d == dim) {
            self.settings.num_ranks[j] = n;
        }
    }

    pub fn set_rank_index(&mut self, dim: &str, idx: Idx) {
        if let Some(j) = self.dims.domain_dims().iter().position(|d| d == dim) {
            self.settings.rank_indices[j] = idx;
            self.settings.find_loc = false;
        }
    }

    /// Parse and fold a key/value argv slice into the settings
    pub fn apply_command_line_options<S: AsRef<str>>(&mut self, args: &[S]) -> Result<()> {
        let opts = Options::parse_args(args).map_err(Error::Config)?;
        opts.apply_to(&mut self.settings).map_err(Error::Config)?;
        for (_, var) in self.store.iter_mut() {
            var.set_step_wrap(self.settings.step_wrap);
        }
        Ok(())
    }

    /// Register a hook around `run_solution`
    pub fn call_before_run_solution(&mut self, hook: impl Fn(Idx, Idx) + Send + Sync + 'static) {
        self.before_run_hooks.push(Box::new(hook));
    }

    pub fn call_after_run_solution(&mut self, hook: impl Fn(Idx, Idx) + Send + Sync + 'static) {
        self.after_run_hooks.push(Box::new(hook));
    }

    // ----- element access passthrough -----

    pub fn var(&self, id: VarId) -> &Var {
        self.store.get(id)
    }

    pub fn var_by_name(&self, name: &str) -> Option<&Var> {
        self.store.by_name(name)
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Var {
        self.store.get_mut(id)
    }

    /// Seed every allocated variable with a per-var constant
    ///
    /// Used by tests and to re-initialise data after a forced tuner run.
    pub fn init_values(&mut self, mut seed: Precision) {
        for (_, var) in self.store.iter() {
            if let Some(s) = var.storage() {
                s.fill(seed);
                var.set_dirty_all(true);
            }
            seed += 0.01;
        }
    }

    // ----- lifecycle -----

    /// Release all variable storage; the solution must be re-prepared
    pub fn end_solution(&mut self) {
        for (_, var) in self.store.iter_mut() {
            var.release_storage();
        }
        for slot in &mut self.scratch {
            slot.per_thread.clear();
        }
        self.halo = None;
        self.prepared = false;
        info!("solution ended; storage released");
    }

    /// Counters and timers snapshot
    pub fn get_stats(&self) -> Stats {
        let (mut points_written, mut fp_ops) = (0u64, 0u64);
        for pack in &self.packs {
            for &bi in &pack.bundles {
                let bundle = &self.bundles[bi];
                let pts = self
                    .bundle_bbs
                    .get(bi)
                    .map_or(0, |bb| bb.outer.num_points.max(0)) as u64;
                let steps = pack.steps_done.max(0) as u64;
                points_written += pts * steps * bundle.points_written() as u64;
                fp_ops += pts * steps * bundle.fp_ops() as u64;
            }
        }
        let (num_exchanges, num_var_swaps) = self
            .halo
            .as_ref()
            .map_or((0, 0), |h| (h.stats().num_exchanges, h.stats().num_var_swaps));
        Stats {
            steps_done: self.steps_done,
            points_written,
            fp_ops,
            run_secs: self.timers.run.secs(),
            halo_secs: self.timers.halo.secs(),
            ext_secs: self.timers.ext.secs(),
            int_secs: self.timers.int_.secs(),
            num_exchanges,
            num_var_swaps,
            packs: self
                .packs
                .iter()
                .map(|p| (p.name.clone(), p.steps_done, p.elapsed_secs))
                .collect(),
        }
    }

    /// Boxes discovered for one bundle (after `prepare_solution`)
    pub fn bundle_boxes(&self, bundle: usize) -> Option<&BundleBBs> {
        self.bundle_bbs.get(bundle)
    }

    /// Restart the auto-tuner from the current settings
    pub fn reset_auto_tuner(&mut self, enable: bool) {
        self.set_auto_tuner_policy(Default::default(), enable);
    }

    /// Restart the auto-tuner with an explicit search policy
    pub fn set_auto_tuner_policy(&mut self, policy: crate::tune::TunerPolicy, enable: bool) {
        if enable {
            let blocks = crate::tune::current_blocks(&self.dims, &self.settings);
            self.tuner = Some(AutoTuner::new("context", policy, blocks));
            self.settings.do_auto_tune = true;
        } else {
            self.tuner = None;
            self.settings.do_auto_tune = false;
        }
    }

    pub fn is_auto_tuner_enabled(&self) -> bool {
        self.tuner.as_ref().is_some_and(|t| !t.is_done())
    }

    /// Run the tuner synchronously on throwaway steps
    ///
    /// Mutates variable contents; callers must re-initialise data after.
    pub fn run_auto_tuner_now(&mut self, max_strides: usize) -> Result<()> {
        if !self.prepared {
            return Err(Error::Scheduling(
                "run_auto_tuner_now called before prepare_solution".into(),
            ));
        }
        if self.tuner.is_none() {
            self.reset_auto_tuner(true);
        }
        self.settings.do_auto_tune = true;
        let stride = self.geom.wf_steps.max(1);
        let mut t = 1;
        for _ in 0..max_strides {
            if !self.is_auto_tuner_enabled() {
                break;
            }
            self.run_solution(t, t + stride - 1)?;
            t += stride;
        }
        // Keep the best sizes even if the search was cut short.
        if let Some(tuner) = &self.tuner {
            let best = tuner.best_sizes().clone();
            crate::tune::apply_blocks(&best, &self.dims, &mut self.settings);
            self.after_block_size_change()?;
        }
        info!(
            "auto-tune finished; block sizes {}",
            self.settings.block_sizes.make_dim_val_str(",")
        );
        Ok(())
    }

    /// Copy the context settings into every pack
    pub(crate) fn sync_pack_settings(&mut self) {
        for p in &mut self.packs {
            p.settings = self.settings.clone();
        }
    }
}
