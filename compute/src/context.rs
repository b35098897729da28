//! Tile scheduler
//!
//! `run_solution` walks the step axis in wave-front strides; inside each
//! stride the region loop covers the (extended) rank, blocks run on the
//! region thread pool, mini-blocks walk sequentially inside a block and
//! sub-blocks fan out over the block threads. Wave-front and
//! temporal-block shifting keep stencil dependencies satisfied while
//! tiles march through time; under comm overlap the rank exterior runs
//! first so halo messages travel while the interior computes.

use crate::bundle::{EvalCtx, VarRef, WriteMask};
use crate::scan::{scan, ScanIndices, ScanMods};
use crate::solution::Solution;
use crate::{round_up_flr, Error, Result};
use data::dims::DimSet;
use data::idx::Indices;
use data::var::Var;
use data::{ceil_div, div_flr, mod_flr, round_down_flr, Idx};
use exchange::HaloFlags;
use log::trace;

/// Which part of the rank a pass covers under comm/compute overlap
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum MpiSection {
    /// No overlap: the whole rank in one pass
    All,
    /// One exterior slab: the given side of the given domain dim
    Exterior { dim: usize, left: bool },
    /// Everything that touches no outgoing halo
    Interior,
}

impl Solution {
    /// Evaluate all packs from step `first` to step `last` inclusive
    pub fn run_solution(&mut self, first: Idx, last: Idx) -> Result<()> {
        if !self.prepared {
            return Err(Error::Scheduling(
                "run_solution called before prepare_solution".into(),
            ));
        }
        for h in &self.before_run_hooks {
            h(first, last);
        }
        let t_run = self.timers.run.start();
        let step_dir: Idx = if last >= first { 1 } else { -1 };
        let wf_steps = self.geom.wf_steps;
        let stride_t = wf_steps.max(1) * step_dir;
        let begin_t = first;
        let end_t = last + step_dir;

        if self.geom.ext_bb.size < 1 {
            trace!("nothing to do in solution");
            self.timers.run.stop(t_run);
            return Ok(());
        }

        // Rank-level scan state: spatial span is the extended box, plus
        // the wave-front shift on sides with no extension (the right edge
        // of the last rank computes its own shifted columns).
        let layout = self.layout.as_ref().expect("prepared");
        let nsd = self.dims.nsd();
        let mut rank_idxs = ScanIndices::new(
            nsd,
            Some((self.dims.fold_pts(), &layout.rank_offsets)),
        );
        rank_idxs.begin[0] = begin_t;
        rank_idxs.end[0] = end_t;
        rank_idxs.stride[0] = stride_t;
        for j in 0..self.dims.ndd() {
            let i = DimSet::soln_posn(j);
            rank_idxs.begin[i] = self.geom.ext_bb.begin[j];
            rank_idxs.end[i] = self.geom.ext_bb.end[j];
            if wf_steps > 0 && self.geom.right_wf_exts[j] == 0 {
                rank_idxs.end[i] += self.geom.wf_shift_pts[j];
            }
            let region = self.settings.region_sizes.vals()[i];
            let rank = self.settings.rank_sizes.vals()[i];
            rank_idxs.stride[i] = if region >= rank {
                rank_idxs.end[i] - rank_idxs.begin[i]
            } else {
                region
            };
        }
        trace!(
            "run_solution: [{} ... {}) by {}",
            rank_idxs.begin,
            rank_idxs.end,
            rank_idxs.stride
        );

        // Initial exchange covers halos dirtied by the caller's writes.
        self.halo_exchange(HaloFlags::ALL)?;

        let num_t = ceil_div((end_t - begin_t).abs(), stride_t.abs());
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * stride_t;
            let stop_t = if stride_t > 0 {
                (start_t + stride_t).min(end_t)
            } else {
                (start_t + stride_t).max(end_t)
            };
            let this_num_t = (stop_t - start_t).abs();
            rank_idxs.index[0] = index_t;
            rank_idxs.start[0] = start_t;
            rank_idxs.stop[0] = stop_t;
            let stride_timer = std::time::Instant::now();

            if wf_steps == 0 {
                // One pack at a time; each gets its own exchange.
                for pi in 0..self.packs.len() {
                    if !self.pack_in_valid_step(pi, start_t) {
                        trace!("step {start_t} not valid for pack {pi}");
                        continue;
                    }
                    self.run_pack_section(Some(pi), &rank_idxs, start_t, stop_t)?;
                }
            } else {
                // Wave-front tiling: all packs walk inside the regions.
                self.run_pack_section(None, &rank_idxs, start_t, stop_t)?;
            }

            self.steps_done += this_num_t;
            for pi in 0..self.packs.len() {
                let mut pack_steps = 0;
                let mut t = start_t;
                while t != stop_t {
                    if self.pack_in_valid_step(pi, t) {
                        pack_steps += 1;
                    }
                    t += step_dir;
                }
                self.packs[pi].steps_done += pack_steps;
                self.packs[pi].elapsed_secs +=
                    stride_timer.elapsed().as_secs_f64() / self.packs.len() as f64;
            }
            self.eval_auto_tuner(this_num_t, stride_timer.elapsed().as_secs_f64())?;
        }

        self.timers.run.stop(t_run);
        for h in &self.after_run_hooks {
            h(first, last);
        }
        Ok(())
    }

    /// One (pack | all-packs) evaluation of one step stride, including
    /// the overlap sub-passes and the surrounding exchanges
    fn run_pack_section(
        &mut self,
        sel: Option<usize>,
        rank_idxs: &ScanIndices,
        start_t: Idx,
        stop_t: Idx,
    ) -> Result<()> {
        let overlap = self.overlap_active();
        if overlap {
            // Exterior passes: one per (dim, side) with a neighbour,
            // ascending dims so earlier slabs are excluded from later
            // ones.
            for j in 0..self.dims.ndd() {
                for left in [true, false] {
                    if !self.exterior_exists(j, left) {
                        continue;
                    }
                    trace!(
                        "steps [{start_t} ... {stop_t}) in exterior dim {j} {}",
                        if left { "left" } else { "right" }
                    );
                    let t0 = self.timers.ext.start();
                    self.runner().calc_rank(
                        sel,
                        rank_idxs,
                        MpiSection::Exterior { dim: j, left },
                    );
                    self.timers.ext.stop(t0);
                }
            }
            self.update_vars_written(sel, start_t, stop_t, true);
            // Post receives and sends for the exterior results.
            self.halo_exchange(HaloFlags {
                do_left: true,
                do_right: true,
                do_interior: false,
            })?;

            // Interior runs while messages travel.
            trace!("steps [{start_t} ... {stop_t}) in interior");
            let t0 = self.timers.int_.start();
            self.runner().calc_rank(sel, rank_idxs, MpiSection::Interior);
            self.timers.int_.stop(t0);
            self.update_vars_written(sel, start_t, stop_t, false);
            // Unpack and drain.
            self.halo_exchange(HaloFlags {
                do_left: false,
                do_right: false,
                do_interior: true,
            })?;
        } else {
            let t0 = self.timers.int_.start();
            self.runner().calc_rank(sel, rank_idxs, MpiSection::All);
            self.timers.int_.stop(t0);
            self.update_vars_written(sel, start_t, stop_t, true);
            self.halo_exchange(HaloFlags::ALL)?;
        }
        Ok(())
    }

    /// Single-step form of [`run_solution`](Self::run_solution)
    pub fn run_solution_step(&mut self, t: Idx) -> Result<()> {
        self.run_solution(t, t)
    }

    /// Golden reference: rank-sized tiles, scalar kernels, no shifting
    pub fn run_ref(&mut self, first: Idx, last: Idx) -> Result<()> {
        if !self.prepared {
            return Err(Error::Scheduling(
                "run_ref called before prepare_solution".into(),
            ));
        }
        let t_run = self.timers.run.start();
        let step_dir: Idx = if last >= first { 1 } else { -1 };
        self.realloc_scratch_rank_sized();
        self.halo_exchange(HaloFlags::ALL)?;

        let layout = self.layout.as_ref().expect("prepared");
        let rank_begin = self.geom.rank_bb.begin.clone();
        let rank_end = self.geom.rank_bb.end.clone();
        let rank_offsets = layout.rank_offsets.clone();

        let mut t = first;
        loop {
            // Bundles in pack order; scratch prerequisites run first.
            for pi in 0..self.packs.len() {
                for bn in 0..self.packs[pi].bundles.len() {
                    let bi = self.packs[pi].bundles[bn];
                    if !self.bundles[bi].is_in_valid_step(t) {
                        continue;
                    }
                    self.halo_exchange(HaloFlags::ALL)?;

                    let fold = self.dims.fold_pts().clone();
                    let cluster = self.dims.cluster_pts();
                    let mut guards = self.lock_scratch(0);
                    position_scratch(&mut guards, &rank_begin, &rank_offsets, &self.dims);
                    let scratch_refs: Vec<&Var> = guards.iter().map(|g| &**g).collect();
                    let ctx = EvalCtx {
                        store: &self.store,
                        scratch: &scratch_refs,
                        rank_offsets: &rank_offsets,
                        fold_pts: &fold,
                        cluster_pts: &cluster,
                    };

                    let mut reqd = self.bundles[bi].scratch_children();
                    reqd.push(bi);
                    for sg in reqd {
                        let bundle = &self.bundles[sg];
                        let (mut begin, mut end) = (rank_begin.clone(), rank_end.clone());
                        if bundle.is_scratch() {
                            expand_for_scratch(
                                bundle.as_ref(),
                                &ctx,
                                &self.dims,
                                &mut begin,
                                &mut end,
                            );
                        }
                        // Scalar sweep over every valid point.
                        let nsd = self.dims.nsd();
                        let mut pt = Indices::new(0, nsd);
                        pt[0] = t;
                        sweep_domain(&begin, &end, |dpt| {
                            for j in 0..dpt.len() {
                                pt[j + 1] = dpt[j];
                            }
                            if bundle.is_in_valid_domain(&ctx, &pt) {
                                bundle.calc_scalar(&ctx, 0, &pt);
                            }
                        });
                    }
                    drop(guards);
                    self.update_vars_written(Some(pi), t, t + step_dir, true);
                }
            }
            if t == last {
                break;
            }
            t += step_dir;
        }
        self.steps_done += (last - first).abs() + 1;
        self.halo_exchange(HaloFlags::ALL)?;
        // Normal tile sizes again for subsequent optimised runs.
        self.realloc_scratch();
        self.timers.run.stop(t_run);
        Ok(())
    }

    /// Borrow an immutable runner over this solution
    pub(crate) fn runner(&self) -> Runner<'_> {
        Runner { sol: self }
    }

    pub(crate) fn pack_in_valid_step(&self, pi: usize, t: Idx) -> bool {
        self.packs[pi]
            .bundles
            .iter()
            .any(|&bi| self.bundles[bi].is_in_valid_step(t))
    }

    pub(crate) fn overlap_active(&self) -> bool {
        self.settings.overlap_comms
            && self.env.num_ranks() > 1
            && self.geom.mpi_interior.valid
            && self.geom.mpi_interior.size > 0
    }

    pub(crate) fn exterior_exists(&self, dim: usize, left: bool) -> bool {
        if left {
            self.geom.mpi_interior.begin[dim] > self.geom.ext_bb.begin[dim]
        } else {
            self.geom.mpi_interior.end[dim] < self.geom.ext_bb.end[dim]
        }
    }

    /// Mark output vars of the selected packs written over `[start, stop)`
    ///
    /// Vars are marked dirty on every rank, whether or not this rank
    /// actually wrote them: sub-domain masks are not globally known, and
    /// all ranks must agree on what needs exchanging.
    pub(crate) fn update_vars_written(
        &self,
        sel: Option<usize>,
        start: Idx,
        stop: Idx,
        mark_dirty: bool,
    ) {
        let stride: Idx = if start > stop { -1 } else { 1 };
        for (pi, pack) in self.packs.iter().enumerate() {
            if sel.is_some_and(|s| s != pi) {
                continue;
            }
            let mut t = start;
            while t != stop {
                for &bi in &pack.bundles {
                    let bundle = &self.bundles[bi];
                    if !bundle.is_in_valid_step(t) {
                        continue;
                    }
                    let Some(t_out) = bundle.output_step_index(t) else {
                        continue;
                    };
                    for out in bundle.output_vars() {
                        if let VarRef::Var(id) = out {
                            let var = self.store.get(id);
                            var.update_valid_step(t_out);
                            if mark_dirty {
                                var.set_dirty(true, t_out);
                            }
                            trace!("var '{}' updated at step {t_out}", var.name());
                        }
                    }
                }
                t += stride;
            }
        }
    }

    /// Timed halo exchange with the current engine
    pub(crate) fn halo_exchange(&mut self, flags: HaloFlags) -> Result<()> {
        let Some(halo) = self.halo.as_mut() else {
            return Ok(());
        };
        let t0 = self.timers.halo.start();
        let r = halo.exchange(&self.store, &*self.env.comm, flags);
        self.timers.halo.stop(t0);
        r.map_err(Error::from)
    }

    /// Feed the tuner one stride sample; re-derive geometry on change
    fn eval_auto_tuner(&mut self, steps: Idx, secs: f64) -> Result<()> {
        let Some(mut tuner) = self.tuner.take() else {
            return Ok(());
        };
        let changed = tuner.eval(steps, secs, &self.dims, &mut self.settings);
        self.tuner = Some(tuner);
        if changed {
            self.after_block_size_change()?;
        }
        Ok(())
    }
}

/// Immutable view used by the parallel tile walkers
pub(crate) struct Runner<'a> {
    pub(crate) sol: &'a Solution,
}

impl Runner<'_> {
    fn dims(&self) -> &DimSet {
        &self.sol.dims
    }

    fn domain_posns(&self) -> Vec<usize> {
        (0..self.sol.dims.ndd()).map(DimSet::soln_posn).collect()
    }

    /// Traversal modifiers from the settings; square-wave applies only
    /// to the innermost (sub-block) scans
    fn mods(&self, innermost: bool) -> ScanMods {
        ScanMods {
            serpentine: self.sol.settings.serpentine,
            square_wave: innermost && self.sol.settings.square_wave,
            grouped: true,
        }
    }

    /// Region loop: serial walk of the rank's regions
    pub(crate) fn calc_rank(
        &self,
        sel: Option<usize>,
        rank_idxs: &ScanIndices,
        section: MpiSection,
    ) {
        let posns = self.domain_posns();
        scan(rank_idxs, &posns, ScanMods::default(), None, |region, _| {
            self.calc_region(sel, section, region);
        });
    }

    /// Walk the blocks of one region over the stride's steps and packs
    fn calc_region(&self, sel: Option<usize>, section: MpiSection, region_base: &ScanIndices) {
        let g = &self.sol.geom;
        trace!(
            "calc_region: [{} ... {})",
            region_base.start,
            region_base.stop
        );
        let mut region_idxs = region_base.clone();
        region_idxs.init_from_outer(region_base);

        let begin_t = region_idxs.begin[0];
        let end_t = region_idxs.end[0];
        let step_dir: Idx = if end_t >= begin_t { 1 } else { -1 };
        let stride_t = g.tb_steps.max(1) * step_dir;
        let num_t = ceil_div((end_t - begin_t).abs(), stride_t.abs());
        let posns = self.domain_posns();
        let pool = self.sol.region_pool.as_deref();

        let mut region_shift_num: Idx = 0;
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * stride_t;
            let stop_t = if stride_t > 0 {
                (start_t + stride_t).min(end_t)
            } else {
                (start_t + stride_t).max(end_t)
            };
            region_idxs.index[0] = index_t;
            region_idxs.start[0] = start_t;
            region_idxs.stop[0] = stop_t;

            if g.tb_steps == 0 {
                // One pack at a time; each pack shifts the region.
                for pi in 0..self.sol.packs.len() {
                    if sel.is_some_and(|s| s != pi) {
                        continue;
                    }
                    if !self.sol.pack_in_valid_step(pi, start_t) {
                        continue;
                    }
                    let settings = &self.sol.packs[pi].settings;
                    for &i in &posns {
                        region_idxs.stride[i] = settings.block_sizes.vals()[i];
                        region_idxs.group_size[i] = settings.block_group_sizes.vals()[i];
                    }
                    region_idxs.stride[0] = stride_t;

                    let ok = self.shift_region(
                        &region_base.start,
                        &region_base.stop,
                        region_shift_num,
                        Some(pi),
                        section,
                        &mut region_idxs,
                    );
                    // A block covering the whole region takes one stride.
                    for &i in &posns {
                        if settings.block_sizes.vals()[i] >= settings.region_sizes.vals()[i] {
                            region_idxs.stride[i] = region_idxs.end[i] - region_idxs.begin[i];
                        }
                    }
                    if ok {
                        scan(
                            &region_idxs,
                            &posns,
                            self.mods(false),
                            pool,
                            |block, _| {
                                self.calc_block(
                                    Some(pi),
                                    section,
                                    region_shift_num,
                                    1,
                                    0,
                                    region_base,
                                    &region_idxs,
                                    block,
                                );
                            },
                        );
                    }
                    region_shift_num += 1;
                }
            } else {
                // Temporal blocking: all packs run inside the blocks; the
                // n+1 phases tessellate space, with a barrier after each.
                let settings = &self.sol.settings;
                for &i in &posns {
                    region_idxs.stride[i] = settings.block_sizes.vals()[i];
                    region_idxs.group_size[i] = settings.block_group_sizes.vals()[i];
                }
                region_idxs.stride[0] = stride_t;

                let ok = self.shift_region(
                    &region_base.start,
                    &region_base.stop,
                    region_shift_num,
                    None,
                    section,
                    &mut region_idxs,
                );
                debug_assert!(ok, "unclamped region shift cannot be empty");
                for &i in &posns {
                    if settings.block_sizes.vals()[i] >= settings.region_sizes.vals()[i] {
                        region_idxs.stride[i] = region_idxs.end[i] - region_idxs.begin[i];
                    }
                }

                let nphases = self.dims().ndd() as Idx + 1;
                for phase in 0..nphases {
                    // The pool barrier between scans separates the phases.
                    scan(
                        &region_idxs,
                        &posns,
                        self.mods(false),
                        pool,
                        |block, _| {
                            self.calc_block(
                                None,
                                section,
                                region_shift_num,
                                nphases,
                                phase,
                                region_base,
                                &region_idxs,
                                block,
                            );
                        },
                    );
                }

                // Account the shifts the packs consumed in this stride.
                let mut t = start_t;
                while t != stop_t {
                    for pi in 0..self.sol.packs.len() {
                        if self.sol.pack_in_valid_step(pi, t) {
                            region_shift_num += 1;
                        }
                    }
                    t += step_dir;
                }
            }
        }
    }

    /// Walk the mini-blocks of one block (or of one TB phase's shapes)
    #[allow(clippy::too_many_arguments)]
    fn calc_block(
        &self,
        sel: Option<usize>,
        section: MpiSection,
        region_shift_num: Idx,
        nphases: Idx,
        phase: Idx,
        region_base: &ScanIndices,
        region_idxs: &ScanIndices,
        block_base: &ScanIndices,
    ) {
        let g = &self.sol.geom;
        let rth = rayon::current_thread_index().unwrap_or(0);
        trace!(
            "calc_block: phase {phase}, [{} ... {}) by region thread {rth}",
            block_base.start,
            block_base.stop
        );
        let mut block_idxs = block_base.clone();
        block_idxs.init_from_outer(block_base);
        let begin_t = block_idxs.begin[0];
        let end_t = block_idxs.end[0];
        let step_dir: Idx = if end_t >= begin_t { 1 } else { -1 };
        let posns = self.domain_posns();

        if g.tb_steps == 0 {
            let pi = sel.expect("pack selected when not temporal blocking");
            let settings = &self.sol.packs[pi].settings;
            block_idxs.index[0] = 0;
            block_idxs.start[0] = begin_t;
            block_idxs.stop[0] = end_t;
            for &i in &posns {
                block_idxs.stride[i] = settings.mini_block_sizes.vals()[i];
                block_idxs.group_size[i] = settings.mini_block_group_sizes.vals()[i];
            }
            block_idxs.stride[0] = step_dir;

            let bridge_mask = vec![false; self.dims().ndd()];
            scan(&block_idxs, &posns, self.mods(false), None, |mb, _| {
                self.calc_mini_block(
                    rth,
                    sel,
                    section,
                    region_shift_num,
                    nphases,
                    phase,
                    &bridge_mask,
                    region_base,
                    region_idxs,
                    block_base,
                    &block_idxs,
                    mb,
                );
            });
        } else {
            // Bridge shapes: phase k bridges every k-combination of dims.
            let ndd = self.dims().ndd();
            let settings = &self.sol.settings;
            block_idxs.index[0] = 0;
            block_idxs.start[0] = begin_t;
            block_idxs.stop[0] = end_t;
            for &i in &posns {
                block_idxs.stride[i] = settings.mini_block_sizes.vals()[i];
                block_idxs.group_size[i] = settings.mini_block_group_sizes.vals()[i];
            }
            block_idxs.stride[0] = step_dir;

            // Shapes can reach into the next block, so the scanned span
            // is widened by this block's width; each mini-block is
            // trimmed back to its active shape per step.
            let mut adj_block_idxs = block_idxs.clone();
            for &i in &posns {
                let width = block_base.stop[i] - block_base.start[i];
                adj_block_idxs.end[i] += width;
                if settings.mini_block_sizes.vals()[i] >= settings.block_sizes.vals()[i] {
                    adj_block_idxs.stride[i] = adj_block_idxs.end[i] - adj_block_idxs.begin[i];
                }
            }

            let shapes = combinations(ndd, phase as usize);
            for dims_to_bridge in &shapes {
                let mut bridge_mask = vec![false; ndd];
                for &d in dims_to_bridge {
                    bridge_mask[d] = true;
                }
                scan(&adj_block_idxs, &posns, self.mods(false), None, |mb, _| {
                    self.calc_mini_block(
                        rth,
                        None,
                        section,
                        region_shift_num,
                        nphases,
                        phase,
                        &bridge_mask,
                        region_base,
                        region_idxs,
                        block_base,
                        &adj_block_idxs,
                        mb,
                    );
                });
            }
        }
    }

    /// Evaluate every pack and step of one mini-block window
    #[allow(clippy::too_many_arguments)]
    fn calc_mini_block(
        &self,
        rth: usize,
        sel: Option<usize>,
        section: MpiSection,
        region_shift_num: Idx,
        nphases: Idx,
        phase: Idx,
        bridge_mask: &[bool],
        region_base: &ScanIndices,
        region_idxs: &ScanIndices,
        block_base: &ScanIndices,
        adj_block_idxs: &ScanIndices,
        mb_window: &ScanIndices,
    ) {
        // Keep messages moving while the interior computes.
        if section == MpiSection::Interior && rth == 0 {
            if let Some(halo) = &self.sol.halo {
                halo.poke(&*self.sol.env.comm);
            }
        }

        let mut mini_block_idxs = mb_window.clone();
        mini_block_idxs.init_from_outer(mb_window);
        let begin_t = mini_block_idxs.begin[0];
        let end_t = mini_block_idxs.end[0];
        let step_dir: Idx = if end_t >= begin_t { 1 } else { -1 };
        let num_t = (end_t - begin_t).abs();
        let posns = self.domain_posns();

        let mut shift_num: Idx = 0;
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * step_dir;
            let stop_t = start_t + step_dir;
            mini_block_idxs.index[0] = index_t;
            mini_block_idxs.begin[0] = start_t;
            mini_block_idxs.end[0] = stop_t;
            mini_block_idxs.start[0] = start_t;
            mini_block_idxs.stop[0] = stop_t;

            for pi in 0..self.sol.packs.len() {
                if sel.is_some_and(|s| s != pi) {
                    continue;
                }
                if !self.sol.pack_in_valid_step(pi, start_t) {
                    continue;
                }
                let settings = &self.sol.packs[pi].settings;
                for &i in &posns {
                    mini_block_idxs.stride[i] = settings.sub_block_sizes.vals()[i];
                    mini_block_idxs.group_size[i] = settings.sub_block_group_sizes.vals()[i];
                }
                mini_block_idxs.stride[0] = step_dir;

                let ok = self.shift_region(
                    &region_base.start,
                    &region_base.stop,
                    region_shift_num + shift_num,
                    Some(pi),
                    section,
                    &mut mini_block_idxs,
                ) && self.shift_mini_block(
                    &mb_window.start,
                    &mb_window.stop,
                    &adj_block_idxs.begin,
                    &adj_block_idxs.end,
                    &block_base.start,
                    &block_base.stop,
                    &region_idxs.begin,
                    &region_idxs.end,
                    shift_num,
                    nphases,
                    phase,
                    bridge_mask,
                    &mut mini_block_idxs,
                );

                if ok {
                    self.eval_pack_mini_block(rth, pi, &mini_block_idxs);
                }
                shift_num += 1;
            }
        }
    }

    /// Evaluate each bundle of a pack over a trimmed mini-block window
    fn eval_pack_mini_block(&self, rth: usize, pi: usize, mini_block_idxs: &ScanIndices) {
        let layout = self.sol.layout.as_ref().expect("prepared");
        let fold = self.sol.dims.fold_pts();
        let cluster = self.sol.dims.cluster_pts();

        // Position this thread's scratch vars under the mini-block.
        let mut guards = self.sol.lock_scratch(rth);
        position_scratch(
            &mut guards,
            &mini_block_idxs.begin,
            &layout.rank_offsets,
            &self.sol.dims,
        );
        let scratch_refs: Vec<&Var> = guards.iter().map(|g| &**g).collect();
        let ctx = EvalCtx {
            store: &self.sol.store,
            scratch: &scratch_refs,
            rank_offsets: &layout.rank_offsets,
            fold_pts: fold,
            cluster_pts: &cluster,
        };

        for &bi in &self.sol.packs[pi].bundles {
            self.bundle_calc_mini_block(rth, pi, bi, &ctx, mini_block_idxs);
        }
    }

    /// Trim to the bundle's boxes and fan sub-blocks over block threads
    fn bundle_calc_mini_block(
        &self,
        rth: usize,
        pi: usize,
        bi: usize,
        ctx: &EvalCtx<'_>,
        mini_block_idxs: &ScanIndices,
    ) {
        let bbs = &self.sol.bundle_bbs[bi];
        if bbs.outer.num_points == 0 {
            return;
        }
        let settings = &self.sol.packs[pi].settings;
        let posns = self.domain_posns();

        for bb in &bbs.list {
            // Intersect this solid box with the mini-block window.
            let mut mb_idxs = mini_block_idxs.clone();
            let mut ok = true;
            for (j, &i) in posns.iter().enumerate() {
                let b = mb_idxs.begin[i].max(bb.begin[j]);
                let e = mb_idxs.end[i].min(bb.end[j]);
                if e <= b {
                    ok = false;
                    break;
                }
                mb_idxs.begin[i] = b;
                mb_idxs.end[i] = e;
                mb_idxs.start[i] = b;
                mb_idxs.stop[i] = e;
            }
            if !ok {
                continue;
            }

            // Scratch prerequisites, then the bundle itself.
            let mut reqd = self.sol.bundles[bi].scratch_children();
            reqd.push(bi);
            for sg in reqd {
                let bundle = &self.sol.bundles[sg];
                let mut adj_idxs = mb_idxs.clone();
                if bundle.is_scratch() {
                    // A scratch bundle writes a haloed superset of the
                    // consumer's span.
                    let mut b = Indices(posns.iter().map(|&i| mb_idxs.begin[i]).collect());
                    let mut e = Indices(posns.iter().map(|&i| mb_idxs.end[i]).collect());
                    expand_for_scratch(bundle.as_ref(), ctx, &self.sol.dims, &mut b, &mut e);
                    for (j, &i) in posns.iter().enumerate() {
                        adj_idxs.begin[i] = b[j];
                        adj_idxs.end[i] = e[j];
                        adj_idxs.start[i] = b[j];
                        adj_idxs.stop[i] = e[j];
                    }
                }

                self.sub_block_dispatch(rth, settings, bundle.as_ref(), ctx, &adj_idxs);
            }
        }
    }

    /// Run the sub-block loops of one bundle on the block threads
    fn sub_block_dispatch(
        &self,
        rth: usize,
        settings: &crate::settings::Settings,
        bundle: &dyn crate::bundle::Bundle,
        ctx: &EvalCtx<'_>,
        mb_idxs: &ScanIndices,
    ) {
        let posns = self.domain_posns();
        let nbt = self
            .sol
            .block_pool
            .as_ref()
            .map_or(1, |p| p.current_num_threads());
        let bind = settings.bind_block_threads && nbt > 1;
        let bind_posn = settings.bind_posn;
        let bind_slab = settings.sub_block_sizes.vals()[bind_posn].max(1);

        let mut sub_idxs = mb_idxs.clone();
        for &i in &posns {
            // A sub-block that covers its mini-block needs no inner cut;
            // under binding, only the binding dim is cut into slabs.
            let covers =
                settings.sub_block_sizes.vals()[i] >= settings.mini_block_sizes.vals()[i];
            if bind && i == bind_posn {
                sub_idxs.stride[i] = bind_slab;
                sub_idxs.align[i] = bind_slab;
            } else if covers || bind {
                sub_idxs.stride[i] = sub_idxs.end[i] - sub_idxs.begin[i];
            }
        }

        match (&self.sol.block_pool, bind) {
            (Some(pool), true) => {
                // All block threads walk the same slabs; each executes
                // only those the binding function assigns to it, so the
                // same thread touches the same slab across packs.
                pool.install(|| {
                    use rayon::prelude::*;
                    (0..nbt).into_par_iter().for_each(|bth| {
                        scan(&sub_idxs, &posns, ScanMods::default(), None, |sb, _| {
                            const IDX_OFS: Idx = 0x1000;
                            let slab_idx = div_flr(sb.start[bind_posn] + IDX_OFS, bind_slab);
                            let owner = mod_flr(slab_idx, nbt as Idx) as usize;
                            if owner == bth {
                                self.calc_sub_block(bundle, ctx, rth, bth, sb);
                            }
                        });
                    });
                });
            }
            (Some(pool), false) => {
                scan(&sub_idxs, &posns, self.mods(true), Some(pool), |sb, _| {
                    let bth = rayon::current_thread_index().unwrap_or(0);
                    self.calc_sub_block(bundle, ctx, rth, bth, sb);
                });
            }
            (None, _) => {
                scan(&sub_idxs, &posns, self.mods(true), None, |sb, _| {
                    self.calc_sub_block(bundle, ctx, rth, 0, sb);
                });
            }
        }
    }

    /// Split one sub-block into clusters, masked vectors and scalars
    fn calc_sub_block(
        &self,
        bundle: &dyn crate::bundle::Bundle,
        ctx: &EvalCtx<'_>,
        rth: usize,
        bth: usize,
        idxs: &ScanIndices,
    ) {
        trace!(
            "calc_sub_block('{}'): [{} ... {})",
            bundle.name(),
            idxs.start,
            idxs.stop
        );
        if self.sol.settings.force_scalar {
            self.calc_sub_block_scalar(bundle, ctx, rth, idxs);
            return;
        }

        let dims = self.dims();
        let ndd = dims.ndd();
        let nsd = dims.nsd();
        let fold = dims.fold_pts();
        let cluster = dims.cluster_pts();
        let rofs = ctx.rank_offsets;
        let inner = nsd - 1;

        // Per-dim ranges in rank-relative elements.
        let mut ebgn = Indices::new(0, ndd);
        let mut eend = Indices::new(0, ndd);
        let mut fcbgn = Indices::new(0, ndd);
        let mut fcend = Indices::new(0, ndd);
        let mut vbgn = Indices::new(0, ndd);
        let mut vend = Indices::new(0, ndd);
        let mut peel_masks = vec![WriteMask::MAX; ndd];
        let mut rem_masks = vec![WriteMask::MAX; ndd];
        let fold_size = dims.fold_size();
        let full_mask: WriteMask = if fold_size >= 64 {
            WriteMask::MAX
        } else {
            (1u64 << fold_size) - 1
        };

        let mut do_clusters = true;
        let mut do_vectors = false;
        let mut do_scalars = false;

        for j in 0..ndd {
            let i = DimSet::soln_posn(j);
            let eb = idxs.start[i] - rofs[j];
            let ee = idxs.stop[i] - rofs[j];
            ebgn[j] = eb;
            eend[j] = ee;

            let cp = cluster[j];
            let fcb = round_up_flr(eb, cp);
            let fce = round_down_flr(ee, cp);
            fcbgn[j] = fcb;
            fcend[j] = fce;
            if fce <= fcb {
                do_clusters = false;
            }

            if fcb > eb || fce < ee {
                let vp = fold[j];
                if i == inner {
                    // Leftovers in the inner dim go to scalars.
                    vbgn[j] = fcb;
                    vend[j] = fce;
                    if eb < fcb || ee > fce {
                        do_scalars = true;
                    }
                } else {
                    let vb = round_down_flr(eb, vp);
                    let ve = round_up_flr(ee, vp);
                    vbgn[j] = vb;
                    vend[j] = ve;
                    if vb < fcb || ve > fce {
                        do_vectors = true;
                    }
                    // Per-dim masks excluding elements before eb / at or
                    // after ee inside a straddling vector.
                    let (pm, rm) = fold_masks(fold, j, vb, eb, round_down_flr(ee, vp), ee);
                    peel_masks[j] = pm;
                    rem_masks[j] = rm;
                }
            } else {
                vbgn[j] = fcb;
                vend[j] = fce;
            }
        }

        let t = idxs.start[0];

        // Whole clusters: the optimised inner kernels.
        if do_clusters {
            let mut start = Indices::new(0, nsd);
            start[0] = t;
            let stop_inner = fcend[ndd - 1] + rofs[ndd - 1];
            sweep_outer(&fcbgn, &fcend, &cluster, ndd - 1, |outer| {
                for j in 0..ndd - 1 {
                    start[DimSet::soln_posn(j)] = outer[j] + rofs[j];
                }
                start[inner] = fcbgn[ndd - 1] + rofs[ndd - 1];
                bundle.calc_loop_of_clusters(ctx, rth, bth, &start, stop_inner);
            });
        }

        // Peel and remainder vectors around the cluster core.
        if do_vectors {
            let mut start = Indices::new(0, nsd);
            start[0] = t;
            sweep_outer(&vbgn, &vend, fold, ndd, |vec_pt| {
                // Skip vectors fully covered by the cluster core.
                let in_core = (0..ndd).all(|j| {
                    vec_pt[j] >= fcbgn[j] && vec_pt[j] + fold[j] <= fcend[j]
                });
                if in_core {
                    return;
                }
                let mut mask = full_mask;
                for j in 0..ndd {
                    if vec_pt[j] < ebgn[j] {
                        mask &= peel_masks[j];
                    }
                    if vec_pt[j] + fold[j] > eend[j] {
                        mask &= rem_masks[j];
                    }
                }
                if mask == 0 {
                    return;
                }
                for j in 0..ndd {
                    start[DimSet::soln_posn(j)] = vec_pt[j] + rofs[j];
                }
                let stop_inner = start[inner] + fold[ndd - 1];
                bundle.calc_loop_of_vectors(ctx, rth, bth, &start, stop_inner, mask);
            });
        }

        // Scalar strips left over in the inner dim.
        if do_scalars {
            let mut strip = |lo: Idx, hi: Idx| {
                if hi <= lo {
                    return;
                }
                let mut s = idxs.clone();
                s.start[inner] = lo + rofs[ndd - 1];
                s.stop[inner] = hi + rofs[ndd - 1];
                self.calc_sub_block_scalar(bundle, ctx, rth, &s);
            };
            let (ib, ie) = (ebgn[ndd - 1], eend[ndd - 1]);
            let (cb, ce) = (fcbgn[ndd - 1], fcend[ndd - 1]);
            if ce <= cb {
                // No cluster core in the inner dim: one strip covers all.
                strip(ib, ie);
            } else {
                strip(ib, cb);
                strip(ce, ie);
            }
        }
    }

    /// Pure scalar evaluation of one window
    fn calc_sub_block_scalar(
        &self,
        bundle: &dyn crate::bundle::Bundle,
        ctx: &EvalCtx<'_>,
        rth: usize,
        idxs: &ScanIndices,
    ) {
        let nsd = idxs.ndims();
        let masked = bundle.is_sub_domain_expr();
        let mut pt = idxs.start.clone();
        if (1..nsd).any(|d| idxs.stop[d] <= idxs.start[d]) {
            return;
        }
        loop {
            if !masked || bundle.is_in_valid_domain(ctx, &pt) {
                bundle.calc_scalar(ctx, rth, &pt);
            }
            let mut d = nsd - 1;
            loop {
                pt[d] += 1;
                if pt[d] < idxs.stop[d] {
                    break;
                }
                pt[d] = idxs.start[d];
                if d == 1 {
                    return;
                }
                d -= 1;
            }
        }
    }

    /// Shift a region window left by the wave-front angle and trim it
    ///
    /// Mirrors the region-level dependency rule: a window at shift s+1
    /// reads only points written at shift s. Trimming applies the pack
    /// boxes, the wave-front extensions and the active overlap section;
    /// with no pack selected only the shift is applied.
    #[allow(clippy::too_many_arguments)]
    fn shift_region(
        &self,
        base_start: &Indices,
        base_stop: &Indices,
        shift_num: Idx,
        pack: Option<usize>,
        section: MpiSection,
        idxs: &mut ScanIndices,
    ) -> bool {
        let g = &self.sol.geom;
        let mut ok = true;
        for j in 0..self.dims().ndd() {
            let i = DimSet::soln_posn(j);
            let angle = g.wf_angles[j];
            let shift_amt = angle * shift_num;

            // Regions only shift left as time advances.
            let mut rstart = base_start[i] - shift_amt;
            let mut rstop = base_stop[i] - shift_amt;

            if let Some(pi) = pack {
                let pbb = &self.sol.pack_bbs[pi];
                rstart = rstart.max(pbb.begin[j]);
                rstop = rstop.min(pbb.end[j]);

                let dbegin = g.rank_bb.begin[j];
                let dend = g.rank_bb.end[j];

                // Wave-front extensions narrow as the shift grows.
                if rstart < dbegin && g.left_wf_exts[j] > 0 {
                    rstart = rstart.max(dbegin - g.left_wf_exts[j] + shift_amt);
                }
                if rstop > dend && g.right_wf_exts[j] > 0 {
                    rstop = rstop.min(dend + g.right_wf_exts[j] - shift_amt);
                }

                // Restrict to the active overlap section.
                if section != MpiSection::All {
                    let mut int_begin = g.mpi_interior.begin[j];
                    let mut int_end = g.mpi_interior.end[j];
                    if g.wf_steps > 0 {
                        // Exterior shapes are trapezoids in time; the
                        // interior is the inverted trapezoid between
                        // them.
                        if self.sol.exterior_exists(j, true) {
                            int_begin += g.wf_shift_pts[j] - shift_amt;
                        }
                        if self.sol.exterior_exists(j, false) {
                            int_end -= g.wf_shift_pts[j] - shift_amt;
                        }
                    }
                    match section {
                        MpiSection::Interior => {
                            rstart = rstart.max(int_begin);
                            rstop = rstop.min(int_end);
                        }
                        MpiSection::Exterior { dim, left } => {
                            if !self.sol.exterior_exists(dim, left) {
                                ok = false;
                                break;
                            }
                            if j == dim {
                                if left {
                                    rstop = rstop.min(int_begin);
                                } else {
                                    // Trim to avoid overlapping the left
                                    // exterior of a narrow rank.
                                    rstart = rstart.max(int_end).max(int_begin);
                                }
                            }
                            // Slabs of earlier dims were already done.
                            if j < dim {
                                rstart = rstart.max(int_begin);
                                rstop = rstop.min(int_end);
                            }
                        }
                        MpiSection::All => {}
                    }
                }

                if rstop <= rstart {
                    ok = false;
                    break;
                }
            }
            idxs.begin[i] = rstart;
            idxs.end[i] = rstop;
        }
        trace!(
            "shift_region: shift {shift_num} -> [{} ... {}) {}",
            idxs.begin,
            idxs.end,
            if ok { "" } else { "(empty)" }
        );
        ok
    }

    /// Trim one mini-block to the trapezoid/bridge shape of this phase
    #[allow(clippy::too_many_arguments)]
    fn shift_mini_block(
        &self,
        mb_base_start: &Indices,
        mb_base_stop: &Indices,
        adj_block_base_start: &Indices,
        adj_block_base_stop: &Indices,
        block_base_start: &Indices,
        block_base_stop: &Indices,
        region_base_start: &Indices,
        region_base_stop: &Indices,
        mb_shift_num: Idx,
        nphases: Idx,
        phase: Idx,
        bridge_mask: &[bool],
        idxs: &mut ScanIndices,
    ) -> bool {
        let g = &self.sol.geom;
        let mut ok = true;
        for j in 0..self.dims().ndd() {
            let i = DimSet::soln_posn(j);
            let tb_angle = g.tb_angles[j];

            let is_first_blk = block_base_start[i] <= region_base_start[i];
            let is_last_blk = block_base_stop[i] >= region_base_stop[i];
            let is_one_blk = is_first_blk && is_last_blk;

            // Base of the phase-0 trapezoid.
            let mut blk_start = block_base_start[i];
            let mut blk_stop = block_base_stop[i];
            if nphases > 1 && !is_one_blk {
                blk_stop = (blk_start + g.tb_widths[j]).min(block_base_stop[i]);
            }
            // Start of the next block, for bridge shapes.
            let mut next_blk_start = block_base_stop[i];

            // Narrow the shape by the angle per consumed shift; clamp
            // the first and last blocks to the region.
            blk_start += tb_angle * mb_shift_num;
            if is_first_blk {
                blk_start = idxs.begin[i];
            }
            blk_stop -= tb_angle * mb_shift_num;
            if (nphases == 1 || is_one_blk) && is_last_blk {
                blk_stop = idxs.end[i];
            }
            next_blk_start += tb_angle * mb_shift_num;
            if is_last_blk {
                next_blk_start = idxs.end[i];
            }

            // This phase's shape: the base trapezoid, or the bridge from
            // its right side to the next block's left side.
            let mut shape_start = blk_start;
            let mut shape_stop = blk_stop;
            if phase > 0 && bridge_mask[j] {
                shape_start = blk_stop.max(blk_start);
                shape_stop = next_blk_start;
            }
            if shape_stop <= shape_start {
                ok = false;
                break;
            }

            // Mini-blocks wave-front within the shape.
            let is_first_mb = mb_base_start[i] <= adj_block_base_start[i];
            let is_last_mb = mb_base_stop[i] >= adj_block_base_stop[i];
            let is_one_mb = is_first_mb && is_last_mb;

            let mut mb_start = mb_base_start[i];
            let mut mb_stop = mb_base_stop[i];
            if !is_one_mb {
                let mb_angle = g.mb_angles[j];
                mb_start -= mb_angle * mb_shift_num;
                mb_stop -= mb_angle * mb_shift_num;
            }
            if is_first_mb {
                mb_start = shape_start;
            }
            if is_last_mb {
                mb_stop = shape_stop;
            }

            // Clamp to the (already region-trimmed) window and the shape.
            mb_start = mb_start.max(idxs.begin[i]).max(shape_start);
            mb_stop = mb_stop.min(idxs.end[i]).min(shape_stop);

            idxs.begin[i] = mb_start;
            idxs.end[i] = mb_stop;
            idxs.start[i] = mb_start;
            idxs.stop[i] = mb_stop;
            if mb_stop <= mb_start {
                ok = false;
                break;
            }
        }
        ok
    }
}

/// Enumerate all `k`-combinations of `0..n`
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    if k > n {
        return vec![];
    }
    if k == 0 {
        return vec![vec![]];
    }
    let mut out = Vec::new();
    let mut combo: Vec<usize> = (0..k).collect();
    loop {
        out.push(combo.clone());
        // Advance the rightmost index that can still move.
        let mut d = k;
        loop {
            if d == 0 {
                return out;
            }
            d -= 1;
            combo[d] += 1;
            if combo[d] <= n - (k - d) {
                for x in d + 1..k {
                    combo[x] = combo[x - 1] + 1;
                }
                break;
            }
        }
    }
}

/// Per-dim peel/remainder masks of a straddling vector
///
/// Bit `k` covers fold point `k` (row-major). The peel mask keeps points
/// at or above `ebgn` in a vector based at `vbgn`; the remainder mask
/// keeps points below `eend` in a vector based at `fvend`.
fn fold_masks(fold: &Indices, j: usize, vbgn: Idx, ebgn: Idx, fvend: Idx, eend: Idx) -> (WriteMask, WriteMask) {
    let nf = fold.len();
    let mut pmask: WriteMask = 0;
    let mut rmask: WriteMask = 0;
    let mut k = 0u32;
    let mut ofs = Indices::new(0, nf);
    let total: Idx = fold.product();
    for _ in 0..total {
        if vbgn + ofs[j] >= ebgn {
            pmask |= 1 << k;
        }
        if fvend + ofs[j] < eend {
            rmask |= 1 << k;
        }
        k += 1;
        for d in (0..nf).rev() {
            ofs[d] += 1;
            if ofs[d] < fold[d] {
                break;
            }
            ofs[d] = 0;
        }
    }
    (pmask, rmask)
}

/// Row-major walk of the domain box `[begin, end)` in unit steps
fn sweep_domain(begin: &Indices, end: &Indices, mut f: impl FnMut(&Indices)) {
    let strides = Indices::new(1, begin.len());
    sweep_outer(begin, end, &strides, begin.len(), |pt| f(pt));
}

/// Walk the first `ndims` dims of the box `[begin, end)` with per-dim
/// strides; the remaining dims stay at their begin values
fn sweep_outer(
    begin: &Indices,
    end: &Indices,
    strides: &Indices,
    ndims: usize,
    mut f: impl FnMut(&Indices),
) {
    let mut pt = begin.clone();
    if ndims == 0 {
        f(&pt);
        return;
    }
    if (0..ndims).any(|d| end[d] <= begin[d]) {
        return;
    }
    loop {
        f(&pt);
        let mut d = ndims - 1;
        loop {
            pt[d] += strides[d];
            if pt[d] < end[d] {
                break;
            }
            pt[d] = begin[d];
            if d == 0 {
                return;
            }
            d -= 1;
        }
    }
}

/// Expand a mini-block span by the halos of the scratch vars a scratch
/// bundle writes, rounded up to whole folds
fn expand_for_scratch(
    bundle: &dyn crate::bundle::Bundle,
    ctx: &EvalCtx<'_>,
    dims: &DimSet,
    begin: &mut Indices,
    end: &mut Indices,
) {
    for out in bundle.output_vars() {
        let VarRef::Scratch(slot) = out else { continue };
        let var = ctx.scratch[slot];
        for (j, dname) in dims.domain_dims().iter().enumerate() {
            let Some(p) = var.posn_of(dname) else { continue };
            let vd = var.dim(p);
            let fold = vd.fold_len.max(1);
            begin[j] -= data::round_up(vd.left_halo, fold);
            end[j] += data::round_up(vd.right_halo, fold);
        }
    }
}

/// Position scratch vars under a mini-block: the local offset is the
/// fold-aligned distance from the rank origin to the block begin
fn position_scratch(
    guards: &mut [std::sync::MutexGuard<'_, Var>],
    mb_begin: &Indices,
    rank_offsets: &Indices,
    dims: &DimSet,
) {
    for g in guards.iter_mut() {
        for (j, dname) in dims.domain_dims().iter().enumerate() {
            let Some(p) = g.posn_of(dname) else { continue };
            let begin = if mb_begin.len() == dims.nsd() {
                mb_begin[DimSet::soln_posn(j)]
            } else {
                mb_begin[j]
            };
            let vd = g.dim_mut(p);
            let vlen = vd.fold_len.max(1);
            vd.local_offset = round_down_flr(begin - rank_offsets[j], vlen);
        }
        g.update_alloc_sizes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinations_cover_binomials() {
        assert_eq!(combinations(3, 0), vec![Vec::<usize>::new()]);
        assert_eq!(combinations(3, 1), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(
            combinations(3, 2),
            vec![vec![0, 1], vec![0, 2], vec![1, 2]]
        );
        assert_eq!(combinations(3, 3), vec![vec![0, 1, 2]]);
        assert_eq!(combinations(2, 3), Vec::<Vec<usize>>::new());
    }

    #[test]
    fn fold_mask_bits() {
        // 1-D fold of 4: vector at -2 with valid range starting at 0.
        let fold = Indices(vec![4]);
        let (pm, _) = fold_masks(&fold, 0, -2, 0, 0, 4);
        assert_eq!(pm & 0xF, 0b1100);
        // Remainder: vector at 4, valid below 6.
        let (_, rm) = fold_masks(&fold, 0, 0, 0, 4, 6);
        assert_eq!(rm & 0xF, 0b0011);
    }

    #[test]
    fn sweep_outer_strides() {
        let mut pts = Vec::new();
        sweep_outer(
            &Indices(vec![0, 0]),
            &Indices(vec![4, 6]),
            &Indices(vec![2, 3]),
            2,
            |p| pts.push((p[0], p[1])),
        );
        assert_eq!(pts, vec![(0, 0), (0, 3), (2, 0), (2, 3)]);
    }
}
