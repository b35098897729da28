//! Four-phase halo exchange
//!
//! Per call: (1) post receives for every dirty variable, unless the
//! neighbour is a shared-memory peer; (2) pack and send, or write-release
//! the peer-visible window; (3) wait and unpack; (4) drain sends, then
//! clear the dirty bits of the swapped step window.
//!
//! Under comm/compute overlap the exterior passes run phases 1-2 and the
//! interior pass runs phases 3-4, selected through [`HaloFlags`].

use crate::buffer::{
    attach_shm_window, make_neighbor_bufs, plan_shm_window, HaloBuffer, NeighborBufs, ShmRegion,
};
use comm::{CommError, Communicator, Request};
use data::pool::PoolPlanner;
use data::var::{VarId, VarStore};
use data::{Idx, Precision};
use log::{debug, trace};
use topology::Neighborhood;

/// Which sections of the rank were just computed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HaloFlags {
    pub do_left: bool,
    pub do_right: bool,
    pub do_interior: bool,
}

impl HaloFlags {
    /// Everything at once: the non-overlapped exchange
    pub const ALL: HaloFlags = HaloFlags {
        do_left: true,
        do_right: true,
        do_interior: true,
    };
}

impl Default for HaloFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// Exchange state for one variable
#[derive(Debug)]
struct VarHalo {
    id: VarId,
    /// Stable alphabetical ordinal, used as the message tag
    ord: usize,
    /// Buffer pairs indexed by neighbourhood slot
    bufs: Vec<Option<NeighborBufs>>,
    recv_reqs: Vec<Request>,
    send_reqs: Vec<Request>,
}

/// Counters accumulated across calls
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Completed exchange rounds (phase 4 finishes)
    pub num_exchanges: usize,
    /// Variables swapped, summed over rounds
    pub num_var_swaps: usize,
    /// Elements sent through the transport or a shared window
    pub elems_sent: usize,
}

/// The per-solution halo-exchange engine
#[derive(Debug, Default)]
pub struct HaloEngine {
    per_var: Vec<VarHalo>,
    planner: Option<PoolPlanner>,
    stats: ExchangeStats,
    /// Swap window per engine var: set in phases 1-2, consumed in 3-4
    /// when the overlap split runs them in separate calls
    swap_steps: Vec<Option<(Idx, Idx)>>,
}

impl HaloEngine {
    /// Build buffers for every non-scratch variable against `nbhood`
    ///
    /// Collective: allocates shared windows and barriers so peers can
    /// resolve each other's windows.
    pub fn new(
        store: &VarStore,
        nbhood: &Neighborhood,
        comm: &dyn Communicator,
        use_shm: bool,
        allow_vec: bool,
    ) -> Self {
        let mut per_var = Vec::new();
        let mut planner = PoolPlanner::new();

        for (ord, id, var) in store.ordered() {
            if var.is_scratch() || var.dims().is_empty() {
                continue;
            }
            let mut bufs: Vec<Option<NeighborBufs>> = (0..nbhood.len()).map(|_| None).collect();
            let mut any = false;
            nbhood.visit(|slot, info| {
                if let Some(mut nb) = make_neighbor_bufs(var, info, allow_vec) {
                    if use_shm && nb.shm_rank.is_some() && nb.send.size() > 0 {
                        plan_shm_window(&mut nb.send, &mut planner);
                    }
                    bufs[slot] = Some(nb);
                    any = true;
                }
            });
            if !any {
                continue;
            }
            debug!("var '{}' (tag {ord}) exchanges halos", var.name());
            let n = nbhood.len();
            per_var.push(VarHalo {
                id,
                ord,
                bufs,
                recv_reqs: (0..n).map(|_| Request::Null).collect(),
                send_reqs: (0..n).map(|_| Request::Null).collect(),
            });
        }

        // Allocate and publish shared windows, then resolve the peers'.
        planner.allocate();
        for vh in &mut per_var {
            for (slot, nb) in vh.bufs.iter_mut().enumerate() {
                let Some(nb) = nb else { continue };
                attach_shm_window(&mut nb.send, &planner);
                if let Some(region) = &nb.send.shm {
                    comm.register_shared_window(
                        shm_key(vh.ord, slot),
                        region.padded().clone(),
                    );
                }
            }
        }
        comm.barrier();
        for vh in &mut per_var {
            for (slot, nb) in vh.bufs.iter_mut().enumerate() {
                let Some(nb) = nb else { continue };
                if nb.shm_rank.is_none() || nb.recv.size() == 0 {
                    continue;
                }
                // The peer's send window toward us is registered under the
                // mirrored slot index on the peer's side.
                let mirror = mirror_slot(nbhood, slot);
                nb.peer_shm = comm
                    .peer_shared_window(nb.rank, shm_key(vh.ord, mirror))
                    .map(ShmRegion::new);
            }
        }

        let nvars = per_var.len();
        Self {
            per_var,
            planner: Some(planner),
            stats: ExchangeStats::default(),
            swap_steps: vec![None; nvars],
        }
    }

    pub fn stats(&self) -> ExchangeStats {
        self.stats
    }

    /// Bytes planned for shared windows (observability)
    pub fn planner(&self) -> Option<&PoolPlanner> {
        self.planner.as_ref()
    }

    /// Nudge transport progress on all outstanding requests
    pub fn poke(&self, comm: &dyn Communicator) {
        for vh in &self.per_var {
            for r in vh.recv_reqs.iter().chain(&vh.send_reqs) {
                if !r.is_null() {
                    let _ = comm.test(r);
                }
            }
        }
    }

    /// Exchange dirty halos for all variables and steps
    pub fn exchange(
        &mut self,
        store: &VarStore,
        comm: &dyn Communicator,
        flags: HaloFlags,
    ) -> Result<(), CommError> {
        if comm.num_ranks() < 2 || self.per_var.is_empty() {
            return Ok(());
        }
        trace!(
            "exchange_halos: left={} right={} interior={}",
            flags.do_left,
            flags.do_right,
            flags.do_interior
        );

        // Gather the vars whose halos are stale and their step windows.
        // The posting phases compute the window; the completion phases
        // reuse what the posting phases saw, so a split exchange stays
        // consistent even though dirty bits were re-marked in between.
        if flags.do_left || flags.do_right {
            for (vi, vh) in self.per_var.iter().enumerate() {
                let var = store.get(vh.id);
                let mut window = None;
                if var.step_posn().is_some() {
                    for t in var.first_valid_step()..=var.last_valid_step() {
                        if var.is_dirty(t) {
                            let (first, last) = window.get_or_insert((t, t));
                            *first = (*first).min(t);
                            *last = (*last).max(t);
                        }
                    }
                } else if var.is_dirty(0) {
                    window = Some((0, 0));
                }
                self.swap_steps[vi] = window;
            }
        }

        let nvars_swapped = self.swap_steps.iter().filter(|s| s.is_some()).count();
        trace!("exchange_halos: {nvars_swapped} var(s) to swap");

        // Phase 1: post receives.
        if flags.do_left || flags.do_right {
            for (vi, vh) in self.per_var.iter_mut().enumerate() {
                let Some((first_t, last_t)) = self.swap_steps[vi] else {
                    continue;
                };
                let var = store.get(vh.id);
                let nsteps = last_t - first_t + 1;
                for (slot, nb) in vh.bufs.iter().enumerate() {
                    let Some(nb) = nb else { continue };
                    if nb.peer_shm.is_some() {
                        continue; // read the peer's window directly
                    }
                    let nelems = nb.recv.size_for_steps(nsteps, var.step_posn()) as usize;
                    if nelems > 0 {
                        vh.recv_reqs[slot] = comm.irecv(nb.rank, vh.ord as u64, nelems)?;
                    }
                }
            }
        }

        // Phase 2: pack and send (or write-release the shared window).
        if flags.do_left || flags.do_right {
            for (vi, vh) in self.per_var.iter_mut().enumerate() {
                let Some((first_t, last_t)) = self.swap_steps[vi] else {
                    continue;
                };
                let var = store.get(vh.id);
                for (slot, nb) in vh.bufs.iter_mut().enumerate() {
                    let Some(nb) = nb else { continue };
                    if nb.send.size() == 0 {
                        continue;
                    }
                    let (first, last) =
                        step_bounds(&nb.send, var.step_posn(), first_t, last_t);
                    let mut payload =
                        vec![0.0 as Precision; range_len(&first, &last)];
                    let packed = if nb.send.vec_copy_ok {
                        var.get_vecs_in_slice(&mut payload, &first, &last)
                    } else {
                        var.get_elements_in_slice(&mut payload, &first, &last)
                    }
                    .map_err(|e| CommError::PointToPoint(format!("pack failed: {e}")))?;
                    trace!(
                        "exchange_halos: packed {packed} elems of '{}' for rank {}",
                        var.name(),
                        nb.rank
                    );
                    self.stats.elems_sent += packed;
                    if let Some(region) = &nb.send.shm {
                        let lock = region.lock();
                        lock.wait_for_ok_to_write(|| {});
                        let window = region.payload();
                        for (i, &v) in payload.iter().enumerate() {
                            window.set(i, v);
                        }
                        lock.mark_write_done();
                    } else {
                        vh.send_reqs[slot] = comm.isend(nb.rank, vh.ord as u64, payload)?;
                    }
                }
            }
        }

        // Phase 3: wait for and unpack receives.
        if flags.do_interior {
            for (vi, vh) in self.per_var.iter_mut().enumerate() {
                let Some((first_t, last_t)) = self.swap_steps[vi] else {
                    continue;
                };
                let var = store.get(vh.id);
                for (slot, nb) in vh.bufs.iter_mut().enumerate() {
                    let Some(nb) = nb else { continue };
                    if nb.recv.size() == 0 {
                        continue;
                    }
                    let (first, last) =
                        step_bounds(&nb.recv, var.step_posn(), first_t, last_t);
                    let payload = if let Some(peer) = &nb.peer_shm {
                        let lock = peer.lock();
                        lock.wait_for_ok_to_read(|| self_poke(comm, &vh.recv_reqs));
                        let window = peer.payload();
                        let n = range_len(&first, &last);
                        let mut data = vec![0.0 as Precision; n];
                        for (i, v) in data.iter_mut().enumerate() {
                            *v = window.get(i);
                        }
                        lock.mark_read_done();
                        data
                    } else {
                        if vh.recv_reqs[slot].is_null() {
                            continue;
                        }
                        comm.wait_recv(&mut vh.recv_reqs[slot])?
                    };
                    let unpacked = if nb.recv.vec_copy_ok {
                        var.set_vecs_in_slice(&payload, &first, &last)
                    } else {
                        var.set_elements_in_slice(&payload, &first, &last)
                    }
                    .map_err(|e| CommError::PointToPoint(format!("unpack failed: {e}")))?;
                    trace!(
                        "exchange_halos: unpacked {unpacked} elems of '{}' from rank {}",
                        var.name(),
                        nb.rank
                    );
                }
            }
        }

        // Phase 4: drain sends, then mark the swapped windows clean.
        if flags.do_interior {
            let mut any_swapped = false;
            for (vi, vh) in self.per_var.iter_mut().enumerate() {
                let Some((first_t, last_t)) = self.swap_steps[vi].take() else {
                    continue;
                };
                for req in &mut vh.send_reqs {
                    if !req.is_null() {
                        comm.wait_send(req)?;
                    }
                }
                let var = store.get(vh.id);
                for t in first_t..=last_t {
                    if var.is_dirty(t) {
                        var.set_dirty(false, t);
                        trace!(
                            "exchange_halos: var '{}' clean at step {t}",
                            var.name()
                        );
                    }
                }
                self.stats.num_var_swaps += 1;
                any_swapped = true;
            }
            if any_swapped {
                self.stats.num_exchanges += 1;
            }
        }

        Ok(())
    }
}

/// Poke outstanding receive requests while spinning on a lock
fn self_poke(comm: &dyn Communicator, reqs: &[Request]) {
    for r in reqs {
        if !r.is_null() {
            let _ = comm.test(r);
        }
    }
}

/// Replace the placeholder step range of a buffer with the actual window
fn step_bounds(
    buf: &HaloBuffer,
    step_posn: Option<usize>,
    first_t: Idx,
    last_t: Idx,
) -> (Vec<Idx>, Vec<Idx>) {
    let mut first = buf.begin_pt.clone();
    let mut last = buf.last_pt.clone();
    if let Some(sp) = step_posn {
        first[sp] = first_t;
        last[sp] = last_t;
    }
    (first, last)
}

fn range_len(first: &[Idx], last: &[Idx]) -> usize {
    first
        .iter()
        .zip(last)
        .map(|(&f, &l)| (l - f + 1).max(0) as usize)
        .product()
}

/// Key under which a rank registers the shared window of (var, slot)
fn shm_key(ord: usize, slot: usize) -> u64 {
    ((ord as u64) << 16) | slot as u64
}

/// Slot index of me in the peer's neighbourhood: offsets are mirrored
fn mirror_slot(nbhood: &Neighborhood, slot: usize) -> usize {
    let Some(info) = nbhood.get(slot) else {
        return slot;
    };
    let mirrored = data::idx::Indices(info.offsets.0.iter().map(|&o| 2 - o).collect());
    nbhood.index_of(&mirrored)
}
