//! Halo buffer layout
//!
//! For every (variable, neighbour, direction) pair a buffer shape is
//! derived from the variable's halos, wave-front extensions and the
//! neighbour's position: dims in which the neighbour lies get the halo
//! width (rounded up to the vector fold when vector copies are possible),
//! the remaining domain dims get the full rank extent, the step dim gets
//! the whole live window and misc dims their full size.
//!
//! Wire payloads are owned vectors handed to the transport, so buffer
//! storage is only materialised on the shared-memory path, where the
//! window has to outlive individual calls and embeds the handshake lock
//! in its alignment pad.

use comm::lock::ShmLock;
use data::dims::DimKind;
use data::idx::IdxTuple;
use data::pool::{PoolKey, PoolPlanner, PoolTicket, Storage, LOCK_PAD_ELEMS};
use data::var::Var;
use data::{mod_flr, round_up, Idx};
use topology::{NeighborInfo, OFS_NEXT, OFS_PREV};

/// Buffer direction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufDir {
    Send,
    Recv,
}

/// Shared window of one buffer: lock word in the pad, payload after it
#[derive(Clone, Debug)]
pub struct ShmRegion {
    padded: Storage,
}

impl ShmRegion {
    pub fn new(padded: Storage) -> Self {
        assert!(padded.len() >= LOCK_PAD_ELEMS);
        Self { padded }
    }

    pub fn lock(&self) -> ShmLock<'_> {
        ShmLock::new(self.padded.raw_cell(0))
    }

    pub fn payload(&self) -> Storage {
        self.padded
            .slice(LOCK_PAD_ELEMS, self.padded.len() - LOCK_PAD_ELEMS)
    }

    pub fn padded(&self) -> &Storage {
        &self.padded
    }
}

/// One send or receive buffer for one (variable, neighbour) pair
#[derive(Clone, Debug)]
pub struct HaloBuffer {
    pub name: String,

    /// First point to copy, per variable dim; the step entry is a
    /// placeholder overwritten with the actual swapped window per call
    pub begin_pt: Vec<Idx>,

    /// Last point to copy (inclusive), per variable dim
    pub last_pt: Vec<Idx>,

    /// Extent per variable dim; `product * elem_size == buffer_bytes`
    pub num_pts: IdxTuple,

    /// Whole-vector copies are valid for this buffer
    pub vec_copy_ok: bool,

    /// Our own shared window (send buffers of shm pairs)
    pub shm: Option<ShmRegion>,

    /// Ticket while the shm window is being planned
    pub(crate) shm_ticket: Option<PoolTicket>,
}

impl HaloBuffer {
    pub fn size(&self) -> Idx {
        self.num_pts.product()
    }

    /// Extent in elements for a given number of swapped steps
    pub fn size_for_steps(&self, nsteps: Idx, step_posn: Option<usize>) -> Idx {
        match step_posn {
            Some(sp) => self.size() / self.num_pts.vals()[sp].max(1) * nsteps,
            None => self.size(),
        }
    }
}

/// Send/receive buffer pair toward one neighbour
#[derive(Clone, Debug)]
pub struct NeighborBufs {
    pub rank: usize,
    pub shm_rank: Option<usize>,
    pub send: HaloBuffer,
    pub recv: HaloBuffer,

    /// Peer's send window toward us, resolved after the registration barrier
    pub peer_shm: Option<ShmRegion>,
}

/// Compute the copy range of one buffer in one domain dim
///
/// Returns `(begin, last)` inclusive; `last < begin` when the width is
/// zero (halo-free side), which empties the whole buffer.
fn dim_range(vd: &data::var::VarDim, ofs: Idx, dir: BufDir, round_to_fold: bool) -> (Idx, Idx) {
    let first_inner = vd.rank_offset;
    let last_inner = vd.rank_offset + vd.domain_size - 1;
    let mut left_w = vd.left_halo + vd.left_wf_ext;
    let mut right_w = vd.right_halo + vd.right_wf_ext;
    if round_to_fold {
        left_w = round_up(left_w, vd.fold_len);
        right_w = round_up(right_w, vd.fold_len);
    }
    match (ofs, dir) {
        // Neighbour on the left: we send it the columns its right halo
        // reads, and receive our left halo from it.
        (o, BufDir::Send) if o == OFS_PREV => (first_inner, first_inner + right_w - 1),
        (o, BufDir::Recv) if o == OFS_PREV => (first_inner - left_w, first_inner - 1),
        // Mirrored for a neighbour on the right.
        (o, BufDir::Send) if o == OFS_NEXT => (last_inner - left_w + 1, last_inner),
        (o, BufDir::Recv) if o == OFS_NEXT => (last_inner + 1, last_inner + right_w),
        // Neighbour is in line with us in this dim: full extent.
        _ => (first_inner, last_inner),
    }
}

/// Build the buffer pair for one variable toward one neighbour
///
/// Either direction may be empty on its own (asymmetric halos); `None`
/// is returned only when there is nothing to exchange either way.
pub fn make_neighbor_bufs(var: &Var, info: &NeighborInfo, allow_vec: bool) -> Option<NeighborBufs> {
    let mut bufs: Vec<HaloBuffer> = Vec::with_capacity(2);
    for dir in [BufDir::Send, BufDir::Recv] {
        let mut begin_pt = Vec::with_capacity(var.ndims());
        let mut last_pt = Vec::with_capacity(var.ndims());
        let mut num_pts = IdxTuple::new();
        let round_to_fold = allow_vec && info.all_vec_mults;
        let mut vec_copy_ok = allow_vec && info.all_vec_mults;
        let mut dd = 0;
        for vd in var.dims() {
            let (begin, last) = match vd.kind {
                DimKind::Step => (0, var.alloc_steps() - 1),
                DimKind::Misc => (0, vd.domain_size - 1),
                DimKind::Domain => {
                    let ofs = info.offsets[dd];
                    dd += 1;
                    dim_range(vd, ofs, dir, round_to_fold)
                }
            };
            let len = (last - begin + 1).max(0);
            if vd.kind == DimKind::Domain {
                // Vector copies need fold-aligned begins, whole folds,
                // and a range entirely inside the allocation.
                let first_alloc = vd.rank_offset + vd.local_offset - vd.left_pad;
                let last_alloc =
                    vd.rank_offset + vd.local_offset + vd.domain_size + vd.right_pad - 1;
                if mod_flr(begin - first_alloc, vd.fold_len) != 0
                    || mod_flr(len, vd.fold_len) != 0
                    || begin < first_alloc
                    || last > last_alloc
                {
                    vec_copy_ok = false;
                }
            }
            begin_pt.push(begin);
            last_pt.push(last);
            num_pts.push_back(vd.name.clone(), len);
        }
        let dir_name = if dir == BufDir::Send { "send" } else { "recv" };
        bufs.push(HaloBuffer {
            name: format!("{}-{dir_name}-r{}", var.name(), info.rank),
            begin_pt,
            last_pt,
            num_pts,
            vec_copy_ok,
            shm: None,
            shm_ticket: None,
        });
    }
    let recv = bufs.pop().expect("two buffers built");
    let send = bufs.pop().expect("two buffers built");
    if send.size() == 0 && recv.size() == 0 {
        return None;
    }
    Some(NeighborBufs {
        rank: info.rank,
        shm_rank: info.shm_rank,
        send,
        recv,
        peer_shm: None,
    })
}

/// Plan the shared window of a send buffer (shm pairs only)
pub fn plan_shm_window(buf: &mut HaloBuffer, planner: &mut PoolPlanner) {
    let elems = buf.size() as usize;
    buf.shm_ticket = Some(planner.request(
        buf.name.clone(),
        PoolKey::Shm,
        elems,
        LOCK_PAD_ELEMS,
    ));
}

/// Attach the allocated window and initialise its lock
pub fn attach_shm_window(buf: &mut HaloBuffer, planner: &PoolPlanner) {
    if let Some(ticket) = buf.shm_ticket.take() {
        let (block, pad_ofs) = planner.pad_of(ticket);
        let total = LOCK_PAD_ELEMS + buf.size() as usize;
        let padded = Storage::new(block, pad_ofs, total);
        let region = ShmRegion::new(padded);
        region.lock().init();
        buf.shm = Some(region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::idx::Indices;
    use data::var::VarDim;

    /// 2-D var: domain 8x6, halos 2 (x) and 1 (y), offsets at origin
    fn var_2d() -> Var {
        let mut x = VarDim::domain("x");
        x.domain_size = 8;
        x.left_halo = 2;
        x.right_halo = 2;
        x.left_pad = 2;
        x.right_pad = 2;
        let mut y = VarDim::domain("y");
        y.domain_size = 6;
        y.left_halo = 1;
        y.right_halo = 1;
        y.left_pad = 1;
        y.right_pad = 1;
        let mut v = Var::new("u", vec![VarDim::step("t"), x, y]);
        v.set_alloc_steps(2);
        v
    }

    fn info(offsets: Vec<Idx>) -> NeighborInfo {
        NeighborInfo {
            rank: 1,
            offsets: Indices(offsets),
            man_dist: 1,
            all_vec_mults: true,
            shm_rank: None,
        }
    }

    #[test]
    fn left_neighbor_buffer_shapes() {
        let v = var_2d();
        let nb = make_neighbor_bufs(&v, &info(vec![0, 1]), false).unwrap();
        // Send our first two owned columns; receive our left halo.
        assert_eq!(nb.send.begin_pt, vec![0, 0, 0]);
        assert_eq!(nb.send.last_pt, vec![1, 1, 5]);
        assert_eq!(nb.recv.begin_pt, vec![0, -2, 0]);
        assert_eq!(nb.recv.last_pt, vec![1, -1, 5]);
        // 2 steps * 2 columns * 6 rows.
        assert_eq!(nb.send.size(), 24);
        assert_eq!(nb.recv.size(), 24);
    }

    #[test]
    fn corner_neighbor_gets_halo_in_both_dims() {
        let v = var_2d();
        let nb = make_neighbor_bufs(&v, &info(vec![2, 2]), false).unwrap();
        // 2 steps * 2 (x halo) * 1 (y halo).
        assert_eq!(nb.recv.size(), 4);
        assert_eq!(nb.recv.begin_pt, vec![0, 8, 6]);
        assert_eq!(nb.recv.last_pt, vec![1, 9, 6]);
    }

    #[test]
    fn wf_extension_deepens_exchange() {
        let mut v = var_2d();
        for vd in v.dims_mut() {
            if vd.kind == DimKind::Domain {
                vd.left_wf_ext = 2;
                vd.right_wf_ext = 2;
                vd.left_pad = 4;
                vd.right_pad = 4;
            }
        }
        let nb = make_neighbor_bufs(&v, &info(vec![0, 1]), false).unwrap();
        // Halo 2 + wf ext 2 in x.
        assert_eq!(nb.send.last_pt[1] - nb.send.begin_pt[1] + 1, 4);
    }

    #[test]
    fn zero_halo_side_has_no_buffer() {
        let mut v = var_2d();
        v.dims_mut()[1].left_halo = 0;
        v.dims_mut()[1].right_halo = 0;
        assert!(make_neighbor_bufs(&v, &info(vec![0, 1]), false).is_none());
        // The y-side still exchanges.
        assert!(make_neighbor_bufs(&v, &info(vec![1, 0]), false).is_some());
    }

    #[test]
    fn asymmetric_halo_keeps_the_nonempty_direction() {
        // Left halo 0: nothing to receive from the left neighbour, but
        // it still needs our columns for its right halo.
        let mut v = var_2d();
        v.dims_mut()[1].left_halo = 0;
        v.dims_mut()[1].left_pad = 0;
        let nb = make_neighbor_bufs(&v, &info(vec![0, 1]), false).unwrap();
        assert_eq!(nb.recv.size(), 0);
        assert_eq!(nb.send.size(), 2 * 2 * 6);
    }

    #[test]
    fn vec_copy_alignment() {
        let mut v = var_2d();
        v.dims_mut()[1].fold_len = 4;
        v.dims_mut()[1].left_pad = 4;
        v.dims_mut()[1].right_pad = 4;
        let nb = make_neighbor_bufs(&v, &info(vec![0, 1]), true).unwrap();
        // Halo width 2 rounds up to one fold of 4.
        assert_eq!(nb.send.last_pt[1] - nb.send.begin_pt[1] + 1, 4);
        assert!(nb.send.vec_copy_ok);
        // Without vector exchange no rounding happens.
        let nb = make_neighbor_bufs(&v, &info(vec![0, 1]), false).unwrap();
        assert_eq!(nb.send.last_pt[1] - nb.send.begin_pt[1] + 1, 2);
        assert!(!nb.send.vec_copy_ok);
    }

    #[test]
    fn shm_window_embeds_lock() {
        let mut p = PoolPlanner::new();
        let v = var_2d();
        let mut nb = make_neighbor_bufs(&v, &info(vec![0, 1]), false).unwrap();
        plan_shm_window(&mut nb.send, &mut p);
        p.allocate();
        attach_shm_window(&mut nb.send, &p);
        let region = nb.send.shm.as_ref().unwrap();
        assert_eq!(region.payload().len() as Idx, nb.send.size());
        assert!(region.lock().is_ok_to_write());
    }
}
