//! Rank topology
//!
//! Places this rank inside an n-D grid of ranks, resolves local and global
//! domain sizes, and builds the immediate-neighbour table used by the halo
//! exchange. All cross-rank agreement is established here, up front, with
//! two barrier-synchronised table exchanges.

use comm::{CommError, Communicator, Env};
use data::dims::DimSet;
use data::idx::{Indices, IdxTuple};
use data::{ceil_div, mod_flr, round_up, Idx};
use log::{debug, info, trace};

/// Errors raised while placing ranks
#[derive(Clone, Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("{requested} rank(s) requested ({layout}), but {active} rank(s) are active")]
    RankCountMismatch {
        requested: Idx,
        layout: String,
        active: usize,
    },

    #[error("ranks {0} and {1} are at the same coordinates")]
    DuplicateCoords(usize, usize),

    #[error(
        "rank {a} and {b} are both at rank-index {index} in '{dim}', but their \
         local sizes in '{other_dim}' are {a_size} and {b_size}, making them unaligned"
    )]
    Misaligned {
        a: usize,
        b: usize,
        dim: String,
        index: Idx,
        other_dim: String,
        a_size: Idx,
        b_size: Idx,
    },

    #[error("rank index {index} is outside [0, {count}) in '{dim}'")]
    BadRankIndex { index: Idx, count: Idx, dim: String },

    #[error("{0}")]
    SizeConflict(String),

    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Per-dim neighbour offset: 0 = previous, 1 = self, 2 = next
pub const OFS_PREV: Idx = 0;
pub const OFS_SELF: Idx = 1;
pub const OFS_NEXT: Idx = 2;

/// One immediate neighbour of this rank
#[derive(Clone, Debug)]
pub struct NeighborInfo {
    pub rank: usize,

    /// Per-dim offsets in `{0, 1, 2}` relative to this rank
    pub offsets: Indices,

    /// Sum of absolute coordinate deltas (1 = face, 2 = edge, ...)
    pub man_dist: usize,

    /// Every local size of the neighbour is a vector-length multiple
    pub all_vec_mults: bool,

    /// Rank in the shared-memory group, when reachable through it
    pub shm_rank: Option<usize>,
}

/// The up-to-3^n neighbourhood of this rank, indexed by offset tuple
#[derive(Clone, Debug)]
pub struct Neighborhood {
    sizes: IdxTuple,
    entries: Vec<Option<NeighborInfo>>,
    my_index: usize,
}

impl Neighborhood {
    fn new(dims: &DimSet) -> Self {
        let mut sizes = dims.new_domain_tuple();
        sizes.set_all(3);
        let n = sizes.product() as usize;
        let my_index = sizes.layout(&Indices::new(OFS_SELF, dims.ndd())) as usize;
        Self {
            sizes,
            entries: vec![None; n],
            my_index,
        }
    }

    /// Linear index of an offset tuple
    pub fn index_of(&self, offsets: &Indices) -> usize {
        self.sizes.layout(offsets) as usize
    }

    /// Max number of neighbour slots, including self
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NeighborInfo> {
        if index == self.my_index {
            return None;
        }
        self.entries[index].as_ref()
    }

    /// Neighbour lying in the given per-dim direction, if present
    pub fn at_offsets(&self, offsets: &Indices) -> Option<&NeighborInfo> {
        self.get(self.index_of(offsets))
    }

    /// Visit every actual neighbour (never self) with its slot index
    pub fn visit(&self, mut f: impl FnMut(usize, &NeighborInfo)) {
        for (i, e) in self.entries.iter().enumerate() {
            if i == self.my_index {
                continue;
            }
            if let Some(info) = e {
                f(i, info);
            }
        }
    }

    pub fn num_neighbors(&self) -> usize {
        let mut n = 0;
        self.visit(|_, _| n += 1);
        n
    }

    /// Is there a neighbour anywhere in the prev/next direction of `dd`?
    pub fn has_neighbor_on_side(&self, dd: usize, left: bool) -> bool {
        let want = if left { OFS_PREV } else { OFS_NEXT };
        let mut found = false;
        self.visit(|_, info| {
            if info.offsets[dd] == want {
                found = true;
            }
        });
        found
    }
}

/// Requested placement, before resolution
#[derive(Clone, Debug)]
pub struct LayoutRequest {
    /// Global domain sizes per domain dim (0 = derive from local)
    pub global_sizes: Indices,
    /// Local domain sizes per domain dim (0 = derive from global)
    pub rank_sizes: Indices,
    /// Ranks per domain dim (0 = factorise automatically)
    pub num_ranks: Indices,
    /// This rank's grid coordinates (ignored unless `find_loc` is false)
    pub rank_indices: Indices,
    /// Derive coordinates from the linear rank id
    pub find_loc: bool,
    /// Look for shared-memory peers
    pub use_shm: bool,
}

impl LayoutRequest {
    pub fn new(ndd: usize) -> Self {
        Self {
            global_sizes: Indices::new(0, ndd),
            rank_sizes: Indices::new(0, ndd),
            num_ranks: Indices::new(0, ndd),
            rank_indices: Indices::new(0, ndd),
            find_loc: true,
            use_shm: false,
        }
    }
}

/// Resolved placement of this rank
#[derive(Clone, Debug)]
pub struct RankLayout {
    pub num_ranks: Indices,
    pub my_indices: Indices,
    pub global_sizes: Indices,
    pub rank_sizes: Indices,

    /// Global index of this rank's first owned element, per domain dim
    pub rank_offsets: Indices,

    pub neighborhood: Neighborhood,
}

impl RankLayout {
    pub fn is_first_rank(&self, dd: usize) -> bool {
        self.my_indices[dd] == 0
    }

    pub fn is_last_rank(&self, dd: usize) -> bool {
        self.my_indices[dd] == self.num_ranks[dd] - 1
    }
}

/// Pick the most compact factorisation of `total` ranks over the free dims
///
/// Dims with a non-zero request are fixed; among all layouts whose product
/// matches `total`, the one with the smallest maximum per-dim count wins.
fn factorize_ranks(total: usize, requested: &Indices) -> Result<Indices, TopologyError> {
    let nr = total as Idx;
    let ndd = requested.len();

    let facts: Vec<Idx> = (1..=nr).filter(|f| nr % f == 0).collect();

    // Search over all factor choices for the free dims past the first;
    // the first free dim is derived from the remaining product.
    let mut combos = IdxTuple::new();
    for dd in 0..ndd {
        let n = if dd == 0 || requested[dd] != 0 {
            1
        } else {
            facts.len() as Idx
        };
        combos.push_back(format!("d{dd}"), n);
    }

    let mut best: Option<Indices> = None;
    combos.visit_all_points(|combo, _| {
        let mut layout = Indices::new(0, ndd);
        for dd in 0..ndd {
            layout[dd] = if requested[dd] != 0 {
                requested[dd]
            } else if dd == 0 {
                -1 // derived below
            } else {
                facts[combo[dd] as usize]
            };
        }
        if layout[0] == -1 {
            let others: Idx = layout.0[1..].iter().product();
            if others == 0 || nr % others != 0 {
                return true;
            }
            layout[0] = nr / others;
        }
        if layout.product() == nr {
            trace!("valid rank layout {layout} has max {}", layout.max_elem());
            let better = best
                .as_ref()
                .map_or(true, |b| layout.max_elem() < b.max_elem());
            if better {
                best = Some(layout);
            }
        }
        true
    });

    best.ok_or_else(|| TopologyError::RankCountMismatch {
        requested: requested.product(),
        layout: format!("{requested}"),
        active: total,
    })
}

/// Resolve sizes, offsets and neighbours for this rank
///
/// Collective: every rank must call this with consistent settings
/// (verified via `assert_equality_over_ranks`).
pub fn setup_rank_layout(
    env: &Env,
    dims: &DimSet,
    req: &LayoutRequest,
) -> Result<RankLayout, TopologyError> {
    let comm = &*env.comm;
    let me = comm.rank();
    let nr = comm.num_ranks();
    let ndd = dims.ndd();
    debug!("placing rank {me} of {nr}");

    comm.assert_equality_over_ranks(nr as Idx, "total number of ranks")?;
    comm.assert_equality_over_ranks(req.use_shm as Idx, "use_shm setting")?;
    comm.assert_equality_over_ranks(req.find_loc as Idx, "defined rank indices")?;
    for dd in 0..ndd {
        let dname = &dims.domain_dims()[dd];
        comm.assert_equality_over_ranks(
            req.global_sizes[dd],
            &format!("global-domain size in '{dname}'"),
        )?;
        comm.assert_equality_over_ranks(
            req.num_ranks[dd],
            &format!("number of ranks in '{dname}'"),
        )?;
        if req.global_sizes[dd] == 0 && req.rank_sizes[dd] == 0 {
            return Err(TopologyError::SizeConflict(format!(
                "both local-domain and global-domain size are zero in '{dname}'; \
                 specify one and the other will be calculated"
            )));
        }
    }

    // Single-rank shortcut: local and global sizes must agree.
    if nr == 1 {
        let mut global = req.global_sizes.clone();
        let mut local = req.rank_sizes.clone();
        for dd in 0..ndd {
            if local[dd] == 0 {
                local[dd] = global[dd];
            } else if global[dd] == 0 {
                global[dd] = local[dd];
            } else if global[dd] != local[dd] {
                return Err(TopologyError::SizeConflict(format!(
                    "local-domain size {} does not equal global-domain size {} in '{}'",
                    local[dd],
                    global[dd],
                    dims.domain_dims()[dd]
                )));
            }
        }
        return Ok(RankLayout {
            num_ranks: Indices::new(1, ndd),
            my_indices: Indices::new(0, ndd),
            global_sizes: global,
            rank_sizes: local,
            rank_offsets: Indices::new(0, ndd),
            neighborhood: Neighborhood::new(dims),
        });
    }

    // Grid shape.
    let num_ranks = if req.num_ranks.product() == 0 {
        let layout = factorize_ranks(nr, &req.num_ranks)?;
        info!("rank layout {layout} selected");
        layout
    } else {
        req.num_ranks.clone()
    };
    if num_ranks.product() != nr as Idx {
        return Err(TopologyError::RankCountMismatch {
            requested: num_ranks.product(),
            layout: format!("{num_ranks}"),
            active: nr,
        });
    }

    // My coordinates.
    let mut grid = dims.new_domain_tuple();
    grid.set_indices(&num_ranks);
    let my_indices = if req.find_loc {
        grid.unlayout(me as Idx)
    } else {
        req.rank_indices.clone()
    };
    for dd in 0..ndd {
        if my_indices[dd] < 0 || my_indices[dd] >= num_ranks[dd] {
            return Err(TopologyError::BadRankIndex {
                index: my_indices[dd],
                count: num_ranks[dd],
                dim: dims.domain_dims()[dd].clone(),
            });
        }
    }

    let mut global_sizes = req.global_sizes.clone();
    let mut rank_sizes = req.rank_sizes.clone();
    let mut rank_offsets = Indices::new(0, ndd);
    let mut neighborhood = Neighborhood::new(dims);
    let cluster_pts = dims.cluster_pts();
    let fold_pts = dims.fold_pts();

    // Two passes: the first sums the sizes that are known so unset ones
    // can be derived, the second checks alignment and fills in offsets
    // and neighbours.
    for pass in 0..2 {
        let mut coords = vec![Indices::new(0, ndd); nr];
        let mut sizes = vec![Indices::new(0, ndd); nr];
        coords[me] = my_indices.clone();
        sizes[me] = rank_sizes.clone();

        // Exchange coordinate and size tables across all ranks.
        for rn in 0..nr {
            let mut row: Vec<Idx> = coords[rn].0.iter().chain(&sizes[rn].0).copied().collect();
            comm.bcast_idxs(rn, &mut row)?;
            coords[rn] = Indices(row[..ndd].to_vec());
            sizes[rn] = Indices(row[ndd..].to_vec());
        }
        comm.barrier();

        rank_offsets = Indices::new(0, ndd);
        let mut size_sums = Indices::new(0, ndd);
        neighborhood = Neighborhood::new(dims);

        for rn in 0..nr {
            let deltas = coords[rn].sub(&my_indices);
            let man_dist: Idx = deltas.0.iter().map(|d| d.abs()).sum();
            let max_dist = deltas.0.iter().map(|d| d.abs()).max().unwrap_or(0);

            if rn != me && man_dist == 0 {
                return Err(TopologyError::DuplicateCoords(me, rn));
            }

            for dd in 0..ndd {
                // In-line with me in dd: all other deltas are zero.
                let in_line = (0..ndd).all(|dj| dj == dd || deltas[dj] == 0);
                if !in_line {
                    continue;
                }
                size_sums[dd] += sizes[rn][dd];

                if pass == 1 {
                    // Ranks sharing a grid line must agree on the sizes of
                    // every other dim, or the domains do not tile.
                    for dj in 0..ndd {
                        if dj != dd && sizes[me][dj] != sizes[rn][dj] {
                            return Err(TopologyError::Misaligned {
                                a: rn,
                                b: me,
                                dim: dims.domain_dims()[dd].clone(),
                                index: my_indices[dd],
                                other_dim: dims.domain_dims()[dj].clone(),
                                a_size: sizes[rn][dj],
                                b_size: sizes[me][dj],
                            });
                        }
                    }
                    // Global offset counts every preceding in-line rank.
                    if deltas[dd] < 0 {
                        rank_offsets[dd] += sizes[rn][dd];
                    }
                }
            }

            // Immediate neighbour: distance <= 1 in every dim.
            if pass == 1 && rn != me && max_dist <= 1 {
                let offsets = deltas.add_scalar(1);
                let idx = neighborhood.index_of(&offsets);
                let all_vec_mults =
                    (0..ndd).all(|dd| mod_flr(sizes[rn][dd], fold_pts[dd]) == 0);
                let shm_rank = if req.use_shm {
                    comm.shm_rank_of(rn)
                } else {
                    None
                };
                debug!(
                    "neighbor rank {rn} at offsets {offsets}, manhattan {man_dist}, \
                     shm {shm_rank:?}"
                );
                neighborhood.entries[idx] = Some(NeighborInfo {
                    rank: rn,
                    offsets,
                    man_dist: man_dist as usize,
                    all_vec_mults,
                    shm_rank,
                });
            }
        }

        // After the first pass, derive unknown sizes.
        if pass == 0 {
            for dd in 0..ndd {
                let dname = &dims.domain_dims()[dd];
                let nranks_dd = num_ranks[dd];
                if rank_sizes[dd] == 0 {
                    if size_sums[dd] != 0 {
                        return Err(TopologyError::SizeConflict(format!(
                            "local-domain size in '{dname}' is specified on another \
                             rank but not on rank {me}; it must be specified or \
                             unspecified consistently"
                        )));
                    }
                    // Divide evenly, rounded up to whole clusters; the last
                    // rank absorbs the remainder.
                    let gsz = global_sizes[dd];
                    let mut rsz = ceil_div(gsz, nranks_dd);
                    rsz = round_up(rsz, cluster_pts[dd]);
                    let rem = gsz - rsz * (nranks_dd - 1);
                    if rem <= 0 {
                        return Err(TopologyError::SizeConflict(format!(
                            "global-domain size {gsz} is too small to split across \
                             {nranks_dd} ranks in '{dname}'"
                        )));
                    }
                    rank_sizes[dd] = if my_indices[dd] == nranks_dd - 1 { rem } else { rsz };
                } else if global_sizes[dd] == 0 {
                    global_sizes[dd] = size_sums[dd];
                }
            }
        } else {
            // Consistency after the second pass.
            for dd in 0..ndd {
                if global_sizes[dd] != size_sums[dd] {
                    return Err(TopologyError::SizeConflict(format!(
                        "sum of local-domain sizes ({}) does not equal the \
                         global-domain size ({}) in '{}'",
                        size_sums[dd],
                        global_sizes[dd],
                        dims.domain_dims()[dd]
                    )));
                }
            }
        }
    }

    info!(
        "rank {me} at {my_indices} owns {rank_sizes} elements at offset {rank_offsets}, \
         {} neighbor(s)",
        neighborhood.num_neighbors()
    );
    Ok(RankLayout {
        num_ranks,
        my_indices,
        global_sizes,
        rank_sizes,
        rank_offsets,
        neighborhood,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use comm::mem::MemWorld;
    use std::sync::Arc;
    use std::thread;

    fn dims3() -> DimSet {
        DimSet::new("t", ["x", "y", "z"], Vec::<String>::new())
    }

    #[test]
    fn factorization_picks_most_compact() {
        let free = Indices::new(0, 3);
        let l = factorize_ranks(8, &free).unwrap();
        assert_eq!(l.product(), 8);
        assert_eq!(l.max_elem(), 2); // 2*2*2 beats 8*1*1

        // Fixed dims are honoured.
        let l = factorize_ranks(8, &Indices(vec![0, 4, 0])).unwrap();
        assert_eq!(l.product(), 8);
        assert_eq!(l[1], 4);

        // Impossible constraint.
        assert!(factorize_ranks(6, &Indices(vec![0, 4, 0])).is_err());
    }

    #[test]
    fn single_rank_layout() {
        let env = Env::new_local();
        let dims = dims3();
        let mut req = LayoutRequest::new(3);
        req.global_sizes = Indices(vec![16, 16, 16]);
        let l = setup_rank_layout(&env, &dims, &req).unwrap();
        assert_eq!(l.rank_sizes.0, vec![16, 16, 16]);
        assert_eq!(l.global_sizes.0, vec![16, 16, 16]);
        assert_eq!(l.neighborhood.num_neighbors(), 0);
        assert!(l.is_first_rank(0) && l.is_last_rank(0));
    }

    #[test]
    fn single_rank_size_conflict() {
        let env = Env::new_local();
        let dims = dims3();
        let mut req = LayoutRequest::new(3);
        req.global_sizes = Indices(vec![16, 16, 16]);
        req.rank_sizes = Indices(vec![8, 16, 16]);
        assert!(matches!(
            setup_rank_layout(&env, &dims, &req),
            Err(TopologyError::SizeConflict(_))
        ));
    }

    #[test]
    fn two_ranks_split_and_neighbor() {
        let world = MemWorld::new(2);
        let comms = world.communicators();
        let dims = dims3();
        thread::scope(|s| {
            for c in comms {
                let dims = dims.clone();
                s.spawn(move || {
                    let me = c.rank();
                    let env = Env::with_comm(Arc::new(c));
                    let mut req = LayoutRequest::new(3);
                    req.global_sizes = Indices(vec![16, 8, 8]);
                    req.use_shm = true;
                    let l = setup_rank_layout(&env, &dims, &req).unwrap();

                    // 2*1*1 grid, split along x.
                    assert_eq!(l.num_ranks.0, vec![2, 1, 1]);
                    assert_eq!(l.rank_sizes.0, vec![8, 8, 8]);
                    let want_ofs = if me == 0 { 0 } else { 8 };
                    assert_eq!(l.rank_offsets.0, vec![want_ofs, 0, 0]);

                    // One neighbor on the facing side, reachable via shm.
                    assert_eq!(l.neighborhood.num_neighbors(), 1);
                    let side = me == 0; // rank 0 has its neighbor on the right
                    assert!(l.neighborhood.has_neighbor_on_side(0, !side));
                    l.neighborhood.visit(|_, info| {
                        assert_eq!(info.rank, 1 - me);
                        assert_eq!(info.man_dist, 1);
                        assert_eq!(info.shm_rank, Some(1 - me));
                    });
                });
            }
        });
    }

    #[test]
    fn four_ranks_misalignment_detected() {
        // 2x2 grid with rank-local sizes that disagree along a line.
        let world = MemWorld::new(4);
        let comms = world.communicators();
        let dims = DimSet::new("t", ["x", "y"], Vec::<String>::new());
        thread::scope(|s| {
            for c in comms {
                let dims = dims.clone();
                s.spawn(move || {
                    let me = c.rank();
                    let env = Env::with_comm(Arc::new(c));
                    let mut req = LayoutRequest::new(2);
                    req.num_ranks = Indices(vec![2, 2]);
                    req.global_sizes = Indices(vec![0, 0]);
                    // Rank 0 disagrees about y-size with its x-line peers.
                    req.rank_sizes = if me == 0 {
                        Indices(vec![8, 6])
                    } else {
                        Indices(vec![8, 8])
                    };
                    let r = setup_rank_layout(&env, &dims, &req);
                    // Only ranks on the same x-line as rank 0 can see the
                    // disagreement; the others tile cleanly.
                    if me == 0 || me == 2 {
                        assert!(
                            matches!(r, Err(TopologyError::Misaligned { .. })),
                            "rank {me} got {r:?}"
                        );
                    } else {
                        assert!(r.is_ok(), "rank {me} got {r:?}");
                    }
                });
            }
        });
    }
}
