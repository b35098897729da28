//! Reusable n-D scanners
//!
//! Every tile level walks its children through [`scan`]: given per-dim
//! `{begin, end, stride, align, align_ofs, group_size}` axes it emits one
//! `start/stop` window per child tile, with optional traversal modifiers
//! (serpentine, square-wave, grouped) and an optional thread pool that
//! distributes the tiles over worker threads.

use data::idx::Indices;
use data::{ceil_div, round_down_flr, Idx};
use rayon::prelude::*;

/// Index state threaded through the nested tile loops
///
/// `begin..end` is the span being scanned, `stride` the child size,
/// `align`/`align_ofs` the vector alignment applied to interior cuts and
/// `group_size` the optional tile grouping. `start..stop` and `index`
/// describe the child currently being visited.
#[derive(Clone, Debug)]
pub struct ScanIndices {
    pub begin: Indices,
    pub end: Indices,
    pub stride: Indices,
    pub align: Indices,
    pub align_ofs: Indices,
    pub group_size: Indices,
    pub start: Indices,
    pub stop: Indices,
    pub index: Indices,
}

impl ScanIndices {
    /// All-zero state over `ndims` solution dims
    ///
    /// With `vec_align`, domain-dim cuts snap to the fold; `align_ofs`
    /// carries the rank offsets so alignment is relative to the rank
    /// origin (`dd0` is the solution position of the first domain dim).
    pub fn new(ndims: usize, vec_align: Option<(&Indices, &Indices)>) -> Self {
        let mut align = Indices::new(1, ndims);
        let mut align_ofs = Indices::new(0, ndims);
        if let Some((fold, ofs)) = vec_align {
            let dd0 = ndims - fold.len();
            for j in 0..fold.len() {
                align[dd0 + j] = fold[j];
                align_ofs[dd0 + j] = ofs[j];
            }
        }
        Self {
            begin: Indices::new(0, ndims),
            end: Indices::new(0, ndims),
            stride: Indices::new(1, ndims),
            align,
            align_ofs,
            group_size: Indices::new(0, ndims),
            start: Indices::new(0, ndims),
            stop: Indices::new(0, ndims),
            index: Indices::new(0, ndims),
        }
    }

    /// Begin a nested scan over the window the outer scan just produced
    pub fn init_from_outer(&mut self, outer: &ScanIndices) {
        self.begin = outer.start.clone();
        self.end = outer.stop.clone();
        self.start = outer.start.clone();
        self.stop = outer.stop.clone();
    }

    pub fn ndims(&self) -> usize {
        self.begin.len()
    }
}

/// Traversal modifiers
#[derive(Copy, Clone, Debug, Default)]
pub struct ScanMods {
    /// Reverse every other pass of each inner dim for cache reuse
    pub serpentine: bool,
    /// Interleave row pairs of the two innermost scanned dims
    pub square_wave: bool,
    /// Visit whole groups of `group_size` tiles before moving on
    pub grouped: bool,
}

/// Per-dim table of child windows
#[derive(Clone, Debug)]
struct DimIters {
    windows: Vec<(Idx, Idx)>,
}

impl DimIters {
    /// Apply the trip-count formula of one axis
    fn build(begin: Idx, end: Idx, stride: Idx, align: Idx, align_ofs: Idx) -> Self {
        if end <= begin {
            return Self { windows: vec![] };
        }
        let stride = stride.max(1);
        // Snap the base to the alignment grid so interior cut points stay
        // on vector boundaries regardless of where the span starts.
        let adj_align = align.max(1).min(stride);
        let align_begin = round_down_flr(begin - align_ofs, adj_align) + align_ofs;
        let num_iters = ceil_div(end - align_begin, stride);
        let windows = (0..num_iters)
            .map(|i| {
                let start = (align_begin + i * stride).max(begin);
                let stop = (align_begin + (i + 1) * stride).min(end);
                (start, stop)
            })
            .filter(|&(s, e)| e > s)
            .collect();
        Self { windows }
    }

    fn len(&self) -> usize {
        self.windows.len()
    }
}

/// Walk the given dims of `idxs` and call `body` once per child window
///
/// `dim_posns` lists the dim positions to scan, outermost first; dims not
/// listed keep their `start/stop` from `idxs`. When `pool` is given the
/// tiles are distributed over its threads (visit order is then up to the
/// scheduler); otherwise they are visited in the modified row-major
/// order. `body` gets the per-tile state and the tile's linear ordinal.
pub fn scan<F>(
    idxs: &ScanIndices,
    dim_posns: &[usize],
    mods: ScanMods,
    pool: Option<&rayon::ThreadPool>,
    body: F,
) where
    F: Fn(&ScanIndices, usize) + Sync,
{
    let tables: Vec<DimIters> = dim_posns
        .iter()
        .map(|&d| {
            DimIters::build(
                idxs.begin[d],
                idxs.end[d],
                idxs.stride[d],
                idxs.align[d],
                idxs.align_ofs[d],
            )
        })
        .collect();
    if tables.iter().any(|t| t.len() == 0) {
        return;
    }

    // Enumerate per-dim ordinals in traversal order, then emit.
    let order = traversal_order(&tables, idxs, dim_posns, mods);

    let emit = |(ordinal, combo): (usize, &Vec<usize>)| {
        let mut child = idxs.clone();
        for (k, &d) in dim_posns.iter().enumerate() {
            let (start, stop) = tables[k].windows[combo[k]];
            child.start[d] = start;
            child.stop[d] = stop;
            child.index[d] = combo[k] as Idx;
        }
        body(&child, ordinal);
    };

    match pool {
        Some(pool) => pool.install(|| {
            order.par_iter().enumerate().for_each(emit);
        }),
        None => order.iter().enumerate().for_each(emit),
    }
}

/// Row-major ordinals with the serpentine / square-wave / grouped
/// transforms applied
fn traversal_order(
    tables: &[DimIters],
    idxs: &ScanIndices,
    dim_posns: &[usize],
    mods: ScanMods,
) -> Vec<Vec<usize>> {
    let n = tables.len();
    let counts: Vec<usize> = tables.iter().map(DimIters::len).collect();

    // Group tiles: iterate group tuples in the outer position, members in
    // the inner one. A group in dim `d` spans ceil(group/stride) tiles.
    let group_tiles: Vec<usize> = dim_posns
        .iter()
        .enumerate()
        .map(|(k, &d)| {
            if !mods.grouped || idxs.group_size[d] <= 0 {
                return 1;
            }
            let per = ceil_div(idxs.group_size[d], idxs.stride[d].max(1)).max(1) as usize;
            per.min(counts[k])
        })
        .collect();

    let mut order = Vec::with_capacity(counts.iter().product());
    let grouped = group_tiles.iter().any(|&g| g > 1);

    if grouped {
        let group_counts: Vec<usize> = counts
            .iter()
            .zip(&group_tiles)
            .map(|(&c, &g)| c.div_ceil(g))
            .collect();
        visit_row_major(&group_counts, mods.serpentine, &mut |gcombo| {
            let member_counts: Vec<usize> = (0..n)
                .map(|k| (counts[k] - gcombo[k] * group_tiles[k]).min(group_tiles[k]))
                .collect();
            visit_row_major(&member_counts, mods.serpentine, &mut |mcombo| {
                order.push(
                    (0..n)
                        .map(|k| gcombo[k] * group_tiles[k] + mcombo[k])
                        .collect(),
                );
            });
        });
    } else {
        visit_row_major(&counts, mods.serpentine, &mut |combo| {
            order.push(combo.to_vec());
        });
    }

    if mods.square_wave && n >= 2 {
        square_wave_reorder(&mut order, n, &counts);
    }
    order
}

/// Nested row-major walk with optional serpentine reversal
///
/// A dim reverses direction whenever its enclosing dim is on an odd pass.
fn visit_row_major(counts: &[usize], serpentine: bool, f: &mut impl FnMut(&[usize])) {
    let n = counts.len();
    if counts.iter().any(|&c| c == 0) {
        return;
    }
    let total: usize = counts.iter().product();
    let mut combo = vec![0usize; n];
    for lin in 0..total {
        let mut rest = lin;
        let mut outer_odd = false;
        for d in 0..n {
            let radix: usize = counts[d + 1..].iter().product::<usize>().max(1);
            let mut i = rest / radix;
            rest %= radix;
            if serpentine && outer_odd {
                i = counts[d] - 1 - i;
            }
            outer_odd ^= i % 2 == 1;
            combo[d] = i;
        }
        f(&combo);
    }
}

/// Swap every other pair along the two innermost dims
///
/// Within each pair of rows of the second-innermost dim, the walk visits
/// both rows of one column before moving to the next column.
fn square_wave_reorder(order: &mut [Vec<usize>], n: usize, counts: &[usize]) {
    let (a, b) = (n - 2, n - 1);
    let (rows, cols) = (counts[a], counts[b]);
    if rows < 2 || cols < 2 {
        return;
    }
    order.sort_by_key(|combo| {
        let outer: Vec<usize> = combo[..a].to_vec();
        let pair = combo[a] / 2;
        let col = combo[b];
        let in_pair = combo[a] % 2;
        (outer, pair, col, in_pair)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn axes_1d(begin: Idx, end: Idx, stride: Idx) -> ScanIndices {
        let mut s = ScanIndices::new(1, None);
        s.begin = Indices(vec![begin]);
        s.end = Indices(vec![end]);
        s.stride = Indices(vec![stride]);
        s
    }

    fn collect(idxs: &ScanIndices, dims: &[usize], mods: ScanMods) -> Vec<Vec<(Idx, Idx)>> {
        let out = Mutex::new(Vec::new());
        scan(idxs, dims, mods, None, |child, _| {
            out.lock().unwrap().push(
                dims.iter()
                    .map(|&d| (child.start[d], child.stop[d]))
                    .collect(),
            );
        });
        out.into_inner().unwrap()
    }

    #[test]
    fn strided_windows_cover_span() {
        let tiles = collect(&axes_1d(0, 10, 4), &[0], ScanMods::default());
        assert_eq!(tiles, vec![vec![(0, 4)], vec![(4, 8)], vec![(8, 10)]]);
    }

    #[test]
    fn alignment_snaps_interior_cuts() {
        // Span starts off-grid: first window is a peel up to the next
        // aligned boundary.
        let mut s = axes_1d(3, 19, 8);
        s.align = Indices(vec![4]);
        let tiles = collect(&s, &[0], ScanMods::default());
        assert_eq!(tiles, vec![vec![(3, 8)], vec![(8, 16)], vec![(16, 19)]]);
    }

    #[test]
    fn alignment_offset_shifts_grid() {
        let mut s = axes_1d(5, 21, 8);
        s.align = Indices(vec![4]);
        s.align_ofs = Indices(vec![1]);
        let tiles = collect(&s, &[0], ScanMods::default());
        // The stride grid is anchored at the offset: cuts at 5, 13, 21
        // all sit on the align-4 lattice shifted by 1.
        assert_eq!(tiles, vec![vec![(5, 13)], vec![(13, 21)]]);
    }

    #[test]
    fn empty_span_produces_nothing() {
        assert!(collect(&axes_1d(5, 5, 4), &[0], ScanMods::default()).is_empty());
    }

    #[test]
    fn serpentine_reverses_alternate_rows() {
        let mut s = ScanIndices::new(2, None);
        s.begin = Indices(vec![0, 0]);
        s.end = Indices(vec![2, 3]);
        s.stride = Indices(vec![1, 1]);
        let mods = ScanMods {
            serpentine: true,
            ..Default::default()
        };
        let tiles = collect(&s, &[0, 1], mods);
        let inner: Vec<Idx> = tiles.iter().map(|t| t[1].0).collect();
        assert_eq!(inner, vec![0, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn square_wave_interleaves_row_pairs() {
        let mut s = ScanIndices::new(2, None);
        s.begin = Indices(vec![0, 0]);
        s.end = Indices(vec![2, 2]);
        s.stride = Indices(vec![1, 1]);
        let mods = ScanMods {
            square_wave: true,
            ..Default::default()
        };
        let tiles = collect(&s, &[0, 1], mods);
        let pts: Vec<(Idx, Idx)> = tiles.iter().map(|t| (t[0].0, t[1].0)).collect();
        assert_eq!(pts, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn grouped_visits_full_tiles_first() {
        let mut s = axes_1d(0, 8, 1);
        s.group_size = Indices(vec![4]);
        let mods = ScanMods {
            grouped: true,
            ..Default::default()
        };
        let tiles = collect(&s, &[0], mods);
        let starts: Vec<Idx> = tiles.iter().map(|t| t[0].0).collect();
        assert_eq!(starts, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn parallel_scan_covers_all_tiles() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();
        let s = axes_1d(0, 64, 4);
        let seen = Mutex::new(Vec::new());
        scan(&s, &[0], ScanMods::default(), Some(&pool), |child, _| {
            seen.lock().unwrap().push(child.start[0]);
        });
        let mut starts = seen.into_inner().unwrap();
        starts.sort();
        assert_eq!(starts, (0..16).map(|i| i * 4).collect::<Vec<_>>());
    }

    #[test]
    fn unscanned_dims_keep_outer_window() {
        let mut s = ScanIndices::new(2, None);
        s.begin = Indices(vec![0, 0]);
        s.end = Indices(vec![4, 4]);
        s.stride = Indices(vec![2, 2]);
        s.start = Indices(vec![7, 7]);
        s.stop = Indices(vec![9, 9]);
        let tiles = collect(&s, &[1], ScanMods::default());
        // Dim 0 untouched, dim 1 scanned.
        assert_eq!(tiles, vec![vec![(0, 2)], vec![(2, 4)]]);
        let out = Mutex::new(Vec::new());
        scan(&s, &[1], ScanMods::default(), None, |child, _| {
            out.lock().unwrap().push(child.start[0]);
        });
        assert_eq!(out.into_inner().unwrap(), vec![7, 7]);
    }
}
