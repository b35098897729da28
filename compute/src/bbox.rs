//! Bounding-box discovery for masked bundles
//!
//! A bundle with a sub-domain mask gets a list of non-overlapping solid
//! boxes that together cover exactly its valid points inside the rank's
//! extended box. Discovery slices the outer dim across threads; inside a
//! slice, each uncovered valid point seeds a rectangle that grows until
//! it meets an invalid point in some dim, shrinking the scan range and
//! rescanning until stable. Slice-adjacent boxes that agree on every
//! other dim are merged afterwards.

use crate::bundle::{Bundle, EvalCtx};
use data::bounds::BoundingBox;
use data::ceil_div;
use data::dims::DimSet;
use data::idx::{Indices, IdxTuple};
use log::{debug, trace};

/// Boxes of one bundle: the outer hull and the covering list
#[derive(Clone, Debug, Default)]
pub struct BundleBBs {
    pub outer: BoundingBox,
    pub list: Vec<BoundingBox>,
}

/// Geometry inputs for box flag computation
pub struct BBoxEnv<'a> {
    pub dims: &'a DimSet,
    pub rank_offsets: &'a Indices,
}

impl BBoxEnv<'_> {
    fn update(&self, bb: &mut BoundingBox, force_full: bool) {
        bb.update(
            self.rank_offsets,
            self.dims.fold_pts(),
            &self.dims.cluster_pts(),
            force_full,
        );
    }
}

/// Discover the boxes of `bundle` inside `ext_bb`
pub fn find_bounding_boxes(
    bundle: &dyn Bundle,
    ctx: &EvalCtx<'_>,
    ext_bb: &BoundingBox,
    env: &BBoxEnv<'_>,
    pool: Option<&rayon::ThreadPool>,
) -> BundleBBs {
    let mut outer = ext_bb.clone();
    env.update(&mut outer, true);

    if outer.size == 0 {
        return BundleBBs {
            outer,
            list: vec![],
        };
    }

    // Trivial mask: one solid box.
    if !bundle.is_sub_domain_expr() {
        return BundleBBs {
            list: vec![outer.clone()],
            outer,
        };
    }

    let ndd = outer.ndims();
    let odim = 0;
    let nthreads = pool.map_or(1, |p| p.current_num_threads()).max(1);
    let outer_len = outer.len[odim];
    let len_per_thr = ceil_div(outer_len, nthreads as data::Idx);
    debug!(
        "find_bounding_boxes('{}'): {nthreads} slice(s) over {outer_len} outer point(s)",
        bundle.name()
    );

    let scan_slice = |slice: usize| -> Vec<BoundingBox> {
        let mut begin = outer.begin.clone();
        begin[odim] += slice as data::Idx * len_per_thr;
        let mut end = outer.end.clone();
        end[odim] = end[odim].min(begin[odim] + len_per_thr);
        if end[odim] <= begin[odim] {
            return vec![];
        }
        scan_one_slice(bundle, ctx, env, &begin, &end)
    };

    let lists: Vec<Vec<BoundingBox>> = match pool {
        Some(pool) => pool.install(|| {
            use rayon::prelude::*;
            (0..nthreads).into_par_iter().map(scan_slice).collect()
        }),
        None => (0..nthreads).map(scan_slice).collect(),
    };

    // Merge slice lists: boxes adjacent in the outer dim that agree on
    // every other dim become one; the outer hull and point count are
    // rebuilt from the survivors.
    let mut final_list: Vec<BoundingBox> = Vec::new();
    let mut num_points = 0;
    let mut hull: Option<BoundingBox> = None;
    for bbn in lists.into_iter().flatten() {
        if bbn.size == 0 {
            continue;
        }
        num_points += bbn.size;
        hull = Some(match hull.take() {
            None => bbn.clone(),
            Some(h) => {
                BoundingBox::new(h.begin.min(&bbn.begin), h.end.max(&bbn.end))
            }
        });
        let mut merged = false;
        for bb in &mut final_list {
            let adjacent = bb.end[odim] == bbn.begin[odim];
            let aligned = (0..ndd).all(|d| {
                d == odim || (bb.begin[d] == bbn.begin[d] && bb.end[d] == bbn.end[d])
            });
            if adjacent && aligned {
                bb.end[odim] = bbn.end[odim];
                env.update(bb, true);
                trace!("merged sub-box into [{} ... {})", bb.begin, bb.end);
                merged = true;
                break;
            }
        }
        if !merged {
            final_list.push(bbn);
        }
    }

    let mut outer = match hull {
        Some(h) => h,
        None => {
            // No valid points at all: an empty box at the rank origin.
            let mut e = ext_bb.clone();
            e.end = e.begin.clone();
            e
        }
    };
    outer.num_points = num_points;
    env.update(&mut outer, false);
    debug!(
        "find_bounding_boxes('{}'): {} box(es) covering {num_points} point(s)",
        bundle.name(),
        final_list.len()
    );
    BundleBBs {
        outer,
        list: final_list,
    }
}

/// Row-major scan of one outer-dim slice
fn scan_one_slice(
    bundle: &dyn Bundle,
    ctx: &EvalCtx<'_>,
    env: &BBoxEnv<'_>,
    slice_begin: &Indices,
    slice_end: &Indices,
) -> Vec<BoundingBox> {
    let ndd = slice_begin.len();
    let mut found: Vec<BoundingBox> = Vec::new();

    let valid_at = |found: &[BoundingBox], dpt: &Indices| -> bool {
        let mut spt = Indices::new(0, ndd + 1);
        for d in 0..ndd {
            spt[d + 1] = dpt[d];
        }
        bundle.is_in_valid_domain(ctx, &spt) && !found.iter().any(|bb| bb.contains_point(dpt))
    };

    let mut slice_len = IdxTuple::with_names((0..ndd).map(|d| format!("d{d}")));
    slice_len.set_indices(&slice_end.sub(slice_begin));

    slice_len.visit_all_points(|ofs, _| {
        let bdpt = slice_begin.add(ofs);
        if !valid_at(&found, &bdpt) {
            return true;
        }

        // Grow the box from this seed until the scan passes clean.
        let mut scan_len = slice_end.sub(&bdpt);
        let mut do_scan = true;
        while do_scan {
            do_scan = false;
            let mut lens = IdxTuple::with_names((0..ndd).map(|d| format!("d{d}")));
            lens.set_indices(&scan_len);
            lens.visit_all_points(|eofs, _| {
                let edpt = bdpt.add(eofs);
                if valid_at(&found, &edpt) {
                    return true;
                }
                // Shrink the first dim that moved past the seed, then
                // rescan the reduced range until a pass comes back clean.
                for d in 0..ndd {
                    if edpt[d] > bdpt[d] {
                        scan_len[d] = edpt[d] - bdpt[d];
                        do_scan = true;
                        return false;
                    }
                }
                false
            });
        }

        let mut bb = BoundingBox::new(bdpt.clone(), bdpt.add(&scan_len));
        env.update(&mut bb, true);
        trace!("found sub-box [{} ... {})", bb.begin, bb.end);
        found.push(bb);
        true
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::VarRef;
    use data::var::VarStore;
    use data::{mod_flr, Idx};

    struct MaskedBundle {
        modulus: Idx,
    }

    impl Bundle for MaskedBundle {
        fn name(&self) -> &str {
            "masked"
        }
        fn output_vars(&self) -> Vec<VarRef> {
            vec![]
        }
        fn is_sub_domain_expr(&self) -> bool {
            self.modulus > 1
        }
        fn is_in_valid_domain(&self, _ctx: &EvalCtx<'_>, pt: &Indices) -> bool {
            mod_flr(pt[1], self.modulus) == 0
        }
        fn calc_scalar(&self, _ctx: &EvalCtx<'_>, _thread: usize, _pt: &Indices) {}
    }

    fn env_1d<'a>(dims: &'a DimSet, ofs: &'a Indices) -> BBoxEnv<'a> {
        BBoxEnv {
            dims,
            rank_offsets: ofs,
        }
    }

    fn ext_bb(n: Idx) -> BoundingBox {
        let mut bb = BoundingBox::new(Indices(vec![0]), Indices(vec![n]));
        bb.update(&Indices(vec![0]), &Indices(vec![1]), &Indices(vec![1]), true);
        bb
    }

    #[test]
    fn trivial_mask_is_one_box() {
        let dims = DimSet::new("t", ["x"], Vec::<String>::new());
        let ofs = Indices(vec![0]);
        let store = VarStore::new();
        let cluster = dims.cluster_pts();
        let ctx = EvalCtx {
            store: &store,
            scratch: &[],
            rank_offsets: &ofs,
            fold_pts: dims.fold_pts(),
            cluster_pts: &cluster,
        };
        let b = MaskedBundle { modulus: 1 };
        let bbs = find_bounding_boxes(&b, &ctx, &ext_bb(16), &env_1d(&dims, &ofs), None);
        assert_eq!(bbs.list.len(), 1);
        assert!(bbs.outer.is_full);
        assert_eq!(bbs.outer.num_points, 16);
    }

    #[test]
    fn stride_4_mask_yields_singletons() {
        let dims = DimSet::new("t", ["x"], Vec::<String>::new());
        let ofs = Indices(vec![0]);
        let store = VarStore::new();
        let cluster = dims.cluster_pts();
        let ctx = EvalCtx {
            store: &store,
            scratch: &[],
            rank_offsets: &ofs,
            fold_pts: dims.fold_pts(),
            cluster_pts: &cluster,
        };
        let b = MaskedBundle { modulus: 4 };
        let bbs = find_bounding_boxes(&b, &ctx, &ext_bb(16), &env_1d(&dims, &ofs), None);
        // ceil(16/4) singletons of length 1, covering exactly the mask.
        assert_eq!(bbs.list.len(), 4);
        for bb in &bbs.list {
            assert_eq!(bb.size, 1);
            assert_eq!(mod_flr(bb.begin[0], 4), 0);
        }
        assert_eq!(bbs.outer.num_points, 4);
        assert!(!bbs.outer.is_full);
    }

    struct QuadrantBundle;

    impl Bundle for QuadrantBundle {
        fn name(&self) -> &str {
            "quadrant"
        }
        fn output_vars(&self) -> Vec<VarRef> {
            vec![]
        }
        fn is_sub_domain_expr(&self) -> bool {
            true
        }
        fn is_in_valid_domain(&self, _ctx: &EvalCtx<'_>, pt: &Indices) -> bool {
            // Valid except in the upper-right 4x4 corner of an 8x8 box.
            !(pt[1] >= 4 && pt[2] >= 4)
        }
        fn calc_scalar(&self, _ctx: &EvalCtx<'_>, _thread: usize, _pt: &Indices) {}
    }

    #[test]
    fn l_shape_covered_disjointly() {
        let dims = DimSet::new("t", ["x", "y"], Vec::<String>::new());
        let ofs = Indices(vec![0, 0]);
        let store = VarStore::new();
        let cluster = dims.cluster_pts();
        let ctx = EvalCtx {
            store: &store,
            scratch: &[],
            rank_offsets: &ofs,
            fold_pts: dims.fold_pts(),
            cluster_pts: &cluster,
        };
        let mut bb = BoundingBox::new(Indices(vec![0, 0]), Indices(vec![8, 8]));
        bb.update(&ofs, &Indices(vec![1, 1]), &Indices(vec![1, 1]), true);
        let bbs = find_bounding_boxes(&QuadrantBundle, &ctx, &bb, &env_1d(&dims, &ofs), None);

        // Coverage: exactly the 48 valid points, no overlaps.
        let total: Idx = bbs.list.iter().map(|b| b.size).sum();
        assert_eq!(total, 48);
        assert_eq!(bbs.outer.num_points, 48);
        for (i, a) in bbs.list.iter().enumerate() {
            for b in &bbs.list[i + 1..] {
                assert!(a.intersect(b).is_none(), "{a:?} overlaps {b:?}");
            }
        }
        // Every valid point is inside some box.
        for x in 0..8 {
            for y in 0..8 {
                let p = Indices(vec![x, y]);
                let inside = bbs.list.iter().any(|b| b.contains_point(&p));
                assert_eq!(inside, !(x >= 4 && y >= 4), "point {p}");
            }
        }
    }

    #[test]
    fn parallel_discovery_matches_serial() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(3)
            .build()
            .unwrap();
        let dims = DimSet::new("t", ["x"], Vec::<String>::new());
        let ofs = Indices(vec![0]);
        let store = VarStore::new();
        let cluster = dims.cluster_pts();
        let ctx = EvalCtx {
            store: &store,
            scratch: &[],
            rank_offsets: &ofs,
            fold_pts: dims.fold_pts(),
            cluster_pts: &cluster,
        };
        let b = MaskedBundle { modulus: 3 };
        let serial = find_bounding_boxes(&b, &ctx, &ext_bb(30), &env_1d(&dims, &ofs), None);
        let par = find_bounding_boxes(&b, &ctx, &ext_bb(30), &env_1d(&dims, &ofs), Some(&pool));
        assert_eq!(serial.outer.num_points, par.outer.num_points);
        let count = |bbs: &BundleBBs| -> Idx { bbs.list.iter().map(|b| b.size).sum() };
        assert_eq!(count(&serial), count(&par));
    }
}
