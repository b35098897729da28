//! Rectangular bounding boxes over the domain dims
//!
//! Boxes use half-open `[begin, end)` ranges in global element coordinates.

use crate::idx::{Indices, IdxTuple};
use crate::{mod_flr, round_up, Idx};

/// n-D axis-aligned box with derived convenience values
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundingBox {
    pub begin: Indices,
    pub end: Indices,

    /// Per-dim lengths, `end - begin`
    pub len: Indices,

    /// Product of lengths
    pub size: Idx,

    /// Number of valid points inside the box (== `size` for solid boxes)
    pub num_points: Idx,

    /// Valid points fill the whole box
    pub is_full: bool,

    /// Every `begin - rank_offset` is a multiple of the vector fold
    pub is_aligned: bool,

    /// Every length is a multiple of the cluster size
    pub is_cluster_mult: bool,

    /// Derived values are up to date
    pub valid: bool,
}

impl BoundingBox {
    pub fn new(begin: Indices, end: Indices) -> Self {
        assert_eq!(begin.len(), end.len());
        Self {
            begin,
            end,
            ..Self::default()
        }
    }

    pub fn ndims(&self) -> usize {
        self.begin.len()
    }

    /// Recompute derived values
    ///
    /// `rank_offsets`, `fold_pts` and `cluster_pts` are per-domain-dim.
    /// When `force_full` is set, `num_points` is reset to the box size.
    pub fn update(
        &mut self,
        rank_offsets: &Indices,
        fold_pts: &Indices,
        cluster_pts: &Indices,
        force_full: bool,
    ) {
        self.len = self.end.zip_with(&self.begin, |e, b| (e - b).max(0));
        self.size = self.len.product();
        if force_full {
            self.num_points = self.size;
        }
        self.is_full = self.num_points == self.size;

        self.is_aligned = (0..self.ndims())
            .all(|d| mod_flr(self.begin[d] - rank_offsets[d], fold_pts[d]) == 0);

        self.is_cluster_mult = (0..self.ndims()).all(|d| mod_flr(self.len[d], cluster_pts[d]) == 0);

        self.valid = true;
    }

    /// Is `pt` inside the box?
    pub fn contains_point(&self, pt: &Indices) -> bool {
        (0..self.ndims()).all(|d| pt[d] >= self.begin[d] && pt[d] < self.end[d])
    }

    /// Is this box entirely inside `other`?
    pub fn subset(&self, other: &BoundingBox) -> bool {
        (0..self.ndims()).all(|d| self.begin[d] >= other.begin[d] && self.end[d] <= other.end[d])
    }

    /// Intersection with `other`, or `None` when empty
    pub fn intersect(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let begin = self.begin.max(&other.begin);
        let end = self.end.min(&other.end);
        if (0..self.ndims()).any(|d| end[d] <= begin[d]) {
            return None;
        }
        Some(BoundingBox::new(begin, end))
    }

    /// Grow `end` so every length is a multiple of `mults`
    pub fn round_up_to(&mut self, mults: &Indices) {
        for d in 0..self.ndims() {
            let len = (self.end[d] - self.begin[d]).max(0);
            self.end[d] = self.begin[d] + round_up(len, mults[d]);
        }
        self.valid = false;
    }

    /// Lengths as a named tuple for messages
    pub fn len_tuple(&self, names: &[String]) -> IdxTuple {
        let mut t = IdxTuple::with_names(names);
        t.set_indices(&self.len);
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones(n: usize) -> Indices {
        Indices::new(1, n)
    }

    fn make(b: &[Idx], e: &[Idx]) -> BoundingBox {
        let mut bb = BoundingBox::new(Indices(b.to_vec()), Indices(e.to_vec()));
        bb.update(&Indices::new(0, b.len()), &ones(b.len()), &ones(b.len()), true);
        bb
    }

    #[test]
    fn derived_values() {
        let bb = make(&[2, 2], &[6, 4]);
        assert_eq!(bb.len.0, vec![4, 2]);
        assert_eq!(bb.size, 8);
        assert!(bb.is_full && bb.is_aligned && bb.is_cluster_mult && bb.valid);
    }

    #[test]
    fn alignment_flags() {
        let mut bb = BoundingBox::new(Indices(vec![3]), Indices(vec![11]));
        bb.update(&Indices(vec![0]), &Indices(vec![4]), &Indices(vec![4]), true);
        assert!(!bb.is_aligned);
        assert!(bb.is_cluster_mult);

        let mut bb = BoundingBox::new(Indices(vec![4]), Indices(vec![10]));
        bb.update(&Indices(vec![0]), &Indices(vec![4]), &Indices(vec![4]), true);
        assert!(bb.is_aligned);
        assert!(!bb.is_cluster_mult);
    }

    #[test]
    fn intersection() {
        let a = make(&[0, 0], &[4, 4]);
        let b = make(&[2, 1], &[8, 3]);
        let i = a.intersect(&b).unwrap();
        assert_eq!(i.begin.0, vec![2, 1]);
        assert_eq!(i.end.0, vec![4, 3]);
        let c = make(&[4, 0], &[5, 4]);
        assert!(a.intersect(&c).is_none());
        assert!(i.subset(&a) && i.subset(&b));
    }

    #[test]
    fn point_membership() {
        let a = make(&[0, 0], &[4, 4]);
        assert!(a.contains_point(&Indices(vec![3, 0])));
        assert!(!a.contains_point(&Indices(vec![4, 0])));
        assert!(!a.contains_point(&Indices(vec![-1, 2])));
    }

    #[test]
    fn rounding() {
        let mut a = make(&[1, 1], &[4, 6]);
        a.round_up_to(&Indices(vec![4, 4]));
        assert_eq!(a.end.0, vec![5, 9]);
    }
}
