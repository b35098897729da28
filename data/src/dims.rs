//! Dimension sets for a solution
//!
//! A solution has exactly one step dimension, an ordered list of domain
//! dimensions and zero or more misc dimensions. The "solution index" order
//! used by the schedulers is `[step, domain...]` with the step at position
//! zero, so helpers here translate between solution positions and
//! domain-dim positions.

use crate::idx::{Indices, IdxTuple};
use crate::{Idx, round_up};

/// Kind of a dimension
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DimKind {
    /// The distinguished time-like axis
    Step,
    /// A spatial axis decomposed across ranks
    Domain,
    /// A per-variable extra axis, never decomposed nor haloed
    Misc,
}

/// Problem dimensions (names and SIMD folding), not sizes
#[derive(Clone, Debug)]
pub struct DimSet {
    step_dim: String,
    domain_dims: Vec<String>,
    misc_dims: Vec<String>,

    /// Vector-fold length per domain dim (1 in unfolded dims)
    fold_pts: Indices,

    /// Cluster multiple per domain dim (in vectors)
    cluster_mults: Indices,

    /// Step direction: +1 forward, -1 backward, 0 undetermined
    step_dir: Idx,
}

impl DimSet {
    pub fn new(
        step_dim: impl Into<String>,
        domain_dims: impl IntoIterator<Item = impl Into<String>>,
        misc_dims: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let domain_dims: Vec<String> = domain_dims.into_iter().map(Into::into).collect();
        assert!(!domain_dims.is_empty(), "need at least one domain dim");
        let n = domain_dims.len();
        Self {
            step_dim: step_dim.into(),
            domain_dims,
            misc_dims: misc_dims.into_iter().map(Into::into).collect(),
            fold_pts: Indices::new(1, n),
            cluster_mults: Indices::new(1, n),
            step_dir: 0,
        }
    }

    /// Set the vector fold supplied by the stencil compiler
    pub fn set_fold(&mut self, fold_pts: Indices) {
        assert_eq!(fold_pts.len(), self.domain_dims.len());
        assert!(fold_pts.0.iter().all(|&f| f >= 1));
        self.fold_pts = fold_pts;
    }

    /// Set the cluster multiples supplied by the stencil compiler
    pub fn set_cluster_mults(&mut self, mults: Indices) {
        assert_eq!(mults.len(), self.domain_dims.len());
        assert!(mults.0.iter().all(|&m| m >= 1));
        self.cluster_mults = mults;
    }

    pub fn step_dim(&self) -> &str {
        &self.step_dim
    }

    pub fn domain_dims(&self) -> &[String] {
        &self.domain_dims
    }

    pub fn misc_dims(&self) -> &[String] {
        &self.misc_dims
    }

    /// Number of domain dims
    pub fn ndd(&self) -> usize {
        self.domain_dims.len()
    }

    /// Number of solution dims (step + domain)
    pub fn nsd(&self) -> usize {
        self.ndd() + 1
    }

    /// Position of the step dim in solution order
    pub const STEP_POSN: usize = 0;

    /// Map a domain-dim position to its solution position
    #[inline]
    pub fn soln_posn(dd: usize) -> usize {
        dd + 1
    }

    /// Map a solution position to its domain-dim position, if any
    #[inline]
    pub fn domain_posn(sp: usize) -> Option<usize> {
        sp.checked_sub(1)
    }

    /// Innermost domain dim (unit stride in memory)
    pub fn inner_posn(&self) -> usize {
        self.ndd() - 1
    }

    /// Outermost domain dim
    pub fn outer_posn(&self) -> usize {
        0
    }

    pub fn fold_pts(&self) -> &Indices {
        &self.fold_pts
    }

    pub fn cluster_mults(&self) -> &Indices {
        &self.cluster_mults
    }

    /// Cluster size in elements per domain dim (fold * multiple)
    pub fn cluster_pts(&self) -> Indices {
        self.fold_pts.zip_with(&self.cluster_mults, |f, m| f * m)
    }

    /// Total elements in one vector fold
    pub fn fold_size(&self) -> Idx {
        self.fold_pts.product()
    }

    pub fn step_dir(&self) -> Idx {
        self.step_dir
    }

    pub fn set_step_dir(&mut self, dir: Idx) {
        self.step_dir = dir.signum();
    }

    /// Kind of a named dimension, if it belongs to this set
    pub fn kind_of(&self, name: &str) -> Option<DimKind> {
        if name == self.step_dim {
            Some(DimKind::Step)
        } else if self.domain_dims.iter().any(|d| d == name) {
            Some(DimKind::Domain)
        } else if self.misc_dims.iter().any(|d| d == name) {
            Some(DimKind::Misc)
        } else {
            None
        }
    }

    /// Named tuple over the domain dims, all values zero
    pub fn new_domain_tuple(&self) -> IdxTuple {
        IdxTuple::with_names(&self.domain_dims)
    }

    /// Named tuple over `[step, domain...]`, all values zero
    pub fn new_soln_tuple(&self) -> IdxTuple {
        let mut t = IdxTuple::new();
        t.push_back(self.step_dim.clone(), 0);
        for d in &self.domain_dims {
            t.push_back(d.clone(), 0);
        }
        t
    }

    /// Round a per-domain-dim quantity up to whole folds
    pub fn round_up_to_fold(&self, v: &Indices) -> Indices {
        v.zip_with(&self.fold_pts, round_up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posn_mapping() {
        let d = DimSet::new("t", ["x", "y", "z"], Vec::<String>::new());
        assert_eq!(d.nsd(), 4);
        assert_eq!(DimSet::soln_posn(0), 1);
        assert_eq!(DimSet::domain_posn(0), None);
        assert_eq!(DimSet::domain_posn(3), Some(2));
        assert_eq!(d.inner_posn(), 2);
    }

    #[test]
    fn cluster_points() {
        let mut d = DimSet::new("t", ["x", "y"], Vec::<String>::new());
        d.set_fold(Indices(vec![4, 2]));
        d.set_cluster_mults(Indices(vec![1, 2]));
        assert_eq!(d.cluster_pts().0, vec![4, 4]);
        assert_eq!(d.fold_size(), 8);
    }

    #[test]
    fn dim_kinds() {
        let d = DimSet::new("t", ["x"], ["c"]);
        assert_eq!(d.kind_of("t"), Some(DimKind::Step));
        assert_eq!(d.kind_of("x"), Some(DimKind::Domain));
        assert_eq!(d.kind_of("c"), Some(DimKind::Misc));
        assert_eq!(d.kind_of("q"), None);
    }
}
