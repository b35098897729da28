//! Index tuples
//!
//! Two representations are used throughout the engine. [`IdxTuple`] carries
//! dimension names and is used for setup-time bookkeeping and messages.
//! [`Indices`] is a bare vector of coordinates used on hot paths where the
//! dimension order is fixed by context.

use crate::{div_flr, mod_flr, Idx};
use std::fmt;

/// Plain n-D point, with the dimension order implied by context
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Indices(pub Vec<Idx>);

impl Indices {
    /// All-`val` point of dimensionality `ndims`
    pub fn new(val: Idx, ndims: usize) -> Self {
        Self(vec![val; ndims])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Element-wise binary operation against another point
    pub fn zip_with(&self, other: &Self, mut f: impl FnMut(Idx, Idx) -> Idx) -> Self {
        assert_eq!(self.len(), other.len());
        Self(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        )
    }

    pub fn add(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn min(&self, other: &Self) -> Self {
        self.zip_with(other, Idx::min)
    }

    pub fn max(&self, other: &Self) -> Self {
        self.zip_with(other, Idx::max)
    }

    /// Element-wise floored division
    pub fn div_flr(&self, other: &Self) -> Self {
        self.zip_with(other, div_flr)
    }

    /// Element-wise floored modulo
    pub fn mod_flr(&self, other: &Self) -> Self {
        self.zip_with(other, mod_flr)
    }

    pub fn add_scalar(&self, v: Idx) -> Self {
        Self(self.0.iter().map(|&a| a + v).collect())
    }

    pub fn product(&self) -> Idx {
        self.0.iter().product()
    }

    pub fn max_elem(&self) -> Idx {
        self.0.iter().copied().max().unwrap_or(0)
    }

    pub fn min_elem(&self) -> Idx {
        self.0.iter().copied().min().unwrap_or(0)
    }
}

impl std::ops::Index<usize> for Indices {
    type Output = Idx;
    fn index(&self, i: usize) -> &Idx {
        &self.0[i]
    }
}

impl std::ops::IndexMut<usize> for Indices {
    fn index_mut(&mut self, i: usize) -> &mut Idx {
        &mut self.0[i]
    }
}

impl fmt::Display for Indices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

impl From<&[Idx]> for Indices {
    fn from(v: &[Idx]) -> Self {
        Self(v.to_vec())
    }
}

/// Named n-D tuple with row-major layout support
///
/// The first dimension is the outermost (slowest-varying) one, matching the
/// in-memory layout of the variable store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdxTuple {
    names: Vec<String>,
    vals: Vec<Idx>,
}

impl IdxTuple {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tuple with the given names, all values zero
    pub fn with_names<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> Self {
        let names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_owned()).collect();
        let vals = vec![0; names.len()];
        Self { names, vals }
    }

    pub fn push_back(&mut self, name: impl Into<String>, val: Idx) {
        self.names.push(name.into());
        self.vals.push(val);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn name(&self, posn: usize) -> &str {
        &self.names[posn]
    }

    pub fn vals(&self) -> &[Idx] {
        &self.vals
    }

    /// Position of a dimension name, if present
    pub fn posn_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, name: &str) -> Option<Idx> {
        self.posn_of(name).map(|p| self.vals[p])
    }

    pub fn set(&mut self, name: &str, val: Idx) -> bool {
        match self.posn_of(name) {
            Some(p) => {
                self.vals[p] = val;
                true
            }
            None => false,
        }
    }

    pub fn set_all(&mut self, val: Idx) {
        self.vals.iter_mut().for_each(|v| *v = val);
    }

    /// Copy values from `other` for every dimension name both tuples share
    pub fn set_from(&mut self, other: &IdxTuple) {
        for (n, &v) in other.names.iter().zip(&other.vals) {
            self.set(n, v);
        }
    }

    pub fn indices(&self) -> Indices {
        Indices(self.vals.clone())
    }

    pub fn set_indices(&mut self, idxs: &Indices) {
        assert_eq!(idxs.len(), self.vals.len());
        self.vals.copy_from_slice(&idxs.0);
    }

    pub fn product(&self) -> Idx {
        self.vals.iter().product()
    }

    pub fn max_elem(&self) -> Idx {
        self.vals.iter().copied().max().unwrap_or(0)
    }

    /// Row-major linear offset of `pt`, treating this tuple as sizes
    ///
    /// `pt` must hold per-dim coordinates in `[0, size)`.
    pub fn layout(&self, pt: &Indices) -> Idx {
        assert_eq!(pt.len(), self.len());
        let mut ofs = 0;
        for (d, &sz) in self.vals.iter().enumerate() {
            debug_assert!(pt[d] >= 0 && pt[d] < sz, "index {} out of {sz}", pt[d]);
            ofs = ofs * sz + pt[d];
        }
        ofs
    }

    /// Inverse of [`layout`](Self::layout): decode a linear offset
    pub fn unlayout(&self, mut ofs: Idx) -> Indices {
        let mut pt = Indices::new(0, self.len());
        for d in (0..self.len()).rev() {
            let sz = self.vals[d];
            pt[d] = mod_flr(ofs, sz);
            ofs = div_flr(ofs, sz);
        }
        pt
    }

    /// Visit every point of the box `[0, sizes)` in row-major order
    ///
    /// The visitor receives the point and its linear offset and may return
    /// `false` to stop the walk early. Returns `false` iff stopped early.
    pub fn visit_all_points(&self, mut visitor: impl FnMut(&Indices, Idx) -> bool) -> bool {
        let n = self.len();
        if self.vals.iter().any(|&s| s <= 0) {
            return true;
        }
        let mut pt = Indices::new(0, n);
        let total = self.product();
        for ofs in 0..total {
            if !visitor(&pt, ofs) {
                return false;
            }
            // Row-major increment, innermost dim fastest.
            for d in (0..n).rev() {
                pt[d] += 1;
                if pt[d] < self.vals[d] {
                    break;
                }
                pt[d] = 0;
            }
        }
        true
    }

    /// Render as `name1=val1, name2=val2, ...`
    pub fn make_dim_val_str(&self, sep: &str) -> String {
        self.names
            .iter()
            .zip(&self.vals)
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(sep)
    }
}

impl fmt::Display for IdxTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.make_dim_val_str(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(v: &[Idx]) -> IdxTuple {
        let mut t = IdxTuple::new();
        for (i, &s) in v.iter().enumerate() {
            t.push_back(format!("d{i}"), s);
        }
        t
    }

    #[test]
    fn layout_roundtrip() {
        let t = sizes(&[3, 4, 5]);
        let mut seen = 0;
        t.visit_all_points(|pt, ofs| {
            assert_eq!(t.layout(pt), ofs);
            assert_eq!(&t.unlayout(ofs), pt);
            seen += 1;
            true
        });
        assert_eq!(seen, 60);
    }

    #[test]
    fn row_major_order_is_inner_fastest() {
        let t = sizes(&[2, 3]);
        let mut pts = Vec::new();
        t.visit_all_points(|pt, _| {
            pts.push((pt[0], pt[1]));
            true
        });
        assert_eq!(pts[0], (0, 0));
        assert_eq!(pts[1], (0, 1));
        assert_eq!(pts[3], (1, 0));
    }

    #[test]
    fn early_stop() {
        let t = sizes(&[10]);
        let mut n = 0;
        let finished = t.visit_all_points(|_, _| {
            n += 1;
            n < 3
        });
        assert!(!finished);
        assert_eq!(n, 3);
    }

    #[test]
    fn named_access() {
        let mut t = IdxTuple::new();
        t.push_back("x", 7);
        t.push_back("y", 9);
        assert_eq!(t.get("y"), Some(9));
        assert!(t.set("x", 3));
        assert!(!t.set("z", 1));
        assert_eq!(t.indices().0, vec![3, 9]);
    }
}
