//! Variable store
//!
//! A variable is an n-D array over a subset of the solution dims. Domain
//! dims carry halos, padding, wave-front extensions and a vector-fold
//! length; the step dim is stored as a circular window of `alloc_steps`
//! live steps; misc dims are plain extents starting at zero.
//!
//! In-memory layout is vector-folded: each domain dim is split into a
//! vector index and an in-fold offset, the vector grid is laid out
//! row-major in variable dim order, and the fold elements of one vector
//! are contiguous. With fold lengths of 1 this degenerates to a plain
//! row-major array. Slice APIs always present a row-major element view.

use crate::dims::DimKind;
use crate::idx::{Indices, IdxTuple};
use crate::pool::{PoolKey, PoolPlanner, PoolTicket, Storage};
use crate::{div_flr, mod_flr, round_up, Idx, Precision, StorageError};
use log::trace;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering::Relaxed};

/// Per-dimension metadata of one variable
#[derive(Debug)]
pub struct VarDim {
    pub name: String,
    pub kind: DimKind,

    /// Elements owned by this rank (or the full extent for misc/fixed dims)
    pub domain_size: Idx,

    pub left_halo: Idx,
    pub right_halo: Idx,

    /// Allocated padding; must cover halo + wave-front extension
    pub left_pad: Idx,
    pub right_pad: Idx,

    pub left_wf_ext: Idx,
    pub right_wf_ext: Idx,

    /// Global index of element 0 of this rank's domain
    pub rank_offset: Idx,

    /// Extra offset of scratch variables, updated per mini-block
    pub local_offset: Idx,

    /// Vector-fold length (1 for unfolded, step and misc dims)
    pub fold_len: Idx,
}

impl VarDim {
    pub fn domain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DimKind::Domain,
            domain_size: 0,
            left_halo: 0,
            right_halo: 0,
            left_pad: 0,
            right_pad: 0,
            left_wf_ext: 0,
            right_wf_ext: 0,
            rank_offset: 0,
            local_offset: 0,
            fold_len: 1,
        }
    }

    pub fn step(name: impl Into<String>) -> Self {
        Self {
            kind: DimKind::Step,
            ..Self::domain(name)
        }
    }

    pub fn misc(name: impl Into<String>, size: Idx) -> Self {
        Self {
            kind: DimKind::Misc,
            domain_size: size,
            ..Self::domain(name)
        }
    }

    /// Allocated extent of this dim, before fold rounding
    fn alloc_len(&self) -> Idx {
        match self.kind {
            DimKind::Domain => self.left_pad + self.domain_size + self.right_pad,
            _ => self.domain_size,
        }
    }

    /// Global index of the first allocated element
    fn first_alloc(&self) -> Idx {
        match self.kind {
            DimKind::Domain => self.rank_offset + self.local_offset - self.left_pad,
            _ => 0,
        }
    }
}

/// Index of a variable inside a [`VarStore`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub usize);

/// One multi-dimensional variable
#[derive(Debug)]
pub struct Var {
    name: String,
    dims: Vec<VarDim>,
    step_posn: Option<usize>,

    /// Live steps held in memory (1 when there is no step dim)
    alloc_steps: Idx,

    /// Valid-step window, advanced by writes
    first_valid_step: AtomicI64,
    last_valid_step: AtomicI64,

    /// Per-live-step staleness flag, indexed by step slot
    dirty: Vec<AtomicBool>,

    storage: Option<Storage>,

    /// Rounded per-dim extents and fold grid, set when storage is sized
    alloc_sizes: Indices,
    vec_sizes: Indices,

    fixed_size: bool,
    scratch: bool,
    step_wrap: bool,
    pool_key: PoolKey,
}

impl Var {
    /// Solution-sized variable; sizes are filled in by the solution setup
    pub fn new(name: impl Into<String>, dims: Vec<VarDim>) -> Self {
        let name = name.into();
        let step_posn = dims.iter().position(|d| d.kind == DimKind::Step);
        let n = dims.len();
        Self {
            name,
            dims,
            step_posn,
            alloc_steps: 1,
            first_valid_step: AtomicI64::new(0),
            last_valid_step: AtomicI64::new(-1),
            dirty: vec![AtomicBool::new(false)],
            storage: None,
            alloc_sizes: Indices::new(0, n),
            vec_sizes: Indices::new(0, n),
            fixed_size: false,
            scratch: false,
            step_wrap: false,
            pool_key: PoolKey::Local,
        }
    }

    /// Fixed-size variable: not auto-resized, not domain-decomposed
    pub fn new_fixed_size(name: impl Into<String>, dims: Vec<(String, Idx)>) -> Self {
        let dims = dims
            .into_iter()
            .map(|(n, sz)| VarDim::misc(n, sz))
            .collect();
        let mut v = Self::new(name, dims);
        v.fixed_size = true;
        v
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[VarDim] {
        &self.dims
    }

    pub fn dims_mut(&mut self) -> &mut [VarDim] {
        &mut self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn posn_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == dim)
    }

    pub fn is_dim_used(&self, dim: &str) -> bool {
        self.posn_of(dim).is_some()
    }

    pub fn dim(&self, posn: usize) -> &VarDim {
        &self.dims[posn]
    }

    pub fn dim_mut(&mut self, posn: usize) -> &mut VarDim {
        &mut self.dims[posn]
    }

    pub fn step_posn(&self) -> Option<usize> {
        self.step_posn
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }

    pub fn is_scratch(&self) -> bool {
        self.scratch
    }

    pub fn set_scratch(&mut self, scratch: bool) {
        self.scratch = scratch;
    }

    pub fn set_step_wrap(&mut self, wrap: bool) {
        self.step_wrap = wrap;
    }

    pub fn pool_key(&self) -> PoolKey {
        self.pool_key
    }

    pub fn set_pool_key(&mut self, key: PoolKey) {
        self.pool_key = key;
    }

    pub fn alloc_steps(&self) -> Idx {
        self.alloc_steps
    }

    /// Set the number of live steps held in memory
    pub fn set_alloc_steps(&mut self, n: Idx) {
        assert!(n >= 1);
        assert!(self.storage.is_none(), "cannot resize an allocated var");
        self.alloc_steps = n;
        self.dirty = (0..n).map(|_| AtomicBool::new(false)).collect();
        self.first_valid_step.store(0, Relaxed);
        self.last_valid_step.store(n - 1, Relaxed);
    }

    // ----- valid-step window and dirty map -----

    pub fn first_valid_step(&self) -> Idx {
        self.first_valid_step.load(Relaxed)
    }

    pub fn last_valid_step(&self) -> Idx {
        self.last_valid_step.load(Relaxed)
    }

    pub fn is_valid_step(&self, t: Idx) -> bool {
        self.step_posn.is_none()
            || (t >= self.first_valid_step() && t <= self.last_valid_step())
    }

    /// Advance the valid window so that step `t` is its newest member
    ///
    /// Dirty flags of steps that fall out of the window are cleared.
    pub fn update_valid_step(&self, t: Idx) {
        if self.step_posn.is_none() {
            return;
        }
        let last = self.last_valid_step();
        if t > last {
            for old in self.first_valid_step()..=(t - self.alloc_steps) {
                self.dirty[self.step_slot(old)].store(false, Relaxed);
            }
            self.last_valid_step.store(t, Relaxed);
            self.first_valid_step.store(t - self.alloc_steps + 1, Relaxed);
        } else if t < self.first_valid_step() {
            // Backward-stepping solutions slide the window down.
            self.first_valid_step.store(t, Relaxed);
            self.last_valid_step.store(t + self.alloc_steps - 1, Relaxed);
        }
    }

    fn step_slot(&self, t: Idx) -> usize {
        mod_flr(t, self.alloc_steps) as usize
    }

    pub fn is_dirty(&self, t: Idx) -> bool {
        self.is_valid_step(t) && self.dirty[self.step_slot(t)].load(Relaxed)
    }

    pub fn set_dirty(&self, dirty: bool, t: Idx) {
        self.dirty[self.step_slot(t)].store(dirty, Relaxed);
    }

    pub fn set_dirty_all(&self, dirty: bool) {
        for d in &self.dirty {
            d.store(dirty, Relaxed);
        }
    }

    pub fn has_dirty_step(&self) -> bool {
        self.step_posn.is_some()
            && (self.first_valid_step()..=self.last_valid_step()).any(|t| self.is_dirty(t))
    }

    /// Check a step index under the strict/wrap rules
    ///
    /// `Ok(true)` means the access may proceed (possibly step-aliased);
    /// `Ok(false)` means a non-strict access should see no data.
    fn check_step(&self, t: Idx, strict: bool) -> Result<bool, StorageError> {
        if self.is_valid_step(t) || self.step_wrap {
            Ok(true)
        } else if !strict {
            Ok(false)
        } else {
            Err(StorageError::InvalidStep {
                var: self.name.clone(),
                step: t,
                first: self.first_valid_step(),
                last: self.last_valid_step(),
            })
        }
    }

    // ----- storage sizing and allocation -----

    /// Elements needed for the current metadata
    ///
    /// Also freezes the rounded per-dim extents used by the index mapping:
    /// folded dims are rounded up to whole vectors.
    pub fn update_alloc_sizes(&mut self) {
        let n = self.ndims();
        let mut alloc = Indices::new(0, n);
        let mut vecs = Indices::new(0, n);
        for (d, vd) in self.dims.iter().enumerate() {
            let len = match vd.kind {
                DimKind::Step => self.alloc_steps,
                _ => round_up(vd.alloc_len(), vd.fold_len),
            };
            alloc[d] = len;
            vecs[d] = len / vd.fold_len;
        }
        self.alloc_sizes = alloc;
        self.vec_sizes = vecs;
    }

    pub fn alloc_size(&self) -> Idx {
        self.alloc_sizes.product()
    }

    /// Register this var's storage requirement with a pool planner
    pub fn plan_alloc(&mut self, planner: &mut PoolPlanner) -> PoolTicket {
        self.update_alloc_sizes();
        planner.request(self.name.clone(), self.pool_key, self.alloc_size() as usize, 0)
    }

    pub fn set_storage(&mut self, storage: Storage) {
        assert_eq!(storage.len() as Idx, self.alloc_size());
        trace!(
            "var '{}': storage of {} elements attached",
            self.name,
            storage.len()
        );
        self.storage = Some(storage);
    }

    /// Allocate outside any planned pool (tests, fixed-size vars)
    pub fn alloc_storage(&mut self) {
        self.update_alloc_sizes();
        self.storage = Some(Storage::standalone(self.alloc_size() as usize));
    }

    pub fn release_storage(&mut self) {
        self.storage = None;
    }

    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    /// Share another variable's storage
    ///
    /// Fails when the dim lists, folds or rounded extents differ.
    pub fn fuse_vars(&mut self, other: &Var) -> Result<(), StorageError> {
        let self_name = self.name.clone();
        let other_name = other.name.clone();
        let mismatch = |why: &str| {
            Err(StorageError::FuseMismatch(
                self_name.clone(),
                other_name.clone(),
                why.into(),
            ))
        };
        if self.ndims() != other.ndims() {
            return mismatch("different dim counts");
        }
        for (a, b) in self.dims.iter().zip(other.dims.iter()) {
            if a.name != b.name || a.kind != b.kind {
                return mismatch("different dim lists");
            }
            if a.fold_len != b.fold_len {
                return mismatch("different vector folds");
            }
        }
        self.update_alloc_sizes();
        if self.alloc_sizes != other.alloc_sizes {
            return mismatch("different allocated extents");
        }
        match &other.storage {
            Some(s) => {
                self.storage = Some(s.clone());
                Ok(())
            }
            None => mismatch("other variable has no storage"),
        }
    }

    // ----- element access -----

    /// Linear element offset of a global point, `None` outside the allocation
    fn offset_of(&self, pt: &[Idx]) -> Option<usize> {
        debug_assert_eq!(pt.len(), self.ndims());
        let fold_size: Idx = self.dims.iter().map(|d| d.fold_len).product();
        let mut vec_ofs: Idx = 0;
        let mut fold_ofs: Idx = 0;
        for (d, vd) in self.dims.iter().enumerate() {
            let local = match vd.kind {
                DimKind::Step => self.step_slot(pt[d]) as Idx,
                _ => pt[d] - vd.first_alloc(),
            };
            if local < 0 || local >= self.alloc_sizes[d] {
                return None;
            }
            vec_ofs = vec_ofs * self.vec_sizes[d] + div_flr(local, vd.fold_len);
            fold_ofs = fold_ofs * vd.fold_len + mod_flr(local, vd.fold_len);
        }
        Some((vec_ofs * fold_size + fold_ofs) as usize)
    }

    fn storage_ref(&self) -> Result<&Storage, StorageError> {
        self.storage
            .as_ref()
            .ok_or_else(|| StorageError::Unallocated(self.name.clone()))
    }

    fn oob(&self, pt: &[Idx]) -> StorageError {
        // Report the first offending dim for the message.
        for (d, vd) in self.dims.iter().enumerate() {
            let local = match vd.kind {
                DimKind::Step => continue,
                _ => pt[d] - vd.first_alloc(),
            };
            if local < 0 || local >= self.alloc_sizes[d] {
                return StorageError::OutOfBounds {
                    var: self.name.clone(),
                    dim: vd.name.clone(),
                    index: pt[d],
                };
            }
        }
        StorageError::OutOfBounds {
            var: self.name.clone(),
            dim: self.dims[0].name.clone(),
            index: pt[0],
        }
    }

    /// Read one element; non-strict reads outside the allocation return 0
    pub fn get_element(&self, pt: &[Idx], strict: bool) -> Result<Precision, StorageError> {
        let storage = self.storage_ref()?;
        if let Some(sp) = self.step_posn {
            if !self.check_step(pt[sp], strict)? {
                return Ok(0.0 as Precision);
            }
        }
        match self.offset_of(pt) {
            Some(o) => Ok(storage.get(o)),
            None if !strict => Ok(0.0 as Precision),
            None => Err(self.oob(pt)),
        }
    }

    /// Write one element; returns whether the write landed
    ///
    /// Non-strict writes outside the allocation are silently dropped.
    pub fn set_element(&self, pt: &[Idx], v: Precision, strict: bool) -> Result<bool, StorageError> {
        let storage = self.storage_ref()?;
        if let Some(sp) = self.step_posn {
            if !self.check_step(pt[sp], strict)? {
                return Ok(false);
            }
        }
        match self.offset_of(pt) {
            Some(o) => {
                storage.set(o, v);
                self.mark_written(pt);
                Ok(true)
            }
            None if !strict => Ok(false),
            None => Err(self.oob(pt)),
        }
    }

    /// Atomically add to one element (safe under concurrent calls)
    pub fn add_to_element(&self, pt: &[Idx], v: Precision) -> Result<bool, StorageError> {
        let storage = self.storage_ref()?;
        if let Some(sp) = self.step_posn {
            self.check_step(pt[sp], true)?;
        }
        match self.offset_of(pt) {
            Some(o) => {
                storage.fetch_add(o, v);
                self.mark_written(pt);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// API writes leave the halo stale until the next exchange
    fn mark_written(&self, pt: &[Idx]) {
        match self.step_posn {
            Some(sp) => self.set_dirty(true, pt[sp]),
            None => self.set_dirty(true, 0),
        }
    }

    /// Unchecked fast-path read used by inner kernels
    ///
    /// Callers must stay inside the allocation; debug builds assert it.
    #[inline]
    pub fn read_elem(&self, pt: &[Idx]) -> Precision {
        let o = self.offset_of(pt);
        debug_assert!(o.is_some(), "read outside allocation of '{}'", self.name);
        match (o, &self.storage) {
            (Some(o), Some(s)) => s.get(o),
            _ => 0.0 as Precision,
        }
    }

    /// Unchecked fast-path write used by inner kernels
    #[inline]
    pub fn write_elem(&self, pt: &[Idx], v: Precision) {
        let o = self.offset_of(pt);
        debug_assert!(o.is_some(), "write outside allocation of '{}'", self.name);
        if let (Some(o), Some(s)) = (o, &self.storage) {
            s.set(o, v);
        }
    }

    // ----- bulk slice access -----

    /// Sizes of the inclusive range `[first, last]`
    fn range_sizes(&self, first: &[Idx], last: &[Idx]) -> IdxTuple {
        let mut t = IdxTuple::new();
        for (d, vd) in self.dims.iter().enumerate() {
            t.push_back(vd.name.clone(), (last[d] - first[d] + 1).max(0));
        }
        t
    }

    /// Copy the inclusive range `[first, last]` into `buf`, row-major
    ///
    /// Points outside the allocation read as 0. Returns elements copied.
    pub fn get_elements_in_slice(
        &self,
        buf: &mut [Precision],
        first: &[Idx],
        last: &[Idx],
    ) -> Result<usize, StorageError> {
        let sizes = self.range_sizes(first, last);
        let want = sizes.product() as usize;
        if buf.len() < want {
            return Err(StorageError::SliceLen {
                got: buf.len(),
                want,
            });
        }
        self.storage_ref()?;
        let mut pt = vec![0; self.ndims()];
        sizes.visit_all_points(|ofs, lin| {
            for d in 0..pt.len() {
                pt[d] = first[d] + ofs[d];
            }
            buf[lin as usize] = match self.offset_of(&pt) {
                Some(o) => self.storage.as_ref().map_or(0.0, |s| s.get(o)),
                None => 0.0 as Precision,
            };
            true
        });
        Ok(want)
    }

    /// Write `buf` (row-major) over the inclusive range `[first, last]`
    ///
    /// Points outside the allocation are skipped. Returns elements read
    /// from `buf`.
    pub fn set_elements_in_slice(
        &self,
        buf: &[Precision],
        first: &[Idx],
        last: &[Idx],
    ) -> Result<usize, StorageError> {
        let sizes = self.range_sizes(first, last);
        let want = sizes.product() as usize;
        if buf.len() < want {
            return Err(StorageError::SliceLen {
                got: buf.len(),
                want,
            });
        }
        let storage = self.storage_ref()?;
        let mut pt = vec![0; self.ndims()];
        sizes.visit_all_points(|ofs, lin| {
            for d in 0..pt.len() {
                pt[d] = first[d] + ofs[d];
            }
            if let Some(o) = self.offset_of(&pt) {
                storage.set(o, buf[lin as usize]);
            }
            true
        });
        Ok(want)
    }

    /// Whole-vector copy of a fold-aligned range, used by halo packing
    ///
    /// `first` must be fold-aligned relative to the allocation and the
    /// range must cover whole vectors in every folded dim; the caller
    /// checks this once per buffer (`vec_copy_ok`). The element order in
    /// `buf` is the storage order of the vectors, so the peer unpacks with
    /// the same routine.
    pub fn get_vecs_in_slice(
        &self,
        buf: &mut [Precision],
        first: &[Idx],
        last: &[Idx],
    ) -> Result<usize, StorageError> {
        let storage = self.storage_ref()?;
        let fold_size: Idx = self.dims.iter().map(|d| d.fold_len).product();
        let nvecs = self.visit_vecs(first, last, |lin_vec, o| {
            for k in 0..fold_size as usize {
                buf[lin_vec * fold_size as usize + k] = storage.get(o + k);
            }
        })?;
        Ok(nvecs * fold_size as usize)
    }

    /// Inverse of [`get_vecs_in_slice`](Self::get_vecs_in_slice)
    pub fn set_vecs_in_slice(
        &self,
        buf: &[Precision],
        first: &[Idx],
        last: &[Idx],
    ) -> Result<usize, StorageError> {
        let storage = self.storage_ref()?;
        let fold_size: Idx = self.dims.iter().map(|d| d.fold_len).product();
        let nvecs = self.visit_vecs(first, last, |lin_vec, o| {
            for k in 0..fold_size as usize {
                storage.set(o + k, buf[lin_vec * fold_size as usize + k]);
            }
        })?;
        Ok(nvecs * fold_size as usize)
    }

    /// Visit each whole vector of `[first, last]`; yields (vector ordinal,
    /// linear element offset of the vector's first element)
    fn visit_vecs(
        &self,
        first: &[Idx],
        last: &[Idx],
        mut f: impl FnMut(usize, usize),
    ) -> Result<usize, StorageError> {
        // Vector-grid sizes of the range; the step dim wraps per point, so
        // its slot is recomputed inside the walk instead of linearised here.
        let mut sizes = IdxTuple::new();
        let fold_size: Idx = self.dims.iter().map(|d| d.fold_len).product();
        for (d, vd) in self.dims.iter().enumerate() {
            let len = last[d] - first[d] + 1;
            if vd.kind != DimKind::Step {
                let lo = first[d] - vd.first_alloc();
                if mod_flr(lo, vd.fold_len) != 0 || mod_flr(len, vd.fold_len) != 0 {
                    return Err(StorageError::OutOfBounds {
                        var: self.name.clone(),
                        dim: vd.name.clone(),
                        index: first[d],
                    });
                }
            }
            sizes.push_back(vd.name.clone(), len / vd.fold_len);
        }
        let mut count = 0;
        sizes.visit_all_points(|ofs, lin| {
            let mut vec_ofs: Idx = 0;
            for (d, vd) in self.dims.iter().enumerate() {
                let vloc = match vd.kind {
                    DimKind::Step => self.step_slot(first[d] + ofs[d]) as Idx,
                    _ => div_flr(first[d] - vd.first_alloc(), vd.fold_len) + ofs[d],
                };
                debug_assert!(vloc >= 0 && vloc < self.vec_sizes[d]);
                vec_ofs = vec_ofs * self.vec_sizes[d] + vloc;
            }
            f(lin as usize, (vec_ofs * fold_size) as usize);
            count += 1;
            true
        });
        Ok(count)
    }

    // ----- ndarray surface -----

    /// Owned row-major copy of the inclusive range `[first, last]`
    pub fn slice_array(&self, first: &[Idx], last: &[Idx]) -> Result<ArrayD<Precision>, StorageError> {
        let sizes = self.range_sizes(first, last);
        let shape: Vec<usize> = sizes.vals().iter().map(|&s| s as usize).collect();
        let mut buf = vec![0.0 as Precision; sizes.product() as usize];
        self.get_elements_in_slice(&mut buf, first, last)?;
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), buf).expect("shape matches buffer"))
    }

    /// Write a row-major array over the range starting at `first`
    pub fn set_slice_array(
        &self,
        first: &[Idx],
        data: ArrayViewD<'_, Precision>,
    ) -> Result<(), StorageError> {
        let last: Vec<Idx> = first
            .iter()
            .zip(data.shape())
            .map(|(&f, &s)| f + s as Idx - 1)
            .collect();
        let buf: Vec<Precision> = data.iter().copied().collect();
        self.set_elements_in_slice(&buf, first, &last)?;
        if let Some(sp) = self.step_posn {
            for t in first[sp]..=last[sp] {
                self.set_dirty(true, t);
            }
        } else {
            self.set_dirty(true, 0);
        }
        Ok(())
    }

    /// Count of elements that differ by more than `ulps` representation steps
    ///
    /// Compares the whole allocation of two identically-shaped variables.
    pub fn count_diffs(&self, other: &Var, ulps: u32) -> usize {
        let (Some(a), Some(b)) = (&self.storage, &other.storage) else {
            return usize::MAX;
        };
        if a.len() != b.len() {
            return usize::MAX;
        }
        let mut diffs = 0;
        for i in 0..a.len() {
            let (x, y) = (a.get(i), b.get(i));
            if x != y {
                let (bx, by) = (x.to_bits(), y.to_bits());
                let dist = bx.abs_diff(by);
                if x.signum() != y.signum() || dist > ulps.into() {
                    diffs += 1;
                }
            }
        }
        diffs
    }
}

/// The set of variables owned by one solution
///
/// Variables are looked up by [`VarId`] on hot paths and by name at the
/// API surface. Iteration by name is in alphabetical order on every rank,
/// which is what makes exchange tags agree across ranks.
#[derive(Debug, Default)]
pub struct VarStore {
    vars: Vec<Var>,
    by_name: BTreeMap<String, VarId>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, var: Var) -> VarId {
        let id = VarId(self.vars.len());
        assert!(
            self.by_name.insert(var.name().to_owned(), id).is_none(),
            "duplicate variable name '{}'",
            var.name()
        );
        self.vars.push(var);
        id
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn get(&self, id: VarId) -> &Var {
        &self.vars[id.0]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id.0]
    }

    /// Distinct mutable borrows of two variables
    pub fn get_pair_mut(&mut self, a: VarId, b: VarId) -> (&mut Var, &mut Var) {
        assert_ne!(a, b, "cannot borrow one variable twice");
        if a.0 < b.0 {
            let (lo, hi) = self.vars.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.vars.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }

    pub fn id_of(&self, name: &str) -> Option<VarId> {
        self.by_name.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Var> {
        self.id_of(name).map(|id| self.get(id))
    }

    /// Variables in alphabetical order with their stable exchange ordinals
    pub fn ordered(&self) -> impl Iterator<Item = (usize, VarId, &Var)> {
        self.by_name
            .values()
            .enumerate()
            .map(|(ord, &id)| (ord, id, self.get(id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &Var)> {
        self.vars.iter().enumerate().map(|(i, v)| (VarId(i), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (VarId, &mut Var)> {
        self.vars.iter_mut().enumerate().map(|(i, v)| (VarId(i), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1-step-window 1-D var: domain 8, halo 1 each side
    fn var_1d() -> Var {
        let mut vd = VarDim::domain("x");
        vd.domain_size = 8;
        vd.left_halo = 1;
        vd.right_halo = 1;
        vd.left_pad = 1;
        vd.right_pad = 1;
        let mut v = Var::new("a", vec![VarDim::step("t"), vd]);
        v.set_alloc_steps(2);
        v.alloc_storage();
        v
    }

    #[test]
    fn element_roundtrip_including_halo() {
        let v = var_1d();
        v.set_element(&[0, 3], 1.5, true).unwrap();
        assert_eq!(v.get_element(&[0, 3], true).unwrap(), 1.5);
        // Halo point, negative index.
        v.set_element(&[0, -1], 2.5, true).unwrap();
        assert_eq!(v.get_element(&[0, -1], true).unwrap(), 2.5);
        // Outside pad: strict fails, non-strict reads zero.
        assert!(v.get_element(&[0, -2], true).is_err());
        assert_eq!(v.get_element(&[0, -2], false).unwrap(), 0.0);
        assert!(!v.set_element(&[0, 9], 1.0, false).unwrap());
    }

    #[test]
    fn step_window_advances_and_clears_dirty() {
        let v = var_1d();
        assert_eq!(v.first_valid_step(), 0);
        assert_eq!(v.last_valid_step(), 1);
        v.set_dirty(true, 0);
        v.set_dirty(true, 1);
        v.update_valid_step(2);
        assert_eq!(v.first_valid_step(), 1);
        assert_eq!(v.last_valid_step(), 2);
        // Step 0 fell out; its slot (reused by step 2) was cleared.
        assert!(!v.is_dirty(2));
        assert!(v.is_dirty(1));
        // Steps 0 and 2 share a slot in a 2-deep window.
        v.set_element(&[2, 0], 4.0, true).unwrap();
        assert_eq!(v.get_element(&[2, 0], true).unwrap(), 4.0);
        assert!(v.get_element(&[0, 0], true).is_err());
    }

    #[test]
    fn step_wrap_aliases_instead_of_failing() {
        let mut v = var_1d();
        v.set_step_wrap(true);
        v.set_element(&[0, 0], 3.0, true).unwrap();
        // Step 2 aliases slot of step 0.
        assert_eq!(v.get_element(&[2, 0], true).unwrap(), 3.0);
    }

    #[test]
    fn slices_are_row_major() {
        let v = var_1d();
        for x in 0..8 {
            v.set_element(&[1, x], x as Precision, true).unwrap();
        }
        let mut buf = [0.0 as Precision; 4];
        let n = v.get_elements_in_slice(&mut buf, &[1, 2], &[1, 5]).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [2.0, 3.0, 4.0, 5.0]);

        v.set_elements_in_slice(&[9.0, 8.0], &[1, 0], &[1, 1]).unwrap();
        assert_eq!(v.get_element(&[1, 1], true).unwrap(), 8.0);
    }

    #[test]
    fn folded_layout_matches_element_view() {
        let mut vd = VarDim::domain("x");
        vd.domain_size = 8;
        vd.fold_len = 4;
        let mut v = Var::new("f", vec![vd]);
        v.alloc_storage();
        for x in 0..8 {
            v.set_element(&[x], x as Precision, true).unwrap();
        }
        let mut buf = [0.0 as Precision; 8];
        v.get_vecs_in_slice(&mut buf, &[0], &[7]).unwrap();
        assert_eq!(buf, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        // Misaligned vector copy is refused.
        assert!(v.get_vecs_in_slice(&mut buf, &[1], &[4]).is_err());
    }

    #[test]
    fn fuse_shares_storage() {
        let mut a = var_1d();
        let b = var_1d();
        b.set_element(&[0, 0], 5.0, true).unwrap();
        a.fuse_vars(&b).unwrap();
        assert_eq!(a.get_element(&[0, 0], true).unwrap(), 5.0);

        let mut c = Var::new("c", vec![VarDim::step("t")]);
        c.set_alloc_steps(2);
        assert!(matches!(
            c.fuse_vars(&b),
            Err(StorageError::FuseMismatch(..))
        ));
    }

    #[test]
    fn store_orders_by_name() {
        let mut s = VarStore::new();
        s.insert(Var::new("pressure", vec![]));
        s.insert(Var::new("density", vec![]));
        let names: Vec<&str> = s.ordered().map(|(_, _, v)| v.name()).collect();
        assert_eq!(names, ["density", "pressure"]);
        assert_eq!(s.ordered().next().unwrap().0, 0);
    }

    #[test]
    fn atomic_accumulate() {
        let v = var_1d();
        v.add_to_element(&[0, 2], 1.0).unwrap();
        v.add_to_element(&[0, 2], 2.0).unwrap();
        assert_eq!(v.get_element(&[0, 2], true).unwrap(), 3.0);
    }

    #[test]
    fn writes_mark_steps_dirty() {
        let v = var_1d();
        assert!(!v.is_dirty(1));
        v.set_element(&[1, 0], 2.0, true).unwrap();
        assert!(v.is_dirty(1));
        assert!(!v.is_dirty(0));
    }

    #[test]
    fn diff_counting_in_ulps() {
        let a = var_1d();
        let b = var_1d();
        a.set_element(&[0, 0], 1.0, true).unwrap();
        b.set_element(&[0, 0], 1.0, true).unwrap();
        assert_eq!(a.count_diffs(&b, 0), 0);
        b.set_element(&[0, 1], 0.5, true).unwrap();
        assert_eq!(a.count_diffs(&b, 0), 1);
        // One representation step apart passes a 1-ULP tolerance.
        let bits = (1.0 as Precision).to_bits() + 1;
        b.set_element(&[0, 0], Precision::from_bits(bits), true)
            .unwrap();
        b.set_element(&[0, 1], 0.0, true).unwrap();
        assert_eq!(a.count_diffs(&b, 1), 0);
        assert_eq!(a.count_diffs(&b, 0), 1);
    }
}
