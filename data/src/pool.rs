//! Memory pools for variable and exchange-buffer storage
//!
//! Storage for all variables sharing a pool key is carved out of one
//! contiguous block per key, following a plan/allocate/distribute protocol:
//! callers first register their byte requirements, then a single block per
//! key is allocated, then offsets are handed back out. Exchange buffers
//! reserve an alignment pad large enough to embed a spin lock.
//!
//! Elements are stored as relaxed atomics over the raw float bits. On the
//! targets we care about a relaxed load/store compiles to a plain move, and
//! it makes concurrent writes to disjoint tiles sound without raw-pointer
//! juggling. `fetch_add` gives the atomic accumulate API.
//!
//! NUMA preference is honoured by first-touch: the allocating thread zeroes
//! the block, so pages land on the node of whichever thread the caller runs
//! the allocation on. A `Pmem` key records the re-keying decision made when
//! a node pool would overflow.

use crate::{ceil_div, Idx, Precision};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(not(feature = "f64"))]
pub type RawCell = std::sync::atomic::AtomicU32;
#[cfg(feature = "f64")]
pub type RawCell = std::sync::atomic::AtomicU64;

#[cfg(not(feature = "f64"))]
type RawBits = u32;
#[cfg(feature = "f64")]
type RawBits = u64;

use std::sync::atomic::Ordering::Relaxed;

/// Bytes per cache line, used to round allocation requests
pub const CACHELINE_BYTES: usize = 64;

/// Alignment pad reserved ahead of lock-bearing allocations, in elements
///
/// Must hold at least one lock word; one cache line keeps the lock and the
/// payload on separate lines.
pub const LOCK_PAD_ELEMS: usize = CACHELINE_BYTES / std::mem::size_of::<Precision>();

/// Pool selector
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolKey {
    /// First-touch local allocation
    Local,
    /// Preferred NUMA node
    Node(i32),
    /// Persistent-memory node (fallback when a NUMA pool would overflow)
    Pmem(i32),
    /// Shared-memory window, visible to in-process peer ranks
    Shm,
}

impl PoolKey {
    /// Map a `numa_pref` setting to a pool key
    ///
    /// Non-negative values select a node; -1 selects first-touch local.
    pub fn from_pref(pref: i32) -> Self {
        if pref >= 0 {
            PoolKey::Node(pref)
        } else {
            PoolKey::Local
        }
    }
}

/// One contiguous block of element storage
#[derive(Debug)]
pub struct PoolBlock {
    key: PoolKey,
    cells: Box<[RawCell]>,
}

impl PoolBlock {
    fn new(key: PoolKey, nelems: usize) -> Self {
        // First touch happens here, on the calling thread.
        let cells: Box<[RawCell]> = (0..nelems).map(|_| RawCell::new(0)).collect();
        Self { key, cells }
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw cell access, used to embed locks in buffer pads
    pub fn raw_cell(&self, i: usize) -> &RawCell {
        &self.cells[i]
    }
}

#[inline]
fn to_bits(v: Precision) -> RawBits {
    v.to_bits()
}

#[inline]
fn from_bits(b: RawBits) -> Precision {
    Precision::from_bits(b)
}

/// A view into a [`PoolBlock`], the unit handed to variables and buffers
///
/// Cloning a `Storage` aliases the same elements; this is how fused
/// variables share data.
#[derive(Clone, Debug)]
pub struct Storage {
    block: Arc<PoolBlock>,
    ofs: usize,
    len: usize,
}

impl Storage {
    pub fn new(block: Arc<PoolBlock>, ofs: usize, len: usize) -> Self {
        assert!(ofs + len <= block.len());
        Self { block, ofs, len }
    }

    /// Standalone storage outside any planned pool (fixed-size vars, tests)
    pub fn standalone(nelems: usize) -> Self {
        let block = Arc::new(PoolBlock::new(PoolKey::Local, nelems));
        Self::new(block, 0, nelems)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key(&self) -> PoolKey {
        self.block.key()
    }

    /// Do two storages alias the same elements?
    pub fn same_data(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.block, &other.block) && self.ofs == other.ofs
    }

    /// Sub-view of `len` elements starting at `ofs`
    pub fn slice(&self, ofs: usize, len: usize) -> Storage {
        assert!(ofs + len <= self.len);
        Storage::new(Arc::clone(&self.block), self.ofs + ofs, len)
    }

    /// Raw atomic cell, used to embed handshake locks in buffer pads
    pub fn raw_cell(&self, i: usize) -> &RawCell {
        assert!(i < self.len);
        self.block.raw_cell(self.ofs + i)
    }

    #[inline]
    pub fn get(&self, i: usize) -> Precision {
        from_bits(self.block.cells[self.ofs + i].load(Relaxed))
    }

    #[inline]
    pub fn set(&self, i: usize, v: Precision) {
        self.block.cells[self.ofs + i].store(to_bits(v), Relaxed);
    }

    /// Atomic read-modify-write add
    #[inline]
    pub fn fetch_add(&self, i: usize, v: Precision) -> Precision {
        let cell = &self.block.cells[self.ofs + i];
        let mut cur = cell.load(Relaxed);
        loop {
            let new = to_bits(from_bits(cur) + v);
            match cell.compare_exchange_weak(cur, new, Relaxed, Relaxed) {
                Ok(_) => return from_bits(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn fill(&self, v: Precision) {
        for i in 0..self.len {
            self.set(i, v);
        }
    }
}

/// One registered storage request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolTicket(usize);

#[derive(Debug)]
struct Request {
    name: String,
    key: PoolKey,
    pad_elems: usize,
    elems: usize,
    /// Element offset of the payload in the key's block (pass 2)
    ofs: Option<usize>,
}

/// Plan/allocate/distribute protocol over all pool keys
#[derive(Debug, Default)]
pub struct PoolPlanner {
    requests: Vec<Request>,
    blocks: BTreeMap<PoolKey, Arc<PoolBlock>>,
    /// Per-node capacity limit in bytes; pools that would overflow are
    /// re-keyed to `Pmem` (pass 0 probing)
    node_limit_bytes: Option<usize>,
}

impl PoolPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap per-node pool size; larger pools fall back to persistent memory
    pub fn set_node_limit_bytes(&mut self, limit: usize) {
        self.node_limit_bytes = Some(limit);
    }

    /// Pass 0/1: register a request for `elems` payload elements
    ///
    /// `pad_elems` is reserved ahead of the payload (lock embedding);
    /// the combined request is rounded up to whole cache lines.
    pub fn request(
        &mut self,
        name: impl Into<String>,
        key: PoolKey,
        elems: usize,
        pad_elems: usize,
    ) -> PoolTicket {
        assert!(self.blocks.is_empty(), "pool already allocated");
        let t = PoolTicket(self.requests.len());
        self.requests.push(Request {
            name: name.into(),
            key,
            pad_elems,
            elems,
            ofs: None,
        });
        t
    }

    fn line_elems() -> usize {
        CACHELINE_BYTES / std::mem::size_of::<Precision>()
    }

    /// Pass 1+2: allocate one block per key and distribute offsets
    pub fn allocate(&mut self) {
        assert!(self.blocks.is_empty(), "pool already allocated");
        let line = Self::line_elems();

        // Pass 0: re-key node pools that would overflow.
        if let Some(limit) = self.node_limit_bytes {
            let mut by_key: BTreeMap<PoolKey, usize> = BTreeMap::new();
            for r in &self.requests {
                let rounded =
                    ceil_div((r.pad_elems + r.elems) as Idx, line as Idx) as usize * line;
                *by_key.entry(r.key).or_default() += rounded * std::mem::size_of::<Precision>();
            }
            for r in &mut self.requests {
                if let PoolKey::Node(n) = r.key {
                    if by_key[&r.key] > limit {
                        trace!(
                            "pool request '{}' re-keyed from node {n} to pmem (pool would \
                             exceed {limit} bytes)",
                            r.name
                        );
                        r.key = PoolKey::Pmem(n);
                    }
                }
            }
        }

        // Pass 1: sum bytes per key.
        let mut totals: BTreeMap<PoolKey, usize> = BTreeMap::new();
        for r in &mut self.requests {
            let total = totals.entry(r.key).or_default();
            let rounded = ceil_div((r.pad_elems + r.elems) as Idx, line as Idx) as usize * line;
            r.ofs = Some(*total + r.pad_elems);
            *total += rounded;
        }

        // Pass 2: one block per key.
        for (&key, &nelems) in &totals {
            debug!(
                "allocating {} elements ({} bytes) in pool {key:?}",
                nelems,
                nelems * std::mem::size_of::<Precision>()
            );
            self.blocks.insert(key, Arc::new(PoolBlock::new(key, nelems)));
        }
    }

    /// Resolve a ticket into its storage view (after [`allocate`](Self::allocate))
    pub fn storage_of(&self, ticket: PoolTicket) -> Storage {
        let r = &self.requests[ticket.0];
        let ofs = r.ofs.expect("pool not allocated yet");
        Storage::new(Arc::clone(&self.blocks[&r.key]), ofs, r.elems)
    }

    /// The block backing a ticket, with the ticket's pad start offset
    ///
    /// Exchange buffers use this to reach the lock cell inside their pad.
    pub fn pad_of(&self, ticket: PoolTicket) -> (Arc<PoolBlock>, usize) {
        let r = &self.requests[ticket.0];
        let ofs = r.ofs.expect("pool not allocated yet");
        (Arc::clone(&self.blocks[&r.key]), ofs - r.pad_elems)
    }

    /// Total bytes planned for one key
    pub fn planned_bytes(&self, key: PoolKey) -> usize {
        self.blocks
            .get(&key)
            .map_or(0, |b| b.len() * std::mem::size_of::<Precision>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_roundtrip() {
        let s = Storage::standalone(16);
        s.set(3, 1.5);
        assert_eq!(s.get(3), 1.5);
        assert_eq!(s.get(4), 0.0);
        let old = s.fetch_add(3, 1.0);
        assert_eq!(old, 1.5);
        assert_eq!(s.get(3), 2.5);
    }

    #[test]
    fn planner_distributes_disjoint_ranges() {
        let mut p = PoolPlanner::new();
        let a = p.request("a", PoolKey::Local, 10, 0);
        let b = p.request("b", PoolKey::Local, 100, LOCK_PAD_ELEMS);
        let c = p.request("c", PoolKey::Shm, 7, 0);
        p.allocate();

        let sa = p.storage_of(a);
        let sb = p.storage_of(b);
        let sc = p.storage_of(c);
        assert_eq!(sa.len(), 10);
        assert_eq!(sb.len(), 100);
        assert_eq!(sc.key(), PoolKey::Shm);

        // Writes through one view must not show through another.
        sa.fill(1.0);
        sb.fill(2.0);
        assert_eq!(sa.get(9), 1.0);
        assert_eq!(sb.get(0), 2.0);

        // Pad precedes payload and is in the same block.
        let (blk, pad_ofs) = p.pad_of(b);
        assert_eq!(blk.key(), PoolKey::Local);
        blk.raw_cell(pad_ofs).store(7, Relaxed);
        assert_eq!(sb.get(0), 2.0);
    }

    #[test]
    fn overflow_rekeys_to_pmem() {
        let mut p = PoolPlanner::new();
        p.set_node_limit_bytes(64);
        let t = p.request("big", PoolKey::Node(0), 1 << 12, 0);
        p.allocate();
        assert!(matches!(p.storage_of(t).key(), PoolKey::Pmem(0)));
    }

    #[test]
    fn fused_views_alias() {
        let s = Storage::standalone(8);
        let t = s.clone();
        t.set(0, 9.0);
        assert_eq!(s.get(0), 9.0);
        assert!(s.same_data(&t));
    }
}
