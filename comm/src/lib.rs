//! Communication seam between the engine and its transport
//!
//! All distributed behaviour goes through the [`Communicator`] trait so the
//! engine can run over a single rank ([`LocalComm`]), over threads-as-ranks
//! inside one process ([`mem::MemComm`], which doubles as the shared-memory
//! fast path and makes multi-rank behaviour testable under `cargo test`),
//! or over real MPI (`MpiComm`, behind the non-default `mpi` feature).

pub mod lock;
pub mod mem;
#[cfg(feature = "mpi")]
pub mod mpi_comm;

use data::pool::Storage;
use data::{Idx, Precision};
use std::sync::Arc;

/// Errors raised by the transport layer
#[derive(Clone, Debug, thiserror::Error)]
pub enum CommError {
    #[error("point-to-point failure: {0}")]
    PointToPoint(String),

    #[error("collective failure: {0}")]
    Collective(String),

    #[error("'{what}' differs across ranks: rank {rank} has {got}, rank 0 has {want}")]
    RankMismatch {
        what: String,
        rank: usize,
        got: Idx,
        want: Idx,
    },
}

/// Handle for an outstanding nonblocking operation
#[derive(Debug, Default)]
pub enum Request {
    /// Completed or never started
    #[default]
    Null,
    /// Pending receive: (peer, tag, expected length)
    Recv {
        peer: usize,
        tag: u64,
        nelems: usize,
    },
    /// Pending send: (peer, tag)
    Send { peer: usize, tag: u64 },
}

impl Request {
    pub fn is_null(&self) -> bool {
        matches!(self, Request::Null)
    }
}

/// Transport abstraction
///
/// Payloads are owned element vectors: packing copies out of the variable
/// into the wire buffer and unpacking copies back, which is exactly the
/// halo-exchange data path. Collectives must be called by every rank in
/// the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn num_ranks(&self) -> usize;

    fn barrier(&self);

    /// Broadcast an index table from `root` to every rank
    fn bcast_idxs(&self, root: usize, data: &mut [Idx]) -> Result<(), CommError>;

    /// Start a nonblocking send of `data` to `peer`
    fn isend(&self, peer: usize, tag: u64, data: Vec<Precision>) -> Result<Request, CommError>;

    /// Post a nonblocking receive of `nelems` elements from `peer`
    fn irecv(&self, peer: usize, tag: u64, nelems: usize) -> Result<Request, CommError>;

    /// Nonblocking completion probe; also nudges transport progress
    fn test(&self, req: &Request) -> Result<bool, CommError>;

    /// Block until a send completes
    fn wait_send(&self, req: &mut Request) -> Result<(), CommError>;

    /// Block until a receive completes and take its payload
    fn wait_recv(&self, req: &mut Request) -> Result<Vec<Precision>, CommError>;

    /// Rank of `peer` in this rank's shared-memory group, if reachable
    fn shm_rank_of(&self, peer: usize) -> Option<usize>;

    /// Publish a keyed shared window for this rank
    ///
    /// All ranks must barrier between registration and any peer query.
    /// Keys are chosen by the caller; both sides derive the same key for
    /// one logical buffer.
    fn register_shared_window(&self, key: u64, window: Storage) {
        let _ = (key, window);
    }

    /// Shared window published by `peer` under `key`, if any
    fn peer_shared_window(&self, peer: usize, key: u64) -> Option<Storage> {
        let _ = (peer, key);
        None
    }

    /// Verify that `val` is identical on every rank
    fn assert_equality_over_ranks(&self, val: Idx, what: &str) -> Result<(), CommError> {
        let mut root_val = [val];
        self.bcast_idxs(0, &mut root_val)?;
        if root_val[0] != val {
            return Err(CommError::RankMismatch {
                what: what.into(),
                rank: self.rank(),
                got: val,
                want: root_val[0],
            });
        }
        Ok(())
    }
}

/// Single-rank communicator: every operation is trivial
#[derive(Debug, Default)]
pub struct LocalComm;

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn bcast_idxs(&self, _root: usize, _data: &mut [Idx]) -> Result<(), CommError> {
        Ok(())
    }

    fn isend(&self, peer: usize, _tag: u64, _data: Vec<Precision>) -> Result<Request, CommError> {
        Err(CommError::PointToPoint(format!(
            "no peer rank {peer} in a single-rank run"
        )))
    }

    fn irecv(&self, peer: usize, _tag: u64, _nelems: usize) -> Result<Request, CommError> {
        Err(CommError::PointToPoint(format!(
            "no peer rank {peer} in a single-rank run"
        )))
    }

    fn test(&self, _req: &Request) -> Result<bool, CommError> {
        Ok(true)
    }

    fn wait_send(&self, _req: &mut Request) -> Result<(), CommError> {
        Ok(())
    }

    fn wait_recv(&self, _req: &mut Request) -> Result<Vec<Precision>, CommError> {
        Err(CommError::PointToPoint(
            "no pending receive in a single-rank run".into(),
        ))
    }

    fn shm_rank_of(&self, _peer: usize) -> Option<usize> {
        None
    }
}

/// Process environment: the communicator plus thread accounting
///
/// Mirrors the role of an MPI environment object: created once, shared by
/// the solution and every component that needs rank information.
#[derive(Clone)]
pub struct Env {
    pub comm: Arc<dyn Communicator>,

    /// Threads available to this rank (0 = library default)
    pub max_threads: usize,
}

impl Env {
    /// Single-rank environment
    pub fn new_local() -> Self {
        Self {
            comm: Arc::new(LocalComm),
            max_threads: 0,
        }
    }

    pub fn with_comm(comm: Arc<dyn Communicator>) -> Self {
        Self {
            comm,
            max_threads: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn num_ranks(&self) -> usize {
        self.comm.num_ranks()
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("rank", &self.rank())
            .field("num_ranks", &self.num_ranks())
            .field("max_threads", &self.max_threads)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_comm_is_trivial() {
        let env = Env::new_local();
        assert_eq!(env.rank(), 0);
        assert_eq!(env.num_ranks(), 1);
        env.comm.barrier();
        env.comm.assert_equality_over_ranks(42, "anything").unwrap();
        assert!(env.comm.isend(1, 0, vec![]).is_err());
    }
}
