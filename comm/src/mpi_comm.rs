//! MPI transport backend (feature `mpi`)
//!
//! Wraps the rsmpi world communicator. The caller must initialise MPI
//! (with at least `Threading::Serialized`) before constructing [`MpiComm`]
//! and keep the universe alive for the duration of the run.
//!
//! The backend uses blocking sends and receives underneath the
//! nonblocking surface. `isend` only queues the payload; the real
//! transfers are ordered by rank so each pair alternates: the lower rank
//! flushes its queued sends to a peer right before its first blocking
//! receive from that peer, the higher rank receives first and flushes
//! when its send handles are waited on. At no point do both sides of a
//! pair sit in a send targeting each other, so a pairwise exchange is
//! deadlock-free regardless of the implementation's eager threshold.
//! Rings of three or more ranks whose flush order chains across pairs
//! still rely on eager buffering for oversized messages.
//! TODO: move to immediate_send/immediate_receive once the buffer
//! lifetimes are routed through a static request scope.

use crate::{CommError, Communicator, Request};
use data::{Idx, Precision};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// MPI-backed communicator over the world communicator
pub struct MpiComm {
    world: SimpleCommunicator,
    /// Queued payloads per peer, flushed at this rank's turn to talk
    deferred: Mutex<HashMap<usize, VecDeque<(u64, Vec<Precision>)>>>,
}

impl MpiComm {
    /// Requires `mpi::initialize_with_threading` to have been called
    pub fn new() -> Self {
        Self {
            world: SimpleCommunicator::world(),
            deferred: Mutex::new(HashMap::new()),
        }
    }

    fn blocking_send(&self, peer: usize, tag: u64, data: &[Precision]) {
        let process = self.world.process_at_rank(peer as i32);
        process.send_with_tag(data, tag as i32);
    }

    /// Send every payload queued for `peer`, in posting order
    ///
    /// Both sides walk their variables in the same order, so flushing in
    /// posting order matches the peer's receive order.
    fn flush_deferred(&self, peer: usize) {
        let drained: Vec<(u64, Vec<Precision>)> = {
            let mut d = self.deferred.lock().expect("deferred queue poisoned");
            d.remove(&peer).map(Vec::from).unwrap_or_default()
        };
        for (tag, data) in drained {
            self.blocking_send(peer, tag, &data);
        }
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn num_ranks(&self) -> usize {
        self.world.size() as usize
    }

    fn barrier(&self) {
        self.world.barrier();
    }

    fn bcast_idxs(&self, root: usize, data: &mut [Idx]) -> Result<(), CommError> {
        let root = self.world.process_at_rank(root as i32);
        root.broadcast_into(data);
        Ok(())
    }

    fn isend(&self, peer: usize, tag: u64, data: Vec<Precision>) -> Result<Request, CommError> {
        // Queue only; the transfer happens at this rank's turn in the
        // pairwise alternation.
        let mut d = self.deferred.lock().expect("deferred queue poisoned");
        d.entry(peer).or_default().push_back((tag, data));
        Ok(Request::Send { peer, tag })
    }

    fn irecv(&self, peer: usize, tag: u64, nelems: usize) -> Result<Request, CommError> {
        // The blocking receive happens in wait_recv; this only records
        // what to match there.
        Ok(Request::Recv { peer, tag, nelems })
    }

    fn test(&self, req: &Request) -> Result<bool, CommError> {
        match req {
            Request::Send { peer, tag } => {
                let d = self.deferred.lock().expect("deferred queue poisoned");
                Ok(!d
                    .get(peer)
                    .is_some_and(|q| q.iter().any(|(t, _)| t == tag)))
            }
            _ => Ok(true),
        }
    }

    fn wait_send(&self, req: &mut Request) -> Result<(), CommError> {
        // The higher rank of a pair (and any send-only pairing) flushes
        // here, after every receive from the peer has completed.
        if let Request::Send { peer, .. } = *req {
            self.flush_deferred(peer);
        }
        *req = Request::Null;
        Ok(())
    }

    fn wait_recv(&self, req: &mut Request) -> Result<Vec<Precision>, CommError> {
        let Request::Recv { peer, tag, nelems } = *req else {
            return Err(CommError::PointToPoint(
                "wait_recv on a non-receive request".into(),
            ));
        };
        // Lower rank talks first: drain our queued sends to this peer
        // before blocking in the receive. The higher rank holds its
        // sends until wait_send so the pair never sends head-on.
        if self.rank() < peer {
            self.flush_deferred(peer);
        }
        let process = self.world.process_at_rank(peer as i32);
        let mut buf = vec![0.0 as Precision; nelems];
        process.receive_into_with_tag(&mut buf[..], tag as i32);
        *req = Request::Null;
        Ok(buf)
    }

    fn shm_rank_of(&self, _peer: usize) -> Option<usize> {
        // Shared windows are not wired up for the MPI backend yet; all
        // exchanges go through the message path.
        None
    }
}
