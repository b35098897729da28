//! Threads-as-ranks communicator
//!
//! A [`MemWorld`] groups N ranks living on N threads of one process.
//! Point-to-point messages rendezvous through per-(source, dest, tag)
//! mailboxes; shared windows are plain [`Storage`] views published to a
//! registry, which is also what makes every peer a shared-memory peer.
//!
//! This backend is the reference implementation of the transport contract
//! and the vehicle for multi-rank tests.

use crate::{CommError, Communicator, Request};
use data::pool::Storage;
use data::{Idx, Precision};
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Barrier, Condvar, Mutex};

type MailKey = (usize, usize, u64);

#[derive(Default)]
struct Mailboxes {
    /// Element payloads from point-to-point sends
    data: HashMap<MailKey, VecDeque<Vec<Precision>>>,
    /// Index tables from broadcasts
    idxs: HashMap<MailKey, VecDeque<Vec<Idx>>>,
}

/// Shared state of one group of in-process ranks
pub struct MemWorld {
    num_ranks: usize,
    mail: Mutex<Mailboxes>,
    delivered: Condvar,
    barrier: Barrier,
    windows: Mutex<HashMap<(usize, u64), Storage>>,
}

impl MemWorld {
    pub fn new(num_ranks: usize) -> Arc<Self> {
        assert!(num_ranks >= 1);
        Arc::new(Self {
            num_ranks,
            mail: Mutex::new(Mailboxes::default()),
            delivered: Condvar::new(),
            barrier: Barrier::new(num_ranks),
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// One communicator per rank, to be moved onto the rank's thread
    pub fn communicators(self: &Arc<Self>) -> Vec<MemComm> {
        (0..self.num_ranks)
            .map(|r| MemComm {
                world: Arc::clone(self),
                rank: r,
                bcast_seq: AtomicU64::new(0),
            })
            .collect()
    }
}

/// One rank's endpoint in a [`MemWorld`]
pub struct MemComm {
    world: Arc<MemWorld>,
    rank: usize,
    /// Per-rank collective counter; ranks call collectives in the same
    /// order, so equal counts address the same logical broadcast
    bcast_seq: AtomicU64,
}

impl MemComm {
    fn check_peer(&self, peer: usize) -> Result<(), CommError> {
        if peer >= self.world.num_ranks || peer == self.rank {
            return Err(CommError::PointToPoint(format!(
                "rank {} cannot message rank {peer} of {}",
                self.rank, self.world.num_ranks
            )));
        }
        Ok(())
    }
}

impl Communicator for MemComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.world.num_ranks
    }

    fn barrier(&self) {
        self.world.barrier.wait();
    }

    fn bcast_idxs(&self, root: usize, data: &mut [Idx]) -> Result<(), CommError> {
        let seq = self.bcast_seq.fetch_add(1, Relaxed);
        let mut mail = self
            .world
            .mail
            .lock()
            .map_err(|_| CommError::Collective("mailbox poisoned".into()))?;
        if self.rank == root {
            for peer in 0..self.world.num_ranks {
                if peer != root {
                    mail.idxs
                        .entry((root, peer, seq))
                        .or_default()
                        .push_back(data.to_vec());
                }
            }
            self.world.delivered.notify_all();
        } else {
            loop {
                if let Some(q) = mail.idxs.get_mut(&(root, self.rank, seq)) {
                    if let Some(v) = q.pop_front() {
                        if v.len() != data.len() {
                            return Err(CommError::Collective(format!(
                                "broadcast length mismatch: {} vs {}",
                                v.len(),
                                data.len()
                            )));
                        }
                        data.copy_from_slice(&v);
                        break;
                    }
                }
                mail = self
                    .world
                    .delivered
                    .wait(mail)
                    .map_err(|_| CommError::Collective("mailbox poisoned".into()))?;
            }
        }
        Ok(())
    }

    fn isend(&self, peer: usize, tag: u64, data: Vec<Precision>) -> Result<Request, CommError> {
        self.check_peer(peer)?;
        trace!(
            "rank {}: send {} elems to {peer} tag {tag}",
            self.rank,
            data.len()
        );
        let mut mail = self
            .world
            .mail
            .lock()
            .map_err(|_| CommError::PointToPoint("mailbox poisoned".into()))?;
        mail.data
            .entry((self.rank, peer, tag))
            .or_default()
            .push_back(data);
        self.world.delivered.notify_all();
        // Eager delivery: the send has already completed.
        Ok(Request::Send { peer, tag })
    }

    fn irecv(&self, peer: usize, tag: u64, nelems: usize) -> Result<Request, CommError> {
        self.check_peer(peer)?;
        Ok(Request::Recv { peer, tag, nelems })
    }

    fn test(&self, req: &Request) -> Result<bool, CommError> {
        match req {
            Request::Null | Request::Send { .. } => Ok(true),
            Request::Recv { peer, tag, .. } => {
                let mail = self
                    .world
                    .mail
                    .lock()
                    .map_err(|_| CommError::PointToPoint("mailbox poisoned".into()))?;
                Ok(mail
                    .data
                    .get(&(*peer, self.rank, *tag))
                    .is_some_and(|q| !q.is_empty()))
            }
        }
    }

    fn wait_send(&self, req: &mut Request) -> Result<(), CommError> {
        *req = Request::Null;
        Ok(())
    }

    fn wait_recv(&self, req: &mut Request) -> Result<Vec<Precision>, CommError> {
        let Request::Recv { peer, tag, nelems } = *req else {
            return Err(CommError::PointToPoint(
                "wait_recv on a non-receive request".into(),
            ));
        };
        let mut mail = self
            .world
            .mail
            .lock()
            .map_err(|_| CommError::PointToPoint("mailbox poisoned".into()))?;
        let payload = loop {
            if let Some(q) = mail.data.get_mut(&(peer, self.rank, tag)) {
                if let Some(v) = q.pop_front() {
                    break v;
                }
            }
            mail = self
                .world
                .delivered
                .wait(mail)
                .map_err(|_| CommError::PointToPoint("mailbox poisoned".into()))?;
        };
        if payload.len() > nelems {
            return Err(CommError::PointToPoint(format!(
                "rank {}: message of {} elems from {peer} overflows buffer of {nelems}",
                self.rank,
                payload.len()
            )));
        }
        *req = Request::Null;
        Ok(payload)
    }

    fn shm_rank_of(&self, peer: usize) -> Option<usize> {
        // Every in-process peer shares memory; its shm rank is its rank.
        (peer < self.world.num_ranks).then_some(peer)
    }

    fn register_shared_window(&self, key: u64, window: Storage) {
        let mut w = self.world.windows.lock().expect("window registry poisoned");
        w.insert((self.rank, key), window);
    }

    fn peer_shared_window(&self, peer: usize, key: u64) -> Option<Storage> {
        let w = self.world.windows.lock().expect("window registry poisoned");
        w.get(&(peer, key)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn two_rank_send_recv() {
        let world = MemWorld::new(2);
        let mut comms = world.communicators();
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();

        thread::scope(|s| {
            s.spawn(move || {
                let mut req = c1.irecv(0, 7, 3).unwrap();
                let data = c1.wait_recv(&mut req).unwrap();
                assert_eq!(data, vec![1.0, 2.0, 3.0]);
                assert!(req.is_null());
            });
            let mut req = c0.isend(1, 7, vec![1.0, 2.0, 3.0]).unwrap();
            c0.wait_send(&mut req).unwrap();
        });
    }

    #[test]
    fn broadcast_reaches_all_ranks() {
        let world = MemWorld::new(3);
        let comms = world.communicators();
        thread::scope(|s| {
            for c in comms {
                s.spawn(move || {
                    let mut table = if c.rank() == 0 { vec![5, 6] } else { vec![0, 0] };
                    c.bcast_idxs(0, &mut table).unwrap();
                    assert_eq!(table, vec![5, 6]);
                    c.assert_equality_over_ranks(99, "const").unwrap();
                });
            }
        });
    }

    #[test]
    fn rank_mismatch_detected() {
        let world = MemWorld::new(2);
        let comms = world.communicators();
        thread::scope(|s| {
            for c in comms {
                s.spawn(move || {
                    let val = if c.rank() == 0 { 10 } else { 11 };
                    let r = c.assert_equality_over_ranks(val, "size");
                    if c.rank() == 0 {
                        assert!(r.is_ok());
                    } else {
                        assert!(matches!(r, Err(CommError::RankMismatch { .. })));
                    }
                });
            }
        });
    }

    #[test]
    fn shared_windows_visible_to_peers() {
        let world = MemWorld::new(2);
        let comms = world.communicators();
        thread::scope(|s| {
            for c in comms {
                s.spawn(move || {
                    let win = Storage::standalone(4);
                    win.fill(c.rank() as Precision);
                    c.register_shared_window(9, win);
                    c.barrier();
                    let peer = 1 - c.rank();
                    let pw = c.peer_shared_window(peer, 9).unwrap();
                    assert_eq!(pw.get(0), peer as Precision);
                    assert!(c.peer_shared_window(peer, 8).is_none());
                    assert_eq!(c.shm_rank_of(peer), Some(peer));
                });
            }
        });
    }

    #[test]
    fn test_probes_without_blocking() {
        let world = MemWorld::new(2);
        let mut comms = world.communicators();
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();
        let req = c1.irecv(0, 1, 1).unwrap();
        assert!(!c1.test(&req).unwrap());
        c0.isend(1, 1, vec![4.0]).unwrap();
        assert!(c1.test(&req).unwrap());
    }
}
