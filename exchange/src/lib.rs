//! Distributed halo exchange
//!
//! Builds per-variable, per-neighbour send/receive buffers and runs the
//! four-phase dirty-halo exchange protocol over the transport seam, with
//! a lock-handshake fast path for shared-memory peers.

pub mod buffer;
pub mod halo;

pub use buffer::{HaloBuffer, NeighborBufs, ShmRegion};
pub use halo::{ExchangeStats, HaloEngine, HaloFlags};

#[cfg(test)]
mod tests {
    use super::halo::{HaloEngine, HaloFlags};
    use comm::mem::MemWorld;
    use comm::{Communicator, Env};
    use data::dims::DimSet;
    use data::idx::Indices;
    use data::var::{Var, VarDim, VarStore};
    use data::{Idx, Precision};
    use std::sync::Arc;
    use std::thread;
    use topology::{setup_rank_layout, LayoutRequest, RankLayout};

    /// Build a 1-D var of local domain 8 with halo 1, offset by rank
    fn make_store(layout: &RankLayout) -> VarStore {
        let mut x = VarDim::domain("x");
        x.domain_size = layout.rank_sizes[0];
        x.left_halo = 1;
        x.right_halo = 1;
        x.left_pad = 1;
        x.right_pad = 1;
        x.rank_offset = layout.rank_offsets[0];
        let mut v = Var::new("u", vec![VarDim::step("t"), x]);
        v.set_alloc_steps(2);
        v.alloc_storage();
        let mut store = VarStore::new();
        store.insert(v);
        store
    }

    fn run_two_ranks(use_shm: bool) {
        let world = MemWorld::new(2);
        let comms = world.communicators();
        let dims = DimSet::new("t", ["x"], Vec::<String>::new());
        thread::scope(|s| {
            for c in comms {
                let dims = dims.clone();
                s.spawn(move || {
                    let me = c.rank();
                    let env = Env::with_comm(Arc::new(c));
                    let mut req = LayoutRequest::new(1);
                    req.global_sizes = Indices(vec![16]);
                    req.use_shm = use_shm;
                    let layout = setup_rank_layout(&env, &dims, &req).unwrap();
                    let store = make_store(&layout);
                    let var = store.by_name("u").unwrap();

                    // Fill owned points with globally unique values.
                    for x in 0..8 {
                        let g = layout.rank_offsets[0] + x;
                        for t in 0..2 {
                            var.set_element(&[t, g], (10 * t + g) as Precision, true)
                                .unwrap();
                        }
                    }
                    var.set_dirty(true, 0);
                    var.set_dirty(true, 1);

                    let mut engine = HaloEngine::new(
                        &store,
                        &layout.neighborhood,
                        &*env.comm,
                        use_shm,
                        false,
                    );
                    engine
                        .exchange(&store, &*env.comm, HaloFlags::ALL)
                        .unwrap();

                    // Halo points now hold the neighbour's boundary values.
                    let halo_x: Idx = if me == 0 { 8 } else { 7 };
                    for t in 0..2 {
                        assert_eq!(
                            var.get_element(&[t, halo_x], true).unwrap(),
                            (10 * t + halo_x) as Precision,
                            "rank {me} halo at x={halo_x} step {t}"
                        );
                    }
                    assert!(!var.is_dirty(0) && !var.is_dirty(1));
                    let stats = engine.stats();
                    assert_eq!(stats.num_exchanges, 1);
                    assert_eq!(stats.num_var_swaps, 1);

                    // A clean var is skipped entirely.
                    engine
                        .exchange(&store, &*env.comm, HaloFlags::ALL)
                        .unwrap();
                    assert_eq!(engine.stats().num_var_swaps, 1);
                });
            }
        });
    }

    #[test]
    fn two_rank_exchange_message_path() {
        run_two_ranks(false);
    }

    #[test]
    fn two_rank_exchange_shm_path() {
        run_two_ranks(true);
    }

    #[test]
    fn split_exchange_matches_overlap_protocol() {
        let world = MemWorld::new(2);
        let comms = world.communicators();
        let dims = DimSet::new("t", ["x"], Vec::<String>::new());
        thread::scope(|s| {
            for c in comms {
                let dims = dims.clone();
                s.spawn(move || {
                    let me = c.rank();
                    let env = Env::with_comm(Arc::new(c));
                    let mut req = LayoutRequest::new(1);
                    req.global_sizes = Indices(vec![16]);
                    let layout = setup_rank_layout(&env, &dims, &req).unwrap();
                    let store = make_store(&layout);
                    let var = store.by_name("u").unwrap();
                    for x in 0..8 {
                        let g = layout.rank_offsets[0] + x;
                        var.set_element(&[0, g], g as Precision, true).unwrap();
                    }
                    var.set_dirty(true, 0);

                    let mut engine =
                        HaloEngine::new(&store, &layout.neighborhood, &*env.comm, false, false);

                    // Exterior pass posts, interior pass completes.
                    let post = HaloFlags {
                        do_left: true,
                        do_right: true,
                        do_interior: false,
                    };
                    let complete = HaloFlags {
                        do_left: false,
                        do_right: false,
                        do_interior: true,
                    };
                    engine.exchange(&store, &*env.comm, post).unwrap();
                    assert!(var.is_dirty(0), "dirty until the completion half");
                    engine.exchange(&store, &*env.comm, complete).unwrap();
                    assert!(!var.is_dirty(0));

                    let halo_x: Idx = if me == 0 { 8 } else { 7 };
                    assert_eq!(
                        var.get_element(&[0, halo_x], true).unwrap(),
                        halo_x as Precision
                    );
                });
            }
        });
    }

    #[test]
    fn single_rank_is_a_no_op() {
        let env = Env::new_local();
        let dims = DimSet::new("t", ["x"], Vec::<String>::new());
        let mut req = LayoutRequest::new(1);
        req.global_sizes = Indices(vec![16]);
        let layout = setup_rank_layout(&env, &dims, &req).unwrap();
        let store = make_store(&layout);
        store.by_name("u").unwrap().set_dirty(true, 0);
        let mut engine =
            HaloEngine::new(&store, &layout.neighborhood, &*env.comm, false, false);
        engine
            .exchange(&store, &*env.comm, HaloFlags::ALL)
            .unwrap();
        // Nothing exchanged, dirty bit untouched by the engine.
        assert_eq!(engine.stats().num_exchanges, 0);
    }
}
