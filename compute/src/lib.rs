//! Tiled stencil execution engine
//!
//! Evaluates iterative finite-difference stencils over distributed
//! regular grids. The engine owns the tiling hierarchy (rank, region,
//! block, mini-block, sub-block), the wave-front and temporal-block
//! shifting that keeps dependencies satisfied, the dirty-halo exchange
//! and the block-size auto-tuner; the inner SIMD kernels are supplied
//! per bundle by the stencil compiler through the [`bundle::Bundle`]
//! trait.

pub mod bbox;
pub mod bundle;
pub mod context;
pub mod scan;
pub mod settings;
pub mod setup;
pub mod solution;
pub mod stats;
pub mod tune;

pub use bbox::BundleBBs;
pub use bundle::{Bundle, EvalCtx, VarRef};
pub use settings::{Options, Settings};
pub use solution::Solution;
pub use stats::Stats;
pub use tune::TunerPolicy;

use data::Idx;

/// Engine error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Inconsistent sizes or option combinations
    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] data::StorageError),

    /// Bad call ordering or tile-size combinations
    #[error("scheduling: {0}")]
    Scheduling(String),

    #[error(transparent)]
    Topology(#[from] topology::TopologyError),

    #[error(transparent)]
    Comm(#[from] comm::CommError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Round up towards positive infinity on the floored grid
///
/// Unlike [`data::round_up`] this is defined for negative values, which
/// rank-relative indices inside halos and extensions can be.
#[inline]
pub fn round_up_flr(n: Idx, mult: Idx) -> Idx {
    data::div_flr(n + mult - 1, mult) * mult
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_flr_handles_negatives() {
        assert_eq!(round_up_flr(5, 4), 8);
        assert_eq!(round_up_flr(8, 4), 8);
        assert_eq!(round_up_flr(-5, 4), -4);
        assert_eq!(round_up_flr(-8, 4), -8);
        assert_eq!(round_up_flr(0, 4), 0);
    }
}
