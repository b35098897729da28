//! Run counters and timers
//!
//! Timers accumulate nanoseconds into atomics so the block-parallel
//! sections can report without locking; the driver thread reads them out
//! into [`Stats`] on demand.

use data::Idx;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Instant;

/// Monotonic elapsed-time accumulator
#[derive(Debug, Default)]
pub struct Timer {
    nanos: AtomicU64,
}

impl Timer {
    /// Start a measurement; add it back with [`stop`](Self::stop)
    pub fn start(&self) -> Instant {
        Instant::now()
    }

    /// Accumulate since `t0`, returning the lap seconds
    pub fn stop(&self, t0: Instant) -> f64 {
        let d = t0.elapsed();
        self.nanos.fetch_add(d.as_nanos() as u64, Relaxed);
        d.as_secs_f64()
    }

    pub fn secs(&self) -> f64 {
        self.nanos.load(Relaxed) as f64 * 1e-9
    }

    pub fn clear(&self) {
        self.nanos.store(0, Relaxed);
    }
}

/// Timers kept by one solution
#[derive(Debug, Default)]
pub struct RunTimers {
    /// Whole run_solution calls
    pub run: Timer,
    /// Halo-exchange calls
    pub halo: Timer,
    /// Rank-exterior computation (overlap mode)
    pub ext: Timer,
    /// Rank-interior computation
    pub int_: Timer,
}

/// Snapshot returned by `get_stats`
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub steps_done: Idx,
    /// Scalar writes issued, estimated from bundle metadata
    pub points_written: u64,
    /// Estimated FP ops
    pub fp_ops: u64,
    pub run_secs: f64,
    pub halo_secs: f64,
    pub ext_secs: f64,
    pub int_secs: f64,
    /// Completed halo-exchange rounds and per-var swaps
    pub num_exchanges: usize,
    pub num_var_swaps: usize,
    /// (pack name, steps computed, seconds in kernels)
    pub packs: Vec<(String, Idx, f64)>,
}

impl Stats {
    /// Steps per second over the whole run
    pub fn rate(&self) -> f64 {
        if self.run_secs > 0.0 {
            self.steps_done as f64 / self.run_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_accumulates() {
        let t = Timer::default();
        let t0 = t.start();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let lap = t.stop(t0);
        assert!(lap >= 0.002);
        assert!(t.secs() >= 0.002);
        t.clear();
        assert_eq!(t.secs(), 0.0);
    }
}
