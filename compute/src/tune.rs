//! Block-size auto-tuner
//!
//! Hill climbing over the spatial block-size tuple, fed by the step/time
//! samples `run_solution` reports after every stride. Each candidate is
//! evaluated for a fixed trial; the search keeps the best-seen tuple,
//! probes axis neighbours at the current radius, and halves the radius
//! when no neighbour wins. Search state machine:
//! warmup -> evaluate candidates -> (move | shrink radius) -> done.

use crate::settings::Settings;
use data::dims::DimSet;
use data::idx::Indices;
use data::{round_up, Idx};
use log::{debug, info};
use std::collections::VecDeque;

/// Search policy knobs
#[derive(Clone, Debug)]
pub struct TunerPolicy {
    /// Trials discarded at the start to warm caches
    pub warmup_trials: usize,
    /// A trial ends after this much time...
    pub trial_secs: f64,
    /// ...and at least this many steps
    pub min_trial_steps: Idx,
    /// Initial neighbour distance in cluster units
    pub radius: Idx,
    /// Fractional rate gain required to move the centre
    pub min_gain: f64,
}

impl Default for TunerPolicy {
    fn default() -> Self {
        Self {
            warmup_trials: 1,
            trial_secs: 0.25,
            min_trial_steps: 2,
            radius: 4,
            min_gain: 0.03,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Phase {
    Warmup,
    Evaluating,
    Done,
}

/// Hill-climbing search state
#[derive(Debug)]
pub struct AutoTuner {
    name: String,
    policy: TunerPolicy,
    phase: Phase,

    /// Tuple under measurement
    current: Indices,
    /// Best tuple and its rate
    best: Indices,
    best_rate: f64,
    /// Centre whose neighbours are being probed
    center: Indices,
    radius: Idx,

    /// Remaining candidates at this radius
    candidates: VecDeque<Indices>,

    /// Accumulators of the running trial
    trial_steps: Idx,
    trial_secs: f64,
    warmups_left: usize,
}

impl AutoTuner {
    pub fn new(name: impl Into<String>, policy: TunerPolicy, block_sizes: Indices) -> Self {
        let warmups = policy.warmup_trials;
        Self {
            name: name.into(),
            policy,
            phase: Phase::Warmup,
            current: block_sizes.clone(),
            best: block_sizes.clone(),
            best_rate: 0.0,
            center: block_sizes,
            radius: 0,
            candidates: VecDeque::new(),
            trial_steps: 0,
            trial_secs: 0.0,
            warmups_left: warmups,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn best_sizes(&self) -> &Indices {
        &self.best
    }

    /// Restart the search from the current settings
    pub fn reset(&mut self, block_sizes: Indices) {
        *self = AutoTuner::new(self.name.clone(), self.policy.clone(), block_sizes);
    }

    /// Account one stride of `steps` taking `secs`; may retarget the
    /// block sizes in `settings` for the next stride
    ///
    /// Returns `true` when the tuner changed the settings (the caller
    /// re-adjusts and rebuilds anything derived from block sizes).
    pub fn eval(&mut self, steps: Idx, secs: f64, dims: &DimSet, settings: &mut Settings) -> bool {
        if self.phase == Phase::Done {
            return false;
        }
        self.trial_steps += steps;
        self.trial_secs += secs;
        if self.trial_secs < self.policy.trial_secs || self.trial_steps < self.policy.min_trial_steps
        {
            return false;
        }
        let rate = self.trial_steps as f64 / self.trial_secs.max(1e-9);
        let finished = std::mem::replace(&mut self.current, Indices::new(0, dims.ndd()));
        debug!(
            "tuner '{}': {} -> {rate:.3} steps/s",
            self.name,
            fmt_sizes(&finished)
        );
        self.trial_steps = 0;
        self.trial_secs = 0.0;

        match self.phase {
            Phase::Warmup => {
                self.current = finished;
                if self.warmups_left > 0 {
                    self.warmups_left -= 1;
                    return false;
                }
                // The starting point is the first measured candidate.
                self.best = self.current.clone();
                self.center = self.current.clone();
                self.best_rate = rate;
                self.radius = self.policy.radius;
                self.push_neighbors(dims);
                self.phase = Phase::Evaluating;
                self.next_candidate(dims, settings)
            }
            Phase::Evaluating => {
                if rate > self.best_rate * (1.0 + self.policy.min_gain) {
                    debug!(
                        "tuner '{}': new best {} ({rate:.3} steps/s)",
                        self.name,
                        fmt_sizes(&finished)
                    );
                    self.best = finished;
                    self.best_rate = rate;
                } else if rate > self.best_rate {
                    // Keep strictly-better results without re-centring.
                    self.best = finished;
                    self.best_rate = rate;
                }
                self.next_candidate(dims, settings)
            }
            Phase::Done => false,
        }
    }

    /// Queue axis neighbours of the centre at the current radius
    fn push_neighbors(&mut self, dims: &DimSet) {
        let cluster = dims.cluster_pts();
        for j in 0..dims.ndd() {
            for dir in [-1, 1] {
                let mut n = self.center.clone();
                let step = self.radius * cluster[j];
                n[j] = round_up((n[j] + dir * step).max(1), cluster[j]);
                if n != self.center {
                    self.candidates.push_back(n);
                }
            }
        }
    }

    /// Install the next candidate, or move/shrink/stop
    fn next_candidate(&mut self, dims: &DimSet, settings: &mut Settings) -> bool {
        loop {
            if let Some(c) = self.candidates.pop_front() {
                self.current = c;
                apply_blocks(&self.current, dims, settings);
                return true;
            }
            // Round over: re-centre on the best if it moved, else shrink.
            if self.best != self.center {
                self.center = self.best.clone();
            } else {
                self.radius /= 2;
            }
            if self.radius < 1 {
                self.phase = Phase::Done;
                self.current = self.best.clone();
                apply_blocks(&self.best, dims, settings);
                info!(
                    "tuner '{}': converged on {} ({:.3} steps/s)",
                    self.name,
                    fmt_sizes(&self.best),
                    self.best_rate
                );
                return true;
            }
            self.push_neighbors(dims);
        }
    }
}

/// Write a block-size tuple into settings (domain entries only)
pub fn apply_blocks(sizes: &Indices, dims: &DimSet, settings: &mut Settings) {
    for (j, name) in dims.domain_dims().iter().enumerate() {
        settings.block_sizes.set(name, sizes[j]);
    }
    settings.adjust(dims);
}

/// Domain block sizes currently in settings
pub fn current_blocks(dims: &DimSet, settings: &Settings) -> Indices {
    let mut v = Indices::new(0, dims.ndd());
    for (j, name) in dims.domain_dims().iter().enumerate() {
        v[j] = settings.block_sizes.get(name).unwrap_or(0);
    }
    v
}

fn fmt_sizes(v: &Indices) -> String {
    v.0.iter()
        .map(Idx::to_string)
        .collect::<Vec<_>>()
        .join("x")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> DimSet {
        DimSet::new("t", ["x", "y"], Vec::<String>::new())
    }

    fn fast_policy() -> TunerPolicy {
        TunerPolicy {
            warmup_trials: 0,
            trial_secs: 0.0,
            min_trial_steps: 1,
            radius: 2,
            min_gain: 0.03,
        }
    }

    /// Synthetic cost model: rate peaks at block size 32 in both dims
    fn rate_of(sizes: &Indices) -> f64 {
        let c = |v: Idx| 1.0 / (1.0 + ((v - 32).abs() as f64) / 32.0);
        c(sizes[0]) * c(sizes[1])
    }

    #[test]
    fn converges_to_no_worse_than_start() {
        let d = dims();
        let mut s = Settings::new(&d);
        s.rank_sizes.set("x", 128);
        s.rank_sizes.set("y", 128);
        s.block_sizes.set("x", 8);
        s.block_sizes.set("y", 8);
        s.adjust(&d);
        let start = current_blocks(&d, &s);
        let start_rate = rate_of(&start);
        let mut tuner = AutoTuner::new("ctx", fast_policy(), start);

        let mut iters = 0;
        while !tuner.is_done() {
            iters += 1;
            assert!(iters < 1000, "tuner failed to terminate");
            let cur = current_blocks(&d, &s);
            let rate = rate_of(&cur);
            // Report one stride: steps / (steps/rate) == rate.
            tuner.eval(4, 4.0 / rate, &d, &mut s);
        }
        let final_rate = rate_of(tuner.best_sizes());
        assert!(final_rate >= start_rate, "{final_rate} < {start_rate}");
        // Settings hold the best sizes after convergence.
        assert_eq!(&current_blocks(&d, &s), tuner.best_sizes());
    }

    #[test]
    fn reset_restarts_search() {
        let d = dims();
        let mut s = Settings::new(&d);
        s.rank_sizes.set("x", 64);
        s.rank_sizes.set("y", 64);
        s.adjust(&d);
        let mut tuner = AutoTuner::new("ctx", fast_policy(), current_blocks(&d, &s));
        tuner.eval(4, 1.0, &d, &mut s);
        assert!(!tuner.is_done());
        tuner.reset(current_blocks(&d, &s));
        assert!(!tuner.is_done());
    }
}
