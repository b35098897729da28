//! Solution settings
//!
//! All sizes are in elements and all size tuples span the solution dims
//! `[step, domain...]`; the step entry of the region sizes is the
//! wave-front depth and the step entry of the block sizes is the
//! temporal-block depth. `adjust` rounds and clamps everything bottom-up
//! the way users expect: unset (zero) values inherit from the enclosing
//! level.

use clap::Parser;
use data::dims::DimSet;
use data::idx::{Indices, IdxTuple};
use data::{round_up, Idx};
use log::debug;

/// Default spatial block edge when nothing is configured
pub const DEF_BLOCK: Idx = 32;

/// Tunable knobs of one solution (or one pack)
#[derive(Clone, Debug)]
pub struct Settings {
    pub global_sizes: IdxTuple,
    pub rank_sizes: IdxTuple,
    pub region_sizes: IdxTuple,
    pub block_group_sizes: IdxTuple,
    pub block_sizes: IdxTuple,
    pub mini_block_group_sizes: IdxTuple,
    pub mini_block_sizes: IdxTuple,
    pub sub_block_group_sizes: IdxTuple,
    pub sub_block_sizes: IdxTuple,
    pub min_pad_sizes: IdxTuple,
    pub extra_pad_sizes: IdxTuple,

    /// Ranks per domain dim; 0 = factorise automatically
    pub num_ranks: Indices,
    pub rank_indices: Indices,
    pub find_loc: bool,

    pub overlap_comms: bool,
    pub use_shm: bool,
    pub allow_vec_exchange: bool,
    pub min_exterior: Idx,

    pub max_threads: usize,
    pub thread_divisor: usize,
    pub num_block_threads: usize,
    pub bind_block_threads: bool,
    /// Solution-dim position of the thread-binding dim
    pub bind_posn: usize,

    pub step_wrap: bool,
    pub force_scalar: bool,
    pub trace: bool,

    /// Reverse every other pass of the tile loops
    pub serpentine: bool,
    /// Interleave row pairs in the sub-block loops
    pub square_wave: bool,

    pub do_auto_tune: bool,

    pub numa_pref: i32,
    /// GiB allocatable on a NUMA node before falling back to PMEM
    pub numa_pref_max_gib: usize,
}

impl Settings {
    pub fn new(dims: &DimSet) -> Self {
        let soln = dims.new_soln_tuple();
        let ndd = dims.ndd();
        Self {
            global_sizes: soln.clone(),
            rank_sizes: soln.clone(),
            region_sizes: soln.clone(),
            block_group_sizes: soln.clone(),
            block_sizes: soln.clone(),
            mini_block_group_sizes: soln.clone(),
            mini_block_sizes: soln.clone(),
            sub_block_group_sizes: soln.clone(),
            sub_block_sizes: soln.clone(),
            min_pad_sizes: soln.clone(),
            extra_pad_sizes: soln,
            num_ranks: Indices::new(0, ndd),
            rank_indices: Indices::new(0, ndd),
            find_loc: true,
            overlap_comms: true,
            use_shm: false,
            allow_vec_exchange: true,
            min_exterior: 0,
            max_threads: 0,
            thread_divisor: 1,
            num_block_threads: 1,
            bind_block_threads: false,
            bind_posn: 1,
            step_wrap: false,
            force_scalar: false,
            trace: false,
            serpentine: false,
            square_wave: false,
            do_auto_tune: false,
            numa_pref: -1,
            numa_pref_max_gib: 128,
        }
    }

    /// Requested wave-front depth (region size in the step dim)
    pub fn wf_steps_req(&self) -> Idx {
        self.region_sizes.vals()[0].max(0)
    }

    /// Requested temporal-block depth (block size in the step dim)
    pub fn tb_steps_req(&self) -> Idx {
        self.block_sizes.vals()[0].max(0)
    }

    /// Round and clamp all tile sizes bottom-up
    ///
    /// Unset (zero) spatial sizes inherit from the enclosing level;
    /// every level is clamped into its parent and rounded up to whole
    /// clusters so the vector kernels see even work.
    pub fn adjust(&mut self, dims: &DimSet) {
        let cluster = dims.cluster_pts();
        let ndd = dims.ndd();

        // Wave-front depth covers at least the temporal-block depth.
        let wf = self.wf_steps_req().max(self.tb_steps_req());
        let t_name = self.region_sizes.name(0).to_owned();
        self.region_sizes.set(&t_name, wf);

        for j in 0..ndd {
            let i = DimSet::soln_posn(j);
            let name = dims.domain_dims()[j].clone();
            let rank = self.rank_sizes.vals()[i];

            let fit = |req: Idx, parent: Idx, fallback: Idx| -> Idx {
                let v = if req <= 0 { fallback.min(parent) } else { req };
                round_up(v.min(parent).max(1), cluster[j]).min(round_up(parent, cluster[j]))
            };

            let region = fit(self.region_sizes.vals()[i], rank, rank);
            let block = fit(self.block_sizes.vals()[i], region, DEF_BLOCK);
            let mini = fit(self.mini_block_sizes.vals()[i], block, block);
            let sub = fit(self.sub_block_sizes.vals()[i], mini, mini);

            self.region_sizes.set(&name, region);
            self.block_sizes.set(&name, block);
            self.mini_block_sizes.set(&name, mini);
            self.sub_block_sizes.set(&name, sub);
        }
        debug!(
            "adjusted sizes: region {}, block {}, mini-block {}, sub-block {}",
            self.region_sizes.make_dim_val_str(","),
            self.block_sizes.make_dim_val_str(","),
            self.mini_block_sizes.make_dim_val_str(","),
            self.sub_block_sizes.make_dim_val_str(",")
        );
    }

    /// Thread split: (region threads, block threads)
    pub fn comp_threads(&self) -> (usize, usize) {
        let avail = if self.max_threads > 0 {
            self.max_threads
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        };
        let total = (avail / self.thread_divisor.max(1)).max(1);
        let block = self.num_block_threads.clamp(1, total);
        let region = (total / block).max(1);
        (region, block)
    }
}

/// One `dim=value` (or bare `value` = all domain dims) CLI entry
#[derive(Clone, Debug)]
pub struct DimVal {
    pub dim: Option<String>,
    pub val: Idx,
}

impl std::str::FromStr for DimVal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        let (dim, val) = match s.split_once('=') {
            Some((d, v)) => (Some(d.trim().to_owned()), v),
            None => (None, s),
        };
        let val: Idx = val
            .trim()
            .parse()
            .map_err(|e| format!("bad size '{s}': {e}"))?;
        Ok(DimVal { dim, val })
    }
}

fn apply_dim_vals(tuple: &mut IdxTuple, vals: &[DimVal], domain_only: bool) -> Result<(), String> {
    for dv in vals {
        match &dv.dim {
            Some(d) => {
                if !tuple.set(d, dv.val) {
                    return Err(format!("unknown dim '{d}'"));
                }
            }
            None => {
                let names: Vec<String> = tuple
                    .names()
                    .skip(domain_only as usize)
                    .map(str::to_owned)
                    .collect();
                for n in names {
                    tuple.set(&n, dv.val);
                }
            }
        }
    }
    Ok(())
}

/// Command-line surface, mirroring the numeric setters
///
/// Sizes take repeated `dim=value` entries (`-g x=128 -g y=64`) or a bare
/// value applied to every domain dim (`-g 128`).
#[derive(Debug, Parser)]
#[command(no_binary_name = true)]
pub struct Options {
    /// Global (overall problem) domain sizes
    #[arg(short = 'g', long = "global-size")]
    pub global_size: Vec<DimVal>,

    /// This rank's local domain sizes
    #[arg(short = 'l', long = "local-size")]
    pub local_size: Vec<DimVal>,

    /// Region sizes (step entry = wave-front depth)
    #[arg(short = 'r', long = "region-size")]
    pub region_size: Vec<DimVal>,

    /// Block sizes (step entry = temporal-block depth)
    #[arg(short = 'b', long = "block-size")]
    pub block_size: Vec<DimVal>,

    /// Mini-block sizes
    #[arg(long = "mini-block-size")]
    pub mini_block_size: Vec<DimVal>,

    /// Sub-block sizes
    #[arg(long = "sub-block-size")]
    pub sub_block_size: Vec<DimVal>,

    /// Minimum padding (including halos)
    #[arg(long = "min-pad-size")]
    pub min_pad_size: Vec<DimVal>,

    /// Extra padding outside halos
    #[arg(long = "extra-pad-size")]
    pub extra_pad_size: Vec<DimVal>,

    /// Ranks per domain dim
    #[arg(long = "num-ranks")]
    pub num_ranks: Vec<DimVal>,

    /// This rank's grid indices
    #[arg(long = "rank-indices")]
    pub rank_indices: Vec<DimVal>,

    /// Overlap communication with interior computation
    #[arg(long, env = "OVERLAP_COMMS")]
    pub overlap_comms: Option<bool>,

    /// Use shared memory with same-node neighbours
    #[arg(long)]
    pub use_shm: bool,

    /// Disable the vector inner kernels
    #[arg(long)]
    pub force_scalar: bool,

    /// Verbose per-call tracing on the log
    #[arg(long)]
    pub trace: bool,

    /// Alias invalid step indices into the live window
    #[arg(long)]
    pub step_wrap: bool,

    /// Bind block threads to sub-block slabs
    #[arg(long)]
    pub bind_block_threads: bool,

    /// Serpentine traversal of the tile loops
    #[arg(long)]
    pub serpentine: bool,

    /// Square-wave traversal of the sub-block loops
    #[arg(long)]
    pub square_wave: bool,

    /// NUMA preference: node id, or -1 for first-touch local
    #[arg(long, default_value_t = -1)]
    pub numa_pref: i32,

    /// Enable auto-tuning during run_solution
    #[arg(long)]
    pub auto_tune: bool,

    /// Threads available to this rank (0 = all)
    #[arg(long, env = "MAX_THREADS", default_value_t = 0)]
    pub max_threads: usize,

    /// Divide available threads by this factor
    #[arg(long, default_value_t = 1)]
    pub thread_divisor: usize,

    /// Threads per block
    #[arg(long, default_value_t = 1)]
    pub block_threads: usize,

    /// Minimum exterior slab width under overlap
    #[arg(long, default_value_t = 0)]
    pub min_exterior: Idx,
}

impl Options {
    /// Parse an argv slice (no binary name)
    pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Self, String> {
        Options::try_parse_from(args.iter().map(AsRef::as_ref)).map_err(|e| e.to_string())
    }

    /// Fold parsed options into settings
    pub fn apply_to(&self, s: &mut Settings) -> Result<(), String> {
        apply_dim_vals(&mut s.global_sizes, &self.global_size, true)?;
        apply_dim_vals(&mut s.rank_sizes, &self.local_size, true)?;
        // Bare values touch the domain dims only; the step entries (wave
        // front and temporal depth) must be named explicitly (`-r t=4`).
        apply_dim_vals(&mut s.region_sizes, &self.region_size, true)?;
        apply_dim_vals(&mut s.block_sizes, &self.block_size, true)?;
        apply_dim_vals(&mut s.mini_block_sizes, &self.mini_block_size, true)?;
        apply_dim_vals(&mut s.sub_block_sizes, &self.sub_block_size, true)?;
        apply_dim_vals(&mut s.min_pad_sizes, &self.min_pad_size, true)?;
        apply_dim_vals(&mut s.extra_pad_sizes, &self.extra_pad_size, true)?;
        for (list, target) in [
            (&self.num_ranks, &mut s.num_ranks),
            (&self.rank_indices, &mut s.rank_indices),
        ] {
            let mut t = s.global_sizes.clone();
            t.set_all(0);
            // Domain entries only; reuse tuple names for lookup.
            for dv in list {
                match &dv.dim {
                    Some(d) => {
                        if !t.set(d, dv.val) {
                            return Err(format!("unknown dim '{d}'"));
                        }
                    }
                    None => t.set_all(dv.val),
                }
            }
            let vals = t.vals();
            for j in 0..target.len() {
                if vals[j + 1] != 0 {
                    target[j] = vals[j + 1];
                }
            }
        }
        if !self.rank_indices.is_empty() {
            s.find_loc = false;
        }
        if let Some(v) = self.overlap_comms {
            s.overlap_comms = v;
        }
        s.use_shm |= self.use_shm;
        s.force_scalar |= self.force_scalar;
        s.trace |= self.trace;
        s.step_wrap |= self.step_wrap;
        s.bind_block_threads |= self.bind_block_threads;
        s.serpentine |= self.serpentine;
        s.square_wave |= self.square_wave;
        s.numa_pref = self.numa_pref;
        s.do_auto_tune |= self.auto_tune;
        s.max_threads = self.max_threads;
        s.thread_divisor = self.thread_divisor;
        s.num_block_threads = self.block_threads;
        s.min_exterior = self.min_exterior;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> DimSet {
        DimSet::new("t", ["x", "y"], Vec::<String>::new())
    }

    fn with_rank(sz: Idx) -> Settings {
        let d = dims();
        let mut s = Settings::new(&d);
        s.rank_sizes.set("x", sz);
        s.rank_sizes.set("y", sz);
        s
    }

    #[test]
    fn adjust_defaults_and_clamps() {
        let d = dims();
        let mut s = with_rank(100);
        s.adjust(&d);
        // Unset region covers the rank; unset block gets the default.
        assert_eq!(s.region_sizes.get("x"), Some(100));
        assert_eq!(s.block_sizes.get("x"), Some(DEF_BLOCK));
        assert_eq!(s.mini_block_sizes.get("x"), Some(DEF_BLOCK));
        assert_eq!(s.sub_block_sizes.get("x"), Some(DEF_BLOCK));

        // Oversized requests clamp to the parent.
        s.block_sizes.set("x", 500);
        s.adjust(&d);
        assert_eq!(s.block_sizes.get("x"), Some(100));
    }

    #[test]
    fn adjust_rounds_to_clusters() {
        let mut d = dims();
        d.set_fold(Indices(vec![1, 4]));
        let mut s = with_rank(100);
        s.block_sizes.set("y", 30);
        s.adjust(&d);
        assert_eq!(s.block_sizes.get("y"), Some(32));
    }

    #[test]
    fn wf_covers_tb() {
        let d = dims();
        let mut s = with_rank(64);
        s.block_sizes.set("t", 4); // TB depth 4
        s.adjust(&d);
        assert_eq!(s.region_sizes.get("t"), Some(4)); // WF raised to match
        assert_eq!(s.wf_steps_req(), 4);
        assert_eq!(s.tb_steps_req(), 4);
    }

    #[test]
    fn options_roundtrip() {
        let d = dims();
        let mut s = Settings::new(&d);
        let o = Options::parse_args(&[
            "-g",
            "128",
            "-g",
            "y=64",
            "-b",
            "x=16",
            "-r",
            "t=4",
            "--num-ranks",
            "x=2",
            "--use-shm",
            "--trace",
            "--min-exterior",
            "8",
        ])
        .unwrap();
        o.apply_to(&mut s).unwrap();
        assert_eq!(s.global_sizes.get("x"), Some(128));
        assert_eq!(s.global_sizes.get("y"), Some(64));
        assert_eq!(s.block_sizes.get("x"), Some(16));
        assert_eq!(s.region_sizes.get("t"), Some(4));
        assert_eq!(s.num_ranks.0, vec![2, 0]);
        assert!(s.use_shm && s.trace);
        assert_eq!(s.min_exterior, 8);
        // Bad dim name is rejected.
        let o = Options::parse_args(&["-g", "q=1"]).unwrap();
        assert!(o.apply_to(&mut Settings::new(&d)).is_err());
    }
}
