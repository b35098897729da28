//! Shared fixtures: a 2n+1-point Laplacian bundle over any number of
//! domain dims, plus helpers to build and seed solutions.

use compute::{Bundle, EvalCtx, Solution, VarRef};
use comm::Env;
use data::dims::DimSet;
use data::idx::Indices;
use data::var::VarId;
use data::{Idx, Precision};

/// `u[t, p] = u[t-1, p] + c * (sum of 2n face neighbours - 2n * centre)`
pub struct Laplacian {
    pub u: VarId,
    pub coef: Precision,
}

impl Bundle for Laplacian {
    fn name(&self) -> &str {
        "laplace"
    }

    fn output_vars(&self) -> Vec<VarRef> {
        vec![VarRef::Var(self.u)]
    }

    /// Evaluating step t consumes step t-1
    fn output_step_index(&self, t: Idx) -> Option<Idx> {
        Some(t)
    }

    fn calc_scalar(&self, ctx: &EvalCtx<'_>, _thread: usize, pt: &Indices) {
        let u = ctx.var(VarRef::Var(self.u));
        let ndd = pt.len() - 1;
        let mut prev = pt.0.clone();
        prev[0] -= 1;
        let center = u.read_elem(&prev);
        let mut acc = -(2 * ndd as i32) as Precision * center;
        for d in 1..=ndd {
            prev[d] -= 1;
            acc += u.read_elem(&prev);
            prev[d] += 2;
            acc += u.read_elem(&prev);
            prev[d] -= 1;
        }
        u.write_elem(&pt.0, center + self.coef * acc);
    }

    fn points_read(&self) -> usize {
        7
    }

    fn fp_ops(&self) -> usize {
        9
    }
}

/// Build a prepared Laplacian solution over the given dims
pub struct Harness {
    pub soln: Solution,
    pub u: VarId,
}

#[allow(clippy::too_many_arguments)]
pub fn laplacian_soln(
    env: Env,
    dim_names: &[&str],
    global: &[Idx],
    block: Idx,
    wf_steps: Idx,
    tb_steps: Idx,
    extra_args: &[&str],
) -> Harness {
    let dims = DimSet::new("t", dim_names.to_vec(), Vec::<String>::new());
    let mut soln = Solution::new(env, dims);
    let mut var_dims = vec!["t"];
    var_dims.extend_from_slice(dim_names);
    let u = soln.new_var("u", &var_dims).unwrap();
    for (j, dn) in dim_names.iter().enumerate() {
        soln.set_halo(u, dn, 1, 1).unwrap();
        soln.set_global_size(dn, global[j]);
        if block > 0 {
            soln.set_block_size(dn, block);
        }
    }
    soln.set_region_size("t", wf_steps);
    soln.set_block_size("t", tb_steps);
    let bi = soln.add_bundle(Box::new(Laplacian { u, coef: 0.1 }));
    soln.add_pack("main", vec![bi]).unwrap();
    if !extra_args.is_empty() {
        soln.apply_command_line_options(extra_args).unwrap();
    }
    soln.prepare_solution().unwrap();
    Harness { soln, u }
}

/// Seed: 0.1 everywhere, 1.0 at the global centre of step 0
pub fn seed(h: &Harness, global: &[Idx]) {
    let var = h.soln.var(h.u);
    var.storage().unwrap().fill(0.1);
    var.set_dirty_all(true);
    let mut pt = vec![0];
    pt.extend(global.iter().map(|&g| g / 2));
    // Non-strict: only the owning rank lands the write.
    var.set_element(&pt, 1.0, false).unwrap();
}

/// Domain values of the final step, row-major over this rank's box
pub fn snapshot(h: &Harness, t: Idx) -> Vec<Precision> {
    let var = h.soln.var(h.u);
    let bb = &h.soln.geometry().rank_bb;
    let mut out = Vec::with_capacity(bb.size as usize);
    let mut pt = vec![t; bb.ndims() + 1];
    walk(&bb.begin, &bb.end, &mut |dpt: &[Idx]| {
        pt[0] = t;
        pt[1..].copy_from_slice(dpt);
        out.push(var.get_element(&pt, true).unwrap());
    });
    out
}

/// Row-major walk of a domain box
pub fn walk(begin: &Indices, end: &Indices, f: &mut impl FnMut(&[Idx])) {
    let n = begin.len();
    let mut pt: Vec<Idx> = begin.0.clone();
    if (0..n).any(|d| end[d] <= begin[d]) {
        return;
    }
    loop {
        f(&pt);
        let mut d = n - 1;
        loop {
            pt[d] += 1;
            if pt[d] < end[d] {
                break;
            }
            pt[d] = begin[d];
            if d == 0 {
                return;
            }
            d -= 1;
        }
    }
}
