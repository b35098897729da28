//! Data model used by the stencil execution engine: named index tuples,
//! bounding boxes, dimension sets and the variable store.

pub mod bounds;
pub mod dims;
pub mod idx;
pub mod pool;
pub mod var;

/// Computation precision
#[cfg(not(feature = "f64"))]
pub type Precision = f32;
#[cfg(feature = "f64")]
pub type Precision = f64;

/// Signed index type used for all grid coordinates
///
/// Indices must be signed because points inside halos and wave-front
/// extensions lie below the rank origin.
pub type Idx = i64;

/// Floored integer division (quotient rounds towards negative infinity)
#[inline]
pub fn div_flr(num: Idx, den: Idx) -> Idx {
    debug_assert!(den > 0);
    num.div_euclid(den)
}

/// Floored integer modulo (result has the sign of the divisor)
#[inline]
pub fn mod_flr(num: Idx, den: Idx) -> Idx {
    debug_assert!(den > 0);
    num.rem_euclid(den)
}

/// Round `n` down to a multiple of `mult`, towards negative infinity
#[inline]
pub fn round_down_flr(n: Idx, mult: Idx) -> Idx {
    div_flr(n, mult) * mult
}

/// Ceiling division for non-negative operands
#[inline]
pub fn ceil_div(num: Idx, den: Idx) -> Idx {
    debug_assert!(den > 0);
    (num + den - 1) / den
}

/// Round `n` up to a multiple of `mult`
#[inline]
pub fn round_up(n: Idx, mult: Idx) -> Idx {
    ceil_div(n, mult) * mult
}

/// Errors raised by the variable store
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    /// Access to a variable whose storage has not been allocated
    #[error("variable '{0}' has no allocated storage")]
    Unallocated(String),

    /// Strict element access outside the allocated region
    #[error("index {index:?} is outside the allocation of variable '{var}' in dim '{dim}'")]
    OutOfBounds {
        var: String,
        dim: String,
        index: Idx,
    },

    /// Step index outside the valid window and `step_wrap` is off
    #[error(
        "step {step} is outside the valid window [{first}, {last}] of variable '{var}' \
         (enable step_wrap to alias it)"
    )]
    InvalidStep {
        var: String,
        step: Idx,
        first: Idx,
        last: Idx,
    },

    /// `fuse_vars` on incompatible shapes
    #[error("cannot fuse variable '{0}' with '{1}': {2}")]
    FuseMismatch(String, String, String),

    /// Mismatched buffer length in a bulk slice operation
    #[error("slice buffer holds {got} elements but the range covers {want}")]
    SliceLen { got: usize, want: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floored_ops_handle_negative_indices() {
        assert_eq!(div_flr(-1, 4), -1);
        assert_eq!(div_flr(-4, 4), -1);
        assert_eq!(div_flr(-5, 4), -2);
        assert_eq!(mod_flr(-1, 4), 3);
        assert_eq!(mod_flr(-4, 4), 0);
        assert_eq!(round_down_flr(-1, 4), -4);
        assert_eq!(round_down_flr(5, 4), 4);
    }

    #[test]
    fn rounding_up() {
        assert_eq!(ceil_div(7, 4), 2);
        assert_eq!(round_up(7, 4), 8);
        assert_eq!(round_up(8, 4), 8);
        assert_eq!(round_up(0, 4), 0);
    }
}
