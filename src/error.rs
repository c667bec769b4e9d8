//! Error taxonomy for traced evaluation and the transforms.
//!
//! Every error is local to one call: a failed trace discards its tape and
//! the jit cache is only updated after a fully successful trace.

use thiserror::Error;

use crate::value::DType;

#[derive(Debug, Error)]
pub enum Error {
    /// A forward rule's shape precondition failed (e.g. matmul inner dims).
    #[error("shape mismatch in `{op}`: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },

    /// A jit cache entry was recorded for a different element type.
    ///
    /// Not constructed today: values, tapes and caches are all generic
    /// over one element type, so mixing dtypes is a compile error. The
    /// variant backs the dtype field of the jit signature.
    #[error("dtype mismatch: cache entry is {expected}, call is {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// `grad` was applied to a function whose traced output is not scalar.
    #[error("grad requires a scalar output, got shape {0:?}")]
    NonScalarOutput(Vec<usize>),

    /// The reverse pass reached a primitive without a gradient rule.
    #[error("primitive `{0}` has no gradient rule")]
    NonDifferentiableOp(&'static str),

    /// `in_axes`/`out_axes` arity does not match the call arity.
    #[error("axis spec arity mismatch: call has {expected} values, spec lists {got}")]
    AxisSpecMismatch { expected: usize, got: usize },

    /// An argnum index is out of range for the call.
    #[error("argnum {argnum} out of range for a call with {arity} arguments")]
    InvalidArgnum { argnum: usize, arity: usize },

    /// Replaying a cached tape produced a structure that diverges from the
    /// recording. The wrapped function is not pure in its signature.
    #[error("jit replay diverged from the cached trace: {0}")]
    SignatureInconsistency(String),

    /// A tape refers to a primitive that is not registered.
    #[error("unknown primitive `{0}`")]
    UnknownPrimitive(&'static str),
}

impl Error {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        Error::ShapeMismatch { op, detail: detail.into() }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
