//! Function transforms: reverse-mode differentiation, batching and
//! trace-compilation.
//!
//! Transforms compose because they all meet at [`crate::tape::bind`]:
//! `grad` consumes recorded nodes with eager rule applications that are
//! themselves recordable, `vmap` rides on per-value batch metadata, and
//! `jit` replays a recorded tape. `jit(vmap(grad(f)))` therefore needs no
//! machinery beyond the three pieces.

pub mod grad;
pub mod jit;
pub mod vmap;

pub use grad::{grad, grad1, value_and_grad};
pub use jit::{jit, Jit};
pub use vmap::vmap;

use crate::error::{Error, Result};

/// Which axis of each input (or output) of a `vmap`-ed function carries
/// the mapped dimension. `None` marks a value shared across the batch.
#[derive(Debug, Clone)]
pub enum AxisSpec {
    /// One choice applied to every value.
    Single(Option<usize>),
    /// An explicit per-value list; its length must match the call arity.
    Per(Vec<Option<usize>>),
}

impl AxisSpec {
    pub(crate) fn resolve(&self, arity: usize) -> Result<Vec<Option<usize>>> {
        match self {
            AxisSpec::Single(ax) => Ok(vec![*ax; arity]),
            AxisSpec::Per(axes) => {
                if axes.len() == arity {
                    Ok(axes.clone())
                } else {
                    Err(Error::AxisSpecMismatch { expected: arity, got: axes.len() })
                }
            }
        }
    }
}

impl From<usize> for AxisSpec {
    fn from(ax: usize) -> Self {
        AxisSpec::Single(Some(ax))
    }
}

impl From<Option<usize>> for AxisSpec {
    fn from(ax: Option<usize>) -> Self {
        AxisSpec::Single(ax)
    }
}

impl From<Vec<Option<usize>>> for AxisSpec {
    fn from(axes: Vec<Option<usize>>) -> Self {
        AxisSpec::Per(axes)
    }
}
