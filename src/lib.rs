//! A minimal tracing autodiff engine with composable transforms.
//!
//! Computations are expressed through the eager op functions in [`ops`];
//! every application runs immediately and, when a trace is active, is also
//! recorded onto a tape. The three transforms consume that tape:
//!
//! - [`transform::grad`] runs a reverse pass over the recorded segment,
//! - [`transform::vmap`] lifts a per-example function across a batch axis,
//! - [`transform::jit`] caches the tape per input signature and replays it.
//!
//! ```rust
//! use tapegrad::prelude::*;
//! use ndarray::arr1;
//!
//! fn f(args: &[Value<f64>]) -> Result<Value<f64>> {
//!     let sq = ops::mul(&args[0], &args[0])?;
//!     ops::sum_all(&sq)
//! }
//!
//! let df = grad(f, vec![0]);
//! let x = Value::new(arr1(&[1.0, 2.0, 3.0]).into_dyn());
//! let g = df(&[x]).unwrap();
//! assert_eq!(g[0].shape(), &[3]);
//! ```

use core::fmt;

use ndarray::LinalgScalar;
use num_traits::Float;

use crate::value::DType;

/// Element types the engine operates on. Implemented for `f32` and `f64`.
pub trait Floating: fmt::Debug + fmt::Display + Float + LinalgScalar + Send + Sync + 'static {
    const DTYPE: DType;

    /// Lossy cast from `f64`, used for structural constants like `0.5`.
    fn from_f64_lossy(v: f64) -> Self;
}

impl Floating for f32 {
    const DTYPE: DType = DType::F32;

    fn from_f64_lossy(v: f64) -> Self {
        v as f32
    }
}

impl Floating for f64 {
    const DTYPE: DType = DType::F64;

    fn from_f64_lossy(v: f64) -> Self {
        v
    }
}

pub mod error;
pub mod ops;
pub mod registry;
pub mod tape;
pub mod transform;
pub mod value;

pub mod prelude {
    pub use crate::{
        error::{Error, Result},
        ops,
        transform::{grad, grad1, jit, value_and_grad, vmap, AxisSpec, Jit},
        value::{DType, TensorData, Value},
        Floating,
    };
}
