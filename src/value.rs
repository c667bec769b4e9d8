//! Concrete values and their trace identity.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::{arr0, ArrayD, IxDyn};

use crate::error::{Error, Result};
use crate::Floating;

pub type TensorData<D> = ArrayD<D>;

/// Element type tag, used in jit signatures and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
        }
    }
}

/// Process-wide unique identity of a [`Value`].
///
/// Cloning a `Value` keeps its id (same provenance); every fresh result of
/// a primitive application gets a new one.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueId(u64);

static NEXT_VALUE_ID: AtomicU64 = AtomicU64::new(1);

impl ValueId {
    fn fresh() -> Self {
        ValueId(NEXT_VALUE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An immutable tensor together with its trace identity and vmap metadata.
///
/// A value is "computed" when some node on the active tape lists its id as
/// output, and a literal otherwise. `batch_dim` marks which physical axis
/// (if any) is a vmap batch axis; the logical shape excludes it.
#[derive(Debug, Clone)]
pub struct Value<D> {
    data: Arc<TensorData<D>>,
    id: ValueId,
    batch_dim: Option<usize>,
}

impl<D: Floating> Value<D> {
    pub fn new(data: TensorData<D>) -> Self {
        Self { data: Arc::new(data), id: ValueId::fresh(), batch_dim: None }
    }

    pub fn from_arc(data: Arc<TensorData<D>>) -> Self {
        Self { data, id: ValueId::fresh(), batch_dim: None }
    }

    /// A rank-0 value.
    pub fn scalar(v: D) -> Self {
        Self::new(arr0(v).into_dyn())
    }

    pub fn from_vec(shape: &[usize], data: Vec<D>) -> Result<Self> {
        let arr = TensorData::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| Error::shape("from_vec", e.to_string()))?;
        Ok(Self::new(arr))
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(TensorData::zeros(IxDyn(shape)))
    }

    /// Ones with the physical shape and batch metadata of `v`.
    pub fn ones_like(v: &Value<D>) -> Self {
        Self::new(TensorData::from_elem(IxDyn(v.shape()), D::one())).with_batch_dim(v.batch_dim)
    }

    #[must_use]
    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn data(&self) -> &TensorData<D> {
        &self.data
    }

    pub fn data_arc(&self) -> Arc<TensorData<D>> {
        Arc::clone(&self.data)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// The shape with the batch axis (if any) removed.
    pub fn logical_shape(&self) -> Vec<usize> {
        match self.batch_dim {
            None => self.shape().to_vec(),
            Some(d) => {
                let mut s = self.shape().to_vec();
                s.remove(d);
                s
            }
        }
    }

    pub fn batch_dim(&self) -> Option<usize> {
        self.batch_dim
    }

    /// Re-tag the batch axis, keeping identity and data.
    #[must_use]
    pub(crate) fn with_batch_dim(mut self, batch_dim: Option<usize>) -> Self {
        self.batch_dim = batch_dim;
        self
    }

    #[must_use]
    pub(crate) fn clear_batch(&self) -> Self {
        self.clone().with_batch_dim(None)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The single element of a scalar (or one-element) value.
    pub fn item(&self) -> Option<D> {
        if self.data.len() == 1 {
            self.data.iter().next().copied()
        } else {
            None
        }
    }

    pub fn to_array(&self) -> TensorData<D> {
        (*self.data).clone()
    }
}

impl<D: Floating> From<TensorData<D>> for Value<D> {
    fn from(data: TensorData<D>) -> Self {
        Self::new(data)
    }
}
