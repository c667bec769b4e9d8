//! The primitive dispatch table.
//!
//! Each primitive registers a forward rule, an optional gradient rule and a
//! batching rule under its name. The engine keeps one registry per element
//! type in a thread-local table; [`lookup`] copies the rule pointers out so
//! rules may themselves apply primitives without re-entering the table.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::value::{TensorData, Value};
use crate::Floating;

/// Static per-node parameters of a primitive application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpParams {
    None,
    /// Reduction axes (logical), highest first, and whether reduced axes
    /// are kept as size-1 dims.
    Axes { axes: Vec<usize>, keep_dims: bool },
    /// Target logical shape for reshape/broadcast.
    Shape(Vec<usize>),
    /// Axis permutation for transpose.
    Perm(Vec<usize>),
}

/// A primitive input as seen by a batching rule: raw data plus which axis
/// (if any) carries the batch.
pub struct BatchedArg<'a, D> {
    pub data: &'a TensorData<D>,
    pub batch_dim: Option<usize>,
}

/// Computes the concrete output from concrete inputs. Shape-checks first.
pub type ForwardRule<D> = fn(&OpParams, &[&TensorData<D>]) -> Result<TensorData<D>>;

/// The vector-Jacobian product: given forward inputs/output and the
/// incoming output gradient, returns one gradient per input (shaped like
/// that input's logical shape). Expressed via the eager ops so the reverse
/// pass is itself traceable and batchable.
pub type GradientRule<D> =
    fn(&OpParams, &[Value<D>], &Value<D>, &Value<D>) -> Result<Vec<Value<D>>>;

/// Executes the primitive with a batch axis on some inputs, returning the
/// batched output and the axis its batch landed on.
pub type BatchingRule<D> =
    fn(&OpParams, &[BatchedArg<'_, D>]) -> Result<(TensorData<D>, Option<usize>)>;

#[derive(Clone, Copy)]
pub struct PrimitiveDef<D: Floating> {
    pub name: &'static str,
    pub forward: ForwardRule<D>,
    pub gradient: Option<GradientRule<D>>,
    pub batching: BatchingRule<D>,
}

pub struct Registry<D: Floating> {
    defs: HashMap<&'static str, PrimitiveDef<D>>,
}

impl<D: Floating> Registry<D> {
    pub fn empty() -> Self {
        Self { defs: HashMap::new() }
    }

    /// The fixed primitive set the engine ships with.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        for def in crate::ops::default_defs::<D>() {
            r.register(def);
        }
        r
    }

    /// Insert or replace a primitive definition.
    pub fn register(&mut self, def: PrimitiveDef<D>) {
        self.defs.insert(def.name, def);
    }

    pub fn get(&self, name: &'static str) -> Result<PrimitiveDef<D>> {
        self.defs.get(name).copied().ok_or(Error::UnknownPrimitive(name))
    }
}

impl<D: Floating> Default for Registry<D> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

thread_local! {
    static REGISTRIES: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

fn with_registry<D: Floating, R>(f: impl FnOnce(&mut Registry<D>) -> R) -> R {
    REGISTRIES.with(|cell| {
        let mut map = cell.borrow_mut();
        let entry = map
            .entry(TypeId::of::<D>())
            .or_insert_with(|| Box::new(Registry::<D>::with_defaults()) as Box<dyn Any>);
        let reg = entry
            .downcast_mut::<Registry<D>>()
            .expect("registry entries are keyed by element type");
        f(reg)
    })
}

/// Copy a primitive's rule table out of the thread-local registry.
pub fn lookup<D: Floating>(name: &'static str) -> Result<PrimitiveDef<D>> {
    with_registry(|r: &mut Registry<D>| r.get(name))
}

/// Extend the thread-local registry with a custom primitive.
pub fn register<D: Floating>(def: PrimitiveDef<D>) {
    with_registry(|r: &mut Registry<D>| r.register(def));
}
