//! The primitive library and its public eager entry points.
//!
//! Every function here routes through [`tape::bind`], so applications are
//! recorded whenever a trace is active. Gradient rules are written in
//! terms of these same functions, which is what lets the reverse pass be
//! traced by `jit` and batched by `vmap`.

pub mod arith;
pub mod loss;
pub mod matmul;
pub mod structural;
pub mod unary;

use ndarray::{IxDyn, Zip};

use crate::error::{Error, Result};
use crate::registry::{BatchedArg, OpParams, PrimitiveDef};
use crate::tape::bind;
use crate::value::{TensorData, Value};
use crate::Floating;

/// All primitives the engine ships with.
pub(crate) fn default_defs<D: Floating>() -> Vec<PrimitiveDef<D>> {
    let mut defs = vec![];
    defs.extend(arith::defs::<D>());
    defs.extend(unary::defs::<D>());
    defs.extend(matmul::defs::<D>());
    defs.extend(structural::defs::<D>());
    defs.extend(loss::defs::<D>());
    defs
}

// ── public eager ops ───────────────────────────────────────────────

pub fn add<D: Floating>(a: &Value<D>, b: &Value<D>) -> Result<Value<D>> {
    bind("add", OpParams::None, &[a.clone(), b.clone()])
}

pub fn sub<D: Floating>(a: &Value<D>, b: &Value<D>) -> Result<Value<D>> {
    bind("sub", OpParams::None, &[a.clone(), b.clone()])
}

pub fn mul<D: Floating>(a: &Value<D>, b: &Value<D>) -> Result<Value<D>> {
    bind("mul", OpParams::None, &[a.clone(), b.clone()])
}

/// Elementwise compare, returning a 0.0/1.0 mask. Not differentiable.
pub fn greater<D: Floating>(a: &Value<D>, b: &Value<D>) -> Result<Value<D>> {
    bind("greater", OpParams::None, &[a.clone(), b.clone()])
}

pub fn neg<D: Floating>(v: &Value<D>) -> Result<Value<D>> {
    bind("neg", OpParams::None, &[v.clone()])
}

pub fn exp<D: Floating>(v: &Value<D>) -> Result<Value<D>> {
    bind("exp", OpParams::None, &[v.clone()])
}

pub fn log<D: Floating>(v: &Value<D>) -> Result<Value<D>> {
    bind("log", OpParams::None, &[v.clone()])
}

pub fn tanh<D: Floating>(v: &Value<D>) -> Result<Value<D>> {
    bind("tanh", OpParams::None, &[v.clone()])
}

pub fn matmul<D: Floating>(a: &Value<D>, b: &Value<D>) -> Result<Value<D>> {
    bind("matmul", OpParams::None, &[a.clone(), b.clone()])
}

/// Fused, numerically stable sigmoid + binary cross-entropy of logits
/// against targets. See [`loss`] for the formulation.
pub fn sigmoid_bce<D: Floating>(logits: &Value<D>, targets: &Value<D>) -> Result<Value<D>> {
    bind("sigmoid_bce", OpParams::None, &[logits.clone(), targets.clone()])
}

/// Permute logical axes.
pub fn transpose<D: Floating>(v: &Value<D>, perm: &[usize]) -> Result<Value<D>> {
    bind("transpose", OpParams::Perm(perm.to_vec()), &[v.clone()])
}

/// Swap the last two logical axes (identity below rank 2).
pub fn t<D: Floating>(v: &Value<D>) -> Result<Value<D>> {
    bind("transpose", OpParams::None, &[v.clone()])
}

/// Move one logical axis to another position.
pub fn moveaxis<D: Floating>(v: &Value<D>, from: usize, to: usize) -> Result<Value<D>> {
    if from == to {
        return Ok(v.clone());
    }
    let rank = v.logical_shape().len();
    if from >= rank || to >= rank {
        return Err(Error::shape(
            "transpose",
            format!("moveaxis {from} -> {to} out of bounds for rank {rank}"),
        ));
    }
    let mut perm: Vec<usize> = (0..rank).filter(|&i| i != from).collect();
    perm.insert(to, from);
    transpose(v, &perm)
}

pub fn reshape<D: Floating>(v: &Value<D>, shape: &[usize]) -> Result<Value<D>> {
    bind("reshape", OpParams::Shape(shape.to_vec()), &[v.clone()])
}

pub fn broadcast_to<D: Floating>(v: &Value<D>, shape: &[usize]) -> Result<Value<D>> {
    bind("broadcast_to", OpParams::Shape(shape.to_vec()), &[v.clone()])
}

pub fn sum<D: Floating>(v: &Value<D>, axes: &[usize], keep_dims: bool) -> Result<Value<D>> {
    bind("sum", OpParams::Axes { axes: axes.to_vec(), keep_dims }, &[v.clone()])
}

/// Reduce every logical axis away, yielding a scalar.
pub fn sum_all<D: Floating>(v: &Value<D>) -> Result<Value<D>> {
    let axes: Vec<usize> = (0..v.logical_shape().len()).collect();
    sum(v, &axes, false)
}

/// Logistic function, derived from `tanh`: sigma(z) = (1 + tanh(z/2)) / 2.
pub fn sigmoid<D: Floating>(z: &Value<D>) -> Result<Value<D>> {
    let half = Value::scalar(D::from_f64_lossy(0.5));
    let one = Value::scalar(D::one());
    mul(&half, &add(&one, &tanh(&mul(&half, z)?)?)?)
}

/// Sum a broadcast gradient back down to the target logical shape.
///
/// Leading extra axes are reduced away; aligned axes where the target is 1
/// are reduced and reinstated via reshape.
pub fn reduce_to<D: Floating>(v: &Value<D>, target: &[usize]) -> Result<Value<D>> {
    let cur = v.logical_shape();
    if cur == target {
        return Ok(v.clone());
    }
    if cur.len() < target.len() {
        return Err(Error::shape(
            "sum",
            format!("cannot reduce shape {cur:?} to larger-rank {target:?}"),
        ));
    }
    let offset = cur.len() - target.len();
    let mut axes: Vec<usize> = (0..offset).collect();
    for (i, (&t, &c)) in target.iter().zip(&cur[offset..]).enumerate() {
        if t == c {
            continue;
        }
        if t == 1 {
            axes.push(offset + i);
        } else {
            return Err(Error::shape(
                "sum",
                format!("cannot reduce shape {cur:?} to incompatible {target:?}"),
            ));
        }
    }
    let summed = sum(v, &axes, false)?;
    if summed.logical_shape() == target {
        Ok(summed)
    } else {
        reshape(&summed, target)
    }
}

// ── shared rule machinery ──────────────────────────────────────────

pub(crate) fn check_arity(op: &'static str, got: usize, want: usize) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(Error::shape(op, format!("expected {want} input(s), got {got}")))
    }
}

/// Shape two inputs can broadcast to, aligning trailing dims.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let n = a.len().max(b.len());
    let mut result = Vec::with_capacity(n);

    for i in 0..n {
        let dim_a = *a.get(a.len().wrapping_sub(i + 1)).unwrap_or(&1);
        let dim_b = *b.get(b.len().wrapping_sub(i + 1)).unwrap_or(&1);

        if dim_a == dim_b || dim_a == 1 {
            result.push(dim_b);
        } else if dim_b == 1 {
            result.push(dim_a);
        } else {
            return None;
        }
    }

    result.reverse();
    Some(result)
}

/// Copy with one axis moved to a new position.
pub(crate) fn move_axis_raw<D: Floating>(
    a: &TensorData<D>,
    from: usize,
    to: usize,
) -> TensorData<D> {
    if from == to {
        return a.clone();
    }
    let mut perm: Vec<usize> = (0..a.ndim()).filter(|&i| i != from).collect();
    perm.insert(to, from);
    a.view().permuted_axes(&perm[..]).to_owned()
}

/// Reshape by copying elements in logical (row-major) order.
pub(crate) fn reshape_raw<D: Floating>(
    a: &TensorData<D>,
    shape: &[usize],
) -> Result<TensorData<D>> {
    TensorData::from_shape_vec(IxDyn(shape), a.iter().copied().collect())
        .map_err(|e| Error::shape("reshape", e.to_string()))
}

/// Batch size shared by every batched input, validated for consistency.
pub(crate) fn batch_size<D: Floating>(
    op: &'static str,
    args: &[BatchedArg<'_, D>],
) -> Result<usize> {
    let mut n = None;
    for arg in args {
        if let Some(d) = arg.batch_dim {
            if d >= arg.data.ndim() {
                return Err(Error::shape(
                    op,
                    format!("batch axis {d} out of bounds for shape {:?}", arg.data.shape()),
                ));
            }
            let s = arg.data.shape()[d];
            match n {
                None => n = Some(s),
                Some(m) if m != s => {
                    return Err(Error::shape(op, format!("inconsistent batch sizes {m} and {s}")))
                }
                _ => {}
            }
        }
    }
    n.ok_or_else(|| Error::shape(op, "batching rule invoked without a batched input"))
}

pub(crate) fn binary_forward<D: Floating>(
    op: &'static str,
    a: &TensorData<D>,
    b: &TensorData<D>,
    kernel: fn(D, D) -> D,
) -> Result<TensorData<D>> {
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        Error::shape(op, format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()))
    })?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| Error::shape(op, format!("cannot broadcast {:?} to {shape:?}", a.shape())))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| Error::shape(op, format!("cannot broadcast {:?} to {shape:?}", b.shape())))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| kernel(x, y)))
}

/// Elementwise binary op with a batch axis on one or both inputs: move the
/// batch to the front, pad logical ranks so the batch axis stays aligned,
/// then broadcast both sides to `[n] ++ logical_out`.
pub(crate) fn binary_batch<D: Floating>(
    op: &'static str,
    args: &[BatchedArg<'_, D>],
    kernel: fn(D, D) -> D,
) -> Result<(TensorData<D>, Option<usize>)> {
    check_arity(op, args.len(), 2)?;
    let n = batch_size(op, args)?;

    let logical = |arg: &BatchedArg<'_, D>| -> Vec<usize> {
        match arg.batch_dim {
            None => arg.data.shape().to_vec(),
            Some(d) => {
                let mut s = arg.data.shape().to_vec();
                s.remove(d);
                s
            }
        }
    };
    let la = logical(&args[0]);
    let lb = logical(&args[1]);
    let out_logical = broadcast_shapes(&la, &lb)
        .ok_or_else(|| Error::shape(op, format!("cannot broadcast {la:?} with {lb:?}")))?;

    let lift = |arg: &BatchedArg<'_, D>| -> Result<TensorData<D>> {
        match arg.batch_dim {
            None => Ok(arg.data.clone()),
            Some(d) => {
                let fronted = move_axis_raw(arg.data, d, 0);
                let rest: Vec<usize> = fronted.shape()[1..].to_vec();
                let mut shape = Vec::with_capacity(out_logical.len() + 1);
                shape.push(n);
                shape.extend(std::iter::repeat(1).take(out_logical.len() - rest.len()));
                shape.extend(rest);
                reshape_raw(&fronted, &shape)
            }
        }
    };

    // After lifting, the batched side is `[n] ++ ones ++ rest`, so trailing
    // alignment lands every output on `[n] ++ out_logical`.
    let a = lift(&args[0])?;
    let b = lift(&args[1])?;
    let out = binary_forward(op, &a, &b, kernel)?;
    Ok((out, Some(0)))
}

pub(crate) fn unary_forward<D: Floating>(
    op: &'static str,
    inputs: &[&TensorData<D>],
    kernel: fn(D) -> D,
) -> Result<TensorData<D>> {
    check_arity(op, inputs.len(), 1)?;
    Ok(inputs[0].mapv(kernel))
}

/// Defines forward and batching rules for a binary elementwise primitive.
macro_rules! binary_prim {
    ($fwd:ident, $batch:ident, $name:literal, $kernel:expr) => {
        pub(crate) fn $fwd<D: $crate::Floating>(
            _params: &$crate::registry::OpParams,
            inputs: &[&$crate::value::TensorData<D>],
        ) -> $crate::error::Result<$crate::value::TensorData<D>> {
            $crate::ops::check_arity($name, inputs.len(), 2)?;
            $crate::ops::binary_forward($name, inputs[0], inputs[1], $kernel)
        }

        pub(crate) fn $batch<D: $crate::Floating>(
            _params: &$crate::registry::OpParams,
            args: &[$crate::registry::BatchedArg<'_, D>],
        ) -> $crate::error::Result<($crate::value::TensorData<D>, Option<usize>)> {
            $crate::ops::binary_batch($name, args, $kernel)
        }
    };
}

/// Defines forward and batching rules for a unary elementwise primitive.
/// The batch axis passes through untouched.
macro_rules! unary_prim {
    ($fwd:ident, $batch:ident, $name:literal, $kernel:expr) => {
        pub(crate) fn $fwd<D: $crate::Floating>(
            _params: &$crate::registry::OpParams,
            inputs: &[&$crate::value::TensorData<D>],
        ) -> $crate::error::Result<$crate::value::TensorData<D>> {
            $crate::ops::unary_forward($name, inputs, $kernel)
        }

        pub(crate) fn $batch<D: $crate::Floating>(
            _params: &$crate::registry::OpParams,
            args: &[$crate::registry::BatchedArg<'_, D>],
        ) -> $crate::error::Result<($crate::value::TensorData<D>, Option<usize>)> {
            $crate::ops::check_arity($name, args.len(), 1)?;
            Ok((args[0].data.mapv($kernel), args[0].batch_dim))
        }
    };
}

pub(crate) use binary_prim;
pub(crate) use unary_prim;
