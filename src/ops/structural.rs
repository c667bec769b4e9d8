//! Structural primitives: transpose, reshape, broadcast and sum.
//!
//! These carry their static parameters in [`OpParams`]; parameters are
//! expressed in logical axes, and the batching rules shift them past the
//! batch axis.

use ndarray::{Axis, IxDyn};

use crate::error::{Error, Result};
use crate::ops::{self, check_arity, move_axis_raw, reduce_to, reshape_raw};
use crate::registry::{BatchedArg, OpParams, PrimitiveDef};
use crate::value::{TensorData, Value};
use crate::Floating;

fn validate_perm(perm: &[usize], rank: usize) -> Result<()> {
    let mut seen = perm.to_vec();
    seen.sort_unstable();
    if perm.len() != rank || seen.iter().enumerate().any(|(i, &p)| i != p) {
        return Err(Error::shape(
            "transpose",
            format!("{perm:?} is not a permutation of {rank} axes"),
        ));
    }
    Ok(())
}

// ── transpose ──────────────────────────────────────────────────────

fn transpose_fwd<D: Floating>(
    params: &OpParams,
    inputs: &[&TensorData<D>],
) -> Result<TensorData<D>> {
    check_arity("transpose", inputs.len(), 1)?;
    let a = inputs[0];
    match params {
        // default: swap the last two axes, identity below rank 2
        OpParams::None => {
            let mut out = a.clone();
            let rank = out.ndim();
            if rank > 1 {
                out.swap_axes(rank - 2, rank - 1);
            }
            Ok(out)
        }
        OpParams::Perm(perm) => {
            validate_perm(perm, a.ndim())?;
            Ok(a.view().permuted_axes(&perm[..]).to_owned())
        }
        _ => Err(Error::shape("transpose", "expected Perm or None params")),
    }
}

fn transpose_vjp<D: Floating>(
    params: &OpParams,
    _inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    match params {
        OpParams::None => Ok(vec![ops::t(og)?]),
        OpParams::Perm(perm) => {
            let mut inverse = vec![0usize; perm.len()];
            for (i, &p) in perm.iter().enumerate() {
                inverse[p] = i;
            }
            Ok(vec![ops::transpose(og, &inverse)?])
        }
        _ => Err(Error::shape("transpose", "expected Perm or None params")),
    }
}

fn transpose_batch<D: Floating>(
    params: &OpParams,
    args: &[BatchedArg<'_, D>],
) -> Result<(TensorData<D>, Option<usize>)> {
    check_arity("transpose", args.len(), 1)?;
    let d = batch_dim_of("transpose", &args[0])?;
    let fronted = move_axis_raw(args[0].data, d, 0);
    let logical_rank = fronted.ndim() - 1;
    let out = match params {
        OpParams::None => {
            let mut out = fronted;
            if logical_rank > 1 {
                let rank = out.ndim();
                out.swap_axes(rank - 2, rank - 1);
            }
            out
        }
        OpParams::Perm(perm) => {
            validate_perm(perm, logical_rank)?;
            let mut shifted = Vec::with_capacity(perm.len() + 1);
            shifted.push(0);
            shifted.extend(perm.iter().map(|&p| p + 1));
            fronted.view().permuted_axes(&shifted[..]).to_owned()
        }
        _ => return Err(Error::shape("transpose", "expected Perm or None params")),
    };
    Ok((out, Some(0)))
}

// ── reshape ────────────────────────────────────────────────────────

fn reshape_fwd<D: Floating>(
    params: &OpParams,
    inputs: &[&TensorData<D>],
) -> Result<TensorData<D>> {
    check_arity("reshape", inputs.len(), 1)?;
    let OpParams::Shape(shape) = params else {
        return Err(Error::shape("reshape", "expected Shape params"));
    };
    let count: usize = shape.iter().product();
    if count != inputs[0].len() {
        return Err(Error::shape(
            "reshape",
            format!("cannot reshape {:?} into {shape:?}", inputs[0].shape()),
        ));
    }
    reshape_raw(inputs[0], shape)
}

fn reshape_vjp<D: Floating>(
    _params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    Ok(vec![ops::reshape(og, &inputs[0].logical_shape())?])
}

fn reshape_batch<D: Floating>(
    params: &OpParams,
    args: &[BatchedArg<'_, D>],
) -> Result<(TensorData<D>, Option<usize>)> {
    check_arity("reshape", args.len(), 1)?;
    let OpParams::Shape(shape) = params else {
        return Err(Error::shape("reshape", "expected Shape params"));
    };
    let d = batch_dim_of("reshape", &args[0])?;
    let fronted = move_axis_raw(args[0].data, d, 0);
    let n = fronted.shape()[0];
    let mut batched_shape = Vec::with_capacity(shape.len() + 1);
    batched_shape.push(n);
    batched_shape.extend_from_slice(shape);
    let count: usize = batched_shape.iter().product();
    if count != fronted.len() {
        return Err(Error::shape(
            "reshape",
            format!("cannot reshape batched {:?} into {batched_shape:?}", fronted.shape()),
        ));
    }
    Ok((reshape_raw(&fronted, &batched_shape)?, Some(0)))
}

// ── broadcast_to ───────────────────────────────────────────────────

fn broadcast_fwd<D: Floating>(
    params: &OpParams,
    inputs: &[&TensorData<D>],
) -> Result<TensorData<D>> {
    check_arity("broadcast_to", inputs.len(), 1)?;
    let OpParams::Shape(shape) = params else {
        return Err(Error::shape("broadcast_to", "expected Shape params"));
    };
    inputs[0]
        .broadcast(IxDyn(shape))
        .map(|v| v.to_owned())
        .ok_or_else(|| {
            Error::shape(
                "broadcast_to",
                format!("cannot broadcast {:?} to {shape:?}", inputs[0].shape()),
            )
        })
}

fn broadcast_vjp<D: Floating>(
    _params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    Ok(vec![reduce_to(og, &inputs[0].logical_shape())?])
}

fn broadcast_batch<D: Floating>(
    params: &OpParams,
    args: &[BatchedArg<'_, D>],
) -> Result<(TensorData<D>, Option<usize>)> {
    check_arity("broadcast_to", args.len(), 1)?;
    let OpParams::Shape(shape) = params else {
        return Err(Error::shape("broadcast_to", "expected Shape params"));
    };
    let d = batch_dim_of("broadcast_to", &args[0])?;
    let fronted = move_axis_raw(args[0].data, d, 0);
    let n = fronted.shape()[0];
    let rest: Vec<usize> = fronted.shape()[1..].to_vec();
    if rest.len() > shape.len() {
        return Err(Error::shape(
            "broadcast_to",
            format!("cannot broadcast logical {rest:?} to smaller-rank {shape:?}"),
        ));
    }
    // align the logical part under the batch axis before broadcasting
    let mut lifted_shape = Vec::with_capacity(shape.len() + 1);
    lifted_shape.push(n);
    lifted_shape.extend(std::iter::repeat(1).take(shape.len() - rest.len()));
    lifted_shape.extend(rest);
    let lifted = reshape_raw(&fronted, &lifted_shape)?;

    let mut target = Vec::with_capacity(shape.len() + 1);
    target.push(n);
    target.extend_from_slice(shape);
    let out = lifted.broadcast(IxDyn(&target)).map(|v| v.to_owned()).ok_or_else(|| {
        Error::shape("broadcast_to", format!("cannot broadcast batched value to {target:?}"))
    })?;
    Ok((out, Some(0)))
}

// ── sum ────────────────────────────────────────────────────────────

fn sum_axes<D: Floating>(
    a: &TensorData<D>,
    axes: &[usize],
    keep_dims: bool,
) -> Result<TensorData<D>> {
    for &ax in axes {
        if ax >= a.ndim() {
            return Err(Error::shape(
                "sum",
                format!("axis {ax} out of bounds for shape {:?}", a.shape()),
            ));
        }
    }
    // reduce higher axes first so indices stay valid as dims vanish
    let mut sorted = axes.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    let mut out = a.clone();
    for &ax in &sorted {
        let axis = Axis(ax);
        out = if keep_dims { out.sum_axis(axis).insert_axis(axis) } else { out.sum_axis(axis) };
    }
    Ok(out)
}

fn sum_fwd<D: Floating>(params: &OpParams, inputs: &[&TensorData<D>]) -> Result<TensorData<D>> {
    check_arity("sum", inputs.len(), 1)?;
    let OpParams::Axes { axes, keep_dims } = params else {
        return Err(Error::shape("sum", "expected Axes params"));
    };
    sum_axes(inputs[0], axes, *keep_dims)
}

/// d/dx sum(x, axes) spreads the output gradient back across the reduced
/// axes: reinstate them as size-1 dims, then broadcast to the input shape.
fn sum_vjp<D: Floating>(
    params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    let OpParams::Axes { axes, keep_dims } = params else {
        return Err(Error::shape("sum", "expected Axes params"));
    };
    let input_shape = inputs[0].logical_shape();
    let og_keep = if *keep_dims {
        og.clone()
    } else {
        let mut kept = input_shape.clone();
        for &ax in axes {
            kept[ax] = 1;
        }
        ops::reshape(og, &kept)?
    };
    Ok(vec![ops::broadcast_to(&og_keep, &input_shape)?])
}

fn sum_batch<D: Floating>(
    params: &OpParams,
    args: &[BatchedArg<'_, D>],
) -> Result<(TensorData<D>, Option<usize>)> {
    check_arity("sum", args.len(), 1)?;
    let OpParams::Axes { axes, keep_dims } = params else {
        return Err(Error::shape("sum", "expected Axes params"));
    };
    let d = batch_dim_of("sum", &args[0])?;
    let fronted = move_axis_raw(args[0].data, d, 0);
    let shifted: Vec<usize> = axes.iter().map(|&ax| ax + 1).collect();
    Ok((sum_axes(&fronted, &shifted, *keep_dims)?, Some(0)))
}

fn batch_dim_of<D: Floating>(op: &'static str, arg: &BatchedArg<'_, D>) -> Result<usize> {
    arg.batch_dim
        .ok_or_else(|| Error::shape(op, "batching rule invoked without a batched input"))
}

pub(crate) fn defs<D: Floating>() -> Vec<PrimitiveDef<D>> {
    vec![
        PrimitiveDef {
            name: "transpose",
            forward: transpose_fwd,
            gradient: Some(transpose_vjp),
            batching: transpose_batch,
        },
        PrimitiveDef {
            name: "reshape",
            forward: reshape_fwd,
            gradient: Some(reshape_vjp),
            batching: reshape_batch,
        },
        PrimitiveDef {
            name: "broadcast_to",
            forward: broadcast_fwd,
            gradient: Some(broadcast_vjp),
            batching: broadcast_batch,
        },
        PrimitiveDef { name: "sum", forward: sum_fwd, gradient: Some(sum_vjp), batching: sum_batch },
    ]
}
