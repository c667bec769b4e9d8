//! Fused binary cross-entropy on logits.
//!
//! `sigmoid_bce(z, y) = max(z, 0) - z*y + ln(1 + e^(-|z|))`, the numerically
//! stable form of `-y ln s - (1-y) ln(1-s)` with `s = sigmoid(z)`. Keeping the
//! fusion as one primitive avoids the overflow of `ln(sigmoid(z))` for large
//! negative logits.

use crate::error::Result;
use crate::ops::{self, binary_prim, reduce_to};
use crate::registry::{OpParams, PrimitiveDef};
use crate::value::Value;
use crate::Floating;

binary_prim!(bce_fwd, bce_batch, "sigmoid_bce", |z: D, y: D| {
    z.max(D::zero()) - z * y + (-z.abs()).exp().ln_1p()
});

// dL/dz = sigmoid(z) - y; dL/dy = -z. Both are expressed through eager
// primitives so the reverse pass stays traceable under jit and vmap.
fn bce_vjp<D: Floating>(
    _params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    let (z, y) = (&inputs[0], &inputs[1]);
    let dz = ops::mul(og, &ops::sub(&ops::sigmoid(z)?, y)?)?;
    let dy = ops::mul(og, &ops::neg(z)?)?;
    Ok(vec![reduce_to(&dz, &z.logical_shape())?, reduce_to(&dy, &y.logical_shape())?])
}

pub(crate) fn defs<D: Floating>() -> Vec<PrimitiveDef<D>> {
    vec![PrimitiveDef {
        name: "sigmoid_bce",
        forward: bce_fwd,
        gradient: Some(bce_vjp),
        batching: bce_batch,
    }]
}
