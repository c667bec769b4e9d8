//! Unary elementwise primitives.

use crate::error::Result;
use crate::ops::{self, unary_prim};
use crate::registry::{OpParams, PrimitiveDef};
use crate::value::Value;
use crate::Floating;

unary_prim!(neg_fwd, neg_batch, "neg", |x: D| -x);
unary_prim!(exp_fwd, exp_batch, "exp", |x: D| x.exp());
unary_prim!(log_fwd, log_batch, "log", |x: D| x.ln());
unary_prim!(tanh_fwd, tanh_batch, "tanh", |x: D| x.tanh());

fn neg_vjp<D: Floating>(
    _params: &OpParams,
    _inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    Ok(vec![ops::neg(og)?])
}

// d(e^x) = e^x dx, reusing the recorded forward output.
fn exp_vjp<D: Floating>(
    _params: &OpParams,
    _inputs: &[Value<D>],
    out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    Ok(vec![ops::mul(og, out)?])
}

// d(ln x) = dx / x. The engine has no division primitive, so the
// reciprocal is taken as 1/x = e^(-ln x) with ln x already on the tape.
fn log_vjp<D: Floating>(
    _params: &OpParams,
    _inputs: &[Value<D>],
    out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    Ok(vec![ops::mul(og, &ops::exp(&ops::neg(out)?)?)?])
}

// d(tanh x) = (1 - tanh(x)^2) dx.
fn tanh_vjp<D: Floating>(
    _params: &OpParams,
    _inputs: &[Value<D>],
    out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    let one = Value::scalar(D::one());
    Ok(vec![ops::mul(og, &ops::sub(&one, &ops::mul(out, out)?)?)?])
}

pub(crate) fn defs<D: Floating>() -> Vec<PrimitiveDef<D>> {
    vec![
        PrimitiveDef { name: "neg", forward: neg_fwd, gradient: Some(neg_vjp), batching: neg_batch },
        PrimitiveDef { name: "exp", forward: exp_fwd, gradient: Some(exp_vjp), batching: exp_batch },
        PrimitiveDef { name: "log", forward: log_fwd, gradient: Some(log_vjp), batching: log_batch },
        PrimitiveDef {
            name: "tanh",
            forward: tanh_fwd,
            gradient: Some(tanh_vjp),
            batching: tanh_batch,
        },
    ]
}
