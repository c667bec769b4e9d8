//! Batching by metadata: map a function over one axis of its inputs.

use crate::error::{Error, Result};
use crate::ops;
use crate::transform::AxisSpec;
use crate::value::Value;
use crate::Floating;

/// Vectorize `f` over the axes named by `in_axes`, placing each output's
/// batch on the axis named by `out_axes`.
///
/// No looping is involved: mapped inputs are tagged with a batch axis and
/// every primitive they reach dispatches to its batching rule, so `f` runs
/// once on whole-batch data. Inputs with `None` in `in_axes` are shared
/// across the batch; outputs with `None` in `out_axes` must not depend on
/// the mapped axis.
pub fn vmap<D, F>(
    f: F,
    in_axes: impl Into<AxisSpec>,
    out_axes: impl Into<AxisSpec>,
) -> impl Fn(&[Value<D>]) -> Result<Vec<Value<D>>>
where
    D: Floating,
    F: Fn(&[Value<D>]) -> Result<Vec<Value<D>>>,
{
    let in_axes = in_axes.into();
    let out_axes = out_axes.into();
    move |args| {
        let in_axes = in_axes.resolve(args.len())?;
        let n = mapped_size(args, &in_axes)?;

        // entry: bring each mapped axis to the front and tag it
        let mut inner = Vec::with_capacity(args.len());
        for (arg, &ax) in args.iter().zip(&in_axes) {
            match ax {
                None => inner.push(arg.clone()),
                Some(ax) => {
                    let fronted = ops::moveaxis(arg, ax, 0)?;
                    inner.push(fronted.with_batch_dim(Some(0)));
                }
            }
        }

        let outs = f(&inner)?;
        let out_axes = out_axes.resolve(outs.len())?;
        outs.iter().zip(&out_axes).map(|(out, &ax)| exit(out, ax, n)).collect()
    }
}

fn mapped_size<D: Floating>(args: &[Value<D>], in_axes: &[Option<usize>]) -> Result<usize> {
    let mut n = None;
    for (arg, &ax) in args.iter().zip(in_axes) {
        let Some(ax) = ax else { continue };
        if ax >= arg.shape().len() {
            return Err(Error::shape(
                "vmap",
                format!("in axis {ax} out of bounds for shape {:?}", arg.shape()),
            ));
        }
        let s = arg.shape()[ax];
        match n {
            None => n = Some(s),
            Some(m) if m != s => {
                return Err(Error::shape("vmap", format!("inconsistent batch sizes {m} and {s}")))
            }
            _ => {}
        }
    }
    n.ok_or_else(|| Error::shape("vmap", "at least one input must carry a mapped axis"))
}

/// Strip batch metadata from one output and place the batch on the
/// requested user-visible axis.
fn exit<D: Floating>(out: &Value<D>, ax: Option<usize>, n: usize) -> Result<Value<D>> {
    match (out.batch_dim(), ax) {
        (Some(d), Some(k)) => ops::moveaxis(&out.clear_batch(), d, k),
        // output never touched the mapped axis: replicate it
        (None, Some(k)) => {
            let shape = out.logical_shape();
            let mut lifted = Vec::with_capacity(shape.len() + 1);
            lifted.push(1);
            lifted.extend(&shape);
            let mut target = Vec::with_capacity(shape.len() + 1);
            target.push(n);
            target.extend(&shape);
            let replicated = ops::broadcast_to(&ops::reshape(out, &lifted)?, &target)?;
            ops::moveaxis(&replicated, 0, k)
        }
        (Some(_), None) => Err(Error::shape(
            "vmap",
            "output depends on the mapped axis but out_axes requests none",
        )),
        (None, None) => Ok(out.clone()),
    }
}
