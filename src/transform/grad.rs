//! Reverse-mode differentiation over a recorded tape segment.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ops;
use crate::registry;
use crate::tape::{self, Node, TraceGuard};
use crate::value::{Value, ValueId};
use crate::Floating;

/// Differentiate `f` with respect to the arguments named by `argnums`.
///
/// The returned closure evaluates `f` under a trace and walks the recorded
/// segment backwards, accumulating vector-Jacobian products. When a trace
/// is already active the segment joins it instead of opening a new one, so
/// both the forward and the reverse applications land on the outer tape.
/// That is what lets `jit` compile and `vmap` batch a gradient function.
///
/// `f` must produce a single scalar output per example.
pub fn grad<D, F>(f: F, argnums: Vec<usize>) -> impl Fn(&[Value<D>]) -> Result<Vec<Value<D>>>
where
    D: Floating,
    F: Fn(&[Value<D>]) -> Result<Value<D>>,
{
    move |args| Ok(run(&f, &argnums, args)?.1)
}

/// [`grad`] with the default argument selection: differentiate with
/// respect to the first argument only and return that single gradient.
pub fn grad1<D, F>(f: F) -> impl Fn(&[Value<D>]) -> Result<Value<D>>
where
    D: Floating,
    F: Fn(&[Value<D>]) -> Result<Value<D>>,
{
    move |args| Ok(run(&f, &[0], args)?.1.remove(0))
}

/// Like [`grad`], but also returns the (undifferentiated) output of `f`.
pub fn value_and_grad<D, F>(
    f: F,
    argnums: Vec<usize>,
) -> impl Fn(&[Value<D>]) -> Result<(Value<D>, Vec<Value<D>>)>
where
    D: Floating,
    F: Fn(&[Value<D>]) -> Result<Value<D>>,
{
    move |args| run(&f, &argnums, args)
}

fn run<D, F>(f: &F, argnums: &[usize], args: &[Value<D>]) -> Result<(Value<D>, Vec<Value<D>>)>
where
    D: Floating,
    F: Fn(&[Value<D>]) -> Result<Value<D>>,
{
    for &argnum in argnums {
        if argnum >= args.len() {
            return Err(Error::InvalidArgnum { argnum, arity: args.len() });
        }
    }

    // Join the innermost active trace when there is one; nodes recorded by
    // the reverse pass below then land on the same tape.
    let (out, segment) = match tape::active::<D>() {
        Some(outer) => {
            let start = outer.borrow().len();
            let out = f(args)?;
            let segment = outer.borrow().nodes[start..].to_vec();
            (out, segment)
        }
        None => {
            let guard = TraceGuard::<D>::push();
            let out = f(args)?;
            (out, guard.finish().nodes)
        }
    };

    let out_shape = out.logical_shape();
    if out_shape.iter().product::<usize>() != 1 {
        return Err(Error::NonScalarOutput(out_shape));
    }

    let grads = backward(&segment, &out)?;
    let per_arg = argnums
        .iter()
        .map(|&i| match grads.get(&args[i].id()) {
            Some(g) => g.clone(),
            // argument unused by f
            None => Value::zeros(&args[i].logical_shape()),
        })
        .collect();
    Ok((out, per_arg))
}

fn backward<D: Floating>(
    segment: &[Node<D>],
    out: &Value<D>,
) -> Result<HashMap<ValueId, Value<D>>> {
    let mut grads: HashMap<ValueId, Value<D>> = HashMap::new();
    grads.insert(out.id(), Value::ones_like(out));

    for node in segment.iter().rev() {
        // nodes off the path from `out` carry no gradient and are skipped
        let Some(og) = grads.get(&node.output.id()).cloned() else { continue };
        let def = registry::lookup::<D>(node.prim)?;
        let rule = def.gradient.ok_or(Error::NonDifferentiableOp(node.prim))?;
        let input_grads = rule(&node.params, &node.inputs, &node.output, &og)?;
        for (input, g) in node.inputs.iter().zip(input_grads) {
            let acc = match grads.remove(&input.id()) {
                Some(prev) => ops::add(&prev, &g)?,
                None => g,
            };
            grads.insert(input.id(), acc);
        }
    }
    Ok(grads)
}
