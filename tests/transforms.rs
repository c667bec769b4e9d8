//! Transform composition: vmap against explicit loops, jit caching, and
//! jit(vmap(grad)) against the unbatched reference.

use approx::assert_abs_diff_eq;
use ndarray::{ArrayD, Axis, IxDyn};
use tapegrad::prelude::*;
use tapegrad::registry::{self, BatchedArg, OpParams, PrimitiveDef};
use tapegrad::tape;

fn rowize(n: usize, f: impl Fn(usize) -> f64) -> Value<f64> {
    Value::from_vec(&[n, 2], (0..2 * n).map(|i| f(i)).collect()).unwrap()
}

// per-example scoring function: tanh(x . x) - first component
fn score(args: &[Value<f64>]) -> Result<Value<f64>> {
    let sq = ops::matmul(&args[0], &args[0])?;
    let first = ops::matmul(&args[0], &args[1])?;
    ops::sub(&ops::tanh(&sq)?, &first)
}

fn stack_rows(rows: &[ArrayD<f64>]) -> ArrayD<f64> {
    let mut shape = vec![rows.len()];
    shape.extend(rows[0].shape());
    let data: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    ArrayD::from_shape_vec(IxDyn(&shape), data).unwrap()
}

#[test]
fn vmap_matches_explicit_loop() {
    let pick = Value::from_vec(&[2], vec![1.0, 0.0]).unwrap();
    for n in [1usize, 2, 100] {
        let xs = rowize(n, |i| (i as f64) * 0.1 - 3.0);
        let batched = vmap(
            |args: &[Value<f64>]| Ok(vec![score(args)?]),
            vec![Some(0usize), None],
            0usize,
        );
        let out = batched(&[xs.clone(), pick.clone()]).unwrap().remove(0);
        assert_eq!(out.shape(), &[n]);

        let raw = xs.to_array();
        for i in 0..n {
            let row = Value::new(raw.index_axis(Axis(0), i).to_owned().into_dyn());
            let single = score(&[row, pick.clone()]).unwrap();
            assert_abs_diff_eq!(
                out.to_array()[[i]],
                single.item().unwrap(),
                epsilon = 1e-12
            );
        }
    }
}

#[test]
fn vmap_of_grad_matches_per_example_grad() {
    let pick = Value::from_vec(&[2], vec![0.5, -0.25]).unwrap();
    let df = grad(score, vec![0, 1]);
    let batched = vmap(grad(score, vec![0, 1]), vec![Some(0usize), None], 0usize);

    let n = 5;
    let xs = rowize(n, |i| (i as f64) * 0.3 - 0.7);
    let out = batched(&[xs.clone(), pick.clone()]).unwrap();
    assert_eq!(out[0].shape(), &[n, 2]);
    assert_eq!(out[1].shape(), &[n, 2]);

    let raw = xs.to_array();
    let mut per_x = Vec::new();
    let mut per_pick = Vec::new();
    for i in 0..n {
        let row = Value::new(raw.index_axis(Axis(0), i).to_owned().into_dyn());
        let g = df(&[row, pick.clone()]).unwrap();
        per_x.push(g[0].to_array());
        per_pick.push(g[1].to_array());
    }
    let expect_x = stack_rows(&per_x);
    let expect_pick = stack_rows(&per_pick);
    for (a, e) in out[0].to_array().iter().zip(expect_x.iter()) {
        assert_abs_diff_eq!(a, e, epsilon = 1e-10);
    }
    for (a, e) in out[1].to_array().iter().zip(expect_pick.iter()) {
        assert_abs_diff_eq!(a, e, epsilon = 1e-10);
    }
}

#[test]
fn jit_replay_matches_direct_evaluation() {
    let compiled = jit(|args: &[Value<f64>]| Ok(vec![score(args)?]));
    let pick = Value::from_vec(&[2], vec![1.0, 1.0]).unwrap();
    let a = Value::from_vec(&[2], vec![0.2, -0.4]).unwrap();
    let b = Value::from_vec(&[2], vec![-1.5, 2.5]).unwrap();

    let first = compiled.call(&[a.clone(), pick.clone()]).unwrap().remove(0);
    let second = compiled.call(&[b.clone(), pick.clone()]).unwrap().remove(0);
    assert_eq!(compiled.trace_count(), 1);

    let direct_a = score(&[a, pick.clone()]).unwrap();
    let direct_b = score(&[b, pick]).unwrap();
    assert_abs_diff_eq!(first.item().unwrap(), direct_a.item().unwrap(), epsilon = 1e-12);
    assert_abs_diff_eq!(second.item().unwrap(), direct_b.item().unwrap(), epsilon = 1e-12);
}

#[test]
fn jit_caches_per_shape() {
    let compiled = jit(|args: &[Value<f64>]| Ok(vec![ops::sum_all(&args[0])?]));
    compiled.call(&[Value::zeros(&[2])]).unwrap();
    compiled.call(&[Value::zeros(&[5, 2])]).unwrap();
    compiled.call(&[Value::zeros(&[2])]).unwrap();
    compiled.call(&[Value::zeros(&[5, 2])]).unwrap();
    assert_eq!(compiled.trace_count(), 2);
    assert_eq!(compiled.cache_size(), 2);
}

#[test]
fn jit_of_vmap_of_grad_matches_unbatched_reference() {
    let pick = Value::from_vec(&[2], vec![0.3, 0.9]).unwrap();
    let compiled = jit(vmap(grad(score, vec![0]), vec![Some(0usize), None], 0usize));
    let df = grad(score, vec![0]);

    for n in [3usize, 3, 4] {
        let xs = rowize(n, |i| (i as f64).sin());
        let out = compiled.call(&[xs.clone(), pick.clone()]).unwrap().remove(0);
        assert_eq!(out.shape(), &[n, 2]);

        let raw = xs.to_array();
        for i in 0..n {
            let row = Value::new(raw.index_axis(Axis(0), i).to_owned().into_dyn());
            let g = df(&[row, pick.clone()]).unwrap().remove(0);
            for j in 0..2 {
                assert_abs_diff_eq!(
                    out.to_array()[[i, j]],
                    g.to_array()[[j]],
                    epsilon = 1e-10
                );
            }
        }
    }
    // two batch sizes seen, each traced once
    assert_eq!(compiled.trace_count(), 2);
}

#[test]
fn grad_of_jitted_function_is_transparent() {
    let compiled = jit(|args: &[Value<f64>]| Ok(vec![ops::mul(&args[0], &args[0])?]));
    let f = move |args: &[Value<f64>]| Ok(compiled.call(args)?.remove(0));
    let g = grad(f, vec![0])(&[Value::scalar(3.0)]).unwrap();
    assert_abs_diff_eq!(g[0].item().unwrap(), 6.0, epsilon = 1e-12);
}

// keeps only the positive entries, so the output shape depends on the
// input's values, not just its signature
fn filter_positive_fwd(
    _params: &OpParams,
    inputs: &[&TensorData<f64>],
) -> Result<TensorData<f64>> {
    let kept: Vec<f64> = inputs[0].iter().copied().filter(|v| *v > 0.0).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&[kept.len()]), kept).unwrap())
}

fn filter_positive_batch(
    _params: &OpParams,
    _args: &[BatchedArg<'_, f64>],
) -> Result<(TensorData<f64>, Option<usize>)> {
    Err(Error::ShapeMismatch {
        op: "filter_positive",
        detail: "filter_positive has no batching rule".into(),
    })
}

#[test]
fn replay_rejects_value_dependent_shapes() {
    registry::register::<f64>(PrimitiveDef {
        name: "filter_positive",
        forward: filter_positive_fwd,
        gradient: None,
        batching: filter_positive_batch,
    });
    let compiled = jit(|args: &[Value<f64>]| {
        Ok(vec![tape::bind("filter_positive", OpParams::None, args)?])
    });

    let first = compiled
        .call(&[Value::from_vec(&[3], vec![1.0, -1.0, 2.0]).unwrap()])
        .unwrap()
        .remove(0);
    assert_eq!(first.shape(), &[2]);

    // same signature, different values: the replayed node's output shape
    // diverges from the recording
    let err = compiled
        .call(&[Value::from_vec(&[3], vec![1.0, 1.0, 2.0]).unwrap()])
        .unwrap_err();
    assert!(matches!(err, Error::SignatureInconsistency(_)));
    assert_eq!(compiled.trace_count(), 1);
}

#[test]
fn axis_spec_arity_is_validated() {
    let batched = vmap(
        |args: &[Value<f64>]| Ok(vec![ops::neg(&args[0])?]),
        vec![Some(0usize), None, None],
        0usize,
    );
    let x = Value::from_vec(&[2], vec![1.0, 2.0]).unwrap();
    let err = batched(&[x]).unwrap_err();
    assert!(matches!(err, Error::AxisSpecMismatch { expected: 1, got: 3 }));
}
