//! Gradients checked against central finite differences.

use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, ArrayD};
use tapegrad::prelude::*;

type ScalarFn = dyn Fn(&[Value<f64>]) -> Result<Value<f64>>;

fn perturbed(base: &ArrayD<f64>, at: usize, delta: f64) -> ArrayD<f64> {
    let v: Vec<f64> =
        base.iter().enumerate().map(|(j, &x)| if j == at { x + delta } else { x }).collect();
    ArrayD::from_shape_vec(base.raw_dim(), v).unwrap()
}

fn numeric_grad(f: &ScalarFn, args: &[Value<f64>], wrt: usize) -> ArrayD<f64> {
    let eps = 1e-6;
    let base = args[wrt].to_array();
    let mut out = Vec::with_capacity(base.len());
    for i in 0..base.len() {
        let eval = |delta: f64| {
            let mut shifted = args.to_vec();
            shifted[wrt] = Value::new(perturbed(&base, i, delta));
            f(&shifted).unwrap().item().unwrap()
        };
        out.push((eval(eps) - eval(-eps)) / (2.0 * eps));
    }
    ArrayD::from_shape_vec(base.raw_dim(), out).unwrap()
}

fn check_against_numeric(
    f: impl Fn(&[Value<f64>]) -> Result<Value<f64>> + Copy + 'static,
    args: &[Value<f64>],
) {
    let argnums: Vec<usize> = (0..args.len()).collect();
    let grads = grad(f, argnums.clone())(args).unwrap();
    for &i in &argnums {
        let numeric = numeric_grad(&f, args, i);
        let analytic = grads[i].to_array();
        assert_eq!(analytic.shape(), args[i].shape(), "grad shape for arg {i}");
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(a, n, epsilon = 1e-5);
        }
    }
}

#[test]
fn elementwise_composite() {
    // f(x) = sum(tanh(x) * exp(-x))
    let f = |args: &[Value<f64>]| {
        let t = ops::tanh(&args[0])?;
        let e = ops::exp(&ops::neg(&args[0])?)?;
        ops::sum_all(&ops::mul(&t, &e)?)
    };
    let x = Value::new(arr1(&[0.3, -1.2, 2.0, 0.0]).into_dyn());
    check_against_numeric(f, &[x]);
}

#[test]
fn log_of_positive_values() {
    let f = |args: &[Value<f64>]| ops::sum_all(&ops::log(&args[0])?);
    let x = Value::new(arr1(&[0.5, 1.0, 3.0]).into_dyn());
    check_against_numeric(f, &[x]);
}

#[test]
fn matmul_both_operands() {
    // f(w, x) = sum(w @ x)
    let f = |args: &[Value<f64>]| ops::sum_all(&ops::matmul(&args[0], &args[1])?);
    let w = Value::new(arr2(&[[0.5, -1.0], [2.0, 0.25], [1.0, 1.0]]).into_dyn());
    let x = Value::new(arr1(&[1.5, -0.5]).into_dyn());
    check_against_numeric(f, &[w, x]);
}

#[test]
fn dot_product() {
    let f = |args: &[Value<f64>]| ops::matmul(&args[0], &args[1]);
    let a = Value::new(arr1(&[1.0, -2.0, 3.0]).into_dyn());
    let b = Value::new(arr1(&[0.5, 0.5, -1.0]).into_dyn());
    check_against_numeric(f, &[a, b]);
}

#[test]
fn broadcasting_add_reduces_gradient() {
    // f(m, v) = sum((m + v) * (m + v)): v is broadcast over rows, so its
    // gradient must be summed back down to shape (2,)
    let f = |args: &[Value<f64>]| {
        let s = ops::add(&args[0], &args[1])?;
        ops::sum_all(&ops::mul(&s, &s)?)
    };
    let m = Value::new(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn());
    let v = Value::new(arr1(&[-1.0, 1.0]).into_dyn());
    check_against_numeric(f, &[m, v]);
}

#[test]
fn sigmoid_bce_gradients() {
    let f = |args: &[Value<f64>]| ops::sum_all(&ops::sigmoid_bce(&args[0], &args[1])?);
    let z = Value::new(arr1(&[-2.0, 0.1, 3.0]).into_dyn());
    let y = Value::new(arr1(&[1.0, 0.0, 0.3]).into_dyn());
    check_against_numeric(f, &[z, y]);
}

#[test]
fn sum_with_axes_and_keep_dims() {
    let f = |args: &[Value<f64>]| {
        let partial = ops::sum(&args[0], &[0], true)?;
        ops::sum_all(&ops::mul(&partial, &partial)?)
    };
    let x = Value::new(arr2(&[[1.0, 2.0], [3.0, -1.0]]).into_dyn());
    check_against_numeric(f, &[x]);
}

#[test]
fn transpose_and_reshape_pass_gradients_through() {
    let f = |args: &[Value<f64>]| {
        let t = ops::t(&args[0])?;
        let r = ops::reshape(&t, &[4])?;
        ops::sum_all(&ops::mul(&r, &r)?)
    };
    let x = Value::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
    check_against_numeric(f, &[x]);
}

#[test]
fn grad_through_greater_is_an_error() {
    let f = |args: &[Value<f64>]| {
        let mask = ops::greater(&args[0], &Value::scalar(0.0))?;
        ops::sum_all(&mask)
    };
    let x = Value::new(arr1(&[1.0, -1.0]).into_dyn());
    let err = grad(f, vec![0])(&[x]).unwrap_err();
    assert!(matches!(err, Error::NonDifferentiableOp("greater")));
}

#[test]
fn non_scalar_output_reports_its_shape() {
    let f = |args: &[Value<f64>]| ops::neg(&args[0]);
    let x = Value::new(arr1(&[1.0, 2.0, 3.0]).into_dyn());
    match grad(f, vec![0])(&[x]) {
        Err(Error::NonScalarOutput(shape)) => assert_eq!(shape, vec![3]),
        other => panic!("expected NonScalarOutput, got {other:?}"),
    }
}
