//! Matrix multiplication: vec·vec, mat·vec, vec·mat, mat·mat and stacked
//! (leading-batch) forms of the rank-2 cases.

use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{Array, ArrayD, Axis, Ix1, Ix2, IxDyn};

use crate::error::{Error, Result};
use crate::ops::{
    self, batch_size, broadcast_shapes, check_arity, move_axis_raw, reduce_to, reshape_raw,
};
use crate::registry::{BatchedArg, OpParams, PrimitiveDef};
use crate::value::{TensorData, Value};
use crate::Floating;

pub(crate) fn matmul_kernel<D: Floating>(
    a: &TensorData<D>,
    b: &TensorData<D>,
) -> Result<TensorData<D>> {
    match (a.ndim(), b.ndim()) {
        // a scalar operand degenerates to elementwise scaling
        (0, _) | (_, 0) => ops::binary_forward("matmul", a, b, |x, y| x * y),

        (1, 1) => {
            if a.len() != b.len() {
                return Err(Error::shape(
                    "matmul",
                    format!("dot product lengths differ: {} vs {}", a.len(), b.len()),
                ));
            }
            let a1 = a.view().into_dimensionality::<Ix1>().map_err(dim_err)?;
            let b1 = b.view().into_dimensionality::<Ix1>().map_err(dim_err)?;
            Ok(TensorData::from_elem(IxDyn(&[]), a1.dot(&b1)))
        }

        // (k,) @ (k, m) -> (m,)
        (1, 2) => {
            if a.len() != b.shape()[0] {
                return Err(Error::shape(
                    "matmul",
                    format!("vec @ mat: {} vs {:?}", a.len(), b.shape()),
                ));
            }
            let m = b.shape()[1];
            let a1 = a.view().into_dimensionality::<Ix1>().map_err(dim_err)?;
            let b2 = b.view().into_dimensionality::<Ix2>().map_err(dim_err)?;
            let mut result = Array::zeros(m);
            general_mat_vec_mul(D::one(), &b2.t(), &a1, D::zero(), &mut result);
            Ok(result.into_dyn())
        }

        // (m, k) @ (k,) -> (m,)
        (2, 1) => {
            if a.shape()[1] != b.len() {
                return Err(Error::shape(
                    "matmul",
                    format!("mat @ vec: {:?} vs {}", a.shape(), b.len()),
                ));
            }
            let m = a.shape()[0];
            let a2 = a.view().into_dimensionality::<Ix2>().map_err(dim_err)?;
            let b1 = b.view().into_dimensionality::<Ix1>().map_err(dim_err)?;
            let mut result = Array::zeros(m);
            general_mat_vec_mul(D::one(), &a2, &b1, D::zero(), &mut result);
            Ok(result.into_dyn())
        }

        (2, 2) => {
            let (m, k1) = (a.shape()[0], a.shape()[1]);
            let (k2, n) = (b.shape()[0], b.shape()[1]);
            if k1 != k2 {
                return Err(Error::shape(
                    "matmul",
                    format!("inner dims differ: lhs {k1} vs rhs {k2}"),
                ));
            }
            let a2 = a.view().into_dimensionality::<Ix2>().map_err(dim_err)?;
            let b2 = b.view().into_dimensionality::<Ix2>().map_err(dim_err)?;
            let mut result = Array::zeros((m, n));
            general_mat_mul(D::one(), &a2, &b2, D::zero(), &mut result);
            Ok(result.into_dyn())
        }

        // stacked lhs @ vector: append a column axis and squeeze it back
        (_, 1) => {
            let lifted = matmul_kernel(a, &b.clone().insert_axis(Axis(1)))?;
            let shape: Vec<usize> = lifted.shape()[..lifted.ndim() - 1].to_vec();
            reshape_raw(&lifted, &shape)
        }

        // vector @ stacked rhs: prepend a row axis and squeeze it back
        (1, _) => {
            let lifted = matmul_kernel(&a.clone().insert_axis(Axis(0)), b)?;
            let mut shape: Vec<usize> = lifted.shape().to_vec();
            shape.remove(lifted.ndim() - 2);
            reshape_raw(&lifted, &shape)
        }

        _ => stacked(a, b),
    }
}

fn dim_err(e: ndarray::ShapeError) -> Error {
    Error::shape("matmul", e.to_string())
}

/// Stacks of matrices with broadcast-compatible leading dims.
fn stacked<D: Floating>(a: &TensorData<D>, b: &TensorData<D>) -> Result<TensorData<D>> {
    let (sa, sb) = (a.shape(), b.shape());
    let (m, k1) = (sa[sa.len() - 2], sa[sa.len() - 1]);
    let (k2, n) = (sb[sb.len() - 2], sb[sb.len() - 1]);
    if k1 != k2 {
        return Err(Error::shape("matmul", format!("inner dims differ: lhs {k1} vs rhs {k2}")));
    }

    let batch = broadcast_shapes(&sa[..sa.len() - 2], &sb[..sb.len() - 2]).ok_or_else(|| {
        Error::shape("matmul", format!("stack dims incompatible: {sa:?} vs {sb:?}"))
    })?;
    let bc_a: Vec<usize> = batch.iter().copied().chain([m, k1]).collect();
    let bc_b: Vec<usize> = batch.iter().copied().chain([k2, n]).collect();
    let a_bc = a
        .broadcast(IxDyn(&bc_a))
        .ok_or_else(|| Error::shape("matmul", format!("cannot broadcast lhs to {bc_a:?}")))?
        .to_owned();
    let b_bc = b
        .broadcast(IxDyn(&bc_b))
        .ok_or_else(|| Error::shape("matmul", format!("cannot broadcast rhs to {bc_b:?}")))?
        .to_owned();

    let elems: usize = batch.iter().product();
    let a_r = a_bc.to_shape((elems, m, k1)).map_err(|e| Error::shape("matmul", e.to_string()))?;
    let b_r = b_bc.to_shape((elems, k2, n)).map_err(|e| Error::shape("matmul", e.to_string()))?;

    let result_shape: Vec<usize> = batch.iter().copied().chain([m, n]).collect();
    let mut result = ArrayD::zeros(IxDyn(&result_shape));
    {
        let mut r_r = result
            .view_mut()
            .into_shape_with_order((elems, m, n))
            .map_err(|e| Error::shape("matmul", e.to_string()))?;
        ndarray::Zip::from(a_r.outer_iter())
            .and(b_r.outer_iter())
            .and(r_r.outer_iter_mut())
            .for_each(|ai, bi, mut ri| {
                general_mat_mul(D::one(), &ai, &bi, D::zero(), &mut ri);
            });
    }
    Ok(result)
}

fn matmul_fwd<D: Floating>(
    _params: &OpParams,
    inputs: &[&TensorData<D>],
) -> Result<TensorData<D>> {
    check_arity("matmul", inputs.len(), 2)?;
    matmul_kernel(inputs[0], inputs[1])
}

/// dC = og: dA = og @ B^T, dB = A^T @ og, with rank-1 operands lifted to
/// matrices first and broadcast stack dims reduced back afterwards.
fn matmul_vjp<D: Floating>(
    _params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    let (a, b) = (&inputs[0], &inputs[1]);
    let la = a.logical_shape();
    let lb = b.logical_shape();

    if la.is_empty() || lb.is_empty() {
        // scalar path: forward was elementwise scaling
        let da = reduce_to(&ops::mul(og, b)?, &la)?;
        let db = reduce_to(&ops::mul(og, a)?, &lb)?;
        return Ok(vec![da, db]);
    }

    let a2 = if la.len() == 1 { ops::reshape(a, &[1, la[0]])? } else { a.clone() };
    let b2 = if lb.len() == 1 { ops::reshape(b, &[lb[0], 1])? } else { b.clone() };
    let la2 = a2.logical_shape();
    let lb2 = b2.logical_shape();
    let m = la2[la2.len() - 2];
    let p = lb2[lb2.len() - 1];

    let stack = broadcast_shapes(&la2[..la2.len() - 2], &lb2[..lb2.len() - 2]).ok_or_else(
        || Error::shape("matmul", format!("stack dims incompatible: {la2:?} vs {lb2:?}")),
    )?;
    let mut og_shape = stack;
    og_shape.push(m);
    og_shape.push(p);
    let og2 = if og.logical_shape() == og_shape { og.clone() } else { ops::reshape(og, &og_shape)? };

    let da2 = reduce_to(&ops::matmul(&og2, &ops::t(&b2)?)?, &la2)?;
    let db2 = reduce_to(&ops::matmul(&ops::t(&a2)?, &og2)?, &lb2)?;
    let da = if la.len() == 1 { ops::reshape(&da2, &la)? } else { da2 };
    let db = if lb.len() == 1 { ops::reshape(&db2, &lb)? } else { db2 };
    Ok(vec![da, db])
}

/// Normalize both operands to `(n, rows, cols)` stacks, multiply once, and
/// squeeze the axes the lift introduced.
fn matmul_batch<D: Floating>(
    _params: &OpParams,
    args: &[BatchedArg<'_, D>],
) -> Result<(TensorData<D>, Option<usize>)> {
    check_arity("matmul", args.len(), 2)?;
    let n = batch_size("matmul", args)?;
    let (a3, ra) = lift_stack(&args[0], n, true)?;
    let (b3, rb) = lift_stack(&args[1], n, false)?;
    let out = matmul_kernel(&a3, &b3)?;
    let squeezed: Vec<usize> = match (ra, rb) {
        (1, 1) => vec![n],
        (2, 1) => vec![n, out.shape()[1]],
        (1, 2) => vec![n, out.shape()[2]],
        _ => return Ok((out, Some(0))),
    };
    Ok((reshape_raw(&out, &squeezed)?, Some(0)))
}

/// Lift one operand to a rank-3 stack, returning its logical rank.
/// Vectors become single-row (lhs) or single-column (rhs) matrices;
/// unbatched operands get a unit stack dim that broadcasts against `n`.
fn lift_stack<D: Floating>(
    arg: &BatchedArg<'_, D>,
    n: usize,
    lhs: bool,
) -> Result<(TensorData<D>, usize)> {
    let rank_err = |r: usize| {
        Error::shape("matmul", format!("vmap over matmul supports logical rank <= 2, got {r}"))
    };
    match arg.batch_dim {
        Some(d) => {
            let fronted = move_axis_raw(arg.data, d, 0);
            match fronted.ndim() - 1 {
                1 => {
                    let k = fronted.shape()[1];
                    let shape = if lhs { [n, 1, k] } else { [n, k, 1] };
                    Ok((reshape_raw(&fronted, &shape)?, 1))
                }
                2 => Ok((fronted, 2)),
                r => Err(rank_err(r)),
            }
        }
        None => match arg.data.ndim() {
            1 => {
                let k = arg.data.len();
                let shape = if lhs { [1, 1, k] } else { [1, k, 1] };
                Ok((reshape_raw(arg.data, &shape)?, 1))
            }
            2 => Ok((arg.data.clone().insert_axis(Axis(0)), 2)),
            r => Err(rank_err(r)),
        },
    }
}

pub(crate) fn defs<D: Floating>() -> Vec<PrimitiveDef<D>> {
    vec![PrimitiveDef {
        name: "matmul",
        forward: matmul_fwd,
        gradient: Some(matmul_vjp),
        batching: matmul_batch,
    }]
}

#[cfg(test)]
mod tests {
    use crate::ops;
    use crate::value::Value;
    use ndarray::{arr1, arr2};

    #[test]
    fn mat_mat() {
        let x = Value::<f64>::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let w = Value::<f64>::new(arr2(&[[5.0, 6.0], [7.0, 8.0]]).into_dyn());
        let out = ops::matmul(&x, &w).unwrap();
        let expected = arr2(&[[1.0, 2.0], [3.0, 4.0]]).dot(&arr2(&[[5.0, 6.0], [7.0, 8.0]]));
        assert_eq!(out.to_array(), expected.into_dyn());
    }

    #[test]
    fn mat_vec_and_dot() {
        let w = Value::<f64>::new(arr2(&[[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]]).into_dyn());
        let x = Value::<f64>::new(arr1(&[3.0, 4.0]).into_dyn());
        let h = ops::matmul(&w, &x).unwrap();
        assert_eq!(h.to_array(), arr1(&[3.0, 8.0, 7.0]).into_dyn());

        let v = Value::<f64>::new(arr1(&[1.0, 1.0, 1.0]).into_dyn());
        let d = ops::matmul(&v, &h).unwrap();
        assert_eq!(d.shape(), &[] as &[usize]);
        assert_eq!(d.item(), Some(18.0));
    }

    #[test]
    fn inner_dim_mismatch_is_reported() {
        let a = Value::<f32>::new(arr2(&[[1.0, 2.0]]).into_dyn());
        let b = Value::<f32>::new(arr2(&[[1.0, 2.0]]).into_dyn());
        assert!(ops::matmul(&a, &b).is_err());
    }

    #[test]
    fn stacked_lhs_times_vec() {
        // (2, 2, 2) @ (2,) -> (2, 2)
        let a = Value::<f64>::from_vec(&[2, 2, 2], vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0])
            .unwrap();
        let v = Value::<f64>::new(arr1(&[5.0, 7.0]).into_dyn());
        let out = ops::matmul(&a, &v).unwrap();
        assert_eq!(out.to_array(), arr2(&[[5.0, 7.0], [10.0, 14.0]]).into_dyn());
    }
}
