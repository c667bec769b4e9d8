//! Binary arithmetic primitives.

use crate::error::Result;
use crate::ops::{self, binary_prim, reduce_to};
use crate::registry::{OpParams, PrimitiveDef};
use crate::value::Value;
use crate::Floating;

binary_prim!(add_fwd, add_batch, "add", |x: D, y: D| x + y);
binary_prim!(sub_fwd, sub_batch, "sub", |x: D, y: D| x - y);
binary_prim!(mul_fwd, mul_batch, "mul", |x: D, y: D| x * y);
binary_prim!(greater_fwd, greater_batch, "greater", |x: D, y: D| {
    if x > y {
        D::one()
    } else {
        D::zero()
    }
});

fn add_vjp<D: Floating>(
    _params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    Ok(vec![
        reduce_to(og, &inputs[0].logical_shape())?,
        reduce_to(og, &inputs[1].logical_shape())?,
    ])
}

fn sub_vjp<D: Floating>(
    _params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    Ok(vec![
        reduce_to(og, &inputs[0].logical_shape())?,
        reduce_to(&ops::neg(og)?, &inputs[1].logical_shape())?,
    ])
}

fn mul_vjp<D: Floating>(
    _params: &OpParams,
    inputs: &[Value<D>],
    _out: &Value<D>,
    og: &Value<D>,
) -> Result<Vec<Value<D>>> {
    let (a, b) = (&inputs[0], &inputs[1]);
    Ok(vec![
        reduce_to(&ops::mul(og, b)?, &a.logical_shape())?,
        reduce_to(&ops::mul(og, a)?, &b.logical_shape())?,
    ])
}

pub(crate) fn defs<D: Floating>() -> Vec<PrimitiveDef<D>> {
    vec![
        PrimitiveDef { name: "add", forward: add_fwd, gradient: Some(add_vjp), batching: add_batch },
        PrimitiveDef { name: "sub", forward: sub_fwd, gradient: Some(sub_vjp), batching: sub_batch },
        PrimitiveDef { name: "mul", forward: mul_fwd, gradient: Some(mul_vjp), batching: mul_batch },
        // compare has no gradient: reaching it in a reverse pass is an error
        PrimitiveDef { name: "greater", forward: greater_fwd, gradient: None, batching: greater_batch },
    ]
}

#[cfg(test)]
mod tests {
    use crate::ops;
    use crate::value::Value;
    use ndarray::{arr1, arr2};

    #[test]
    fn add_broadcasts_scalar() {
        let a = Value::<f64>::new(arr1(&[1.0, 2.0]).into_dyn());
        let b = Value::<f64>::scalar(10.0);
        let c = ops::add(&a, &b).unwrap();
        assert_eq!(c.to_array(), arr1(&[11.0, 12.0]).into_dyn());
    }

    #[test]
    fn mul_broadcasts_rows() {
        let a = Value::<f64>::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let b = Value::<f64>::new(arr1(&[10.0, 100.0]).into_dyn());
        let c = ops::mul(&a, &b).unwrap();
        assert_eq!(c.to_array(), arr2(&[[10.0, 200.0], [30.0, 400.0]]).into_dyn());
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        let a = Value::<f32>::new(arr1(&[1.0, 2.0, 3.0]).into_dyn());
        let b = Value::<f32>::new(arr1(&[1.0, 2.0]).into_dyn());
        assert!(ops::add(&a, &b).is_err());
    }

    #[test]
    fn greater_yields_mask() {
        let a = Value::<f64>::new(arr1(&[0.2, 0.8]).into_dyn());
        let b = Value::<f64>::scalar(0.5);
        let m = ops::greater(&a, &b).unwrap();
        assert_eq!(m.to_array(), arr1(&[0.0, 1.0]).into_dyn());
    }
}
