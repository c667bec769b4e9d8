//! Trains a 2-3-1 tanh network on XOR with compiled per-example gradients.
//!
//! Run with `RUST_LOG=debug` to watch loss, or `RUST_LOG=trace` to see
//! every node the first (and only) trace records.

use tapegrad::prelude::*;

// args layout: [w1, b1, w2, b2, x, y]
fn logit(args: &[Value<f64>]) -> Result<Value<f64>> {
    let (w1, b1, w2, b2, x) = (&args[0], &args[1], &args[2], &args[3], &args[4]);
    let h = ops::tanh(&ops::add(&ops::matmul(w1, x)?, b1)?)?;
    ops::add(&ops::matmul(w2, &h)?, b2)
}

fn loss(args: &[Value<f64>]) -> Result<Value<f64>> {
    ops::sigmoid_bce(&logit(args)?, &args[5])
}

fn main() -> Result<()> {
    env_logger::init();

    let mut params = vec![
        Value::from_vec(&[3, 2], vec![0.25, -1.06, -0.86, -0.58, -0.06, 0.98])?,
        Value::from_vec(&[3], vec![1.38, 0.95, 1.62])?,
        Value::from_vec(&[3], vec![-0.14, 0.43, -0.34])?,
        Value::scalar(-0.63),
    ];
    let xs = Value::from_vec(&[4, 2], vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0])?;
    let ys = Value::from_vec(&[4], vec![0.0, 1.0, 1.0, 0.0])?;
    let lr = 1.0;

    let loss_grad = jit(vmap(
        grad(loss, vec![0, 1, 2, 3]),
        vec![None, None, None, None, Some(0usize), Some(0)],
        0usize,
    ));
    let batch_loss = vmap(
        |args: &[Value<f64>]| Ok(vec![loss(args)?]),
        vec![None, None, None, None, Some(0usize), Some(0)],
        0usize,
    );

    for step in 0..1000 {
        let mut args = params.clone();
        args.push(xs.clone());
        args.push(ys.clone());
        let per_example = loss_grad.call(&args)?;

        let scale = Value::scalar(-lr / 4.0);
        for (p, g) in params.iter_mut().zip(&per_example) {
            let update = ops::mul(&ops::sum(g, &[0], false)?, &scale)?;
            *p = ops::add(p, &update)?;
        }

        if step % 100 == 0 {
            let losses = batch_loss(&args)?.remove(0);
            let mean = ops::sum_all(&losses)?.item().unwrap_or(f64::NAN) / 4.0;
            log::debug!("step {step}: mean loss {mean:.6}");
        }
    }

    log::info!("traced {} time(s)", loss_grad.trace_count());
    println!(" x1 x2 | xor | prediction");
    for (x, y) in [([0.0, 0.0], 0.0), ([0.0, 1.0], 1.0), ([1.0, 0.0], 1.0), ([1.0, 1.0], 0.0)] {
        let mut args = params.clone();
        args.push(Value::from_vec(&[2], x.to_vec())?);
        args.push(Value::scalar(y));
        let z = logit(&args)?.item().unwrap_or(f64::NAN);
        let p = if z > 0.0 { 1 } else { 0 };
        println!("  {} {}  |  {}  | {p} (logit {z:+.3})", x[0] as u8, x[1] as u8, y as u8);
    }
    Ok(())
}
