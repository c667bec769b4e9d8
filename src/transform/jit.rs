//! Trace-compilation: record a function once per argument signature and
//! replay the recorded tape on later calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::registry::{self, BatchedArg};
use crate::tape::{self, Tape, TraceGuard};
use crate::value::{DType, TensorData, Value, ValueId};
use crate::Floating;

/// One argument's contribution to a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ArgSpec {
    shape: Vec<usize>,
    dtype: DType,
    batch_dim: Option<usize>,
}

type Signature = Vec<ArgSpec>;

struct CompiledEntry<D: Floating> {
    tape: Tape<D>,
    arg_ids: Vec<ValueId>,
    outputs: Vec<Value<D>>,
}

/// A compiled wrapper around `f`.
///
/// The first call for each argument signature runs `f` under a trace and
/// caches the tape; later calls with the same signature replay the tape
/// without re-entering `f`. Replay assumes `f` is pure per signature: a
/// replayed node whose output shape diverges from the recording aborts
/// with [`Error::SignatureInconsistency`].
///
/// When an outer trace is already active, `call` is transparent and simply
/// runs `f`, leaving the recording to the outer transform.
pub struct Jit<D: Floating, F> {
    f: F,
    cache: Mutex<HashMap<Signature, Arc<CompiledEntry<D>>>>,
    trace_count: AtomicUsize,
}

/// Wrap `f` for compiled execution.
pub fn jit<D, F>(f: F) -> Jit<D, F>
where
    D: Floating,
    F: Fn(&[Value<D>]) -> Result<Vec<Value<D>>>,
{
    Jit { f, cache: Mutex::new(HashMap::new()), trace_count: AtomicUsize::new(0) }
}

impl<D, F> Jit<D, F>
where
    D: Floating,
    F: Fn(&[Value<D>]) -> Result<Vec<Value<D>>>,
{
    pub fn call(&self, args: &[Value<D>]) -> Result<Vec<Value<D>>> {
        if tape::is_tracing::<D>() {
            return (self.f)(args);
        }

        let sig = signature(args);
        // The lock spans lookup, trace and insert: at most one trace ever
        // runs per signature.
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = cache.get(&sig) {
            let entry = Arc::clone(entry);
            drop(cache);
            log::debug!("jit: replaying {} node(s) for {sig:?}", entry.tape.len());
            return replay(&entry, args);
        }

        log::debug!("jit: tracing for new signature {sig:?}");
        let guard = TraceGuard::<D>::push();
        let outs = (self.f)(args)?;
        let tape = guard.finish();
        log::trace!("jit: recorded {} node(s)\n{tape}", tape.len());
        self.trace_count.fetch_add(1, Ordering::Relaxed);
        let entry = CompiledEntry {
            tape,
            arg_ids: args.iter().map(Value::id).collect(),
            outputs: outs.clone(),
        };
        cache.insert(sig, Arc::new(entry));
        Ok(outs)
    }

    /// How many times `f` has been traced (cache misses).
    pub fn trace_count(&self) -> usize {
        self.trace_count.load(Ordering::Relaxed)
    }

    /// How many distinct signatures are cached.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn signature<D: Floating>(args: &[Value<D>]) -> Signature {
    args.iter()
        .map(|v| ArgSpec { shape: v.shape().to_vec(), dtype: D::DTYPE, batch_dim: v.batch_dim() })
        .collect()
}

/// Re-execute a recorded tape against fresh argument data.
///
/// The environment maps recorded value ids to current arrays; values absent
/// from it are literals captured at trace time and their recorded data is
/// used as-is. Each node re-dispatches exactly as it did when recorded,
/// through the batching rule when any recorded input carried a batch axis.
fn replay<D: Floating>(entry: &CompiledEntry<D>, args: &[Value<D>]) -> Result<Vec<Value<D>>> {
    let mut env: HashMap<ValueId, Arc<TensorData<D>>> =
        entry.arg_ids.iter().copied().zip(args.iter().map(Value::data_arc)).collect();

    for node in &entry.tape.nodes {
        let def = registry::lookup::<D>(node.prim)?;
        let datas: Vec<Arc<TensorData<D>>> = node
            .inputs
            .iter()
            .map(|v| env.get(&v.id()).cloned().unwrap_or_else(|| v.data_arc()))
            .collect();

        let out = if node.inputs.iter().any(|v| v.batch_dim().is_some()) {
            let bargs: Vec<BatchedArg<'_, D>> = node
                .inputs
                .iter()
                .zip(&datas)
                .map(|(v, d)| BatchedArg { data: d, batch_dim: v.batch_dim() })
                .collect();
            (def.batching)(&node.params, &bargs)?.0
        } else {
            let arrays: Vec<&TensorData<D>> = datas.iter().map(|d| d.as_ref()).collect();
            (def.forward)(&node.params, &arrays)?
        };

        if out.shape() != node.output.shape() {
            return Err(Error::SignatureInconsistency(format!(
                "`{}` produced shape {:?} where the recording has {:?}",
                node.prim,
                out.shape(),
                node.output.shape()
            )));
        }
        env.insert(node.output.id(), Arc::new(out));
    }

    Ok(entry
        .outputs
        .iter()
        .map(|v| {
            let data = env.get(&v.id()).cloned().unwrap_or_else(|| v.data_arc());
            Value::from_arc(data).with_batch_dim(v.batch_dim())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn traces_once_per_signature() {
        let compiled = jit(|args: &[Value<f64>]| Ok(vec![ops::mul(&args[0], &args[0])?]));
        let x = Value::new(arr1(&[1.0, 2.0]).into_dyn());
        let y = Value::new(arr1(&[3.0, 4.0]).into_dyn());
        let a = compiled.call(&[x]).unwrap().remove(0);
        let b = compiled.call(&[y]).unwrap().remove(0);
        assert_eq!(a.to_array(), arr1(&[1.0, 4.0]).into_dyn());
        assert_eq!(b.to_array(), arr1(&[9.0, 16.0]).into_dyn());
        assert_eq!(compiled.trace_count(), 1);
        assert_eq!(compiled.cache_size(), 1);
    }

    #[test]
    fn distinct_shapes_get_distinct_entries() {
        let compiled = jit(|args: &[Value<f32>]| Ok(vec![ops::neg(&args[0])?]));
        compiled.call(&[Value::new(arr1(&[1.0f32, 2.0]).into_dyn())]).unwrap();
        compiled.call(&[Value::new(arr1(&[1.0f32, 2.0, 3.0]).into_dyn())]).unwrap();
        compiled.call(&[Value::new(arr1(&[5.0f32, 6.0]).into_dyn())]).unwrap();
        assert_eq!(compiled.trace_count(), 2);
        assert_eq!(compiled.cache_size(), 2);
    }

    #[test]
    fn literals_are_baked_into_the_trace() {
        let c = Value::<f64>::scalar(10.0);
        let compiled = jit(move |args: &[Value<f64>]| Ok(vec![ops::add(&args[0], &c)?]));
        let a = compiled.call(&[Value::scalar(1.0)]).unwrap().remove(0);
        let b = compiled.call(&[Value::scalar(2.0)]).unwrap().remove(0);
        assert_abs_diff_eq!(a.item().unwrap(), 11.0);
        assert_abs_diff_eq!(b.item().unwrap(), 12.0);
    }

    #[test]
    fn transparent_under_an_outer_trace() {
        let compiled = jit(|args: &[Value<f64>]| Ok(vec![ops::neg(&args[0])?]));
        let guard = TraceGuard::<f64>::push();
        compiled.call(&[Value::scalar(1.0)]).unwrap();
        let tape = guard.finish();
        assert_eq!(tape.len(), 1);
        assert_eq!(compiled.trace_count(), 0);
    }

    #[test]
    fn failed_trace_leaves_no_cache_entry() {
        let compiled = jit(|args: &[Value<f64>]| {
            ops::matmul(&args[0], &args[0]).map(|v| vec![v])
        });
        // (3,) . (3,) is fine; first provoke a failure with a 2x3
        let bad = Value::from_vec(&[2, 3], vec![0.0; 6]).unwrap();
        assert!(compiled.call(&[bad]).is_err());
        assert_eq!(compiled.cache_size(), 0);
        assert!(!tape::is_tracing::<f64>());
    }
}
