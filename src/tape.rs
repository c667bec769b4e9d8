//! The tape: a recorded sequence of primitive applications.
//!
//! [`bind`] is the single interception point. It eagerly executes the
//! primitive (through its forward or batching rule) and, when a trace is
//! active, appends a node recording the application. Nodes only ever refer
//! to values that already exist, so the tape is acyclic by construction.

use core::fmt::{Display, Formatter, Result as FmtResult};
use itertools::Itertools;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Result;
use crate::registry::{self, BatchedArg, OpParams};
use crate::value::{TensorData, Value};
use crate::Floating;

/// One recorded primitive application.
#[derive(Debug, Clone)]
pub struct Node<D: Floating> {
    pub prim: &'static str,
    pub params: OpParams,
    pub inputs: Vec<Value<D>>,
    pub output: Value<D>,
}

#[derive(Debug, Clone)]
pub struct Tape<D: Floating> {
    pub nodes: Vec<Node<D>>,
}

impl<D: Floating> Tape<D> {
    pub fn new() -> Self {
        Self { nodes: vec![] }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<D: Floating> Default for Tape<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Floating> Display for Tape<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        for (i, node) in self.nodes.iter().enumerate() {
            let ins = node.inputs.iter().map(|v| v.id().to_string()).join(", ");
            writeln!(
                f,
                "{i}: {} [{ins}] -> {} {:?}",
                node.prim,
                node.output.id(),
                node.output.shape()
            )?;
        }
        Ok(())
    }
}

type Stack<D> = Vec<Rc<RefCell<Tape<D>>>>;

thread_local! {
    static TRACE_STACKS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

fn with_stack<D: Floating, R>(f: impl FnOnce(&mut Stack<D>) -> R) -> R {
    TRACE_STACKS.with(|cell| {
        let mut map = cell.borrow_mut();
        let entry = map
            .entry(TypeId::of::<D>())
            .or_insert_with(|| Box::new(Stack::<D>::new()) as Box<dyn Any>);
        let stack = entry
            .downcast_mut::<Stack<D>>()
            .expect("trace stacks are keyed by element type");
        f(stack)
    })
}

/// The innermost active tape, if any.
pub(crate) fn active<D: Floating>() -> Option<Rc<RefCell<Tape<D>>>> {
    with_stack(|s: &mut Stack<D>| s.last().cloned())
}

pub(crate) fn is_tracing<D: Floating>() -> bool {
    with_stack(|s: &mut Stack<D>| !s.is_empty())
}

/// Pushes a fresh tape on construction; pops it on drop. A trace that
/// fails mid-way discards its tape on the way out.
pub(crate) struct TraceGuard<D: Floating> {
    tape: Rc<RefCell<Tape<D>>>,
    popped: bool,
}

impl<D: Floating> TraceGuard<D> {
    pub fn push() -> Self {
        let tape = Rc::new(RefCell::new(Tape::new()));
        with_stack(|s: &mut Stack<D>| s.push(Rc::clone(&tape)));
        Self { tape, popped: false }
    }

    pub fn tape(&self) -> Rc<RefCell<Tape<D>>> {
        Rc::clone(&self.tape)
    }

    /// Pop the tape and hand it to the caller.
    pub fn finish(mut self) -> Tape<D> {
        self.popped = true;
        with_stack(|s: &mut Stack<D>| {
            s.pop();
        });
        std::mem::take(&mut self.tape.borrow_mut())
    }
}

impl<D: Floating> Drop for TraceGuard<D> {
    fn drop(&mut self) {
        if !self.popped {
            with_stack(|s: &mut Stack<D>| {
                s.pop();
            });
        }
    }
}

/// Apply a primitive to values: validate, execute eagerly, record.
///
/// When any input carries a batch axis the primitive's batching rule runs
/// instead of its forward rule; the recorded node keeps the logical
/// primitive and the inputs' batch metadata so a jit replay re-dispatches
/// identically.
pub fn bind<D: Floating>(
    prim: &'static str,
    params: OpParams,
    inputs: &[Value<D>],
) -> Result<Value<D>> {
    let def = registry::lookup::<D>(prim)?;

    let (data, batch_dim) = if inputs.iter().any(|v| v.batch_dim().is_some()) {
        let args: Vec<BatchedArg<'_, D>> = inputs
            .iter()
            .map(|v| BatchedArg { data: v.data(), batch_dim: v.batch_dim() })
            .collect();
        (def.batching)(&params, &args)?
    } else {
        let arrays: Vec<&TensorData<D>> = inputs.iter().map(Value::data).collect();
        ((def.forward)(&params, &arrays)?, None)
    };

    let out = Value::new(data).with_batch_dim(batch_dim);
    if let Some(tape) = active::<D>() {
        let mut tape = tape.borrow_mut();
        log::trace!("tape[{}]: {} -> {} {:?}", tape.len(), prim, out.id(), out.shape());
        tape.nodes.push(Node { prim, params, inputs: inputs.to_vec(), output: out.clone() });
    }
    Ok(out)
}
