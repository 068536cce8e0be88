//! Aggregate promises over a list of inputs.
//!
//! Inputs may be promises, thenables or plain values; plain values count as
//! already fulfilled. Each input's `then` is read at most once. The
//! aggregate subscribes to every input with a rejection handler, so inputs
//! that reject after the aggregate has settled are never reported as
//! unhandled.

use crate::promise::{Outcome, Promise};
use crate::thenable::resolve_then;
use crate::value::{Object, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Results collected by index until every input has answered.
struct Gather {
    slots: Vec<Value>,
    remaining: usize,
}

impl Gather {
    fn new(len: usize) -> Rc<RefCell<Gather>> {
        Rc::new(RefCell::new(Gather {
            slots: vec![Value::Undefined; len],
            remaining: len,
        }))
    }

    /// Store `value` at `index`; returns every slot once the last one is in.
    fn fill(cell: &RefCell<Gather>, index: usize, value: Value) -> Option<Value> {
        let mut gather = cell.borrow_mut();
        gather.slots[index] = value;
        gather.remaining = gather.remaining.saturating_sub(1);
        (gather.remaining == 0).then(|| Value::from(std::mem::take(&mut gather.slots)))
    }
}

impl Promise {
    /// Fulfills with every input's value, in input order, or rejects with
    /// the first rejection reason.
    pub fn all<I>(inputs: I) -> Promise
    where
        I: IntoIterator<Item = Value>,
    {
        let inputs: Vec<Value> = inputs.into_iter().collect();
        let aggregate = Promise::pending();
        if inputs.is_empty() {
            aggregate.settle_final(Outcome::Fulfilled(Value::array(Vec::<Value>::new())));
            return aggregate;
        }
        log::trace!("all: promise #{} waits on {} inputs", aggregate.id(), inputs.len());
        let gather = Gather::new(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let gather = gather.clone();
            let target = aggregate.clone();
            resolve_then(input, move |outcome| match outcome {
                Outcome::Fulfilled(value) => {
                    if let Some(values) = Gather::fill(&gather, index, value) {
                        target.settle_final(Outcome::Fulfilled(values));
                    }
                }
                rejected @ Outcome::Rejected(_) => target.settle_final(rejected),
            });
        }
        aggregate
    }

    /// Fulfills, once every input has settled, with one record per input:
    /// `{fulfilled: true, value}` or `{fulfilled: false, reason}`. Never
    /// rejects.
    pub fn all_settled<I>(inputs: I) -> Promise
    where
        I: IntoIterator<Item = Value>,
    {
        let inputs: Vec<Value> = inputs.into_iter().collect();
        let aggregate = Promise::pending();
        if inputs.is_empty() {
            aggregate.settle_final(Outcome::Fulfilled(Value::array(Vec::<Value>::new())));
            return aggregate;
        }
        let gather = Gather::new(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let gather = gather.clone();
            let target = aggregate.clone();
            resolve_then(input, move |outcome| {
                let record = match outcome {
                    Outcome::Fulfilled(value) => Object::from_entries([("fulfilled", Value::from(true)), ("value", value)]),
                    Outcome::Rejected(reason) => Object::from_entries([("fulfilled", Value::from(false)), ("reason", reason)]),
                };
                if let Some(records) = Gather::fill(&gather, index, Value::Object(record)) {
                    target.settle_final(Outcome::Fulfilled(records));
                }
            });
        }
        aggregate
    }

    /// Settles like the first input to settle. Empty input fulfills with
    /// `Undefined`.
    pub fn race<I>(inputs: I) -> Promise
    where
        I: IntoIterator<Item = Value>,
    {
        let aggregate = Promise::pending();
        let mut empty = true;
        for input in inputs {
            empty = false;
            let target = aggregate.clone();
            resolve_then(input, move |outcome| target.settle_final(outcome));
        }
        if empty {
            aggregate.settle_final(Outcome::Fulfilled(Value::Undefined));
        }
        aggregate
    }

    /// Fulfills like the first input to fulfill. If every input rejects,
    /// rejects with the reasons in input order. Empty input fulfills with
    /// `Undefined`.
    pub fn first_fulfilled<I>(inputs: I) -> Promise
    where
        I: IntoIterator<Item = Value>,
    {
        let inputs: Vec<Value> = inputs.into_iter().collect();
        let aggregate = Promise::pending();
        if inputs.is_empty() {
            aggregate.settle_final(Outcome::Fulfilled(Value::Undefined));
            return aggregate;
        }
        let reasons = Gather::new(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let reasons = reasons.clone();
            let target = aggregate.clone();
            resolve_then(input, move |outcome| match outcome {
                fulfilled @ Outcome::Fulfilled(_) => target.settle_final(fulfilled),
                Outcome::Rejected(reason) => {
                    if let Some(all_reasons) = Gather::fill(&reasons, index, reason) {
                        target.settle_final(Outcome::Rejected(all_reasons));
                    }
                }
            });
        }
        aggregate
    }
}
