//! Adoption of thenables.
//!
//! Anything with a callable `then` can stand in for a promise: [`Promise`]
//! handles, [`Value::Thenable`] trait objects, and plain objects whose
//! `then` property holds a function. `then` is read exactly once per
//! adoption, and if the read itself throws, the thrown value becomes the
//! rejection reason.
//!
//! Foreign `then` implementations are not trusted. Only the first call of
//! either callback they receive counts, and an error they return after
//! calling back is ignored.

use crate::promise::{Outcome, Promise};
use crate::value::{Function, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A Rust-side thenable. Implementations should eventually call exactly
/// one of the callbacks once; the adapter tolerates anything else.
pub trait Thenable {
    fn then(&self, on_fulfilled: Function, on_rejected: Function) -> Result<(), Value>;
}

/// Something that can be subscribed to with a pair of callbacks.
pub(crate) enum ThenSource {
    Foreign { receiver: Value, then: Function },
    Typed(Rc<dyn Thenable>),
}

impl ThenSource {
    fn invoke(&self, on_fulfilled: Function, on_rejected: Function) -> Result<(), Value> {
        match self {
            ThenSource::Foreign { receiver, then } => then
                .call(receiver, &[Value::Function(on_fulfilled), Value::Function(on_rejected)])
                .map(drop),
            ThenSource::Typed(thenable) => thenable.then(on_fulfilled, on_rejected),
        }
    }

    /// Address of the value `then` was read from.
    fn identity(&self) -> Option<*const ()> {
        match self {
            ThenSource::Foreign { receiver, .. } => identity_of(receiver),
            ThenSource::Typed(thenable) => Some(Rc::as_ptr(thenable).cast()),
        }
    }
}

fn identity_of(value: &Value) -> Option<*const ()> {
    match value {
        Value::Object(obj) => Some(obj.as_ptr()),
        Value::Thenable(thenable) => Some(Rc::as_ptr(thenable).cast()),
        _ => None,
    }
}

pub(crate) enum Adoption {
    Plain(Value),
    Promise(Promise),
    Subscribe(ThenSource),
    /// Reading `then` threw this value.
    AccessThrew(Value),
}

pub(crate) fn classify(value: Value) -> Adoption {
    match value {
        Value::Promise(p) => Adoption::Promise(p),
        Value::Thenable(t) => Adoption::Subscribe(ThenSource::Typed(t)),
        Value::Object(obj) => match obj.get("then") {
            Ok(Value::Function(then)) => Adoption::Subscribe(ThenSource::Foreign {
                receiver: Value::Object(obj),
                then,
            }),
            Ok(_) => Adoption::Plain(Value::Object(obj)),
            Err(thrown) => Adoption::AccessThrew(thrown),
        },
        other => Adoption::Plain(other),
    }
}

/// Whether `value` would be adopted rather than used as is. Reads `then`
/// on objects (running any getter), and a throwing read counts as "no".
pub fn is_thenable(value: &Value) -> bool {
    match value {
        Value::Promise(_) | Value::Thenable(_) => true,
        Value::Object(obj) => matches!(obj.get("then"), Ok(Value::Function(_))),
        _ => false,
    }
}

struct RelayState {
    settled: Cell<bool>,
    capturing: Cell<bool>,
    captured: RefCell<Option<Outcome>>,
    source: Cell<Option<*const ()>>,
    deliver: Box<dyn Fn(Outcome)>,
}

/// Once-only bridge between a foreign `then` and a consumer.
pub(crate) struct Relay {
    state: Rc<RelayState>,
}

impl Relay {
    pub(crate) fn new<F>(deliver: F) -> Self
    where
        F: Fn(Outcome) + 'static,
    {
        Relay {
            state: Rc::new(RelayState {
                settled: Cell::new(false),
                capturing: Cell::new(false),
                captured: RefCell::new(None),
                source: Cell::new(None),
                deliver: Box::new(deliver),
            }),
        }
    }

    fn settle(state: &RelayState, outcome: Outcome) {
        if state.settled.replace(true) {
            log::trace!("thenable called back more than once; ignoring {outcome:?}");
            return;
        }
        let yields_itself = match (&outcome, state.source.get()) {
            (Outcome::Fulfilled(value), Some(source)) => identity_of(value) == Some(source),
            _ => false,
        };
        let outcome = if yields_itself {
            log::debug!("thenable fulfilled with itself");
            Outcome::Rejected(Value::type_error("Thenable cannot resolve to itself"))
        } else {
            outcome
        };
        if state.capturing.get() {
            *state.captured.borrow_mut() = Some(outcome);
        } else {
            (state.deliver)(outcome);
        }
    }

    fn callbacks(&self) -> (Function, Function) {
        let state = self.state.clone();
        let on_fulfilled = Function::unary(move |value| {
            Relay::settle(&state, Outcome::Fulfilled(value));
            Ok(Value::Undefined)
        });
        let state = self.state.clone();
        let on_rejected = Function::unary(move |reason| {
            Relay::settle(&state, Outcome::Rejected(reason));
            Ok(Value::Undefined)
        });
        (on_fulfilled, on_rejected)
    }

    /// Call `source.then`. An outcome delivered before `then` returns is
    /// handed back to the caller instead of going through `deliver`, so a
    /// chain of synchronous thenables is walked in a loop, not on the stack.
    pub(crate) fn subscribe_capturing(&self, source: &ThenSource) -> Option<Outcome> {
        let (on_fulfilled, on_rejected) = self.callbacks();
        self.state.source.set(source.identity());
        self.state.capturing.set(true);
        if let Err(thrown) = source.invoke(on_fulfilled, on_rejected) {
            Relay::settle(&self.state, Outcome::Rejected(thrown));
        }
        self.state.capturing.set(false);
        self.state.captured.borrow_mut().take()
    }
}

/// Deliver the eventual outcome of `value` to `deliver`: now for thenables
/// whose `then` read throws, from the event loop otherwise.
pub(crate) fn resolve_then<F>(value: Value, deliver: F)
where
    F: Fn(Outcome) + 'static,
{
    match classify(value) {
        Adoption::Plain(value) => crate::scheduler::enqueue(move || deliver(Outcome::Fulfilled(value))),
        Adoption::AccessThrew(thrown) => deliver(Outcome::Rejected(thrown)),
        Adoption::Promise(p) => p.subscribe(deliver),
        Adoption::Subscribe(source) => {
            let proxy = Promise::pending();
            proxy.follow_source(source);
            proxy.subscribe(deliver);
        }
    }
}
