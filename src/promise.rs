//! # Promise core
//!
//! A [`Promise`] is a shared handle to a single-resolution state machine:
//!
//! ```text
//! Pending ──resolve(thenable)──▶ Blocked ──thenable settles──▶ Settled(Outcome)
//!    └────────resolve(value) / reject(reason)───────────────────────▲
//! ```
//!
//! Callbacks are queued as [`CallbackEntry`]s and always run from the event
//! loop (see [`crate::scheduler`]), never inside the call that attached or
//! settled them. Children created by [`Promise::then`] are owned by their
//! parent's entry and point back at the parent through a `Weak`, which is
//! only used to walk cancellation upward and is cut as soon as the parent
//! settles.

use crate::error::PromiseError;
use crate::scheduler::{self, TimerId};
use crate::thenable::{self, Adoption, Relay, ThenSource};
use crate::unhandled;
use crate::value::{Function, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The settled result of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Fulfilled(Value),
    Rejected(Value),
}

impl Outcome {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    /// The fulfillment value or the rejection reason.
    pub fn value(&self) -> &Value {
        match self {
            Outcome::Fulfilled(v) | Outcome::Rejected(v) => v,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Outcome::Fulfilled(v) | Outcome::Rejected(v) => v,
        }
    }

    pub fn into_result(self) -> Result<Value, Value> {
        match self {
            Outcome::Fulfilled(v) => Ok(v),
            Outcome::Rejected(r) => Err(r),
        }
    }
}

/// Externally visible state. A promise that is waiting on a thenable it was
/// resolved with still reports `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

enum State {
    Pending,
    /// Resolved with a thenable and waiting for it; further resolve/reject
    /// calls are ignored and cancellation no longer applies.
    Blocked,
    Settled(Outcome),
}

pub(crate) enum EntryKind {
    /// Created by `then`/`then_catch`; the handler's result settles `child`.
    Child {
        child: Promise,
        on_fulfilled: Option<Function>,
        on_rejected: Option<Function>,
    },
    /// Created by `then_void` and internal subscriptions; no result promise.
    Void {
        on_fulfilled: Option<Function>,
        on_rejected: Option<Function>,
    },
    /// Created by `then_always`; runs with no arguments on either outcome.
    Always { on_settled: Function },
}

pub(crate) struct CallbackEntry {
    kind: EntryKind,
    context: Value,
}

impl CallbackEntry {
    /// Whether running this entry counts as handling a rejection.
    fn observes_rejection(&self) -> bool {
        match &self.kind {
            EntryKind::Child { .. } => true,
            EntryKind::Void { on_rejected, .. } => on_rejected.is_some(),
            EntryKind::Always { .. } => false,
        }
    }

    /// `then_always` entries never count as children for cancellation.
    fn counts_as_child(&self) -> bool {
        !matches!(self.kind, EntryKind::Always { .. })
    }

    fn child(&self) -> Option<&Promise> {
        match &self.kind {
            EntryKind::Child { child, .. } => Some(child),
            _ => None,
        }
    }
}

pub(crate) struct PromiseInner {
    id: usize,
    state: State,
    entries: VecDeque<CallbackEntry>,
    parent: Option<Weak<RefCell<PromiseInner>>>,
    executing: bool,
    unhandled_rejection: bool,
    unhandled_timer: Option<TimerId>,
}

impl Drop for PromiseInner {
    // Children owned through entries are released from a worklist so a long
    // unsettled chain does not drop one level per stack frame.
    fn drop(&mut self) {
        let mut orphans: Vec<CallbackEntry> = self.entries.drain(..).collect();
        while let Some(entry) = orphans.pop() {
            if let EntryKind::Child { child, .. } = entry.kind
                && let Ok(cell) = Rc::try_unwrap(child.inner)
            {
                let mut inner = cell.into_inner();
                orphans.extend(inner.entries.drain(..));
            }
        }
    }
}

static NEXT_PROMISE_ID: AtomicUsize = AtomicUsize::new(1);

/// Synchronous thenable hops one `resolve_loop` call takes before it
/// continues from the event loop.
const SYNC_HOP_BUDGET: usize = 1024;

/// Handle to a single-resolution value-or-error container. Cloning the
/// handle does not clone the promise.
#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<PromiseInner>>,
}

fn handler_arg(value: Value, argument: &'static str) -> Result<Option<Function>, PromiseError> {
    match value {
        Value::Undefined | Value::Null => Ok(None),
        Value::Function(f) => Ok(Some(f)),
        _ => Err(PromiseError::NotCallable { argument }),
    }
}

impl Promise {
    pub(crate) fn pending() -> Promise {
        let id = NEXT_PROMISE_ID.fetch_add(1, Ordering::SeqCst);
        Promise {
            inner: Rc::new(RefCell::new(PromiseInner {
                id,
                state: State::Pending,
                entries: VecDeque::new(),
                parent: None,
                executing: false,
                unhandled_rejection: false,
                unhandled_timer: None,
            })),
        }
    }

    /// Create a promise and run `initializer` synchronously with its
    /// `resolve` and `reject` functions. An `Err` returned by the
    /// initializer rejects the promise (unless it already settled).
    pub fn new<F>(initializer: F) -> Promise
    where
        F: FnOnce(Function, Function) -> Result<(), Value>,
    {
        Self::new_with_context(|_this, resolve, reject| initializer(resolve, reject), Value::Undefined)
    }

    /// Like [`Promise::new`], passing `context` to the initializer as `this`.
    pub fn new_with_context<F>(initializer: F, context: impl Into<Value>) -> Promise
    where
        F: FnOnce(&Value, Function, Function) -> Result<(), Value>,
    {
        let promise = Promise::pending();
        let (resolve, reject) = promise.resolving_functions();
        if let Err(thrown) = initializer(&context.into(), resolve, reject) {
            log::trace!("initializer of promise #{} threw: {thrown}", promise.id());
            promise.settle(Outcome::Rejected(thrown));
        }
        promise
    }

    /// A promise resolved with `value`. Passing a promise returns it as is;
    /// passing a thenable returns a promise that follows it.
    pub fn resolve(value: impl Into<Value>) -> Promise {
        let value: Value = value.into();
        match value {
            Value::Promise(p) => p,
            value => {
                let promise = Promise::pending();
                promise.settle(Outcome::Fulfilled(value));
                promise
            }
        }
    }

    pub fn reject(reason: impl Into<Value>) -> Promise {
        let promise = Promise::pending();
        promise.settle(Outcome::Rejected(reason.into()));
        promise
    }

    /// `resolve`/`reject` functions bound to this promise. Only the first
    /// call of either has any effect.
    pub(crate) fn resolving_functions(&self) -> (Function, Function) {
        let target = self.clone();
        let resolve = Function::unary(move |value| {
            target.settle(Outcome::Fulfilled(value));
            Ok(Value::Undefined)
        });
        let target = self.clone();
        let reject = Function::unary(move |reason| {
            target.settle(Outcome::Rejected(reason));
            Ok(Value::Undefined)
        });
        (resolve, reject)
    }

    pub fn id(&self) -> usize {
        self.inner.borrow().id
    }

    pub fn state(&self) -> PromiseState {
        match &self.inner.borrow().state {
            State::Pending | State::Blocked => PromiseState::Pending,
            State::Settled(Outcome::Fulfilled(_)) => PromiseState::Fulfilled,
            State::Settled(Outcome::Rejected(_)) => PromiseState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match &self.inner.borrow().state {
            State::Settled(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// True between an unobserved rejection and either the report or the
    /// attachment of a rejection handler.
    pub fn has_unhandled_rejection(&self) -> bool {
        self.inner.borrow().unhandled_rejection
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach handlers and return the child promise they settle.
    ///
    /// `on_fulfilled` / `on_rejected` must each be a [`Value::Function`],
    /// or `Undefined`/`Null` to pass the outcome through unchanged. Handlers
    /// receive `context` as `this`. A handler's return value resolves the
    /// child (thenables are followed) and an `Err` rejects it. When
    /// `on_rejected` sees a cancellation error and returns `Undefined`, the
    /// cancellation keeps travelling down the chain.
    pub fn then(
        &self,
        on_fulfilled: impl Into<Value>,
        on_rejected: impl Into<Value>,
        context: impl Into<Value>,
    ) -> Result<Promise, PromiseError> {
        let on_fulfilled = handler_arg(on_fulfilled.into(), "on_fulfilled")?;
        let on_rejected = handler_arg(on_rejected.into(), "on_rejected")?;
        Ok(self.add_child(on_fulfilled, on_rejected, context.into()))
    }

    /// Same as [`Promise::then`] without creating a child promise. An `Err`
    /// from either handler is reported as an unhandled rejection.
    pub fn then_void(
        &self,
        on_fulfilled: impl Into<Value>,
        on_rejected: impl Into<Value>,
        context: impl Into<Value>,
    ) -> Result<(), PromiseError> {
        let on_fulfilled = handler_arg(on_fulfilled.into(), "on_fulfilled")?;
        let on_rejected = handler_arg(on_rejected.into(), "on_rejected")?;
        self.add_entry(CallbackEntry {
            kind: EntryKind::Void { on_fulfilled, on_rejected },
            context: context.into(),
        });
        Ok(())
    }

    /// Run `on_settled` (with no arguments) whichever way this promise
    /// settles, and return this same promise. This does not count as
    /// handling a rejection; an `Err` from `on_settled` is reported as an
    /// unhandled rejection.
    pub fn then_always(&self, on_settled: Function, context: impl Into<Value>) -> Promise {
        self.add_entry(CallbackEntry {
            kind: EntryKind::Always { on_settled },
            context: context.into(),
        });
        self.clone()
    }

    /// `then(Undefined, on_rejected, context)`.
    pub fn then_catch(&self, on_rejected: Function, context: impl Into<Value>) -> Promise {
        self.add_child(None, Some(on_rejected), context.into())
    }

    fn add_child(&self, on_fulfilled: Option<Function>, on_rejected: Option<Function>, context: Value) -> Promise {
        let child = Promise::pending();
        child.inner.borrow_mut().parent = Some(Rc::downgrade(&self.inner));
        log::trace!("promise #{} gets child #{}", self.id(), child.id());
        self.add_entry(CallbackEntry {
            kind: EntryKind::Child {
                child: child.clone(),
                on_fulfilled,
                on_rejected,
            },
            context,
        });
        child
    }

    /// Internal subscription: `deliver` receives this promise's outcome once.
    pub(crate) fn subscribe<F>(&self, deliver: F)
    where
        F: Fn(Outcome) + 'static,
    {
        let deliver = Rc::new(deliver);
        let on_fulfilled = {
            let deliver = deliver.clone();
            Function::unary(move |value| {
                (*deliver)(Outcome::Fulfilled(value));
                Ok(Value::Undefined)
            })
        };
        let on_rejected = Function::unary(move |reason| {
            (*deliver)(Outcome::Rejected(reason));
            Ok(Value::Undefined)
        });
        self.add_entry(CallbackEntry {
            kind: EntryKind::Void {
                on_fulfilled: Some(on_fulfilled),
                on_rejected: Some(on_rejected),
            },
            context: Value::Undefined,
        });
    }

    fn add_entry(&self, entry: CallbackEntry) {
        let (schedule, observed) = {
            let mut inner = self.inner.borrow_mut();
            let schedule = matches!(inner.state, State::Settled(_)) && inner.entries.is_empty();
            let observed = matches!(inner.state, State::Settled(Outcome::Rejected(_))) && entry.observes_rejection();
            inner.entries.push_back(entry);
            (schedule, observed)
        };
        if observed {
            unhandled::disarm(self);
        }
        if schedule {
            self.schedule_callbacks();
        }
    }

    fn schedule_callbacks(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.executing {
                return;
            }
            inner.executing = true;
        }
        log::trace!("scheduling callbacks of promise #{}", self.id());
        let this = self.clone();
        scheduler::enqueue(move || this.execute_callbacks());
    }

    fn execute_callbacks(&self) {
        loop {
            let (entry, outcome) = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                let outcome = match &inner.state {
                    State::Settled(outcome) => outcome.clone(),
                    _ => {
                        inner.executing = false;
                        return;
                    }
                };
                match inner.entries.pop_front() {
                    Some(entry) => (entry, outcome),
                    None => {
                        inner.executing = false;
                        return;
                    }
                }
            };
            self.execute_callback(entry, &outcome);
        }
    }

    pub(crate) fn execute_callback(&self, entry: CallbackEntry, outcome: &Outcome) {
        let CallbackEntry { kind, context } = entry;
        match kind {
            EntryKind::Child {
                child,
                on_fulfilled,
                on_rejected,
            } => {
                // The parent can no longer be cancelled through this child.
                child.inner.borrow_mut().parent = None;
                let handler = match outcome {
                    Outcome::Fulfilled(_) => on_fulfilled,
                    Outcome::Rejected(_) => on_rejected,
                };
                child.settle(run_child_handler(handler, &context, outcome));
            }
            EntryKind::Void { on_fulfilled, on_rejected } => {
                let handler = match outcome {
                    Outcome::Fulfilled(_) => on_fulfilled,
                    Outcome::Rejected(_) => on_rejected,
                };
                if let Some(handler) = handler
                    && let Err(thrown) = handler.call(&context, std::slice::from_ref(outcome.value()))
                {
                    unhandled::report(&thrown);
                }
            }
            EntryKind::Always { on_settled } => {
                if let Err(thrown) = on_settled.call(&context, &[]) {
                    unhandled::report(&thrown);
                }
            }
        }
    }

    /// The single entry point for resolve/reject requests. Ignored unless
    /// the promise is still `Pending`.
    pub(crate) fn settle(&self, request: Outcome) {
        if !matches!(self.inner.borrow().state, State::Pending) {
            log::trace!("promise #{} already resolved; ignoring {request:?}", self.id());
            return;
        }
        self.resolve_loop(request);
    }

    /// Settle directly with a value already known not to need adoption.
    pub(crate) fn settle_final(&self, outcome: Outcome) {
        if matches!(self.inner.borrow().state, State::Pending) {
            self.finalize(outcome);
        }
    }

    /// Follow `source` as if this promise had been resolved with it.
    pub(crate) fn follow_source(&self, source: ThenSource) {
        if !matches!(self.inner.borrow().state, State::Pending) {
            return;
        }
        self.inner.borrow_mut().state = State::Blocked;
        if let Some(next) = self.follow(Adoption::Subscribe(source), true) {
            self.resolve_loop(next);
        }
    }

    /// Trampoline over chains of thenables: each synchronous hop becomes
    /// another iteration instead of another stack frame. After
    /// [`SYNC_HOP_BUDGET`] hops the rest of the chain continues from the
    /// event loop, so a thenable that keeps answering synchronously cannot
    /// hold the caller forever.
    fn resolve_loop(&self, mut request: Outcome) {
        for _ in 0..SYNC_HOP_BUDGET {
            let self_reference = matches!(request.value(), Value::Promise(p) if p.ptr_eq(self));
            if self_reference {
                request = Outcome::Rejected(Value::type_error("Promise cannot resolve to itself"));
            }
            self.inner.borrow_mut().state = State::Blocked;
            let fulfilling = request.is_fulfilled();
            let step = thenable::classify(request.into_value());
            match self.follow(step, fulfilling) {
                Some(next) => request = next,
                None => return,
            }
        }
        log::trace!("promise #{} still adopting after {SYNC_HOP_BUDGET} synchronous hops; yielding", self.id());
        let target = self.clone();
        scheduler::enqueue(move || target.resolve_loop(request));
    }

    /// One adoption step. Returns the next request when the thenable
    /// answered synchronously.
    fn follow(&self, step: Adoption, fulfilling: bool) -> Option<Outcome> {
        match step {
            Adoption::Plain(value) => {
                let outcome = if fulfilling { Outcome::Fulfilled(value) } else { Outcome::Rejected(value) };
                self.finalize(outcome);
                None
            }
            Adoption::AccessThrew(thrown) => Some(Outcome::Rejected(thrown)),
            Adoption::Promise(source) => {
                log::trace!("promise #{} follows promise #{}", self.id(), source.id());
                let target = self.clone();
                source.subscribe(move |outcome| target.unblock(outcome));
                None
            }
            Adoption::Subscribe(source) => {
                let target = self.clone();
                let relay = Relay::new(move |outcome| target.unblock(outcome));
                relay.subscribe_capturing(&source)
            }
        }
    }

    fn unblock(&self, outcome: Outcome) {
        {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Blocked) {
                return;
            }
            inner.state = State::Pending;
        }
        self.settle(outcome);
    }

    fn finalize(&self, outcome: Outcome) {
        let (arm, schedule) = {
            let mut inner = self.inner.borrow_mut();
            let arm = match &outcome {
                Outcome::Rejected(reason) => !reason.is_cancellation() && !inner.entries.iter().any(CallbackEntry::observes_rejection),
                Outcome::Fulfilled(_) => false,
            };
            inner.state = State::Settled(outcome.clone());
            // Settled promises can no longer be cancelled; drop the link so the
            // child does not keep anything alive.
            inner.parent = None;
            (arm, !inner.entries.is_empty())
        };
        log::debug!("promise #{} settled: {outcome:?}", self.id());
        if schedule {
            self.schedule_callbacks();
        }
        if arm && let Outcome::Rejected(reason) = outcome {
            unhandled::arm(self, reason);
        }
    }

    /// Cancel this promise if it is still pending.
    ///
    /// The cancellation runs from the event loop. If this promise is the
    /// only child of a pending parent, the parent is cancelled instead (and
    /// so on upward); otherwise this promise alone is rejected with a
    /// cancellation error carrying `message`. Every level sees the same
    /// error value.
    pub fn cancel(&self, message: Option<&str>) {
        if !self.is_strictly_pending() {
            return;
        }
        let target = self.clone();
        let message = message.unwrap_or_default().to_string();
        scheduler::enqueue(move || crate::cancel::cancel_internal(&target, Value::cancellation(message)));
    }

    pub(crate) fn is_strictly_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    pub(crate) fn parent(&self) -> Option<Promise> {
        let parent = self.inner.borrow().parent.clone()?;
        parent.upgrade().map(|inner| Promise { inner })
    }

    pub(crate) fn take_parent(&self) -> Option<Promise> {
        let parent = self.inner.borrow_mut().parent.take()?;
        parent.upgrade().map(|inner| Promise { inner })
    }

    /// Position of `child`'s entry and the number of entries that count as
    /// children.
    pub(crate) fn find_child_entry(&self, child: &Promise) -> Option<(usize, usize)> {
        let inner = self.inner.borrow();
        let index = inner.entries.iter().position(|e| e.child().is_some_and(|c| c.ptr_eq(child)))?;
        let children = inner.entries.iter().filter(|e| e.counts_as_child()).count();
        Some((index, children))
    }

    pub(crate) fn remove_entry(&self, index: usize) -> Option<CallbackEntry> {
        self.inner.borrow_mut().entries.remove(index)
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub(crate) fn mark_unhandled(&self, timer: Option<TimerId>) {
        let mut inner = self.inner.borrow_mut();
        inner.unhandled_rejection = true;
        inner.unhandled_timer = timer;
    }

    /// Clear the unhandled flag. Returns `None` if it was not set, otherwise
    /// the armed timer (if any).
    pub(crate) fn clear_unhandled(&self) -> Option<Option<TimerId>> {
        let mut inner = self.inner.borrow_mut();
        if !inner.unhandled_rejection {
            return None;
        }
        inner.unhandled_rejection = false;
        Some(inner.unhandled_timer.take())
    }
}

fn run_child_handler(handler: Option<Function>, context: &Value, outcome: &Outcome) -> Outcome {
    let Some(handler) = handler else {
        return outcome.clone();
    };
    match handler.call(context, std::slice::from_ref(outcome.value())) {
        Ok(Value::Undefined) if outcome.value().is_cancellation() => outcome.clone(),
        Ok(value) => Outcome::Fulfilled(value),
        Err(thrown) => Outcome::Rejected(thrown),
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(inner) = self.inner.try_borrow() else {
            return f.write_str("Promise { <borrowed> }");
        };
        let state = match &inner.state {
            State::Pending => "pending".to_string(),
            State::Blocked => "blocked".to_string(),
            State::Settled(outcome) => format!("{outcome:?}"),
        };
        write!(f, "Promise #{} {{ {state}, entries: {} }}", inner.id, inner.entries.len())
    }
}
