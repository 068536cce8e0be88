use crate::promise::{Outcome, Promise};
use crate::value::{Function, Value};

/// A pending promise bundled with the functions that settle it, for code
/// that resolves from outside an initializer.
#[derive(Clone)]
pub struct Resolver {
    promise: Promise,
    resolve: Function,
    reject: Function,
}

impl Resolver {
    pub fn new() -> Self {
        let promise = Promise::pending();
        let (resolve, reject) = promise.resolving_functions();
        Resolver { promise, resolve, reject }
    }

    pub fn promise(&self) -> &Promise {
        &self.promise
    }

    pub fn into_promise(self) -> Promise {
        self.promise
    }

    /// Same effect as calling [`Resolver::resolve_function`].
    pub fn resolve(&self, value: impl Into<Value>) {
        self.promise.settle(Outcome::Fulfilled(value.into()));
    }

    pub fn reject(&self, reason: impl Into<Value>) {
        self.promise.settle(Outcome::Rejected(reason.into()));
    }

    pub fn resolve_function(&self) -> Function {
        self.resolve.clone()
    }

    pub fn reject_function(&self) -> Function {
        self.reject.clone()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").field("promise", &self.promise).finish_non_exhaustive()
    }
}

impl Promise {
    /// A pending promise together with its resolve/reject functions.
    pub fn with_resolver() -> Resolver {
        Resolver::new()
    }
}
