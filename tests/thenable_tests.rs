use std::cell::{Cell, RefCell};
use std::rc::Rc;
use thenable::scheduler::pending_tasks;
use thenable::{Function, Object, Outcome, Promise, RuntimeConfig, Thenable, Value, install, is_thenable, run_until_idle};

// Initialize logger for this integration test binary so `RUST_LOG` is honored.
// Using `ctor` ensures initialization runs before tests start.
#[ctor::ctor]
fn __init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default()).is_test(true).try_init();
}

/// An object whose `then` calls back synchronously with `outcome`.
fn sync_thenable(outcome: Outcome) -> Value {
    let obj = Object::new();
    obj.set(
        "then",
        Function::new(move |_this, args| {
            let (callback, value) = match &outcome {
                Outcome::Fulfilled(v) => (args.first(), v.clone()),
                Outcome::Rejected(r) => (args.get(1), r.clone()),
            };
            if let Some(Value::Function(callback)) = callback {
                callback.call(&Value::Undefined, &[value])?;
            }
            Ok(Value::Undefined)
        }),
    );
    Value::Object(obj)
}

/// A thenable that synchronously fulfills with another thenable, `depth`
/// times, before fulfilling with `"bottom"`.
fn countdown(depth: u32, hops: Rc<Cell<u32>>) -> Value {
    let obj = Object::new();
    obj.set(
        "then",
        Function::new(move |_this, args| {
            hops.set(hops.get() + 1);
            let next = if depth > 1 { countdown(depth - 1, hops.clone()) } else { Value::from("bottom") };
            match args.first() {
                Some(Value::Function(resolve)) => resolve.call(&Value::Undefined, &[next]),
                _ => Ok(Value::Undefined),
            }
        }),
    );
    Value::Object(obj)
}

/// Two objects whose `then` fulfills with the other one, until `limit`
/// calls have been made; after that the answer is `"escaped"`.
fn ping_pong(limit: u32, hops: Rc<Cell<u32>>) -> Value {
    let ping = Object::new();
    let pong = Object::new();
    for (obj, other) in [(&ping, &pong), (&pong, &ping)] {
        let other = other.clone();
        let hops = hops.clone();
        obj.set(
            "then",
            Function::new(move |_this, args| {
                hops.set(hops.get() + 1);
                let next = if hops.get() < limit { Value::Object(other.clone()) } else { Value::from("escaped") };
                match args.first() {
                    Some(Value::Function(resolve)) => resolve.call(&Value::Undefined, &[next]),
                    _ => Ok(Value::Undefined),
                }
            }),
        );
    }
    Value::Object(ping)
}

struct Deferred {
    callbacks: RefCell<Vec<(Function, Function)>>,
}

impl Thenable for Deferred {
    fn then(&self, on_fulfilled: Function, on_rejected: Function) -> Result<(), Value> {
        self.callbacks.borrow_mut().push((on_fulfilled, on_rejected));
        Ok(())
    }
}

#[cfg(test)]
mod thenable_tests {
    use super::*;

    #[test]
    fn test_adopts_sync_thenable() {
        let _guard = install(RuntimeConfig::manual());
        let p = Promise::resolve(sync_thenable(Outcome::Fulfilled(Value::from(5))));
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::from(5))));
    }

    #[test]
    fn test_adversarial_thenable_first_call_wins() {
        let _guard = install(RuntimeConfig::manual());
        let obj = Object::new();
        obj.set(
            "then",
            Function::new(|_this, args| {
                let call = |i: usize, v: i32| match args.get(i) {
                    Some(Value::Function(f)) => f.call(&Value::Undefined, &[Value::from(v)]).map(drop),
                    _ => Ok(()),
                };
                call(0, 1)?;
                call(0, 2)?;
                call(1, 3)?;
                Err(Value::from("thrown after"))
            }),
        );
        let p = Promise::resolve(Value::Object(obj));
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::from(1))));
    }

    #[test]
    fn test_then_read_exactly_once() {
        let _guard = install(RuntimeConfig::manual());
        let reads = Rc::new(Cell::new(0));
        let obj = Object::new();
        let counter = reads.clone();
        obj.define_getter(
            "then",
            Function::new(move |_, _| {
                counter.set(counter.get() + 1);
                Ok(Value::Function(Function::new(|_this, args| match args.first() {
                    Some(Value::Function(resolve)) => resolve.call(&Value::Undefined, &[Value::from("done")]),
                    _ => Ok(Value::Undefined),
                })))
            }),
        );
        let p = Promise::resolve(Value::Object(obj));
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::from("done"))));
        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn test_throwing_then_getter_rejects() {
        let _guard = install(RuntimeConfig::manual());
        let err = Value::error("getter");
        let thrown = err.clone();
        let obj = Object::new();
        obj.define_getter("then", Function::new(move |_, _| Err(thrown.clone())));
        let p = Promise::resolve(Value::Object(obj))
            .then(Value::Undefined, Function::unary(Ok), Value::Undefined)
            .unwrap();
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(err)));
    }

    #[test]
    fn test_then_receives_object_as_this() {
        let _guard = install(RuntimeConfig::manual());
        let receiver = Rc::new(RefCell::new(Value::Undefined));
        let obj = Object::new();
        let sink = receiver.clone();
        obj.set(
            "then",
            Function::new(move |this, _args| {
                *sink.borrow_mut() = this.clone();
                Ok(Value::Undefined)
            }),
        );
        let _p = Promise::resolve(Value::Object(obj.clone()));
        assert_eq!(*receiver.borrow(), Value::Object(obj));
    }

    #[test]
    fn test_non_callable_then_is_a_plain_value() {
        let _guard = install(RuntimeConfig::manual());
        let obj = Object::from_entries([("then", Value::from(42))]);
        let p = Promise::resolve(Value::Object(obj.clone()));
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::Object(obj))));
    }

    #[test]
    fn test_typed_thenable_settles_later() {
        let _guard = install(RuntimeConfig::manual());
        let deferred = Rc::new(Deferred {
            callbacks: RefCell::new(Vec::new()),
        });
        let p = Promise::resolve(Value::Thenable(deferred.clone()));
        run_until_idle().unwrap();
        assert!(p.is_pending());

        let (_, reject) = deferred.callbacks.borrow()[0].clone();
        reject.call(&Value::Undefined, &[Value::from("nope")]).unwrap();
        p.then_catch(Function::unary(Ok), Value::Undefined);
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Rejected(Value::from("nope"))));
    }

    #[test]
    fn test_thenable_resolving_to_thenable() {
        let _guard = install(RuntimeConfig::manual());
        let inner = sync_thenable(Outcome::Fulfilled(Value::from("deep")));
        let outer = sync_thenable(Outcome::Fulfilled(inner));
        let p = Promise::resolve(outer);
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::from("deep"))));
    }

    #[test]
    fn test_deep_sync_thenable_chain_does_not_overflow() {
        let _guard = install(RuntimeConfig::manual());
        let hops = Rc::new(Cell::new(0));
        let p = Promise::resolve(countdown(10_000, hops.clone()));
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::from("bottom"))));
        assert_eq!(hops.get(), 10_000);
    }

    #[test]
    fn test_thenable_yielding_itself_is_type_error() {
        let _guard = install(RuntimeConfig::manual());
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let obj = Object::new();
        obj.set(
            "then",
            Function::new(move |this, args| {
                counter.set(counter.get() + 1);
                match args.first() {
                    Some(Value::Function(resolve)) => resolve.call(&Value::Undefined, std::slice::from_ref(this)),
                    _ => Ok(Value::Undefined),
                }
            }),
        );
        let p = Promise::resolve(Value::Object(obj));
        let caught = p.then_catch(Function::unary(Ok), Value::Undefined);
        run_until_idle().unwrap();
        assert_eq!(calls.get(), 1);
        let Some(Outcome::Fulfilled(Value::Error(err))) = caught.outcome() else {
            panic!("expected a TypeError");
        };
        assert_eq!(err.name(), "TypeError");
        assert_eq!(err.message(), "Thenable cannot resolve to itself");
    }

    #[test]
    fn test_synchronous_thenable_cycle_yields_to_the_loop() {
        let _guard = install(RuntimeConfig::manual());
        let hops = Rc::new(Cell::new(0));
        let p = Promise::resolve(ping_pong(5_000, hops.clone()));
        // resolve() came back before the cycle ran out.
        let after_resolve = hops.get();
        assert!(after_resolve > 0 && after_resolve < 5_000);
        assert!(p.is_pending());
        assert_eq!(pending_tasks(), 1);

        run_until_idle().unwrap();
        assert_eq!(hops.get(), 5_000);
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::from("escaped"))));
    }

    #[test]
    fn test_is_thenable() {
        let _guard = install(RuntimeConfig::manual());
        assert!(is_thenable(&Value::Promise(Promise::resolve(1))));
        assert!(is_thenable(&sync_thenable(Outcome::Fulfilled(Value::Undefined))));
        assert!(!is_thenable(&Value::Object(Object::new())));
        assert!(!is_thenable(&Value::from("then")));
    }
}
