use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use thenable::{
    Function, Outcome, Promise, PromiseState, RuntimeConfig, Value, advance, install, run_until_idle, set_unhandled_rejection_handler,
};

// Initialize logger for this integration test binary so `RUST_LOG` is honored.
// Using `ctor` ensures initialization runs before tests start.
#[ctor::ctor]
fn __init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default()).is_test(true).try_init();
}

fn never() -> Promise {
    Promise::new(|_, _| Ok(()))
}

fn identity() -> Function {
    Function::unary(Ok)
}

fn reason(p: &Promise) -> Value {
    match p.outcome() {
        Some(Outcome::Rejected(r)) => r,
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[cfg(test)]
mod cancellation_tests {
    use super::*;

    #[test]
    fn test_cancel_rejects_with_cancellation_error() {
        let _guard = install(RuntimeConfig::manual());
        let p = never();
        p.cancel(Some("stop"));
        assert_eq!(p.state(), PromiseState::Pending);
        run_until_idle().unwrap();
        let err = reason(&p);
        assert!(err.is_cancellation());
        assert_eq!(err.as_error().unwrap().name(), "cancel");
        assert_eq!(err.as_error().unwrap().message(), "stop");
    }

    #[test]
    fn test_cancel_default_message_is_empty() {
        let _guard = install(RuntimeConfig::manual());
        let p = never();
        p.cancel(None);
        run_until_idle().unwrap();
        assert_eq!(reason(&p).as_error().unwrap().message(), "");
    }

    #[test]
    fn test_cancel_after_settlement_is_noop() {
        let _guard = install(RuntimeConfig::manual());
        let p = Promise::resolve("done");
        p.cancel(Some("late"));
        run_until_idle().unwrap();
        assert_eq!(p.outcome(), Some(Outcome::Fulfilled(Value::from("done"))));
    }

    #[test]
    fn test_cancel_propagates_up_single_child_chain() {
        let _guard = install(RuntimeConfig::manual());
        let root = never();
        let middle = root.then(identity(), Value::Undefined, Value::Undefined).unwrap();
        let leaf = middle.then(identity(), Value::Undefined, Value::Undefined).unwrap();
        leaf.cancel(Some("chain"));
        run_until_idle().unwrap();

        let err = reason(&root);
        assert!(err.is_cancellation());
        assert_eq!(reason(&middle), err);
        assert_eq!(reason(&leaf), err);
    }

    #[test]
    fn test_cancel_stops_at_fan_out() {
        let _guard = install(RuntimeConfig::manual());
        let root = never();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let cancelled = root
            .then(
                identity(),
                Function::unary(move |r| {
                    sink.borrow_mut().push(r.clone());
                    Err(r)
                }),
                Value::Undefined,
            )
            .unwrap();
        let sibling = root.then(identity(), Value::Undefined, Value::Undefined).unwrap();
        cancelled.cancel(Some("one branch"));
        run_until_idle().unwrap();

        assert!(root.is_pending());
        assert!(sibling.is_pending());
        assert!(reason(&cancelled).is_cancellation());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_then_always_does_not_count_as_child() {
        let _guard = install(RuntimeConfig::manual());
        let root = never();
        root.then_always(Function::new(|_, _| Ok(Value::Undefined)), Value::Undefined);
        let only_child = root.then(identity(), Value::Undefined, Value::Undefined).unwrap();
        only_child.cancel(None);
        run_until_idle().unwrap();
        assert!(reason(&root).is_cancellation());
    }

    #[test]
    fn test_on_rejected_can_recover_from_cancel() {
        let _guard = install(RuntimeConfig::manual());
        let root = never();
        let recovering = root
            .then(Value::Undefined, Function::unary(|_| Ok(Value::from("recovered"))), Value::Undefined)
            .unwrap();
        let leaf = recovering.then(identity(), Value::Undefined, Value::Undefined).unwrap();
        leaf.cancel(None);
        run_until_idle().unwrap();

        assert!(reason(&root).is_cancellation());
        assert_eq!(recovering.outcome(), Some(Outcome::Fulfilled(Value::from("recovered"))));
        assert_eq!(leaf.outcome(), Some(Outcome::Fulfilled(Value::from("recovered"))));
    }

    #[test]
    fn test_undefined_from_on_rejected_keeps_cancellation() {
        let _guard = install(RuntimeConfig::manual());
        let root = never();
        let child = root
            .then(Value::Undefined, Function::unary(|_| Ok(Value::Undefined)), Value::Undefined)
            .unwrap();
        child.cancel(None);
        run_until_idle().unwrap();
        assert!(reason(&child).is_cancellation());
        assert_eq!(reason(&child), reason(&root));
    }

    #[test]
    fn test_undefined_from_on_rejected_recovers_other_errors() {
        let _guard = install(RuntimeConfig::manual());
        let child = Promise::reject("plain")
            .then(Value::Undefined, Function::unary(|_| Ok(Value::Undefined)), Value::Undefined)
            .unwrap();
        run_until_idle().unwrap();
        assert_eq!(child.outcome(), Some(Outcome::Fulfilled(Value::Undefined)));
    }

    #[test]
    fn test_blocked_promise_cannot_be_cancelled() {
        let _guard = install(RuntimeConfig::manual());
        let source = Promise::with_resolver();
        let blocked = Promise::new(|resolve, _| resolve.call(&Value::Undefined, &[Value::Promise(source.promise().clone())]).map(drop));
        blocked.cancel(None);
        run_until_idle().unwrap();
        assert!(blocked.is_pending());

        source.resolve(1);
        run_until_idle().unwrap();
        assert_eq!(blocked.outcome(), Some(Outcome::Fulfilled(Value::from(1))));
    }

    #[test]
    fn test_cancel_with_settled_parent_detaches_child() {
        let _guard = install(RuntimeConfig::manual());
        let resolver = Promise::with_resolver();
        let parent = resolver.promise().clone();
        let hits = Rc::new(RefCell::new(0));
        let counter = hits.clone();
        let child = parent
            .then(
                Function::unary(move |v| {
                    *counter.borrow_mut() += 1;
                    Ok(v)
                }),
                Value::Undefined,
                Value::Undefined,
            )
            .unwrap();
        child.cancel(None);
        resolver.resolve(5);
        run_until_idle().unwrap();

        assert_eq!(parent.outcome(), Some(Outcome::Fulfilled(Value::from(5))));
        assert!(reason(&child).is_cancellation());
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn test_cancellation_is_never_reported() {
        let _guard = install(RuntimeConfig::manual());
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        set_unhandled_rejection_handler(move |r| sink.borrow_mut().push(r.clone()));

        let root = never();
        let child = root.then(identity(), Value::Undefined, Value::Undefined).unwrap();
        child.cancel(None);
        run_until_idle().unwrap();
        advance(Duration::from_secs(1)).unwrap();
        assert!(reason(&child).is_cancellation());
        assert!(reports.borrow().is_empty());
    }
}
