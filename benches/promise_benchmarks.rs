use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use thenable::{Function, Object, Promise, RuntimeConfig, Value, install, run_until_idle};

// cargo bench --profile dev

// Initialize logger for benchmark so `RUST_LOG` is honored.
#[ctor::ctor]
fn __init_bench_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default()).try_init();
}

fn add_one() -> Function {
    Function::unary(|v| Ok(Value::from(v.as_number().unwrap_or_default() + 1.0)))
}

fn benchmark_promise_operations(c: &mut Criterion) {
    let _guard = install(RuntimeConfig::manual().with_unhandled_rejection_delay(-1));

    c.bench_function("promise_basic_resolution", |b| {
        b.iter(|| {
            let p = Promise::new(|resolve, _| resolve.call(&Value::Undefined, &[Value::from(42)]).map(drop));
            let child = p.then(add_one(), Value::Undefined, Value::Undefined).unwrap();
            run_until_idle().unwrap();
            black_box(child.outcome())
        })
    });

    c.bench_function("promise_chaining", |b| {
        b.iter(|| {
            let mut p = Promise::resolve(1);
            for _ in 0..4 {
                p = p.then(add_one(), Value::Undefined, Value::Undefined).unwrap();
            }
            run_until_idle().unwrap();
            black_box(p.outcome())
        })
    });

    c.bench_function("promise_rejection_catch", |b| {
        b.iter(|| {
            let caught = Promise::reject("error").then_catch(Function::unary(Ok), Value::Undefined);
            run_until_idle().unwrap();
            black_box(caught.outcome())
        })
    });

    c.bench_function("promise_all_multiple", |b| {
        b.iter(|| {
            let inputs = (0..16).map(|i| Value::Promise(Promise::resolve(i)));
            let all = Promise::all(inputs);
            run_until_idle().unwrap();
            black_box(all.outcome())
        })
    });

    c.bench_function("promise_race", |b| {
        b.iter(|| {
            let race = Promise::race([Value::from(1), Value::Promise(Promise::resolve(2))]);
            run_until_idle().unwrap();
            black_box(race.outcome())
        })
    });

    c.bench_function("foreign_thenable_adoption", |b| {
        b.iter(|| {
            let obj = Object::new();
            obj.set(
                "then",
                Function::new(|_this, args| match args.first() {
                    Some(Value::Function(resolve)) => resolve.call(&Value::Undefined, &[Value::from(7)]),
                    _ => Ok(Value::Undefined),
                }),
            );
            let p = Promise::resolve(Value::Object(obj));
            run_until_idle().unwrap();
            black_box(p.outcome())
        })
    });

    c.bench_function("cancel_single_child_chain", |b| {
        b.iter(|| {
            let root = Promise::new(|_, _| Ok(()));
            let mut leaf = root.clone();
            for _ in 0..8 {
                leaf = leaf.then(add_one(), Value::Undefined, Value::Undefined).unwrap();
            }
            leaf.cancel(None);
            run_until_idle().unwrap();
            black_box(root.outcome())
        })
    });
}

criterion_group!(benches, benchmark_promise_operations);
criterion_main!(benches);
