use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use thenable::*;

#[derive(clap::Parser)]
#[command(name = "thenable", version, about = "Run promise scenarios on a single-threaded event loop")]
struct Cli {
    /// Scenarios to run (all of them when omitted)
    #[arg(value_enum)]
    scenarios: Vec<Scenario>,

    /// Use a virtual clock: timers fire as soon as the loop is idle
    #[arg(long)]
    manual_clock: bool,

    /// Milliseconds before an unhandled rejection is reported (negative disables)
    #[arg(long, allow_hyphen_values = true)]
    unhandled_delay: Option<i64>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    Chain,
    All,
    Race,
    Cancel,
    Thenable,
    Unhandled,
}

impl Scenario {
    const EVERY: [Scenario; 6] = [
        Scenario::Chain,
        Scenario::All,
        Scenario::Race,
        Scenario::Cancel,
        Scenario::Thenable,
        Scenario::Unhandled,
    ];

    fn name(self) -> &'static str {
        match self {
            Scenario::Chain => "chain",
            Scenario::All => "all",
            Scenario::Race => "race",
            Scenario::Cancel => "cancel",
            Scenario::Thenable => "thenable",
            Scenario::Unhandled => "unhandled",
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn main() -> Result<(), BoxError> {
    // Initialize logger (controlled by RUST_LOG)
    env_logger::init();

    let cli = <Cli as clap::Parser>::parse();
    let mut config = RuntimeConfig::from_env();
    if cli.manual_clock {
        config = config.with_clock(ClockMode::Manual);
    }
    if let Some(ms) = cli.unhandled_delay {
        config = config.with_unhandled_rejection_delay(ms);
    }
    log::debug!("running with {config:?}");
    let _guard = install(config);

    let scenarios = if cli.scenarios.is_empty() { Scenario::EVERY.to_vec() } else { cli.scenarios };
    for scenario in scenarios {
        let report = run_scenario(scenario)?;
        let line = if cli.pretty { serde_json::to_string_pretty(&report)? } else { serde_json::to_string(&report)? };
        println!("{line}");
    }
    Ok(())
}

fn run_scenario(scenario: Scenario) -> Result<serde_json::Value, BoxError> {
    let started = scheduler::now();
    let outcome = match scenario {
        Scenario::Chain => block_on(&chain()?)?,
        Scenario::All => block_on(&Promise::all([after(30, "a"), after(10, "b"), Value::from("c")]))?,
        Scenario::Race => block_on(&Promise::race([after(30, "slow"), after(10, "fast")]))?,
        Scenario::Cancel => {
            let (_root, leaf) = cancelled_chain()?;
            block_on(&leaf)?
        }
        Scenario::Thenable => block_on(&Promise::resolve(foreign_thenable(3)))?,
        Scenario::Unhandled => unhandled()?,
    };
    let elapsed = scheduler::now().saturating_sub(started);
    Ok(serde_json::json!({
        "scenario": scenario.name(),
        "elapsed_ms": elapsed.as_millis() as u64,
        "outcome": outcome_json(&outcome),
    }))
}

fn outcome_json(outcome: &Outcome) -> serde_json::Value {
    match outcome {
        Outcome::Fulfilled(value) => serde_json::json!({ "status": "fulfilled", "value": value.to_json() }),
        Outcome::Rejected(reason) => serde_json::json!({ "status": "rejected", "reason": reason.to_json() }),
    }
}

/// A promise fulfilled with `value` after `ms` milliseconds.
fn after(ms: u64, value: &str) -> Value {
    let resolver = Resolver::new();
    let settle = resolver.clone();
    let value = Value::from(value);
    set_timeout(Duration::from_millis(ms), move || settle.resolve(value));
    Value::Promise(resolver.into_promise())
}

fn arithmetic(f: impl Fn(f64) -> Value + 'static) -> Function {
    Function::unary(move |v| match v.as_number() {
        Some(n) => Ok(f(n)),
        None => Err(Value::type_error(format!("expected a number, got {}", v.type_name()))),
    })
}

/// `new Promise(r => r(1)).then(v => v + 1).then(v => v === 2)`
fn chain() -> Result<Promise, PromiseError> {
    Promise::new(|resolve, _| resolve.call(&Value::Undefined, &[Value::from(1)]).map(drop))
        .then(arithmetic(|n| Value::from(n + 1.0)), Value::Undefined, Value::Undefined)?
        .then(arithmetic(|n| Value::from(n == 2.0)), Value::Undefined, Value::Undefined)
}

/// Three-link chain on a root that never settles by itself, cancelled from
/// the leaf. The root handle is returned so the chain stays linked.
fn cancelled_chain() -> Result<(Promise, Promise), PromiseError> {
    let root = Promise::new(|_, _| Ok(()));
    let leaf = root
        .then(arithmetic(|n| Value::from(n * 2.0)), Value::Undefined, Value::Undefined)?
        .then(arithmetic(|n| Value::from(n + 1.0)), Value::Undefined, Value::Undefined)?;
    leaf.cancel(Some("user abort"));
    Ok((root, leaf))
}

/// A plain object whose `then` fulfills with another such object, `depth` times.
fn foreign_thenable(depth: u32) -> Value {
    let obj = Object::new();
    obj.set(
        "then",
        Function::new(move |_this, args| {
            let next = if depth > 1 { foreign_thenable(depth - 1) } else { Value::from("bottom of the chain") };
            match args.first() {
                Some(Value::Function(resolve)) => resolve.call(&Value::Undefined, &[next]),
                _ => Ok(Value::Undefined),
            }
        }),
    );
    Value::Object(obj)
}

/// Reject with nobody listening and collect what the handler reports.
fn unhandled() -> Result<Outcome, BoxError> {
    let reports = Rc::new(RefCell::new(Vec::new()));
    let sink = reports.clone();
    set_unhandled_rejection_handler(move |reason| sink.borrow_mut().push(reason.clone()));
    let _ = Promise::reject(Value::error("nobody listens"));
    run()?;
    reset_unhandled_rejection_handler();
    let reports = std::mem::take(&mut *reports.borrow_mut());
    Ok(Outcome::Fulfilled(Value::from(reports)))
}
