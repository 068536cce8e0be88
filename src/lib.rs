pub(crate) mod cancel;
pub(crate) mod combinators;
pub mod config;
pub(crate) mod error;
pub(crate) mod promise;
pub(crate) mod remote;
pub(crate) mod resolver;
pub mod scheduler;
pub(crate) mod thenable;
pub(crate) mod unhandled;
pub(crate) mod value;

pub use config::{ClockMode, RuntimeConfig};
pub use error::PromiseError;
pub use promise::{Outcome, Promise, PromiseState};
pub use remote::{RemoteHandle, RemoteTask};
pub use resolver::Resolver;
pub use scheduler::{TimerId, advance, block_on, clear_timeout, enqueue, install, run, run_until_idle, set_timeout};
pub use thenable::{Thenable, is_thenable};
pub use unhandled::{reset_unhandled_rejection_handler, set_unhandled_rejection_delay, set_unhandled_rejection_handler, unhandled_rejection_delay};
pub use value::{ErrorKind, ErrorValue, Function, NativeFn, Object, Property, Value};
