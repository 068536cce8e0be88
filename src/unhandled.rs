//! Unhandled-rejection monitor.
//!
//! A promise rejected while nothing in its entry list observes rejections is
//! flagged and a timer is armed on the event loop. Attaching a `then`,
//! `then_catch`, or `then_void` with a rejection handler before the timer
//! fires clears the flag (on the promise and on every flagged ancestor).
//! Otherwise the timer hands the reason to the handler, exactly once.
//! Cancellation errors are never reported.

use crate::promise::Promise;
use crate::scheduler::{self, with_loop};
use crate::value::Value;
use std::rc::Rc;
use std::time::Duration;

pub(crate) type RejectionHandler = Rc<dyn Fn(&Value)>;

pub(crate) fn default_handler() -> RejectionHandler {
    Rc::new(|reason: &Value| log::error!("Unhandled promise rejection: {reason}"))
}

/// Replace the current thread's unhandled-rejection handler.
pub fn set_unhandled_rejection_handler<F>(handler: F)
where
    F: Fn(&Value) + 'static,
{
    let handler: RejectionHandler = Rc::new(handler);
    with_loop(|l| l.rejection_handler = handler);
}

/// Go back to logging unhandled rejections at `error` level.
pub fn reset_unhandled_rejection_handler() {
    with_loop(|l| l.rejection_handler = default_handler());
}

/// Milliseconds to wait before reporting. Negative disables reporting; it
/// only affects rejections that happen after the call.
pub fn set_unhandled_rejection_delay(ms: i64) {
    log::debug!("unhandled rejection delay set to {ms}ms");
    with_loop(|l| l.unhandled_rejection_delay = ms);
}

pub fn unhandled_rejection_delay() -> i64 {
    with_loop(|l| l.unhandled_rejection_delay)
}

/// Hand `reason` to the installed handler.
pub(crate) fn report(reason: &Value) {
    let handler = with_loop(|l| l.rejection_handler.clone());
    log::debug!("reporting unhandled rejection: {reason}");
    handler(reason);
}

/// Flag `promise` and schedule the report.
pub(crate) fn arm(promise: &Promise, reason: Value) {
    let delay = unhandled_rejection_delay();
    if delay < 0 {
        promise.mark_unhandled(None);
        return;
    }
    let target = promise.clone();
    let timer = scheduler::set_timeout(Duration::from_millis(delay.unsigned_abs()), move || {
        if target.clear_unhandled().is_some() {
            report(&reason);
        }
    });
    log::trace!("promise #{} rejected with no handler; report in {delay}ms", promise.id());
    promise.mark_unhandled(Some(timer));
}

/// A rejection handler was attached to `promise`: clear its flag and those
/// of its flagged ancestors.
pub(crate) fn disarm(promise: &Promise) {
    let mut current = Some(promise.clone());
    while let Some(p) = current {
        let Some(timer) = p.clear_unhandled() else {
            break;
        };
        if let Some(timer) = timer {
            scheduler::clear_timeout(timer);
        }
        log::trace!("promise #{} rejection is now handled", p.id());
        current = p.parent();
    }
}
