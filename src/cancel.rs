use crate::promise::{Outcome, Promise};
use crate::value::Value;

/// Propagate a cancellation starting at `promise`.
///
/// Walks upward while the current promise is the only child of a still
/// pending parent, then either rejects the topmost promise reached (it has
/// no parent) or detaches the current promise from a parent that has other
/// children or already settled and runs its entry with `err`. Runs as a
/// loop so arbitrarily long chains do not grow the stack.
pub(crate) fn cancel_internal(promise: &Promise, err: Value) {
    let mut current = promise.clone();
    loop {
        if !current.is_strictly_pending() {
            log::trace!("cancel: promise #{} is no longer pending", current.id());
            return;
        }
        let Some(parent) = current.take_parent() else {
            log::debug!("cancel: rejecting promise #{} with {err}", current.id());
            current.settle(Outcome::Rejected(err));
            return;
        };
        let Some((index, children)) = parent.find_child_entry(&current) else {
            return;
        };
        if parent.is_strictly_pending() && children == 1 {
            current = parent;
            continue;
        }
        log::debug!("cancel: detaching promise #{} from promise #{}", current.id(), parent.id());
        if let Some(entry) = parent.remove_entry(index) {
            parent.execute_callback(entry, &Outcome::Rejected(err));
        }
        return;
    }
}
