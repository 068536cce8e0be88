//! # Event loop
//!
//! Every continuation in this crate runs "later": after the synchronous code
//! that caused it has returned. The loop lives in thread-local storage, one
//! per thread, and owns:
//!
//! 1. **Task queue**: FIFO of boxed closures. Promise callbacks land here.
//! 2. **Timers**: a min-heap of `(deadline, id)`. A timer only fires when the
//!    task queue is empty, and every fired timer is followed by a full drain
//!    of the task queue.
//! 3. **Clock**: wall clock, or a manual clock that only moves when
//!    [`advance`] is called. Tests use the manual clock.
//! 4. **Mailbox**: a channel through which other threads post work
//!    (see [`RemoteHandle`]).
//! 5. **Unhandled-rejection settings**: the reporting delay and handler.
//!
//! Nothing here drives itself. Callers pump the loop with [`run_until_idle`],
//! [`advance`], [`run`] or [`block_on`].

use crate::config::{ClockMode, RuntimeConfig};
use crate::error::PromiseError;
use crate::promise::{Outcome, Promise};
use crate::remote::{self, Mailbox, RemoteHandle, RemoteTask};
use crate::unhandled::{self, RejectionHandler};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce()>;

/// Longest single blocking wait while only remote handles can make progress.
/// Waiting in slices lets the loop notice that the last handle was dropped.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

enum Clock {
    System { origin: Instant },
    Manual { now: Duration },
}

impl Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::System { origin } => origin.elapsed(),
            Clock::Manual { now } => *now,
        }
    }
}

pub(crate) struct EventLoop {
    tasks: VecDeque<Task>,
    // Ids grow monotonically, so equal deadlines fire in scheduling order.
    timers: BinaryHeap<Reverse<(Duration, u64)>>,
    timer_callbacks: HashMap<u64, Task>,
    next_timer_id: u64,
    clock: Clock,
    mailbox: Mailbox,
    running: bool,
    pub(crate) unhandled_rejection_delay: i64,
    pub(crate) rejection_handler: RejectionHandler,
}

impl EventLoop {
    fn new(config: RuntimeConfig) -> Self {
        let clock = match config.clock {
            ClockMode::System => Clock::System { origin: Instant::now() },
            ClockMode::Manual => Clock::Manual { now: Duration::ZERO },
        };
        log::debug!("new event loop: {config:?}");
        EventLoop {
            tasks: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_callbacks: HashMap::new(),
            next_timer_id: 1,
            clock,
            mailbox: Mailbox::new(),
            running: false,
            unhandled_rejection_delay: config.unhandled_rejection_delay,
            rejection_handler: unhandled::default_handler(),
        }
    }

    /// Earliest live deadline, discarding heap entries of cleared timers.
    fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if self.timer_callbacks.contains_key(&id) {
                return Some(deadline);
            }
            self.timers.pop();
        }
        None
    }

    fn pop_due_timer(&mut self, now: Duration) -> Option<Task> {
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if deadline > now {
                return None;
            }
            self.timers.pop();
            if let Some(callback) = self.timer_callbacks.remove(&id) {
                log::trace!("timer {id} fired (deadline {deadline:?})");
                return Some(callback);
            }
        }
        None
    }
}

thread_local! {
    /// The event loop of the current thread. Configured from the environment
    /// on first use; [`install`] swaps in a different one.
    static EVENT_LOOP: RefCell<EventLoop> = RefCell::new(EventLoop::new(RuntimeConfig::from_env()));
}

pub(crate) fn with_loop<R>(f: impl FnOnce(&mut EventLoop) -> R) -> R {
    EVENT_LOOP.with(|l| f(&mut l.borrow_mut()))
}

/// Queue `task` to run after the current synchronous turn.
pub fn enqueue<F>(task: F)
where
    F: FnOnce() + 'static,
{
    with_loop(|l| {
        l.tasks.push_back(Box::new(task));
        log::trace!("enqueue: queue_len={}", l.tasks.len());
    });
}

/// Run `task` once `delay` has elapsed on the loop's clock.
pub fn set_timeout<F>(delay: Duration, task: F) -> TimerId
where
    F: FnOnce() + 'static,
{
    with_loop(|l| {
        let id = l.next_timer_id;
        l.next_timer_id += 1;
        let deadline = l.clock.now() + delay;
        l.timers.push(Reverse((deadline, id)));
        l.timer_callbacks.insert(id, Box::new(task));
        log::trace!("set_timeout: id={id} delay={delay:?}");
        TimerId(id)
    })
}

/// Cancel a timer. Returns `false` if it already fired or was cleared.
pub fn clear_timeout(id: TimerId) -> bool {
    // Dropped after the loop borrow ends: the closure may own promises.
    let removed = with_loop(|l| l.timer_callbacks.remove(&id.0));
    removed.is_some()
}

/// Current time on the loop's clock, measured from the loop's creation.
pub fn now() -> Duration {
    with_loop(|l| l.clock.now())
}

pub fn pending_tasks() -> usize {
    with_loop(|l| l.tasks.len())
}

pub fn pending_timers() -> usize {
    with_loop(|l| l.timer_callbacks.len())
}

/// A handle other threads can use to post work to this thread's loop.
pub fn remote_handle() -> RemoteHandle {
    with_loop(|l| l.mailbox.handle())
}

/// Restores the previously installed event loop when dropped.
#[must_use = "dropping the guard immediately restores the previous event loop"]
pub struct LoopGuard {
    previous: Option<EventLoop>,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let discarded = EVENT_LOOP.with(|l| std::mem::replace(&mut *l.borrow_mut(), previous));
            log::debug!(
                "restoring previous event loop ({} tasks, {} timers discarded)",
                discarded.tasks.len(),
                discarded.timer_callbacks.len()
            );
            drop(discarded);
        }
    }
}

/// Replace this thread's event loop with a fresh one built from `config`.
/// Queued tasks, timers, and the unhandled-rejection handler all start
/// empty/default; the old loop comes back when the guard drops.
pub fn install(config: RuntimeConfig) -> LoopGuard {
    let fresh = EventLoop::new(config);
    let previous = EVENT_LOOP.with(|l| std::mem::replace(&mut *l.borrow_mut(), fresh));
    LoopGuard {
        previous: Some(previous),
        _not_send: PhantomData,
    }
}

struct RunGuard;

impl RunGuard {
    fn enter() -> Result<RunGuard, PromiseError> {
        with_loop(|l| {
            if l.running {
                return Err(PromiseError::Reentrant);
            }
            l.running = true;
            Ok(RunGuard)
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        with_loop(|l| l.running = false);
    }
}

fn pop_task() -> Option<Task> {
    with_loop(|l| {
        if let Some(post) = l.mailbox.try_recv() {
            l.tasks.push_back(post);
        }
        l.tasks.pop_front()
    })
}

/// Run every task and every timer due at or before `until`.
fn pump(until: Duration) {
    loop {
        while let Some(task) = pop_task() {
            task();
        }
        let timer = with_loop(|l| l.pop_due_timer(until));
        match timer {
            Some(callback) => callback(),
            None => break,
        }
    }
}

enum Idle {
    /// A remote post arrived after the last pump.
    Posted,
    /// A timer is pending; this is its deadline.
    Timer(Duration),
    /// Only remote posts can make progress.
    Remote,
    /// Nothing can ever happen again.
    Done,
}

fn idle_state() -> Idle {
    with_loop(|l| {
        if l.mailbox.has_pending() {
            return Idle::Posted;
        }
        match l.next_deadline() {
            Some(deadline) => Idle::Timer(deadline),
            None if l.mailbox.has_live_handles() => Idle::Remote,
            None => Idle::Done,
        }
    })
}

/// Let time pass until `deadline` (or `IDLE_POLL` when `None`), or until a
/// remote post arrives, whichever comes first.
fn wait_until(deadline: Option<Duration>) {
    let (manual, now, rx) = with_loop(|l| (matches!(l.clock, Clock::Manual { .. }), l.clock.now(), l.mailbox.receiver()));
    match (manual, deadline) {
        (true, Some(deadline)) => with_loop(|l| {
            if let Clock::Manual { now } = &mut l.clock {
                *now = (*now).max(deadline);
            }
        }),
        _ => {
            let timeout = deadline.map_or(IDLE_POLL, |d| d.saturating_sub(now));
            if let Some(post) = remote::wait_for_post(&rx, timeout) {
                enqueue_remote(post);
            }
        }
    }
}

fn enqueue_remote(post: RemoteTask) {
    with_loop(|l| l.tasks.push_back(post));
}

/// Run everything that is due right now. Never blocks and never moves a
/// manual clock.
pub fn run_until_idle() -> Result<(), PromiseError> {
    let _running = RunGuard::enter()?;
    pump(now());
    Ok(())
}

/// Let `duration` pass on the loop's clock, firing timers in deadline order.
/// On a manual clock this is instantaneous; on the system clock it sleeps.
pub fn advance(duration: Duration) -> Result<(), PromiseError> {
    let _running = RunGuard::enter()?;
    let target = now() + duration;
    loop {
        pump(now().min(target));
        if now() >= target {
            break;
        }
        let next = match idle_state() {
            Idle::Posted => continue,
            Idle::Timer(deadline) => deadline.min(target),
            Idle::Remote | Idle::Done => target,
        };
        wait_until(Some(next));
    }
    pump(target);
    Ok(())
}

/// Run until there is no queued task, no pending timer and no live
/// [`RemoteHandle`] left.
pub fn run() -> Result<(), PromiseError> {
    let _running = RunGuard::enter()?;
    loop {
        pump(now());
        match idle_state() {
            Idle::Posted => {}
            Idle::Timer(deadline) => wait_until(Some(deadline)),
            Idle::Remote => wait_until(None),
            Idle::Done => break,
        }
    }
    Ok(())
}

/// Drive the loop until `promise` settles and return its outcome.
///
/// Fails with [`PromiseError::Stalled`] when the promise is still pending but
/// nothing queued, timed or remote could ever settle it.
pub fn block_on(promise: &Promise) -> Result<Outcome, PromiseError> {
    let _running = RunGuard::enter()?;
    loop {
        pump(now());
        if let Some(outcome) = promise.outcome() {
            return Ok(outcome);
        }
        match idle_state() {
            Idle::Posted => {}
            Idle::Timer(deadline) => wait_until(Some(deadline)),
            Idle::Remote => wait_until(None),
            Idle::Done => {
                log::debug!("block_on: promise #{} can no longer settle", promise.id());
                return Err(PromiseError::Stalled { id: promise.id() });
            }
        }
    }
}
