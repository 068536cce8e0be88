use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::Arc;
use std::time::Duration;

/// A task posted from another thread. It runs on the event loop's thread.
pub type RemoteTask = Box<dyn FnOnce() + Send>;

/// `Send` handle through which other threads feed work into a thread's event
/// loop, e.g. an I/O worker resolving a promise once its result is ready.
///
/// While any handle is alive, [`crate::scheduler::run`] and
/// [`crate::scheduler::block_on`] keep waiting for posts instead of treating
/// the loop as finished.
#[derive(Clone)]
pub struct RemoteHandle {
    tx: Sender<RemoteTask>,
    _live: Arc<()>,
}

impl RemoteHandle {
    /// Queue `task` on the owning loop. Returns `false` if that loop is gone.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.send(Box::new(task)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("dropping remote task: event loop is gone ({e})");
                false
            }
        }
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle").finish_non_exhaustive()
    }
}

/// Receiving side, owned by the event loop.
pub(crate) struct Mailbox {
    tx: Sender<RemoteTask>,
    rx: Receiver<RemoteTask>,
    live: Arc<()>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded::<RemoteTask>();
        Mailbox {
            tx,
            rx,
            live: Arc::new(()),
        }
    }

    pub(crate) fn handle(&self) -> RemoteHandle {
        RemoteHandle {
            tx: self.tx.clone(),
            _live: Arc::clone(&self.live),
        }
    }

    pub(crate) fn has_live_handles(&self) -> bool {
        Arc::strong_count(&self.live) > 1
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    pub(crate) fn receiver(&self) -> Receiver<RemoteTask> {
        self.rx.clone()
    }

    pub(crate) fn try_recv(&self) -> Option<RemoteTask> {
        self.rx.try_recv().ok()
    }
}

/// Block for at most `timeout` waiting for a post.
pub(crate) fn wait_for_post(rx: &Receiver<RemoteTask>, timeout: Duration) -> Option<RemoteTask> {
    match rx.recv_timeout(timeout) {
        Ok(task) => Some(task),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => {
            // The mailbox keeps its own sender, so this only happens while the
            // loop is being torn down.
            log::trace!("remote channel disconnected");
            None
        }
    }
}
