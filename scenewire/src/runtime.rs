//! Transport runtime: the dispatch thread and the socket state it drives.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                         dispatch thread
//!  ──────────────                         ───────────────
//!  Channel / AsyncOperation               Dispatcher (mio Poll)
//!    │  lock SocketCore, queue op           │  listeners, dialers, pipes
//!    │  Command ──► crossbeam queue ───────►│  timers (deadline, sleep, redial)
//!    └─ Waker::wake() ─────────────────────►│  completions + link events
//! ```
//!
//! Every completion handler, link event and timer runs on the one dispatch
//! thread owned by a [`Runtime`]. Callers never touch sockets directly; they
//! queue operations on the shared [`SocketCore`](socket::SocketCore) and poke
//! the dispatcher.
//!
//! # Lifecycle
//!
//! The runtime is an explicit context object: create one per process (or per
//! test) and pass it to every constructor. Handles are cheap clones. When the
//! last handle is dropped the dispatch thread closes all sockets, completes
//! outstanding operations with `Closed`, and exits; the dropping thread joins
//! it unless the drop happens on the dispatch thread itself.

pub(crate) mod commands;
pub(crate) mod dispatcher;
pub(crate) mod pipe;
pub(crate) mod socket;
pub(crate) mod wire;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::Sender;
use mio::{Poll, Waker};
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::trace::{debug, warn};

use commands::Command;
use dispatcher::{Dispatcher, WAKER_TOKEN};

pub use socket::{
    DEFAULT_RECONNECT_MIN, DEFAULT_RECV_BUFFER, DEFAULT_RECV_MAX_SIZE, DEFAULT_SEND_BUFFER,
};

const THREAD_NAME: &str = "scenewire-dispatch";

/// Handle to a running dispatch thread.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    commands: Sender<Command>,
    waker: Waker,
    thread: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Runtime {
    /// Spawns the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller cannot be created or the thread cannot
    /// be spawned.
    pub fn new() -> Result<Self, TransportError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatcher = Dispatcher::new(poll, rx);

        let handle = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || dispatcher.run())?;
        let thread = handle.thread().id();
        debug!("runtime started");

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                commands: tx,
                waker,
                thread,
                handle: Mutex::new(Some(handle)),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// `true` when called from this runtime's dispatch thread.
    #[must_use]
    pub fn on_dispatch_thread(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn submit(&self, command: Command) {
        self.inner.submit(command);
    }
}

impl RuntimeInner {
    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("dispatch thread is gone, command dropped");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake dispatch thread");
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.submit(Command::Shutdown);
        let Some(handle) = self.handle.get_mut().take() else {
            return;
        };
        if thread::current().id() == self.thread {
            // Dropped from inside a handler: the loop exits on its own.
            return;
        }
        if handle.join().is_err() {
            warn!("dispatch thread panicked");
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("dispatch_thread", &self.inner.thread)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_starts_and_stops() {
        let runtime = Runtime::new().unwrap();
        assert!(!runtime.on_dispatch_thread());
        let clone = runtime.clone();
        drop(runtime);
        assert_ne!(clone.next_id(), clone.next_id());
    }
}
