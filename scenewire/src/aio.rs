//! Single-slot asynchronous operations.
//!
//! An [`AsyncOperation`] holds at most one outstanding send, read or sleep.
//! Its handler runs exactly once on the dispatch thread, unless the
//! operation is stopped first. Every arm bumps a generation counter, and
//! completions carrying an older generation are discarded.
//!
//! | Call | Blocks | Handler runs | Further arming |
//! |---|---|---|---|
//! | [`cancel`](AsyncOperation::cancel) | never | yes, with `Canceled` | allowed |
//! | [`stop`](AsyncOperation::stop) | until a running handler returns | no | silently ignored |
//! | [`wait`](AsyncOperation::wait) | until completion and handler return | n/a | n/a |

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::channel::protocol::{Receiving, Sending};
use crate::error::TransportError;
use crate::message::Message;
use crate::runtime::Runtime;
use crate::runtime::commands::Command;
use crate::runtime::socket::{PendingOp, SocketShared};
use crate::trace::{error, trace};

/// Boxed completion callback.
pub type Handler = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Result of one operation, handed to its handler.
///
/// A successful send carries an invalid message (it was consumed); a failed
/// send hands the original message back. A successful read carries the
/// received message; a failed read and a sleep carry an invalid one.
#[derive(Debug)]
pub struct Completion {
    result: Result<(), TransportError>,
    message: Message,
}

impl Completion {
    pub(crate) fn done() -> Self {
        Self {
            result: Ok(()),
            message: Message::invalid(),
        }
    }

    pub(crate) fn received(message: Message) -> Self {
        Self {
            result: Ok(()),
            message,
        }
    }

    pub(crate) fn failed(error: TransportError, message: Message) -> Self {
        Self {
            result: Err(error),
            message,
        }
    }

    #[must_use]
    pub const fn result(&self) -> &Result<(), TransportError> {
        &self.result
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    #[must_use]
    pub fn error(&self) -> Option<&TransportError> {
        self.result.as_ref().err()
    }

    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Splits into the status and the message.
    #[must_use]
    pub fn into_parts(self) -> (Result<(), TransportError>, Message) {
        (self.result, self.message)
    }

    /// Converts to `Ok(message)` or the error.
    ///
    /// # Errors
    ///
    /// Returns the operation's transport error.
    pub fn into_result(self) -> Result<Message, TransportError> {
        self.result.map(|()| self.message)
    }
}

struct AioState {
    generation: u64,
    outstanding: bool,
    /// Thread currently executing the handler.
    running: Option<ThreadId>,
    stopped: bool,
    handler: Option<Handler>,
    armed_on: Option<Arc<SocketShared>>,
}

pub(crate) struct AioShared {
    id: u64,
    state: Mutex<AioState>,
    idle: Condvar,
}

/// Reference to one armed generation of an operation, held by the dispatcher.
pub(crate) struct OpRef {
    aio: Arc<AioShared>,
    generation: u64,
}

impl OpRef {
    pub(crate) fn aio_id(&self) -> u64 {
        self.aio.id
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    /// Delivers the completion, unless this generation was stopped or
    /// superseded. Handler panics are caught and logged.
    pub(crate) fn complete(self, completion: Completion) {
        let handler = {
            let mut state = self.aio.state.lock();
            if state.generation != self.generation || !state.outstanding {
                trace!(aio = self.aio.id, "stale completion discarded");
                return;
            }
            state.outstanding = false;
            state.armed_on = None;
            let handler = state.handler.take();
            if handler.is_some() {
                state.running = Some(thread::current().id());
            }
            handler
        };

        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(move || handler(completion))).is_err() {
                error!(aio = self.aio.id, "completion handler panicked");
            }
            self.aio.state.lock().running = None;
        }
        self.aio.idle.notify_all();
    }
}

/// A reusable slot for one outstanding asynchronous operation.
pub struct AsyncOperation {
    shared: Arc<AioShared>,
    runtime: Runtime,
}

impl AsyncOperation {
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            shared: Arc::new(AioShared {
                id: runtime.next_id(),
                state: Mutex::new(AioState {
                    generation: 0,
                    outstanding: false,
                    running: None,
                    stopped: false,
                    handler: None,
                    armed_on: None,
                }),
                idle: Condvar::new(),
            }),
            runtime: runtime.clone(),
        }
    }

    /// Sends `message` on `channel`, honouring its send timeout.
    ///
    /// # Panics
    ///
    /// Panics if an operation is already outstanding on this slot.
    pub fn send<P: Sending>(
        &self,
        channel: &Channel<P>,
        message: Message,
        handler: impl FnOnce(Completion) + Send + 'static,
    ) {
        self.submit(channel.socket(), Transfer::Send(message), Box::new(handler));
    }

    /// Receives one message from `channel`, honouring its receive timeout.
    ///
    /// # Panics
    ///
    /// Panics if an operation is already outstanding on this slot.
    pub fn read<P: Receiving>(
        &self,
        channel: &Channel<P>,
        handler: impl FnOnce(Completion) + Send + 'static,
    ) {
        self.submit(channel.socket(), Transfer::Read, Box::new(handler));
    }

    /// Completes successfully after `duration`.
    ///
    /// # Panics
    ///
    /// Panics if an operation is already outstanding on this slot.
    pub fn sleep(&self, duration: Duration, handler: impl FnOnce(Completion) + Send + 'static) {
        let Some(op) = self.arm(None, Box::new(handler)) else {
            return;
        };
        self.runtime.submit(Command::Sleep {
            op,
            deadline: Instant::now() + duration,
        });
    }

    fn submit(&self, socket: &Arc<SocketShared>, transfer: Transfer, handler: Handler) {
        let Some(op) = self.arm(Some(Arc::clone(socket)), handler) else {
            return;
        };
        {
            let mut core = socket.core.lock();
            let pending = |message, timeout: Option<Duration>| PendingOp {
                op,
                message,
                deadline: timeout.map(|t| Instant::now() + t),
                timer_armed: false,
            };
            match transfer {
                Transfer::Send(message) => {
                    let op = pending(message, core.options.send_timeout);
                    core.sends.push_back(op);
                }
                Transfer::Read => {
                    let op = pending(Message::invalid(), core.options.recv_timeout);
                    core.reads.push_back(op);
                }
            }
        }
        self.runtime.submit(Command::Service(Arc::clone(socket)));
    }

    fn arm(&self, socket: Option<Arc<SocketShared>>, handler: Handler) -> Option<OpRef> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            drop(state);
            trace!(aio = self.shared.id, "operation stopped, handler dropped");
            return None;
        }
        assert!(
            !state.outstanding,
            "AsyncOperation already has an operation in flight"
        );
        state.generation += 1;
        state.outstanding = true;
        state.handler = Some(handler);
        state.armed_on = socket;
        Some(OpRef {
            aio: Arc::clone(&self.shared),
            generation: state.generation,
        })
    }

    /// Blocks until the outstanding operation completed and its handler
    /// returned. Returns immediately when nothing is outstanding.
    ///
    /// # Panics
    ///
    /// Panics when called on the dispatch thread, which would deadlock.
    pub fn wait(&self) {
        assert!(
            !self.runtime.on_dispatch_thread(),
            "AsyncOperation::wait called on the dispatch thread"
        );
        let mut state = self.shared.state.lock();
        while state.outstanding || state.running.is_some() {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Requests early completion with `Canceled`. Never blocks.
    pub fn cancel(&self) {
        let (socket, generation) = {
            let state = self.shared.state.lock();
            if !state.outstanding {
                return;
            }
            (state.armed_on.clone(), state.generation)
        };
        self.runtime.submit(Command::Cancel {
            socket,
            aio: self.shared.id,
            generation,
        });
    }

    /// Terminates the outstanding operation without running its handler and
    /// rejects all future arming. Blocks until a handler already executing on
    /// another thread has returned.
    ///
    /// # Panics
    ///
    /// Panics when called from inside this operation's own handler.
    pub fn stop(&self) {
        self.halt(true);
    }

    /// `stop` that tolerates being called from the operation's own handler.
    pub(crate) fn halt(&self, strict: bool) {
        let (handler, abort) = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            if state.outstanding {
                let generation = state.generation;
                state.generation += 1;
                state.outstanding = false;
                (
                    state.handler.take(),
                    Some((state.armed_on.take(), generation)),
                )
            } else {
                (None, None)
            }
        };
        drop(handler);
        if let Some((socket, generation)) = abort {
            self.runtime.submit(Command::Abort {
                socket,
                aio: self.shared.id,
                generation,
            });
        }

        let me = thread::current().id();
        let mut state = self.shared.state.lock();
        if state.running == Some(me) {
            drop(state);
            assert!(
                !strict,
                "AsyncOperation::stop called from inside its own handler"
            );
            return;
        }
        while state.running.is_some() {
            self.shared.idle.wait(&mut state);
        }
        drop(state);
        self.shared.idle.notify_all();
    }

    /// `true` while an operation is outstanding or its handler is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let state = self.shared.state.lock();
        state.outstanding || state.running.is_some()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }
}

impl Drop for AsyncOperation {
    fn drop(&mut self) {
        self.halt(false);
    }
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("AsyncOperation")
            .field("id", &self.shared.id)
            .field("generation", &state.generation)
            .field("outstanding", &state.outstanding)
            .field("stopped", &state.stopped)
            .finish_non_exhaustive()
    }
}

enum Transfer {
    Send(Message),
    Read,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crossbeam_channel::bounded;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn sleep_completes_and_wait_returns() {
        let runtime = Runtime::new().unwrap();
        let aio = AsyncOperation::new(&runtime);
        let (tx, rx) = bounded(1);
        aio.sleep(Duration::from_millis(10), move |c| {
            tx.send(c.is_ok()).unwrap();
        });
        aio.wait();
        assert!(!aio.is_busy());
        assert!(rx.recv_timeout(TIMEOUT).unwrap());
    }

    #[test]
    fn wait_without_operation_returns_immediately() {
        let runtime = Runtime::new().unwrap();
        let aio = AsyncOperation::new(&runtime);
        aio.wait();
        aio.stop();
        aio.wait();
    }

    #[test]
    #[should_panic(expected = "already has an operation in flight")]
    fn double_arm_panics() {
        let runtime = Runtime::new().unwrap();
        let aio = AsyncOperation::new(&runtime);
        aio.sleep(Duration::from_secs(60), |_| {});
        aio.sleep(Duration::from_secs(60), |_| {});
    }

    #[test]
    fn cancel_runs_handler_with_canceled() {
        let runtime = Runtime::new().unwrap();
        let aio = AsyncOperation::new(&runtime);
        let (tx, rx) = bounded(1);
        aio.sleep(Duration::from_secs(60), move |c| {
            tx.send(c.error().map(TransportError::code)).unwrap();
            assert!(!c.message().is_valid());
        });
        aio.cancel();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some(ErrorCode::Canceled));
        aio.wait();
    }

    #[test]
    fn stop_suppresses_handler_and_later_arming() {
        let runtime = Runtime::new().unwrap();
        let aio = AsyncOperation::new(&runtime);
        let (tx, rx) = bounded::<()>(2);
        let first = tx.clone();
        aio.sleep(Duration::from_millis(20), move |_| {
            first.send(()).unwrap();
        });
        aio.stop();
        aio.sleep(Duration::from_millis(1), move |_| {
            tx.send(()).unwrap();
        });
        assert!(aio.is_stopped());
        assert!(!aio.is_busy());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn handler_may_rearm_its_own_slot() {
        let runtime = Runtime::new().unwrap();
        let aio = Arc::new(AsyncOperation::new(&runtime));
        let (tx, rx) = bounded(2);
        let weak = Arc::downgrade(&aio);
        aio.sleep(Duration::from_millis(1), move |_| {
            let Some(aio) = weak.upgrade() else { return };
            let tx2 = tx.clone();
            tx.send(1).unwrap();
            aio.sleep(Duration::from_millis(1), move |_| {
                tx2.send(2).unwrap();
            });
        });
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 1);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 2);
    }

    #[test]
    fn panicking_handler_does_not_kill_dispatch_thread() {
        let runtime = Runtime::new().unwrap();
        let aio = AsyncOperation::new(&runtime);
        aio.sleep(Duration::from_millis(1), |_| panic!("handler failure"));
        aio.wait();

        let (tx, rx) = bounded(1);
        aio.sleep(Duration::from_millis(1), move |c| {
            tx.send(c.is_ok()).unwrap();
        });
        assert!(rx.recv_timeout(TIMEOUT).unwrap());
    }

    #[test]
    fn stop_from_own_handler_panics_but_drop_is_tolerated() {
        let runtime = Runtime::new().unwrap();
        let slot: Arc<Mutex<Option<AsyncOperation>>> =
            Arc::new(Mutex::new(Some(AsyncOperation::new(&runtime))));
        let (tx, rx) = bounded(1);
        let inner = Arc::clone(&slot);
        if let Some(aio) = slot.lock().as_ref() {
            aio.sleep(Duration::from_millis(1), move |_| {
                let taken = inner.lock().take();
                let strict = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    if let Some(aio) = taken.as_ref() {
                        aio.stop();
                    }
                }));
                // Dropping from inside the handler must not deadlock.
                drop(taken);
                tx.send(strict.is_err()).unwrap();
            });
        }
        assert!(rx.recv_timeout(TIMEOUT).unwrap());
    }
}
