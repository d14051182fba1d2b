//! Protocol-typed messaging channels.
//!
//! A [`Channel<P>`] is one socket of protocol `P`. It can listen and dial any
//! number of addresses; every established connection is a *link*. The
//! protocol parameter decides at compile time which half of the API exists:
//!
//! ```no_run
//! use scenewire::channel::{Channel, Pull, Push};
//! use scenewire::net::Address;
//! use scenewire::runtime::Runtime;
//!
//! # fn main() -> Result<(), scenewire::error::TransportError> {
//! let runtime = Runtime::new()?;
//! let pull = Channel::<Pull>::open(&runtime);
//! let address = pull.listen(&Address::localhost(0))?;
//!
//! let push = Channel::<Push>::open(&runtime);
//! push.dial(&address)?;
//! push.send("hello".into())?;
//! assert_eq!(pull.read()?.body(), b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! Every channel also owns one internal [`AsyncOperation`] slot used by
//! [`async_send`](Channel::async_send) / [`async_read`](Channel::async_read);
//! [`cancel`](Channel::cancel), [`stop`](Channel::stop) and
//! [`wait`](Channel::wait) act on that slot. Dropping the channel stops the
//! slot, then closes the socket.

pub mod options;
pub mod protocol;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::aio::{AsyncOperation, Completion};
use crate::error::TransportError;
use crate::events::ConnectionEventNotifier;
use crate::message::Message;
use crate::net::Address;
use crate::net::stream::Listener;
use crate::runtime::Runtime;
use crate::runtime::commands::Command;
use crate::runtime::socket::{Placement, SocketShared};
use crate::trace::debug;

pub use options::ChannelOption;
pub use protocol::{
    Protocol, ProtocolKind, Pub, Pull, Push, Receiving, Rep, Req, Sending, Sub, Subscribing,
};

/// A socket speaking protocol `P`.
pub struct Channel<P: Protocol> {
    runtime: Runtime,
    socket: Arc<SocketShared>,
    aio: AsyncOperation,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> Channel<P> {
    /// Opens a new channel on `runtime`. No links exist until it listens or dials.
    #[must_use]
    pub fn open(runtime: &Runtime) -> Self {
        let socket = Arc::new(SocketShared::new(runtime.next_id(), P::KIND));
        runtime.submit(Command::Register(Arc::clone(&socket)));
        debug!(socket = socket.id, protocol = %P::KIND, "channel opened");
        Self {
            runtime: runtime.clone(),
            socket,
            aio: AsyncOperation::new(runtime),
            _protocol: PhantomData,
        }
    }

    /// Connects to `address` in the background.
    ///
    /// Returns immediately; failed or lost connections are retried under the
    /// reconnect policy until the channel is closed.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the channel has been closed.
    pub fn dial(&self, address: &Address) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.runtime.submit(Command::Dial {
            socket: Arc::clone(&self.socket),
            address: address.clone(),
        });
        Ok(())
    }

    /// Binds `address` and accepts links on it.
    ///
    /// Returns the bound address, which differs from `address` when an
    /// ephemeral TCP port (0) was requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g. `AddressInUse`).
    pub fn listen(&self, address: &Address) -> Result<Address, TransportError> {
        self.ensure_open()?;
        let listener = Listener::bind(address)?;
        let bound = listener.local_address()?;
        debug!(socket = self.socket.id, address = %bound, "listening");
        self.runtime.submit(Command::Listen {
            socket: Arc::clone(&self.socket),
            listener,
        });
        Ok(bound)
    }

    /// Applies a typed option.
    ///
    /// # Errors
    ///
    /// Returns `Closed` on a closed channel, `NotFound` when unsubscribing an
    /// unknown topic.
    pub fn set_option<O: ChannelOption<P>>(&self, option: O) -> Result<(), TransportError> {
        let mut core = self.socket.core.lock();
        if core.closed {
            return Err(TransportError::closed());
        }
        core.apply(option.into_value())
    }

    /// Link-up / link-down notifications for this channel.
    #[must_use]
    pub fn events(&self) -> &ConnectionEventNotifier {
        &self.socket.events
    }

    /// Number of established links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.socket.core.lock().links.len()
    }

    /// Cancels the operation on the internal slot (non-blocking).
    pub fn cancel(&self) {
        self.aio.cancel();
    }

    /// Stops the internal slot; see [`AsyncOperation::stop`].
    pub fn stop(&self) {
        self.aio.stop();
    }

    /// Waits for the internal slot; see [`AsyncOperation::wait`].
    pub fn wait(&self) {
        self.aio.wait();
    }

    /// `true` while an `async_send`/`async_read` is outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.aio.is_busy()
    }

    /// Closes the channel. Equivalent to dropping it.
    pub fn close(self) {
        drop(self);
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) const fn socket(&self) -> &Arc<SocketShared> {
        &self.socket
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.socket.core.lock().closed {
            Err(TransportError::closed())
        } else {
            Ok(())
        }
    }

    fn blocking(&self, arm: impl FnOnce(&AsyncOperation, crate::aio::Handler)) -> Completion {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let op = AsyncOperation::new(&self.runtime);
        arm(
            &op,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        );
        op.wait();
        rx.try_recv().unwrap_or_else(|_| {
            Completion::failed(TransportError::closed(), Message::invalid())
        })
    }
}

impl<P: Sending> Channel<P> {
    /// Sends `message`, blocking until it is queued on a link or the send
    /// timeout expires.
    ///
    /// # Errors
    ///
    /// `TimedOut` when no link could accept it in time, `Closed` after close,
    /// `State` for a `Rep` with no request to answer.
    ///
    /// # Panics
    ///
    /// Panics when called on the dispatch thread.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.blocking(|op, handler| op.send(self, message, handler))
            .into_result()
            .map(drop)
    }

    /// Queues `message` only if a link can take it right now.
    ///
    /// Returns `Ok(false)` (and drops the message) when nothing can accept it.
    ///
    /// # Errors
    ///
    /// `Closed` after close, `InvalidArgument` for an invalid message.
    pub fn try_send(&self, message: Message) -> Result<bool, TransportError> {
        let accepted = {
            let mut core = self.socket.core.lock();
            if core.closed {
                return Err(TransportError::closed());
            }
            if !core.sends.is_empty() {
                false
            } else {
                match core.place(message) {
                    Placement::Queued | Placement::Dropped => true,
                    Placement::Blocked(_) => false,
                    Placement::Failed(err, _) => return Err(err),
                }
            }
        };
        if accepted {
            self.runtime.submit(Command::Service(Arc::clone(&self.socket)));
        }
        Ok(accepted)
    }

    /// Sends on the internal slot; `handler` runs on the dispatch thread.
    ///
    /// # Panics
    ///
    /// Panics if the internal slot already has an operation in flight.
    pub fn async_send(&self, message: Message, handler: impl FnOnce(Completion) + Send + 'static) {
        self.aio.send(self, message, handler);
    }
}

impl<P: Receiving> Channel<P> {
    /// Blocks until a message arrives or the receive timeout expires.
    ///
    /// # Errors
    ///
    /// `TimedOut`, or `Closed` after close.
    ///
    /// # Panics
    ///
    /// Panics when called on the dispatch thread.
    pub fn read(&self) -> Result<Message, TransportError> {
        self.blocking(|op, handler| op.read(self, handler))
            .into_result()
    }

    /// Takes a received message if one is queued.
    ///
    /// # Errors
    ///
    /// `Closed` after close.
    pub fn try_read(&self) -> Result<Option<Message>, TransportError> {
        let message = {
            let mut core = self.socket.core.lock();
            if core.closed {
                return Err(TransportError::closed());
            }
            if core.reads.is_empty() {
                core.pop_inbound()
            } else {
                None
            }
        };
        if message.is_some() {
            // Paused links may resume now that the queue has room.
            self.runtime.submit(Command::Service(Arc::clone(&self.socket)));
        }
        Ok(message)
    }

    /// Reads on the internal slot; `handler` runs on the dispatch thread.
    ///
    /// # Panics
    ///
    /// Panics if the internal slot already has an operation in flight.
    pub fn async_read(&self, handler: impl FnOnce(Completion) + Send + 'static) {
        self.aio.read(self, handler);
    }
}

impl<P: Protocol> Drop for Channel<P> {
    fn drop(&mut self) {
        self.aio.halt(false);
        self.socket.events.clear();
        self.runtime.submit(Command::Close(Arc::clone(&self.socket)));
    }
}

impl<P: Protocol> fmt::Debug for Channel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("protocol", &P::KIND)
            .field("socket", &self.socket.id)
            .finish_non_exhaustive()
    }
}
