//! Scene broadcast: the coordinator fans aggregated state out to monitors.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aio::Completion;
use crate::channel::options::{RecvMaxSize, Subscribe};
use crate::channel::{Channel, Pub, Sub};
use crate::codec::{CodecError, Wire, decode, encode};
use crate::config::SubscriberConfig;
use crate::control::ConnectionId;
use crate::error::TransportError;
use crate::message::Message;
use crate::net::Address;
use crate::runtime::Runtime;
use crate::trace::{debug, info, trace, warn};

/// One session's contribution to the aggregated scene.
///
/// `details` and `metadata` are the opaque payloads the input instance sent;
/// this crate does not interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneEntry {
    pub id: ConnectionId,
    pub details: Option<Vec<u8>>,
    pub metadata: Option<Vec<u8>>,
}

/// Lifecycle of a [`SceneSubscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Idle,
    Reading,
    /// Shutdown requested; the next completion closes the channel.
    Cancelled,
    Closed,
}

type Dispatch = Box<dyn FnMut(&Message) + Send>;

/// Receives every scene broadcast and hands it to a callback.
///
/// The read loop runs entirely on the dispatch thread: read, decode, call the
/// handler, read again. Payloads that fail to decode are logged and skipped.
pub struct SceneSubscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    address: Address,
    reader: Mutex<Reader>,
    dispatch: Mutex<Dispatch>,
}

struct Reader {
    state: SubscriptionState,
    channel: Option<Channel<Sub>>,
}

impl SceneSubscriber {
    /// Subscribes to everything broadcast at `address` and starts the loop.
    ///
    /// `handler` runs on the dispatch thread for each decoded scene.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be configured or dialed.
    pub fn start<T: Wire + 'static>(
        runtime: &Runtime,
        config: &SubscriberConfig,
        address: &Address,
        mut handler: impl FnMut(T) + Send + 'static,
    ) -> Result<Self, TransportError> {
        let channel = Channel::<Sub>::open(runtime);
        config.channel.apply(&channel)?;
        channel.set_option(RecvMaxSize(config.recv_max_size))?;
        // Nothing is delivered until at least one topic is subscribed.
        channel.set_option(Subscribe::all())?;
        channel.dial(address)?;

        let dispatch: Dispatch = Box::new(move |message| match decode::<T>(message) {
            Ok(scene) => handler(scene),
            Err(e) => warn!(error = %e, "discarding undecodable scene"),
        });
        let inner = Arc::new(SubscriberInner {
            address: address.clone(),
            reader: Mutex::new(Reader {
                state: SubscriptionState::Idle,
                channel: Some(channel),
            }),
            dispatch: Mutex::new(dispatch),
        });
        inner.arm_read(&mut inner.reader.lock());
        info!(%address, "scene subscriber started");
        Ok(Self { inner })
    }

    /// Requests the loop to end without blocking.
    ///
    /// The outstanding read completes with `Canceled` and its callback closes
    /// the channel; [`state`](Self::state) then reports `Closed`.
    pub fn shutdown(&self) {
        let mut reader = self.inner.reader.lock();
        if reader.state != SubscriptionState::Reading {
            return;
        }
        reader.state = SubscriptionState::Cancelled;
        if let Some(channel) = reader.channel.as_ref() {
            channel.cancel();
        }
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.inner.reader.lock().state
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.inner.address
    }
}

impl Drop for SceneSubscriber {
    fn drop(&mut self) {
        let channel = {
            let mut reader = self.inner.reader.lock();
            reader.state = SubscriptionState::Closed;
            reader.channel.take()
        };
        drop(channel);
    }
}

impl fmt::Debug for SceneSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneSubscriber")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriberInner {
    /// Arms the next read. Runs under the reader lock so a concurrent
    /// shutdown either sees the armed read or is seen by the next callback.
    fn arm_read(self: &Arc<Self>, reader: &mut Reader) {
        let Some(channel) = reader.channel.as_ref() else {
            return;
        };
        reader.state = SubscriptionState::Reading;
        let weak = Arc::downgrade(self);
        channel.async_read(move |completion| {
            if let Some(inner) = weak.upgrade() {
                inner.on_read(completion);
            }
        });
    }

    fn on_read(self: &Arc<Self>, completion: Completion) {
        match completion.into_result() {
            Ok(message) => {
                trace!(len = message.len(), "scene received");
                let mut dispatch = self.dispatch.lock();
                (*dispatch)(&message);
            }
            Err(e) if e.is_teardown() => {
                debug!(error = %e, "scene read ended");
                return self.close();
            }
            Err(e) => warn!(error = %e, "scene read failed"),
        }

        let mut reader = self.reader.lock();
        if reader.state == SubscriptionState::Cancelled {
            drop(reader);
            return self.close();
        }
        if reader.state == SubscriptionState::Reading {
            self.arm_read(&mut reader);
        }
    }

    /// Releases the channel from inside its own completion.
    fn close(&self) {
        let channel = {
            let mut reader = self.reader.lock();
            reader.state = SubscriptionState::Closed;
            reader.channel.take()
        };
        drop(channel);
    }
}

/// Broadcast failures.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Publishes scene state to every connected [`SceneSubscriber`].
pub struct SceneBroadcaster {
    channel: Channel<Pub>,
    address: Address,
}

impl SceneBroadcaster {
    /// Listens for subscribers on `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` cannot be bound.
    pub fn bind(runtime: &Runtime, address: &Address) -> Result<Self, TransportError> {
        let channel = Channel::<Pub>::open(runtime);
        let address = channel.listen(address)?;
        info!(%address, "scene broadcaster listening");
        Ok(Self { channel, address })
    }

    /// The bound address.
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.channel.link_count()
    }

    /// Encodes `scene` and queues it for every subscriber. Never blocks;
    /// subscribers whose queue is full miss this update.
    ///
    /// # Errors
    ///
    /// Returns an error if `scene` cannot be encoded or the channel is closed.
    pub fn broadcast<T: Wire>(&self, scene: &T) -> Result<(), BroadcastError> {
        let message = encode(scene)?;
        self.channel.try_send(message)?;
        Ok(())
    }
}

impl fmt::Debug for SceneBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneBroadcaster")
            .field("address", &self.address)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
