//! Coalescing metadata publisher.
//!
//! An input instance keeps one current snapshot of its parameters. Mutations
//! only mark the snapshot dirty; the publisher sends at most one copy at a
//! time, so a burst of changes collapses into a single message carrying the
//! latest values. Every `max_send_interval` a heartbeat tick publishes a
//! dirty snapshot, and re-publishes an unchanged one when the last successful
//! send is overdue. That also retries failed sends and refreshes a consumer
//! that reconnected.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use minstant::Instant;
use parking_lot::Mutex;

use crate::aio::{AsyncOperation, Completion};
use crate::channel::options::SendTimeout;
use crate::channel::{Channel, Push};
use crate::codec::{Wire, encode};
use crate::config::PublisherConfig;
use crate::control::ConnectionId;
use crate::error::TransportError;
use crate::net::Address;
use crate::runtime::Runtime;
use crate::trace::{debug, info, warn};

/// Streams snapshots of `T` to the coordinator over a `Push` channel.
pub struct MetadataPublisher<T> {
    inner: Arc<PublisherInner<T>>,
}

struct PublisherInner<T> {
    runtime: Runtime,
    config: PublisherConfig,
    snapshot: Mutex<Snapshot<T>>,
    /// Kept apart from `snapshot` so completions never contend with mutators.
    last_send: Mutex<Option<Instant>>,
    link: Mutex<Option<PublishLink>>,
    attempts: AtomicU64,
    failing: AtomicBool,
}

struct Snapshot<T> {
    value: T,
    dirty: bool,
}

struct PublishLink {
    channel: Channel<Push>,
    heartbeat: AsyncOperation,
    connection_id: ConnectionId,
    address: Address,
    in_flight: bool,
}

impl<T: Wire + Send + 'static> MetadataPublisher<T> {
    #[must_use]
    pub fn new(runtime: &Runtime, config: PublisherConfig, initial: T) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                runtime: runtime.clone(),
                config,
                snapshot: Mutex::new(Snapshot {
                    value: initial,
                    dirty: false,
                }),
                last_send: Mutex::new(None),
                link: Mutex::new(None),
                attempts: AtomicU64::new(0),
                failing: AtomicBool::new(false),
            }),
        }
    }

    /// Starts publishing to `address` for session `connection_id`.
    ///
    /// Replaces any previous connection. The snapshot is marked dirty so the
    /// consumer receives a full copy even if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be configured or dialed.
    pub fn connect(
        &self,
        address: &Address,
        connection_id: ConnectionId,
    ) -> Result<(), TransportError> {
        self.disconnect();

        let channel = Channel::<Push>::open(&self.inner.runtime);
        self.inner.config.channel.apply(&channel)?;
        channel.set_option(SendTimeout(Some(self.inner.config.send_timeout)))?;
        channel.dial(address)?;

        self.inner.snapshot.lock().dirty = true;
        self.inner.failing.store(false, Ordering::Relaxed);

        let mut link = self.inner.link.lock();
        let active = link.insert(PublishLink {
            channel,
            heartbeat: AsyncOperation::new(&self.inner.runtime),
            connection_id,
            address: address.clone(),
            in_flight: false,
        });
        self.inner.arm_heartbeat(active);
        info!(connection = %connection_id, %address, "metadata publisher connected");
        Ok(())
    }

    /// Stops the heartbeat and any outstanding send and forgets the channel
    /// and session. Calling it again has no effect.
    pub fn disconnect(&self) {
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            debug!(connection = %link.connection_id, "metadata publisher disconnected");
            drop(link);
        }
    }

    /// Mutates the snapshot and marks it dirty.
    pub fn update(&self, mutate: impl FnOnce(&mut T)) {
        let mut snapshot = self.inner.snapshot.lock();
        mutate(&mut snapshot.value);
        snapshot.dirty = true;
    }

    /// Replaces the snapshot and marks it dirty.
    pub fn set(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Publishes now if the snapshot is dirty and no send is outstanding.
    pub fn trigger_send(&self) {
        self.inner.publish();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.snapshot.lock().dirty
    }

    /// Time of the last successful send.
    #[must_use]
    pub fn last_send(&self) -> Option<Instant> {
        *self.inner.last_send.lock()
    }

    /// Session being published for; nil while disconnected.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.inner
            .link
            .lock()
            .as_ref()
            .map_or_else(ConnectionId::nil, |link| link.connection_id)
    }

    /// Number of sends started since creation.
    #[must_use]
    pub fn publish_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }
}

impl<T: Wire + Clone + Send + 'static> MetadataPublisher<T> {
    /// A copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> T {
        self.inner.snapshot.lock().value.clone()
    }
}

impl<T> Drop for MetadataPublisher<T> {
    fn drop(&mut self) {
        let link = self.inner.link.lock().take();
        drop(link);
    }
}

impl<T> fmt::Debug for MetadataPublisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.inner.link.lock();
        f.debug_struct("MetadataPublisher")
            .field("address", &link.as_ref().map(|link| &link.address))
            .field("dirty", &self.inner.snapshot.lock().dirty)
            .field("attempts", &self.inner.attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Wire + Send + 'static> PublisherInner<T> {
    fn arm_heartbeat(self: &Arc<Self>, link: &PublishLink) {
        let weak = Arc::downgrade(self);
        link.heartbeat
            .sleep(self.config.max_send_interval, move |completion| {
                if !completion.is_ok() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.tick();
                }
            });
    }

    fn tick(self: &Arc<Self>) {
        let interval = self.config.max_send_interval;
        let overdue = self
            .last_send
            .lock()
            .is_none_or(|at| at.elapsed() > interval);
        if overdue {
            self.snapshot.lock().dirty = true;
        }
        // Pending changes go out on the next tick even when a send is recent.
        self.publish();
        if let Some(link) = self.link.lock().as_ref() {
            self.arm_heartbeat(link);
        }
    }

    fn publish(self: &Arc<Self>) {
        let mut link = self.link.lock();
        let Some(active) = link.as_mut() else {
            return;
        };
        if active.in_flight {
            return;
        }

        let message = {
            let mut snapshot = self.snapshot.lock();
            if !snapshot.dirty {
                return;
            }
            match encode(&snapshot.value) {
                Ok(message) => {
                    snapshot.dirty = false;
                    message
                }
                Err(e) => {
                    warn!(error = %e, "metadata snapshot cannot be encoded");
                    return;
                }
            }
        };

        active.in_flight = true;
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        active.channel.async_send(message, move |completion| {
            if let Some(inner) = weak.upgrade() {
                inner.finish_publish(&completion);
            }
        });
    }

    fn finish_publish(&self, completion: &Completion) {
        if let Some(link) = self.link.lock().as_mut() {
            link.in_flight = false;
        }
        match completion.result() {
            Ok(()) => {
                *self.last_send.lock() = Some(Instant::now());
                if self.failing.swap(false, Ordering::Relaxed) {
                    info!("metadata publishing recovered");
                }
            }
            Err(e) => {
                self.snapshot.lock().dirty = true;
                if self.failing.swap(true, Ordering::Relaxed) {
                    debug!(error = %e, "metadata publish failed again");
                } else {
                    warn!(error = %e, "metadata publish failed, will retry");
                }
            }
        }
    }
}
