//! Coordinator side of the control handshake.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aio::Completion;
use crate::channel::{Channel, Rep};
use crate::codec::{decode, encode};
use crate::control::types::{ConnectionId, ControlReply, ControlRequest};
use crate::error::TransportError;
use crate::events::PipeId;
use crate::message::Message;
use crate::net::Address;
use crate::runtime::Runtime;
use crate::trace::{debug, info, warn};

type Allocator = Box<dyn FnMut(ConnectionId) -> Result<Address, TransportError> + Send>;
type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// What the coordinator knows about one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub publish_address: Address,
    pub details: Option<Vec<u8>>,
    /// Link the last handshake arrived on; `None` while detached.
    pub pipe: Option<PipeId>,
}

impl SessionInfo {
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.pipe.is_some()
    }
}

/// Session lifecycle notifications, delivered on the dispatch thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        id: ConnectionId,
        publish_address: Address,
    },
    Resumed(ConnectionId),
    DetailsChanged(ConnectionId),
    /// The session's link went away; it stays resumable.
    Detached(ConnectionId),
    Closed(ConnectionId),
}

/// Answers control requests from input instances.
///
/// Runs a perpetual read, handle, reply loop on a `Rep` channel. New sessions
/// get a fresh [`ConnectionId`] and a streaming address from the allocator
/// passed to [`bind`](Self::bind); a handshake carrying a known id resumes
/// that session instead, unless a different live link still holds it.
pub struct ControlServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    channel: Channel<Rep>,
    address: Address,
    sessions: Mutex<HashMap<ConnectionId, SessionInfo>>,
    allocator: Mutex<Allocator>,
    on_event: Mutex<Option<EventHandler>>,
}

impl ControlServer {
    /// Listens on `address` and starts answering requests.
    ///
    /// `allocator` is called on the dispatch thread once per new session and
    /// returns the address that session should publish metadata to.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` cannot be bound.
    pub fn bind(
        runtime: &Runtime,
        address: &Address,
        allocator: impl FnMut(ConnectionId) -> Result<Address, TransportError> + Send + 'static,
    ) -> Result<Self, TransportError> {
        let channel = Channel::<Rep>::open(runtime);
        let address = channel.listen(address)?;
        let inner = Arc::new(ServerInner {
            channel,
            address,
            sessions: Mutex::new(HashMap::new()),
            allocator: Mutex::new(Box::new(allocator)),
            on_event: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.channel.events().on_link_lost(move |pipe| {
            if let Some(inner) = weak.upgrade() {
                inner.detach(pipe);
            }
        });
        inner.arm_read();
        info!(address = %inner.address, "control server listening");
        Ok(Self { inner })
    }

    /// The bound address.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    #[must_use]
    pub fn session(&self, id: ConnectionId) -> Option<SessionInfo> {
        self.inner.sessions.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Registers the session event handler, replacing any previous one.
    pub fn on_session_event(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        *self.inner.on_event.lock() = Some(Arc::new(handler));
    }

    /// Stops answering and closes the listener.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlServer")
            .field("address", &self.inner.address)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl ServerInner {
    fn arm_read(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.channel.async_read(move |completion| {
            if let Some(inner) = weak.upgrade() {
                inner.on_request(completion);
            }
        });
    }

    fn on_request(self: &Arc<Self>, completion: Completion) {
        let request = match completion.into_result() {
            Ok(message) => message,
            Err(e) if e.is_teardown() => {
                debug!(error = %e, "control server loop ended");
                return;
            }
            Err(e) => {
                warn!(error = %e, "control read failed");
                return self.arm_read();
            }
        };

        let (reply, event) = self.respond(&request);
        if let Some(event) = event {
            self.emit(&event);
        }

        let message = match encode(&reply) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to encode control reply");
                return self.arm_read();
            }
        };
        let weak = Arc::downgrade(self);
        self.channel.async_send(message, move |completion| {
            if let Err(e) = completion.result() {
                if e.is_teardown() {
                    return;
                }
                debug!(error = %e, "control reply not delivered");
            }
            if let Some(inner) = weak.upgrade() {
                inner.arm_read();
            }
        });
    }

    fn respond(&self, message: &Message) -> (ControlReply, Option<SessionEvent>) {
        let request = match decode::<ControlRequest>(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed control request");
                let reply = ControlReply::Rejected {
                    reason: e.to_string(),
                };
                return (reply, None);
            }
        };

        match request {
            ControlRequest::NewConnection { id } => self.handshake(id, message.pipe()),
            ControlRequest::ObjectDetails { id, details } => {
                let mut sessions = self.sessions.lock();
                let Some(session) = sessions.get_mut(&id) else {
                    return (unknown(id), None);
                };
                debug!(connection = %id, len = details.len(), "object details updated");
                session.details = Some(details);
                (ControlReply::Acknowledged, Some(SessionEvent::DetailsChanged(id)))
            }
            ControlRequest::CloseConnection { id } => {
                if self.sessions.lock().remove(&id).is_none() {
                    return (unknown(id), None);
                }
                info!(connection = %id, "session closed");
                (ControlReply::Acknowledged, Some(SessionEvent::Closed(id)))
            }
        }
    }

    fn handshake(
        &self,
        requested: Option<ConnectionId>,
        pipe: Option<PipeId>,
    ) -> (ControlReply, Option<SessionEvent>) {
        if let Some(id) = requested {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&id) {
                // Another live link still owns the id; the caller gets its own session.
                Some(session) if session.pipe.is_some() && session.pipe != pipe => {
                    warn!(connection = %id, "id already attached elsewhere, opening a new session");
                }
                Some(session) => {
                    session.pipe = pipe;
                    info!(connection = %id, "session resumed");
                    let reply = ControlReply::Connected {
                        id,
                        publish_address: session.publish_address.clone(),
                    };
                    return (reply, Some(SessionEvent::Resumed(id)));
                }
                None => {}
            }
        }

        let id = ConnectionId::generate();
        let allocated = {
            let mut allocate = self.allocator.lock();
            (*allocate)(id)
        };
        let publish_address = match allocated {
            Ok(address) => address,
            Err(e) => {
                warn!(connection = %id, error = %e, "no publish address for new session");
                let reply = ControlReply::Rejected {
                    reason: format!("no publish address: {e}"),
                };
                return (reply, None);
            }
        };
        self.sessions.lock().insert(
            id,
            SessionInfo {
                id,
                publish_address: publish_address.clone(),
                details: None,
                pipe,
            },
        );
        info!(connection = %id, publish = %publish_address, "session opened");
        let reply = ControlReply::Connected {
            id,
            publish_address: publish_address.clone(),
        };
        (reply, Some(SessionEvent::Opened { id, publish_address }))
    }

    fn detach(&self, pipe: PipeId) {
        let detached: Vec<ConnectionId> = {
            let mut sessions = self.sessions.lock();
            sessions
                .values_mut()
                .filter(|session| session.pipe == Some(pipe))
                .map(|session| {
                    session.pipe = None;
                    session.id
                })
                .collect()
        };
        for id in detached {
            debug!(connection = %id, %pipe, "session detached");
            self.emit(&SessionEvent::Detached(id));
        }
    }

    fn emit(&self, event: &SessionEvent) {
        let handler = self.on_event.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

fn unknown(id: ConnectionId) -> ControlReply {
    ControlReply::Rejected {
        reason: format!("unknown connection {id}"),
    }
}
