//! Input-instance side of the control handshake.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aio::AsyncOperation;
use crate::channel::options::{ReconnectMax, ReconnectMin, RecvTimeout, SendTimeout};
use crate::channel::{Channel, Req};
use crate::codec::{decode, encode};
use crate::config::ControlConfig;
use crate::control::types::{
    ConnectionId, ConnectionState, ControlError, ControlReply, ControlRequest,
};
use crate::error::TransportError;
use crate::events::PipeId;
use crate::net::Address;
use crate::runtime::Runtime;
use crate::trace::{debug, info, warn};

type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Continuation run on the dispatch thread once a request/reply exchange ends.
type Step = fn(&Arc<Inner>, u64, Result<ControlReply, ControlError>);

/// Keeps a session with the coordinator alive.
///
/// After [`connect`](Self::connect) the connection dials the control address
/// and performs a *NewConnection* handshake on every link-up, resuming the
/// stored [`ConnectionId`] when there is one. Handshake failures drop back to
/// [`ConnectionState::Disconnected`] and are retried after `reconnect_min` for
/// as long as the connection is open; nothing here is ever fatal.
///
/// All transitions after `connect` happen on the runtime's dispatch thread.
pub struct ControlConnection {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Runtime,
    config: ControlConfig,
    session: Mutex<Session>,
    channel: Mutex<Option<Channel<Req>>>,
    retry: AsyncOperation,
    on_state_change: Mutex<Option<StateHandler>>,
}

struct Session {
    state: ConnectionState,
    id: ConnectionId,
    publish_address: Option<Address>,
    details: Option<Vec<u8>>,
    details_pending: bool,
    /// A request/reply exchange owns the channel's operation slot.
    exchanging: bool,
    active: bool,
    /// Bumped on every connect and close; callbacks from older epochs are ignored.
    epoch: u64,
}

impl Session {
    const fn current(&self, epoch: u64) -> bool {
        self.active && self.epoch == epoch
    }

    fn set_state(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        if self.state == state {
            None
        } else {
            self.state = state;
            Some(state)
        }
    }
}

impl ControlConnection {
    /// Creates an idle connection. Nothing is dialed until [`connect`](Self::connect).
    #[must_use]
    pub fn new(runtime: &Runtime, config: ControlConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime: runtime.clone(),
                config,
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    id: ConnectionId::nil(),
                    publish_address: None,
                    details: None,
                    details_pending: false,
                    exchanging: false,
                    active: false,
                    epoch: 0,
                }),
                channel: Mutex::new(None),
                retry: AsyncOperation::new(runtime),
                on_state_change: Mutex::new(None),
            }),
        }
    }

    /// Starts dialing the coordinator. Does nothing if already started.
    ///
    /// # Errors
    ///
    /// Returns an error if the control channel cannot be configured.
    pub fn connect(&self) -> Result<(), TransportError> {
        let (epoch, changed) = {
            let mut session = self.inner.session.lock();
            if session.active {
                return Ok(());
            }
            session.active = true;
            session.exchanging = false;
            session.epoch += 1;
            (session.epoch, session.set_state(ConnectionState::Dialing))
        };
        self.inner.notify(changed);

        match self.inner.open_channel(epoch) {
            Ok(()) => {
                debug!(address = %self.inner.config.address, "control connection dialing");
                Ok(())
            }
            Err(e) => {
                self.inner.shutdown(false);
                Err(e)
            }
        }
    }

    /// Closes the control channel, telling the coordinator best-effort.
    ///
    /// The [`ConnectionId`] is kept so a later [`connect`](Self::connect)
    /// resumes the session.
    pub fn close(&self) {
        self.inner.shutdown(false);
    }

    /// Closes the connection and forgets the session.
    pub fn disconnect(&self) {
        self.inner.shutdown(true);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    /// The session id, nil before the first successful handshake.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.session.lock().id
    }

    /// Restores a persisted session id; used by the next handshake.
    pub fn set_connection_id(&self, id: ConnectionId) {
        self.inner.session.lock().id = id;
    }

    /// Where metadata for this session should be streamed, once connected.
    #[must_use]
    pub fn publish_address(&self) -> Option<Address> {
        self.inner.session.lock().publish_address.clone()
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.inner.config.address
    }

    /// Sets the opaque element description sent after every handshake, and
    /// right away if currently connected.
    pub fn set_object_details(&self, details: impl Into<Vec<u8>>) {
        let epoch = {
            let mut session = self.inner.session.lock();
            session.details = Some(details.into());
            session.details_pending = true;
            session.epoch
        };
        self.inner.flush_details(epoch);
    }

    /// Registers the state-change handler, replacing any previous one.
    ///
    /// The handler may run on the dispatch thread and must not block.
    pub fn on_state_change(&self, handler: impl Fn(ConnectionState) + Send + Sync + 'static) {
        *self.inner.on_state_change.lock() = Some(Arc::new(handler));
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.inner.shutdown(false);
    }
}

impl fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("ControlConnection")
            .field("address", &self.inner.config.address)
            .field("state", &session.state)
            .field("id", &session.id)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn open_channel(self: &Arc<Self>, epoch: u64) -> Result<(), TransportError> {
        let channel = Channel::<Req>::open(&self.runtime);
        channel.set_option(RecvTimeout(Some(self.config.recv_timeout)))?;
        channel.set_option(SendTimeout(Some(self.config.send_timeout)))?;
        channel.set_option(ReconnectMin(self.config.reconnect_min))?;
        channel.set_option(ReconnectMax(self.config.reconnect_max))?;

        let weak = Arc::downgrade(self);
        channel.events().on_link_established(move |pipe| {
            if let Some(inner) = weak.upgrade() {
                inner.link_up(epoch, pipe);
            }
        });
        let weak = Arc::downgrade(self);
        channel.events().on_link_lost(move |pipe| {
            if let Some(inner) = weak.upgrade() {
                inner.link_down(epoch, pipe);
            }
        });

        // Stored before dialing so the first link event finds it.
        let mut slot = self.channel.lock();
        slot.insert(channel).dial(&self.config.address)
    }

    fn shutdown(&self, forget: bool) {
        let (channel, id, changed) = {
            let mut session = self.session.lock();
            if forget {
                session.publish_address = None;
            }
            let id = session.id.valid();
            if forget {
                session.id = ConnectionId::nil();
            }
            if !session.active {
                return;
            }
            session.active = false;
            session.exchanging = false;
            session.epoch += 1;
            let changed = session.set_state(ConnectionState::Disconnected);
            (self.channel.lock().take(), id, changed)
        };
        self.retry.cancel();

        if let (Some(channel), Some(id)) = (&channel, id) {
            let sent = encode(&ControlRequest::CloseConnection { id })
                .map_err(ControlError::from)
                .and_then(|message| channel.try_send(message).map_err(ControlError::from));
            match sent {
                Ok(true) => debug!(connection = %id, "close notification queued"),
                Ok(false) => debug!(connection = %id, "close notification dropped, no link"),
                Err(e) => debug!(connection = %id, error = %e, "close notification failed"),
            }
        }
        drop(channel);
        self.notify(changed);
    }

    fn notify(&self, changed: Option<ConnectionState>) {
        let Some(state) = changed else {
            return;
        };
        let handler = self.on_state_change.lock().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn link_up(self: &Arc<Self>, epoch: u64, pipe: PipeId) {
        debug!(%pipe, "control link established");
        self.begin_handshake(epoch);
    }

    fn link_down(self: &Arc<Self>, epoch: u64, pipe: PipeId) {
        let changed = {
            let mut session = self.session.lock();
            if !session.current(epoch) {
                return;
            }
            let channel = self.channel.lock();
            let Some(channel) = channel.as_ref() else {
                return;
            };
            if channel.link_count() > 0 {
                return;
            }
            // The reply cannot arrive anymore; fail the exchange now.
            if session.exchanging {
                channel.cancel();
            }
            session.set_state(ConnectionState::Disconnected)
        };
        debug!(%pipe, "control link lost");
        self.notify(changed);
    }

    fn begin_handshake(self: &Arc<Self>, epoch: u64) {
        let (request, changed) = {
            let mut session = self.session.lock();
            if !session.current(epoch)
                || session.exchanging
                || session.state == ConnectionState::Connected
            {
                return;
            }
            session.exchanging = true;
            let request = ControlRequest::NewConnection {
                id: session.id.valid(),
            };
            (request, session.set_state(ConnectionState::Dialing))
        };
        self.notify(changed);
        self.exchange(epoch, &request, Self::finish_handshake);
    }

    fn finish_handshake(self: &Arc<Self>, epoch: u64, result: Result<ControlReply, ControlError>) {
        let (id, publish_address) = match result {
            Ok(ControlReply::Connected {
                id,
                publish_address,
            }) => (id, publish_address),
            Ok(ControlReply::Rejected { reason }) => {
                return self.handshake_failed(epoch, &ControlError::Rejected(reason));
            }
            Ok(other) => return self.handshake_failed(epoch, &ControlError::UnexpectedReply(other)),
            Err(e) => return self.handshake_failed(epoch, &e),
        };

        let changed = {
            let mut session = self.session.lock();
            if !session.current(epoch) {
                return;
            }
            session.exchanging = false;
            session.id = id;
            session.publish_address = Some(publish_address.clone());
            session.details_pending = session.details.is_some();
            session.set_state(ConnectionState::Connected)
        };
        info!(connection = %id, publish = %publish_address, "control handshake complete");
        self.notify(changed);
        self.flush_details(epoch);
    }

    fn handshake_failed(self: &Arc<Self>, epoch: u64, error: &ControlError) {
        let changed = {
            let mut session = self.session.lock();
            if !session.current(epoch) {
                return;
            }
            session.exchanging = false;
            session.set_state(ConnectionState::Disconnected)
        };
        match error {
            ControlError::Transport(e) if e.is_canceled() => {
                debug!("control handshake abandoned");
            }
            _ => warn!(error = %error, "control handshake failed"),
        }
        self.notify(changed);
        self.schedule_retry(epoch);
    }

    /// Retries the handshake after `reconnect_min` while a link is up.
    /// Without a link the dialer's own reconnect brings the next attempt.
    fn schedule_retry(self: &Arc<Self>, epoch: u64) {
        let linked = self
            .channel
            .lock()
            .as_ref()
            .is_some_and(|channel| channel.link_count() > 0);
        if !linked || self.retry.is_busy() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.retry.sleep(self.config.reconnect_min, move |completion| {
            if !completion.is_ok() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.begin_handshake(epoch);
            }
        });
    }

    fn flush_details(self: &Arc<Self>, epoch: u64) {
        let request = {
            let mut session = self.session.lock();
            if !session.current(epoch)
                || session.state != ConnectionState::Connected
                || session.exchanging
                || !session.details_pending
            {
                return;
            }
            let Some(details) = session.details.clone() else {
                return;
            };
            session.exchanging = true;
            session.details_pending = false;
            ControlRequest::ObjectDetails {
                id: session.id,
                details,
            }
        };
        self.exchange(epoch, &request, Self::finish_details);
    }

    fn finish_details(self: &Arc<Self>, epoch: u64, result: Result<ControlReply, ControlError>) {
        let delivered = match result {
            Ok(ControlReply::Acknowledged) => true,
            Ok(ControlReply::Rejected { reason }) => {
                warn!(reason = %reason, "object details rejected");
                true
            }
            Ok(other) => {
                warn!(reply = ?other, "unexpected reply to object details");
                false
            }
            Err(e) => {
                warn!(error = %e, "object details not delivered");
                false
            }
        };
        {
            let mut session = self.session.lock();
            if !session.current(epoch) {
                return;
            }
            session.exchanging = false;
            if !delivered {
                // Re-sent after the next handshake.
                session.details_pending = true;
                return;
            }
        }
        self.flush_details(epoch);
    }

    /// Sends `request` and reads one reply on the control channel's slot,
    /// then runs `then` with the outcome.
    fn exchange(self: &Arc<Self>, epoch: u64, request: &ControlRequest, then: Step) {
        let message = match encode(request) {
            Ok(message) => message,
            Err(e) => return then(self, epoch, Err(e.into())),
        };
        let weak = Arc::downgrade(self);
        let channel = self.channel.lock();
        let Some(channel) = channel.as_ref() else {
            return;
        };
        channel.async_send(message, move |completion| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match completion.into_result() {
                Ok(_) => inner.await_reply(epoch, then),
                Err(e) => then(&inner, epoch, Err(e.into())),
            }
        });
    }

    fn await_reply(self: &Arc<Self>, epoch: u64, then: Step) {
        let weak = Arc::downgrade(self);
        let channel = self.channel.lock();
        let Some(channel) = channel.as_ref() else {
            return;
        };
        channel.async_read(move |completion| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let reply = completion
                .into_result()
                .map_err(ControlError::from)
                .and_then(|message| decode::<ControlReply>(&message).map_err(ControlError::from));
            then(&inner, epoch, reply);
        });
    }
}
