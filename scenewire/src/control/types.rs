//! Messages and identifiers exchanged on the control channel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::CodecError;
use crate::error::TransportError;
use crate::net::Address;

/// Identifier of one logical session between an input instance and the
/// coordinator.
///
/// Assigned by the coordinator on the first successful handshake and
/// persisted by the instance so a later handshake resumes the same session.
/// The nil value means no session was ever established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// A fresh random (v4) identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    #[must_use]
    pub const fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// `Some(self)` unless nil.
    #[must_use]
    pub const fn valid(self) -> Option<Self> {
        if self.is_nil() { None } else { Some(self) }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Requests sent by an input instance to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Opens a session, or resumes `id` if the coordinator still knows it.
    NewConnection { id: Option<ConnectionId> },
    /// Describes the element published by session `id`. Opaque to this crate.
    ObjectDetails { id: ConnectionId, details: Vec<u8> },
    /// Ends session `id`. Sent best-effort; no reply is awaited.
    CloseConnection { id: ConnectionId },
}

/// Replies sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlReply {
    /// Handshake accepted; stream metadata to `publish_address`.
    Connected {
        id: ConnectionId,
        publish_address: Address,
    },
    Acknowledged,
    Rejected { reason: String },
}

/// Handshake state of a [`ControlConnection`](super::ControlConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Dialing,
    Connected,
}

impl ConnectionState {
    /// Short status text suitable for a UI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "no connection to coordinator",
            Self::Dialing => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of one control exchange. None of them are fatal: the connection
/// falls back to `Disconnected` and retries.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("rejected by coordinator: {0}")]
    Rejected(String),
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(ControlReply),
}
