//! Inter-instance control and metadata streaming over local sockets.
//!
//! Plugin instances hosted in the same application cannot share memory, so
//! they cooperate through a coordinator:
//!
//! - input instances hold a [`ControlConnection`] to the coordinator and
//!   stream their parameters through a [`MetadataPublisher`],
//! - the coordinator answers with a [`ControlServer`] and fans the aggregated
//!   scene out through a [`SceneBroadcaster`],
//! - monitors consume that scene with a [`SceneSubscriber`].
//!
//! Everything sits on protocol-typed [`Channel`]s driven by one dispatch
//! thread per [`Runtime`].
//!
//! # Platforms
//!
//! Unix only. `ipc://` addresses are Unix domain sockets and socket options
//! are set through file descriptors, so other targets fail to build.
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

#[cfg(not(unix))]
compile_error!("scenewire requires a Unix platform (ipc:// uses Unix domain sockets)");

pub mod aio;
pub mod channel;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod message;
pub mod metadata;
pub mod net;
pub mod runtime;
pub mod scene;
mod trace;

pub use aio::{AsyncOperation, Completion};
pub use channel::Channel;
pub use codec::Wire;
pub use control::{ConnectionId, ConnectionState, ControlConnection, ControlServer};
pub use error::{ErrorCode, TransportError};
pub use events::{ConnectionEventNotifier, PipeId};
pub use message::Message;
pub use metadata::MetadataPublisher;
pub use net::Address;
pub use runtime::Runtime;
pub use scene::{SceneBroadcaster, SceneSubscriber};
pub use trace::init_tracing;

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
