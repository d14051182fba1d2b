//! Session handshake between input instances and the coordinator.
//!
//! The control channel is request/reply shaped (`Req` on the instance,
//! `Rep` on the coordinator):
//!
//! ```text
//!  instance                              coordinator
//!  ────────                              ───────────
//!  NewConnection { id? } ─────────────►  resume id, or allocate a new one
//!                        ◄─────────────  Connected { id, publish_address }
//!  ObjectDetails { id, .. } ──────────►  (optional, after each handshake)
//!                        ◄─────────────  Acknowledged
//!  CloseConnection { id } ────────────►  (best-effort on close, no reply read)
//! ```
//!
//! [`ControlConnection`] runs the instance side and [`ControlServer`] the
//! coordinator side. Requests and replies are postcard-encoded
//! [`ControlRequest`]/[`ControlReply`] values.

mod client;
mod server;
pub mod types;

pub use client::ControlConnection;
pub use server::{ControlServer, SessionEvent, SessionInfo};
pub use types::{ConnectionId, ConnectionState, ControlError, ControlReply, ControlRequest};
