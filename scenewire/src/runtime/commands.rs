//! Commands sent from caller threads to the dispatch thread.
//!
//! They travel over an unbounded crossbeam channel; every submit is followed
//! by a [`mio::Waker`] wake so the poll loop notices them promptly.

use std::sync::Arc;

use minstant::Instant;

use crate::aio::OpRef;
use crate::net::Address;
use crate::net::stream::Listener;
use crate::runtime::socket::SocketShared;

pub(crate) enum Command {
    /// Start tracking a newly opened socket.
    Register(Arc<SocketShared>),
    /// Accept connections on an already bound listener.
    Listen {
        socket: Arc<SocketShared>,
        listener: Listener,
    },
    /// Connect (and keep reconnecting) to a remote address.
    Dial {
        socket: Arc<SocketShared>,
        address: Address,
    },
    /// Match queued operations against queued data and links.
    Service(Arc<SocketShared>),
    /// Complete `op` once `deadline` passes.
    Sleep { op: OpRef, deadline: Instant },
    /// Complete the operation early with `Canceled`.
    Cancel {
        socket: Option<Arc<SocketShared>>,
        aio: u64,
        generation: u64,
    },
    /// Discard the operation without running its handler.
    Abort {
        socket: Option<Arc<SocketShared>>,
        aio: u64,
        generation: u64,
    },
    /// Tear down a socket: links, listeners, dialers and pending operations.
    Close(Arc<SocketShared>),
    Shutdown,
}
