//! Protocol markers and capability traits.
//!
//! A [`Channel`](super::Channel) is parameterised by one of the uninhabited
//! marker types below. The capability traits they implement decide, at
//! compile time, which operations and options the channel exposes:
//!
//! | Marker | Shape | Traits |
//! |---|---|---|
//! | [`Push`] | send-only | [`Sending`] |
//! | [`Pull`] | receive-only | [`Receiving`] |
//! | [`Pub`] | send-only broadcast | [`Sending`] |
//! | [`Sub`] | broadcast-receive | [`Receiving`], [`Subscribing`] |
//! | [`Req`] | bidirectional | [`Sending`], [`Receiving`] |
//! | [`Rep`] | bidirectional | [`Sending`], [`Receiving`] |

use std::fmt;

/// Runtime tag for a protocol, used on the wire and by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Push,
    Pull,
    Pub,
    Sub,
    Req,
    Rep,
}

impl ProtocolKind {
    /// 16-bit protocol number announced in the link header.
    #[must_use]
    pub const fn wire_id(self) -> u16 {
        match self {
            Self::Pub => 0x20,
            Self::Sub => 0x21,
            Self::Req => 0x30,
            Self::Rep => 0x31,
            Self::Push => 0x50,
            Self::Pull => 0x51,
        }
    }

    /// Looks up a protocol by its wire number.
    #[must_use]
    pub const fn from_wire_id(id: u16) -> Option<Self> {
        match id {
            0x20 => Some(Self::Pub),
            0x21 => Some(Self::Sub),
            0x30 => Some(Self::Req),
            0x31 => Some(Self::Rep),
            0x50 => Some(Self::Push),
            0x51 => Some(Self::Pull),
            _ => None,
        }
    }

    /// The only protocol this one can link with.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Push => Self::Pull,
            Self::Pull => Self::Push,
            Self::Pub => Self::Sub,
            Self::Sub => Self::Pub,
            Self::Req => Self::Rep,
            Self::Rep => Self::Req,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Pub => "pub",
            Self::Sub => "sub",
            Self::Req => "req",
            Self::Rep => "rep",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A messaging protocol usable as a [`Channel`](super::Channel) parameter.
///
/// Sealed: the set of protocols is fixed by the transport.
pub trait Protocol: sealed::Sealed + Send + Sync + 'static {
    const KIND: ProtocolKind;
}

/// Protocols that can send messages.
pub trait Sending: Protocol {}

/// Protocols that can receive messages.
pub trait Receiving: Protocol {}

/// Receiving protocols that filter by topic subscription.
pub trait Subscribing: Receiving {}

macro_rules! protocol {
    ($(#[$doc:meta])* $name:ident => $kind:ident: $($cap:ident),+) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub enum $name {}

        impl sealed::Sealed for $name {}

        impl Protocol for $name {
            const KIND: ProtocolKind = ProtocolKind::$kind;
        }

        $(impl $cap for $name {})+
    };
}

protocol!(
    /// Load-balancing sender; each message goes to exactly one puller.
    Push => Push: Sending
);
protocol!(
    /// Fan-in receiver for [`Push`].
    Pull => Pull: Receiving
);
protocol!(
    /// Broadcast sender; never waits, drops for slow subscribers.
    Pub => Pub: Sending
);
protocol!(
    /// Broadcast receiver; receives nothing until it subscribes.
    Sub => Sub: Receiving, Subscribing
);
protocol!(
    /// Requester; matches each reply to its outstanding request.
    Req => Req: Sending, Receiving
);
protocol!(
    /// Replier; a send answers the most recently received request.
    Rep => Rep: Sending, Receiving
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_symmetric() {
        for kind in [
            ProtocolKind::Push,
            ProtocolKind::Pull,
            ProtocolKind::Pub,
            ProtocolKind::Sub,
            ProtocolKind::Req,
            ProtocolKind::Rep,
        ] {
            assert_ne!(kind.peer(), kind);
            assert_eq!(kind.peer().peer(), kind);
            assert_eq!(ProtocolKind::from_wire_id(kind.wire_id()), Some(kind));
        }
    }

    #[test]
    fn markers_carry_their_kind() {
        assert_eq!(<Push as Protocol>::KIND, ProtocolKind::Push);
        assert_eq!(<Sub as Protocol>::KIND, ProtocolKind::Sub);
        assert_eq!(<Rep as Protocol>::KIND, ProtocolKind::Rep);
    }
}
