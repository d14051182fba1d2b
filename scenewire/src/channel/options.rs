//! Typed channel options.
//!
//! Each option is its own type, and [`ChannelOption<P>`] is implemented only
//! for the protocols it makes sense on. Setting a receive option on a `Push`
//! channel, or subscribing on anything but `Sub`, does not compile.
//!
//! ```compile_fail
//! # use scenewire::channel::{Channel, Push, options::RecvTimeout};
//! # fn f(channel: &Channel<Push>) {
//! channel.set_option(RecvTimeout(None));
//! # }
//! ```

use std::time::Duration;

use super::protocol::{Protocol, Receiving, Sending, Subscribing};

/// Internal representation an option lowers to.
#[doc(hidden)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    SendTimeout(Option<Duration>),
    RecvTimeout(Option<Duration>),
    SendBuffer(usize),
    RecvBuffer(usize),
    RecvMaxSize(usize),
    ReconnectMin(Duration),
    ReconnectMax(Duration),
    KernelBufferSize(usize),
    Subscribe(Vec<u8>),
    Unsubscribe(Vec<u8>),
}

/// An option that may be set on a `Channel<P>`.
pub trait ChannelOption<P: Protocol> {
    #[doc(hidden)]
    fn into_value(self) -> OptionValue;
}

/// Deadline for sends; `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTimeout(pub Option<Duration>);

/// Deadline for reads; `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvTimeout(pub Option<Duration>);

/// Per-link outbound queue depth, in messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendBuffer(pub usize);

/// Receive queue depth, in messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvBuffer(pub usize);

/// Largest accepted message; a larger frame closes the link. `0` disables
/// the check. Applies to links established after the option is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMaxSize(pub usize);

/// First (and, with a zero maximum, every) reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectMin(pub Duration);

/// Ceiling for the doubling reconnect delay; zero means constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectMax(pub Duration);

/// Kernel `SO_SNDBUF` / `SO_RCVBUF` size for new links, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBufferSize(pub usize);

/// Receive messages whose body starts with this topic prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe(pub Vec<u8>);

impl Subscribe {
    /// Subscribes to the empty topic, i.e. everything.
    #[must_use]
    pub const fn all() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn topic(prefix: impl AsRef<[u8]>) -> Self {
        Self(prefix.as_ref().to_vec())
    }
}

/// Drops a previous subscription; fails with `NotFound` if it never existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe(pub Vec<u8>);

impl Unsubscribe {
    #[must_use]
    pub const fn all() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn topic(prefix: impl AsRef<[u8]>) -> Self {
        Self(prefix.as_ref().to_vec())
    }
}

impl<P: Sending> ChannelOption<P> for SendTimeout {
    fn into_value(self) -> OptionValue {
        OptionValue::SendTimeout(self.0)
    }
}

impl<P: Sending> ChannelOption<P> for SendBuffer {
    fn into_value(self) -> OptionValue {
        OptionValue::SendBuffer(self.0)
    }
}

impl<P: Receiving> ChannelOption<P> for RecvTimeout {
    fn into_value(self) -> OptionValue {
        OptionValue::RecvTimeout(self.0)
    }
}

impl<P: Receiving> ChannelOption<P> for RecvBuffer {
    fn into_value(self) -> OptionValue {
        OptionValue::RecvBuffer(self.0)
    }
}

impl<P: Receiving> ChannelOption<P> for RecvMaxSize {
    fn into_value(self) -> OptionValue {
        OptionValue::RecvMaxSize(self.0)
    }
}

impl<P: Protocol> ChannelOption<P> for ReconnectMin {
    fn into_value(self) -> OptionValue {
        OptionValue::ReconnectMin(self.0)
    }
}

impl<P: Protocol> ChannelOption<P> for ReconnectMax {
    fn into_value(self) -> OptionValue {
        OptionValue::ReconnectMax(self.0)
    }
}

impl<P: Protocol> ChannelOption<P> for KernelBufferSize {
    fn into_value(self) -> OptionValue {
        OptionValue::KernelBufferSize(self.0)
    }
}

impl<P: Subscribing> ChannelOption<P> for Subscribe {
    fn into_value(self) -> OptionValue {
        OptionValue::Subscribe(self.0)
    }
}

impl<P: Subscribing> ChannelOption<P> for Unsubscribe {
    fn into_value(self) -> OptionValue {
        OptionValue::Unsubscribe(self.0)
    }
}
