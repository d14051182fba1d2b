//! Component configuration.
//!
//! Plain structs with public fields and defaults matching the reference
//! deployment. All of them deserialize with `serde` so a host can embed them
//! in its own settings; durations are written as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::options::{KernelBufferSize, ReconnectMax, ReconnectMin};
use crate::channel::{Channel, Protocol};
use crate::error::TransportError;
use crate::net::Address;

/// Well-known control port on the loopback interface.
pub const DEFAULT_CONTROL_PORT: u16 = 47100;
/// Well-known broadcast port on the loopback interface.
pub const DEFAULT_BROADCAST_PORT: u16 = 47101;

/// Addresses of the coordinator's shared endpoints.
///
/// The per-instance publish address is not here: the coordinator hands it out
/// during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub control: Address,
    pub broadcast: Address,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            control: Address::localhost(DEFAULT_CONTROL_PORT),
            broadcast: Address::localhost(DEFAULT_BROADCAST_PORT),
        }
    }
}

/// Reconnect and socket sizing shared by the streaming channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDefaults {
    #[serde(with = "millis")]
    pub reconnect_min: Duration,
    /// Zero retries at `reconnect_min` forever.
    #[serde(with = "millis")]
    pub reconnect_max: Duration,
    /// Kernel socket buffer size; `None` keeps the OS default.
    pub kernel_buffer_size: Option<usize>,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::ZERO,
            kernel_buffer_size: None,
        }
    }
}

impl ChannelDefaults {
    /// Applies these settings to `channel`.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the channel has already been closed.
    pub fn apply<P: Protocol>(&self, channel: &Channel<P>) -> Result<(), TransportError> {
        channel.set_option(ReconnectMin(self.reconnect_min))?;
        channel.set_option(ReconnectMax(self.reconnect_max))?;
        if let Some(size) = self.kernel_buffer_size {
            channel.set_option(KernelBufferSize(size))?;
        }
        Ok(())
    }
}

/// Settings for [`ControlConnection`](crate::control::ControlConnection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub address: Address,
    #[serde(with = "millis")]
    pub recv_timeout: Duration,
    #[serde(with = "millis")]
    pub send_timeout: Duration,
    #[serde(with = "millis")]
    pub reconnect_min: Duration,
    #[serde(with = "millis")]
    pub reconnect_max: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: Endpoints::default().control,
            recv_timeout: Duration::from_millis(1000),
            send_timeout: Duration::from_millis(100),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::ZERO,
        }
    }
}

impl ControlConfig {
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }
}

/// Settings for [`MetadataPublisher`](crate::metadata::MetadataPublisher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Heartbeat period, and the longest time between two successful sends.
    #[serde(with = "millis")]
    pub max_send_interval: Duration,
    /// How long one publish may wait for a link before it counts as failed.
    #[serde(with = "millis")]
    pub send_timeout: Duration,
    pub channel: ChannelDefaults,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_send_interval: Duration::from_millis(100),
            send_timeout: Duration::from_millis(100),
            channel: ChannelDefaults::default(),
        }
    }
}

/// Settings for [`SceneSubscriber`](crate::scene::SceneSubscriber).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Largest accepted scene message in bytes; `0` disables the check.
    pub recv_max_size: usize,
    pub channel: ChannelDefaults,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            recv_max_size: crate::runtime::DEFAULT_RECV_MAX_SIZE,
            channel: ChannelDefaults::default(),
        }
    }
}

/// `Duration` as integer milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_defaults_match_reference() {
        let config = ControlConfig::default();
        assert_eq!(config.recv_timeout, Duration::from_millis(1000));
        assert_eq!(config.send_timeout, Duration::from_millis(100));
        assert_eq!(config.reconnect_min, Duration::from_millis(250));
        assert_eq!(config.reconnect_max, Duration::ZERO);
        assert_eq!(PublisherConfig::default().max_send_interval, Duration::from_millis(100));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let config = PublisherConfig {
            max_send_interval: Duration::from_millis(40),
            ..PublisherConfig::default()
        };
        let bytes = postcard::to_allocvec(&config).unwrap();
        let back: PublisherConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn control_config_keeps_address() {
        let address = Address::ipc("/tmp/scenewire-control.sock");
        let config = ControlConfig::new(address.clone());
        assert_eq!(config.address, address);
        assert_eq!(config.send_timeout, ControlConfig::default().send_timeout);
    }
}
