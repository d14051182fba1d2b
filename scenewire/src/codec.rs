//! Payload encoding for typed messages.
//!
//! Snapshot and scene types are opaque to the transport; anything that is
//! `Serialize + Deserialize` travels as a postcard-encoded [`Message`] body.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::message::Message;

/// Marker trait for types that can travel inside a [`Message`].
///
/// Automatically implemented for all `Serialize + DeserializeOwned` types.
pub trait Wire: Serialize + DeserializeOwned {}
impl<T> Wire for T where T: Serialize + DeserializeOwned {}

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message carried no body at all.
    #[error("received an invalid message")]
    Invalid,
    /// The message body was empty.
    #[error("empty payload")]
    Empty,
    /// The value could not be serialized.
    #[error("serialization failed: {0}")]
    Serialize(#[source] postcard::Error),
    /// The body is not a valid encoding of the expected type.
    #[error("malformed payload: {0}")]
    Deserialize(#[source] postcard::Error),
    /// The body decoded but left unconsumed bytes behind.
    #[error("malformed payload: {0} trailing bytes")]
    TrailingBytes(usize),
}

/// Serializes `value` into a new message.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if the value cannot be represented.
pub fn encode<T: Wire>(value: &T) -> Result<Message, CodecError> {
    postcard::to_allocvec(value)
        .map(Message::new)
        .map_err(CodecError::Serialize)
}

/// Deserializes a message body into `T`.
///
/// # Errors
///
/// Returns an error for invalid or empty messages, malformed bodies, and
/// bodies with trailing garbage.
pub fn decode<T: Wire>(message: &Message) -> Result<T, CodecError> {
    if !message.is_valid() {
        return Err(CodecError::Invalid);
    }
    if message.is_empty() {
        return Err(CodecError::Empty);
    }
    let (value, rest) =
        postcard::take_from_bytes::<T>(message.body()).map_err(CodecError::Deserialize)?;
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        gain: f32,
        azimuth: f32,
        name: String,
    }

    #[test]
    fn roundtrip_sample() {
        let sample = Sample {
            gain: 0.5,
            azimuth: -30.0,
            name: "object 1".into(),
        };
        let msg = encode(&sample).unwrap();
        assert_eq!(decode::<Sample>(&msg).unwrap(), sample);
    }

    #[test]
    fn rejects_empty_and_invalid() {
        assert!(matches!(
            decode::<Sample>(&Message::empty()),
            Err(CodecError::Empty)
        ));
        assert!(matches!(
            decode::<Sample>(&Message::invalid()),
            Err(CodecError::Invalid)
        ));
    }

    #[test]
    fn rejects_garbage_and_trailing_bytes() {
        assert!(matches!(
            decode::<Sample>(&Message::new(vec![0xff; 3])),
            Err(CodecError::Deserialize(_))
        ));

        let mut body = encode(&7u32).unwrap().into_body().unwrap();
        body.extend_from_slice(&[1, 2]);
        assert!(matches!(
            decode::<u32>(&Message::new(body)),
            Err(CodecError::TrailingBytes(2))
        ));
    }
}
