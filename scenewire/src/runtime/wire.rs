//! Link header and message framing.
//!
//! ```text
//! header:  00 'S' 'P' 00 <proto hi> <proto lo> 00 00
//! frame:   <u64 big-endian length> <body ...>
//! ```

use thiserror::Error;

use crate::channel::protocol::ProtocolKind;

pub(crate) const HEADER_LEN: usize = 8;
const LENGTH_PREFIX: usize = 8;

/// Violations of the link protocol. Any of these closes the link.
#[derive(Debug, Error)]
pub(crate) enum WireError {
    #[error("malformed link header {0:02x?}")]
    BadHeader([u8; HEADER_LEN]),
    #[error("incompatible peer: expected {expected}, peer announced protocol {found:#06x}")]
    IncompatiblePeer { expected: ProtocolKind, found: u16 },
    #[error("frame of {len} bytes exceeds receive limit of {max}")]
    TooLarge { len: u64, max: usize },
}

/// The header this side announces on every new link.
pub(crate) const fn header(kind: ProtocolKind) -> [u8; HEADER_LEN] {
    let [hi, lo] = kind.wire_id().to_be_bytes();
    [0, b'S', b'P', 0, hi, lo, 0, 0]
}

/// Validates the peer's header against the protocol we can talk to.
pub(crate) fn check_header(bytes: [u8; HEADER_LEN], expected: ProtocolKind) -> Result<(), WireError> {
    if bytes[..4] != [0, b'S', b'P', 0] || bytes[6..] != [0, 0] {
        return Err(WireError::BadHeader(bytes));
    }
    let found = u16::from_be_bytes([bytes[4], bytes[5]]);
    if found != expected.wire_id() {
        return Err(WireError::IncompatiblePeer { expected, found });
    }
    Ok(())
}

/// Builds one frame: length prefix, protocol header (possibly empty), body.
pub(crate) fn frame(protocol_header: &[u8], body: &[u8]) -> Vec<u8> {
    let len = protocol_header.len() + body.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX + len);
    out.extend_from_slice(&(len as u64).to_be_bytes());
    out.extend_from_slice(protocol_header);
    out.extend_from_slice(body);
    out
}

/// Incremental frame parser over a byte stream.
pub(crate) struct FrameReader {
    buf: Vec<u8>,
    /// Largest accepted frame body; `0` disables the limit.
    max: usize,
}

impl FrameReader {
    pub(crate) const fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame body, if one is buffered.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        let Some(prefix) = self.buf.first_chunk::<LENGTH_PREFIX>() else {
            return Ok(None);
        };
        let declared = u64::from_be_bytes(*prefix);
        let len = usize::try_from(declared)
            .ok()
            .filter(|&len| self.max == 0 || len <= self.max)
            .ok_or(WireError::TooLarge {
                len: declared,
                max: self.max,
            })?;
        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        let body = self.buf[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.buf.drain(..LENGTH_PREFIX + len);
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_accepts_only_the_peer_protocol() {
        let push = header(ProtocolKind::Push);
        assert_eq!(push, [0, b'S', b'P', 0, 0x00, 0x50, 0, 0]);
        assert!(check_header(push, ProtocolKind::Push).is_ok());
        assert!(matches!(
            check_header(push, ProtocolKind::Sub),
            Err(WireError::IncompatiblePeer { found: 0x50, .. })
        ));
        assert!(matches!(
            check_header(*b"GET / HT", ProtocolKind::Push),
            Err(WireError::BadHeader(_))
        ));
    }

    #[test]
    fn frames_split_across_reads() {
        let mut bytes = frame(&[], b"hello");
        bytes.extend(frame(&[0x80, 0, 0, 1], b"req"));

        let mut reader = FrameReader::new(0);
        reader.extend(&bytes[..3]);
        assert!(reader.next_frame().unwrap().is_none());
        reader.extend(&bytes[3..15]);
        assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(reader.next_frame().unwrap().is_none());
        reader.extend(&bytes[15..]);
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(vec![0x80, 0, 0, 1, b'r', b'e', b'q'])
        );
    }

    #[test]
    fn empty_body_is_a_frame() {
        let mut reader = FrameReader::new(16);
        reader.extend(&frame(&[], b""));
        assert_eq!(reader.next_frame().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        let mut reader = FrameReader::new(4);
        reader.extend(&frame(&[], b"too long"));
        assert!(matches!(
            reader.next_frame(),
            Err(WireError::TooLarge { len: 8, max: 4 })
        ));
    }
}
