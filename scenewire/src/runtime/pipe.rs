//! One network link as seen by the dispatcher.

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::events::PipeId;
use crate::net::stream::Stream;
use crate::runtime::socket::SocketShared;
use crate::runtime::wire::{self, FrameReader, HEADER_LEN, WireError};

pub(crate) type DialerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipePhase {
    /// Non-blocking connect still in progress.
    Connecting,
    /// Connected; exchanging link headers.
    Handshaking,
    /// Headers validated; frames flow.
    Ready,
}

#[derive(Debug, Error)]
pub(crate) enum PipeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What one round of reading produced.
#[derive(Default)]
pub(crate) struct Received {
    pub(crate) became_ready: bool,
    pub(crate) frames: Vec<Vec<u8>>,
    pub(crate) eof: bool,
}

pub(crate) struct PipeIo {
    pub(crate) id: PipeId,
    pub(crate) socket: Arc<SocketShared>,
    pub(crate) stream: Stream,
    pub(crate) phase: PipePhase,
    pub(crate) dialer: Option<DialerId>,
    /// Reading suspended because the socket's receive queue is full.
    pub(crate) paused: bool,
    peer_header: Vec<u8>,
    reader: FrameReader,
    out: Vec<u8>,
    written: usize,
}

impl PipeIo {
    pub(crate) fn new(
        id: PipeId,
        socket: Arc<SocketShared>,
        stream: Stream,
        dialer: Option<DialerId>,
        connecting: bool,
        max_frame: usize,
    ) -> Self {
        let mut pipe = Self {
            id,
            socket,
            stream,
            phase: PipePhase::Connecting,
            dialer,
            paused: false,
            peer_header: Vec::with_capacity(HEADER_LEN),
            reader: FrameReader::new(max_frame),
            out: Vec::new(),
            written: 0,
        };
        if !connecting {
            pipe.begin_handshake();
        }
        pipe
    }

    /// Queues our link header; called once the transport connection exists.
    pub(crate) fn begin_handshake(&mut self) {
        self.phase = PipePhase::Handshaking;
        self.out.extend_from_slice(&wire::header(self.socket.kind));
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        self.written < self.out.len()
    }

    pub(crate) fn queue(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            self.out.extend_from_slice(&frame);
        }
    }

    /// Writes as much buffered output as the socket accepts.
    pub(crate) fn write_pending(&mut self) -> io::Result<()> {
        while self.has_pending_output() {
            match self.stream.write(&self.out[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.out.clear();
        self.written = 0;
        Ok(())
    }

    /// Reads until the socket would block, validating the peer header and
    /// splitting the byte stream into frames.
    pub(crate) fn receive(&mut self, scratch: &mut [u8]) -> Result<Received, PipeError> {
        let mut received = Received::default();
        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    received.eof = true;
                    break;
                }
                Ok(n) => self.ingest(&scratch[..n], &mut received)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(received)
    }

    fn ingest(&mut self, mut bytes: &[u8], received: &mut Received) -> Result<(), PipeError> {
        if self.phase == PipePhase::Handshaking {
            let take = (HEADER_LEN - self.peer_header.len()).min(bytes.len());
            self.peer_header.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            let Some(header) = self.peer_header.first_chunk::<HEADER_LEN>() else {
                return Ok(());
            };
            wire::check_header(*header, self.socket.kind.peer())?;
            self.phase = PipePhase::Ready;
            received.became_ready = true;
        }
        if self.phase == PipePhase::Ready {
            self.reader.extend(bytes);
            while let Some(frame) = self.reader.next_frame()? {
                received.frames.push(frame);
            }
        }
        Ok(())
    }
}
