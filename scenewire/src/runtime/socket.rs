//! Per-channel socket state shared between callers and the dispatcher.
//!
//! Everything protocol-specific lives here: where an outgoing message is
//! placed, which inbound frames are accepted, and how requests and replies
//! are correlated. The dispatcher only moves bytes between [`SocketCore`]
//! queues and the network.

use std::collections::VecDeque;
use std::time::Duration;

use minstant::Instant;
use parking_lot::Mutex;

use crate::aio::OpRef;
use crate::channel::options::OptionValue;
use crate::channel::protocol::ProtocolKind;
use crate::error::{ErrorCode, TransportError};
use crate::events::{ConnectionEventNotifier, PipeId};
use crate::message::Message;
use crate::runtime::wire;

pub(crate) type SocketId = u64;

/// Default per-link outbound capacity, in messages.
pub const DEFAULT_SEND_BUFFER: usize = 16;
/// Default per-socket receive queue capacity, in messages.
pub const DEFAULT_RECV_BUFFER: usize = 64;
/// Default largest accepted inbound message.
pub const DEFAULT_RECV_MAX_SIZE: usize = 1024 * 1024;
/// Default first reconnect delay.
pub const DEFAULT_RECONNECT_MIN: Duration = Duration::from_millis(100);

const REQUEST_ID_FLAG: u32 = 0x8000_0000;

/// Socket state reachable from both sides of the runtime.
pub(crate) struct SocketShared {
    pub(crate) id: SocketId,
    pub(crate) kind: ProtocolKind,
    pub(crate) core: Mutex<SocketCore>,
    pub(crate) events: ConnectionEventNotifier,
}

impl SocketShared {
    pub(crate) fn new(id: SocketId, kind: ProtocolKind) -> Self {
        Self {
            id,
            kind,
            core: Mutex::new(SocketCore::new(kind)),
            events: ConnectionEventNotifier::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SocketOptions {
    pub(crate) send_timeout: Option<Duration>,
    pub(crate) recv_timeout: Option<Duration>,
    pub(crate) send_buffer: usize,
    pub(crate) recv_buffer: usize,
    pub(crate) recv_max_size: usize,
    pub(crate) reconnect_min: Duration,
    pub(crate) reconnect_max: Duration,
    pub(crate) kernel_buffer: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_timeout: None,
            recv_timeout: None,
            send_buffer: DEFAULT_SEND_BUFFER,
            recv_buffer: DEFAULT_RECV_BUFFER,
            recv_max_size: DEFAULT_RECV_MAX_SIZE,
            reconnect_min: DEFAULT_RECONNECT_MIN,
            reconnect_max: Duration::ZERO,
            kernel_buffer: None,
        }
    }
}

/// An armed send or read waiting for the dispatcher.
pub(crate) struct PendingOp {
    pub(crate) op: OpRef,
    /// The outgoing message for sends; invalid for reads.
    pub(crate) message: Message,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_armed: bool,
}

/// Outbound frames waiting for one established link.
pub(crate) struct LinkQueue {
    pub(crate) pipe: PipeId,
    pub(crate) outbound: VecDeque<Vec<u8>>,
}

pub(crate) struct Inbound {
    pub(crate) message: Message,
    /// Request header to echo back (Rep only).
    pub(crate) reply: Option<[u8; 4]>,
}

/// Where an outgoing message went.
pub(crate) enum Placement {
    Queued,
    /// Accepted but not delivered anywhere (Pub with no subscribers, Rep
    /// whose requester went away).
    Dropped,
    Blocked(Message),
    Failed(TransportError, Message),
}

pub(crate) struct SocketCore {
    kind: ProtocolKind,
    pub(crate) options: SocketOptions,
    pub(crate) closed: bool,
    pub(crate) links: Vec<LinkQueue>,
    pub(crate) inbound: VecDeque<Inbound>,
    pub(crate) sends: VecDeque<PendingOp>,
    pub(crate) reads: VecDeque<PendingOp>,
    topics: Vec<Vec<u8>>,
    cursor: usize,
    next_request: u32,
    awaiting: Option<u32>,
    reply_to: Option<(PipeId, [u8; 4])>,
}

impl SocketCore {
    pub(crate) fn new(kind: ProtocolKind) -> Self {
        Self {
            kind,
            options: SocketOptions::default(),
            closed: false,
            links: Vec::new(),
            inbound: VecDeque::new(),
            sends: VecDeque::new(),
            reads: VecDeque::new(),
            topics: Vec::new(),
            cursor: 0,
            next_request: 0,
            awaiting: None,
            reply_to: None,
        }
    }

    pub(crate) fn apply(&mut self, option: OptionValue) -> Result<(), TransportError> {
        match option {
            OptionValue::SendTimeout(t) => self.options.send_timeout = t,
            OptionValue::RecvTimeout(t) => self.options.recv_timeout = t,
            OptionValue::SendBuffer(n) => self.options.send_buffer = n.max(1),
            OptionValue::RecvBuffer(n) => self.options.recv_buffer = n.max(1),
            OptionValue::RecvMaxSize(n) => self.options.recv_max_size = n,
            OptionValue::ReconnectMin(d) => self.options.reconnect_min = d,
            OptionValue::ReconnectMax(d) => self.options.reconnect_max = d,
            OptionValue::KernelBufferSize(n) => self.options.kernel_buffer = Some(n),
            OptionValue::Subscribe(topic) => {
                if !self.topics.contains(&topic) {
                    self.topics.push(topic);
                }
            }
            OptionValue::Unsubscribe(topic) => {
                let Some(index) = self.topics.iter().position(|t| *t == topic) else {
                    return Err(TransportError::new(
                        ErrorCode::NotFound,
                        "topic was never subscribed",
                    ));
                };
                self.topics.swap_remove(index);
            }
        }
        Ok(())
    }

    /// Places one outgoing message according to the protocol.
    pub(crate) fn place(&mut self, message: Message) -> Placement {
        if !message.is_valid() {
            return Placement::Failed(
                TransportError::new(ErrorCode::InvalidArgument, "cannot send an invalid message"),
                message,
            );
        }
        let capacity = self.options.send_buffer.max(1);
        match self.kind {
            ProtocolKind::Push => match self.next_ready_link(capacity) {
                Some(index) => {
                    self.links[index]
                        .outbound
                        .push_back(wire::frame(&[], message.body()));
                    Placement::Queued
                }
                None => Placement::Blocked(message),
            },
            ProtocolKind::Pub => {
                let frame = wire::frame(&[], message.body());
                let mut delivered = false;
                for link in &mut self.links {
                    if link.outbound.len() < capacity {
                        link.outbound.push_back(frame.clone());
                        delivered = true;
                    }
                }
                if delivered {
                    Placement::Queued
                } else {
                    Placement::Dropped
                }
            }
            ProtocolKind::Req => match self.next_ready_link(capacity) {
                Some(index) => {
                    self.next_request = self.next_request.wrapping_add(1);
                    let id = self.next_request | REQUEST_ID_FLAG;
                    self.links[index]
                        .outbound
                        .push_back(wire::frame(&id.to_be_bytes(), message.body()));
                    self.awaiting = Some(id);
                    Placement::Queued
                }
                None => Placement::Blocked(message),
            },
            ProtocolKind::Rep => {
                let Some((pipe, header)) = self.reply_to.take() else {
                    return Placement::Failed(
                        TransportError::new(ErrorCode::State, "no request to reply to"),
                        message,
                    );
                };
                match self.links.iter_mut().find(|l| l.pipe == pipe) {
                    Some(link) if link.outbound.len() < capacity => {
                        link.outbound.push_back(wire::frame(&header, message.body()));
                        Placement::Queued
                    }
                    Some(_) => {
                        self.reply_to = Some((pipe, header));
                        Placement::Blocked(message)
                    }
                    None => Placement::Dropped,
                }
            }
            ProtocolKind::Pull | ProtocolKind::Sub => Placement::Failed(
                TransportError::new(ErrorCode::NotSupported, "protocol cannot send"),
                message,
            ),
        }
    }

    fn next_ready_link(&mut self, capacity: usize) -> Option<usize> {
        let count = self.links.len();
        let index = (0..count)
            .map(|step| (self.cursor + step) % count)
            .find(|&i| self.links[i].outbound.len() < capacity)?;
        self.cursor = (index + 1) % count;
        Some(index)
    }

    /// Offers one received frame body to the socket. Returns `false` when the
    /// protocol discarded it.
    pub(crate) fn accept_inbound(&mut self, pipe: PipeId, mut body: Vec<u8>) -> bool {
        let reply = match self.kind {
            ProtocolKind::Pull => None,
            ProtocolKind::Sub => {
                let wanted = self.topics.iter().any(|t| body.starts_with(t));
                if !wanted || self.inbound_full() {
                    return false;
                }
                None
            }
            ProtocolKind::Req => {
                let Some(id) = split_header(&mut body) else {
                    return false;
                };
                if self.awaiting != Some(u32::from_be_bytes(id)) {
                    return false;
                }
                self.awaiting = None;
                None
            }
            ProtocolKind::Rep => {
                let Some(header) = split_header(&mut body) else {
                    return false;
                };
                Some(header)
            }
            ProtocolKind::Push | ProtocolKind::Pub => return false,
        };
        self.inbound.push_back(Inbound {
            message: Message::new(body).with_pipe(pipe),
            reply,
        });
        true
    }

    /// Takes the oldest received message, remembering its return route.
    pub(crate) fn pop_inbound(&mut self) -> Option<Message> {
        let entry = self.inbound.pop_front()?;
        if let (Some(header), Some(pipe)) = (entry.reply, entry.message.pipe()) {
            self.reply_to = Some((pipe, header));
        }
        Some(entry.message)
    }

    pub(crate) fn inbound_full(&self) -> bool {
        self.inbound.len() >= self.options.recv_buffer.max(1)
    }

    /// Whether links should stop being read until the queue drains. Sub drops
    /// instead of pausing.
    pub(crate) fn should_pause(&self) -> bool {
        self.kind != ProtocolKind::Sub && self.inbound_full()
    }

    pub(crate) fn add_link(&mut self, pipe: PipeId) {
        self.links.push(LinkQueue {
            pipe,
            outbound: VecDeque::new(),
        });
    }

    pub(crate) fn remove_link(&mut self, pipe: PipeId) {
        self.links.retain(|l| l.pipe != pipe);
        if self.cursor >= self.links.len() {
            self.cursor = 0;
        }
    }

    pub(crate) fn drain_link(&mut self, pipe: PipeId) -> Vec<Vec<u8>> {
        self.links
            .iter_mut()
            .find(|l| l.pipe == pipe)
            .map(|l| l.outbound.drain(..).collect())
            .unwrap_or_default()
    }

    /// Removes the pending send or read belonging to an operation generation.
    pub(crate) fn take_op(&mut self, aio: u64, generation: u64) -> Option<PendingOp> {
        let matches = |p: &PendingOp| p.op.aio_id() == aio && p.op.generation() == generation;
        if let Some(index) = self.sends.iter().position(matches) {
            return self.sends.remove(index);
        }
        let index = self.reads.iter().position(matches)?;
        self.reads.remove(index)
    }
}

fn split_header(body: &mut Vec<u8>) -> Option<[u8; 4]> {
    let header = *body.first_chunk::<4>()?;
    body.drain(..4);
    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_body(frame: &[u8]) -> &[u8] {
        &frame[8..]
    }

    fn core_with_links(kind: ProtocolKind, links: u64) -> SocketCore {
        let mut core = SocketCore::new(kind);
        for pipe in 1..=links {
            core.add_link(PipeId::new(pipe));
        }
        core
    }

    #[test]
    fn push_round_robins_and_blocks_when_full() {
        let mut core = core_with_links(ProtocolKind::Push, 2);
        core.options.send_buffer = 1;

        assert!(matches!(core.place(Message::from("a")), Placement::Queued));
        assert!(matches!(core.place(Message::from("b")), Placement::Queued));
        assert_eq!(core.links[0].outbound.len(), 1);
        assert_eq!(core.links[1].outbound.len(), 1);

        let Placement::Blocked(back) = core.place(Message::from("c")) else {
            panic!("expected backpressure");
        };
        assert_eq!(back.body(), b"c");
    }

    #[test]
    fn push_without_links_blocks() {
        let mut core = SocketCore::new(ProtocolKind::Push);
        assert!(matches!(
            core.place(Message::from("x")),
            Placement::Blocked(_)
        ));
    }

    #[test]
    fn pub_fans_out_and_never_blocks() {
        let mut core = core_with_links(ProtocolKind::Pub, 2);
        assert!(matches!(core.place(Message::from("s")), Placement::Queued));
        assert_eq!(frame_body(&core.links[0].outbound[0]), b"s");
        assert_eq!(frame_body(&core.links[1].outbound[0]), b"s");

        let mut lonely = SocketCore::new(ProtocolKind::Pub);
        assert!(matches!(lonely.place(Message::from("s")), Placement::Dropped));
    }

    #[test]
    fn sub_filters_by_topic_prefix() {
        let mut core = SocketCore::new(ProtocolKind::Sub);
        assert!(!core.accept_inbound(PipeId::new(1), b"scene".to_vec()));

        core.apply(OptionValue::Subscribe(b"sc".to_vec())).unwrap();
        assert!(core.accept_inbound(PipeId::new(1), b"scene".to_vec()));
        assert!(!core.accept_inbound(PipeId::new(1), b"other".to_vec()));

        core.apply(OptionValue::Unsubscribe(b"sc".to_vec())).unwrap();
        assert!(!core.accept_inbound(PipeId::new(1), b"scene".to_vec()));
        assert_eq!(
            core.apply(OptionValue::Unsubscribe(b"sc".to_vec()))
                .unwrap_err()
                .code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn sub_drops_when_queue_is_full() {
        let mut core = SocketCore::new(ProtocolKind::Sub);
        core.options.recv_buffer = 1;
        core.apply(OptionValue::Subscribe(Vec::new())).unwrap();
        assert!(core.accept_inbound(PipeId::new(1), b"1".to_vec()));
        assert!(!core.accept_inbound(PipeId::new(1), b"2".to_vec()));
        assert!(!core.should_pause());
    }

    #[test]
    fn req_accepts_only_the_matching_reply() {
        let mut core = core_with_links(ProtocolKind::Req, 1);
        assert!(matches!(core.place(Message::from("ping")), Placement::Queued));

        let sent = core.links[0].outbound.pop_front().unwrap();
        let id: [u8; 4] = frame_body(&sent)[..4].try_into().unwrap();
        assert_eq!(id[0] & 0x80, 0x80);

        let mut stale = vec![0x80, 0, 0, 99];
        stale.extend_from_slice(b"old");
        assert!(!core.accept_inbound(PipeId::new(1), stale));

        let mut reply = id.to_vec();
        reply.extend_from_slice(b"pong");
        assert!(core.accept_inbound(PipeId::new(1), reply.clone()));
        assert_eq!(core.pop_inbound().unwrap().body(), b"pong");

        // A duplicate of an already answered request is discarded.
        assert!(!core.accept_inbound(PipeId::new(1), reply));
    }

    #[test]
    fn rep_routes_reply_to_requesting_link() {
        let mut core = core_with_links(ProtocolKind::Rep, 2);
        let Placement::Failed(err, _) = core.place(Message::from("early")) else {
            panic!("reply without request must fail");
        };
        assert_eq!(err.code(), ErrorCode::State);

        let mut request = vec![0x80, 0, 0, 7];
        request.extend_from_slice(b"hi");
        assert!(core.accept_inbound(PipeId::new(2), request));
        let received = core.pop_inbound().unwrap();
        assert_eq!(received.body(), b"hi");
        assert_eq!(received.pipe(), Some(PipeId::new(2)));

        assert!(matches!(core.place(Message::from("hi")), Placement::Queued));
        assert!(core.links[0].outbound.is_empty());
        let reply = core.links[1].outbound.pop_front().unwrap();
        assert_eq!(frame_body(&reply), &[0x80, 0, 0, 7, b'h', b'i']);
    }

    #[test]
    fn rep_reply_for_vanished_link_is_dropped() {
        let mut core = core_with_links(ProtocolKind::Rep, 1);
        assert!(core.accept_inbound(PipeId::new(1), vec![0x80, 0, 0, 1]));
        core.pop_inbound().unwrap();
        core.remove_link(PipeId::new(1));
        assert!(matches!(core.place(Message::from("late")), Placement::Dropped));
    }

    #[test]
    fn invalid_message_is_rejected() {
        let mut core = core_with_links(ProtocolKind::Push, 1);
        let Placement::Failed(err, _) = core.place(Message::invalid()) else {
            panic!("invalid message must not be queued");
        };
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
