//! The dispatch thread's event loop.
//!
//! A single mio [`Poll`] drives every listener, dialer and link of the
//! runtime. Each iteration:
//!
//! 1. handles socket readiness (accept, connect completion, read, write),
//! 2. drains the command queue,
//! 3. fires expired timers (operation deadlines, sleeps, redials),
//! 4. services sockets whose queues changed.
//!
//! Completion handlers and link events are invoked from here with no socket
//! lock held.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use minstant::Instant;
use mio::{Events, Interest, Poll, Token};

use crate::aio::{Completion, OpRef};
use crate::error::TransportError;
use crate::events::PipeId;
use crate::message::Message;
use crate::net::Address;
use crate::net::stream::{Listener, Stream};
use crate::runtime::commands::Command;
use crate::runtime::pipe::{DialerId, PipeIo, PipePhase};
use crate::runtime::socket::{PendingOp, Placement, SocketCore, SocketId, SocketShared};
use crate::trace::{debug, error, trace, warn};

pub(crate) const WAKER_TOKEN: Token = Token(0);
const READ_CHUNK: usize = 64 * 1024;
const EVENT_CAPACITY: usize = 256;

struct ListenerIo {
    socket: Arc<SocketShared>,
    listener: Listener,
}

struct Dialer {
    socket: Arc<SocketShared>,
    address: Address,
    backoff: Duration,
    pipe: Option<Token>,
}

enum TimerKey {
    Operation {
        socket: Arc<SocketShared>,
        aio: u64,
        generation: u64,
    },
    Sleep {
        aio: u64,
        generation: u64,
    },
    Redial(DialerId),
}

struct Timer {
    deadline: Instant,
    seq: u64,
    key: TimerKey,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Delay before the next reconnect attempt.
///
/// Doubles `current` up to `max`; a `max` of zero (or not above `min`) keeps
/// a constant `min` interval.
pub(crate) fn next_backoff(current: Duration, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    current.saturating_mul(2).clamp(min, max)
}

const fn token_of(pipe: PipeId) -> Token {
    Token(pipe.get() as usize)
}

pub(crate) struct Dispatcher {
    poll: Poll,
    commands: Receiver<Command>,
    sockets: HashMap<SocketId, Arc<SocketShared>>,
    listeners: HashMap<Token, ListenerIo>,
    pipes: HashMap<Token, PipeIo>,
    dialers: HashMap<DialerId, Dialer>,
    sleepers: HashMap<u64, OpRef>,
    timers: BinaryHeap<Reverse<Timer>>,
    pending: Vec<Arc<SocketShared>>,
    next_token: usize,
    next_dialer: DialerId,
    next_timer: u64,
    scratch: Box<[u8]>,
}

impl Dispatcher {
    pub(crate) fn new(poll: Poll, commands: Receiver<Command>) -> Self {
        Self {
            poll,
            commands,
            sockets: HashMap::new(),
            listeners: HashMap::new(),
            pipes: HashMap::new(),
            dialers: HashMap::new(),
            sleepers: HashMap::new(),
            timers: BinaryHeap::new(),
            pending: Vec::new(),
            next_token: WAKER_TOKEN.0,
            next_dialer: 0,
            next_timer: 0,
            scratch: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Runs until a shutdown command arrives or every runtime handle is gone.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        debug!("dispatch thread started");

        loop {
            if let Err(e) = self.poll.poll(&mut events, self.poll_timeout()) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed, stopping dispatch thread");
                break;
            }

            for event in &events {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if self.listeners.contains_key(&token) {
                    self.accept(token);
                } else {
                    let hangup =
                        event.is_error() || event.is_read_closed() || event.is_write_closed();
                    self.pipe_event(token, event.is_readable(), event.is_writable(), hangup);
                }
            }

            if !self.drain_commands() {
                break;
            }
            self.fire_timers();
            self.run_services();
        }

        self.shutdown();
        debug!("dispatch thread stopped");
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.pending.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers
            .peek()
            .map(|Reverse(timer)| timer.deadline.saturating_duration_since(Instant::now()))
    }

    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Ok(command) => self.handle(command),
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(socket) => {
                self.sockets.insert(socket.id, socket);
            }
            Command::Listen { socket, listener } => self.add_listener(socket, listener),
            Command::Dial { socket, address } => {
                let id = self.next_dialer;
                self.next_dialer += 1;
                let backoff = socket.core.lock().options.reconnect_min;
                debug!(socket = socket.id, %address, "dialing");
                self.dialers.insert(
                    id,
                    Dialer {
                        socket,
                        address,
                        backoff,
                        pipe: None,
                    },
                );
                self.dial(id);
            }
            Command::Service(socket) => self.schedule(socket),
            Command::Sleep { op, deadline } => {
                let key = TimerKey::Sleep {
                    aio: op.aio_id(),
                    generation: op.generation(),
                };
                self.sleepers.insert(op.aio_id(), op);
                self.add_timer(deadline, key);
            }
            Command::Cancel {
                socket,
                aio,
                generation,
            } => {
                if let Some((op, message)) = self.take_operation(socket.as_ref(), aio, generation) {
                    op.complete(Completion::failed(TransportError::canceled(), message));
                }
            }
            Command::Abort {
                socket,
                aio,
                generation,
            } => {
                if self
                    .take_operation(socket.as_ref(), aio, generation)
                    .is_some()
                {
                    trace!(aio, "operation aborted");
                }
            }
            Command::Close(socket) => self.close(&socket),
            Command::Shutdown => {}
        }
    }

    fn take_operation(
        &mut self,
        socket: Option<&Arc<SocketShared>>,
        aio: u64,
        generation: u64,
    ) -> Option<(OpRef, Message)> {
        if let Some(socket) = socket {
            let pending = socket.core.lock().take_op(aio, generation)?;
            return Some((pending.op, pending.message));
        }
        let current = self
            .sleepers
            .get(&aio)
            .is_some_and(|op| op.generation() == generation);
        if !current {
            return None;
        }
        self.sleepers
            .remove(&aio)
            .map(|op| (op, Message::invalid()))
    }

    fn allocate_token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    fn add_timer(&mut self, deadline: Instant, key: TimerKey) {
        self.next_timer += 1;
        self.timers.push(Reverse(Timer {
            deadline,
            seq: self.next_timer,
            key,
        }));
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        loop {
            match self.timers.peek() {
                Some(Reverse(timer)) if timer.deadline <= now => {}
                _ => return,
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                return;
            };
            match timer.key {
                TimerKey::Operation {
                    socket,
                    aio,
                    generation,
                } => {
                    let expired = socket.core.lock().take_op(aio, generation);
                    if let Some(pending) = expired {
                        trace!(socket = socket.id, aio, "operation timed out");
                        pending
                            .op
                            .complete(Completion::failed(TransportError::timed_out(), pending.message));
                    }
                }
                TimerKey::Sleep { aio, generation } => {
                    if let Some((op, _)) = self.take_operation(None, aio, generation) {
                        op.complete(Completion::done());
                    }
                }
                TimerKey::Redial(id) => self.dial(id),
            }
        }
    }

    fn add_listener(&mut self, socket: Arc<SocketShared>, mut listener: Listener) {
        let token = self.allocate_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
        {
            warn!(socket = socket.id, error = %e, "failed to register listener");
            return;
        }
        self.listeners.insert(token, ListenerIo { socket, listener });
        self.accept(token);
    }

    fn accept(&mut self, token: Token) {
        loop {
            let Some(entry) = self.listeners.get(&token) else {
                return;
            };
            match entry.listener.accept() {
                Ok(stream) => {
                    let socket = Arc::clone(&entry.socket);
                    self.add_pipe(socket, stream, None, false);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn dial(&mut self, id: DialerId) {
        let Some(dialer) = self.dialers.get(&id) else {
            return;
        };
        if dialer.pipe.is_some() {
            return;
        }
        let socket = Arc::clone(&dialer.socket);
        match Stream::connect(&dialer.address) {
            Ok(stream) => {
                let token = self.add_pipe(socket, stream, Some(id), true);
                if let Some(dialer) = self.dialers.get_mut(&id) {
                    dialer.pipe = token;
                }
                if token.is_none() {
                    self.schedule_redial(id);
                }
            }
            Err(e) => {
                trace!(address = %dialer.address, error = %e, "connect failed");
                self.schedule_redial(id);
            }
        }
    }

    fn schedule_redial(&mut self, id: DialerId) {
        let Some(dialer) = self.dialers.get_mut(&id) else {
            return;
        };
        dialer.pipe = None;
        let (min, max) = {
            let core = dialer.socket.core.lock();
            (core.options.reconnect_min, core.options.reconnect_max)
        };
        let delay = dialer.backoff;
        dialer.backoff = next_backoff(delay, min, max);
        trace!(dialer = id, delay_ms = delay.as_millis() as u64, "redial scheduled");
        self.add_timer(Instant::now() + delay, TimerKey::Redial(id));
    }

    fn add_pipe(
        &mut self,
        socket: Arc<SocketShared>,
        mut stream: Stream,
        dialer: Option<DialerId>,
        connecting: bool,
    ) -> Option<Token> {
        let token = self.allocate_token();
        let (kernel_buffer, max_frame) = {
            let core = socket.core.lock();
            (core.options.kernel_buffer, core.options.recv_max_size)
        };
        if let Err(e) = stream.configure(kernel_buffer) {
            warn!(socket = socket.id, error = %e, "failed to apply socket options");
        }
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!(socket = socket.id, error = %e, "failed to register link");
            return None;
        }
        let id = PipeId::new(token.0 as u64);
        trace!(pipe = %id, socket = socket.id, connecting, "pipe added");
        self.pipes.insert(
            token,
            PipeIo::new(id, socket, stream, dialer, connecting, max_frame),
        );
        if !connecting {
            self.flush(token);
        }
        Some(token)
    }

    fn pipe_event(&mut self, token: Token, readable: bool, writable: bool, hangup: bool) {
        let Some(pipe) = self.pipes.get_mut(&token) else {
            return;
        };
        if pipe.phase == PipePhase::Connecting {
            match pipe.stream.connect_status() {
                Ok(true) => {
                    pipe.begin_handshake();
                    self.flush(token);
                }
                Ok(false) if hangup => {
                    self.drop_pipe(token, &"connection closed while connecting");
                    return;
                }
                Ok(false) => return,
                Err(e) => {
                    self.drop_pipe(token, &e);
                    return;
                }
            }
        }
        if writable {
            self.flush(token);
        }
        if readable || hangup {
            self.read(token);
        }
    }

    /// Writes buffered output, refilling it from the link's queue once drained.
    fn flush(&mut self, token: Token) {
        let Some(pipe) = self.pipes.get_mut(&token) else {
            return;
        };
        if pipe.phase == PipePhase::Connecting {
            return;
        }
        let mut refilled = false;
        let result = loop {
            if let Err(e) = pipe.write_pending() {
                break Err(e);
            }
            if pipe.has_pending_output() || pipe.phase != PipePhase::Ready {
                break Ok(());
            }
            let frames = pipe.socket.core.lock().drain_link(pipe.id);
            if frames.is_empty() {
                break Ok(());
            }
            refilled = true;
            pipe.queue(frames);
        };
        let socket = Arc::clone(&pipe.socket);
        match result {
            Err(e) => self.drop_pipe(token, &e),
            // Link capacity freed up; blocked sends may now be placed.
            Ok(()) if refilled && !socket.core.lock().sends.is_empty() => self.schedule(socket),
            Ok(()) => {}
        }
    }

    fn read(&mut self, token: Token) {
        let received = match self.pipes.get_mut(&token) {
            None => return,
            Some(pipe) if pipe.paused || pipe.phase == PipePhase::Connecting => return,
            Some(pipe) => pipe.receive(&mut self.scratch),
        };
        match received {
            Err(e) => self.drop_pipe(token, &e),
            Ok(received) => {
                if received.became_ready {
                    self.link_up(token);
                }
                if !received.frames.is_empty() {
                    self.deliver(token, received.frames);
                }
                if received.eof {
                    self.drop_pipe(token, &"closed by peer");
                }
            }
        }
    }

    fn link_up(&mut self, token: Token) {
        let Some(pipe) = self.pipes.get(&token) else {
            return;
        };
        let (id, dialer, socket) = (pipe.id, pipe.dialer, Arc::clone(&pipe.socket));
        let reconnect_min = {
            let mut core = socket.core.lock();
            core.add_link(id);
            core.options.reconnect_min
        };
        if let Some(dialer) = dialer.and_then(|d| self.dialers.get_mut(&d)) {
            dialer.backoff = reconnect_min;
        }
        debug!(pipe = %id, protocol = %socket.kind, "link established");
        socket.events.link_established(id);
        self.schedule(socket);
    }

    fn deliver(&mut self, token: Token, frames: Vec<Vec<u8>>) {
        let Some(pipe) = self.pipes.get_mut(&token) else {
            return;
        };
        let socket = Arc::clone(&pipe.socket);
        pipe.paused = {
            let mut core = socket.core.lock();
            for body in frames {
                if !core.accept_inbound(pipe.id, body) {
                    trace!(pipe = %pipe.id, "inbound message discarded");
                }
            }
            core.should_pause()
        };
        self.schedule(socket);
    }

    fn drop_pipe(&mut self, token: Token, reason: &dyn fmt::Display) {
        let Some(mut pipe) = self.pipes.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut pipe.stream);
        if pipe.phase == PipePhase::Ready {
            pipe.socket.core.lock().remove_link(pipe.id);
            debug!(pipe = %pipe.id, %reason, "link lost");
            pipe.socket.events.link_lost(pipe.id);
        } else {
            trace!(pipe = %pipe.id, %reason, "link failed before handshake");
        }
        if let Some(dialer) = pipe.dialer {
            self.schedule_redial(dialer);
        }
    }

    fn resume(&mut self, socket: SocketId) {
        let paused: Vec<Token> = self
            .pipes
            .iter_mut()
            .filter(|(_, pipe)| pipe.paused && pipe.socket.id == socket)
            .map(|(token, pipe)| {
                pipe.paused = false;
                *token
            })
            .collect();
        for token in paused {
            self.read(token);
        }
    }

    fn schedule(&mut self, socket: Arc<SocketShared>) {
        if !self.pending.iter().any(|s| s.id == socket.id) {
            self.pending.push(socket);
        }
    }

    fn run_services(&mut self) {
        while let Some(socket) = self.pending.pop() {
            self.service(&socket);
        }
    }

    /// Matches queued reads with received messages, places queued sends,
    /// arms deadlines, then flushes links and resumes paused reads.
    fn service(&mut self, socket: &Arc<SocketShared>) {
        let mut completions = Vec::new();
        let mut deadlines = Vec::new();
        let (flush, resume) = {
            let mut guard = socket.core.lock();
            let core = &mut *guard;
            if core.closed {
                fail_all(core, &mut completions);
                (Vec::new(), false)
            } else {
                while !core.reads.is_empty() {
                    let Some(message) = core.pop_inbound() else {
                        break;
                    };
                    if let Some(pending) = core.reads.pop_front() {
                        completions.push((pending.op, Completion::received(message)));
                    }
                }

                while let Some(PendingOp {
                    op,
                    message,
                    deadline,
                    timer_armed,
                }) = core.sends.pop_front()
                {
                    match core.place(message) {
                        Placement::Queued | Placement::Dropped => {
                            completions.push((op, Completion::done()));
                        }
                        Placement::Failed(err, message) => {
                            completions.push((op, Completion::failed(err, message)));
                        }
                        Placement::Blocked(message) => {
                            core.sends.push_front(PendingOp {
                                op,
                                message,
                                deadline,
                                timer_armed,
                            });
                            break;
                        }
                    }
                }

                for pending in core.sends.iter_mut().chain(core.reads.iter_mut()) {
                    if pending.timer_armed {
                        continue;
                    }
                    pending.timer_armed = true;
                    if let Some(deadline) = pending.deadline {
                        deadlines.push((deadline, pending.op.aio_id(), pending.op.generation()));
                    }
                }

                let flush: Vec<PipeId> = core
                    .links
                    .iter()
                    .filter(|link| !link.outbound.is_empty())
                    .map(|link| link.pipe)
                    .collect();
                (flush, !core.should_pause())
            }
        };

        for (deadline, aio, generation) in deadlines {
            let key = TimerKey::Operation {
                socket: Arc::clone(socket),
                aio,
                generation,
            };
            self.add_timer(deadline, key);
        }
        for (op, completion) in completions {
            op.complete(completion);
        }
        for pipe in flush {
            self.flush(token_of(pipe));
        }
        if resume {
            self.resume(socket.id);
        }
    }

    fn close(&mut self, socket: &Arc<SocketShared>) {
        // Push out whatever was queued before the close was requested.
        self.service(socket);

        self.sockets.remove(&socket.id);
        self.pending.retain(|s| s.id != socket.id);
        socket.events.clear();

        let mut completions = Vec::new();
        {
            let mut guard = socket.core.lock();
            let core = &mut *guard;
            core.closed = true;
            fail_all(core, &mut completions);
            core.links.clear();
            core.inbound.clear();
        }

        self.dialers.retain(|_, dialer| dialer.socket.id != socket.id);

        let listeners: Vec<Token> = self
            .listeners
            .iter()
            .filter(|(_, entry)| entry.socket.id == socket.id)
            .map(|(token, _)| *token)
            .collect();
        for token in listeners {
            if let Some(mut entry) = self.listeners.remove(&token) {
                let _ = self.poll.registry().deregister(&mut entry.listener);
            }
        }

        let pipes: Vec<Token> = self
            .pipes
            .iter()
            .filter(|(_, pipe)| pipe.socket.id == socket.id)
            .map(|(token, _)| *token)
            .collect();
        for token in pipes {
            if let Some(mut pipe) = self.pipes.remove(&token) {
                let _ = pipe.write_pending();
                let _ = self.poll.registry().deregister(&mut pipe.stream);
            }
        }

        for (op, completion) in completions {
            op.complete(completion);
        }
        debug!(socket = socket.id, protocol = %socket.kind, "socket closed");
    }

    fn shutdown(&mut self) {
        let sockets: Vec<Arc<SocketShared>> = self.sockets.values().cloned().collect();
        for socket in sockets {
            self.close(&socket);
        }
        for (_, op) in self.sleepers.drain() {
            op.complete(Completion::failed(TransportError::closed(), Message::invalid()));
        }
        self.timers.clear();
    }
}

fn fail_all(core: &mut SocketCore, completions: &mut Vec<(OpRef, Completion)>) {
    for pending in core.sends.drain(..).chain(core.reads.drain(..)) {
        completions.push((
            pending.op,
            Completion::failed(TransportError::closed(), pending.message),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn backoff_doubles_up_to_max() {
        let (min, max) = (100 * MS, 350 * MS);
        let mut delay = min;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(delay);
            delay = next_backoff(delay, min, max);
        }
        assert_eq!(seen, vec![100 * MS, 200 * MS, 350 * MS, 350 * MS]);
    }

    #[test]
    fn zero_max_means_constant_interval() {
        assert_eq!(next_backoff(250 * MS, 250 * MS, Duration::ZERO), 250 * MS);
        assert_eq!(next_backoff(250 * MS, 250 * MS, 100 * MS), 250 * MS);
    }

    #[test]
    fn timers_pop_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (seq, offset) in [(1, 30), (2, 10), (3, 20), (4, 10)] {
            heap.push(Reverse(Timer {
                deadline: now + offset * MS,
                seq,
                key: TimerKey::Redial(seq),
            }));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(t)| t.seq)).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }
}
