//! Link lifecycle notifications.
//!
//! Every channel owns a [`ConnectionEventNotifier`]. The dispatcher fires
//! it exactly once when a link finishes its handshake and once when that
//! link goes away, passing the link's [`PipeId`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::trace::error;

/// Identifies one physical link (pipe) of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl PipeId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe:{}", self.0)
    }
}

type LinkHandler = Arc<dyn Fn(PipeId) + Send + Sync>;

/// Per-channel link-up / link-down callbacks.
///
/// Handlers run on the dispatch thread. They must not block, and must not
/// wait on the channel that fired them.
#[derive(Default)]
pub struct ConnectionEventNotifier {
    established: Mutex<Option<LinkHandler>>,
    lost: Mutex<Option<LinkHandler>>,
}

impl ConnectionEventNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers the link-established handler, replacing any previous one.
    pub fn on_link_established(&self, handler: impl Fn(PipeId) + Send + Sync + 'static) {
        *self.established.lock() = Some(Arc::new(handler));
    }

    /// Registers the link-lost handler, replacing any previous one.
    pub fn on_link_lost(&self, handler: impl Fn(PipeId) + Send + Sync + 'static) {
        *self.lost.lock() = Some(Arc::new(handler));
    }

    /// Removes both handlers.
    pub fn clear(&self) {
        let established = self.established.lock().take();
        let lost = self.lost.lock().take();
        drop((established, lost));
    }

    pub(crate) fn link_established(&self, pipe: PipeId) {
        let handler = self.established.lock().clone();
        if let Some(handler) = handler {
            invoke(&handler, pipe, "link-established");
        }
    }

    pub(crate) fn link_lost(&self, pipe: PipeId) {
        let handler = self.lost.lock().clone();
        if let Some(handler) = handler {
            invoke(&handler, pipe, "link-lost");
        }
    }
}

fn invoke(handler: &LinkHandler, pipe: PipeId, event: &'static str) {
    if catch_unwind(AssertUnwindSafe(|| handler(pipe))).is_err() {
        error!(%pipe, event, "link event handler panicked");
    }
}

impl fmt::Debug for ConnectionEventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEventNotifier")
            .field("established", &self.established.lock().is_some())
            .field("lost", &self.lost.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn registering_replaces_previous_handler() {
        let notifier = ConnectionEventNotifier::new();
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));

        let f = Arc::clone(&first);
        notifier.on_link_established(move |pipe| {
            f.store(pipe.get(), Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        notifier.on_link_established(move |pipe| {
            s.store(pipe.get(), Ordering::SeqCst);
        });

        notifier.link_established(PipeId::new(9));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn clear_silences_both_events() {
        let notifier = ConnectionEventNotifier::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        notifier.on_link_lost(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        notifier.link_lost(PipeId::new(1));
        notifier.clear();
        notifier.link_lost(PipeId::new(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let notifier = ConnectionEventNotifier::new();
        notifier.on_link_established(|_| panic!("boom"));
        notifier.link_established(PipeId::new(3));
    }
}
