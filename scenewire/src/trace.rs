//! Logging for scenewire.
//!
//! Events are emitted with `tracing` when the `tracing` feature is on and
//! compile to nothing otherwise. Levels follow one convention across the
//! crate: `info` for session lifecycle (opened, resumed, closed, listening),
//! `debug` for link churn and retries, `warn` for failures the component
//! recovers from on its own, and `error` only for faults on the dispatch
//! thread. Events carry structured fields named `connection`, `pipe`,
//! `address` and `error` rather than formatted prose.

/// Filter directives read before `RUST_LOG`.
#[cfg(feature = "tracing")]
pub const LOG_ENV: &str = "SCENEWIRE_LOG";

#[cfg(feature = "tracing")]
const DEFAULT_FILTER: &str = "scenewire=info";

/// Installs a global fmt subscriber.
///
/// The filter comes from `SCENEWIRE_LOG`, then `RUST_LOG`, then
/// `scenewire=info`. Output goes to stderr with time-since-start stamps and
/// thread names, so dispatch-thread events stand out. Does nothing if a subscriber
/// is already installed or the `tracing` feature is off.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    discard as debug, discard as error, discard as info, discard as trace, discard as warn,
};
