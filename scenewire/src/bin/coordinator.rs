//! Scene coordinator daemon.
//!
//! Answers control handshakes from input instances, gives every session its
//! own metadata listener, and periodically broadcasts the latest metadata of
//! all sessions to monitors.
//!
//! # Usage
//!
//! ```sh
//! scenewire-coordinator --control tcp://127.0.0.1:47100 --broadcast tcp://127.0.0.1:47101
//! ```
//!
//! Runs until the process is terminated.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;

use scenewire::channel::{Channel, Pull};
use scenewire::config::Endpoints;
use scenewire::control::{ConnectionId, ControlServer, SessionEvent};
use scenewire::scene::SceneEntry;
use scenewire::{Address, ErrorCode, Message, Runtime, SceneBroadcaster, TransportError};

/// scenewire-coordinator - aggregate instance metadata into one scene
#[derive(Parser)]
#[command(name = "scenewire-coordinator", version)]
struct Cli {
    /// Control endpoint input instances dial
    #[arg(short, long, default_value_t = Endpoints::default().control)]
    control: Address,

    /// Endpoint monitors subscribe to
    #[arg(short, long, default_value_t = Endpoints::default().broadcast)]
    broadcast: Address,

    /// Interface the per-session metadata listeners bind to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    publish_host: IpAddr,

    /// Broadcast period in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,
}

/// Latest metadata per session, plus the listener it arrives on.
#[derive(Default)]
struct Feeds {
    by_session: HashMap<ConnectionId, Feed>,
}

struct Feed {
    channel: Channel<Pull>,
    latest: Option<Vec<u8>>,
}

fn main() {
    scenewire::init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("scenewire-coordinator: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), TransportError> {
    let runtime = Runtime::new()?;
    let feeds = Arc::new(Mutex::new(Feeds::default()));

    let allocator = {
        let runtime = runtime.clone();
        let feeds = Arc::downgrade(&feeds);
        let host = cli.publish_host;
        move |id| open_feed(&runtime, &feeds, host, id)
    };
    let server = ControlServer::bind(&runtime, &cli.control, allocator)?;

    let closed = Arc::downgrade(&feeds);
    server.on_session_event(move |event| {
        if let SessionEvent::Closed(id) = event {
            let Some(feeds) = closed.upgrade() else {
                return;
            };
            let feed = feeds.lock().by_session.remove(id);
            drop(feed);
        }
    });

    let broadcaster = SceneBroadcaster::bind(&runtime, &cli.broadcast)?;
    eprintln!(
        "scenewire-coordinator: control on {}, broadcasting on {}",
        server.address(),
        broadcaster.address()
    );

    let interval = Duration::from_millis(cli.interval_ms.max(1));
    loop {
        thread::sleep(interval);
        let scene: Vec<SceneEntry> = {
            let feeds = feeds.lock();
            server
                .sessions()
                .into_iter()
                .map(|session| SceneEntry {
                    id: session.id,
                    details: session.details,
                    metadata: feeds
                        .by_session
                        .get(&session.id)
                        .and_then(|feed| feed.latest.clone()),
                })
                .collect()
        };
        if let Err(e) = broadcaster.broadcast(&scene) {
            eprintln!("scenewire-coordinator: broadcast failed: {e}");
        }
    }
}

/// Binds a metadata listener for a new session on an ephemeral port.
fn open_feed(
    runtime: &Runtime,
    feeds: &Weak<Mutex<Feeds>>,
    host: IpAddr,
    id: ConnectionId,
) -> Result<Address, TransportError> {
    let Some(shared) = feeds.upgrade() else {
        return Err(TransportError::from_code(ErrorCode::Closed));
    };
    let channel = Channel::<Pull>::open(runtime);
    let address = channel.listen(&Address::tcp(SocketAddr::new(host, 0)))?;
    arm_read(feeds.clone(), id, &channel);
    shared.lock().by_session.insert(
        id,
        Feed {
            channel,
            latest: None,
        },
    );
    Ok(address)
}

fn arm_read(feeds: Weak<Mutex<Feeds>>, id: ConnectionId, channel: &Channel<Pull>) {
    channel.async_read(move |completion| {
        let Some(shared) = feeds.upgrade() else {
            return;
        };
        let message = match completion.into_result() {
            Ok(message) => message,
            Err(e) if e.is_teardown() => return,
            Err(e) => {
                eprintln!("scenewire-coordinator: metadata read for {id} failed: {e}");
                Message::invalid()
            }
        };
        let mut guard = shared.lock();
        let Some(feed) = guard.by_session.get_mut(&id) else {
            return;
        };
        if let Some(body) = message.into_body() {
            feed.latest = Some(body);
        }
        arm_read(feeds, id, &feed.channel);
    });
}
