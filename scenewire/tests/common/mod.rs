//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use scenewire::Address;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        scenewire::init_tracing();
    });
}

/// A fresh `ipc://` address no other test uses.
pub fn unique_ipc(name: &str) -> Address {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let path = std::env::temp_dir().join(format!(
        "scenewire-{}-{}-{}.sock",
        name,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    Address::ipc(path)
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn socket_addr(address: &Address) -> SocketAddr {
    match address {
        Address::Tcp(addr) => *addr,
        Address::Ipc(path) => panic!("expected a tcp address, got {}", path.display()),
    }
}

/// TCP forwarder whose connections can be cut to simulate link loss while
/// both endpoints stay alive.
pub struct Proxy {
    address: Address,
    live: Arc<Mutex<Vec<TcpStream>>>,
}

impl Proxy {
    pub fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
        let address = Address::from(listener.local_addr().expect("proxy addr"));
        let live = Arc::new(Mutex::new(Vec::new()));

        let tracked = Arc::clone(&live);
        thread::Builder::new()
            .name("test-proxy".into())
            .spawn(move || {
                for downstream in listener.incoming() {
                    let Ok(downstream) = downstream else { continue };
                    let Ok(upstream) = TcpStream::connect(upstream) else {
                        continue;
                    };
                    let mut tracked = tracked.lock().unwrap();
                    tracked.push(downstream.try_clone().unwrap());
                    tracked.push(upstream.try_clone().unwrap());
                    forward(downstream.try_clone().unwrap(), upstream.try_clone().unwrap());
                    forward(upstream, downstream);
                }
            })
            .expect("spawn proxy");

        Self { address, live }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Cuts every forwarded connection. New connections are still accepted.
    pub fn sever(&self) {
        for stream in self.live.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn forward(mut from: TcpStream, mut to: TcpStream) {
    thread::spawn(move || {
        let _ = io::copy(&mut from, &mut to);
        let _ = to.shutdown(Shutdown::Both);
    });
}
