//! Control handshake between `ControlConnection` and `ControlServer`.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serial_test::serial;

use common::{Proxy, init_test_tracing, socket_addr, unique_ipc, wait_until};
use scenewire::channel::options::RecvTimeout;
use scenewire::channel::{Channel, Rep, Req};
use scenewire::codec::{decode, encode};
use scenewire::config::ControlConfig;
use scenewire::control::{
    ConnectionId, ConnectionState, ControlConnection, ControlReply, ControlRequest,
    ControlServer, SessionEvent,
};
use scenewire::{Address, Runtime};

const SETTLE: Duration = Duration::from_secs(5);

fn fast_config(address: Address) -> ControlConfig {
    ControlConfig {
        reconnect_min: Duration::from_millis(20),
        ..ControlConfig::new(address)
    }
}

fn fixed_allocator(
    address: Address,
) -> impl FnMut(ConnectionId) -> Result<Address, scenewire::TransportError> + Send + 'static {
    move |_| Ok(address.clone())
}

#[test]
#[serial]
fn handshake_assigns_connection_id() {
    init_test_tracing();
    let runtime = Runtime::new().unwrap();
    let publish = Address::localhost(4000);
    let server =
        ControlServer::bind(&runtime, &unique_ipc("control"), fixed_allocator(publish.clone()))
            .unwrap();

    let client = ControlConnection::new(&runtime, fast_config(server.address().clone()));
    assert!(client.connection_id().is_nil());
    client.connect().unwrap();

    assert!(wait_until(SETTLE, || client.state() == ConnectionState::Connected));
    let id = client.connection_id();
    assert!(!id.is_nil());
    assert_eq!(client.publish_address(), Some(publish));

    let session = server.session(id).expect("server knows the session");
    assert!(session.is_attached());
    assert_eq!(server.session_count(), 1);
}

#[test]
#[serial]
fn stored_id_resumes_the_session() {
    let runtime = Runtime::new().unwrap();
    let server = ControlServer::bind(
        &runtime,
        &unique_ipc("resume"),
        fixed_allocator(Address::localhost(4001)),
    )
    .unwrap();

    let first = ControlConnection::new(&runtime, fast_config(server.address().clone()));
    first.connect().unwrap();
    assert!(wait_until(SETTLE, || first.state() == ConnectionState::Connected));
    let id = first.connection_id();
    drop(first);
    assert!(wait_until(SETTLE, || server.session(id).is_none()));

    // A bare requester that vanishes without closing leaves a detached session.
    let req = Channel::<Req>::open(&runtime);
    req.dial(server.address()).unwrap();
    req.send(encode(&ControlRequest::NewConnection { id: None }).unwrap())
        .unwrap();
    let reply = decode::<ControlReply>(&req.read().unwrap()).unwrap();
    let ControlReply::Connected { id: kept, .. } = reply else {
        panic!("handshake rejected: {reply:?}");
    };
    assert_ne!(kept, id);
    drop(req);
    assert!(wait_until(SETTLE, || {
        server.session(kept).is_some_and(|s| !s.is_attached())
    }));

    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    server.on_session_event(move |event| log.lock().push(event.clone()));

    let second = ControlConnection::new(&runtime, fast_config(server.address().clone()));
    second.set_connection_id(kept);
    second.connect().unwrap();
    assert!(wait_until(SETTLE, || second.state() == ConnectionState::Connected));
    assert_eq!(second.connection_id(), kept);
    assert!(events.lock().contains(&SessionEvent::Resumed(kept)));
    assert!(server.session(kept).unwrap().is_attached());
}

#[test]
#[serial]
fn live_id_is_not_shared_by_a_second_instance() {
    let runtime = Runtime::new().unwrap();
    let next_port = Arc::new(AtomicU16::new(4100));
    let ports = Arc::clone(&next_port);
    let server = ControlServer::bind(&runtime, &unique_ipc("clone"), move |_| {
        Ok(Address::localhost(ports.fetch_add(1, Ordering::Relaxed)))
    })
    .unwrap();

    let original = ControlConnection::new(&runtime, fast_config(server.address().clone()));
    original.connect().unwrap();
    assert!(wait_until(SETTLE, || original.state() == ConnectionState::Connected));
    let id = original.connection_id();

    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    server.on_session_event(move |event| log.lock().push(event.clone()));

    // A copy restoring the same persisted id while the original is still linked.
    let copy = ControlConnection::new(&runtime, fast_config(server.address().clone()));
    copy.set_connection_id(id);
    copy.connect().unwrap();
    assert!(wait_until(SETTLE, || copy.state() == ConnectionState::Connected));

    let copied = copy.connection_id();
    assert_ne!(copied, id);
    assert_ne!(copy.publish_address(), original.publish_address());
    assert_eq!(server.session_count(), 2);
    assert!(!events.lock().contains(&SessionEvent::Resumed(id)));
    assert!(events.lock().iter().any(|event| matches!(
        event,
        SessionEvent::Opened { id: opened, .. } if *opened == copied
    )));

    // Each session tracks its own link.
    drop(copy);
    assert!(wait_until(SETTLE, || server.session(copied).is_none()));
    assert!(server.session(id).unwrap().is_attached());
    assert_eq!(original.state(), ConnectionState::Connected);
}

#[test]
#[serial]
fn unanswered_handshake_is_retried_on_the_same_link() {
    let runtime = Runtime::new().unwrap();
    let address = unique_ipc("silent");
    let silent = Channel::<Rep>::open(&runtime);
    silent.listen(&address).unwrap();
    silent
        .set_option(RecvTimeout(Some(Duration::from_secs(2))))
        .unwrap();

    let client = ControlConnection::new(
        &runtime,
        ControlConfig {
            recv_timeout: Duration::from_millis(100),
            ..fast_config(address)
        },
    );
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    client.on_state_change(move |state| seen.lock().push(state));
    client.connect().unwrap();

    for _ in 0..3 {
        let request = silent.read().expect("handshake request");
        assert_eq!(
            decode::<ControlRequest>(&request).unwrap(),
            ControlRequest::NewConnection { id: None }
        );
    }

    assert_eq!(silent.link_count(), 1);
    assert_ne!(client.state(), ConnectionState::Connected);
    assert!(client.connection_id().is_nil());
    let states = states.lock();
    let timed_out = states
        .windows(2)
        .filter(|pair| **pair == [ConnectionState::Disconnected, ConnectionState::Dialing])
        .count();
    assert!(timed_out >= 2, "states: {states:?}");
}

#[test]
#[serial]
fn link_loss_and_recovery_keep_the_connection_id() {
    init_test_tracing();
    let runtime = Runtime::new().unwrap();
    let server = ControlServer::bind(
        &runtime,
        &Address::localhost(0),
        fixed_allocator(Address::localhost(4002)),
    )
    .unwrap();
    let proxy = Proxy::start(socket_addr(server.address()));

    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    server.on_session_event(move |event| log.lock().push(event.clone()));

    let client = ControlConnection::new(&runtime, fast_config(proxy.address().clone()));
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    client.on_state_change(move |state| seen.lock().push(state));
    client.connect().unwrap();

    assert!(wait_until(SETTLE, || client.state() == ConnectionState::Connected));
    let id = client.connection_id();
    states.lock().clear();

    proxy.sever();
    assert!(wait_until(SETTLE, || {
        states.lock().contains(&ConnectionState::Disconnected)
    }));
    assert!(wait_until(SETTLE, || {
        events.lock().contains(&SessionEvent::Detached(id))
    }));

    assert!(wait_until(SETTLE, || client.state() == ConnectionState::Connected));
    assert_eq!(client.connection_id(), id);
    assert!(wait_until(SETTLE, || {
        events.lock().contains(&SessionEvent::Resumed(id))
    }));
    assert_eq!(server.session_count(), 1);
}

#[test]
#[serial]
fn handshake_retries_until_coordinator_appears() {
    let runtime = Runtime::new().unwrap();
    let address = unique_ipc("late");
    let client = ControlConnection::new(&runtime, fast_config(address.clone()));
    client.connect().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_ne!(client.state(), ConnectionState::Connected);

    let _server =
        ControlServer::bind(&runtime, &address, fixed_allocator(Address::localhost(4003)))
            .unwrap();
    assert!(wait_until(SETTLE, || client.state() == ConnectionState::Connected));
}

#[test]
#[serial]
fn object_details_reach_the_server() {
    let runtime = Runtime::new().unwrap();
    let server = ControlServer::bind(
        &runtime,
        &unique_ipc("details"),
        fixed_allocator(Address::localhost(4004)),
    )
    .unwrap();

    let client = ControlConnection::new(&runtime, fast_config(server.address().clone()));
    client.set_object_details(b"first".to_vec());
    client.connect().unwrap();
    assert!(wait_until(SETTLE, || client.state() == ConnectionState::Connected));
    let id = client.connection_id();
    assert!(wait_until(SETTLE, || {
        server.session(id).and_then(|s| s.details) == Some(b"first".to_vec())
    }));

    client.set_object_details(b"second".to_vec());
    assert!(wait_until(SETTLE, || {
        server.session(id).and_then(|s| s.details) == Some(b"second".to_vec())
    }));
}

#[test]
#[serial]
fn disconnect_closes_the_session_and_resets_id() {
    let runtime = Runtime::new().unwrap();
    let server = ControlServer::bind(
        &runtime,
        &unique_ipc("disconnect"),
        fixed_allocator(Address::localhost(4005)),
    )
    .unwrap();

    let client = ControlConnection::new(&runtime, fast_config(server.address().clone()));
    client.connect().unwrap();
    assert!(wait_until(SETTLE, || client.state() == ConnectionState::Connected));
    let id = client.connection_id();

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.connection_id().is_nil());
    assert_eq!(client.publish_address(), None);
    assert!(wait_until(SETTLE, || server.session(id).is_none()));

    client.disconnect();
    assert!(client.connection_id().is_nil());
}
