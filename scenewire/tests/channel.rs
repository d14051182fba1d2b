//! Channel behaviour over real sockets.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use serial_test::serial;

use common::{init_test_tracing, unique_ipc, wait_until};
use scenewire::channel::options::{RecvTimeout, SendTimeout, Subscribe, Unsubscribe};
use scenewire::channel::{Channel, Pub, Pull, Push, Rep, Req, Sub};
use scenewire::{Address, AsyncOperation, ErrorCode, Message, Runtime};

const SETTLE: Duration = Duration::from_secs(5);

#[test]
#[serial]
fn req_rep_echo_is_byte_identical() {
    init_test_tracing();
    let runtime = Runtime::new().unwrap();
    let address = unique_ipc("echo");

    let rep = Channel::<Rep>::open(&runtime);
    rep.listen(&address).unwrap();
    let req = Channel::<Req>::open(&runtime);
    req.dial(&address).unwrap();

    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let server = std::thread::spawn(move || {
        let request = rep.read().expect("request");
        rep.send(Message::new(request.body())).expect("reply");
        rep
    });

    req.send(Message::new(payload.clone())).unwrap();
    let reply = req.read().unwrap();
    assert_eq!(reply.body(), payload.as_slice());
    assert!(reply.pipe().is_some());
    drop(server.join().unwrap());
}

#[test]
#[serial]
fn push_pull_over_tcp_preserves_order() {
    let runtime = Runtime::new().unwrap();
    let pull = Channel::<Pull>::open(&runtime);
    let address = pull.listen(&Address::localhost(0)).unwrap();
    assert_ne!(address.port(), Some(0));

    let push = Channel::<Push>::open(&runtime);
    push.dial(&address).unwrap();
    for i in 0..20u8 {
        push.send(Message::new(vec![i])).unwrap();
    }
    for i in 0..20u8 {
        assert_eq!(pull.read().unwrap().body(), &[i]);
    }
}

#[test]
#[serial]
fn try_send_without_link_is_not_accepted() {
    let runtime = Runtime::new().unwrap();
    let push = Channel::<Push>::open(&runtime);
    push.dial(&unique_ipc("nobody")).unwrap();
    assert!(!push.try_send("dropped".into()).unwrap());
}

#[test]
#[serial]
fn blocking_send_times_out_without_link() {
    let runtime = Runtime::new().unwrap();
    let push = Channel::<Push>::open(&runtime);
    push.set_option(SendTimeout(Some(Duration::from_millis(50))))
        .unwrap();
    push.dial(&unique_ipc("nobody")).unwrap();

    let started = Instant::now();
    let err = push.send("late".into()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
#[serial]
fn read_times_out() {
    let runtime = Runtime::new().unwrap();
    let pull = Channel::<Pull>::open(&runtime);
    pull.set_option(RecvTimeout(Some(Duration::from_millis(30))))
        .unwrap();
    pull.listen(&unique_ipc("quiet")).unwrap();
    assert_eq!(pull.read().unwrap_err().code(), ErrorCode::TimedOut);
    assert_eq!(pull.try_read().unwrap(), None);
}

#[test]
#[serial]
fn cancel_in_flight_read_reports_canceled_without_payload() {
    let runtime = Runtime::new().unwrap();
    let pull = Channel::<Pull>::open(&runtime);
    pull.listen(&unique_ipc("cancel")).unwrap();

    let (tx, rx) = bounded(1);
    pull.async_read(move |completion| {
        tx.send(completion).unwrap();
    });
    assert!(pull.is_busy());
    pull.cancel();

    let completion = rx.recv_timeout(SETTLE).expect("handler ran");
    assert!(completion.error().unwrap().is_canceled());
    assert!(!completion.message().is_valid());
    pull.wait();
    assert!(!pull.is_busy());
}

#[test]
#[serial]
fn stop_on_idle_operation_returns_immediately() {
    let runtime = Runtime::new().unwrap();
    let op = AsyncOperation::new(&runtime);
    let started = Instant::now();
    op.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(op.is_stopped());

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    op.sleep(Duration::from_millis(1), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn failed_send_hands_the_message_back() {
    let runtime = Runtime::new().unwrap();
    let push = Channel::<Push>::open(&runtime);
    push.set_option(SendTimeout(Some(Duration::from_millis(10))))
        .unwrap();

    let (tx, rx) = bounded(1);
    push.async_send(Message::new(b"keep me".to_vec()), move |completion| {
        tx.send(completion).unwrap();
    });
    let completion = rx.recv_timeout(SETTLE).unwrap();
    assert_eq!(completion.error().unwrap().code(), ErrorCode::TimedOut);
    assert_eq!(completion.message().body(), b"keep me");
}

#[test]
#[serial]
fn subscriber_receives_only_subscribed_topics() {
    let runtime = Runtime::new().unwrap();
    let address = unique_ipc("topics");
    let publisher = Channel::<Pub>::open(&runtime);
    publisher.listen(&address).unwrap();

    let news = Channel::<Sub>::open(&runtime);
    news.set_option(Subscribe::topic("news/")).unwrap();
    news.dial(&address).unwrap();

    let silent = Channel::<Sub>::open(&runtime);
    silent.set_option(Subscribe::all()).unwrap();
    silent.set_option(Unsubscribe::all()).unwrap();
    silent.dial(&address).unwrap();

    assert!(wait_until(SETTLE, || publisher.link_count() == 2));
    assert!(publisher.try_send("weather/rain".into()).unwrap());
    assert!(publisher.try_send("news/today".into()).unwrap());

    assert_eq!(news.read().unwrap().body(), b"news/today");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(silent.try_read().unwrap(), None);

    let err = silent.set_option(Unsubscribe::topic("never")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
#[serial]
fn link_events_fire_once_per_link() {
    let runtime = Runtime::new().unwrap();
    let address = unique_ipc("events");
    let pull = Channel::<Pull>::open(&runtime);

    let up = Arc::new(AtomicUsize::new(0));
    let down = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&up);
    pull.events().on_link_established(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&down);
    pull.events().on_link_lost(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    pull.listen(&address).unwrap();

    let push = Channel::<Push>::open(&runtime);
    push.dial(&address).unwrap();
    assert!(wait_until(SETTLE, || up.load(Ordering::SeqCst) == 1));
    assert_eq!(pull.link_count(), 1);

    push.close();
    assert!(wait_until(SETTLE, || down.load(Ordering::SeqCst) == 1));
    assert_eq!(up.load(Ordering::SeqCst), 1);
    assert_eq!(pull.link_count(), 0);
}

#[test]
#[serial]
fn dialer_reconnects_after_listener_restarts() {
    let runtime = Runtime::new().unwrap();
    let address = unique_ipc("redial");
    let push = Channel::<Push>::open(&runtime);
    push.dial(&address).unwrap();

    let first = Channel::<Pull>::open(&runtime);
    first.listen(&address).unwrap();
    push.send("one".into()).unwrap();
    assert_eq!(first.read().unwrap().body(), b"one");
    drop(first);

    assert!(wait_until(SETTLE, || push.link_count() == 0));
    let second = Channel::<Pull>::open(&runtime);
    second.listen(&address).unwrap();
    push.send("two".into()).unwrap();
    assert_eq!(second.read().unwrap().body(), b"two");
}

#[test]
#[serial]
fn second_listener_on_live_address_is_refused() {
    let runtime = Runtime::new().unwrap();
    let address = unique_ipc("busy");
    let first = Channel::<Pull>::open(&runtime);
    first.listen(&address).unwrap();

    let second = Channel::<Pull>::open(&runtime);
    let err = second.listen(&address).unwrap_err();
    assert_eq!(err.code(), ErrorCode::AddressInUse);
}
