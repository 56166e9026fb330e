use super::*;

use serde::Serialize;

#[derive(Serialize)]
struct Ping {
    value: &'static str,
}

#[tokio::test]
async fn fanout_reaches_only_registered_recipients() {
    let registry = LiveRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _session = registry.register(UserId(20), tx);

    let delivered = registry.fanout(&[UserId(20), UserId(99)], &Ping { value: "hi" });
    assert_eq!(delivered, 1);

    let frame = rx.recv().await.expect("frame");
    assert_eq!(frame, r#"{"value":"hi"}"#);
    assert!(rx.try_recv().is_err(), "exactly one send per message");
}

#[tokio::test]
async fn fanout_to_nobody_is_a_no_op() {
    let registry = LiveRegistry::new();
    assert_eq!(registry.fanout(&[UserId(1)], &Ping { value: "hi" }), 0);
}

#[tokio::test]
async fn new_registration_supersedes_the_previous_one() {
    let registry = LiveRegistry::new();
    let (old_tx, mut old_rx) = mpsc::unbounded_channel();
    let (new_tx, mut new_rx) = mpsc::unbounded_channel();

    let old_session = registry.register(UserId(1), old_tx);
    let _new_session = registry.register(UserId(1), new_tx);
    assert_eq!(registry.connected_count(), 1);

    registry.fanout(&[UserId(1)], &Ping { value: "hi" });
    assert!(old_rx.try_recv().is_err());
    assert!(new_rx.try_recv().is_ok());

    // The superseded connection's cleanup must not evict its successor.
    drop(old_session);
    assert!(registry.is_connected(UserId(1)));
}

#[tokio::test]
async fn dropping_the_session_unregisters() {
    let registry = LiveRegistry::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let session = registry.register(UserId(1), tx);
    assert!(registry.is_connected(UserId(1)));

    drop(session);
    assert!(!registry.is_connected(UserId(1)));
}

#[tokio::test]
async fn unregister_is_silent_when_absent() {
    let registry = LiveRegistry::new();
    registry.unregister(UserId(42));
    assert_eq!(registry.connected_count(), 0);
}

#[tokio::test]
async fn closed_handle_is_skipped_without_error() {
    let registry = LiveRegistry::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let _session = registry.register(UserId(1), tx);
    drop(rx);

    assert_eq!(registry.fanout(&[UserId(1)], &Ping { value: "hi" }), 0);
}
