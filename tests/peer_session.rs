use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peer_mux::peer::{
    PEER_CONNECTION_DESTROY, PEER_CONNECTION_ESTABLISHED, PEER_CONNECTION_SETUP, PEER_EVENT,
    PEER_MESSAGE,
};
use peer_mux::{
    event_callback, status_callback, Address, Connection, ConnectionStatus, ConnectionType,
    EventCallback, MemoryConnection, MemoryRelay, PeerAcceptor, PeerError, PeerSession,
    PeerSessionConfig,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};

fn unattached(relay: &MemoryRelay, address: &str) -> Arc<dyn Connection> {
    Arc::new(MemoryConnection::new(relay.clone(), Address::from(address)))
}

async fn attached(relay: &MemoryRelay, address: &str) -> Arc<dyn Connection> {
    let conn = unattached(relay, address);
    conn.connect().await.unwrap();
    conn
}

fn session(local: &str, remote: &str, conn: &Arc<dyn Connection>) -> PeerSession {
    PeerSession::new(
        Address::from(local),
        Address::from(remote),
        conn.clone(),
        PeerSessionConfig::default(),
    )
}

fn acceptor(address: &str, conn: &Arc<dyn Connection>) -> PeerAcceptor {
    PeerAcceptor::bind(Address::from(address), conn.clone(), PeerSessionConfig::default())
}

fn short_timeout() -> PeerSessionConfig {
    PeerSessionConfig::default().with_timeout(Duration::from_millis(1000))
}

fn recorder() -> (EventCallback, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = event_callback(move |payload| {
        let _ = tx.send(payload);
        async {}
    });
    (callback, rx)
}

fn counter() -> (EventCallback, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let callback = event_callback(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        async {}
    });
    (callback, hits)
}

fn status_log(session: &PeerSession) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    session.on_status_change(status_callback(move |status, _| {
        sink.lock().unwrap().push(status);
    }));
    log
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn nothing_more(rx: &mut mpsc::UnboundedReceiver<Value>) -> bool {
    timeout(Duration::from_millis(50), rx.recv()).await.is_err()
}

async fn wait_for_status(session: &PeerSession, status: ConnectionStatus) {
    while session.status() != status {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn handshake_with_acceptor_connects_both_sides() {
    let relay = MemoryRelay::new();
    let alice = unattached(&relay, "alice");
    let bob = attached(&relay, "bob").await;
    let acceptor = acceptor("bob", &bob);

    let initiator = session("alice", "bob", &alice);
    let statuses = status_log(&initiator);
    assert_eq!(initiator.status(), ConnectionStatus::New);

    initiator.connect().await.unwrap();

    assert_eq!(alice.status(), ConnectionStatus::Connected);
    assert_eq!(initiator.status(), ConnectionStatus::Connected);
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );

    let responder = acceptor.accept().await.unwrap();
    assert_eq!(responder.local_address(), &Address::from("bob"));
    assert_eq!(responder.remote_address(), &Address::from("alice"));
    assert_eq!(responder.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out_without_responder() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let _bob = attached(&relay, "bob").await;
    let initiator = PeerSession::new(
        Address::from("alice"),
        Address::from("bob"),
        alice.clone(),
        short_timeout(),
    );

    let started = Instant::now();
    let err = initiator.connect().await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(1000));
    match err {
        PeerError::HandshakeTimeout { session, timeout } => {
            assert_eq!(timeout, Duration::from_millis(1000));
            assert_eq!(session.local_address, Address::from("alice"));
            assert_eq!(session.remote_address, Some(Address::from("bob")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(initiator.status(), ConnectionStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_is_a_noop() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let (on_setup, setups) = counter();
    bob.on_event(PEER_CONNECTION_SETUP, on_setup, false);

    let initiator = PeerSession::new(
        Address::from("alice"),
        Address::from("bob"),
        alice.clone(),
        short_timeout(),
    );
    let first = tokio::spawn({
        let initiator = initiator.clone();
        async move { initiator.connect().await }
    });
    wait_for_status(&initiator, ConnectionStatus::Connecting).await;

    initiator.connect().await.unwrap();
    assert_eq!(initiator.status(), ConnectionStatus::Connecting);

    settle().await;
    assert_eq!(setups.load(Ordering::SeqCst), 1);

    let outcome = first.await.unwrap();
    assert!(matches!(outcome, Err(PeerError::HandshakeTimeout { .. })));
}

#[tokio::test]
async fn inbound_envelopes_are_filtered_by_address() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let mallory = attached(&relay, "mallory").await;

    let from_bob = session("alice", "bob", &alice);
    let from_carol = session("alice", "carol", &alice);
    let (on_bob_message, mut bob_messages) = recorder();
    let (on_bob_event, mut bob_events) = recorder();
    let (on_carol_message, mut carol_messages) = recorder();
    let (on_carol_event, mut carol_events) = recorder();
    from_bob.on_message(on_bob_message);
    from_bob.on_event("chat", on_bob_event, false);
    from_carol.on_message(on_carol_message);
    from_carol.on_event("chat", on_carol_event, false);

    let bob_side = session("bob", "alice", &bob);
    bob_side.send(json!("hi alice")).await.unwrap();
    bob_side.emit_event("chat", json!({"text": "hey"})).await.unwrap();

    // forged envelope: right target, wrong sender
    mallory
        .emit(
            "peer message",
            json!({"fromAddress": "mallory", "toAddress": "alice", "payload": "spoof"}),
        )
        .await
        .unwrap();
    mallory
        .emit(
            "peer event",
            json!({"fromAddress": "mallory", "toAddress": "alice", "event": "chat", "payload": 0}),
        )
        .await
        .unwrap();

    assert_eq!(bob_messages.recv().await, Some(json!("hi alice")));
    assert_eq!(bob_events.recv().await, Some(json!({"text": "hey"})));
    assert!(nothing_more(&mut bob_messages).await);
    assert!(nothing_more(&mut bob_events).await);
    assert!(nothing_more(&mut carol_messages).await);
    assert!(nothing_more(&mut carol_events).await);
}

#[tokio::test]
async fn once_listener_fires_exactly_once() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let receiver = session("alice", "bob", &alice);
    let sender = session("bob", "alice", &bob);

    let (once, once_hits) = counter();
    let (always, always_hits) = counter();
    receiver.on_event("x", once, true);
    receiver.on_event("x", always, false);

    sender.emit_event("x", json!(1)).await.unwrap();
    sender.emit_event("x", json!(2)).await.unwrap();
    settle().await;

    assert_eq!(once_hits.load(Ordering::SeqCst), 1);
    assert_eq!(always_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn duplicate_registration_invokes_once_per_dispatch() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let receiver = session("alice", "bob", &alice);
    let sender = session("bob", "alice", &bob);

    let (listener, hits) = counter();
    receiver.on_event("x", listener.clone(), false);
    receiver.on_event("x", listener, false);
    let (on_message, message_hits) = counter();
    receiver.on_message(on_message.clone());
    receiver.on_message(on_message);

    sender.emit_event("x", json!(null)).await.unwrap();
    sender.send(json!(null)).await.unwrap();
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(message_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closing_transport_closes_every_session_once() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let to_bob = session("alice", "bob", &alice);
    let to_carol = session("alice", "carol", &alice);
    let bob_log = status_log(&to_bob);
    let carol_log = status_log(&to_carol);

    alice.disconnect().await.unwrap();

    assert_eq!(*bob_log.lock().unwrap(), vec![ConnectionStatus::Closed]);
    assert_eq!(*carol_log.lock().unwrap(), vec![ConnectionStatus::Closed]);
}

#[tokio::test]
async fn relay_shutdown_cascades_into_sessions() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let to_bob = session("alice", "bob", &alice);
    let log = status_log(&to_bob);

    relay.shutdown();
    settle().await;

    assert_eq!(alice.status(), ConnectionStatus::Closed);
    assert_eq!(*log.lock().unwrap(), vec![ConnectionStatus::Closed]);
}

#[tokio::test]
async fn lost_transport_marks_sessions_disconnected() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let to_bob = session("alice", "bob", &alice);

    relay.drop_address(&Address::from("alice"));
    settle().await;

    assert_eq!(to_bob.status(), ConnectionStatus::Disconnected);
    // a disconnected session does not announce its teardown
    to_bob.disconnect().await.unwrap();
    assert_eq!(to_bob.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn destroy_signal_closes_session_from_any_state() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let _acceptor = acceptor("bob", &bob);

    let fresh = session("alice", "carol", &alice);
    let connected = session("alice", "bob", &alice);
    connected.connect().await.unwrap();
    assert_eq!(fresh.status(), ConnectionStatus::New);

    let bob_side = session("bob", "alice", &bob);
    bob_side.disconnect().await.unwrap();
    settle().await;

    assert_eq!(bob_side.status(), ConnectionStatus::Closed);
    assert_eq!(connected.status(), ConnectionStatus::Closed);
    // destroy is not address filtered
    assert_eq!(fresh.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn repeated_disconnect_emits_one_destroy() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let (on_destroy, destroys) = counter();
    bob.on_event(PEER_CONNECTION_DESTROY, on_destroy, false);

    let to_bob = session("alice", "bob", &alice);
    to_bob.disconnect().await.unwrap();
    to_bob.disconnect().await.unwrap();
    settle().await;

    assert_eq!(to_bob.status(), ConnectionStatus::Closed);
    assert_eq!(destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn late_established_does_not_revive_abandoned_attempt() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let initiator = PeerSession::new(
        Address::from("alice"),
        Address::from("bob"),
        alice.clone(),
        short_timeout(),
    );

    assert!(initiator.connect().await.is_err());
    assert_eq!(initiator.status(), ConnectionStatus::Failed);

    bob.emit(
        PEER_CONNECTION_ESTABLISHED,
        json!({"fromAddress": "bob", "toAddress": "alice"}),
    )
    .await
    .unwrap();
    settle().await;
    assert_eq!(initiator.status(), ConnectionStatus::Failed);

    let _acceptor = PeerAcceptor::bind(Address::from("bob"), bob.clone(), short_timeout());
    initiator.connect().await.unwrap();
    assert_eq!(initiator.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn established_for_another_pair_is_ignored() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let carol = attached(&relay, "carol").await;
    let initiator = PeerSession::new(
        Address::from("alice"),
        Address::from("bob"),
        alice.clone(),
        short_timeout(),
    );

    let pending = tokio::spawn({
        let initiator = initiator.clone();
        async move { initiator.connect().await }
    });
    wait_for_status(&initiator, ConnectionStatus::Connecting).await;

    carol
        .emit(
            PEER_CONNECTION_ESTABLISHED,
            json!({"fromAddress": "carol", "toAddress": "alice"}),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(initiator.status(), ConnectionStatus::Connecting);

    bob.emit(
        PEER_CONNECTION_ESTABLISHED,
        json!({"fromAddress": "bob", "toAddress": "alice"}),
    )
    .await
    .unwrap();

    pending.await.unwrap().unwrap();
    assert_eq!(initiator.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn acceptor_ignores_setups_for_other_addresses() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let bob_acceptor = acceptor("bob", &bob);
    let other_acceptor = acceptor("bobby", &bob);

    session("alice", "bob", &alice).connect().await.unwrap();

    let accepted = bob_acceptor.accept().await.unwrap();
    assert_eq!(accepted.remote_address(), &Address::from("alice"));
    assert!(timeout(Duration::from_millis(50), other_acceptor.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn session_works_through_the_connection_trait() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let receiver = session("bob", "alice", &bob);
    let (on_ping, mut pings) = recorder();
    receiver.on_event("ping", on_ping, false);

    let as_connection: Arc<dyn Connection> = Arc::new(session("alice", "bob", &alice));
    assert_eq!(as_connection.connection_type(), ConnectionType::Memory);
    assert_eq!(as_connection.local_address(), &Address::from("alice"));
    as_connection.emit("ping", json!(42)).await.unwrap();

    assert_eq!(pings.recv().await, Some(json!(42)));
}

#[tokio::test]
async fn message_and_event_round_trip_between_peers() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let acceptor = acceptor("bob", &bob);

    let initiator = session("alice", "bob", &alice);
    initiator.connect().await.unwrap();
    let responder = acceptor.accept().await.unwrap();

    let (on_reply, mut replies) = recorder();
    initiator.on_message(on_reply);

    let echo = responder.clone();
    responder.on_event(
        "echo",
        event_callback(move |payload| {
            let echo = echo.clone();
            async move {
                let _ = echo.send(payload).await;
            }
        }),
        false,
    );

    initiator.emit_event("echo", json!({"n": 1})).await.unwrap();
    assert_eq!(replies.recv().await, Some(json!({"n": 1})));
}

#[tokio::test]
async fn listener_awaiting_a_handshake_does_not_stall_other_sessions() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let carol = attached(&relay, "carol").await;
    let _carol_acceptor = acceptor("carol", &carol);

    let from_bob = session("alice", "bob", &alice);
    let to_carol = PeerSession::new(
        Address::from("alice"),
        Address::from("carol"),
        alice.clone(),
        short_timeout(),
    );

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let dialer = to_carol.clone();
    from_bob.on_event(
        "introduce",
        event_callback(move |_| {
            let dialer = dialer.clone();
            let tx = tx.clone();
            async move {
                let _ = tx.send(dialer.connect().await.map_err(|e| e.to_string()));
            }
        }),
        false,
    );

    session("bob", "alice", &bob)
        .emit_event("introduce", json!({"who": "carol"}))
        .await
        .unwrap();

    let outcome = timeout(Duration::from_millis(500), outcomes.recv())
        .await
        .unwrap();
    assert_eq!(outcome, Some(Ok(())));
    assert_eq!(to_carol.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn replaced_attempt_reports_aborted() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let initiator = PeerSession::new(
        Address::from("alice"),
        Address::from("bob"),
        alice.clone(),
        short_timeout(),
    );

    let first = tokio::spawn({
        let initiator = initiator.clone();
        async move { initiator.connect().await }
    });
    wait_for_status(&initiator, ConnectionStatus::Connecting).await;

    // the remote tears down while the first attempt is still waiting
    session("bob", "alice", &bob).disconnect().await.unwrap();
    wait_for_status(&initiator, ConnectionStatus::Closed).await;

    let _acceptor = acceptor("bob", &bob);
    initiator.connect().await.unwrap();

    match first.await.unwrap() {
        Err(PeerError::HandshakeAborted { session }) => {
            assert_eq!(session.remote_address, Some(Address::from("bob")));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(initiator.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn closed_transport_is_reused_without_reconnecting() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let _acceptor = acceptor("bob", &bob);
    alice.disconnect().await.unwrap();
    assert_eq!(relay.link_count(), 1);

    let initiator = PeerSession::new(
        Address::from("alice"),
        Address::from("bob"),
        alice.clone(),
        short_timeout(),
    );
    let err = initiator.connect().await.unwrap_err();

    assert!(matches!(err, PeerError::HandshakeTimeout { .. }));
    assert_eq!(alice.status(), ConnectionStatus::Closed);
    assert_eq!(relay.link_count(), 1);
}

#[tokio::test]
async fn message_callbacks_run_concurrently_and_stay_registered() {
    let relay = MemoryRelay::new();
    let alice = attached(&relay, "alice").await;
    let bob = attached(&relay, "bob").await;
    let receiver = session("alice", "bob", &alice);
    let sender = session("bob", "alice", &bob);

    let gate = Arc::new(Notify::new());
    let (tx, mut order) = mpsc::unbounded_channel();

    // the first callback only finishes once the second one has run
    let waiter = {
        let gate = gate.clone();
        let tx = tx.clone();
        event_callback(move |_| {
            let gate = gate.clone();
            let tx = tx.clone();
            async move {
                gate.notified().await;
                let _ = tx.send("waiter");
            }
        })
    };
    let opener = event_callback(move |_| {
        let gate = gate.clone();
        let tx = tx.clone();
        async move {
            gate.notify_one();
            let _ = tx.send("opener");
        }
    });
    receiver.on_message(waiter);
    receiver.on_message(opener);

    sender.send(json!(1)).await.unwrap();
    sender.send(json!(2)).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let next = timeout(Duration::from_secs(1), order.recv()).await.unwrap();
        seen.push(next.unwrap());
    }
    assert_eq!(seen, vec!["opener", "waiter", "opener", "waiter"]);
}

#[tokio::test(start_paused = true)]
async fn finished_attempts_and_dropped_sessions_leave_no_hooks() {
    let relay = MemoryRelay::new();
    let transport = Arc::new(MemoryConnection::new(relay.clone(), Address::from("alice")));
    let alice: Arc<dyn Connection> = transport.clone();
    alice.connect().await.unwrap();
    let _bob = attached(&relay, "bob").await;

    let initiator = PeerSession::new(
        Address::from("alice"),
        Address::from("bob"),
        alice.clone(),
        short_timeout(),
    );
    for _ in 0..5 {
        assert!(initiator.connect().await.is_err());
    }
    assert_eq!(transport.listener_count(PEER_CONNECTION_ESTABLISHED), 0);

    for _ in 0..5 {
        drop(session("alice", "carol", &alice));
    }
    drop(acceptor("alice", &alice));

    assert_eq!(transport.listener_count(PEER_MESSAGE), 1);
    assert_eq!(transport.listener_count(PEER_EVENT), 1);
    assert_eq!(transport.listener_count(PEER_CONNECTION_DESTROY), 1);
    assert_eq!(transport.listener_count(PEER_CONNECTION_SETUP), 0);
    assert_eq!(transport.status_subscriber_count(), 1);

    drop(initiator);
    assert_eq!(transport.listener_count(PEER_MESSAGE), 0);
    assert_eq!(transport.status_subscriber_count(), 0);
}
