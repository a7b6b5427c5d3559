mod harness;

use futures::{SinkExt, StreamExt};
use harness::*;
use ssc_pair::config::{ClientConfig, RelayConfig};
use ssc_pair::error::Error;
use ssc_pair::peer::{
    open_peer_with, CaptureHints, MediaCapture, NegotiationState, TransportFactory,
};
use ssc_pair::signaling::{
    ClientStatus, MessageKind, RelayHandle, RelayServer, Role, SignalingClient, SignalingMessage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn start_relay() -> RelayHandle {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
    };
    RelayServer::bind(&config).await.unwrap().spawn().unwrap()
}

fn fast_client(url: &str) -> ClientConfig {
    ClientConfig {
        reconnect_base_ms: 50,
        reconnect_cap_ms: 200,
        ..ClientConfig::new(url)
    }
}

#[tokio::test]
async fn sender_and_receiver_connect_through_relay() {
    ssc_pair::logger::init();
    let relay = start_relay().await;

    let sender_factory = FakeFactory::auto_connecting();
    let receiver_factory = FakeFactory::auto_connecting();

    let mut sender = open_peer_with(
        Role::Sender,
        "abc",
        fast_client(&relay.url()),
        Arc::clone(&sender_factory) as Arc<dyn TransportFactory>,
        Some(FakeCapture::new() as Arc<dyn MediaCapture>),
        CaptureHints::default(),
    )
    .unwrap();
    let mut receiver = open_peer_with(
        Role::Receiver,
        "abc",
        fast_client(&relay.url()),
        Arc::clone(&receiver_factory) as Arc<dyn TransportFactory>,
        None,
        CaptureHints::default(),
    )
    .unwrap();

    // отправитель приходит первым и ждёт
    sender.negotiator.start().await.unwrap();
    let registry = relay.relay();
    wait_until("sender joined", || registry.slot("abc", Role::Sender).is_some()).await;
    assert_eq!(sender.negotiator.state(), NegotiationState::AwaitingPeer);

    receiver.negotiator.start().await.unwrap();

    wait_for_state(&mut sender.events, NegotiationState::Connected).await;
    wait_for_state(&mut receiver.events, NegotiationState::Connected).await;

    let sent = sender_factory.last();
    let received = receiver_factory.last();
    assert_eq!(sent.offers.load(Ordering::SeqCst), 1);
    assert_eq!(received.answers.load(Ordering::SeqCst), 1);
    assert_eq!(received.remote.lock().unwrap().len(), 1);
    assert_eq!(sent.remote.lock().unwrap().len(), 1);
    assert_eq!(
        sender.negotiator.connection_id(),
        receiver.negotiator.connection_id()
    );

    // кандидаты каждой стороны доходят до пира
    wait_until("candidates exchanged", || {
        !sent.applied_candidates().is_empty() && !received.applied_candidates().is_empty()
    })
    .await;
    assert_eq!(registry.session_count(), 1);

    sender.negotiator.disconnect().await;
    receiver.negotiator.disconnect().await;
    wait_until("session pruned", || registry.session_count() == 0).await;
    relay.shutdown().await;
}

#[tokio::test]
async fn forward_while_half_bound_is_dropped() {
    let relay = start_relay().await;
    let (mut ws, _) = connect_async(relay.url()).await.unwrap();

    let join = SignalingMessage::join("solo", Role::Sender).to_json().unwrap();
    ws.send(Message::Text(join)).await.unwrap();
    let registry = relay.relay();
    wait_until("join", || registry.slot("solo", Role::Sender).is_some()).await;
    let bound = registry.slot("solo", Role::Sender);

    let offer = SignalingMessage::new(MessageKind::Offer, "solo", Role::Sender)
        .to_json()
        .unwrap();
    ws.send(Message::Text(offer)).await.unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();

    // ничего не приходит обратно, соединение и реестр не меняются
    let echoed = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(echoed.is_err());
    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.slot("solo", Role::Sender), bound);
    assert!(registry.slot("solo", Role::Receiver).is_none());

    ws.close(None).await.unwrap();
    wait_until("pruned", || registry.session_count() == 0).await;
    relay.shutdown().await;
}

#[tokio::test]
async fn displaced_sender_traffic_is_dropped() {
    let relay = start_relay().await;
    let registry = relay.relay();
    let join = |role| SignalingMessage::join("abc", role).to_json().unwrap();

    let (mut old, _) = connect_async(relay.url()).await.unwrap();
    old.send(Message::Text(join(Role::Sender))).await.unwrap();
    wait_until("old sender", || registry.slot("abc", Role::Sender).is_some()).await;
    let displaced = registry.slot("abc", Role::Sender);

    let (mut receiver, _) = connect_async(relay.url()).await.unwrap();
    receiver.send(Message::Text(join(Role::Receiver))).await.unwrap();
    wait_until("receiver", || registry.slot("abc", Role::Receiver).is_some()).await;

    let (mut new, _) = connect_async(relay.url()).await.unwrap();
    new.send(Message::Text(join(Role::Sender))).await.unwrap();
    wait_until("new sender", || registry.slot("abc", Role::Sender) != displaced).await;

    let offer = |from: &str| {
        let mut message = SignalingMessage::new(MessageKind::Offer, "abc", Role::Sender);
        message.data = Some(serde_json::json!({ "from": from }));
        message.to_json().unwrap()
    };

    old.send(Message::Text(offer("old"))).await.unwrap();
    let leaked = tokio::time::timeout(Duration::from_millis(300), receiver.next()).await;
    assert!(leaked.is_err());

    new.send(Message::Text(offer("new"))).await.unwrap();
    let Some(Ok(Message::Text(text))) = within(receiver.next()).await else {
        panic!("receiver got no offer");
    };
    let delivered = SignalingMessage::from_json(&text).unwrap();
    assert_eq!(delivered.kind, MessageKind::Offer);
    assert_eq!(delivered.data, Some(serde_json::json!({ "from": "new" })));

    relay.shutdown().await;
}

#[tokio::test]
async fn disconnect_during_signaling_handshake_leaves_no_connection() {
    let (url, joins) = slow_handshake_server(Duration::from_millis(300)).await;
    let factory = FakeFactory::new();
    let peer = open_peer_with(
        Role::Receiver,
        "abc",
        fast_client(&url),
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
        None,
        CaptureHints::default(),
    )
    .unwrap();

    let starting = {
        let negotiator = Arc::clone(&peer.negotiator);
        tokio::spawn(async move { negotiator.start().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    peer.negotiator.disconnect().await;

    let result = within(starting).await.unwrap();
    assert!(matches!(result, Err(Error::InvalidState(_))));
    assert_eq!(peer.negotiator.state(), NegotiationState::Disconnected);
    assert!(!peer.client.is_open());
    assert_eq!(peer.client.status(), ClientStatus::Closed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(joins.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn client_reconnects_and_rebinds_existing_session() {
    let relay = start_relay().await;
    let registry = relay.relay();

    let receiver = SignalingClient::new(fast_client(&relay.url()), "abc", Role::Receiver);
    receiver.connect().await.unwrap();
    wait_until("receiver joined", || registry.slot("abc", Role::Receiver).is_some()).await;

    let sender = SignalingClient::new(fast_client(&relay.url()), "abc", Role::Sender);
    let readies = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&readies);
    sender.on_message(move |message| {
        if message.kind == MessageKind::Ready {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    sender.connect().await.unwrap();
    wait_until("first ready", || readies.load(Ordering::SeqCst) == 1).await;
    let first = registry.slot("abc", Role::Sender).unwrap();

    assert!(registry.evict("abc", Role::Sender));

    // повторный join занимает тот же слот той же сессии
    wait_until("rebound", || {
        registry
            .slot("abc", Role::Sender)
            .map(|id| id != first)
            .unwrap_or(false)
    })
    .await;
    wait_until("second ready", || readies.load(Ordering::SeqCst) == 2).await;
    assert_eq!(sender.status(), ClientStatus::Open);
    assert_eq!(registry.session_count(), 1);

    sender.close();
    receiver.close();
    assert_eq!(sender.status(), ClientStatus::Closed);
    relay.shutdown().await;
}

#[tokio::test]
async fn client_exhausts_attempts_when_relay_is_gone() {
    let relay = start_relay().await;
    let config = ClientConfig {
        reconnect_base_ms: 10,
        reconnect_cap_ms: 20,
        max_attempts: 2,
        ..ClientConfig::new(relay.url())
    };
    let client = SignalingClient::new(config, "gone", Role::Sender);
    client.connect().await.unwrap();

    let mut status = client.subscribe();
    relay.shutdown().await;

    within(status.wait_for(|s| *s == ClientStatus::Exhausted))
        .await
        .unwrap();
    assert!(!client.send(SignalingMessage::new(MessageKind::Offer, "gone", Role::Sender)));
    assert!(client.connect().await.is_err());
}
