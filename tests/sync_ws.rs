//! End-to-end document sync over real WebSockets: convergence, no self-echo,
//! gateway authentication, persistence across a restart, idle destruction.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use liveshare_relay::auth::sign_identity;
use liveshare_relay::protocol::{
    decode_frame, encode_sync_step1, encode_sync_update, Frame, SyncMessage,
};
use liveshare_relay::{
    build_router, AppState, ControlHub, DocEngine, EngineConfig, IdentityClaims,
    IdentityVerifier, MemStore, Persistence, RateLimiter, RocksStore, RoomRegistry,
};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn fast_engine() -> EngineConfig {
    EngineConfig {
        persist_debounce: Duration::from_millis(100),
        idle_grace: Duration::from_millis(150),
    }
}

async fn spawn_app(
    store: Arc<dyn Persistence>,
    engine: EngineConfig,
    verifier: Option<Arc<IdentityVerifier>>,
) -> (SocketAddr, AppState) {
    let registry = Arc::new(RoomRegistry::load(store.clone()).unwrap());
    let state = AppState {
        registry,
        docs: DocEngine::new(store, engine),
        control: Arc::new(ControlHub::new()),
        verifier,
        oauth: None,
        rate_limiter: RateLimiter::default(),
        started: Instant::now(),
    };
    let app = build_router(state.clone(), "*");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, state)
}

async fn create_room(addr: SocketAddr, body: Value) -> (String, String) {
    let resp: Value = reqwest::Client::new()
        .post(format!("http://{addr}/rooms"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    (
        resp["id"].as_str().unwrap().to_string(),
        resp["token"].as_str().unwrap().to_string(),
    )
}

async fn next_binary(ws: &mut Ws) -> Vec<u8> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => return data.to_vec(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}

async fn expect_silence(ws: &mut Ws) {
    assert!(
        timeout(Duration::from_millis(200), ws.next()).await.is_err(),
        "expected no frame"
    );
}

fn full_state(doc: &yrs::Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn read_text(doc: &yrs::Doc, field: &str) -> String {
    let txn = doc.transact();
    match txn.get_text(field) {
        Some(text) => text.get_string(&txn),
        None => String::new(),
    }
}

#[tokio::test]
async fn test_two_client_text_sync() {
    let store: Arc<dyn Persistence> = Arc::new(MemStore::new());
    let (addr, _state) = spawn_app(store, fast_engine(), None).await;
    let (id, token) = create_room(addr, json!({ "name": "demo" })).await;

    let url = format!("ws://{addr}/ws/{id}:notes.md?token={token}");
    let (mut a, _) = connect_async(&url).await.unwrap();

    // The greeting is a step-1 state-vector query.
    let greeting = next_binary(&mut a).await;
    assert!(matches!(
        decode_frame(&greeting).unwrap(),
        Frame::Sync(SyncMessage::Step1(_))
    ));

    let (mut b, _) = connect_async(&url).await.unwrap();
    let _ = next_binary(&mut b).await;

    // A edits locally and pushes the update.
    let doc_a = yrs::Doc::new();
    {
        let mut txn = doc_a.transact_mut();
        let text = txn.get_or_insert_text("notes");
        text.insert(&mut txn, 0, "hello from A");
    }
    let update = full_state(&doc_a);
    a.send(Message::Binary(encode_sync_update(&update).into()))
        .await
        .unwrap();

    // B applies the forwarded frame and converges.
    let frame = next_binary(&mut b).await;
    let doc_b = yrs::Doc::new();
    match decode_frame(&frame).unwrap() {
        Frame::Sync(SyncMessage::Update(u)) => {
            let mut txn = doc_b.transact_mut();
            let _ = txn.apply_update(Update::decode_v1(u).unwrap());
        }
        other => panic!("expected update frame, got {other:?}"),
    }
    assert_eq!(read_text(&doc_b, "notes"), "hello from A");

    // The origin never hears its own update.
    expect_silence(&mut a).await;
}

#[tokio::test]
async fn test_late_joiner_catches_up_via_step1() {
    let store: Arc<dyn Persistence> = Arc::new(MemStore::new());
    let (addr, _state) = spawn_app(store, fast_engine(), None).await;
    let (id, token) = create_room(addr, json!({ "name": "demo" })).await;
    let url = format!("ws://{addr}/ws/{id}:doc?token={token}");

    let (mut a, _) = connect_async(&url).await.unwrap();
    let _ = next_binary(&mut a).await;

    let doc_a = yrs::Doc::new();
    {
        let mut txn = doc_a.transact_mut();
        let text = txn.get_or_insert_text("notes");
        text.insert(&mut txn, 0, "early content");
    }
    a.send(Message::Binary(encode_sync_update(&full_state(&doc_a)).into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A late joiner asks for everything it is missing.
    let (mut b, _) = connect_async(&url).await.unwrap();
    let _ = next_binary(&mut b).await;
    let empty_sv = StateVector::default().encode_v1();
    b.send(Message::Binary(encode_sync_step1(&empty_sv).into()))
        .await
        .unwrap();

    let reply = next_binary(&mut b).await;
    let doc_b = yrs::Doc::new();
    match decode_frame(&reply).unwrap() {
        Frame::Sync(SyncMessage::Step2(diff)) => {
            let mut txn = doc_b.transact_mut();
            let _ = txn.apply_update(Update::decode_v1(diff).unwrap());
        }
        other => panic!("expected step2 reply, got {other:?}"),
    }
    assert_eq!(read_text(&doc_b, "notes"), "early content");
}

#[tokio::test]
async fn test_gateway_rejects_bad_credentials() {
    let store: Arc<dyn Persistence> = Arc::new(MemStore::new());
    let (addr, _state) = spawn_app(store, fast_engine(), None).await;
    let (id, token) = create_room(addr, json!({ "name": "demo" })).await;

    // Wrong token.
    assert!(
        connect_async(format!("ws://{addr}/ws/{id}:x?token=wrong"))
            .await
            .is_err()
    );
    // Missing token.
    assert!(connect_async(format!("ws://{addr}/ws/{id}:x")).await.is_err());
    // Unknown room.
    assert!(
        connect_async(format!("ws://{addr}/ws/unknownroom1:x?token={token}"))
            .await
            .is_err()
    );
    // Unroutable path.
    assert!(connect_async(format!("ws://{addr}/elsewhere")).await.is_err());

    // The real thing still works.
    assert!(
        connect_async(format!("ws://{addr}/ws/{id}:x?token={token}"))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_identity_gate() {
    let secret = "integration-secret";
    let store: Arc<dyn Persistence> = Arc::new(MemStore::new());
    let verifier = Some(Arc::new(IdentityVerifier::new(secret)));
    let (addr, _state) = spawn_app(store, fast_engine(), verifier).await;
    let (id, token) = create_room(addr, json!({ "name": "demo" })).await;

    // Token alone is not enough when the identity gate is on.
    assert!(
        connect_async(format!("ws://{addr}/ws/{id}:x?token={token}"))
            .await
            .is_err()
    );
    assert!(
        connect_async(format!("ws://{addr}/ws/{id}:x?token={token}&jwt=garbage"))
            .await
            .is_err()
    );

    let now = chrono::Utc::now().timestamp();
    let jwt = sign_identity(
        secret,
        &IdentityClaims {
            sub: "1".into(),
            username: "alice".into(),
            display_name: "Alice".into(),
            avatar_url: None,
            iat: now,
            exp: now + 600,
        },
    )
    .unwrap();
    assert!(
        connect_async(format!("ws://{addr}/ws/{id}:x?token={token}&jwt={jwt}"))
            .await
            .is_ok()
    );

    // An expired identity is rejected just like a forged one.
    let expired = sign_identity(
        secret,
        &IdentityClaims {
            sub: "1".into(),
            username: "alice".into(),
            display_name: "Alice".into(),
            avatar_url: None,
            iat: now - 1200,
            exp: now - 600,
        },
    )
    .unwrap();
    assert!(
        connect_async(format!("ws://{addr}/ws/{id}:x?token={token}&jwt={expired}"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Persistence> =
        Arc::new(RocksStore::open(dir.path().join("db")).unwrap());

    let (addr, state) = spawn_app(store.clone(), fast_engine(), None).await;
    let (id, token) = create_room(addr, json!({ "name": "durable" })).await;

    let url = format!("ws://{addr}/ws/{id}:x?token={token}");
    let (mut a, _) = connect_async(&url).await.unwrap();
    let _ = next_binary(&mut a).await;

    let doc_a = yrs::Doc::new();
    {
        let mut txn = doc_a.transact_mut();
        let text = txn.get_or_insert_text("notes");
        text.insert(&mut txn, 0, "persisted");
    }
    a.send(Message::Binary(encode_sync_update(&full_state(&doc_a)).into()))
        .await
        .unwrap();

    // Wait past the debounce so the snapshot lands, then shut down.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.load_doc(&format!("{id}:x")).unwrap().is_some());
    state.docs.shutdown().await;

    // "Restart": a second server over the same store. The room itself was
    // persisted too, so the old token still authenticates.
    let (addr2, _state2) = spawn_app(store.clone(), fast_engine(), None).await;
    let url2 = format!("ws://{addr2}/ws/{id}:x?token={token}");
    let (mut b, _) = connect_async(&url2).await.unwrap();
    let _ = next_binary(&mut b).await;

    let empty_sv = StateVector::default().encode_v1();
    b.send(Message::Binary(encode_sync_step1(&empty_sv).into()))
        .await
        .unwrap();
    let reply = next_binary(&mut b).await;
    let doc_b = yrs::Doc::new();
    match decode_frame(&reply).unwrap() {
        Frame::Sync(SyncMessage::Step2(diff)) => {
            let mut txn = doc_b.transact_mut();
            let _ = txn.apply_update(Update::decode_v1(diff).unwrap());
        }
        other => panic!("expected step2, got {other:?}"),
    }
    assert_eq!(read_text(&doc_b, "notes"), "persisted");
}

#[tokio::test]
async fn test_idle_document_destroyed_after_grace() {
    let store: Arc<dyn Persistence> = Arc::new(MemStore::new());
    let (addr, state) = spawn_app(store.clone(), fast_engine(), None).await;
    let (id, token) = create_room(addr, json!({ "name": "idle" })).await;
    let url = format!("ws://{addr}/ws/{id}:x?token={token}");

    let (mut a, _) = connect_async(&url).await.unwrap();
    let _ = next_binary(&mut a).await;
    assert_eq!(state.docs.doc_count().await, 1);

    a.close(None).await.unwrap();
    // The grace period runs, then the document is reaped and persisted.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state.docs.doc_count().await, 0);
    assert!(store.load_doc(&format!("{id}:x")).unwrap().is_some());
}

#[tokio::test]
async fn test_awareness_withdrawn_on_disconnect() {
    let store: Arc<dyn Persistence> = Arc::new(MemStore::new());
    let (addr, _state) = spawn_app(store, fast_engine(), None).await;
    let (id, token) = create_room(addr, json!({ "name": "aware" })).await;
    let url = format!("ws://{addr}/ws/{id}:x?token={token}");

    let (mut a, _) = connect_async(&url).await.unwrap();
    let _ = next_binary(&mut a).await;
    let (mut b, _) = connect_async(&url).await.unwrap();
    let _ = next_binary(&mut b).await;

    // A announces awareness client 42.
    let mut blob = Vec::new();
    liveshare_relay::protocol::write_var_u64(&mut blob, 1);
    liveshare_relay::protocol::write_var_u64(&mut blob, 42);
    liveshare_relay::protocol::write_var_u64(&mut blob, 1);
    liveshare_relay::protocol::write_var_string(&mut blob, r#"{"user":"alice"}"#);
    a.send(Message::Binary(
        liveshare_relay::protocol::encode_awareness(&blob).into(),
    ))
    .await
    .unwrap();

    // Both sides see the announcement (origin included).
    let mut tracker = liveshare_relay::awareness::Awareness::new();
    for ws in [&mut a, &mut b] {
        let frame = next_binary(ws).await;
        match decode_frame(&frame).unwrap() {
            Frame::Awareness(update) => {
                tracker.apply_update(update).unwrap();
            }
            other => panic!("expected awareness, got {other:?}"),
        }
    }
    assert_eq!(tracker.live_ids(), vec![42]);

    // A drops; B observes the withdrawal of everything A announced.
    a.close(None).await.unwrap();
    let frame = next_binary(&mut b).await;
    match decode_frame(&frame).unwrap() {
        Frame::Awareness(update) => {
            tracker.apply_update(update).unwrap();
        }
        other => panic!("expected awareness removal, got {other:?}"),
    }
    assert!(tracker.live_ids().is_empty());
}
