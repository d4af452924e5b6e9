//! Real-time channel tests over a live socket.

mod helpers;

use futures::{SinkExt, StreamExt};
use helpers::Harness;
use rollcall_core::{BroadcastEvent, DescriptorExtractor, Embedding};
use rollcall_store::EnrollmentStore;
use rollcalld::{cors_layer, router, AppState};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(h: &Harness) -> SocketAddr {
    let enroller: Box<dyn DescriptorExtractor> = Box::new(h.extractor.clone());
    let app = router(
        AppState {
            queue: h.queue.clone(),
            store: Arc::clone(&h.dyn_store),
            registry: Arc::clone(&h.registry),
            enroller: Arc::new(Mutex::new(enroller)),
        },
        cors_layer(&["*".to_string()]),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn observe(addr: SocketAddr) -> Client {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

/// Wait until the registry holds `n` observers.
async fn observers(h: &Harness, n: usize) {
    for _ in 0..500 {
        if h.registry.len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} observers, have {}", h.registry.len());
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(socket: &mut Client) -> Value {
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("no message within 5s"),
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            },
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_is_answered_and_junk_ignored() {
    let h = Harness::start(0.6, 1).await;
    let addr = serve(&h).await;
    let mut socket = observe(addr).await;
    observers(&h, 1).await;

    socket.send(Message::Text("not json".into())).await.unwrap();
    socket
        .send(Message::Text(r#"{"type":"subscribe"}"#.into()))
        .await
        .unwrap();
    socket
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();

    assert_eq!(next_json(&mut socket).await, serde_json::json!({ "type": "pong" }));
    assert_eq!(h.registry.len(), 1);

    socket.close(None).await.unwrap();
    observers(&h, 0).await;
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_mark_reaches_socket_observer() {
    let h = Harness::start(0.6, 1).await;
    let ada = h
        .store
        .enroll("CS-01", "Ada", "CS", &Embedding::new(vec![1.0, 0.0]))
        .await
        .unwrap();
    let addr = serve(&h).await;
    let mut socket = observe(addr).await;
    observers(&h, 1).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/attendance/{}", ada.id))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let pushed = next_json(&mut socket).await;
    assert_eq!(pushed["type"], "attendance_marked");
    assert_eq!(pushed["data"]["personId"], ada.id);
    assert_eq!(pushed["data"]["studentName"], "Ada");

    socket.close(None).await.unwrap();
    observers(&h, 0).await;
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_socket_is_unregistered() {
    let h = Harness::start(0.6, 1).await;
    let addr = serve(&h).await;
    let first = observe(addr).await;
    let mut second = observe(addr).await;
    observers(&h, 2).await;

    drop(first);
    observers(&h, 1).await;

    h.registry.broadcast(&BroadcastEvent::DatabaseReset {
        scope: rollcall_core::ResetScope::Attendance,
    });
    let pushed = next_json(&mut second).await;
    assert_eq!(pushed["type"], "database_reset");
    assert_eq!(pushed["data"]["scope"], "attendance");

    h.shutdown().await;
}
