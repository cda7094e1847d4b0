//! WebSocket connection loop (spec.md §4.8's `ClientHub` route).
//!
//! Owns the `Message::Text` decode/encode loop and nothing else: every
//! actual state change is delegated to `ClientHub::dispatch`, grounded in
//! `ws_forwarder.rs`'s `handle_forwarder_socket` three-way
//! `tokio::select!` shape (inbound socket / outbound sink / periodic
//! tick), minus the token handshake and heartbeat this corpus's forwarder
//! needs and this spec does not.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tracing::{debug, warn};

use bench_protocol::{error_codes, ClientMessage, ServerMessage};

use crate::fanout::Subscriber;
use crate::state::AppState;

pub async fn ws_route(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = state.next_client_id();
    let sink = Subscriber::new();
    state.hub.register_client(client_id, sink.clone()).await;
    debug!(client_id, "client connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        for reply in handle_frame(&state, client_id, &sink, &text).await {
                            if send(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        let err = ServerMessage::error(None, error_codes::INVALID_MESSAGE, "binary frames are not accepted");
                        if send(&mut socket, &err).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(client_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            outgoing = sink.recv() => {
                match outgoing {
                    Some(msg) => {
                        if send(&mut socket, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.unregister_client(client_id).await;
    debug!(client_id, "client disconnected");
}

const KNOWN_TYPES: &[&str] = &[
    "getDevices", "scan", "subscribe", "unsubscribe", "setMode", "setOutput", "setValue",
    "startList", "stopList", "scopeRun", "scopeStop", "scopeSingle", "scopeAutoSetup",
    "scopeGetWaveform", "scopeGetMeasurement", "scopeGetScreenshot", "scopeSetChannel",
    "scopeSetTimebase", "scopeSetTrigger", "scopeStartStreaming", "scopeStopStreaming",
    "sequenceLibraryList", "sequenceLibrarySave", "sequenceLibraryUpdate", "sequenceLibraryDelete",
    "sequenceRun", "sequenceAbort", "triggerScriptLibraryList", "triggerScriptLibrarySave",
    "triggerScriptLibraryUpdate", "triggerScriptLibraryDelete", "triggerScriptRun",
    "triggerScriptStop", "triggerScriptPause", "triggerScriptResume", "deviceAliasList",
    "deviceAliasSet", "deviceAliasClear", "settingsExport", "settingsImport",
];

/// Parses one inbound frame and dispatches it. A payload whose `type` tag
/// isn't one of `ClientMessage`'s variants gets `UNKNOWN_MESSAGE_TYPE`; a
/// payload that is malformed JSON, has no `type` field, or names a known
/// type but fails field validation gets `INVALID_MESSAGE` — the tag peek
/// happens first so the two cases don't collapse into one generic error.
async fn handle_frame(state: &AppState, client_id: u64, sink: &Subscriber, text: &str) -> Vec<ServerMessage> {
    let tag = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned));

    match tag {
        Some(ref t) if !KNOWN_TYPES.contains(&t.as_str()) => {
            return vec![ServerMessage::error(None, error_codes::UNKNOWN_MESSAGE_TYPE, &format!("unknown message type: {t}"))];
        }
        None => {
            return vec![ServerMessage::error(None, error_codes::INVALID_MESSAGE, "message has no \"type\" field")];
        }
        Some(_) => {}
    }

    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => state.hub.dispatch(client_id, sink, msg).await,
        Err(e) => {
            vec![ServerMessage::error(None, error_codes::INVALID_MESSAGE, &format!("malformed message: {e}"))]
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).expect("ServerMessage always serializes");
    socket.send(Message::Text(text.into())).await
}
