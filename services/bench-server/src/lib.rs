pub mod config;
pub mod discovery;
pub mod fanout;
pub mod hub;
pub mod manager;
pub mod persistence;
pub mod scope_session;
pub mod sequence_engine;
pub mod session;
pub mod state;
pub mod trigger_engine;
pub mod ws;

pub use state::AppState;

use axum::routing::get;
use axum::Router;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_route))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
