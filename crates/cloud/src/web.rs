use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use edgecast_protocol::RelayConfig;
use edgecast_relay::{Bus, SessionTable};
use serde_json::json;
use tower_http::services::ServeDir;

use crate::subscriber;

pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub bus: Arc<Bus>,
    pub sessions: Arc<SessionTable>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/broadcast/signal", get(signal_ws_upgrade))
        .with_state(Arc::clone(&state));

    if let Some(dir) = &state.config.server.debug_static_dir {
        app = app.nest_service("/v1/test/e2e/broadcast", ServeDir::new(dir));
    }

    app
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "sessions": state.sessions.len(),
        "bus_connected": state.bus.is_connected(),
    }))
}

async fn signal_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(65_536).on_upgrade(move |socket| async move {
        subscriber::handle(
            socket,
            state.config.clone(),
            state.bus.clone(),
            state.sessions.clone(),
        )
        .await;
    })
}
