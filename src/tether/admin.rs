use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tether::{
    telemetry,
    tunnel::{control::ControlChannel, registry::Registry},
    voice::{VoiceBridgeClient, VoiceRelay},
};

#[derive(Clone, Default)]
pub struct AdminState {
    pub prom: Option<telemetry::SharedPrometheusHandle>,
    pub control: Option<Arc<ControlChannel>>,
    pub registry: Option<Arc<Registry>>,
    pub voice_relay: Option<Arc<VoiceRelay>>,
    pub voice_client: Option<Arc<VoiceBridgeClient>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state", get(state_snapshot))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let body = st.prom.as_ref().map(|p| p.render()).unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Serialize, Default)]
struct StateResponse {
    control_authenticated: bool,
    control_generation: Option<u64>,
    pending_tunnels: usize,
    oldest_pending_ms: u64,
    voice_bridge_connected: bool,
    voice_sessions: usize,
}

async fn state_snapshot(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut out = StateResponse::default();
    if let Some(c) = &st.control {
        let link = c.get();
        out.control_authenticated = link.is_some();
        out.control_generation = link.map(|l| l.generation());
    }
    if let Some(r) = &st.registry {
        let snap = r.snapshot();
        out.pending_tunnels = snap.count;
        out.oldest_pending_ms = snap.oldest_age_ms;
    }
    if let Some(v) = &st.voice_relay {
        out.voice_bridge_connected = v.bridge_connected();
    }
    if let Some(v) = &st.voice_client {
        out.voice_sessions = v.session_count();
    }
    (StatusCode::OK, Json(out))
}
