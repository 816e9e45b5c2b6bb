//! HTTP endpoints: WebSocket upgrade, relay info, and health checks.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info};

use crate::{relay::Relay, ws};

/// Media type clients send in `Accept` to ask for the information document.
pub const NOSTR_JSON: &str = "application/nostr+json";

const HINT: &str = "Please use a Nostr client to connect.\n";

#[derive(Clone)]
struct HttpState {
    relay: Arc<Relay>,
    /// Held by every socket task; closed once all of them have finished.
    sockets: mpsc::Sender<()>,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Bind the listening socket, with the address in the error.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))
}

/// Serve HTTP and WebSocket traffic on `listener` until `shutdown` resolves,
/// then wait for every socket task to flush and close.
pub async fn serve(
    listener: TcpListener,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let (sockets, mut finished) = mpsc::channel::<()>(1);
    let app = router(HttpState { relay, sockets });
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    // resolves once the last socket task drops its sender
    let _ = finished.recv().await;
    info!("server stopped");
    Ok(())
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// `GET /`: WebSocket upgrade, NIP-11 document, or a short hint.
async fn root(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(upgrade) = upgrade {
        debug!(%peer, "websocket upgrade");
        let HttpState { relay, sockets } = state;
        return upgrade.on_upgrade(move |socket| async move {
            ws::process(socket, peer, relay).await;
            drop(sockets);
        });
    }
    if accepts_nostr_json(&headers) {
        return relay_info(&state.relay);
    }
    HINT.into_response()
}

fn accepts_nostr_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(NOSTR_JSON))
}

/// NIP-11 relay information document.
fn relay_info(relay: &Relay) -> Response {
    (
        [
            (header::CONTENT_TYPE, NOSTR_JSON),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Json(relay.info_document()),
    )
        .into_response()
}
