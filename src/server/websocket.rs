//! WebSocket front door
//!
//! Serves the upgrade endpoint the hub's sessions come in through, plus a
//! small home page and health/stats probes.

use crate::config::HubConfig;
use crate::server::hub::HubHandle;
use crate::server::session::ClientSession;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Request, State,
    },
    http::{header, HeaderName, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, info_span, warn, Level, Span};

const HOME_PAGE: &str = include_str!("../../assets/index.html");

/// How long open connections get to finish once a TLS server is told to stop
const TLS_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Shared state for WebSocket handlers
#[derive(Clone)]
pub struct WsState {
    pub hub: HubHandle,
    pub config: Arc<HubConfig>,
}

impl WsState {
    pub fn new(hub: HubHandle, config: HubConfig) -> Self {
        Self {
            hub,
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Serialize)]
struct Stats {
    sessions: usize,
}

/// PEM certificate chain and private key for serving over HTTPS
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn header_str<'a>(request: &'a Request, name: HeaderName) -> &'a str {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

fn remote_addr(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Span for one HTTP request, carrying the fields an access log needs
pub(crate) fn request_span(request: &Request) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        host = header_str(request, header::HOST),
        content_length = header_str(request, header::CONTENT_LENGTH),
        user_agent = header_str(request, header::USER_AGENT),
        remote = %remote_addr(request),
    )
}

/// Create the WebSocket router
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn home_handler() -> Html<&'static str> {
    Html(HOME_PAGE)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn stats_handler(State(state): State<WsState>) -> impl IntoResponse {
    match state.hub.session_count().await {
        Ok(sessions) => Json(Stats { sessions }).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    info!(remote = %remote, "WebSocket upgrade request");

    let limit = state.config.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(move |e| {
            warn!(remote = %remote, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, remote, state))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, state: WsState) {
    let (sender, receiver) = socket.split();
    let session = ClientSession::new(remote.to_string(), state.hub.clone(), state.config.clone());
    let session_id = session.id;

    // Dropping the socket halves on failure closes the connection
    if let Err(e) = session.start(sender, receiver).await {
        warn!(remote = %remote, error = %e, "Could not register session");
        return;
    }

    info!(session_id = %session_id, remote = %remote, "WebSocket client connected");
}

/// Serve the WebSocket router on an already-bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: WsState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("WebSocket server failed")?;

    Ok(())
}

/// Run the WebSocket server
pub async fn run_websocket_server<F>(bind_addr: SocketAddr, state: WsState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "WebSocket server listening");

    serve(listener, state, shutdown).await
}

/// Run the WebSocket server over HTTPS
pub async fn run_tls_websocket_server<F>(
    bind_addr: SocketAddr,
    tls: TlsPaths,
    state: WsState,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
        .await
        .with_context(|| {
            format!(
                "Failed to load TLS certificate {} and key {}",
                tls.cert.display(),
                tls.key.display()
            )
        })?;

    let handle = axum_server::Handle::new();
    let stopper = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        stopper.graceful_shutdown(Some(TLS_GRACE_PERIOD));
    });

    info!(addr = %bind_addr, cert = %tls.cert.display(), "WebSocket server listening with TLS");

    let app = create_router(state);
    axum_server::bind_rustls(bind_addr, rustls)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .with_context(|| format!("TLS server on {} failed", bind_addr))?;

    Ok(())
}
