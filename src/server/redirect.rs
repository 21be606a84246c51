//! Plaintext listener that bounces every request to HTTPS

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{debug, info, Level};

use crate::server::websocket::request_span;

/// Router answering every path with a redirect to the same URL over HTTPS
pub fn redirect_router() -> Router {
    Router::new().fallback(redirect_handler).layer(
        TraceLayer::new_for_http()
            .make_span_with(request_span)
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

async fn redirect_handler(headers: HeaderMap, uri: Uri) -> Response {
    let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", host, path);
    debug!(location = %location, "Redirecting to HTTPS");

    // 302 so browsers don't cache the hop
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// Serve redirects on an already-bound listener until `shutdown` resolves
pub async fn serve_redirects<F>(listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        redirect_router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Redirect server failed")?;

    Ok(())
}

/// Run the plaintext redirect listener
pub async fn run_redirect_server<F>(bind_addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "Redirect server listening");

    serve_redirects(listener, shutdown).await
}
