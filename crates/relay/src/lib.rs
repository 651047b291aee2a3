pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod liveness;
pub mod metrics;
pub mod rooms;
pub mod shutdown;
pub mod state;
pub mod sync;
pub mod ws;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    http::{header, header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use crate::shutdown::ShutdownCoordinator;
use crate::state::RelayState;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: Arc<RelayState>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint))
            .merge(ws::router())
            .with_state(state),
    )
}

/// Serves until `signal` resolves, then drains connections before the
/// listener stops.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("failed to read relay listener address")?;
    let (coordinator, liveness_stop) = ShutdownCoordinator::new(Arc::clone(&state));
    let liveness = tokio::spawn(liveness::run(Arc::clone(&state), liveness_stop));

    info!(listen_addr = %local_addr, "relay listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signal.await;
            let report = coordinator.drain().await;
            info!(closed = report.closed, remaining = report.remaining, "connections drained");
        })
        .await
        .context("relay server exited unexpectedly")?;

    if let Err(join_error) = liveness.await {
        error!(?join_error, "liveness monitor task failed");
    }
    info!(listen_addr = %local_addr, "relay listener closed");
    Ok(())
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_endpoint() -> Response {
    let body = metrics::global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
