mod auth;
mod config;
mod error;
mod metrics;
mod presence;
mod protocol;
mod ws;

use anyhow::Context;
use auth::session::SessionStore;
use axum::{
    body::Body,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use config::GatewayConfig;
use metrics::GatewayMetrics;
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;
use ws::GatewayState;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    let gateway_metrics = Arc::new(GatewayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&gateway_metrics));

    let session_store = match &config.database_url {
        Some(database_url) => SessionStore::connect(database_url)
            .await
            .context("failed to connect session store to postgres")?,
        None => {
            info!("no database url configured, using in-memory session store");
            SessionStore::in_memory()
        }
    };

    let app = build_router(GatewayState::new(session_store), gateway_metrics);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting presence gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited unexpectedly")
}

fn build_router(state: GatewayState, gateway_metrics: Arc<GatewayMetrics>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route(
                "/metrics",
                get(move || {
                    let gateway_metrics = Arc::clone(&gateway_metrics);
                    async move { gateway_metrics.render_prometheus() }
                }),
            )
            .merge(ws::router(state)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
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
