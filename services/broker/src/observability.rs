//! Observability for the broker service: a `tracing` subscriber filtered by
//! `RUST_LOG` and a Prometheus recorder served over HTTP together with
//! `/live` and `/ready` probes.
//! In tests, recorder installation is cached so repeated calls do not conflict.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the log subscriber and the metrics recorder.
///
/// Returns a `PrometheusHandle` for serving metrics.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    // Default to "info" if RUST_LOG is unset or invalid.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
    // A subscriber may already be installed (tests, embedding); keep it.
    if registry.try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    let handle = install_metrics_recorder()?;
    tracing::info!(service = service_name, "observability initialized");
    Ok(handle)
}

/// Serves Prometheus metrics and health endpoints on the given socket address.
///
/// - `/metrics`: Prometheus metrics endpoint.
/// - `/live`: liveness probe returning "ok".
/// - `/ready`: readiness probe returning "ok".
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_metrics_on(handle, listener).await
}

async fn serve_metrics_on(
    handle: PrometheusHandle,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }));
    axum::serve(listener, app.into_make_service()).await
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")
    }
}
