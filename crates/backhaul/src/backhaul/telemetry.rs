use std::net::SocketAddr;

use anyhow::Context;
use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;

use crate::backhaul::net;

/// Install the process-wide Prometheus recorder. Call once at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_gauge!("backhaul_tunnels", "Tunnels currently registered");
    metrics::describe_gauge!(
        "backhaul_pool_sockets",
        "Client sockets held across all tunnel pools"
    );
    metrics::describe_counter!(
        "backhaul_pool_rejected_total",
        "Client sockets dropped because their pool was full or closed"
    );
    metrics::describe_counter!(
        "backhaul_ingress_rejected_total",
        "Shared-port connections dropped before reaching a tunnel"
    );
    metrics::describe_counter!(
        "backhaul_proxy_errors_total",
        "Public requests that failed to relay through a tunnel"
    );
    metrics::describe_counter!(
        "backhaul_upgrade_aborted_total",
        "Upgrade requests aborted before the splice started"
    );
    metrics::describe_counter!(
        "backhaul_accept_errors_total",
        "Failed accepts on the edge or ingress listener"
    );
    metrics::describe_counter!(
        "backhaul_link_retries_total",
        "Client link reconnects after a failed dial"
    );
}

/// Serve `GET /metrics` on `addr` until shutdown.
pub async fn serve_metrics(
    addr: &str,
    handle: PrometheusHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = net::normalize_bind_addr(addr)
        .parse()
        .with_context(|| format!("invalid metrics_addr: {addr}"))?;

    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(handle);

    let ln = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("metrics: bind {addr}"))?;
    tracing::info!(addr = %addr, "metrics: listening");

    axum::serve(ln, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await
        .context("metrics: serve")
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
