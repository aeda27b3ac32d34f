//! Read-only diagnostics over HTTP

pub mod hash;
pub mod routes;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

pub async fn serve(listen: &str, state: routes::AppState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    tracing::info!("API listening on {}", listen);

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server failed")
}
