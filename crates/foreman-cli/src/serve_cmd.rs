//! `foreman serve` command: HTTP API plus an optional dispatcher loop.

use std::net::SocketAddr;

use anyhow::{Context, Result};

use foreman_core::Foreman;

use crate::api::build_router;
use crate::config::ResolvedConfig;

/// Run the API until Ctrl+C, then stop the dispatcher loop.
pub async fn run_serve(resolved: ResolvedConfig, start_loop: bool) -> Result<()> {
    let foreman = Foreman::open(resolved.harness).await?;
    if start_loop {
        foreman.dispatcher.start().await?;
    }

    let app = build_router(foreman.clone());
    let addr: SocketAddr = format!("{}:{}", resolved.bind, resolved.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", resolved.bind, resolved.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        loop_running = start_loop,
        "foreman serve listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight runs die with the runtime; the next startup marks them failed.
    let status = foreman.dispatcher.stop().await?;
    if status.in_flight > 0 {
        tracing::warn!(in_flight = status.in_flight, "shutting down with runs in flight");
    }
    foreman.pool.close().await;
    tracing::info!("foreman serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
}
