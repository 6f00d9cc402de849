//! Router entry point: stdin/stdout are the MCP transport, stderr is for
//! diagnostics, and there are no flags.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use mcp_router::config::RouterPaths;
use mcp_router::manifest::ManifestStore;
use mcp_router::pool::SessionPool;
use mcp_router::server::Router;
use mcp_router::usage::UsageLogger;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let paths = RouterPaths::resolve().context("failed to resolve router root")?;
    paths
        .ensure_log_dir()
        .context("failed to create log directory")?;
    info!(root = %paths.root.display(), "mcp-manager-router starting");

    let store = Arc::new(ManifestStore::new(
        paths.user_manifest.clone(),
        paths.community_catalog.clone(),
    ));
    let usage =
        Arc::new(UsageLogger::open(&paths.usage_log).context("failed to open usage log")?);
    let pool = Arc::new(SessionPool::new());
    let router = Arc::new(Router::new(store, pool, usage, paths.root.clone()));

    router
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("parent transport failed")?;

    info!("parent transport closed, router exiting");
    Ok(())
}
