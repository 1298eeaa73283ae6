use std::env;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use docstore_service::{Catalog, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "./config.json".to_string());
    let catalog = Catalog::load(&config_path)
        .await
        .with_context(|| format!("failed to load config from {config_path}"))?;

    let (host, port) = catalog.listen_addr().await;
    info!(config = %config_path, host = %host, port, "configuration loaded");
    for db in catalog.databases().await {
        info!(name = %db.name, file = %db.filename, "known database");
    }

    let server = Server::bind(Arc::new(catalog)).await?;
    server.run().await
}
