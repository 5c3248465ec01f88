use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use xtream_edge::{AppConfig, EdgeApplicationServer, Logger, services::edge_services::EdgeServices};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::parse();
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    // guards are kept alive to flush logs and keep sentry connected
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!("logger and env prepped, opening {:?} cache...", config.cache_backend);

    let proxy_cache = EdgeServices::open_cache(&config)
        .await
        .context("cache backend failed to open")?;

    info!("cache ok, starting edge server...");

    EdgeApplicationServer::serve(config, proxy_cache)
        .await
        .context("edge server failed to start")?;

    Ok(())
}
