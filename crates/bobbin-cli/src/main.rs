mod config;
mod demo;
mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use bobbin_core::app::ReaperLoop;
use bobbin_core::impls::{InMemoryStore, SqliteStore};
use bobbin_core::{Engine, EngineBuilder};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Command, ServeArgs, StoreKind};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Demo(args) => demo::run(args).await,
    }
}

/// `--log-level` wins over RUST_LOG; `info` when neither is set.
fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_engine(args: &ServeArgs) -> Result<Engine> {
    let builder = EngineBuilder::new().config(args.engine.to_config());
    let builder = match args.store()? {
        StoreKind::Memory => {
            tracing::info!("using in-memory store");
            builder.with_stores(Arc::new(InMemoryStore::new()))
        }
        StoreKind::Sqlite(url) => {
            let store = SqliteStore::connect(&url)
                .await
                .with_context(|| format!("connecting to {url}"))?;
            tracing::info!(%url, "using sqlite store");
            builder.with_stores(Arc::new(store))
        }
    };
    Ok(builder.build()?)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let engine = Arc::new(build_engine(&args).await?);
    let reaper = ReaperLoop::spawn(engine.clone(), engine.config().reaper_interval);

    let app = http::create_router(engine);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(bind = %args.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown requested");
        })
        .await?;

    reaper.shutdown().await;
    tracing::info!("stopped");
    Ok(())
}
