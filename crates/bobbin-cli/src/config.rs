//! Command line and environment configuration.
//!
//! Every flag falls back to a `BOBBIN_*` environment variable, then to a
//! default, so the service starts with no arguments at all.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};
use bobbin_core::EngineConfig;
use bobbin_core::queue::RetryPolicy;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bobbin", version, about = "Lease-based task dispatch service")]
pub struct Cli {
    /// Log filter, e.g. `info` or `bobbin_core=debug`. Overrides RUST_LOG.
    #[arg(long, global = true, env = "BOBBIN_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP dispatch service.
    Serve(ServeArgs),
    /// Run a producer and in-process workers against an in-memory store.
    Demo(DemoArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[arg(long, env = "BOBBIN_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// `memory`, or a `sqlite:` URL such as `sqlite://bobbin.db?mode=rwc`.
    #[arg(long, env = "BOBBIN_DATABASE_URL", default_value = "memory")]
    pub database_url: String,

    #[command(flatten)]
    pub engine: EngineArgs,
}

impl ServeArgs {
    pub fn store(&self) -> Result<StoreKind> {
        StoreKind::parse(&self.database_url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite(String),
}

impl StoreKind {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.eq_ignore_ascii_case("memory") {
            return Ok(StoreKind::Memory);
        }
        if url.starts_with("sqlite:") {
            return Ok(StoreKind::Sqlite(url.to_string()));
        }
        bail!("unsupported database url `{url}` (expected `memory` or a `sqlite:` url)")
    }
}

#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    #[arg(long, env = "BOBBIN_LEASE_SECS", default_value_t = 30)]
    pub lease_secs: u64,

    #[arg(long, env = "BOBBIN_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, env = "BOBBIN_SCAN_DEPTH", default_value_t = 16)]
    pub scan_depth: usize,

    #[arg(long, env = "BOBBIN_REAPER_INTERVAL_MS", default_value_t = 5_000)]
    pub reaper_interval_ms: u64,

    #[arg(long, env = "BOBBIN_LIVENESS_SECS", default_value_t = 30)]
    pub liveness_secs: u64,

    /// Delay before a failed task is offered again.
    #[arg(long, env = "BOBBIN_RETRY_DELAY_MS", default_value_t = 0)]
    pub retry_delay_ms: u64,
}

impl EngineArgs {
    /// Values the flags do not cover keep their `EngineConfig` defaults.
    /// Range checks happen in the engine builder.
    pub fn to_config(&self) -> EngineConfig {
        EngineConfig {
            default_lease: Duration::from_secs(self.lease_secs),
            max_attempts: self.max_attempts,
            scan_depth: self.scan_depth,
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
            worker_liveness: Duration::from_secs(self.liveness_secs),
            retry: RetryPolicy::fixed(Duration::from_millis(self.retry_delay_ms)),
            ..EngineConfig::default()
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct DemoArgs {
    /// Tasks to submit.
    #[arg(long, default_value_t = 5)]
    pub tasks: u32,

    /// In-process workers to run.
    #[arg(long, default_value_t = 2)]
    pub workers: u32,

    /// Failures the handler injects before it starts succeeding.
    #[arg(long, default_value_t = 2)]
    pub failures: u32,

    #[command(flatten)]
    pub engine: EngineArgs,
}
