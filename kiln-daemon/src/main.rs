//! kilnd — the KILN build daemon.
//!
//! Accepts build specs over a persistent WebSocket channel, orchestrates
//! fetch/build/output through the core build service, and streams logs and
//! status transitions back to the originating client.
//!
//! On client disconnect, the jobs that client originated are cancelled at
//! their next suspension point.

use anyhow::Context;
use clap::Parser;
use kiln_core::engine::DockerEngine;
use kiln_core::secrets::{EnvSecretProvider, SecretProvider, StaticSecretProvider};
use kiln_core::store::FsObjectStore;
use kiln_core::{BuildService, Config};
use kiln_daemon::{server, shutdown, telemetry};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "kilnd", about = "KILN remote image-build daemon")]
struct Args {
    /// Address to listen on (overrides the config file).
    #[arg(long)]
    listen: Option<String>,

    /// Path to the config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Container engine endpoint (tcp://host:port). `DOCKER_HOST` wins.
    #[arg(long)]
    engine_host: Option<String>,

    /// JSON file of secret source -> value pairs. When absent, secrets
    /// resolve against the process environment.
    #[arg(long)]
    secrets_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(engine_host) = args.engine_host {
        config.engine_host = engine_host;
    }

    telemetry::init(&config.log_level)?;
    info!("kilnd starting");

    let engine = Arc::new(
        DockerEngine::from_env(&config.engine_host).context("failed to set up engine client")?,
    );
    let store = Arc::new(FsObjectStore::new(&config.object_store_dir));
    let secrets: Arc<dyn SecretProvider> = match &args.secrets_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read secrets file {}", path.display()))?;
            let values: std::collections::HashMap<String, String> =
                serde_json::from_str(&content)
                    .with_context(|| format!("invalid secrets file {}", path.display()))?;
            Arc::new(StaticSecretProvider::new(values))
        }
        None => Arc::new(EnvSecretProvider),
    };

    let service = Arc::new(
        BuildService::new(config.clone(), engine, Some(store), secrets)
            .context("failed to initialize build service")?,
    );

    let shutdown = shutdown::shutdown_token();
    server::serve(config, service, shutdown).await?;

    info!("kilnd stopped");
    Ok(())
}
