//! `microvmd` binary: CLI parsing, config/logging bootstrap, host network
//! preparation, and the HTTP control-plane server loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use microvmd::config::Config;
use microvmd::http::build_router;
use microvmd::ServerFacade;

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/microvmd/config.toml")
}

/// Lightweight microVM orchestrator: host-side VM lifecycle engine and
/// callback router.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[clap(long = "config", default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Overrides `listen_host:listen_port` from the config file.
    #[clap(long = "listen")]
    listen: Option<String>,

    /// Overrides `bridge_name` from the config file.
    #[clap(long = "bridge")]
    bridge: Option<String>,
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_ansi(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let args = CliArgs::parse();

    info!(
        "starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let mut config = Config::load(&args.config)
        .await
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    if let Some(bridge) = args.bridge {
        config.bridge_name = bridge;
    }
    if let Some(listen) = args.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .context("--listen must be in host:port form")?;
        config.listen_host = host.to_string();
        config.listen_port = port.parse().context("--listen port must be numeric")?;
    }

    let facade = Arc::new(ServerFacade::new(config)?);

    let backup_path = facade.config().state_dir.join("iptables-backup.rules");
    tokio::fs::create_dir_all(&facade.config().state_dir)
        .await
        .context("creating vm state directory")?;
    facade
        .prepare_host_network(&backup_path)
        .await
        .context("preparing host network")?;

    let addr: SocketAddr = facade
        .config()
        .listen_addr()
        .parse()
        .context("invalid listen address")?;
    info!(%addr, "listening");

    let router = build_router(facade);
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await
        .context("http server failed")?;

    Ok(())
}
