use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_edge::config::{ConfigError, LogFormat};
use chat_edge::gateway::{self, AppState};
use chat_edge::{Backend, ChatService, Config};

#[derive(Debug, Parser)]
#[command(name = "chat-edge", version, about = "Domain chat assistant gateway")]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    init_tracing(config.log.format);

    let backend = Backend::from_env(&config)?;
    if let Backend::Unconfigured(e) = &backend {
        warn!(error = %e, "model backend unconfigured, chat requests will fail");
    }

    let service = ChatService::new(&config, backend)?;
    let state = Arc::new(AppState {
        service: Arc::new(service),
        trust_forwarded: config.server.trust_forwarded,
    });
    let app = gateway::router(state, config.server.body_limit_bytes);

    let addr: SocketAddr = config
        .server
        .address
        .parse()
        .map_err(|_| ConfigError::Address(config.server.address.clone()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, models = ?config.models.candidates, "chat gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
