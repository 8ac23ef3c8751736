mod cli;
mod config;
mod publisher;
mod subscriber;
mod tls;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cli::Command;
use edgecast_protocol::RelayConfig;
use edgecast_relay::{Bus, SessionTable};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = cli::parse_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let relay_config = config::load_config(&args.config_path)?;
    let issues = relay_config.validate();
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            error!("{issue}");
        } else {
            warn!("{issue}");
        }
    }
    if issues.iter().any(|i| i.starts_with("ERROR:")) {
        anyhow::bail!("invalid configuration, see logged errors above");
    }

    match args.command {
        Command::Info => {
            println!("{}", toml::to_string_pretty(&relay_config)?);
            Ok(())
        }
        Command::Broadcast => run_broadcast(relay_config).await,
        Command::Turn => edgecast_relay::turn::run(&relay_config).await,
    }
}

async fn run_broadcast(config: RelayConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let bus = Arc::new(Bus::connect(&config.bus, "cloud").await?);
    let sessions = SessionTable::new();
    let api = Arc::new(edgecast_relay::pc::build_api()?);

    let publisher_handle = tokio::spawn(publisher::run(
        config.clone(),
        bus.clone(),
        api,
        sessions.clone(),
    ));

    let state = Arc::new(web::AppState {
        config: config.clone(),
        bus,
        sessions,
    });
    let app = web::build_router(state).layer(TraceLayer::new_for_http());

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid server.bind/server.port")?;

    let tls_result = tls::build_tls_config(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
    )?;
    let acceptor = tls::make_acceptor(tls_result.config);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    info!("edgecast cloud relay listening on https://{bind_addr}");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("failed to accept tcp connection: {e}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        Duration::from_secs(10),
                        acceptor.accept(stream),
                    )
                    .await
                    {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "tls handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "tls handshake timed out");
                            return;
                        }
                    };
                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder =
                        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received sigint, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                info!("received sigterm, initiating graceful shutdown");
                break;
            }
        }
    }

    publisher_handle.abort();
    Ok(())
}
