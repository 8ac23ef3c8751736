mod cli;
mod engine;
mod hookstream;

use std::sync::Arc;

use anyhow::Context;
use cli::Command;
use edgecast_protocol::{Meta, RelayConfig, TrackSource};
use edgecast_relay::Bus;
use tracing::{info, warn};

fn load_config(path: &std::path::Path) -> anyhow::Result<RelayConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(RelayConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Resolves `machine_id`: the configured override if set, else the content
/// of `/etc/machine-id`, trimmed.
fn resolve_machine_id(config: &RelayConfig) -> anyhow::Result<String> {
    if !config.machine_id.is_empty() {
        return Ok(config.machine_id.clone());
    }
    std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .context("machine_id is unset and /etc/machine-id could not be read")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::parse_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&args.config_path)?;
    let issues = config.validate();
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{issue}");
        } else {
            warn!("{issue}");
        }
    }
    if issues.iter().any(|i| i.starts_with("ERROR:")) {
        anyhow::bail!("invalid configuration, see logged errors above");
    }

    match args.command {
        Command::Info => {
            let machine_id = resolve_machine_id(&config).unwrap_or_default();
            println!("machine_id: {machine_id}");
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Livestream => run_livestream(config).await,
        Command::Hookstream {
            service,
            delay_secs,
        } => {
            let machine_id = resolve_machine_id(&config)?;
            let mut config = config;
            config.machine_id = machine_id;
            let bus = Bus::connect(&config.bus, "hookstream").await?;
            hookstream::run(&config, &bus, &service, delay_secs).await
        }
        Command::Turn => run_turn(config).await,
    }
}

async fn run_livestream(config: RelayConfig) -> anyhow::Result<()> {
    let machine_id = resolve_machine_id(&config)?;
    let mut config = config;
    config.machine_id = machine_id.clone();
    let config = Arc::new(config);

    let bus = Arc::new(Bus::connect(&config.bus, "livestream").await?);

    let drone_ingest = if config.ingest.drone_kind == "rtmp" {
        engine::IngestSpec::Rtmp {
            listen: config.ingest.rtmp_listen.clone(),
        }
    } else {
        engine::IngestSpec::Rtp {
            listen: config.ingest.rtp_listen.clone(),
        }
    };
    let drone_spec = engine::StreamSpec {
        meta: Meta::new(machine_id.clone(), TrackSource::Drone),
        ingest: drone_ingest,
    };

    let mut handles = vec![tokio::spawn(engine::run_stream(
        config.clone(),
        bus.clone(),
        drone_spec,
    ))];

    if !config.ingest.rtsp_url.is_empty() {
        let monitor_spec = engine::StreamSpec {
            meta: Meta::new(machine_id.clone(), TrackSource::Monitor),
            ingest: engine::IngestSpec::Rtsp {
                url: config.ingest.rtsp_url.clone(),
            },
        };
        handles.push(tokio::spawn(engine::run_stream(
            config.clone(),
            bus.clone(),
            monitor_spec,
        )));
    }

    info!(machine_id, "livestream running");

    tokio::select! {
        _ = futures::future::join_all(handles) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }
    Ok(())
}

async fn run_turn(config: RelayConfig) -> anyhow::Result<()> {
    edgecast_relay::turn::run(&config).await
}
