//! Reduced `hookstream` mode: subscribes to the DRONE hook topic only and,
//! on receipt, waits a configured delay then restarts an externally-managed
//! systemd unit. Unlike the full publisher engine, this mode never touches
//! `SubscriberCount` or ICE state — it just reacts to the raw hook signal.

use std::time::Duration;

use edgecast_protocol::{Meta, RelayConfig, TrackSource};
use edgecast_relay::Bus;
use tracing::{error, info};

pub async fn run(config: &RelayConfig, bus: &Bus, service: &str, delay_secs: u64) -> anyhow::Result<()> {
    let meta = Meta::new(config.machine_id.clone(), TrackSource::Drone);
    let topic = config.topics.hook_topic(&meta);
    let mut hook_rx = bus.subscribe(&topic, config.bus.qos).await?;
    info!(topic, "hookstream listening");

    while let Some(_msg) = hook_rx.recv().await {
        info!(delay_secs, "hook received, waiting before restart");
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
        match tokio::process::Command::new("systemctl")
            .arg("restart")
            .arg(service)
            .status()
            .await
        {
            Ok(status) if status.success() => info!(service, "restarted service"),
            Ok(status) => error!(service, ?status, "systemctl restart exited non-zero"),
            Err(e) => error!(service, "failed to run systemctl: {e:#}"),
        }
    }

    Ok(())
}
