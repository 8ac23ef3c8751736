//! Bundled TURN relay for deployments without an external one. A thin
//! wrapper around `webrtc-rs`'s own `turn` crate, configured for a single
//! static username/credential pair taken from `ice.turn_username` /
//! `ice.turn_credential` — this relay never manages a user database.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use edgecast_protocol::RelayConfig;
use tokio::net::UdpSocket;
use turn::Error as TurnError;
use turn::auth::{AuthHandler, generate_auth_key};
use turn::relay::relay_static::RelayAddressGeneratorStatic;
use turn::server::config::{ConnConfig, ServerConfig};
use turn::server::Server;

const DEFAULT_TURN_PORT: u16 = 3478;
const DEFAULT_REALM: &str = "edgecast";

struct StaticUserAuth {
    username: String,
    key: Vec<u8>,
}

impl AuthHandler for StaticUserAuth {
    fn auth_handle(
        &self,
        username: &str,
        _realm: &str,
        _src_addr: std::net::SocketAddr,
    ) -> Result<Vec<u8>, TurnError> {
        if username == self.username {
            Ok(self.key.clone())
        } else {
            Err(TurnError::ErrFakeErr)
        }
    }
}

/// Runs the bundled TURN relay until ctrl-c. Requires `ice.turn_username`
/// and `ice.turn_credential` to be set in config.
pub async fn run(config: &RelayConfig) -> anyhow::Result<()> {
    let username = config
        .ice
        .turn_username
        .clone()
        .context("ice.turn_username must be set to run the bundled turn relay")?;
    let credential = config
        .ice
        .turn_credential
        .clone()
        .context("ice.turn_credential must be set to run the bundled turn relay")?;

    let public_ip = IpAddr::from_str(&config.server.bind)
        .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));
    let key = generate_auth_key(&username, DEFAULT_REALM, &credential);

    let conn = Arc::new(
        UdpSocket::bind(("0.0.0.0", DEFAULT_TURN_PORT))
            .await
            .context("failed to bind turn relay udp socket")?,
    );
    tracing::info!(addr = %conn.local_addr()?, "turn relay listening");

    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn,
            relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                relay_address: public_ip,
                address: "0.0.0.0".to_owned(),
                net: Arc::new(util::vnet::net::Net::new(None)),
            }),
        }],
        realm: DEFAULT_REALM.to_owned(),
        auth_handler: Arc::new(StaticUserAuth { username, key }),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await
    .context("failed to start turn server")?;

    tokio::signal::ctrl_c().await.ok();
    server.close().await.context("failed to close turn server")?;
    Ok(())
}
