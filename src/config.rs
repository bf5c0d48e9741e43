// Hub configuration.
// Defaults mirror the timing of the browser client: one ping a minute,
// two minutes of silence before the connection is considered dead.

use crate::peer::types::IceServerConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Maximum number of chat messages replayed to a new session.
pub const CHAT_HISTORY_SIZE: usize = 10;

pub const DEFAULT_ICE_SERVERS: [&str; 2] =
    ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Runtime configuration for the signaling hub.
#[derive(Parser, Debug, Clone)]
#[command(name = "ssc-hub", version, about = "WebRTC signaling and chat hub")]
pub struct HubConfig {
    /// Address to listen on.
    #[arg(long, env = "SSC_HUB_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Seconds between keepalive pings.
    #[arg(long, env = "SSC_HUB_PING_PERIOD", default_value_t = 60)]
    pub ping_period_secs: u64,

    /// Seconds without any inbound frame before a session is dropped.
    #[arg(long, env = "SSC_HUB_PONG_WAIT", default_value_t = 120)]
    pub pong_wait_secs: u64,

    /// Upper bound for a single write, and for a mailbox delivery.
    #[arg(long, env = "SSC_HUB_WRITE_WAIT", default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Largest inbound frame accepted, in bytes.
    #[arg(long, env = "SSC_HUB_MAX_MESSAGE_SIZE", default_value_t = 4096)]
    pub max_message_size: usize,

    /// Outbound messages buffered per session.
    #[arg(long, env = "SSC_HUB_MAILBOX_CAPACITY", default_value_t = 256)]
    pub mailbox_capacity: usize,

    /// ICE servers handed to every peer connection ("stun:" is assumed
    /// when the scheme is missing).
    #[arg(
        long = "ice-server",
        env = "SSC_HUB_ICE_SERVERS",
        value_delimiter = ',',
        default_values = DEFAULT_ICE_SERVERS
    )]
    pub ice_servers: Vec<String>,

    /// Username for TURN entries in `ice_servers`.
    #[arg(long, env = "SSC_HUB_TURN_USERNAME")]
    pub turn_username: Option<String>,

    /// Credential for TURN entries in `ice_servers`.
    #[arg(long, env = "SSC_HUB_TURN_CREDENTIAL")]
    pub turn_credential: Option<String>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "SSC_HUB_LOG", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

impl HubConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn session_timing(&self) -> SessionTiming {
        SessionTiming {
            ping_period: self.ping_period(),
            pong_wait: self.pong_wait(),
            write_wait: self.write_wait(),
        }
    }

    /// ICE servers as structured entries.
    pub fn ice_server_configs(&self) -> Vec<IceServerConfig> {
        self.ice_servers
            .iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| {
                let mut server = IceServerConfig::from_url(url.trim());
                if server.r#type == "turn" {
                    server.username = self.turn_username.clone();
                    server.credential = self.turn_credential.clone();
                }
                server
            })
            .collect()
    }
}

impl Default for HubConfig {
    /// The declared defaults, without reading arguments or the environment.
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ping_period_secs: 60,
            pong_wait_secs: 120,
            write_wait_secs: 10,
            max_message_size: 4096,
            mailbox_capacity: 256,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|url| url.to_string()).collect(),
            turn_username: None,
            turn_credential: None,
            log_level: DEFAULT_LOG_LEVEL.into(),
        }
    }
}

/// Timers used by the per-session loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(60),
            pong_wait: Duration::from_secs(120),
            write_wait: Duration::from_secs(10),
        }
    }
}
