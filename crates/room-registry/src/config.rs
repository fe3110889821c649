//! Room Registry configuration.
//!
//! Configuration is loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default endpoint used to discover the public address.
pub const DEFAULT_PUBLIC_IP_LOOKUP_URL: &str = "https://api.ipify.org?format=json";

pub const DEFAULT_PUBLIC_IP_LOOKUP_TIMEOUT_MS: u64 = 3000;

pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

pub const DEFAULT_MAX_ROOMS: usize = 1000;

pub const DEFAULT_MAX_PARTICIPANTS_PER_ROOM: usize = 100;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "rr";

/// Room Registry configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this registry instance.
    pub instance_id: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Announced address override (`PUBLIC_IP`).
    pub public_ip: Option<IpAddr>,

    /// Public address discovery endpoint; `None` disables discovery.
    pub public_ip_lookup_url: Option<String>,

    pub public_ip_lookup_timeout: Duration,

    /// Local address media transports bind to.
    pub listen_ip: IpAddr,

    pub max_rooms: usize,

    pub max_participants_per_room: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("RR_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RR_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let public_ip = vars
            .get("PUBLIC_IP")
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_ip("PUBLIC_IP", s))
            .transpose()?;

        // Empty value disables discovery
        let public_ip_lookup_url = match vars.get("RR_PUBLIC_IP_LOOKUP_URL") {
            Some(url) if url.trim().is_empty() => None,
            Some(url) => Some(url.clone()),
            None => Some(DEFAULT_PUBLIC_IP_LOOKUP_URL.to_string()),
        };

        let public_ip_lookup_timeout = Duration::from_millis(
            vars.get("RR_PUBLIC_IP_LOOKUP_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PUBLIC_IP_LOOKUP_TIMEOUT_MS),
        );

        let listen_ip = parse_ip(
            "RR_LISTEN_IP",
            vars.get("RR_LISTEN_IP")
                .map_or(DEFAULT_LISTEN_IP, String::as_str),
        )?;

        let max_rooms = vars
            .get("RR_MAX_ROOMS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_ROOMS);

        let max_participants_per_room = vars
            .get("RR_MAX_PARTICIPANTS_PER_ROOM")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_PARTICIPANTS_PER_ROOM);

        if max_rooms == 0 || max_participants_per_room == 0 {
            return Err(ConfigError::InvalidValue(
                "room and participant limits must be positive".to_string(),
            ));
        }

        let instance_id = vars.get("RR_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            instance_id,
            signaling_bind_address,
            health_bind_address,
            public_ip,
            public_ip_lookup_url,
            public_ip_lookup_timeout,
            listen_ip,
            max_rooms,
            max_participants_per_room,
        })
    }
}

fn parse_ip(name: &str, value: &str) -> Result<IpAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{name} is not an IP address: {value}")))
}
