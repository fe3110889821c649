//! Session client configuration.
//!
//! Configuration is loaded from environment variables.

use common::secret::SecretString;
use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3000/ws";

pub const DEFAULT_ROOM_ID: &str = "main-room";

/// Delay before a failed send transport is recreated.
pub const DEFAULT_SEND_RETRY_BACKOFF_MS: u64 = 2000;

/// Delay before a failed receive transport is recreated.
///
/// Offset from the send delay so both roles never retry in the same tick.
pub const DEFAULT_RECV_RETRY_BACKOFF_MS: u64 = 2500;

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

pub const DEFAULT_STUN_URLS: &str = "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302";

/// One ICE server entry handed to locally created transports.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<SecretString>,
}

/// Transport recovery timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySettings {
    pub send_backoff: Duration,
    pub recv_backoff: Duration,
    /// Attempts per role before recovery gives up.
    pub max_attempts: u32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            send_backoff: Duration::from_millis(DEFAULT_SEND_RETRY_BACKOFF_MS),
            recv_backoff: Duration::from_millis(DEFAULT_RECV_RETRY_BACKOFF_MS),
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }
}

/// Session client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Registry WebSocket endpoint.
    pub signaling_url: String,

    pub room_id: RoomId,

    /// Participant identity; generated when unset.
    pub user_id: ParticipantId,

    /// Join receive-only.
    pub spectator: bool,

    pub recovery: RecoverySettings,

    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_url = vars
            .get("RELAY_SIGNALING_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        if !(signaling_url.starts_with("ws://") || signaling_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_SIGNALING_URL must be a ws:// or wss:// URL, got '{signaling_url}'"
            )));
        }

        let room_id = RoomId::new(
            vars.get("RELAY_ROOM_ID")
                .map_or(DEFAULT_ROOM_ID, String::as_str),
        );
        if room_id.is_empty() {
            return Err(ConfigError::InvalidValue(
                "RELAY_ROOM_ID must not be empty".to_string(),
            ));
        }

        let user_id = match vars.get("RELAY_USER_ID").filter(|s| !s.trim().is_empty()) {
            Some(user_id) => ParticipantId::new(user_id.trim()),
            None => {
                let suffix = uuid::Uuid::new_v4().to_string();
                ParticipantId::new(format!("user-{}", suffix.get(..8).unwrap_or("00000000")))
            }
        };

        let spectator = match vars.get("RELAY_SPECTATOR").map(|s| s.to_ascii_lowercase()) {
            None => false,
            Some(value) => match value.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "RELAY_SPECTATOR must be a boolean, got '{other}'"
                    )))
                }
            },
        };

        let recovery = RecoverySettings {
            send_backoff: Duration::from_millis(parse_or(
                vars,
                "RELAY_SEND_RETRY_BACKOFF_MS",
                DEFAULT_SEND_RETRY_BACKOFF_MS,
            )?),
            recv_backoff: Duration::from_millis(parse_or(
                vars,
                "RELAY_RECV_RETRY_BACKOFF_MS",
                DEFAULT_RECV_RETRY_BACKOFF_MS,
            )?),
            max_attempts: parse_or(vars, "RELAY_MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS)?,
        };

        let mut ice_servers = Vec::new();
        let stun_urls = split_urls(
            vars.get("RELAY_STUN_URLS")
                .map_or(DEFAULT_STUN_URLS, String::as_str),
        );
        if !stun_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: stun_urls,
                username: None,
                credential: None,
            });
        }

        let turn_urls = split_urls(vars.get("RELAY_TURN_URLS").map_or("", String::as_str));
        if !turn_urls.is_empty() {
            let username = vars.get("RELAY_TURN_USERNAME").cloned();
            let credential = vars
                .get("RELAY_TURN_CREDENTIAL")
                .map(|c| SecretString::from(c.clone()));
            if username.is_none() || credential.is_none() {
                return Err(ConfigError::MissingEnvVar(
                    "RELAY_TURN_USERNAME and RELAY_TURN_CREDENTIAL are required with RELAY_TURN_URLS"
                        .to_string(),
                ));
            }
            ice_servers.push(IceServer {
                urls: turn_urls,
                username,
                credential,
            });
        }

        Ok(ClientConfig {
            signaling_url,
            room_id,
            user_id,
            spectator,
            recovery,
            ice_servers,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name} is not a number: {value}"))),
    }
}

fn split_urls(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
