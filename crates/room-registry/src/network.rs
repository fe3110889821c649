//! Announced address resolution.
//!
//! The address placed in ICE candidates is, in order of preference:
//! 1. the `PUBLIC_IP` configuration value,
//! 2. an address discovered once via an HTTP lookup and cached,
//! 3. loopback.
//!
//! A failed lookup is not cached, so the next transport retries it.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

/// Address announced when nothing better is known.
pub const FALLBACK_ANNOUNCED_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Deserialize)]
struct LookupResponse {
    ip: IpAddr,
}

/// Resolves the externally reachable address of this host.
#[derive(Debug)]
pub struct AddressResolver {
    configured: Option<IpAddr>,
    lookup_url: Option<String>,
    http_client: reqwest::Client,
    discovered: OnceCell<IpAddr>,
}

impl AddressResolver {
    /// Create a resolver.
    ///
    /// # Arguments
    ///
    /// * `configured` - Operator-supplied address, used verbatim when set
    /// * `lookup_url` - Endpoint answering `{"ip": "..."}`; `None` disables discovery
    /// * `timeout` - Upper bound for one lookup request
    #[must_use]
    pub fn new(configured: Option<IpAddr>, lookup_url: Option<String>, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(target: "rr.network", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            configured,
            lookup_url,
            http_client,
            discovered: OnceCell::new(),
        }
    }

    /// Resolver that always announces `ip`.
    #[must_use]
    pub fn fixed(ip: IpAddr) -> Self {
        Self::new(Some(ip), None, Duration::from_secs(1))
    }

    /// Address to announce in ICE candidates.
    #[instrument(skip_all)]
    pub async fn announced_ip(&self) -> IpAddr {
        if let Some(ip) = self.configured {
            return ip;
        }
        if let Some(ip) = self.discovered.get() {
            return *ip;
        }

        let Some(url) = self.lookup_url.as_deref() else {
            return FALLBACK_ANNOUNCED_IP;
        };

        match self
            .discovered
            .get_or_try_init(|| self.lookup(url))
            .await
        {
            Ok(ip) => *ip,
            Err(reason) => {
                warn!(
                    target: "rr.network",
                    reason = %reason,
                    fallback = %FALLBACK_ANNOUNCED_IP,
                    "Public address lookup failed, announcing loopback"
                );
                FALLBACK_ANNOUNCED_IP
            }
        }
    }

    async fn lookup(&self, url: &str) -> Result<IpAddr, String> {
        debug!(target: "rr.network", url = %url, "Looking up public address");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("lookup returned {}", response.status()));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| format!("invalid lookup response: {e}"))?;

        debug!(target: "rr.network", ip = %body.ip, "Public address discovered");
        Ok(body.ip)
    }
}
