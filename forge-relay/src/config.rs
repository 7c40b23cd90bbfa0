use crate::error::{Error, Result};
use crate::store::Channel;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_SITE_URL: &str = "https://rozuvan.atlassian.net";
const DEFAULT_DOWNSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// How far the relay trusts routing claims it never verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingPolicy {
    /// Route successor-channel relays to the `apiBaseUrl` claim when present.
    #[default]
    TrustClaims,
    /// Always route to the configured site; claims are recorded but unused.
    StaticOnly,
}

impl FromStr for RoutingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trust-claims" => Ok(RoutingPolicy::TrustClaims),
            "static-only" => Ok(RoutingPolicy::StaticOnly),
            other => Err(Error::InvalidConfig(format!(
                "unknown routing policy: {}",
                other
            ))),
        }
    }
}

/// Configuration for the capture/relay server
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Static downstream site used when a record carries no usable routing
    pub site_url: Url,

    /// Fixed target of `/forge-direct-comment`
    pub diagnostic_url: Url,

    /// Channel `/forge-comment` reads from unless the request overrides it
    pub default_channel: Channel,

    pub routing_policy: RoutingPolicy,

    /// Timeout applied by the outbound HTTP client
    pub downstream_timeout: Duration,
}

impl RelayConfig {
    /// Create a new configuration with defaults, relaying to `site_url`
    pub fn new(site_url: impl Into<Url>) -> Self {
        let site_url = site_url.into();

        Self {
            diagnostic_url: site_url.clone(),
            site_url,
            default_channel: Channel::Legacy,
            routing_policy: RoutingPolicy::default(),
            downstream_timeout: DEFAULT_DOWNSTREAM_TIMEOUT,
        }
    }

    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys fall back to defaults;
    /// set-but-invalid keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let site_url = match lookup("FORGE_SITE_URL") {
            Some(raw) => parse_url("FORGE_SITE_URL", &raw)?,
            None => parse_url("FORGE_SITE_URL", DEFAULT_SITE_URL)?,
        };

        let mut config = Self::new(site_url);

        if let Some(raw) = lookup("FORGE_DIAGNOSTIC_URL") {
            config.diagnostic_url = parse_url("FORGE_DIAGNOSTIC_URL", &raw)?;
        }

        if let Some(raw) = lookup("FORGE_RELAY_CHANNEL") {
            config.default_channel = raw.parse()?;
        }

        if let Some(raw) = lookup("FORGE_ROUTING_POLICY") {
            config.routing_policy = raw.parse()?;
        }

        if let Some(raw) = lookup("FORGE_DOWNSTREAM_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("FORGE_DOWNSTREAM_TIMEOUT_SECS={}", raw))
            })?;
            config.downstream_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Set the diagnostic relay target
    pub fn with_diagnostic_url(mut self, url: Url) -> Self {
        self.diagnostic_url = url;
        self
    }

    /// Set the default relay channel
    pub fn with_default_channel(mut self, channel: Channel) -> Self {
        self.default_channel = channel;
        self
    }

    pub fn with_routing_policy(mut self, policy: RoutingPolicy) -> Self {
        self.routing_policy = policy;
        self
    }

    /// Set outbound request timeout
    pub fn with_downstream_timeout(mut self, timeout: Duration) -> Self {
        self.downstream_timeout = timeout;
        self
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|e| Error::InvalidConfig(format!("{}={}: {}", key, raw, e)))
}
