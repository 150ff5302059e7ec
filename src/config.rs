use std::{net::SocketAddrV4, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid size value {value:?} for {key} (expected e.g. \"2M\", \"200M\", \"16K\")")]
    InvalidSize { key: &'static str, value: String },
    #[error("invalid integer for {key}: {source}")]
    InvalidInt {
        key: &'static str,
        source: std::num::ParseIntError,
    },
}

/// Parses human-readable byte sizes like `"2M"`/`"200M"`/`"16K"` as used by
/// `maxmsgsize`/`streamsize`/`eventsize` (SPEC_FULL.md §6.3). `humansize` only
/// formats sizes for display (used in logging below), so parsing is hand-rolled.
fn parse_human_size(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::InvalidSize {
            key,
            value: value.to_owned(),
        })
}

/// Parses a plain integer env var, falling back to `default` when unset.
fn parse_int_env<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|source| ConfigError::InvalidInt { key, source }),
        Err(_) => Ok(default),
    }
}

/// Per-subscription broker tuning, shared by the `mail`/`send`/`del` workers.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionConfig {
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub max_pending: u32,
    pub max_requests: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(30),
            max_deliver: 30,
            max_pending: 1024,
            max_requests: 32,
        }
    }
}

/// Structured, validated-at-startup configuration. Mirrors the recognized
/// options of SPEC_FULL.md §6.3.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub authdomain: String,
    pub usrdomain: String,
    pub orgdomain: String,
    pub maxmsgsize: u64,
    pub readtimeout: Duration,
    pub writetimeout: Duration,
    pub streamsize: u64,
    pub eventsize: u64,
    pub mockdnssource: Option<String>,
    pub subscription: SubscriptionConfig,
    /// Directory the local object store keeps raw MIME blobs under. Not in
    /// SPEC_FULL.md's recognized-options table (§6.3 only specifies the
    /// abstract object-store contract), but every concrete deployment of the
    /// in-process `LocalBlobStore` needs a root path to put them in.
    pub blobdir: std::path::PathBuf,
    /// Port used for every outbound delivery hop (SMTP submission/relay), in
    /// lieu of MX-priority resolution (see `SendWorker`'s doc comment).
    pub outbound_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 2525,
            authdomain: "lists.mail.localhost".to_owned(),
            usrdomain: "lists.mail.localhost".to_owned(),
            orgdomain: "org.lists.mail.localhost".to_owned(),
            maxmsgsize: 2 * 1024 * 1024,
            readtimeout: Duration::from_secs(5),
            writetimeout: Duration::from_secs(5),
            streamsize: 200 * 1024 * 1024,
            eventsize: 16 * 1024,
            mockdnssource: None,
            subscription: SubscriptionConfig::default(),
            blobdir: std::path::PathBuf::from("./blobs"),
            outbound_port: 25,
        }
    }
}

impl Config {
    /// Loads configuration from the environment, falling back to the
    /// defaults in SPEC_FULL.md §6.3 for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = parse_int_env("PORT", defaults.port)?;

        let maxmsgsize = match std::env::var("MAXMSGSIZE") {
            Ok(v) => parse_human_size("MAXMSGSIZE", &v)?,
            Err(_) => defaults.maxmsgsize,
        };

        let streamsize = match std::env::var("STREAMSIZE") {
            Ok(v) => parse_human_size("STREAMSIZE", &v)?,
            Err(_) => defaults.streamsize,
        };

        let eventsize = match std::env::var("EVENTSIZE") {
            Ok(v) => parse_human_size("EVENTSIZE", &v)?,
            Err(_) => defaults.eventsize,
        };

        let readtimeout = Duration::from_secs(parse_int_env(
            "READTIMEOUT",
            defaults.readtimeout.as_secs(),
        )?);
        let writetimeout = Duration::from_secs(parse_int_env(
            "WRITETIMEOUT",
            defaults.writetimeout.as_secs(),
        )?);

        let subscription = SubscriptionConfig {
            ack_wait: Duration::from_secs(parse_int_env(
                "ACKWAIT",
                defaults.subscription.ack_wait.as_secs(),
            )?),
            max_deliver: parse_int_env("MAXDELIVER", defaults.subscription.max_deliver)?,
            max_pending: parse_int_env("MAXPENDING", defaults.subscription.max_pending)?,
            max_requests: parse_int_env("MAXREQUESTS", defaults.subscription.max_requests)?,
        };

        let config = Self {
            port,
            authdomain: std::env::var("AUTHDOMAIN").unwrap_or(defaults.authdomain),
            usrdomain: std::env::var("USRDOMAIN").unwrap_or(defaults.usrdomain),
            orgdomain: std::env::var("ORGDOMAIN").unwrap_or(defaults.orgdomain),
            maxmsgsize,
            readtimeout,
            writetimeout,
            streamsize,
            eventsize,
            mockdnssource: std::env::var("MOCKDNSSOURCE").ok(),
            subscription,
            blobdir: std::env::var("BLOBDIR")
                .map(std::path::PathBuf::from)
                .unwrap_or(defaults.blobdir),
            outbound_port: parse_int_env("OUTBOUND_PORT", defaults.outbound_port)?,
        };

        tracing::info!(
            maxmsgsize = %humansize::format_size(config.maxmsgsize, humansize::BINARY),
            port = config.port,
            authdomain = config.authdomain,
            "loaded configuration"
        );

        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, self.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.port, 2525);
        assert_eq!(config.maxmsgsize, 2 * 1024 * 1024);
        assert_eq!(config.readtimeout, Duration::from_secs(5));
        assert_eq!(config.subscription.ack_wait, Duration::from_secs(30));
        assert_eq!(config.subscription.max_deliver, 30);
        assert_eq!(config.subscription.max_pending, 1024);
    }
}
