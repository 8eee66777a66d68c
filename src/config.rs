//! Server Configuration
//!
//! Defaults plus environment overrides.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::game::state::MatchRules;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3001;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Quotas for new matches.
    pub rules: MatchRules,
    /// How long a room may sit with nobody connected before teardown.
    pub room_idle_timeout: Duration,
    /// How often the cleanup loop runs.
    pub cleanup_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            rules: MatchRules::default(),
            room_idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    ///
    /// `BIND_ADDR`, `PORT`, `MAX_CONNECTIONS`, `BALL_QUOTA`, `WICKET_QUOTA`,
    /// `ROOM_IDLE_TIMEOUT_SECS`. Unparseable values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut bind_addr = parse_or(&lookup, "BIND_ADDR", defaults.bind_addr);
        if lookup("BIND_ADDR").is_none() {
            bind_addr.set_port(parse_or(&lookup, "PORT", defaults.bind_addr.port()));
        }

        let mut rules = MatchRules {
            ball_quota: parse_or(&lookup, "BALL_QUOTA", defaults.rules.ball_quota),
            wicket_quota: parse_or(&lookup, "WICKET_QUOTA", defaults.rules.wicket_quota),
        };
        // A zero quota would end every innings before the first ball
        if rules.ball_quota == 0 {
            warn!("BALL_QUOTA must be positive, using {}", defaults.rules.ball_quota);
            rules.ball_quota = defaults.rules.ball_quota;
        }
        if rules.wicket_quota == 0 {
            warn!("WICKET_QUOTA must be positive, using {}", defaults.rules.wicket_quota);
            rules.wicket_quota = defaults.rules.wicket_quota;
        }

        Self {
            bind_addr,
            max_connections: parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections),
            rules,
            room_idle_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ROOM_IDLE_TIMEOUT_SECS",
                defaults.room_idle_timeout.as_secs(),
            )),
            ..defaults
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 3001);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.rules.ball_quota, 6);
        assert_eq!(config.rules.wicket_quota, 3);
        assert_eq!(config.room_idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "4000"),
            ("BALL_QUOTA", "12"),
            ("WICKET_QUOTA", "10"),
            ("ROOM_IDLE_TIMEOUT_SECS", "30"),
        ]));

        assert_eq!(config.bind_addr, "0.0.0.0:4000".parse().unwrap());
        assert_eq!(config.rules, MatchRules { ball_quota: 12, wicket_quota: 10 });
        assert_eq!(config.room_idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_bind_addr_wins_over_port() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("PORT", "4000"),
        ]));
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "not-a-port"),
            ("BALL_QUOTA", "0"),
            ("MAX_CONNECTIONS", "-5"),
        ]));

        assert_eq!(config.bind_addr.port(), 3001);
        assert_eq!(config.rules.ball_quota, 6);
        assert_eq!(config.max_connections, 1000);
    }
}
