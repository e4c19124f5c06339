use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::Settings;

/// Server configuration, read once from `FEATURED_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "featured".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            settings: Settings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to
    /// the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            bind: lookup("FEATURED_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "FEATURED_PORT").unwrap_or(defaults.port),
            data_dir: lookup("FEATURED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("FEATURED_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "FEATURED_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "FEATURED_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "FEATURED_METRICS_PORT"),
            tls_cert: lookup("FEATURED_TLS_CERT"),
            tls_key: lookup("FEATURED_TLS_KEY"),
            settings: Settings {
                // A ceiling of zero would refuse every activation.
                max_active: parsed(&lookup, "FEATURED_MAX_ACTIVE")
                    .filter(|&n: &usize| n > 0)
                    .unwrap_or(defaults.settings.max_active),
                seed_rank: parsed(&lookup, "FEATURED_SEED_RANK")
                    .unwrap_or(defaults.settings.seed_rank),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.settings, Settings::default());
        assert!(config.metrics_port.is_none());
        assert!(config.tls_cert.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("FEATURED_PORT", "6000"),
            ("FEATURED_DATA_DIR", "/var/lib/featured"),
            ("FEATURED_MAX_ACTIVE", "3"),
            ("FEATURED_SEED_RANK", "-10"),
            ("FEATURED_METRICS_PORT", "9090"),
        ]);
        assert_eq!(config.port, 6000);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/featured"));
        assert_eq!(config.settings.max_active, 3);
        assert_eq!(config.settings.seed_rank, -10);
        assert_eq!(config.metrics_port, Some(9090));
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = from_pairs(&[("FEATURED_PORT", "http"), ("FEATURED_MAX_ACTIVE", "-1")]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.settings.max_active, 8);
    }

    #[test]
    fn mixed_numeric_types_parse_independently() {
        let config = from_pairs(&[
            ("FEATURED_PORT", "7000"),
            ("FEATURED_MAX_CONNECTIONS", "12"),
            ("FEATURED_COMPACT_THRESHOLD", "50"),
            ("FEATURED_SEED_RANK", " 4 "),
        ]);
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.settings.seed_rank, 4);
    }

    #[test]
    fn zero_max_active_falls_back_to_default() {
        let config = from_pairs(&[("FEATURED_MAX_ACTIVE", "0")]);
        assert_eq!(config.settings.max_active, Settings::default().max_active);
    }
}
