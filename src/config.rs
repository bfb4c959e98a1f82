//! Engine configuration. See spec §6.
//!
//! Mirrors `FastRTAS.Core.RTAS.RTAS`'s `configs: dict` parameter: a flat
//! key/value map with defaults, loadable from string keys (e.g. parsed from
//! a config file by an external driver) or built directly for tests.

use std::collections::HashMap;
use std::time::Duration;

/// Grace period between bind and dial, default 1s.
const DEFAULT_PEER_INIT_TIME_SECS: u64 = 1;
/// Socket read/write timeout, default 3s.
const DEFAULT_PEER_TIMEOUT_SECS: u64 = 3;
/// `sigma` for share and triple sampling, default 5.
const DEFAULT_SHARE_STD: f64 = 5.0;
/// Batch size for triple generation/caching, default 128.
const DEFAULT_CACHED_TRIPLES: usize = 128;

/// Runtime configuration for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// `peer.init_time`: grace period between bind and dial.
    pub peer_init_time: Duration,
    /// `peer.timeout`: socket read/write timeout.
    pub peer_timeout: Duration,
    /// `rtas.share_std`: standard deviation used for share and triple masks.
    pub share_std: f64,
    /// `rtas.cached_triples`: triple batch size.
    pub cached_triples: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_init_time: Duration::from_secs(DEFAULT_PEER_INIT_TIME_SECS),
            peer_timeout: Duration::from_secs(DEFAULT_PEER_TIMEOUT_SECS),
            share_std: DEFAULT_SHARE_STD,
            cached_triples: DEFAULT_CACHED_TRIPLES,
        }
    }
}

impl Config {
    /// Build a `Config` from a string key/value map, falling back to
    /// defaults for any key that is absent or fails to parse.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut config = Config::default();

        if let Some(v) = map.get("peer.init_time").and_then(|s| s.parse::<u64>().ok()) {
            config.peer_init_time = Duration::from_secs(v);
        }
        if let Some(v) = map.get("peer.timeout").and_then(|s| s.parse::<u64>().ok()) {
            config.peer_timeout = Duration::from_secs(v);
        }
        if let Some(v) = map.get("rtas.share_std").and_then(|s| s.parse::<f64>().ok()) {
            config.share_std = v;
        }
        if let Some(v) = map
            .get("rtas.cached_triples")
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.cached_triples = v;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.peer_init_time, Duration::from_secs(1));
        assert_eq!(config.peer_timeout, Duration::from_secs(3));
        assert_eq!(config.share_std, 5.0);
        assert_eq!(config.cached_triples, 128);
    }

    #[test]
    fn from_map_overrides_only_present_keys() {
        let mut map = HashMap::new();
        map.insert("rtas.cached_triples".to_string(), "4".to_string());
        let config = Config::from_map(&map);
        assert_eq!(config.cached_triples, 4);
        assert_eq!(config.share_std, 5.0);
    }
}
