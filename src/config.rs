//! Ambient configuration: one plain struct per component, following
//! `heimdall`'s `DnsConfig` (a flat struct with `Duration`/size fields
//! and sane defaults) rather than introducing a YAML loader — on-disk
//! config loading is out of scope for this crate, so callers build
//! `GatewayConfig` directly or via `serde` from whatever source they
//! choose (the `Deserialize` derives exist for exactly that).

use crate::hashprefix::HashPrefixConfig;
use crate::safesearch::SafeSearchConfig;
use crate::whois::WhoisConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub hash_prefix: HashPrefixConfig,
    pub safe_search: SafeSearchConfig,
    pub whois: WhoisConfig,
    pub session: SessionConfig,
    pub ipset_rules: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hash_prefix: HashPrefixConfig::default(),
            safe_search: SafeSearchConfig::default(),
            whois: WhoisConfig::default(),
            session: SessionConfig::default(),
            ipset_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub db_path: String,
    #[serde(with = "humantime_secs")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: "wardengate-sessions".to_string(),
            ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Serializes a `Duration` as whole seconds, since this crate's configs
/// never need sub-second resolution and plain integers read better in
/// hand-edited config sources than a nested struct would.
mod humantime_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ttls() {
        let config = GatewayConfig::default();
        assert_eq!(config.session.ttl, Duration::from_secs(30 * 24 * 3600));
        assert!(config.safe_search.enabled);
    }
}
