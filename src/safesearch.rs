//! Safe-search engine (C3): a rule-compiled query rewriter with a TTL'd
//! result cache. Each enabled service's rule text (AdGuard-style
//! dnsrewrite syntax, `assets/safesearch/*.txt`) is concatenated and
//! compiled through `filterengine`, the same engine `rewrite.rs` uses.
//! Unlike C4's atomic `ArcSwap`, §5 specifies a reader lock around engine
//! access and an exclusive lock for `Update`, so this uses
//! `parking_lot::RwLock` instead.

use crate::bytecache::ByteCache;
use crate::filterengine::{self, CompiledRule, QueryType, RrKind, Rewrite};
use crate::metrics::GatewayMetrics;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const BING: &str = include_str!("../assets/safesearch/bing.txt");
const DUCKDUCKGO: &str = include_str!("../assets/safesearch/duckduckgo.txt");
const ECOSIA: &str = include_str!("../assets/safesearch/ecosia.txt");
const GOOGLE: &str = include_str!("../assets/safesearch/google.txt");
const PIXABAY: &str = include_str!("../assets/safesearch/pixabay.txt");
const YANDEX: &str = include_str!("../assets/safesearch/yandex.txt");
const YOUTUBE: &str = include_str!("../assets/safesearch/youtube.txt");

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SafeSearchConfig {
    pub enabled: bool,
    pub bing: bool,
    pub duckduckgo: bool,
    pub ecosia: bool,
    pub google: bool,
    pub pixabay: bool,
    pub yandex: bool,
    pub youtube: bool,
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl Default for SafeSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bing: true,
            duckduckgo: true,
            ecosia: true,
            google: true,
            pixabay: true,
            yandex: true,
            youtube: true,
            cache_size: 10_000,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafeSearchRule {
    Ip(IpAddr),
    Cname(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub filtered: bool,
    pub reason: &'static str,
    pub rule: Option<SafeSearchRule>,
}

pub struct SafeSearchEngine {
    rules: RwLock<Vec<CompiledRule>>,
    cache: ByteCache,
    config: RwLock<SafeSearchConfig>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl SafeSearchEngine {
    pub fn new(config: SafeSearchConfig) -> Self {
        let rules = compile_enabled(&config);
        let cache_size = config.cache_size;
        tracing::info!(rule_count = rules.len(), "compiled safe-search rule set");
        Self {
            rules: RwLock::new(rules),
            cache: ByteCache::new(cache_size),
            config: RwLock::new(config),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, rewritten: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_safesearch_check(rewritten);
        }
    }

    /// Atomically recompiles the rule set and clears the cache.
    pub fn update(&self, new_config: SafeSearchConfig) {
        let rules = compile_enabled(&new_config);
        tracing::info!(rule_count = rules.len(), "recompiled safe-search rule set");
        *self.rules.write() = rules;
        *self.config.write() = new_config;
        self.cache.clear();
    }

    pub fn check_host(&self, host: &str, qtype: QueryType) -> Option<FilterResult> {
        if !matches!(qtype, QueryType::A | QueryType::Aaaa | QueryType::Https) {
            return None;
        }
        if !self.config.read().enabled {
            return None;
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let key = cache_key(&qtype, &host);
        if let Some(bytes) = self.cache.get(&key) {
            if let Some((expiry, result)) = decode_entry(&bytes) {
                if now_secs() <= expiry {
                    self.record(true);
                    return Some(result);
                }
            }
        }

        let rules = self.rules.read();
        let matched = filterengine::match_domain(&rules, &host);
        let Some(head) = matched.first() else {
            self.record(false);
            return None;
        };

        let rule = match &head.rewrite {
            Rewrite::Ip { kind, addr } if kind_for_qtype(qtype) == Some(*kind) => {
                Some(SafeSearchRule::Ip(*addr))
            }
            Rewrite::Cname(target) => Some(SafeSearchRule::Cname(target.clone())),
            _ => None,
        };
        let result = FilterResult {
            filtered: true,
            reason: "SafeSearch",
            rule,
        };

        let expiry = now_secs() + self.config.read().cache_ttl.as_secs();
        self.cache.set(key, encode_entry(expiry, &result));
        self.record(true);
        Some(result)
    }
}

fn kind_for_qtype(qtype: QueryType) -> Option<RrKind> {
    match qtype {
        QueryType::A => Some(RrKind::A),
        QueryType::Aaaa => Some(RrKind::Aaaa),
        _ => None,
    }
}

fn compile_enabled(config: &SafeSearchConfig) -> Vec<CompiledRule> {
    let mut text = String::new();
    let services: &[(bool, &str)] = &[
        (config.bing, BING),
        (config.duckduckgo, DUCKDUCKGO),
        (config.ecosia, ECOSIA),
        (config.google, GOOGLE),
        (config.pixabay, PIXABAY),
        (config.yandex, YANDEX),
        (config.youtube, YOUTUBE),
    ];
    for (enabled, rule_text) in services {
        if *enabled {
            text.push_str(rule_text);
            text.push('\n');
        }
    }
    filterengine::compile_rule_text(&text)
}

fn cache_key(qtype: &QueryType, host: &str) -> Vec<u8> {
    let qtype_str = match qtype {
        QueryType::A => "A",
        QueryType::Aaaa => "AAAA",
        QueryType::Https => "HTTPS",
        QueryType::Other(_) => "OTHER",
    };
    format!("{qtype_str} {host}").into_bytes()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// Binary cache entry: 8-byte BE expiry, 1-byte tag (0=ipv4,1=ipv6,2=cname,3=none),
// then payload (4 or 16 raw bytes, or a 2-byte BE length + utf8 bytes).
fn encode_entry(expiry: u64, result: &FilterResult) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&expiry.to_be_bytes());
    match &result.rule {
        Some(SafeSearchRule::Ip(IpAddr::V4(ip))) => {
            buf.push(0);
            buf.extend_from_slice(&ip.octets());
        }
        Some(SafeSearchRule::Ip(IpAddr::V6(ip))) => {
            buf.push(1);
            buf.extend_from_slice(&ip.octets());
        }
        Some(SafeSearchRule::Cname(name)) => {
            buf.push(2);
            buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
        }
        None => buf.push(3),
    }
    buf
}

fn decode_entry(bytes: &[u8]) -> Option<(u64, FilterResult)> {
    if bytes.len() < 9 {
        return None;
    }
    let expiry = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
    let rule = match bytes[8] {
        0 if bytes.len() == 13 => {
            let octets: [u8; 4] = bytes[9..13].try_into().ok()?;
            Some(SafeSearchRule::Ip(IpAddr::from(octets)))
        }
        1 if bytes.len() == 25 => {
            let octets: [u8; 16] = bytes[9..25].try_into().ok()?;
            Some(SafeSearchRule::Ip(IpAddr::from(octets)))
        }
        2 if bytes.len() >= 11 => {
            let len = u16::from_be_bytes(bytes[9..11].try_into().ok()?) as usize;
            let name = String::from_utf8(bytes.get(11..11 + len)?.to_vec()).ok()?;
            Some(SafeSearchRule::Cname(name))
        }
        3 => None,
        _ => return None,
    };
    Some((
        expiry,
        FilterResult {
            filtered: true,
            reason: "SafeSearch",
            rule,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yandex_rewrites_to_literal_ip() {
        let engine = SafeSearchEngine::new(SafeSearchConfig::default());
        let result = engine.check_host("yandex.ru", QueryType::A).unwrap();
        assert_eq!(
            result,
            FilterResult {
                filtered: true,
                reason: "SafeSearch",
                rule: Some(SafeSearchRule::Ip("213.180.193.56".parse().unwrap())),
            }
        );

        // Second call within TTL is served from cache.
        let cached = engine.check_host("yandex.ru", QueryType::A).unwrap();
        assert_eq!(cached, result);
    }

    #[test]
    fn youtube_rewrites_to_cname() {
        let engine = SafeSearchEngine::new(SafeSearchConfig::default());
        let result = engine.check_host("www.youtube.com", QueryType::A).unwrap();
        assert_eq!(result.rule, Some(SafeSearchRule::Cname("restrict.youtube.com".to_string())));
    }

    #[test]
    fn unmatched_host_returns_none_and_is_not_cached() {
        let engine = SafeSearchEngine::new(SafeSearchConfig::default());
        assert!(engine.check_host("example.com", QueryType::A).is_none());
        assert_eq!(engine.cache.stats().count, 0);
    }

    #[test]
    fn non_address_qtype_is_pass_through() {
        let engine = SafeSearchEngine::new(SafeSearchConfig::default());
        assert!(engine
            .check_host("yandex.ru", QueryType::Other(15))
            .is_none());
        assert_eq!(engine.cache.stats().count, 0);
    }

    #[test]
    fn update_clears_cache() {
        let engine = SafeSearchEngine::new(SafeSearchConfig::default());
        engine.check_host("yandex.ru", QueryType::A);
        assert_eq!(engine.cache.stats().count, 1);
        let mut cfg = SafeSearchConfig::default();
        cfg.yandex = false;
        engine.update(cfg);
        assert_eq!(engine.cache.stats().count, 0);
        assert!(engine.check_host("yandex.ru", QueryType::A).is_none());
    }
}
