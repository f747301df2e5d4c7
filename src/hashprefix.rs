//! Hash-prefix checker (C2): a hash-sharded, prefix-querying, caching
//! DNS-rewrite oracle used for safe-browsing/parental-control blocking.
//! Candidate-hash generation reuses `psl::PublicSuffixList` (ported from
//! `blocking/psl.rs`) to find the ICANN suffix boundary; hashing uses
//! `ring`, already a `heimdall` dependency.

use crate::bytecache::ByteCache;
use crate::error::HashPrefixError;
use crate::metrics::GatewayMetrics;
use crate::psl::PublicSuffixList;
use async_trait::async_trait;
use ring::digest::{self, SHA256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The injected upstream capability (Design Notes §9's "Upstream"):
/// a single `query` method standing in for the real DNS exchange this
/// crate does not implement. Test doubles implement this directly.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, HashPrefixError>;
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HashPrefixConfig {
    pub txt_suffix: String,
    pub cache_ttl: Duration,
    pub cache_size: usize,
}

impl Default for HashPrefixConfig {
    fn default() -> Self {
        Self {
            txt_suffix: "sb-query.example.".to_string(),
            cache_ttl: Duration::from_secs(86_400),
            cache_size: 10_000,
        }
    }
}

pub struct HashPrefixChecker<U: TxtResolver> {
    cache: ByteCache,
    psl: Arc<PublicSuffixList>,
    upstream: U,
    config: HashPrefixConfig,
    metrics: Option<Arc<GatewayMetrics>>,
}

type Prefix = [u8; 2];
type Hash = [u8; 32];

impl<U: TxtResolver> HashPrefixChecker<U> {
    pub fn new(upstream: U, psl: Arc<PublicSuffixList>, config: HashPrefixConfig) -> Self {
        Self {
            cache: ByteCache::new(config.cache_size),
            psl,
            upstream,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, blocked: bool, upstream_hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_hashprefix_check(blocked, upstream_hit);
        }
    }

    pub async fn check(&self, host: &str) -> Result<bool, HashPrefixError> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let candidates = candidate_suffixes(&self.psl, &host);
        if candidates.is_empty() {
            self.record(false, false);
            return Ok(false);
        }

        let candidate_hashes: Vec<(Prefix, Hash)> = candidates
            .iter()
            .map(|s| {
                let h = sha256(s.as_bytes());
                ([h[0], h[1]], h)
            })
            .collect();

        let mut unresolved: Vec<(Prefix, Hash)> = Vec::new();
        for (prefix, hash) in &candidate_hashes {
            match self.cache.get(prefix) {
                Some(bytes) => match decode_cache_entry(&bytes) {
                    Some((expiry, hashes)) if now_secs() <= expiry => {
                        if hashes.contains(hash) {
                            self.record(true, false);
                            return Ok(true);
                        }
                        // resolved negative for this candidate; keep going
                    }
                    _ => unresolved.push((*prefix, *hash)),
                },
                None => unresolved.push((*prefix, *hash)),
            }
        }

        if unresolved.is_empty() {
            self.record(false, false);
            return Ok(false);
        }

        let mut seen_prefixes = Vec::new();
        for (prefix, _) in &unresolved {
            if !seen_prefixes.contains(prefix) {
                seen_prefixes.push(*prefix);
            }
        }
        let query_name = format!(
            "{}.{}",
            seen_prefixes
                .iter()
                .map(hex::encode)
                .collect::<Vec<_>>()
                .join("."),
            self.config.txt_suffix
        );

        let txt_values = self.upstream.query_txt(&query_name).await?;
        let received: Vec<Hash> = txt_values
            .iter()
            .filter_map(|v| decode_txt_hash(v))
            .collect();

        let mut by_prefix: HashMap<Prefix, Vec<Hash>> = HashMap::new();
        for hash in &received {
            by_prefix
                .entry([hash[0], hash[1]])
                .or_default()
                .push(*hash);
        }

        let expiry = now_secs() + self.config.cache_ttl.as_secs();
        for prefix in &seen_prefixes {
            let group = by_prefix.get(prefix).cloned().unwrap_or_default();
            self.cache.set(prefix.to_vec(), encode_cache_entry(expiry, &group));
        }

        let blocked = unresolved.iter().any(|(_, hash)| received.contains(hash));
        self.record(blocked, true);
        Ok(blocked)
    }
}

fn sha256(data: &[u8]) -> Hash {
    let digest = digest::digest(&SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Splits `host` into suffixes from the full host down to (but not
/// including) the recognised public suffix, capped to the 4 most
/// specific entries. See DESIGN.md for the "truncate to at most four
/// labels from the right" open-question resolution.
fn candidate_suffixes(psl: &PublicSuffixList, host: &str) -> Vec<String> {
    let labels: Vec<&str> = host.split('.').collect();
    let suffix_len = psl.public_suffix_label_count(host);
    if labels.len() <= suffix_len {
        return Vec::new();
    }
    let reg_start_idx = labels.len() - suffix_len - 1;
    let mut out = Vec::new();
    for i in 0..=reg_start_idx {
        out.push(labels[i..].join("."));
    }
    out.truncate(4);
    out
}

fn encode_cache_entry(expiry: u64, hashes: &[Hash]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + hashes.len() * 32);
    buf.extend_from_slice(&expiry.to_be_bytes());
    for h in hashes {
        buf.extend_from_slice(h);
    }
    buf
}

fn decode_cache_entry(bytes: &[u8]) -> Option<(u64, Vec<Hash>)> {
    if bytes.len() < 8 || (bytes.len() - 8) % 32 != 0 {
        return None;
    }
    let expiry = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
    let hashes = bytes[8..]
        .chunks_exact(32)
        .map(|c| {
            let mut h = [0u8; 32];
            h.copy_from_slice(c);
            h
        })
        .collect();
    Some((expiry, hashes))
}

fn decode_txt_hash(value: &str) -> Option<Hash> {
    if value.len() != 64 {
        return None;
    }
    let bytes = hex::decode(value).ok()?;
    let mut h = [0u8; 32];
    h.copy_from_slice(&bytes);
    Some(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockResolver {
        responses: Vec<String>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl TxtResolver for MockResolver {
        async fn query_txt(&self, _name: &str) -> Result<Vec<String>, HashPrefixError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.responses.clone())
        }
    }

    fn hash_hex(data: &str) -> String {
        hex::encode(sha256(data.as_bytes()))
    }

    #[tokio::test]
    async fn blocked_host_is_cached_after_first_check() {
        let resolver = MockResolver {
            responses: vec![hash_hex("example.org")],
            calls: Mutex::new(0),
        };
        let checker = HashPrefixChecker::new(
            resolver,
            Arc::new(PublicSuffixList::new()),
            HashPrefixConfig::default(),
        );
        assert!(checker.check("example.org").await.unwrap());
        assert!(checker.check("example.org").await.unwrap());
        assert_eq!(*checker.upstream.calls.lock().unwrap(), 1);
        assert_eq!(checker.cache.stats().count, 1);
    }

    #[tokio::test]
    async fn wrong_tail_hash_is_not_blocked_and_is_cached() {
        let real = sha256("example.org".as_bytes());
        let mut fake = [0xabu8; 32];
        fake[0] = real[0];
        fake[1] = real[1];
        let resolver = MockResolver {
            responses: vec![hex::encode(fake)],
            calls: Mutex::new(0),
        };
        let checker = HashPrefixChecker::new(
            resolver,
            Arc::new(PublicSuffixList::new()),
            HashPrefixConfig::default(),
        );
        assert!(!checker.check("example.org").await.unwrap());
        assert!(!checker.check("example.org").await.unwrap());
        assert_eq!(*checker.upstream.calls.lock().unwrap(), 1);
        assert_eq!(checker.cache.stats().count, 1);
    }

    #[test]
    fn candidates_empty_for_bare_suffix() {
        let psl = PublicSuffixList::new();
        assert!(candidate_suffixes(&psl, "com").is_empty());
    }

    #[test]
    fn candidates_capped_at_four() {
        let psl = PublicSuffixList::new();
        let c = candidate_suffixes(&psl, "a.b.c.d.e.example.com");
        assert_eq!(c.len(), 4);
        assert_eq!(c[0], "a.b.c.d.e.example.com");
    }
}
