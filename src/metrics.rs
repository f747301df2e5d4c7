//! Prometheus metrics for the gateway's core components. Follows the
//! registry/collector/export shape of `heimdall`'s `DnsMetrics`: one
//! `Registry`, one collector field per observed quantity, `record_*`/
//! `update_*` setters called from the components themselves, and a
//! `TextEncoder`-based `export()` for the scrape endpoint.

use prometheus::{CounterVec, Encoder, IntCounter, IntGauge, Registry, TextEncoder, opts};

pub struct GatewayMetrics {
    registry: Registry,

    cache_hits: CounterVec,
    cache_misses: CounterVec,
    cache_evictions: CounterVec,

    hashprefix_checks_total: IntCounter,
    hashprefix_blocked_total: IntCounter,
    hashprefix_upstream_queries: IntCounter,

    safesearch_checks_total: IntCounter,
    safesearch_rewritten_total: IntCounter,

    rewrite_matches_total: IntCounter,

    whois_queries_total: IntCounter,
    whois_failures_total: IntCounter,

    ipset_adds_total: IntCounter,
    ipset_errors_total: IntCounter,

    active_sessions: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits = CounterVec::new(
            opts!("wardengate_cache_hits_total", "Total cache hits by component"),
            &["component"],
        )?;
        let cache_misses = CounterVec::new(
            opts!(
                "wardengate_cache_misses_total",
                "Total cache misses by component"
            ),
            &["component"],
        )?;
        let cache_evictions = CounterVec::new(
            opts!(
                "wardengate_cache_evictions_total",
                "Total cache evictions by component"
            ),
            &["component"],
        )?;

        let hashprefix_checks_total = IntCounter::with_opts(opts!(
            "wardengate_hashprefix_checks_total",
            "Total hostnames checked against the hash-prefix oracle"
        ))?;
        let hashprefix_blocked_total = IntCounter::with_opts(opts!(
            "wardengate_hashprefix_blocked_total",
            "Total hostnames found blocked by the hash-prefix oracle"
        ))?;
        let hashprefix_upstream_queries = IntCounter::with_opts(opts!(
            "wardengate_hashprefix_upstream_queries_total",
            "Total TXT queries issued to the hash-prefix upstream"
        ))?;

        let safesearch_checks_total = IntCounter::with_opts(opts!(
            "wardengate_safesearch_checks_total",
            "Total hostnames checked against the safe-search engine"
        ))?;
        let safesearch_rewritten_total = IntCounter::with_opts(opts!(
            "wardengate_safesearch_rewritten_total",
            "Total hostnames rewritten by the safe-search engine"
        ))?;

        let rewrite_matches_total = IntCounter::with_opts(opts!(
            "wardengate_rewrite_matches_total",
            "Total queries matched against a DNS-rewrite item"
        ))?;

        let whois_queries_total = IntCounter::with_opts(opts!(
            "wardengate_whois_queries_total",
            "Total WHOIS enrichment lookups performed"
        ))?;
        let whois_failures_total = IntCounter::with_opts(opts!(
            "wardengate_whois_failures_total",
            "Total WHOIS enrichment lookups that failed"
        ))?;

        let ipset_adds_total = IntCounter::with_opts(opts!(
            "wardengate_ipset_adds_total",
            "Total addresses submitted to ipset sets"
        ))?;
        let ipset_errors_total = IntCounter::with_opts(opts!(
            "wardengate_ipset_errors_total",
            "Total ipset submission errors"
        ))?;

        let active_sessions = IntGauge::with_opts(opts!(
            "wardengate_active_sessions",
            "Current number of live admin sessions"
        ))?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(hashprefix_checks_total.clone()))?;
        registry.register(Box::new(hashprefix_blocked_total.clone()))?;
        registry.register(Box::new(hashprefix_upstream_queries.clone()))?;
        registry.register(Box::new(safesearch_checks_total.clone()))?;
        registry.register(Box::new(safesearch_rewritten_total.clone()))?;
        registry.register(Box::new(rewrite_matches_total.clone()))?;
        registry.register(Box::new(whois_queries_total.clone()))?;
        registry.register(Box::new(whois_failures_total.clone()))?;
        registry.register(Box::new(ipset_adds_total.clone()))?;
        registry.register(Box::new(ipset_errors_total.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            cache_evictions,
            hashprefix_checks_total,
            hashprefix_blocked_total,
            hashprefix_upstream_queries,
            safesearch_checks_total,
            safesearch_rewritten_total,
            rewrite_matches_total,
            whois_queries_total,
            whois_failures_total,
            ipset_adds_total,
            ipset_errors_total,
            active_sessions,
        })
    }

    pub fn record_cache_stats(&self, component: &str, stats: &crate::bytecache::Stats) {
        self.cache_hits
            .with_label_values(&[component])
            .inc_by(stats.hits as f64);
        self.cache_misses
            .with_label_values(&[component])
            .inc_by(stats.misses as f64);
        self.cache_evictions
            .with_label_values(&[component])
            .inc_by(stats.evictions as f64);
    }

    pub fn record_hashprefix_check(&self, blocked: bool, upstream_hit: bool) {
        self.hashprefix_checks_total.inc();
        if blocked {
            self.hashprefix_blocked_total.inc();
        }
        if upstream_hit {
            self.hashprefix_upstream_queries.inc();
        }
    }

    pub fn record_safesearch_check(&self, rewritten: bool) {
        self.safesearch_checks_total.inc();
        if rewritten {
            self.safesearch_rewritten_total.inc();
        }
    }

    pub fn record_rewrite_match(&self) {
        self.rewrite_matches_total.inc();
    }

    pub fn record_whois_query(&self, failed: bool) {
        self.whois_queries_total.inc();
        if failed {
            self.whois_failures_total.inc();
        }
    }

    pub fn record_ipset_add(&self, count: usize, failed: bool) {
        self.ipset_adds_total.inc_by(count as u64);
        if failed {
            self.ipset_errors_total.inc();
        }
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(count as i64);
    }

    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecache::Stats;

    #[test]
    fn records_and_exports_cache_stats() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_cache_stats(
            "hashprefix",
            &Stats {
                count: 1,
                hits: 3,
                misses: 1,
                evictions: 0,
            },
        );
        let exported = metrics.export().unwrap();
        assert!(exported.contains("wardengate_cache_hits_total"));
    }

    #[test]
    fn records_hashprefix_and_whois_counters() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_hashprefix_check(true, true);
        metrics.record_whois_query(false);
        metrics.set_active_sessions(2);
        let exported = metrics.export().unwrap();
        assert!(exported.contains("wardengate_hashprefix_blocked_total 1"));
        assert!(exported.contains("wardengate_active_sessions 2"));
    }
}
