//! DNS-rewrite storage and matcher (C4): converts user rewrite items into
//! filter rules and resolves CNAME chains with cycle and wildcard-loop
//! detection. The compiled engine is held behind `arc_swap::ArcSwap`
//! rather than a `RwLock` (the standard idiomatic choice when readers
//! must never block a writer mid-swap, nor observe a half-built engine)
//! since §5 requires in-flight matches to see a single coherent engine.

use crate::error::RewriteError;
use crate::filterengine::{is_proper_subdomain, kind_matches, Pattern, QueryType, Rewrite};
use crate::metrics::GatewayMetrics;
use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::Arc;

/// A user-configured rewrite item, as accepted by `Add`/`Remove`.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteItem {
    pub domain: String,
    pub answer: Answer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Ip(IpAddr),
    Cname(String),
    ExceptionA,
    ExceptionAaaa,
}

#[derive(Clone)]
struct CompiledItem {
    item: RewriteItem,
    pattern: Pattern,
    rewrite: Rewrite,
}

struct Engine {
    items: Vec<CompiledItem>,
}

pub struct RewriteStore {
    engine: ArcSwap<Engine>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Default for RewriteStore {
    fn default() -> Self {
        Self::new(Vec::new()).expect("empty initial item list never fails to compile")
    }
}

impl RewriteStore {
    pub fn new(items: Vec<RewriteItem>) -> Result<Self, RewriteError> {
        let compiled = items
            .into_iter()
            .map(compile_item)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            engine: ArcSwap::new(Arc::new(Engine { items: compiled })),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add(&self, item: RewriteItem) -> Result<(), RewriteError> {
        let compiled = compile_item(item)?;
        let current = self.engine.load();
        let mut items = current.items.clone();
        items.push(compiled);
        self.engine.store(Arc::new(Engine { items }));
        Ok(())
    }

    pub fn remove(&self, item: &RewriteItem) -> Result<(), RewriteError> {
        let current = self.engine.load();
        let mut items = current.items.clone();
        let before = items.len();
        items.retain(|c| &c.item != item);
        if items.len() == before {
            return Err(RewriteError::NotFound);
        }
        self.engine.store(Arc::new(Engine { items }));
        Ok(())
    }

    pub fn list(&self) -> Vec<RewriteItem> {
        self.engine
            .load()
            .items
            .iter()
            .map(|c| c.item.clone())
            .collect()
    }

    pub fn match_request(&self, host: &str, qtype: QueryType) -> Vec<Rewrite> {
        let engine = self.engine.load();
        let original = host.trim_end_matches('.').to_ascii_lowercase();
        let mut current = original.clone();
        let mut working = match_domain(&engine.items, &current);
        let mut visited: Vec<String> = Vec::new();

        loop {
            let Some(head) = working.first() else {
                return Vec::new();
            };
            let target = match &head.rewrite {
                Rewrite::Cname(t) if !t.is_empty() => t.clone(),
                _ => break,
            };

            if target == original {
                return Vec::new();
            }
            if target == current && head.pattern.wildcard {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rewrite_match();
                }
                return vec![head.rewrite.clone()];
            }
            if visited.contains(&target) {
                tracing::debug!(host = %original, %target, "cname cycle detected in rewrite chain");
                return Vec::new();
            }
            visited.push(target.clone());

            let next = match_domain(&engine.items, &target);
            if next.is_empty() {
                break;
            }
            working = next;
            current = target;
        }

        let result: Vec<Rewrite> = working
            .into_iter()
            .map(|c| c.rewrite.clone())
            .filter(|r| kind_matches(r, qtype))
            .collect();
        if !result.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.record_rewrite_match();
            }
        }
        result
    }
}

struct OwnedMatch {
    rewrite: Rewrite,
    pattern: Pattern,
}

fn match_domain(items: &[CompiledItem], host: &str) -> Vec<OwnedMatch> {
    items
        .iter()
        .filter(|c| pattern_matches(&c.pattern, host))
        .map(|c| OwnedMatch {
            rewrite: c.rewrite.clone(),
            pattern: c.pattern.clone(),
        })
        .collect()
}

fn pattern_matches(pattern: &Pattern, host: &str) -> bool {
    if pattern.wildcard {
        is_proper_subdomain(host, &pattern.base)
    } else {
        host == pattern.base
    }
}

fn compile_item(item: RewriteItem) -> Result<CompiledItem, RewriteError> {
    let domain = item.domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return Err(RewriteError::EmptyDomain);
    }
    if domain.matches("*.").count() > 1 || (domain.contains('*') && !domain.starts_with("*.")) {
        return Err(RewriteError::InvalidWildcard(domain));
    }
    let pattern = Pattern::parse(&domain);
    let rewrite = match &item.answer {
        Answer::Ip(IpAddr::V4(ip)) => Rewrite::Ip {
            kind: crate::filterengine::RrKind::A,
            addr: IpAddr::V4(*ip),
        },
        Answer::Ip(IpAddr::V6(ip)) => Rewrite::Ip {
            kind: crate::filterengine::RrKind::Aaaa,
            addr: IpAddr::V6(*ip),
        },
        Answer::Cname(target) => {
            Rewrite::Cname(target.trim_end_matches('.').to_ascii_lowercase())
        }
        Answer::ExceptionA => Rewrite::Exception(crate::filterengine::RrKind::A),
        Answer::ExceptionAaaa => Rewrite::Exception(crate::filterengine::RrKind::Aaaa),
    };
    Ok(CompiledItem {
        item,
        pattern,
        rewrite,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filterengine::RrKind;

    fn item(domain: &str, answer: Answer) -> RewriteItem {
        RewriteItem {
            domain: domain.to_string(),
            answer,
        }
    }

    #[test]
    fn add_then_remove_restores_behavior() {
        let store = RewriteStore::default();
        let rw = item("a.example.com", Answer::Ip("1.2.3.4".parse().unwrap()));
        store.add(rw.clone()).unwrap();
        assert!(!store
            .match_request("a.example.com", QueryType::A)
            .is_empty());
        store.remove(&rw).unwrap();
        assert!(store
            .match_request("a.example.com", QueryType::A)
            .is_empty());
    }

    #[test]
    fn self_rewrite_returns_empty() {
        let store = RewriteStore::new(vec![item(
            "loop.example.com",
            Answer::Cname("loop.example.com".to_string()),
        )])
        .unwrap();
        assert!(store
            .match_request("loop.example.com", QueryType::A)
            .is_empty());
    }

    #[test]
    fn cname_cycle_returns_empty() {
        let store = RewriteStore::new(vec![
            item("a.example.com", Answer::Cname("b.example.com".to_string())),
            item("b.example.com", Answer::Cname("a.example.com".to_string())),
        ])
        .unwrap();
        assert!(store
            .match_request("a.example.com", QueryType::A)
            .is_empty());
    }

    #[test]
    fn wildcard_onto_subdomain_issue_4016() {
        let store = RewriteStore::new(vec![item(
            "*.issue4016.com",
            Answer::Cname("sub.issue4016.com".to_string()),
        )])
        .unwrap();

        let result = store.match_request("www.issue4016.com", QueryType::A);
        assert_eq!(result, vec![Rewrite::Cname("sub.issue4016.com".to_string())]);

        assert!(store
            .match_request("sub.issue4016.com", QueryType::A)
            .is_empty());
    }

    #[test]
    fn literal_ip_rewrite_filters_by_qtype() {
        let store = RewriteStore::new(vec![item(
            "example.com",
            Answer::Ip("1.2.3.4".parse().unwrap()),
        )])
        .unwrap();
        assert_eq!(
            store.match_request("example.com", QueryType::A),
            vec![Rewrite::Ip {
                kind: RrKind::A,
                addr: "1.2.3.4".parse().unwrap()
            }]
        );
        assert!(store
            .match_request("example.com", QueryType::Aaaa)
            .is_empty());
    }

    #[test]
    fn list_returns_independent_snapshot() {
        let store = RewriteStore::default();
        store
            .add(item("a.com", Answer::Cname("b.com".to_string())))
            .unwrap();
        let snapshot = store.list();
        store
            .add(item("c.com", Answer::Cname("d.com".to_string())))
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.list().len(), 2);
    }
}
