//! Pipeline glue (C8): composes the rewrite store (C4), safe-search
//! engine (C3), and hash-prefix checker (C2) per incoming query, in the
//! order spec.md §4.8 fixes: first non-empty result wins.

use crate::filterengine::{QueryType, Rewrite};
use crate::hashprefix::{HashPrefixChecker, TxtResolver};
use crate::rewrite::RewriteStore;
use crate::safesearch::{FilterResult, SafeSearchEngine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    NotFiltered,
    Rewrite(Vec<Rewrite>),
    SafeSearch(FilterResult),
    Blocked,
}

pub struct Pipeline<U: TxtResolver> {
    rewrite: Arc<RewriteStore>,
    safesearch: Arc<SafeSearchEngine>,
    hashprefix: Arc<HashPrefixChecker<U>>,
    protection_enabled: AtomicBool,
}

impl<U: TxtResolver> Pipeline<U> {
    pub fn new(
        rewrite: Arc<RewriteStore>,
        safesearch: Arc<SafeSearchEngine>,
        hashprefix: Arc<HashPrefixChecker<U>>,
    ) -> Self {
        Self {
            rewrite,
            safesearch,
            hashprefix,
            protection_enabled: AtomicBool::new(true),
        }
    }

    pub fn set_protection_enabled(&self, enabled: bool) {
        self.protection_enabled.store(enabled, Ordering::Relaxed);
    }

    /// `per_client_safesearch` overrides the shared engine when a client
    /// has its own safe-search configuration installed.
    pub async fn process(
        &self,
        host: &str,
        qtype: QueryType,
        per_client_safesearch: Option<&SafeSearchEngine>,
    ) -> Result<PipelineResult, crate::error::HashPrefixError> {
        if !self.protection_enabled.load(Ordering::Relaxed) {
            return Ok(PipelineResult::NotFiltered);
        }

        let rewrites = self.rewrite.match_request(host, qtype);
        if !rewrites.is_empty() {
            return Ok(PipelineResult::Rewrite(rewrites));
        }

        if matches!(qtype, QueryType::A | QueryType::Aaaa | QueryType::Https) {
            let engine = per_client_safesearch.unwrap_or(&self.safesearch);
            if let Some(result) = engine.check_host(host, qtype) {
                return Ok(PipelineResult::SafeSearch(result));
            }
        }

        if self.hashprefix.check(host).await? {
            return Ok(PipelineResult::Blocked);
        }
        Ok(PipelineResult::NotFiltered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashprefix::HashPrefixConfig;
    use crate::psl::PublicSuffixList;
    use crate::rewrite::{Answer, RewriteItem};
    use crate::safesearch::SafeSearchConfig;
    use async_trait::async_trait;

    struct EmptyResolver;

    #[async_trait]
    impl TxtResolver for EmptyResolver {
        async fn query_txt(
            &self,
            _name: &str,
        ) -> Result<Vec<String>, crate::error::HashPrefixError> {
            Ok(Vec::new())
        }
    }

    fn build_pipeline() -> Pipeline<EmptyResolver> {
        let rewrite = Arc::new(
            RewriteStore::new(vec![RewriteItem {
                domain: "rewritten.example.com".to_string(),
                answer: Answer::Ip("9.9.9.9".parse().unwrap()),
            }])
            .unwrap(),
        );
        let safesearch = Arc::new(SafeSearchEngine::new(SafeSearchConfig::default()));
        let hashprefix = Arc::new(HashPrefixChecker::new(
            EmptyResolver,
            Arc::new(PublicSuffixList::new()),
            HashPrefixConfig::default(),
        ));
        Pipeline::new(rewrite, safesearch, hashprefix)
    }

    #[tokio::test]
    async fn disabled_protection_returns_not_filtered() {
        let pipeline = build_pipeline();
        pipeline.set_protection_enabled(false);
        let result = pipeline
            .process("rewritten.example.com", QueryType::A, None)
            .await
            .unwrap();
        assert_eq!(result, PipelineResult::NotFiltered);
    }

    #[tokio::test]
    async fn rewrite_wins_over_safesearch_and_hashprefix() {
        let pipeline = build_pipeline();
        let result = pipeline
            .process("rewritten.example.com", QueryType::A, None)
            .await
            .unwrap();
        assert!(matches!(result, PipelineResult::Rewrite(_)));
    }

    #[tokio::test]
    async fn safesearch_wins_over_hashprefix() {
        let pipeline = build_pipeline();
        let result = pipeline
            .process("yandex.ru", QueryType::A, None)
            .await
            .unwrap();
        assert!(matches!(result, PipelineResult::SafeSearch(_)));
    }

    #[tokio::test]
    async fn unmatched_query_falls_through_to_not_filtered() {
        let pipeline = build_pipeline();
        let result = pipeline
            .process("example.com", QueryType::A, None)
            .await
            .unwrap();
        assert_eq!(result, PipelineResult::NotFiltered);
    }
}
