//! Public suffix list lookups, used by `hashprefix.rs` to find the ICANN
//! suffix boundary when generating candidate domains. Ported from
//! `blocking/psl.rs`'s public API, simplified from its zero-copy
//! arena/trie storage to plain hash sets — this module only ever answers
//! "how many trailing labels form the public suffix", not the full
//! blocklist-scale suffix matching `blocking/psl.rs` was built for.

use parking_lot::RwLock;
use std::collections::HashSet;

/// A small bundled fallback so the checker works without a network fetch.
/// Real deployments should call `load_from_str` with a full list fetched
/// from publicsuffix.org.
const BUNDLED_SUFFIXES: &str = "\
com
org
net
info
biz
io
dev
app
gov
edu
mil
co.uk
org.uk
me.uk
ac.uk
com.au
net.au
org.au
com.br
co.jp
co.nz
co.za
com.cn
co.in
co.kr
uk
au
jp
nz
za
cn
in
kr
de
fr
ru
us
";

struct Rules {
    exact: HashSet<String>,
}

pub struct PublicSuffixList {
    rules: RwLock<Rules>,
}

impl Default for PublicSuffixList {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicSuffixList {
    pub fn new() -> Self {
        let psl = Self {
            rules: RwLock::new(Rules {
                exact: HashSet::new(),
            }),
        };
        psl.load_from_str(BUNDLED_SUFFIXES);
        psl
    }

    pub fn load_from_str(&self, data: &str) {
        let exact: HashSet<String> = data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("//"))
            .map(str::to_ascii_lowercase)
            .collect();
        *self.rules.write() = Rules { exact };
    }

    pub async fn load_from_url(&self, url: &str) -> Result<usize, reqwest::Error> {
        let body = reqwest::get(url).await?.text().await?;
        self.load_from_str(&body);
        Ok(self.rules.read().exact.len())
    }

    /// Number of trailing labels (right-to-left) that form the public
    /// suffix of `domain`. Falls back to `1` (just the TLD) when no rule
    /// matches, per the standard public-suffix-list default rule.
    pub fn public_suffix_label_count(&self, domain: &str) -> usize {
        let labels: Vec<&str> = domain.split('.').collect();
        let rules = self.rules.read();
        let mut best = 0usize;
        for start in 0..labels.len() {
            let candidate = labels[start..].join(".");
            if rules.exact.contains(&candidate) {
                best = best.max(labels.len() - start);
            }
        }
        best.max(1)
    }

    /// The registrable domain (public suffix plus one label), or `None`
    /// if `domain` has no label above its own public suffix.
    pub fn registrable_domain(&self, domain: &str) -> Option<String> {
        let labels: Vec<&str> = domain.split('.').collect();
        let suffix_len = self.public_suffix_label_count(domain);
        if labels.len() <= suffix_len {
            return None;
        }
        let start = labels.len() - suffix_len - 1;
        Some(labels[start..].join("."))
    }
}
