//! Shared rule representation and domain matching for the rewrite store
//! (C4) and the safe-search engine (C3). Both compile an ordered list of
//! `(Pattern, Rewrite)` pairs and walk it the same way; the rewrite store
//! additionally follows CNAME chains (see `rewrite.rs`), which is why the
//! chain-walking logic itself lives there rather than here.

use std::net::IpAddr;

/// The record kinds this gateway rewrites or blocks. The wire-format DNS
/// parser that would turn these into actual answers is out of scope; this
/// crate only needs enough of the type space to express rewrite rules and
/// query-type filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RrKind {
    A,
    Aaaa,
}

/// The type of an incoming query, as seen by the filter/rewrite engines.
/// `Other` covers any RR type neither engine treats specially (e.g. TXT,
/// MX): such queries only match rules that are themselves "any other
/// type" rules, which in practice never occurs given this crate's
/// restricted `Answer` vocabulary (see `rewrite.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
    Https,
    Other(u16),
}

/// A single compiled rewrite outcome, as produced by matching a domain
/// against the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    Ip { kind: RrKind, addr: IpAddr },
    Cname(String),
    /// An `@@||domain^$dnstype=<T>,dnsrewrite`-style exception: no
    /// rewrite or block should apply to this domain for this type.
    Exception(RrKind),
}

impl Rewrite {
    /// Renders the rule in the AdGuard-style dnsrewrite syntax this
    /// engine's on-disk rule text uses, for debug logging only — nothing
    /// in this crate re-parses this string.
    pub fn to_rule_text(&self, domain: &str) -> String {
        match self {
            Rewrite::Ip { kind, addr } => {
                let t = match kind {
                    RrKind::A => "A",
                    RrKind::Aaaa => "AAAA",
                };
                format!("||{domain}^$dnsrewrite=NOERROR;{t};{addr}")
            }
            Rewrite::Cname(target) => {
                format!("||{domain}^$dnsrewrite=NOERROR;CNAME;{target}")
            }
            Rewrite::Exception(kind) => {
                let t = match kind {
                    RrKind::A => "A",
                    RrKind::Aaaa => "AAAA",
                };
                format!("@@||{domain}^$dnstype={t},dnsrewrite")
            }
        }
    }
}

/// A domain pattern: either an exact host, or a `*.base` wildcard that
/// matches any proper subdomain of `base` (not `base` itself).
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub wildcard: bool,
    /// For exact patterns, the full domain. For wildcards, the base
    /// (everything after the leading `*.`).
    pub base: String,
}

impl Pattern {
    pub fn parse(text: &str) -> Self {
        let text = text.trim().trim_end_matches('.').to_ascii_lowercase();
        if let Some(base) = text.strip_prefix("*.") {
            Pattern {
                wildcard: true,
                base: base.to_string(),
            }
        } else {
            Pattern {
                wildcard: false,
                base: text,
            }
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        if self.wildcard {
            is_proper_subdomain(host, &self.base)
        } else {
            host == self.base
        }
    }

    /// The pattern rendered the way `||domain^` rule text expects it.
    pub fn domain_text(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.base)
        } else {
            self.base.clone()
        }
    }
}

/// True if `host` is a subdomain of `base` strictly longer than `base`
/// itself (so `base` does not match its own wildcard pattern).
pub fn is_proper_subdomain(host: &str, base: &str) -> bool {
    host.len() > base.len()
        && host.ends_with(base)
        && host.as_bytes()[host.len() - base.len() - 1] == b'.'
}

/// Whether a rule of this kind applies to a query of this type. `Cname`
/// rewrites always apply (the caller follows up by re-resolving the
/// target); `Ip`/`Exception` rules are type-specific.
pub fn kind_matches(rewrite: &Rewrite, qtype: QueryType) -> bool {
    match rewrite {
        Rewrite::Cname(_) => true,
        Rewrite::Ip { kind, .. } | Rewrite::Exception(kind) => match (kind, qtype) {
            (RrKind::A, QueryType::A) => true,
            (RrKind::Aaaa, QueryType::Aaaa) => true,
            _ => false,
        },
    }
}

/// A `(pattern, rule)` pair ready to be matched against query hosts.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub pattern: Pattern,
    pub rewrite: Rewrite,
}

/// Parses one line of the gateway's dnsrewrite rule syntax:
///
/// ```text
/// ||domain^$dnsrewrite=NOERROR;A;1.2.3.4
/// ||domain^$dnsrewrite=NOERROR;AAAA;::1
/// ||domain^$dnsrewrite=NOERROR;CNAME;target.example.com
/// @@||domain^$dnstype=A,dnsrewrite
/// @@||domain^$dnstype=AAAA,dnsrewrite
/// ```
///
/// Blank lines and lines starting with `!` (comments, as in AdGuard rule
/// lists) are skipped by the caller before reaching this function.
pub fn parse_rule_line(line: &str) -> Option<CompiledRule> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("@@||") {
        let (domain, modifiers) = rest.split_once('^')?;
        let modifiers = modifiers.strip_prefix('$')?;
        let kind_str = modifiers
            .split(',')
            .find_map(|m| m.strip_prefix("dnstype="))?;
        let kind = match kind_str {
            "A" => RrKind::A,
            "AAAA" => RrKind::Aaaa,
            _ => return None,
        };
        return Some(CompiledRule {
            pattern: Pattern::parse(domain),
            rewrite: Rewrite::Exception(kind),
        });
    }

    let rest = line.strip_prefix("||")?;
    let (domain, modifiers) = rest.split_once('^')?;
    let modifiers = modifiers.strip_prefix("$dnsrewrite=")?;
    let mut parts = modifiers.splitn(3, ';');
    let _rcode = parts.next()?; // always NOERROR in this rule set
    let rr = parts.next()?;
    let value = parts.next()?;
    let rewrite = match rr {
        "A" => Rewrite::Ip {
            kind: RrKind::A,
            addr: value.parse().ok()?,
        },
        "AAAA" => Rewrite::Ip {
            kind: RrKind::Aaaa,
            addr: value.parse().ok()?,
        },
        "CNAME" => Rewrite::Cname(value.trim_end_matches('.').to_ascii_lowercase()),
        _ => return None,
    };
    Some(CompiledRule {
        pattern: Pattern::parse(domain),
        rewrite,
    })
}

/// Compiles a textual rule-list block (one rule per line, `!`-prefixed
/// comments and blank lines ignored) into an ordered rule vector.
pub fn compile_rule_text(text: &str) -> Vec<CompiledRule> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('!'))
        .filter_map(parse_rule_line)
        .collect()
}

/// Returns every rule in `rules` whose pattern matches `host`, in the
/// order they appear in `rules`.
pub fn match_domain<'a>(rules: &'a [CompiledRule], host: &str) -> Vec<&'a CompiledRule> {
    rules.iter().filter(|r| r.pattern.matches(host)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_a_rewrite() {
        let rule = parse_rule_line("||example.com^$dnsrewrite=NOERROR;A;1.2.3.4").unwrap();
        assert_eq!(rule.pattern.base, "example.com");
        assert!(!rule.pattern.wildcard);
        assert_eq!(
            rule.rewrite,
            Rewrite::Ip {
                kind: RrKind::A,
                addr: "1.2.3.4".parse().unwrap()
            }
        );
    }

    #[test]
    fn parses_cname_rewrite_and_wildcard_pattern() {
        let rule =
            parse_rule_line("||*.example.com^$dnsrewrite=NOERROR;CNAME;target.example.net")
                .unwrap();
        assert!(rule.pattern.wildcard);
        assert_eq!(rule.pattern.base, "example.com");
        assert_eq!(rule.rewrite, Rewrite::Cname("target.example.net".into()));
    }

    #[test]
    fn parses_exception() {
        let rule = parse_rule_line("@@||example.com^$dnstype=AAAA,dnsrewrite").unwrap();
        assert_eq!(rule.rewrite, Rewrite::Exception(RrKind::Aaaa));
    }

    #[test]
    fn wildcard_does_not_match_base_domain() {
        let p = Pattern::parse("*.example.com");
        assert!(!p.matches("example.com"));
        assert!(p.matches("www.example.com"));
        assert!(p.matches("a.b.example.com"));
    }

    #[test]
    fn compile_rule_text_skips_comments_and_blanks() {
        let text = "! comment\n\n||a.com^$dnsrewrite=NOERROR;A;1.1.1.1\n";
        let rules = compile_rule_text(text);
        assert_eq!(rules.len(), 1);
    }
}
