use thiserror::Error;

/// Unified error type for the gateway's core components.
///
/// Mirrors `heimdall_error.rs`'s layering: each subsystem gets its own
/// error enum for precise matching at the call site, and all of them
/// convert into this one for callers that just want `?` to work.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    HashPrefix(#[from] HashPrefixError),

    #[error(transparent)]
    Whois(#[from] WhoisError),

    #[error(transparent)]
    Ipset(#[from] IpsetError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors from the DNS-rewrite storage (C4).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RewriteError {
    #[error("empty domain pattern")]
    EmptyDomain,
    #[error("invalid wildcard pattern: {0}")]
    InvalidWildcard(String),
    #[error("no such rewrite item")]
    NotFound,
}

/// Errors from the hash-prefix checker (C2).
#[derive(Debug, Error)]
pub enum HashPrefixError {
    #[error("upstream query failed: {0}")]
    Upstream(String),
    #[error("malformed TXT response: {0}")]
    MalformedResponse(String),
}

/// Errors from the WHOIS enrichment client (C5).
#[derive(Debug, Error)]
pub enum WhoisError {
    #[error("address {0} is a special-purpose address, not eligible for WHOIS lookup")]
    SpecialPurposeAddress(std::net::IpAddr),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),
    #[error("malformed response line: {0}")]
    MalformedResponse(String),
}

/// Errors from the ipset coordinator (C6).
#[derive(Debug, Error)]
pub enum IpsetError {
    #[error("ipset coordination is not supported on this platform")]
    Unsupported,
    #[error("netlink request failed: {0}")]
    Netlink(String),
    #[error("unknown set name: {0}")]
    UnknownSet(String),
}

/// Errors from the session store (C7).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("no such session")]
    NotFound,
    #[error("no such user")]
    UserNotFound,
    #[error("login {0} already exists")]
    DuplicateLogin(String),
    #[error("failed to generate session token: {0}")]
    Random(String),
}
