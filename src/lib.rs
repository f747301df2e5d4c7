pub mod bytecache;
pub mod config;
pub mod error;
pub mod filterengine;
pub mod hashprefix;
pub mod ipset;
pub mod metrics;
pub mod pipeline;
pub mod psl;
pub mod rewrite;
pub mod safesearch;
pub mod session;
pub mod whois;
