//! WHOIS enrichment client (C5): a cached, redirect-following line-protocol
//! client used to annotate runtime clients. The dialer is injected via
//! `async-trait` (used only as a generic bound, since `Dialer::Conn`
//! rules out a trait object), the same capability-injection pattern
//! `hashprefix.rs`'s `TxtResolver` uses, so tests substitute an in-memory
//! duplex stream instead of a real TCP connection.

use crate::bytecache::ByteCache;
use crate::error::WhoisError;
use crate::metrics::GatewayMetrics;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAX_INFO_LEN: usize = 255;

/// The injected dialer capability. Production code dials real TCP;
/// tests return an in-memory `tokio::io::DuplexStream` half.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: AsyncReadExt + AsyncWriteExt + Unpin + Send;
    async fn dial(&self, host: &str, port: u16) -> Result<Self::Conn, WhoisError>;
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct WhoisConfig {
    pub server_addr: String,
    pub port: u16,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub max_read_size: usize,
    pub max_redirects: usize,
    pub max_info_len: usize,
    pub cache_size: usize,
}

impl Default for WhoisConfig {
    fn default() -> Self {
        Self {
            server_addr: "whois.arin.net".to_string(),
            port: 43,
            timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(3600),
            max_read_size: 64 * 1024,
            max_redirects: 3,
            max_info_len: MAX_INFO_LEN,
            cache_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoisInfo {
    pub city: String,
    pub country: String,
    pub orgname: String,
}

impl WhoisInfo {
    fn is_empty(&self) -> bool {
        self.city.is_empty() && self.country.is_empty() && self.orgname.is_empty()
    }
}

pub struct WhoisClient<D: Dialer> {
    dialer: D,
    config: WhoisConfig,
    cache: ByteCache,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl<D: Dialer> WhoisClient<D> {
    pub fn new(dialer: D, config: WhoisConfig) -> Self {
        let cache_size = config.cache_size;
        Self {
            dialer,
            config,
            cache: ByteCache::new(cache_size),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns `(info, changed)`. `info` is `None` for special-purpose
    /// addresses or empty cached/looked-up records.
    pub async fn process(&self, ip: IpAddr) -> Result<(Option<WhoisInfo>, bool), WhoisError> {
        if is_special_purpose(ip) {
            return Ok((None, false));
        }

        let key = ip.to_string().into_bytes();
        let previous = match self.cache.get(&key) {
            Some(bytes) => decode_entry(&bytes).filter(|(expiry, _)| now_secs() <= *expiry),
            None => None,
        };
        if let Some((_, info)) = &previous {
            if info.is_empty() {
                return Ok((None, false));
            }
            return Ok((Some(info.clone()), false));
        }

        let info = match self.query_loop(&ip.to_string()).await {
            Ok(info) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_whois_query(false);
                }
                info
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_whois_query(true);
                }
                return Err(e);
            }
        };
        let expiry = now_secs() + self.config.cache_ttl.as_secs();
        self.cache.set(key, encode_entry(expiry, &info));

        let changed = previous.map(|(_, prev)| prev != info).unwrap_or(true);
        if info.is_empty() {
            Ok((None, changed))
        } else {
            Ok((Some(info), changed))
        }
    }

    async fn query_loop(&self, target: &str) -> Result<WhoisInfo, WhoisError> {
        let mut host = self.config.server_addr.clone();
        let mut port = self.config.port;
        let mut query = target.to_string();
        let mut info = WhoisInfo::default();

        for hop in 0..=self.config.max_redirects {
            if hop == self.config.max_redirects {
                return Err(WhoisError::TooManyRedirects(self.config.max_redirects));
            }

            let request = if host == "whois.arin.net" {
                format!("n + {query}\r\n")
            } else {
                format!("{query}\r\n")
            };

            let mut conn = tokio::time::timeout(self.config.timeout, self.dialer.dial(&host, port))
                .await
                .map_err(|_| WhoisError::Dial("connect timed out".to_string()))??;

            // The deadline is absolute and starts over once the connection
            // is established: a server that connects and then stalls on
            // the write or the read must not hang past `self.config.timeout`.
            let text = tokio::time::timeout(self.config.timeout, async {
                conn.write_all(request.as_bytes())
                    .await
                    .map_err(|e| WhoisError::Dial(e.to_string()))?;

                let mut buf = vec![0u8; self.config.max_read_size];
                let mut total = 0;
                loop {
                    let n = conn
                        .read(&mut buf[total..])
                        .await
                        .map_err(|e| WhoisError::Dial(e.to_string()))?;
                    if n == 0 || total + n >= buf.len() {
                        total += n;
                        break;
                    }
                    total += n;
                }
                Ok::<String, WhoisError>(String::from_utf8_lossy(&buf[..total]).into_owned())
            })
            .await
            .map_err(|_| WhoisError::Dial("query timed out".to_string()))??;

            let (parsed, redirect) = parse_response(&text, self.config.max_info_len);
            merge_into(&mut info, parsed);

            match redirect {
                Some(next) => {
                    let (next_host, next_port) = split_host_port(&next, self.config.port);
                    host = next_host;
                    port = next_port;
                    query = target.to_string();
                }
                None => return Ok(info),
            }
        }
        unreachable!("loop returns or errors before exceeding max_redirects")
    }
}

fn merge_into(dest: &mut WhoisInfo, src: WhoisInfo) {
    if dest.city.is_empty() {
        dest.city = src.city;
    }
    if dest.country.is_empty() {
        dest.country = src.country;
    }
    if dest.orgname.is_empty() {
        dest.orgname = src.orgname;
    }
}

fn split_host_port(value: &str, default_port: u16) -> (String, u16) {
    match value.rsplit_once(':') {
        Some((h, p)) => (
            h.to_ascii_lowercase(),
            p.parse().unwrap_or(default_port),
        ),
        None => (value.to_ascii_lowercase(), default_port),
    }
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        value.to_string()
    } else {
        format!("{}...", &value[..max_len])
    }
}

/// Parses one WHOIS response, returning the extracted info and an
/// optional `whois:` redirect target.
fn parse_response(text: &str, max_info_len: usize) -> (WhoisInfo, Option<String>) {
    let mut info = WhoisInfo::default();
    let mut redirect = None;
    let mut saw_orgname = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match key.as_str() {
            "orgname" | "org-name" => {
                info.orgname = truncate(value, max_info_len);
                saw_orgname = true;
            }
            "city" => info.city = truncate(value, max_info_len),
            "country" => info.country = truncate(value, max_info_len),
            "descr" | "netname" if !saw_orgname => {
                info.orgname = truncate(value, max_info_len);
            }
            "whois" => {
                redirect = Some(value.trim_start_matches("whois://").to_string());
            }
            "referralserver" => {
                redirect = Some(value.trim_start_matches("whois://").to_string());
            }
            _ => {}
        }
    }

    (info, redirect)
}

fn is_special_purpose(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_documentation()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique local
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode_entry(expiry: u64, info: &WhoisInfo) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&expiry.to_be_bytes());
    for field in [&info.city, &info.country, &info.orgname] {
        buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
        buf.extend_from_slice(field.as_bytes());
    }
    buf
}

fn decode_entry(bytes: &[u8]) -> Option<(u64, WhoisInfo)> {
    if bytes.len() < 8 {
        return None;
    }
    let expiry = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
    let mut pos = 8;
    let mut fields = Vec::with_capacity(3);
    for _ in 0..3 {
        let len = u16::from_be_bytes(bytes.get(pos..pos + 2)?.try_into().ok()?) as usize;
        pos += 2;
        let s = String::from_utf8(bytes.get(pos..pos + len)?.to_vec()).ok()?;
        pos += len;
        fields.push(s);
    }
    Some((
        expiry,
        WhoisInfo {
            city: fields[0].clone(),
            country: fields[1].clone(),
            orgname: fields[2].clone(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::duplex;

    struct MockDialer {
        responses: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl Dialer for MockDialer {
        type Conn = tokio::io::DuplexStream;

        async fn dial(&self, host: &str, port: u16) -> Result<Self::Conn, WhoisError> {
            let key = format!("{host}:{port}");
            let response = self
                .responses
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_default();
            let (mut server, client) = duplex(8192);
            tokio::spawn(async move {
                let mut discard = vec![0u8; 256];
                let _ = server.read(&mut discard).await;
                let _ = server.write_all(response.as_bytes()).await;
            });
            Ok(client)
        }
    }

    #[tokio::test]
    async fn special_purpose_address_skips_dial() {
        let dialer = MockDialer {
            responses: Mutex::new(HashMap::new()),
        };
        let client = WhoisClient::new(dialer, WhoisConfig::default());
        let (info, changed) = client.process("127.0.0.1".parse().unwrap()).await.unwrap();
        assert_eq!(info, None);
        assert!(!changed);
    }

    #[tokio::test]
    async fn successful_lookup_is_cached() {
        let mut responses = HashMap::new();
        responses.insert(
            "whois.arin.net:43".to_string(),
            "orgname: Example Org\ncity: Springfield\ncountry: US\n".to_string(),
        );
        let dialer = MockDialer {
            responses: Mutex::new(responses),
        };
        let client = WhoisClient::new(dialer, WhoisConfig::default());

        let (info, changed) = client.process("8.8.8.8".parse().unwrap()).await.unwrap();
        assert_eq!(info.as_ref().unwrap().orgname, "Example Org");
        assert!(changed);

        let (info2, changed2) = client.process("8.8.8.8".parse().unwrap()).await.unwrap();
        assert_eq!(info2, info);
        assert!(!changed2);
    }

    #[tokio::test]
    async fn redirect_loop_errors_after_max_redirects() {
        let mut responses = HashMap::new();
        responses.insert("whois.arin.net:43".to_string(), "whois: serverB\n".to_string());
        responses.insert("serverb:43".to_string(), "whois: serverC\n".to_string());
        responses.insert("serverc:43".to_string(), "whois: serverD\n".to_string());
        responses.insert("serverd:43".to_string(), "whois: serverB\n".to_string());
        let dialer = MockDialer {
            responses: Mutex::new(responses),
        };
        let mut config = WhoisConfig::default();
        config.max_redirects = 3;
        let client = WhoisClient::new(dialer, config);

        let result = client.process("8.8.8.8".parse().unwrap()).await;
        assert!(matches!(result, Err(WhoisError::TooManyRedirects(3))));
    }

    #[test]
    fn parse_response_prefers_orgname_over_descr() {
        let (info, redirect) =
            parse_response("descr: fallback\norgname: Real Org\n", MAX_INFO_LEN);
        assert_eq!(info.orgname, "Real Org");
        assert!(redirect.is_none());
    }
}
