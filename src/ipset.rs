//! ipset coordinator (C6): a per-host subdomain-trie dispatcher that
//! materialises resolved A/AAAA answers into kernel ipsets. No
//! ipset-specific crate exists on crates.io, so the Linux backend talks
//! raw `AF_NETLINK`/`NETLINK_NETFILTER` via `libc`, following the same
//! `#[cfg(target_os = "linux")]`-gated socket pattern `heimdall`'s
//! `transport/` module uses for platform-specific networking. Non-Linux
//! builds return `IpsetError::Unsupported` at construction, per spec §7.

use crate::error::IpsetError;
use crate::metrics::GatewayMetrics;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone)]
pub struct SetInfo {
    pub name: String,
    pub family: Family,
    /// True iff the set's entry timeout is zero (entries never expire).
    pub persistent: bool,
}

/// Kernel coordination capability, injected so `IpsetCoordinator`'s
/// dispatch/dedup logic can be exercised without real kernel sockets.
pub trait IpsetBackend: Send + Sync {
    fn enumerate_sets(&self) -> Result<Vec<SetInfo>, IpsetError>;
    fn add_entries(&self, set: &str, family: Family, addrs: &[[u8; 16]]) -> Result<(), IpsetError>;
    fn close(&self) -> Result<(), IpsetError>;
}

pub struct IpsetCoordinator<B: IpsetBackend> {
    backend: B,
    /// domain (lowercased) -> configured set names; `""` is the catch-all.
    domain_map: HashMap<String, Vec<String>>,
    sets: HashMap<String, SetInfo>,
    dedup: Mutex<HashSet<(String, [u8; 16])>>,
    add_lock: Mutex<()>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl<B: IpsetBackend> IpsetCoordinator<B> {
    pub fn new(config_lines: &[String], backend: B) -> Result<Self, IpsetError> {
        let domain_map = parse_config_lines(config_lines);
        let sets = backend
            .enumerate_sets()?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Ok(Self {
            backend,
            domain_map,
            sets,
            dedup: Mutex::new(HashSet::new()),
            add_lock: Mutex::new(()),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns `(n_added, result)`: the count always reflects progress
    /// made so far, even when `result` carries the first kernel error.
    pub fn add(
        &self,
        host: &str,
        ipv4: &[Ipv4Addr],
        ipv6: &[std::net::Ipv6Addr],
    ) -> (usize, Result<(), IpsetError>) {
        let _guard = self.add_lock.lock();

        let set_names = self.lookup(host);
        if set_names.is_empty() {
            return (0, Ok(()));
        }

        let mut added = 0;
        for name in &set_names {
            let Some(info) = self.sets.get(name) else {
                continue;
            };
            let addrs: Vec<[u8; 16]> = match info.family {
                Family::V4 => ipv4.iter().map(|a| canonical16(IpAddr::V4(*a))).collect(),
                Family::V6 => ipv6.iter().map(|a| canonical16(IpAddr::V6(*a))).collect(),
            };

            let mut fresh = Vec::new();
            {
                let dedup = self.dedup.lock();
                for addr in &addrs {
                    if !dedup.contains(&(name.clone(), *addr)) {
                        fresh.push(*addr);
                    }
                }
            }
            if fresh.is_empty() {
                continue;
            }

            if let Err(e) = self.backend.add_entries(name, info.family, &fresh) {
                if let Some(metrics) = &self.metrics {
                    metrics.record_ipset_add(added, true);
                }
                return (added, Err(e));
            }
            added += fresh.len();
            if info.persistent {
                let mut dedup = self.dedup.lock();
                for addr in &fresh {
                    dedup.insert((name.clone(), *addr));
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_ipset_add(added, false);
        }
        (added, Ok(()))
    }

    pub fn close(&self) -> Result<(), IpsetError> {
        self.backend.close()
    }

    /// Walks from the most specific subdomain upward: for `a.b.c`, tries
    /// `a.b.c`, `b.c`, `c`, then the catch-all `""`.
    fn lookup(&self, host: &str) -> Vec<String> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<&str> = host.split('.').collect();
        for i in 0..labels.len() {
            let candidate = labels[i..].join(".");
            if let Some(sets) = self.domain_map.get(&candidate) {
                return sets.clone();
            }
        }
        self.domain_map.get("").cloned().unwrap_or_default()
    }
}

fn canonical16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn parse_config_lines(lines: &[String]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((doms, sets)) = line.split_once('/') else {
            continue;
        };
        let set_names: Vec<String> = sets
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if set_names.is_empty() {
            continue;
        }
        for dom in doms.split(',') {
            let dom = dom.trim().to_ascii_lowercase();
            map.entry(dom).or_default().extend(set_names.clone());
        }
    }
    map
}

#[cfg(target_os = "linux")]
pub mod linux {
    //! Raw `AF_NETLINK`/`NETLINK_NETFILTER` ipset backend.

    use super::{Family, IpsetBackend, SetInfo};
    use crate::error::IpsetError;
    use std::os::fd::RawFd;

    const NETLINK_NETFILTER: i32 = 12;
    const NFNL_SUBSYS_IPSET: u8 = 6;
    const IPSET_CMD_ADD: u8 = 9;
    const IPSET_CMD_LIST: u8 = 5;
    const IPSET_ATTR_SETNAME: u16 = 2;
    const IPSET_ATTR_FAMILY: u16 = 5;
    const IPSET_ATTR_DATA: u16 = 7;
    const IPSET_ATTR_IP: u16 = 1;
    const IPSET_ATTR_TIMEOUT: u16 = 6;
    const NFPROTO_IPV6: u8 = 10;
    const NLM_F_REQUEST: u16 = 0x01;
    const NLM_F_ACK: u16 = 0x04;
    const NLM_F_ROOT: u16 = 0x100;
    const NLM_F_MATCH: u16 = 0x200;
    const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
    const NLMSG_ERROR: u16 = 2;
    const NLMSG_DONE: u16 = 3;

    pub struct NetlinkIpset {
        fd: RawFd,
    }

    impl NetlinkIpset {
        pub fn open() -> Result<Self, IpsetError> {
            let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_NETFILTER) };
            if fd < 0 {
                return Err(IpsetError::Netlink(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
            addr.nl_family = libc::AF_NETLINK as u16;
            let ret = unsafe {
                libc::bind(
                    fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_nl>() as u32,
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error().to_string();
                unsafe { libc::close(fd) };
                return Err(IpsetError::Netlink(err));
            }
            Ok(Self { fd })
        }

        fn build_message(&self, cmd: u8, flags: u16, set_name: &str, payload: &[u8]) -> Vec<u8> {
            let mut attrs = Vec::new();
            if !set_name.is_empty() {
                push_attr(&mut attrs, IPSET_ATTR_SETNAME, set_name.as_bytes());
            }
            if !payload.is_empty() {
                push_attr(&mut attrs, IPSET_ATTR_DATA, payload);
            }

            let nfgenmsg = [2u8, 0, 0, 0]; // AF_UNSPEC family, version 0, pad
            let mut body = Vec::new();
            body.extend_from_slice(&nfgenmsg);
            body.extend_from_slice(&attrs);

            let msg_type = ((NFNL_SUBSYS_IPSET as u16) << 8) | cmd as u16;
            let mut msg = Vec::new();
            let total_len = 16 + body.len();
            msg.extend_from_slice(&(total_len as u32).to_ne_bytes());
            msg.extend_from_slice(&msg_type.to_ne_bytes());
            msg.extend_from_slice(&flags.to_ne_bytes());
            msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
            msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
            msg.extend_from_slice(&body);
            msg
        }

        fn send_raw(&self, msg: &[u8]) -> Result<(), IpsetError> {
            let ret = unsafe {
                libc::send(self.fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0)
            };
            if ret < 0 {
                return Err(IpsetError::Netlink(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            Ok(())
        }

        fn recv_into(&self, buf: &mut [u8]) -> Result<usize, IpsetError> {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                return Err(IpsetError::Netlink(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            Ok(n as usize)
        }

        fn send_message(&self, cmd: u8, set_name: &str, payload: &[u8]) -> Result<(), IpsetError> {
            let msg = self.build_message(cmd, NLM_F_REQUEST | NLM_F_ACK, set_name, payload);
            self.send_raw(&msg)?;
            let mut reply = [0u8; 1024];
            self.recv_into(&mut reply)?;
            Ok(())
        }

        /// Dumps every configured set and parses name/family/timeout out
        /// of each reply message, following ipset's netlink attribute
        /// layout, until the kernel signals `NLMSG_DONE`.
        fn list_sets(&self) -> Result<Vec<SetInfo>, IpsetError> {
            let msg = self.build_message(IPSET_CMD_LIST, NLM_F_REQUEST | NLM_F_DUMP, "", &[]);
            self.send_raw(&msg)?;

            let mut sets = Vec::new();
            let mut buf = [0u8; 8192];
            for _ in 0..256 {
                let n = self.recv_into(&mut buf)?;
                if n == 0 {
                    break;
                }
                let mut offset = 0;
                let mut done = false;
                while offset + 16 <= n {
                    let len =
                        u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
                    let msg_type =
                        u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
                    if len < 16 || offset + len > n {
                        break;
                    }
                    if msg_type == NLMSG_DONE {
                        done = true;
                        break;
                    }
                    if msg_type != NLMSG_ERROR {
                        let body = &buf[offset + 16..offset + len];
                        if body.len() > 4 {
                            if let Some(info) = parse_set_message(&body[4..]) {
                                sets.push(info);
                            }
                        }
                    }
                    offset += align4(len);
                }
                if done {
                    break;
                }
            }
            Ok(sets)
        }
    }

    fn align4(n: usize) -> usize {
        (n + 3) & !3
    }

    fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
        let len = 4 + value.len();
        buf.extend_from_slice(&(len as u16).to_ne_bytes());
        buf.extend_from_slice(&attr_type.to_ne_bytes());
        buf.extend_from_slice(value);
        let padding = (4 - (len % 4)) % 4;
        buf.extend(std::iter::repeat(0u8).take(padding));
    }

    /// Walks a flat nlattr buffer, matching `push_attr`'s
    /// length/type/value layout with 4-byte alignment padding.
    fn parse_attrs(buf: &[u8]) -> Vec<(u16, &[u8])> {
        let mut attrs = Vec::new();
        let mut pos = 0;
        while pos + 4 <= buf.len() {
            let len = u16::from_ne_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
            let attr_type = u16::from_ne_bytes(buf[pos + 2..pos + 4].try_into().unwrap());
            if len < 4 || pos + len > buf.len() {
                break;
            }
            attrs.push((attr_type, &buf[pos + 4..pos + len]));
            pos += align4(len);
        }
        attrs
    }

    /// Extracts `SetInfo` from one LIST reply message's attribute body
    /// (everything past the leading `nfgenmsg`). A set's default
    /// timeout, if present nested under `IPSET_ATTR_DATA`, determines
    /// `persistent`: zero (or absent) means entries never expire.
    fn parse_set_message(body: &[u8]) -> Option<SetInfo> {
        let attrs = parse_attrs(body);
        let name = attrs
            .iter()
            .find(|(t, _)| *t == IPSET_ATTR_SETNAME)
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
            .map(|s| s.trim_end_matches('\0').to_string())?;
        let family = attrs
            .iter()
            .find(|(t, _)| *t == IPSET_ATTR_FAMILY)
            .and_then(|(_, v)| v.first())
            .map(|b| if *b == NFPROTO_IPV6 { Family::V6 } else { Family::V4 })
            .unwrap_or(Family::V4);
        let persistent = attrs
            .iter()
            .find(|(t, _)| *t == IPSET_ATTR_DATA)
            .map(|(_, v)| {
                parse_attrs(v)
                    .iter()
                    .find(|(t, _)| *t == IPSET_ATTR_TIMEOUT)
                    .map(|(_, tv)| {
                        tv.get(..4)
                            .and_then(|b| b.try_into().ok())
                            .map(u32::from_be_bytes)
                            .unwrap_or(0)
                            == 0
                    })
                    .unwrap_or(true)
            })
            .unwrap_or(true);
        Some(SetInfo { name, family, persistent })
    }

    impl IpsetBackend for NetlinkIpset {
        fn enumerate_sets(&self) -> Result<Vec<SetInfo>, IpsetError> {
            self.list_sets()
        }

        fn add_entries(
            &self,
            set: &str,
            family: Family,
            addrs: &[[u8; 16]],
        ) -> Result<(), IpsetError> {
            for addr in addrs {
                let ip_bytes: &[u8] = match family {
                    Family::V4 => &addr[12..16],
                    Family::V6 => &addr[..],
                };
                let mut ip_attr = Vec::new();
                push_attr(&mut ip_attr, IPSET_ATTR_IP, ip_bytes);
                self.send_message(IPSET_CMD_ADD, set, &ip_attr)?;
            }
            Ok(())
        }

        fn close(&self) -> Result<(), IpsetError> {
            let ret = unsafe { libc::close(self.fd) };
            if ret < 0 {
                return Err(IpsetError::Netlink(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            Ok(())
        }
    }

    unsafe impl Send for NetlinkIpset {}
    unsafe impl Sync for NetlinkIpset {}
}

#[cfg(not(target_os = "linux"))]
pub mod linux {
    use super::{Family, IpsetBackend, SetInfo};
    use crate::error::IpsetError;

    pub struct NetlinkIpset;

    impl NetlinkIpset {
        pub fn open() -> Result<Self, IpsetError> {
            Err(IpsetError::Unsupported)
        }
    }

    impl IpsetBackend for NetlinkIpset {
        fn enumerate_sets(&self) -> Result<Vec<SetInfo>, IpsetError> {
            Err(IpsetError::Unsupported)
        }
        fn add_entries(&self, _: &str, _: Family, _: &[[u8; 16]]) -> Result<(), IpsetError> {
            Err(IpsetError::Unsupported)
        }
        fn close(&self) -> Result<(), IpsetError> {
            Err(IpsetError::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MockBackend {
        sets: Vec<SetInfo>,
        calls: StdMutex<Vec<(String, usize)>>,
    }

    impl IpsetBackend for MockBackend {
        fn enumerate_sets(&self) -> Result<Vec<SetInfo>, IpsetError> {
            Ok(self.sets.clone())
        }
        fn add_entries(&self, set: &str, _family: Family, addrs: &[[u8; 16]]) -> Result<(), IpsetError> {
            self.calls
                .lock()
                .unwrap()
                .push((set.to_string(), addrs.len()));
            Ok(())
        }
        fn close(&self) -> Result<(), IpsetError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_add_to_persistent_set_writes_once() {
        let backend = MockBackend {
            sets: vec![SetInfo {
                name: "ipv4set".to_string(),
                family: Family::V4,
                persistent: true,
            }],
            calls: StdMutex::new(Vec::new()),
        };
        let coordinator =
            IpsetCoordinator::new(&["example.net/ipv4set".to_string()], backend).unwrap();

        let ip: Ipv4Addr = "1.2.3.4".parse().unwrap();
        let (n1, r1) = coordinator.add("example.net", &[ip], &[]);
        assert_eq!(n1, 1);
        assert!(r1.is_ok());

        let (n2, r2) = coordinator.add("example.net", &[ip], &[]);
        assert_eq!(n2, 0);
        assert!(r2.is_ok());

        assert_eq!(coordinator.backend.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn non_persistent_set_writes_every_call() {
        let backend = MockBackend {
            sets: vec![SetInfo {
                name: "ipv4set".to_string(),
                family: Family::V4,
                persistent: false,
            }],
            calls: StdMutex::new(Vec::new()),
        };
        let coordinator =
            IpsetCoordinator::new(&["example.net/ipv4set".to_string()], backend).unwrap();

        let ip: Ipv4Addr = "1.2.3.4".parse().unwrap();
        coordinator.add("example.net", &[ip], &[]);
        coordinator.add("example.net", &[ip], &[]);

        assert_eq!(coordinator.backend.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn subdomain_lookup_walks_to_catch_all() {
        let backend = MockBackend {
            sets: vec![],
            calls: StdMutex::new(Vec::new()),
        };
        let coordinator = IpsetCoordinator::new(
            &["c/catchset".to_string(), "/defaultset".to_string()],
            backend,
        )
        .unwrap();
        assert_eq!(coordinator.lookup("a.b.c"), vec!["catchset".to_string()]);
        assert_eq!(coordinator.lookup("x.y.z"), vec!["defaultset".to_string()]);
    }
}
