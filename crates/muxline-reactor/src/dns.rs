//! Asynchronous DNS over UDP
//!
//! The resolver owns one non-blocking UDP socket registered with the reactor
//! as `SocketKind::DnsQuery`. Callers are identified by an opaque token and
//! every token gets exactly one [`Resolution`], possibly with an empty
//! address list on failure.
//!
//! - answers are cached (LRU, bounded, TTL = min(record TTL, configured cap))
//! - concurrent lookups of the same name share one query
//! - an unanswered query is resent to the next nameserver, with the timeout
//!   doubling each attempt, up to `max_retries`
//! - at most `max_inflight` queries are outstanding; more fail immediately

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use muxline_core::{DnsConfig, Error, Result};
use nix::errno::Errno;

use crate::sys;

const DNS_PORT: u16 = 53;
const MAX_DATAGRAM: usize = 4096;
const RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_NAMESERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

const TYPE_A: u16 = 1;
const TYPE_CNAME: u16 = 5;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;
const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
}

impl QueryType {
    #[inline]
    pub fn code(self) -> u16 {
        match self {
            QueryType::A => TYPE_A,
            QueryType::Aaaa => TYPE_AAAA,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            TYPE_A => Some(QueryType::A),
            TYPE_AAAA => Some(QueryType::Aaaa),
            _ => None,
        }
    }
}

/// Immediate outcome of [`Resolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveStatus {
    /// Answered from cache or literal
    Ready(Vec<IpAddr>),
    /// A [`Resolution`] for the token will follow
    Pending,
    /// Could not even start; treat as an empty answer
    Failed,
}

/// Completion of a pending lookup.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub token: u64,
    pub host: String,
    pub qtype: QueryType,
    pub addrs: Vec<IpAddr>,
}

/// Name resolution as consumed by the reactor.
pub trait Resolver {
    /// Descriptor to register for readiness, if any.
    fn fd(&self) -> Option<RawFd>;

    fn resolve(&mut self, host: &str, qtype: QueryType, token: u64, now: Instant) -> ResolveStatus;

    /// Collect answers after read readiness.
    fn on_readable(&mut self, now: Instant, done: &mut Vec<Resolution>);

    /// Retry or expire overdue queries.
    fn tick(&mut self, now: Instant, done: &mut Vec<Resolution>);
}

/// Addresses for names that never need a query: IP literals and localhost.
pub fn literal_addrs(host: &str, qtype: QueryType) -> Option<Vec<IpAddr>> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Some(vec![ip]);
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Some(vec![match qtype {
            QueryType::A => IpAddr::V4(Ipv4Addr::LOCALHOST),
            QueryType::Aaaa => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }]);
    }
    None
}

// ============================================================================
// Wire format
// ============================================================================

/// Encode a recursive query for `host`. `None` if the name is not a valid
/// sequence of 1..=63 byte labels totalling at most 253 bytes.
pub fn build_query(id: u16, host: &str, qtype: QueryType) -> Option<Vec<u8>> {
    let name = host.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return None;
    }
    let mut pkt = Vec::with_capacity(18 + name.len());
    pkt.extend_from_slice(&id.to_be_bytes());
    pkt.extend_from_slice(&FLAG_RD.to_be_bytes());
    pkt.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    pkt.extend_from_slice(&[0; 6]); // an/ns/ar counts
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        pkt.push(label.len() as u8);
        pkt.extend_from_slice(label.as_bytes());
    }
    pkt.push(0);
    pkt.extend_from_slice(&qtype.code().to_be_bytes());
    pkt.extend_from_slice(&CLASS_IN.to_be_bytes());
    Some(pkt)
}

/// Decoded response header and address records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub id: u16,
    pub qtype: Option<QueryType>,
    pub rcode: u8,
    pub truncated: bool,
    pub addrs: Vec<IpAddr>,
    /// Smallest TTL among address records
    pub ttl: Option<u32>,
}

#[inline]
fn be16(buf: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]))
}

#[inline]
fn be32(buf: &[u8], pos: usize) -> Option<u32> {
    Some(u32::from_be_bytes(buf.get(pos..pos + 4)?.try_into().ok()?))
}

/// Skip an encoded name, following nothing: a compression pointer ends it.
fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    for _ in 0..128 {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
    None
}

pub fn parse_response(buf: &[u8]) -> Option<DnsAnswer> {
    let id = be16(buf, 0)?;
    let flags = be16(buf, 2)?;
    if flags & FLAG_QR == 0 {
        return None;
    }
    let qdcount = be16(buf, 4)?;
    let ancount = be16(buf, 6)?;

    let mut pos = 12;
    let mut qtype = None;
    for _ in 0..qdcount {
        pos = skip_name(buf, pos)?;
        qtype = qtype.or(QueryType::from_code(be16(buf, pos)?));
        pos += 4;
    }

    let mut addrs = Vec::new();
    let mut ttl: Option<u32> = None;
    for _ in 0..ancount {
        pos = skip_name(buf, pos)?;
        let rtype = be16(buf, pos)?;
        let rttl = be32(buf, pos + 4)?;
        let rdlen = be16(buf, pos + 8)? as usize;
        pos += 10;
        let rdata = buf.get(pos..pos + rdlen)?;
        pos += rdlen;
        let addr = match (rtype, rdlen) {
            (TYPE_A, 4) => IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = rdata.try_into().ok()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            (TYPE_CNAME, _) => continue,
            _ => continue,
        };
        addrs.push(addr);
        ttl = Some(ttl.map_or(rttl, |t| t.min(rttl)));
    }

    Some(DnsAnswer {
        id,
        qtype,
        rcode: (flags & 0x000F) as u8,
        truncated: flags & FLAG_TC != 0,
        addrs,
        ttl,
    })
}

/// `nameserver` lines usable from an IPv4 socket.
pub fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != "nameserver" {
                return None;
            }
            match parts.next()?.parse::<IpAddr>().ok()? {
                ip @ IpAddr::V4(_) => Some(SocketAddr::new(ip, DNS_PORT)),
                IpAddr::V6(_) => None,
            }
        })
        .collect()
}

// ============================================================================
// Cache
// ============================================================================

struct CacheEntry {
    addrs: Vec<IpAddr>,
    expires: Instant,
    stamp: u64,
}

type CacheKey = (String, QueryType);

/// LRU with TTL expiry. Recency is a stamp; the oldest stamp is evicted.
pub(crate) struct DnsCache {
    map: HashMap<CacheKey, CacheEntry>,
    order: BTreeMap<u64, CacheKey>,
    next_stamp: u64,
    capacity: usize,
}

impl DnsCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn get(&mut self, host: &str, qtype: QueryType, now: Instant) -> Option<Vec<IpAddr>> {
        let key = (host.to_ascii_lowercase(), qtype);
        let entry = self.map.get_mut(&key)?;
        if entry.expires <= now {
            let stamp = entry.stamp;
            self.map.remove(&key);
            self.order.remove(&stamp);
            return None;
        }
        self.order.remove(&entry.stamp);
        entry.stamp = self.next_stamp;
        self.next_stamp += 1;
        self.order.insert(entry.stamp, key);
        Some(entry.addrs.clone())
    }

    pub(crate) fn insert(&mut self, host: &str, qtype: QueryType, addrs: Vec<IpAddr>, ttl: Duration, now: Instant) {
        let key = (host.to_ascii_lowercase(), qtype);
        if let Some(old) = self.map.remove(&key) {
            self.order.remove(&old.stamp);
        }
        while self.map.len() >= self.capacity {
            match self.order.pop_first() {
                Some((_, evicted)) => {
                    self.map.remove(&evicted);
                }
                None => break,
            }
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.order.insert(stamp, key.clone());
        self.map.insert(
            key,
            CacheEntry {
                addrs,
                expires: now + ttl,
                stamp,
            },
        );
    }
}

// ============================================================================
// Resolver
// ============================================================================

struct Query {
    host: String,
    qtype: QueryType,
    packet: Vec<u8>,
    attempt: u32,
    server: usize,
    deadline: Instant,
    waiters: Vec<u64>,
}

pub struct DnsResolver {
    socket: OwnedFd,
    nameservers: Vec<SocketAddr>,
    config: DnsConfig,
    pending: HashMap<(u16, QueryType), Query>,
    by_name: HashMap<CacheKey, u16>,
    cache: DnsCache,
    rx: Vec<u8>,
}

impl DnsResolver {
    pub fn new(config: &DnsConfig) -> Result<Self> {
        let socket = sys::udp_socket_v4().map_err(|e| Error::os("socket(udp)", e))?;
        let mut nameservers: Vec<SocketAddr> = config
            .nameservers
            .iter()
            .copied()
            .filter(SocketAddr::is_ipv4)
            .collect();
        if nameservers.is_empty() {
            nameservers = std::fs::read_to_string(RESOLV_CONF)
                .map(|t| parse_resolv_conf(&t))
                .unwrap_or_default();
        }
        if nameservers.is_empty() {
            nameservers = FALLBACK_NAMESERVERS
                .iter()
                .map(|ip| SocketAddr::new(IpAddr::V4(*ip), DNS_PORT))
                .collect();
        }
        tracing::debug!(?nameservers, "dns resolver ready");
        Ok(Self {
            socket,
            nameservers,
            config: config.clone(),
            pending: HashMap::new(),
            by_name: HashMap::new(),
            cache: DnsCache::new(config.cache_capacity),
            rx: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Queries awaiting an answer.
    pub fn inflight(&self) -> usize {
        self.pending.len()
    }

    fn alloc_id(&self, qtype: QueryType) -> Option<u16> {
        (0..32)
            .map(|_| rand::random::<u16>())
            .find(|id| !self.pending.contains_key(&(*id, qtype)))
    }

    fn timeout_for(&self, attempt: u32) -> Duration {
        self.config.timeout.saturating_mul(1u32 << attempt.min(16))
    }

    fn transmit(&self, q: &Query) {
        let server = self.nameservers[q.server % self.nameservers.len()];
        match sys::send_to(self.socket.as_raw_fd(), &q.packet, &server) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(errno) => tracing::debug!(host = %q.host, %server, %errno, "dns send failed"),
        }
    }

    fn complete(query: Query, addrs: Vec<IpAddr>, done: &mut Vec<Resolution>) {
        for token in query.waiters {
            done.push(Resolution {
                token,
                host: query.host.clone(),
                qtype: query.qtype,
                addrs: addrs.clone(),
            });
        }
    }
}

impl Resolver for DnsResolver {
    fn fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn resolve(&mut self, host: &str, qtype: QueryType, token: u64, now: Instant) -> ResolveStatus {
        if let Some(addrs) = self.cache.get(host, qtype, now) {
            return ResolveStatus::Ready(addrs);
        }
        let key = (host.to_ascii_lowercase(), qtype);
        if let Some(id) = self.by_name.get(&key) {
            if let Some(q) = self.pending.get_mut(&(*id, qtype)) {
                q.waiters.push(token);
                return ResolveStatus::Pending;
            }
        }
        if self.pending.len() >= self.config.max_inflight {
            tracing::warn!(host, inflight = self.pending.len(), "dns query pool full");
            return ResolveStatus::Failed;
        }
        let Some(id) = self.alloc_id(qtype) else {
            return ResolveStatus::Failed;
        };
        let Some(packet) = build_query(id, host, qtype) else {
            tracing::debug!(host, "not a resolvable name");
            return ResolveStatus::Failed;
        };
        let query = Query {
            host: host.to_string(),
            qtype,
            packet,
            attempt: 0,
            server: 0,
            deadline: now + self.timeout_for(0),
            waiters: vec![token],
        };
        self.transmit(&query);
        self.pending.insert((id, qtype), query);
        self.by_name.insert(key, id);
        ResolveStatus::Pending
    }

    fn on_readable(&mut self, now: Instant, done: &mut Vec<Resolution>) {
        loop {
            let (n, from) = match sys::recv_from(self.socket.as_raw_fd(), &mut self.rx) {
                Ok(r) => r,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(errno) => {
                    tracing::debug!(%errno, "dns recv failed");
                    break;
                }
            };
            if !from.is_some_and(|a| self.nameservers.contains(&a)) {
                tracing::debug!(?from, "dns answer from unknown source ignored");
                continue;
            }
            let Some(answer) = parse_response(&self.rx[..n]) else {
                continue;
            };
            let Some(qtype) = answer.qtype else { continue };
            let Some(query) = self.pending.remove(&(answer.id, qtype)) else {
                continue;
            };
            self.by_name.remove(&(query.host.to_ascii_lowercase(), qtype));

            if answer.rcode != 0 || answer.truncated {
                tracing::debug!(host = %query.host, rcode = answer.rcode, truncated = answer.truncated, "dns lookup failed");
            }
            if !answer.addrs.is_empty() {
                let ttl = Duration::from_secs(answer.ttl.unwrap_or(0) as u64).min(self.config.cache_ttl);
                if !ttl.is_zero() {
                    self.cache.insert(&query.host, qtype, answer.addrs.clone(), ttl, now);
                }
            }
            Self::complete(query, answer.addrs, done);
        }
    }

    fn tick(&mut self, now: Instant, done: &mut Vec<Resolution>) {
        let overdue: Vec<(u16, QueryType)> = self
            .pending
            .iter()
            .filter(|(_, q)| q.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in overdue {
            let retry = match self.pending.get_mut(&key) {
                Some(q) if q.attempt < self.config.max_retries => {
                    q.attempt += 1;
                    q.server += 1;
                    true
                }
                Some(_) => false,
                None => continue,
            };
            if retry {
                let timeout = self.timeout_for(self.pending[&key].attempt);
                if let Some(q) = self.pending.get_mut(&key) {
                    q.deadline = now + timeout;
                }
                if let Some(q) = self.pending.get(&key) {
                    tracing::debug!(host = %q.host, attempt = q.attempt, "dns retry");
                    self.transmit(q);
                }
            } else if let Some(q) = self.pending.remove(&key) {
                tracing::debug!(host = %q.host, "dns lookup timed out");
                self.by_name.remove(&(q.host.to_ascii_lowercase(), q.qtype));
                Self::complete(q, Vec::new(), done);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_packet(id: u16, qtype: QueryType, records: &[(u16, &[u8], u32)]) -> Vec<u8> {
        let mut pkt = build_query(id, "example.com", qtype).unwrap();
        pkt[2..4].copy_from_slice(&(FLAG_QR | FLAG_RD | 0x0080).to_be_bytes());
        pkt[6..8].copy_from_slice(&(records.len() as u16).to_be_bytes());
        for (rtype, rdata, ttl) in records {
            pkt.extend_from_slice(&[0xC0, 0x0C]);
            pkt.extend_from_slice(&rtype.to_be_bytes());
            pkt.extend_from_slice(&CLASS_IN.to_be_bytes());
            pkt.extend_from_slice(&ttl.to_be_bytes());
            pkt.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            pkt.extend_from_slice(rdata);
        }
        pkt
    }

    #[test]
    fn test_build_query_layout() {
        let pkt = build_query(0xBEEF, "a.bc", QueryType::Aaaa).unwrap();
        assert_eq!(&pkt[..2], &[0xBE, 0xEF]);
        assert_eq!(be16(&pkt, 2), Some(FLAG_RD));
        assert_eq!(be16(&pkt, 4), Some(1));
        assert_eq!(&pkt[12..19], &[1, b'a', 2, b'b', b'c', 0, 0]);
        assert_eq!(be16(&pkt, 18), Some(TYPE_AAAA));
        assert_eq!(be16(&pkt, 20), Some(CLASS_IN));
    }

    #[test]
    fn test_build_query_rejects_bad_names() {
        assert!(build_query(1, "", QueryType::A).is_none());
        assert!(build_query(1, "a..b", QueryType::A).is_none());
        assert!(build_query(1, &"x".repeat(64), QueryType::A).is_none());
        assert!(build_query(1, "trailing.dot.", QueryType::A).is_some());
    }

    #[test]
    fn test_parse_response_with_cname_and_pointers() {
        let pkt = answer_packet(
            7,
            QueryType::A,
            &[
                (TYPE_CNAME, &[0xC0, 0x0C], 600),
                (TYPE_A, &[93, 184, 216, 34], 300),
                (TYPE_A, &[93, 184, 216, 35], 120),
            ],
        );
        let ans = parse_response(&pkt).unwrap();
        assert_eq!(ans.id, 7);
        assert_eq!(ans.qtype, Some(QueryType::A));
        assert_eq!(ans.rcode, 0);
        assert_eq!(ans.ttl, Some(120));
        assert_eq!(
            ans.addrs,
            vec![
                "93.184.216.34".parse::<IpAddr>().unwrap(),
                "93.184.216.35".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_parse_response_rejects_queries_and_truncation() {
        let q = build_query(9, "example.com", QueryType::A).unwrap();
        assert!(parse_response(&q).is_none());

        let mut pkt = answer_packet(9, QueryType::Aaaa, &[(TYPE_AAAA, &[0u8; 16], 60)]);
        assert_eq!(parse_response(&pkt).unwrap().addrs.len(), 1);
        pkt.truncate(pkt.len() - 3);
        assert!(parse_response(&pkt).is_none());
    }

    #[test]
    fn test_literal_addrs() {
        assert_eq!(
            literal_addrs("10.0.0.1", QueryType::A),
            Some(vec!["10.0.0.1".parse().unwrap()])
        );
        assert_eq!(
            literal_addrs("[::1]", QueryType::Aaaa),
            Some(vec![IpAddr::V6(Ipv6Addr::LOCALHOST)])
        );
        assert_eq!(
            literal_addrs("LocalHost", QueryType::A),
            Some(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
        );
        assert_eq!(literal_addrs("example.com", QueryType::A), None);
    }

    #[test]
    fn test_parse_resolv_conf() {
        let text = "# comment\nsearch lan\nnameserver 192.168.1.1\nnameserver fe80::1\nnameserver 1.1.1.1\n";
        assert_eq!(
            parse_resolv_conf(text),
            vec![
                "192.168.1.1:53".parse().unwrap(),
                "1.1.1.1:53".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_cache_ttl_and_lru() {
        let mut cache = DnsCache::new(2);
        let now = Instant::now();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        cache.insert("a.test", QueryType::A, vec![ip], Duration::from_secs(10), now);
        cache.insert("b.test", QueryType::A, vec![ip], Duration::from_secs(10), now);

        // Touch a, so b is least recently used.
        assert!(cache.get("A.TEST", QueryType::A, now).is_some());
        cache.insert("c.test", QueryType::A, vec![ip], Duration::from_secs(10), now);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b.test", QueryType::A, now).is_none());
        assert!(cache.get("a.test", QueryType::A, now).is_some());

        assert!(cache.get("c.test", QueryType::A, now + Duration::from_secs(10)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_resolver_retries_then_fails_with_backoff() {
        let cfg = DnsConfig {
            timeout: Duration::from_millis(100),
            max_retries: 2,
            nameservers: vec!["127.0.0.1:9".parse().unwrap()],
            ..DnsConfig::default()
        };
        let mut r = DnsResolver::new(&cfg).unwrap();
        let now = Instant::now();
        assert_eq!(r.resolve("nowhere.invalid", QueryType::A, 1, now), ResolveStatus::Pending);
        assert_eq!(r.resolve("NOWHERE.invalid", QueryType::A, 2, now), ResolveStatus::Pending);
        assert_eq!(r.inflight(), 1);

        let mut done = Vec::new();
        // attempt 0 times out at 100ms, attempt 1 at +200ms, attempt 2 at +400ms
        r.tick(now + Duration::from_millis(100), &mut done);
        assert!(done.is_empty());
        r.tick(now + Duration::from_millis(299), &mut done);
        assert!(done.is_empty());
        r.tick(now + Duration::from_millis(300), &mut done);
        assert!(done.is_empty());
        r.tick(now + Duration::from_millis(700), &mut done);

        let mut tokens: Vec<u64> = done.iter().map(|d| d.token).collect();
        tokens.sort();
        assert_eq!(tokens, vec![1, 2]);
        assert!(done.iter().all(|d| d.addrs.is_empty()));
        assert_eq!(r.inflight(), 0);
    }

    #[test]
    fn test_resolver_inflight_bound_fails_fast() {
        let cfg = DnsConfig {
            max_inflight: 1,
            nameservers: vec!["127.0.0.1:9".parse().unwrap()],
            ..DnsConfig::default()
        };
        let mut r = DnsResolver::new(&cfg).unwrap();
        let now = Instant::now();
        assert_eq!(r.resolve("one.invalid", QueryType::A, 1, now), ResolveStatus::Pending);
        assert_eq!(r.resolve("two.invalid", QueryType::A, 2, now), ResolveStatus::Failed);
    }
}
