//! Address labelling for report lines.
//!
//! Cheap numeric classification always runs first; reverse DNS is reserved for
//! globally routable addresses and is bounded by the resolver's timeout.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ipnet::{Ipv4Net, Ipv6Net};
use tracing::{debug, warn};

use crate::models::domain::Address;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressLabel {
    PrivateNetwork,
    Localhost,
    Multicast,
    Reserved,
    ResolvedName(String),
    Unresolved,
}

impl fmt::Display for AddressLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressLabel::PrivateNetwork => f.write_str("Private Network"),
            AddressLabel::Localhost => f.write_str("Localhost"),
            AddressLabel::Multicast => f.write_str("Multicast"),
            AddressLabel::Reserved => f.write_str("Reserved"),
            AddressLabel::ResolvedName(name) => f.write_str(name),
            AddressLabel::Unresolved => f.write_str("No-DNS"),
        }
    }
}

const RESERVED_V4: &[(Ipv4Addr, u8)] = &[(Ipv4Addr::new(240, 0, 0, 0), 4)];

const PRIVATE_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
];

// IANA blocks outside 2000::/3 that are neither ULA, link-local, nor multicast.
const RESERVED_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 8),
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 8),
    (Ipv6Addr::new(0x200, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0x400, 0, 0, 0, 0, 0, 0, 0), 6),
    (Ipv6Addr::new(0x800, 0, 0, 0, 0, 0, 0, 0), 5),
    (Ipv6Addr::new(0x1000, 0, 0, 0, 0, 0, 0, 0), 4),
    (Ipv6Addr::new(0x4000, 0, 0, 0, 0, 0, 0, 0), 3),
    (Ipv6Addr::new(0x6000, 0, 0, 0, 0, 0, 0, 0), 3),
    (Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0), 3),
    (Ipv6Addr::new(0xa000, 0, 0, 0, 0, 0, 0, 0), 3),
    (Ipv6Addr::new(0xc000, 0, 0, 0, 0, 0, 0, 0), 3),
    (Ipv6Addr::new(0xe000, 0, 0, 0, 0, 0, 0, 0), 4),
    (Ipv6Addr::new(0xf000, 0, 0, 0, 0, 0, 0, 0), 5),
    (Ipv6Addr::new(0xf800, 0, 0, 0, 0, 0, 0, 0), 6),
    (Ipv6Addr::new(0xfe00, 0, 0, 0, 0, 0, 0, 0), 9),
];

const PRIVATE_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 23),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
];

fn in_v4(ip: Ipv4Addr, table: &[(Ipv4Addr, u8)]) -> bool {
    table
        .iter()
        .filter_map(|&(net, len)| Ipv4Net::new(net, len).ok())
        .any(|net| net.contains(&ip))
}

fn in_v6(ip: Ipv6Addr, table: &[(Ipv6Addr, u8)]) -> bool {
    table
        .iter()
        .filter_map(|&(net, len)| Ipv6Net::new(net, len).ok())
        .any(|net| net.contains(&ip))
}

fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => in_v4(v4, RESERVED_V4),
        IpAddr::V6(v6) => in_v6(v6, RESERVED_V6),
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => in_v4(v4, PRIVATE_V4),
        IpAddr::V6(v6) => in_v6(v6, PRIVATE_V6),
    }
}

/// Numeric classification only. Checked in order loopback, multicast,
/// reserved, private; `None` means the address is globally routable.
pub fn categorize(ip: IpAddr) -> Option<AddressLabel> {
    if ip.is_loopback() {
        Some(AddressLabel::Localhost)
    } else if ip.is_multicast() {
        Some(AddressLabel::Multicast)
    } else if is_reserved(ip) {
        Some(AddressLabel::Reserved)
    } else if is_private(ip) {
        Some(AddressLabel::PrivateNetwork)
    } else {
        None
    }
}

/// Outcome of one reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(String),
    /// Asked, but no usable name arrived before the deadline.
    NotFound,
    /// Never asked, so nothing is known about the address yet.
    Skipped,
}

impl Lookup {
    fn into_label(self) -> AddressLabel {
        match self {
            Lookup::Found(name) => AddressLabel::ResolvedName(name),
            Lookup::NotFound | Lookup::Skipped => AddressLabel::Unresolved,
        }
    }
}

/// Reverse name lookup. Implementations must never block past their own
/// timeout.
pub trait Resolver: Send + Sync {
    fn reverse(&self, ip: IpAddr) -> Lookup;

    /// Answers for `ips`, in order. Resolvers that wait on the network
    /// should overlap the lookups rather than take them one at a time.
    fn reverse_all(&self, ips: &[IpAddr]) -> Vec<Lookup> {
        ips.iter().map(|&ip| self.reverse(ip)).collect()
    }
}

/// Never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl Resolver for NoopResolver {
    fn reverse(&self, _ip: IpAddr) -> Lookup {
        Lookup::Skipped
    }
}

pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

pub type LookupFn = fn(&IpAddr) -> io::Result<String>;

/// System resolver with a hard deadline.
///
/// Every lookup runs on its own worker thread. A batch shares one deadline,
/// `timeout` from the call, and answers arriving later are dropped with the
/// channel. At most `max_in_flight` workers exist at once, counting the ones
/// still stuck from earlier batches.
pub struct SystemResolver {
    timeout: Duration,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
    lookup: LookupFn,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self::with_max_in_flight(timeout, DEFAULT_MAX_IN_FLIGHT)
    }

    pub fn with_max_in_flight(timeout: Duration, max_in_flight: usize) -> Self {
        SystemResolver {
            timeout,
            max_in_flight,
            in_flight: Arc::new(AtomicUsize::new(0)),
            lookup: dns_lookup::lookup_addr,
        }
    }

    /// Replaces `dns_lookup::lookup_addr` as the blocking name lookup.
    pub fn with_lookup(mut self, lookup: LookupFn) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn try_reserve(&self) -> bool {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) >= self.max_in_flight {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }
}

impl Resolver for SystemResolver {
    fn reverse(&self, ip: IpAddr) -> Lookup {
        self.reverse_all(&[ip]).pop().unwrap_or(Lookup::Skipped)
    }

    fn reverse_all(&self, ips: &[IpAddr]) -> Vec<Lookup> {
        let deadline = Instant::now() + self.timeout;
        let mut answers = vec![Lookup::Skipped; ips.len()];
        // room for every answer, so a late worker never blocks on send
        let (tx, rx) = crossbeam_channel::bounded(ips.len().max(1));
        let mut pending = 0usize;
        let mut skipped = 0usize;

        for (slot, &ip) in ips.iter().enumerate() {
            if !self.try_reserve() {
                skipped += 1;
                continue;
            }
            let tx = tx.clone();
            let in_flight = self.in_flight.clone();
            let lookup = self.lookup;
            let spawned = thread::Builder::new()
                .name("bwmon-rdns".into())
                .spawn(move || {
                    let name = lookup(&ip)
                        .ok()
                        .filter(|name| !name.is_empty() && *name != ip.to_string());
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send((slot, name));
                });
            match spawned {
                Ok(_) => {
                    answers[slot] = Lookup::NotFound;
                    pending += 1;
                }
                Err(e) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    debug!("could not start reverse lookup for {}: {}", ip, e);
                }
            }
        }
        drop(tx);

        if skipped > 0 {
            warn!(
                "{} reverse lookups still pending, skipped {} addresses",
                self.max_in_flight, skipped
            );
        }

        while pending > 0 {
            match rx.recv_deadline(deadline) {
                Ok((slot, name)) => {
                    pending -= 1;
                    if let Some(name) = name {
                        answers[slot] = Lookup::Found(name);
                    }
                }
                Err(_) => {
                    debug!("{} reverse lookups timed out after {:?}", pending, self.timeout);
                    break;
                }
            }
        }
        answers
    }
}

pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

struct CacheEntry {
    answer: Lookup,
    stored_at: Instant,
}

/// Memoises another resolver's answers, failures included, for `ttl`.
///
/// Skipped lookups are never stored. Once `capacity` addresses are held,
/// expired entries are purged and new addresses go uncached until room
/// frees up.
pub struct CachingResolver<R> {
    inner: R,
    ttl: Duration,
    capacity: usize,
    cache: DashMap<IpAddr, CacheEntry>,
}

impl<R: Resolver> CachingResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self::with_capacity(inner, ttl, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(inner: R, ttl: Duration, capacity: usize) -> Self {
        CachingResolver {
            inner,
            ttl,
            capacity,
            cache: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
    }

    fn cached(&self, ip: &IpAddr) -> Option<Lookup> {
        self.cache
            .get(ip)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.answer.clone())
    }

    fn store(&self, ip: IpAddr, answer: &Lookup) {
        if *answer == Lookup::Skipped {
            return;
        }
        if self.cache.len() >= self.capacity && !self.cache.contains_key(&ip) {
            self.purge_expired();
            if self.cache.len() >= self.capacity {
                debug!("resolver cache full at {} entries, not keeping {}", self.capacity, ip);
                return;
            }
        }
        self.cache.insert(
            ip,
            CacheEntry {
                answer: answer.clone(),
                stored_at: Instant::now(),
            },
        );
    }
}

impl<R: Resolver> Resolver for CachingResolver<R> {
    fn reverse(&self, ip: IpAddr) -> Lookup {
        if let Some(answer) = self.cached(&ip) {
            return answer;
        }
        let answer = self.inner.reverse(ip);
        self.store(ip, &answer);
        answer
    }

    fn reverse_all(&self, ips: &[IpAddr]) -> Vec<Lookup> {
        let mut misses = Vec::new();
        let mut answers: Vec<Lookup> = ips
            .iter()
            .enumerate()
            .map(|(slot, ip)| {
                self.cached(ip).unwrap_or_else(|| {
                    misses.push(slot);
                    Lookup::Skipped
                })
            })
            .collect();

        let missed: Vec<IpAddr> = misses.iter().map(|&slot| ips[slot]).collect();
        for (slot, answer) in misses.into_iter().zip(self.inner.reverse_all(&missed)) {
            self.store(ips[slot], &answer);
            answers[slot] = answer;
        }
        answers
    }
}

pub struct AddressLabeler {
    resolver: Box<dyn Resolver>,
}

impl AddressLabeler {
    pub fn new(resolver: Box<dyn Resolver>) -> Self {
        AddressLabeler { resolver }
    }

    /// Labeler that never touches DNS.
    pub fn offline() -> Self {
        Self::new(Box::new(NoopResolver))
    }

    /// Labels a textual address. Non-IP text is `Unresolved` without a lookup.
    pub fn label(&self, addr: &str) -> AddressLabel {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.label_ip(ip),
            Err(_) => AddressLabel::Unresolved,
        }
    }

    pub fn label_address(&self, addr: &Address) -> AddressLabel {
        match addr {
            Address::Ip(ip) => self.label_ip(*ip),
            Address::Unknown => AddressLabel::Unresolved,
        }
    }

    pub fn label_ip(&self, ip: IpAddr) -> AddressLabel {
        categorize(ip).unwrap_or_else(|| self.resolver.reverse(ip).into_label())
    }

    /// Labels every distinct address once. Routable addresses are resolved
    /// together in one batch.
    pub fn label_all<'a, I>(&self, addrs: I) -> HashMap<Address, AddressLabel>
    where
        I: IntoIterator<Item = &'a Address>,
    {
        let mut labels = HashMap::new();
        let mut routable = Vec::new();
        for addr in addrs {
            if labels.contains_key(addr) {
                continue;
            }
            let label = match addr {
                Address::Ip(ip) => categorize(*ip).unwrap_or_else(|| {
                    routable.push(*ip);
                    AddressLabel::Unresolved
                }),
                Address::Unknown => AddressLabel::Unresolved,
            };
            labels.insert(*addr, label);
        }

        let answers = self.resolver.reverse_all(&routable);
        for (ip, answer) in routable.into_iter().zip(answers) {
            labels.insert(Address::Ip(ip), answer.into_label());
        }
        labels
    }
}
