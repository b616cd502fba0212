//! Authoritative host registry.
//!
//! `HostMap` owns one `HostInfo` per hostname, created lazily on first
//! reference and kept for the life of the process. Each `HostInfo` carries a
//! `RemoteList`: per-reporter caches of a `learned` address (where we last
//! observed the reporter) and `reported` addresses (what the reporter claims),
//! plus a deduplicated snapshot of everything, rebuilt lazily.
//!
//! Lock order: the map's lock is taken before any list's lock, never the
//! reverse. List mutation happens under the list lock only; the snapshot
//! rebuild is deferred to the next `copy_addrs`.

use kh_proto::{Ipv4AddrWire, Ipv6AddrWire};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

/// Bound on reported addresses kept per reporter and family.
pub const MAX_REMOTES: usize = 10;

// ---------------------------------------------------------------------------
// Per-reporter caches
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct CacheV4 {
    pub learned: Option<Ipv4AddrWire>,
    pub reported: Vec<Ipv4AddrWire>,
}

#[derive(Debug, Default, Clone)]
pub struct CacheV6 {
    pub learned: Option<Ipv6AddrWire>,
    pub reported: Vec<Ipv6AddrWire>,
}

/// Both family caches of one reporter. Families are allocated on first use
/// so a v4-only reporter never carries v6 state.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    pub v4: Option<CacheV4>,
    pub v6: Option<CacheV6>,
}

// ---------------------------------------------------------------------------
// RemoteList
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RemoteListInner {
    /// Deduplicated snapshot of every learned and reported address.
    addrs: Vec<SocketAddr>,
    /// Keyed by the hostname of whoever told us about these addresses.
    cache: HashMap<String, Cache>,
    /// Set on any cache mutation; cleared by the next rebuild.
    should_rebuild: bool,
}

impl RemoteListInner {
    fn v4_mut(&mut self, reporter: &str) -> &mut CacheV4 {
        self.cache
            .entry(reporter.to_owned())
            .or_default()
            .v4
            .get_or_insert_with(CacheV4::default)
    }

    fn v6_mut(&mut self, reporter: &str) -> &mut CacheV6 {
        self.cache
            .entry(reporter.to_owned())
            .or_default()
            .v6
            .get_or_insert_with(CacheV6::default)
    }

    fn rebuild_if_needed(&mut self) {
        if !self.should_rebuild {
            return;
        }
        let mut addrs = Vec::new();
        let mut seen = HashSet::new();
        for cache in self.cache.values() {
            if let Some(v4) = &cache.v4 {
                for a in v4.learned.iter().chain(v4.reported.iter()) {
                    let addr = a.socket_addr();
                    if seen.insert(addr.to_string()) {
                        addrs.push(addr);
                    }
                }
            }
            if let Some(v6) = &cache.v6 {
                for a in v6.learned.iter().chain(v6.reported.iter()) {
                    let addr = a.socket_addr();
                    if seen.insert(addr.to_string()) {
                        addrs.push(addr);
                    }
                }
            }
        }
        self.addrs = addrs;
        self.should_rebuild = false;
    }
}

/// The shared address cache of a single host.
#[derive(Default)]
pub struct RemoteList {
    inner: Mutex<RemoteListInner>,
}

impl RemoteList {
    /// Replace the reported lists of `reporter`, truncating each family to
    /// the first `MAX_REMOTES` entries.
    pub fn set_reported(&self, reporter: &str, v4: &[Ipv4AddrWire], v6: &[Ipv6AddrWire]) {
        let mut inner = self.inner.lock().unwrap();
        inner.should_rebuild = true;

        let c4 = inner.v4_mut(reporter);
        c4.reported.clear();
        c4.reported.extend_from_slice(&v4[..v4.len().min(MAX_REMOTES)]);

        let c6 = inner.v6_mut(reporter);
        c6.reported.clear();
        c6.reported.extend_from_slice(&v6[..v6.len().min(MAX_REMOTES)]);
    }

    /// Record where `reporter` was last observed from.
    pub fn set_learned(&self, reporter: &str, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.should_rebuild = true;
        match addr {
            SocketAddr::V4(a) => {
                inner.v4_mut(reporter).learned = Some(Ipv4AddrWire::new(*a.ip(), a.port()));
            }
            SocketAddr::V6(a) => match a.ip().to_ipv4_mapped() {
                Some(v4) => {
                    inner.v4_mut(reporter).learned = Some(Ipv4AddrWire::new(v4, a.port()));
                }
                None => {
                    inner.v6_mut(reporter).learned = Some(Ipv6AddrWire::new(*a.ip(), a.port()));
                }
            },
        }
    }

    /// The deduplicated address snapshot, rebuilt first if anything changed.
    pub fn copy_addrs(&self) -> Vec<SocketAddr> {
        let mut inner = self.inner.lock().unwrap();
        inner.rebuild_if_needed();
        inner.addrs.clone()
    }

    /// Deep copy of one reporter's caches, for composing replies.
    pub fn cache_of(&self, reporter: &str) -> Option<Cache> {
        self.inner.lock().unwrap().cache.get(reporter).cloned()
    }
}

// ---------------------------------------------------------------------------
// HostInfo / HostMap
// ---------------------------------------------------------------------------

pub struct HostInfo {
    pub name: String,
    pub remotes: Arc<RemoteList>,
    last_remote: Mutex<Option<SocketAddr>>,
}

impl HostInfo {
    fn new(name: &str) -> Self {
        HostInfo {
            name: name.to_owned(),
            remotes: Arc::new(RemoteList::default()),
            last_remote: Mutex::new(None),
        }
    }

    /// Update the observed remote endpoint. Unconditional: the publication
    /// decision belongs to the change test, not to this setter.
    pub fn set_remote(&self, addr: SocketAddr) {
        *self.last_remote.lock().unwrap() = Some(addr);
        self.remotes.set_learned(&self.name, addr);
    }

    pub fn last_remote(&self) -> Option<SocketAddr> {
        *self.last_remote.lock().unwrap()
    }
}

/// `hostname → HostInfo`, entries never removed.
#[derive(Default)]
pub struct HostMap {
    hosts: RwLock<HashMap<String, Arc<HostInfo>>>,
}

impl HostMap {
    pub fn get(&self, name: &str) -> Option<Arc<HostInfo>> {
        self.hosts.read().unwrap().get(name).cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<HostInfo> {
        if let Some(info) = self.get(name) {
            return info;
        }
        let mut hosts = self.hosts.write().unwrap();
        Arc::clone(
            hosts
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(HostInfo::new(name))),
        )
    }
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

/// Set comparison on the canonical string representation.
pub fn has_address_changed(old: &[SocketAddr], new: &[SocketAddr]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    let old_set: HashSet<String> = old.iter().map(ToString::to_string).collect();
    new.iter().any(|a| !old_set.contains(&a.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str, port: u16) -> Ipv4AddrWire {
        Ipv4AddrWire::new(s.parse().unwrap(), port)
    }

    fn v6(s: &str, port: u16) -> Ipv6AddrWire {
        Ipv6AddrWire::new(s.parse().unwrap(), port)
    }

    #[test]
    fn copy_addrs_deduplicates_across_reporters_and_fields() {
        let list = RemoteList::default();
        list.set_reported("r1", &[v4("1.2.3.4", 5000), v4("1.2.3.4", 5000)], &[]);
        list.set_reported("r2", &[v4("1.2.3.4", 5000), v4("9.9.9.9", 5000)], &[]);
        list.set_learned("r1", "1.2.3.4:5000".parse().unwrap());

        let addrs = list.copy_addrs();
        let count = addrs
            .iter()
            .filter(|a| a.to_string() == "1.2.3.4:5000")
            .count();
        assert_eq!(count, 1, "each distinct address appears at most once");
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn reported_lists_are_truncated_to_the_first_ten() {
        let list = RemoteList::default();
        let many: Vec<Ipv4AddrWire> = (0..15u8)
            .map(|i| v4(&format!("10.0.0.{i}"), 5000))
            .collect();
        list.set_reported("r1", &many, &[]);

        let cache = list.cache_of("r1").unwrap();
        let reported = cache.v4.unwrap().reported;
        assert_eq!(reported.len(), MAX_REMOTES);
        assert_eq!(reported, many[..MAX_REMOTES].to_vec());
    }

    #[test]
    fn rebuild_is_lazy() {
        let list = RemoteList::default();
        list.set_reported("r1", &[v4("1.2.3.4", 1)], &[]);
        assert_eq!(list.copy_addrs().len(), 1);
        // No mutation since the last copy: the snapshot is served as-is.
        assert_eq!(list.copy_addrs().len(), 1);
        list.set_reported("r1", &[v4("1.2.3.4", 1), v4("5.6.7.8", 1)], &[]);
        assert_eq!(list.copy_addrs().len(), 2);
    }

    #[test]
    fn v6_reports_land_in_the_v6_cache() {
        let list = RemoteList::default();
        list.set_reported("r1", &[], &[v6("2001:db8::1", 443)]);
        let addrs = list.copy_addrs();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
    }

    #[test]
    fn learned_mapped_v6_is_stored_as_v4() {
        let list = RemoteList::default();
        list.set_learned("r1", "[::ffff:1.2.3.4]:5000".parse().unwrap());
        let cache = list.cache_of("r1").unwrap();
        assert!(cache.v6.is_none());
        assert_eq!(
            cache.v4.unwrap().learned.unwrap().socket_addr().to_string(),
            "1.2.3.4:5000"
        );
    }

    #[test]
    fn change_detection_is_set_based() {
        let a: Vec<SocketAddr> = vec!["1.2.3.4:5000".parse().unwrap()];
        let b: Vec<SocketAddr> = vec!["1.2.3.4:5000".parse().unwrap(), "9.9.9.9:5000".parse().unwrap()];
        let b_reordered: Vec<SocketAddr> =
            vec!["9.9.9.9:5000".parse().unwrap(), "1.2.3.4:5000".parse().unwrap()];

        assert!(!has_address_changed(&a, &a));
        assert!(has_address_changed(&a, &b));
        assert!(has_address_changed(&b, &a));
        assert!(!has_address_changed(&b, &b_reordered));
    }

    #[test]
    fn host_map_creates_lazily_and_keeps_entries() {
        let map = HostMap::default();
        assert!(map.get("h1").is_none());
        let first = map.get_or_create("h1");
        let second = map.get_or_create("h1");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(map.get("h1").is_some());
    }

    #[test]
    fn set_remote_updates_unconditionally() {
        let info = HostInfo::new("h1");
        let addr: SocketAddr = "5.6.7.8:4000".parse().unwrap();
        info.set_remote(addr);
        info.set_remote(addr);
        assert_eq!(info.last_remote(), Some(addr));
        let cache = info.remotes.cache_of("h1").unwrap();
        assert_eq!(cache.v4.unwrap().learned.unwrap().socket_addr(), addr);
    }
}
