use ipnet::IpNet;
use std::net::SocketAddr;

/// Candidate underlay addresses for one peer.
///
/// Addresses are kept in rank order: those inside a preferred range come
/// first, otherwise insertion order is kept. `current` is the address the
/// data plane sends to; it is set when a handshake reply arrives from a
/// candidate or a roaming peer authenticates from a new address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteList {
    addrs: Vec<SocketAddr>,
    current: Option<SocketAddr>,
}

impl RemoteList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_addrs(addrs: impl IntoIterator<Item = SocketAddr>, preferred: &[IpNet]) -> Self {
        let mut list = Self::new();
        list.set(addrs, preferred);
        list
    }

    /// Replace the candidate set, keeping `current` only if it is still a
    /// candidate.
    pub fn set(&mut self, addrs: impl IntoIterator<Item = SocketAddr>, preferred: &[IpNet]) {
        self.addrs.clear();
        for addr in addrs {
            if !self.addrs.contains(&addr) {
                self.addrs.push(addr);
            }
        }
        self.rank(preferred);
        if self.current.is_some_and(|current| !self.addrs.contains(&current)) {
            self.current = None;
        }
    }

    /// Add one candidate. Returns false if it was already known.
    pub fn add(&mut self, addr: SocketAddr, preferred: &[IpNet]) -> bool {
        if self.addrs.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        self.rank(preferred);
        true
    }

    /// Make `addr` the current remote, adding it as a candidate if needed.
    pub fn set_current(&mut self, addr: SocketAddr, preferred: &[IpNet]) {
        self.add(addr, preferred);
        self.current = Some(addr);
    }

    pub fn current(&self) -> Option<SocketAddr> {
        self.current
    }

    /// Current remote, or the best ranked candidate when none is chosen.
    pub fn best(&self) -> Option<SocketAddr> {
        self.current.or_else(|| self.addrs.first().copied())
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    fn rank(&mut self, preferred: &[IpNet]) {
        let is_preferred = |addr: &SocketAddr| preferred.iter().any(|net| net.contains(&addr.ip()));
        // Stable sort keeps insertion order within each class.
        self.addrs.sort_by_key(|addr| !is_preferred(addr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_preferred_ranges_rank_first() {
        let preferred: Vec<IpNet> = vec!["192.168.0.0/16".parse().unwrap()];
        let list = RemoteList::from_addrs(
            [sa("1.2.3.4:4242"), sa("192.168.1.5:4242"), sa("5.6.7.8:4242")],
            &preferred,
        );
        assert_eq!(
            list.addrs(),
            &[sa("192.168.1.5:4242"), sa("1.2.3.4:4242"), sa("5.6.7.8:4242")]
        );
        assert_eq!(list.best(), Some(sa("192.168.1.5:4242")));
    }

    #[test]
    fn test_dedup_and_current() {
        let mut list = RemoteList::new();
        assert!(list.add(sa("1.2.3.4:1"), &[]));
        assert!(!list.add(sa("1.2.3.4:1"), &[]));
        list.set_current(sa("9.9.9.9:9"), &[]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.best(), Some(sa("9.9.9.9:9")));

        list.set([sa("1.2.3.4:1")], &[]);
        assert_eq!(list.current(), None);
        assert_eq!(list.best(), Some(sa("1.2.3.4:1")));
    }
}
