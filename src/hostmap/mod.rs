//! Peer Registry
//!
//! A [`HostMap`] indexes [`HostInfo`] records three ways: by virtual
//! address, by the local index we chose, and by the remote index the peer
//! chose. Every index is partitioned by network id. Two instances exist
//! per engine: "pending" for handshakes in flight and "main" for
//! established tunnels.
//!
//! One reader/writer lock guards all three indices of a map so readers
//! never see them disagree. Callers that need both maps lock pending
//! first, then main. Record locks come after map locks.

mod host_info;
mod remote_list;

pub use host_info::{ControlHostInfo, HandshakeStage, HostInfo, HostInfoState};
pub use remote_list::RemoteList;

use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use ipnet::IpNet;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors from registry lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostMapError {
    #[error("no host for {0}")]
    NotFound(NetworkAddrPair),

    #[error("no host for index {index} in network {network_id}")]
    IndexNotFound { index: u32, network_id: NetworkId },
}

#[derive(Default)]
struct HostTable {
    hosts: HashMap<VpnAddr, Arc<HostInfo>>,
    indexes: HashMap<u32, Arc<HostInfo>>,
    remote_indexes: HashMap<u32, Arc<HostInfo>>,
}

impl HostTable {
    /// Drop every index entry that points at `hostinfo`.
    fn unlink(&mut self, hostinfo: &Arc<HostInfo>) -> bool {
        let mut removed = false;
        if self
            .hosts
            .get(&hostinfo.vpn_addr())
            .is_some_and(|h| Arc::ptr_eq(h, hostinfo))
        {
            self.hosts.remove(&hostinfo.vpn_addr());
            removed = true;
        }
        if self
            .indexes
            .get(&hostinfo.local_index())
            .is_some_and(|h| Arc::ptr_eq(h, hostinfo))
        {
            self.indexes.remove(&hostinfo.local_index());
            removed = true;
        }
        if self
            .remote_indexes
            .get(&hostinfo.remote_index())
            .is_some_and(|h| Arc::ptr_eq(h, hostinfo))
        {
            self.remote_indexes.remove(&hostinfo.remote_index());
            removed = true;
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.indexes.is_empty() && self.remote_indexes.is_empty()
    }
}

/// The indices of one map, reachable only through its lock.
#[derive(Default)]
pub struct HostTables {
    networks: HashMap<NetworkId, HostTable>,
}

impl HostTables {
    pub fn host(&self, pair: NetworkAddrPair) -> Option<&Arc<HostInfo>> {
        self.networks.get(&pair.network_id)?.hosts.get(&pair.vpn_addr)
    }

    pub fn index(&self, network_id: NetworkId, index: u32) -> Option<&Arc<HostInfo>> {
        self.networks.get(&network_id)?.indexes.get(&index)
    }

    pub fn remote_index(&self, network_id: NetworkId, index: u32) -> Option<&Arc<HostInfo>> {
        self.networks.get(&network_id)?.remote_indexes.get(&index)
    }

    /// Register `hostinfo` under all three indices. A different record
    /// already registered for the same address is unlinked first.
    pub fn add_host_info(&mut self, hostinfo: &Arc<HostInfo>) -> Option<Arc<HostInfo>> {
        let table = self.networks.entry(hostinfo.network_id()).or_default();

        let replaced = match table.hosts.get(&hostinfo.vpn_addr()) {
            Some(existing) if !Arc::ptr_eq(existing, hostinfo) => Some(existing.clone()),
            _ => None,
        };
        if let Some(existing) = &replaced {
            table.unlink(existing);
        }

        table.hosts.insert(hostinfo.vpn_addr(), hostinfo.clone());
        table.indexes.insert(hostinfo.local_index(), hostinfo.clone());
        if hostinfo.remote_index() != 0 {
            table
                .remote_indexes
                .insert(hostinfo.remote_index(), hostinfo.clone());
        }
        replaced
    }

    /// Return the record for `pair`, creating it with `init` and
    /// registering its address if absent.
    pub fn add_vpn_addr<F>(&mut self, pair: NetworkAddrPair, init: F) -> (Arc<HostInfo>, bool)
    where
        F: FnOnce(&Arc<HostInfo>),
    {
        if let Some(existing) = self.host(pair) {
            return (existing.clone(), false);
        }
        let hostinfo = Arc::new(HostInfo::new(pair));
        init(&hostinfo);
        self.add_host_entry(&hostinfo);
        (hostinfo, true)
    }

    /// Register only the address index. Used for pending records whose
    /// local index is not chosen yet.
    pub(crate) fn add_host_entry(&mut self, hostinfo: &Arc<HostInfo>) {
        self.networks
            .entry(hostinfo.network_id())
            .or_default()
            .hosts
            .insert(hostinfo.vpn_addr(), hostinfo.clone());
    }

    /// Register only the local index.
    pub(crate) fn add_index(&mut self, index: u32, hostinfo: &Arc<HostInfo>) {
        self.networks
            .entry(hostinfo.network_id())
            .or_default()
            .indexes
            .insert(index, hostinfo.clone());
    }

    /// Register only the remote index.
    pub(crate) fn add_remote_index(&mut self, index: u32, hostinfo: &Arc<HostInfo>) {
        self.networks
            .entry(hostinfo.network_id())
            .or_default()
            .remote_indexes
            .insert(index, hostinfo.clone());
    }

    /// Remove `hostinfo` from every index that still points at it. Entries
    /// that were taken over by another record are left alone.
    pub fn delete_host_info(&mut self, hostinfo: &Arc<HostInfo>) -> bool {
        let network_id = hostinfo.network_id();
        let Some(table) = self.networks.get_mut(&network_id) else {
            return false;
        };
        let removed = table.unlink(hostinfo);
        if table.is_empty() {
            self.networks.remove(&network_id);
        }
        removed
    }

    /// Records registered by address, optionally restricted to one network.
    pub fn hosts(&self, network_id: Option<NetworkId>) -> Vec<Arc<HostInfo>> {
        self.networks
            .iter()
            .filter(|(id, _)| network_id.is_none_or(|n| n == **id))
            .flat_map(|(_, table)| table.hosts.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.networks.values().map(|t| t.hosts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Concurrent peer registry.
pub struct HostMap {
    name: &'static str,
    preferred_ranges: Vec<IpNet>,
    tables: RwLock<HostTables>,
}

impl HostMap {
    pub fn new(name: &'static str, preferred_ranges: Vec<IpNet>) -> Self {
        Self {
            name,
            preferred_ranges,
            tables: RwLock::new(HostTables::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn preferred_ranges(&self) -> &[IpNet] {
        &self.preferred_ranges
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HostTables> {
        self.tables.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, HostTables> {
        self.tables.write()
    }

    /// Return the record for `pair`, creating it with `init` if absent.
    /// The bool is true when a new record was created.
    pub fn add_vpn_addr<F>(&self, pair: NetworkAddrPair, init: F) -> (Arc<HostInfo>, bool)
    where
        F: FnOnce(&Arc<HostInfo>),
    {
        let (hostinfo, created) = self.tables.write().add_vpn_addr(pair, init);
        if created {
            tracing::debug!(
                hostmap = self.name,
                vpn_addr = %pair.vpn_addr,
                network_id = pair.network_id,
                "Host added"
            );
        }
        (hostinfo, created)
    }

    pub fn query_vpn_addr(&self, pair: NetworkAddrPair) -> Result<Arc<HostInfo>, HostMapError> {
        self.tables
            .read()
            .host(pair)
            .cloned()
            .ok_or(HostMapError::NotFound(pair))
    }

    pub fn query_index(
        &self,
        network_id: NetworkId,
        index: u32,
    ) -> Result<Arc<HostInfo>, HostMapError> {
        self.tables
            .read()
            .index(network_id, index)
            .cloned()
            .ok_or(HostMapError::IndexNotFound { index, network_id })
    }

    pub fn query_remote_index(
        &self,
        network_id: NetworkId,
        index: u32,
    ) -> Result<Arc<HostInfo>, HostMapError> {
        self.tables
            .read()
            .remote_index(network_id, index)
            .cloned()
            .ok_or(HostMapError::IndexNotFound { index, network_id })
    }

    /// Register under all indices, replacing any stale record for the
    /// same address.
    pub fn add_host_info(&self, hostinfo: &Arc<HostInfo>) -> Option<Arc<HostInfo>> {
        self.tables.write().add_host_info(hostinfo)
    }

    pub fn delete_host_info(&self, hostinfo: &Arc<HostInfo>) -> bool {
        let removed = self.tables.write().delete_host_info(hostinfo);
        if removed {
            tracing::debug!(
                hostmap = self.name,
                vpn_addr = %hostinfo.vpn_addr(),
                local_index = hostinfo.local_index(),
                "Host deleted"
            );
        }
        removed
    }

    pub fn hosts(&self, network_id: Option<NetworkId>) -> Vec<Arc<HostInfo>> {
        self.tables.read().hosts(network_id)
    }

    /// Deep-copied snapshot of every record.
    pub fn list(&self, network_id: Option<NetworkId>) -> Vec<ControlHostInfo> {
        let hosts = self.hosts(network_id);
        let mut list: Vec<_> = hosts.iter().map(|h| h.snapshot()).collect();
        list.sort_by_key(|h| (h.network_id, h.vpn_addr));
        list
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HostMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMap")
            .field("name", &self.name)
            .field("hosts", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn pair(addr: &str, network_id: NetworkId) -> NetworkAddrPair {
        NetworkAddrPair::new(addr.parse().unwrap(), network_id)
    }

    fn host(addr: &str, network_id: NetworkId, local: u32, remote: u32) -> Arc<HostInfo> {
        let h = Arc::new(HostInfo::new(pair(addr, network_id)));
        h.set_local_index(local);
        h.set_remote_index(remote);
        h
    }

    #[test]
    fn test_add_vpn_addr_is_idempotent() {
        let map = HostMap::new("pending", vec![]);
        let mut inits = 0;
        let (a, created) = map.add_vpn_addr(pair("10.1.0.2", 1), |_| inits += 1);
        assert!(created);
        let (b, created) = map.add_vpn_addr(pair("10.1.0.2", 1), |_| inits += 1);
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(inits, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_networks_are_partitioned() {
        let map = HostMap::new("main", vec![]);
        map.add_host_info(&host("10.1.0.2", 1, 11, 21));
        map.add_host_info(&host("10.1.0.2", 2, 11, 21));

        assert_eq!(map.len(), 2);
        assert_eq!(map.query_index(1, 11).unwrap().network_id(), 1);
        assert_eq!(map.query_index(2, 11).unwrap().network_id(), 2);
        assert_eq!(map.hosts(Some(2)).len(), 1);
        assert_eq!(
            map.query_vpn_addr(pair("10.1.0.2", 3)).unwrap_err(),
            HostMapError::NotFound(pair("10.1.0.2", 3))
        );
    }

    #[test]
    fn test_add_host_info_replaces_stale_entry() {
        let map = HostMap::new("main", vec![]);
        let old = host("10.1.0.2", 1, 11, 21);
        let new = host("10.1.0.2", 1, 12, 22);
        map.add_host_info(&old);

        let replaced = map.add_host_info(&new).unwrap();
        assert!(Arc::ptr_eq(&replaced, &old));
        assert!(map.query_index(1, 11).is_err());
        assert!(map.query_remote_index(1, 21).is_err());
        assert!(Arc::ptr_eq(&map.query_index(1, 12).unwrap(), &new));
        assert!(Arc::ptr_eq(&map.query_remote_index(1, 22).unwrap(), &new));
        assert!(Arc::ptr_eq(&map.query_vpn_addr(pair("10.1.0.2", 1)).unwrap(), &new));
    }

    #[test]
    fn test_delete_only_removes_own_entries() {
        let map = HostMap::new("main", vec![]);
        let old = host("10.1.0.2", 1, 11, 21);
        let new = host("10.1.0.2", 1, 12, 22);
        map.add_host_info(&old);
        map.add_host_info(&new);

        // The old record no longer owns anything.
        assert!(!map.delete_host_info(&old));
        assert_eq!(map.len(), 1);

        assert!(map.delete_host_info(&new));
        assert!(map.is_empty());
        assert!(map.query_index(1, 12).is_err());
    }

    #[test]
    fn test_snapshot_is_deep_copy() {
        let map = HostMap::new("main", vec![]);
        let h = host("10.1.0.2", 1, 11, 21);
        let addr: SocketAddr = "1.2.3.4:4242".parse().unwrap();
        h.lock().remotes.set_current(addr, &[]);
        map.add_host_info(&h);

        let before = map.list(None);
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].current_remote, Some(addr));

        // Mutate the live record.
        let moved: SocketAddr = "5.6.7.8:4242".parse().unwrap();
        h.lock().remotes.set_current(moved, &[]);
        h.lock().relay = true;
        h.set_remote_index(99);
        h.add_in_bytes(100);

        assert_eq!(before[0].current_remote, Some(addr));
        assert_eq!(before[0].remote_addrs, vec![addr]);
        assert!(!before[0].relay);
        assert_eq!(before[0].remote_index, 21);
        assert_eq!(before[0].in_bytes, 0);

        let after = map.list(None);
        assert_eq!(after[0].current_remote, Some(moved));
        assert_eq!(after[0].in_bytes, 100);
    }
}
