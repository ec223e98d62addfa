//! In-process stand-in for the DHT/TCP-relay discovery service that
//! `mesh_network::collaborators::ConnectionManager` treats as an external
//! collaborator. Every `InMemoryConnectionManager` sharing
//! one `Directory` behaves as though every node had registered with the
//! same real discovery backend.

use mesh_types::{Endpoint, MaskedUserId, NetworkId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct Directory {
    by_network: Mutex<HashMap<NetworkId, HashSet<Endpoint>>>,
    by_masked_user: Mutex<HashMap<MaskedUserId, HashSet<Endpoint>>>,
}

impl Directory {
    pub fn new() -> Arc<Directory> {
        Arc::new(Directory::default())
    }

    /// Registers `endpoint` as hosting `network_id`, returning every other
    /// endpoint already registered for it -- the responses `begin_announce`
    /// dials, on each announce-or-search discovery tick.
    pub fn announce_network(&self, network_id: NetworkId, endpoint: Endpoint) -> Vec<Endpoint> {
        let mut table = self.by_network.lock();
        let set = table.entry(network_id).or_default();
        let others: Vec<Endpoint> = set.iter().filter(|e| **e != endpoint).cloned().collect();
        set.insert(endpoint);
        others
    }

    pub fn unregister_network(&self, network_id: NetworkId, endpoint: &Endpoint) {
        if let Some(set) = self.by_network.lock().get_mut(&network_id) {
            set.remove(endpoint);
        }
    }

    /// Registers `endpoint` as a place to find whoever owns `masked_user_id`.
    pub fn announce_presence(&self, masked_user_id: MaskedUserId, endpoint: Endpoint) {
        self.by_masked_user.lock().entry(masked_user_id).or_default().insert(endpoint);
    }

    pub fn find_by_masked_user(&self, masked_user_id: MaskedUserId) -> Vec<Endpoint> {
        self.by_masked_user
            .lock()
            .get(&masked_user_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn announce_network_returns_only_prior_registrants() {
        let directory = Directory::new();
        assert!(directory.announce_network(NetworkId::from_low_u64_be(1), ep(1)).is_empty());
        let others = directory.announce_network(NetworkId::from_low_u64_be(1), ep(2));
        assert_eq!(others, vec![ep(1)]);
    }

    #[test]
    fn unregister_removes_only_that_endpoint() {
        let directory = Directory::new();
        let id = NetworkId::from_low_u64_be(1);
        directory.announce_network(id, ep(1));
        directory.announce_network(id, ep(2));
        directory.unregister_network(id, &ep(1));
        let remaining = directory.announce_network(id, ep(3));
        assert_eq!(remaining, vec![ep(2)]);
    }
}
