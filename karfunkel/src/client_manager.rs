//! Registry of authenticated clients.
//!
//! Clients enter the registry once their handshake succeeds and leave it when
//! their connection terminates. The registry also enforces the server's
//! capacity limit.

use std::collections::HashMap;

use log::info;
use protocol::ClientId;

use crate::client::Client;

pub struct ClientManager {
    /// Authenticated clients indexed by their id
    clients: HashMap<ClientId, Client>,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Adds an authenticated client.
    ///
    /// Returns false if the server is at capacity, the client has no id yet,
    /// or another client already holds the same id.
    pub fn add_client(&mut self, client: Client) -> bool {
        if self.is_full() {
            return false;
        }
        let Some(id) = client.id() else {
            return false;
        };
        if self.clients.contains_key(&id) {
            return false;
        }

        info!("Client {} connected from {}", id, client.peer());
        self.clients.insert(id, client);
        true
    }

    /// Removes a client. Returns it if it was registered.
    pub fn remove_client(&mut self, client_id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&client_id)?;
        info!("Client {} disconnected", client_id);
        Some(client)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Snapshot of every registered client, in id order.
    pub fn clients(&self) -> Vec<Client> {
        let mut clients: Vec<(ClientId, Client)> = self
            .clients
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect();
        clients.sort_by_key(|(id, _)| *id);
        clients.into_iter().map(|(_, client)| client).collect()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn authenticated(id: ClientId) -> Client {
        let (client, _inbox) = Client::new(test_addr());
        client.authenticate(id, Some("linux"));
        client
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(5);
        assert_eq!(manager.max_clients, 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_add_client() {
        let mut manager = ClientManager::new(2);

        assert!(manager.add_client(authenticated(1)));
        assert_eq!(manager.len(), 1);
        assert!(!manager.is_empty());
        assert!(manager.get(1).is_some());
    }

    #[test]
    fn test_unauthenticated_client_is_refused() {
        let mut manager = ClientManager::new(2);
        let (client, _inbox) = Client::new(test_addr());

        assert!(!manager.add_client(client));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_duplicate_id_is_refused() {
        let mut manager = ClientManager::new(3);

        assert!(manager.add_client(authenticated(1)));
        assert!(!manager.add_client(authenticated(1)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);

        assert!(manager.add_client(authenticated(1)));
        assert!(manager.is_full());
        assert!(!manager.add_client(authenticated(2)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = ClientManager::new(2);
        manager.add_client(authenticated(1));

        let removed = manager.remove_client(1);
        assert_eq!(removed.and_then(|client| client.id()), Some(1));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_remove_nonexistent_client() {
        let mut manager = ClientManager::new(2);
        assert!(manager.remove_client(999).is_none());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_snapshots_are_ordered() {
        let mut manager = ClientManager::new(5);
        for id in [3, 1, 2] {
            manager.add_client(authenticated(id));
        }

        assert_eq!(manager.ids(), vec![1, 2, 3]);
        let ids: Vec<_> = manager.clients().iter().filter_map(Client::id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
