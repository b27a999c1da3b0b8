//! Address registry — maps peer names to transport addresses.
//!
//! Each driver owns exactly one [`AddressRegistry`]; it is not `Clone` and
//! is never shared between drivers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// A registered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Logical peer name.
    pub name: String,
    /// Transport address, opaque to everything but the socket layer.
    pub address: String,
    /// When this name was last (re)bound to `address`.
    pub registered_at: DateTime<Utc>,
}

/// Outcome of [`AddressRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The name was not known before.
    Added,
    /// The name was already bound to the same address.
    Unchanged,
    /// The name was bound to a different address, which is returned.
    Replaced {
        /// The address the name pointed at before.
        previous: String,
    },
}

/// Per-driver registry of known peers.
#[derive(Debug, Default)]
pub struct AddressRegistry {
    peers: RwLock<HashMap<String, PeerAddress>>,
}

impl AddressRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `address`, reporting what changed.
    pub fn register(&self, name: &str, address: &str) -> Registration {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(name) {
            Some(entry) if entry.address == address => Registration::Unchanged,
            Some(entry) => {
                let previous = std::mem::replace(&mut entry.address, address.to_string());
                entry.registered_at = Utc::now();
                Registration::Replaced { previous }
            }
            None => {
                peers.insert(
                    name.to_string(),
                    PeerAddress {
                        name: name.to_string(),
                        address: address.to_string(),
                        registered_at: Utc::now(),
                    },
                );
                Registration::Added
            }
        }
    }

    /// Remove a peer entirely.
    pub fn remove(&self, name: &str) -> Option<PeerAddress> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(name)
    }

    /// Get a snapshot of a specific peer.
    pub fn get(&self, name: &str) -> Option<PeerAddress> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(name).cloned()
    }

    /// Address a peer name resolves to.
    pub fn address_of(&self, name: &str) -> Option<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(name).map(|p| p.address.clone())
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = peers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get all peers.
    pub fn all(&self) -> Vec<PeerAddress> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
