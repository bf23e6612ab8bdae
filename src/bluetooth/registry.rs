// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide table of active links.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::link::Link;
use crate::error::{Result, SerialError};

#[derive(Default)]
struct Entries {
    links: HashMap<String, Arc<Link>>,
    /// Addresses with a connect or accept in flight.
    pending: HashSet<String>,
}

impl Entries {
    fn occupied(&self, address: &str) -> bool {
        self.links.contains_key(address) || self.pending.contains(address)
    }
}

/// Maps peer address to its single active link.
///
/// All mutations take one lock, so duplicate detection and removal on
/// close cannot interleave.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<Entries>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `address` for a link that is about to be established.
    ///
    /// The claim is released when the returned reservation is dropped
    /// without being committed.
    pub fn reserve(self: &Arc<Self>, address: &str) -> Result<Reservation> {
        let mut entries = self.entries.lock();
        if entries.occupied(address) {
            return Err(SerialError::already_connected(address));
        }
        entries.pending.insert(address.to_string());
        debug!("Reserved registry slot for {}", address);

        Ok(Reservation {
            registry: Arc::clone(self),
            address: address.to_string(),
            committed: false,
        })
    }

    /// Register an established link directly.
    pub fn insert(&self, link: Arc<Link>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.occupied(link.address()) {
            return Err(SerialError::already_connected(link.address()));
        }
        entries.links.insert(link.address().to_string(), link);
        Ok(())
    }

    pub fn get(&self, address: &str) -> Option<Arc<Link>> {
        self.entries.lock().links.get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.lock().links.contains_key(address)
    }

    /// Remove `link` if it is still the registered link for its address.
    pub fn remove(&self, link: &Link) -> bool {
        let mut entries = self.entries.lock();
        match entries.links.get(link.address()) {
            Some(current) if current.id() == link.id() => {
                entries.links.remove(link.address());
                debug!("Removed {} from registry", link.address());
                true
            }
            _ => false,
        }
    }

    /// Remove and return every registered link.
    pub fn drain(&self) -> Vec<Arc<Link>> {
        self.entries.lock().links.drain().map(|(_, link)| link).collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.entries.lock().links.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.entries.lock().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&self, address: &str, link: Arc<Link>) {
        let mut entries = self.entries.lock();
        entries.pending.remove(address);
        entries.links.insert(address.to_string(), link);
        debug!("Registered link to {}", address);
    }

    fn release(&self, address: &str) {
        self.entries.lock().pending.remove(address);
    }
}

/// Claim on a registry slot, see [`ConnectionRegistry::reserve`].
pub struct Reservation {
    registry: Arc<ConnectionRegistry>,
    address: String,
    committed: bool,
}

impl Reservation {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Turn the claim into a registered link.
    pub fn commit(mut self, link: Arc<Link>) {
        self.committed = true;
        self.registry.commit(&self.address, link);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(&self.address);
            debug!("Released registry slot for {}", self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::link::LinkSettings;

    #[test]
    fn test_reserve_rejects_duplicate() {
        let registry = Arc::new(ConnectionRegistry::new());
        let first = registry.reserve("AA:BB").unwrap();

        assert!(matches!(
            registry.reserve("AA:BB"),
            Err(SerialError::AlreadyConnected { .. })
        ));

        drop(first);
        assert!(registry.reserve("AA:BB").is_ok());
    }

    #[test]
    fn test_commit_registers_link() {
        let registry = Arc::new(ConnectionRegistry::new());
        let reservation = registry.reserve("AA:BB").unwrap();
        let link = Link::outbound("AA:BB", &LinkSettings::default());

        reservation.commit(Arc::clone(&link));
        assert!(registry.contains("AA:BB"));
        assert!(registry.reserve("AA:BB").is_err());
        assert_eq!(registry.addresses(), vec!["AA:BB".to_string()]);
    }

    #[test]
    fn test_remove_ignores_replaced_link() {
        let registry = ConnectionRegistry::new();
        let settings = LinkSettings::default();
        let old = Link::outbound("AA:BB", &settings);
        let new = Link::outbound("AA:BB", &settings);

        registry.insert(Arc::clone(&old)).unwrap();
        assert!(registry.remove(&old));
        registry.insert(Arc::clone(&new)).unwrap();

        assert!(!registry.remove(&old));
        assert_eq!(registry.get("AA:BB").map(|l| l.id()), Some(new.id()));
    }

    #[test]
    fn test_drain() {
        let registry = ConnectionRegistry::new();
        let settings = LinkSettings::default();
        registry.insert(Link::outbound("AA:01", &settings)).unwrap();
        registry.insert(Link::outbound("AA:02", &settings)).unwrap();

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
