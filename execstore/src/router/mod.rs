//! Client routing across backend shards.
//!
//! The router holds a fixed, ordered list of named backends. A sharding key
//! maps to a shard by hashing it with MD5 and taking the first eight bytes
//! modulo the shard count, so routing is identical across processes and
//! restarts as long as the topology is unchanged. Resharding is an
//! administrative event; there is no live rehash.

use crate::backend::KvBackend;
use crate::errors::{Result, StoreError};
use md5::{Digest, Md5};
use std::sync::Arc;

/// Stable 64-bit hash of a sharding key.
#[must_use]
pub fn stable_hash(key: &str) -> u64 {
    let digest = Md5::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Maps a key onto one of `buckets` buckets.
#[must_use]
pub fn bucket_for(key: &str, buckets: usize) -> usize {
    debug_assert!(buckets > 0);
    (stable_hash(key) % buckets as u64) as usize
}

/// A named backend in the topology.
#[derive(Debug, Clone)]
pub struct Shard {
    /// Position in the topology.
    pub index: usize,
    /// The backend client.
    pub client: Arc<dyn KvBackend>,
}

impl Shard {
    /// The shard's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.client.name()
    }
}

/// Selects the backend responsible for a sharding key.
#[derive(Debug, Clone)]
pub struct ClientRouter {
    shards: Vec<Shard>,
}

impl ClientRouter {
    /// Creates a router over `clients`, in routing order.
    pub fn new(clients: Vec<Arc<dyn KvBackend>>) -> Result<Self> {
        if clients.is_empty() {
            return Err(StoreError::configuration("router needs at least one shard"));
        }
        let mut names = std::collections::HashSet::new();
        for client in &clients {
            if !names.insert(client.name().to_string()) {
                return Err(StoreError::configuration(format!(
                    "duplicate shard name '{}'",
                    client.name()
                )));
            }
        }
        Ok(Self {
            shards: clients
                .into_iter()
                .enumerate()
                .map(|(index, client)| Shard { index, client })
                .collect(),
        })
    }

    /// Creates a router with a single shard.
    #[must_use]
    pub fn single(client: Arc<dyn KvBackend>) -> Self {
        Self {
            shards: vec![Shard { index: 0, client }],
        }
    }

    /// Returns the index of the shard owning `key`.
    #[must_use]
    pub fn shard_for(&self, key: &str) -> usize {
        bucket_for(key, self.shards.len())
    }

    /// Returns the shard owning `key`.
    #[must_use]
    pub fn route(&self, key: &str) -> &Shard {
        &self.shards[self.shard_for(key)]
    }

    /// Returns the client owning `key`.
    #[must_use]
    pub fn client_for(&self, key: &str) -> &Arc<dyn KvBackend> {
        &self.route(key).client
    }

    /// Returns every shard, for fan-out operations.
    #[must_use]
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Returns the shard at `index`.
    #[must_use]
    pub fn shard(&self, index: usize) -> Option<&Shard> {
        self.shards.get(index)
    }

    /// Looks a shard up by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.name() == name)
    }

    /// Returns the number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always false; a router has at least one shard.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn router(n: usize) -> ClientRouter {
        ClientRouter::new(
            (0..n)
                .map(|i| Arc::new(MemoryBackend::new(format!("shard-{i}"))) as Arc<dyn KvBackend>)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_routing_is_deterministic() {
        let a = router(4);
        let b = router(4);
        for i in 0..200 {
            let key = format!("run-{i}");
            assert_eq!(a.shard_for(&key), b.shard_for(&key));
            assert_eq!(a.route(&key).name(), b.route(&key).name());
        }
    }

    #[test]
    fn test_stable_hash_is_fixed() {
        assert_eq!(stable_hash("run-1"), stable_hash("run-1"));
        assert_ne!(stable_hash("run-1"), stable_hash("run-2"));
    }

    #[test]
    fn test_routing_spreads_keys() {
        let r = router(4);
        let mut counts = [0usize; 4];
        for i in 0..400 {
            counts[r.shard_for(&format!("run-{i}"))] += 1;
        }
        assert!(counts.iter().all(|&c| c > 50), "uneven spread: {counts:?}");
    }

    #[test]
    fn test_single_shard() {
        let r = ClientRouter::single(Arc::new(MemoryBackend::new("only")));
        assert_eq!(r.len(), 1);
        assert_eq!(r.route("anything").name(), "only");
    }

    #[test]
    fn test_lookup_by_name() {
        let r = router(3);
        assert_eq!(r.by_name("shard-2").unwrap().index, 2);
        assert!(r.by_name("shard-9").is_none());
    }

    #[test]
    fn test_empty_and_duplicate_topologies_rejected() {
        assert!(ClientRouter::new(Vec::new()).is_err());
        let dup: Vec<Arc<dyn KvBackend>> = vec![
            Arc::new(MemoryBackend::new("x")),
            Arc::new(MemoryBackend::new("x")),
        ];
        assert!(ClientRouter::new(dup).is_err());
    }
}
