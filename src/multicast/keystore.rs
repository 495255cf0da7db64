use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use rand::{rngs::OsRng, RngCore};

use crate::crypto::{CryptoError, IV_LEN, KEY_LEN};

/// One generation of group key material. Never mutated once issued.
#[derive(Clone)]
pub struct KeyRecord {
    pub id: u32,
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub birthday: Instant,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("birthday", &self.birthday)
            .finish_non_exhaustive()
    }
}

/// Current key plus a bounded history of superseded ones.
///
/// With a depth of `n` the store keeps the current key and the `n - 1` keys
/// issued before it; anything older is evicted and its id becomes invalid.
#[derive(Debug)]
pub struct KeyStore {
    records: HashMap<u32, KeyRecord>,
    order: VecDeque<u32>,
    depth: usize,
}

impl KeyStore {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            records: HashMap::with_capacity(depth + 1),
            order: VecDeque::with_capacity(depth + 1),
            depth,
        }
    }

    /// Issues a fresh key under a random non-zero id unused by any retained key.
    pub fn generate(&mut self) -> Result<&KeyRecord, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        fill(&mut key)?;
        fill(&mut iv)?;
        let id = loop {
            let mut raw = [0u8; 4];
            fill(&mut raw)?;
            let candidate = u32::from_be_bytes(raw);
            if candidate != 0 && !self.records.contains_key(&candidate) {
                break candidate;
            }
        };
        self.insert(KeyRecord {
            id,
            key,
            iv,
            birthday: Instant::now(),
        });
        Ok(&self.records[&id])
    }

    fn insert(&mut self, record: KeyRecord) {
        self.order.push_back(record.id);
        self.records.insert(record.id, record);
        while self.order.len() > self.depth {
            if let Some(evicted) = self.order.pop_front() {
                self.records.remove(&evicted);
                tracing::trace!(key_id = evicted, "evicted multicast key");
            }
        }
    }

    pub fn current(&self) -> Option<&KeyRecord> {
        self.order.back().and_then(|id| self.records.get(id))
    }

    pub fn current_id(&self) -> Option<u32> {
        self.order.back().copied()
    }

    pub fn get(&self, id: u32) -> Option<&KeyRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.records.contains_key(&id)
    }

    /// Retained ids, oldest first.
    #[cfg(test)]
    pub(crate) fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

fn fill(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::Entropy(format!("multicast key material: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_current_and_valid() {
        let mut store = KeyStore::new(3);
        assert!(store.current().is_none());
        let id = store.generate().unwrap().id;
        assert_ne!(id, 0);
        assert_eq!(store.current_id(), Some(id));
        assert!(store.contains(id));
    }

    #[test]
    fn two_previous_generations_stay_valid() {
        let mut store = KeyStore::new(3);
        let ids: Vec<u32> = (0..4).map(|_| store.generate().unwrap().id).collect();
        assert!(!store.contains(ids[0]), "fourth generation evicts the first");
        for id in &ids[1..] {
            assert!(store.contains(*id));
        }
        assert_eq!(store.ids().collect::<Vec<_>>(), ids[1..].to_vec());
        assert_eq!(store.current_id(), Some(ids[3]));
    }

    #[test]
    fn fabricated_ids_are_invalid() {
        let mut store = KeyStore::new(3);
        let id = store.generate().unwrap().id;
        assert!(!store.contains(0));
        assert!(!store.contains(id.wrapping_add(1)));
        assert!(store.get(id.wrapping_sub(1)).is_none());
    }

    #[test]
    fn key_material_differs_between_generations() {
        let mut store = KeyStore::new(2);
        let first = store.generate().unwrap().clone();
        let second = store.generate().unwrap().clone();
        assert_ne!(first.id, second.id);
        assert_ne!(first.key, second.key);
        assert_ne!(first.iv, second.iv);
        assert_eq!(store.get(first.id).unwrap().key, first.key);
    }

    #[test]
    fn depth_of_one_keeps_only_current() {
        let mut store = KeyStore::new(0);
        assert_eq!(store.depth(), 1);
        let first = store.generate().unwrap().id;
        store.generate().unwrap();
        assert!(!store.contains(first));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn debug_hides_key_material() {
        let mut store = KeyStore::new(1);
        let rendered = format!("{:?}", store.generate().unwrap());
        assert!(!rendered.contains("key:"));
    }
}
