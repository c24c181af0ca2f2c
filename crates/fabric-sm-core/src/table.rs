//! Keyed entity container that never creates entries implicitly.
//!
//! Every entity table in the subnet is an [`EntityTable`]. Lookups return
//! `Option`, and insertion is always an explicit call, so a stray lookup for
//! a GUID that was never discovered cannot materialize a default entity.

use std::collections::HashMap;
use std::hash::Hash;

/// A keyed container with explicit insert/remove and no auto-vivification.
///
/// # Example
///
/// ```
/// use fabric_sm_core::EntityTable;
///
/// let mut table: EntityTable<u64, &str> = EntityTable::new();
/// assert!(table.get(&1).is_none());
/// assert!(table.is_empty());
///
/// table.insert(1, "sw-1");
/// assert_eq!(table.get(&1), Some(&"sw-1"));
/// ```
#[derive(Debug, Clone)]
pub struct EntityTable<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> EntityTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the entry for `key`. **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns the entry for `key` mutably. **This never creates entries.**
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Inserts an entry, returning the previous one if present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.inner.values_mut()
    }
}

impl<K, V> EntityTable<K, V>
where
    K: Eq + Hash + Ord + Clone,
{
    /// Keys in ascending order, for deterministic walks.
    pub fn sorted_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.inner.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl<K, V> Default for EntityTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for EntityTable<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_never_creates() {
        let mut table: EntityTable<u64, u32> = EntityTable::new();
        assert!(table.get(&7).is_none());
        assert!(table.get_mut(&7).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_insert_replace_remove() {
        let mut table: EntityTable<u64, u32> = EntityTable::new();
        assert_eq!(table.insert(1, 10), None);
        assert_eq!(table.insert(1, 11), Some(10));
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(&1), Some(11));
        assert_eq!(table.remove(&1), None);
    }

    #[test]
    fn test_sorted_keys() {
        let table: EntityTable<u64, ()> = [(3, ()), (1, ()), (2, ())].into_iter().collect();
        assert_eq!(table.sorted_keys(), vec![1, 2, 3]);
    }
}
