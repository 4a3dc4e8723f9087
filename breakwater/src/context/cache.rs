use crate::keys::CommandKey;
use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

type Slot = Box<dyn Any + Send + Sync>;

/// Per-request response cache: one slot per (command, cache key), holding a
/// typed pending-or-complete future handle. Insertion order is irrelevant;
/// the whole map is discarded on context shutdown.
#[derive(Debug, Default)]
pub struct RequestCache {
    entries: RwLock<HashMap<(CommandKey, String), Slot>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<V>(&self, command: &CommandKey, cache_key: &str) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let slot = entries.get(&(command.clone(), cache_key.to_string()))?;
        match slot.downcast_ref::<V>() {
            Some(value) => Some(value.clone()),
            None => {
                warn!(
                    target: "breakwater::context",
                    command = %command,
                    cache_key,
                    "cached value has a different type than requested"
                );
                None
            }
        }
    }

    /// Atomically insert and return `None`, or return the existing value if
    /// another caller won the slot first.
    pub fn put_if_absent<V>(&self, command: &CommandKey, cache_key: &str, value: V) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.entry((command.clone(), cache_key.to_string())) {
            std::collections::hash_map::Entry::Occupied(occupied) => {
                match occupied.get().downcast_ref::<V>() {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        warn!(
                            target: "breakwater::context",
                            command = %command,
                            cache_key,
                            "replacing cached value of a different type"
                        );
                        *occupied.into_mut() = Box::new(value);
                        None
                    }
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Box::new(value));
                None
            }
        }
    }

    pub fn clear(&self, command: &CommandKey, cache_key: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(command.clone(), cache_key.to_string()));
    }

    pub fn clear_all(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_if_absent_keeps_the_first_value() {
        let cache = RequestCache::new();
        let key = CommandKey::new("CacheCmd");
        assert!(cache.put_if_absent(&key, "a", 1u32).is_none());
        assert_eq!(cache.put_if_absent(&key, "a", 2u32), Some(1));
        assert_eq!(cache.get::<u32>(&key, "a"), Some(1));
    }

    #[test]
    fn keys_are_scoped_per_command() {
        let cache = RequestCache::new();
        cache.put_if_absent(&CommandKey::new("A"), "k", 1u32);
        assert_eq!(cache.get::<u32>(&CommandKey::new("B"), "k"), None);
    }

    #[test]
    fn clear_removes_a_single_slot() {
        let cache = RequestCache::new();
        let key = CommandKey::new("ClearCmd");
        cache.put_if_absent(&key, "a", 1u32);
        cache.put_if_absent(&key, "b", 2u32);
        cache.clear(&key, "a");
        assert_eq!(cache.get::<u32>(&key, "a"), None);
        assert_eq!(cache.get::<u32>(&key, "b"), Some(2));
    }

    #[test]
    fn clear_all_empties_the_cache() {
        let cache = RequestCache::new();
        cache.put_if_absent(&CommandKey::new("X"), "k", 1u32);
        cache.clear_all();
        assert!(cache.is_empty());
    }
}
