use async_trait::async_trait;
use ringleaf_index::BPlusTree;
use ringleaf_types::{Entry, Id, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use utils::persistence::Persistable;

/// The key range a node currently owns, behind a single-writer lock.
///
/// Every handler that touches the index serializes here; the tree itself is
/// not thread-safe. Mutations raise the shared write flag so the snapshot
/// task knows there is something new to flush. `clear` is teardown, not a
/// write, and leaves the flag alone.
#[derive(Debug)]
pub struct LocalStore {
    index: Mutex<BPlusTree<Id, Value>>,
    write_flag: Arc<AtomicBool>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        LocalStore {
            index: Mutex::new(BPlusTree::new()),
            write_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn write_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.write_flag)
    }

    fn set_write_flag(&self) {
        let _ = self
            .write_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub async fn insert(&self, key: Id, data: Value) {
        self.index.lock().await.insert(key, data);
        self.set_write_flag();
    }

    pub async fn get(&self, key: &Id) -> Option<Value> {
        self.index.lock().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &Id) -> bool {
        let removed = self.index.lock().await.delete(key);
        if removed {
            self.set_write_flag();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<Id> {
        self.index.lock().await.iter().map(|(k, _)| *k).collect()
    }

    pub async fn entries(&self) -> Vec<Entry> {
        self.index
            .lock()
            .await
            .iter()
            .map(|(k, v)| Entry::new(*k, v.clone()))
            .collect()
    }

    /// Removes and returns every entry whose key matches, in one critical
    /// section. Handoff uses this so no concurrent reader can see an entry
    /// on both sides.
    pub async fn take_where<F>(&self, should_move: F) -> Vec<Entry>
    where
        F: Fn(&Id) -> bool,
    {
        let mut index = self.index.lock().await;
        let moved: Vec<Entry> = index
            .iter()
            .filter(|(key, _)| should_move(key))
            .map(|(k, v)| Entry::new(*k, v.clone()))
            .collect();
        for entry in &moved {
            index.delete(&entry.key);
        }
        if !moved.is_empty() {
            self.set_write_flag();
        }
        moved
    }

    pub async fn clear(&self) {
        self.index.lock().await.clear();
    }
}

#[async_trait]
impl Persistable for LocalStore {
    async fn snapshot(&self) -> Vec<Entry> {
        self.entries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn insert_overwrites_and_counts_once() {
        let store = LocalStore::new();
        let key = Id::hash_of("X");
        store.insert(key, json!({"v": 1})).await;
        store.insert(key, json!({"v": 2})).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&key).await, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn mutations_raise_the_write_flag() {
        let store = LocalStore::new();
        let flag = store.write_flag();
        assert!(!flag.load(Ordering::SeqCst));
        store.insert(Id::hash_of("a"), json!(1)).await;
        assert!(flag.load(Ordering::SeqCst));
        flag.store(false, Ordering::SeqCst);
        assert!(!store.remove(&Id::hash_of("missing")).await);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(store.remove(&Id::hash_of("a")).await);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn take_where_moves_matching_entries_out() {
        let store = LocalStore::new();
        let keep = Id::hash_of("keep");
        let move_a = Id::hash_of("move a");
        let move_b = Id::hash_of("move b");
        for key in [keep, move_a, move_b] {
            store.insert(key, json!(key.to_hex())).await;
        }
        let moved = store.take_where(|k| *k != keep).await;
        assert_eq!(moved.len(), 2);
        assert_eq!(store.len().await, 1);
        assert!(store.get(&keep).await.is_some());
        assert!(store.get(&move_a).await.is_none());
    }

    #[tokio::test]
    async fn entries_come_back_in_key_order() {
        let store = LocalStore::new();
        for i in 0..50 {
            store.insert(Id::hash_of(&format!("t{i}")), json!(i)).await;
        }
        let entries = store.entries().await;
        assert_eq!(entries.len(), 50);
        for window in entries.windows(2) {
            assert!(window[0].key < window[1].key);
        }
    }
}
