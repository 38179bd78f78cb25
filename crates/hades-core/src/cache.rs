use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    sync::{PoisonError, RwLock},
};

/// Maximum number of entries in a reconstructed pid tree.
pub const MAX_PID_TREE_DEPTH: usize = 32;

/// Thread safe key value store shared by the collectors.
///
/// Entries are never evicted. Concurrent writers to the same key race and the
/// last one wins.
#[derive(Debug)]
pub struct Cache<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches warmed by every observed process.
#[derive(Debug, Default)]
pub struct ProcessCaches {
    /// pid -> parent pid
    pub parents: Cache<u32, u32>,
    /// pid -> executable path
    pub images: Cache<u32, String>,
    /// uid -> username
    pub usernames: Cache<u32, String>,
}

impl ProcessCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk the parents cache upward from `pid`.
    ///
    /// The walk stops at the first pid missing from the cache, at pid 0, at a
    /// pid already visited or after [`MAX_PID_TREE_DEPTH`] entries.
    pub fn pid_tree(&self, pid: u32) -> Vec<u32> {
        let parents = self.parents.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut tree = vec![pid];
        let mut visited = HashSet::from([pid]);
        let mut current = pid;
        while tree.len() < MAX_PID_TREE_DEPTH {
            match parents.get(&current) {
                Some(&ppid) if ppid != 0 && visited.insert(ppid) => {
                    tree.push(ppid);
                    current = ppid;
                }
                _ => break,
            }
        }
        tree
    }
}
