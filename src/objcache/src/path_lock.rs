//! Hierarchical path lock.
//!
//! Locking a path-key read-locks every ancestor prefix in root-to-leaf
//! order and write-locks the leaf. Operations on disjoint subtrees run in
//! parallel; operations on the same leaf serialize; an operation deep in
//! a subtree blocks a rename or remove of any of its ancestors.
//!
//! Lock entries are created on demand and dropped again once the last
//! holder releases them, so the map only ever contains prefixes that are
//! actively locked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::path::partial_paths;

struct LockEntry {
    lock: Arc<RwLock<()>>,
    refcnt: usize,
}

#[derive(Default)]
pub struct PathLockMap {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl PathLockMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lock `path_key`: read locks on all ancestors, write lock on the
    /// leaf. The guard releases leaf-to-root on drop.
    pub async fn lock(self: &Arc<Self>, path_key: &str) -> PathLockGuard {
        let prefixes = partial_paths(path_key);
        let mut reads = Vec::with_capacity(prefixes.len().saturating_sub(1));
        let mut write = None;

        for (i, prefix) in prefixes.iter().enumerate() {
            let lock = {
                let mut entries = self.entries.lock().unwrap();
                let entry = entries.entry(prefix.clone()).or_insert_with(|| LockEntry {
                    lock: Arc::new(RwLock::new(())),
                    refcnt: 0,
                });
                entry.refcnt += 1;
                entry.lock.clone()
            };
            if i + 1 == prefixes.len() {
                write = Some(lock.write_owned().await);
            } else {
                reads.push(lock.read_owned().await);
            }
        }

        PathLockGuard {
            map: self.clone(),
            prefixes,
            reads,
            write,
        }
    }
}

pub struct PathLockGuard {
    map: Arc<PathLockMap>,
    prefixes: Vec<String>,
    reads: Vec<OwnedRwLockReadGuard<()>>,
    write: Option<OwnedRwLockWriteGuard<()>>,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        // release leaf first, then ancestors in reverse order
        self.write.take();
        while self.reads.pop().is_some() {}

        let mut entries = self.map.entries.lock().unwrap();
        for prefix in self.prefixes.drain(..).rev() {
            if let Some(entry) = entries.get_mut(&prefix) {
                entry.refcnt -= 1;
                if entry.refcnt == 0 {
                    entries.remove(&prefix);
                }
            }
        }
    }
}
