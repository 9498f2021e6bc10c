//! Negative path cache: path-keys recently observed to be absent on the
//! remote, so `stat` can short-circuit to not-found without a round trip.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

struct NegEntry {
    path_key: String,
    atime: SystemTime,
}

/// Bounded LRU keyed by path-key. Ordering uses monotonically increasing
/// sequence numbers: the smallest live sequence is the LRU head.
pub struct NegPathCache {
    map: HashMap<String, u64>,
    order: BTreeMap<u64, NegEntry>,
    next_seq: u64,
    max_count: usize,
    timeout: Duration,
}

impl NegPathCache {
    pub fn new(max_count: usize, timeout: Duration) -> Self {
        Self {
            map: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            max_count,
            timeout,
        }
    }

    /// True iff `path_key` has a live negative entry. An expired entry is
    /// removed on observation.
    pub fn is_neg(&mut self, path_key: &str, now: SystemTime) -> bool {
        let seq = match self.map.get(path_key) {
            Some(&seq) => seq,
            None => return false,
        };
        let expired = self
            .order
            .get(&seq)
            .map(|e| e.atime + self.timeout <= now)
            .unwrap_or(true);
        if expired {
            self.order.remove(&seq);
            self.map.remove(path_key);
            return false;
        }
        true
    }

    /// Insert or refresh a negative entry, evicting the LRU head when at
    /// capacity.
    pub fn add(&mut self, path_key: &str, now: SystemTime) {
        if let Some(seq) = self.map.remove(path_key) {
            self.order.remove(&seq);
        } else if self.map.len() >= self.max_count {
            if let Some((&seq, _)) = self.order.iter().next() {
                if let Some(entry) = self.order.remove(&seq) {
                    self.map.remove(&entry.path_key);
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.map.insert(path_key.to_string(), seq);
        self.order.insert(
            seq,
            NegEntry {
                path_key: path_key.to_string(),
                atime: now,
            },
        );
    }

    pub fn remove(&mut self, path_key: &str) {
        if let Some(seq) = self.map.remove(path_key) {
            self.order.remove(&seq);
        }
    }

    /// Throw away every entry. Used after a rename moves a subtree to a
    /// new key; scanning for entries under the new prefix is not worth it.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
