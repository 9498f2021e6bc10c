//! The two LRU lists driving upload and eviction.
//!
//! An ino sits in the dirty (rw) list when its local content has mutated
//! since the last upload, in the clean (ro) list when it is an eviction
//! candidate, and in at most one of the two at any moment.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

pub struct LruEntry {
    pub ino: u64,
    pub atime: SystemTime,
}

/// One ordered list. Smallest live sequence number is the head (least
/// recently touched).
#[derive(Default)]
struct LruList {
    map: HashMap<u64, u64>,
    order: BTreeMap<u64, LruEntry>,
    next_seq: u64,
}

impl LruList {
    fn contains(&self, ino: u64) -> bool {
        self.map.contains_key(&ino)
    }

    fn touch(&mut self, ino: u64, atime: SystemTime) {
        if let Some(seq) = self.map.remove(&ino) {
            self.order.remove(&seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.map.insert(ino, seq);
        self.order.insert(seq, LruEntry { ino, atime });
    }

    fn remove(&mut self, ino: u64) -> bool {
        match self.map.remove(&ino) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn head(&self) -> Option<&LruEntry> {
        self.order.values().next()
    }

    fn pop_head(&mut self) -> Option<LruEntry> {
        let (&seq, _) = self.order.iter().next()?;
        let entry = self.order.remove(&seq)?;
        self.map.remove(&entry.ino);
        Some(entry)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

#[derive(Default)]
pub struct LruQueues {
    rw: LruList,
    ro: LruList,
}

impl LruQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `ino` to the tail of the indicated list. A dirty ino is never
    /// silently downgraded: touching it as clean while it sits in the
    /// dirty list is a no-op. Touching as dirty transfers a clean entry.
    pub fn touch(&mut self, ino: u64, rw: bool, now: SystemTime) {
        let (this, that) = if rw {
            (&mut self.rw, &mut self.ro)
        } else {
            (&mut self.ro, &mut self.rw)
        };
        if !this.contains(ino) && that.contains(ino) {
            if !rw {
                // upload candidate; must not become evictable
                return;
            }
            that.remove(ino);
        }
        this.touch(ino, now);
    }

    /// Seed an entry with an explicit atime (bootstrap).
    pub fn seed(&mut self, ino: u64, rw: bool, atime: SystemTime) {
        self.touch(ino, rw, atime);
    }

    /// Pop the head of the indicated list if it is due: always when
    /// `force`, otherwise only when its atime is older than `now - delay`.
    pub fn take_due_head(
        &mut self,
        rw: bool,
        force: bool,
        delay: Duration,
        now: SystemTime,
    ) -> Option<u64> {
        let list = if rw { &mut self.rw } else { &mut self.ro };
        let head = list.head()?;
        if !force && head.atime + delay >= now {
            return None;
        }
        list.pop_head().map(|e| e.ino)
    }

    pub fn rw_contains(&self, ino: u64) -> bool {
        self.rw.contains(ino)
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.rw.contains(ino) || self.ro.contains(ino)
    }

    pub fn rw_len(&self) -> usize {
        self.rw.len()
    }

    pub fn ro_len(&self) -> usize {
        self.ro.len()
    }
}
