//! Index-based LRU list
//!
//! Entries live in a slot vector linked by indices, with a free list for
//! reuse and a hash index from key to slot. Both the route lookup cache and
//! the response cache shards are built on this.

use std::collections::HashMap;
use std::hash::Hash;

struct Slot<K, V> {
    entry: Option<(K, V)>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Recency-ordered map. The head is the most recently used entry.
pub struct LruList<K, V> {
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> LruList<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up without changing recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.slots[idx].entry.as_ref().map(|(_, v)| v)
    }

    /// Look up and promote to most recently used
    pub fn touch(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
        self.slots[idx].entry.as_mut().map(|(_, v)| v)
    }

    /// Insert at the head, returning the previous value for the key if any
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            let old = self.slots[idx]
                .entry
                .replace((key, value))
                .map(|(_, v)| v);
            if self.head != Some(idx) {
                self.unlink(idx);
                self.push_front(idx);
            }
            return old;
        }

        let slot = Slot {
            entry: Some((key.clone(), value)),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.release(idx).map(|(_, v)| v)
    }

    /// Remove the least recently used entry
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        let (key, value) = self.release(idx)?;
        self.index.remove(&key);
        Some((key, value))
    }

    /// The least recently used entry, without changing recency
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        let idx = self.tail?;
        self.slots[idx].entry.as_ref().map(|(k, v)| (k, v))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    /// Entries in slot order (not recency order)
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|(k, v)| (k, v)))
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<&K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            if let Some((k, _)) = self.slots[idx].entry.as_ref() {
                keys.push(k);
            }
            cursor = self.slots[idx].next;
        }
        keys
    }

    fn release(&mut self, idx: usize) -> Option<(K, V)> {
        self.unlink(idx);
        let entry = self.slots[idx].entry.take();
        self.free.push(idx);
        entry
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

impl<K: Eq + Hash + Clone, V> Default for LruList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
