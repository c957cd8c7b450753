//! Bounded insert-order cache. Eviction is strictly FIFO by first insertion:
//! updating an existing key refreshes its value and timestamp but keeps its
//! place in the eviction queue.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct Slot<T> {
    value: T,
    stored_at: Instant,
}

pub struct FifoCache<T> {
    entries: HashMap<String, Slot<T>>,
    order: VecDeque<String>,
    max_size: usize,
    ttl: Duration,
}

impl<T: Clone> FifoCache<T> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(max_size.min(1024)),
            order: VecDeque::new(),
            max_size,
            ttl,
        }
    }

    /// Fetch a live entry, dropping it if its TTL has lapsed.
    pub fn get(&mut self, key: &str) -> Option<T> {
        match self.entries.get(key) {
            Some(slot) if slot.stored_at.elapsed() < self.ttl => Some(slot.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                self.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: String, value: T) {
        if let Some(slot) = self.entries.get_mut(&key) {
            // Refresh in place; eviction position is unchanged.
            slot.value = value;
            slot.stored_at = Instant::now();
            return;
        }
        while self.entries.len() >= self.max_size {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
