// src/connector/cache.rs

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Ограниченный кэш недавно отправленных correlation id.
/// Вытесняет самые старые записи по ёмкости и по TTL.
#[derive(Debug)]
pub struct RecentIds<V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Entry<V>>,
    order: VecDeque<(String, Instant, u64)>, // порядок вставки
    seq: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    seq: u64,
}

impl<V: Clone> RecentIds<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::new(),
            seq: 0,
        }
    }

    pub fn get(&mut self, id: &str) -> Option<V> {
        self.purge_expired(Instant::now());
        self.entries.get(id).map(|e| e.value.clone())
    }

    pub fn insert(&mut self, id: String, value: V) {
        let now = Instant::now();
        self.purge_expired(now);
        self.seq += 1;
        self.entries.insert(id.clone(), Entry { value, seq: self.seq });
        self.order.push_back((id, now, self.seq));
        while self.entries.len() > self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some((_, inserted, _)) = self.order.front() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    // Удаляет запись из map, только если она не была перезаписана позже
    fn pop_oldest(&mut self) -> bool {
        let Some((id, _, seq)) = self.order.pop_front() else {
            return false;
        };
        if matches!(self.entries.get(&id), Some(e) if e.seq == seq) {
            self.entries.remove(&id);
        }
        true
    }
}
