//! Bounded cache of scored insights keyed by insight id.

use std::collections::{HashMap, VecDeque};

use crate::model::ScoredInsight;

/// Insertion-ordered cache; the oldest entry is evicted first and a
/// re-scored insight moves to the back.
#[derive(Debug)]
pub struct ScoreCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, ScoredInsight>,
}

impl ScoreCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Stores the result, returning the id evicted to make room, if any
    pub fn insert(&mut self, scored: ScoredInsight) -> Option<String> {
        let id = scored.insight.id.clone();

        if self.entries.insert(id.clone(), scored).is_some() {
            self.order.retain(|existing| existing != &id);
            self.order.push_back(id);
            return None;
        }

        self.order.push_back(id);
        if self.order.len() > self.capacity {
            let evicted = self.order.pop_front()?;
            self.entries.remove(&evicted);
            return Some(evicted);
        }
        None
    }

    pub fn get(&self, id: &str) -> Option<&ScoredInsight> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
