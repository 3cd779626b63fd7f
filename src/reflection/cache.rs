//! Cache Layer
//!
//! Memoizes the three expensive stages (full reflection, semantic check,
//! explanation) by content fingerprint. Entries never expire on their own;
//! they leave only through `clear` or LRU eviction once a stage cache is
//! at capacity.

use crate::reflection::engine::ReflectionVerdict;
use crate::reflection::semantic::SemanticCheck;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

/// Stable hex SHA-256 over the given parts. Each part is length-prefixed so
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// LRU map from fingerprint to a stage's output.
///
/// HashMap for storage, VecDeque for recency (front = most recent).
#[derive(Debug, Clone)]
pub struct StageCache<V> {
    data: HashMap<String, V>,
    access_order: VecDeque<String>,
    max_size: usize,
}

impl<V: Clone> StageCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            data: HashMap::new(),
            access_order: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    /// Cloned value for `key`, promoted to most recently used.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let value = self.data.get(key)?.clone();
        self.access_order.retain(|k| k != key);
        self.access_order.push_front(key.to_string());
        Some(value)
    }

    pub fn put(&mut self, key: String, value: V) {
        if self.data.contains_key(&key) {
            self.access_order.retain(|k| k != &key);
        } else if self.data.len() >= self.max_size {
            if let Some(lru_key) = self.access_order.pop_back() {
                self.data.remove(&lru_key);
            }
        }
        self.access_order.push_front(key.clone());
        self.data.insert(key, value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.access_order.clear();
    }
}

/// Entry counts per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub reflection: usize,
    pub semantic: usize,
    pub explanation: usize,
    pub column_values: usize,
    pub total: usize,
}

/// The per-stage caches owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    pub reflection: StageCache<ReflectionVerdict>,
    pub semantic: StageCache<SemanticCheck>,
    pub explanation: StageCache<String>,
}

impl CacheLayer {
    pub fn new(capacity: usize) -> Self {
        Self {
            reflection: StageCache::new(capacity),
            semantic: StageCache::new(capacity),
            explanation: StageCache::new(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.reflection.clear();
        self.semantic.clear();
        self.explanation.clear();
    }
}
