//! Predicate → map-shard routing.
//!
//! First-come-first-assigned round-robin over `[0, M)`. Reads take the
//! shared lock; a miss upgrades to the exclusive lock with a double-check so
//! an assignment, once made, never changes.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

pub struct ShardMap {
    num_shards: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    pred_to_shard: FxHashMap<String, usize>,
    next_shard: usize,
}

impl ShardMap {
    pub fn new(num_shards: usize) -> Self {
        Self {
            num_shards,
            inner: RwLock::new(Inner {
                pred_to_shard: FxHashMap::default(),
                next_shard: 0,
            }),
        }
    }

    /// Map-shard index for `predicate`, assigning the next round-robin slot
    /// on first sight.
    pub fn shard_for(&self, predicate: &str) -> usize {
        if let Some(&shard) = self.inner.read().pred_to_shard.get(predicate) {
            return shard;
        }

        let mut inner = self.inner.write();
        if let Some(&shard) = inner.pred_to_shard.get(predicate) {
            return shard;
        }
        let shard = inner.next_shard;
        inner.pred_to_shard.insert(predicate.to_string(), shard);
        inner.next_shard = (inner.next_shard + 1) % self.num_shards;
        shard
    }

    pub fn has(&self, predicate: &str) -> bool {
        self.inner.read().pred_to_shard.contains_key(predicate)
    }

    /// Every assignment made so far, sorted by predicate.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let mut pairs: Vec<(String, usize)> = self
            .inner
            .read()
            .pred_to_shard
            .iter()
            .map(|(p, &s)| (p.clone(), s))
            .collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_round_robin_assignment() {
        let map = ShardMap::new(2);
        assert_eq!(map.shard_for("<a>"), 0);
        assert_eq!(map.shard_for("<b>"), 1);
        assert_eq!(map.shard_for("<c>"), 0);
        assert!(map.has("<a>"));
        assert!(!map.has("<d>"));
    }

    #[test]
    fn test_assignment_is_stable() {
        let map = ShardMap::new(3);
        let first = map.shard_for("<p>");
        for _ in 0..100 {
            assert_eq!(map.shard_for("<p>"), first);
        }
    }

    #[test]
    fn test_stable_under_concurrency() {
        let map = Arc::new(ShardMap::new(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                (0..1000)
                    .map(|i| map.shard_for(&format!("<p{}>", i % 16)))
                    .collect::<Vec<_>>()
            }));
        }
        let results: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Every thread must observe the same shard for the same predicate.
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
    }
}
