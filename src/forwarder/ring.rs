//! Key-to-node placement for a cluster's backend pool.
//!
//! Two distributions: a ketama consistent ring with weighted virtual
//! points, and plain modula. Both operate over the subset of nodes
//! currently alive, so ejecting a node only moves the keys it owned.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::config::{HashDistribution, HashMethod};
use crate::utils::crc16;

/// Virtual points per unit of node weight on the ketama ring
const POINTS_PER_WEIGHT: usize = 160;

pub fn hash_key(method: HashMethod, key: &[u8]) -> u64 {
    match method {
        HashMethod::Fnv1a64 => {
            let mut hasher = FnvHasher::default();
            hasher.write(key);
            hasher.finish()
        }
        HashMethod::Crc16 => crc16(key) as u64,
    }
}

/// Node selector over a weighted server set
pub struct Ring {
    method: HashMethod,
    distribution: HashDistribution,
    weights: Vec<usize>,
    labels: Vec<String>,
    alive: Vec<bool>,
    /// ketama points over alive nodes, sorted by hash
    points: Vec<(u64, usize)>,
}

impl Ring {
    /// Build a ring over `(label, weight)` node entries. Index order is
    /// preserved; selection returns indexes into this slice.
    pub fn new(
        method: HashMethod,
        distribution: HashDistribution,
        nodes: &[(String, usize)],
    ) -> Ring {
        let mut ring = Ring {
            method,
            distribution,
            weights: nodes.iter().map(|(_, weight)| *weight).collect(),
            labels: nodes.iter().map(|(label, _)| label.clone()).collect(),
            alive: vec![true; nodes.len()],
            points: Vec::new(),
        };
        ring.rebuild();
        ring
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_alive(&self, index: usize) -> bool {
        self.alive[index]
    }

    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|alive| **alive).count()
    }

    /// Take a node out of rotation. Idempotent.
    pub fn eject(&mut self, index: usize) {
        if self.alive[index] {
            self.alive[index] = false;
            self.rebuild();
        }
    }

    /// Put an ejected node back into rotation. Idempotent.
    pub fn restore(&mut self, index: usize) {
        if !self.alive[index] {
            self.alive[index] = true;
            self.rebuild();
        }
    }

    /// Pick the node index for a routing key; `None` when every node is
    /// ejected
    pub fn select(&self, key: &[u8]) -> Option<usize> {
        let hash = hash_key(self.method, key);
        match self.distribution {
            HashDistribution::Ketama => {
                if self.points.is_empty() {
                    return None;
                }
                let position = self
                    .points
                    .partition_point(|(point, _)| *point < hash);
                let (_, index) = self.points[position % self.points.len()];
                Some(index)
            }
            HashDistribution::Modula => {
                let alive: Vec<usize> = (0..self.labels.len())
                    .filter(|index| self.alive[*index])
                    .collect();
                if alive.is_empty() {
                    return None;
                }
                Some(alive[(hash % alive.len() as u64) as usize])
            }
        }
    }

    fn rebuild(&mut self) {
        self.points.clear();
        if self.distribution != HashDistribution::Ketama {
            return;
        }
        for index in 0..self.labels.len() {
            if !self.alive[index] {
                continue;
            }
            for point in 0..POINTS_PER_WEIGHT * self.weights[index] {
                let label = format!("{}-{}", self.labels[index], point);
                self.points.push((hash_key(self.method, label.as_bytes()), index));
            }
        }
        self.points.sort_unstable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(count: usize) -> Vec<(String, usize)> {
        (0..count)
            .map(|i| (format!("10.0.0.{i}:6379"), 1))
            .collect()
    }

    #[test]
    fn test_hash_key_methods_disagree() {
        assert_ne!(
            hash_key(HashMethod::Fnv1a64, b"foo"),
            hash_key(HashMethod::Crc16, b"foo")
        );
        assert_eq!(hash_key(HashMethod::Crc16, b"foo"), 44950);
    }

    #[test]
    fn test_select_is_deterministic() {
        let ring = Ring::new(HashMethod::Fnv1a64, HashDistribution::Ketama, &nodes(5));
        for key in [b"alpha".as_slice(), b"beta", b"a-much-longer-key"] {
            assert_eq!(ring.select(key), ring.select(key));
        }
    }

    #[test]
    fn test_select_spreads_keys() {
        let ring = Ring::new(HashMethod::Fnv1a64, HashDistribution::Ketama, &nodes(4));
        let mut hits = vec![0usize; 4];
        for i in 0..1000 {
            let key = format!("key-{i}");
            hits[ring.select(key.as_bytes()).unwrap()] += 1;
        }
        // every node takes a meaningful share of 1000 keys
        for count in hits {
            assert!(count > 100, "unbalanced ring: {count}");
        }
    }

    #[test]
    fn test_eject_only_moves_ejected_nodes_keys() {
        let mut ring = Ring::new(HashMethod::Fnv1a64, HashDistribution::Ketama, &nodes(4));
        let keys: Vec<String> = (0..500).map(|i| format!("key-{i}")).collect();
        let before: Vec<usize> = keys
            .iter()
            .map(|k| ring.select(k.as_bytes()).unwrap())
            .collect();

        ring.eject(2);
        for (key, owner) in keys.iter().zip(&before) {
            let now = ring.select(key.as_bytes()).unwrap();
            if *owner != 2 {
                assert_eq!(now, *owner, "key {key} moved off a live node");
            } else {
                assert_ne!(now, 2);
            }
        }

        ring.restore(2);
        let after: Vec<usize> = keys
            .iter()
            .map(|k| ring.select(k.as_bytes()).unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_all_ejected_selects_none() {
        let mut ring = Ring::new(HashMethod::Fnv1a64, HashDistribution::Modula, &nodes(2));
        ring.eject(0);
        ring.eject(1);
        assert_eq!(ring.select(b"foo"), None);
        assert_eq!(ring.alive_count(), 0);

        ring.restore(0);
        assert_eq!(ring.select(b"foo"), Some(0));
    }

    #[test]
    fn test_modula_uses_alive_subset() {
        let mut ring = Ring::new(HashMethod::Fnv1a64, HashDistribution::Modula, &nodes(3));
        ring.eject(1);
        for i in 0..100 {
            let key = format!("key-{i}");
            let selected = ring.select(key.as_bytes()).unwrap();
            assert_ne!(selected, 1);
        }
    }

    #[test]
    fn test_weighted_nodes_take_more_points() {
        let nodes = vec![
            ("10.0.0.1:6379".to_string(), 1),
            ("10.0.0.2:6379".to_string(), 3),
        ];
        let ring = Ring::new(HashMethod::Fnv1a64, HashDistribution::Ketama, &nodes);
        let mut hits = [0usize; 2];
        for i in 0..2000 {
            let key = format!("key-{i}");
            hits[ring.select(key.as_bytes()).unwrap()] += 1;
        }
        assert!(hits[1] > hits[0]);
    }
}
