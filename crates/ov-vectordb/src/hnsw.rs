//! Approximate nearest-neighbour index: a hierarchical navigable
//! small-world graph.
//!
//! Level assignment follows the usual `floor(-ln(r) * mL)` draw with
//! `mL = 1/ln(M)`. Upper layers are descended greedily; the target
//! layer runs an ef-bounded beam search. Deletions unlink the node
//! eagerly, so searches never have to consult a tombstone set.

use crate::distance;
use crate::index::{Neighbors, VectorIndex};
use ov_core::error::{OvError, Result};
use parking_lot::RwLock;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Graph connectivity per layer (level 0 allows twice as many links).
const DEFAULT_M: usize = 16;
/// Beam width while building.
const DEFAULT_EF_CONSTRUCTION: usize = 200;
/// Minimum beam width while searching.
const DEFAULT_EF_SEARCH: usize = 50;

struct Node {
    vector: Vec<f32>,
    /// Neighbor lists, one per level from 0 up to the node's top level.
    links: Vec<Vec<u64>>,
}

#[derive(Default)]
struct HnswInner {
    nodes: HashMap<u64, Node>,
    entry: Option<u64>,
    max_level: usize,
}

/// HNSW graph index.
pub struct HnswIndex {
    dimension: usize,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    level_norm: f64,
    inner: RwLock<HnswInner>,
}

/// Max-heap entry ordered by similarity.
struct Candidate {
    score: f32,
    label: u64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.label == other.label
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.label.cmp(&other.label))
    }
}

impl HnswIndex {
    pub fn new(dimension: usize) -> Self {
        Self::with_params(dimension, DEFAULT_M, DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH)
    }

    pub fn with_params(dimension: usize, m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            dimension,
            m,
            ef_construction,
            ef_search,
            level_norm: 1.0 / (m as f64).ln(),
            inner: RwLock::new(HnswInner::default()),
        }
    }

    fn random_level(&self) -> usize {
        let r: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
        (-r.ln() * self.level_norm).floor() as usize
    }

    fn max_links(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn score(inner: &HnswInner, query: &[f32], label: u64) -> f32 {
        inner
            .nodes
            .get(&label)
            .map(|n| distance::dot(query, &n.vector))
            .unwrap_or(f32::MIN)
    }

    /// Greedy walk on one level: follow the best-improving neighbor.
    fn greedy_step(inner: &HnswInner, query: &[f32], start: u64, level: usize) -> u64 {
        let mut current = start;
        let mut best = Self::score(inner, query, current);
        loop {
            let Some(node) = inner.nodes.get(&current) else { return current };
            let Some(links) = node.links.get(level) else { return current };
            let mut improved = false;
            for &next in links {
                let s = Self::score(inner, query, next);
                if s > best {
                    best = s;
                    current = next;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// ef-bounded beam search on one level, best-first.
    fn beam_search(
        inner: &HnswInner,
        query: &[f32],
        start: u64,
        level: usize,
        ef: usize,
    ) -> Vec<(u64, f32)> {
        let mut visited: HashSet<u64> = HashSet::new();
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::new();
        // Results kept as a min-heap via Reverse ordering on score.
        let mut results: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();

        let start_score = Self::score(inner, query, start);
        visited.insert(start);
        frontier.push(Candidate { score: start_score, label: start });
        results.push(std::cmp::Reverse(Candidate { score: start_score, label: start }));

        while let Some(best) = frontier.pop() {
            let worst_kept = results.peek().map(|r| r.0.score).unwrap_or(f32::MIN);
            if results.len() >= ef && best.score < worst_kept {
                break;
            }
            let Some(node) = inner.nodes.get(&best.label) else { continue };
            let Some(links) = node.links.get(level) else { continue };
            for &next in links {
                if !visited.insert(next) {
                    continue;
                }
                let s = Self::score(inner, query, next);
                let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::MIN);
                if results.len() < ef || s > worst {
                    frontier.push(Candidate { score: s, label: next });
                    results.push(std::cmp::Reverse(Candidate { score: s, label: next }));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u64, f32)> = results
            .into_iter()
            .map(|r| (r.0.label, r.0.score))
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        out
    }

    fn link(inner: &mut HnswInner, a: u64, b: u64, level: usize, cap: usize) {
        if a == b {
            return;
        }
        let (anchor, own) = {
            let Some(node) = inner.nodes.get_mut(&a) else { return };
            if node.links.len() <= level {
                return;
            }
            if !node.links[level].contains(&b) {
                node.links[level].push(b);
            }
            if node.links[level].len() <= cap {
                return;
            }
            (node.links[level].clone(), node.vector.clone())
        };
        // Over capacity: keep the strongest links relative to this
        // node's own vector.
        let mut scored: Vec<(u64, f32)> = anchor
            .into_iter()
            .map(|l| {
                let s = inner
                    .nodes
                    .get(&l)
                    .map(|n| distance::dot(&own, &n.vector))
                    .unwrap_or(f32::MIN);
                (l, s)
            })
            .collect();
        scored.sort_by(|x, y| y.1.partial_cmp(&x.1).unwrap_or(Ordering::Equal));
        scored.truncate(cap);
        if let Some(node) = inner.nodes.get_mut(&a) {
            node.links[level] = scored.into_iter().map(|(l, _)| l).collect();
        }
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&self, label: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(OvError::invalid(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(OvError::invalid("vector contains non-finite values"));
        }
        let mut v = vector.to_vec();
        distance::normalize(&mut v);

        let mut inner = self.inner.write();

        // Replacing an existing label: unlink first, then reinsert.
        if inner.nodes.contains_key(&label) {
            drop(inner);
            self.remove(label)?;
            inner = self.inner.write();
        }

        let level = self.random_level();
        let node = Node {
            vector: v.clone(),
            links: vec![Vec::new(); level + 1],
        };
        inner.nodes.insert(label, node);

        let Some(entry) = inner.entry else {
            inner.entry = Some(label);
            inner.max_level = level;
            return Ok(());
        };

        let mut current = entry;
        let top = inner.max_level;
        for lev in ((level + 1)..=top).rev() {
            current = Self::greedy_step(&inner, &v, current, lev);
        }
        for lev in (0..=level.min(top)).rev() {
            let neighbors = Self::beam_search(&inner, &v, current, lev, self.ef_construction);
            current = neighbors.first().map(|(l, _)| *l).unwrap_or(current);
            let cap = self.max_links(lev);
            for &(other, _) in neighbors.iter().take(self.m) {
                Self::link(&mut inner, label, other, lev, cap);
                Self::link(&mut inner, other, label, lev, cap);
            }
        }

        if level > inner.max_level {
            inner.max_level = level;
            inner.entry = Some(label);
        }
        Ok(())
    }

    fn remove(&self, label: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.remove(&label) else {
            return Ok(());
        };
        // Strip incoming links from each former neighbor.
        let neighbors: HashSet<u64> = node.links.iter().flatten().copied().collect();
        for n in neighbors {
            if let Some(other) = inner.nodes.get_mut(&n) {
                for links in other.links.iter_mut() {
                    links.retain(|&l| l != label);
                }
            }
        }
        if inner.entry == Some(label) {
            // Promote the node with the tallest link stack.
            let next = inner
                .nodes
                .iter()
                .max_by_key(|(_, n)| n.links.len())
                .map(|(&l, n)| (l, n.links.len().saturating_sub(1)));
            match next {
                Some((l, lvl)) => {
                    inner.entry = Some(l);
                    inner.max_level = lvl;
                }
                None => {
                    inner.entry = None;
                    inner.max_level = 0;
                }
            }
        }
        Ok(())
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Neighbors> {
        if query.len() != self.dimension {
            return Err(OvError::invalid(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        let inner = self.inner.read();
        let Some(entry) = inner.entry else {
            return Ok(Vec::new());
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut q = query.to_vec();
        distance::normalize(&mut q);

        let mut current = entry;
        for lev in (1..=inner.max_level).rev() {
            current = Self::greedy_step(&inner, &q, current, lev);
        }
        let ef = self.ef_search.max(top_k);
        let mut hits = Self::beam_search(&inner, &q, current, 0, ef);
        hits.truncate(top_k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn export(&self) -> Vec<(u64, Vec<f32>)> {
        let inner = self.inner.read();
        inner.nodes.iter().map(|(&l, n)| (l, n.vector.clone())).collect()
    }
}
