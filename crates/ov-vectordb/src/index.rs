//! Vector index backends.
//!
//! Indexes speak internal `u64` labels; the URI registry lives one
//! layer up in [`crate::store`]. All vectors are L2-normalised on
//! insert so search is a dot-product scan or graph walk.

use crate::distance;
use ov_core::error::{OvError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Label + raw similarity pairs, best first.
pub type Neighbors = Vec<(u64, f32)>;

/// A nearest-neighbour index over dense vectors.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector for a label.
    fn insert(&self, label: u64, vector: &[f32]) -> Result<()>;

    /// Remove a label; absent labels are a no-op.
    fn remove(&self, label: u64) -> Result<()>;

    /// Top-k labels by similarity, best first. Ties and ordering among
    /// equal scores are resolved by the caller.
    fn search(&self, query: &[f32], top_k: usize) -> Result<Neighbors>;

    /// Number of stored vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize;

    /// All `(label, vector)` pairs, for persistence.
    fn export(&self) -> Vec<(u64, Vec<f32>)>;
}

fn check_dimension(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(OvError::invalid(format!(
            "vector dimension mismatch: expected {expected}, got {got}"
        )));
    }
    Ok(())
}

fn prepare(dimension: usize, vector: &[f32]) -> Result<Vec<f32>> {
    check_dimension(dimension, vector.len())?;
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(OvError::invalid("vector contains non-finite values"));
    }
    let mut v = vector.to_vec();
    distance::normalize(&mut v);
    Ok(v)
}

// ---------------------------------------------------------------------
// Flat index
// ---------------------------------------------------------------------

#[derive(Default)]
struct FlatInner {
    labels: Vec<u64>,
    vectors: Vec<Vec<f32>>,
    slot_of: HashMap<u64, usize>,
}

/// Exact brute-force index: scans every vector per query.
pub struct FlatIndex {
    dimension: usize,
    inner: RwLock<FlatInner>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(FlatInner::default()),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&self, label: u64, vector: &[f32]) -> Result<()> {
        let v = prepare(self.dimension, vector)?;
        let mut inner = self.inner.write();
        if let Some(&slot) = inner.slot_of.get(&label) {
            inner.vectors[slot] = v;
        } else {
            let slot = inner.labels.len();
            inner.labels.push(label);
            inner.vectors.push(v);
            inner.slot_of.insert(label, slot);
        }
        Ok(())
    }

    fn remove(&self, label: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slot_of.remove(&label) {
            let last = inner.labels.len() - 1;
            if slot != last {
                let moved = inner.labels[last];
                inner.labels.swap(slot, last);
                inner.vectors.swap(slot, last);
                inner.slot_of.insert(moved, slot);
            }
            inner.labels.pop();
            inner.vectors.pop();
        }
        Ok(())
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Neighbors> {
        check_dimension(self.dimension, query.len())?;
        let inner = self.inner.read();
        if top_k == 0 || inner.labels.is_empty() {
            return Ok(Vec::new());
        }
        let mut q = query.to_vec();
        distance::normalize(&mut q);
        let mut scored: Neighbors = inner
            .labels
            .iter()
            .zip(inner.vectors.iter())
            .map(|(&label, v)| (label, distance::dot(&q, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.inner.read().labels.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn export(&self) -> Vec<(u64, Vec<f32>)> {
        let inner = self.inner.read();
        inner
            .labels
            .iter()
            .zip(inner.vectors.iter())
            .map(|(&l, v)| (l, v.clone()))
            .collect()
    }
}
