//! Sum tree over sampling weights.
//!
//! Stored as a flat array: node `i` has children `2i + 1` and `2i + 2`, the last
//! `capacity` nodes are leaves and leaf `capacity - 1 + slot` belongs to `slot`.
//! Every internal node holds the sum of its two children, so the root is the total
//! weight. Updates recompute the path to the root before returning.

use qtrader_core::IndexError;
use serde::{Deserialize, Serialize};

/// Fixed-capacity sum tree with ring insertion
#[derive(Debug, Clone)]
pub struct PriorityIndex {
    capacity: usize,
    nodes: Vec<f64>,
    cursor: usize,
    len: usize,
}

/// Serializable state of a [`PriorityIndex`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCheckpoint {
    pub capacity: usize,
    /// Weights of live slots, in slot order
    pub weights: Vec<f64>,
    pub cursor: usize,
}

impl PriorityIndex {
    pub fn new(capacity: usize) -> Result<Self, IndexError> {
        if capacity == 0 {
            return Err(IndexError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            nodes: vec![0.0; 2 * capacity - 1],
            cursor: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot the next insert writes to
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Sum of all live weights
    pub fn total_weight(&self) -> f64 {
        self.nodes[0]
    }

    pub fn weight(&self, slot: usize) -> Option<f64> {
        if slot < self.len {
            Some(self.nodes[self.leaf(slot)])
        } else {
            None
        }
    }

    /// Largest live weight, 0.0 when empty
    pub fn max_weight(&self) -> f64 {
        (0..self.len)
            .map(|slot| self.nodes[self.leaf(slot)])
            .fold(0.0, f64::max)
    }

    /// Write `weight` at the cursor and advance it, overwriting the oldest slot once full
    ///
    /// Returns the slot written.
    pub fn insert(&mut self, weight: f64) -> Result<usize, IndexError> {
        let slot = self.cursor;
        check_weight(slot, weight)?;
        self.set_leaf(slot, weight);
        self.cursor = (self.cursor + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
        Ok(slot)
    }

    /// Replace the weight of a live slot, returning the previous weight
    pub fn update(&mut self, slot: usize, weight: f64) -> Result<f64, IndexError> {
        if slot >= self.len {
            return Err(IndexError::SlotOutOfRange {
                slot,
                capacity: self.len,
            });
        }
        check_weight(slot, weight)?;
        Ok(self.set_leaf(slot, weight))
    }

    /// Slot whose cumulative-weight interval contains `r`
    ///
    /// `r` is clamped into `[0, total_weight())`. Only subtrees with positive weight are
    /// entered, so rounding at the boundary can never land on an empty slot.
    pub fn sample(&self, r: f64) -> Result<usize, IndexError> {
        let total = self.total_weight();
        if self.len == 0 || total <= 0.0 {
            return Err(IndexError::Empty);
        }

        let mut r = if r.is_finite() { r.clamp(0.0, total) } else { 0.0 };
        let mut idx = 0;
        while idx < self.capacity - 1 {
            let left = 2 * idx + 1;
            let right = left + 1;
            if r < self.nodes[left] || self.nodes[right] <= 0.0 {
                idx = left;
            } else {
                r -= self.nodes[left];
                idx = right;
            }
        }
        Ok(idx + 1 - self.capacity)
    }

    pub fn checkpoint(&self) -> IndexCheckpoint {
        IndexCheckpoint {
            capacity: self.capacity,
            weights: (0..self.len).map(|s| self.nodes[self.leaf(s)]).collect(),
            cursor: self.cursor,
        }
    }

    pub fn restore(checkpoint: &IndexCheckpoint) -> Result<Self, IndexError> {
        let mut index = Self::new(checkpoint.capacity)?;
        if checkpoint.weights.len() > checkpoint.capacity {
            return Err(IndexError::SlotOutOfRange {
                slot: checkpoint.weights.len() - 1,
                capacity: checkpoint.capacity,
            });
        }
        if checkpoint.cursor >= checkpoint.capacity {
            return Err(IndexError::SlotOutOfRange {
                slot: checkpoint.cursor,
                capacity: checkpoint.capacity,
            });
        }
        for (slot, &weight) in checkpoint.weights.iter().enumerate() {
            check_weight(slot, weight)?;
            index.set_leaf(slot, weight);
        }
        index.len = checkpoint.weights.len();
        index.cursor = checkpoint.cursor;
        Ok(index)
    }

    fn leaf(&self, slot: usize) -> usize {
        slot + self.capacity - 1
    }

    fn set_leaf(&mut self, slot: usize, weight: f64) -> f64 {
        let mut idx = self.leaf(slot);
        let old = self.nodes[idx];
        self.nodes[idx] = weight;
        while idx > 0 {
            idx = (idx - 1) / 2;
            self.nodes[idx] = self.nodes[2 * idx + 1] + self.nodes[2 * idx + 2];
        }
        old
    }
}

fn check_weight(slot: usize, weight: f64) -> Result<(), IndexError> {
    if weight.is_finite() && weight > 0.0 {
        Ok(())
    } else {
        Err(IndexError::InvalidWeight { slot, weight })
    }
}
