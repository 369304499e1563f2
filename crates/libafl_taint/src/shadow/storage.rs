//! # storage
//! Backing stores of a single shadow region.
//!
//! Physical memory is huge and sparsely tainted, so it lives in a hash map.
//! Register-like regions are small and fixed-size, so they are flat vectors.
use core::fmt::Debug;

use hashbrown::HashMap;

use crate::labels::LabelSet;

static EMPTY: LabelSet = LabelSet::new();

/// Storage of the label-sets of one shadow region, indexed by byte offset.
pub trait ShadowStorage: Debug {
    /// Number of addressable bytes, `None` if unbounded.
    fn capacity(&self) -> Option<u64>;

    /// The label-set at `offset`; the empty set if nothing is stored there.
    fn get(&self, offset: u64) -> &LabelSet;

    /// Replaces the label-set at `offset`. The caller checks the bounds.
    fn set(&mut self, offset: u64, labels: LabelSet);

    /// Untaints every byte.
    fn clear(&mut self);

    /// Number of bytes currently carrying a non-empty label-set.
    fn tainted_bytes(&self) -> usize;

    /// Whether `len` bytes starting at `offset` fit this storage.
    fn fits(&self, offset: u64, len: u64) -> bool {
        match (self.capacity(), offset.checked_add(len)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(cap), Some(end)) => end <= cap,
        }
    }
}

/// Hash-map backed storage, used for physical memory.
#[derive(Debug, Default)]
pub struct SparseShadow {
    map: HashMap<u64, LabelSet>,
}

impl SparseShadow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShadowStorage for SparseShadow {
    fn capacity(&self) -> Option<u64> {
        None
    }

    fn get(&self, offset: u64) -> &LabelSet {
        self.map.get(&offset).unwrap_or(&EMPTY)
    }

    fn set(&mut self, offset: u64, labels: LabelSet) {
        if labels.is_empty() {
            self.map.remove(&offset);
        } else {
            self.map.insert(offset, labels);
        }
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn tainted_bytes(&self) -> usize {
        self.map.len()
    }
}

/// Fixed-size storage, used for the register-like regions.
#[derive(Debug)]
pub struct FlatShadow {
    bytes: Vec<LabelSet>,
}

impl FlatShadow {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![LabelSet::new(); size],
        }
    }
}

impl ShadowStorage for FlatShadow {
    fn capacity(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }

    fn get(&self, offset: u64) -> &LabelSet {
        usize::try_from(offset)
            .ok()
            .and_then(|idx| self.bytes.get(idx))
            .unwrap_or(&EMPTY)
    }

    fn set(&mut self, offset: u64, labels: LabelSet) {
        if let Some(slot) = usize::try_from(offset)
            .ok()
            .and_then(|idx| self.bytes.get_mut(idx))
        {
            *slot = labels;
        }
    }

    fn clear(&mut self) {
        self.bytes.iter_mut().for_each(|l| *l = LabelSet::new());
    }

    fn tainted_bytes(&self) -> usize {
        self.bytes.iter().filter(|l| !l.is_empty()).count()
    }
}
