//! Taint labels and label-sets.

use alloc::collections::{btree_set, BTreeSet};
use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// An opaque provenance identifier.
pub type Label = u32;

/// The set of labels attached to one byte. Empty means untainted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeSet<Label>);

impl LabelSet {
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    #[must_use]
    pub fn singleton(label: Label) -> Self {
        let mut set = BTreeSet::new();
        set.insert(label);
        Self(set)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct labels in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn contains(&self, label: Label) -> bool {
        self.0.contains(&label)
    }

    /// Returns `true` if the label was not present yet.
    pub fn insert(&mut self, label: Label) -> bool {
        self.0.insert(label)
    }

    pub fn union_with(&mut self, other: &LabelSet) {
        self.0.extend(other.0.iter().copied());
    }

    #[must_use]
    pub fn union(&self, other: &LabelSet) -> LabelSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn iter(&self) -> btree_set::Iter<'_, Label> {
        self.0.iter()
    }

    /// The labels in ascending order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Label> {
        self.0.iter().copied().collect()
    }
}

impl FromIterator<Label> for LabelSet {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = &'a Label;
    type IntoIter = btree_set::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Display for LabelSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{label}")?;
        }
        write!(f, "}}")
    }
}
