//! Static / dynamic classification of a rank's arrays.

use crate::array::ParticleArray;

/// Indices of a rank's arrays, grouped by kind.
///
/// Both lists preserve the original array order, so the partitioner and
/// the solver see the same arrays in the same sequence on every rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArraySplit {
    /// Arrays that move every step.
    pub dynamic: Vec<usize>,
    /// Arrays that never move.
    pub fixed: Vec<usize>,
}

impl ArraySplit {
    /// Classify `arrays` by their `is_static` flag.
    #[must_use]
    pub fn classify(arrays: &[ParticleArray]) -> Self {
        let mut split = Self::default();
        for (i, array) in arrays.iter().enumerate() {
            if array.is_static() {
                split.fixed.push(i);
            } else {
                split.dynamic.push(i);
            }
        }
        split
    }

    /// Returns `true` if at least one static array exists.
    #[must_use]
    pub fn has_static(&self) -> bool {
        !self.fixed.is_empty()
    }
}
