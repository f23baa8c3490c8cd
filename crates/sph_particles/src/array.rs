//! Particle array storage.
//!
//! A [`ParticleArray`] stores one `f64` column per named property (`x`, `h`,
//! `m`, ...). All columns hold exactly [`ParticleArray::len`] values, so a
//! particle is simply an index into every column.
//!
//! Arrays on non-coordinating ranks start out empty: same name, same kind,
//! same columns, zero particles. The partition service later moves particles
//! between ranks through [`ParticleArray::extract`],
//! [`ParticleArray::remove`], and [`ParticleArray::extend_from`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Errors raised when an operation would break the equal-length column
/// invariant.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArrayError {
    /// A column's length differs from the array's particle count.
    #[error("field '{field}' of array '{array}' has {got} values, expected {expected}")]
    LengthMismatch {
        /// The array being modified.
        array: String,
        /// The offending column.
        field: String,
        /// The array's particle count.
        expected: usize,
        /// The column's length.
        got: usize,
    },

    /// Two arrays being merged do not carry the same set of columns.
    #[error("array '{array}' cannot merge particles with a different field set")]
    FieldSetMismatch {
        /// The receiving array.
        array: String,
    },

    /// A particle index is past the end of the array.
    #[error("index {index} out of range for array '{array}' with {len} particles")]
    IndexOutOfRange {
        /// The array being indexed.
        array: String,
        /// The requested index.
        index: usize,
        /// The particle count.
        len: usize,
    },
}

/// A named collection of particles with per-particle `f64` fields.
///
/// The `is_static` flag is fixed at construction. Static arrays (walls,
/// boundaries) never move, which lets the partitioner balance them once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleArray {
    name: String,
    is_static: bool,
    fields: IndexMap<String, Vec<f64>>,
}

impl ParticleArray {
    /// Create an empty dynamic array.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_static: false,
            fields: IndexMap::new(),
        }
    }

    /// Create an empty static array.
    #[must_use]
    pub fn new_static(name: impl Into<String>) -> Self {
        Self {
            is_static: true,
            ..Self::new(name)
        }
    }

    /// Add a column and return the array, for chained construction.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::LengthMismatch`] if the array already has
    /// columns and `values` has a different length.
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, ArrayError> {
        self.add_field(name, values)?;
        Ok(self)
    }

    /// Add or replace a column.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::LengthMismatch`] if the column length differs
    /// from the current particle count.
    pub fn add_field(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<(), ArrayError> {
        let name = name.into();
        let others = self.fields.keys().any(|k| *k != name);
        if others && values.len() != self.len() {
            return Err(ArrayError::LengthMismatch {
                array: self.name.clone(),
                field: name,
                expected: self.len(),
                got: values.len(),
            });
        }
        self.fields.insert(name, values);
        Ok(())
    }

    /// Returns the array name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for arrays that never move.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Returns the number of particles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.values().next().map_or(0, Vec::len)
    }

    /// Returns `true` if the array holds no particles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a column by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&[f64]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Returns the column names in insertion order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns an array with the same name, kind, and columns but no
    /// particles. This is what non-coordinating ranks start from.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        Self {
            name: self.name.clone(),
            is_static: self.is_static,
            fields: self.fields.keys().map(|k| (k.clone(), Vec::new())).collect(),
        }
    }

    /// Copy the particles at `indices` into a new array of the same shape.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::IndexOutOfRange`] for an invalid index.
    pub fn extract(&self, indices: &[usize]) -> Result<Self, ArrayError> {
        self.check_indices(indices)?;
        let mut out = self.empty_like();
        for (name, column) in &self.fields {
            let dst = out.fields.entry(name.clone()).or_default();
            dst.extend(indices.iter().map(|&i| column[i]));
        }
        Ok(out)
    }

    /// Remove the particles at `indices`. Duplicate indices are ignored and
    /// the relative order of the remaining particles is preserved.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::IndexOutOfRange`] for an invalid index.
    pub fn remove(&mut self, indices: &[usize]) -> Result<(), ArrayError> {
        self.check_indices(indices)?;
        let mut doomed = vec![false; self.len()];
        for &i in indices {
            doomed[i] = true;
        }
        for column in self.fields.values_mut() {
            let mut slot = 0;
            column.retain(|_| {
                let keep = !doomed[slot];
                slot += 1;
                keep
            });
        }
        Ok(())
    }

    /// Append every particle of `other` to this array.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::FieldSetMismatch`] unless both arrays carry the
    /// same columns.
    pub fn extend_from(&mut self, other: &ParticleArray) -> Result<(), ArrayError> {
        let same = self.fields.len() == other.fields.len()
            && other.fields.keys().all(|k| self.fields.contains_key(k));
        if !same {
            return Err(ArrayError::FieldSetMismatch {
                array: self.name.clone(),
            });
        }
        for (name, column) in &other.fields {
            if let Some(dst) = self.fields.get_mut(name) {
                dst.extend_from_slice(column);
            }
        }
        Ok(())
    }

    /// Check the equal-length column invariant. Used on arrays that arrive
    /// through deserialisation rather than the checked constructors.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::LengthMismatch`] for the first ragged column.
    pub fn validate(&self) -> Result<(), ArrayError> {
        let expected = self.len();
        for (name, column) in &self.fields {
            if column.len() != expected {
                return Err(ArrayError::LengthMismatch {
                    array: self.name.clone(),
                    field: name.clone(),
                    expected,
                    got: column.len(),
                });
            }
        }
        Ok(())
    }

    fn check_indices(&self, indices: &[usize]) -> Result<(), ArrayError> {
        let len = self.len();
        match indices.iter().find(|&&i| i >= len) {
            Some(&index) => Err(ArrayError::IndexOutOfRange {
                array: self.name.clone(),
                index,
                len,
            }),
            None => Ok(()),
        }
    }
}
