//! Hierarchy operations over the declared hierarchical attribute.
//!
//! A thin iterative parent-walk built on the normal get path. Simple-key
//! dictionaries only.

use crate::column::{AttributeValue, Column};
use crate::dictionary::CacheDictionary;
use crate::error::CacheError;
use crate::key::DictionaryKey;

/// Levels walked before a row is treated as cyclic.
const MAX_DEPTH: usize = 16;

impl<K: DictionaryKey> CacheDictionary<K> {
    fn hierarchical_attribute(&self) -> Result<(String, u64), CacheError> {
        if !K::IS_SIMPLE {
            return Err(CacheError::Unsupported(
                "hierarchy is not supported for complex key dictionaries".into(),
            ));
        }
        let schema = self.schema();
        let index = schema.hierarchical_attribute_index().ok_or_else(|| {
            CacheError::Unsupported("dictionary has no hierarchical attribute".into())
        })?;
        let attribute = &schema.attributes()[index];
        let null_value = attribute.null_value.as_u64().ok_or_else(|| {
            CacheError::TypeMismatch("hierarchical attribute must be UInt64".into())
        })?;
        Ok((attribute.name.clone(), null_value))
    }

    /// Map each child id to its parent id through the hierarchical attribute.
    ///
    /// Runs an update for missing keys before reading, like any get.
    pub fn to_parent(&self, child_ids: &[u64]) -> Result<Vec<u64>, CacheError> {
        let (attribute_name, _) = self.hierarchical_attribute()?;
        let key_column: Column = child_ids
            .iter()
            .map(|id| AttributeValue::UInt64(*id))
            .collect();
        let column = self.get_column(&attribute_name, &[key_column], None)?;
        column
            .iter()
            .map(|value| {
                value.as_u64().ok_or_else(|| {
                    CacheError::TypeMismatch("hierarchical attribute must be UInt64".into())
                })
            })
            .collect()
    }

    /// Walk each child one level up per iteration until its target ancestor,
    /// the null value, or a cycle is reached.
    fn is_in_impl(
        &self,
        child_ids: &[u64],
        ancestor_at: impl Fn(usize) -> u64,
    ) -> Result<Vec<bool>, CacheError> {
        let (_, null_value) = self.hierarchical_attribute()?;
        let out_size = child_ids.len();

        let mut out: Vec<Option<bool>> = vec![None; out_size];
        // Rows still undecided, with their current ancestor value and the
        // value one level below it (for loop detection).
        let mut rows: Vec<usize> = (0..out_size).collect();
        let mut current: Vec<u64> = child_ids.to_vec();
        let mut previous: Vec<Option<u64>> = vec![None; out_size];

        for _ in 0..MAX_DEPTH {
            let mut next_rows = Vec::new();
            let mut next_values = Vec::new();

            for (slot, &row) in rows.iter().enumerate() {
                let value = current[slot];
                if value == null_value {
                    out[row] = Some(false);
                } else if value == ancestor_at(row) {
                    out[row] = Some(true);
                } else if previous[slot] == Some(value) {
                    // Cyclic row.
                    out[row] = Some(true);
                } else {
                    next_rows.push(row);
                    next_values.push(value);
                }
            }

            if next_rows.is_empty() {
                break;
            }

            let parents = self.to_parent(&next_values)?;
            previous = next_values.into_iter().map(Some).collect();
            current = parents;
            rows = next_rows;
        }

        // Rows still walking after the depth cap are treated as cyclic.
        Ok(out.into_iter().map(|value| value.unwrap_or(true)).collect())
    }

    /// For each row, whether `ancestor_ids[row]` is an ancestor of
    /// `child_ids[row]`.
    pub fn is_in_vector_vector(
        &self,
        child_ids: &[u64],
        ancestor_ids: &[u64],
    ) -> Result<Vec<bool>, CacheError> {
        if child_ids.len() != ancestor_ids.len() {
            return Err(CacheError::TypeMismatch(
                "child and ancestor id columns must have the same length".into(),
            ));
        }
        self.is_in_impl(child_ids, |row| ancestor_ids[row])
    }

    /// For each row, whether `ancestor_id` is an ancestor of `child_ids[row]`.
    pub fn is_in_vector_constant(
        &self,
        child_ids: &[u64],
        ancestor_id: u64,
    ) -> Result<Vec<bool>, CacheError> {
        self.is_in_impl(child_ids, |_| ancestor_id)
    }

    /// For each row, whether `ancestor_ids[row]` is an ancestor of the single
    /// `child_id`.
    pub fn is_in_constant_vector(
        &self,
        child_id: u64,
        ancestor_ids: &[u64],
    ) -> Result<Vec<bool>, CacheError> {
        let (_, null_value) = self.hierarchical_attribute()?;

        // Collect the child's ancestor chain once; the hierarchy is assumed
        // short, so a linear scan per row is fine.
        let mut ancestors = vec![child_id];
        let mut child = child_id;
        for _ in 0..MAX_DEPTH {
            let parent = self.to_parent(&[child])?[0];
            if parent == null_value || ancestors.contains(&parent) {
                break;
            }
            ancestors.push(parent);
            child = parent;
        }

        Ok(ancestor_ids
            .iter()
            .map(|ancestor| ancestors.contains(ancestor))
            .collect())
    }
}
