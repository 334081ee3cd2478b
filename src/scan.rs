//! Block stream over the currently cached keys.

use crate::column::Block;
use crate::dictionary::CacheDictionary;
use crate::error::CacheError;
use crate::key::DictionaryKey;

/// Iterates all currently cached keys in blocks of at most `max_block_size`
/// rows. Each block carries the key column(s) first, then the requested
/// attribute columns read through the normal get path.
pub struct DictionaryBlockStream<'a, K: DictionaryKey> {
    dictionary: &'a CacheDictionary<K>,
    column_names: Vec<String>,
    keys: Vec<K>,
    position: usize,
    max_block_size: usize,
}

impl<K: DictionaryKey> CacheDictionary<K> {
    /// Open a block stream over the keys cached right now.
    ///
    /// The key snapshot is taken once; entries expiring while the stream is
    /// consumed are refreshed through the get path like any other read.
    pub fn block_stream(
        &self,
        column_names: &[&str],
        max_block_size: usize,
    ) -> Result<DictionaryBlockStream<'_, K>, CacheError> {
        if max_block_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_block_size must be greater than zero".into(),
            ));
        }
        for name in column_names {
            if self.schema().attribute_index(name).is_none() {
                return Err(CacheError::Unsupported(format!(
                    "no attribute named '{name}' in dictionary"
                )));
            }
        }

        Ok(DictionaryBlockStream {
            dictionary: self,
            column_names: column_names.iter().map(|name| (*name).to_string()).collect(),
            keys: self.cached_keys(),
            position: 0,
            max_block_size,
        })
    }
}

impl<K: DictionaryKey> DictionaryBlockStream<'_, K> {
    fn next_block(&mut self) -> Result<Block, CacheError> {
        let end = (self.position + self.max_block_size).min(self.keys.len());
        let chunk = &self.keys[self.position..end];
        self.position = end;

        let mut columns = K::key_columns(chunk, self.dictionary.schema())?;

        let names: Vec<&str> = self.column_names.iter().map(String::as_str).collect();
        let defaults = vec![None; names.len()];
        let attribute_columns = self.dictionary.get_columns(&names, &columns, &defaults)?;

        columns.extend(attribute_columns);
        Block::new(columns)
    }
}

impl<K: DictionaryKey> Iterator for DictionaryBlockStream<'_, K> {
    type Item = Result<Block, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.keys.len() {
            return None;
        }
        Some(self.next_block())
    }
}
