//! The external dictionary source interface.

use crate::column::{Block, Column};
use crate::error::CacheError;

/// A stream of typed blocks produced by a source load.
///
/// The first `key_arity` columns of each block are the schema's key columns;
/// the remainder are attribute columns in schema order.
pub type BlockStream = Box<dyn Iterator<Item = Result<Block, CacheError>> + Send>;

/// The slow external key→attributes source consumed by the cache.
///
/// Only the narrow selective-load surface is used: the cache asks for exactly
/// the keys it is missing, never for a full dump.
pub trait DictionarySource: Send + Sync {
    /// Whether the source can load a supplied set of keys.
    ///
    /// A cache dictionary cannot be built over a source without this
    /// capability.
    fn supports_selective_load(&self) -> bool;

    /// Open a stream over the rows of the given simple keys.
    fn load_ids(&self, ids: &[u64]) -> Result<BlockStream, CacheError>;

    /// Open a stream over the rows of the given complex key rows.
    ///
    /// `rows` selects which rows of `key_columns` to load.
    fn load_keys(&self, key_columns: &[Column], rows: &[usize]) -> Result<BlockStream, CacheError>;
}
