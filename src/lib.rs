//! cachedict - a read-through caching dictionary
//!
//! Sits between a query engine and a slow external key→attributes source
//! (remote RDBMS, HTTP endpoint, flat file) and answers batched attribute
//! lookups from memory or SSD, transparently refetching missing or expired
//! keys:
//!
//! - **Storage**: a bounded, TTL-indexed key→attribute-row store with
//!   probabilistic expiration; in-memory cell table or partitioned SSD log.
//! - **Update queue**: a bounded producer/consumer coalescing caller threads
//!   onto a small worker pool, with push and wait timeouts and exponential
//!   backoff on source errors.
//! - **Lookup pipeline**: partitions a key batch into fresh, usable-expired
//!   and missing, serves what it can, and aggregates storage rows, freshly
//!   fetched rows and caller defaults in input-key order.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cachedict::prelude::*;
//!
//! let dictionary = CacheDictionary::<u64>::new(
//!     "users",
//!     schema,
//!     source,
//!     Box::new(MemoryCacheStorage::new(storage_config, schema)?),
//!     UpdateQueueConfig::default(),
//!     false,
//! )?;
//!
//! let names = dictionary.get_column("name", &[ids], None)?;
//! ```

#![warn(missing_docs)]

pub mod codec;
pub mod column;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod fetch;
mod hierarchy;
pub mod key;
pub mod scan;
pub mod schema;
pub mod source;
pub mod stats;
pub mod storage;
pub mod update;

// Re-exports for convenience
pub use column::{AttributeType, AttributeValue, Block, Column};
pub use config::{
    CacheStorageConfig, DictionaryConfig, DictionaryLifetime, SsdStorageConfig, UpdateQueueConfig,
};
pub use dictionary::CacheDictionary;
pub use error::CacheError;
pub use fetch::FetchRequest;
pub use key::{ComplexKey, DictionaryKey, KeysExtractor};
pub use schema::{AttributeDef, DictionarySchema, KeyLayout};
pub use source::{BlockStream, DictionarySource};
pub use storage::{CacheStorage, MemoryCacheStorage, SsdCacheStorage};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::column::{AttributeType, AttributeValue, Block, Column};
    pub use crate::config::{
        CacheStorageConfig, DictionaryConfig, DictionaryLifetime, SsdStorageConfig,
        UpdateQueueConfig,
    };
    pub use crate::dictionary::CacheDictionary;
    pub use crate::error::CacheError;
    pub use crate::key::{ComplexKey, DictionaryKey};
    pub use crate::schema::{AttributeDef, DictionarySchema, KeyLayout};
    pub use crate::source::{BlockStream, DictionarySource};
    pub use crate::storage::{CacheStorage, MemoryCacheStorage, SsdCacheStorage};
}
