//! Configuration loading and validation.
//!
//! Configuration is read from a TOML file and/or `CACHEDICT__section__field`
//! environment overrides, then resolved into validated per-subsystem
//! structures. Validation failures surface as [`CacheError::InvalidConfig`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::CacheError;

const DEFAULT_MAX_UPDATE_QUEUE_SIZE: usize = 100_000;
const DEFAULT_MAX_THREADS_FOR_UPDATES: usize = 4;
const DEFAULT_PUSH_TIMEOUT_MS: u64 = 10;
const DEFAULT_QUERY_WAIT_TIMEOUT_MS: u64 = 60_000;

const DEFAULT_SSD_BLOCK_SIZE: u64 = 4096;
const DEFAULT_SSD_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;
const DEFAULT_SSD_MAX_PARTITIONS_COUNT: usize = 16;
const DEFAULT_SSD_MAX_STORED_KEYS: usize = 100_000;

/// Entry lifetime band: the deadline of every inserted entry is drawn
/// uniformly from `[min, max]` to smear expiration storms.
#[derive(Debug, Clone)]
pub struct DictionaryLifetime {
    /// Lower bound of the deadline band.
    pub min: Duration,
    /// Upper bound of the deadline band.
    pub max: Duration,
}

impl DictionaryLifetime {
    /// Create a lifetime band, validating `0 < max` and `min ≤ max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, CacheError> {
        if max.is_zero() {
            return Err(CacheError::InvalidConfig(
                "lifetime.max_sec must be greater than zero".into(),
            ));
        }
        if min > max {
            return Err(CacheError::InvalidConfig(
                "lifetime.min_sec must not exceed lifetime.max_sec".into(),
            ));
        }
        Ok(Self { min, max })
    }

    /// Convenience constructor from whole seconds.
    pub fn from_secs(min_sec: u64, max_sec: u64) -> Result<Self, CacheError> {
        Self::new(Duration::from_secs(min_sec), Duration::from_secs(max_sec))
    }
}

/// Validated configuration of the in-memory cell-table storage.
#[derive(Debug, Clone)]
pub struct CacheStorageConfig {
    /// Maximum number of entries.
    pub size_in_cells: usize,
    /// Hard bound past the deadline after which an entry is invalid.
    pub strict_max_lifetime: Duration,
    /// Deadline band applied at insert.
    pub lifetime: DictionaryLifetime,
}

impl CacheStorageConfig {
    /// Create a storage configuration, validating `size_in_cells > 0`.
    pub fn new(
        size_in_cells: usize,
        strict_max_lifetime: Duration,
        lifetime: DictionaryLifetime,
    ) -> Result<Self, CacheError> {
        if size_in_cells == 0 {
            return Err(CacheError::InvalidConfig(
                "cache.size_in_cells must be greater than zero".into(),
            ));
        }
        Ok(Self {
            size_in_cells,
            strict_max_lifetime,
            lifetime,
        })
    }
}

/// Validated configuration of the update queue.
#[derive(Debug, Clone)]
pub struct UpdateQueueConfig {
    /// Queue capacity.
    pub max_update_queue_size: usize,
    /// Worker pool size.
    pub max_threads_for_updates: usize,
    /// How long `try_push` may wait for a queue slot.
    pub push_timeout: Duration,
    /// How long `wait_for_finish` may wait for a unit to complete.
    pub query_wait_timeout: Duration,
}

impl Default for UpdateQueueConfig {
    fn default() -> Self {
        Self {
            max_update_queue_size: DEFAULT_MAX_UPDATE_QUEUE_SIZE,
            max_threads_for_updates: DEFAULT_MAX_THREADS_FOR_UPDATES,
            push_timeout: Duration::from_millis(DEFAULT_PUSH_TIMEOUT_MS),
            query_wait_timeout: Duration::from_millis(DEFAULT_QUERY_WAIT_TIMEOUT_MS),
        }
    }
}

impl UpdateQueueConfig {
    /// Validate queue bounds and timeouts.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_update_queue_size == 0 {
            return Err(CacheError::InvalidConfig(
                "update_queue.max_update_queue_size must be greater than zero".into(),
            ));
        }
        if self.max_threads_for_updates == 0 {
            return Err(CacheError::InvalidConfig(
                "update_queue.max_threads_for_updates must be greater than zero".into(),
            ));
        }
        if self.push_timeout < Duration::from_millis(10) {
            return Err(CacheError::InvalidConfig(
                "update_queue.update_queue_push_timeout_milliseconds must be at least 10".into(),
            ));
        }
        if self.query_wait_timeout.is_zero() {
            return Err(CacheError::InvalidConfig(
                "update_queue.query_wait_timeout_milliseconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Validated configuration of the file-backed (SSD) storage.
#[derive(Debug, Clone)]
pub struct SsdStorageConfig {
    /// Directory holding the partition files.
    pub path: PathBuf,
    /// Block granularity of reads and writes, in bytes.
    pub block_size: u64,
    /// Maximum partition file size, in bytes.
    pub file_size: u64,
    /// Read buffer size, in bytes.
    pub read_buffer_size: u64,
    /// Write buffer size, in bytes.
    pub write_buffer_size: u64,
    /// Maximum number of partitions kept on disk.
    pub max_partitions_count: usize,
    /// Maximum number of keys in one partition's directory.
    pub max_stored_keys: usize,
    /// Hard bound past the deadline after which an entry is invalid.
    pub strict_max_lifetime: Duration,
    /// Deadline band applied at insert.
    pub lifetime: DictionaryLifetime,
}

impl SsdStorageConfig {
    /// Validate path, block multiples and bounds.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.path.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig(
                "ssd.path must not be empty".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(CacheError::InvalidConfig(
                "ssd.block_size must be greater than zero".into(),
            ));
        }
        for (name, value) in [
            ("ssd.file_size", self.file_size),
            ("ssd.read_buffer_size", self.read_buffer_size),
            ("ssd.write_buffer_size", self.write_buffer_size),
        ] {
            if value == 0 || value % self.block_size != 0 {
                return Err(CacheError::InvalidConfig(format!(
                    "{name} must be a non-zero multiple of ssd.block_size"
                )));
            }
        }
        if self.max_partitions_count == 0 {
            return Err(CacheError::InvalidConfig(
                "ssd.max_partitions_count must be greater than zero".into(),
            ));
        }
        if self.max_stored_keys == 0 {
            return Err(CacheError::InvalidConfig(
                "ssd.max_stored_keys must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration schema, as read from TOML and the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DictionaryConfig {
    /// Lifetime section.
    pub lifetime: Option<LifetimeSection>,
    /// Cache storage section.
    pub cache: Option<CacheSection>,
    /// Update queue section.
    pub update_queue: Option<UpdateQueueSection>,
    /// SSD storage section.
    pub ssd: Option<SsdSection>,
}

/// `[lifetime]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifetimeSection {
    /// Lower bound of the deadline band, in seconds.
    pub min_sec: Option<u64>,
    /// Upper bound of the deadline band, in seconds.
    pub max_sec: Option<u64>,
}

/// `[cache]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSection {
    /// Maximum number of in-memory entries.
    pub size_in_cells: Option<usize>,
    /// Hard upper bound after which expired entries are invalid, in seconds.
    pub strict_max_lifetime_seconds: Option<u64>,
    /// Serve stale values and refresh asynchronously.
    pub allow_read_expired_keys: Option<bool>,
    /// Not applicable to the cache layout; rejected when set.
    pub require_nonempty: Option<bool>,
}

/// `[update_queue]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateQueueSection {
    /// Queue capacity.
    pub max_update_queue_size: Option<usize>,
    /// Worker pool size.
    pub max_threads_for_updates: Option<usize>,
    /// Push timeout in milliseconds.
    pub update_queue_push_timeout_milliseconds: Option<u64>,
    /// Query wait timeout in milliseconds.
    pub query_wait_timeout_milliseconds: Option<u64>,
}

/// `[ssd]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SsdSection {
    /// Directory holding the partition files.
    pub path: Option<PathBuf>,
    /// Block granularity in bytes.
    pub block_size: Option<u64>,
    /// Maximum partition file size in bytes.
    pub file_size: Option<u64>,
    /// Read buffer size in bytes.
    pub read_buffer_size: Option<u64>,
    /// Write buffer size in bytes.
    pub write_buffer_size: Option<u64>,
    /// Maximum number of partitions.
    pub max_partitions_count: Option<usize>,
    /// Maximum keys per partition directory.
    pub max_stored_keys: Option<usize>,
}

impl DictionaryConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| CacheError::InvalidConfig(e.to_string()))
    }

    /// Load configuration from the `CACHEDICT_CONFIG` env var (if set), then
    /// apply `CACHEDICT__section__field` overrides.
    pub fn load_from_env() -> Result<Self, CacheError> {
        let mut config = match env::var("CACHEDICT_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), CacheError> {
        for (key, value) in env::vars() {
            if !key.starts_with("CACHEDICT__") {
                continue;
            }
            let path = key["CACHEDICT__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["lifetime", "min_sec"] => {
                    self.lifetime_mut().min_sec = Some(parse_value(&key, &value)?);
                }
                ["lifetime", "max_sec"] => {
                    self.lifetime_mut().max_sec = Some(parse_value(&key, &value)?);
                }
                ["cache", "size_in_cells"] => {
                    self.cache_mut().size_in_cells = Some(parse_value(&key, &value)?);
                }
                ["cache", "strict_max_lifetime_seconds"] => {
                    self.cache_mut().strict_max_lifetime_seconds =
                        Some(parse_value(&key, &value)?);
                }
                ["cache", "allow_read_expired_keys"] => {
                    self.cache_mut().allow_read_expired_keys = Some(parse_value(&key, &value)?);
                }
                ["update_queue", "max_update_queue_size"] => {
                    self.update_queue_mut().max_update_queue_size =
                        Some(parse_value(&key, &value)?);
                }
                ["update_queue", "max_threads_for_updates"] => {
                    self.update_queue_mut().max_threads_for_updates =
                        Some(parse_value(&key, &value)?);
                }
                ["update_queue", "update_queue_push_timeout_milliseconds"] => {
                    self.update_queue_mut().update_queue_push_timeout_milliseconds =
                        Some(parse_value(&key, &value)?);
                }
                ["update_queue", "query_wait_timeout_milliseconds"] => {
                    self.update_queue_mut().query_wait_timeout_milliseconds =
                        Some(parse_value(&key, &value)?);
                }
                ["ssd", "path"] => {
                    self.ssd_mut().path = Some(PathBuf::from(value));
                }
                ["ssd", "block_size"] => {
                    self.ssd_mut().block_size = Some(parse_value(&key, &value)?);
                }
                ["ssd", "file_size"] => {
                    self.ssd_mut().file_size = Some(parse_value(&key, &value)?);
                }
                ["ssd", "read_buffer_size"] => {
                    self.ssd_mut().read_buffer_size = Some(parse_value(&key, &value)?);
                }
                ["ssd", "write_buffer_size"] => {
                    self.ssd_mut().write_buffer_size = Some(parse_value(&key, &value)?);
                }
                ["ssd", "max_partitions_count"] => {
                    self.ssd_mut().max_partitions_count = Some(parse_value(&key, &value)?);
                }
                ["ssd", "max_stored_keys"] => {
                    self.ssd_mut().max_stored_keys = Some(parse_value(&key, &value)?);
                }
                _ => {
                    return Err(CacheError::InvalidConfig(format!(
                        "unknown config key: {key}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve the lifetime band.
    pub fn to_lifetime(&self) -> Result<DictionaryLifetime, CacheError> {
        let section = self.lifetime.clone().unwrap_or_default();
        let max_sec = section.max_sec.ok_or_else(|| {
            CacheError::InvalidConfig("missing required field lifetime.max_sec".into())
        })?;
        DictionaryLifetime::from_secs(section.min_sec.unwrap_or(0), max_sec)
    }

    /// Resolve the in-memory storage configuration.
    pub fn to_storage_config(&self) -> Result<CacheStorageConfig, CacheError> {
        let lifetime = self.to_lifetime()?;
        let section = self.cache.clone().unwrap_or_default();

        if section.require_nonempty == Some(true) {
            return Err(CacheError::InvalidConfig(
                "cache layout cannot have require_nonempty set".into(),
            ));
        }

        let size_in_cells = section.size_in_cells.ok_or_else(|| {
            CacheError::InvalidConfig("missing required field cache.size_in_cells".into())
        })?;
        let strict_max_lifetime = section
            .strict_max_lifetime_seconds
            .map_or(lifetime.max, Duration::from_secs);

        CacheStorageConfig::new(size_in_cells, strict_max_lifetime, lifetime)
    }

    /// Resolve the update queue configuration.
    pub fn to_update_queue_config(&self) -> Result<UpdateQueueConfig, CacheError> {
        let section = self.update_queue.clone().unwrap_or_default();
        let config = UpdateQueueConfig {
            max_update_queue_size: section
                .max_update_queue_size
                .unwrap_or(DEFAULT_MAX_UPDATE_QUEUE_SIZE),
            max_threads_for_updates: section
                .max_threads_for_updates
                .unwrap_or(DEFAULT_MAX_THREADS_FOR_UPDATES),
            push_timeout: Duration::from_millis(
                section
                    .update_queue_push_timeout_milliseconds
                    .unwrap_or(DEFAULT_PUSH_TIMEOUT_MS),
            ),
            query_wait_timeout: Duration::from_millis(
                section
                    .query_wait_timeout_milliseconds
                    .unwrap_or(DEFAULT_QUERY_WAIT_TIMEOUT_MS),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve the SSD storage configuration, when the section is present.
    pub fn to_ssd_config(&self) -> Result<Option<SsdStorageConfig>, CacheError> {
        let Some(section) = self.ssd.clone() else {
            return Ok(None);
        };
        let lifetime = self.to_lifetime()?;
        let strict_max_lifetime = self
            .cache
            .as_ref()
            .and_then(|cache| cache.strict_max_lifetime_seconds)
            .map_or(lifetime.max, Duration::from_secs);

        let path = section
            .path
            .ok_or_else(|| CacheError::InvalidConfig("missing required field ssd.path".into()))?;
        let block_size = section.block_size.unwrap_or(DEFAULT_SSD_BLOCK_SIZE);

        let config = SsdStorageConfig {
            path,
            block_size,
            file_size: section.file_size.unwrap_or(DEFAULT_SSD_FILE_SIZE),
            read_buffer_size: section.read_buffer_size.unwrap_or(16 * block_size),
            write_buffer_size: section.write_buffer_size.unwrap_or(block_size),
            max_partitions_count: section
                .max_partitions_count
                .unwrap_or(DEFAULT_SSD_MAX_PARTITIONS_COUNT),
            max_stored_keys: section
                .max_stored_keys
                .unwrap_or(DEFAULT_SSD_MAX_STORED_KEYS),
            strict_max_lifetime,
            lifetime,
        };
        config.validate()?;
        Ok(Some(config))
    }

    /// Whether stale entries may be served while a refresh runs.
    pub fn allow_read_expired_keys(&self) -> bool {
        self.cache
            .as_ref()
            .and_then(|cache| cache.allow_read_expired_keys)
            .unwrap_or(false)
    }

    fn lifetime_mut(&mut self) -> &mut LifetimeSection {
        self.lifetime.get_or_insert_with(LifetimeSection::default)
    }

    fn cache_mut(&mut self) -> &mut CacheSection {
        self.cache.get_or_insert_with(CacheSection::default)
    }

    fn update_queue_mut(&mut self) -> &mut UpdateQueueSection {
        self.update_queue
            .get_or_insert_with(UpdateQueueSection::default)
    }

    fn ssd_mut(&mut self) -> &mut SsdSection {
        self.ssd.get_or_insert_with(SsdSection::default)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CacheError> {
    value
        .parse()
        .map_err(|_| CacheError::InvalidConfig(format!("invalid value for {key}: {value}")))
}
