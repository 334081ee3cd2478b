//! File-backed (SSD) storage.
//!
//! Keys are spread over up to `max_partitions_count` append-only partition
//! files under the configured directory. Each partition keeps a bounded
//! in-memory directory mapping key → (offset, length, deadline, is_default);
//! rows are serialised with the codec. Writes go through a write buffer
//! flushed at the configured granularity, reads go through a block-aligned
//! read buffer. The active partition rotates when its directory or file is
//! full; the oldest partition is dropped when the partition bound is hit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec;
use crate::column::{AttributeType, Column};
use crate::config::SsdStorageConfig;
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::key::DictionaryKey;
use crate::schema::DictionarySchema;
use crate::storage::{CacheStorage, EntryState, KeysFetchResult, classify_entry};

#[derive(Debug, Clone)]
struct SsdEntry {
    offset: u64,
    len: u32,
    deadline: Instant,
    is_default: bool,
}

struct Partition<K> {
    file: File,
    path: PathBuf,
    index: HashMap<K, SsdEntry>,
    /// Bytes durably written to the file; buffered bytes start here.
    file_len: u64,
    write_buffer: Vec<u8>,
}

impl<K: DictionaryKey> Partition<K> {
    fn open(directory: &PathBuf, id: usize) -> Result<Self, CacheError> {
        let path = directory.join(format!("partition_{id}.bin"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            index: HashMap::new(),
            file_len: 0,
            write_buffer: Vec::new(),
        })
    }

    fn flush(&mut self) -> Result<(), CacheError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.file_len))?;
        self.file.write_all(&self.write_buffer)?;
        self.file_len += self.write_buffer.len() as u64;
        self.write_buffer.clear();
        Ok(())
    }

    fn logical_len(&self) -> u64 {
        self.file_len + self.write_buffer.len() as u64
    }
}

/// Partitioned append-only file storage.
pub struct SsdCacheStorage<K> {
    config: SsdStorageConfig,
    schema: Arc<DictionarySchema>,
    attribute_types: Vec<AttributeType>,
    /// Front is the oldest partition, back is the active one.
    partitions: VecDeque<Partition<K>>,
    read_buffer: Vec<u8>,
    next_partition_id: usize,
    rng: StdRng,
}

impl<K: DictionaryKey> SsdCacheStorage<K> {
    /// Create a storage under `config.path`, clearing partition files left
    /// behind by a previous process (the cache does not persist restarts).
    pub fn new(
        config: SsdStorageConfig,
        schema: Arc<DictionarySchema>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        fs::create_dir_all(&config.path)?;
        for entry in fs::read_dir(&config.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("partition_") && name.ends_with(".bin") {
                fs::remove_file(entry.path())?;
            }
        }

        let attribute_types = schema
            .attributes()
            .iter()
            .map(|attribute| attribute.attribute_type.clone())
            .collect();
        let read_buffer = vec![0u8; config.read_buffer_size as usize];

        let mut storage = Self {
            config,
            schema,
            attribute_types,
            partitions: VecDeque::new(),
            read_buffer,
            next_partition_id: 0,
            rng: StdRng::from_entropy(),
        };
        storage.open_partition()?;
        Ok(storage)
    }

    fn open_partition(&mut self) -> Result<(), CacheError> {
        let partition = Partition::open(&self.config.path, self.next_partition_id)?;
        self.next_partition_id += 1;
        self.partitions.push_back(partition);

        while self.partitions.len() > self.config.max_partitions_count {
            let oldest = self.partitions.pop_front().expect("non-empty partitions");
            fs::remove_file(&oldest.path)?;
        }
        Ok(())
    }

    fn next_deadline(&mut self, now: Instant) -> Instant {
        let min = self.config.lifetime.min.as_nanos() as u64;
        let max = self.config.lifetime.max.as_nanos() as u64;
        let lifetime = if min == max {
            min
        } else {
            self.rng.gen_range(min..=max)
        };
        now + std::time::Duration::from_nanos(lifetime)
    }

    fn insert_row(
        &mut self,
        key: &K,
        row_bytes: Vec<u8>,
        is_default: bool,
        now: Instant,
    ) -> Result<(), CacheError> {
        let deadline = self.next_deadline(now);

        let needs_rotation = {
            let active = self.partitions.back().expect("active partition");
            (!active.index.contains_key(key) && active.index.len() >= self.config.max_stored_keys)
                || active.logical_len() + row_bytes.len() as u64 > self.config.file_size
        };
        if needs_rotation {
            self.partitions.back_mut().expect("active partition").flush()?;
            self.open_partition()?;
        }

        let write_buffer_size = self.config.write_buffer_size;
        let active = self.partitions.back_mut().expect("active partition");
        let offset = active.logical_len();
        let len = row_bytes.len() as u32;
        active.write_buffer.extend_from_slice(&row_bytes);
        active.index.insert(
            key.clone(),
            SsdEntry {
                offset,
                len,
                deadline,
                is_default,
            },
        );
        if active.write_buffer.len() as u64 >= write_buffer_size {
            active.flush()?;
        }
        Ok(())
    }

    /// Read the row bytes of an entry, from the write buffer when the entry
    /// has not been flushed yet, otherwise through the read buffer.
    fn read_row(
        partition: &mut Partition<K>,
        entry: &SsdEntry,
        read_buffer: &mut [u8],
        block_size: u64,
    ) -> Result<Vec<u8>, CacheError> {
        let len = entry.len as usize;
        if entry.offset >= partition.file_len {
            let start = (entry.offset - partition.file_len) as usize;
            return Ok(partition.write_buffer[start..start + len].to_vec());
        }

        // A flush always writes whole entries, so a durable entry lies fully
        // within the first `file_len` bytes.
        let aligned_start = entry.offset - entry.offset % block_size;
        let span = (entry.offset - aligned_start) as usize + len;
        if span <= read_buffer.len() {
            partition.file.seek(SeekFrom::Start(aligned_start))?;
            partition.file.read_exact(&mut read_buffer[..span])?;
            let start = (entry.offset - aligned_start) as usize;
            Ok(read_buffer[start..start + len].to_vec())
        } else {
            let mut bytes = vec![0u8; len];
            partition.file.seek(SeekFrom::Start(entry.offset))?;
            partition.file.read_exact(&mut bytes)?;
            Ok(bytes)
        }
    }

    /// Locate a key's newest entry: partition position and entry metadata.
    fn find_entry(&self, key: &K) -> Option<(usize, SsdEntry)> {
        self.partitions
            .iter()
            .enumerate()
            .rev()
            .find_map(|(position, partition)| {
                partition
                    .index
                    .get(key)
                    .map(|entry| (position, entry.clone()))
            })
    }

    fn validate_columns(&self, keys: &[K], columns: &[Column]) -> Result<(), CacheError> {
        if columns.len() != self.schema.attributes().len() {
            return Err(CacheError::TypeMismatch(format!(
                "insert expects {} attribute columns, got {}",
                self.schema.attributes().len(),
                columns.len()
            )));
        }
        if columns.iter().any(|column| column.len() != keys.len()) {
            return Err(CacheError::TypeMismatch(
                "attribute column row count does not match key count".into(),
            ));
        }
        Ok(())
    }
}

impl<K: DictionaryKey> CacheStorage<K> for SsdCacheStorage<K> {
    fn fetch(
        &mut self,
        keys: &[K],
        request: &FetchRequest,
    ) -> Result<KeysFetchResult<K>, CacheError> {
        let now = Instant::now();
        let mut result = KeysFetchResult::new(request);
        let mut next_offset = 0usize;

        for (row, key) in keys.iter().enumerate() {
            if result.found_keys_index.contains_key(key)
                || result.expired_keys_index.contains_key(key)
                || result
                    .not_found_or_expired_keys
                    .iter()
                    .any(|seen| seen == key)
            {
                continue;
            }

            let Some((position, entry)) = self.find_entry(key) else {
                result.not_found_or_expired_keys.push(key.clone());
                result.not_found_or_expired_rows.push(row);
                continue;
            };

            let state = classify_entry(now, entry.deadline, self.config.strict_max_lifetime);
            if state == EntryState::Invalid {
                result.not_found_or_expired_keys.push(key.clone());
                result.not_found_or_expired_rows.push(row);
                continue;
            }

            let values = if entry.is_default {
                None
            } else {
                let bytes = Self::read_row(
                    &mut self.partitions[position],
                    &entry,
                    &mut self.read_buffer,
                    self.config.block_size,
                )?;
                let mut pos = 0;
                Some(codec::decode_row(&bytes, &mut pos, &self.attribute_types)?)
            };

            let offset = next_offset;
            next_offset += 1;

            for attribute_index in 0..self.schema.attributes().len() {
                if !request.should_fill(attribute_index) {
                    continue;
                }
                let value = match &values {
                    Some(values) => values[attribute_index].clone(),
                    None => request.provider(attribute_index).value_at(row),
                };
                result.fetched_columns[attribute_index].push(value);
            }

            if entry.is_default {
                result.default_keys.insert(key.clone());
            }

            match state {
                EntryState::Fresh => {
                    result.found_keys_index.insert(key.clone(), offset);
                }
                EntryState::Expired => {
                    result.expired_keys_index.insert(key.clone(), offset);
                    result.not_found_or_expired_keys.push(key.clone());
                    result.not_found_or_expired_rows.push(row);
                }
                EntryState::Invalid => unreachable!("invalid entries are handled above"),
            }
        }

        Ok(result)
    }

    fn insert(&mut self, keys: &[K], attribute_columns: &[Column]) -> Result<(), CacheError> {
        self.validate_columns(keys, attribute_columns)?;
        let now = Instant::now();

        for (row, key) in keys.iter().enumerate() {
            let mut bytes = Vec::new();
            for column in attribute_columns {
                codec::encode_value(&mut bytes, &column[row]);
            }
            self.insert_row(key, bytes, false, now)?;
        }
        Ok(())
    }

    fn insert_defaults(&mut self, keys: &[K]) -> Result<(), CacheError> {
        let now = Instant::now();
        for key in keys {
            self.insert_row(key, Vec::new(), true, now)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.index.len())
            .sum()
    }

    fn max_size(&self) -> usize {
        self.config.max_partitions_count * self.config.max_stored_keys
    }

    fn bytes_allocated(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| {
                partition.logical_len() as usize
                    + partition.index.len()
                        * (std::mem::size_of::<K>() + std::mem::size_of::<SsdEntry>())
            })
            .sum::<usize>()
            + self.read_buffer.len()
    }

    fn cached_keys(&self) -> Vec<K> {
        let now = Instant::now();
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for partition in self.partitions.iter().rev() {
            for (key, entry) in &partition.index {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if !entry.is_default
                    && classify_entry(now, entry.deadline, self.config.strict_max_lifetime)
                        != EntryState::Invalid
                {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    fn returns_keys_in_order(&self) -> bool {
        false
    }
}
