//! RocksDB-backed versioned document store.
//!
//! Column families:
//! - `attachments`, `cases`, `logs`, `suites`: one per collection,
//!   keyed by document id, value is the encoded record (see [`crate::codec`])
//! - `indexes`: every secondary index entry (see [`crate::index`])
//!
//! Write path:
//! ```text
//! insert/update/delete
//!        │  write lock
//!        ▼
//! ┌──────────────────────────────┐
//! │ WriteBatch                   │
//! │   put  <collection>/<id>     │
//! │   del  stale index entries   │──► db.write (atomic)
//! │   put  fresh index entries   │
//! └──────────────────────────────┘
//!        │  still under the write lock
//!        ▼
//! ChangeBus::publish
//! ```
//!
//! A record and its index entries are always committed in one batch, so a
//! reader never observes one without the other. Publishing under the same
//! lock gives every subscriber changes in commit order, at the cost of the
//! backpressure described in [`crate::bus`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use crate::bus::{Change, ChangeBus, Subscription};
use crate::codec;
use crate::entity::{set_field, ChangedFields, Collection, Entity, Patch};
use crate::error::{StoreError, StoreResult};
use crate::id::IdGenerator;
use crate::index::{prefix_upper_bound, scan_prefix, Index, IndexEntry, IndexKey};
use crate::model::{Suite, SuiteStatus};

const CF_INDEXES: &str = "indexes";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("suiteline_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// One window of a descending index scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<E> {
    pub records: Vec<E>,
    /// Id of the last returned record, set only when more records follow.
    pub next_id: Option<String>,
}

/// Live (non-deleted) suites per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuiteCounts {
    pub running: usize,
    pub disconnected: usize,
    pub passed: usize,
    pub failed: usize,
}

impl SuiteCounts {
    pub fn finished(&self) -> usize {
        self.passed + self.failed
    }

    pub fn total(&self) -> usize {
        self.running + self.disconnected + self.passed + self.failed
    }

    fn add(&mut self, status: SuiteStatus) {
        match status {
            SuiteStatus::Running => self.running += 1,
            SuiteStatus::Disconnected => self.disconnected += 1,
            SuiteStatus::Passed => self.passed += 1,
            SuiteStatus::Failed => self.failed += 1,
        }
    }
}

/// Suites newest first, plus store-wide counts.
#[derive(Debug, Clone, PartialEq)]
pub struct SuitePage {
    pub suites: Vec<Suite>,
    pub next_id: Option<String>,
    /// Computed over every live suite, independent of the window and of
    /// `include_deleted`.
    pub counts: SuiteCounts,
}

/// Versioned document store.
///
/// Writers serialize on an internal mutex; readers go straight to RocksDB.
/// Each store owns its id generator and change bus, so several stores can
/// live side by side in one process.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    ids: IdGenerator,
    bus: Arc<ChangeBus>,
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        Self::open_with(config, IdGenerator::new(), Arc::new(ChangeBus::new()))
    }

    /// Open with an explicit id generator and change bus.
    pub fn open_with(
        config: StoreConfig,
        ids: IdGenerator,
        bus: Arc<ChangeBus>,
    ) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Collection::ALL
            .iter()
            .map(|c| c.as_str())
            .chain(std::iter::once(CF_INDEXES))
            .map(|name| ColumnFamilyDescriptor::new(name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        for collection in Collection::ALL {
            let names: Vec<&str> = Index::declared_for(collection).map(Index::name).collect();
            log::debug!("{collection}: indexes {names:?}");
        }
        log::info!("Document store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            ids,
            bus,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_block_size(16 * 1024);
        if name != CF_INDEXES {
            // Documents are fetched by id; index scans never ask for one key
            block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        // Records are already LZ4 framed by the codec
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            "logs" => opts.set_max_write_buffer_number(4),
            CF_INDEXES => {
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => opts.set_max_write_buffer_number(2),
        }

        opts
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Insert a new record and return its assigned id.
    ///
    /// The record gets a fresh id and `version = 0`.
    pub fn insert<E: Entity>(&self, mut record: E) -> StoreResult<String> {
        let _guard = self.lock()?;

        let id = self.ids.next_id();
        {
            let meta = record.meta_mut();
            meta.id = id.clone();
            meta.version = 0;
        }

        let value = codec::encode(&record)?;
        let change = Change::insert(E::COLLECTION, id.as_str(), codec::to_payload(&record)?);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.collection_cf(E::COLLECTION)?, id.as_bytes(), &value);
        self.put_index_entries(&mut batch, &id, &record.index_entries())?;
        self.write(batch)?;

        log::trace!("insert {}/{id}", E::COLLECTION);
        self.bus.publish(&change);
        Ok(id)
    }

    /// Merge `patch` into the record and bump its version.
    ///
    /// Returns the record as stored.
    pub fn update<E: Entity>(&self, id: &str, patch: &E::Patch) -> StoreResult<E> {
        if patch.is_empty() {
            return Err(StoreError::InvalidPatch {
                collection: E::COLLECTION,
                reason: "empty patch".to_string(),
            });
        }

        let _guard = self.lock()?;
        let mut record: E = self.load(id)?;
        patch
            .precondition(&record)
            .map_err(|reason| StoreError::Conflict {
                collection: E::COLLECTION,
                id: id.to_string(),
                reason,
            })?;
        patch
            .validate(&record)
            .map_err(|reason| StoreError::InvalidPatch {
                collection: E::COLLECTION,
                reason,
            })?;

        let stale = record.index_entries();
        let changed = patch.apply(&mut record)?;
        let change = self.bump(&mut record, changed)?;

        let mut batch = WriteBatch::default();
        self.stage_rewrite(&mut batch, &record, &stale)?;
        self.write(batch)?;

        log::trace!("update {}/{id} -> v{}", E::COLLECTION, record.version());
        self.bus.publish(&change);
        Ok(record)
    }

    /// Soft-delete a record.
    pub fn delete<E: Entity>(&self, id: &str, at: DateTime<Utc>) -> StoreResult<E> {
        let _guard = self.lock()?;
        let mut record: E = self.load(id)?;

        let stale = record.index_entries();
        let changed = Self::mark_deleted(&mut record, at)?;
        let change = self.bump(&mut record, changed)?;

        let mut batch = WriteBatch::default();
        self.stage_rewrite(&mut batch, &record, &stale)?;
        self.write(batch)?;

        log::debug!("delete {}/{id}", E::COLLECTION);
        self.bus.publish(&change);
        Ok(record)
    }

    /// Soft-delete every live record of the collection in one batch.
    ///
    /// Publishes one change per affected record. Returns how many were
    /// deleted.
    pub fn delete_all<E: Entity>(&self, at: DateTime<Utc>) -> StoreResult<usize> {
        let _guard = self.lock()?;
        let cf = self.collection_cf(E::COLLECTION)?;

        let mut batch = WriteBatch::default();
        let mut changes = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let mut record: E = codec::decode(&value)?;
            if record.is_deleted() {
                continue;
            }
            let stale = record.index_entries();
            let changed = Self::mark_deleted(&mut record, at)?;
            changes.push(self.bump(&mut record, changed)?);
            self.stage_rewrite(&mut batch, &record, &stale)?;
        }

        if !changes.is_empty() {
            self.write(batch)?;
        }

        log::info!("delete_all {}: {} records", E::COLLECTION, changes.len());
        for change in &changes {
            self.bus.publish(change);
        }
        Ok(changes.len())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Load one record by id, deleted or not.
    pub fn find<E: Entity>(&self, id: &str) -> StoreResult<E> {
        self.load(id)
    }

    /// Every record reachable through `index`, in ascending index order.
    pub fn find_all<E: Entity>(&self, index: Index, include_deleted: bool) -> StoreResult<Vec<E>> {
        self.find_all_by(index, &IndexKey::new(), include_deleted)
    }

    /// Records whose leading index components equal `filter`.
    pub fn find_all_by<E: Entity>(
        &self,
        index: Index,
        filter: &IndexKey,
        include_deleted: bool,
    ) -> StoreResult<Vec<E>> {
        Self::check_index::<E>(index)?;
        let mut records = Vec::new();
        self.scan_index(index, filter, Direction::Forward, None, |id| {
            let record: E = self.load_indexed(index, &id)?;
            if include_deleted || !record.is_deleted() {
                records.push(record);
            }
            Ok(true)
        })?;
        Ok(records)
    }

    /// Descending scan of `index` (restricted to `filter`), resuming strictly
    /// after `from_id` when given.
    ///
    /// `next_id` is set only when at least one more qualifying record exists
    /// past the window, so following it until `None` visits every record
    /// exactly once. A `limit` of 0 is treated as 1.
    pub fn page<E: Entity>(
        &self,
        index: Index,
        filter: &IndexKey,
        from_id: Option<&str>,
        limit: usize,
        include_deleted: bool,
    ) -> StoreResult<Page<E>> {
        Self::check_index::<E>(index)?;
        let limit = limit.max(1);

        let resume_key = match from_id {
            Some(id) => Some(self.cursor_key::<E>(index, id)?),
            None => None,
        };

        let mut records: Vec<E> = Vec::with_capacity(limit);
        let mut next_id = None;
        self.scan_index(index, filter, Direction::Reverse, resume_key, |id| {
            let record: E = self.load_indexed(index, &id)?;
            if record.is_deleted() && !include_deleted {
                return Ok(true);
            }
            if records.len() == limit {
                next_id = records.last().map(|r| r.id().to_string());
                return Ok(false);
            }
            records.push(record);
            Ok(true)
        })?;

        Ok(Page { records, next_id })
    }

    /// Suites ordered by `started_at` then id, newest first.
    pub fn page_suites(
        &self,
        from_id: Option<&str>,
        limit: usize,
        include_deleted: bool,
    ) -> StoreResult<SuitePage> {
        let page = self.page::<Suite>(
            Index::SuitesByStartedAt,
            &IndexKey::new(),
            from_id,
            limit,
            include_deleted,
        )?;
        Ok(SuitePage {
            suites: page.records,
            next_id: page.next_id,
            counts: self.suite_counts()?,
        })
    }

    /// Live suites per status, from the status index.
    pub fn suite_counts(&self) -> StoreResult<SuiteCounts> {
        let mut counts = SuiteCounts::default();
        self.scan_index(
            Index::SuitesByStatus,
            &IndexKey::new(),
            Direction::Forward,
            None,
            |id| {
                let suite: Suite = self.load_indexed(Index::SuitesByStatus, &id)?;
                if !suite.is_deleted() {
                    counts.add(suite.status);
                }
                Ok(true)
            },
        )?;
        Ok(counts)
    }

    /// Number of records in the collection.
    pub fn count<E: Entity>(&self, include_deleted: bool) -> StoreResult<usize> {
        let cf = self.collection_cf(E::COLLECTION)?;
        let mut n = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            if include_deleted {
                n += 1;
            } else {
                let record: E = codec::decode(&value)?;
                n += usize::from(!record.is_deleted());
            }
        }
        Ok(n)
    }

    // ─── Changes ──────────────────────────────────────────────────────

    /// Subscribe to every future mutation. See [`crate::bus`] for the
    /// backpressure contract.
    pub fn changes(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn lock(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &'static str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn collection_cf(&self, collection: Collection) -> StoreResult<&ColumnFamily> {
        self.cf(collection.as_str())
    }

    fn load<E: Entity>(&self, id: &str) -> StoreResult<E> {
        let cf = self.collection_cf(E::COLLECTION)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => codec::decode(&bytes),
            None => Err(StoreError::not_found(E::COLLECTION, id)),
        }
    }

    /// Load a record an index points at; a dangling entry is corruption.
    fn load_indexed<E: Entity>(&self, index: Index, id: &str) -> StoreResult<E> {
        self.load(id).map_err(|err| match err {
            StoreError::NotFound { .. } => StoreError::CorruptIndex(index.name()),
            other => other,
        })
    }

    fn check_index<E: Entity>(index: Index) -> StoreResult<()> {
        if index.collection() == E::COLLECTION {
            Ok(())
        } else {
            Err(StoreError::WrongIndex {
                index: index.name(),
                collection: E::COLLECTION,
            })
        }
    }

    /// Storage key of `id`'s entry in `index`, used as a page cursor.
    fn cursor_key<E: Entity>(&self, index: Index, id: &str) -> StoreResult<Vec<u8>> {
        let record: E = self.load(id)?;
        record
            .index_entries()
            .into_iter()
            .find(|entry| entry.index == index)
            .map(|entry| entry.storage_key(id))
            .ok_or(StoreError::WrongIndex {
                index: index.name(),
                collection: E::COLLECTION,
            })
    }

    /// Increment the version, record it among the changed fields, and build
    /// the change event for the new state.
    fn bump<E: Entity>(&self, record: &mut E, mut changed: ChangedFields) -> StoreResult<Change> {
        let version = record.version() + 1;
        record.meta_mut().version = version;
        set_field(&mut changed, "version", &version)?;
        Ok(Change::update(
            E::COLLECTION,
            record.id(),
            changed,
            codec::to_payload(record)?,
        ))
    }

    fn mark_deleted<E: Entity>(record: &mut E, at: DateTime<Utc>) -> StoreResult<ChangedFields> {
        let meta = record.meta_mut();
        meta.deleted = true;
        meta.deleted_at = Some(at);

        let mut changed = ChangedFields::new();
        set_field(&mut changed, "deleted", &true)?;
        set_field(&mut changed, "deleted_at", &at)?;
        Ok(changed)
    }

    /// Stage the primary record plus an index swap (stale out, fresh in).
    fn stage_rewrite<E: Entity>(
        &self,
        batch: &mut WriteBatch,
        record: &E,
        stale: &[IndexEntry],
    ) -> StoreResult<()> {
        let id = record.id();
        batch.put_cf(
            self.collection_cf(E::COLLECTION)?,
            id.as_bytes(),
            codec::encode(record)?,
        );

        let cf_idx = self.cf(CF_INDEXES)?;
        for entry in stale {
            batch.delete_cf(cf_idx, entry.storage_key(id));
        }
        self.put_index_entries(batch, id, &record.index_entries())
    }

    fn put_index_entries(
        &self,
        batch: &mut WriteBatch,
        id: &str,
        entries: &[IndexEntry],
    ) -> StoreResult<()> {
        let cf_idx = self.cf(CF_INDEXES)?;
        for entry in entries {
            batch.put_cf(cf_idx, entry.storage_key(id), id.as_bytes());
        }
        Ok(())
    }

    /// Walk the ids of `index` entries starting with `filter`.
    ///
    /// With `resume_after`, the walk starts strictly past that storage key.
    /// `visit` returns `false` to stop early.
    fn scan_index<F>(
        &self,
        index: Index,
        filter: &IndexKey,
        direction: Direction,
        resume_after: Option<Vec<u8>>,
        mut visit: F,
    ) -> StoreResult<()>
    where
        F: FnMut(String) -> StoreResult<bool>,
    {
        let cf = self.cf(CF_INDEXES)?;
        let prefix = scan_prefix(index, filter);

        let start = match (&resume_after, direction) {
            (Some(key), _) => Some(key.clone()),
            (None, Direction::Forward) => Some(prefix.clone()),
            (None, Direction::Reverse) => prefix_upper_bound(&prefix),
        };
        let mode = match &start {
            Some(key) => IteratorMode::From(key.as_slice(), direction),
            None => IteratorMode::End,
        };

        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            if resume_after.as_deref() == Some(&*key) {
                continue;
            }
            if !key.starts_with(&prefix) {
                // Reverse scans may start on the upper bound itself
                if matches!(direction, Direction::Reverse) && &*key > prefix.as_slice() {
                    continue;
                }
                break;
            }
            let id = String::from_utf8(value.into_vec())
                .map_err(|_| StoreError::CorruptIndex(index.name()))?;
            if !visit(id)? {
                break;
            }
        }
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
