//! Partitioned on-disk cache.
//!
//! Each fetched result set lives in its own partition directory:
//!
//! ```text
//! <root>/<source>/<YYYY-MM|all>/<label>-<signature>/data-<version>.parquet
//!                                                  /meta.json
//!                                                  /accessed_at
//! ```
//!
//! Records are stored as Parquet so the tree can be queried in place by any
//! engine that reads `**/data-*.parquet` globs. `meta.json` names the current
//! data file and carries its SHA-256 and row count. A write lands a new
//! versioned data file first and then replaces `meta.json` by atomic rename,
//! so publishing a partition is a single rename and readers see either the
//! old pair or the new pair, never a mix.

pub mod partition;

pub use partition::PartitionKey;

use arrow::error::ArrowError;
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::ReaderBuilder;
use chrono::{DateTime, Duration, Utc};
use globset::GlobBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::reader::SerializedFileReader;
use parquet::record::reader::RowIter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::types::{Record, RecordIdentity, ScreenError};

/// Partition metadata file; its rename publishes the partition.
const META_FILE: &str = "meta.json";

/// Last read time of a partition, used for LRU eviction.
const ACCESS_FILE: &str = "accessed_at";

/// Prefix and extension of versioned data files.
const DATA_PREFIX: &str = "data-";
const DATA_EXT: &str = ".parquet";

/// Times a reader re-reads `meta.json` when the data file it names was
/// replaced underneath it.
const READ_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// Freshness
// ---------------------------------------------------------------------------

/// What a cached empty result means for a source type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyResultPolicy {
    /// An empty result is a valid answer and is served from cache.
    CacheEmpty,
    /// An empty cached result is ignored and refetched.
    Refetch,
}

/// Maximum acceptable age for a cached result, evaluated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub max_age: Duration,
    pub on_empty: EmptyResultPolicy,
}

impl FreshnessPolicy {
    pub fn hours(hours: i64, on_empty: EmptyResultPolicy) -> Self {
        Self {
            max_age: Duration::hours(hours),
            on_empty,
        }
    }

    /// Whether `entry` may be served instead of refetching.
    pub fn accepts(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        if entry.records.is_empty() && self.on_empty == EmptyResultPolicy::Refetch {
            return false;
        }
        entry.is_fresh(self.max_age, now)
    }
}

// ---------------------------------------------------------------------------
// Entries and metadata
// ---------------------------------------------------------------------------

/// A complete, checksum-verified partition.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records: Vec<Record>,
    pub written_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.written_at) <= max_age
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionMeta {
    key: String,
    written_at: DateTime<Utc>,
    row_count: usize,
    /// `None` for an empty result set.
    #[serde(default)]
    data_file: Option<String>,
    sha256: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

/// Summary of everything under the cache root.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub partitions: usize,
    pub rows: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct PartitionInfo {
    dir: PathBuf,
    bytes: u64,
    meta: Option<PartitionMeta>,
    accessed_at: Option<DateTime<Utc>>,
}

impl PartitionInfo {
    /// Most recent of last read and last write.
    fn last_used(&self) -> Option<DateTime<Utc>> {
        let written = self.meta.as_ref().map(|m| m.written_at);
        written.max(self.accessed_at)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Partitioned cache rooted at a directory.
///
/// Writers to the same partition are serialised by a per-partition lock;
/// readers take no lock and only ever observe whole published partitions.
pub struct CacheStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ScreenError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            ScreenError::Storage(format!("Failed to create cache dir {}: {e}", root.display()))
        })?;
        info!(root = %root.display(), "Cache store opened");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `records` as the partition for `key`, replacing any prior
    /// content. Records are de-duplicated on the key's identity fields
    /// (last write wins). Returns the number of rows stored.
    pub fn put(&self, key: &PartitionKey, records: &[Record]) -> Result<usize, ScreenError> {
        let lock = self.partition_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let rows = dedup_last_wins(records, key.identity());
        let body = if rows.is_empty() {
            Vec::new()
        } else {
            encode_parquet(&rows)?
        };

        let dir = self.root.join(key.relative_path());
        fs::create_dir_all(&dir).map_err(|e| {
            ScreenError::Storage(format!("Failed to create partition {}: {e}", dir.display()))
        })?;

        let data_file = if rows.is_empty() {
            None
        } else {
            let name = format!("{DATA_PREFIX}{}{DATA_EXT}", Uuid::new_v4().simple());
            write_atomic(&dir, &name, &body)?;
            Some(name)
        };

        let meta = PartitionMeta {
            key: key.to_string(),
            written_at: Utc::now(),
            row_count: rows.len(),
            data_file: data_file.clone(),
            sha256: hex::encode(Sha256::digest(&body)),
            params: key.params().clone(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| ScreenError::Storage(format!("Failed to encode metadata: {e}")))?;
        write_atomic(&dir, META_FILE, &meta_bytes)?;

        remove_stale_data_files(&dir, data_file.as_deref());

        debug!(
            partition = %key,
            rows = rows.len(),
            bytes = body.len(),
            dropped_duplicates = records.len() - rows.len(),
            "Cache partition written"
        );
        Ok(rows.len())
    }

    /// Read the partition for `key`. Missing, unreadable or corrupt
    /// partitions are all reported as `None`. A hit refreshes the
    /// partition's access time.
    pub fn get(&self, key: &PartitionKey) -> Option<CacheEntry> {
        let dir = self.root.join(key.relative_path());
        match read_partition(&dir) {
            Ok(Some(entry)) => {
                debug!(partition = %key, rows = entry.records.len(), "Cache hit");
                touch_access(&dir);
                Some(entry)
            }
            Ok(None) => {
                debug!(partition = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(partition = %key, error = %e, "Ignoring corrupt cache partition");
                None
            }
        }
    }

    /// Match partitions against a glob over `<source>/<bucket>/<label>-<sig>`.
    /// `*` stays within one path segment, `**` crosses segments.
    pub fn scan(&self, pattern: &str) -> Result<PartitionScan, ScreenError> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| ScreenError::Config(format!("Invalid partition pattern '{pattern}': {e}")))?
            .compile_matcher();

        let mut partitions: Vec<PathBuf> = self
            .partition_dirs()
            .into_iter()
            .filter(|dir| {
                dir.strip_prefix(&self.root)
                    .map(|rel| matcher.is_match(slash_path(rel)))
                    .unwrap_or(false)
            })
            .collect();
        partitions.sort();

        debug!(pattern, partitions = partitions.len(), "Cache scan");
        Ok(PartitionScan { partitions })
    }

    /// Delete one partition. Returns whether anything was removed.
    pub fn remove(&self, key: &PartitionKey) -> Result<bool, ScreenError> {
        let lock = self.partition_lock(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self.root.join(key.relative_path());
        if !dir.exists() {
            return Ok(false);
        }
        remove_dir(&dir)?;
        Ok(true)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for info in self.partitions() {
            stats.partitions += 1;
            stats.total_bytes += info.bytes;
            if let Some(meta) = &info.meta {
                stats.rows += meta.row_count;
                stats.oldest = Some(stats.oldest.map_or(meta.written_at, |o| o.min(meta.written_at)));
                stats.newest = Some(stats.newest.map_or(meta.written_at, |n| n.max(meta.written_at)));
            }
        }
        stats
    }

    /// Remove partitions written more than `max_age` ago, plus any whose
    /// metadata cannot be read. Returns the number removed.
    pub fn evict_older_than(&self, max_age: Duration) -> Result<usize, ScreenError> {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;
        for info in self.partitions() {
            let expired = info.meta.as_ref().map_or(true, |m| m.written_at < cutoff);
            if expired {
                remove_dir(&info.dir)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Evicted expired cache partitions");
        }
        Ok(removed)
    }

    /// Remove least recently used partitions until the cache fits in
    /// `max_bytes`. A partition's last use is its latest read or write.
    pub fn evict_to_size(&self, max_bytes: u64) -> Result<usize, ScreenError> {
        let mut partitions = self.partitions();
        let mut total: u64 = partitions.iter().map(|p| p.bytes).sum();
        if total <= max_bytes {
            return Ok(0);
        }

        // Unreadable metadata sorts first.
        partitions.sort_by_key(PartitionInfo::last_used);

        let mut removed = 0;
        for info in partitions {
            if total <= max_bytes {
                break;
            }
            remove_dir(&info.dir)?;
            total = total.saturating_sub(info.bytes);
            removed += 1;
        }
        info!(removed, remaining_bytes = total, max_bytes, "Evicted cache partitions to size");
        Ok(removed)
    }

    /// Remove every partition.
    pub fn clear(&self) -> Result<usize, ScreenError> {
        let dirs = self.partition_dirs();
        for dir in &dirs {
            remove_dir(dir)?;
        }
        info!(removed = dirs.len(), "Cache cleared");
        Ok(dirs.len())
    }

    fn partition_lock(&self, key: &PartitionKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Every directory holding a published partition.
    fn partition_dirs(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == META_FILE)
            .filter_map(|e| e.path().parent().map(Path::to_path_buf))
            .collect()
    }

    fn partitions(&self) -> Vec<PartitionInfo> {
        self.partition_dirs()
            .into_iter()
            .map(|dir| {
                let bytes = fs::read_dir(&dir)
                    .map(|entries| {
                        entries
                            .filter_map(Result::ok)
                            .filter_map(|e| e.metadata().ok())
                            .filter(|m| m.is_file())
                            .map(|m| m.len())
                            .sum()
                    })
                    .unwrap_or(0);
                let meta = read_meta(&dir).ok();
                let accessed_at = read_access(&dir);
                PartitionInfo {
                    dir,
                    bytes,
                    meta,
                    accessed_at,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Lazy scans
// ---------------------------------------------------------------------------

/// Partitions matched by [`CacheStore::scan`].
///
/// Iteration is lazy and restartable: every call to [`records`] re-opens
/// the matched data files and streams them row group by row group.
///
/// [`records`]: PartitionScan::records
#[derive(Debug, Clone)]
pub struct PartitionScan {
    partitions: Vec<PathBuf>,
}

impl PartitionScan {
    pub fn partitions(&self) -> &[PathBuf] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn records(&self) -> ScanRecords<'_> {
        ScanRecords {
            partitions: self.partitions.iter(),
            rows: None,
        }
    }
}

/// Streaming iterator over the records of a [`PartitionScan`].
pub struct ScanRecords<'a> {
    partitions: std::slice::Iter<'a, PathBuf>,
    rows: Option<RowIter<'static>>,
}

impl Iterator for ScanRecords<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            if let Some(rows) = self.rows.as_mut() {
                match rows.next() {
                    Some(Ok(row)) => match strip_nulls(row.to_json_value()) {
                        Value::Object(record) => return Some(record),
                        _ => continue,
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Stopped reading cache partition");
                        self.rows = None;
                        continue;
                    }
                    None => self.rows = None,
                }
            }

            let dir = self.partitions.next()?;
            match open_current_data(dir) {
                Ok(Some((_, Some(file)))) => match SerializedFileReader::new(file) {
                    Ok(reader) => self.rows = Some(RowIter::from_file_into(Box::new(reader))),
                    Err(e) => warn!(partition = %dir.display(), error = %e, "Unreadable partition skipped"),
                },
                Ok(_) => {}
                Err(e) => warn!(partition = %dir.display(), error = %e, "Partition vanished during scan"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parquet encoding
// ---------------------------------------------------------------------------

/// Encode records as one Parquet file, inferring the schema from the rows.
/// Columns with mixed scalar types are widened to strings.
fn encode_parquet(rows: &[&Record]) -> Result<Vec<u8>, ScreenError> {
    let encode = |e: &dyn std::fmt::Display| ScreenError::Storage(format!("Failed to encode records: {e}"));

    let values: Vec<Value> = rows.iter().map(|r| Value::Object((*r).clone())).collect();
    let schema = Arc::new(
        infer_json_schema_from_iterator(values.iter().map(Ok::<_, ArrowError>)).map_err(|e| encode(&e))?,
    );

    let mut decoder = ReaderBuilder::new(Arc::clone(&schema))
        .with_batch_size(values.len())
        .with_coerce_primitive(true)
        .build_decoder()
        .map_err(|e| encode(&e))?;
    decoder.serialize(&values).map_err(|e| encode(&e))?;
    let batch = decoder
        .flush()
        .map_err(|e| encode(&e))?
        .ok_or_else(|| ScreenError::Storage("Failed to encode records: no rows decoded".to_string()))?;

    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).map_err(|e| encode(&e))?;
    writer.write(&batch).map_err(|e| encode(&e))?;
    writer.into_inner().map_err(|e| encode(&e))
}

/// Decode a verified Parquet file back into records.
fn decode_parquet(dir: &Path, file: File) -> Result<Vec<Record>, ScreenError> {
    let reader = SerializedFileReader::new(file).map_err(|e| corrupt(dir, format!("bad parquet: {e}")))?;
    RowIter::from_file_into(Box::new(reader))
        .map(|row| {
            let row = row.map_err(|e| corrupt(dir, format!("bad row: {e}")))?;
            match strip_nulls(row.to_json_value()) {
                Value::Object(record) => Ok(record),
                other => Err(corrupt(dir, format!("row is not an object: {other}"))),
            }
        })
        .collect()
}

/// Drop null object members; Parquet fills absent fields with nulls.
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn corrupt(dir: &Path, message: impl Into<String>) -> ScreenError {
    ScreenError::CacheCorruption {
        path: dir.display().to_string(),
        message: message.into(),
    }
}

fn read_meta(dir: &Path) -> Result<PartitionMeta, ScreenError> {
    let bytes = fs::read(dir.join(META_FILE)).map_err(|e| corrupt(dir, e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| corrupt(dir, format!("bad metadata: {e}")))
}

/// Current metadata plus an open handle on the data file it names.
/// `Ok(None)` when the partition is missing; an empty partition yields
/// metadata with no file.
fn open_current_data(dir: &Path) -> Result<Option<(PartitionMeta, Option<File>)>, ScreenError> {
    for _ in 0..READ_ATTEMPTS {
        let meta = match fs::read(dir.join(META_FILE)) {
            Ok(bytes) => serde_json::from_slice::<PartitionMeta>(&bytes)
                .map_err(|e| corrupt(dir, format!("bad metadata: {e}")))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(corrupt(dir, e.to_string())),
        };
        let Some(name) = meta.data_file.clone() else {
            return Ok(Some((meta, None)));
        };
        match File::open(dir.join(&name)) {
            Ok(file) => return Ok(Some((meta, Some(file)))),
            // Replaced by a concurrent writer after we read the metadata.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(corrupt(dir, e.to_string())),
        }
    }
    Err(corrupt(dir, "data file kept changing during read"))
}

fn read_partition(dir: &Path) -> Result<Option<CacheEntry>, ScreenError> {
    let Some((meta, file)) = open_current_data(dir)? else {
        return Ok(None);
    };

    let mut body = Vec::new();
    if let Some(mut file) = file.as_ref() {
        file.read_to_end(&mut body).map_err(|e| corrupt(dir, e.to_string()))?;
    }
    let checksum = hex::encode(Sha256::digest(&body));
    if checksum != meta.sha256 {
        return Err(corrupt(dir, "checksum mismatch"));
    }

    let records = match file {
        Some(file) => decode_parquet(dir, file)?,
        None => Vec::new(),
    };
    if records.len() != meta.row_count {
        return Err(corrupt(
            dir,
            format!("expected {} rows, found {}", meta.row_count, records.len()),
        ));
    }

    Ok(Some(CacheEntry {
        records,
        written_at: meta.written_at,
    }))
}

fn read_access(dir: &Path) -> Option<DateTime<Utc>> {
    let raw = fs::read_to_string(dir.join(ACCESS_FILE)).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn touch_access(dir: &Path) {
    let now = Utc::now().to_rfc3339();
    if let Err(e) = write_atomic(dir, ACCESS_FILE, now.as_bytes()) {
        debug!(partition = %dir.display(), error = %e, "Failed to record cache access");
    }
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), ScreenError> {
    let target = dir.join(name);
    let storage = |e: &dyn std::fmt::Display| {
        ScreenError::Storage(format!("Failed to write {}: {e}", target.display()))
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| storage(&e))?;
    tmp.write_all(bytes).map_err(|e| storage(&e))?;
    tmp.as_file().sync_all().map_err(|e| storage(&e))?;
    tmp.persist(&target).map_err(|e| storage(&e))?;
    Ok(())
}

/// Delete data files no longer named by `meta.json`.
fn remove_stale_data_files(dir: &Path, current: Option<&str>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_data = name.starts_with(DATA_PREFIX) && name.ends_with(DATA_EXT);
        if is_data && Some(name.as_str()) != current {
            if let Err(e) = fs::remove_file(entry.path()) {
                debug!(file = %entry.path().display(), error = %e, "Failed to remove stale data file");
            }
        }
    }
}

fn remove_dir(dir: &Path) -> Result<(), ScreenError> {
    fs::remove_dir_all(dir).map_err(|e| {
        ScreenError::Storage(format!("Failed to remove partition {}: {e}", dir.display()))
    })
}

/// Relative path with `/` separators for glob matching.
fn slash_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Keep the last occurrence of each identity, in first-seen order of those
/// survivors.
fn dedup_last_wins<'a>(records: &'a [Record], identity: &RecordIdentity) -> Vec<&'a Record> {
    let keys: Vec<Option<(String, String)>> = records.iter().map(|r| identity.key_of(r)).collect();
    let mut last: HashMap<&(String, String), usize> = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            last.insert(key, i);
        }
    }
    records
        .iter()
        .zip(&keys)
        .enumerate()
        .filter(|(i, (_, key))| key.as_ref().map_or(true, |k| last.get(k) == Some(i)))
        .map(|(_, (record, _))| record)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FetchSpec, ParamValue, PartitionScheme};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    fn key_for(ticker: &str) -> PartitionKey {
        let spec = FetchSpec::new(
            "list_short_volume",
            vec![
                ("ticker", Some(ParamValue::from(ticker))),
                ("date.gte", Some(ParamValue::from("2024-03-01"))),
            ],
        )
        .with_partition(PartitionScheme {
            label_param: Some("ticker".into()),
            bucket_param: Some("date.gte".into()),
        })
        .with_identity(RecordIdentity::new(Some("ticker"), Some("date")));
        PartitionKey::for_spec(&spec)
    }

    fn store() -> (TempDir, CacheStore) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn data_files(store: &CacheStore, key: &PartitionKey) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(store.root().join(key.relative_path()))
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, store) = store();
        let key = key_for("GME");
        let rows = vec![
            record(json!({"ticker": "GME", "date": "2024-03-01", "ratio": 61.0})),
            record(json!({"ticker": "GME", "date": "2024-03-04", "ratio": 64.5})),
        ];
        assert_eq!(store.put(&key, &rows).unwrap(), 2);

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.records, rows);
        assert!(entry.is_fresh(Duration::minutes(1), Utc::now()));
    }

    #[test]
    fn test_get_missing_is_none() {
        let (_dir, store) = store();
        assert!(store.get(&key_for("AMC")).is_none());
    }

    #[test]
    fn test_put_deduplicates_last_write_wins() {
        let (_dir, store) = store();
        let key = key_for("GME");
        let rows = vec![
            record(json!({"ticker": "GME", "date": "2024-03-01", "ratio": 50.0})),
            record(json!({"ticker": "GME", "date": "2024-03-04", "ratio": 52.0})),
            record(json!({"ticker": "GME", "date": "2024-03-01", "ratio": 70.0})),
        ];
        assert_eq!(store.put(&key, &rows).unwrap(), 2);
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.records[0]["date"], json!("2024-03-04"));
        assert_eq!(entry.records[1]["ratio"], json!(70.0));
    }

    #[test]
    fn test_put_replaces_prior_content() {
        let (_dir, store) = store();
        let key = key_for("GME");
        store
            .put(&key, &[record(json!({"ticker": "GME", "date": "2024-03-01"}))])
            .unwrap();
        store.put(&key, &[]).unwrap();
        let entry = store.get(&key).unwrap();
        assert!(entry.records.is_empty());
    }

    #[test]
    fn test_corrupt_partition_is_a_miss() {
        let (_dir, store) = store();
        let key = key_for("GME");
        store
            .put(&key, &[record(json!({"ticker": "GME", "date": "2024-03-01"}))])
            .unwrap();
        let data = data_files(&store, &key).remove(0);
        fs::write(&data, b"PAR1 not really parquet PAR1").unwrap();
        assert!(store.get(&key).is_none());

        fs::write(store.root().join(key.relative_path()).join(META_FILE), b"{not json").unwrap();
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_scan_matches_glob() {
        let (_dir, store) = store();
        for ticker in ["GME", "AMC", "BB"] {
            store
                .put(
                    &key_for(ticker),
                    &[record(json!({"ticker": ticker, "date": "2024-03-01"}))],
                )
                .unwrap();
        }
        let all = store.scan("list_short_volume/**").unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.records().count(), 3);

        let one = store.scan("list_short_volume/2024-03/GME-*").unwrap();
        assert_eq!(one.len(), 1);
        let tickers: Vec<Record> = one.records().collect();
        assert_eq!(tickers[0]["ticker"], json!("GME"));

        assert!(store.scan("list_short_interest/**").unwrap().is_empty());
        // `*` does not cross segments
        assert!(store.scan("list_short_volume/*").unwrap().is_empty());
    }

    #[test]
    fn test_scan_is_restartable() {
        let (_dir, store) = store();
        let key = key_for("GME");
        store
            .put(&key, &[record(json!({"ticker": "GME", "date": "2024-03-01"}))])
            .unwrap();
        let scan = store.scan("**").unwrap();
        assert_eq!(scan.records().count(), 1);

        store
            .put(
                &key,
                &[
                    record(json!({"ticker": "GME", "date": "2024-03-01"})),
                    record(json!({"ticker": "GME", "date": "2024-03-04"})),
                ],
            )
            .unwrap();
        assert_eq!(scan.records().count(), 2);
    }

    #[test]
    fn test_scan_invalid_pattern() {
        let (_dir, store) = store();
        assert!(matches!(store.scan("a/[b"), Err(ScreenError::Config(_))));
    }

    #[test]
    fn test_freshness_policy() {
        let now = Utc::now();
        let fresh = CacheEntry {
            records: vec![record(json!({"a": 1}))],
            written_at: now - Duration::hours(1),
        };
        let stale = CacheEntry {
            records: vec![record(json!({"a": 1}))],
            written_at: now - Duration::hours(30),
        };
        let empty = CacheEntry {
            records: vec![],
            written_at: now,
        };
        let keep_empty = FreshnessPolicy::hours(24, EmptyResultPolicy::CacheEmpty);
        let refetch_empty = FreshnessPolicy::hours(24, EmptyResultPolicy::Refetch);

        assert!(keep_empty.accepts(&fresh, now));
        assert!(!keep_empty.accepts(&stale, now));
        assert!(keep_empty.accepts(&empty, now));
        assert!(!refetch_empty.accepts(&empty, now));
    }

    #[test]
    fn test_stats_and_remove() {
        let (_dir, store) = store();
        let gme = key_for("GME");
        store
            .put(&gme, &[record(json!({"ticker": "GME", "date": "2024-03-01"}))])
            .unwrap();
        store
            .put(&key_for("AMC"), &[record(json!({"ticker": "AMC", "date": "2024-03-01"}))])
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.partitions, 2);
        assert_eq!(stats.rows, 2);
        assert!(stats.total_bytes > 0);
        assert!(stats.oldest.is_some());

        assert!(store.remove(&gme).unwrap());
        assert!(!store.remove(&gme).unwrap());
        assert_eq!(store.stats().partitions, 1);
    }

    #[test]
    fn test_evict_older_than() {
        let (_dir, store) = store();
        store
            .put(&key_for("GME"), &[record(json!({"ticker": "GME", "date": "2024-03-01"}))])
            .unwrap();
        assert_eq!(store.evict_older_than(Duration::hours(1)).unwrap(), 0);
        assert_eq!(store.evict_older_than(Duration::seconds(-1)).unwrap(), 1);
        assert_eq!(store.stats().partitions, 0);
    }

    #[test]
    fn test_partition_is_one_parquet_file() {
        let (_dir, store) = store();
        let key = key_for("GME");
        let row = |ratio: f64| record(json!({"ticker": "GME", "date": "2024-03-01", "ratio": ratio}));
        store.put(&key, &[row(1.0)]).unwrap();
        store.put(&key, &[row(2.0)]).unwrap();

        let files = data_files(&store, &key);
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(DATA_PREFIX));

        let reader = SerializedFileReader::new(File::open(&files[0]).unwrap()).unwrap();
        let rows: Vec<Value> = RowIter::from_file_into(Box::new(reader))
            .map(|r| r.unwrap().to_json_value())
            .collect();
        assert_eq!(rows, vec![json!({"ticker": "GME", "date": "2024-03-01", "ratio": 2.0})]);
    }

    #[test]
    fn test_mixed_and_nested_values_round_trip() {
        let (_dir, store) = store();
        let key = key_for("GME");
        let rows = vec![
            record(json!({"ticker": "GME", "date": "2024-03-01", "volume": 10, "tags": ["a", "b"], "flag": true})),
            record(json!({"ticker": "GME", "date": "2024-03-04", "volume": 12.5, "extra": {"x": 1}})),
        ];
        store.put(&key, &rows).unwrap();

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.records.len(), 2);
        assert_eq!(entry.records[0]["tags"], json!(["a", "b"]));
        assert_eq!(entry.records[0]["flag"], json!(true));
        // Int and float in one column widen to float.
        assert_eq!(entry.records[0]["volume"].as_f64(), Some(10.0));
        assert_eq!(entry.records[1]["volume"].as_f64(), Some(12.5));
        // Absent fields stay absent.
        assert!(entry.records[0].get("extra").is_none());
        assert!(entry.records[1].get("flag").is_none());
        assert_eq!(entry.records[1]["extra"], json!({"x": 1}));
    }

    #[test]
    fn test_empty_partition_has_no_data_file() {
        let (_dir, store) = store();
        let key = key_for("ZZZZ");
        assert_eq!(store.put(&key, &[]).unwrap(), 0);
        assert!(data_files(&store, &key).is_empty());
        assert!(store.get(&key).unwrap().records.is_empty());
        assert_eq!(store.scan("**").unwrap().len(), 1);
        assert_eq!(store.scan("**").unwrap().records().count(), 0);
    }

    #[test]
    fn test_reader_never_sees_half_published_partition() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let key = key_for("GME");
        let rows = |n: usize| -> Vec<Record> {
            (0..n)
                .map(|d| record(json!({"ticker": "GME", "date": format!("2024-03-{:02}", d + 1), "ratio": d as f64})))
                .collect()
        };
        store.put(&key, &rows(1)).unwrap();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer = {
            let (store, key, done) = (Arc::clone(&store), key.clone(), Arc::clone(&done));
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.put(&key, &rows(1 + i % 5)).unwrap();
                }
                done.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        };

        let mut reads = 0;
        let mut misses = 0;
        while !done.load(std::sync::atomic::Ordering::SeqCst) {
            match store.get(&key) {
                Some(entry) => assert!((1..=5).contains(&entry.records.len())),
                None => misses += 1,
            }
            reads += 1;
        }
        writer.join().unwrap();
        assert!(reads > 0);
        assert_eq!(misses, 0);
        assert_eq!(data_files(&store, &key).len(), 1);
    }

    #[test]
    fn test_evict_to_size_prefers_recently_read() {
        let (_dir, store) = store();
        let old = key_for("OLD");
        let new = key_for("NEW");
        store
            .put(&old, &[record(json!({"ticker": "OLD", "date": "2024-03-01"}))])
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store
            .put(&new, &[record(json!({"ticker": "NEW", "date": "2024-03-01"}))])
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(store.get(&old).is_some());

        let total = store.stats().total_bytes;
        assert_eq!(store.evict_to_size(total - 1).unwrap(), 1);
        assert!(store.get(&new).is_none());
        assert!(store.get(&old).is_some());
    }

    #[test]
    fn test_evict_to_size_removes_oldest_first() {
        let (_dir, store) = store();
        let old = key_for("OLD");
        let new = key_for("NEW");
        store
            .put(&old, &[record(json!({"ticker": "OLD", "date": "2024-03-01"}))])
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store
            .put(&new, &[record(json!({"ticker": "NEW", "date": "2024-03-01"}))])
            .unwrap();

        let total = store.stats().total_bytes;
        assert_eq!(store.evict_to_size(total).unwrap(), 0);
        assert_eq!(store.evict_to_size(total - 1).unwrap(), 1);
        assert!(store.get(&old).is_none());
        assert!(store.get(&new).is_some());
    }

    #[test]
    fn test_clear() {
        let (_dir, store) = store();
        store
            .put(&key_for("GME"), &[record(json!({"ticker": "GME", "date": "2024-03-01"}))])
            .unwrap();
        assert_eq!(store.clear().unwrap(), 1);
        assert_eq!(store.stats(), CacheStats::default());
    }

    #[test]
    fn test_concurrent_writers_same_partition() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let key = key_for("GME");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    let rows: Vec<Record> = (0..=i)
                        .map(|d| record(json!({"ticker": "GME", "date": format!("2024-03-{:02}", d + 1)})))
                        .collect();
                    store.put(&key, &rows).unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Whichever writer finished last, the entry is one complete write.
        let entry = store.get(&key).unwrap();
        assert!((1..=8).contains(&entry.records.len()));
        let first = &entry.records[0];
        assert_eq!(first["date"], json!("2024-03-01"));
    }
}
