//! Disk Tier - Persistent Image Store
//!
//! One file per key under a dedicated directory, named `<hex-key>.img`.
//!
//! # Entry Layout
//!
//! ```text
//! ┌────────┬─────────┬──────────┬──────────────┬────────────┬─────────────┐
//! │ "IMGT" │ version │ reserved │ payload len  │ checksum   │ payload ... │
//! │ 4 B    │ 1 B     │ 3 B      │ u64 LE (8 B) │ sha256[..8]│             │
//! └────────┴─────────┴──────────┴──────────────┴────────────┴─────────────┘
//! ```
//!
//! Writes land in `<hex-key>.tmp` and are renamed into place, so a reader
//! sees either the previous entry or the complete new one. A short or
//! mismatching file is treated as a miss and deleted.
//!
//! # Accounting
//!
//! An in-memory index mirrors the directory (size and last-access per key)
//! so that `current_size` never touches the filesystem. Last access is also
//! written to the file mtime, which is how recency survives a restart.
//! Stores, evictions, sweeps and clears serialise on a single writer gate.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};

use super::key::CacheKey;
use super::metrics::{CacheMetrics, LatencyTracker};
use super::{DEFAULT_DISK_MAX_AGE_SECS, DEFAULT_DISK_MAX_BYTES, DEFAULT_EVICTION_TARGET_RATIO};
use crate::error::{Error, Result};

const ENTRY_MAGIC: &[u8; 4] = b"IMGT";
const FORMAT_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 8;

/// Size of the fixed entry header in bytes
pub const HEADER_LEN: usize = 4 + 1 + 3 + 8 + CHECKSUM_LEN;

const ENTRY_EXTENSION: &str = "img";
const TMP_EXTENSION: &str = "tmp";

/// Disk tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskTierConfig {
    /// Directory owned by the tier
    pub root: PathBuf,
    /// Byte budget; exceeding it triggers eviction
    pub max_bytes: u64,
    /// Entries idle longer than this are removed by `sweep_expired`
    pub max_age_secs: u64,
    /// Fraction of `max_bytes` that eviction shrinks down to
    pub eviction_target_ratio: f64,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        Self {
            root: default_cache_dir(),
            max_bytes: DEFAULT_DISK_MAX_BYTES,
            max_age_secs: DEFAULT_DISK_MAX_AGE_SECS,
            eviction_target_ratio: DEFAULT_EVICTION_TARGET_RATIO,
        }
    }
}

impl DiskTierConfig {
    /// Config rooted at `root` with default budgets
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Maximum idle age
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Size eviction shrinks down to
    pub fn eviction_target(&self) -> u64 {
        (self.max_bytes as f64 * self.eviction_target_ratio) as u64
    }
}

/// Default cache directory: `$XDG_CACHE_HOME/imgtier`, then `$HOME/.cache/imgtier`
pub fn default_cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(dir).join("imgtier");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".cache").join("imgtier");
    }
    std::env::temp_dir().join("imgtier")
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// File size including header
    size: u64,
    last_access: SystemTime,
}

/// Result of an eviction or sweep pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionResult {
    /// Number of files deleted
    pub files_deleted: usize,
    /// Total bytes freed
    pub bytes_freed: u64,
    /// Tier size before the pass
    pub size_before: u64,
    /// Tier size after the pass
    pub size_after: u64,
    /// Files that could not be deleted
    pub failures: usize,
    /// Duration of the pass in milliseconds
    pub duration_ms: u64,
}

enum ReadOutcome {
    Hit(Bytes),
    Missing,
    Corrupt(String),
    Failed(io::Error),
}

/// Disk tier - persistent cache directory
pub struct DiskTier {
    config: DiskTierConfig,
    index: DashMap<CacheKey, IndexEntry>,
    current_size: AtomicU64,
    writer_gate: tokio::sync::Mutex<()>,
    metrics: Arc<CacheMetrics>,
}

impl DiskTier {
    /// Open (or create) the tier directory with standalone metrics
    pub async fn open(config: DiskTierConfig) -> Result<Self> {
        Self::open_with_metrics(config, Arc::new(CacheMetrics::new())).await
    }

    /// Open the tier directory, rebuilding the index from what is on disk.
    ///
    /// Leftover temp files from an interrupted write are deleted. Entries
    /// idle past `max_age_secs` are swept before the tier is returned.
    pub async fn open_with_metrics(config: DiskTierConfig, metrics: Arc<CacheMetrics>) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.eviction_target_ratio) {
            return Err(Error::Config(format!(
                "eviction_target_ratio must be within 0..=1, got {}",
                config.eviction_target_ratio
            )));
        }

        let root = config.root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_directory(&root))
            .await
            .map_err(|e| Error::Internal(format!("disk scan task failed: {}", e)))??;

        let index = DashMap::with_capacity(scanned.len());
        let mut total = 0u64;
        for (key, entry) in scanned {
            total += entry.size;
            index.insert(key, entry);
        }

        info!(
            root = %config.root.display(),
            entries = index.len(),
            size_bytes = total,
            max_bytes = config.max_bytes,
            "Disk tier opened"
        );

        let tier = Self {
            config,
            index,
            current_size: AtomicU64::new(total),
            writer_gate: tokio::sync::Mutex::new(()),
            metrics,
        };

        tier.sweep_expired(tier.config.max_age()).await;
        if tier.current_size() > tier.config.max_bytes {
            tier.evict_to_target(tier.config.eviction_target()).await;
        }

        Ok(tier)
    }

    /// Path of the entry file for a key
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        entry_path(&self.config.root, key)
    }

    /// Read a payload.
    ///
    /// Missing, truncated and checksum-failing entries all read as a miss;
    /// the latter two are deleted.
    pub async fn load(&self, key: &CacheKey) -> Option<Bytes> {
        if !self.index.contains_key(key) {
            self.metrics.record_disk_miss();
            return None;
        }

        let tracker = LatencyTracker::start();
        let path = self.entry_path(key);
        let outcome = tokio::task::spawn_blocking(move || read_entry(&path))
            .await
            .unwrap_or_else(|e| ReadOutcome::Failed(io::Error::new(io::ErrorKind::Other, e)));

        match outcome {
            ReadOutcome::Hit(payload) => {
                if let Some(mut entry) = self.index.get_mut(key) {
                    entry.last_access = SystemTime::now();
                }
                self.metrics.record_disk_hit();
                self.metrics.record_disk_read_latency(tracker.elapsed());
                Some(payload)
            }
            ReadOutcome::Missing => {
                let _gate = self.writer_gate.lock().await;
                // A store may have recreated the file since the read
                let path = self.entry_path(key);
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    debug!(key = ?key, "Disk entry vanished, dropping from index");
                    self.forget(key);
                }
                self.metrics.record_disk_miss();
                None
            }
            ReadOutcome::Corrupt(reason) => {
                warn!(key = ?key, %reason, "Corrupt disk entry, removing");
                self.metrics.record_disk_corruption();
                self.metrics.record_disk_miss();
                let _gate = self.writer_gate.lock().await;
                self.delete_entry(key).await;
                None
            }
            ReadOutcome::Failed(e) => {
                warn!(key = ?key, error = %e, "Disk entry read failed");
                self.metrics.record_disk_miss();
                None
            }
        }
    }

    /// Persist a payload.
    ///
    /// Returns `false` when the entry could not be written; the failure is
    /// logged and counted but never surfaced to callers. Exceeding the byte
    /// budget afterwards evicts down to the configured target.
    pub async fn store(&self, key: CacheKey, payload: Bytes) -> bool {
        let file_len = (HEADER_LEN + payload.len()) as u64;
        if file_len > self.config.max_bytes {
            debug!(
                key = ?key,
                size = file_len,
                max_bytes = self.config.max_bytes,
                "Payload exceeds disk tier budget, not stored"
            );
            if self.index.contains_key(&key) {
                let _gate = self.writer_gate.lock().await;
                self.delete_entry(&key).await;
            }
            return false;
        }

        let _gate = self.writer_gate.lock().await;

        let root = self.config.root.clone();
        let written = tokio::task::spawn_blocking(move || write_entry(&root, &key, &payload))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|r| r);

        if let Err(e) = written {
            let err = Error::StorageWrite {
                path: self.entry_path(&key),
                reason: e.to_string(),
            };
            warn!(error = %err, "Disk tier write failed");
            self.metrics.record_disk_write_failure();
            return false;
        }

        let previous = self.index.insert(
            key,
            IndexEntry {
                size: file_len,
                last_access: SystemTime::now(),
            },
        );
        if let Some(previous) = previous {
            self.current_size.fetch_sub(previous.size, Ordering::Relaxed);
        }
        self.current_size.fetch_add(file_len, Ordering::Relaxed);
        self.metrics.record_disk_write(file_len);
        trace!(key = ?key, size = file_len, "Disk entry stored");

        if self.current_size() > self.config.max_bytes {
            let result = self.evict_locked(self.config.eviction_target()).await;
            log_eviction_result("Disk tier over budget, evicted", &result);
        }
        true
    }

    /// Delete one entry, returning whether it existed
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let _gate = self.writer_gate.lock().await;
        self.delete_entry(key).await
    }

    /// Delete every entry, returning how many were removed
    pub async fn clear(&self) -> usize {
        let _gate = self.writer_gate.lock().await;
        let keys: Vec<CacheKey> = self.index.iter().map(|e| *e.key()).collect();
        let root = self.config.root.clone();

        let deleted = tokio::task::spawn_blocking(move || delete_files(&root, keys))
            .await
            .unwrap_or_default();

        let removed = deleted.len();
        for key in &deleted {
            self.forget(key);
        }
        info!(removed, "Disk tier cleared");
        removed
    }

    /// Delete least-recently-accessed entries until the tier is at or below
    /// `target` bytes. Individual delete failures are skipped.
    pub async fn evict_to_target(&self, target: u64) -> EvictionResult {
        let _gate = self.writer_gate.lock().await;
        let result = self.evict_locked(target).await;
        if result.files_deleted > 0 {
            log_eviction_result("Disk tier evicted", &result);
        }
        result
    }

    /// Delete entries whose last access is older than `max_age`
    pub async fn sweep_expired(&self, max_age: Duration) -> EvictionResult {
        let start = Instant::now();
        let _gate = self.writer_gate.lock().await;
        let size_before = self.current_size();

        let now = SystemTime::now();
        let expired: Vec<(CacheKey, u64)> = self
            .index
            .iter()
            .filter(|e| {
                now.duration_since(e.value().last_access)
                    .map(|idle| idle > max_age)
                    .unwrap_or(false)
            })
            .map(|e| (*e.key(), e.value().size))
            .collect();

        let attempted = expired.len();
        let root = self.config.root.clone();
        let keys: Vec<CacheKey> = expired.iter().map(|(k, _)| *k).collect();
        let deleted = tokio::task::spawn_blocking(move || delete_files(&root, keys))
            .await
            .unwrap_or_default();

        let mut bytes_freed = 0;
        for key in &deleted {
            if let Some(entry) = self.forget(key) {
                bytes_freed += entry.size;
            }
        }

        let result = EvictionResult {
            files_deleted: deleted.len(),
            bytes_freed,
            size_before,
            size_after: self.current_size(),
            failures: attempted - deleted.len(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        if result.files_deleted > 0 {
            self.metrics.record_disk_expirations(result.files_deleted as u64);
            log_eviction_result("Disk tier swept expired entries", &result);
        }
        result
    }

    /// Touch an entry's recency without reading it
    #[cfg(test)]
    pub(crate) fn set_last_access(&self, key: &CacheKey, at: SystemTime) {
        if let Some(mut entry) = self.index.get_mut(key) {
            entry.last_access = at;
        }
        let _ = filetime::set_file_mtime(self.entry_path(key), FileTime::from_system_time(at));
    }

    /// Check for a key in the index
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Number of indexed entries
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Total bytes on disk, headers included
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Byte budget
    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }

    /// Tier directory
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Get configuration
    pub fn config(&self) -> &DiskTierConfig {
        &self.config
    }

    /// Get tier statistics
    pub fn stats(&self) -> DiskTierStats {
        let size = self.current_size();
        DiskTierStats {
            entries: self.entry_count(),
            size,
            max_bytes: self.config.max_bytes,
            utilization: if self.config.max_bytes == 0 {
                0.0
            } else {
                size as f64 / self.config.max_bytes as f64
            },
        }
    }

    // =========================================================================
    // Internals (callers hold the writer gate)
    // =========================================================================

    fn forget(&self, key: &CacheKey) -> Option<IndexEntry> {
        let (_, entry) = self.index.remove(key)?;
        self.current_size.fetch_sub(entry.size, Ordering::Relaxed);
        Some(entry)
    }

    async fn delete_entry(&self, key: &CacheKey) -> bool {
        let path = self.entry_path(key);
        let deleted = tokio::task::spawn_blocking(move || remove_file_if_present(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|r| r);

        match deleted {
            Ok(()) => self.forget(key).is_some(),
            Err(e) => {
                warn!(key = ?key, error = %e, "Failed to delete disk entry");
                false
            }
        }
    }

    async fn evict_locked(&self, target: u64) -> EvictionResult {
        let start = Instant::now();
        let size_before = self.current_size();
        if size_before <= target {
            return EvictionResult {
                size_before,
                size_after: size_before,
                ..Default::default()
            };
        }

        let mut candidates: Vec<(CacheKey, SystemTime, u64)> = self
            .index
            .iter()
            .map(|e| (*e.key(), e.value().last_access, e.value().size))
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let root = self.config.root.clone();
        let (deleted, failures) = tokio::task::spawn_blocking(move || {
            evict_oldest_blocking(&root, candidates, size_before, target)
        })
        .await
        .unwrap_or_default();

        let mut bytes_freed = 0;
        for key in &deleted {
            if let Some(entry) = self.forget(key) {
                bytes_freed += entry.size;
            }
        }
        self.metrics.record_disk_evictions(deleted.len() as u64);

        EvictionResult {
            files_deleted: deleted.len(),
            bytes_freed,
            size_before,
            size_after: self.current_size(),
            failures,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Disk tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct DiskTierStats {
    pub entries: usize,
    pub size: u64,
    pub max_bytes: u64,
    pub utilization: f64,
}

fn log_eviction_result(message: &str, result: &EvictionResult) {
    info!(
        files_deleted = result.files_deleted,
        bytes_freed = result.bytes_freed,
        size_before = result.size_before,
        size_after = result.size_after,
        failures = result.failures,
        duration_ms = result.duration_ms,
        "{}",
        message
    );
}

// =============================================================================
// Blocking filesystem helpers
// =============================================================================

fn entry_path(root: &Path, key: &CacheKey) -> PathBuf {
    root.join(format!("{}.{}", key.to_hex(), ENTRY_EXTENSION))
}

fn tmp_path(root: &Path, key: &CacheKey) -> PathBuf {
    root.join(format!("{}.{}", key.to_hex(), TMP_EXTENSION))
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

fn encode_header(payload: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(ENTRY_MAGIC);
    header[4] = FORMAT_VERSION;
    header[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    header[16..].copy_from_slice(&checksum(payload));
    header
}

fn decode_entry(raw: Bytes) -> std::result::Result<Bytes, String> {
    if raw.len() < HEADER_LEN {
        return Err(format!("short header ({} bytes)", raw.len()));
    }
    if &raw[..4] != ENTRY_MAGIC {
        return Err("bad magic".to_string());
    }
    if raw[4] != FORMAT_VERSION {
        return Err(format!("unsupported format version {}", raw[4]));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&raw[8..16]);
    let expected = u64::from_le_bytes(len_bytes);
    let actual = (raw.len() - HEADER_LEN) as u64;
    if expected != actual {
        return Err(format!("length mismatch: header says {}, found {}", expected, actual));
    }

    let payload = raw.slice(HEADER_LEN..);
    if checksum(&payload) != raw[16..HEADER_LEN] {
        return Err("checksum mismatch".to_string());
    }
    Ok(payload)
}

fn read_entry(path: &Path) -> ReadOutcome {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ReadOutcome::Missing,
        Err(e) => return ReadOutcome::Failed(e),
    };

    match decode_entry(Bytes::from(raw)) {
        Ok(payload) => {
            // Best effort: recency in the index is authoritative while running
            if let Err(e) = filetime::set_file_mtime(path, FileTime::now()) {
                trace!(path = %path.display(), error = %e, "Failed to touch disk entry");
            }
            ReadOutcome::Hit(payload)
        }
        Err(reason) => ReadOutcome::Corrupt(reason),
    }
}

fn write_entry(root: &Path, key: &CacheKey, payload: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(root)?;
    let tmp = tmp_path(root, key);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&encode_header(payload))?;
        file.write_all(payload)?;
        file.sync_all()?;
        std::fs::rename(&tmp, entry_path(root, key))
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete entry files, returning the keys whose files are gone
fn delete_files(root: &Path, keys: Vec<CacheKey>) -> Vec<CacheKey> {
    keys.into_iter()
        .filter(|key| match remove_file_if_present(&entry_path(root, key)) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = ?key, error = %e, "Failed to delete disk entry");
                false
            }
        })
        .collect()
}

/// Delete candidates (oldest first) until `current` drops to `target`
fn evict_oldest_blocking(
    root: &Path,
    candidates: Vec<(CacheKey, SystemTime, u64)>,
    mut current: u64,
    target: u64,
) -> (Vec<CacheKey>, usize) {
    let mut deleted = Vec::new();
    let mut failures = 0;

    for (key, _, size) in candidates {
        if current <= target {
            break;
        }
        match remove_file_if_present(&entry_path(root, &key)) {
            Ok(()) => {
                current = current.saturating_sub(size);
                deleted.push(key);
            }
            Err(e) => {
                debug!(key = ?key, error = %e, "Failed to evict disk entry, skipping");
                failures += 1;
            }
        }
    }
    (deleted, failures)
}

/// Rebuild the index from the directory, removing stale temp files
fn scan_directory(root: &Path) -> Result<Vec<(CacheKey, IndexEntry)>> {
    std::fs::create_dir_all(root)?;
    let mut found = Vec::new();

    for dir_entry in std::fs::read_dir(root)? {
        let dir_entry = match dir_entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        let path = dir_entry.path();
        let extension = path.extension().and_then(|e| e.to_str());

        if extension == Some(TMP_EXTENSION) {
            debug!(path = %path.display(), "Removing leftover temp file");
            let _ = std::fs::remove_file(&path);
            continue;
        }
        if extension != Some(ENTRY_EXTENSION) {
            continue;
        }

        let Some(key) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(CacheKey::from_hex)
        else {
            continue;
        };

        let metadata = match dir_entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let last_access = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        found.push((
            key,
            IndexEntry {
                size: metadata.len(),
                last_access,
            },
        ));
    }

    Ok(found)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::derive_key;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_bytes: u64) -> DiskTierConfig {
        DiskTierConfig {
            root: dir.path().join("images"),
            max_bytes,
            max_age_secs: 3600,
            eviction_target_ratio: 0.8,
        }
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![0x5A; len])
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        let key = derive_key("https://cdn.example.com/a.png");

        assert!(tier.store(key, payload(1000)).await);
        assert!(tier.entry_path(&key).exists());
        assert_eq!(tier.current_size(), (HEADER_LEN + 1000) as u64);

        let loaded = tier.load(&key).await.unwrap();
        assert_eq!(loaded.len(), 1000);
        assert!(loaded.iter().all(|b| *b == 0x5A));
    }

    #[tokio::test]
    async fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        assert!(tier.load(&derive_key("nothing")).await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_adjusts_size() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        let key = derive_key("a");

        tier.store(key, payload(500)).await;
        tier.store(key, payload(100)).await;

        assert_eq!(tier.entry_count(), 1);
        assert_eq!(tier.current_size(), (HEADER_LEN + 100) as u64);
    }

    #[tokio::test]
    async fn test_truncated_entry_is_miss_and_removed() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        let key = derive_key("truncated");
        tier.store(key, payload(1000)).await;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(tier.entry_path(&key))
            .unwrap();
        file.set_len(HEADER_LEN as u64 + 10).unwrap();

        assert!(tier.load(&key).await.is_none());
        assert!(!tier.entry_path(&key).exists());
        assert!(!tier.contains(&key));
        assert_eq!(tier.current_size(), 0);
    }

    #[tokio::test]
    async fn test_flipped_byte_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        let key = derive_key("flipped");
        tier.store(key, payload(64)).await;

        let path = tier.entry_path(&key);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        assert!(tier.load(&key).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_store_over_budget_evicts_oldest_to_target() {
        let dir = TempDir::new().unwrap();
        let entry_size = (HEADER_LEN + 1000) as u64;
        // Room for four entries; target is 80% of that
        let tier = DiskTier::open(config(&dir, entry_size * 4)).await.unwrap();

        let keys: Vec<_> = (0..4).map(|i| derive_key(&format!("img-{}", i))).collect();
        let base = SystemTime::now() - Duration::from_secs(100);
        for (i, key) in keys.iter().enumerate() {
            tier.store(*key, payload(1000)).await;
            tier.set_last_access(key, base + Duration::from_secs(i as u64));
        }
        assert_eq!(tier.current_size(), entry_size * 4);

        let newest = derive_key("img-new");
        tier.store(newest, payload(1000)).await;

        assert!(tier.current_size() <= tier.config().eviction_target());
        // Oldest two gone, newest kept
        assert!(!tier.contains(&keys[0]));
        assert!(!tier.contains(&keys[1]));
        assert!(tier.contains(&keys[3]));
        assert!(tier.contains(&newest));
        assert!(!tier.entry_path(&keys[0]).exists());
    }

    #[tokio::test]
    async fn test_evict_to_target_noop_when_under() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        tier.store(derive_key("a"), payload(10)).await;

        let result = tier.evict_to_target(1 << 19).await;
        assert_eq!(result.files_deleted, 0);
        assert_eq!(tier.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_not_stored() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 100)).await.unwrap();
        assert!(!tier.store(derive_key("big"), payload(200)).await);
        assert_eq!(tier.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_replacement_deletes_previous_entry() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 2000)).await.unwrap();
        let key = derive_key("avatar");

        assert!(tier.store(key, payload(100)).await);
        assert!(!tier.store(key, payload(3000)).await);

        assert!(!tier.contains(&key));
        assert!(!tier.entry_path(&key).exists());
        assert_eq!(tier.current_size(), 0);
        assert!(tier.load(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_vanished_file_dropped_from_index() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        let (gone, kept) = (derive_key("gone"), derive_key("kept"));
        tier.store(gone, payload(100)).await;
        tier.store(kept, payload(100)).await;

        std::fs::remove_file(tier.entry_path(&gone)).unwrap();
        assert!(tier.load(&gone).await.is_none());

        assert!(!tier.contains(&gone));
        assert_eq!(tier.entry_count(), 1);
        assert_eq!(tier.current_size(), (HEADER_LEN + 100) as u64);
        assert!(tier.load(&kept).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        let (old, fresh) = (derive_key("old"), derive_key("fresh"));
        tier.store(old, payload(10)).await;
        tier.store(fresh, payload(10)).await;
        tier.set_last_access(&old, SystemTime::now() - Duration::from_secs(7200));

        let result = tier.sweep_expired(Duration::from_secs(3600)).await;

        assert_eq!(result.files_deleted, 1);
        assert!(!tier.contains(&old));
        assert!(tier.contains(&fresh));
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let dir = TempDir::new().unwrap();
        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        let (a, b, c) = (derive_key("a"), derive_key("b"), derive_key("c"));
        for key in [a, b, c] {
            tier.store(key, payload(10)).await;
        }

        assert!(tier.remove(&a).await);
        assert!(!tier.remove(&a).await);
        assert_eq!(tier.clear().await, 2);
        assert_eq!(tier.current_size(), 0);
        assert!(!tier.entry_path(&b).exists());
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index_and_drops_temp_files() {
        let dir = TempDir::new().unwrap();
        let key = derive_key("persisted");
        {
            let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
            tier.store(key, payload(256)).await;
        }
        let stray = dir.path().join("images").join("deadbeef.tmp");
        std::fs::write(&stray, b"partial").unwrap();

        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        assert!(tier.contains(&key));
        assert_eq!(tier.current_size(), (HEADER_LEN + 256) as u64);
        assert!(!stray.exists());
        assert_eq!(tier.load(&key).await.map(|p| p.len()), Some(256));
    }

    #[tokio::test]
    async fn test_open_sweeps_files_past_max_age() {
        let dir = TempDir::new().unwrap();
        let key = derive_key("stale");
        {
            let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
            tier.store(key, payload(16)).await;
            tier.set_last_access(&key, SystemTime::now() - Duration::from_secs(86_400));
        }

        let tier = DiskTier::open(config(&dir, 1 << 20)).await.unwrap();
        assert!(!tier.contains(&key));
    }

    #[tokio::test]
    async fn test_rejects_bad_target_ratio() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 1024);
        cfg.eviction_target_ratio = 1.5;
        assert!(matches!(DiskTier::open(cfg).await, Err(Error::Config(_))));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut raw = encode_header(b"abc").to_vec();
        raw.extend_from_slice(b"abc");
        assert!(decode_entry(Bytes::from(raw.clone())).is_ok());
        raw[0] = b'X';
        assert_eq!(decode_entry(Bytes::from(raw)).unwrap_err(), "bad magic");
    }
}
