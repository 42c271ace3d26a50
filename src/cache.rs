use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::util;

pub const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_QUERY_CAPACITY: usize = 100;
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(60 * 60);

/// In-memory cache with a fixed TTL and bounded size.
/// When full, the oldest inserted key is evicted.
pub struct QueryCache<K, V> {
    entries: HashMap<K, (Instant, V)>,
    order: VecDeque<K>,
    ttl: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> QueryCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let (stored_at, value) = self.entries.get(key)?;
        if stored_at.elapsed() < self.ttl {
            Some(value.clone())
        } else {
            None
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, (Instant::now(), value));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for QueryCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TTL, DEFAULT_QUERY_CAPACITY)
    }
}

pub const CACHE_MAGIC: &[u8; 8] = b"RHCACHE1";
pub const CACHE_VERSION: u32 = 1;
const CACHE_EXT: &str = "cache";

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    version: u32,
    key: String,
    stored_at: u64,
    ttl_secs: u64,
    blake3_hash: [u8; 32],
    data: Vec<u8>,
}

impl CacheRecord {
    fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.stored_at) < self.ttl_secs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub files: usize,
    pub bytes: u64,
}

/// Persistent cache for fetched catalog manifests, one file per source location.
pub struct ManifestCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ManifestCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = blake3::hash(key.as_bytes()).to_hex();
        self.dir.join(format!("{}.{}", &name[..32], CACHE_EXT))
    }

    /// Fresh cached bytes for `key`, or `None` if missing, stale or damaged.
    pub fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.load_at(key, unix_now())
    }

    fn load_at(&self, key: &str, now: u64) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        let record = match read_record(&path) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!("Ignoring unreadable cache file {}: {:#}", path.display(), e);
                return None;
            }
        };
        if record.key != key {
            debug!("Cache key collision for {}", key);
            return None;
        }
        if !record.is_fresh(now) {
            debug!("Cache entry for {} expired", key);
            return None;
        }
        if util::hash_bytes(&record.data) != record.blake3_hash {
            warn!("Cache entry for {} failed integrity check", key);
            return None;
        }
        debug!("Cache hit for {}", key);
        Some(record.data)
    }

    pub fn store(&self, key: &str, data: &[u8]) -> Result<()> {
        self.store_at(key, data, unix_now())
    }

    fn store_at(&self, key: &str, data: &[u8], now: u64) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory: {}", self.dir.display()))?;

        let record = CacheRecord {
            version: CACHE_VERSION,
            key: key.to_string(),
            stored_at: now,
            ttl_secs: self.ttl.as_secs(),
            blake3_hash: util::hash_bytes(data),
            data: data.to_vec(),
        };
        let encoded = bincode::serialize(&record).context("Failed to serialize cache record")?;
        let compressed =
            zstd::bulk::compress(&encoded, 3).context("Failed to compress cache record")?;

        // Write to a sibling temp file first so readers never see a torn record.
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?;
        file.write_all(CACHE_MAGIC)?;
        file.write_all(&compressed)?;
        file.flush()?;

        let path = self.path_for(key);
        file.persist(&path)
            .with_context(|| format!("Failed to write cache file: {}", path.display()))?;
        debug!("Cached {} bytes for {}", data.len(), key);
        Ok(())
    }

    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.cache_files()? {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove cache file: {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove expired and unreadable cache files. Returns how many were removed.
    pub fn prune(&self) -> Result<usize> {
        self.prune_at(unix_now())
    }

    fn prune_at(&self, now: u64) -> Result<usize> {
        let mut removed = 0;
        for path in self.cache_files()? {
            let keep = matches!(read_record(&path), Ok(Some(record)) if record.is_fresh(now));
            if !keep {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove cache file: {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for path in self.cache_files()? {
            let meta = std::fs::metadata(&path)
                .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
            stats.files += 1;
            stats.bytes += meta.len();
        }
        Ok(stats)
    }

    fn cache_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry
                .with_context(|| format!("Failed to read cache directory {}", self.dir.display()))?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(CACHE_EXT)
            {
                files.push(path.to_path_buf());
            }
        }
        Ok(files)
    }
}

fn read_record(path: &Path) -> Result<Option<CacheRecord>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to read cache file: {}", path.display()))
        }
    };

    if raw.len() < CACHE_MAGIC.len() || &raw[..CACHE_MAGIC.len()] != CACHE_MAGIC {
        bail!("Invalid cache file: missing magic header");
    }

    let decoder =
        zstd::Decoder::new(&raw[CACHE_MAGIC.len()..]).context("Failed to create zstd decoder")?;
    let record: CacheRecord =
        bincode::deserialize_from(decoder).context("Failed to deserialize cache record")?;

    if record.version != CACHE_VERSION {
        bail!(
            "Unsupported cache version: {} (expected {})",
            record.version,
            CACHE_VERSION
        );
    }
    Ok(Some(record))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_cache_hit_and_expiry() {
        let mut cache: QueryCache<String, Vec<String>> = QueryCache::default();
        cache.insert("crystal".into(), vec!["crystal-clear".into()]);
        assert_eq!(cache.get(&"crystal".into()), Some(vec!["crystal-clear".to_string()]));
        assert_eq!(cache.get(&"emerald".into()), None);

        let mut expired: QueryCache<String, u32> = QueryCache::new(Duration::ZERO, 10);
        expired.insert("a".into(), 1);
        assert_eq!(expired.get(&"a".into()), None);
    }

    #[test]
    fn test_query_cache_evicts_oldest() {
        let mut cache: QueryCache<u32, u32> = QueryCache::new(DEFAULT_QUERY_TTL, 2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_query_cache_reinsert_refreshes_order() {
        let mut cache: QueryCache<u32, u32> = QueryCache::new(DEFAULT_QUERY_TTL, 2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(1, 11);
        cache.insert(3, 30);
        assert_eq!(cache.get(&1), Some(11));
        assert_eq!(cache.get(&2), None);
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), DEFAULT_MANIFEST_TTL);
        assert!(cache.load("https://example.org/manifest.json").is_none());

        cache.store("https://example.org/manifest.json", b"[]").unwrap();
        assert_eq!(
            cache.load("https://example.org/manifest.json").as_deref(),
            Some(&b"[]"[..])
        );
        assert!(cache.load("https://example.org/other.json").is_none());
        assert_eq!(cache.stats().unwrap().files, 1);
    }

    #[test]
    fn test_manifest_expiry_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), Duration::from_secs(3600));
        cache.store_at("old", b"[1]", 1_000).unwrap();
        cache.store_at("new", b"[2]", 10_000).unwrap();

        assert!(cache.load_at("old", 1_000 + 3599).is_some());
        assert!(cache.load_at("old", 1_000 + 3600).is_none());

        assert_eq!(cache.prune_at(10_000).unwrap(), 1);
        assert!(cache.load_at("new", 10_000).is_some());
        assert_eq!(cache.stats().unwrap().files, 1);
    }

    #[test]
    fn test_corrupt_file_ignored_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), DEFAULT_MANIFEST_TTL);
        cache.store("key", b"payload").unwrap();
        std::fs::write(cache.path_for("key"), b"garbage").unwrap();

        assert!(cache.load("key").is_none());
        assert_eq!(cache.prune().unwrap(), 1);
        assert_eq!(cache.stats().unwrap(), CacheStats::default());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::new(dir.path().join("nested"), DEFAULT_MANIFEST_TTL);
        assert_eq!(cache.clear().unwrap(), 0);
        cache.store("a", b"1").unwrap();
        cache.store("b", b"2").unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.load("a").is_none());
    }
}
