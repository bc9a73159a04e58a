use crate::{EndpointDescriptor, Error, Task};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Deterministic fingerprint of one trial's configuration.
///
/// Two trials with equal keys are the same trial: the second one is served
/// from the [`TrialCache`] instead of re-running the load generator. The key
/// doubles as the result file's relative path, partitioned by task and
/// hardware type for human inspection:
///
/// ```text
/// <task>/<hw_type>/<vendor>_<hw_type>_<image|none>_<engine>_<batch_size>_<vus>.json
/// ```
///
/// Keys are pure functions of their inputs, so they are stable across
/// process restarts and independent sessions share cached results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrialKey {
    task: Task,
    hw_type: String,
    vendor: String,
    image: Option<String>,
    engine: String,
    batch_size: u32,
    vus: usize,
}

impl TrialKey {
    /// Fingerprint a trial at `vus` virtual users against `endpoint`.
    pub fn new(task: Task, endpoint: &EndpointDescriptor, vus: usize) -> Self {
        Self {
            task,
            hw_type: endpoint.hw_type.clone(),
            vendor: endpoint.vendor.clone(),
            image: endpoint.image.clone(),
            engine: endpoint.engine.clone(),
            batch_size: endpoint.batch_size,
            vus,
        }
    }

    /// The VU count this key fingerprints.
    pub fn vus(&self) -> usize {
        self.vus
    }

    /// The result file path relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        let image = self.image.as_deref().unwrap_or("none");
        let file = format!(
            "{}_{}_{}_{}_{}_{}.json",
            sanitize(&self.vendor),
            sanitize(&self.hw_type),
            sanitize(image),
            sanitize(&self.engine),
            self.batch_size,
            self.vus,
        );
        [self.task.as_str(), &sanitize(&self.hw_type), &file]
            .iter()
            .collect()
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path().display())
    }
}

/// Keep key components single path segments.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// One measured trial, as written by the load generator.
///
/// Only `throughput_req_per_sec` is interpreted; every other field of the
/// generator's JSON output is carried in `raw` and preserved on round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// Successfully completed requests per second.
    pub throughput_req_per_sec: f64,
    /// Opaque raw metrics emitted alongside the throughput.
    #[serde(flatten)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl TrialResult {
    /// A result carrying only a throughput and no raw metrics.
    pub fn new(throughput_req_per_sec: f64) -> Self {
        Self {
            throughput_req_per_sec,
            raw: serde_json::Map::new(),
        }
    }
}

/// Durable key-value store of trial results, one JSON file per [`TrialKey`].
///
/// The cache may be shared across independent search sessions targeting the
/// same hardware/engine/batch-size combination; each key is written at most
/// once per session and writes are idempotent overwrites, so no locking is
/// involved. Concurrent writers to the same key from independent processes
/// are unsupported (last write wins).
#[derive(Debug, Clone)]
pub struct TrialCache {
    root: PathBuf,
}

impl TrialCache {
    /// Open a cache rooted at `root`. The directory is created lazily on the
    /// first [`store`](TrialCache::store).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The absolute location of `key`'s result file.
    ///
    /// This is also handed to the load generator as its `results_file`, so
    /// the generator writes straight into the cache slot.
    pub fn path_for(&self, key: &TrialKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Look up a previously measured result.
    ///
    /// A missing entry is `Ok(None)`; an unreadable or malformed entry is an
    /// error, which callers may treat as a miss if re-running the trial is
    /// acceptable.
    pub fn lookup(&self, key: &TrialKey) -> Result<Option<TrialResult>, Error> {
        let path = self.path_for(key);
        let payload = match fs::read(&path) {
            Ok(payload) => payload,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::CacheIo { path, source }),
        };
        let result = serde_json::from_slice(&payload)
            .map_err(|source| Error::CacheFormat { path, source })?;
        Ok(Some(result))
    }

    /// Persist `result` under `key`, creating parent directories as needed.
    ///
    /// Storing the same result twice is a no-op; storing a different result
    /// for an existing key overwrites it.
    pub fn store(&self, key: &TrialKey, result: &TrialResult) -> Result<(), Error> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::CacheIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let payload = serde_json::to_vec_pretty(result)
            .map_err(|source| Error::CacheFormat {
                path: path.clone(),
                source,
            })?;
        fs::write(&path, payload).map_err(|source| Error::CacheIo { path, source })?;
        Ok(())
    }

    /// Ensure the directory `key`'s result file lives in exists, so an
    /// external writer can create the file directly.
    pub(crate) fn prepare_slot(&self, key: &TrialKey) -> Result<PathBuf, Error> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::CacheIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(path)
    }
}

#[cfg(test)]
fn endpoint(image: Option<&str>) -> EndpointDescriptor {
    EndpointDescriptor {
        hw_type: "nvidia-l4".to_owned(),
        vendor: "aws".to_owned(),
        engine: "torch".to_owned(),
        batch_size: 32,
        base_url: "https://example.test".to_owned(),
        image: image.map(str::to_owned),
    }
}

#[test]
fn key_path_is_stable() {
    let key = TrialKey::new(Task::Classification, &endpoint(None), 8);
    assert_eq!(
        key.relative_path(),
        std::path::Path::new("classification/nvidia-l4/aws_nvidia-l4_none_torch_32_8.json")
    );
    // same inputs, same key
    assert_eq!(key, TrialKey::new(Task::Classification, &endpoint(None), 8));
}

#[test]
fn image_reference_stays_one_path_segment() {
    let key = TrialKey::new(
        Task::Embedding,
        &endpoint(Some("ghcr.io/org/infinity:1.2")),
        4,
    );
    let path = key.relative_path();
    assert_eq!(path.components().count(), 3);
    assert!(path
        .to_str()
        .unwrap()
        .contains("ghcr.io-org-infinity-1.2"));
}

#[test]
fn round_trip_preserves_raw_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TrialCache::new(dir.path());
    let key = TrialKey::new(Task::Classification, &endpoint(None), 16);

    let mut result = TrialResult::new(42.5);
    result
        .raw
        .insert("p95_latency_ms".to_owned(), serde_json::json!(87.2));
    cache.store(&key, &result).unwrap();

    let loaded = cache.lookup(&key).unwrap().unwrap();
    assert_eq!(loaded.throughput_req_per_sec, 42.5);
    assert_eq!(loaded, result);
}

#[test]
fn store_is_idempotent_and_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TrialCache::new(dir.path());
    let key = TrialKey::new(Task::Embedding, &endpoint(None), 2);

    cache.store(&key, &TrialResult::new(10.0)).unwrap();
    cache.store(&key, &TrialResult::new(10.0)).unwrap();
    assert_eq!(
        cache.lookup(&key).unwrap().unwrap().throughput_req_per_sec,
        10.0
    );

    // last writer wins
    cache.store(&key, &TrialResult::new(11.0)).unwrap();
    assert_eq!(
        cache.lookup(&key).unwrap().unwrap().throughput_req_per_sec,
        11.0
    );
}

#[test]
fn missing_entry_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TrialCache::new(dir.path());
    let key = TrialKey::new(Task::Classification, &endpoint(None), 1);
    assert_eq!(cache.lookup(&key).unwrap(), None);
}

#[test]
fn malformed_entry_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TrialCache::new(dir.path());
    let key = TrialKey::new(Task::Classification, &endpoint(None), 1);

    let path = cache.prepare_slot(&key).unwrap();
    fs::write(&path, b"not json").unwrap();
    assert!(matches!(
        cache.lookup(&key),
        Err(Error::CacheFormat { .. })
    ));
}
