//! Learns how long decodes take per (format, file size) so the UI can show
//! a progress estimate before a slow image finishes loading.
//!
//! Samples are grouped by a normalized format tag and a power-of-two size
//! bucket. The table is written to disk every few samples and read back at
//! startup; a broken or missing file just means starting from scratch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::datadir::LOAD_TIMES_FILE;

pub const MAX_SAMPLES: usize = 20;
pub const FLUSH_EVERY: usize = 5;
const BUCKET_BYTES: u64 = 256_000;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid load time data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no data directory to keep load times in")]
    MissingDataDir,
}

/// Canonical tag for a file extension or format name: `.jpg` and `jpeg`
/// become `JPEG`, `heic` becomes `HEIF`, anything else is upper-cased.
pub fn normalize_format(tag: &str) -> Option<String> {
    let bare = tag.trim().trim_start_matches('.');
    if bare.is_empty() {
        return None;
    }
    let tag = match bare.to_lowercase().as_str() {
        "jpg" | "jpeg" => "JPEG".to_string(),
        "heic" | "heif" => "HEIF".to_string(),
        "tif" | "tiff" => "TIFF".to_string(),
        _ => bare.to_uppercase(),
    };
    Some(tag)
}

/// Smallest power of two >= `size / 256000`, at least 1.
pub fn size_bucket(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(BUCKET_BYTES).max(1).next_power_of_two()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SampleKey {
    format: String,
    bucket: u64,
}

impl SampleKey {
    fn encode(&self) -> String {
        format!("{}_{}", self.format, self.bucket)
    }

    fn decode(s: &str) -> Option<Self> {
        let (format, bucket) = s.rsplit_once('_')?;
        let bucket: u64 = bucket.parse().ok()?;
        if format.is_empty() || bucket == 0 || !bucket.is_power_of_two() {
            return None;
        }
        Some(Self { format: format.to_string(), bucket })
    }
}

/// On-disk form: `{ "JPEG_4": [12.5, 14.0], ... }`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct StoredTimes {
    buckets: BTreeMap<String, StoredSamples>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredSamples {
    Millis(Vec<f64>),
    /// Anything else found under a key. Skipped when loading.
    Invalid(serde_json::Value),
}

#[derive(Default)]
struct Table {
    samples: HashMap<SampleKey, VecDeque<f64>>,
    unsaved: usize,
}

pub struct DurationEstimator {
    table: Mutex<Table>,
    store: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl DurationEstimator {
    /// Estimator that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            store: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Estimator backed by `path`. Whatever can be read from the file is
    /// loaded; failures are logged and leave the table empty.
    pub fn open(path: PathBuf) -> Self {
        let samples = if path.exists() {
            match load(&path) {
                Ok(samples) => {
                    log::info!("Loaded {} load time buckets from {}", samples.len(), path.display());
                    samples
                }
                Err(e) => {
                    log::warn!("Ignoring load time data in {}: {}", path.display(), e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Self {
            table: Mutex::new(Table { samples, unsaved: 0 }),
            store: Some(path),
            save_lock: Mutex::new(()),
        }
    }

    /// Estimator stored as `load_times.json` in `dir`.
    pub fn open_in(dir: Option<&Path>) -> Result<Self, PersistenceError> {
        let dir = dir.ok_or(PersistenceError::MissingDataDir)?;
        Ok(Self::open(dir.join(LOAD_TIMES_FILE)))
    }

    /// Expected decode time in ms, or 0.0 when nothing is known about this
    /// format yet.
    pub fn estimate(&self, format: &str, size_bytes: u64) -> f64 {
        let Some(format) = normalize_format(format) else { return 0.0 };
        let bucket = size_bucket(size_bytes);
        let table = self.table.lock().unwrap();

        let key = SampleKey { format, bucket };
        if let Some(samples) = table.samples.get(&key) {
            return mean(samples);
        }

        table
            .samples
            .iter()
            .filter(|(k, v)| k.format == key.format && !v.is_empty())
            .min_by_key(|(k, _)| (k.bucket.abs_diff(bucket), k.bucket))
            .map(|(_, v)| mean(v))
            .unwrap_or(0.0)
    }

    pub fn record(&self, format: &str, size_bytes: u64, millis: f64) {
        let Some(format) = normalize_format(format) else { return };
        if !millis.is_finite() || millis < 0.0 {
            return;
        }
        let key = SampleKey { format, bucket: size_bucket(size_bytes) };

        let flush = {
            let mut table = self.table.lock().unwrap();
            let samples = table.samples.entry(key).or_default();
            samples.push_back(millis);
            while samples.len() > MAX_SAMPLES {
                samples.pop_front();
            }
            table.unsaved += 1;
            table.unsaved % FLUSH_EVERY == 0
        };

        if flush {
            self.flush();
        }
    }

    /// Best-effort write of the current table.
    pub fn flush(&self) {
        if let Err(e) = self.save() {
            log::warn!("Failed to save load time data: {}", e);
        }
    }

    fn save(&self) -> Result<(), PersistenceError> {
        let Some(path) = &self.store else { return Ok(()) };

        // Snapshot under the save lock: the last write carries the newest table.
        let _guard = self.save_lock.lock().unwrap();
        let snapshot = StoredTimes {
            buckets: {
                let table = self.table.lock().unwrap();
                table
                    .samples
                    .iter()
                    .map(|(k, v)| (k.encode(), StoredSamples::Millis(v.iter().copied().collect())))
                    .collect()
            },
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(&snapshot)?;
        // Write next to the target and rename so a crash never leaves a
        // half-written file behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, path)?;
        log::debug!("Saved {} load time buckets to {}", snapshot.buckets.len(), path.display());
        Ok(())
    }
}

fn load(path: &Path) -> Result<HashMap<SampleKey, VecDeque<f64>>, PersistenceError> {
    let payload = fs::read_to_string(path)?;
    let doc: StoredTimes = serde_json::from_str(&payload)?;

    let mut samples = HashMap::new();
    for (raw_key, value) in doc.buckets {
        let Some(key) = SampleKey::decode(&raw_key) else {
            log::warn!("Skipping load time entry with bad key {:?}", raw_key);
            continue;
        };
        let values = match value {
            StoredSamples::Millis(v) => v,
            StoredSamples::Invalid(other) => {
                log::warn!("Skipping load time entry {:?}: not a list of numbers: {}", raw_key, other);
                continue;
            }
        };
        let mut list: VecDeque<f64> = values
            .into_iter()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .collect();
        while list.len() > MAX_SAMPLES {
            list.pop_front();
        }
        if !list.is_empty() {
            samples.insert(key, list);
        }
    }
    Ok(samples)
}

fn mean(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    #[test]
    fn format_tags() {
        assert_eq!(normalize_format(".jpg").as_deref(), Some("JPEG"));
        assert_eq!(normalize_format("JPEG").as_deref(), Some("JPEG"));
        assert_eq!(normalize_format(".HEIC").as_deref(), Some("HEIF"));
        assert_eq!(normalize_format("png").as_deref(), Some("PNG"));
        assert_eq!(normalize_format(".webp").as_deref(), Some("WEBP"));
        assert_eq!(normalize_format(""), None);
        assert_eq!(normalize_format("."), None);
    }

    #[test]
    fn buckets_are_powers_of_two() {
        assert_eq!(size_bucket(0), 1);
        assert_eq!(size_bucket(1), 1);
        assert_eq!(size_bucket(256_000), 1);
        assert_eq!(size_bucket(256_001), 2);
        assert_eq!(size_bucket(512_000), 2);
        assert_eq!(size_bucket(600_000), 4);
        assert_eq!(size_bucket(5 * MB), 32);
    }

    #[test]
    fn single_sample_is_the_estimate() {
        let est = DurationEstimator::in_memory();
        est.record("JPEG", 3 * MB, 120.0);
        assert_eq!(est.estimate("JPEG", 3 * MB), 120.0);
        assert_eq!(est.estimate(".jpg", 3 * MB), 120.0);
    }

    #[test]
    fn unknown_format_has_no_prediction() {
        let est = DurationEstimator::in_memory();
        est.record("JPEG", MB, 50.0);
        assert_eq!(est.estimate("PNG", MB), 0.0);
        assert_eq!(est.estimate("", MB), 0.0);
    }

    #[test]
    fn keeps_only_latest_samples() {
        let est = DurationEstimator::in_memory();
        est.record("PNG", MB, 1000.0);
        for _ in 0..MAX_SAMPLES {
            est.record("PNG", MB, 10.0);
        }
        assert_eq!(est.estimate("PNG", MB), 10.0);
    }

    #[test]
    fn mean_of_samples() {
        let est = DurationEstimator::in_memory();
        est.record("PNG", MB, 10.0);
        est.record("PNG", MB, 20.0);
        est.record("PNG", MB, 60.0);
        assert_eq!(est.estimate("PNG", MB), 30.0);
    }

    #[test]
    fn falls_back_to_nearest_bucket() {
        let est = DurationEstimator::in_memory();
        est.record("HEIF", 200_000, 40.0); // bucket 1
        est.record("HEIF", 30 * MB, 900.0); // bucket 128

        // bucket 4 is closer to 1 than to 128
        assert_eq!(est.estimate("heic", MB), 40.0);
        // bucket 64 is still one closer to 1 (63) than to 128 (64)
        assert_eq!(est.estimate("heic", 16 * MB), 40.0);
        // bucket 256 is closer to 128
        assert_eq!(est.estimate("heic", 40 * MB), 900.0);
    }

    #[test]
    fn no_data_dir_is_reported() {
        assert!(matches!(
            DurationEstimator::open_in(None),
            Err(PersistenceError::MissingDataDir)
        ));

        let dir = tempfile::tempdir().unwrap();
        let est = DurationEstimator::open_in(Some(dir.path())).unwrap();
        for _ in 0..FLUSH_EVERY {
            est.record("PNG", MB, 4.0);
        }
        assert!(dir.path().join(LOAD_TIMES_FILE).exists());
    }

    #[test]
    fn concurrent_flushes_keep_the_newest_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.json");
        let est = std::sync::Arc::new(DurationEstimator::open(path.clone()));

        let formats = ["PNG", "JPEG", "WEBP", "GIF"];
        let workers: Vec<_> = formats
            .into_iter()
            .map(|format| {
                let est = std::sync::Arc::clone(&est);
                std::thread::spawn(move || {
                    for i in 0..FLUSH_EVERY {
                        est.record(format, MB, 10.0 + i as f64);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        // The last flush fired after the last record, so the file is complete.
        let reloaded = DurationEstimator::open(path);
        for format in formats {
            assert_eq!(reloaded.estimate(format, MB), 12.0, "{format}");
        }
    }

    #[test]
    fn nearest_bucket_picks_closest_of_several() {
        let est = DurationEstimator::in_memory();
        est.record("PNG", 256_000, 5.0); // bucket 1
        est.record("PNG", 2 * MB, 80.0); // bucket 8
        est.record("PNG", 8 * MB, 300.0); // bucket 32
        assert_eq!(est.estimate("PNG", 1_100_000), 80.0); // bucket 8, exact
        assert_eq!(est.estimate("PNG", 1_000_000), 5.0); // bucket 4
        assert_eq!(est.estimate("PNG", 4 * MB), 80.0); // bucket 16
    }

    #[test]
    fn flushes_every_few_samples_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::datadir::LOAD_TIMES_FILE);

        let est = DurationEstimator::open(path.clone());
        for _ in 0..FLUSH_EVERY - 1 {
            est.record("JPEG", MB, 100.0);
        }
        assert!(!path.exists());
        est.record("JPEG", MB, 100.0);
        assert!(path.exists());

        let reloaded = DurationEstimator::open(path);
        assert_eq!(reloaded.estimate("JPEG", MB), 100.0);
    }

    #[test]
    fn persisted_keys_use_format_and_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.json");
        let est = DurationEstimator::open(path.clone());
        est.record("png", MB, 12.5);
        est.flush();

        let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["PNG_4"], serde_json::json!([12.5]));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.json");
        fs::write(&path, "{ not json").unwrap();

        let est = DurationEstimator::open(path);
        assert_eq!(est.estimate("JPEG", MB), 0.0);
        est.record("JPEG", MB, 7.0);
        assert_eq!(est.estimate("JPEG", MB), 7.0);
    }

    #[test]
    fn bad_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.json");
        fs::write(
            &path,
            r#"{ "JPEG_4": [10.0, 30.0], "PNG_x": [1.0], "GIF_2": "fast", "WEBP_3": [5.0] }"#,
        )
        .unwrap();

        let est = DurationEstimator::open(path);
        assert_eq!(est.estimate("JPEG", MB), 20.0);
        assert_eq!(est.estimate("GIF", MB), 0.0);
        assert_eq!(est.estimate("WEBP", MB), 0.0);
    }

    #[test]
    fn oversized_persisted_lists_are_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("times.json");
        let mut values = vec![1000.0];
        values.extend(std::iter::repeat_n(2.0, MAX_SAMPLES));
        fs::write(&path, serde_json::json!({ "PNG_1": values }).to_string()).unwrap();

        let est = DurationEstimator::open(path);
        assert_eq!(est.estimate("PNG", 1), 2.0);
    }

    #[test]
    fn unwritable_store_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("times.json");
        fs::create_dir(&path).unwrap();

        let est = DurationEstimator::open(path);
        for _ in 0..FLUSH_EVERY {
            est.record("PNG", MB, 3.0);
        }
        assert_eq!(est.estimate("PNG", MB), 3.0);
    }
}
