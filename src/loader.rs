use std::collections::{HashMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::decode::{
    extension_of, CancelToken, DecodeError, DecodedImage, DecoderRegistry, PixelBuffer,
};
use crate::estimator::{normalize_format, DurationEstimator};

pub const DEFAULT_PRELOAD_DEPTH: usize = 2;
pub const DEFAULT_SAFE_RANGE: usize = 4;

// ---------------------------------------------------------------------------
// Cache entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Empty,
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    #[default]
    Fit,
    Original,
    Free,
}

impl ScaleMode {
    pub fn cycle(self) -> Self {
        match self {
            ScaleMode::Fit => ScaleMode::Original,
            ScaleMode::Original => ScaleMode::Free,
            ScaleMode::Free => ScaleMode::Fit,
        }
    }
}

/// What the user did to the view of one image. Survives re-decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewState {
    pub zoom: u32,
    pub scale_mode: ScaleMode,
}

impl Default for ViewState {
    fn default() -> Self {
        Self { zoom: 100, scale_mode: ScaleMode::Fit }
    }
}

struct EntryData {
    state: LoadState,
    pixels: Option<PixelBuffer>,
    width: u32,
    height: u32,
    metadata: HashMap<String, String>,
    file_size: u64,
    format: String,
    expected_ms: f64,
    actual_ms: f64,
    started: Option<Instant>,
    cancel: Option<CancelToken>,
    disposed: bool,
}

impl EntryData {
    fn new() -> Self {
        Self {
            state: LoadState::Empty,
            pixels: None,
            width: 0,
            height: 0,
            metadata: HashMap::new(),
            file_size: 0,
            format: String::new(),
            expected_ms: 0.0,
            actual_ms: 0.0,
            started: None,
            cancel: None,
            disposed: false,
        }
    }

    /// Back to `Empty`, dropping any pixels. Does not touch the view state.
    fn clear(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.pixels = None;
        self.state = LoadState::Empty;
        self.width = 0;
        self.height = 0;
        self.metadata.clear();
        self.file_size = 0;
        self.format.clear();
        self.expected_ms = 0.0;
        self.actual_ms = 0.0;
        self.started = None;
    }
}

/// Everything about an entry except its pixels.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: PathBuf,
    pub state: LoadState,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub format: String,
    pub expected_ms: f64,
    pub actual_ms: f64,
    pub metadata: HashMap<String, String>,
    pub view: ViewState,
}

enum Commit {
    Loaded,
    Failed(DecodeError),
    Cancelled,
    Superseded,
}

/// One tracked image. Decode results only land if they belong to the most
/// recent launch (`generation`) and the entry has not been disposed.
pub struct CacheEntry {
    path: PathBuf,
    generation: AtomicU64,
    data: Mutex<EntryData>,
    view: Mutex<ViewState>,
}

impl CacheEntry {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            generation: AtomicU64::new(0),
            data: Mutex::new(EntryData::new()),
            view: Mutex::new(ViewState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn state(&self) -> LoadState {
        self.data.lock().unwrap().state
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let data = self.data.lock().unwrap();
        (data.width, data.height)
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.data.lock().unwrap().metadata.clone()
    }

    pub fn expected_duration_ms(&self) -> f64 {
        self.data.lock().unwrap().expected_ms
    }

    pub fn actual_duration_ms(&self) -> f64 {
        self.data.lock().unwrap().actual_ms
    }

    pub fn is_disposed(&self) -> bool {
        self.data.lock().unwrap().disposed
    }

    pub fn view_state(&self) -> ViewState {
        *self.view.lock().unwrap()
    }

    pub fn set_view_state(&self, view: ViewState) {
        *self.view.lock().unwrap() = view;
    }

    /// Run `f` over the RGBA bytes while the entry is `Loaded`. The entry lock
    /// is held for the duration, so eviction cannot free the buffer mid-read.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8], u32, u32) -> R) -> Option<R> {
        let data = self.data.lock().unwrap();
        let pixels = data.pixels.as_ref()?;
        Some(f(pixels.as_bytes(), data.width, data.height))
    }

    /// Fraction of the expected decode time that has passed, for a progress
    /// bar. 0.0 when there is no estimate.
    pub fn loading_progress(&self, now: Instant) -> f64 {
        let data = self.data.lock().unwrap();
        match data.state {
            LoadState::Loaded => 1.0,
            LoadState::Loading => match data.started {
                Some(started) if data.expected_ms > 0.0 => {
                    let elapsed = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
                    (elapsed / data.expected_ms).clamp(0.0, 1.0)
                }
                _ => 0.0,
            },
            LoadState::Empty | LoadState::Failed => 0.0,
        }
    }

    pub fn snapshot(&self) -> EntryInfo {
        let view = self.view_state();
        let data = self.data.lock().unwrap();
        EntryInfo {
            path: self.path.clone(),
            state: data.state,
            width: data.width,
            height: data.height,
            file_size: data.file_size,
            format: data.format.clone(),
            expected_ms: data.expected_ms,
            actual_ms: data.actual_ms,
            metadata: data.metadata.clone(),
            view,
        }
    }

    /// Cancel whatever is in flight and start a new load generation.
    fn begin_load(&self) -> Option<(u64, CancelToken)> {
        let mut data = self.data.lock().unwrap();
        if data.disposed {
            return None;
        }
        data.clear();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = CancelToken::new();
        data.cancel = Some(cancel.clone());
        data.state = LoadState::Loading;
        data.started = Some(Instant::now());
        Some((generation, cancel))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn set_load_info(&self, generation: u64, file_size: u64, format: &str, expected_ms: f64) {
        let mut data = self.data.lock().unwrap();
        if data.disposed || !self.is_current(generation) {
            return;
        }
        data.file_size = file_size;
        data.format = format.to_string();
        data.expected_ms = expected_ms;
        data.started = Some(Instant::now());
    }

    fn commit(
        &self,
        generation: u64,
        cancel: &CancelToken,
        result: Result<DecodedImage, DecodeError>,
        elapsed_ms: f64,
    ) -> Commit {
        let mut data = self.data.lock().unwrap();
        if data.disposed || !self.is_current(generation) {
            return Commit::Superseded;
        }
        if cancel.is_cancelled() || matches!(result, Err(DecodeError::Cancelled)) {
            data.clear();
            return Commit::Cancelled;
        }
        data.cancel = None;
        match result {
            Ok(decoded) => {
                data.width = decoded.width;
                data.height = decoded.height;
                data.pixels = Some(decoded.pixels);
                data.metadata = decoded.metadata;
                data.actual_ms = elapsed_ms;
                data.state = LoadState::Loaded;
                Commit::Loaded
            }
            Err(e) => {
                data.actual_ms = elapsed_ms;
                data.state = LoadState::Failed;
                Commit::Failed(e)
            }
        }
    }

    fn cancel(&self) {
        let mut data = self.data.lock().unwrap();
        if data.state == LoadState::Loading {
            self.generation.fetch_add(1, Ordering::AcqRel);
            data.clear();
        }
    }

    /// Release the pixel buffer for good. Later decode results are dropped.
    fn dispose(&self) {
        let mut data = self.data.lock().unwrap();
        if data.disposed {
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        data.clear();
        data.disposed = true;
    }
}

// ---------------------------------------------------------------------------
// Prefetch cache (shared between the UI thread and decode workers)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Loaded(PathBuf),
    Failed(PathBuf),
}

#[derive(Default)]
struct Tracked {
    entries: HashMap<PathBuf, Arc<CacheEntry>>,
    /// Path the renderer is currently showing; never evicted.
    pinned: Option<PathBuf>,
}

struct Shared {
    tracked: Mutex<Tracked>,
    decoders: DecoderRegistry,
    estimator: Arc<DurationEstimator>,
    /// `None` falls back to the global rayon pool.
    pool: Option<rayon::ThreadPool>,
    in_flight: Mutex<usize>,
    idle: Condvar,
    events: Mutex<Option<Sender<CacheEvent>>>,
}

impl Shared {
    fn finish_one(&self) {
        let mut n = self.in_flight.lock().unwrap();
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.idle.notify_all();
        }
    }

    fn send(&self, event: CacheEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Decoded images for the current position and its neighbors.
///
/// The UI thread drives it with `reconcile`, `preload_all` and `evict`;
/// decodes run on a private worker pool and publish into the entries.
pub struct PrefetchCache {
    shared: Arc<Shared>,
}

impl PrefetchCache {
    pub fn new(decoders: DecoderRegistry, estimator: Arc<DurationEstimator>) -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .clamp(4, 16);
        Self::with_threads(decoders, estimator, num_threads)
    }

    pub fn with_threads(
        decoders: DecoderRegistry,
        estimator: Arc<DurationEstimator>,
        num_threads: usize,
    ) -> Self {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("decode-{}", i))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                log::warn!("Using the global rayon pool for decoding: {}", e);
                None
            }
        };

        Self {
            shared: Arc::new(Shared {
                tracked: Mutex::new(Tracked::default()),
                decoders,
                estimator,
                pool,
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
                events: Mutex::new(None),
            }),
        }
    }

    /// Receive a `CacheEvent` whenever an entry finishes loading or fails.
    /// Replaces any earlier subscriber.
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (tx, rx) = mpsc::channel();
        *self.shared.events.lock().unwrap() = Some(tx);
        rx
    }

    pub fn estimator(&self) -> &Arc<DurationEstimator> {
        &self.shared.estimator
    }

    pub fn len(&self) -> usize {
        self.shared.tracked.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, path: &Path) -> Option<Arc<CacheEntry>> {
        self.shared.tracked.lock().unwrap().entries.get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.shared.tracked.lock().unwrap().entries.contains_key(path)
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> =
            self.shared.tracked.lock().unwrap().entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn pinned(&self) -> Option<PathBuf> {
        self.shared.tracked.lock().unwrap().pinned.clone()
    }

    /// Make sure `current` and each of `neighbors` has an entry. New entries
    /// start out `Empty`; nothing is decoded until `preload_all`.
    pub fn reconcile(&self, current: &Path, neighbors: &[PathBuf]) {
        let mut tracked = self.shared.tracked.lock().unwrap();
        for path in std::iter::once(current).chain(neighbors.iter().map(PathBuf::as_path)) {
            tracked
                .entries
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(CacheEntry::new(path.to_path_buf())));
        }
    }

    /// Start decoding every `Empty` entry. Returns how many were launched.
    pub fn preload_all(&self) -> usize {
        let pending: Vec<Arc<CacheEntry>> = {
            let tracked = self.shared.tracked.lock().unwrap();
            tracked
                .entries
                .values()
                .filter(|e| e.state() == LoadState::Empty)
                .cloned()
                .collect()
        };
        for entry in &pending {
            self.launch(Arc::clone(entry));
        }
        pending.len()
    }

    /// Decode `path` now, superseding any decode of it already in flight.
    pub fn load(&self, path: &Path) -> Arc<CacheEntry> {
        let entry = {
            let mut tracked = self.shared.tracked.lock().unwrap();
            Arc::clone(
                tracked
                    .entries
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(CacheEntry::new(path.to_path_buf()))),
            )
        };
        self.launch(Arc::clone(&entry));
        entry
    }

    /// Put a `Failed` entry back to `Empty` so the next `preload_all` tries
    /// it again.
    pub fn retry(&self, path: &Path) -> bool {
        let Some(entry) = self.get(path) else { return false };
        let mut data = entry.data.lock().unwrap();
        if data.state != LoadState::Failed || data.disposed {
            return false;
        }
        data.clear();
        true
    }

    /// Stop the in-flight decode of `path`, if any. The entry goes back to
    /// `Empty`.
    pub fn cancel(&self, path: &Path) {
        if let Some(entry) = self.get(path) {
            entry.cancel();
        }
    }

    /// The entry the renderer should draw for `path`. It is created if
    /// needed and pinned, so `evict` will not free it while it is on screen.
    pub fn current_entry(&self, path: &Path) -> Arc<CacheEntry> {
        let mut tracked = self.shared.tracked.lock().unwrap();
        let entry = Arc::clone(
            tracked
                .entries
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(CacheEntry::new(path.to_path_buf()))),
        );
        tracked.pinned = Some(path.to_path_buf());
        entry
    }

    /// Drop every entry that is neither `current`, one of `safe_neighbors`,
    /// nor pinned. Returns how many were removed.
    pub fn evict(&self, current: &Path, safe_neighbors: &[PathBuf]) -> usize {
        let safe: HashSet<&Path> = std::iter::once(current)
            .chain(safe_neighbors.iter().map(PathBuf::as_path))
            .collect();

        let removed: Vec<Arc<CacheEntry>> = {
            let mut tracked = self.shared.tracked.lock().unwrap();
            let pinned = tracked.pinned.clone();
            let doomed: Vec<PathBuf> = tracked
                .entries
                .keys()
                .filter(|p| !safe.contains(p.as_path()) && pinned.as_ref() != Some(*p))
                .cloned()
                .collect();
            doomed
                .iter()
                .filter_map(|p| tracked.entries.remove(p))
                .collect()
        };

        for entry in &removed {
            entry.dispose();
        }
        if !removed.is_empty() {
            log::debug!("Evicted {} entries", removed.len());
        }
        removed.len()
    }

    /// Release everything, pinned entry included.
    pub fn dispose_all(&self) {
        let removed: Vec<Arc<CacheEntry>> = {
            let mut tracked = self.shared.tracked.lock().unwrap();
            tracked.pinned = None;
            tracked.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in &removed {
            entry.dispose();
        }
        if !removed.is_empty() {
            log::debug!("Disposed {} entries", removed.len());
        }
    }

    /// Block until no decode is running, or `timeout` passes. Returns whether
    /// the cache went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let n = self.shared.in_flight.lock().unwrap();
        let (n, _) = self
            .shared
            .idle
            .wait_timeout_while(n, timeout, |n| *n > 0)
            .unwrap();
        *n == 0
    }

    fn launch(&self, entry: Arc<CacheEntry>) {
        let Some((generation, cancel)) = entry.begin_load() else { return };
        *self.shared.in_flight.lock().unwrap() += 1;
        let shared = Arc::clone(&self.shared);
        let job = move || {
            run_decode(&shared, &entry, generation, cancel);
            shared.finish_one();
        };
        match &self.shared.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

impl Drop for PrefetchCache {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

// ---------------------------------------------------------------------------
// Decode task
// ---------------------------------------------------------------------------

fn run_decode(shared: &Shared, entry: &CacheEntry, generation: u64, cancel: CancelToken) {
    if cancel.is_cancelled() || !entry.is_current(generation) {
        return;
    }
    let path = entry.path();
    let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let ext = extension_of(path);
    let format = normalize_format(&ext).unwrap_or_default();
    let expected_ms = shared.estimator.estimate(&format, file_size);
    entry.set_load_info(generation, file_size, &format, expected_ms);

    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| shared.decoders.decode(path, &cancel)))
        .unwrap_or_else(|_| Err(DecodeError::Backend("decoder panicked".to_string())));
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    match entry.commit(generation, &cancel, result, elapsed_ms) {
        Commit::Loaded => {
            shared.estimator.record(&format, file_size, elapsed_ms);
            log::debug!(
                "Loaded {} in {:.1}ms (expected {:.1}ms)",
                path.display(),
                elapsed_ms,
                expected_ms
            );
            shared.send(CacheEvent::Loaded(path.to_path_buf()));
        }
        Commit::Failed(e) => {
            log::warn!("Failed to load {}: {}", path.display(), e);
            shared.send(CacheEvent::Failed(path.to_path_buf()));
        }
        Commit::Cancelled => log::debug!("Cancelled {}", path.display()),
        Commit::Superseded => log::debug!("Dropped stale result for {}", path.display()),
    }
}
