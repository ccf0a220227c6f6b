use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::files::{SequenceCursor, SourceError};
use crate::loader::{CacheEntry, LoadState, PrefetchCache, DEFAULT_PRELOAD_DEPTH, DEFAULT_SAFE_RANGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub preload_depth: usize,
    pub safe_range: usize,
}

impl CacheConfig {
    /// The safe range is raised to the preload depth if it is smaller, so
    /// freshly preloaded neighbors are never evicted straight away.
    pub fn new(preload_depth: usize, safe_range: usize) -> Self {
        Self {
            preload_depth,
            safe_range: safe_range.max(preload_depth),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PRELOAD_DEPTH, DEFAULT_SAFE_RANGE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nav {
    Next,
    Previous,
    First,
    Last,
}

// ---------------------------------------------------------------------------
// Session: cursor + cache, kept in step on every navigation
// ---------------------------------------------------------------------------

pub struct Session {
    cursor: SequenceCursor,
    cache: PrefetchCache,
    config: CacheConfig,
    /// Path the cursor was on after the previous refresh.
    last_current: Option<PathBuf>,
}

impl Session {
    pub fn new(cache: PrefetchCache, config: CacheConfig) -> Self {
        Self {
            cursor: SequenceCursor::new(),
            cache,
            config,
            last_current: None,
        }
    }

    pub fn cursor(&self) -> &SequenceCursor {
        &self.cursor
    }

    pub fn cache(&self) -> &PrefetchCache {
        &self.cache
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Open a file or directory (startup argument, dropped file, `o` command).
    pub fn open(&mut self, path: &Path) -> Result<(), SourceError> {
        self.cursor.set_source(path)?;
        // Same directory keeps its sequence; just move to the file.
        if path.is_file() {
            let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            if self.cursor.select(&resolved).is_none() {
                log::debug!("{} is not in the current sequence", resolved.display());
                return Err(SourceError::NotInSequence(resolved));
            }
        }
        log::info!(
            "Opened {} ({} images)",
            self.cursor.directory().map(|d| d.display().to_string()).unwrap_or_default(),
            self.cursor.len()
        );
        self.refresh();
        Ok(())
    }

    pub fn step(&mut self, nav: Nav) -> Option<PathBuf> {
        let path = match nav {
            Nav::Next => self.cursor.next(),
            Nav::Previous => self.cursor.previous(),
            Nav::First => self.cursor.first(),
            Nav::Last => self.cursor.last(),
        }
        .map(Path::to_path_buf);
        log::debug!("{:?} -> {:?}", nav, path);
        self.refresh();
        path
    }

    /// Bring the cache in line with the cursor: track the window, start
    /// decoding what is missing, then drop what is out of range.
    pub fn refresh(&mut self) {
        let Some(current) = self.cursor.current().map(Path::to_path_buf) else {
            self.cache.dispose_all();
            self.last_current = None;
            return;
        };

        if !self.cache.contains(&current) {
            log::debug!("Cache miss for {}", current.display());
        }
        self.cache
            .reconcile(&current, &self.cursor.neighbors(self.config.preload_depth));

        // Arriving on an image that failed earlier gives it another try.
        let arrived = self.last_current.as_ref() != Some(&current);
        if arrived && self.cache.retry(&current) {
            log::debug!("Retrying {}", current.display());
        }

        self.cache.preload_all();
        self.cache
            .evict(&current, &self.cursor.neighbors(self.config.safe_range));
        self.last_current = Some(current);
    }

    /// The entry to draw. Pins it in the cache.
    pub fn current(&self) -> Option<Arc<CacheEntry>> {
        let path = self.cursor.current()?;
        Some(self.cache.current_entry(path))
    }

    /// Decode the current image again, replacing whatever is in flight.
    pub fn reload(&self) -> Option<Arc<CacheEntry>> {
        let path = self.cursor.current()?;
        Some(self.cache.load(path))
    }

    /// One line for the overlay / terminal.
    pub fn status_line(&self) -> String {
        let (index, count) = self.cursor.position();
        let Some(entry) = self.current() else {
            return "No images".to_string();
        };
        let info = entry.snapshot();
        let head = format!("[{}/{}] {}", index, count, entry.file_name());

        match info.state {
            LoadState::Loaded => format!(
                "{} | {}x{} | {} | {:.1} KB | {:.0}ms | zoom {}% {:?}",
                head,
                info.width,
                info.height,
                info.format,
                info.file_size as f64 / 1024.0,
                info.actual_ms,
                info.view.zoom,
                info.view.scale_mode,
            ),
            LoadState::Loading if info.expected_ms > 0.0 => format!(
                "{} | Loading... {:.0}% of ~{:.0}ms",
                head,
                entry.loading_progress(Instant::now()) * 100.0,
                info.expected_ms,
            ),
            LoadState::Loading | LoadState::Empty => format!("{} | Loading...", head),
            LoadState::Failed => format!("{} | Could not load image", head),
        }
    }

    /// Free every image, wait for workers to notice, save statistics.
    pub fn shutdown(&self, timeout: Duration) {
        self.cache.dispose_all();
        if !self.cache.wait_idle(timeout) {
            log::warn!("Decode workers still busy after {:?}", timeout);
        }
        self.cache.estimator().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecoderRegistry;
    use crate::estimator::DurationEstimator;
    use crate::loader::CacheEvent;
    use std::fs;

    const WAIT: Duration = Duration::from_secs(10);

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) {
        image::RgbaImage::from_pixel(w, h, image::Rgba([10, 20, 30, 255]))
            .save(dir.join(name))
            .unwrap();
    }

    fn session(config: CacheConfig) -> Session {
        let cache = PrefetchCache::with_threads(
            DecoderRegistry::with_defaults(),
            Arc::new(DurationEstimator::in_memory()),
            4,
        );
        Session::new(cache, config)
    }

    fn name(p: &Path) -> String {
        p.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn safe_range_never_below_preload_depth() {
        assert_eq!(CacheConfig::new(3, 1), CacheConfig { preload_depth: 3, safe_range: 3 });
        assert_eq!(CacheConfig::default(), CacheConfig { preload_depth: 2, safe_range: 4 });
    }

    #[test]
    fn opening_a_file_preloads_its_neighbors() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 4, 3);
        write_png(dir.path(), "b.png", 5, 3);
        fs::write(dir.path().join("c.txt"), "x").unwrap();
        write_png(dir.path(), "d.png", 6, 3);

        let mut s = session(CacheConfig::default());
        s.open(&dir.path().join("b.png")).unwrap();
        assert_eq!(s.cursor().position(), (2, 3));
        assert!(s.cache().wait_idle(WAIT));

        let names: Vec<String> = s.cache().tracked_paths().iter().map(|p| name(p)).collect();
        assert_eq!(names, ["a.png", "b.png", "d.png"]);

        let current = s.current().unwrap();
        assert_eq!(current.state(), LoadState::Loaded);
        assert_eq!(current.dimensions(), (5, 3));
        assert_eq!(current.with_pixels(|px, _, _| px[..4].to_vec()), Some(vec![10, 20, 30, 255]));
        assert!(s.status_line().starts_with("[2/3] b.png | 5x3 | PNG"));
    }

    #[test]
    fn opening_a_sibling_file_jumps_to_it() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["a.png", "b.png", "c.png"] {
            write_png(dir.path(), n, 2, 2);
        }
        let mut s = session(CacheConfig::default());
        s.open(&dir.path().join("a.png")).unwrap();
        s.open(&dir.path().join("c.png")).unwrap();
        assert_eq!(s.cursor().position(), (3, 3));
        assert!(s.cache().wait_idle(WAIT));
    }

    #[test]
    fn opening_an_unlisted_sibling_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 2, 2);
        write_png(dir.path(), "b.png", 2, 2);
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let mut s = session(CacheConfig::default());
        s.open(&dir.path().join("b.png")).unwrap();
        let err = s.open(&dir.path().join("notes.txt")).unwrap_err();
        assert!(matches!(err, SourceError::NotInSequence(ref p) if p.ends_with("notes.txt")));
        assert_eq!(s.cursor().position(), (2, 2));
        assert!(s.cache().wait_idle(WAIT));
    }

    #[test]
    fn window_slides_with_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            write_png(dir.path(), &format!("{i}.png"), 2, 2);
        }
        let mut s = session(CacheConfig::new(2, 4));
        s.open(dir.path()).unwrap();
        let first = s.current().unwrap();
        assert!(s.cache().wait_idle(WAIT));

        for _ in 0..5 {
            s.step(Nav::Next);
            s.current();
        }
        assert_eq!(s.cursor().position(), (6, 10));
        assert!(s.cache().wait_idle(WAIT));

        let tracked = s.cache().tracked_paths();
        let names: Vec<String> = tracked.iter().map(|p| name(p)).collect();
        // 0.png dropped out of the safe range [1, 9].
        assert!(!names.contains(&"0.png".to_string()));
        assert!(first.is_disposed());
        for n in ["3.png", "4.png", "5.png", "6.png", "7.png"] {
            assert!(names.contains(&n.to_string()), "{n} missing");
        }
    }

    #[test]
    fn displayed_entry_outlives_the_jump() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            write_png(dir.path(), &format!("{i}.png"), 2, 2);
        }
        let mut s = session(CacheConfig::new(1, 1));
        s.open(dir.path()).unwrap();
        let shown = s.current().unwrap();
        assert!(s.cache().wait_idle(WAIT));

        // Renderer has not asked for the new image yet.
        s.step(Nav::Last);
        assert!(!shown.is_disposed());
        assert!(shown.with_pixels(|_, _, _| ()).is_some());

        s.current();
        s.refresh();
        assert!(shown.is_disposed());
        assert!(s.cache().wait_idle(WAIT));
    }

    #[test]
    fn failed_image_is_retried_on_arrival() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 2, 2);
        fs::write(dir.path().join("b.png"), b"broken").unwrap();

        let mut s = session(CacheConfig::new(1, 1));
        s.open(dir.path()).unwrap();
        assert!(s.cache().wait_idle(WAIT));
        let b = s.cache().get(&s.cursor().paths()[1]).unwrap();
        assert_eq!(b.state(), LoadState::Failed);

        // Staying put does not retry.
        s.refresh();
        assert_eq!(b.state(), LoadState::Failed);

        let events = s.cache().subscribe();
        s.step(Nav::Next);
        assert!(s.cache().wait_idle(WAIT));
        assert_eq!(b.state(), LoadState::Failed);
        let failures = events
            .try_iter()
            .filter(|e| *e == CacheEvent::Failed(b.path().to_path_buf()))
            .count();
        assert_eq!(failures, 1);
        assert!(s.status_line().ends_with("Could not load image"));
    }

    #[test]
    fn empty_directory_disposes_everything() {
        let full = tempfile::tempdir().unwrap();
        write_png(full.path(), "a.png", 2, 2);
        let empty = tempfile::tempdir().unwrap();

        let mut s = session(CacheConfig::default());
        s.open(full.path()).unwrap();
        s.current();
        s.open(empty.path()).unwrap();
        assert!(s.cache().is_empty());
        assert!(s.cache().pinned().is_none());
        assert!(s.current().is_none());
        assert_eq!(s.status_line(), "No images");
        assert!(s.step(Nav::Next).is_none());
    }

    #[test]
    fn shutdown_persists_timings() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 2, 2);
        let store = dir.path().join("times.json");

        let cache = PrefetchCache::with_threads(
            DecoderRegistry::with_defaults(),
            Arc::new(DurationEstimator::open(store.clone())),
            2,
        );
        let mut s = Session::new(cache, CacheConfig::default());
        s.open(&dir.path().join("a.png")).unwrap();
        assert!(s.cache().wait_idle(WAIT));
        s.shutdown(WAIT);

        assert!(s.cache().is_empty());
        let reloaded = DurationEstimator::open(store);
        let size = fs::metadata(dir.path().join("a.png")).unwrap().len();
        assert!(reloaded.estimate("PNG", size) > 0.0);
        assert!(fs::read_to_string(dir.path().join("times.json")).unwrap().contains("PNG_1"));
    }
}
