use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "bmp", "heic", "heif", "avif", "jpg", "jpeg", "png", "gif", "tga", "tiff", "tif", "webp",
    "ico", "pnm", "pbm", "pgm", "ppm", "pam", "dds", "hdr", "exr", "ff", "qoi",
];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid path: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("cannot list {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not an image in the open directory", .0.display())]
    NotInSequence(PathBuf),
}

// ---------------------------------------------------------------------------
// Sequence cursor
// ---------------------------------------------------------------------------

/// Ordered list of the viewable files in one directory plus the position of
/// the file currently on screen.
#[derive(Debug, Default)]
pub struct SequenceCursor {
    directory: Option<PathBuf>,
    anchor: Option<PathBuf>,
    files: Vec<PathBuf>,
    /// `None` iff `files` is empty.
    index: Option<usize>,
}

impl SequenceCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the cursor at a directory, or at a file inside one.
    ///
    /// Re-opening the directory that is already loaded does nothing: the list
    /// is not rebuilt and the cursor keeps its position.
    pub fn set_source(&mut self, path: &Path) -> Result<(), SourceError> {
        if path.as_os_str().is_empty() || !path.exists() {
            return Err(SourceError::InvalidPath(path.to_path_buf()));
        }
        let resolved = fs::canonicalize(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let (directory, anchor) = if resolved.is_dir() {
            (resolved, None)
        } else {
            let parent = resolved
                .parent()
                .ok_or_else(|| SourceError::InvalidPath(path.to_path_buf()))?
                .to_path_buf();
            (parent, Some(resolved))
        };

        if self.directory.as_deref() == Some(directory.as_path()) {
            log::debug!("{} already loaded, keeping position", directory.display());
            return Ok(());
        }

        let files = scan_dir(&directory, anchor.as_deref())?;
        let index = match &anchor {
            Some(a) => files.iter().position(|p| p == a),
            None => None,
        }
        .or(if files.is_empty() { None } else { Some(0) });

        self.directory = Some(directory);
        self.anchor = anchor;
        self.files = files;
        self.index = index;
        Ok(())
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn current(&self) -> Option<&Path> {
        self.index.map(|i| self.files[i].as_path())
    }

    pub fn next(&mut self) -> Option<&Path> {
        let i = self.index?;
        if i + 1 < self.files.len() {
            self.index = Some(i + 1);
        }
        self.current()
    }

    pub fn previous(&mut self) -> Option<&Path> {
        let i = self.index?;
        self.index = Some(i.saturating_sub(1));
        self.current()
    }

    pub fn first(&mut self) -> Option<&Path> {
        self.index?;
        self.index = Some(0);
        self.current()
    }

    pub fn last(&mut self) -> Option<&Path> {
        self.index?;
        self.index = Some(self.files.len() - 1);
        self.current()
    }

    pub fn has_next(&self) -> bool {
        self.index.is_some_and(|i| i + 1 < self.files.len())
    }

    pub fn has_previous(&self) -> bool {
        self.index.is_some_and(|i| i > 0)
    }

    /// Jump to a path that is already part of the sequence.
    pub fn select(&mut self, path: &Path) -> Option<&Path> {
        let i = self.files.iter().position(|p| p == path)?;
        self.index = Some(i);
        self.current()
    }

    /// Paths at most `depth` positions away from the cursor, in sequence
    /// order, without the current one.
    pub fn neighbors(&self, depth: usize) -> Vec<PathBuf> {
        let Some(i) = self.index else { return Vec::new() };
        if depth < 1 {
            return Vec::new();
        }
        let start = i.saturating_sub(depth);
        let end = (i + depth).min(self.files.len() - 1);
        (start..=end)
            .filter(|&j| j != i)
            .map(|j| self.files[j].clone())
            .collect()
    }

    /// 1-based position and total count; `(0, 0)` when empty.
    pub fn position(&self) -> (usize, usize) {
        match self.index {
            Some(i) => (i + 1, self.files.len()),
            None => (0, 0),
        }
    }
}

fn scan_dir(dir: &Path, anchor: Option<&Path>) -> Result<Vec<PathBuf>, SourceError> {
    let start_time = Instant::now();
    let entries = fs::read_dir(dir).map_err(|source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let p = entry.path();
        if !p.is_file() {
            continue;
        }
        if is_image_file(&p) || anchor == Some(p.as_path()) {
            files.push(p);
        }
    }

    // File name first so the order does not depend on what read_dir returns.
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    files.dedup();

    log::info!(
        "Scanned {} in {:.1}ms ({} images)",
        dir.display(),
        start_time.elapsed().as_secs_f64() * 1000.0,
        files.len()
    );
    Ok(files)
}
