use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "heif")]
pub mod heif;
pub mod metadata;
pub mod raster;

#[cfg(feature = "heif")]
pub use heif::HeifDecoder;
pub use raster::RasterDecoder;

// ---------------------------------------------------------------------------
// Decoded image data
// ---------------------------------------------------------------------------

/// RGBA8888 pixels, `width * height * 4` bytes. Owned by exactly one entry;
/// dropping it releases the memory.
pub struct PixelBuffer(Vec<u8>);

impl PixelBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PixelBuffer({} bytes)", self.0.len())
    }
}

#[derive(Debug)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelBuffer,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("file format '{0}' is not supported")]
    UnsupportedFormat(String),
    #[error("decode cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[cfg(feature = "heif")]
    #[error(transparent)]
    Heif(#[from] libheif_rs::HeifError),
    #[error("{0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between whoever launched a decode
/// and the worker running it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancelled, for use with `?` between decode steps.
    pub fn check(&self) -> Result<(), DecodeError> {
        if self.is_cancelled() {
            Err(DecodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// A codec that turns a file into RGBA pixels. Must be usable from several
/// worker threads at once.
pub trait ImageDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// `extension` is lower-case, without the dot.
    fn can_decode(&self, extension: &str) -> bool;

    fn decode(&self, path: &Path, cancel: &CancelToken) -> Result<DecodedImage, DecodeError>;
}

/// Backends in registration order; the first one accepting an extension
/// handles it.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    backends: Vec<Arc<dyn ImageDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used by the application: libheif for HEIF/AVIF when
    /// built with the `heif` feature, then the `image` crate backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "heif")]
        registry.register(HeifDecoder);
        registry.register(RasterDecoder);
        registry
    }

    pub fn register(&mut self, decoder: impl ImageDecoder + 'static) {
        self.backends.push(Arc::new(decoder));
    }

    pub fn backend_for(&self, path: &Path) -> Result<&dyn ImageDecoder, DecodeError> {
        let ext = extension_of(path);
        self.backends
            .iter()
            .find(|d| d.can_decode(&ext))
            .map(|d| d.as_ref())
            .ok_or(DecodeError::UnsupportedFormat(ext))
    }

    pub fn decode(&self, path: &Path, cancel: &CancelToken) -> Result<DecodedImage, DecodeError> {
        cancel.check()?;
        let backend = self.backend_for(path)?;
        log::debug!("Decoding {} with {}", path.display(), backend.name());
        let decoded = backend.decode(path, cancel)?;
        cancel.check()?;
        Ok(decoded)
    }
}

pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        exts: &'static [&'static str],
    }

    impl ImageDecoder for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn can_decode(&self, extension: &str) -> bool {
            self.exts.contains(&extension)
        }

        fn decode(&self, _path: &Path, _cancel: &CancelToken) -> Result<DecodedImage, DecodeError> {
            Ok(DecodedImage {
                width: 1,
                height: 1,
                pixels: PixelBuffer::new(vec![0; 4]),
                metadata: HashMap::from([("Backend".to_string(), self.name.to_string())]),
            })
        }
    }

    #[test]
    fn first_matching_backend_wins() {
        let mut registry = DecoderRegistry::new();
        registry.register(Fixed { name: "first", exts: &["png"] });
        registry.register(Fixed { name: "second", exts: &["png", "heic"] });

        let cancel = CancelToken::new();
        let png = registry.decode(Path::new("x.PNG"), &cancel).unwrap();
        assert_eq!(png.metadata["Backend"], "first");
        let heic = registry.decode(Path::new("x.heic"), &cancel).unwrap();
        assert_eq!(heic.metadata["Backend"], "second");
    }

    #[test]
    fn no_backend_is_unsupported() {
        let registry = DecoderRegistry::with_defaults();
        let err = registry.decode(Path::new("notes.txt"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat(ref e) if e == "txt"));

        let err = registry.decode(Path::new("noext"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat(_)));
    }

    #[test]
    fn heif_backend_follows_build_features() {
        let registry = DecoderRegistry::with_defaults();
        for name in ["x.heic", "x.HEIF", "x.avif"] {
            let backend = registry.backend_for(Path::new(name)).map(|d| d.name());
            if cfg!(feature = "heif") {
                assert_eq!(backend.ok(), Some("libheif"));
            } else {
                assert!(matches!(backend, Err(DecodeError::UnsupportedFormat(_))));
            }
        }
        assert_eq!(registry.backend_for(Path::new("x.jpg")).map(|d| d.name()).ok(), Some("image"));
    }

    #[test]
    fn cancelled_before_start() {
        let mut registry = DecoderRegistry::new();
        registry.register(Fixed { name: "any", exts: &["png"] });
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = registry.decode(Path::new("a.png"), &cancel).unwrap_err();
        assert!(matches!(err, DecodeError::Cancelled));
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());
        token.cancel();
        assert!(worker.is_cancelled());
    }
}
