use std::collections::HashMap;
use std::path::Path;

use libheif_rs::{ColorSpace, HeifContext, ImageHandle, ItemId, LibHeif, RgbChroma};

use super::metadata::read_exif_block;
use super::{CancelToken, DecodeError, DecodedImage, ImageDecoder, PixelBuffer};

pub const EXTENSIONS: &[&str] = &["heic", "heif", "avif"];

/// HEIF containers (HEIC photos and AVIF) through libheif.
pub struct HeifDecoder;

impl ImageDecoder for HeifDecoder {
    fn name(&self) -> &'static str {
        "libheif"
    }

    fn can_decode(&self, extension: &str) -> bool {
        EXTENSIONS.contains(&extension)
    }

    fn decode(&self, path: &Path, cancel: &CancelToken) -> Result<DecodedImage, DecodeError> {
        let name = path
            .to_str()
            .ok_or_else(|| DecodeError::Backend(format!("non UTF-8 path {}", path.display())))?;
        let lib = LibHeif::new();
        let ctx = HeifContext::read_from_file(name)?;
        let handle = ctx.primary_image_handle()?;
        cancel.check()?;

        let image = lib.decode(&handle, ColorSpace::Rgb(RgbChroma::Rgba), None)?;
        cancel.check()?;

        let planes = image.planes();
        let plane = planes
            .interleaved
            .ok_or_else(|| DecodeError::Backend("libheif returned no interleaved plane".to_string()))?;
        let (width, height) = (plane.width, plane.height);

        // Rows may be padded out to `stride`.
        let row = width as usize * 4;
        let mut rgba = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * plane.stride;
            rgba.extend_from_slice(&plane.data[start..start + row]);
        }
        cancel.check()?;

        Ok(DecodedImage {
            width,
            height,
            pixels: PixelBuffer::new(rgba),
            metadata: exif_of(&handle),
        })
    }
}

fn exif_of(handle: &ImageHandle) -> HashMap<String, String> {
    let count = handle.number_of_metadata_blocks(b"Exif");
    if count <= 0 {
        return HashMap::new();
    }
    let mut ids: Vec<ItemId> = vec![0; count as usize];
    let found = handle.metadata_block_ids(&mut ids, b"Exif");
    ids.truncate(found);

    ids.into_iter()
        .filter_map(|id| handle.metadata(id).ok())
        .map(|block| read_exif_block(&block))
        .find(|fields| !fields.is_empty())
        .unwrap_or_default()
}
