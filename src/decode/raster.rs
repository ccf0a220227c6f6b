use std::path::Path;

use image::{GenericImageView, ImageReader};

use super::metadata::read_metadata;
use super::{CancelToken, DecodeError, DecodedImage, ImageDecoder, PixelBuffer};

const EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tga", "tiff", "tif", "webp", "ico", "pnm", "pbm",
    "pgm", "ppm", "pam", "dds", "hdr", "exr", "ff", "qoi",
];

/// Everything the `image` crate can read.
pub struct RasterDecoder;

impl ImageDecoder for RasterDecoder {
    fn name(&self) -> &'static str {
        "image"
    }

    fn can_decode(&self, extension: &str) -> bool {
        EXTENSIONS.contains(&extension)
    }

    fn decode(&self, path: &Path, cancel: &CancelToken) -> Result<DecodedImage, DecodeError> {
        let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        cancel.check()?;

        let (width, height) = img.dimensions();
        let rgba = img.into_rgba8().into_raw();
        cancel.check()?;

        let metadata = read_metadata(path);

        Ok(DecodedImage {
            width,
            height,
            pixels: PixelBuffer::new(rgba),
            metadata,
        })
    }
}
