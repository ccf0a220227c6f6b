//! EXIF fields shown in the info overlay.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::NaiveDateTime;
use exif::{Exif, In, Tag, Value};

const DISPLAY_TAGS: &[(Tag, &str)] = &[
    (Tag::Make, "Make"),
    (Tag::Model, "Model"),
    (Tag::LensModel, "Lens"),
    (Tag::ExposureTime, "ExposureTime"),
    (Tag::FNumber, "FNumber"),
    (Tag::PhotographicSensitivity, "ISO"),
];

/// Camera, exposure, capture time and GPS presence. Files without EXIF give
/// an empty map.
pub fn read_metadata(path: &Path) -> HashMap<String, String> {
    let Ok(file) = File::open(path) else { return HashMap::new() };
    let mut reader = BufReader::new(file);
    match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => collect(&exif),
        Err(e) => {
            log::debug!("No EXIF in {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

/// EXIF item stored inside a HEIF container: a big-endian offset to the
/// TIFF header, then the TIFF data.
#[cfg_attr(not(feature = "heif"), allow(dead_code))]
pub fn read_exif_block(block: &[u8]) -> HashMap<String, String> {
    let Some(prefix) = block.get(..4) else { return HashMap::new() };
    let offset = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let Some(tiff) = block.get(4 + offset..) else { return HashMap::new() };
    match exif::Reader::new().read_raw(tiff.to_vec()) {
        Ok(exif) => collect(&exif),
        Err(e) => {
            log::debug!("Unreadable EXIF block: {}", e);
            HashMap::new()
        }
    }
}

fn collect(exif: &Exif) -> HashMap<String, String> {
    let mut out = HashMap::new();

    for (tag, key) in DISPLAY_TAGS {
        if let Some(field) = exif.get_field(*tag, In::PRIMARY) {
            let value = field.display_value().with_unit(exif).to_string();
            let value = value.trim_matches('"').trim().to_string();
            if !value.is_empty() {
                out.insert(key.to_string(), value);
            }
        }
    }

    let taken = exif
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY));
    if let Some(field) = taken {
        if let Value::Ascii(ref parts) = field.value {
            if let Some(ts) = parts.first().and_then(|raw| parse_exif_datetime(raw)) {
                out.insert("Taken".to_string(), ts);
            }
        }
    }

    // Only whether a position exists matters here, not the coordinates.
    for (tag, key) in [(Tag::GPSLatitude, "GPSLatitude"), (Tag::GPSLongitude, "GPSLongitude")] {
        if let Some(field) = exif.get_field(tag, In::PRIMARY) {
            out.insert(key.to_string(), field.display_value().to_string());
        }
    }

    out
}

/// EXIF stores `YYYY:MM:DD HH:MM:SS`; the overlay shows `YYYY-MM-DD HH:MM:SS`.
fn parse_exif_datetime(raw: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(raw).ok()?.trim_end_matches('\0').trim();
    NaiveDateTime::parse_from_str(s, "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}
