//! Inbound image decoding
//!
//! Everything handed to the orchestrator is 3-channel RGB with EXIF
//! orientation already applied.

use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, RgbImage};

use crate::error::DecodeError;

/// Decode container bytes (JPEG, PNG, ...) to upright RGB
pub fn decode_rgb(data: &[u8]) -> Result<RgbImage, DecodeError> {
    let image = image::load_from_memory(data)?;
    Ok(apply_exif_orientation(data, image).to_rgb8())
}

/// Decode a base64 string, optionally carrying a data-URI header such as
/// `data:image/jpeg;base64,`
pub fn decode_base64_rgb(encoded: &str) -> Result<RgbImage, DecodeError> {
    let bytes = STANDARD.decode(strip_data_uri(encoded).trim())?;
    decode_rgb(&bytes)
}

/// Drop everything up to and including the first comma
pub fn strip_data_uri(encoded: &str) -> &str {
    match encoded.split_once(',') {
        Some((_, payload)) => payload,
        None => encoded,
    }
}

/// Apply EXIF orientation to correct image rotation
/// Mobile phones often store images with EXIF orientation tags instead of rotating pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // See: https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}
