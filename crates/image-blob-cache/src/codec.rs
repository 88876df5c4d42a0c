//! PNG encode/decode at the cache boundary
//!
//! Stored bytes are always PNG: lossless, so a cached image decodes back to
//! the exact pixels that were added.

use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::warn;

pub(crate) fn encode(image: &DynamicImage) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    match image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png) {
        Ok(()) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to encode image");
            None
        }
    }
}

pub(crate) fn decode(bytes: &[u8]) -> Option<DynamicImage> {
    match image::load_from_memory_with_format(bytes, ImageFormat::Png) {
        Ok(image) => Some(image),
        Err(e) => {
            warn!(error = %e, "Failed to decode cached bytes");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = DynamicImage::ImageRgba8(ImageBuffer::from_fn(8, 8, |x, y| {
            Rgba([x as u8 * 16, y as u8 * 16, 128, 255])
        }));

        let bytes = encode(&original).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.to_rgba8().as_raw(), original.to_rgba8().as_raw());
    }

    #[test]
    fn test_decode_garbage_is_none() {
        assert!(decode(b"definitely not a png").is_none());
        assert!(decode(&[]).is_none());
    }
}
