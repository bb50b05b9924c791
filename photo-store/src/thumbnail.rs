use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Error type for thumbnail operations
#[derive(Debug)]
pub enum ThumbnailError {
    ImageLoadError(String),
    ImageSaveError(String),
}

impl std::fmt::Display for ThumbnailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThumbnailError::ImageLoadError(msg) => write!(f, "Image load error: {}", msg),
            ThumbnailError::ImageSaveError(msg) => write!(f, "Image save error: {}", msg),
        }
    }
}

impl std::error::Error for ThumbnailError {}

/// MIME type of every thumbnail produced by [`create_thumbnail`]
pub const THUMBNAIL_MIME: &str = "image/jpeg";

/// Creates a JPEG thumbnail whose longest edge is at most `max_size` pixels.
///
/// Images that are already small enough keep their dimensions but are still
/// re-encoded, so the output format is always JPEG.
pub fn create_thumbnail(bytes: &[u8], max_size: u32) -> Result<Vec<u8>, ThumbnailError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ThumbnailError::ImageLoadError(format!("Failed to decode image: {}", e)))?;

    log::debug!(
        "Creating thumbnail from {}x{} image (max {}px)",
        img.width(),
        img.height(),
        max_size
    );

    let resized = if img.width() > max_size || img.height() > max_size {
        img.thumbnail(max_size, max_size)
    } else {
        img
    };

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageFormat::Jpeg).map_err(|e| {
        ThumbnailError::ImageSaveError(format!("Failed to encode thumbnail: {}", e))
    })?;

    Ok(buffer.into_inner())
}

#[cfg(test)]
pub(crate) fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 255) as u8, (y % 255) as u8, 128])
    });
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, ImageFormat::Jpeg)
        .unwrap();
    buffer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_shrinks_large_image() {
        let original = sample_jpeg(800, 600);
        let thumb = create_thumbnail(&original, 200).unwrap();

        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 150);
    }

    #[test]
    fn test_thumbnail_keeps_small_image_dimensions() {
        let original = sample_jpeg(64, 32);
        let thumb = create_thumbnail(&original, 200).unwrap();

        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
    }

    #[test]
    fn test_thumbnail_rejects_garbage() {
        let result = create_thumbnail(b"definitely not an image", 200);
        assert!(matches!(result, Err(ThumbnailError::ImageLoadError(_))));
    }
}
