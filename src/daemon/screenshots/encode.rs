use anyhow::{Context, Result};
use image::{codecs::jpeg::JpegEncoder, imageops, RgbImage};

use crate::config::ScreenshotConfig;

#[derive(Debug, Clone, Copy)]
pub struct EncodeSettings {
    pub full_quality: u8,
    pub thumbnail_quality: u8,
    pub thumbnail_max_edge: u32,
}

impl From<&ScreenshotConfig> for EncodeSettings {
    fn from(value: &ScreenshotConfig) -> Self {
        Self {
            full_quality: value.full_quality.clamp(1, 100),
            thumbnail_quality: value.thumbnail_quality.clamp(1, 100),
            thumbnail_max_edge: value.thumbnail_max_edge.max(1),
        }
    }
}

/// Both encoded variants of one frame.
#[derive(Debug)]
pub struct EncodedCapture {
    pub width: u32,
    pub height: u32,
    pub full: Vec<u8>,
    pub thumbnail: Vec<u8>,
}

/// Size of the thumbnail: the source scaled uniformly so that its longest edge fits in
/// `max_edge`. Frames that already fit are not enlarged.
pub fn thumbnail_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_edge || longest == 0 {
        return (width, height);
    }
    let scale = |v: u32| ((v as u64 * max_edge as u64 + longest as u64 / 2) / longest as u64).max(1);
    (scale(width) as u32, scale(height) as u32)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(image)
        .context("Failed to encode jpeg")?;
    Ok(buffer)
}

/// CPU bound; callers run it on the blocking pool.
pub fn encode_capture(frame: &RgbImage, settings: EncodeSettings) -> Result<EncodedCapture> {
    let (width, height) = frame.dimensions();
    let full = encode_jpeg(frame, settings.full_quality)?;

    let (thumb_width, thumb_height) =
        thumbnail_dimensions(width, height, settings.thumbnail_max_edge);
    let thumbnail = if (thumb_width, thumb_height) == (width, height) {
        encode_jpeg(frame, settings.thumbnail_quality)?
    } else {
        let scaled = imageops::resize(
            frame,
            thumb_width,
            thumb_height,
            imageops::FilterType::Triangle,
        );
        encode_jpeg(&scaled, settings.thumbnail_quality)?
    };

    Ok(EncodedCapture {
        width,
        height,
        full,
        thumbnail,
    })
}
