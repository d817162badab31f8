use image::imageops::FilterType;
use image::{ImageFormat, ImageReader, Rgb, RgbImage};
use std::io::Cursor;

use crate::StreamerError;

/// Small fixed-size RGB grid used only for frame-to-frame comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct DownscaledRaster(RgbImage);

impl DownscaledRaster {
    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn pixel_count(&self) -> u32 {
        self.0.width() * self.0.height()
    }

    pub fn pixels(&self) -> impl Iterator<Item = &Rgb<u8>> {
        self.0.pixels()
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.0
    }
}

impl From<RgbImage> for DownscaledRaster {
    fn from(image: RgbImage) -> Self {
        Self(image)
    }
}

/// Decodes a JPEG and shrinks it to the comparison raster.
///
/// Bilinear is plenty here: the output feeds a pixel-difference count,
/// never a display. Alpha, if a decoder ever produced it, is dropped by
/// the RGB conversion.
#[derive(Debug, Clone, Copy)]
pub struct Downscaler {
    width: u32,
    height: u32,
}

impl Downscaler {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn downscale(&self, jpeg_data: &[u8]) -> Result<DownscaledRaster, StreamerError> {
        let img = ImageReader::with_format(Cursor::new(jpeg_data), ImageFormat::Jpeg)
            .decode()
            .map_err(|e| StreamerError::Decode(e.to_string()))?;

        let rgb = img
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8();
        Ok(DownscaledRaster(rgb))
    }
}
