use std::{fmt, path::Path};

use image::{DynamicImage, GrayImage, Luma};

use crate::{
    error::ImageError,
    pipeline::{self, ConvertMode},
};

/// Dots across the print head. 48 bytes per row.
pub const HORIZ_RESOLUTION: u32 = 384;
pub const ROW_BYTES: usize = HORIZ_RESOLUTION as usize / 8;

const _: () = assert!(HORIZ_RESOLUTION % 8 == 0);

/// 1 bit per dot, row-major, MSB-first within a byte, 1 = burn.
#[derive(Clone, PartialEq, Eq)]
pub struct RasterImage {
    height: u32,
    data: Vec<u8>,
}

impl RasterImage {
    /// All-white raster.
    pub fn blank(height: u32) -> Self {
        Self {
            height,
            data: vec![0; height as usize * ROW_BYTES],
        }
    }

    pub fn with_capacity(rows: u32) -> Self {
        Self {
            height: 0,
            data: Vec::with_capacity(rows as usize * ROW_BYTES),
        }
    }

    pub fn push_row(&mut self, row: &[u8; ROW_BYTES]) {
        self.data.extend_from_slice(row);
        self.height += 1;
    }

    pub const fn width(&self) -> u32 {
        HORIZ_RESOLUTION
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * ROW_BYTES;
        &self.data[start..start + ROW_BYTES]
    }

    pub fn rows(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        self.data.chunks_exact(ROW_BYTES)
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.row(y)[x as usize / 8] & (0x80 >> (x % 8)) != 0
    }

    pub fn set(&mut self, x: u32, y: u32, black: bool) {
        let byte = &mut self.data[y as usize * ROW_BYTES + x as usize / 8];
        let mask = 0x80 >> (x % 8);
        if black {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Render back to 8-bit grayscale, black dots as 0.
    pub fn to_preview(&self) -> GrayImage {
        GrayImage::from_fn(HORIZ_RESOLUTION, self.height, |x, y| {
            if self.get(x, y) {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }
}

impl fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterImage")
            .field("width", &HORIZ_RESOLUTION)
            .field("height", &self.height)
            .finish()
    }
}

/// A raster ready to go to the printer. Consumed by [`crate::t02::encode`].
#[derive(Debug, Clone)]
pub struct PrintJob {
    raster: RasterImage,
}

impl PrintJob {
    pub fn new(raster: RasterImage) -> Self {
        Self { raster }
    }

    pub fn open(path: impl AsRef<Path>, mode: ConvertMode) -> Result<Self, ImageError> {
        Ok(Self::new(pipeline::prepare_path(path, mode)?))
    }

    pub fn from_image(img: &DynamicImage, mode: ConvertMode) -> Result<Self, ImageError> {
        Ok(Self::new(pipeline::prepare(img, mode)?))
    }

    pub fn raster(&self) -> &RasterImage {
        &self.raster
    }

    pub fn into_raster(self) -> RasterImage {
        self.raster
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order() {
        let mut r = RasterImage::blank(2);
        r.set(0, 0, true);
        r.set(9, 1, true);
        assert_eq!(r.row(0)[0], 0b1000_0000);
        assert_eq!(r.row(1)[1], 0b0100_0000);
        assert!(r.get(9, 1));
        assert!(!r.get(8, 1));

        r.set(0, 0, false);
        assert_eq!(r.row(0)[0], 0);
    }

    #[test]
    fn test_push_rows() {
        let mut r = RasterImage::with_capacity(3);
        r.push_row(&[0xff; ROW_BYTES]);
        r.push_row(&[0x00; ROW_BYTES]);
        assert_eq!(r.height(), 2);
        assert_eq!(r.rows().len(), 2);
        assert_eq!(r.as_bytes().len(), 2 * ROW_BYTES);
    }

    #[test]
    fn test_preview() {
        let mut r = RasterImage::blank(1);
        r.set(3, 0, true);
        let p = r.to_preview();
        assert_eq!(p.dimensions(), (HORIZ_RESOLUTION, 1));
        assert_eq!(p.get_pixel(3, 0).0[0], 0);
        assert_eq!(p.get_pixel(4, 0).0[0], 255);
    }
}
