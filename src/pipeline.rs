//! Bitmap -> 384-dot monochrome raster.
//!
//! Every pixel is read as straight RGBA and flattened onto white paper,
//! landscape input is read turned clockwise, and a separable Lanczos3
//! resample brings it to the head width. Then either threshold or gamma
//! corrected Floyd-Steinberg. All of it runs one output row at a time: the
//! resampler keeps only the source rows its vertical filter covers and the
//! ditherer only two rows of error, so the decoded image is the only full
//! bitmap ever held.

use std::{collections::VecDeque, f32::consts::PI, path::Path};

use image::{DynamicImage, GenericImageView, Pixel, Rgb, Rgba};
use log::debug;

use crate::{
    error::ImageError,
    raster::{RasterImage, HORIZ_RESOLUTION, ROW_BYTES},
};

const GAMMA: f64 = 2.2;
const THRESHOLD: f64 = 128.0;

// BT.709
const LUMA_R: f64 = 0.2126;
const LUMA_G: f64 = 0.7152;
const LUMA_B: f64 = 0.0722;

const LANCZOS_SUPPORT: f32 = 3.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConvertMode {
    /// Gamma-correct luminance plus Floyd-Steinberg error diffusion.
    #[default]
    Dithered,
    /// Plain `luma < 128` cut, no diffusion.
    Threshold,
}

pub fn prepare_path(path: impl AsRef<Path>, mode: ConvertMode) -> Result<RasterImage, ImageError> {
    let path = path.as_ref();
    let img = image::open(path)?;
    debug!("decoded {} ({}x{})", path.display(), img.width(), img.height());
    prepare(&img, mode)
}

pub fn prepare(img: &DynamicImage, mode: ConvertMode) -> Result<RasterImage, ImageError> {
    let rows = ScaledRows::new(img)?;
    debug!(
        "scaling {}x{} to {}x{}, converting ({:?})",
        img.width(),
        img.height(),
        HORIZ_RESOLUTION,
        rows.height(),
        mode
    );

    Ok(match mode {
        ConvertMode::Dithered => dither(rows),
        ConvertMode::Threshold => threshold(rows),
    })
}

pub fn scaled_height(width: u32, height: u32) -> u32 {
    (HORIZ_RESOLUTION as f64 * height as f64 / width as f64).round() as u32
}

/// The source as it will be printed: turned upright, on white paper.
/// Reads straight out of the decoded image.
struct Portrait<'a> {
    img: &'a DynamicImage,
    rotated: bool,
}

impl<'a> Portrait<'a> {
    /// Tape is fixed width, so anything wider than tall is turned clockwise.
    fn new(img: &'a DynamicImage) -> Self {
        Self {
            img,
            rotated: img.width() > img.height(),
        }
    }

    fn width(&self) -> u32 {
        if self.rotated {
            self.img.height()
        } else {
            self.img.width()
        }
    }

    fn height(&self) -> u32 {
        if self.rotated {
            self.img.width()
        } else {
            self.img.height()
        }
    }

    fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let px = if self.rotated {
            self.img.get_pixel(y, self.img.height() - 1 - x)
        } else {
            self.img.get_pixel(x, y)
        };
        flatten(px)
    }
}

/// Composite over white.
fn flatten(px: Rgba<u8>) -> [f32; 3] {
    let [r, g, b, a] = px.0;
    let a = a as f32 / 255.0;
    [r, g, b].map(|c| c as f32 * a + 255.0 * (1.0 - a))
}

fn sinc(t: f32) -> f32 {
    if t == 0.0 {
        1.0
    } else {
        let a = t * PI;
        a.sin() / a
    }
}

fn lanczos3(x: f32) -> f32 {
    if x.abs() < LANCZOS_SUPPORT {
        sinc(x) * sinc(x / LANCZOS_SUPPORT)
    } else {
        0.0
    }
}

/// Normalized filter weights for one output sample, over the source samples
/// `start..start + weights.len()`.
struct Taps {
    start: usize,
    weights: Vec<f32>,
}

impl Taps {
    fn new(out: u32, src_len: u32, dst_len: u32) -> Self {
        let ratio = src_len as f32 / dst_len as f32;
        let sratio = ratio.max(1.0);
        let support = LANCZOS_SUPPORT * sratio;
        let center = (out as f32 + 0.5) * ratio;

        let left = ((center - support).floor().max(0.0) as u32).min(src_len - 1);
        let right = ((center + support).ceil() as u32).clamp(left + 1, src_len);

        // kernel 0 is the middle of a sample
        let center = center - 0.5;
        let mut weights: Vec<f32> = (left..right)
            .map(|i| lanczos3((i as f32 - center) / sratio))
            .collect();
        let sum: f32 = weights.iter().sum();
        for w in &mut weights {
            *w /= sum;
        }

        Self {
            start: left as usize,
            weights,
        }
    }

    fn end(&self) -> usize {
        self.start + self.weights.len()
    }

    fn apply<'s>(&self, samples: impl IntoIterator<Item = &'s [f32; 3]>) -> [f32; 3] {
        let mut acc = [0.0f32; 3];
        for (w, sample) in self.weights.iter().zip(samples) {
            for (a, v) in acc.iter_mut().zip(sample) {
                *a += w * v;
            }
        }
        acc
    }
}

/// The source resampled to 384 wide, produced one row at a time.
///
/// Each source row is resampled horizontally once, when the vertical filter
/// first reaches it, and dropped as soon as the filter has moved past it.
pub struct ScaledRows<'a> {
    src: Portrait<'a>,
    height: u32,
    columns: Vec<Taps>,
    line: Vec<[f32; 3]>,
    window: VecDeque<Vec<[f32; 3]>>,
    window_start: usize,
    peak_window: usize,
    y: u32,
}

impl<'a> ScaledRows<'a> {
    pub fn new(img: &'a DynamicImage) -> Result<Self, ImageError> {
        let (width, height) = (img.width(), img.height());
        if width == 0 || height == 0 {
            return Err(ImageError::Empty { width, height });
        }
        Self::from_portrait(Portrait::new(img))
    }

    fn from_portrait(src: Portrait<'a>) -> Result<Self, ImageError> {
        let height = scaled_height(src.width(), src.height());
        if height == 0 {
            return Err(ImageError::Degenerate {
                width: HORIZ_RESOLUTION,
                height,
            });
        }

        let columns = (0..HORIZ_RESOLUTION)
            .map(|x| Taps::new(x, src.width(), HORIZ_RESOLUTION))
            .collect();
        let line = vec![[0.0; 3]; src.width() as usize];
        Ok(Self {
            src,
            height,
            columns,
            line,
            window: VecDeque::new(),
            window_start: 0,
            peak_window: 0,
            y: 0,
        })
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Most source rows held at once so far.
    pub fn peak_window(&self) -> usize {
        self.peak_window
    }

    fn load(&mut self, y: usize) -> Vec<[f32; 3]> {
        for (x, px) in self.line.iter_mut().enumerate() {
            *px = self.src.pixel(x as u32, y as u32);
        }
        self.columns
            .iter()
            .map(|t| t.apply(&self.line[t.start..]))
            .collect()
    }
}

impl Iterator for ScaledRows<'_> {
    type Item = Vec<Rgb<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.y >= self.height {
            return None;
        }
        let taps = Taps::new(self.y, self.src.height(), self.height);
        self.y += 1;

        // the filter only ever moves down
        while self.window_start < taps.start {
            self.window.pop_front();
            self.window_start += 1;
        }
        while self.window_start + self.window.len() < taps.end() {
            let row = self.load(self.window_start + self.window.len());
            self.window.push_back(row);
        }
        self.peak_window = self.peak_window.max(self.window.len());

        let row = (0..HORIZ_RESOLUTION as usize)
            .map(|x| {
                let px = taps.apply(self.window.iter().map(|row| &row[x]));
                Rgb(px.map(|c| c.round().clamp(0.0, 255.0) as u8))
            })
            .collect();
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.height - self.y) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ScaledRows<'_> {}

pub fn threshold(rows: impl ExactSizeIterator<Item = Vec<Rgb<u8>>>) -> RasterImage {
    let mut raster = RasterImage::with_capacity(rows.len() as u32);
    for row in rows {
        let mut out = [0u8; ROW_BYTES];
        for (x, px) in row.iter().take(HORIZ_RESOLUTION as usize).enumerate() {
            if px.to_luma().0[0] < THRESHOLD as u8 {
                out[x / 8] |= 0x80 >> (x % 8);
            }
        }
        raster.push_row(&out);
    }
    raster
}

pub fn dither(rows: impl ExactSizeIterator<Item = Vec<Rgb<u8>>>) -> RasterImage {
    let mut fs = FloydSteinberg::new(HORIZ_RESOLUTION as usize);
    let mut raster = RasterImage::with_capacity(rows.len() as u32);
    let mut line = vec![255f64; HORIZ_RESOLUTION as usize];

    for row in rows {
        for (l, px) in line.iter_mut().zip(&row) {
            *l = luminance(px);
        }
        let mut out = [0u8; ROW_BYTES];
        fs.diffuse_row(&line, &mut out);
        raster.push_row(&out);
    }
    raster
}

/// Perceptual gray level in 0..=255 via linear light.
pub fn luminance(px: &Rgb<u8>) -> f64 {
    let lin = |c: u8| (c as f64 / 255.0).powf(GAMMA);
    let [r, g, b] = px.0;
    let y = LUMA_R * lin(r) + LUMA_G * lin(g) + LUMA_B * lin(b);
    y.powf(1.0 / GAMMA) * 255.0
}

/// Causal error diffusion, one row at a time.
struct FloydSteinberg {
    cur: Vec<f64>,
    next: Vec<f64>,
}

impl FloydSteinberg {
    fn new(width: usize) -> Self {
        Self {
            cur: vec![0.0; width],
            next: vec![0.0; width],
        }
    }

    fn diffuse_row(&mut self, line: &[f64], out: &mut [u8; ROW_BYTES]) {
        let w = line.len();
        for x in 0..w {
            let old = line[x] + self.cur[x];
            let new = if old < THRESHOLD { 0.0 } else { 255.0 };
            let err = old - new;

            if new == 0.0 {
                out[x / 8] |= 0x80 >> (x % 8);
            }

            if x + 1 < w {
                self.cur[x + 1] += err * 7.0 / 16.0;
                self.next[x + 1] += err * 1.0 / 16.0;
            }
            if x > 0 {
                self.next[x - 1] += err * 3.0 / 16.0;
            }
            self.next[x] += err * 5.0 / 16.0;
        }

        std::mem::swap(&mut self.cur, &mut self.next);
        self.next.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use image::RgbaImage;

    use super::*;

    fn solid(w: u32, h: u32, v: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([v, v, v, 255])))
    }

    fn black_dots(r: &RasterImage) -> usize {
        r.as_bytes().iter().map(|b| b.count_ones() as usize).sum()
    }

    #[test]
    fn test_white_is_blank() {
        let r = prepare(&solid(100, 300, 255), ConvertMode::Dithered).unwrap();
        assert_eq!(r.width(), 384);
        assert_eq!(r.height(), 1152);
        assert!(r.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_black_is_solid() {
        let r = prepare(&solid(50, 60, 0), ConvertMode::Dithered).unwrap();
        assert_eq!(r.height(), scaled_height(50, 60));
        assert!(r.as_bytes().iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_mid_gray_is_halftoned() {
        let r = prepare(&solid(64, 128, 128), ConvertMode::Dithered).unwrap();
        assert_eq!(r.height(), 768);
        let total = 384 * r.height() as usize;
        let black = black_dots(&r);
        assert!(black > total * 4 / 10 && black < total * 6 / 10, "{} of {}", black, total);
    }

    #[test]
    fn test_threshold_mode() {
        let dark = prepare(&solid(10, 20, 127), ConvertMode::Threshold).unwrap();
        assert_eq!(dark.height(), 768);
        assert!(dark.as_bytes().iter().all(|&b| b == 0xff));

        let light = prepare(&solid(10, 20, 128), ConvertMode::Threshold).unwrap();
        assert!(light.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scaled_height_rounds() {
        assert_eq!(scaled_height(768, 1536), 768);
        assert_eq!(scaled_height(1000, 1001), 384); // 384.384
        assert_eq!(scaled_height(1000, 1003), 385); // 385.152
        assert_eq!(scaled_height(3, 2), 256);
    }

    #[test]
    fn test_portrait_768x1536() {
        let img = solid(768, 1536, 255);
        let mut rows = ScaledRows::new(&img).unwrap();
        assert_eq!(rows.len(), 768);
        assert!(rows.by_ref().all(|row| row.len() == 384));
        // 2:1 downscale, 6 source rows either side
        assert!(rows.peak_window() <= 13, "{}", rows.peak_window());

        let r = prepare(&img, ConvertMode::Dithered).unwrap();
        assert_eq!((r.width(), r.height()), (384, 768));
    }

    #[test]
    fn test_tall_input_streams() {
        // top quarter black, the rest white
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(50, 2000, |_, y| {
            if y < 500 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        }));
        let mut rows = ScaledRows::new(&img).unwrap();
        assert_eq!(rows.len(), 15360);

        let mut count = 0;
        for (y, row) in rows.by_ref().enumerate() {
            if y == 100 {
                assert!(row.iter().all(|px| px.0 == [0, 0, 0]));
            }
            if y == 15000 {
                assert!(row.iter().all(|px| px.0 == [255, 255, 255]));
            }
            count += 1;
        }
        assert_eq!(count, 15360);
        // upscaling: never more than the kernel's 7 taps
        assert!(rows.peak_window() <= 7, "{}", rows.peak_window());

        let r = prepare(&img, ConvertMode::Threshold).unwrap();
        assert_eq!(r.height(), 15360);
        assert!(r.row(100).iter().all(|&b| b == 0xff));
        assert!(r.row(15000).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_landscape_rotates_clockwise() {
        // left half black; clockwise turn puts it on top
        let img = RgbaImage::from_fn(400, 200, |x, _| {
            if x < 200 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let r = prepare(&DynamicImage::ImageRgba8(img), ConvertMode::Threshold).unwrap();
        assert_eq!(r.height(), 768);
        assert!(r.row(10).iter().all(|&b| b == 0xff));
        assert!(r.row(700).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rotation_direction() {
        // a single black pixel in the top-left corner of a landscape image
        // ends up top-right once turned clockwise
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(3, 2, |x, y| {
            if (x, y) == (0, 0) {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        }));
        let p = Portrait::new(&img);
        assert_eq!((p.width(), p.height()), (2, 3));
        assert_eq!(p.pixel(1, 0), [0.0; 3]);
        assert_eq!(p.pixel(0, 0), [255.0; 3]);
    }

    #[test]
    fn test_transparent_is_paper() {
        let img = RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 0]));
        let r = prepare(&DynamicImage::ImageRgba8(img), ConvertMode::Dithered).unwrap();
        assert_eq!(black_dots(&r), 0);
        assert_eq!(flatten(Rgba([0, 0, 0, 0])), [255.0; 3]);
        assert_eq!(flatten(Rgba([10, 20, 30, 255])), [10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_deterministic() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(90, 130, |x, y| {
            Rgba([(x * 3) as u8, (y * 2) as u8, ((x + y) % 256) as u8, 255])
        }));
        let a = prepare(&img, ConvertMode::Dithered).unwrap();
        let b = prepare(&img, ConvertMode::Dithered).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_rejected() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(0, 10));
        assert!(matches!(
            prepare(&img, ConvertMode::Dithered),
            Err(ImageError::Empty { .. })
        ));
    }

    #[test]
    fn test_degenerate_rejected() {
        // read without turning, 384 * 1 / 1000 rounds to 0 rows
        let wide = solid(1000, 1, 0);
        let src = Portrait {
            img: &wide,
            rotated: false,
        };
        assert!(matches!(
            ScaledRows::from_portrait(src),
            Err(ImageError::Degenerate { .. })
        ));
    }

    #[test]
    fn test_taps_are_normalized() {
        for (src, dst) in [(50, 384), (768, 384), (4000, 384)] {
            for out in [0, 1, 191, 383] {
                let t = Taps::new(out, src, dst);
                let sum: f32 = t.weights.iter().sum();
                assert!((sum - 1.0).abs() < 1e-4);
                assert!(t.end() <= src as usize);
            }
        }
    }

    #[test]
    fn test_luminance_extremes() {
        assert_eq!(luminance(&Rgb([255, 255, 255])).round(), 255.0);
        assert_eq!(luminance(&Rgb([0, 0, 0])), 0.0);
        // pure green outweighs pure blue
        assert!(luminance(&Rgb([0, 255, 0])) > luminance(&Rgb([0, 0, 255])));
    }
}
