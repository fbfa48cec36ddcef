// ============================================================================
// PIXEL STORAGE — RGBA8 buffers, coverage buffers, pixel rectangles
// ============================================================================

use image::{GrayImage, RgbaImage, imageops};

use crate::error::{EngineError, Result};

/// Bytes per pixel (R, G, B, A; straight alpha).
pub const CHANNELS: usize = 4;

/// Sanity cap on buffer size (~256 megapixels), checked before allocating.
pub const MAX_PIXELS: u64 = 256_000_000;

/// Axis-aligned pixel rectangle; `x + width` / `y + height` are exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_min_max(min_x: u32, min_y: u32, max_x_incl: u32, max_y_incl: u32) -> Self {
        Self {
            x: min_x,
            y: min_y,
            width: max_x_incl + 1 - min_x,
            height: max_y_incl + 1 - min_y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Grow by `pad` on every side, clamped to a `w`×`h` canvas.
    pub fn expand_clamped(&self, pad: u32, w: u32, h: u32) -> Rect {
        let x = self.x.saturating_sub(pad);
        let y = self.y.saturating_sub(pad);
        let right = self.right().saturating_add(pad).min(w);
        let bottom = self.bottom().saturating_add(pad).min(h);
        Rect::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }

    pub fn fits_within(&self, w: u32, h: u32) -> bool {
        self.right() <= w && self.bottom() <= h
    }
}

/// Check that a `w`×`h`×`channels` allocation is sane and reserve it.
pub(crate) fn try_alloc<T: Clone>(w: u32, h: u32, channels: usize, fill: T) -> Result<Vec<T>> {
    let pixels = w as u64 * h as u64;
    if pixels > MAX_PIXELS {
        return Err(EngineError::ResourceExhausted(format!(
            "{}×{} exceeds the {} pixel limit",
            w, h, MAX_PIXELS
        )));
    }
    let len = pixels as usize * channels;
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| {
        EngineError::ResourceExhausted(format!("cannot allocate {}×{} buffer: {}", w, h, e))
    })?;
    data.resize(len, fill);
    Ok(data)
}

// ============================================================================
// PIXEL BUFFER
// ============================================================================

/// Row-major RGBA8 pixel grid.  `data.len() == width * height * 4` always.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl PixelBuffer {
    /// Fully transparent buffer.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::filled(width, height, [0, 0, 0, 0])
    }

    pub fn filled(width: u32, height: u32, color: [u8; 4]) -> Result<Self> {
        let mut data = try_alloc(width, height, CHANNELS, 0u8)?;
        if color != [0, 0, 0, 0] {
            for px in data.chunks_exact_mut(CHANNELS) {
                px.copy_from_slice(&color);
            }
        }
        Ok(Self { width, height, data })
    }

    /// Wrap raw RGBA bytes.  Fails with `OutOfRange` on a length mismatch.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(EngineError::out_of_range(format!(
                "{} bytes supplied for a {}×{} buffer (expected {})",
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self { width, height, data })
    }

    pub fn from_rgba_image(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        // Length invariant guarantees from_raw succeeds.
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stride(&self) -> usize {
        self.width as usize * CHANNELS
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn as_raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn memory_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    /// Pixel at (x, y).  Panics if out of bounds, like slice indexing.
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let o = self.offset(x, y);
        [self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]]
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, px: [u8; 4]) {
        let o = self.offset(x, y);
        self.data[o..o + CHANNELS].copy_from_slice(&px);
    }

    /// Copy a region out as tightly packed RGBA bytes.
    pub fn extract_region(&self, rect: Rect) -> Result<Vec<u8>> {
        if !rect.fits_within(self.width, self.height) {
            return Err(EngineError::out_of_range(format!(
                "region {:?} outside {}×{} buffer",
                rect, self.width, self.height
            )));
        }
        let row_bytes = rect.width as usize * CHANNELS;
        let mut out = Vec::with_capacity(row_bytes * rect.height as usize);
        for y in rect.y..rect.bottom() {
            let start = self.offset(rect.x, y);
            out.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Ok(out)
    }

    /// Write tightly packed RGBA bytes into `rect`.
    pub fn blit_region(&mut self, rect: Rect, data: &[u8]) -> Result<()> {
        if !rect.fits_within(self.width, self.height) {
            return Err(EngineError::out_of_range(format!(
                "region {:?} outside {}×{} buffer",
                rect, self.width, self.height
            )));
        }
        let row_bytes = rect.width as usize * CHANNELS;
        if data.len() != row_bytes * rect.height as usize {
            return Err(EngineError::out_of_range(format!(
                "patch holds {} bytes, region {:?} needs {}",
                data.len(),
                rect,
                row_bytes * rect.height as usize
            )));
        }
        for (row, y) in (rect.y..rect.bottom()).enumerate() {
            let start = self.offset(rect.x, y);
            self.data[start..start + row_bytes]
                .copy_from_slice(&data[row * row_bytes..(row + 1) * row_bytes]);
        }
        Ok(())
    }

    /// Sub-image copy.
    pub fn crop(&self, rect: Rect) -> Result<PixelBuffer> {
        let data = self.extract_region(rect)?;
        PixelBuffer::from_raw(rect.width, rect.height, data)
    }

    /// Smallest rectangle containing every pixel that differs from `other`.
    /// `None` when the buffers are identical.
    pub fn diff_bounds(&self, other: &PixelBuffer) -> Result<Option<Rect>> {
        if self.dimensions() != other.dimensions() {
            return Err(EngineError::out_of_range(format!(
                "cannot diff {}×{} against {}×{}",
                self.width, self.height, other.width, other.height
            )));
        }
        let stride = self.stride();
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        for y in 0..self.height as usize {
            let a = &self.data[y * stride..(y + 1) * stride];
            let b = &other.data[y * stride..(y + 1) * stride];
            if a == b {
                continue;
            }
            for x in 0..self.width as usize {
                let o = x * CHANNELS;
                if a[o..o + CHANNELS] != b[o..o + CHANNELS] {
                    min_x = min_x.min(x as u32);
                    max_x = max_x.max(x as u32);
                }
            }
            min_y = min_y.min(y as u32);
            max_y = max_y.max(y as u32);
        }
        if min_x > max_x || min_y > max_y {
            return Ok(None);
        }
        Ok(Some(Rect::from_min_max(min_x, min_y, max_x, max_y)))
    }

    /// Downscaled copy whose longest edge is at most `max_edge`.
    /// Returns a plain clone when already small enough.
    pub fn downsample(&self, max_edge: u32) -> PixelBuffer {
        let longest = self.width.max(self.height);
        if max_edge == 0 || longest <= max_edge {
            return self.clone();
        }
        let (nw, nh) = scaled_dims(self.width, self.height, max_edge);
        let resized = imageops::resize(&self.to_rgba_image(), nw, nh, imageops::FilterType::Triangle);
        PixelBuffer::from_rgba_image(resized)
    }
}

/// Dimensions after scaling so the longest edge equals `max_edge`.
pub fn scaled_dims(w: u32, h: u32, max_edge: u32) -> (u32, u32) {
    let longest = w.max(h);
    if longest <= max_edge || max_edge == 0 {
        return (w, h);
    }
    let scale = max_edge as f32 / longest as f32;
    (
        ((w as f32 * scale).round() as u32).max(1),
        ((h as f32 * scale).round() as u32).max(1),
    )
}

// ============================================================================
// COVERAGE BUFFER — single-channel 0.0..=1.0 weights (masks, selections)
// ============================================================================

#[derive(Clone, PartialEq)]
pub struct CoverageBuffer {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl std::fmt::Debug for CoverageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl CoverageBuffer {
    /// Zero coverage everywhere.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::filled(width, height, 0.0)
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Result<Self> {
        let data = try_alloc(width, height, 1, value.clamp(0.0, 1.0))?;
        Ok(Self { width, height, data })
    }

    /// Values are clamped into `0.0..=1.0`; NaN becomes 0.
    pub fn from_raw(width: u32, height: u32, mut data: Vec<f32>) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            return Err(EngineError::out_of_range(format!(
                "{} coverage values supplied for a {}×{} mask",
                data.len(),
                width,
                height
            )));
        }
        for v in &mut data {
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn as_raw(&self) -> &[f32] {
        &self.data
    }

    pub fn memory_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let w = self.width as usize;
        self.data[y as usize * w + x as usize] = value.clamp(0.0, 1.0);
    }

    pub(crate) fn row(&self, y: usize) -> &[f32] {
        let w = self.width as usize;
        &self.data[y * w..(y + 1) * w]
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Bounding box of all pixels with coverage > 0.
    pub fn bounds(&self) -> Option<Rect> {
        let w = self.width as usize;
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        for (y, row) in self.data.chunks_exact(w.max(1)).enumerate() {
            for (x, &c) in row.iter().enumerate() {
                if c > 0.0 {
                    min_x = min_x.min(x as u32);
                    min_y = min_y.min(y as u32);
                    max_x = max_x.max(x as u32);
                    max_y = max_y.max(y as u32);
                }
            }
        }
        if min_x > max_x || min_y > max_y {
            None
        } else {
            Some(Rect::from_min_max(min_x, min_y, max_x, max_y))
        }
    }

    pub fn crop(&self, rect: Rect) -> Result<CoverageBuffer> {
        if !rect.fits_within(self.width, self.height) {
            return Err(EngineError::out_of_range(format!(
                "region {:?} outside {}×{} mask",
                rect, self.width, self.height
            )));
        }
        let mut data = Vec::with_capacity(rect.area());
        for y in rect.y..rect.bottom() {
            let row = self.row(y as usize);
            data.extend_from_slice(&row[rect.x as usize..rect.right() as usize]);
        }
        Ok(CoverageBuffer {
            width: rect.width,
            height: rect.height,
            data,
        })
    }

    /// Nearest-neighbour resample to exactly `w`×`h` (preview resolution).
    pub fn resample(&self, w: u32, h: u32) -> CoverageBuffer {
        if (w, h) == (self.width, self.height) {
            return self.clone();
        }
        let mut data = Vec::with_capacity(w as usize * h as usize);
        for y in 0..h {
            let sy = ((y as u64 * self.height as u64) / h.max(1) as u64) as u32;
            for x in 0..w {
                let sx = ((x as u64 * self.width as u64) / w.max(1) as u64) as u32;
                data.push(self.get(sx.min(self.width - 1), sy.min(self.height - 1)));
            }
        }
        CoverageBuffer { width: w, height: h, data }
    }

    /// 8-bit view (0 = none, 255 = full) for export and display.
    pub fn to_gray_image(&self) -> GrayImage {
        let raw: Vec<u8> = self.data.iter().map(|&c| (c * 255.0).round() as u8).collect();
        GrayImage::from_raw(self.width, self.height, raw)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    pub fn from_gray_image(img: &GrayImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            data: img.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::new(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                buf.put_pixel(x, y, [x as u8, y as u8, (x + y) as u8, 255]);
            }
        }
        buf
    }

    #[test]
    fn from_raw_checks_length() {
        assert!(PixelBuffer::from_raw(2, 2, vec![0; 16]).is_ok());
        let err = PixelBuffer::from_raw(2, 2, vec![0; 15]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfRange);
    }

    #[test]
    fn oversized_allocation_is_resource_exhausted() {
        let err = PixelBuffer::new(100_000, 100_000).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn extract_then_blit_restores_region() {
        let src = gradient(8, 6);
        let rect = Rect::new(2, 1, 3, 4);
        let patch = src.extract_region(rect).unwrap();
        let mut dst = PixelBuffer::new(8, 6).unwrap();
        dst.blit_region(rect, &patch).unwrap();
        assert_eq!(dst.get_pixel(2, 1), src.get_pixel(2, 1));
        assert_eq!(dst.get_pixel(4, 4), src.get_pixel(4, 4));
        assert_eq!(dst.get_pixel(5, 1), [0, 0, 0, 0]);
        assert!(dst.blit_region(Rect::new(6, 0, 3, 1), &patch).is_err());
    }

    #[test]
    fn diff_bounds_is_tight() {
        let a = gradient(10, 10);
        let mut b = a.clone();
        assert_eq!(a.diff_bounds(&b).unwrap(), None);
        b.put_pixel(3, 7, [1, 2, 3, 4]);
        b.put_pixel(6, 2, [9, 9, 9, 9]);
        assert_eq!(a.diff_bounds(&b).unwrap(), Some(Rect::new(3, 2, 4, 6)));
    }

    #[test]
    fn downsample_caps_longest_edge() {
        let buf = gradient(200, 100);
        let small = buf.downsample(50);
        assert_eq!(small.dimensions(), (50, 25));
        assert_eq!(buf.downsample(500).dimensions(), (200, 100));
    }

    #[test]
    fn coverage_bounds_and_crop() {
        let mut cov = CoverageBuffer::new(10, 10).unwrap();
        assert_eq!(cov.bounds(), None);
        cov.set(2, 3, 0.5);
        cov.set(7, 8, 1.0);
        assert_eq!(cov.bounds(), Some(Rect::new(2, 3, 6, 6)));
        let sub = cov.crop(Rect::new(2, 3, 2, 2)).unwrap();
        assert_eq!(sub.get(0, 0), 0.5);
        cov.set(0, 0, 4.0);
        assert_eq!(cov.get(0, 0), 1.0);
    }

    #[test]
    fn rect_expand_clamps_to_canvas() {
        let r = Rect::new(2, 2, 3, 3).expand_clamped(5, 8, 20);
        assert_eq!(r, Rect::new(0, 0, 8, 10));
    }
}
