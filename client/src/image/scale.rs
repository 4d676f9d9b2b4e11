//! Letterbox scaling and luma thresholding

use core::ops::Range;

use embedded_graphics::prelude::Size;

/// Luma at or above this is white (black when inverted)
pub const THRESHOLD: u8 = 128;

/// Luma from 8-bit RGB with integer 30/59/11 weights
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 30 + g as u32 * 59 + b as u32 * 11) / 100) as u8
}

/// Black/white decision for one pixel
#[inline]
pub fn is_black(luma: u8, invert: bool) -> bool {
    if invert { luma >= THRESHOLD } else { luma < THRESHOLD }
}

/// Uniform fit of a source image into the frame, centered
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    /// Scaled image size
    pub width: u32,
    pub height: u32,
    /// Top-left corner of the scaled image
    pub offset_x: i32,
    pub offset_y: i32,
    source_width: u32,
    source_height: u32,
}

impl Letterbox {
    pub fn fit(source: Size, frame: Size) -> Self {
        let source_width = source.width.max(1);
        let source_height = source.height.max(1);
        let sx = frame.width as f32 / source_width as f32;
        let sy = frame.height as f32 / source_height as f32;
        let scale = sx.min(sy);

        // Extreme aspect ratios keep at least one pixel on the short side.
        let width = ((source_width as f32 * scale) as u32).max(1).min(frame.width);
        let height = ((source_height as f32 * scale) as u32).max(1).min(frame.height);

        Self {
            scale,
            width,
            height,
            offset_x: ((frame.width - width) / 2) as i32,
            offset_y: ((frame.height - height) / 2) as i32,
            source_width,
            source_height,
        }
    }

    /// Nearest source column for destination column `dx`
    #[inline]
    pub fn source_column(&self, dx: u32) -> u32 {
        ((dx as f32 / self.scale) as u32).min(self.source_width - 1)
    }

    /// Destination rows covered by source row `sy`. Empty when downscaling skips it.
    pub fn rows_for(&self, sy: u32) -> Range<u32> {
        if sy >= self.source_height {
            return 0..0;
        }
        let start = ((sy as f32 * self.scale) as u32).min(self.height);
        if sy + 1 == self.source_height {
            return start..self.height;
        }
        let end = (((sy + 1) as f32 * self.scale) as u32).min(self.height);
        start..end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_wide_source() {
        let layout = Letterbox::fit(Size::new(200, 100), Size::new(400, 300));
        assert_eq!(layout.scale, 2.0);
        assert_eq!((layout.width, layout.height), (400, 200));
        assert_eq!((layout.offset_x, layout.offset_y), (0, 50));
    }

    #[test]
    fn test_fit_tall_source_pillarboxed() {
        let layout = Letterbox::fit(Size::new(300, 600), Size::new(400, 300));
        assert_eq!(layout.scale, 0.5);
        assert_eq!((layout.width, layout.height), (150, 300));
        assert_eq!((layout.offset_x, layout.offset_y), (125, 0));
    }

    #[test]
    fn test_fit_exact_size() {
        let layout = Letterbox::fit(Size::new(400, 300), Size::new(400, 300));
        assert_eq!(layout.scale, 1.0);
        assert_eq!((layout.offset_x, layout.offset_y), (0, 0));
        assert_eq!(layout.rows_for(7), 7..8);
        assert_eq!(layout.source_column(399), 399);
    }

    #[test]
    fn test_upscale_repeats_rows() {
        let layout = Letterbox::fit(Size::new(200, 100), Size::new(400, 300));
        assert_eq!(layout.rows_for(0), 0..2);
        assert_eq!(layout.rows_for(99), 198..200);
        assert_eq!(layout.source_column(3), 1);
    }

    #[test]
    fn test_downscale_skips_rows() {
        let layout = Letterbox::fit(Size::new(800, 600), Size::new(400, 300));
        assert_eq!(layout.rows_for(0), 0..0);
        assert_eq!(layout.rows_for(1), 0..1);
        assert_eq!(layout.source_column(10), 20);
        assert!(layout.rows_for(600).is_empty());
    }

    #[test]
    fn test_sliver_sources_keep_one_pixel() {
        let tall = Letterbox::fit(Size::new(1, 2000), Size::new(400, 300));
        assert_eq!((tall.width, tall.height), (1, 300));
        assert_eq!(tall.offset_x, 199);
        assert_eq!(tall.source_column(0), 0);

        let wide = Letterbox::fit(Size::new(2000, 1), Size::new(400, 300));
        assert_eq!((wide.width, wide.height), (400, 1));
        assert_eq!(wide.offset_y, 149);
        assert_eq!(wide.rows_for(0), 0..1);
    }

    #[test]
    fn test_threshold_boundary() {
        assert!(!is_black(128, false));
        assert!(is_black(127, false));
        assert!(is_black(128, true));
        assert!(!is_black(127, true));
    }

    #[test]
    fn test_luma_weights() {
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(255, 0, 0), 76);
        assert_eq!(luma(0, 255, 0), 150);
        assert_eq!(luma(0, 0, 255), 28);
    }
}
