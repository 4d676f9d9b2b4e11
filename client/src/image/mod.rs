//! Image pipeline
//!
//! Turns downloaded bytes into a frame on the [`RenderSink`]. Two formats are
//! understood: a raw full-frame 1bpp bitmap, recognised by its exact length,
//! and PNG, decoded one scanline at a time, letterboxed and thresholded to
//! black and white. Anything that fails to decode produces a placeholder
//! frame instead of an error.

pub mod acquire;
pub mod png;
pub mod scale;

use alloc::vec;
use alloc::vec::Vec;

use embedded_graphics::image::{Image, ImageRaw};
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use log::{info, warn};

pub use acquire::{AcquireError, HeapStats, ImageDownload, plan_buffer_size};
pub use png::{PngDecoder, PngError, PngHeader};
pub use scale::{Letterbox, is_black};

use crate::render::{Abort, FrameOutcome, RenderSink};
use crate::screens;

/// What ended up on the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Raw bitmap drawn verbatim
    Bitmap,
    /// PNG decoded and scaled
    Png { width: u32, height: u32 },
    /// Decoding failed; the placeholder message is shown
    Placeholder(PngError),
}

impl RenderOutcome {
    /// True when the image itself is on screen
    pub fn is_image(&self) -> bool {
        !matches!(self, RenderOutcome::Placeholder(_))
    }
}

/// Decoder plus the bounded buffers it needs, reused for every image
pub struct ImagePipeline {
    decoder: PngDecoder,
    frame: Size,
    row_bits: Vec<u8>,
}

impl ImagePipeline {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            decoder: PngDecoder::new(),
            frame: Size::new(width, height),
            row_bits: vec![0u8; (width as usize).div_ceil(8)],
        }
    }

    /// Bytes in a raw full-frame bitmap
    pub fn raw_len(&self) -> usize {
        (self.frame.width as usize * self.frame.height as usize) / 8
    }

    /// Draw `data` as one frame on `sink`
    pub fn render<S: RenderSink>(
        &mut self,
        data: &[u8],
        sink: &mut S,
        invert: bool,
    ) -> Result<RenderOutcome, S::Error> {
        if data.len() == self.raw_len() {
            info!("image: raw bitmap ({} bytes)", data.len());
            let raw = ImageRaw::<BinaryColor>::new(data, self.frame.width);
            sink.frame(|target| {
                let Ok(()) = Image::new(&raw, Point::zero()).draw(target);
                Ok(())
            })?;
            return Ok(RenderOutcome::Bitmap);
        }

        match self.render_png(data, sink, invert)? {
            Ok(header) => {
                info!("image: png {}x{} drawn", header.width, header.height);
                Ok(RenderOutcome::Png {
                    width: header.width,
                    height: header.height,
                })
            }
            Err(e) => {
                warn!("image: decode failed: {:?}", e);
                screens::show(sink, &screens::decode_failed())?;
                Ok(RenderOutcome::Placeholder(e))
            }
        }
    }

    fn render_png<S: RenderSink>(
        &mut self,
        data: &[u8],
        sink: &mut S,
        invert: bool,
    ) -> Result<Result<PngHeader, PngError>, S::Error> {
        // First pass reads only the header to size the letterbox.
        let header = match png::read_header(data) {
            Ok(header) => header,
            Err(e) => return Ok(Err(e)),
        };
        if header.width as usize > png::MAX_WIDTH {
            return Ok(Err(PngError::TooWide(header.width)));
        }
        let layout = Letterbox::fit(Size::new(header.width, header.height), self.frame);
        info!(
            "image: scale {} -> {}x{} at ({}, {})",
            layout.scale, layout.width, layout.height, layout.offset_x, layout.offset_y
        );

        let decoder = &mut self.decoder;
        let bits = &mut self.row_bits;
        let mut failure = None;

        let outcome = sink.frame(|target| {
            let Ok(()) = target.clear(BinaryColor::Off);
            let result = decoder.decode(data, |y, line| {
                draw_source_row(&mut *target, &layout, y, invert, &mut bits[..], |x| {
                    line.luma(x)
                });
            });
            match result {
                Ok(_) => Ok(()),
                Err(e) => {
                    failure = Some(e);
                    Err(Abort)
                }
            }
        })?;

        match (outcome, failure) {
            (FrameOutcome::Shown, _) => Ok(Ok(header)),
            (FrameOutcome::Aborted, Some(e)) => Ok(Err(e)),
            (FrameOutcome::Aborted, None) => Ok(Err(PngError::Truncated)),
        }
    }
}

/// Threshold one source row and replicate it over its destination rows
fn draw_source_row<D, L>(
    target: &mut D,
    layout: &Letterbox,
    source_y: u32,
    invert: bool,
    bits: &mut [u8],
    luma: L,
) where
    D: DrawTarget<Color = BinaryColor, Error = core::convert::Infallible>,
    L: Fn(usize) -> u8,
{
    let rows = layout.rows_for(source_y);
    if rows.is_empty() {
        return;
    }

    let width = layout.width as usize;
    let bytes = width.div_ceil(8);
    let bits = &mut bits[..bytes];
    bits.fill(0);
    for dx in 0..width {
        let sx = layout.source_column(dx as u32) as usize;
        if is_black(luma(sx), invert) {
            bits[dx / 8] |= 0x80 >> (dx % 8);
        }
    }

    let raw = ImageRaw::<BinaryColor>::new(bits, layout.width);
    for dy in rows {
        let origin = Point::new(layout.offset_x, layout.offset_y + dy as i32);
        let Ok(()) = Image::new(&raw, origin).draw(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FrameRecorder, encode_png};

    #[test]
    fn test_raw_bitmap_drawn_verbatim() {
        let mut pipeline = ImagePipeline::new(16, 2);
        let mut sink = FrameRecorder::new(16, 2, 1);
        let data = [0xFF, 0x00, 0x0F, 0xF0];

        let outcome = pipeline.render(&data, &mut sink, false).unwrap();

        assert_eq!(outcome, RenderOutcome::Bitmap);
        let frame = sink.last();
        assert!(frame.black(0, 0) && frame.black(7, 0));
        assert!(!frame.black(8, 0));
        assert!(!frame.black(3, 1) && frame.black(4, 1));
        assert!(frame.black(8, 1) && !frame.black(12, 1));
    }

    #[test]
    fn test_raw_bitmap_ignores_invert() {
        let mut pipeline = ImagePipeline::new(8, 1);
        let mut sink = FrameRecorder::new(8, 1, 1);
        pipeline.render(&[0x80], &mut sink, true).unwrap();
        assert!(sink.last().black(0, 0));
        assert!(!sink.last().black(1, 0));
    }

    #[test]
    fn test_other_length_routes_to_png() {
        let mut pipeline = ImagePipeline::new(16, 2);
        let mut sink = FrameRecorder::new(16, 2, 1);
        let outcome = pipeline.render(&[0u8; 5], &mut sink, false).unwrap();
        assert!(matches!(outcome, RenderOutcome::Placeholder(PngError::Signature)));
    }

    #[test]
    fn test_png_letterboxed_and_thresholded() {
        // 2x1 source: black then white, scaled 2x into 4x4 with one row of margin.
        let png = encode_png(2, 1, 0, 8, &[0, 255]);
        let mut pipeline = ImagePipeline::new(4, 4);
        let mut sink = FrameRecorder::new(4, 4, 2);

        let outcome = pipeline.render(&png, &mut sink, false).unwrap();

        assert_eq!(outcome, RenderOutcome::Png { width: 2, height: 1 });
        let frame = sink.last();
        for y in 0..4 {
            let inside = (1..3).contains(&y);
            assert_eq!(frame.black(0, y), inside);
            assert_eq!(frame.black(1, y), inside);
            assert!(!frame.black(2, y));
            assert!(!frame.black(3, y));
        }
    }

    #[test]
    fn test_one_pixel_wide_png_still_drawn() {
        let png = encode_png(1, 64, 0, 8, &[0u8; 64]);
        let mut pipeline = ImagePipeline::new(4, 4);
        let mut sink = FrameRecorder::new(4, 4, 1);

        let outcome = pipeline.render(&png, &mut sink, false).unwrap();

        assert_eq!(outcome, RenderOutcome::Png { width: 1, height: 64 });
        let frame = sink.last();
        for y in 0..4 {
            assert!(frame.black(1, y));
            assert!(!frame.black(0, y));
            assert!(!frame.black(2, y));
        }
    }

    #[test]
    fn test_png_invert_flips_decision() {
        let png = encode_png(1, 1, 0, 8, &[128]);
        let mut pipeline = ImagePipeline::new(1, 1);

        let mut normal = FrameRecorder::new(1, 1, 1);
        pipeline.render(&png, &mut normal, false).unwrap();
        let mut inverted = FrameRecorder::new(1, 1, 1);
        pipeline.render(&png, &mut inverted, true).unwrap();

        assert!(!normal.last().black(0, 0));
        assert!(inverted.last().black(0, 0));
    }

    #[test]
    fn test_every_page_gets_identical_commands() {
        let png = encode_png(4, 4, 0, 8, &[0, 255, 0, 255].repeat(4));
        let mut pipeline = ImagePipeline::new(8, 8);
        let mut sink = FrameRecorder::new(8, 8, 4);
        pipeline.render(&png, &mut sink, false).unwrap();
        assert_eq!(sink.frames(), 1);
        assert!(sink.pages_consistent());
    }

    #[test]
    fn test_oversized_source_gets_placeholder() {
        let width = png::MAX_WIDTH as u32 + 1;
        let png = encode_png(width, 1, 0, 8, &vec![0u8; width as usize]);
        let mut pipeline = ImagePipeline::new(400, 300);
        let mut sink = FrameRecorder::new(400, 300, 1);

        let outcome = pipeline.render(&png, &mut sink, false).unwrap();

        assert_eq!(outcome, RenderOutcome::Placeholder(PngError::TooWide(width)));
        assert_eq!(sink.frames(), 1);
        assert!(sink.last().any_black());
    }

    #[test]
    fn test_corrupt_stream_aborts_then_placeholder() {
        let mut png = encode_png(8, 8, 0, 8, &[0u8; 64]);
        // Zero the zlib header so inflate rejects the stream.
        let idat = png.windows(4).position(|w| w == b"IDAT").unwrap();
        png[idat + 4] = 0;
        png[idat + 5] = 0;
        let mut pipeline = ImagePipeline::new(8, 8);
        let mut sink = FrameRecorder::new(8, 8, 1);

        let outcome = pipeline.render(&png, &mut sink, false).unwrap();

        assert!(matches!(outcome, RenderOutcome::Placeholder(_)));
        assert_eq!(sink.aborted(), 1);
        assert_eq!(sink.frames(), 1);
    }
}
