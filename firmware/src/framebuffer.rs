//! Paged frame buffer for the 4.2" panel
//!
//! A full 1bpp frame is 15 000 bytes. Only one band of rows is kept in RAM;
//! the draw commands are replayed once per band and each band is streamed to
//! the controller before the next one is drawn.

use alloc::boxed::Box;
use alloc::vec;
use core::convert::Infallible;

use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;
use log::{debug, info};
use paperdink_client::render::{Abort, FrameOutcome, RenderSink};

use crate::epd::{Epd4in2, HEIGHT, ROW_BYTES, WIDTH};

/// Rows held per band
pub const BAND_ROWS: u32 = 100;

/// One horizontal band of the frame. Coordinates are absolute; pixels
/// outside the selected band are dropped.
pub struct Band {
    buffer: Box<[u8]>,
    top: u32,
    rows: u32,
}

impl Band {
    /// Allocate a band of `rows` rows, selected on page 0
    pub fn new(rows: u32) -> Self {
        let rows = rows.clamp(1, HEIGHT);
        Self {
            buffer: vec![0xFF; rows as usize * ROW_BYTES].into_boxed_slice(),
            top: 0,
            rows,
        }
    }

    /// Number of bands in a frame
    pub fn pages(&self) -> u32 {
        HEIGHT.div_ceil(self.rows)
    }

    /// Move to `page` and clear it to white
    pub fn select(&mut self, page: u32) {
        self.top = page * self.rows;
        self.buffer.fill(0xFF);
    }

    fn visible_rows(&self) -> u32 {
        self.rows.min(HEIGHT.saturating_sub(self.top))
    }

    fn area(&self) -> Rectangle {
        Rectangle::new(
            Point::new(0, self.top as i32),
            Size::new(WIDTH, self.visible_rows()),
        )
    }

    /// Panel bytes of the selected band
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.visible_rows() as usize * ROW_BYTES]
    }

    /// Write a single pixel; `On` is black
    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, color: BinaryColor) {
        if x >= WIDTH || y < self.top || y >= self.top + self.visible_rows() {
            return;
        }
        let idx = (y - self.top) as usize * ROW_BYTES + x as usize / 8;
        let mask = 0x80 >> (x % 8);
        match color {
            BinaryColor::On => self.buffer[idx] &= !mask,
            BinaryColor::Off => self.buffer[idx] |= mask,
        }
    }

    fn fill_bytes(color: BinaryColor) -> u8 {
        match color {
            BinaryColor::On => 0x00,
            BinaryColor::Off => 0xFF,
        }
    }
}

impl OriginDimensions for Band {
    fn size(&self) -> Size {
        Size::new(WIDTH, HEIGHT)
    }
}

impl DrawTarget for Band {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 {
                self.set_pixel(point.x as u32, point.y as u32, color);
            }
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        let area = area.intersection(&self.area());
        let Some(bottom_right) = area.bottom_right() else {
            return Ok(());
        };

        if area.top_left.x == 0 && area.size.width == WIDTH {
            // Whole rows
            let start = (area.top_left.y as u32 - self.top) as usize * ROW_BYTES;
            let end = start + area.size.height as usize * ROW_BYTES;
            self.buffer[start..end].fill(Self::fill_bytes(color));
            return Ok(());
        }

        for y in area.top_left.y..=bottom_right.y {
            for x in area.top_left.x..=bottom_right.x {
                self.set_pixel(x as u32, y as u32, color);
            }
        }
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        self.buffer.fill(Self::fill_bytes(color));
        Ok(())
    }
}

/// The panel as a paged [`RenderSink`]
pub struct EpdFrame<SPI, BUSY, DC, RST, DELAY> {
    epd: Epd4in2<SPI, BUSY, DC, RST>,
    band: Band,
    delay: DELAY,
}

impl<SPI, BUSY, DC, RST, DELAY> EpdFrame<SPI, BUSY, DC, RST, DELAY>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    DC: OutputPin,
    RST: OutputPin,
    DELAY: DelayNs,
{
    pub fn new(epd: Epd4in2<SPI, BUSY, DC, RST>, delay: DELAY) -> Self {
        Self {
            epd,
            band: Band::new(BAND_ROWS),
            delay,
        }
    }

    /// Put the panel into deep sleep
    pub fn sleep(&mut self) -> Result<(), SPI::Error> {
        self.epd.sleep(&mut self.delay)
    }
}

impl<SPI, BUSY, DC, RST, DELAY> RenderSink for EpdFrame<SPI, BUSY, DC, RST, DELAY>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    DC: OutputPin,
    RST: OutputPin,
    DELAY: DelayNs,
{
    type Target = Band;
    type Error = SPI::Error;

    fn frame<F>(&mut self, mut draw: F) -> Result<FrameOutcome, Self::Error>
    where
        F: FnMut(&mut Self::Target) -> Result<(), Abort>,
    {
        self.epd.wake_up(&mut self.delay)?;
        self.epd.begin_frame()?;

        let pages = self.band.pages();
        for page in 0..pages {
            self.band.select(page);
            if draw(&mut self.band).is_err() {
                info!("epd: frame aborted on page {}/{}", page + 1, pages);
                self.epd.sleep(&mut self.delay)?;
                return Ok(FrameOutcome::Aborted);
            }
            self.epd.write_rows(self.band.as_slice())?;
            debug!("epd: sent page {}/{}", page + 1, pages);
        }

        self.epd.refresh(&mut self.delay)?;
        self.epd.sleep(&mut self.delay)?;
        info!("epd: frame shown");
        Ok(FrameOutcome::Shown)
    }
}
