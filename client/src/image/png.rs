//! Streaming PNG decoder
//!
//! Walks the chunk list of an in-memory PNG, inflates IDAT data through a
//! small window and hands each unfiltered scanline to a callback. Memory use
//! is fixed at construction: the row buffers hold [`MAX_WIDTH`] RGBA pixels
//! and wider images are rejected. Interlaced and 16-bit images are not
//! supported.

use alloc::boxed::Box;
use alloc::vec;

use miniz_oxide::inflate::stream::{InflateState, inflate};
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};

use super::scale;
use crate::config::SCANLINE_CAPACITY;

/// Widest accepted source image
pub const MAX_WIDTH: usize = SCANLINE_CAPACITY;

const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
/// RGBA8 is the widest supported pixel
const MAX_ROW_BYTES: usize = MAX_WIDTH * 4;
const INFLATE_WINDOW: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PngError {
    /// Missing PNG signature
    Signature,
    /// IHDR missing or inconsistent
    Header,
    /// Valid PNG using a feature we do not decode
    Unsupported,
    /// Wider than the scanline buffers
    TooWide(u32),
    /// Indexed image without a usable palette
    Palette,
    /// Chunk runs past the end of the data
    Chunk,
    /// Zlib stream is corrupt
    Inflate,
    /// Unknown scanline filter
    Filter(u8),
    /// Image data ended before the last row
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorType {
    Grayscale,
    Rgb,
    Indexed,
    GrayscaleAlpha,
    Rgba,
}

impl ColorType {
    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(ColorType::Grayscale),
            2 => Some(ColorType::Rgb),
            3 => Some(ColorType::Indexed),
            4 => Some(ColorType::GrayscaleAlpha),
            6 => Some(ColorType::Rgba),
            _ => None,
        }
    }

    fn channels(self) -> usize {
        match self {
            ColorType::Grayscale | ColorType::Indexed => 1,
            ColorType::GrayscaleAlpha => 2,
            ColorType::Rgb => 3,
            ColorType::Rgba => 4,
        }
    }
}

/// Fields of IHDR the decoder needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PngHeader {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub color_type: ColorType,
}

impl PngHeader {
    fn bits_per_pixel(&self) -> usize {
        self.color_type.channels() * self.bit_depth as usize
    }

    /// Bytes in one unfiltered scanline
    pub fn row_bytes(&self) -> usize {
        (self.width as usize * self.bits_per_pixel()).div_ceil(8)
    }

    /// Byte distance to the corresponding byte of the previous pixel
    fn filter_stride(&self) -> usize {
        (self.bits_per_pixel() / 8).max(1)
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Parse the signature and IHDR without touching image data
pub fn read_header(data: &[u8]) -> Result<PngHeader, PngError> {
    if data.len() < SIGNATURE.len() || data[..8] != SIGNATURE {
        return Err(PngError::Signature);
    }
    let ihdr = data.get(8..33).ok_or(PngError::Header)?;
    if be_u32(&ihdr[0..4]) != 13 || &ihdr[4..8] != b"IHDR" {
        return Err(PngError::Header);
    }

    let width = be_u32(&ihdr[8..12]);
    let height = be_u32(&ihdr[12..16]);
    let bit_depth = ihdr[16];
    let color_type = ColorType::from_byte(ihdr[17]).ok_or(PngError::Header)?;
    let (compression, filter, interlace) = (ihdr[18], ihdr[19], ihdr[20]);

    if width == 0 || height == 0 || compression != 0 || filter != 0 {
        return Err(PngError::Header);
    }
    let depth_ok = match color_type {
        ColorType::Grayscale => matches!(bit_depth, 1 | 2 | 4 | 8 | 16),
        ColorType::Indexed => matches!(bit_depth, 1 | 2 | 4 | 8),
        _ => matches!(bit_depth, 8 | 16),
    };
    if !depth_ok {
        return Err(PngError::Header);
    }
    if bit_depth == 16 || interlace != 0 {
        return Err(PngError::Unsupported);
    }

    Ok(PngHeader {
        width,
        height,
        bit_depth,
        color_type,
    })
}

/// One unfiltered scanline with what is needed to read its pixels
pub struct Scanline<'a> {
    header: &'a PngHeader,
    row: &'a [u8],
    palette: &'a [u8],
    alpha: &'a [u8],
}

impl Scanline<'_> {
    fn packed(&self, x: usize) -> u8 {
        let depth = self.header.bit_depth as usize;
        if depth == 8 {
            return self.row[x];
        }
        let bit = x * depth;
        let shift = 8 - (bit % 8) - depth;
        let mask = ((1u16 << depth) - 1) as u8;
        (self.row[bit / 8] >> shift) & mask
    }

    /// Luma of pixel `x`, composited over white when it has alpha
    pub fn luma(&self, x: usize) -> u8 {
        let (value, alpha) = match self.header.color_type {
            ColorType::Grayscale => {
                let max = (1u16 << self.header.bit_depth) - 1;
                ((self.packed(x) as u16 * 255 / max) as u8, 255)
            }
            ColorType::GrayscaleAlpha => (self.row[x * 2], self.row[x * 2 + 1]),
            ColorType::Rgb => {
                let p = &self.row[x * 3..x * 3 + 3];
                (scale::luma(p[0], p[1], p[2]), 255)
            }
            ColorType::Rgba => {
                let p = &self.row[x * 4..x * 4 + 4];
                (scale::luma(p[0], p[1], p[2]), p[3])
            }
            ColorType::Indexed => {
                let index = self.packed(x) as usize;
                match self.palette.get(index * 3..index * 3 + 3) {
                    Some(rgb) => (
                        scale::luma(rgb[0], rgb[1], rgb[2]),
                        self.alpha.get(index).copied().unwrap_or(255),
                    ),
                    // Out-of-range index reads as white.
                    None => (255, 255),
                }
            }
        };
        if alpha == 255 {
            return value;
        }
        let (value, alpha) = (value as u32, alpha as u32);
        ((value * alpha + 255 * (255 - alpha)) / 255) as u8
    }
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

fn unfilter(filter: u8, raw: &[u8], prev: &[u8], stride: usize, out: &mut [u8]) -> Result<(), PngError> {
    match filter {
        0 => out.copy_from_slice(raw),
        1 => {
            for i in 0..raw.len() {
                let left = if i >= stride { out[i - stride] } else { 0 };
                out[i] = raw[i].wrapping_add(left);
            }
        }
        2 => {
            for i in 0..raw.len() {
                out[i] = raw[i].wrapping_add(prev[i]);
            }
        }
        3 => {
            for i in 0..raw.len() {
                let left = if i >= stride { out[i - stride] } else { 0 };
                let avg = ((left as u16 + prev[i] as u16) / 2) as u8;
                out[i] = raw[i].wrapping_add(avg);
            }
        }
        4 => {
            for i in 0..raw.len() {
                let (left, up_left) = if i >= stride {
                    (out[i - stride], prev[i - stride])
                } else {
                    (0, 0)
                };
                out[i] = raw[i].wrapping_add(paeth(left, prev[i], up_left));
            }
        }
        other => return Err(PngError::Filter(other)),
    }
    Ok(())
}

/// Row assembly state for one decode pass
struct Rows {
    len: usize,
    fill: usize,
    y: u32,
}

/// Reusable decoder with fixed-size buffers
pub struct PngDecoder {
    inflater: Box<InflateState>,
    window: Box<[u8]>,
    raw: Box<[u8]>,
    prev: Box<[u8]>,
    cur: Box<[u8]>,
    palette: Box<[u8]>,
    palette_len: usize,
    alpha: Box<[u8]>,
    alpha_len: usize,
}

impl Default for PngDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PngDecoder {
    pub fn new() -> Self {
        Self {
            inflater: InflateState::new_boxed(DataFormat::Zlib),
            window: vec![0u8; INFLATE_WINDOW].into_boxed_slice(),
            raw: vec![0u8; MAX_ROW_BYTES + 1].into_boxed_slice(),
            prev: vec![0u8; MAX_ROW_BYTES].into_boxed_slice(),
            cur: vec![0u8; MAX_ROW_BYTES].into_boxed_slice(),
            palette: vec![0u8; 256 * 3].into_boxed_slice(),
            palette_len: 0,
            alpha: vec![0u8; 256].into_boxed_slice(),
            alpha_len: 0,
        }
    }

    /// Decode `data`, calling `on_row(y, scanline)` for every row top to bottom
    pub fn decode<F>(&mut self, data: &[u8], mut on_row: F) -> Result<PngHeader, PngError>
    where
        F: FnMut(u32, &Scanline<'_>),
    {
        let header = read_header(data)?;
        if header.width as usize > MAX_WIDTH {
            return Err(PngError::TooWide(header.width));
        }

        self.inflater.reset(DataFormat::Zlib);
        self.palette_len = 0;
        self.alpha_len = 0;
        let row_len = header.row_bytes();
        self.prev[..row_len].fill(0);
        let mut rows = Rows {
            len: row_len + 1,
            fill: 0,
            y: 0,
        };

        let mut pos = 8;
        while rows.y < header.height {
            let chunk_head = data.get(pos..pos + 8).ok_or(PngError::Truncated)?;
            let len = be_u32(&chunk_head[0..4]) as usize;
            let kind = &chunk_head[4..8];
            let body = data
                .get(pos + 8..pos + 8 + len)
                .ok_or(PngError::Chunk)?;
            // Length, type, body and CRC.
            pos += 12 + len;

            match kind {
                b"PLTE" => {
                    if len % 3 != 0 || len > self.palette.len() {
                        return Err(PngError::Palette);
                    }
                    self.palette[..len].copy_from_slice(body);
                    self.palette_len = len;
                }
                b"tRNS" if header.color_type == ColorType::Indexed => {
                    let take = len.min(self.alpha.len());
                    self.alpha[..take].copy_from_slice(&body[..take]);
                    self.alpha_len = take;
                }
                b"IDAT" => {
                    if header.color_type == ColorType::Indexed && self.palette_len == 0 {
                        return Err(PngError::Palette);
                    }
                    self.inflate_chunk(body, &header, &mut rows, &mut on_row)?;
                }
                b"IEND" => break,
                _ => {}
            }
        }

        if rows.y < header.height {
            return Err(PngError::Truncated);
        }
        Ok(header)
    }

    fn inflate_chunk<F>(
        &mut self,
        input: &[u8],
        header: &PngHeader,
        rows: &mut Rows,
        on_row: &mut F,
    ) -> Result<(), PngError>
    where
        F: FnMut(u32, &Scanline<'_>),
    {
        let mut consumed = 0;
        loop {
            let result = inflate(
                &mut self.inflater,
                &input[consumed..],
                &mut self.window,
                MZFlush::None,
            );
            consumed += result.bytes_consumed;

            for i in 0..result.bytes_written {
                if rows.y >= header.height {
                    return Ok(());
                }
                self.raw[rows.fill] = self.window[i];
                rows.fill += 1;
                if rows.fill == rows.len {
                    self.finish_row(header, rows, on_row)?;
                }
            }

            match result.status {
                Ok(MZStatus::StreamEnd) => return Ok(()),
                Ok(_) | Err(MZError::Buf) => {}
                Err(_) => return Err(PngError::Inflate),
            }
            if result.bytes_consumed == 0 && result.bytes_written == 0 {
                return Ok(());
            }
        }
    }

    fn finish_row<F>(&mut self, header: &PngHeader, rows: &mut Rows, on_row: &mut F) -> Result<(), PngError>
    where
        F: FnMut(u32, &Scanline<'_>),
    {
        let width = rows.len - 1;
        unfilter(
            self.raw[0],
            &self.raw[1..rows.len],
            &self.prev[..width],
            header.filter_stride(),
            &mut self.cur[..width],
        )?;

        let line = Scanline {
            header,
            row: &self.cur[..width],
            palette: &self.palette[..self.palette_len],
            alpha: &self.alpha[..self.alpha_len],
        };
        on_row(rows.y, &line);

        core::mem::swap(&mut self.prev, &mut self.cur);
        rows.fill = 0;
        rows.y += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_png, encode_png_with};
    use alloc::vec::Vec;

    fn lumas(decoder: &mut PngDecoder, png: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        decoder
            .decode(png, |_, line| {
                let header = line.header;
                out.push((0..header.width as usize).map(|x| line.luma(x)).collect());
            })
            .unwrap();
        out
    }

    #[test]
    fn test_header_only_pass() {
        let png = encode_png(3, 2, 2, 8, &[0u8; 18]);
        let header = read_header(&png).unwrap();
        assert_eq!((header.width, header.height), (3, 2));
        assert_eq!(header.color_type, ColorType::Rgb);
        assert_eq!(header.row_bytes(), 9);
    }

    #[test]
    fn test_rejects_non_png() {
        assert_eq!(read_header(b"GIF89a.........."), Err(PngError::Signature));
        assert_eq!(read_header(&SIGNATURE), Err(PngError::Header));
    }

    #[test]
    fn test_rgb_rows() {
        let pixels = [255, 255, 255, 255, 0, 0, 0, 0, 0];
        let png = encode_png(3, 1, 2, 8, &pixels);
        let rows = lumas(&mut PngDecoder::new(), &png);
        assert_eq!(rows, [[255, 76, 0]]);
    }

    #[test]
    fn test_packed_grayscale() {
        // 1-bit: 1,0,1,1 packed into one byte.
        let png = encode_png(4, 1, 0, 1, &[0b1011_0000]);
        let rows = lumas(&mut PngDecoder::new(), &png);
        assert_eq!(rows, [[255, 0, 255, 255]]);
    }

    #[test]
    fn test_indexed_with_transparency() {
        let png = encode_png_with(
            2,
            1,
            3,
            8,
            &[0, 1],
            Some(&[0, 0, 0, 255, 255, 255]),
            Some(&[0]),
        );
        let rows = lumas(&mut PngDecoder::new(), &png);
        // Index 0 is fully transparent black, so it composites to white.
        assert_eq!(rows, [[255, 255]]);
    }

    #[test]
    fn test_rgba_alpha_composited() {
        let png = encode_png(1, 1, 6, 8, &[0, 0, 0, 128]);
        let rows = lumas(&mut PngDecoder::new(), &png);
        assert_eq!(rows, [[127]]);
    }

    #[test]
    fn test_filters_round_trip() {
        // Rows are filtered with Sub, Up, Average and Paeth by the encoder.
        let pixels: Vec<u8> = (0..64u32).map(|i| (i * 37 % 251) as u8).collect();
        let png = encode_png(8, 8, 0, 8, &pixels);
        let rows = lumas(&mut PngDecoder::new(), &png);
        let flat: Vec<u8> = rows.concat();
        assert_eq!(flat, pixels);
    }

    #[test]
    fn test_decoder_reusable() {
        let mut decoder = PngDecoder::new();
        let first = encode_png(2, 1, 0, 8, &[10, 20]);
        let second = encode_png(1, 2, 0, 8, &[30, 40]);
        assert_eq!(lumas(&mut decoder, &first), [[10, 20]]);
        assert_eq!(lumas(&mut decoder, &second), [[30], [40]]);
    }

    #[test]
    fn test_missing_rows_truncated() {
        let mut png = encode_png(2, 2, 0, 8, &[1, 2, 3, 4]);
        // Claim one more row than the data holds.
        png[8 + 8 + 7] = 3;
        let result = PngDecoder::new().decode(&png, |_, _| {});
        assert_eq!(result, Err(PngError::Truncated));
    }

    #[test]
    fn test_interlaced_unsupported() {
        let mut png = encode_png(1, 1, 0, 8, &[0]);
        png[8 + 8 + 12] = 1;
        assert_eq!(read_header(&png), Err(PngError::Unsupported));
    }
}
