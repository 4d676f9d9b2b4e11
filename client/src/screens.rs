//! Text screens
//!
//! Every non-image screen is a list of positioned text blocks drawn in black
//! on a white frame.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::convert::Infallible;

use embedded_graphics::mono_font::ascii::{FONT_6X10, FONT_9X18_BOLD, FONT_10X20};
use embedded_graphics::mono_font::{MonoFont, MonoTextStyle};
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::text::{Baseline, Text};

use crate::render::{FrameOutcome, RenderSink};

/// Relative text size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSize {
    Small,
    Medium,
    Large,
}

impl TextSize {
    fn font(self) -> &'static MonoFont<'static> {
        match self {
            TextSize::Small => &FONT_6X10,
            TextSize::Medium => &FONT_9X18_BOLD,
            TextSize::Large => &FONT_10X20,
        }
    }
}

/// One line of text with its top-left corner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub text: String,
    pub position: Point,
    pub size: TextSize,
}

impl TextBlock {
    pub fn new(text: impl Into<String>, x: i32, y: i32, size: TextSize) -> Self {
        Self {
            text: text.into(),
            position: Point::new(x, y),
            size,
        }
    }
}

pub type Screen = Vec<TextBlock>;

/// Draw `blocks` without clearing
pub fn draw<D>(target: &mut D, blocks: &[TextBlock])
where
    D: DrawTarget<Color = BinaryColor, Error = Infallible>,
{
    for block in blocks {
        let style = MonoTextStyle::new(block.size.font(), BinaryColor::On);
        let Ok(_) = Text::with_baseline(&block.text, block.position, style, Baseline::Top)
            .draw(target);
    }
}

/// Show `blocks` as a complete frame on a white background
pub fn show<S: RenderSink>(sink: &mut S, blocks: &[TextBlock]) -> Result<FrameOutcome, S::Error> {
    sink.frame(|target| {
        let Ok(()) = target.clear(BinaryColor::Off);
        draw(target, blocks);
        Ok(())
    })
}

/// Placeholder for any image that could not be rendered
pub fn decode_failed() -> Screen {
    vec_of([
        TextBlock::new("Image decode failed", 10, 100, TextSize::Medium),
        TextBlock::new("Showing placeholder", 10, 130, TextSize::Small),
    ])
}

pub fn startup(version: &str, battery_percent: u8, battery_mv: u32, mac: &str) -> Screen {
    vec_of([
        TextBlock::new("paperd.ink", 50, 80, TextSize::Large),
        TextBlock::new("TRMNL Edition", 50, 120, TextSize::Medium),
        TextBlock::new(format!("v{}", version), 50, 150, TextSize::Small),
        TextBlock::new(
            format!(
                "Battery: {}% ({}.{:02}V)",
                battery_percent,
                battery_mv / 1000,
                battery_mv % 1000 / 10
            ),
            10,
            200,
            TextSize::Small,
        ),
        TextBlock::new(format!("MAC: {}", mac), 10, 220, TextSize::Small),
    ])
}

pub fn wifi_setup(ap_name: &str) -> Screen {
    vec_of([
        TextBlock::new("WiFi Setup Required", 10, 100, TextSize::Medium),
        TextBlock::new(format!("Connect to {}", ap_name), 10, 130, TextSize::Small),
        TextBlock::new("to configure WiFi", 10, 150, TextSize::Small),
    ])
}

pub fn device_setup() -> Screen {
    vec_of([
        TextBlock::new("Device Setup", 10, 100, TextSize::Medium),
        TextBlock::new("Registering with TRMNL...", 10, 130, TextSize::Small),
    ])
}

pub fn ready() -> Screen {
    vec_of([
        TextBlock::new("Ready", 10, 100, TextSize::Large),
        TextBlock::new("paperd.ink TRMNL", 10, 140, TextSize::Medium),
    ])
}

/// Registration failed; `errors` is the consecutive error count
pub fn registration_failed(message: &str, errors: u32) -> Screen {
    vec_of([
        TextBlock::new("Registration failed", 10, 80, TextSize::Medium),
        TextBlock::new(message, 10, 120, TextSize::Small),
        TextBlock::new(format!("Attempt {}, retrying next wake", errors), 10, 140, TextSize::Small),
    ])
}

pub fn error(message: &str) -> Screen {
    vec_of([
        TextBlock::new("ERROR", 50, 80, TextSize::Large),
        TextBlock::new(message, 10, 120, TextSize::Medium),
        TextBlock::new("Press any button", 10, 160, TextSize::Small),
        TextBlock::new("to continue", 10, 180, TextSize::Small),
    ])
}

/// Shown when the error counter crosses the threshold
pub fn too_many_errors(errors: u32, last_error: &str) -> Screen {
    let mut screen = error(&format!("{} errors in a row", errors));
    if !last_error.is_empty() {
        screen.push(TextBlock::new(
            format!("Last: {}", last_error),
            10,
            200,
            TextSize::Small,
        ));
    }
    screen
}

/// Values listed on the status screen
#[derive(Debug, Clone, Default)]
pub struct StatusInfo<'a> {
    pub state: &'a str,
    pub ssid: Option<&'a str>,
    pub friendly_id: &'a str,
    pub battery_percent: u8,
    pub sd_available: bool,
    pub refresh_secs: u32,
    pub errors: u32,
}

pub fn status(info: &StatusInfo<'_>) -> Screen {
    let wifi = match info.ssid {
        Some(ssid) => format!("WiFi: {}", ssid),
        None => "WiFi: Disconnected".to_string(),
    };
    let sd = if info.sd_available {
        "SD Card: Available"
    } else {
        "SD Card: Not Available"
    };
    vec_of([
        TextBlock::new("Status", 10, 20, TextSize::Medium),
        TextBlock::new(format!("State: {}", info.state), 10, 50, TextSize::Small),
        TextBlock::new(wifi, 10, 70, TextSize::Small),
        TextBlock::new(format!("Device: {}", info.friendly_id), 10, 90, TextSize::Small),
        TextBlock::new(format!("Battery: {}%", info.battery_percent), 10, 110, TextSize::Small),
        TextBlock::new(sd, 10, 130, TextSize::Small),
        TextBlock::new(format!("Refresh: {}s", info.refresh_secs), 10, 150, TextSize::Small),
        TextBlock::new(format!("Errors: {}", info.errors), 10, 170, TextSize::Small),
    ])
}

pub fn low_battery(percent: u8) -> Screen {
    vec_of([
        TextBlock::new("Low Battery", 50, 100, TextSize::Large),
        TextBlock::new(format!("{}% remaining", percent), 50, 140, TextSize::Medium),
        TextBlock::new("Please charge the device", 10, 180, TextSize::Small),
    ])
}

pub fn sleeping() -> Screen {
    vec_of([
        TextBlock::new("Sleeping...", 50, 100, TextSize::Medium),
        TextBlock::new("Press any button", 10, 140, TextSize::Small),
        TextBlock::new("to wake up", 10, 160, TextSize::Small),
    ])
}

pub fn factory_reset() -> Screen {
    vec_of([
        TextBlock::new("FACTORY RESET", 10, 80, TextSize::Medium),
        TextBlock::new("Clearing all data...", 10, 120, TextSize::Small),
    ])
}

pub fn factory_reset_done() -> Screen {
    let mut screen = factory_reset();
    screen.push(TextBlock::new("Reset complete!", 10, 160, TextSize::Small));
    screen.push(TextBlock::new("Restarting...", 10, 180, TextSize::Small));
    screen
}

fn vec_of<const N: usize>(blocks: [TextBlock; N]) -> Screen {
    Vec::from(blocks)
}
