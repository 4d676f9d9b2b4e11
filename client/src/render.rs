//! Render sink collaborator
//!
//! The panel keeps a frame buffer smaller than the screen, so a frame is
//! transmitted page by page. The sink calls the draw closure once per page
//! against a target that clips to that page; the closure must issue the same
//! commands on every call. `BinaryColor::On` is black.

use core::convert::Infallible;
use core::fmt::Debug;

use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;

/// Returned by a draw closure to abandon the frame. The panel is not refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

/// How a frame ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// All pages sent and the panel refreshed
    Shown,
    /// The draw closure aborted; the previous image stays on the panel
    Aborted,
}

/// Paged monochrome display
pub trait RenderSink {
    type Target: DrawTarget<Color = BinaryColor, Error = Infallible> + OriginDimensions;
    type Error: Debug;

    /// Replay `draw` for every page, then refresh the panel
    fn frame<F>(&mut self, draw: F) -> Result<FrameOutcome, Self::Error>
    where
        F: FnMut(&mut Self::Target) -> Result<(), Abort>;
}
