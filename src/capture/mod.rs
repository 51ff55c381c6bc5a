//! Frame capture
//!
//! A [`FrameSource`] grabs the screen at native resolution; [`capture`] stamps
//! the grab and rescales it to the configured output resolution.

pub mod screen;

use chrono::{DateTime, Local};
use image::RgbaImage;
use image::imageops::{self, FilterType};

use crate::domain::{Region, Resolution};
use crate::error::Result;

pub use screen::ScreenSource;

/// Something that can grab pixels from the display
pub trait FrameSource: Send {
    /// Grab the full virtual display, or exactly `region` of it
    ///
    /// Fails with `CaptureUnavailable` when the platform primitive errors.
    fn grab(&mut self, region: Option<Region>) -> Result<RgbaImage>;
}

/// A grabbed image at the output resolution, not yet buffered
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub image: RgbaImage,
    pub captured_at: DateTime<Local>,
}

/// Grab one frame and rescale it to exactly `resolution`
///
/// Aspect ratio is not preserved; the target dimensions always win.
pub fn capture<S: FrameSource + ?Sized>(
    source: &mut S,
    region: Option<Region>,
    resolution: Resolution,
) -> Result<CapturedImage> {
    let raw = source.grab(region)?;
    let captured_at = Local::now();

    let image = if raw.dimensions() == (resolution.width(), resolution.height()) {
        raw
    } else {
        imageops::resize(
            &raw,
            resolution.width(),
            resolution.height(),
            FilterType::Lanczos3,
        )
    };

    Ok(CapturedImage { image, captured_at })
}
