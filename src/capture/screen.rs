//! Display capture via xcap
//!
//! Monitors are composited onto one canvas spanning their union, so a region
//! may straddle several displays.

use image::RgbaImage;
use image::imageops::{self, FilterType};

use super::FrameSource;
use crate::domain::{Rect, Region};
use crate::error::{RecorderError, Result};

/// Captures the real screen
#[derive(Debug, Default)]
pub struct ScreenSource;

impl ScreenSource {
    pub fn new() -> Self {
        Self
    }
}

impl FrameSource for ScreenSource {
    fn grab(&mut self, region: Option<Region>) -> Result<RgbaImage> {
        let monitors = xcap::Monitor::all().map_err(|e| {
            RecorderError::CaptureUnavailable(format!("failed to enumerate displays: {}", e))
        })?;
        if monitors.is_empty() {
            return Err(RecorderError::CaptureUnavailable("no active display".into()));
        }

        let target = region.map(Region::to_rect);
        let mut frames = Vec::with_capacity(monitors.len());
        for monitor in monitors {
            let rect = Rect::new(
                monitor.x(),
                monitor.y(),
                monitor.x().saturating_add(monitor.width() as i32),
                monitor.y().saturating_add(monitor.height() as i32),
            );
            if let Some(target) = target {
                if rect.intersect(target).is_none() {
                    continue;
                }
            }

            let shot = monitor.capture_image().map_err(|e| {
                RecorderError::CaptureUnavailable(format!(
                    "failed to capture display '{}': {}",
                    monitor.name(),
                    e
                ))
            })?;
            let (width, height) = (shot.width(), shot.height());
            let image = RgbaImage::from_raw(width, height, shot.into_raw()).ok_or_else(|| {
                RecorderError::CaptureUnavailable(format!(
                    "display '{}' returned a truncated buffer",
                    monitor.name()
                ))
            })?;
            frames.push((image, rect));
        }

        compose(frames, target).ok_or_else(|| {
            RecorderError::CaptureUnavailable(
                "capture region does not intersect any display".into(),
            )
        })
    }
}

/// Composite per-monitor images and crop to `target`
///
/// Returns `None` if there is nothing to draw or the target misses every
/// monitor.
pub(crate) fn compose(frames: Vec<(RgbaImage, Rect)>, target: Option<Rect>) -> Option<RgbaImage> {
    let bounds = frames
        .iter()
        .map(|(_, rect)| *rect)
        .reduce(|acc, rect| acc.union(rect))?;
    let crop = match target {
        Some(target) => bounds.intersect(target)?,
        None => bounds,
    };
    let dims = crop.dimensions()?;

    let mut canvas = RgbaImage::new(dims.width(), dims.height());
    for (mut frame_image, rect) in frames {
        let width = rect.width() as u32;
        let height = rect.height() as u32;
        if frame_image.dimensions() != (width, height) {
            frame_image = imageops::resize(&frame_image, width, height, FilterType::Lanczos3);
        }
        let x = i64::from(rect.left) - i64::from(crop.left);
        let y = i64::from(rect.top) - i64::from(crop.top);
        imageops::overlay(&mut canvas, &frame_image, x, y);
    }
    Some(canvas)
}
